//! Pure model of the stepped clock.

use framestep_shared::{DEFAULT_FRAME_INTERVAL_NS, DEFAULT_IDLE_NS, MAX_INTERCALL_DELTA_NS};

/// Result of one filtered clock read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading {
    /// Simulated nanoseconds since the first read.
    pub nanos: i64,
    /// This read finished draining a requested step.
    pub step_applied: bool,
}

/// Maps real elapsed time to simulated elapsed time.
///
/// A pending step is only drained up to `max_intercall_delta` per read, so a
/// step can only make progress while the per-read delta stays below that cap
/// (always the case while frozen).
#[derive(Debug, Clone)]
pub struct ClockFilter {
    last_real: i64,
    last_simulated: i64,
    frozen: bool,
    pending_step: i64,
    frame_interval: i64,
    idle: i64,
    max_intercall_delta: i64,
}

impl Default for ClockFilter {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_INTERVAL_NS, DEFAULT_IDLE_NS)
    }
}

impl ClockFilter {
    pub fn new(frame_interval_ns: u64, idle_ns: u64) -> Self {
        Self {
            last_real: 0,
            last_simulated: 0,
            frozen: false,
            pending_step: 0,
            frame_interval: saturating_i64(frame_interval_ns),
            idle: saturating_i64(idle_ns),
            max_intercall_delta: saturating_i64(MAX_INTERCALL_DELTA_NS),
        }
    }

    pub fn set_quanta(&mut self, frame_interval_ns: u64, idle_ns: u64) {
        self.frame_interval = saturating_i64(frame_interval_ns);
        self.idle = saturating_i64(idle_ns);
    }

    pub fn set_frozen(&mut self, frozen: bool) {
        self.frozen = frozen;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Queue one frame interval worth of simulated time.
    pub fn request_step(&mut self) {
        self.pending_step = self.pending_step.saturating_add(self.frame_interval);
    }

    /// Simulated nanoseconds still owed to pending steps.
    pub fn pending_step(&self) -> i64 {
        self.pending_step
    }

    /// Filter one clock read taken at `real_nanos` (since the shim's timebase).
    pub fn read(&mut self, real_nanos: i64) -> Reading {
        let real_delta = real_nanos - self.last_real;
        self.last_real = real_nanos;

        let mut delta = if self.frozen { self.idle } else { real_delta };
        let mut step_applied = false;

        if self.pending_step > 0 {
            let room = (self.max_intercall_delta - delta).max(0);
            if self.pending_step <= room {
                delta += self.pending_step;
                self.pending_step = 0;
                step_applied = true;
            } else {
                delta += room;
                self.pending_step -= room;
            }
        }

        self.last_simulated += delta;
        Reading {
            nanos: self.last_simulated,
            step_applied,
        }
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_clock_passes_real_time_through() {
        let mut clock = ClockFilter::new(1_000_000, 100);
        assert_eq!(clock.read(5_000).nanos, 5_000);
        assert_eq!(clock.read(12_000).nanos, 12_000);
    }

    #[test]
    fn test_frozen_clock_advances_by_idle_quantum() {
        let mut clock = ClockFilter::new(1_000_000, 100);
        clock.read(1_000);
        clock.set_frozen(true);

        assert_eq!(clock.read(50_000).nanos, 1_100);
        assert_eq!(clock.read(9_000_000).nanos, 1_200);
    }

    #[test]
    fn test_step_drains_in_bounded_slices() {
        let mut clock = ClockFilter::new(100_000, 100);
        clock.set_frozen(true);
        clock.request_step();

        let mut previous = 0;
        let mut reads = 0;
        let mut applied = 0;
        while clock.pending_step() > 0 {
            let reading = clock.read(reads * 10_000);
            assert!(reading.nanos - previous <= MAX_INTERCALL_DELTA_NS as i64);
            previous = reading.nanos;
            reads += 1;
            if reading.step_applied {
                applied += 1;
            }
        }

        assert_eq!(applied, 1);
        assert_eq!(reads, 6);
        assert_eq!(previous, 100_000 + 100 * reads);
        assert!(!clock.read(reads * 10_000).step_applied);
    }

    #[test]
    fn test_small_step_applies_on_next_read() {
        let mut clock = ClockFilter::new(5_000, 100);
        clock.set_frozen(true);
        clock.request_step();

        let reading = clock.read(0);
        assert!(reading.step_applied);
        assert_eq!(reading.nanos, 5_100);
    }

    #[test]
    fn test_queued_steps_accumulate() {
        let mut clock = ClockFilter::new(10_000, 0);
        clock.set_frozen(true);
        clock.request_step();
        clock.request_step();
        assert_eq!(clock.pending_step(), 20_000);

        let reading = clock.read(0);
        assert!(reading.step_applied);
        assert_eq!(reading.nanos, 20_000);
    }

    #[test]
    fn test_quanta_can_change_while_running() {
        let mut clock = ClockFilter::default();
        clock.set_quanta(1_000, 10);
        clock.set_frozen(true);
        clock.request_step();
        assert_eq!(clock.read(0).nanos, 1_010);
    }
}
