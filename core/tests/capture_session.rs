//! End-to-end capture sessions against a simulated emulator.
//!
//! The emulator is modelled by two pieces: a control-socket server that writes
//! a file for every `screendump`, and a clock driver that confirms steps on a
//! background thread. Both append to a shared event log so ordering can be
//! checked across them.

use std::fs;
use std::io::{Read, Write};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::Value;

use framestep_core::{
    AutoStart, CancelToken, CaptureLoop, CaptureOptions, ClockDriver, ControlChannel, Operator,
    RecorderError, Session, SessionState, StepConfirmations, StepNotifier, TimeStepSignaler,
    WaitPolicy,
};

type EventLog = Arc<Mutex<Vec<String>>>;

fn push(log: &EventLog, event: impl Into<String>) {
    log.lock().unwrap().push(event.into());
}

/// Control-socket side of the fake emulator.
struct MockControl {
    socket: PathBuf,
    server: JoinHandle<ServerOutcome>,
}

#[derive(Debug)]
struct ServerOutcome {
    captures: u64,
    saw_eof: bool,
}

impl MockControl {
    /// Serve one connection. If `hang_up_at` is set, the connection is dropped
    /// when that capture command arrives instead of answering it.
    fn start(dir: &Path, log: EventLog, hang_up_at: Option<u64>) -> Self {
        let socket = dir.join("qmp");
        let listener = UnixListener::bind(&socket).unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream
                .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\r\n")
                .unwrap();

            let reader = stream.try_clone().unwrap();
            let mut commands = serde_json::Deserializer::from_reader(reader).into_iter::<Value>();
            let mut captures = 0u64;

            while let Some(Ok(cmd)) = commands.next() {
                match cmd["execute"].as_str() {
                    Some("qmp_capabilities") => {}
                    Some("screendump") => {
                        if hang_up_at == Some(captures) {
                            push(&log, format!("hangup:{}", captures));
                            return ServerOutcome {
                                captures,
                                saw_eof: false,
                            };
                        }
                        let filename = cmd["arguments"]["filename"].as_str().unwrap();
                        fs::write(filename, format!("frame {}", captures)).unwrap();
                        push(&log, format!("capture:{}", captures));
                        captures += 1;
                    }
                    other => panic!("unexpected command {:?}", other),
                }
                stream.write_all(b"{\"return\": {}}\r\n").unwrap();
            }

            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest);
            ServerOutcome {
                captures,
                saw_eof: true,
            }
        });

        Self { socket, server }
    }

    fn join(self) -> ServerOutcome {
        self.server.join().unwrap()
    }
}

/// Clock side of the fake emulator.
struct MockClock {
    log: EventLog,
    notifier: StepNotifier,
    toggles: Arc<Mutex<u32>>,
    /// Clock state on the emulator side, flipped by every toggle.
    emulator_frozen: Arc<Mutex<bool>>,
    /// Steps that arrived while the emulator clock was running.
    unfrozen_steps: Arc<Mutex<u32>>,
    steps: u64,
    /// Never confirm steps.
    silent: bool,
    /// Cancel this token when the given step is requested.
    cancel_on_step: Option<(u64, CancelToken)>,
}

impl MockClock {
    fn new(log: EventLog, notifier: StepNotifier) -> Self {
        Self {
            log,
            notifier,
            toggles: Arc::new(Mutex::new(0)),
            emulator_frozen: Arc::new(Mutex::new(false)),
            unfrozen_steps: Arc::new(Mutex::new(0)),
            steps: 0,
            silent: false,
            cancel_on_step: None,
        }
    }
}

impl ClockDriver for MockClock {
    fn toggle_freeze(&mut self) -> Result<(), RecorderError> {
        *self.toggles.lock().unwrap() += 1;
        let mut frozen = self.emulator_frozen.lock().unwrap();
        *frozen = !*frozen;
        push(&self.log, "toggle");
        Ok(())
    }

    fn step(&mut self) -> Result<(), RecorderError> {
        let index = self.steps;
        self.steps += 1;
        if !*self.emulator_frozen.lock().unwrap() {
            *self.unfrozen_steps.lock().unwrap() += 1;
        }
        push(&self.log, "step");

        if let Some((at, token)) = &self.cancel_on_step {
            if *at == index {
                token.cancel();
            }
        }

        if !self.silent {
            let notifier = self.notifier.clone();
            let log = Arc::clone(&self.log);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(2));
                push(&log, "confirm");
                notifier.notify().unwrap();
            });
        }
        Ok(())
    }
}

/// Cancels after a given number of captured frames.
struct CancelAfter {
    frames: u64,
    token: CancelToken,
}

impl Operator for CancelAfter {
    fn confirm_start(&mut self) -> Result<(), RecorderError> {
        Ok(())
    }

    fn frame_captured(&mut self, frames: u64) {
        if frames == self.frames {
            self.token.cancel();
        }
    }
}

struct Harness {
    dir: tempfile::TempDir,
    log: EventLog,
}

impl Harness {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn capture_dir(&self) -> PathBuf {
        self.dir.path().join("captures")
    }

    fn session(&self) -> Session {
        let session = Session::begin(
            &self.dir.path().join("qmp"),
            self.capture_dir(),
            self.dir.path().join("emu.pid"),
        )
        .unwrap();
        session.prepare().unwrap();
        session
    }

    fn policy() -> WaitPolicy {
        WaitPolicy {
            timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(1),
        }
    }

    fn build(
        &self,
        control: &MockControl,
        configure: impl FnOnce(&mut MockClock, &mut CaptureOptions),
    ) -> (CaptureLoop<MockClock>, Arc<Mutex<u32>>) {
        self.build_resumed(control, false, configure)
    }

    /// Like `build`, for a session that knows whether the clock starts frozen.
    fn build_resumed(
        &self,
        control: &MockControl,
        clock_frozen: bool,
        configure: impl FnOnce(&mut MockClock, &mut CaptureOptions),
    ) -> (CaptureLoop<MockClock>, Arc<Mutex<u32>>) {
        let (notifier, confirmations) = StepConfirmations::channel();
        let mut clock = MockClock::new(Arc::clone(&self.log), notifier);
        let mut options = CaptureOptions::new(self.capture_dir());
        configure(&mut clock, &mut options);

        let toggles = Arc::clone(&clock.toggles);
        let signaler =
            TimeStepSignaler::new(clock, confirmations, Self::policy()).assume_frozen(clock_frozen);
        let channel = ControlChannel::connect(&control.socket, Duration::from_secs(5)).unwrap();
        (CaptureLoop::new(signaler, channel, options), toggles)
    }

    fn captured_files(&self) -> Vec<u64> {
        let mut names: Vec<u64> = fs::read_dir(self.capture_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_str().unwrap().parse().unwrap())
            .collect();
        names.sort_unstable();
        names
    }

    fn events(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[test]
fn test_cancel_between_iterations_yields_exact_frames() {
    let h = Harness::new();
    let control = MockControl::start(h.dir.path(), Arc::clone(&h.log), None);
    let (capture, toggles) = h.build(&control, |_, _| {});

    let token = CancelToken::new();
    let mut operator = CancelAfter {
        frames: 5,
        token: token.clone(),
    };
    let mut session = h.session();
    let report = capture.run(&mut session, &mut operator, &token).unwrap();

    assert_eq!(report.frames, 5);
    assert_eq!(report.last_index(), Some(4));
    assert_eq!(h.captured_files(), vec![0, 1, 2, 3, 4]);
    assert_eq!(session.state(), SessionState::Stopped);

    // Freeze at start; finalization re-freezes (a no-op) and then releases.
    assert_eq!(*toggles.lock().unwrap(), 2);
    assert!(!session.clock_frozen());

    let outcome = control.join();
    assert_eq!(outcome.captures, 5);
    assert!(outcome.saw_eof, "control channel should be closed");
}

#[test]
fn test_every_capture_follows_a_confirmed_step() {
    let h = Harness::new();
    let control = MockControl::start(h.dir.path(), Arc::clone(&h.log), None);
    let (capture, _) = h.build(&control, |_, options| options.frame_limit = Some(4));

    let mut session = h.session();
    let report = capture
        .run(&mut session, &mut AutoStart, &CancelToken::new())
        .unwrap();
    assert_eq!(report.frames, 4);
    control.join();

    let mut expected = vec!["toggle".to_string()];
    for i in 0..4 {
        expected.push("step".into());
        expected.push("confirm".into());
        expected.push(format!("capture:{}", i));
    }
    expected.push("toggle".into());
    assert_eq!(h.events(), expected);
}

#[test]
fn test_cancel_mid_iteration_finishes_that_capture() {
    let h = Harness::new();
    let control = MockControl::start(h.dir.path(), Arc::clone(&h.log), None);
    let token = CancelToken::new();
    let (capture, _) = h.build(&control, |clock, _| {
        clock.cancel_on_step = Some((2, token.clone()));
    });

    let mut session = h.session();
    let report = capture.run(&mut session, &mut AutoStart, &token).unwrap();

    // Step 2 was already requested when cancellation arrived: frame 2 is kept.
    assert_eq!(report.frames, 3);
    assert_eq!(h.captured_files(), vec![0, 1, 2]);
    assert_eq!(control.join().captures, 3);
}

#[test]
fn test_cancel_before_start_captures_nothing() {
    let h = Harness::new();
    let control = MockControl::start(h.dir.path(), Arc::clone(&h.log), None);
    let (capture, toggles) = h.build(&control, |_, _| {});

    let token = CancelToken::new();
    token.cancel();
    let mut session = h.session();
    let report = capture.run(&mut session, &mut AutoStart, &token).unwrap();

    assert_eq!(report.frames, 0);
    assert!(h.captured_files().is_empty());
    assert_eq!(*toggles.lock().unwrap(), 2);
    assert!(control.join().saw_eof);
}

#[test]
fn test_transport_failure_keeps_earlier_frames() {
    let h = Harness::new();
    let control = MockControl::start(h.dir.path(), Arc::clone(&h.log), Some(3));
    let (capture, _) = h.build(&control, |_, _| {});

    let mut session = h.session();
    let err = capture
        .run(&mut session, &mut AutoStart, &CancelToken::new())
        .unwrap_err();

    assert!(matches!(err, RecorderError::Transport(_)), "got {err:?}");
    assert_eq!(err.exit_code(), 3);
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(h.captured_files(), vec![0, 1, 2]);
    for i in 0..3u64 {
        let contents = fs::read_to_string(h.capture_dir().join(i.to_string())).unwrap();
        assert_eq!(contents, format!("frame {}", i));
    }
    control.join();
}

#[test]
fn test_missing_confirmation_times_out() {
    let h = Harness::new();
    let control = MockControl::start(h.dir.path(), Arc::clone(&h.log), None);
    let (capture, toggles) = h.build(&control, |clock, _| clock.silent = true);

    let mut session = h.session();
    let err = capture
        .run(&mut session, &mut AutoStart, &CancelToken::new())
        .unwrap_err();

    assert!(matches!(err, RecorderError::ProtocolViolation(_)));
    assert!(h.captured_files().is_empty());
    assert_eq!(*toggles.lock().unwrap(), 2);
    assert!(control.join().saw_eof);
}

#[test]
fn test_keep_clock_frozen_on_finish() {
    let h = Harness::new();
    let control = MockControl::start(h.dir.path(), Arc::clone(&h.log), None);
    let (capture, toggles) = h.build(&control, |_, options| {
        options.frame_limit = Some(2);
        options.release_clock_on_finish = false;
    });

    let mut session = h.session();
    capture
        .run(&mut session, &mut AutoStart, &CancelToken::new())
        .unwrap();

    assert_eq!(*toggles.lock().unwrap(), 1);
    assert_eq!(h.events().last().map(String::as_str), Some("capture:1"));
    assert!(session.clock_frozen());
    control.join();
}

#[test]
fn test_attach_to_clock_left_frozen_by_earlier_session() {
    let h = Harness::new();
    let emulator_frozen = Arc::new(Mutex::new(false));
    let unfrozen_steps = Arc::new(Mutex::new(0));
    let share = |clock: &mut MockClock| {
        clock.emulator_frozen = Arc::clone(&emulator_frozen);
        clock.unfrozen_steps = Arc::clone(&unfrozen_steps);
    };

    // First session leaves the emulator frozen.
    let control = MockControl::start(h.dir.path(), Arc::clone(&h.log), None);
    let (capture, _) = h.build(&control, |clock, options| {
        share(clock);
        options.frame_limit = Some(2);
        options.release_clock_on_finish = false;
    });
    let mut session = h.session();
    capture
        .run(&mut session, &mut AutoStart, &CancelToken::new())
        .unwrap();
    control.join();
    drop(session);
    assert!(*emulator_frozen.lock().unwrap());

    // Second session attaches to the same, still frozen emulator.
    fs::remove_file(h.dir.path().join("qmp")).unwrap();
    let control = MockControl::start(h.dir.path(), Arc::clone(&h.log), None);
    let mut session = h.session();
    assert!(session.clock_frozen());
    let (capture, toggles) = h.build_resumed(&control, session.clock_frozen(), |clock, options| {
        share(clock);
        options.frame_limit = Some(3);
    });
    let report = capture
        .run(&mut session, &mut AutoStart, &CancelToken::new())
        .unwrap();
    control.join();

    assert_eq!(report.frames, 3);
    assert_eq!(*unfrozen_steps.lock().unwrap(), 0);
    // Only the release at the end touched the clock.
    assert_eq!(*toggles.lock().unwrap(), 1);
    assert!(!*emulator_frozen.lock().unwrap());
    assert!(!session.clock_frozen());
}

#[test]
fn test_new_session_clears_previous_captures() {
    let h = Harness::new();
    fs::create_dir_all(h.capture_dir()).unwrap();
    for i in 0..10 {
        fs::write(h.capture_dir().join(i.to_string()), "old").unwrap();
    }

    let control = MockControl::start(h.dir.path(), Arc::clone(&h.log), None);
    let (capture, _) = h.build(&control, |_, options| options.frame_limit = Some(2));
    let mut session = h.session();
    capture
        .run(&mut session, &mut AutoStart, &CancelToken::new())
        .unwrap();

    assert_eq!(h.captured_files(), vec![0, 1]);
    control.join();
}

#[test]
fn test_operator_refusal_aborts_before_freezing() {
    struct Refuse;
    impl Operator for Refuse {
        fn confirm_start(&mut self) -> Result<(), RecorderError> {
            Err(RecorderError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stdin closed",
            )))
        }
    }

    let h = Harness::new();
    let control = MockControl::start(h.dir.path(), Arc::clone(&h.log), None);
    let (capture, toggles) = h.build(&control, |_, _| {});

    let mut session = h.session();
    let err = capture
        .run(&mut session, &mut Refuse, &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, RecorderError::Io(_)));
    assert_eq!(session.state(), SessionState::Stopped);
    // The clock was never frozen, so finalization leaves it alone.
    assert_eq!(*toggles.lock().unwrap(), 0);
    assert!(!session.clock_frozen());
    control.join();
}
