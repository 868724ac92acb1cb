//! `gettimeofday` interposition and signal plumbing.

use std::ffi::c_void;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use framestep_shared::{SIG_FREEZE_TIME, SIG_STEP_APPLIED, SIG_STEP_TIME};

use crate::shim::{ShimState, TimeVal};

type GetTimeOfDay = unsafe extern "C" fn(*mut libc::timeval, *mut c_void) -> libc::c_int;

/// Handlers are re-armed every this many clock reads, in case the host
/// installed its own over ours.
const MAINT_PERIOD: usize = 1024;

static STEP_REQUESTS: AtomicU32 = AtomicU32::new(0);
static FREEZE_TOGGLES: AtomicU32 = AtomicU32::new(0);
static READS: AtomicUsize = AtomicUsize::new(0);

static REAL_GETTIMEOFDAY: OnceLock<Option<GetTimeOfDay>> = OnceLock::new();
static STATE: OnceLock<Mutex<ShimState>> = OnceLock::new();

extern "C" fn on_signal(signo: libc::c_int) {
    if signo == SIG_STEP_TIME {
        STEP_REQUESTS.fetch_add(1, Ordering::SeqCst);
    } else if signo == SIG_FREEZE_TIME {
        FREEZE_TOGGLES.fetch_add(1, Ordering::SeqCst);
    }
}

fn real_gettimeofday() -> Option<GetTimeOfDay> {
    *REAL_GETTIMEOFDAY.get_or_init(|| {
        // SAFETY: RTLD_NEXT lookup of a libc symbol with a NUL-terminated name.
        let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, c"gettimeofday".as_ptr()) };
        if sym.is_null() {
            None
        } else {
            // SAFETY: the symbol is libc's gettimeofday, which has this signature.
            Some(unsafe { std::mem::transmute::<*mut c_void, GetTimeOfDay>(sym) })
        }
    })
}

fn maintain() {
    if READS.fetch_add(1, Ordering::Relaxed) % MAINT_PERIOD != 0 {
        return;
    }
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only touches atomics.
    unsafe {
        if libc::signal(SIG_STEP_TIME, handler) == libc::SIG_ERR {
            eprintln!("[timestep] failed to attach step handler, time won't be steppable");
        }
        if libc::signal(SIG_FREEZE_TIME, handler) == libc::SIG_ERR {
            eprintln!("[timestep] failed to attach freeze handler, time won't be freezable");
        }
        // The recorder's Ctrl-C must not take the emulator down with it.
        libc::signal(libc::SIGINT, libc::SIG_IGN);
    }
}

/// # Safety
///
/// Same contract as libc's `gettimeofday`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn gettimeofday(tv: *mut libc::timeval, tz: *mut c_void) -> libc::c_int {
    let Some(real) = real_gettimeofday() else {
        return -1;
    };
    // SAFETY: forwarding the caller's arguments unchanged.
    let ret = unsafe { real(tv, tz) };
    if ret != 0 || tv.is_null() {
        return ret;
    }
    maintain();

    // SAFETY: non-null and just filled in by libc.
    let tv = unsafe { &mut *tv };
    let now = TimeVal {
        sec: tv.tv_sec as i64,
        usec: tv.tv_usec as i64,
    };

    let state = STATE.get_or_init(|| Mutex::new(ShimState::from_env(now)));
    let mut state = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    state.apply_signals(
        FREEZE_TOGGLES.swap(0, Ordering::SeqCst),
        STEP_REQUESTS.swap(0, Ordering::SeqCst),
    );

    let filtered = state.filter(now);
    if let Some(pid) = filtered.notify {
        // SAFETY: kill has no memory-safety preconditions.
        unsafe {
            libc::kill(pid, SIG_STEP_APPLIED);
        }
    }

    tv.tv_sec = filtered.time.sec as libc::time_t;
    tv.tv_usec = filtered.time.usec as libc::suseconds_t;
    ret
}
