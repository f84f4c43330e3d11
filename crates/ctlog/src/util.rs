//! Clock access, with a controllable global clock under test.

#[cfg(test)]
use parking_lot::ReentrantMutex;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Returns the current Unix timestamp at millisecond precision.
#[cfg(not(test))]
pub(crate) fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
static GLOBAL_TIME: AtomicU64 = AtomicU64::new(0);

#[cfg(test)]
static FREEZE_TIME: AtomicBool = AtomicBool::new(false);

/// Tests that control the clock hold this while doing so, to exclude other
/// time-sensitive tests.
#[cfg(test)]
pub(crate) static TIME_MUX: ReentrantMutex<()> = ReentrantMutex::new(());

#[cfg(test)]
pub(crate) fn set_freeze_time(b: bool) {
    FREEZE_TIME.store(b, Ordering::Relaxed);
}

#[cfg(test)]
pub(crate) fn set_global_time(time: u64) {
    GLOBAL_TIME.store(time, Ordering::Relaxed);
}

// Under test the clock is a global counter: each read ticks one
// millisecond, unless frozen.
#[cfg(test)]
pub(crate) fn now_millis() -> u64 {
    let _lock = TIME_MUX.lock();
    if FREEZE_TIME.load(Ordering::Relaxed) {
        GLOBAL_TIME.load(Ordering::Relaxed)
    } else {
        GLOBAL_TIME.fetch_add(1, Ordering::Relaxed)
    }
}
