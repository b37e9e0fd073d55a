use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// Spins before yielding while waiting for a callback to finish.
const SPINS_BEFORE_YIELD: u32 = 64;

/// Marks a realtime callback as in flight.
///
/// Entry is a single compare-and-swap, so a second, overlapping callback is
/// refused instead of blocked.
///
/// Stopping stores a flag then reads `active`; a callback sets `active` then
/// reads the flag. Both pairs are `SeqCst` so at least one side sees the
/// other's write.
#[derive(Debug, Default)]
pub struct CallbackGuard {
    active: AtomicBool,
}

/// Held for the body of one callback. Releases the guard on drop.
#[must_use]
pub struct ActiveCallback<'a> {
    guard: &'a CallbackGuard,
}

impl CallbackGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` if another callback is already inside.
    pub fn try_enter(&self) -> Option<ActiveCallback<'_>> {
        self.active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .ok()
            .map(|_| ActiveCallback { guard: self })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Block until no callback is inside. Never call from the realtime thread.
    pub fn wait_idle(&self) {
        let mut spins = 0u32;
        while self.is_active() {
            if spins < SPINS_BEFORE_YIELD {
                std::hint::spin_loop();
                spins += 1;
            } else {
                thread::yield_now();
            }
        }
    }
}

impl Drop for ActiveCallback<'_> {
    fn drop(&mut self) {
        self.guard.active.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn second_entry_is_refused() {
        let guard = CallbackGuard::new();
        let first = guard.try_enter();
        assert!(first.is_some());
        assert!(guard.try_enter().is_none());
        drop(first);
        assert!(guard.try_enter().is_some());
        assert!(!guard.is_active());
    }

    #[test]
    fn wait_idle_blocks_until_callback_exits() {
        let guard = Arc::new(CallbackGuard::new());
        let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
        let worker_guard = Arc::clone(&guard);

        let worker = std::thread::spawn(move || {
            let _active = worker_guard.try_enter().unwrap();
            entered_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(50));
        });

        entered_rx.recv().unwrap();
        let started = Instant::now();
        guard.wait_idle();
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(!guard.is_active());
        worker.join().unwrap();
    }

    #[test]
    fn no_callback_runs_past_a_cleared_flag() {
        use std::sync::atomic::AtomicBool;

        let guard = Arc::new(CallbackGuard::new());
        let accepting = Arc::new(AtomicBool::new(false));
        let inside = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));

        let worker = {
            let (guard, accepting, inside, done) = (
                Arc::clone(&guard),
                Arc::clone(&accepting),
                Arc::clone(&inside),
                Arc::clone(&done),
            );
            std::thread::spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    if let Some(_active) = guard.try_enter() {
                        if accepting.load(Ordering::SeqCst) {
                            inside.store(true, Ordering::SeqCst);
                            std::hint::spin_loop();
                            inside.store(false, Ordering::SeqCst);
                        }
                    }
                    // Periodic, like a hardware callback.
                    std::thread::yield_now();
                }
            })
        };

        for _ in 0..5_000 {
            accepting.store(true, Ordering::SeqCst);
            std::thread::yield_now();
            accepting.store(false, Ordering::SeqCst);
            guard.wait_idle();
            assert!(!inside.load(Ordering::SeqCst));
        }
        done.store(true, Ordering::SeqCst);
        worker.join().unwrap();
    }
}
