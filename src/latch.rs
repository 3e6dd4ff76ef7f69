use std::sync::atomic::{AtomicU32, Ordering::*};

const CLOSED: u32 = 0;
const OPEN: u32 = 1;

/// A one-shot gate. Threads calling `wait` sleep on a futex until some
/// other thread calls `open`; once open it stays open.
pub struct Latch {
    state: AtomicU32,
}

impl Latch {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(CLOSED),
        }
    }

    pub fn open(&self) {
        if self.state.swap(OPEN, Release) == CLOSED {
            atomic_wait::wake_all(&self.state);
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.load(Acquire) == OPEN
    }

    pub fn wait(&self) {
        // futex wait may return spuriously, so re-check the state.
        while self.state.load(Acquire) == CLOSED {
            atomic_wait::wait(&self.state, CLOSED);
        }
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

#[test]
fn test_latch() {
    let latch = Latch::new();
    let mut woken = 0;

    std::thread::scope(|s| {
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(|| {
                    latch.wait();
                    latch.is_open()
                })
            })
            .collect();

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!latch.is_open());
        latch.open();

        for w in waiters {
            if w.join().unwrap() {
                woken += 1;
            }
        }
    });

    assert_eq!(woken, 4);
}

#[test]
fn test_latch_open_twice() {
    let latch = Latch::new();
    latch.open();
    latch.open();
    latch.wait();
    assert!(latch.is_open());
}
