//! Per-thread role tags.
//!
//! Every pool worker records which pool it belongs to, so blocking call
//! sites can tell whether they are about to park a Scheduler thread.

use std::{
    cell::RefCell,
    sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Arc,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadRole {
    Scheduler,
    Io,
    Other,
}

struct Tag {
    role: ThreadRole,
    // Owned by the Scheduler the thread belongs to.
    violations: Option<Arc<AtomicUsize>>,
}

thread_local! {
    static CURRENT: RefCell<Tag> = const {
        RefCell::new(Tag {
            role: ThreadRole::Other,
            violations: None,
        })
    };
}

pub(crate) fn enter_scheduler(violations: Arc<AtomicUsize>) {
    CURRENT.with(|tag| {
        *tag.borrow_mut() = Tag {
            role: ThreadRole::Scheduler,
            violations: Some(violations),
        }
    });
}

pub(crate) fn enter_io() {
    CURRENT.with(|tag| {
        *tag.borrow_mut() = Tag {
            role: ThreadRole::Io,
            violations: None,
        }
    });
}

pub fn current_role() -> ThreadRole {
    CURRENT.with(|tag| tag.borrow().role)
}

/// Marks a call site that is about to block the current thread.
///
/// Returns `true` if the current thread is a Scheduler worker, in which case
/// the owning Scheduler's violation counter is incremented.
pub fn mark_blocking(site: &'static str) -> bool {
    CURRENT.with(|tag| {
        let tag = tag.borrow();
        if tag.role != ThreadRole::Scheduler {
            return false;
        }
        if let Some(violations) = &tag.violations {
            violations.fetch_add(1, Relaxed);
        }
        tracing::error!(site, thread = os_thread_id(), "blocking call on a scheduler thread");
        true
    })
}

/// Kernel thread id, the number `top -H` and `ps -L` show.
#[cfg(target_os = "linux")]
pub fn os_thread_id() -> u64 {
    unsafe { libc::gettid() as u64 }
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn os_thread_id() -> u64 {
    unsafe { libc::pthread_self() as u64 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles() {
        assert_eq!(current_role(), ThreadRole::Other);
        assert!(!mark_blocking("test"));

        let violations = Arc::new(AtomicUsize::new(0));
        let counter = violations.clone();
        std::thread::spawn(move || {
            enter_scheduler(counter);
            assert_eq!(current_role(), ThreadRole::Scheduler);
            assert!(mark_blocking("test"));
        })
        .join()
        .unwrap();
        assert_eq!(violations.load(Relaxed), 1);

        std::thread::spawn(|| {
            enter_io();
            assert_eq!(current_role(), ThreadRole::Io);
            assert!(!mark_blocking("test"));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_os_thread_id() {
        let here = os_thread_id();
        let there = std::thread::spawn(os_thread_id).join().unwrap();
        assert_ne!(here, there);
    }
}
