//! Recursive, level-ordered process locks.
//!
//! A thread may only enter a level when it holds no higher one. Violations are
//! logged with a backtrace and counted but not refused.

use log::{error, trace};
use std::{
    backtrace::Backtrace,
    cell::RefCell,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Condvar, Mutex, MutexGuard,
    },
    thread::{self, ThreadId},
};

pub const MAX_SYSLEVEL: usize = 4;
/// The lock serializing all 16-bit execution.
pub const WIN16_LEVEL: usize = 1;

thread_local! {
    static HELD: RefCell<[u32; MAX_SYSLEVEL]> = RefCell::new([0; MAX_SYSLEVEL]);
}

#[derive(Debug, Default)]
struct Owner {
    thread: Option<ThreadId>,
    count: u32,
}

#[derive(Debug)]
pub struct SysLevel {
    level: usize,
    owner: Mutex<Owner>,
    released: Condvar,
    violations: AtomicUsize,
}

/// Leaves the level when dropped.
pub struct SysLevelGuard<'a> {
    lock: &'a SysLevel,
}

impl Drop for SysLevelGuard<'_> {
    fn drop(&mut self) {
        self.lock.leave();
    }
}

impl SysLevel {
    pub fn new(level: usize) -> Self {
        assert!(level < MAX_SYSLEVEL);
        Self {
            level,
            owner: Mutex::new(Owner::default()),
            released: Condvar::new(),
            violations: AtomicUsize::new(0),
        }
    }

    fn owner(&self) -> MutexGuard<'_, Owner> {
        // a panicking holder must not wedge every other thread
        self.owner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn enter(&self) {
        let higher = HELD.with(|held| {
            let held = held.borrow();
            (self.level + 1..MAX_SYSLEVEL).find(|l| held[*l] > 0)
        });
        if let Some(l) = higher {
            self.violations.fetch_add(1, Ordering::Relaxed);
            error!(
                "entering syslevel {} while holding level {}\n{}",
                self.level,
                l,
                Backtrace::force_capture()
            );
        }

        let me = thread::current().id();
        let mut owner = self.owner();
        while matches!(owner.thread, Some(t) if t != me) {
            owner = self
                .released
                .wait(owner)
                .unwrap_or_else(|e| e.into_inner());
        }
        owner.thread = Some(me);
        owner.count += 1;
        drop(owner);

        HELD.with(|held| held.borrow_mut()[self.level] += 1);
        trace!("entered syslevel {}", self.level);
    }

    pub fn leave(&self) {
        let me = thread::current().id();
        let mut owner = self.owner();
        if owner.thread != Some(me) || owner.count == 0 {
            error!("leaving syslevel {} not held by this thread", self.level);
            return;
        }
        owner.count -= 1;
        if owner.count == 0 {
            owner.thread = None;
            self.released.notify_one();
        }
        drop(owner);
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            held[self.level] = held[self.level].saturating_sub(1);
        });
        trace!("left syslevel {}", self.level);
    }

    pub fn lock(&self) -> SysLevelGuard<'_> {
        self.enter();
        SysLevelGuard { lock: self }
    }

    /// Recursion depth of the calling thread.
    pub fn held(&self) -> u32 {
        let owner = self.owner();
        match owner.thread {
            Some(t) if t == thread::current().id() => owner.count,
            _ => 0,
        }
    }

    /// Drop every recursion level the calling thread holds; returns the depth.
    pub fn release_all(&self) -> u32 {
        let depth = self.held();
        for _ in 0..depth {
            self.leave();
        }
        depth
    }

    /// Re-enter to a depth previously returned by [`SysLevel::release_all`].
    pub fn restore(&self, depth: u32) {
        for _ in 0..depth {
            self.enter();
        }
    }

    /// Number of ordering violations seen so far.
    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_recursive_enter() {
        let lock = SysLevel::new(WIN16_LEVEL);
        lock.enter();
        {
            let _g = lock.lock();
            assert_eq!(lock.held(), 2);
        }
        assert_eq!(lock.held(), 1);
        assert_eq!(lock.release_all(), 1);
        assert_eq!(lock.held(), 0);
        lock.restore(2);
        assert_eq!(lock.held(), 2);
        lock.release_all();
        assert_eq!(lock.violations(), 0);
    }

    #[test]
    fn test_excludes_other_threads() {
        let lock = Arc::new(SysLevel::new(WIN16_LEVEL));
        lock.enter();
        let other = {
            let lock = lock.clone();
            thread::spawn(move || {
                let _g = lock.lock();
                lock.held()
            })
        };
        thread::sleep(std::time::Duration::from_millis(20));
        assert!(!other.is_finished());
        lock.leave();
        assert_eq!(other.join().unwrap(), 1);
    }

    #[test]
    fn test_order_violation_is_counted() {
        let low = SysLevel::new(1);
        let high = SysLevel::new(2);
        high.enter();
        low.enter();
        assert_eq!(low.violations(), 1);
        low.leave();
        high.leave();
        low.enter();
        high.enter();
        assert_eq!(low.violations(), 1);
        assert_eq!(high.violations(), 0);
        high.leave();
        low.leave();
    }
}
