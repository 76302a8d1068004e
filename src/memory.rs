//! Global memory throttle.
//!
//! While a scoped block guard is held, speculative large allocations either
//! wait (strict mode) or are merely reported (warn mode). The point is to
//! keep bursty allocation out of the critical pipeline stages, not to be a
//! precise accountant.

use std::sync::{Condvar, Mutex, OnceLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryControl {
    Off,
    Warn,
    Strict,
}

impl std::str::FromStr for MemoryControl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(MemoryControl::Off),
            "warn" => Ok(MemoryControl::Warn),
            "strict" => Ok(MemoryControl::Strict),
            other => Err(format!("unknown memory control mode '{}'", other)),
        }
    }
}

struct BlockState {
    active_blocks: usize,
}

fn state() -> &'static (Mutex<BlockState>, Condvar) {
    static STATE: OnceLock<(Mutex<BlockState>, Condvar)> = OnceLock::new();
    STATE.get_or_init(|| (Mutex::new(BlockState { active_blocks: 0 }), Condvar::new()))
}

/// Held while a critical stage runs. Dropping it releases waiting
/// allocators.
pub struct ScopedMemoryBlock {
    mode: MemoryControl,
}

impl ScopedMemoryBlock {
    pub fn new(mode: MemoryControl) -> Self {
        if mode != MemoryControl::Off {
            let (lock, _) = state();
            lock.lock().unwrap().active_blocks += 1;
        }
        ScopedMemoryBlock { mode }
    }
}

impl Drop for ScopedMemoryBlock {
    fn drop(&mut self) {
        if self.mode != MemoryControl::Off {
            let (lock, condvar) = state();
            let mut guard = lock.lock().unwrap();
            guard.active_blocks = guard.active_blocks.saturating_sub(1);
            condvar.notify_all();
        }
    }
}

/// Call before a speculative large allocation. In strict mode this blocks
/// until no scoped block is active; in warn mode it logs and proceeds.
pub fn request_large_allocation(mode: MemoryControl, bytes: usize, stage: &str) {
    match mode {
        MemoryControl::Off => {}
        MemoryControl::Warn => {
            let (lock, _) = state();
            if lock.lock().unwrap().active_blocks > 0 {
                log::warn!(
                    "[memory] {} allocating {} bytes inside a memory block",
                    stage,
                    bytes
                );
            }
        }
        MemoryControl::Strict => {
            let (lock, condvar) = state();
            let mut guard = lock.lock().unwrap();
            while guard.active_blocks > 0 {
                guard = condvar.wait(guard).unwrap();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn off_mode_never_blocks() {
        let _block = ScopedMemoryBlock::new(MemoryControl::Off);
        request_large_allocation(MemoryControl::Off, 1 << 30, "test");
    }

    #[test]
    fn strict_mode_releases_on_drop() {
        let block = ScopedMemoryBlock::new(MemoryControl::Strict);
        drop(block);
        // would deadlock if the guard leaked
        request_large_allocation(MemoryControl::Strict, 1 << 20, "test");
    }

    #[test]
    fn warn_mode_reports_but_never_blocks() {
        let _block = ScopedMemoryBlock::new(MemoryControl::Warn);
        // logs the violation and returns immediately
        request_large_allocation(MemoryControl::Warn, 1 << 20, "test");
    }

    #[test]
    fn strict_allocation_waits_for_the_block() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let block = ScopedMemoryBlock::new(MemoryControl::Strict);
        let passed = Arc::new(AtomicBool::new(false));
        let passed_in_thread = Arc::clone(&passed);
        let waiter = std::thread::spawn(move || {
            request_large_allocation(MemoryControl::Strict, 1 << 20, "test");
            passed_in_thread.store(true, Ordering::SeqCst);
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!passed.load(Ordering::SeqCst), "allocation passed a held block");
        drop(block);
        waiter.join().unwrap();
        assert!(passed.load(Ordering::SeqCst));
    }
}
