//! Accounted-memory manager.
//!
//! A process-wide counter of bytes the library has *accounted for*, with a
//! configurable limit and an exhaustion policy. The manager is not an
//! allocator: callers allocate through the platform as usual and pair each
//! large allocation with `account`/`release`. The external sort and the
//! phase scheduler size their buffers against `available()`.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use crate::error::{OspreyError, OspreyResult};

/// What `account` does when the accounted total would exceed the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustionPolicy {
    /// Return `OspreyError::ResourceExhaustion`.
    #[default]
    Error,
    /// Log one warning for the lifetime of the manager, then keep counting.
    WarnOnce,
    /// Keep counting silently.
    Ignore,
}

/// Process-wide accounted-byte counter.
///
/// The counter is signed so that a transient over-release in racing callers
/// cannot wrap to `u64::MAX`; debug assertions check non-negative.
#[derive(Debug)]
pub struct MemoryManager {
    limit: AtomicU64,
    used: AtomicI64,
    policy: ExhaustionPolicy,
    warned: AtomicBool,
}

impl MemoryManager {
    pub fn new(limit: u64, policy: ExhaustionPolicy) -> Self {
        Self {
            limit: AtomicU64::new(limit),
            used: AtomicI64::new(0),
            policy,
            warned: AtomicBool::new(false),
        }
    }

    /// Manager with the given limit and the default (erroring) policy.
    pub fn with_limit(limit: u64) -> Self {
        Self::new(limit, ExhaustionPolicy::Error)
    }

    pub fn set_limit(&self, bytes: u64) {
        self.limit.store(bytes, Ordering::Relaxed);
    }

    pub fn limit(&self) -> u64 {
        self.limit.load(Ordering::Relaxed)
    }

    /// Bytes currently accounted.
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed).max(0) as u64
    }

    /// Bytes still available under the limit (saturating).
    pub fn available(&self) -> u64 {
        self.limit().saturating_sub(self.used())
    }

    /// Account `bytes` of a large allocation.
    ///
    /// On exhaustion the configured policy decides: `Error` undoes the
    /// accounting and fails, the other policies let the counter run over.
    pub fn account(&self, bytes: u64) -> OspreyResult<()> {
        let new_used = self.used.fetch_add(bytes as i64, Ordering::Relaxed) + bytes as i64;
        let limit = self.limit();
        if new_used.max(0) as u64 <= limit {
            return Ok(());
        }
        match self.policy {
            ExhaustionPolicy::Error => {
                self.used.fetch_sub(bytes as i64, Ordering::Relaxed);
                Err(OspreyError::ResourceExhaustion(format!(
                    "accounting {bytes} bytes would exceed the {limit}-byte memory limit \
                     ({} already in use)",
                    new_used.max(0) as u64 - bytes
                )))
            }
            ExhaustionPolicy::WarnOnce => {
                if !self.warned.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        used = new_used.max(0),
                        limit,
                        "accounted memory exceeds the configured limit"
                    );
                }
                Ok(())
            }
            ExhaustionPolicy::Ignore => Ok(()),
        }
    }

    /// Release previously accounted bytes.
    pub fn release(&self, bytes: u64) {
        let prev = self.used.fetch_sub(bytes as i64, Ordering::Relaxed);
        debug_assert!(
            prev >= bytes as i64,
            "memory accounting underflow: prev={prev}, release={bytes}"
        );
        if prev < bytes as i64 {
            // Clamp so used() never reports garbage in release builds.
            self.used.store(0, Ordering::Relaxed);
        }
    }
}

/// An RAII accounting guard: releases its bytes when dropped.
#[derive(Debug)]
pub struct Accounted<'a> {
    manager: &'a MemoryManager,
    bytes: u64,
}

impl<'a> Accounted<'a> {
    pub fn new(manager: &'a MemoryManager, bytes: u64) -> OspreyResult<Self> {
        manager.account(bytes)?;
        Ok(Self { manager, bytes })
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for Accounted<'_> {
    fn drop(&mut self) {
        self.manager.release(self.bytes);
    }
}
