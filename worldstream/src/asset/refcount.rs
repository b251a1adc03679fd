//! Reference-counted ownership wrapper.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use super::error::InvariantViolation;

/// Sentinel count marking a value its owner has reclaimed.
const RECLAIMED: u64 = u64::MAX;

/// The value was reclaimed between being handed out and being claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("value already reclaimed")]
pub struct AlreadyReclaimed;

/// An owned value paired with a count of live users.
///
/// `RefCounted` never frees its value. Whoever owns it (the asset cache)
/// polls [`should_reclaim`](Self::should_reclaim), atomically claims the
/// value with [`try_reclaim`](Self::try_reclaim) and disposes it itself.
/// The count starts at zero: the component that instantiates the value
/// increments, the component that destroys the instantiation decrements.
///
/// Once reclaimed, increments fail with [`AlreadyReclaimed`] so a user that
/// raced the reclaim can go back for a fresh copy instead of using a
/// disposed one.
pub struct RefCounted<T> {
    value: T,
    refs: AtomicU64,
    label: String,
}

impl<T> RefCounted<T> {
    pub fn new(value: T, label: impl Into<String>) -> Self {
        Self {
            value,
            refs: AtomicU64::new(0),
            label: label.into(),
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current count; zero once reclaimed.
    pub fn ref_count(&self) -> u64 {
        match self.refs.load(Ordering::Acquire) {
            RECLAIMED => 0,
            n => n,
        }
    }

    /// Increment the count, returning the new value.
    pub fn inc_ref(&self) -> Result<u64, AlreadyReclaimed> {
        self.refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match n {
                RECLAIMED => None,
                n => Some(n + 1),
            })
            .map(|previous| previous + 1)
            .map_err(|_| AlreadyReclaimed)
    }

    /// Decrement the count, returning the new value.
    ///
    /// Decrementing at zero (or after reclaim) is refused: the count is left
    /// untouched and the violation is returned for the caller to report.
    pub fn dec_ref(&self) -> Result<u64, InvariantViolation> {
        self.refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match n {
                RECLAIMED | 0 => None,
                n => Some(n - 1),
            })
            .map(|previous| previous - 1)
            .map_err(|_| InvariantViolation::NegativeRefCount(self.label.clone()))
    }

    /// True when nobody holds a reference and the value is not yet reclaimed.
    pub fn should_reclaim(&self) -> bool {
        self.refs.load(Ordering::Acquire) == 0
    }

    /// Atomically move from zero references to reclaimed.
    ///
    /// Returns `false` if a reference was taken in the meantime.
    pub fn try_reclaim(&self) -> bool {
        self.refs
            .compare_exchange(0, RECLAIMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark reclaimed regardless of outstanding references. Returns the
    /// count that was outstanding.
    pub fn force_reclaim(&self) -> u64 {
        match self.refs.swap(RECLAIMED, Ordering::AcqRel) {
            RECLAIMED => 0,
            n => n,
        }
    }

    pub fn is_reclaimed(&self) -> bool {
        self.refs.load(Ordering::Acquire) == RECLAIMED
    }
}

impl<T> fmt::Debug for RefCounted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefCounted")
            .field("label", &self.label)
            .field("refs", &self.ref_count())
            .field("reclaimed", &self.is_reclaimed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_at_zero_and_reclaimable() {
        let rc = RefCounted::new("mesh", "col/1");
        assert_eq!(rc.ref_count(), 0);
        assert!(rc.should_reclaim());
        assert_eq!(*rc.value(), "mesh");
    }

    #[test]
    fn test_inc_dec() {
        let rc = RefCounted::new((), "col/1");
        assert_eq!(rc.inc_ref(), Ok(1));
        assert_eq!(rc.inc_ref(), Ok(2));
        assert!(!rc.should_reclaim());
        assert_eq!(rc.dec_ref(), Ok(1));
        assert_eq!(rc.dec_ref(), Ok(0));
        assert!(rc.should_reclaim());
    }

    #[test]
    fn test_dec_at_zero_is_reported_not_applied() {
        let rc = RefCounted::new((), "col/9");
        let err = rc.dec_ref().unwrap_err();
        assert_eq!(err, InvariantViolation::NegativeRefCount("col/9".into()));
        assert_eq!(rc.ref_count(), 0);

        // Still usable afterwards.
        assert_eq!(rc.inc_ref(), Ok(1));
    }

    #[test]
    fn test_reclaim_only_when_unreferenced() {
        let rc = RefCounted::new((), "col/2");
        rc.inc_ref().unwrap();
        assert!(!rc.try_reclaim());
        rc.dec_ref().unwrap();
        assert!(rc.try_reclaim());
        assert!(rc.is_reclaimed());
        assert!(!rc.should_reclaim());
        assert!(!rc.try_reclaim());
    }

    #[test]
    fn test_inc_after_reclaim_fails() {
        let rc = RefCounted::new((), "col/3");
        assert!(rc.try_reclaim());
        assert_eq!(rc.inc_ref(), Err(AlreadyReclaimed));
        assert!(rc.dec_ref().is_err());
        assert_eq!(rc.ref_count(), 0);
    }

    #[test]
    fn test_force_reclaim_reports_outstanding() {
        let rc = RefCounted::new((), "col/4");
        rc.inc_ref().unwrap();
        rc.inc_ref().unwrap();
        assert_eq!(rc.force_reclaim(), 2);
        assert!(rc.is_reclaimed());
        assert_eq!(rc.force_reclaim(), 0);
    }
}
