//! Hierarchical cooperative cancellation.
//!
//! Cancelling a token cancels every child derived from it. Workers check at
//! channel boundaries and between I/O chunks; backends are required to
//! return promptly once the flag is set.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};

#[derive(Debug)]
struct Inner {
    flag: AtomicBool,
    parent: Option<Arc<Inner>>,
}

/// Cloneable cancellation handle. Clones share the same flag; children
/// observe their ancestors' flags as well.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                flag: AtomicBool::new(false),
                parent: None,
            }),
        }
    }

    /// Derive a child token. Cancelling the parent cancels the child;
    /// cancelling the child leaves the parent running.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                flag: AtomicBool::new(false),
                parent: Some(Arc::clone(&self.inner)),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        let mut node = Some(&self.inner);
        while let Some(inner) = node {
            if inner.flag.load(Ordering::SeqCst) {
                return true;
            }
            node = inner.parent.as_ref();
        }
        false
    }

    /// Checkpoint helper for loops: `token.check()?`.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_cancels_children() {
        let parent = CancelToken::new();
        let child = parent.child();
        let grandchild = child.child();

        parent.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn child_cancel_does_not_propagate_up() {
        let parent = CancelToken::new();
        let child = parent.child();

        child.cancel();
        assert!(!parent.is_cancelled());
        assert!(child.check().is_err());
        assert!(parent.check().is_ok());
    }

    #[test]
    fn clones_share_state() {
        let a = CancelToken::new();
        let b = a.clone();
        b.cancel();
        assert!(a.is_cancelled());
    }
}
