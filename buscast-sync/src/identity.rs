//! Broadcaster identity.
//!
//! The identity is the record key: exactly one legitimate writer per record
//! rests entirely on this value.

use std::sync::Mutex;

use uuid::Uuid;

use crate::error::IdentityError;

/// Identity collaborator.
pub trait Identity: Send + Sync {
    /// The identity if one is already established.
    fn current_identity(&self) -> Option<String>;

    /// Return the identity, provisioning one if necessary.
    fn ensure_identity(&self) -> Result<String, IdentityError>;
}

/// Anonymous identity provisioned locally on first use.
#[derive(Debug, Default)]
pub struct AnonymousIdentity {
    id: Mutex<Option<String>>,
}

impl AnonymousIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a known identity.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Mutex::new(Some(id.into())),
        }
    }
}

impl Identity for AnonymousIdentity {
    fn current_identity(&self) -> Option<String> {
        self.id.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn ensure_identity(&self) -> Result<String, IdentityError> {
        let mut id = self.id.lock().unwrap_or_else(|e| e.into_inner());
        Ok(id.get_or_insert_with(|| Uuid::new_v4().to_string()).clone())
    }
}

/// Resolve the identity, re-authenticating once on failure.
pub fn resolve_identity(identity: &dyn Identity) -> Result<String, IdentityError> {
    if let Some(id) = identity.current_identity() {
        return Ok(id);
    }
    match identity.ensure_identity() {
        Ok(id) => Ok(id),
        Err(first) => {
            log::warn!("Identity provisioning failed ({first}), retrying once");
            identity.ensure_identity()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` provisioning attempts.
    struct FlakyIdentity {
        failures: usize,
        attempts: AtomicUsize,
    }

    impl Identity for FlakyIdentity {
        fn current_identity(&self) -> Option<String> {
            None
        }

        fn ensure_identity(&self) -> Result<String, IdentityError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(IdentityError::Provisioning(format!("attempt {n}")))
            } else {
                Ok("U1".into())
            }
        }
    }

    #[test]
    fn test_anonymous_identity_is_stable() {
        let identity = AnonymousIdentity::new();
        assert!(identity.current_identity().is_none());

        let first = identity.ensure_identity().unwrap();
        let second = identity.ensure_identity().unwrap();
        assert_eq!(first, second);
        assert_eq!(identity.current_identity(), Some(first));
    }

    #[test]
    fn test_with_id() {
        let identity = AnonymousIdentity::with_id("U7");
        assert_eq!(resolve_identity(&identity).unwrap(), "U7");
    }

    #[test]
    fn test_resolve_retries_once() {
        let identity = FlakyIdentity {
            failures: 1,
            attempts: AtomicUsize::new(0),
        };
        assert_eq!(resolve_identity(&identity).unwrap(), "U1");
        assert_eq!(identity.attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_resolve_gives_up_after_retry() {
        let identity = FlakyIdentity {
            failures: 5,
            attempts: AtomicUsize::new(0),
        };
        assert!(resolve_identity(&identity).is_err());
        assert_eq!(identity.attempts.load(Ordering::SeqCst), 2);
    }
}
