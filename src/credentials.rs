//! Bearer token storage shared by the REST and realtime clients.

use std::sync::{PoisonError, RwLock};

use secrecy::{ExposeSecret, SecretString};

/// Source of the bearer token used to authenticate API requests and the
/// realtime connection.
pub trait CredentialStore: Send + Sync {
    /// Current token, if one has been stored.
    fn token(&self) -> Option<SecretString>;

    /// Replaces the stored token.
    fn set_token(&self, token: SecretString);

    /// Forgets the stored token.
    fn clear(&self);
}

/// Process-local credential store.
#[derive(Default)]
pub struct MemoryCredentialStore {
    token: RwLock<Option<SecretString>>,
}

impl MemoryCredentialStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that already holds `token`.
    pub fn with_token(token: SecretString) -> Self {
        Self {
            token: RwLock::new(Some(token)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn token(&self) -> Option<SecretString> {
        let guard = self.token.read().unwrap_or_else(PoisonError::into_inner);
        guard
            .as_ref()
            .filter(|token| !token.expose_secret().is_empty())
            .cloned()
    }

    fn set_token(&self, token: SecretString) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token);
    }

    fn clear(&self) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl std::fmt::Debug for MemoryCredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let present = self
            .token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        f.debug_struct("MemoryCredentialStore")
            .field("token_present", &present)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{catch_unwind, AssertUnwindSafe};

    use secrecy::{ExposeSecret, SecretString};

    use super::{CredentialStore, MemoryCredentialStore};

    #[test]
    fn empty_token_is_treated_as_absent() {
        let store = MemoryCredentialStore::with_token(SecretString::new(String::new()));
        assert!(store.token().is_none());
    }

    #[test]
    fn set_and_clear_round_trip() {
        let store = MemoryCredentialStore::new();
        assert!(store.token().is_none());

        store.set_token(SecretString::new("abc".to_string()));
        assert_eq!(
            store.token().map(|token| token.expose_secret().clone()),
            Some("abc".to_string())
        );

        store.clear();
        assert!(store.token().is_none());
    }

    #[test]
    fn debug_output_hides_token() {
        let store = MemoryCredentialStore::with_token(SecretString::new("hunter2".to_string()));
        let rendered = format!("{store:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("token_present: true"));
    }

    #[test]
    fn poisoned_store_keeps_working() {
        let store = MemoryCredentialStore::with_token(SecretString::new("before".to_string()));
        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store.token.write().expect("first writer");
            panic!("writer panicked while holding the lock");
        }));
        assert!(store.token.is_poisoned());

        assert_eq!(
            store.token().map(|token| token.expose_secret().clone()),
            Some("before".to_string())
        );
        store.set_token(SecretString::new("after".to_string()));
        assert_eq!(
            store.token().map(|token| token.expose_secret().clone()),
            Some("after".to_string())
        );
        store.clear();
        assert!(store.token().is_none());
    }
}
