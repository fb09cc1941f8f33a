use std::sync::RwLock;

use shared::domain::UserId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user_id: UserId,
    pub display_name: String,
    /// Opaque bearer credential; never inspected by this crate.
    pub token: String,
}

/// Source of the current credential. Read again on every connect and every
/// request because the token may rotate underneath a live session.
pub trait IdentityProvider: Send + Sync {
    fn credentials(&self) -> Option<Credentials>;
}

/// In-memory credential store, replaced wholesale on login/refresh.
#[derive(Debug, Default)]
pub struct CredentialStore {
    current: RwLock<Option<Credentials>>,
}

impl CredentialStore {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            current: RwLock::new(Some(credentials)),
        }
    }

    pub fn replace(&self, credentials: Option<Credentials>) {
        match self.current.write() {
            Ok(mut guard) => *guard = credentials,
            Err(poisoned) => *poisoned.into_inner() = credentials,
        }
    }
}

impl IdentityProvider for CredentialStore {
    fn credentials(&self) -> Option<Credentials> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
