use std::collections::HashMap;

use super::{AuthResult, Authenticator};
use crate::config::AuthSettings;

/// Username/password table loaded from configuration.
///
/// With `allow_anonymous` set and no users configured every client is
/// accepted, whatever it sends. Once users exist, a client that presents a
/// username must match the table; one that presents none is accepted only
/// when anonymous access is on.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    allow_anonymous: bool,
    users: HashMap<String, String>,
}

impl StaticAuthenticator {
    pub fn new(settings: &AuthSettings) -> Self {
        Self {
            allow_anonymous: settings.allow_anonymous,
            users: settings.users.clone(),
        }
    }

    /// Accepts every client.
    pub fn anonymous() -> Self {
        Self {
            allow_anonymous: true,
            users: HashMap::new(),
        }
    }

    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(username.into(), password.into());
        self
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(
        &self,
        _client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> AuthResult {
        if self.allow_anonymous && self.users.is_empty() {
            return AuthResult::Allow;
        }

        let Some(username) = username else {
            return if self.allow_anonymous {
                AuthResult::Allow
            } else {
                AuthResult::DenyNotAuthorized
            };
        };

        match (self.users.get(username), password) {
            (Some(expected), Some(given)) if expected.as_bytes() == given => AuthResult::Allow,
            _ => AuthResult::DenyBadCredentials,
        }
    }
}
