//! Credential checks performed on CONNECT.
//!
//! The broker only needs a yes/no answer plus the reason for refusal, which
//! maps straight onto the CONNACK return code. Anything richer (ACLs,
//! external backends) plugs in through `Authenticator`.

mod static_auth;

pub use static_auth::StaticAuthenticator;

use crate::codec::ConnectReturnCode;

/// Outcome of an authentication check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    Allow,
    /// Unknown user or wrong password.
    DenyBadCredentials,
    /// No credentials where some are required.
    DenyNotAuthorized,
}

impl AuthResult {
    #[inline]
    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthResult::Allow)
    }

    /// CONNACK return code for this result.
    pub fn return_code(self) -> ConnectReturnCode {
        match self {
            AuthResult::Allow => ConnectReturnCode::Accepted,
            AuthResult::DenyBadCredentials => ConnectReturnCode::BadUserNamePassword,
            AuthResult::DenyNotAuthorized => ConnectReturnCode::NotAuthorized,
        }
    }
}

/// Validates client credentials on CONNECT.
///
/// Called with the broker lock held, so implementations must not block.
pub trait Authenticator: Send + Sync {
    fn authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> AuthResult;
}

impl<F> Authenticator for F
where
    F: Fn(&str, Option<&str>, Option<&[u8]>) -> AuthResult + Send + Sync,
{
    fn authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> AuthResult {
        self(client_id, username, password)
    }
}
