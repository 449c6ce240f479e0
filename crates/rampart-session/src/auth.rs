//! Authentication hook for validating player identity.
//!
//! Rampart doesn't implement authentication itself. It defines the
//! [`Authenticator`] trait: a single async method that takes the token
//! from the client's handshake and returns a `PlayerId` or an error. The
//! server calls it once per connection, before the player's document is
//! opened.
//!
//! The `PlayerId` an authenticator returns also keys the player's
//! persisted record, so it must be stable across connections.

use rampart_protocol::PlayerId;

use crate::SessionError;

/// Validates a client's auth token and returns their identity.
///
/// # Example
///
/// ```rust
/// use rampart_protocol::PlayerId;
/// use rampart_session::{Authenticator, SessionError};
///
/// /// Only lets in the players on a fixed list.
/// struct AllowList(Vec<u64>);
///
/// impl Authenticator for AllowList {
///     async fn authenticate(&self, token: &str) -> Result<PlayerId, SessionError> {
///         let id: u64 = token
///             .parse()
///             .map_err(|_| SessionError::AuthFailed("token must be a number".into()))?;
///         if !self.0.contains(&id) {
///             return Err(SessionError::AuthFailed(format!("player {id} not allowed")));
///         }
///         Ok(PlayerId(id))
///     }
/// }
/// ```
pub trait Authenticator: Send + Sync + 'static {
    /// Validates the given token and returns the player's identity.
    ///
    /// # Errors
    /// [`SessionError::AuthFailed`] if the token is missing, invalid, or
    /// rejected.
    fn authenticate(
        &self,
        token: &str,
    ) -> impl std::future::Future<Output = Result<PlayerId, SessionError>> + Send;
}

/// Trusts the client: the token is the player's numeric id.
///
/// For the demo server and local testing only.
#[derive(Debug, Clone, Copy, Default)]
pub struct NumericTokenAuthenticator;

impl Authenticator for NumericTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<PlayerId, SessionError> {
        token
            .trim()
            .parse()
            .map(PlayerId)
            .map_err(|_| SessionError::AuthFailed(format!("token {token:?} is not a player id")))
    }
}
