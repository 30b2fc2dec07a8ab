//! Seam to the host's session infrastructure.

use crate::claims::AuthenticationTicket;
use crate::error::SignInError;
use async_trait::async_trait;
use http::HeaderMap;

/// The host's sign-in mechanism, e.g. a cookie or JWT session scheme.
#[async_trait]
pub trait SignIn: Send + Sync {
    /// Scheme used when the handler is not configured with one
    fn default_authentication_type(&self) -> &str;

    /// Establish a session for the ticket. Returned headers (typically
    /// `Set-Cookie`) are added to the redirect back to the application.
    async fn sign_in(
        &self,
        authentication_type: &str,
        ticket: &AuthenticationTicket,
    ) -> Result<HeaderMap, SignInError>;
}
