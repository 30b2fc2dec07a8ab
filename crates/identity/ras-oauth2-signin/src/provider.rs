//! Extension points invoked during the handshake.

use crate::claims::{AuthenticationProperties, AuthenticationTicket, ClaimsIdentity};
use crate::error::HookRejection;
use crate::types::{IdentityResponse, TokenResponse};
use async_trait::async_trait;

/// Passed to [`AuthenticationHooks::applying_redirect`] before the user leaves
/// for the provider.
#[derive(Debug)]
pub struct RedirectContext {
    pub authentication_type: String,
    /// Our callback URL as sent to the provider; read-only
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    /// Appended to the authorization URL after the standard parameters
    pub extra_parameters: Vec<(String, String)>,
    /// Round-tripped inside the protected state
    pub properties: AuthenticationProperties,
}

/// Passed to [`AuthenticationHooks::authenticated`] after the profile fetch.
#[derive(Debug)]
pub struct AuthenticatedContext {
    pub authentication_type: String,
    pub token: TokenResponse,
    pub profile: IdentityResponse,
    /// Claims from the default mapping; hooks may edit or replace them
    pub identity: ClaimsIdentity,
    pub properties: AuthenticationProperties,
}

impl AuthenticatedContext {
    pub fn access_token(&self) -> &str {
        &self.token.access_token
    }

    pub fn expires_in(&self) -> Option<std::time::Duration> {
        self.token.expires_in.map(std::time::Duration::from_secs)
    }
}

/// Passed to [`AuthenticationHooks::returning_endpoint`] just before sign-in.
#[derive(Debug)]
pub struct ReturnEndpointContext {
    pub ticket: AuthenticationTicket,
    pub sign_in_authentication_type: String,
    /// Final redirect target
    pub redirect_uri: String,
    /// Set to `false` to skip handing the ticket to the host
    pub sign_in: bool,
}

/// User-supplied callbacks. Every method defaults to a no-op, so implementors
/// override only what they need.
#[async_trait]
pub trait AuthenticationHooks: Send + Sync {
    async fn applying_redirect(&self, _context: &mut RedirectContext) -> Result<(), HookRejection> {
        Ok(())
    }

    async fn authenticated(
        &self,
        _context: &mut AuthenticatedContext,
    ) -> Result<(), HookRejection> {
        Ok(())
    }

    async fn returning_endpoint(
        &self,
        _context: &mut ReturnEndpointContext,
    ) -> Result<(), HookRejection> {
        Ok(())
    }
}

/// Hooks used when none are configured
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

#[async_trait]
impl AuthenticationHooks for DefaultHooks {}
