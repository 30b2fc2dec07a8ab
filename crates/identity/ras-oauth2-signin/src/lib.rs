//! OAuth2 "sign in with a provider" for axum applications.
//!
//! This crate implements the relying-party side of the OAuth2 authorization
//! code grant. A [`HandshakeHandler`] redirects the user to the provider with
//! a protected `state` value, receives the provider's redirect back, exchanges
//! the code for an access token, fetches the user's profile, maps it to claims
//! and hands the resulting [`AuthenticationTicket`] to the host's [`SignIn`].
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use ras_oauth2_signin::*;
//! # fn run(sign_in: Arc<dyn SignIn>) -> OAuth2Result<()> {
//! let config = OAuth2SignInConfig::new(
//!     "client-id",
//!     "client-secret",
//!     "https://idp.example/authorize",
//!     "https://idp.example/token",
//!     "https://idp.example/userinfo",
//! )
//! .with_callback_path("/signin-idp")
//! .with_scopes(["profile"]);
//!
//! let handler = Arc::new(HandshakeHandler::new(config.into(), sign_in)?);
//! let router: axum::Router = callback_router(handler.clone());
//! # Ok(())
//! # }
//! ```

mod claims;
mod client;
mod config;
mod error;
mod handler;
mod protector;
mod provider;
mod routes;
mod signin;
mod state;
mod transport;
mod types;


pub use claims::{
    AuthenticationProperties, AuthenticationTicket, Claim, ClaimsIdentity, claim_types,
    value_types,
};
pub use client::BackchannelClient;
pub use config::{ClaimMapping, HandshakeOptions, OAuth2SignInConfig};
pub use error::{
    BackchannelError, FailureKind, HandshakeFailure, HookRejection, OAuth2Error, OAuth2Result,
    SignInError, StateError,
};
pub use handler::{CallbackOutcome, Challenge, CompletedHandshake, HandshakeHandler, HandshakeState};
pub use protector::AeadStateProtector;
pub use provider::{
    AuthenticatedContext, AuthenticationHooks, DefaultHooks, RedirectContext,
    ReturnEndpointContext,
};
pub use routes::callback_router;
pub use signin::SignIn;
pub use state::{ConsumedStateStore, InMemoryConsumedStateStore, StatePayload, StateProtector};
pub use transport::{
    BackchannelTransport, CertificateContext, CertificateValidator, DefaultTransport,
    PreconfiguredTransport, TransportSettings,
};
pub use types::{CallbackParams, IdentityResponse, TokenResponse};
