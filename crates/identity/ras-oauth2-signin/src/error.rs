//! OAuth2 sign-in error types.

use crate::handler::HandshakeState;
use http::StatusCode;
use std::fmt;
use thiserror::Error;

pub type OAuth2Result<T> = Result<T, OAuth2Error>;

/// Errors raised while constructing the handler or its collaborators.
///
/// These are fatal: a handler that fails to construct never serves a request.
#[derive(Debug, Error)]
pub enum OAuth2Error {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("TLS configuration error: {0}")]
    Tls(String),
}

impl OAuth2Error {
    pub(crate) fn option_must_be_provided(option: &str) -> Self {
        Self::Configuration(format!("The '{}' option must be provided", option))
    }
}

/// Errors produced by a [`StateProtector`](crate::StateProtector).
#[derive(Debug, Error)]
pub enum StateError {
    #[error("State token is not valid base64url")]
    Malformed,

    #[error("Unsupported state token version {0}")]
    UnsupportedVersion(u8),

    #[error("State token failed authentication")]
    Authentication,

    #[error("State payload could not be decoded: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("State token expired")]
    Expired,

    #[error("State token was already used")]
    Replayed,

    #[error("State protection failed: {0}")]
    Protection(String),
}

/// Errors produced by the back-channel client.
#[derive(Debug, Error)]
pub enum BackchannelError {
    #[error("Request to {endpoint} timed out")]
    Timeout { endpoint: String },

    #[error("Request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{endpoint} responded with HTTP {status}")]
    Status { endpoint: String, status: StatusCode },

    #[error("Response from {endpoint} exceeded {limit} bytes")]
    TooLarge { endpoint: String, limit: usize },

    #[error("Malformed response from {endpoint}: {reason}")]
    Malformed { endpoint: String, reason: String },
}

impl BackchannelError {
    pub(crate) fn from_reqwest(endpoint: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                endpoint: endpoint.to_string(),
            }
        } else {
            Self::Transport {
                endpoint: endpoint.to_string(),
                source: err,
            }
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Error returned by the host sign-in mechanism.
#[derive(Debug, Error)]
pub enum SignInError {
    #[error("Unknown sign-in scheme: {0}")]
    UnknownScheme(String),

    #[error("Sign-in failed: {0}")]
    Failed(String),
}

/// Veto raised by an [`AuthenticationHooks`](crate::AuthenticationHooks) callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookRejection {
    pub reason: String,
}

impl HookRejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for HookRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rejected by hook: {}", self.reason)
    }
}

impl std::error::Error for HookRejection {}

/// Category of a failed handshake attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Forged, tampered, expired or replayed state token.
    InvalidState,
    /// The provider returned an error instead of a code.
    ProviderDenied,
    /// Token exchange or profile fetch failed.
    BackchannelFailure,
    /// A hook vetoed the attempt.
    HookRejected,
    /// The host could not sign the ticket in.
    SignInFailed,
    /// The inbound request lacked what the handshake needs, e.g. a Host.
    MalformedRequest,
}

impl FailureKind {
    /// Stable code used in failure redirects and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidState => "invalid_state",
            Self::ProviderDenied => "access_denied",
            Self::BackchannelFailure => "backchannel_failure",
            Self::HookRejected => "rejected",
            Self::SignInFailed => "sign_in_failed",
            Self::MalformedRequest => "invalid_request",
        }
    }

    /// Message shown to the end user. Internal detail never reaches the browser.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::InvalidState => "The sign-in request was invalid or has expired. Please try again.",
            Self::ProviderDenied => "Sign-in was cancelled or denied by the identity provider.",
            Self::BackchannelFailure => {
                "The identity provider could not be reached. Please try again later."
            }
            Self::HookRejected => "Sign-in is not permitted for this account.",
            Self::SignInFailed => "Sign-in could not be completed. Please try again.",
            Self::MalformedRequest => "The sign-in request was malformed.",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidState | Self::ProviderDenied | Self::HookRejected => StatusCode::FORBIDDEN,
            Self::BackchannelFailure => StatusCode::BAD_GATEWAY,
            Self::SignInFailed => StatusCode::INTERNAL_SERVER_ERROR,
            Self::MalformedRequest => StatusCode::BAD_REQUEST,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A handshake attempt that ended in the `Failed` state.
#[derive(Debug)]
pub struct HandshakeFailure {
    pub kind: FailureKind,
    /// Diagnostic reason for logs. Not rendered to the browser.
    pub reason: String,
    /// State the attempt was in when it failed.
    pub stage: HandshakeState,
    pub(crate) error_path: Option<String>,
    pub(crate) set_cookies: Vec<http::HeaderValue>,
}

impl HandshakeFailure {
    pub fn new(kind: FailureKind, stage: HandshakeState, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            stage,
            error_path: None,
            set_cookies: Vec::new(),
        }
    }
}

impl fmt::Display for HandshakeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} during {:?}: {}", self.kind, self.stage, self.reason)
    }
}

impl std::error::Error for HandshakeFailure {}
