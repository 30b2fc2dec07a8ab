//! OAuth2 sign-in configuration types.

use crate::provider::AuthenticationHooks;
use crate::state::{ConsumedStateStore, StateProtector};
use crate::transport::{BackchannelTransport, CertificateValidator};
use bon::Builder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_BACKCHANNEL_TIMEOUT_SECONDS: u64 = 60;
const DEFAULT_STATE_LIFETIME_SECONDS: u64 = 15 * 60;
const DEFAULT_MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;
pub(crate) const MAX_STATE_LIFETIME_SECONDS: u64 = 24 * 60 * 60;

/// Profile field names mapped onto standard claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimMapping {
    /// Candidate fields for the subject, first present wins
    pub subject_fields: Vec<String>,
    pub name_field: String,
    pub email_field: String,
}

impl Default for ClaimMapping {
    fn default() -> Self {
        Self {
            subject_fields: vec![
                "sub".to_string(),
                "id".to_string(),
                "userID".to_string(),
                "user_id".to_string(),
            ],
            name_field: "name".to_string(),
            email_field: "email".to_string(),
        }
    }
}

/// Plain settings for one provider.
///
/// `Debug` output redacts the client secret.
#[derive(Clone, Serialize, Deserialize)]
pub struct OAuth2SignInConfig {
    pub client_id: String,
    pub client_secret: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    /// Path of the provider's redirect back to us, e.g. `/signin-oauth2`
    pub callback_path: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Name of this provider's scheme; also the claim issuer
    #[serde(default = "default_authentication_type")]
    pub authentication_type: String,
    /// Session scheme the ticket is signed into; the host's default when unset
    #[serde(default)]
    pub sign_in_authentication_type: Option<String>,
    #[serde(default = "default_backchannel_timeout_seconds")]
    pub backchannel_timeout_seconds: u64,
    #[serde(default = "default_state_lifetime_seconds")]
    pub state_lifetime_seconds: u64,
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
    /// Local page failures are redirected to, with `?error=<code>`
    #[serde(default)]
    pub error_path: Option<String>,
    #[serde(default)]
    pub claim_mapping: ClaimMapping,
    #[serde(default)]
    pub trust_forwarded_headers: bool,
    #[serde(default = "default_true")]
    pub correlation_cookie: bool,
}

fn default_authentication_type() -> String {
    "OAuth2".to_string()
}

fn default_backchannel_timeout_seconds() -> u64 {
    DEFAULT_BACKCHANNEL_TIMEOUT_SECONDS
}

fn default_state_lifetime_seconds() -> u64 {
    DEFAULT_STATE_LIFETIME_SECONDS
}

fn default_max_response_bytes() -> usize {
    DEFAULT_MAX_RESPONSE_BYTES
}

fn default_true() -> bool {
    true
}

impl fmt::Debug for OAuth2SignInConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuth2SignInConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[redacted]")
            .field("authorization_endpoint", &self.authorization_endpoint)
            .field("token_endpoint", &self.token_endpoint)
            .field("userinfo_endpoint", &self.userinfo_endpoint)
            .field("callback_path", &self.callback_path)
            .field("scopes", &self.scopes)
            .field("authentication_type", &self.authentication_type)
            .field("sign_in_authentication_type", &self.sign_in_authentication_type)
            .field("backchannel_timeout_seconds", &self.backchannel_timeout_seconds)
            .field("state_lifetime_seconds", &self.state_lifetime_seconds)
            .field("max_response_bytes", &self.max_response_bytes)
            .field("error_path", &self.error_path)
            .field("claim_mapping", &self.claim_mapping)
            .field("trust_forwarded_headers", &self.trust_forwarded_headers)
            .field("correlation_cookie", &self.correlation_cookie)
            .finish()
    }
}

impl OAuth2SignInConfig {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        authorization_endpoint: impl Into<String>,
        token_endpoint: impl Into<String>,
        userinfo_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            authorization_endpoint: authorization_endpoint.into(),
            token_endpoint: token_endpoint.into(),
            userinfo_endpoint: userinfo_endpoint.into(),
            callback_path: "/signin-oauth2".to_string(),
            scopes: Vec::new(),
            authentication_type: default_authentication_type(),
            sign_in_authentication_type: None,
            backchannel_timeout_seconds: DEFAULT_BACKCHANNEL_TIMEOUT_SECONDS,
            state_lifetime_seconds: DEFAULT_STATE_LIFETIME_SECONDS,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            error_path: None,
            claim_mapping: ClaimMapping::default(),
            trust_forwarded_headers: false,
            correlation_cookie: true,
        }
    }

    pub fn with_callback_path(mut self, path: impl Into<String>) -> Self {
        self.callback_path = path.into();
        self
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_authentication_type(mut self, authentication_type: impl Into<String>) -> Self {
        self.authentication_type = authentication_type.into();
        self
    }

    pub fn with_sign_in_authentication_type(mut self, scheme: impl Into<String>) -> Self {
        self.sign_in_authentication_type = Some(scheme.into());
        self
    }

    /// Stored in whole seconds, rounded up. Use
    /// [`HandshakeOptions::backchannel_timeout`] for sub-second precision.
    pub fn with_backchannel_timeout(mut self, timeout: Duration) -> Self {
        self.backchannel_timeout_seconds =
            timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
        self
    }

    pub fn with_state_lifetime(mut self, seconds: u64) -> Self {
        self.state_lifetime_seconds = seconds;
        self
    }

    pub fn with_max_response_bytes(mut self, limit: usize) -> Self {
        self.max_response_bytes = limit;
        self
    }

    pub fn with_error_path(mut self, path: impl Into<String>) -> Self {
        self.error_path = Some(path.into());
        self
    }

    pub fn with_correlation_cookie(mut self, enabled: bool) -> Self {
        self.correlation_cookie = enabled;
        self
    }

    pub fn backchannel_timeout(&self) -> Duration {
        Duration::from_secs(self.backchannel_timeout_seconds)
    }

    /// Lifetime of a state token, clamped to one day.
    pub fn state_lifetime(&self) -> chrono::Duration {
        let seconds = self.state_lifetime_seconds.min(MAX_STATE_LIFETIME_SECONDS);
        chrono::Duration::seconds(
            i64::try_from(seconds).unwrap_or(MAX_STATE_LIFETIME_SECONDS as i64),
        )
    }

    /// Scopes in configured order without duplicates.
    pub fn distinct_scopes(&self) -> Vec<String> {
        let mut scopes: Vec<String> = Vec::with_capacity(self.scopes.len());
        for scope in &self.scopes {
            if !scope.trim().is_empty() && !scopes.contains(scope) {
                scopes.push(scope.clone());
            }
        }
        scopes
    }
}

/// Everything needed to build a [`HandshakeHandler`](crate::HandshakeHandler).
///
/// Collaborators left unset fall back to the defaults described on the handler.
#[derive(Builder)]
pub struct HandshakeOptions {
    pub config: OAuth2SignInConfig,

    /// Sub-second precision for the back-channel timeout; overrides the config seconds.
    pub backchannel_timeout: Option<Duration>,

    pub backchannel_transport: Option<Arc<dyn BackchannelTransport>>,

    pub certificate_validator: Option<Arc<dyn CertificateValidator>>,

    pub state_protector: Option<Arc<dyn StateProtector>>,

    pub consumed_states: Option<Arc<dyn ConsumedStateStore>>,

    pub hooks: Option<Arc<dyn AuthenticationHooks>>,
}

impl From<OAuth2SignInConfig> for HandshakeOptions {
    fn from(config: OAuth2SignInConfig) -> Self {
        HandshakeOptions::builder().config(config).build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_json() {
        let config: OAuth2SignInConfig = serde_json::from_value(serde_json::json!({
            "client_id": "id",
            "client_secret": "secret",
            "authorization_endpoint": "https://idp.example/authorize",
            "token_endpoint": "https://idp.example/token",
            "userinfo_endpoint": "https://idp.example/userinfo",
            "callback_path": "/signin-idp"
        }))
        .unwrap();

        assert_eq!(config.authentication_type, "OAuth2");
        assert_eq!(config.backchannel_timeout(), Duration::from_secs(60));
        assert_eq!(config.max_response_bytes, 10 * 1024 * 1024);
        assert!(config.correlation_cookie);
        assert!(!config.trust_forwarded_headers);
        assert_eq!(config.claim_mapping.subject_fields[0], "sub");
    }

    #[test]
    fn test_debug_redacts_client_secret() {
        let config = OAuth2SignInConfig::new(
            "client-1",
            "very-secret-value",
            "https://idp.example/authorize",
            "https://idp.example/token",
            "https://idp.example/userinfo",
        );
        let rendered = format!("{:?}", config);
        assert!(rendered.contains("client-1"));
        assert!(!rendered.contains("very-secret-value"));
    }

    #[test]
    fn test_backchannel_timeout_rounds_up_to_seconds() {
        let config = OAuth2SignInConfig::new("id", "secret", "a", "b", "c");
        assert_eq!(
            config
                .clone()
                .with_backchannel_timeout(Duration::from_millis(500))
                .backchannel_timeout_seconds,
            1
        );
        assert_eq!(
            config
                .clone()
                .with_backchannel_timeout(Duration::from_millis(1500))
                .backchannel_timeout_seconds,
            2
        );
        assert_eq!(
            config
                .with_backchannel_timeout(Duration::from_secs(30))
                .backchannel_timeout_seconds,
            30
        );
    }

    #[test]
    fn test_state_lifetime_is_clamped() {
        let config = OAuth2SignInConfig::new("id", "secret", "a", "b", "c");
        assert_eq!(
            config.clone().with_state_lifetime(u64::MAX).state_lifetime(),
            chrono::Duration::days(1)
        );
        assert_eq!(
            config.with_state_lifetime(600).state_lifetime(),
            chrono::Duration::minutes(10)
        );
    }

    #[test]
    fn test_distinct_scopes_keeps_order() {
        let config = OAuth2SignInConfig::new("id", "secret", "a", "b", "c").with_scopes([
            "profile", "email", "profile", " ", "openid",
        ]);
        assert_eq!(config.distinct_scopes(), vec!["profile", "email", "openid"]);
    }
}
