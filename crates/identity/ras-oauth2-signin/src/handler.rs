//! The authorization-code handshake.
//!
//! One [`HandshakeHandler`] serves every attempt for one provider. It is driven
//! by two events: the host asking for a challenge ([`HandshakeHandler::challenge`])
//! and the provider redirecting back ([`HandshakeHandler::handle_callback`]).
//! Nothing is kept between the two requests except what travels inside the
//! protected `state` parameter and the record of consumed state tokens.

use crate::claims::{AuthenticationProperties, AuthenticationTicket, ClaimsIdentity};
use crate::client::BackchannelClient;
use crate::config::{HandshakeOptions, MAX_STATE_LIFETIME_SECONDS, OAuth2SignInConfig};
use crate::error::{FailureKind, HandshakeFailure, OAuth2Error, OAuth2Result, StateError};
use crate::protector::AeadStateProtector;
use crate::provider::{
    AuthenticatedContext, AuthenticationHooks, DefaultHooks, RedirectContext,
    ReturnEndpointContext,
};
use crate::signin::SignIn;
use crate::state::{ConsumedStateStore, InMemoryConsumedStateStore, StatePayload, StateProtector};
use crate::transport::{DefaultTransport, TransportSettings};
use crate::types::CallbackParams;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use http::request::Parts;
use http::uri::Authority;
use http::{HeaderMap, HeaderValue};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

const HANDLER_PURPOSE: &str = "ras_oauth2_signin::HandshakeHandler";
const STATE_FORMAT_VERSION: &str = "v1";
const RESERVED_PARAMETERS: &[&str] = &["response_type", "client_id", "redirect_uri", "state"];

/// Position of one attempt in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    Idle,
    ChallengeIssued,
    CallbackReceived,
    CodeExchanged,
    ProfileFetched,
    Completed,
    Failed,
}

impl HandshakeState {
    fn can_advance_to(self, next: HandshakeState) -> bool {
        use HandshakeState::*;
        matches!(
            (self, next),
            (Idle, ChallengeIssued)
                | (ChallengeIssued, CallbackReceived)
                | (CallbackReceived, CodeExchanged)
                | (CodeExchanged, ProfileFetched)
                | (ProfileFetched, Completed)
        ) || (next == Failed && self != Idle && self != Failed && self != Completed)
    }
}

/// Tracks one attempt through the state machine within a single request.
struct Attempt<'a> {
    state: HandshakeState,
    authentication_type: &'a str,
}

impl<'a> Attempt<'a> {
    fn new(authentication_type: &'a str, state: HandshakeState) -> Self {
        Self {
            state,
            authentication_type,
        }
    }

    fn advance(&mut self, next: HandshakeState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal handshake transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(
            authentication_type = self.authentication_type,
            from = ?self.state,
            to = ?next,
            "Handshake transition"
        );
        self.state = next;
    }

    fn fail(&mut self, kind: FailureKind, reason: impl Into<String>) -> HandshakeFailure {
        let failure = HandshakeFailure::new(kind, self.state, reason);
        // A challenge that never went out stays Idle
        if self.state != HandshakeState::Idle {
            self.advance(HandshakeState::Failed);
        }
        failure
    }
}

/// Redirect to the provider's authorization endpoint.
#[derive(Debug)]
pub struct Challenge {
    /// Full authorization URL including the protected state
    pub location: String,
    pub(crate) set_cookies: Vec<HeaderValue>,
}

/// A callback that reached `Completed`.
#[derive(Debug)]
pub struct CompletedHandshake {
    pub ticket: AuthenticationTicket,
    /// Where the user is sent back to
    pub redirect_uri: String,
    /// Whether the ticket was handed to the host's sign-in
    pub signed_in: bool,
    /// Headers produced by the host's sign-in
    pub sign_in_headers: HeaderMap,
    pub(crate) set_cookies: Vec<HeaderValue>,
}

pub type CallbackOutcome = Result<CompletedHandshake, HandshakeFailure>;

/// Scheme and authority the current request was addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RequestOrigin {
    scheme: String,
    authority: String,
}

impl RequestOrigin {
    fn is_https(&self) -> bool {
        self.scheme == "https"
    }

    fn base(&self) -> String {
        format!("{}://{}", self.scheme, self.authority)
    }

    fn same_origin(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        url.scheme() == self.scheme && authority.eq_ignore_ascii_case(&self.authority)
    }
}

pub struct HandshakeHandler {
    config: OAuth2SignInConfig,
    authorization_endpoint: Url,
    sign_in_authentication_type: String,
    correlation_cookie_name: String,
    backchannel: BackchannelClient,
    state_protector: Arc<dyn StateProtector>,
    consumed_states: Arc<dyn ConsumedStateStore>,
    hooks: Arc<dyn AuthenticationHooks>,
    sign_in: Arc<dyn SignIn>,
}

impl HandshakeHandler {
    /// Validate the options and build the handler.
    ///
    /// Unset collaborators default to: [`DefaultTransport`], an ephemeral
    /// [`AeadStateProtector`] scoped to this handler type, the authentication
    /// type and the state format version, an [`InMemoryConsumedStateStore`],
    /// [`DefaultHooks`], and the host's default sign-in scheme.
    pub fn new(options: HandshakeOptions, sign_in: Arc<dyn SignIn>) -> OAuth2Result<Self> {
        let HandshakeOptions {
            config,
            backchannel_timeout,
            backchannel_transport,
            certificate_validator,
            state_protector,
            consumed_states,
            hooks,
        } = options;

        if config.client_id.trim().is_empty() {
            return Err(OAuth2Error::option_must_be_provided("client_id"));
        }
        if config.client_secret.trim().is_empty() {
            return Err(OAuth2Error::option_must_be_provided("client_secret"));
        }
        if config.authentication_type.trim().is_empty() {
            return Err(OAuth2Error::option_must_be_provided("authentication_type"));
        }
        if !config.callback_path.starts_with('/') || config.callback_path.starts_with("//") {
            return Err(OAuth2Error::Configuration(format!(
                "callback_path must be an absolute path, got '{}'",
                config.callback_path
            )));
        }

        let authorization_endpoint =
            parse_endpoint("authorization_endpoint", &config.authorization_endpoint)?;
        parse_endpoint("token_endpoint", &config.token_endpoint)?;
        parse_endpoint("userinfo_endpoint", &config.userinfo_endpoint)?;

        let timeout = backchannel_timeout.unwrap_or_else(|| config.backchannel_timeout());
        if timeout.is_zero() {
            return Err(OAuth2Error::Configuration(
                "backchannel_timeout must be greater than zero".to_string(),
            ));
        }
        if config.max_response_bytes == 0 {
            return Err(OAuth2Error::Configuration(
                "max_response_bytes must be greater than zero".to_string(),
            ));
        }
        if config.state_lifetime_seconds == 0
            || config.state_lifetime_seconds > MAX_STATE_LIFETIME_SECONDS
        {
            return Err(OAuth2Error::Configuration(format!(
                "state_lifetime_seconds must be between 1 and {}, got {}",
                MAX_STATE_LIFETIME_SECONDS, config.state_lifetime_seconds
            )));
        }

        let transport = backchannel_transport.unwrap_or_else(|| Arc::new(DefaultTransport));
        if certificate_validator.is_some() && !transport.supports_certificate_validation() {
            return Err(OAuth2Error::Configuration(
                "A certificate validator was configured but the back-channel transport cannot apply it"
                    .to_string(),
            ));
        }

        let http_client = transport.build_client(&TransportSettings {
            timeout,
            user_agent: format!("ras-oauth2-signin/{}", env!("CARGO_PKG_VERSION")),
            certificate_validator,
        })?;

        let backchannel = BackchannelClient::new(
            http_client,
            config.client_id.clone(),
            config.client_secret.clone(),
            config.token_endpoint.clone(),
            config.userinfo_endpoint.clone(),
            config.max_response_bytes,
            timeout,
        );

        let state_protector = match state_protector {
            Some(protector) => protector,
            None => Arc::new(
                AeadStateProtector::ephemeral(&[
                    HANDLER_PURPOSE,
                    &config.authentication_type,
                    STATE_FORMAT_VERSION,
                ])
                .map_err(|e| OAuth2Error::Configuration(e.to_string()))?,
            ),
        };

        let sign_in_authentication_type = config
            .sign_in_authentication_type
            .clone()
            .filter(|scheme| !scheme.trim().is_empty())
            .unwrap_or_else(|| sign_in.default_authentication_type().to_string());

        let correlation_cookie_name = format!(
            "ras.correlation.{}",
            config
                .authentication_type
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
                .collect::<String>()
                .to_lowercase()
        );

        info!(
            authentication_type = %config.authentication_type,
            callback_path = %config.callback_path,
            sign_in_authentication_type = %sign_in_authentication_type,
            backchannel_timeout_ms = timeout.as_millis() as u64,
            "OAuth2 sign-in handler initialized"
        );

        Ok(Self {
            config,
            authorization_endpoint,
            sign_in_authentication_type,
            correlation_cookie_name,
            backchannel,
            state_protector,
            consumed_states: consumed_states
                .unwrap_or_else(|| Arc::new(InMemoryConsumedStateStore::new())),
            hooks: hooks.unwrap_or_else(|| Arc::new(DefaultHooks)),
            sign_in,
        })
    }

    pub fn authentication_type(&self) -> &str {
        &self.config.authentication_type
    }

    pub fn callback_path(&self) -> &str {
        &self.config.callback_path
    }

    pub fn sign_in_authentication_type(&self) -> &str {
        &self.sign_in_authentication_type
    }

    pub fn correlation_cookie_name(&self) -> &str {
        &self.correlation_cookie_name
    }

    /// Whether the request targets this handler's callback path.
    pub fn matches_callback(&self, parts: &Parts) -> bool {
        parts
            .uri
            .path()
            .eq_ignore_ascii_case(&self.config.callback_path)
    }

    /// Handle the request if it is a callback for this handler.
    pub async fn invoke(&self, parts: &Parts) -> Option<CallbackOutcome> {
        if !self.matches_callback(parts) {
            return None;
        }
        Some(self.handle_callback(parts).await)
    }

    /// Start an attempt: `Idle -> ChallengeIssued`.
    ///
    /// Without a `redirect_uri` in `properties` the user returns to the
    /// current request URL. Targets outside this origin are replaced by `/`.
    pub async fn challenge(
        &self,
        parts: &Parts,
        mut properties: AuthenticationProperties,
    ) -> Result<Challenge, HandshakeFailure> {
        let mut attempt = Attempt::new(&self.config.authentication_type, HandshakeState::Idle);

        let Some(origin) = self.request_origin(parts) else {
            let failure = attempt.fail(
                FailureKind::MalformedRequest,
                "challenge request has no usable Host",
            );
            self.log_failure(&failure);
            return Err(failure);
        };
        let redirect_uri = self.build_redirect_uri(&origin);

        let target = properties.redirect_uri.take().unwrap_or_else(|| {
            let path_and_query = parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            format!("{}{}", origin.base(), path_and_query)
        });
        properties.redirect_uri = Some(self.sanitize_redirect_target(&target, &origin));

        let mut context = RedirectContext {
            authentication_type: self.config.authentication_type.clone(),
            redirect_uri: redirect_uri.clone(),
            scopes: self.config.distinct_scopes(),
            extra_parameters: Vec::new(),
            properties,
        };
        if let Err(rejection) = self.hooks.applying_redirect(&mut context).await {
            let failure = attempt.fail(FailureKind::HookRejected, rejection.reason);
            self.log_failure(&failure);
            return Err(failure);
        }

        let payload = StatePayload::new(context.properties, self.config.state_lifetime());
        let state = self.state_protector.protect(&payload).map_err(|e| {
            let failure = attempt.fail(
                FailureKind::InvalidState,
                format!("state protection failed: {}", e),
            );
            self.log_failure(&failure);
            failure
        })?;

        let mut url = self.authorization_endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("response_type", "code");
            query.append_pair("client_id", &self.config.client_id);
            query.append_pair("redirect_uri", &redirect_uri);
            if !context.scopes.is_empty() {
                query.append_pair("scope", &context.scopes.join(" "));
            }
            query.append_pair("state", &state);

            for (key, value) in &context.extra_parameters {
                if RESERVED_PARAMETERS.contains(&key.as_str()) {
                    warn!(parameter = %key, "Ignoring hook parameter that would override the handshake");
                    continue;
                }
                query.append_pair(key, value);
            }
        }

        let mut set_cookies = Vec::new();
        if self.config.correlation_cookie {
            let cookie = Cookie::build((
                self.correlation_cookie_name.clone(),
                payload.correlation_id.clone(),
            ))
            .path(self.config.callback_path.clone())
            .http_only(true)
            .secure(origin.is_https())
            .same_site(SameSite::Lax)
            .max_age(time::Duration::seconds(
                self.config.state_lifetime().num_seconds(),
            ))
            .build();
            if let Ok(value) = HeaderValue::from_str(&cookie.to_string()) {
                set_cookies.push(value);
            }
        }

        attempt.advance(HandshakeState::ChallengeIssued);
        info!(
            authentication_type = %self.config.authentication_type,
            redirect_uri = %redirect_uri,
            "Issued OAuth2 challenge"
        );

        Ok(Challenge {
            location: url.to_string(),
            set_cookies,
        })
    }

    /// Complete an attempt from the provider's redirect back.
    pub async fn handle_callback(&self, parts: &Parts) -> CallbackOutcome {
        let mut attempt = Attempt::new(
            &self.config.authentication_type,
            HandshakeState::ChallengeIssued,
        );

        let set_cookies: Vec<HeaderValue> = self
            .correlation_removal_cookie()
            .into_iter()
            .filter(|_| self.config.correlation_cookie)
            .collect();

        match self.run_callback(&mut attempt, parts).await {
            Ok(mut completed) => {
                completed.set_cookies = set_cookies;
                Ok(completed)
            }
            Err(mut failure) => {
                self.log_failure(&failure);
                failure.error_path = self.config.error_path.clone();
                failure.set_cookies = set_cookies;
                Err(failure)
            }
        }
    }

    async fn run_callback(
        &self,
        attempt: &mut Attempt<'_>,
        parts: &Parts,
    ) -> CallbackOutcome {
        attempt.advance(HandshakeState::CallbackReceived);
        let params = CallbackParams::from_query(parts.uri.query());

        if let Some(error) = &params.error {
            let reason = match &params.error_description {
                Some(description) => format!("{}: {}", error, description),
                None => error.clone(),
            };
            return Err(attempt.fail(FailureKind::ProviderDenied, reason));
        }

        let Some(code) = params.code.as_deref() else {
            return Err(attempt.fail(
                FailureKind::ProviderDenied,
                "callback carried neither code nor error",
            ));
        };

        let Some(state) = params.state.as_deref() else {
            return Err(attempt.fail(FailureKind::InvalidState, "callback carried no state"));
        };

        let payload = self
            .accept_state(state, parts)
            .await
            .map_err(|e| attempt.fail(FailureKind::InvalidState, format!("invalid or expired state: {}", e)))?;

        // Recomputed from this request, exactly as the challenge computed it
        let origin = self.request_origin(parts).ok_or_else(|| {
            attempt.fail(FailureKind::MalformedRequest, "callback request has no usable Host")
        })?;
        let redirect_uri = self.build_redirect_uri(&origin);

        let token = self
            .backchannel
            .exchange_code(code, &redirect_uri)
            .await
            .map_err(|e| attempt.fail(FailureKind::BackchannelFailure, e.to_string()))?;
        attempt.advance(HandshakeState::CodeExchanged);

        let profile = self
            .backchannel
            .fetch_profile(&token.access_token)
            .await
            .map_err(|e| attempt.fail(FailureKind::BackchannelFailure, e.to_string()))?;
        attempt.advance(HandshakeState::ProfileFetched);

        let identity = self
            .config
            .claim_mapping
            .map(&profile, &self.config.authentication_type);
        let mut context = AuthenticatedContext {
            authentication_type: self.config.authentication_type.clone(),
            token,
            profile,
            identity,
            properties: payload.properties,
        };
        self.hooks
            .authenticated(&mut context)
            .await
            .map_err(|rejection| attempt.fail(FailureKind::HookRejected, rejection.reason))?;

        if context
            .identity
            .subject()
            .is_none_or(|subject| subject.trim().is_empty())
        {
            return Err(attempt.fail(
                FailureKind::BackchannelFailure,
                "profile did not yield a subject identifier",
            ));
        }

        let ticket = AuthenticationTicket {
            identity: ClaimsIdentity {
                authentication_type: self.sign_in_authentication_type.clone(),
                claims: context.identity.claims,
            },
            properties: context.properties,
        };
        let redirect_target = ticket
            .properties
            .redirect_uri
            .clone()
            .unwrap_or_else(|| "/".to_string());

        let mut endpoint = ReturnEndpointContext {
            ticket,
            sign_in_authentication_type: self.sign_in_authentication_type.clone(),
            redirect_uri: redirect_target,
            sign_in: true,
        };
        self.hooks
            .returning_endpoint(&mut endpoint)
            .await
            .map_err(|rejection| attempt.fail(FailureKind::HookRejected, rejection.reason))?;

        let ReturnEndpointContext {
            mut ticket,
            sign_in_authentication_type,
            redirect_uri: final_redirect,
            sign_in,
        } = endpoint;

        let mut sign_in_headers = HeaderMap::new();
        if sign_in {
            ticket.identity.authentication_type = sign_in_authentication_type.clone();
            sign_in_headers = self
                .sign_in
                .sign_in(&sign_in_authentication_type, &ticket)
                .await
                .map_err(|e| attempt.fail(FailureKind::SignInFailed, e.to_string()))?;
        }

        attempt.advance(HandshakeState::Completed);
        info!(
            authentication_type = %self.config.authentication_type,
            subject = ticket.identity.subject().unwrap_or_default(),
            signed_in = sign_in,
            "OAuth2 handshake completed"
        );

        Ok(CompletedHandshake {
            ticket,
            redirect_uri: final_redirect,
            signed_in: sign_in,
            sign_in_headers,
            set_cookies: Vec::new(),
        })
    }

    /// Verify, bind and consume the state token. Runs before any back-channel call.
    async fn accept_state(&self, state: &str, parts: &Parts) -> Result<StatePayload, StateError> {
        let payload = self.state_protector.unprotect(state)?;

        if self.config.correlation_cookie {
            let jar = CookieJar::from_headers(&parts.headers);
            let bound = jar
                .get(&self.correlation_cookie_name)
                .is_some_and(|cookie| cookie.value() == payload.correlation_id);
            if !bound {
                return Err(StateError::Protection(
                    "correlation cookie missing or mismatched".to_string(),
                ));
            }
        }

        if !self
            .consumed_states
            .consume(&payload.correlation_id, payload.expires_at)
            .await
        {
            return Err(StateError::Replayed);
        }

        Ok(payload)
    }

    fn correlation_removal_cookie(&self) -> Option<HeaderValue> {
        let mut cookie = Cookie::build((self.correlation_cookie_name.clone(), ""))
            .path(self.config.callback_path.clone())
            .http_only(true)
            .same_site(SameSite::Lax)
            .build();
        cookie.make_removal();
        HeaderValue::from_str(&cookie.to_string()).ok()
    }

    fn request_origin(&self, parts: &Parts) -> Option<RequestOrigin> {
        let forwarded = |name: &str| {
            if !self.config.trust_forwarded_headers {
                return None;
            }
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let scheme = forwarded("x-forwarded-proto")
            .or_else(|| parts.uri.scheme_str().map(str::to_string))
            .unwrap_or_else(|| "http".to_string())
            .to_ascii_lowercase();
        if scheme != "http" && scheme != "https" {
            return None;
        }

        let authority = forwarded("x-forwarded-host")
            .or_else(|| parts.uri.authority().map(|a| a.as_str().to_string()))
            .or_else(|| {
                parts
                    .headers
                    .get(http::header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            })?;

        // Reject anything that is not a bare host[:port]
        let parsed: Authority = authority.parse().ok()?;
        if parsed.as_str().contains('@') {
            return None;
        }

        Some(RequestOrigin {
            scheme,
            authority: parsed.as_str().to_ascii_lowercase(),
        })
    }

    fn build_redirect_uri(&self, origin: &RequestOrigin) -> String {
        format!("{}{}", origin.base(), self.config.callback_path)
    }

    fn sanitize_redirect_target(&self, target: &str, origin: &RequestOrigin) -> String {
        let local_path = target.starts_with('/')
            && !target.starts_with("//")
            && !target.starts_with("/\\")
            && !target.chars().any(char::is_control);
        if local_path {
            return target.to_string();
        }

        if let Some(url) = Url::parse(target).ok().filter(|url| origin.same_origin(url)) {
            return url.to_string();
        }

        warn!(
            authentication_type = %self.config.authentication_type,
            "Discarding off-site redirect target"
        );
        "/".to_string()
    }

    fn log_failure(&self, failure: &HandshakeFailure) {
        warn!(
            authentication_type = %self.config.authentication_type,
            kind = %failure.kind,
            stage = ?failure.stage,
            reason = %failure.reason,
            "OAuth2 handshake failed"
        );
    }
}

fn parse_endpoint(name: &str, value: &str) -> OAuth2Result<Url> {
    let url = Url::parse(value).map_err(|e| {
        OAuth2Error::Configuration(format!("'{}' is not a valid URL: {}", name, e))
    })?;
    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(OAuth2Error::Configuration(format!(
            "'{}' must use http or https",
            name
        )));
    }
    Ok(url)
}
