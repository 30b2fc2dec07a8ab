//! JWT cookie sessions for the demo.

use async_trait::async_trait;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use http::{HeaderMap, HeaderValue, header};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use ras_oauth2_signin::{AuthenticationTicket, SignIn, SignInError};
use serde::{Deserialize, Serialize};

pub const SESSION_COOKIE: &str = "demo_session";
pub const SESSION_SCHEME: &str = "DemoJwtCookie";

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub name: Option<String>,
    pub email: Option<String>,
    /// Scheme the ticket was signed in under
    pub amr: String,
    pub exp: i64,
    pub iat: i64,
}

pub struct JwtCookieSignIn {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl: chrono::Duration,
}

impl JwtCookieSignIn {
    pub fn new(secret: &str, ttl: chrono::Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        }
    }

    /// Claims of the current session, if the request carries a valid one
    pub fn current(&self, jar: &CookieJar) -> Option<SessionClaims> {
        let cookie = jar.get(SESSION_COOKIE)?;
        decode::<SessionClaims>(cookie.value(), &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .ok()
    }

    pub fn removal_cookie() -> Cookie<'static> {
        let mut cookie = Cookie::build((SESSION_COOKIE, "")).path("/").build();
        cookie.make_removal();
        cookie
    }
}

#[async_trait]
impl SignIn for JwtCookieSignIn {
    fn default_authentication_type(&self) -> &str {
        SESSION_SCHEME
    }

    async fn sign_in(
        &self,
        authentication_type: &str,
        ticket: &AuthenticationTicket,
    ) -> Result<HeaderMap, SignInError> {
        if authentication_type != SESSION_SCHEME {
            return Err(SignInError::UnknownScheme(authentication_type.to_string()));
        }

        let subject = ticket
            .identity
            .subject()
            .ok_or_else(|| SignInError::Failed("ticket has no subject".to_string()))?;

        let now = chrono::Utc::now();
        let claims = SessionClaims {
            sub: subject.to_string(),
            name: ticket.identity.name().map(str::to_string),
            email: ticket.identity.value_of("email").map(str::to_string),
            amr: authentication_type.to_string(),
            exp: (now + self.ttl).timestamp(),
            iat: now.timestamp(),
        };

        let token = encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| SignInError::Failed(format!("failed to issue session token: {}", e)))?;

        let cookie = Cookie::build((SESSION_COOKIE, token))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .build();
        let value = HeaderValue::from_str(&cookie.to_string())
            .map_err(|e| SignInError::Failed(e.to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(header::SET_COOKIE, value);
        Ok(headers)
    }
}
