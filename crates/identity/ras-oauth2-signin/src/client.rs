//! Back-channel client for the token exchange and profile fetch.

use crate::error::BackchannelError;
use crate::types::{IdentityResponse, TokenResponse};
use reqwest::{Client, Response, header};
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Server-to-server client restricted to the two calls of the code grant.
///
/// Every request carries `timeout`, whatever the underlying client was built
/// with. Cheap to clone; clones share one connection pool.
#[derive(Clone)]
pub struct BackchannelClient {
    http_client: Client,
    client_id: String,
    client_secret: String,
    token_endpoint: String,
    userinfo_endpoint: String,
    max_response_bytes: usize,
    timeout: Duration,
}

impl BackchannelClient {
    pub fn new(
        http_client: Client,
        client_id: String,
        client_secret: String,
        token_endpoint: String,
        userinfo_endpoint: String,
        max_response_bytes: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            http_client,
            client_id,
            client_secret,
            token_endpoint,
            userinfo_endpoint,
            max_response_bytes,
            timeout,
        }
    }

    /// Exchange authorization code for an access token.
    ///
    /// `redirect_uri` must be the exact value sent with the authorization
    /// request; the provider rejects mismatches.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, BackchannelError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];

        let started = Instant::now();
        let response = self
            .http_client
            .post(&self.token_endpoint)
            .timeout(self.timeout)
            .header(header::ACCEPT, "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| self.request_failed(&self.token_endpoint, e, started))?;

        let token_response: TokenResponse = self
            .read_json(&self.token_endpoint, response, started)
            .await?;

        if token_response.access_token.trim().is_empty() {
            return Err(BackchannelError::Malformed {
                endpoint: self.token_endpoint.clone(),
                reason: "empty access_token".to_string(),
            });
        }

        info!(
            endpoint = %self.token_endpoint,
            token_type = token_response.token_type(),
            expires_in = ?token_response.expires_in,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Exchanged authorization code for access token"
        );
        Ok(token_response)
    }

    /// Get the user's profile using the access token
    pub async fn fetch_profile(
        &self,
        access_token: &str,
    ) -> Result<IdentityResponse, BackchannelError> {
        let started = Instant::now();
        let response = self
            .http_client
            .get(&self.userinfo_endpoint)
            .timeout(self.timeout)
            .header(header::ACCEPT, "application/json")
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| self.request_failed(&self.userinfo_endpoint, e, started))?;

        let profile: IdentityResponse = self
            .read_json(&self.userinfo_endpoint, response, started)
            .await?;

        debug!(
            endpoint = %self.userinfo_endpoint,
            fields = profile.0.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Retrieved user profile"
        );
        Ok(profile)
    }

    fn request_failed(
        &self,
        endpoint: &str,
        err: reqwest::Error,
        started: Instant,
    ) -> BackchannelError {
        // reqwest errors carry the URL only, never the form body or headers
        error!(
            endpoint,
            timeout = err.is_timeout(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Back-channel request failed: {}",
            err
        );
        BackchannelError::from_reqwest(endpoint, err)
    }

    async fn read_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        response: Response,
        started: Instant,
    ) -> Result<T, BackchannelError> {
        let status = response.status();
        let body = self.read_capped(endpoint, response, started).await?;

        if !status.is_success() {
            // Error bodies may echo the code or client id; log size only
            error!(
                endpoint,
                status = status.as_u16(),
                body_bytes = body.len(),
                "Back-channel request returned an error status"
            );
            return Err(BackchannelError::Status {
                endpoint: endpoint.to_string(),
                status,
            });
        }

        serde_json::from_slice(&body).map_err(|e| {
            error!(endpoint, status = status.as_u16(), "Malformed back-channel response: {}", e);
            BackchannelError::Malformed {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// Read the body incrementally, refusing anything past the size cap.
    async fn read_capped(
        &self,
        endpoint: &str,
        mut response: Response,
        started: Instant,
    ) -> Result<Vec<u8>, BackchannelError> {
        let limit = self.max_response_bytes;
        let too_large = || BackchannelError::TooLarge {
            endpoint: endpoint.to_string(),
            limit,
        };

        if response
            .content_length()
            .is_some_and(|len| len > limit as u64)
        {
            error!(endpoint, limit, "Back-channel response declared a body over the cap");
            return Err(too_large());
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| self.request_failed(endpoint, e, started))?
        {
            if body.len() + chunk.len() > limit {
                error!(endpoint, limit, "Back-channel response exceeded the cap");
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body)
    }
}
