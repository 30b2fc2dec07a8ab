//! Claims, identities and the authentication ticket handed to the host.

use crate::config::ClaimMapping;
use crate::types::IdentityResponse;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Well-known claim types.
pub mod claim_types {
    pub const SUBJECT: &str = "subject";
    pub const NAME: &str = "name";
    pub const EMAIL: &str = "email";
}

pub mod value_types {
    pub const STRING: &str = "string";
    pub const INTEGER: &str = "integer";
    pub const DOUBLE: &str = "double";
    pub const BOOLEAN: &str = "boolean";
    pub const JSON: &str = "json";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub claim_type: String,
    pub value: String,
    pub value_type: String,
    pub issuer: String,
}

impl Claim {
    pub fn new(
        claim_type: impl Into<String>,
        value: impl Into<String>,
        issuer: impl Into<String>,
    ) -> Self {
        Self {
            claim_type: claim_type.into(),
            value: value.into(),
            value_type: value_types::STRING.to_string(),
            issuer: issuer.into(),
        }
    }

    /// Convert a JSON profile value. Nulls yield no claim.
    fn from_json(
        claim_type: impl Into<String>,
        value: &serde_json::Value,
        issuer: &str,
    ) -> Option<Self> {
        let (value, value_type) = match value {
            serde_json::Value::Null => return None,
            serde_json::Value::String(s) => (s.clone(), value_types::STRING),
            serde_json::Value::Bool(b) => (b.to_string(), value_types::BOOLEAN),
            serde_json::Value::Number(n) if n.is_f64() => (n.to_string(), value_types::DOUBLE),
            serde_json::Value::Number(n) => (n.to_string(), value_types::INTEGER),
            other => (other.to_string(), value_types::JSON),
        };

        Some(Self {
            claim_type: claim_type.into(),
            value,
            value_type: value_type.to_string(),
            issuer: issuer.to_string(),
        })
    }
}

/// A set of claims issued under one authentication type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimsIdentity {
    pub authentication_type: String,
    pub claims: Vec<Claim>,
}

impl ClaimsIdentity {
    pub fn new(authentication_type: impl Into<String>) -> Self {
        Self {
            authentication_type: authentication_type.into(),
            claims: Vec::new(),
        }
    }

    pub fn add_claim(&mut self, claim: Claim) {
        self.claims.push(claim);
    }

    pub fn find_first(&self, claim_type: &str) -> Option<&Claim> {
        self.claims.iter().find(|c| c.claim_type == claim_type)
    }

    pub fn value_of(&self, claim_type: &str) -> Option<&str> {
        self.find_first(claim_type).map(|c| c.value.as_str())
    }

    pub fn subject(&self) -> Option<&str> {
        self.value_of(claim_types::SUBJECT)
    }

    pub fn name(&self) -> Option<&str> {
        self.value_of(claim_types::NAME)
    }

    pub fn remove_claims(&mut self, claim_type: &str) {
        self.claims.retain(|c| c.claim_type != claim_type);
    }
}

/// Properties that travel with an attempt inside the protected state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationProperties {
    /// Where to send the user once signed in
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub items: BTreeMap<String, String>,
}

impl AuthenticationProperties {
    pub fn with_redirect_uri(redirect_uri: impl Into<String>) -> Self {
        Self {
            redirect_uri: Some(redirect_uri.into()),
            items: BTreeMap::new(),
        }
    }
}

/// Output of a completed handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationTicket {
    pub identity: ClaimsIdentity,
    pub properties: AuthenticationProperties,
}

/// Null and blank string values never name a subject.
fn is_subject_candidate(value: &serde_json::Value) -> bool {
    !value.is_null() && value.as_str().is_none_or(|s| !s.trim().is_empty())
}

impl ClaimMapping {
    /// Default claims derivation: well-known fields become standard claims,
    /// the rest are kept under `urn:<provider>:<field>`.
    pub fn map(&self, profile: &IdentityResponse, authentication_type: &str) -> ClaimsIdentity {
        let issuer = authentication_type;
        let mut identity = ClaimsIdentity::new(authentication_type);

        let subject_field = self
            .subject_fields
            .iter()
            .find(|field| profile.get(field).is_some_and(is_subject_candidate));

        if let Some(claim) = subject_field
            .and_then(|field| profile.get(field))
            .and_then(|v| Claim::from_json(claim_types::SUBJECT, v, issuer))
        {
            identity.add_claim(claim);
        }

        if let Some(claim) = profile
            .get(&self.name_field)
            .and_then(|v| Claim::from_json(claim_types::NAME, v, issuer))
        {
            identity.add_claim(claim);
        }

        if let Some(claim) = profile
            .get(&self.email_field)
            .and_then(|v| Claim::from_json(claim_types::EMAIL, v, issuer))
        {
            identity.add_claim(claim);
        }

        let prefix = format!("urn:{}", authentication_type.to_lowercase());
        for (field, value) in profile.fields() {
            let well_known = Some(field) == subject_field
                || *field == self.name_field
                || *field == self.email_field;
            if well_known {
                continue;
            }
            if let Some(claim) = Claim::from_json(format!("{}:{}", prefix, field), value, issuer) {
                identity.add_claim(claim);
            }
        }

        identity
    }
}
