//! Identity-provider token verification.
//!
//! The gateway trusts an external identity provider: clients present a bearer
//! token minted by it, and [`TokenVerifier`] checks the signature and expiry
//! against the provider's service-account credentials. Credentials are
//! resolved once per process, in order: a service-account file, inline
//! service-account JSON, or the `IDENTITY_JWT_SECRET` default credentials.
//!
//! A verified token yields a [`Principal`], the stable identity every
//! downstream stage (authorization, rate limiting, logging) keys on. A
//! principal with no email is an anonymous session.

use anyhow::Context;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;

use crate::config::IdentityConfig;

/// The authenticated caller. Created at request ingress, immutable for the
/// request lifetime.
#[derive(Debug, Clone)]
pub struct Principal {
    pub uid: String,
    pub anonymous: bool,
    pub email: Option<String>,
}

impl Principal {
    /// Rate-limit bucket key for this principal.
    pub fn bucket_key(&self) -> String {
        if self.anonymous {
            format!("anon:{}", self.uid)
        } else {
            format!("user:{}", self.uid)
        }
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("user not found")]
    UnknownUser,
}

/// Claims the identity provider embeds in its tokens.
///
/// `exp` is validated by the JWT library; extra claims are ignored.
#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: String,
    #[serde(default)]
    email: Option<String>,
}

/// Service-account credential document.
///
/// Carries either an RSA public key (provider-signed RS256 tokens) or a
/// shared secret (HS256).
#[derive(Debug, Deserialize)]
struct ServiceAccount {
    #[serde(default)]
    public_key: Option<String>,
    #[serde(default)]
    secret: Option<String>,
}

/// Verifies identity-provider bearer tokens.
pub struct TokenVerifier {
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    /// Build a verifier from the configured credential source.
    ///
    /// # Errors
    /// Returns an error when no credential source is configured or the
    /// configured source cannot be read/parsed. Callers treat this as an
    /// internal failure and the request chain short-circuits with a 500.
    pub fn from_config(cfg: &IdentityConfig) -> anyhow::Result<Self> {
        if let Some(path) = &cfg.credentials_file {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading identity credentials {}", path.display()))?;
            return Self::from_service_account(&raw);
        }
        if let Some(raw) = &cfg.credentials_json {
            return Self::from_service_account(raw);
        }
        if let Some(secret) = std::env::var("IDENTITY_JWT_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
        {
            return Ok(Self::hs256(secret.as_bytes()));
        }
        anyhow::bail!(
            "no identity credentials configured \
             (set IDENTITY_CREDENTIALS_FILE, IDENTITY_CREDENTIALS_JSON, or IDENTITY_JWT_SECRET)"
        )
    }

    fn from_service_account(raw: &str) -> anyhow::Result<Self> {
        let account: ServiceAccount =
            serde_json::from_str(raw).context("parsing identity service-account JSON")?;

        if let Some(pem) = &account.public_key {
            let decoding = DecodingKey::from_rsa_pem(pem.as_bytes())
                .context("parsing identity public key PEM")?;
            return Ok(Self {
                decoding,
                validation: Validation::new(Algorithm::RS256),
            });
        }
        if let Some(secret) = &account.secret {
            return Ok(Self::hs256(secret.as_bytes()));
        }
        anyhow::bail!("identity service account has neither `public_key` nor `secret`")
    }

    fn hs256(secret: &[u8]) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Verify a bearer token and produce its [`Principal`].
    pub fn verify(&self, token: &str) -> Result<Principal, IdentityError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|_| IdentityError::InvalidToken)?;

        if data.claims.sub.is_empty() {
            return Err(IdentityError::UnknownUser);
        }

        let email = data.claims.email.filter(|e| !e.is_empty());
        Ok(Principal {
            uid: data.claims.sub,
            anonymous: email.is_none(),
            email,
        })
    }
}
