//! Short-lived VCS token vending for runners.
//!
//! A runner inside a sandbox exchanges its task id for a repository-scoped
//! token exactly once per task generation (the store enforces the
//! at-most-once slot; a second request conflicts). Vending itself is an
//! interface: the production issuer speaks the VCS app installation flow,
//! tests use a static issuer, and an unconfigured deployment vends
//! nothing.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

/// A vended token with its expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VcsToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Token vending failures.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// Vending is not configured; the endpoint answers 503.
    #[error("token vending is not configured")]
    Unavailable,

    #[error("failed to read private key: {0}")]
    PrivateKey(String),

    #[error("token exchange failed: {0}")]
    Exchange(String),
}

/// Issues repository-scoped tokens.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(&self, repo_url: &str) -> Result<VcsToken, TokenError>;
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// VCS app credentials. All three parts are required together.
#[derive(Debug, Clone)]
pub struct VcsAppConfig {
    pub app_id: String,
    pub installation_id: String,
    pub private_key_path: PathBuf,
}

impl VcsAppConfig {
    /// Combine optional config parts; `None` unless all three are present.
    pub fn from_parts(
        app_id: Option<String>,
        installation_id: Option<String>,
        private_key_path: Option<String>,
    ) -> Option<Self> {
        match (app_id, installation_id, private_key_path) {
            (Some(app_id), Some(installation_id), Some(path)) => Some(Self {
                app_id,
                installation_id,
                private_key_path: PathBuf::from(path),
            }),
            _ => None,
        }
    }
}

/// Build the issuer a deployment should use: the app issuer when
/// credentials are complete, otherwise the disabled issuer.
pub fn issuer_from_config(config: Option<VcsAppConfig>) -> Arc<dyn TokenIssuer> {
    match config {
        Some(config) => Arc::new(AppTokenIssuer::new(config)),
        None => {
            tracing::info!("VCS app credentials absent, token endpoint disabled");
            Arc::new(DisabledIssuer)
        }
    }
}

// ---------------------------------------------------------------------------
// Issuers
// ---------------------------------------------------------------------------

/// Issuer used when no credentials are configured.
pub struct DisabledIssuer;

#[async_trait]
impl TokenIssuer for DisabledIssuer {
    async fn issue(&self, _repo_url: &str) -> Result<VcsToken, TokenError> {
        Err(TokenError::Unavailable)
    }
}

/// Fixed-token issuer for tests.
pub struct StaticIssuer {
    token: String,
    ttl: Duration,
}

impl StaticIssuer {
    pub fn new(token: impl Into<String>, ttl: Duration) -> Self {
        Self {
            token: token.into(),
            ttl,
        }
    }
}

#[async_trait]
impl TokenIssuer for StaticIssuer {
    async fn issue(&self, _repo_url: &str) -> Result<VcsToken, TokenError> {
        Ok(VcsToken {
            token: self.token.clone(),
            expires_at: Utc::now() + chrono::Duration::from_std(self.ttl).unwrap_or_default(),
        })
    }
}

/// Production issuer: signs a short app JWT with the private key and
/// exchanges it for an installation access token scoped to the target
/// repository.
pub struct AppTokenIssuer {
    config: VcsAppConfig,
    api_base: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

#[derive(Serialize)]
struct AccessTokenRequest {
    repositories: Vec<String>,
}

#[derive(Deserialize)]
struct AccessTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

impl AppTokenIssuer {
    pub fn new(config: VcsAppConfig) -> Self {
        Self {
            config,
            api_base: "https://api.github.com".to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Point the issuer at a different API base (tests, GHE).
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    fn app_jwt(&self) -> Result<String, TokenError> {
        let key_pem = std::fs::read(&self.config.private_key_path)
            .map_err(|e| TokenError::PrivateKey(e.to_string()))?;
        let key = EncodingKey::from_rsa_pem(&key_pem)
            .map_err(|e| TokenError::PrivateKey(e.to_string()))?;

        let now = Utc::now().timestamp();
        let claims = AppClaims {
            // Backdated one minute to absorb clock skew against the VCS.
            iat: now - 60,
            exp: now + 9 * 60,
            iss: self.config.app_id.clone(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| TokenError::PrivateKey(e.to_string()))
    }
}

#[async_trait]
impl TokenIssuer for AppTokenIssuer {
    async fn issue(&self, repo_url: &str) -> Result<VcsToken, TokenError> {
        let jwt = self.app_jwt()?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base, self.config.installation_id
        );

        let body = AccessTokenRequest {
            repositories: repo_name(repo_url).into_iter().collect(),
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(jwt)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "shepherd")
            .json(&body)
            .send()
            .await
            .map_err(|e| TokenError::Exchange(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TokenError::Exchange(format!("status {}", response.status())));
        }

        let granted: AccessTokenResponse = response
            .json()
            .await
            .map_err(|e| TokenError::Exchange(e.to_string()))?;

        Ok(VcsToken {
            token: granted.token,
            expires_at: granted.expires_at,
        })
    }
}

/// Bare repository name from a clone URL, used to scope the token.
fn repo_name(repo_url: &str) -> Option<String> {
    repo_url
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
