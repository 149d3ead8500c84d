//! OAuth2 authorization-code bridge to the Discord identity API.
//!
//! Stateless: every callback exchanges its code and fetches the profile in
//! one go. Nothing is stored between requests.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::config::OAuthConfig;
use crate::types::{Connection, PartialGuild, TokenResponse, User};

/// Scopes requested on `/login`.
pub const SCOPES: &str = "identify connections guilds";

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("No code provided")]
    MissingCode,
    /// The provider redirected back with `?error=`.
    #[error("Authorization failed: {description}")]
    Denied { error: String, description: String },
    #[error("{step} failed with {status}: {body}")]
    Provider {
        step: &'static str,
        status: StatusCode,
        body: String,
    },
    #[error("{step} returned an unexpected body: {reason}")]
    Decode { step: &'static str, reason: String },
    #[error("request to identity provider failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid identity provider URL: {0}")]
    Url(#[from] url::ParseError),
}

impl OAuthError {
    /// Whether the failure is the caller's (or the provider rejecting the
    /// caller's input) rather than ours.
    pub fn is_client_error(&self) -> bool {
        match self {
            OAuthError::MissingCode | OAuthError::Denied { .. } => true,
            OAuthError::Provider { status, .. } => status.is_client_error(),
            _ => false,
        }
    }
}

/// Everything the callback page shows.
#[derive(Debug, Clone)]
pub struct AuthorizedProfile {
    pub user: User,
    pub connections: Vec<Connection>,
    pub guilds: Vec<PartialGuild>,
}

#[derive(Debug, Clone)]
pub struct IdentityClient {
    http: reqwest::Client,
    api_base: String,
    oauth: OAuthConfig,
}

impl IdentityClient {
    pub fn new(http: reqwest::Client, api_base: impl Into<String>, oauth: OAuthConfig) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            oauth,
        }
    }

    /// Where `/login` sends the browser.
    pub fn authorize_url(&self) -> Result<Url, OAuthError> {
        let url = Url::parse_with_params(
            &format!("{}/oauth2/authorize", self.api_base),
            &[
                ("client_id", self.oauth.client_id.as_str()),
                ("redirect_uri", self.oauth.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", SCOPES),
            ],
        )?;
        Ok(url)
    }

    pub async fn exchange_code(&self, code: &str) -> Result<TokenResponse, OAuthError> {
        let form = [
            ("client_id", self.oauth.client_id.as_str()),
            ("client_secret", self.oauth.client_secret.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.oauth.redirect_uri.as_str()),
        ];
        let resp = self
            .http
            .post(format!("{}/oauth2/token", self.api_base))
            .form(&form)
            .send()
            .await?;
        read_json("token exchange", resp).await
    }

    pub async fn user(&self, access_token: &str) -> Result<User, OAuthError> {
        self.get("user lookup", "/users/@me", access_token).await
    }

    pub async fn connections(&self, access_token: &str) -> Result<Vec<Connection>, OAuthError> {
        self.get("connections lookup", "/users/@me/connections", access_token)
            .await
    }

    pub async fn guilds(&self, access_token: &str) -> Result<Vec<PartialGuild>, OAuthError> {
        self.get("guilds lookup", "/users/@me/guilds", access_token)
            .await
    }

    /// Exchange `code` and fetch the user, their connections and guilds.
    pub async fn authorize(&self, code: &str) -> Result<AuthorizedProfile, OAuthError> {
        let token = self.exchange_code(code).await?;
        debug!(scope = %token.scope, expires_in = token.expires_in, "code exchanged");

        let (user, connections, guilds) = tokio::try_join!(
            self.user(&token.access_token),
            self.connections(&token.access_token),
            self.guilds(&token.access_token),
        )?;
        Ok(AuthorizedProfile {
            user,
            connections,
            guilds,
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        step: &'static str,
        path: &str,
        access_token: &str,
    ) -> Result<T, OAuthError> {
        let resp = self
            .http
            .get(format!("{}{}", self.api_base, path))
            .bearer_auth(access_token)
            .send()
            .await?;
        read_json(step, resp).await
    }
}

async fn read_json<T: DeserializeOwned>(
    step: &'static str,
    resp: reqwest::Response,
) -> Result<T, OAuthError> {
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(OAuthError::Provider { step, status, body });
    }
    serde_json::from_str(&body).map_err(|e| OAuthError::Decode {
        step,
        reason: e.to_string(),
    })
}
