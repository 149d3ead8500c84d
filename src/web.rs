//! Small always-on HTTP surface: health check plus the OAuth2 login bridge.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::oauth::{AuthorizedProfile, IdentityClient, OAuthError};

pub const HEALTH_BODY: &str = "Bot is running!";

pub struct WebState {
    pub identity: IdentityClient,
}

pub fn router(state: Arc<WebState>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/login", get(login))
        .route("/oauth/callback", get(callback))
        .with_state(state)
}

/// Bind `0.0.0.0:port` and serve until the process exits.
pub async fn serve(port: u16, state: Arc<WebState>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web server listening");
    axum::serve(listener, router(state)).await
}

async fn health() -> &'static str {
    HEALTH_BODY
}

async fn login(State(state): State<Arc<WebState>>) -> Result<Response, OAuthError> {
    let url = state.identity.authorize_url()?;
    Ok((StatusCode::FOUND, [(header::LOCATION, url.to_string())]).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

async fn callback(
    State(state): State<Arc<WebState>>,
    Query(params): Query<CallbackParams>,
) -> Result<Html<String>, OAuthError> {
    if let Some(error) = params.error {
        let description = params.error_description.unwrap_or_else(|| error.clone());
        return Err(OAuthError::Denied { error, description });
    }
    let code = params
        .code
        .filter(|c| !c.trim().is_empty())
        .ok_or(OAuthError::MissingCode)?;

    let profile = state.identity.authorize(&code).await?;
    info!(user = %profile.user.tag(), "oauth login completed");
    Ok(Html(render_profile(&profile)))
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let status = if self.is_client_error() {
            warn!(error = %self, "oauth request rejected");
            StatusCode::BAD_REQUEST
        } else {
            error!(error = %self, "oauth request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, self.to_string()).into_response()
    }
}

fn render_profile(profile: &AuthorizedProfile) -> String {
    let mut html = String::from("<!DOCTYPE html><html><head><title>Logged in</title></head><body>");
    html.push_str(&format!(
        "<h1>Welcome, {}!</h1><p>User ID: {}</p>",
        escape(profile.user.display_name()),
        escape(&profile.user.id)
    ));
    if let Some(avatar) = profile.user.avatar_url() {
        html.push_str(&format!(
            "<img src=\"{}\" alt=\"avatar\" width=\"96\">",
            htmlescape::encode_attribute(&avatar)
        ));
    }

    html.push_str("<h2>Connections</h2><ul>");
    for c in &profile.connections {
        html.push_str(&format!(
            "<li>{}: {}{}</li>",
            escape(&c.kind),
            escape(&c.name),
            if c.verified { " (verified)" } else { "" }
        ));
    }
    html.push_str("</ul>");

    html.push_str(&format!("<h2>Servers ({})</h2><ul>", profile.guilds.len()));
    for g in &profile.guilds {
        html.push_str(&format!("<li>{}</li>", escape(&g.name)));
    }
    html.push_str("</ul></body></html>");
    html
}

fn escape(s: &str) -> String {
    htmlescape::encode_minimal(s)
}
