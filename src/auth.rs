//! Pairing and session-token exchange against the server's HTTP API.
//!
//! Pairing is a one-time exchange of a short-lived code for a client id
//! and a long-lived refresh token; the refresh token is then traded for a
//! short-lived session token before every WebSocket attempt.

use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde::Deserialize;
use tracing::debug;

use crate::transport::TokenProvider;
use crate::{AppError, Result};

/// HTTP timeout for pairing and session calls.
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Credentials returned by a successful pairing exchange.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairedCredentials {
    /// Server-assigned client identity.
    pub client_id: String,
    /// Long-lived token for session-token exchange.
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    session_token: String,
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|err| AppError::Pairing(err.to_string()))
}

/// Exchange a pairing code for client credentials.
///
/// # Errors
///
/// Returns `AppError::Pairing` when the request fails, the server rejects
/// the code, or the response body does not parse.
pub async fn pair(server_url: &str, code: &str, label: &str) -> Result<PairedCredentials> {
    let url = format!("{}/api/clients/pair", server_url.trim_end_matches('/'));
    debug!(%url, "pairing with server");

    let response = http_client()?
        .post(&url)
        .json(&serde_json::json!({ "code": code, "label": label }))
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AppError::Pairing(format!(
            "pairing rejected ({status}): {body}"
        )));
    }

    let credentials: PairedCredentials = response
        .json()
        .await
        .map_err(|err| AppError::Pairing(format!("malformed pairing response: {err}")))?;
    Ok(credentials)
}

/// Trade the refresh token for a short-lived session token.
///
/// # Errors
///
/// Returns `AppError::Pairing` on transport failure, rejection, or a
/// malformed response.
pub async fn fetch_session_token(server_url: &str, refresh_token: &str) -> Result<String> {
    let url = format!("{}/api/clients/session", server_url.trim_end_matches('/'));

    let response = http_client()?
        .post(&url)
        .bearer_auth(refresh_token)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(AppError::Pairing(format!(
            "session token refused ({status})"
        )));
    }

    let session: SessionResponse = response
        .json()
        .await
        .map_err(|err| AppError::Pairing(format!("malformed session response: {err}")))?;
    Ok(session.session_token)
}

/// Build the transport's token provider from stored credentials.
///
/// Every invocation performs a fresh session exchange; session tokens are
/// too short-lived to cache across reconnects.
#[must_use]
pub fn token_provider(server_url: String, refresh_token: String) -> TokenProvider {
    Arc::new(move || {
        let server_url = server_url.clone();
        let refresh_token = refresh_token.clone();
        async move { fetch_session_token(&server_url, &refresh_token).await }.boxed()
    })
}
