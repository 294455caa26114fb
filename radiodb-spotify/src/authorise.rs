//! One-shot interactive authorisation.
//!
//! Runs the OAuth authorisation-code flow against a local callback server
//! and returns the resulting token encoded the way `spotify.auth_seed`
//! expects it, for the operator to paste into their configuration.

use crate::auth::encode_seed;
use crate::{playlist_scopes, SpotifyError};
use axum::{extract::Query, response::Html, routing::get, Router};
use radiodb_core::SpotifyConfig;
use rspotify::prelude::OAuthClient;
use rspotify::{AuthCodeSpotify, Credentials, OAuth};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// How long to wait for the operator to complete the flow in the browser.
const CALLBACK_TIMEOUT_SECS: u64 = 600;

/// Run the flow and return the base64 seed.
///
/// # Errors
///
/// Returns an error if the callback server cannot start, the flow times out,
/// or the token exchange fails.
pub async fn run(config: &SpotifyConfig) -> Result<String, SpotifyError> {
    let creds = Credentials::new(&config.client_id, &config.client_secret);
    let oauth = OAuth {
        redirect_uri: config.redirect_uri.clone(),
        scopes: playlist_scopes(),
        ..Default::default()
    };
    let client = AuthCodeSpotify::new(creds, oauth);

    let (host, port, callback_path) = parse_redirect_uri(&config.redirect_uri)?;

    let (tx, rx) = oneshot::channel::<String>();
    let tx = Arc::new(tokio::sync::Mutex::new(Some(tx)));
    let app = Router::new().route(
        &callback_path,
        get(move |Query(params): Query<CallbackParams>| {
            let tx = Arc::clone(&tx);
            async move { handle_callback(params, tx).await }
        }),
    );

    let addr: SocketAddr = format!(
        "{}:{port}",
        if host == "localhost" { "127.0.0.1" } else { &host }
    )
    .parse()
    .map_err(|err| SpotifyError::AuthFailed {
        reason: format!("Invalid redirect address: {err}"),
    })?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| SpotifyError::AuthFailed {
            reason: format!("Failed to bind {addr}: {err}"),
        })?;
    info!("Waiting for the authorisation callback on http://{addr}{callback_path}");

    let auth_url = client
        .get_authorize_url(false)
        .map_err(|err| SpotifyError::AuthFailed {
            reason: format!("Failed to build authorisation URL: {err}"),
        })?;
    if let Err(err) = open::that(&auth_url) {
        warn!("Could not open a browser automatically: {err}");
        info!("Open this URL to authorise:\n{auth_url}");
    }

    let code = wait_for_code(rx, listener, app).await?;
    info!("Received authorisation code, exchanging for a token");
    client
        .request_token(&code)
        .await
        .map_err(|err| SpotifyError::AuthFailed {
            reason: format!("Token exchange failed: {err}"),
        })?;

    let guard = client
        .token
        .lock()
        .await
        .map_err(|_| SpotifyError::AuthFailed {
            reason: "Failed to acquire token lock".to_string(),
        })?;
    let token = guard.as_ref().ok_or_else(|| SpotifyError::AuthFailed {
        reason: "Token exchange produced no token".to_string(),
    })?;
    encode_seed(token)
}

async fn wait_for_code(
    rx: oneshot::Receiver<String>,
    listener: tokio::net::TcpListener,
    app: Router,
) -> Result<String, SpotifyError> {
    let server = axum::serve(listener, app);
    tokio::select! {
        result = rx => result.map_err(|_| SpotifyError::AuthFailed {
            reason: "Callback channel closed unexpectedly".to_string(),
        }),
        _ = server => Err(SpotifyError::AuthFailed {
            reason: "Callback server stopped unexpectedly".to_string(),
        }),
        () = tokio::time::sleep(Duration::from_secs(CALLBACK_TIMEOUT_SECS)) => {
            Err(SpotifyError::AuthFailed {
                reason: "Timed out waiting for the authorisation callback".to_string(),
            })
        }
    }
}

async fn handle_callback(
    params: CallbackParams,
    tx: Arc<tokio::sync::Mutex<Option<oneshot::Sender<String>>>>,
) -> Html<&'static str> {
    if let Some(code) = params.code {
        if let Some(sender) = tx.lock().await.take() {
            let _ = sender.send(code);
        }
        Html(SUCCESS_HTML)
    } else {
        warn!(
            "Authorisation callback carried no code (error: {:?})",
            params.error
        );
        Html(FAILURE_HTML)
    }
}

fn parse_redirect_uri(redirect_uri: &str) -> Result<(String, u16, String), SpotifyError> {
    let parsed = url::Url::parse(redirect_uri).map_err(|err| SpotifyError::AuthFailed {
        reason: format!("Invalid redirect URI: {err}"),
    })?;
    let host = parsed.host_str().unwrap_or("localhost").to_string();
    let port = parsed.port().unwrap_or(8888);
    let path = match parsed.path() {
        "" => "/".to_string(),
        path => path.to_string(),
    };
    Ok((host, port, path))
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    error: Option<String>,
}

const SUCCESS_HTML: &str = "<!DOCTYPE html>\
<html><head><title>Authorised</title></head>\
<body style=\"font-family: sans-serif; text-align: center; padding: 50px;\">\
<h1>Authorised</h1>\
<p>radio-db is now connected to Spotify. You can close this window; \
the seed is printed on the terminal.</p>\
</body></html>";

const FAILURE_HTML: &str = "<!DOCTYPE html>\
<html><head><title>Authorisation failed</title></head>\
<body style=\"font-family: sans-serif; text-align: center; padding: 50px;\">\
<h1>Authorisation failed</h1>\
<p>No authorisation code was received. Close this window and try again.</p>\
</body></html>";
