//! Liveness endpoint and a minimal page showing how to link the device.
//!
//! Served on its own task, so a reconnect storm in the session loop never
//! delays a health check.

use crate::pair_code::PendingPairing;
use crate::session::SessionStatus;
use axum::extract::State;
use axum::response::Html;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{SecondsFormat, Utc};
use log::info;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::watch;

pub const HEALTH_STATUS: &str = "Bot is running";

#[derive(Clone)]
pub struct HealthState {
    pub status: watch::Receiver<SessionStatus>,
    pub qr: watch::Receiver<Option<String>>,
    pub pairing: watch::Receiver<Option<PendingPairing>>,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health_check))
        .with_state(state)
}

/// Binds `0.0.0.0:<port>` and serves until the task is dropped.
pub async fn serve(port: u16, state: HealthState) -> Result<(), anyhow::Error> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    serve_on(listener, state).await
}

pub async fn serve_on(listener: TcpListener, state: HealthState) -> Result<(), anyhow::Error> {
    info!(target: "Health", "Health server listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// GET /health
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": HEALTH_STATUS,
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    }))
}

/// GET /
pub async fn index(State(state): State<HealthState>) -> Html<String> {
    let status = *state.status.borrow();
    let qr = state.qr.borrow().clone();
    let pairing = state
        .pairing
        .borrow()
        .as_ref()
        .and_then(|p| p.code.clone());

    let mut body = format!(
        "<h1>{HEALTH_STATUS}</h1>\n<p>Connection: {} (retries: {})</p>\n",
        escape_html(&status.state.to_string()),
        status.retry_count
    );
    match qr {
        Some(qr) => body.push_str(&format!(
            "<p>Scan this QR code with your phone:</p>\n<pre>{}</pre>\n",
            escape_html(&qr)
        )),
        None => body.push_str("<p>No QR code pending.</p>\n"),
    }
    match pairing {
        Some(code) => body.push_str(&format!(
            "<p>Pairing code: <strong>{}</strong></p>\n",
            escape_html(&code)
        )),
        None => body.push_str("<p>Or enter the pairing code shown in the terminal.</p>\n"),
    }
    Html(body)
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}
