//! `POST /webhook`: GitHub delivery intake.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, info, warn};
use warden_core::{ChangeNotification, RepoRef};

use crate::{ApiError, AppState};

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const EVENT_HEADER: &str = "x-github-event";
const DELIVERY_HEADER: &str = "x-github-delivery";

type HmacSha256 = Hmac<Sha256>;

/// The subset of a `pull_request` delivery the pipeline needs.
///
/// Everything is optional so that a well-formed but incomplete payload reaches
/// submission and is rejected there as an invalid event.
#[derive(Debug, Deserialize)]
pub struct PullRequestEvent {
    #[serde(default)]
    pub action: String,
    pub pull_request: Option<PullRequest>,
    pub repository: Option<Repository>,
}

#[derive(Debug, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    /// API URL of the pull request.
    #[serde(default)]
    pub url: String,
    pub head: Option<Head>,
}

#[derive(Debug, Deserialize)]
pub struct Head {
    pub sha: String,
}

#[derive(Debug, Deserialize)]
pub struct Repository {
    pub name: String,
    pub owner: Owner,
}

#[derive(Debug, Deserialize)]
pub struct Owner {
    pub login: String,
}

impl PullRequestEvent {
    pub fn into_notification(self) -> ChangeNotification {
        let repository = self
            .repository
            .map(|r| RepoRef::new(r.owner.login, r.name))
            .unwrap_or_else(|| RepoRef::new("", ""));
        let (number, url, head_sha) = match self.pull_request {
            Some(pr) => (pr.number, pr.url, pr.head.map(|h| h.sha)),
            None => (0, String::new(), None),
        };
        let mut notification =
            ChangeNotification::pull_request(self.action, repository, number, url);
        notification.head_sha = head_sha;
        notification
    }
}

/// Check a `sha256=<hex>` signature over `payload` in constant time.
pub fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Some(hex_digest) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

pub async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let delivery = header(DELIVERY_HEADER).unwrap_or("-");

    if let Some(secret) = &state.webhook_secret {
        let valid = header(SIGNATURE_HEADER)
            .is_some_and(|signature| verify_signature(secret, &body, signature));
        if !valid {
            warn!(delivery, "webhook signature rejected");
            return Err(ApiError::new(StatusCode::UNAUTHORIZED, "invalid signature"));
        }
    }

    let event = header(EVENT_HEADER).unwrap_or_default();
    if event != "pull_request" {
        debug!(delivery, event, "ignoring webhook event");
        return Ok(ignored(format!("event '{event}' is not reviewed")));
    }

    let payload: PullRequestEvent = serde_json::from_slice(&body).map_err(|e| {
        warn!(delivery, error = %e, "malformed pull_request payload");
        ApiError::new(StatusCode::BAD_REQUEST, format!("malformed payload: {e}"))
    })?;

    let notification = payload.into_notification();
    if !notification.is_review_trigger() {
        debug!(delivery, action = %notification.action, "ignoring pull_request action");
        return Ok(ignored(format!(
            "action '{}' is not reviewed",
            notification.action
        )));
    }

    let handle = state.orchestrator.submit(notification).await?;
    info!(delivery, job_key = handle.key().short(), "webhook accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "status": "accepted",
            "jobKey": handle.key(),
        })),
    )
        .into_response())
}

fn ignored(reason: String) -> Response {
    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "ignored", "reason": reason })),
    )
        .into_response()
}
