//! GitHub webhook ingress: POST /webhook/github.
//!
//! A push to a branch moves the stored `commit_sha` of every active record
//! that was registered from that repository and branch.

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    Json,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{info, warn};

use super::error::ApiError;
use crate::app::AppState;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
struct PushEvent {
    #[serde(rename = "ref")]
    git_ref: String,
    after: String,
    repository: PushRepository,
}

#[derive(Debug, Deserialize)]
struct PushRepository {
    clone_url: Option<String>,
    html_url: Option<String>,
    full_name: Option<String>,
}

impl PushRepository {
    fn names(self) -> Vec<String> {
        [self.clone_url, self.html_url, self.full_name]
            .into_iter()
            .flatten()
            .collect()
    }
}

/// POST /webhook/github
///
/// 500 without a configured secret, 401 on a bad signature, 400 on a
/// malformed push payload. Events other than `push` are acknowledged.
pub async fn github_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let secret = state
        .config
        .webhook
        .secret
        .as_deref()
        .ok_or_else(|| ApiError::internal("Webhook secret not configured"))?;

    if let Err(reason) = verify_signature(&headers, &body, secret) {
        warn!(reason = %reason, "webhook authentication failed");
        return Err(ApiError::unauthorized("Invalid signature"));
    }

    let event = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("push");
    if event != "push" {
        info!(event, "ignoring non-push webhook event");
        return Ok(Json(json!({"status": "success", "updated": 0})));
    }

    let push: PushEvent = serde_json::from_slice(&body).map_err(|e| {
        warn!(error = %e, "invalid push payload");
        ApiError::bad_request(format!("Invalid push payload: {e}"))
    })?;

    let Some(branch) = push.git_ref.strip_prefix("refs/heads/") else {
        info!(git_ref = %push.git_ref, "ignoring push to a non-branch ref");
        return Ok(Json(json!({"status": "success", "updated": 0})));
    };

    let names = push.repository.names();
    let updated = state.registry.update_commit(&names, branch, &push.after)?;
    info!(branch, commit = %push.after, updated, "push webhook processed");
    Ok(Json(json!({"status": "success", "updated": updated})))
}

/// Verify GitHub-style HMAC-SHA256: `sha256=<hex>` in X-Hub-Signature-256.
fn verify_signature(headers: &HeaderMap, body: &[u8], secret: &str) -> Result<(), String> {
    let sig_header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| "missing X-Hub-Signature-256 header".to_string())?;

    let sig_hex = sig_header
        .strip_prefix("sha256=")
        .ok_or_else(|| "malformed X-Hub-Signature-256 header".to_string())?;

    let expected =
        hex::decode(sig_hex).map_err(|_| "X-Hub-Signature-256 is not valid hex".to_string())?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| "invalid HMAC key length".to_string())?;
    mac.update(body);

    mac.verify_slice(&expected)
        .map_err(|_| "HMAC signature mismatch".to_string())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use scriptstore_core::{Identity, SourceMetadata};
    use scriptstore_registry::RegistrationRequest;

    use super::*;
    use crate::app::tests::{send, test_app, SECRET};

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn webhook(body: &str, signature: &str, event: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/webhook/github")
            .header("content-type", "application/json")
            .header("x-hub-signature-256", signature)
            .header("x-github-event", event)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn push_payload(branch: &str, sha: &str) -> String {
        json!({
            "ref": format!("refs/heads/{branch}"),
            "after": sha,
            "repository": {
                "full_name": "org/repo",
                "clone_url": "https://github.com/org/repo.git",
                "html_url": "https://github.com/org/repo",
            },
        })
        .to_string()
    }

    #[test]
    fn signature_round_trip() {
        let body = br#"{"zen":"Keep it logically awesome."}"#;
        let mut headers = HeaderMap::new();
        headers.insert("x-hub-signature-256", sign("s3cret", body).parse().unwrap());
        assert!(verify_signature(&headers, body, "s3cret").is_ok());
        assert!(verify_signature(&headers, body, "other").is_err());
        assert!(verify_signature(&headers, b"tampered", "s3cret").is_err());
    }

    #[test]
    fn signature_requires_prefixed_header() {
        let body = b"{}";
        let mut headers = HeaderMap::new();
        assert!(verify_signature(&headers, body, "s3cret").is_err());

        let bare = sign("s3cret", body).trim_start_matches("sha256=").to_string();
        headers.insert("x-hub-signature-256", bare.parse().unwrap());
        assert!(verify_signature(&headers, body, "s3cret").is_err());
    }

    #[tokio::test]
    async fn push_updates_matching_active_records() {
        let app = test_app();
        for (script, branch) in [("on-main", "main"), ("on-dev", "dev")] {
            app.state
                .registry
                .register_or_update(
                    &Identity::new("etl", script),
                    &RegistrationRequest {
                        cron_expression: None,
                        source: SourceMetadata {
                            repository: Some("org/repo".into()),
                            branch: Some(branch.into()),
                            commit_sha: Some("old".into()),
                        },
                        env_name: None,
                    },
                )
                .unwrap();
        }

        let body = push_payload("main", "new-sha");
        let (status, resp) = send(&app.router, webhook(&body, &sign(SECRET, body.as_bytes()), "push")).await;
        assert_eq!(status, StatusCode::OK, "{resp}");
        assert_eq!(resp["updated"], 1);

        let main = app.state.registry.get_active(&Identity::new("etl", "on-main")).unwrap();
        let dev = app.state.registry.get_active(&Identity::new("etl", "on-dev")).unwrap();
        assert_eq!(main.source.commit_sha.as_deref(), Some("new-sha"));
        assert_eq!(dev.source.commit_sha.as_deref(), Some("old"));
    }

    #[tokio::test]
    async fn bad_signature_is_rejected() {
        let app = test_app();
        let body = push_payload("main", "abc");
        let (status, resp) = send(&app.router, webhook(&body, &sign("wrong", body.as_bytes()), "push")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(resp["detail"], "Invalid signature");
    }

    #[tokio::test]
    async fn malformed_payload_and_other_events() {
        let app = test_app();
        let body = "not json";
        let (status, _) = send(&app.router, webhook(body, &sign(SECRET, body.as_bytes()), "push")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let body = r#"{"zen":"Design for failure."}"#;
        let (status, resp) = send(&app.router, webhook(body, &sign(SECRET, body.as_bytes()), "ping")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resp["updated"], 0);
    }
}
