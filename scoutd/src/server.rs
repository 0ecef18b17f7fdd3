//! Webhook delivery endpoint.
//!
//! A single POST route accepts deliveries for every configured server; the
//! shared-secret header identifies which one. All rejection happens here,
//! before any discovery logic runs: wrong content type, missing or unknown
//! event header, bad secret, or a malformed payload never reach the sink.

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use scout_common::webhook::{self, EventKind, HookEvent};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

const EVENT_HEADER: &str = "x-gitlab-event";
const TOKEN_HEADER: &str = "x-gitlab-token";

/// Consumes accepted events, tagged with the server they authenticated
/// against.
pub trait EventSink: Send + Sync {
    fn deliver(&self, server: &str, event: HookEvent);
}

/// Default sink: log the event and drop it.
pub struct LoggingSink;

impl EventSink for LoggingSink {
    fn deliver(&self, server: &str, event: HookEvent) {
        info!(server, project = event.project_path(), ?event, "webhook event accepted");
    }
}

/// One server's inbound identity.
pub struct Endpoint {
    pub name: String,
    /// Expected shared secret; `None` accepts unauthenticated deliveries.
    pub secret: Option<String>,
}

struct Inner {
    endpoints: Vec<Endpoint>,
    sink: Box<dyn EventSink>,
}

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    inner: Arc<Inner>,
}

impl HttpState {
    pub fn new(endpoints: Vec<Endpoint>, sink: Box<dyn EventSink>) -> Self {
        Self {
            inner: Arc::new(Inner { endpoints, sink }),
        }
    }
}

/// Create the HTTP router for the webhook endpoint.
pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/hooks/gitlab", post(hook_handler))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn hook_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
    };
    receive(
        &state.inner,
        header_str(header::CONTENT_TYPE.as_str()),
        header_str(EVENT_HEADER),
        header_str(TOKEN_HEADER),
        &body,
    )
}

/// The whole acceptance decision, separated from axum plumbing.
fn receive(
    inner: &Inner,
    content_type: Option<&str>,
    event_header: Option<&str>,
    token: Option<&str>,
    body: &str,
) -> (StatusCode, String) {
    if !content_type.is_some_and(|value| value.starts_with("application/json")) {
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "expected application/json".to_string(),
        );
    }

    let kind = match event_header {
        None => {
            return (
                StatusCode::BAD_REQUEST,
                format!("missing {EVENT_HEADER} header"),
            );
        }
        Some(value) => match EventKind::from_header(value) {
            Some(kind) => kind,
            None => {
                debug!(event = value, "unsupported event type");
                return (
                    StatusCode::BAD_REQUEST,
                    format!("unsupported event type {value:?}"),
                );
            }
        },
    };

    // A delivery authenticates as the first endpoint whose secret it
    // matches; endpoints without a secret accept anything.
    let endpoint = inner.endpoints.iter().find(|endpoint| match &endpoint.secret {
        Some(secret) => token.is_some_and(|token| webhook::token_matches(token, secret)),
        None => true,
    });
    let endpoint = match endpoint {
        Some(endpoint) => endpoint,
        None => {
            warn!("webhook delivery with invalid or missing token");
            return (StatusCode::UNAUTHORIZED, "invalid webhook token".to_string());
        }
    };

    let event = match webhook::parse_event(kind, body) {
        Ok(event) => event,
        Err(err) => {
            debug!(server = endpoint.name, error = %err, "rejecting webhook delivery");
            return (StatusCode::BAD_REQUEST, err.to_string());
        }
    };

    inner.sink.deliver(&endpoint.name, event);
    (StatusCode::OK, "accepted".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink {
        delivered: Mutex<Vec<(String, HookEvent)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                delivered: Mutex::new(Vec::new()),
            })
        }
    }

    impl EventSink for Arc<RecordingSink> {
        fn deliver(&self, server: &str, event: HookEvent) {
            self.delivered
                .lock()
                .unwrap()
                .push((server.to_string(), event));
        }
    }

    const PUSH_BODY: &str = r#"{
        "object_kind": "push",
        "ref": "refs/heads/main",
        "after": "95790bf891e76fee5e1747ab589903a6a1f80f22",
        "project": { "id": 11, "path_with_namespace": "group/project" }
    }"#;

    fn state(sink: Arc<RecordingSink>) -> Inner {
        Inner {
            endpoints: vec![
                Endpoint {
                    name: "main".into(),
                    secret: Some("s3cret".into()),
                },
                Endpoint {
                    name: "staging".into(),
                    secret: Some("other".into()),
                },
            ],
            sink: Box::new(sink),
        }
    }

    #[test]
    fn valid_delivery_reaches_the_sink() {
        let sink = RecordingSink::new();
        let inner = state(sink.clone());
        let (status, _) = receive(
            &inner,
            Some("application/json"),
            Some("Push Hook"),
            Some("s3cret"),
            PUSH_BODY,
        );
        assert_eq!(status, StatusCode::OK);

        let delivered = sink.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, "main");
        assert_eq!(delivered[0].1.project_path(), "group/project");
    }

    #[test]
    fn secret_selects_the_matching_server() {
        let sink = RecordingSink::new();
        let inner = state(sink.clone());
        let (status, _) = receive(
            &inner,
            Some("application/json"),
            Some("Push Hook"),
            Some("other"),
            PUSH_BODY,
        );
        assert_eq!(status, StatusCode::OK);
        assert_eq!(sink.delivered.lock().unwrap()[0].0, "staging");
    }

    #[test]
    fn wrong_secret_is_unauthorized_before_parsing() {
        let sink = RecordingSink::new();
        let inner = state(sink.clone());
        let (status, _) = receive(
            &inner,
            Some("application/json"),
            Some("Push Hook"),
            Some("wrong"),
            "this body is never parsed",
        );
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(sink.delivered.lock().unwrap().is_empty());
    }

    #[test]
    fn missing_token_is_unauthorized_when_secrets_are_configured() {
        let sink = RecordingSink::new();
        let inner = state(sink.clone());
        let (status, _) = receive(
            &inner,
            Some("application/json"),
            Some("Push Hook"),
            None,
            PUSH_BODY,
        );
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn missing_event_header_is_a_bad_request() {
        let sink = RecordingSink::new();
        let inner = state(sink.clone());
        let (status, message) = receive(
            &inner,
            Some("application/json"),
            None,
            Some("s3cret"),
            PUSH_BODY,
        );
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(message.contains(EVENT_HEADER));
    }

    #[test]
    fn unknown_event_type_is_a_bad_request() {
        let sink = RecordingSink::new();
        let inner = state(sink.clone());
        let (status, _) = receive(
            &inner,
            Some("application/json"),
            Some("Pipeline Hook"),
            Some("s3cret"),
            PUSH_BODY,
        );
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(sink.delivered.lock().unwrap().is_empty());
    }

    #[test]
    fn wrong_content_type_is_rejected() {
        let sink = RecordingSink::new();
        let inner = state(sink.clone());
        let (status, _) = receive(
            &inner,
            Some("text/plain"),
            Some("Push Hook"),
            Some("s3cret"),
            PUSH_BODY,
        );
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[test]
    fn malformed_payload_is_a_bad_request() {
        let sink = RecordingSink::new();
        let inner = state(sink.clone());
        let (status, _) = receive(
            &inner,
            Some("application/json"),
            Some("Push Hook"),
            Some("s3cret"),
            "not json",
        );
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(sink.delivered.lock().unwrap().is_empty());
    }

    #[test]
    fn secretless_endpoint_accepts_unauthenticated_deliveries() {
        let sink = RecordingSink::new();
        let inner = Inner {
            endpoints: vec![Endpoint {
                name: "open".into(),
                secret: None,
            }],
            sink: Box::new(sink.clone()),
        };
        let (status, _) = receive(
            &inner,
            Some("application/json"),
            Some("Push Hook"),
            None,
            PUSH_BODY,
        );
        assert_eq!(status, StatusCode::OK);
        assert_eq!(sink.delivered.lock().unwrap()[0].0, "open");
    }
}
