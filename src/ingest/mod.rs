//! Inbound trigger listener.
//!
//! Exposes one `GET` endpoint (`/trigger` by default) taking `userId` and
//! `submissionId` query parameters. Valid requests invoke the [`Workflow`]
//! exactly once; every request gets a JSON response with an explicit length.

use crate::config::IngestConfig;
use crate::state::UserId;
use crate::workflow::{Workflow, WorkflowError};
use axum::Router;
use axum::extract::{RawQuery, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

const USER_ID_PARAM: &str = "userId";
const SUBMISSION_ID_PARAM: &str = "submissionId";

const PROCESSING_FAILED: &str = "An error occurred while processing the request";

/// Sent when the response body itself cannot be encoded.
const FALLBACK_BODY: &str =
    r#"{"success":false,"error":"An error occurred while processing the request"}"#;

/// Caller-correctable problem with a trigger request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Both userId and submissionId are required")]
    MissingParameters,
    #[error("{field} must be a valid numeric value")]
    InvalidNumber { field: &'static str },
}

/// A validated trigger request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestionRequest {
    pub user_id: UserId,
    pub submission_id: i64,
}

impl IngestionRequest {
    /// Parse the raw query string of a trigger request.
    ///
    /// An empty value counts as missing. When a parameter repeats, the first
    /// occurrence wins.
    pub fn from_query(query: Option<&str>) -> Result<Self, ValidationError> {
        let mut user_id = None;
        let mut submission_id = None;
        for (name, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            let slot = match &*name {
                USER_ID_PARAM => &mut user_id,
                SUBMISSION_ID_PARAM => &mut submission_id,
                _ => continue,
            };
            if slot.is_none() && !value.is_empty() {
                *slot = Some(value.into_owned());
            }
        }

        let (Some(user_id), Some(submission_id)) = (user_id, submission_id) else {
            return Err(ValidationError::MissingParameters);
        };

        Ok(Self {
            user_id: user_id.parse().map_err(|_| ValidationError::InvalidNumber {
                field: USER_ID_PARAM,
            })?,
            submission_id: submission_id
                .parse()
                .map_err(|_| ValidationError::InvalidNumber {
                    field: SUBMISSION_ID_PARAM,
                })?,
        })
    }
}

#[derive(Clone)]
struct IngestState {
    workflow: Arc<dyn Workflow>,
}

/// Whether `path` can serve as the trigger route: absolute and free of
/// route pattern syntax.
pub fn is_valid_route_path(path: &str) -> bool {
    path.starts_with('/') && !path.contains(['{', '}', ':', '*'])
}

/// Build the listener's routes.
///
/// `path` serves `GET`; other methods on it, `HEAD` included, get `405`,
/// other paths `404`.
/// `path` must satisfy [`is_valid_route_path`].
pub fn router(path: &str, workflow: Arc<dyn Workflow>) -> Router {
    Router::new()
        .route(
            path,
            get(trigger)
                .head(method_not_allowed)
                .fallback(method_not_allowed),
        )
        .fallback(not_found)
        .with_state(IngestState { workflow })
}

/// A bound, not yet serving, trigger listener.
pub struct IngestionListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    app: Router,
}

impl std::fmt::Debug for IngestionListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionListener")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl IngestionListener {
    /// Bind the configured address. Port `0` picks a free port.
    pub async fn bind(config: &IngestConfig, workflow: Arc<dyn Workflow>) -> crate::Result<Self> {
        if !is_valid_route_path(&config.path) {
            return Err(crate::BotError::Ingest(format!(
                "invalid trigger path `{}`",
                config.path
            )));
        }
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(|e| {
                crate::BotError::Ingest(format!(
                    "cannot bind {}:{}: {e}",
                    config.host, config.port
                ))
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            app: router(&config.path, workflow),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until `cancel` fires, then stop accepting and let in-flight
    /// requests finish.
    pub async fn run(self, cancel: CancellationToken) -> crate::Result<()> {
        info!("ingestion listener on http://{}", self.local_addr);
        axum::serve(self.listener, self.app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
            .map_err(|e| crate::BotError::Ingest(format!("listener failed: {e}")))?;
        info!("ingestion listener stopped");
        Ok(())
    }
}

async fn trigger(State(state): State<IngestState>, RawQuery(query): RawQuery) -> Response {
    let span = info_span!("trigger", request_id = %Uuid::new_v4());
    handle_trigger(state.workflow, query).instrument(span).await
}

async fn handle_trigger(workflow: Arc<dyn Workflow>, query: Option<String>) -> Response {
    let request = match IngestionRequest::from_query(query.as_deref()) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "rejected trigger request");
            return failure(StatusCode::BAD_REQUEST, &e.to_string());
        }
    };
    debug!(
        user_id = request.user_id,
        submission_id = request.submission_id,
        "trigger request accepted"
    );

    match run_workflow(workflow, request).await {
        Ok(()) => json_response(
            StatusCode::OK,
            &json!({
                "success": true,
                "receivedUserId": request.user_id.to_string(),
            }),
        ),
        Err(e) => {
            error!(
                user_id = request.user_id,
                submission_id = request.submission_id,
                error = %e,
                "trigger workflow failed"
            );
            failure(StatusCode::INTERNAL_SERVER_ERROR, PROCESSING_FAILED)
        }
    }
}

/// Run the workflow in its own task so a dropped connection cannot cancel
/// it and a panic stays contained.
async fn run_workflow(
    workflow: Arc<dyn Workflow>,
    request: IngestionRequest,
) -> Result<(), WorkflowError> {
    let call = async move {
        workflow
            .trigger(request.user_id, request.submission_id)
            .await
    };
    match tokio::spawn(call.in_current_span()).await {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => Err(WorkflowError::Panicked(
            crate::scheduler::runner::panic_message(join_err.into_panic().as_ref()),
        )),
        Err(join_err) => Err(WorkflowError::Panicked(join_err.to_string())),
    }
}

async fn method_not_allowed() -> Response {
    let mut response = failure(StatusCode::METHOD_NOT_ALLOWED, "Only GET requests are allowed");
    response
        .headers_mut()
        .insert(header::ALLOW, HeaderValue::from_static("GET"));
    response
}

async fn not_found() -> Response {
    failure(StatusCode::NOT_FOUND, "Not found")
}

fn failure(status: StatusCode, message: &str) -> Response {
    json_response(status, &json!({ "success": false, "error": message }))
}

/// Encode `body` as a JSON response. An encoding failure is logged and
/// answered with a static `500` body.
fn json_response<T: serde::Serialize>(status: StatusCode, body: &T) -> Response {
    let (status, bytes) = match serde_json::to_vec(body) {
        Ok(bytes) => (status, bytes),
        Err(e) => {
            error!(error = %e, "cannot encode response body");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                FALLBACK_BODY.as_bytes().to_vec(),
            )
        }
    };
    let length = HeaderValue::from(bytes.len());
    let mut response = (
        status,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        )],
        bytes,
    )
        .into_response();
    response.headers_mut().insert(header::CONTENT_LENGTH, length);
    response
}
