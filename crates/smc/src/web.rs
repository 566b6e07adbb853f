//! HTTP endpoints for stream-my-command.
//!
//! Every configured command is exposed at `/api/v1/{slug}/{args...}`. The
//! first GET for a given argument list starts the command; every GET, early
//! or late, streams its output from the offset in the `Range` header.

use crate::arguments::{ArgumentError, Arguments};
use crate::command::CommandPool;
use crate::registry::{Registry, Run, RunKey};
use crate::rfc7233::{self, RangeError};
use anyhow::Context;
use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{future, StreamExt};
use longbuffer::{Stream, StreamError};
use smcconf::{CommandConfig, SmcConfig, WaitStrategy};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::DuplexStream;
use tokio_util::io::{ReaderStream, SyncIoBridge};
use tokio_util::sync::{CancellationToken, DropGuard};

/// Buffer between a stream reader and the response body.
const PIPE_CAPACITY: usize = 64 * 1024;

/// A configured command with its parsed argument template.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub spec: CommandConfig,
    pub arguments: Arguments,
}

/// Shared state for web handlers
#[derive(Clone)]
pub struct AppState {
    pub endpoints: Arc<HashMap<String, Endpoint>>,
    pub registry: Registry,
    pub pool: CommandPool,
    /// Parent directory of every stream home.
    pub streams_dir: PathBuf,
    pub segment_size: u64,
    pub wait_strategy: WaitStrategy,
    pub poll_interval: Duration,
    pub start_time: Instant,
}

impl AppState {
    /// Build handler state from a validated config.
    ///
    /// Fails if a command's argument template is invalid.
    pub fn from_config(config: &SmcConfig) -> anyhow::Result<Self> {
        let endpoints = config
            .commands
            .iter()
            .map(|spec| -> anyhow::Result<(String, Endpoint)> {
                let arguments = Arguments::parse(&spec.arguments)
                    .with_context(|| format!("Invalid arguments for command '{}'", spec.slug))?;
                Ok((
                    spec.slug.clone(),
                    Endpoint {
                        spec: spec.clone(),
                        arguments,
                    },
                ))
            })
            .collect::<anyhow::Result<HashMap<_, _>>>()?;

        let stream = &config.infra.stream;
        Ok(Self {
            endpoints: Arc::new(endpoints),
            registry: Registry::new(),
            pool: CommandPool::new(stream.max_concurrent_commands),
            streams_dir: config.infra.paths.streams_dir(),
            segment_size: stream.segment_size,
            wait_strategy: stream.wait_strategy,
            poll_interval: stream.poll_interval(),
            start_time: Instant::now(),
        })
    }
}

/// Errors a request can fail with, mapped onto HTTP statuses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("no run for {0}")]
    UnknownRun(String),

    #[error(transparent)]
    Arguments(#[from] ArgumentError),

    #[error("invalid Range header: {0}")]
    Range(#[from] RangeError),

    #[error("offset {offset} is past the end of the stream ({len} bytes)")]
    NotSatisfiable { offset: u64, len: u64 },

    #[error("failed to create stream: {0}")]
    Stream(#[from] StreamError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::UnknownCommand(_) | ApiError::UnknownRun(_) => StatusCode::NOT_FOUND,
            ApiError::Arguments(_) | ApiError::Range(_) => StatusCode::BAD_REQUEST,
            ApiError::NotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            ApiError::Stream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }

        let body = Json(serde_json::json!({ "error": self.to_string() }));
        let mut response = (status, body).into_response();
        if let ApiError::NotSatisfiable { len, .. } = self {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", len)) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
        }
        response
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(serve_root))
        .route("/health", get(health))
        .route("/api/v1/{slug}", get(stream_output).delete(cancel_run))
        .route("/api/v1/{slug}/{*args}", get(stream_output).delete(cancel_run))
        .with_state(state)
}

/// Serve root discovery endpoint
async fn serve_root(State(state): State<AppState>) -> impl IntoResponse {
    let mut commands: Vec<_> = state
        .endpoints
        .values()
        .map(|endpoint| {
            serde_json::json!({
                "slug": endpoint.spec.slug,
                "content_type": endpoint.spec.content_type,
                "arity": endpoint.arguments.arity(),
                "path": format!("/api/v1/{}", endpoint.spec.slug),
            })
        })
        .collect();
    commands.sort_by(|a, b| a["slug"].as_str().cmp(&b["slug"].as_str()));

    Json(serde_json::json!({
        "name": "stream-my-command",
        "version": env!("CARGO_PKG_VERSION"),
        "commands": commands,
        "links": {
            "health": "/health",
        }
    }))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let runs = state.registry.stats();
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "wait_strategy": state.wait_strategy.to_string(),
        "runs": runs,
        "commands": state.endpoints.len(),
    }))
}

/// Split the wildcard tail of a request path into positional arguments.
fn split_args(params: &HashMap<String, String>) -> Vec<String> {
    params
        .get("args")
        .map(|tail| tail.split('/').map(str::to_string).collect())
        .unwrap_or_default()
}

/// Resolve the run key a request addresses.
fn resolve(
    state: &AppState,
    params: &HashMap<String, String>,
) -> Result<(Endpoint, RunKey), ApiError> {
    let slug = params.get("slug").cloned().unwrap_or_default();
    let endpoint = state
        .endpoints
        .get(&slug)
        .cloned()
        .ok_or(ApiError::UnknownCommand(slug))?;
    let argv = endpoint.arguments.values(&split_args(params))?;
    let key = RunKey::new(endpoint.spec.slug.clone(), argv);
    Ok((endpoint, key))
}

#[tracing::instrument(
    name = "http.stream",
    skip_all,
    fields(command.slug = tracing::field::Empty, stream.id = tracing::field::Empty)
)]
async fn stream_output(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (endpoint, key) = resolve(&state, &params)?;
    let span = tracing::Span::current();
    span.record("command.slug", endpoint.spec.slug.as_str());

    let offset = match headers.get(header::RANGE) {
        Some(raw) => {
            let raw = raw
                .to_str()
                .map_err(|_| RangeError::Malformed("non-ascii header".to_string()))?;
            rfc7233::parse(raw)?.first_start()
        }
        None => 0,
    };

    let (run, fresh) = state.registry.get_or_create(key.clone(), || {
        Stream::create(&state.streams_dir, state.segment_size).map(Run::new)
    })?;
    let stream = run.stream.clone();
    span.record("stream.id", tracing::field::display(stream.id()));

    if fresh {
        spawn_producer(&state, endpoint.spec.clone(), key.args.clone(), run);
    }

    // Snapshot once: a closed stream never changes again.
    let closed = stream.is_closed();
    let len = stream.len();
    if closed && offset > len {
        return Err(ApiError::NotSatisfiable { offset, len });
    }

    let body = match state.wait_strategy {
        WaitStrategy::Push => push_body(&stream, offset),
        WaitStrategy::Poll => poll_body(&stream, offset, state.poll_interval),
    };

    tracing::debug!(offset, fresh, closed, "Streaming run output");

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, endpoint.spec.content_type.as_str())
        .header(header::ACCEPT_RANGES, "bytes")
        .header("X-Id", stream.id().to_string())
        .header("Stream-Status", if fresh { "fresh" } else { "refurbished" });
    if closed {
        response = response
            .header(header::CONTENT_LENGTH, len - offset)
            .header(header::ETAG, format!("\"{}\"", stream.hash()));
    }

    Ok(response
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

/// Start the command behind a freshly created run.
fn spawn_producer(state: &AppState, spec: CommandConfig, argv: Vec<String>, run: Run) {
    let pool = state.pool.clone();
    tokio::spawn(async move {
        let stream_id = run.stream.id();
        if let Err(e) = pool.run(&spec, &argv, run.stream, run.cancel).await {
            tracing::warn!(
                command.slug = %spec.slug,
                stream.id = %stream_id,
                error = %e,
                "Command failed"
            );
        }
    });
}

/// Response body over a duplex pipe, ended by the outcome of the task feeding it.
///
/// Bytes flow until the task drops its end of the pipe. A failed task then
/// yields a body error, so hyper aborts the response instead of terminating
/// it like a complete one. Dropping the body drops `guard`, which stops the
/// task.
fn piped_body<F>(stream: &Stream, reader: DuplexStream, outcome: F, guard: DropGuard) -> Body
where
    F: Future<Output = Result<u64, StreamError>> + Send + 'static,
{
    let stream_id = stream.id();
    let tail = futures::stream::once(async move {
        let _guard = guard;
        match outcome.await {
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(stream.id = %stream_id, error = %e, "Response body aborted");
                Some(Err::<Bytes, io::Error>(io::Error::from(e)))
            }
        }
    })
    .filter_map(future::ready);

    Body::from_stream(ReaderStream::new(reader).chain(tail))
}

/// Body fed by a subscriber task, woken on every write.
fn push_body(stream: &Stream, offset: u64) -> Body {
    let (reader, writer) = tokio::io::duplex(PIPE_CAPACITY);
    let cancel = CancellationToken::new();
    let subscription = stream.subscribe(offset, writer, cancel.clone());
    piped_body(stream, reader, subscription.wait(), cancel.drop_guard())
}

/// Body fed by a blocking copy loop that sleeps when caught up.
fn poll_body(stream: &Stream, offset: u64, interval: Duration) -> Body {
    let (reader, writer) = tokio::io::duplex(PIPE_CAPACITY);
    let mut sink = SyncIoBridge::new(writer);
    let cancel = CancellationToken::new();
    let copier = {
        let stream = stream.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || -> Result<u64, StreamError> {
            let copied = stream.copy_until(offset, &mut sink, interval, &cancel)?;
            sink.shutdown()?;
            Ok(copied)
        })
    };
    let outcome = async move {
        copier
            .await
            .map_err(|e| StreamError::Subscriber(e.to_string()))?
    };
    piped_body(stream, reader, outcome, cancel.drop_guard())
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let (_endpoint, key) = resolve(&state, &params)?;
    let run = state
        .registry
        .cancel(&key)
        .ok_or_else(|| ApiError::UnknownRun(key.to_string()))?;

    Ok((StatusCode::OK, [("X-Id", run.stream.id().to_string())]).into_response())
}
