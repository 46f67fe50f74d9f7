//! The gateway handler (G): HTTP framing and request orchestration. Wires
//! ClientIdentifier (C2) -> Admission (C3) -> SafetyFilter (C4) -> the
//! cached executor (C6, which itself wraps C5) behind a single
//! `POST /api/execute` route, plus static-asset serving for everything else.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use bytes::Bytes;
use playgate_core::drain::DrainWatcher;
use serde::Deserialize;
use tokio::io;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::cache::ResultCache;
use crate::client_id;
use crate::config::{AllowedOrigins, Config};
use crate::error::{AdmissionRejection, GatewayError, ValidationError};
use crate::executor::Executor;
use crate::ratelimiter::{self, RateLimiter};
use crate::runfile;
use crate::sink::{ChannelSink, Sink};

/// Idle threshold (and sweep period, see `ratelimiter::spawn_idle_sweeper`)
/// for evicting rate-limiter buckets that have gone quiet. Long enough that
/// a client returning between bursts keeps its accumulated token state.
const RATE_LIMITER_IDLE_EVICTION: std::time::Duration = std::time::Duration::from_secs(600);

struct AppState {
	config: Arc<Config>,
	limiter: Arc<RateLimiter>,
	cache: Arc<ResultCache>,
	drain: DrainWatcher,
}

/// Builds the fully wired `axum::Router`: the execution endpoint, static
/// asset fallback, and the cross-cutting layers (security headers, CORS,
/// request tracing) that apply to every response including the static
/// fallback's 404s. `drain` is cloned once per in-flight execution so a
/// graceful shutdown can wait for them to finish (see `stream_execution`).
pub fn build_router(config: Arc<Config>, drain: DrainWatcher) -> Router {
	let executor = Executor::new(
		config.go_executable_path.clone(),
		config.temp_dir.clone(),
		config.max_output_length,
	);
	let cache = ResultCache::new(executor, config.max_cache_size, config.cache_ttl);
	cache.spawn_sweeper();

	let limiter = Arc::new(RateLimiter::new(config.max_requests_per_minute));
	ratelimiter::spawn_idle_sweeper(limiter.clone(), RATE_LIMITER_IDLE_EVICTION);
	runfile::spawn_temp_sweeper(config.temp_dir.clone(), config.cleanup_interval);

	let state = Arc::new(AppState {
		limiter,
		cache,
		config: config.clone(),
		drain,
	});

	let serve_dir = ServeDir::new(&config.static_files_dir)
		.not_found_service(ServeFile::new(config.static_files_dir.join("index.html")));

	Router::new()
		.route("/api/execute", post(execute))
		.fallback_service(serve_dir)
		// Security headers, applied to every response including the
		// static-file fallback's 404s (layer order is bottom-to-top, so
		// these run last, after CORS and tracing have already seen the
		// response).
		.layer(SetResponseHeaderLayer::overriding(
			header::X_CONTENT_TYPE_OPTIONS,
			HeaderValue::from_static("nosniff"),
		))
		.layer(SetResponseHeaderLayer::overriding(
			header::X_FRAME_OPTIONS,
			HeaderValue::from_static("DENY"),
		))
		.layer(SetResponseHeaderLayer::overriding(
			header::CONTENT_SECURITY_POLICY,
			HeaderValue::from_static("default-src 'self'"),
		))
		.layer(cors_layer(&config.allowed_origins))
		.layer(TraceLayer::new_for_http())
		.with_state(state)
}

fn cors_layer(origins: &AllowedOrigins) -> CorsLayer {
	match origins {
		AllowedOrigins::Any => CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any),
		AllowedOrigins::List(list) => {
			use tower_http::cors::AllowOrigin;

			let parsed = list.iter().filter_map(|origin| origin.parse().ok()).collect::<Vec<_>>();
			CorsLayer::new()
				.allow_origin(AllowOrigin::list(parsed))
				.allow_methods(Any)
				.allow_headers(Any)
		},
	}
}

#[derive(Deserialize)]
struct ExecuteRequest {
	code: String,
}

/// `POST /api/execute`. Method mismatches are already turned into a 405 by
/// the router before this function runs (only `post` is registered). Wraps
/// [`handle`] to add the debug-mode per-request log line (method, path,
/// client identity, elapsed time) without cluttering the request-validation
/// sequence itself with timing concerns.
async fn execute(
	State(state): State<Arc<AppState>>,
	ConnectInfo(remote): ConnectInfo<SocketAddr>,
	method: axum::http::Method,
	uri: axum::http::Uri,
	headers: HeaderMap,
	body: Bytes,
) -> Response {
	let client = client_id::identify(&headers, remote);
	let debug_mode = state.config.debug_mode;
	let start = std::time::Instant::now();

	let response = handle(state, &client, headers, body).await;

	if debug_mode {
		info!(
			method = %method,
			path = %uri.path(),
			client = %client,
			elapsed_ms = start.elapsed().as_millis(),
			"handled request"
		);
	}
	response
}

/// The spec's handler sequence proper: admission, then content-type, then
/// body decode, then source validation, then the safety filter, then — and
/// only then — the streamed execution.
async fn handle(state: Arc<AppState>, client: &str, headers: HeaderMap, body: Bytes) -> Response {
	if !state.limiter.is_allowed(client) {
		warn!(client = %client, "rate limit exceeded");
		return GatewayError::from(AdmissionRejection).into_response();
	}

	let content_type_ok = headers
		.get(header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| v.starts_with("application/json"));
	if !content_type_ok {
		return ValidationError::UnsupportedMediaType.into_response();
	}

	let request: ExecuteRequest = match serde_json::from_slice(&body) {
		Ok(r) => r,
		Err(_) => return ValidationError::MalformedBody.into_response(),
	};

	if request.code.is_empty() {
		return inline_error_response(&ValidationError::EmptySource.to_string());
	}
	if request.code.len() > state.config.max_code_length {
		return inline_error_response(
			&ValidationError::SourceTooLong {
				max: state.config.max_code_length,
			}
			.to_string(),
		);
	}

	if let Some(offender) = crate::safety::find_blacklisted_import(&request.code) {
		return inline_error_response(&format!("Import prohibido por seguridad: {offender}"));
	}

	stream_execution(state, request.code)
}

/// The remaining exit paths (executor setup failure, non-zero exit,
/// timeout, mid-stream I/O error) have already committed the client to a
/// `200 text/plain` response by the time they can occur, so they are
/// rendered as a trailing `"\nError: ..."` line inside the stream rather
/// than a distinct HTTP status, per the spec's error-handling design.
fn stream_execution(state: Arc<AppState>, source: String) -> Response {
	let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(8);
	let timeout = state.config.execution_timeout;
	let drain_blocker = state.drain.clone();
	tokio::spawn(async move {
		// Held until the execution (bounded by `timeout`) finishes, so a
		// graceful shutdown's drain wait covers exactly the in-flight
		// executions rather than just the accepted connections.
		let _drain_blocker = drain_blocker;
		let mut sink = ChannelSink(tx.clone());
		// Races the execution against the client disconnecting (the
		// response receiver being dropped closes `tx`). Whichever branch
		// doesn't win has its future dropped by `select!`, so a disconnect
		// tears down the still-running `cache.run`/executor future in
		// flight, releasing its `ProcessGroupGuard` and killing the child's
		// process group instead of waiting out the full `ExecutionTimeout`.
		tokio::select! {
			result = state.cache.run(&source, &mut sink, timeout) => {
				if let Err(e) = result {
					let _ = sink.write_chunk(Bytes::from(format!("\nError: {e}"))).await;
				}
			}
			_ = tx.closed() => {}
		}
	});

	let body = axum::body::Body::from_stream(ReceiverStream::new(rx));
	Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
		.body(body)
		.expect("static status and header values never fail to build")
}

/// A non-streamed `200 text/plain` response whose whole body is a single
/// `"Error: ..."` line — used for validation and safety-filter rejections
/// that occur before any subprocess output could have been produced, so
/// there is nothing to stream around the error.
fn inline_error_response(message: &str) -> Response {
	Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
		.body(axum::body::Body::from(format!("Error: {message}")))
		.expect("static status and header values never fail to build")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn inline_error_response_has_no_leading_newline() {
		let response = inline_error_response("Import prohibido por seguridad: os/exec");
		assert_eq!(response.status(), StatusCode::OK);
	}

	#[test]
	fn cors_any_accepts_wildcard() {
		let _ = cors_layer(&AllowedOrigins::Any);
	}

	#[test]
	fn cors_list_filters_unparseable_origins() {
		let _ = cors_layer(&AllowedOrigins::List(vec!["https://example.com".to_string()]));
	}
}
