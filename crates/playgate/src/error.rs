use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors surfaced before any bytes of the execution response are committed.
/// Each maps to a concrete HTTP status; never retried, never logged above
/// `warn`.
#[derive(Debug, Error)]
pub enum ValidationError {
	#[error("method not allowed")]
	MethodNotAllowed,
	#[error("unsupported media type")]
	UnsupportedMediaType,
	#[error("malformed request body")]
	MalformedBody,
	#[error("source must not be empty")]
	EmptySource,
	#[error("source exceeds the maximum length of {max} bytes")]
	SourceTooLong { max: usize },
}

impl ValidationError {
	pub fn status(&self) -> StatusCode {
		match self {
			ValidationError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
			ValidationError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
			ValidationError::MalformedBody
			| ValidationError::EmptySource
			| ValidationError::SourceTooLong { .. } => StatusCode::BAD_REQUEST,
		}
	}
}

impl IntoResponse for ValidationError {
	fn into_response(self) -> Response {
		let status = self.status();
		(status, self.to_string()).into_response()
	}
}

/// The caller's token bucket was empty. Logged at `warn` with the client
/// identity; surfaced as 429 with a fixed, user-facing message.
#[derive(Debug, Error)]
#[error("rate limit exceeded")]
pub struct AdmissionRejection;

/// Failures from running the child process or streaming its output. Distinct
/// causes are kept so the trailing inline error line can be worded per-cause,
/// even though the HTTP status is already committed by the time any of these
/// can occur (the handler has already started streaming `200 OK`).
#[derive(Debug, Error)]
pub enum ExecutionError {
	#[error("execution timed out after {0:?}")]
	Timeout(std::time::Duration),
	#[error("process exited with status {0:?}")]
	NonZeroExit(Option<i32>),
	#[error("{0}")]
	Io(#[from] std::io::Error),
	#[error("{0}")]
	Setup(String),
}

/// Top-level taxonomy for everything the gateway handler can produce before
/// the response has started streaming. `ExecutionError` does not appear here
/// because by the time it can occur, the status is already committed — it is
/// rendered directly as a trailing `"\nError: ..."` line in the response
/// body instead of going through `IntoResponse`. There is no `InternalError`
/// variant for "the response transport doesn't support streaming": unlike
/// the source of record's `http.ResponseWriter`, `axum::body::Body::from_stream`
/// has no such failure mode to check for, so the 500 status this spec
/// reserves for it is unreachable in this stack rather than merely unwired.
#[derive(Debug, Error)]
pub enum GatewayError {
	#[error(transparent)]
	Validation(#[from] ValidationError),
	#[error(transparent)]
	Admission(#[from] AdmissionRejection),
}

impl IntoResponse for GatewayError {
	fn into_response(self) -> Response {
		match self {
			GatewayError::Validation(e) => e.into_response(),
			GatewayError::Admission(_) => {
				(StatusCode::TOO_MANY_REQUESTS, "Demasiadas peticiones, por favor espera un momento").into_response()
			},
		}
	}
}
