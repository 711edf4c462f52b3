//! RFC 7807 problem responses.

use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::forward::ForwardError;
use crate::reliability::ReliabilityError;

#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub problem_type: &'static str,
    pub title: &'static str,
    pub status: u16,
    pub detail: String,
}

impl ProblemDetails {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            problem_type: "about:blank",
            title: status.canonical_reason().unwrap_or("Error"),
            status: status.as_u16(),
            detail: detail.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for ProblemDetails {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            [(header::CONTENT_TYPE, "application/problem+json")],
            Json(self),
        )
            .into_response()
    }
}

pub fn not_found(detail: impl Into<String>) -> ProblemDetails {
    ProblemDetails::new(StatusCode::NOT_FOUND, detail)
}

pub fn internal_error(detail: impl Into<String>) -> ProblemDetails {
    ProblemDetails::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
}

impl From<ReliabilityError> for ProblemDetails {
    fn from(e: ReliabilityError) -> Self {
        let status = match &e {
            ReliabilityError::UnknownTenant(_) => StatusCode::NOT_FOUND,
            ReliabilityError::RetryBudgetExhausted { .. }
            | ReliabilityError::AlreadyConnected(_)
            | ReliabilityError::StaleAttempt(_) => StatusCode::CONFLICT,
            ReliabilityError::SessionCreateTimeout(_) | ReliabilityError::ChallengeTimeout(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            ReliabilityError::InvalidConfig(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ReliabilityError::TransportUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ReliabilityError::RemoteApi(_) => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, e.to_string())
    }
}

impl From<ForwardError> for ProblemDetails {
    fn from(e: ForwardError) -> Self {
        let status = match &e {
            ForwardError::UnknownTenant(_) => StatusCode::NOT_FOUND,
            ForwardError::Console(_) | ForwardError::Transport(_) => StatusCode::BAD_GATEWAY,
            ForwardError::Tenant(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reliability_errors_map_to_statuses() {
        let exhausted: ProblemDetails = ReliabilityError::RetryBudgetExhausted {
            attempts: 5,
            max_attempts: 5,
        }
        .into();
        assert_eq!(exhausted.status, 409);

        let unknown: ProblemDetails = ReliabilityError::UnknownTenant("acme".into()).into();
        assert_eq!(unknown.status, 404);
        assert_eq!(unknown.title, "Not Found");

        let timeout: ProblemDetails =
            ReliabilityError::SessionCreateTimeout(std::time::Duration::from_secs(10)).into();
        assert_eq!(timeout.status, 504);
    }

    #[test]
    fn response_uses_problem_content_type() {
        let response = not_found("tenant 'x' not found").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
    }
}
