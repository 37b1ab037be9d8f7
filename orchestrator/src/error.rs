use agentbox_common::response;
use axum::response::{IntoResponse, Response};

/// Error taxonomy for the orchestrator. Every variant maps onto the JSON
/// error envelope; platform and internal errors reach the client with a
/// sanitised message only.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("platform request failed: {source}")]
    Platform {
        #[source]
        source: anyhow::Error,
    },

    #[error("internal error: {source}")]
    Internal {
        #[source]
        source: anyhow::Error,
    },
}

impl Error {
    pub fn platform(source: anyhow::Error) -> Self {
        Self::Platform { source }
    }

    pub fn internal(source: anyhow::Error) -> Self {
        Self::Internal { source }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            Error::Validation(e) => response::bad_request(anyhow::anyhow!(e)),
            Error::Unauthorized(e) => response::unauthorized(anyhow::anyhow!(e)),
            Error::Forbidden(e) => response::forbidden(anyhow::anyhow!(e)),
            Error::NotFound(e) => response::not_found(anyhow::anyhow!(e)),
            Error::Conflict(e) => response::conflict(anyhow::anyhow!(e)),
            Error::Platform { source } => response::service_unavailable(source),
            Error::Internal { source } => response::internal_server_error(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    #[test]
    fn variants_map_to_expected_status_codes() {
        let cases = [
            (Error::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (Error::Unauthorized("no".into()), StatusCode::UNAUTHORIZED),
            (Error::Forbidden("no".into()), StatusCode::FORBIDDEN),
            (Error::NotFound("gone".into()), StatusCode::NOT_FOUND),
            (Error::Conflict("state".into()), StatusCode::CONFLICT),
            (
                Error::platform(anyhow::anyhow!("apiserver down")),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                Error::internal(anyhow::anyhow!("bug")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, code) in cases {
            assert_eq!(err.into_response().status(), code);
        }
    }
}
