use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Failures that reject a control request before it reaches the registry
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("authorization failed")]
    AuthorizationFailed,

    #[error("{0}")]
    MalformedRequest(String),

    #[error("type is empty")]
    MissingOperation,

    #[error("unknown operation {0}")]
    UnknownOperation(String),

    #[error("missing parameter {parameter}")]
    MissingParameter {
        operation: String,
        parameter: &'static str,
    },
}

impl ControlError {
    pub fn status(&self) -> StatusCode {
        match self {
            ControlError::AuthorizationFailed => StatusCode::UNAUTHORIZED,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Prefix of the result line
    fn label(&self) -> &str {
        match self {
            ControlError::AuthorizationFailed => "token",
            ControlError::MalformedRequest(_) | ControlError::MissingOperation => "parameter",
            ControlError::UnknownOperation(_) => "type",
            ControlError::MissingParameter { operation, .. } => operation.as_str(),
        }
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let line = result_line(self.label(), Err(&self.to_string()));
        (
            self.status(),
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            line,
        )
            .into_response()
    }
}

/// `"<operation>: ok"` or `"<operation>: <message>"`
pub fn result_line(operation: &str, outcome: Result<(), &str>) -> String {
    match outcome {
        Ok(()) => format!("{}: ok", operation),
        Err(message) => format!("{}: {}", operation, message),
    }
}
