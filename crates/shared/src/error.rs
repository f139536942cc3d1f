use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::WidgetId;

/// Recoverable engine failures. Everything here is rendered back into the
/// session as an exception element; only transport failures end a session.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(
        "widget id {widget_id} was declared twice in one run; \
         pass an explicit key to disambiguate widgets with identical configuration"
    )]
    DuplicateWidgetId { widget_id: WidgetId },

    #[error("invalid widget arguments: {message}")]
    InvalidArguments { message: String },

    #[error("argument `{argument}` of `{function}` cannot be hashed: {reason}")]
    UnhashableArgument {
        function: String,
        argument: String,
        reason: String,
    },

    #[error("cache storage failure: {0}")]
    CacheStorage(String),

    #[error("rerun request referenced a superseded run")]
    StaleRerun,

    #[error("session is closed")]
    SessionClosed,
}

impl EngineError {
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::InvalidArguments {
            message: message.into(),
        }
    }
}

/// Wire form of a recovered error, embedded in exception elements and in
/// error responses from the HTTP side channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Declaration,
    Cache,
    Concurrency,
    NotFound,
    Internal,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<&EngineError> for ErrorBody {
    fn from(error: &EngineError) -> Self {
        let code = match error {
            EngineError::DuplicateWidgetId { .. } | EngineError::InvalidArguments { .. } => {
                ErrorCode::Declaration
            }
            EngineError::UnhashableArgument { .. } | EngineError::CacheStorage(_) => {
                ErrorCode::Cache
            }
            EngineError::StaleRerun => ErrorCode::Concurrency,
            EngineError::SessionClosed => ErrorCode::Internal,
        };
        Self::new(code, error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_widget_error_maps_to_declaration_code() {
        let error = EngineError::DuplicateWidgetId {
            widget_id: WidgetId("abcd".into()),
        };
        let body = ErrorBody::from(&error);
        assert_eq!(body.code, ErrorCode::Declaration);
        assert!(body.message.contains("abcd"));
    }
}
