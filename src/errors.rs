use serde::{Deserialize, Serialize};

/// Structured failure details persisted inside history events.
///
/// Only `Application` failures are ever surfaced to orchestration code;
/// the other variants describe engine- or storage-level conditions that
/// application code cannot meaningfully recover from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ErrorDetails {
    /// A failure raised by application code (activity, entity operation,
    /// sub-orchestration). Catchable and retry-policy governed.
    Application {
        error_type: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cause: Option<Box<ErrorDetails>>,
    },
    /// A provider/storage failure. Never delivered to orchestration code.
    Infrastructure {
        operation: String,
        message: String,
        retryable: bool,
    },
    /// Replayed call sequence diverged from recorded history. Fatal for the
    /// instance; requires operator intervention.
    Nondeterminism { message: String },
    /// The instance (or an awaited child) was terminated.
    Cancelled { reason: String },
}

impl ErrorDetails {
    /// Application failure with the default `"activity"` error type.
    pub fn application(message: impl Into<String>) -> Self {
        ErrorDetails::Application {
            error_type: "activity".to_string(),
            message: message.into(),
            cause: None,
        }
    }

    /// Application failure with an explicit error type tag.
    pub fn application_typed(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorDetails::Application {
            error_type: error_type.into(),
            message: message.into(),
            cause: None,
        }
    }

    /// Wrap another failure as the cause of this application failure.
    pub fn with_cause(self, cause: ErrorDetails) -> Self {
        match self {
            ErrorDetails::Application {
                error_type, message, ..
            } => ErrorDetails::Application {
                error_type,
                message,
                cause: Some(Box::new(cause)),
            },
            other => other,
        }
    }

    pub fn nondeterminism(message: impl Into<String>) -> Self {
        ErrorDetails::Nondeterminism {
            message: message.into(),
        }
    }

    /// The string form handed to orchestration code when this failure is
    /// observed through a durable future.
    pub fn display_message(&self) -> String {
        match self {
            ErrorDetails::Application { message, .. } => message.clone(),
            ErrorDetails::Infrastructure {
                operation, message, ..
            } => format!("infrastructure error in {operation}: {message}"),
            ErrorDetails::Nondeterminism { message } => format!("nondeterministic: {message}"),
            ErrorDetails::Cancelled { reason } => format!("terminated: {reason}"),
        }
    }

    pub fn is_application(&self) -> bool {
        matches!(self, ErrorDetails::Application { .. })
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_message())
    }
}
