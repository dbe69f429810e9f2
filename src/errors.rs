//! Error taxonomy shared by every component, and its mapping to transport-level
//! status codes at the API surface (server.rs) and the HTTP health router (main.rs).

use thiserror::Error;

/// One entry per taxonomy class. Every boundary endpoint
/// converts a failure into one of these, never a bare string or panic. Each
/// variant carries an optional `decision_id` (attached via
/// [`AppError::with_decision_id`] once the orchestrator has minted one) and an
/// optional `hint` a caller can act on (§7).
#[derive(Debug, Error)]
pub enum AppError {
    #[error("VALIDATION: {message}")]
    Validation { message: String, decision_id: Option<String> },

    #[error("NOT_FOUND: {message}")]
    NotFound { message: String, decision_id: Option<String> },

    #[error("RATE_LIMIT: {message}")]
    RateLimit { message: String, retry_after_s: u64, decision_id: Option<String> },

    #[error("TRANSPORT: {message}")]
    Transport { message: String, decision_id: Option<String> },

    #[error("TIMEOUT: {message}")]
    Timeout { message: String, decision_id: Option<String> },

    #[error("FORMAT: {message}")]
    Format { message: String, decision_id: Option<String> },

    #[error("SCHEMA: {message}")]
    Schema { message: String, decision_id: Option<String> },

    #[error("CONFLICT: {message}")]
    Conflict { message: String, decision_id: Option<String> },

    #[error("INTERNAL: {message}")]
    Internal { message: String, decision_id: Option<String> },
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into(), decision_id: None }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into(), decision_id: None }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), decision_id: None }
    }

    pub fn rate_limit(message: impl Into<String>, retry_after_s: u64) -> Self {
        Self::RateLimit { message: message.into(), retry_after_s, decision_id: None }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into(), decision_id: None }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout { message: message.into(), decision_id: None }
    }

    pub fn format(message: impl Into<String>) -> Self {
        Self::Format { message: message.into(), decision_id: None }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema { message: message.into(), decision_id: None }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict { message: message.into(), decision_id: None }
    }

    /// Attaches a `decision_id` minted after this error was constructed —
    /// every boundary endpoint calls this before returning so the caller
    /// always sees the id it sent, even on failure (§7).
    pub fn with_decision_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        let slot = match &mut self {
            AppError::Validation { decision_id, .. }
            | AppError::NotFound { decision_id, .. }
            | AppError::RateLimit { decision_id, .. }
            | AppError::Transport { decision_id, .. }
            | AppError::Timeout { decision_id, .. }
            | AppError::Format { decision_id, .. }
            | AppError::Schema { decision_id, .. }
            | AppError::Conflict { decision_id, .. }
            | AppError::Internal { decision_id, .. } => decision_id,
        };
        *slot = Some(id);
        self
    }

    pub fn decision_id(&self) -> Option<&str> {
        match self {
            AppError::Validation { decision_id, .. }
            | AppError::NotFound { decision_id, .. }
            | AppError::RateLimit { decision_id, .. }
            | AppError::Transport { decision_id, .. }
            | AppError::Timeout { decision_id, .. }
            | AppError::Format { decision_id, .. }
            | AppError::Schema { decision_id, .. }
            | AppError::Conflict { decision_id, .. }
            | AppError::Internal { decision_id, .. } => decision_id.as_deref(),
        }
    }

    /// HTTP status code per the propagation table in the error handling design.
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::Validation { .. } => 422,
            AppError::NotFound { .. } => 404,
            AppError::RateLimit { .. } => 429,
            AppError::Timeout { .. } => 504,
            AppError::Transport { .. } | AppError::Internal { .. } => 500,
            AppError::Format { .. } | AppError::Schema { .. } => 500,
            AppError::Conflict { .. } => 200,
        }
    }

    /// A short, stable hint a caller can act on. Only a few classes have one.
    pub fn hint(&self) -> Option<String> {
        match self {
            AppError::RateLimit { retry_after_s, .. } => {
                Some(format!("retry in {retry_after_s}s"))
            }
            AppError::Timeout { .. } => Some("retry with a smaller request or later".to_string()),
            _ => None,
        }
    }

    /// Tool-surface rendering: `"TAXONOMY: message"`, plus `decision_id=...`
    /// and `hint=...` suffixes when present, so tests can assert on
    /// classification without a second mapping table (§7 Rust-native
    /// additions).
    pub fn to_tool_error(&self) -> String {
        let mut out = self.to_string();
        if let Some(id) = self.decision_id() {
            out.push_str(&format!(" (decision_id={id})"));
        }
        if let Some(hint) = self.hint() {
            out.push_str(&format!(" (hint={hint})"));
        }
        out
    }
}

/// Classification used internally by the LLM advisor's retry loop (§4.3). This is
/// deliberately a distinct type from `AppError`: the advisor classifies first and
/// only surfaces an `AppError` if every retry is exhausted and no fallback applies
/// (in practice the advisor always has a fallback, so this rarely escapes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmFailureKind {
    Transport,
    RateLimit,
    Format,
    Schema,
    Timeout,
}

impl LlmFailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LlmFailureKind::Transport => "TRANSPORT",
            LlmFailureKind::RateLimit => "RATE_LIMIT",
            LlmFailureKind::Format => "FORMAT",
            LlmFailureKind::Schema => "SCHEMA",
            LlmFailureKind::Timeout => "TIMEOUT",
        }
    }

    /// Maps this classification onto the shared `AppError` taxonomy, for the
    /// rare case where exhausting the advisor's retries is worth surfacing to
    /// structured logging rather than only silently falling back (§4.3).
    pub fn into_app_error(self, message: impl Into<String>) -> AppError {
        let message = message.into();
        match self {
            LlmFailureKind::Transport => AppError::transport(message),
            LlmFailureKind::RateLimit => AppError::rate_limit(message, 30),
            LlmFailureKind::Format => AppError::format(message),
            LlmFailureKind::Schema => AppError::schema(message),
            LlmFailureKind::Timeout => AppError::timeout(message),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
