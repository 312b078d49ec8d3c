use thiserror::Error;

/// Classification of external generation-call failures.
///
/// `TooLarge` is not a failure of the window, it is a signal to split;
/// `Transient` is retried with backoff; `Fatal` is terminal immediately.
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("prompt too large: ~{estimated_tokens} tokens exceeds effective budget {effective_budget}")]
    TooLarge {
        estimated_tokens: u64,
        effective_budget: u64,
    },
    #[error("transient generation failure: {reason}")]
    Transient {
        reason: String,
        retry_after_secs: Option<u64>,
    },
    #[error("fatal generation failure: {reason}")]
    Fatal { reason: String },
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("window {window_id} is already in progress (held by pid {holder_pid})")]
    AlreadyInProgress { window_id: String, holder_pid: u32 },
    #[error("window {window_id} failed previously ({reason}); run `gazette retry {window_id}` to re-attempt it")]
    RequiresRetry { window_id: String, reason: String },
}

#[derive(Debug, Error)]
pub enum WindowError {
    #[error("window {window_id} cannot be reduced to fit the generation budget: {reason}")]
    TooLarge { window_id: String, reason: String },
}

/// Privacy gate violations abort the entire run. They are never downgraded
/// to a warning.
#[derive(Debug, Error)]
pub enum PrivacyError {
    #[error("privacy policy invalid: {0}")]
    InvalidPolicy(String),
    #[error("raw identifier survived sealing for message {message_id}")]
    RawIdentifierLeak { message_id: String },
}
