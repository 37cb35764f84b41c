use thiserror::Error;

/// Failure of an identity-provider backed operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("invalid login credentials")]
    InvalidCredentials,
    #[error("network failure: {0}")]
    NetworkFailure(String),
    #[error("an account with this email already exists")]
    AlreadyExists,
    #[error("no active identity")]
    NoActiveIdentity,
    #[error("{0}")]
    Unknown(String),
}

impl AuthError {
    /// Maps a provider failure (HTTP status when one was received, plus the
    /// provider's message) onto an error kind.
    pub fn classify(status: Option<u16>, message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();

        if lower.contains("already registered")
            || lower.contains("already exists")
            || lower.contains("user_already_exists")
            || status == Some(409)
        {
            return AuthError::AlreadyExists;
        }

        if lower.contains("invalid login credentials")
            || lower.contains("invalid credentials")
            || lower.contains("invalid_credentials")
            || lower.contains("invalid_grant")
            || lower.contains("invalid grant")
            || status == Some(401)
        {
            return AuthError::InvalidCredentials;
        }

        if status.is_none()
            && (lower.contains("connect")
                || lower.contains("connection")
                || lower.contains("timed out")
                || lower.contains("timeout")
                || lower.contains("dns")
                || lower.contains("network"))
        {
            return AuthError::NetworkFailure(message);
        }

        if message.trim().is_empty() {
            return AuthError::Unknown(match status {
                Some(status) => format!("provider returned status {status}"),
                None => "unknown provider failure".to_string(),
            });
        }

        AuthError::Unknown(message)
    }

    /// Text shown to the user when this failure is surfaced.
    pub fn user_message(&self) -> String {
        match self {
            AuthError::InvalidCredentials => "Invalid email or password.".to_string(),
            AuthError::NetworkFailure(_) => {
                "Could not reach the server; check your connection and retry.".to_string()
            }
            AuthError::AlreadyExists => "An account with this email already exists.".to_string(),
            AuthError::NoActiveIdentity => "No user is signed in.".to_string(),
            AuthError::Unknown(message) => message.clone(),
        }
    }
}
