use thiserror::Error;

/// `PostgREST` code returned when a single-row read matched zero rows.
pub const NOT_FOUND_CODE: &str = "PGRST116";

pub type Result<T, E = AuthError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("User not authenticated")]
    NotAuthenticated,
    #[error("row not found ({code})")]
    NotFound { code: String },
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("request failed ({status}): {message}")]
    Http {
        status: u16,
        code: Option<String>,
        message: String,
    },
    #[error("network error: {0}")]
    Transport(String),
    #[error("invalid response: {0}")]
    Parse(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl AuthError {
    #[must_use]
    pub fn not_found() -> Self {
        Self::NotFound {
            code: NOT_FOUND_CODE.to_string(),
        }
    }

    /// True only for the specific "zero rows" code, never for generic 404s.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { code } => code == NOT_FOUND_CODE,
            Self::Http {
                code: Some(code), ..
            } => code == NOT_FOUND_CODE,
            _ => false,
        }
    }

    #[must_use]
    pub fn is_permission(&self) -> bool {
        matches!(self, Self::Permission(_))
            || matches!(
                self,
                Self::Http {
                    status: 401 | 403,
                    ..
                }
            )
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Parse(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<std::io::Error> for AuthError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
