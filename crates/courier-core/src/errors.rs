use std::{fmt, time::Duration};

/// Core error type for the account runtime.
///
/// Adapter crates map their specific errors into this type so the runtime can
/// classify failures consistently (disable the account vs log and continue).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Credential invalid or expired; the account stays disabled until re-authenticated.
    #[error("auth error: {0}")]
    Auth(String),

    #[error("session invalid: {0}")]
    SessionInvalid(String),

    #[error("persist error: {0}")]
    Persist(String),

    /// Completion call failed or timed out. Recovered by skipping the reply.
    #[error("completion api error: {0}")]
    TransientApi(String),

    #[error("forward error: {0}")]
    Forward(String),

    #[error("config error: {0}")]
    Config(String),

    /// Unexpected handler fault (panic, join failure).
    #[error("dispatch error: {0}")]
    Dispatch(String),

    /// `retry_after` is the platform's own wait hint, when it sent one.
    #[error("platform error: {message}")]
    Platform {
        message: String,
        rate_limited: bool,
        retry_after: Option<Duration>,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error class used for log severity and account-level policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Auth,
    SessionInvalid,
    Persist,
    TransientApi,
    Forward,
    Config,
    Dispatch,
    Platform,
    Io,
}

impl Error {
    pub fn platform(message: impl Into<String>) -> Self {
        Error::Platform {
            message: message.into(),
            rate_limited: false,
            retry_after: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Error::Platform {
            message: message.into(),
            rate_limited: true,
            retry_after,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Auth(_) => ErrorKind::Auth,
            Error::SessionInvalid(_) => ErrorKind::SessionInvalid,
            Error::Persist(_) => ErrorKind::Persist,
            Error::TransientApi(_) => ErrorKind::TransientApi,
            Error::Forward(_) => ErrorKind::Forward,
            Error::Config(_) => ErrorKind::Config,
            Error::Dispatch(_) => ErrorKind::Dispatch,
            Error::Platform { .. } => ErrorKind::Platform,
            Error::Io(_) | Error::Json(_) => ErrorKind::Io,
        }
    }

    /// Only auth failures take an account out of service.
    pub fn disables_account(&self) -> bool {
        matches!(self.kind(), ErrorKind::Auth | ErrorKind::SessionInvalid)
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            Error::Platform {
                rate_limited: true,
                ..
            }
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Platform { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::SessionInvalid => "session_invalid",
            ErrorKind::Persist => "persist",
            ErrorKind::TransientApi => "transient_api",
            ErrorKind::Forward => "forward",
            ErrorKind::Config => "config",
            ErrorKind::Dispatch => "dispatch",
            ErrorKind::Platform => "platform",
            ErrorKind::Io => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
