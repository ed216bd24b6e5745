pub mod chrome;
pub mod events;
pub mod overlay;
pub mod session;
pub mod targets;

pub use events::ConsoleEntry;
pub use events::NetworkEntry;
pub use session::ConnectOptions;
pub use session::SessionManager;
pub use targets::PageTarget;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrowserError {
    #[error("browser unreachable: {0}")]
    Unreachable(String),

    #[error("no matching page target: {0}")]
    TargetNotFound(String),

    #[error("session lost: {0}")]
    SessionLost(String),

    #[error("page script threw: {0}")]
    EvaluationException(String),

    #[error("script evaluation timed out after {0} ms")]
    EvaluationTimeout(u64),

    #[error("CDP error: {0}")]
    CdpError(String),

    #[error("invalid configuration: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<chromiumoxide::error::CdpError> for BrowserError {
    fn from(e: chromiumoxide::error::CdpError) -> Self {
        BrowserError::CdpError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BrowserError>;
