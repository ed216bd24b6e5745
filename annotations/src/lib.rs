pub mod send;
pub mod service;
pub mod store;
pub mod types;

pub use send::SendRendezvous;
pub use service::AnnotationService;
pub use service::ScreenshotFn;
pub use service::SendNotifyFn;
pub use store::AnnotationStore;
pub use types::Annotation;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnnotationError {
    #[error("{0}")]
    BadRequest(String),

    #[error("annotation limit reached ({0})")]
    QuotaExceeded(usize),

    #[error("annotation not found")]
    NotFound,

    #[error("could not bind annotation service: {0}")]
    Bind(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AnnotationError>;
