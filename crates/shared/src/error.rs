use thiserror::Error;

/// Typed form of a non-zero result envelope from the remote service.
#[derive(Debug, Clone, Error)]
#[error("api call rejected, ret={ret}: [{message}]")]
pub struct ApiError {
    pub ret: i64,
    pub message: String,
}

impl ApiError {
    pub fn new(ret: i64, message: impl Into<String>) -> Self {
        Self {
            ret,
            message: message.into(),
        }
    }
}
