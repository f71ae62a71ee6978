use thiserror::Error;

pub type Result<T> = std::result::Result<T, SpliceErr>;

#[derive(Debug, Error)]
pub enum SpliceErr {
    /// The transport failed mid-stream, or the stream closed before the
    /// terminal summary arrived. Retry/backoff is the transport
    /// collaborator's job; the engine only finalizes partial state.
    #[error("stream disconnected before completion: {0}")]
    Stream(String),

    /// The stream stayed completely silent past the configured idle window.
    #[error("idle timeout waiting for stream event")]
    Timeout,

    /// The live turn was cancelled by the caller.
    #[error("interrupted by caller")]
    Interrupted,

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SpliceErr {
    /// Message suitable for freezing into the erroring turn's state.
    pub fn surface_message(&self) -> String {
        self.to_string()
    }
}
