//! # Framework Errors
//!
//! Error types shared by the queue layer. Workers and peers define their own
//! error enums; this one only covers talking to the stream.

/// Errors returned by the stream and its clients.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The stream task is gone; the request was never delivered.
    #[error("Stream closed")]
    StreamClosed,
    /// The stream received the request but dropped the response channel.
    #[error("Stream dropped response channel")]
    StreamDropped,
    /// A publish targeted a subject the stream does not capture.
    #[error("Subject `{subject}` is not captured by stream `{stream}`")]
    SubjectNotCaptured { stream: String, subject: String },
    /// A subject or filter pattern is malformed.
    #[error("Invalid subject: {0}")]
    InvalidSubject(String),
    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),
    /// An acknowledgement referenced a message that is not awaiting one.
    #[error("Message {sequence} is not pending on consumer `{consumer}`")]
    NotPending { consumer: String, sequence: u64 },
}
