//! Events streamed back to the submitter of a request.

use super::{FinishReason, RequestId};
use serde::{Deserialize, Serialize};

/// Payload of a [`RequestEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// A newly generated token.
    Token {
        /// Token id.
        token_id: u32,
        /// Log-probability, if the engine reported one.
        logprob: Option<f32>,
        /// Decoded text, if the engine reported it.
        text: Option<String>,
    },
    /// The request is done.
    Finish {
        /// Why it stopped.
        reason: FinishReason,
        /// Prompt length.
        prompt_tokens: usize,
        /// Generated tokens.
        completion_tokens: usize,
        /// Prompt tokens served from the prefix cache.
        cached_tokens: usize,
    },
    /// The request failed and was released.
    Error {
        /// What went wrong.
        message: String,
    },
}

/// One item on a request's output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEvent {
    /// ID the request was submitted under.
    pub request_id: RequestId,
    /// Sample index within the submission.
    pub index: usize,
    /// Event payload.
    #[serde(flatten)]
    pub kind: EventKind,
}

impl RequestEvent {
    /// Whether no further events follow for this sample.
    pub fn is_terminal(&self) -> bool {
        !matches!(self.kind, EventKind::Token { .. })
    }

    /// The token carried, if any.
    pub fn token_id(&self) -> Option<u32> {
        match self.kind {
            EventKind::Token { token_id, .. } => Some(token_id),
            _ => None,
        }
    }

    /// The finish reason carried, if any.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        match self.kind {
            EventKind::Finish { reason, .. } => Some(reason),
            EventKind::Error { .. } => Some(FinishReason::Error),
            EventKind::Token { .. } => None,
        }
    }
}
