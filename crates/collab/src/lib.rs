//! Real-time multi-user document collaboration.
//!
//! Convergence works by whole-document overwrite gated by a version number:
//! every write is a compare-and-set against the store, every subscriber
//! learns about the committed result through the per-document sync bus, and
//! cursor presence travels on a separate ephemeral channel that never
//! touches storage.

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod bus;
pub use bus::*;

mod convergence;
pub use convergence::*;

mod presence;
pub use presence::*;

mod protocol;
pub use protocol::*;

mod session;
pub use session::*;

pub use docstore::{
    Document, DocumentId, DocumentKind, DocumentStore, EntityId, NewDocument, StoreError, UserId,
};

#[derive(Debug, Error)]
pub enum CollabError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("transport unavailable: {0}")]
    Transport(String),

    #[error("session closed")]
    SessionClosed,
}

impl CollabError {
    /// Infrastructure failures worth retrying with backoff; conflicts and
    /// missing documents are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CollabError::Store(StoreError::Storage(_))
                | CollabError::Store(StoreError::Io(_))
                | CollabError::Transport(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CollabError>;

/// The current actor, as supplied by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: UserId,
    pub user_name: String,
}

impl Actor {
    pub fn new(user_id: UserId, user_name: impl Into<String>) -> Self {
        Self {
            user_id,
            user_name: user_name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        let io = || std::io::Error::new(std::io::ErrorKind::Other, "disk gone");

        assert!(CollabError::Transport("link down".to_string()).is_retryable());
        assert!(CollabError::Store(StoreError::Io(io())).is_retryable());

        assert!(!CollabError::SessionClosed.is_retryable());
        assert!(!CollabError::Store(StoreError::NotFound).is_retryable());
        assert!(!CollabError::Store(StoreError::Conflict {
            current_version: 3,
            current_content: "theirs".to_string(),
        })
        .is_retryable());
    }
}
