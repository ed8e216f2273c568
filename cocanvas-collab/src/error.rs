//! Error taxonomy for the collaboration layer.
//!
//! `AccessDenied` and `InvalidArgument` are rejected before any mutation is
//! attempted; `NotFound` surfaces a missing target to the order's author
//! only and is never broadcast; `Delivery` is logged per recipient and
//! never propagates to other recipients or back to the mutation.

use cocanvas_core::store::StoreError;
use thiserror::Error;

pub type CollabResult<T> = Result<T, CollabError>;

#[derive(Error, Debug)]
pub enum CollabError {
    /// No resolvable identity on an inbound order or lifecycle event.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Target composition or element absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unrecognized order type, malformed destination, or invalid payload.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A send to one recipient failed. Best-effort: logged, not retried.
    #[error("delivery failure: {0}")]
    Delivery(String),

    /// Backend failure below the mutation contract.
    #[error("store error: {0}")]
    Store(String),
}

impl From<StoreError> for CollabError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(v) => CollabError::InvalidArgument(v.to_string()),
            StoreError::Backend(msg) => CollabError::Store(msg),
        }
    }
}
