//! Collaborator traits consumed by [`UploadManager`](crate::UploadManager).
//!
//! The manager never talks to storage or key management directly. It
//! hands a [`TransferRequest`] to a [`Transfer`] and gets its key from a
//! [`KeyProvider`], which keeps the state machine testable with mocks.

use std::future::Future;
use std::pin::Pin;

use vaultline_crypto::ContentKey;

use crate::error::UploadError;
use crate::types::{FileRef, TransferOutcome, TransferRequest};

/// Moves one file's content to its destination.
///
/// Implementations must observe `request.cancel` and return
/// [`TransferOutcome::Cancelled`] once it fires, and must poll
/// `request.pause` at least before every chunk dispatch, returning
/// [`TransferOutcome::Paused`] once it is raised.
pub trait Transfer: Send + Sync {
    fn transfer(
        &self,
        request: TransferRequest,
    ) -> Pin<Box<dyn Future<Output = TransferOutcome> + Send + '_>>;
}

/// Supplies the content-encryption key for a file.
pub trait KeyProvider: Send + Sync {
    fn content_key<'a>(
        &'a self,
        file: &'a FileRef,
    ) -> Pin<Box<dyn Future<Output = Result<ContentKey, UploadError>> + Send + 'a>>;
}

/// Generates a fresh random key for every file.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomKeyProvider;

impl KeyProvider for RandomKeyProvider {
    fn content_key<'a>(
        &'a self,
        _file: &'a FileRef,
    ) -> Pin<Box<dyn Future<Output = Result<ContentKey, UploadError>> + Send + 'a>> {
        Box::pin(async { Ok(ContentKey::generate()) })
    }
}
