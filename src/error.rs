use thiserror::Error;
use uuid::Uuid;

use crate::crypto::CryptoError;

/// Errors raised while scanning one user's mailbox or talking to the stores.
///
/// Everything except `Store` during user enumeration is a per-user failure:
/// the fleet orchestrator counts it and moves on to the next user.
#[derive(Debug, Error)]
pub enum ScanError {
    /// Missing, undecryptable or rejected OAuth credential.
    #[error("credential error for user {user_id}: {reason}")]
    Credential { user_id: Uuid, reason: String },

    /// Mailbox API failure, timeout or transport error.
    #[error("mail provider error: {0}")]
    Provider(String),

    /// Malformed scan parameters, rejected before any network call.
    #[error("invalid scan parameters: {0}")]
    Validation(String),

    /// Trial or credential store failure.
    #[error("store error: {0}")]
    Store(String),
}

impl ScanError {
    pub fn credential(user_id: Uuid, reason: impl Into<String>) -> Self {
        ScanError::Credential {
            user_id,
            reason: reason.into(),
        }
    }

    /// Decryption failures are credential failures for the owning user.
    pub fn from_crypto(user_id: Uuid, err: CryptoError) -> Self {
        ScanError::credential(user_id, err.to_string())
    }
}

impl From<sqlx::Error> for ScanError {
    fn from(err: sqlx::Error) -> Self {
        ScanError::Store(err.to_string())
    }
}

impl From<google_gmail1::Error> for ScanError {
    fn from(err: google_gmail1::Error) -> Self {
        ScanError::Provider(err.to_string())
    }
}
