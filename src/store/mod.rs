//! Storage contracts consumed by the scanner and the fleet orchestrator

pub mod memory;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use uuid::Uuid;

use crate::error::ScanError;
use crate::models::{
    DateWindow, InsertOutcome, NaturalKey, NewTrial, ScanUser, StoredCredential, Trial,
    TrialPatch, TrialStatus,
};

pub use memory::MemoryStore;

pub type StoreResult<T> = Result<T, ScanError>;

/// Trial records, keyed by generated id and deduplicated by natural key
pub trait TrialStore: Send + Sync {
    /// Single conditional insert: never overwrites an existing record.
    fn insert_if_absent<'a>(
        &'a self,
        key: NaturalKey,
        trial: NewTrial,
    ) -> BoxFuture<'a, StoreResult<InsertOutcome>>;

    /// Owner's trials ordered by end date
    fn find_by_owner_and_status<'a>(
        &'a self,
        owner_id: Uuid,
        status: Option<TrialStatus>,
        window: DateWindow,
    ) -> BoxFuture<'a, StoreResult<Vec<Trial>>>;

    /// `None` when no trial with that id belongs to the owner
    fn update_by_id<'a>(
        &'a self,
        id: Uuid,
        owner_id: Uuid,
        patch: TrialPatch,
    ) -> BoxFuture<'a, StoreResult<Option<Trial>>>;

    fn delete_by_id<'a>(&'a self, id: Uuid, owner_id: Uuid) -> BoxFuture<'a, StoreResult<bool>>;
}

/// Per-user OAuth tokens and mailbox scan cursor
pub trait CredentialStore: Send + Sync {
    /// Google users holding a non-null refresh token
    fn list_scannable_users<'a>(&'a self) -> BoxFuture<'a, StoreResult<Vec<ScanUser>>>;

    fn get_credential<'a>(&'a self, user_id: Uuid) -> BoxFuture<'a, StoreResult<StoredCredential>>;

    /// Defaults to 0 when the user has never been scanned
    fn get_watermark<'a>(&'a self, user_id: Uuid) -> BoxFuture<'a, StoreResult<i64>>;

    /// Stores `max(current, value)` and the scan time in a single write.
    fn set_watermark<'a>(
        &'a self,
        user_id: Uuid,
        value: i64,
        scanned_at: DateTime<Utc>,
    ) -> BoxFuture<'a, StoreResult<()>>;

    /// Advances only `last_scan_at`
    fn touch_last_scan<'a>(
        &'a self,
        user_id: Uuid,
        scanned_at: DateTime<Utc>,
    ) -> BoxFuture<'a, StoreResult<()>>;
}
