use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{CredentialStore, StoreResult, TrialStore};
use crate::error::ScanError;
use crate::models::{
    DateWindow, InsertOutcome, NaturalKey, NewTrial, ScanUser, StoredCredential, Trial,
    TrialPatch, TrialStatus,
};

const GOOGLE_PROVIDER: &str = "google";

#[derive(Debug, Clone)]
struct UserRecord {
    email: String,
    credential: StoredCredential,
    last_seen_internal_date: i64,
    last_scan_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct State {
    users: HashMap<Uuid, UserRecord>,
    trials: Vec<Trial>,
    unavailable: bool,
}

/// In-process trial and credential store.
///
/// Every operation runs under one lock, so conditional inserts are atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> StoreResult<MutexGuard<'_, State>> {
        let state = self
            .state
            .lock()
            .map_err(|_| ScanError::Store("memory store lock poisoned".to_string()))?;
        if state.unavailable {
            return Err(ScanError::Store("memory store unavailable".to_string()));
        }
        Ok(state)
    }

    fn ready<'a, T: Send + 'a>(result: StoreResult<T>) -> BoxFuture<'a, StoreResult<T>> {
        future::ready(result).boxed()
    }

    pub fn add_user(&self, email: &str, credential: StoredCredential) -> StoreResult<()> {
        let mut state = self.state()?;
        state.users.insert(
            credential.user_id,
            UserRecord {
                email: email.to_string(),
                credential,
                last_seen_internal_date: 0,
                last_scan_at: None,
            },
        );
        Ok(())
    }

    pub fn set_initial_watermark(&self, user_id: Uuid, value: i64) -> StoreResult<()> {
        let mut state = self.state()?;
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| ScanError::Store(format!("unknown user {}", user_id)))?;
        user.last_seen_internal_date = value;
        Ok(())
    }

    pub fn last_scan_at(&self, user_id: Uuid) -> StoreResult<Option<DateTime<Utc>>> {
        let state = self.state()?;
        Ok(state.users.get(&user_id).and_then(|u| u.last_scan_at))
    }

    pub fn trials_for(&self, user_id: Uuid) -> StoreResult<Vec<Trial>> {
        let state = self.state()?;
        Ok(state
            .trials
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect())
    }

    /// Simulates a lost connection: every later call fails.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.unavailable = unavailable;
        }
    }

    fn insert_locked(state: &mut State, key: &NaturalKey, new_trial: NewTrial) -> InsertOutcome {
        // Same lookup order as the Postgres conflict path
        let mut keys = vec![key.clone()];
        keys.extend(new_trial.unique_keys());

        for candidate in &keys {
            if let Some(existing) = state.trials.iter().find(|t| candidate.matches(t)) {
                return InsertOutcome::AlreadyExists(existing.clone());
            }
        }

        let trial = new_trial.into_trial(Uuid::new_v4(), Utc::now());
        state.trials.push(trial.clone());
        InsertOutcome::Inserted(trial)
    }

    fn update_locked(
        state: &mut State,
        id: Uuid,
        owner_id: Uuid,
        patch: &TrialPatch,
    ) -> StoreResult<Option<Trial>> {
        let Some(index) = state
            .trials
            .iter()
            .position(|t| t.id == id && t.user_id == owner_id)
        else {
            return Ok(None);
        };

        let current = &state.trials[index];
        let renamed = NaturalKey::ServiceEndDate {
            user_id: owner_id,
            service_name: patch
                .service_name
                .clone()
                .unwrap_or_else(|| current.service_name.clone()),
            end_date: patch.end_date.unwrap_or(current.end_date),
        };
        if state.trials.iter().any(|t| t.id != id && renamed.matches(t)) {
            return Err(ScanError::Validation(
                "another trial already has this service name and end date".to_string(),
            ));
        }

        let trial = &mut state.trials[index];
        patch.apply(trial, Utc::now());
        Ok(Some(trial.clone()))
    }
}

impl TrialStore for MemoryStore {
    fn insert_if_absent<'a>(
        &'a self,
        key: NaturalKey,
        trial: NewTrial,
    ) -> BoxFuture<'a, StoreResult<InsertOutcome>> {
        let result = self
            .state()
            .map(|mut state| Self::insert_locked(&mut state, &key, trial));
        Self::ready(result)
    }

    fn find_by_owner_and_status<'a>(
        &'a self,
        owner_id: Uuid,
        status: Option<TrialStatus>,
        window: DateWindow,
    ) -> BoxFuture<'a, StoreResult<Vec<Trial>>> {
        let result = self.state().map(|state| {
            let mut trials: Vec<Trial> = state
                .trials
                .iter()
                .filter(|t| t.user_id == owner_id)
                .filter(|t| status.map_or(true, |s| t.status == s))
                .filter(|t| window.contains(t.end_date))
                .cloned()
                .collect();
            trials.sort_by_key(|t| t.end_date);
            trials
        });
        Self::ready(result)
    }

    fn update_by_id<'a>(
        &'a self,
        id: Uuid,
        owner_id: Uuid,
        patch: TrialPatch,
    ) -> BoxFuture<'a, StoreResult<Option<Trial>>> {
        if patch.is_empty() {
            return Self::ready(Err(ScanError::Validation("no updates provided".to_string())));
        }
        let result = self
            .state()
            .and_then(|mut state| Self::update_locked(&mut state, id, owner_id, &patch));
        Self::ready(result)
    }

    fn delete_by_id<'a>(&'a self, id: Uuid, owner_id: Uuid) -> BoxFuture<'a, StoreResult<bool>> {
        let result = self.state().map(|mut state| {
            let before = state.trials.len();
            state.trials.retain(|t| !(t.id == id && t.user_id == owner_id));
            state.trials.len() != before
        });
        Self::ready(result)
    }
}

impl CredentialStore for MemoryStore {
    fn list_scannable_users<'a>(&'a self) -> BoxFuture<'a, StoreResult<Vec<ScanUser>>> {
        let result = self.state().map(|state| {
            let mut users: Vec<ScanUser> = state
                .users
                .iter()
                .filter(|(_, u)| {
                    u.credential.provider == GOOGLE_PROVIDER && u.credential.refresh_token.is_some()
                })
                .map(|(id, u)| ScanUser {
                    id: *id,
                    email: u.email.clone(),
                })
                .collect();
            users.sort_by(|a, b| a.email.cmp(&b.email));
            users
        });
        Self::ready(result)
    }

    fn get_credential<'a>(&'a self, user_id: Uuid) -> BoxFuture<'a, StoreResult<StoredCredential>> {
        let result = self.state().and_then(|state| {
            let credential = state.users.get(&user_id).map(|u| u.credential.clone());
            credential.ok_or_else(|| ScanError::credential(user_id, "no stored credential"))
        });
        Self::ready(result)
    }

    fn get_watermark<'a>(&'a self, user_id: Uuid) -> BoxFuture<'a, StoreResult<i64>> {
        let result = self.state().map(|state| {
            state
                .users
                .get(&user_id)
                .map_or(0, |u| u.last_seen_internal_date)
        });
        Self::ready(result)
    }

    fn set_watermark<'a>(
        &'a self,
        user_id: Uuid,
        value: i64,
        scanned_at: DateTime<Utc>,
    ) -> BoxFuture<'a, StoreResult<()>> {
        let result = self.state().and_then(|mut state| {
            let user = state
                .users
                .get_mut(&user_id)
                .ok_or_else(|| ScanError::Store(format!("unknown user {}", user_id)))?;
            user.last_seen_internal_date = user.last_seen_internal_date.max(value);
            user.last_scan_at = Some(scanned_at);
            Ok(())
        });
        Self::ready(result)
    }

    fn touch_last_scan<'a>(
        &'a self,
        user_id: Uuid,
        scanned_at: DateTime<Utc>,
    ) -> BoxFuture<'a, StoreResult<()>> {
        let result = self.state().and_then(|mut state| {
            let user = state
                .users
                .get_mut(&user_id)
                .ok_or_else(|| ScanError::Store(format!("unknown user {}", user_id)))?;
            user.last_scan_at = Some(scanned_at);
            Ok(())
        });
        Self::ready(result)
    }
}
