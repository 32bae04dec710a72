use chrono::{DateTime, NaiveDate, Utc};
use futures::future::BoxFuture;
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::crypto::TokenCipher;
use crate::detector;
use crate::error::ScanError;
use crate::gmail_client::{MailSourceFactory, MessageMetadata};
use crate::models::{
    MailboxCredential, NaturalKey, NewTrial, ScanUser, TrialLinks, TrialSource, TrialStatus,
};
use crate::queries::{MAX_RESULTS_LIMIT, TRIAL_QUERY};
use crate::store::{CredentialStore, TrialStore};

/// Service names longer than this are cut (in characters)
pub const SERVICE_NAME_MAX_CHARS: usize = 80;

pub const UNKNOWN_SERVICE: &str = "Unknown service";

/// How a provisional end date is derived for a detected trial.
///
/// No expiry date is parsed from message content yet; `MessageReceivedDate`
/// stamps the message's own UTC receive date as a visible placeholder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EndDatePolicy {
    #[default]
    MessageReceivedDate,
}

impl EndDatePolicy {
    pub fn end_date(&self, metadata: &MessageMetadata) -> NaiveDate {
        match self {
            EndDatePolicy::MessageReceivedDate => DateTime::from_timestamp_millis(metadata.internal_date)
                .map(|dt| dt.date_naive())
                .unwrap_or_else(|| Utc::now().date_naive()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub provider_timeout: Duration,
    pub end_date_policy: EndDatePolicy,
    /// Classify only: no trial inserts, no watermark writes
    pub dry_run: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        ScanOptions {
            provider_timeout: Duration::from_secs(10),
            end_date_policy: EndDatePolicy::default(),
            dry_run: false,
        }
    }
}

pub fn validate_max_results(max_results: u32) -> Result<(), ScanError> {
    if max_results == 0 || max_results > MAX_RESULTS_LIMIT {
        return Err(ScanError::Validation(format!(
            "max results must be between 1 and {} (got {})",
            MAX_RESULTS_LIMIT, max_results
        )));
    }
    Ok(())
}

/// Subject cut to 80 characters as received, or the unknown-service
/// placeholder when the message has no subject
pub fn service_name_from_subject(subject: &str) -> String {
    let name: String = subject.chars().take(SERVICE_NAME_MAX_CHARS).collect();
    if name.is_empty() {
        UNKNOWN_SERVICE.to_string()
    } else {
        name
    }
}

/// Per-pass counters, logged at the end of each user scan
#[derive(Debug, Default)]
struct PassSummary {
    listed: usize,
    examined: usize,
    candidates: usize,
    created: usize,
}

/// Scans one user's mailbox and ingests detected trials.
pub struct Scanner {
    trials: Arc<dyn TrialStore>,
    credentials: Arc<dyn CredentialStore>,
    mail: Arc<dyn MailSourceFactory>,
    cipher: TokenCipher,
    options: ScanOptions,
}

impl Scanner {
    pub fn new(
        trials: Arc<dyn TrialStore>,
        credentials: Arc<dyn CredentialStore>,
        mail: Arc<dyn MailSourceFactory>,
        cipher: TokenCipher,
        options: ScanOptions,
    ) -> Self {
        Scanner {
            trials,
            credentials,
            mail,
            cipher,
            options,
        }
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Returns the number of trials created (candidates found in dry-run).
    pub async fn scan_user(&self, user: &ScanUser, max_results: u32) -> Result<usize, ScanError> {
        validate_max_results(max_results)?;

        let credential = self.load_credential(user.id).await?;
        let source = self.call_provider(self.mail.connect(credential)).await?;

        let last_seen = self.credentials.get_watermark(user.id).await?;
        debug!("User {}: watermark {}", user.email, last_seen);

        let message_ids = self
            .call_provider(source.list_recent(TRIAL_QUERY, max_results))
            .await?;

        if message_ids.is_empty() {
            info!("User {}: no matching messages", user.email);
            if !self.options.dry_run {
                self.credentials.touch_last_scan(user.id, Utc::now()).await?;
            }
            return Ok(0);
        }

        let mut summary = PassSummary {
            listed: message_ids.len(),
            ..PassSummary::default()
        };
        let mut newest_seen = last_seen;

        // Sequential on purpose: the watermark may only cover fetched messages
        for message_id in &message_ids {
            let metadata = self
                .call_provider(source.get_metadata(message_id))
                .await?;

            if metadata.internal_date <= last_seen {
                debug!("Message {} already seen ({} <= {})", message_id, metadata.internal_date, last_seen);
                continue;
            }
            newest_seen = newest_seen.max(metadata.internal_date);
            summary.examined += 1;

            if !detector::is_trial_candidate(metadata.subject(), metadata.sender(), &metadata.snippet) {
                debug!("Message {} is not a trial candidate", message_id);
                continue;
            }
            summary.candidates += 1;

            let trial = self.provisional_trial(user.id, message_id, &metadata);

            if self.options.dry_run {
                info!(
                    "🧪 [dry-run] User {}: candidate '{}' (message {}, end date {})",
                    user.email, trial.service_name, message_id, trial.end_date
                );
                continue;
            }

            let key = NaturalKey::MailboxMessage {
                user_id: user.id,
                gmail_message_id: message_id.clone(),
            };
            let outcome = self.trials.insert_if_absent(key, trial).await?;
            if outcome.was_inserted() {
                summary.created += 1;
                debug!("Trial '{}' created from message {}", outcome.trial().service_name, message_id);
            } else {
                debug!("Trial for message {} already exists, left untouched", message_id);
            }
        }

        if !self.options.dry_run {
            self.credentials
                .set_watermark(user.id, newest_seen, Utc::now())
                .await?;
        }

        info!(
            "User {}: {} listed, {} new, {} candidate(s), {} trial(s) created, watermark {} -> {}",
            user.email,
            summary.listed,
            summary.examined,
            summary.candidates,
            summary.created,
            last_seen,
            newest_seen
        );

        if self.options.dry_run {
            Ok(summary.candidates)
        } else {
            Ok(summary.created)
        }
    }

    async fn load_credential(&self, user_id: Uuid) -> Result<MailboxCredential, ScanError> {
        let stored = self.credentials.get_credential(user_id).await?;

        let refresh_enc = stored
            .refresh_token
            .ok_or_else(|| ScanError::credential(user_id, "missing refresh token"))?;
        let refresh_token = self
            .cipher
            .decrypt(&refresh_enc)
            .map_err(|e| ScanError::from_crypto(user_id, e))?;

        let access_token = match stored.access_token {
            Some(enc) => Some(
                self.cipher
                    .decrypt(&enc)
                    .map_err(|e| ScanError::from_crypto(user_id, e))?,
            ),
            None => None,
        };

        Ok(MailboxCredential {
            user_id,
            access_token,
            refresh_token,
            expiry: stored.expiry,
        })
    }

    fn provisional_trial(&self, user_id: Uuid, message_id: &str, metadata: &MessageMetadata) -> NewTrial {
        NewTrial {
            user_id,
            service_name: service_name_from_subject(metadata.subject()),
            end_date: self.options.end_date_policy.end_date(metadata),
            cancel_url: None,
            renewal_price: None,
            status: TrialStatus::Detected,
            source: TrialSource::Gmail,
            links: TrialLinks {
                gmail_message_id: Some(message_id.to_string()),
                candidate_id: None,
            },
        }
    }

    async fn call_provider<T>(&self, call: BoxFuture<'_, Result<T, ScanError>>) -> Result<T, ScanError> {
        let timeout = self.options.provider_timeout;
        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| ScanError::Provider(format!("provider call timed out after {:?}", timeout)))?
    }
}
