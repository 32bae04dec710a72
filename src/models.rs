use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::crypto::EncryptedValue;

/// Days before the end date at which a reminder is due
pub const DEFAULT_ALERT_DAYS: [i64; 3] = [5, 3, 1];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialStatus {
    Detected,
    Confirmed,
    Canceled,
    Expired,
}

impl TrialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrialStatus::Detected => "detected",
            TrialStatus::Confirmed => "confirmed",
            TrialStatus::Canceled => "canceled",
            TrialStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrialStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "detected" => Ok(TrialStatus::Detected),
            "confirmed" => Ok(TrialStatus::Confirmed),
            "canceled" => Ok(TrialStatus::Canceled),
            "expired" => Ok(TrialStatus::Expired),
            other => Err(format!("unknown trial status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrialSource {
    Manual,
    Gmail,
    WebhookPartner,
}

impl TrialSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrialSource::Manual => "manual",
            TrialSource::Gmail => "gmail",
            TrialSource::WebhookPartner => "webhook-partner",
        }
    }
}

impl FromStr for TrialSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TrialSource::Manual),
            "gmail" => Ok(TrialSource::Gmail),
            "webhook-partner" => Ok(TrialSource::WebhookPartner),
            other => Err(format!("unknown trial source '{}'", other)),
        }
    }
}

/// Provenance links attached to a trial
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialLinks {
    pub gmail_message_id: Option<String>,
    pub candidate_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: Uuid,
    pub user_id: Uuid,
    pub service_name: String,
    pub end_date: NaiveDate,
    pub cancel_url: Option<String>,
    pub renewal_price: Option<f64>,
    pub status: TrialStatus,
    pub source: TrialSource,
    pub links: TrialLinks,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trial {
    /// Negative once the end date has passed.
    pub fn days_until_expiry(&self, today: NaiveDate) -> i64 {
        (self.end_date - today).num_days()
    }

    /// Only trials still open (detected or confirmed) get reminders.
    pub fn is_due_for_reminder(&self, today: NaiveDate, alert_days: &[i64]) -> bool {
        matches!(self.status, TrialStatus::Detected | TrialStatus::Confirmed)
            && alert_days.contains(&self.days_until_expiry(today))
    }
}

pub fn date_to_utc_midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// A trial about to be created; the store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTrial {
    pub user_id: Uuid,
    pub service_name: String,
    pub end_date: NaiveDate,
    pub cancel_url: Option<String>,
    pub renewal_price: Option<f64>,
    pub status: TrialStatus,
    pub source: TrialSource,
    pub links: TrialLinks,
}

impl NewTrial {
    pub fn manual(
        user_id: Uuid,
        service_name: impl Into<String>,
        end_date: NaiveDate,
        cancel_url: Option<String>,
        renewal_price: Option<f64>,
    ) -> Self {
        NewTrial {
            user_id,
            service_name: service_name.into(),
            end_date,
            cancel_url,
            renewal_price,
            status: TrialStatus::Detected,
            source: TrialSource::Manual,
            links: TrialLinks::default(),
        }
    }

    pub fn from_partner_webhook(
        user_id: Uuid,
        service_name: impl Into<String>,
        end_date: NaiveDate,
        cancel_url: Option<String>,
        renewal_price: Option<f64>,
        links: TrialLinks,
    ) -> Self {
        NewTrial {
            source: TrialSource::WebhookPartner,
            links,
            ..NewTrial::manual(user_id, service_name, end_date, cancel_url, renewal_price)
        }
    }

    /// Natural key used on the primary creation path
    pub fn service_key(&self) -> NaturalKey {
        NaturalKey::ServiceEndDate {
            user_id: self.user_id,
            service_name: self.service_name.clone(),
            end_date: self.end_date,
        }
    }

    /// Every unique key this trial occupies once stored
    pub fn unique_keys(&self) -> Vec<NaturalKey> {
        let mut keys = vec![self.service_key()];
        if let Some(message_id) = &self.links.gmail_message_id {
            keys.push(NaturalKey::MailboxMessage {
                user_id: self.user_id,
                gmail_message_id: message_id.clone(),
            });
        }
        keys
    }

    pub fn into_trial(self, id: Uuid, now: DateTime<Utc>) -> Trial {
        Trial {
            id,
            user_id: self.user_id,
            service_name: self.service_name,
            end_date: self.end_date,
            cancel_url: self.cancel_url,
            renewal_price: self.renewal_price,
            status: self.status,
            source: self.source,
            links: self.links,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Field combination used to detect duplicate trials
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NaturalKey {
    ServiceEndDate {
        user_id: Uuid,
        service_name: String,
        end_date: NaiveDate,
    },
    MailboxMessage {
        user_id: Uuid,
        gmail_message_id: String,
    },
}

impl NaturalKey {
    pub fn matches(&self, trial: &Trial) -> bool {
        match self {
            NaturalKey::ServiceEndDate {
                user_id,
                service_name,
                end_date,
            } => {
                trial.user_id == *user_id
                    && trial.service_name == *service_name
                    && trial.end_date == *end_date
            }
            NaturalKey::MailboxMessage {
                user_id,
                gmail_message_id,
            } => {
                trial.user_id == *user_id
                    && trial.links.gmail_message_id.as_deref() == Some(gmail_message_id.as_str())
            }
        }
    }
}

/// Result of a conditional insert
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(Trial),
    AlreadyExists(Trial),
}

impl InsertOutcome {
    pub fn was_inserted(&self) -> bool {
        matches!(self, InsertOutcome::Inserted(_))
    }

    pub fn trial(&self) -> &Trial {
        match self {
            InsertOutcome::Inserted(trial) | InsertOutcome::AlreadyExists(trial) => trial,
        }
    }
}

/// Partial update applied by the owning user; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrialPatch {
    pub service_name: Option<String>,
    pub end_date: Option<NaiveDate>,
    pub cancel_url: Option<String>,
    pub renewal_price: Option<f64>,
    pub status: Option<TrialStatus>,
}

impl TrialPatch {
    pub fn is_empty(&self) -> bool {
        self.service_name.is_none()
            && self.end_date.is_none()
            && self.cancel_url.is_none()
            && self.renewal_price.is_none()
            && self.status.is_none()
    }

    pub fn apply(&self, trial: &mut Trial, now: DateTime<Utc>) {
        if let Some(service_name) = &self.service_name {
            trial.service_name = service_name.clone();
        }
        if let Some(end_date) = self.end_date {
            trial.end_date = end_date;
        }
        if let Some(cancel_url) = &self.cancel_url {
            trial.cancel_url = Some(cancel_url.clone());
        }
        if let Some(renewal_price) = self.renewal_price {
            trial.renewal_price = Some(renewal_price);
        }
        if let Some(status) = self.status {
            trial.status = status;
        }
        trial.updated_at = now;
    }
}

/// Inclusive end-date range filter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateWindow {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl DateWindow {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from.map_or(true, |from| date >= from) && self.to.map_or(true, |to| date <= to)
    }
}

/// User eligible for a mailbox scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanUser {
    pub id: Uuid,
    pub email: String,
}

/// Encrypted OAuth tokens as stored for a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredential {
    pub user_id: Uuid,
    pub provider: String,
    pub access_token: Option<EncryptedValue>,
    pub refresh_token: Option<EncryptedValue>,
    pub expiry: Option<DateTime<Utc>>,
}

/// Decrypted tokens handed to a mail source
#[derive(Clone)]
pub struct MailboxCredential {
    pub user_id: Uuid,
    pub access_token: Option<String>,
    pub refresh_token: String,
    pub expiry: Option<DateTime<Utc>>,
}

impl fmt::Debug for MailboxCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailboxCredential")
            .field("user_id", &self.user_id)
            .field("has_access_token", &self.access_token.is_some())
            .field("expiry", &self.expiry)
            .finish()
    }
}

/// Aggregate of one fleet scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStats {
    pub users: usize,
    pub created: usize,
    pub failed: usize,
}
