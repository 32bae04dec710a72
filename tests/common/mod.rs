// Shared fixtures for the scanner and fleet tests
#![allow(dead_code)]

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use trialwatch::crypto::TokenCipher;
use trialwatch::error::ScanError;
use trialwatch::gmail_client::{MailSource, MailSourceFactory, MessageMetadata};
use trialwatch::models::{MailboxCredential, ScanUser, StoredCredential};
use trialwatch::orchestrator::FleetScanner;
use trialwatch::scanner::{ScanOptions, Scanner};
use trialwatch::store::MemoryStore;

pub fn cipher() -> TokenCipher {
    TokenCipher::from_hex(&"5c".repeat(32)).expect("valid test key")
}

pub fn message(internal_date: i64, subject: &str, from: &str, snippet: &str) -> MessageMetadata {
    let mut headers = HashMap::new();
    if !subject.is_empty() {
        headers.insert("Subject".to_string(), subject.to_string());
    }
    if !from.is_empty() {
        headers.insert("From".to_string(), from.to_string());
    }
    MessageMetadata {
        internal_date,
        headers,
        snippet: snippet.to_string(),
    }
}

pub fn trial_message(internal_date: i64) -> MessageMetadata {
    message(
        internal_date,
        "Your free trial ends soon",
        "billing@service.com",
        "you will be charged",
    )
}

pub fn newsletter(internal_date: i64) -> MessageMetadata {
    message(internal_date, "Weekly digest", "friend@example.com", "Here is what happened")
}

/// Scripted mailbox content for one user, most recent message first
#[derive(Clone, Default)]
pub struct Mailbox {
    pub messages: Vec<(String, MessageMetadata)>,
    pub fail_listing: bool,
    pub fail_on: Option<String>,
    pub delay: Option<Duration>,
}

impl Mailbox {
    pub fn with_messages(messages: Vec<(&str, MessageMetadata)>) -> Self {
        Mailbox {
            messages: messages
                .into_iter()
                .map(|(id, meta)| (id.to_string(), meta))
                .collect(),
            ..Mailbox::default()
        }
    }
}

struct ScriptedSource {
    mailbox: Mailbox,
}

impl MailSource for ScriptedSource {
    fn list_recent<'a>(
        &'a self,
        _query: &'a str,
        max_results: u32,
    ) -> BoxFuture<'a, Result<Vec<String>, ScanError>> {
        Box::pin(async move {
            if self.mailbox.fail_listing {
                return Err(ScanError::Provider("429 rate limited".to_string()));
            }
            Ok(self
                .mailbox
                .messages
                .iter()
                .take(max_results as usize)
                .map(|(id, _)| id.clone())
                .collect())
        })
    }

    fn get_metadata<'a>(
        &'a self,
        message_id: &'a str,
    ) -> BoxFuture<'a, Result<MessageMetadata, ScanError>> {
        Box::pin(async move {
            if let Some(delay) = self.mailbox.delay {
                tokio::time::sleep(delay).await;
            }
            if self.mailbox.fail_on.as_deref() == Some(message_id) {
                return Err(ScanError::Provider(format!("500 fetching {}", message_id)));
            }
            self.mailbox
                .messages
                .iter()
                .find(|(id, _)| id == message_id)
                .map(|(_, meta)| meta.clone())
                .ok_or_else(|| ScanError::Provider(format!("404 {}", message_id)))
        })
    }
}

/// Hands out a fresh copy of each user's mailbox per connection
#[derive(Default)]
pub struct ScriptedMail {
    mailboxes: Mutex<HashMap<Uuid, Mailbox>>,
    connects: AtomicUsize,
}

impl ScriptedMail {
    pub fn set_mailbox(&self, user_id: Uuid, mailbox: Mailbox) {
        self.mailboxes
            .lock()
            .expect("mailboxes lock")
            .insert(user_id, mailbox);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl MailSourceFactory for ScriptedMail {
    fn connect<'a>(
        &'a self,
        credential: MailboxCredential,
    ) -> BoxFuture<'a, Result<Box<dyn MailSource>, ScanError>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let mailbox = self
            .mailboxes
            .lock()
            .expect("mailboxes lock")
            .get(&credential.user_id)
            .cloned()
            .unwrap_or_default();
        Box::pin(async move { Ok(Box::new(ScriptedSource { mailbox }) as Box<dyn MailSource>) })
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub mail: Arc<ScriptedMail>,
}

impl Harness {
    pub fn new() -> Self {
        Harness {
            store: Arc::new(MemoryStore::new()),
            mail: Arc::new(ScriptedMail::default()),
        }
    }

    pub fn add_user(&self, email: &str) -> ScanUser {
        let cipher = cipher();
        let user_id = Uuid::new_v4();
        let credential = StoredCredential {
            user_id,
            provider: "google".to_string(),
            access_token: Some(cipher.encrypt("ya29.access").expect("encrypt")),
            refresh_token: Some(cipher.encrypt(&format!("1//refresh-{}", email)).expect("encrypt")),
            expiry: None,
        };
        self.store.add_user(email, credential).expect("add user");
        ScanUser {
            id: user_id,
            email: email.to_string(),
        }
    }

    pub fn add_user_with(&self, email: &str, credential: StoredCredential) -> ScanUser {
        let user = ScanUser {
            id: credential.user_id,
            email: email.to_string(),
        };
        self.store.add_user(email, credential).expect("add user");
        user
    }

    pub fn scanner(&self, options: ScanOptions) -> Scanner {
        Scanner::new(
            self.store.clone(),
            self.store.clone(),
            self.mail.clone(),
            cipher(),
            options,
        )
    }

    pub fn fleet(&self, concurrency: usize) -> FleetScanner {
        FleetScanner::new(
            self.scanner(ScanOptions::default()),
            self.store.clone(),
            concurrency,
        )
    }

    pub async fn watermark(&self, user_id: Uuid) -> i64 {
        use trialwatch::store::CredentialStore;
        self.store.get_watermark(user_id).await.expect("watermark")
    }
}
