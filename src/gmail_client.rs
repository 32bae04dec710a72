use futures::future::BoxFuture;
use google_gmail1::api::Scope;
use google_gmail1::{hyper, hyper_rustls, oauth2, Gmail};
use log::{debug, info};
use std::collections::HashMap;

use crate::config::GoogleConfig;
use crate::error::ScanError;
use crate::models::MailboxCredential;

/// Headers requested with every metadata fetch
pub const METADATA_HEADERS: [&str; 3] = ["From", "Subject", "Date"];

/// Header metadata and provider preview of one message; never the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageMetadata {
    /// Provider receive time, milliseconds since epoch
    pub internal_date: i64,
    pub headers: HashMap<String, String>,
    pub snippet: String,
}

impl MessageMetadata {
    pub fn header(&self, name: &str) -> &str {
        self.headers.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn subject(&self) -> &str {
        self.header("Subject")
    }

    pub fn sender(&self) -> &str {
        self.header("From")
    }
}

/// Read access to one user's mailbox
pub trait MailSource: Send + Sync {
    /// Message ids matching `query`, most recent first, at most `max_results`
    fn list_recent<'a>(
        &'a self,
        query: &'a str,
        max_results: u32,
    ) -> BoxFuture<'a, Result<Vec<String>, ScanError>>;

    fn get_metadata<'a>(
        &'a self,
        message_id: &'a str,
    ) -> BoxFuture<'a, Result<MessageMetadata, ScanError>>;
}

/// Builds a fresh, unshared mail source from a decrypted credential
pub trait MailSourceFactory: Send + Sync {
    fn connect<'a>(
        &'a self,
        credential: MailboxCredential,
    ) -> BoxFuture<'a, Result<Box<dyn MailSource>, ScanError>>;
}

type HttpsConnector = hyper_rustls::HttpsConnector<hyper::client::HttpConnector>;

pub struct GmailClient {
    hub: Gmail<HttpsConnector>,
}

impl GmailClient {
    pub async fn new(config: &GoogleConfig, credential: MailboxCredential) -> Result<Self, ScanError> {
        debug!("Connecting to Gmail API for user {}", credential.user_id);

        if credential.refresh_token.trim().is_empty() {
            return Err(ScanError::credential(credential.user_id, "missing refresh token"));
        }

        // Refresh-token flow: the stored access token is short-lived and only
        // informative here, the authenticator mints a new one when needed.
        let secret = oauth2::authorized_user::AuthorizedUserSecret {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            refresh_token: credential.refresh_token.clone(),
            key_type: "authorized_user".to_string(),
        };

        let auth = oauth2::AuthorizedUserAuthenticator::builder(secret)
            .build()
            .await
            .map_err(|e| ScanError::credential(credential.user_id, e.to_string()))?;

        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| ScanError::Provider(format!("unable to load TLS roots: {}", e)))?
            .https_only()
            .enable_http1()
            .build();

        let client = hyper::Client::builder().build(connector);
        let hub = Gmail::new(client, auth);

        debug!(
            "Gmail client ready for user {} (cached access token: {})",
            credential.user_id,
            credential.access_token.is_some()
        );

        Ok(GmailClient { hub })
    }

    async fn search(&self, query: &str, max_results: u32) -> Result<Vec<String>, ScanError> {
        debug!("Search criteria: {} (max {})", query, max_results);

        let (_, response) = self
            .hub
            .users()
            .messages_list("me")
            .q(query)
            .max_results(max_results)
            .add_scope(Scope::Readonly)
            .doit()
            .await?;

        let message_ids: Vec<String> = response
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|msg| msg.id)
            .take(max_results as usize)
            .collect();

        debug!("Found {} matching message(s)", message_ids.len());

        Ok(message_ids)
    }

    async fn fetch_metadata(&self, message_id: &str) -> Result<MessageMetadata, ScanError> {
        debug!("Retrieving email metadata for ID: {}", message_id);

        let mut call = self
            .hub
            .users()
            .messages_get("me", message_id)
            .format("metadata");
        for header in METADATA_HEADERS {
            call = call.add_metadata_headers(header);
        }

        let (_, message) = call.add_scope(Scope::Readonly).doit().await?;

        let mut headers = HashMap::new();
        if let Some(part_headers) = message.payload.and_then(|p| p.headers) {
            for header in part_headers {
                if let (Some(name), Some(value)) = (header.name, header.value) {
                    if !name.is_empty() && !value.is_empty() {
                        headers.insert(name, value);
                    }
                }
            }
        }

        Ok(MessageMetadata {
            internal_date: message.internal_date.unwrap_or(0),
            headers,
            snippet: message.snippet.unwrap_or_default(),
        })
    }
}

impl MailSource for GmailClient {
    fn list_recent<'a>(
        &'a self,
        query: &'a str,
        max_results: u32,
    ) -> BoxFuture<'a, Result<Vec<String>, ScanError>> {
        Box::pin(self.search(query, max_results))
    }

    fn get_metadata<'a>(
        &'a self,
        message_id: &'a str,
    ) -> BoxFuture<'a, Result<MessageMetadata, ScanError>> {
        Box::pin(self.fetch_metadata(message_id))
    }
}

/// Opens one Gmail client per user scan
pub struct GmailConnector {
    config: GoogleConfig,
}

impl GmailConnector {
    pub fn new(config: GoogleConfig) -> Self {
        info!("Gmail connector configured (read-only scope)");
        GmailConnector { config }
    }
}

impl MailSourceFactory for GmailConnector {
    fn connect<'a>(
        &'a self,
        credential: MailboxCredential,
    ) -> BoxFuture<'a, Result<Box<dyn MailSource>, ScanError>> {
        Box::pin(async move {
            let client = GmailClient::new(&self.config, credential).await?;
            Ok(Box::new(client) as Box<dyn MailSource>)
        })
    }
}
