use futures::stream::{self, StreamExt};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Instant;

use crate::error::ScanError;
use crate::models::{ScanStats, ScanUser};
use crate::scanner::{validate_max_results, Scanner};
use crate::slack_notifier::SlackNotifier;
use crate::store::CredentialStore;

/// Runs the per-user scanner over every eligible user.
///
/// A failing user is logged and counted, never fatal. Only losing the store
/// while enumerating users aborts the run.
pub struct FleetScanner {
    scanner: Scanner,
    credentials: Arc<dyn CredentialStore>,
    concurrency: usize,
    slack: Option<SlackNotifier>,
}

impl FleetScanner {
    pub fn new(scanner: Scanner, credentials: Arc<dyn CredentialStore>, concurrency: usize) -> Self {
        FleetScanner {
            scanner,
            credentials,
            concurrency: concurrency.max(1),
            slack: None,
        }
    }

    pub fn with_slack(mut self, slack: Option<SlackNotifier>) -> Self {
        self.slack = slack;
        self
    }

    pub async fn scan_all(&self, max_results_per_user: u32) -> Result<ScanStats, ScanError> {
        validate_max_results(max_results_per_user)?;

        let started = Instant::now();
        let users = self.credentials.list_scannable_users().await?;

        info!(
            "🚀 Starting fleet scan: {} eligible user(s), up to {} message(s) each, {} in parallel{}",
            users.len(),
            max_results_per_user,
            self.concurrency,
            if self.scanner.options().dry_run { " (dry-run)" } else { "" }
        );

        let scans: Vec<_> = users
            .into_iter()
            .map(|user| self.scan_one(user, max_results_per_user))
            .collect();

        let results: Vec<(ScanUser, Result<usize, ScanError>)> = stream::iter(scans)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut stats = ScanStats::default();
        let mut failures = Vec::new();

        for (user, result) in results {
            stats.users += 1;
            match result {
                Ok(created) => stats.created += created,
                Err(e) => {
                    stats.failed += 1;
                    failures.push((user, e));
                }
            }
        }

        let elapsed = started.elapsed().as_secs_f64();
        info!(
            "🏁 Fleet scan finished in {:.1}s: {} user(s), {} created, {} failed",
            elapsed, stats.users, stats.created, stats.failed
        );

        self.notify(&stats, &failures, elapsed).await;

        Ok(stats)
    }

    async fn scan_one(&self, user: ScanUser, max_results: u32) -> (ScanUser, Result<usize, ScanError>) {
        let result = self.scanner.scan_user(&user, max_results).await;
        if let Err(e) = &result {
            match e {
                ScanError::Credential { .. } => warn!("⚠️  Skipping user {}: {}", user.email, e),
                _ => error!("❌ Scan failed for user {}: {}", user.email, e),
            }
        }
        (user, result)
    }

    async fn notify(&self, stats: &ScanStats, failures: &[(ScanUser, ScanError)], elapsed: f64) {
        let Some(slack) = &self.slack else {
            return;
        };

        for (user, e) in failures {
            if let Err(err) = slack.notify_user_failed(&user.email, &e.to_string()).await {
                warn!("Slack failure notification not sent: {}", err);
            }
        }

        if let Err(err) = slack.notify_scan_completed(stats, elapsed).await {
            warn!("Slack scan summary not sent: {}", err);
        }
    }
}
