use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::queries::MAX_RESULTS_LIMIT;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub google: GoogleConfig,
    pub database: DatabaseConfig,
    pub encryption_key: String,
    pub scanner: ScannerConfig,
    pub scheduler: SchedulerConfig,
    pub slack: Option<SlackConfig>,
}

#[derive(Deserialize, Clone)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for GoogleConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleConfig")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl DatabaseConfig {
    pub fn connection_url(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!(
                "postgres://{}:{}@{}:{}/{}",
                self.username, self.password, self.host, self.port, self.database
            ),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScannerConfig {
    pub max_results_per_user: u32,
    pub concurrency: usize,
    pub provider_timeout_secs: u64,
}

impl ScannerConfig {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig {
            max_results_per_user: 50,
            concurrency: 4,
            provider_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub schedule_times: Vec<String>, // Format: "HH:MM" (ex: ["02:00", "14:00"])
}

#[derive(Debug, Deserialize, Clone)]
pub struct SlackConfig {
    pub bot_token: String,
    pub channel_id: String,
}

const REQUIRED_VARS: [&str; 3] = ["GOOGLE_CLIENT_ID", "GOOGLE_CLIENT_SECRET", "ENCRYPTION_KEY"];

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} a une valeur invalide '{}': {}", name, raw, e)),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn new() -> Result<Self> {
        // Vérifier que les variables essentielles sont définies
        Self::check_required_env_vars()?;

        let defaults = ScannerConfig::default();

        // Configuration chargée depuis les variables d'environnement

        let config = Config {
            google: GoogleConfig {
                client_id: std::env::var("GOOGLE_CLIENT_ID").context("GOOGLE_CLIENT_ID doit être défini")?,
                client_secret: std::env::var("GOOGLE_CLIENT_SECRET")
                    .context("GOOGLE_CLIENT_SECRET doit être défini")?,
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL").ok(),
                host: var_or("DB_HOST", "localhost"),
                port: parse_var("DB_PORT", 5432)?,
                database: var_or("DB_NAME", "trialwatch"),
                username: var_or("DB_USERNAME", "postgres"),
                password: var_or("DB_PASSWORD", ""),
            },
            encryption_key: std::env::var("ENCRYPTION_KEY").context("ENCRYPTION_KEY doit être défini")?,
            scanner: ScannerConfig {
                max_results_per_user: parse_var(
                    "SCAN_MAX_RESULTS_PER_USER",
                    defaults.max_results_per_user,
                )?,
                concurrency: parse_var("SCAN_CONCURRENCY", defaults.concurrency)?,
                provider_timeout_secs: parse_var(
                    "SCAN_PROVIDER_TIMEOUT_SECS",
                    defaults.provider_timeout_secs,
                )?,
            },
            scheduler: SchedulerConfig {
                enabled: parse_var("SCHEDULER_ENABLED", false)?,
                schedule_times: parse_schedule_times(&var_or("SCHEDULER_TIMES", "02:00")),
            },
            slack: match (std::env::var("SLACK_BOT_TOKEN"), std::env::var("SLACK_CHANNEL_ID")) {
                (Ok(bot_token), Ok(channel_id)) => Some(SlackConfig {
                    bot_token,
                    channel_id,
                }),
                _ => {
                    log::warn!("SLACK_BOT_TOKEN ou SLACK_CHANNEL_ID non défini - notifications Slack désactivées");
                    None
                }
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn check_required_env_vars() -> Result<()> {
        let missing_vars: Vec<&str> = REQUIRED_VARS
            .iter()
            .copied()
            .filter(|var| std::env::var(var).is_err())
            .collect();

        if !missing_vars.is_empty() {
            anyhow::bail!(
                "Variables d'environnement manquantes: {}\n\
                 \n\
                 💡 Solutions:\n\
                 1. Créez un fichier .env avec vos valeurs:\n\
                    GOOGLE_CLIENT_ID=...\n\
                    GOOGLE_CLIENT_SECRET=...\n\
                    ENCRYPTION_KEY=<64 caractères hex>\n\
                 \n\
                 2. Ou exportez-les manuellement avant de lancer:\n\
                    export ENCRYPTION_KEY=$(openssl rand -hex 32)\n\
                    cargo run -- --check-config",
                missing_vars.join(", ")
            );
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let max_results = self.scanner.max_results_per_user;
        if max_results == 0 || max_results > MAX_RESULTS_LIMIT {
            anyhow::bail!(
                "SCAN_MAX_RESULTS_PER_USER doit être compris entre 1 et {} (reçu {})",
                MAX_RESULTS_LIMIT,
                max_results
            );
        }
        if self.scanner.concurrency == 0 {
            anyhow::bail!("SCAN_CONCURRENCY doit valoir au moins 1");
        }
        if self.scanner.provider_timeout_secs == 0 {
            anyhow::bail!("SCAN_PROVIDER_TIMEOUT_SECS doit valoir au moins 1");
        }
        Ok(())
    }
}

/// Découpe une liste "HH:MM" séparée par des virgules, sans les entrées vides.
pub fn parse_schedule_times(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// "HH:MM" vers une expression cron quotidienne (champ secondes en premier)
pub fn schedule_time_to_cron(schedule_time: &str) -> Option<String> {
    let (hour, minute) = schedule_time.split_once(':')?;
    let hour: u32 = hour.trim().parse().ok()?;
    let minute: u32 = minute.trim().parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some(format!("0 {} {} * * *", minute, hour))
}
