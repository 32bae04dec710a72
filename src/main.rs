use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use log::{error, info, warn};
use std::sync::Arc;
use uuid::Uuid;

use trialwatch::config::{schedule_time_to_cron, Config};
use trialwatch::crypto::TokenCipher;
use trialwatch::database::Database;
use trialwatch::gmail_client::GmailConnector;
use trialwatch::models::{DateWindow, TrialStatus, DEFAULT_ALERT_DAYS};
use trialwatch::orchestrator::FleetScanner;
use trialwatch::scanner::{EndDatePolicy, ScanOptions, Scanner};
use trialwatch::slack_notifier::SlackNotifier;
use trialwatch::store::TrialStore;

#[derive(Parser)]
#[command(name = "trialwatch")]
#[command(about = "Analyse les boîtes mail des utilisateurs et enregistre les essais gratuits détectés")]
#[command(version = "0.1.0")]
struct Args {
    /// Mode dry-run : classe les messages sans créer d'essais ni avancer les watermarks
    #[arg(short, long)]
    dry_run: bool,

    /// Mode daemon : lance les analyses aux horaires SCHEDULER_TIMES
    #[arg(long)]
    daemon: bool,

    /// Nombre maximum de messages listés par utilisateur (par défaut: SCAN_MAX_RESULTS_PER_USER)
    #[arg(short = 'm', long)]
    max_results: Option<u32>,

    /// Vérifier la configuration sans se connecter
    #[arg(long)]
    check_config: bool,

    /// Lister les essais d'un utilisateur avec les jours restants, puis quitter
    #[arg(long, value_name = "USER_ID")]
    list_trials: Option<Uuid>,

    /// Filtre de statut pour --list-trials (detected, confirmed, canceled, expired)
    #[arg(long, requires = "list_trials")]
    status: Option<TrialStatus>,

    /// Lit un token sur stdin et affiche sa forme chiffrée en JSON
    #[arg(long)]
    encrypt_token: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Charger le fichier .env s'il existe
    dotenv::dotenv().ok();

    // Parser les arguments CLI
    let args = Args::parse();

    // Initialiser le logging
    env_logger::init();

    // Charger la configuration
    let config = Config::new()?;
    let cipher = TokenCipher::from_hex(&config.encryption_key).context("ENCRYPTION_KEY invalide")?;

    // Si demandé, vérifier seulement la configuration
    if args.check_config {
        println!("✅ Configuration valide !");
        println!("🔑 Client OAuth Google: {}", config.google.client_id);
        println!(
            "🗄️  Base de données: {}@{}:{}/{}{}",
            config.database.username,
            config.database.host,
            config.database.port,
            config.database.database,
            if config.database.url.is_some() { " (remplacée par DATABASE_URL)" } else { "" }
        );
        println!(
            "📬 Analyse: {} message(s)/utilisateur, {} utilisateur(s) en parallèle, timeout fournisseur {}s",
            config.scanner.max_results_per_user,
            config.scanner.concurrency,
            config.scanner.provider_timeout_secs
        );
        println!(
            "📅 Planification: {} {:?}",
            if config.scheduler.enabled { "activée" } else { "désactivée" },
            config.scheduler.schedule_times
        );
        println!("💬 Slack: {}", if config.slack.is_some() { "activé" } else { "désactivé" });
        return Ok(());
    }

    if args.encrypt_token {
        return encrypt_token_from_stdin(&cipher);
    }

    let database = Arc::new(Database::new(&config.database).await?);

    if let Some(user_id) = args.list_trials {
        let result = list_trials(database.as_ref(), user_id, args.status).await;
        database.close().await;
        return result;
    }

    let max_results = args.max_results.unwrap_or(config.scanner.max_results_per_user);

    if args.dry_run {
        info!("🧪 Démarrage de trialwatch en mode DRY-RUN");
    } else {
        info!("🚀 Démarrage de trialwatch");
    }

    let fleet = Arc::new(build_fleet(&config, database.clone(), cipher, args.dry_run));

    // Si le mode daemon est activé
    if args.daemon {
        info!("🔄 Démarrage en mode daemon");
        return run_daemon_mode(&config, fleet, max_results).await;
    }

    // Mode one-shot (comportement par défaut)
    let result = fleet.scan_all(max_results).await;
    database.close().await;

    match result {
        Ok(stats) => {
            info!(
                "✅ Analyse terminée: {} utilisateur(s), {} essai(s) créé(s), {} en erreur",
                stats.users, stats.created, stats.failed
            );
            println!("{}", serde_json::to_string(&stats)?);
            Ok(())
        }
        Err(e) => {
            error!("❌ Analyse interrompue: {}", e);
            Err(e.into())
        }
    }
}

fn build_fleet(config: &Config, database: Arc<Database>, cipher: TokenCipher, dry_run: bool) -> FleetScanner {
    let options = ScanOptions {
        provider_timeout: config.scanner.provider_timeout(),
        end_date_policy: EndDatePolicy::MessageReceivedDate,
        dry_run,
    };

    let scanner = Scanner::new(
        database.clone(),
        database.clone(),
        Arc::new(GmailConnector::new(config.google.clone())),
        cipher,
        options,
    );

    // Pas de notifications Slack en mode dry-run
    let slack = match &config.slack {
        Some(slack_config) if !dry_run => match SlackNotifier::new(slack_config) {
            Ok(notifier) => {
                info!("✅ Notifications Slack activées");
                Some(notifier)
            }
            Err(e) => {
                warn!("⚠️  Impossible d'initialiser le notifier Slack: {} - notifications désactivées", e);
                None
            }
        },
        _ => None,
    };

    FleetScanner::new(scanner, database, config.scanner.concurrency).with_slack(slack)
}

async fn list_trials(store: &dyn TrialStore, user_id: Uuid, status: Option<TrialStatus>) -> Result<()> {
    let trials = store
        .find_by_owner_and_status(user_id, status, DateWindow::default())
        .await
        .context("Impossible de lister les essais")?;

    if trials.is_empty() {
        println!("Aucun essai trouvé.");
        return Ok(());
    }

    let today = Utc::now().date_naive();

    println!("{} essai(s) trouvé(s):\n", trials.len());
    println!("{:<40} {:<12} {:<10} {:<10} {:<8}", "Service", "Fin", "Jours", "Statut", "Source");
    println!("{}", "=".repeat(84));

    for trial in trials {
        let marker = if trial.is_due_for_reminder(today, &DEFAULT_ALERT_DAYS) { "⏰" } else { "  " };
        let service: String = trial.service_name.chars().take(38).collect();
        println!(
            "{} {:<38} {:<12} {:<10} {:<10} {:<8}",
            marker,
            service,
            trial.end_date.format("%Y-%m-%d"),
            trial.days_until_expiry(today),
            trial.status,
            trial.source.as_str()
        );
    }

    Ok(())
}

fn encrypt_token_from_stdin(cipher: &TokenCipher) -> Result<()> {
    let mut token = String::new();
    std::io::stdin()
        .read_line(&mut token)
        .context("Impossible de lire le token sur stdin")?;

    let encrypted = cipher.encrypt(token.trim_end_matches(['\r', '\n']))?;
    println!("{}", serde_json::to_string_pretty(&encrypted)?);
    Ok(())
}

async fn run_daemon_mode(config: &Config, fleet: Arc<FleetScanner>, max_results: u32) -> Result<()> {
    use chrono::{Local, Timelike};
    use tokio_cron_scheduler::{Job, JobScheduler};

    if !config.scheduler.enabled {
        error!("❌ Le mode daemon nécessite SCHEDULER_ENABLED=true dans la configuration");
        anyhow::bail!("Scheduler non activé dans la configuration");
    }

    if config.scheduler.schedule_times.is_empty() {
        error!("❌ Aucun horaire de scheduling défini (SCHEDULER_TIMES)");
        anyhow::bail!("Aucun horaire défini");
    }

    info!("📅 Horaires d'analyse configurés : {:?}", config.scheduler.schedule_times);

    let scheduler = JobScheduler::new().await?;

    for schedule_time in &config.scheduler.schedule_times {
        let Some(cron_expr) = schedule_time_to_cron(schedule_time) else {
            error!("❌ Format d'horaire invalide: {}. Utilisez le format HH:MM", schedule_time);
            continue;
        };

        info!("📆 Ajout du job planifié : {} (cron: {})", schedule_time, cron_expr);

        let fleet = fleet.clone();
        let schedule_time = schedule_time.clone();

        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _l| {
            let fleet = fleet.clone();
            let schedule_time = schedule_time.clone();

            Box::pin(async move {
                info!("⏰ Exécution planifiée à {} - Analyse des boîtes mail...", schedule_time);

                match fleet.scan_all(max_results).await {
                    Ok(stats) => info!(
                        "✅ Analyse planifiée terminée à {}: {} utilisateur(s), {} créé(s), {} en erreur",
                        schedule_time, stats.users, stats.created, stats.failed
                    ),
                    Err(e) => error!("❌ Erreur lors de l'analyse planifiée à {}: {}", schedule_time, e),
                }
            })
        })?;

        scheduler.add(job).await?;
    }

    // Démarrer le scheduler
    scheduler.start().await?;

    info!("✅ Daemon démarré. En attente des horaires planifiés...");
    info!("⏸️  Appuyez sur Ctrl+C pour arrêter le daemon");

    // Maintenir le programme en vie
    loop {
        tokio::time::sleep(tokio::time::Duration::from_secs(60)).await;

        let now = Local::now();
        if now.minute() == 0 {
            info!("💓 Daemon actif - {}", now.format("%Y-%m-%d %H:%M"));
        }
    }
}
