use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use log::{debug, info};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::crypto::EncryptedValue;
use crate::error::ScanError;
use crate::models::{
    date_to_utc_midnight, DateWindow, InsertOutcome, NaturalKey, NewTrial, ScanUser,
    StoredCredential, Trial, TrialLinks, TrialPatch, TrialStatus,
};
use crate::store::{CredentialStore, StoreResult, TrialStore};

const TRIAL_COLUMNS: &str = "id, user_id, service_name, end_date, cancel_url, renewal_price, \
     status, source, gmail_message_id, candidate_id, created_at, updated_at";

pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to PostgreSQL database");

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.connection_url())
            .await
            .context("Unable to connect to the database")?;

        info!("Database connection established");

        let db = Database { pool };

        // Create tables if they don't exist
        db.create_tables_if_not_exists().await?;

        Ok(db)
    }

    async fn create_tables_if_not_exists(&self) -> Result<()> {
        info!("Checking/creating database tables");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                email VARCHAR(320) UNIQUE NOT NULL,
                name VARCHAR(255),
                provider VARCHAR(64) NOT NULL DEFAULT 'google',
                access_token_data TEXT,
                access_token_nonce TEXT,
                refresh_token_data TEXT,
                refresh_token_nonce TEXT,
                token_expiry TIMESTAMPTZ,
                last_seen_internal_date BIGINT NOT NULL DEFAULT 0,
                last_scan_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Unable to create users table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trials (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                service_name TEXT NOT NULL,
                end_date TIMESTAMPTZ NOT NULL,
                cancel_url TEXT,
                renewal_price DOUBLE PRECISION,
                status VARCHAR(16) NOT NULL DEFAULT 'detected',
                source VARCHAR(32) NOT NULL,
                gmail_message_id VARCHAR(255),
                candidate_id VARCHAR(255),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Unable to create trials table")?;

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_trials_user_status ON trials (user_id, status)",
            "CREATE INDEX IF NOT EXISTS idx_trials_user_end_date ON trials (user_id, end_date)",
            "CREATE UNIQUE INDEX IF NOT EXISTS uq_trials_user_service_end \
             ON trials (user_id, service_name, end_date)",
            "CREATE UNIQUE INDEX IF NOT EXISTS uq_trials_user_gmail_message \
             ON trials (user_id, gmail_message_id) WHERE gmail_message_id IS NOT NULL",
        ];
        for statement in indexes {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Unable to create index: {}", statement))?;
        }

        info!("Database tables checked/created successfully");
        Ok(())
    }

    pub async fn close(&self) {
        info!("Closing database connection");
        self.pool.close().await;
    }

    // ------------------------------------------------------------------
    // Trials
    // ------------------------------------------------------------------

    async fn insert_trial_if_absent(&self, key: NaturalKey, trial: NewTrial) -> StoreResult<InsertOutcome> {
        // ON CONFLICT without a target covers both unique indexes in one statement
        let query = format!(
            r#"
            INSERT INTO trials
            (user_id, service_name, end_date, cancel_url, renewal_price, status, source,
             gmail_message_id, candidate_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT DO NOTHING
            RETURNING {}
            "#,
            TRIAL_COLUMNS
        );

        let inserted = sqlx::query(&query)
            .bind(trial.user_id)
            .bind(&trial.service_name)
            .bind(date_to_utc_midnight(trial.end_date))
            .bind(&trial.cancel_url)
            .bind(trial.renewal_price)
            .bind(trial.status.as_str())
            .bind(trial.source.as_str())
            .bind(&trial.links.gmail_message_id)
            .bind(&trial.links.candidate_id)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = inserted {
            let trial = trial_from_row(&row)?;
            debug!("Trial {} inserted for user {}", trial.id, trial.user_id);
            return Ok(InsertOutcome::Inserted(trial));
        }

        // The conflict may come from the other unique index than `key`
        let mut candidates = vec![key];
        candidates.extend(trial.unique_keys());

        for candidate in &candidates {
            if let Some(existing) = self.find_by_natural_key(candidate).await? {
                debug!("Trial {} already exists, insert skipped", existing.id);
                return Ok(InsertOutcome::AlreadyExists(existing));
            }
        }

        Err(ScanError::Store(
            "insert conflicted but no existing trial was found".to_string(),
        ))
    }

    async fn find_by_natural_key(&self, key: &NaturalKey) -> StoreResult<Option<Trial>> {
        let row = match key {
            NaturalKey::ServiceEndDate {
                user_id,
                service_name,
                end_date,
            } => {
                sqlx::query(&format!(
                    "SELECT {} FROM trials WHERE user_id = $1 AND service_name = $2 AND end_date = $3",
                    TRIAL_COLUMNS
                ))
                .bind(user_id)
                .bind(service_name)
                .bind(date_to_utc_midnight(*end_date))
                .fetch_optional(&self.pool)
                .await?
            }
            NaturalKey::MailboxMessage {
                user_id,
                gmail_message_id,
            } => {
                sqlx::query(&format!(
                    "SELECT {} FROM trials WHERE user_id = $1 AND gmail_message_id = $2",
                    TRIAL_COLUMNS
                ))
                .bind(user_id)
                .bind(gmail_message_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        row.as_ref().map(trial_from_row).transpose()
    }

    async fn find_trials(
        &self,
        owner_id: Uuid,
        status: Option<TrialStatus>,
        window: DateWindow,
    ) -> StoreResult<Vec<Trial>> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM trials WHERE user_id = ", TRIAL_COLUMNS));
        builder.push_bind(owner_id);

        if let Some(status) = status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(from) = window.from {
            builder.push(" AND end_date >= ").push_bind(date_to_utc_midnight(from));
        }
        if let Some(to) = window.to {
            builder.push(" AND end_date <= ").push_bind(date_to_utc_midnight(to));
        }
        builder.push(" ORDER BY end_date ASC");

        let rows = builder.build().fetch_all(&self.pool).await?;

        rows.iter().map(trial_from_row).collect()
    }

    async fn update_trial(&self, id: Uuid, owner_id: Uuid, patch: TrialPatch) -> StoreResult<Option<Trial>> {
        if patch.is_empty() {
            return Err(ScanError::Validation("no updates provided".to_string()));
        }

        let query = format!(
            r#"
            UPDATE trials SET
                service_name = COALESCE($3, service_name),
                end_date = COALESCE($4, end_date),
                cancel_url = COALESCE($5, cancel_url),
                renewal_price = COALESCE($6, renewal_price),
                status = COALESCE($7, status),
                updated_at = NOW()
            WHERE id = $1 AND user_id = $2
            RETURNING {}
            "#,
            TRIAL_COLUMNS
        );

        let row = sqlx::query(&query)
            .bind(id)
            .bind(owner_id)
            .bind(&patch.service_name)
            .bind(patch.end_date.map(date_to_utc_midnight))
            .bind(&patch.cancel_url)
            .bind(patch.renewal_price)
            .bind(patch.status.map(|s| s.as_str()))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(db) = &e {
                    if db.is_unique_violation() {
                        return ScanError::Validation(
                            "another trial already has this service name and end date".to_string(),
                        );
                    }
                }
                ScanError::from(e)
            })?;

        row.as_ref().map(trial_from_row).transpose()
    }

    async fn delete_trial(&self, id: Uuid, owner_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM trials WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(owner_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // ------------------------------------------------------------------
    // Users and credentials
    // ------------------------------------------------------------------

    async fn scannable_users(&self) -> StoreResult<Vec<ScanUser>> {
        let rows = sqlx::query(
            r#"
            SELECT id, email FROM users
            WHERE provider = 'google' AND refresh_token_data IS NOT NULL
            ORDER BY email
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let users = rows
            .iter()
            .map(|row| -> Result<ScanUser, sqlx::Error> {
                Ok(ScanUser {
                    id: row.try_get("id")?,
                    email: row.try_get("email")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(users)
    }

    async fn credential(&self, user_id: Uuid) -> StoreResult<StoredCredential> {
        let row = sqlx::query(
            r#"
            SELECT provider, access_token_data, access_token_nonce,
                   refresh_token_data, refresh_token_nonce, token_expiry
            FROM users WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ScanError::credential(user_id, "no stored credential"))?;

        Ok(StoredCredential {
            user_id,
            provider: row.try_get("provider")?,
            access_token: encrypted_pair(
                row.try_get("access_token_data")?,
                row.try_get("access_token_nonce")?,
            ),
            refresh_token: encrypted_pair(
                row.try_get("refresh_token_data")?,
                row.try_get("refresh_token_nonce")?,
            ),
            expiry: row.try_get("token_expiry")?,
        })
    }

    async fn watermark(&self, user_id: Uuid) -> StoreResult<i64> {
        let value: Option<i64> =
            sqlx::query_scalar("SELECT last_seen_internal_date FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(value.unwrap_or(0))
    }

    async fn store_watermark(&self, user_id: Uuid, value: i64, scanned_at: DateTime<Utc>) -> StoreResult<()> {
        // GREATEST keeps the watermark monotonic even under concurrent scans
        let result = sqlx::query(
            r#"
            UPDATE users SET
                last_seen_internal_date = GREATEST(last_seen_internal_date, $2),
                last_scan_at = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(value)
        .bind(scanned_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ScanError::Store(format!("unknown user {}", user_id)));
        }

        debug!("Watermark for user {} stored ({})", user_id, value);
        Ok(())
    }

    async fn store_last_scan(&self, user_id: Uuid, scanned_at: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query("UPDATE users SET last_scan_at = $2, updated_at = NOW() WHERE id = $1")
            .bind(user_id)
            .bind(scanned_at)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ScanError::Store(format!("unknown user {}", user_id)));
        }
        Ok(())
    }
}

fn encrypted_pair(data: Option<String>, nonce: Option<String>) -> Option<EncryptedValue> {
    match (data, nonce) {
        (Some(data), Some(nonce)) => Some(EncryptedValue { data, nonce }),
        _ => None,
    }
}

fn trial_from_row(row: &PgRow) -> StoreResult<Trial> {
    let status: String = row.try_get("status")?;
    let source: String = row.try_get("source")?;
    let end_date: DateTime<Utc> = row.try_get("end_date")?;

    Ok(Trial {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        service_name: row.try_get("service_name")?,
        end_date: end_date.date_naive(),
        cancel_url: row.try_get("cancel_url")?,
        renewal_price: row.try_get("renewal_price")?,
        status: status.parse().map_err(ScanError::Store)?,
        source: source.parse().map_err(ScanError::Store)?,
        links: TrialLinks {
            gmail_message_id: row.try_get("gmail_message_id")?,
            candidate_id: row.try_get("candidate_id")?,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl TrialStore for Database {
    fn insert_if_absent<'a>(
        &'a self,
        key: NaturalKey,
        trial: NewTrial,
    ) -> BoxFuture<'a, StoreResult<InsertOutcome>> {
        Box::pin(self.insert_trial_if_absent(key, trial))
    }

    fn find_by_owner_and_status<'a>(
        &'a self,
        owner_id: Uuid,
        status: Option<TrialStatus>,
        window: DateWindow,
    ) -> BoxFuture<'a, StoreResult<Vec<Trial>>> {
        Box::pin(self.find_trials(owner_id, status, window))
    }

    fn update_by_id<'a>(
        &'a self,
        id: Uuid,
        owner_id: Uuid,
        patch: TrialPatch,
    ) -> BoxFuture<'a, StoreResult<Option<Trial>>> {
        Box::pin(self.update_trial(id, owner_id, patch))
    }

    fn delete_by_id<'a>(&'a self, id: Uuid, owner_id: Uuid) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(self.delete_trial(id, owner_id))
    }
}

impl CredentialStore for Database {
    fn list_scannable_users<'a>(&'a self) -> BoxFuture<'a, StoreResult<Vec<ScanUser>>> {
        Box::pin(self.scannable_users())
    }

    fn get_credential<'a>(&'a self, user_id: Uuid) -> BoxFuture<'a, StoreResult<StoredCredential>> {
        Box::pin(self.credential(user_id))
    }

    fn get_watermark<'a>(&'a self, user_id: Uuid) -> BoxFuture<'a, StoreResult<i64>> {
        Box::pin(self.watermark(user_id))
    }

    fn set_watermark<'a>(
        &'a self,
        user_id: Uuid,
        value: i64,
        scanned_at: DateTime<Utc>,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(self.store_watermark(user_id, value, scanned_at))
    }

    fn touch_last_scan<'a>(
        &'a self,
        user_id: Uuid,
        scanned_at: DateTime<Utc>,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(self.store_last_scan(user_id, scanned_at))
    }
}
