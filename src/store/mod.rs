//! Store (C6): persists transaction records and policy rules (spec §4.6).
//!
//! Owns connection setup, migration running, and schema-version validation
//! against the `transactions`/`policy_rules` tables. 256-bit quantities are
//! stored as decimal text (matching the wire encoding in
//! [`crate::serde_utils`]) rather than pulling in a big-decimal crate purely
//! for storage.

use std::cmp::Ordering;
use std::ops::Deref;
use std::str::FromStr;

use alloy_primitives::{Address, B256, U256};
use anyhow::{anyhow, Context, Error as ErrReport};
use chrono::{DateTime, Utc};
use sqlx::migrate::{Migrate, MigrateDatabase, Migrator};
use sqlx::pool::PoolOptions;
use sqlx::{Executor, Pool, Postgres, Row};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::config::DatabaseConfig;
use crate::domain::{PolicyRule, PolicyRuleKind, TokenKind, TransactionRecord, TxStatus};
use crate::policy::schema;

static MIGRATOR: Migrator = sqlx::migrate!("schemas/database");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store error: {0}")]
    Internal(#[from] sqlx::Error),
    #[error("transaction {0} is already recorded")]
    DuplicateTxHash(B256),
    #[error("transaction {tx_hash} is not in pending status, refusing transition to {to:?}")]
    InvalidTransition { tx_hash: B256, to: TxStatus },
    #[error("policy rule value invalid: {0}")]
    InvalidRuleValue(#[from] schema::SchemaError),
    #[error("no record found")]
    NotFound,
    #[error("stored data could not be decoded: {0}")]
    Corrupt(String),
}

pub struct Store {
    pool: Pool<Postgres>,
}

impl Deref for Store {
    type Target = Pool<Postgres>;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl Store {
    #[instrument(skip_all)]
    pub async fn new(config: &DatabaseConfig) -> Result<Self, ErrReport> {
        info!(url = %&config.database, "connecting to database");

        if config.migrate && !Postgres::database_exists(config.database.expose()).await? {
            warn!(url = %&config.database, "database does not exist, creating");
            Postgres::create_database(config.database.expose()).await?;
        }

        let pool = PoolOptions::<Postgres>::new()
            .max_connections(config.max_connections)
            .after_connect(|conn, _| {
                Box::pin(async move {
                    conn.execute("SET DEFAULT_TRANSACTION_ISOLATION TO 'READ COMMITTED'")
                        .await?;
                    Ok(())
                })
            })
            .connect(config.database.expose())
            .await
            .context("connecting to database")?;

        let version: String = pool
            .fetch_one("SELECT version()")
            .await
            .context("fetching database version")?
            .get(0);
        info!(%version, "connected to database");

        let latest = MIGRATOR
            .migrations
            .last()
            .expect("no migrations embedded")
            .version;

        if config.migrate {
            info!("running migrations");
            MIGRATOR.run(&pool).await?;
        }

        let mut conn = pool.acquire().await?;
        if conn.dirty_version().await?.is_some() {
            error!("database is in an incomplete migration state");
            return Err(anyhow!("database is in an incomplete migration state"));
        }

        let applied = conn
            .list_applied_migrations()
            .await?
            .last()
            .expect("no migrations applied")
            .version;

        match applied.cmp(&latest) {
            Ordering::Less => {
                return Err(anyhow!(
                    "database schema ({applied}) is behind the binary's migrations ({latest})"
                ));
            }
            Ordering::Greater => {
                return Err(anyhow!(
                    "database schema ({applied}) is newer than the binary's migrations ({latest}); update the binary"
                ));
            }
            Ordering::Equal => info!(version = applied, "database schema is up to date"),
        }

        Ok(Self { pool })
    }

    /// Inserts a `pending` record. Fails with [`StoreError::DuplicateTxHash`]
    /// if `tx_hash` already exists (spec §4.6: "insertion is unique on
    /// tx-hash and rejects duplicates").
    #[instrument(skip(self, record), fields(tx_hash = %record.tx_hash))]
    pub async fn insert_pending(&self, record: &TransactionRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
            INSERT INTO transactions (
                tx_hash, account_from, account_to, network, token_address, token_kind,
                amount, token_id, status, declared_gas_limit, effective_gas_price,
                relayer_address, sequence_number, submitted_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)
            ON CONFLICT (tx_hash) DO NOTHING
            ",
        )
        .bind(hex(&record.tx_hash))
        .bind(hex(&record.from))
        .bind(hex(&record.to))
        .bind(&record.network)
        .bind(record.token_address.as_ref().map(hex))
        .bind(record.token_kind.map(token_kind_str))
        .bind(record.amount.map(|v| v.to_string()))
        .bind(record.token_id.map(|v| v.to_string()))
        .bind(tx_status_str(TxStatus::Pending))
        .bind(record.declared_gas_limit.to_string())
        .bind(record.effective_gas_price.to_string())
        .bind(hex(&record.relayer_address))
        .bind(record.sequence_number.to_string())
        .bind(record.submitted_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateTxHash(record.tx_hash));
        }
        Ok(())
    }

    /// Transitions a record from `pending` to a terminal status with
    /// observed receipt fields. Guarded: only `pending -> X` succeeds (spec
    /// §4.6).
    #[instrument(skip(self))]
    pub async fn finalize(
        &self,
        tx_hash: B256,
        status: TxStatus,
        observed_gas_used: Option<U256>,
        block_number: Option<u64>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
            UPDATE transactions
            SET status = $2, observed_gas_used = $3, block_number = $4, updated_at = now()
            WHERE tx_hash = $1 AND status = $5
            ",
        )
        .bind(hex(&tx_hash))
        .bind(tx_status_str(status))
        .bind(observed_gas_used.map(|v| v.to_string()))
        .bind(block_number.map(|n| n as i64))
        .bind(tx_status_str(TxStatus::Pending))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::InvalidTransition { tx_hash, to: status });
        }
        Ok(())
    }

    /// Records that a pending submission has been unobservable on chain past
    /// the grace window, without yet declaring it `dropped` (spec §4.8's
    /// Confirmation Tracker "stuck" outcome).
    #[instrument(skip(self))]
    pub async fn mark_stuck(&self, tx_hash: B256, since: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r"UPDATE transactions SET stuck_since = $2, updated_at = now()
               WHERE tx_hash = $1 AND status = $3 AND stuck_since IS NULL",
        )
        .bind(hex(&tx_hash))
        .bind(since)
        .bind(tx_status_str(TxStatus::Pending))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_by_hash(&self, tx_hash: B256) -> Result<Option<TransactionRecord>, StoreError> {
        let row = sqlx::query(
            r"SELECT tx_hash, account_from, account_to, network, token_address, token_kind,
                      amount, token_id, status, declared_gas_limit, effective_gas_price,
                      observed_gas_used, block_number, relayer_address, sequence_number,
                      submitted_at, updated_at, stuck_since
               FROM transactions WHERE tx_hash = $1",
        )
        .bind(hex(&tx_hash))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| row_to_record(&row)).transpose()
    }

    /// Lists records in which `account` appears as either party (spec §6's
    /// listing endpoint: "given an address, returns records in which it
    /// appears as either party"), newest first, with an offset/limit.
    #[instrument(skip(self))]
    pub async fn list_for_account(
        &self,
        account: Address,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let rows = sqlx::query(
            r"SELECT tx_hash, account_from, account_to, network, token_address, token_kind,
                      amount, token_id, status, declared_gas_limit, effective_gas_price,
                      observed_gas_used, block_number, relayer_address, sequence_number,
                      submitted_at, updated_at, stuck_since
               FROM transactions
               WHERE account_from = $1 OR account_to = $1
               ORDER BY submitted_at DESC
               OFFSET $2 LIMIT $3",
        )
        .bind(hex(&account))
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    /// Attempts to take the Confirmation Tracker's (C9) per-record advisory
    /// lock, ensuring only one worker reconciles a given record at a time
    /// across however many tracker instances are running (spec §4.9:
    /// "single-instance-safe"). The lock key is derived from `tx_hash`;
    /// returns `true` iff the lock was acquired, and must be paired with
    /// [`Self::unlock_record`] on every path once the caller is done.
    #[instrument(skip(self))]
    pub async fn try_lock_record(&self, tx_hash: B256) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT pg_try_advisory_lock($1)")
            .bind(advisory_lock_key(tx_hash))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get(0)?)
    }

    #[instrument(skip(self))]
    pub async fn unlock_record(&self, tx_hash: B256) -> Result<(), StoreError> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(advisory_lock_key(tx_hash))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Lists every `pending` record, ordered by submission time, for the
    /// Confirmation Tracker (spec §4.6, §4.9).
    #[instrument(skip(self))]
    pub async fn list_pending(&self) -> Result<Vec<TransactionRecord>, StoreError> {
        let rows = sqlx::query(
            r"SELECT tx_hash, account_from, account_to, network, token_address, token_kind,
                      amount, token_id, status, declared_gas_limit, effective_gas_price,
                      observed_gas_used, block_number, relayer_address, sequence_number,
                      submitted_at, updated_at, stuck_since
               FROM transactions
               WHERE status = $1
               ORDER BY submitted_at ASC",
        )
        .bind(tx_status_str(TxStatus::Pending))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    /// Lists policy rules, optionally filtered by `kind` (spec §4.6).
    #[instrument(skip(self))]
    pub async fn list_policy_rules(
        &self,
        kind: Option<PolicyRuleKind>,
    ) -> Result<Vec<PolicyRule>, StoreError> {
        let rows = match kind {
            Some(kind) => {
                sqlx::query("SELECT id, kind, target, value, enabled FROM policy_rules WHERE kind = $1 ORDER BY id")
                    .bind(policy_kind_str(kind))
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT id, kind, target, value, enabled FROM policy_rules ORDER BY id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(row_to_rule).collect()
    }

    /// Inserts a new policy rule after validating `value` against `kind`'s
    /// schema (spec §4.4: "writes must revalidate the rule's structured
    /// value against the kind's schema").
    #[instrument(skip(self, value))]
    pub async fn insert_policy_rule(
        &self,
        kind: PolicyRuleKind,
        target: &str,
        value: serde_json::Value,
        enabled: bool,
    ) -> Result<PolicyRule, StoreError> {
        schema::validate(kind, &value)?;

        let row = sqlx::query(
            r"INSERT INTO policy_rules (kind, target, value, enabled)
              VALUES ($1, $2, $3, $4)
              RETURNING id, kind, target, value, enabled",
        )
        .bind(policy_kind_str(kind))
        .bind(target)
        .bind(&value)
        .bind(enabled)
        .fetch_one(&self.pool)
        .await?;

        row_to_rule(&row)
    }

    /// Replaces an existing rule's `value`/`enabled` fields, revalidating
    /// against the schema.
    #[instrument(skip(self, value))]
    pub async fn update_policy_rule(
        &self,
        id: i64,
        value: serde_json::Value,
        enabled: bool,
    ) -> Result<PolicyRule, StoreError> {
        let kind_row = sqlx::query("SELECT kind FROM policy_rules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;
        let kind = parse_policy_kind(kind_row.try_get::<String, _>("kind")?.as_str())?;
        schema::validate(kind, &value)?;

        let row = sqlx::query(
            r"UPDATE policy_rules SET value = $2, enabled = $3 WHERE id = $1
              RETURNING id, kind, target, value, enabled",
        )
        .bind(id)
        .bind(&value)
        .bind(enabled)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;

        row_to_rule(&row)
    }

    #[instrument(skip(self))]
    pub async fn delete_policy_rule(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM policy_rules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

fn hex(bytes: &impl std::fmt::LowerHex) -> String {
    format!("{bytes:#x}")
}

/// Folds a 32-byte tx-hash down to the `i64` key `pg_try_advisory_lock`
/// takes, by reading its first 8 bytes. Collisions are astronomically
/// unlikely for this purpose: a false contention just makes the tracker skip
/// a record until its next scan (spec §4.9), it never corrupts state.
fn advisory_lock_key(tx_hash: B256) -> i64 {
    i64::from_be_bytes(tx_hash.0[0..8].try_into().expect("8 bytes"))
}

fn tx_status_str(status: TxStatus) -> &'static str {
    match status {
        TxStatus::Pending => "pending",
        TxStatus::Confirmed => "confirmed",
        TxStatus::Failed => "failed",
        TxStatus::Dropped => "dropped",
    }
}

fn parse_tx_status(s: &str) -> Result<TxStatus, StoreError> {
    match s {
        "pending" => Ok(TxStatus::Pending),
        "confirmed" => Ok(TxStatus::Confirmed),
        "failed" => Ok(TxStatus::Failed),
        "dropped" => Ok(TxStatus::Dropped),
        other => Err(StoreError::Corrupt(format!("unknown tx status {other}"))),
    }
}

fn token_kind_str(kind: TokenKind) -> &'static str {
    match kind {
        TokenKind::Fungible => "fungible",
        TokenKind::NonFungible => "non_fungible",
        TokenKind::Multi => "multi",
    }
}

fn parse_token_kind(s: &str) -> Result<TokenKind, StoreError> {
    match s {
        "fungible" => Ok(TokenKind::Fungible),
        "non_fungible" => Ok(TokenKind::NonFungible),
        "multi" => Ok(TokenKind::Multi),
        other => Err(StoreError::Corrupt(format!("unknown token kind {other}"))),
    }
}

fn policy_kind_str(kind: PolicyRuleKind) -> &'static str {
    match kind {
        PolicyRuleKind::Allowlist => "allowlist",
        PolicyRuleKind::Quota => "quota",
        PolicyRuleKind::GasCap => "gas_cap",
        PolicyRuleKind::TokenCap => "token_cap",
    }
}

fn parse_policy_kind(s: &str) -> Result<PolicyRuleKind, StoreError> {
    match s {
        "allowlist" => Ok(PolicyRuleKind::Allowlist),
        "quota" => Ok(PolicyRuleKind::Quota),
        "gas_cap" => Ok(PolicyRuleKind::GasCap),
        "token_cap" => Ok(PolicyRuleKind::TokenCap),
        other => Err(StoreError::Corrupt(format!("unknown policy rule kind {other}"))),
    }
}

fn parse_u256(s: &str) -> Result<U256, StoreError> {
    U256::from_str(s).map_err(|e| StoreError::Corrupt(format!("invalid 256-bit decimal {s}: {e}")))
}

fn parse_address(s: &str) -> Result<Address, StoreError> {
    Address::from_str(s).map_err(|e| StoreError::Corrupt(format!("invalid address {s}: {e}")))
}

fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<TransactionRecord, StoreError> {
    let token_address: Option<String> = row.try_get("token_address")?;
    let token_kind: Option<String> = row.try_get("token_kind")?;
    let amount: Option<String> = row.try_get("amount")?;
    let token_id: Option<String> = row.try_get("token_id")?;
    let observed_gas_used: Option<String> = row.try_get("observed_gas_used")?;
    let block_number: Option<i64> = row.try_get("block_number")?;

    Ok(TransactionRecord {
        tx_hash: B256::from_str(row.try_get::<String, _>("tx_hash")?.as_str())
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        from: parse_address(&row.try_get::<String, _>("account_from")?)?,
        to: parse_address(&row.try_get::<String, _>("account_to")?)?,
        network: row.try_get("network")?,
        token_address: token_address.map(|s| parse_address(&s)).transpose()?,
        token_kind: token_kind.map(|s| parse_token_kind(&s)).transpose()?,
        amount: amount.map(|s| parse_u256(&s)).transpose()?,
        token_id: token_id.map(|s| parse_u256(&s)).transpose()?,
        status: parse_tx_status(&row.try_get::<String, _>("status")?)?,
        declared_gas_limit: parse_u256(&row.try_get::<String, _>("declared_gas_limit")?)?,
        effective_gas_price: parse_u256(&row.try_get::<String, _>("effective_gas_price")?)?,
        observed_gas_used: observed_gas_used.map(|s| parse_u256(&s)).transpose()?,
        block_number: block_number.map(|n| n as u64),
        relayer_address: parse_address(&row.try_get::<String, _>("relayer_address")?)?,
        sequence_number: parse_u256(&row.try_get::<String, _>("sequence_number")?)?,
        submitted_at: row.try_get("submitted_at")?,
        updated_at: row.try_get("updated_at")?,
        stuck_since: row.try_get("stuck_since")?,
    })
}

fn row_to_rule(row: &sqlx::postgres::PgRow) -> Result<PolicyRule, StoreError> {
    Ok(PolicyRule {
        id: row.try_get("id")?,
        kind: parse_policy_kind(&row.try_get::<String, _>("kind")?)?,
        target: row.try_get("target")?,
        value: row.try_get("value")?,
        enabled: row.try_get("enabled")?,
    })
}

#[cfg(test)]
mod advisory_lock_tests {
    use super::*;

    #[test]
    fn advisory_lock_key_is_stable_for_the_same_hash() {
        let hash = B256::repeat_byte(0x7a);
        assert_eq!(advisory_lock_key(hash), advisory_lock_key(hash));
    }

    #[test]
    fn advisory_lock_key_differs_across_hashes() {
        let a = B256::repeat_byte(0x01);
        let b = B256::repeat_byte(0x02);
        assert_ne!(advisory_lock_key(a), advisory_lock_key(b));
    }
}

/// Exercises the Store against a real Postgres instance. Skipped (not
/// `#[ignore]`d, just left to fail with a clear message) if `docker` isn't
/// available to spin one up.
#[cfg(test)]
mod integration_tests {
    use chrono::Utc;

    use super::*;
    use crate::config::DatabaseConfig;
    use crate::secret::SecretUrl;

    async fn setup() -> (Store, postgres_docker_utils::DockerContainerGuard) {
        let container = postgres_docker_utils::setup()
            .await
            .expect("failed to start postgres container, is docker running?");
        let url: SecretUrl = format!("postgres://postgres@localhost:{}/postgres", container.port())
            .parse()
            .unwrap();
        let config = DatabaseConfig {
            database: url,
            migrate: true,
            max_connections: 5,
        };
        let store = Store::new(&config).await.unwrap();
        (store, container)
    }

    fn sample_record(tx_hash: B256) -> TransactionRecord {
        let now = Utc::now();
        TransactionRecord {
            tx_hash,
            from: Address::repeat_byte(0x11),
            to: Address::repeat_byte(0x22),
            network: "localhost".to_string(),
            token_address: None,
            token_kind: None,
            amount: None,
            token_id: None,
            status: TxStatus::Pending,
            declared_gas_limit: U256::from(21_000u64),
            effective_gas_price: U256::from(2_000_000_000u64),
            observed_gas_used: None,
            block_number: None,
            relayer_address: Address::repeat_byte(0x33),
            sequence_number: U256::from(0u64),
            submitted_at: now,
            updated_at: now,
            stuck_since: None,
        }
    }

    #[tokio::test]
    async fn inserts_and_finalizes_a_pending_transaction() {
        let (store, _container) = setup().await;
        let record = sample_record(B256::repeat_byte(0x44));

        store.insert_pending(&record).await.unwrap();

        let duplicate = store.insert_pending(&record).await.unwrap_err();
        assert!(matches!(duplicate, StoreError::DuplicateTxHash(_)));

        store
            .finalize(record.tx_hash, TxStatus::Confirmed, Some(U256::from(21_000u64)), Some(100))
            .await
            .unwrap();

        let stored = store.get_by_hash(record.tx_hash).await.unwrap().unwrap();
        assert_eq!(stored.status, TxStatus::Confirmed);
        assert_eq!(stored.block_number, Some(100));

        let again = store
            .finalize(record.tx_hash, TxStatus::Failed, None, None)
            .await
            .unwrap_err();
        assert!(matches!(again, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn policy_rule_crud_round_trips() {
        let (store, _container) = setup().await;

        let rule = store
            .insert_policy_rule(
                PolicyRuleKind::Allowlist,
                "*",
                serde_json::json!({"addresses": []}),
                true,
            )
            .await
            .unwrap();

        let rules = store.list_policy_rules(None).await.unwrap();
        assert_eq!(rules.len(), 1);

        store
            .update_policy_rule(rule.id, serde_json::json!({"addresses": []}), false)
            .await
            .unwrap();

        store.delete_policy_rule(rule.id).await.unwrap();
        assert!(store.list_policy_rules(None).await.unwrap().is_empty());
    }
}
