use {
    crate::traits::{CachedBalanceRow, Gateway, Page, SlotRange},
    anyhow::{Context, Result},
    async_trait::async_trait,
    rust_decimal::Decimal,
    sqlx::{
        postgres::{PgPool, PgPoolOptions},
        Row,
    },
    solwatch_common::types::{
        BalanceUpdate, IndexerState, IndexerStats, IndexerStatus, SubscribedKey, TransactionEvent,
        PRIMARY_STATE_ID,
    },
    std::time::Duration,
};

/// PostgreSQL persistence gateway
#[derive(Clone)]
pub struct PostgresGateway {
    pool: PgPool,
}

impl PostgresGateway {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(database_url)
            .await
            .context("failed to connect to postgres")?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn create_enum(&self, name: &str, labels: &str) -> Result<()> {
        let stmt = format!(
            r#"
            DO $$ BEGIN
                CREATE TYPE {name} AS ENUM ({labels});
            EXCEPTION
                WHEN duplicate_object THEN null;
            END $$;
            "#
        );
        sqlx::query(&stmt).execute(&self.pool).await?;
        Ok(())
    }

    async fn initialize_schema(&self) -> Result<()> {
        self.create_enum("indexer_status", "'starting', 'running', 'stopped', 'error'")
            .await?;
        self.create_enum("subscription_type", "'account', 'transaction', 'both'")
            .await?;
        self.create_enum(
            "balance_change_type",
            "'increase', 'decrease', 'swapIn', 'swapOut', 'transfer', 'unknown'",
        )
        .await?;
        self.create_enum(
            "transaction_type",
            "'transfer', 'swap', 'stake', 'vote', 'createAccount', 'closeAccount', 'other'",
        )
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS indexer_states (
                id TEXT PRIMARY KEY,
                subscribed_keys JSONB NOT NULL DEFAULT '[]',
                last_processed_slot BIGINT NOT NULL DEFAULT 0,
                status indexer_status NOT NULL DEFAULT 'starting',
                total_subscriptions INT NOT NULL DEFAULT 0,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subscribed_keys (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                public_key TEXT NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                subscription_type subscription_type NOT NULL,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT CURRENT_TIMESTAMP,
                UNIQUE (user_id, public_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS subscribed_keys_active_idx
             ON subscribed_keys(public_key) WHERE is_active",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS balance_updates (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                public_key TEXT NOT NULL,
                mint_address TEXT NOT NULL,
                old_balance NUMERIC NOT NULL,
                new_balance NUMERIC NOT NULL,
                change_amount NUMERIC NOT NULL,
                change_type balance_change_type NOT NULL,
                transaction_signature TEXT,
                slot BIGINT NOT NULL,
                block_time TIMESTAMP WITH TIME ZONE,
                processed_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Duplicate deliveries of the same (key, mint, slot, signature) must
        // insert exactly one row, race-safe under concurrent workers.
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS balance_updates_dedupe_idx
             ON balance_updates(public_key, mint_address, slot, COALESCE(transaction_signature, ''))",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS balance_updates_key_slot_idx
             ON balance_updates(public_key, slot DESC)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transaction_events (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                public_key TEXT NOT NULL,
                transaction_signature TEXT NOT NULL,
                transaction_type transaction_type NOT NULL,
                slot BIGINT NOT NULL,
                block_time TIMESTAMP WITH TIME ZONE,
                success BOOLEAN NOT NULL,
                error_message TEXT,
                program_ids JSONB NOT NULL DEFAULT '[]',
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT CURRENT_TIMESTAMP,
                UNIQUE (transaction_signature, public_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS transaction_events_key_slot_idx
             ON transaction_events(public_key, slot DESC)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS indexer_stats (
                id TEXT PRIMARY KEY,
                total_keys_monitored INT NOT NULL,
                total_balance_updates BIGINT NOT NULL,
                total_transactions BIGINT NOT NULL,
                last_processed_slot BIGINT NOT NULL,
                avg_processing_time_ms DOUBLE PRECISION NOT NULL,
                errors_last_hour INT NOT NULL,
                uptime_seconds BIGINT NOT NULL,
                recorded_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn seed_state(&self) -> Result<()> {
        let state = IndexerState::new();
        sqlx::query(
            r#"
            INSERT INTO indexer_states (id, subscribed_keys, last_processed_slot, status, total_subscriptions, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&state.id)
        .bind(&state.subscribed_keys)
        .bind(state.last_processed_slot)
        .bind(state.status)
        .bind(state.total_subscriptions)
        .bind(state.created_at)
        .bind(state.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl Gateway for PostgresGateway {
    async fn initialize(&self) -> Result<()> {
        self.initialize_schema().await?;
        self.seed_state().await?;
        tracing::info!("Database schema initialized");
        Ok(())
    }

    async fn upsert_subscription(&self, key: &SubscribedKey) -> Result<SubscribedKey> {
        let row = sqlx::query_as::<_, SubscribedKey>(
            r#"
            INSERT INTO subscribed_keys (id, user_id, public_key, is_active, subscription_type, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (user_id, public_key)
            DO UPDATE SET
                is_active = TRUE,
                subscription_type = EXCLUDED.subscription_type,
                updated_at = EXCLUDED.updated_at
            RETURNING *
            "#,
        )
        .bind(&key.id)
        .bind(&key.user_id)
        .bind(&key.public_key)
        .bind(key.is_active)
        .bind(key.subscription_type)
        .bind(key.created_at)
        .bind(key.updated_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn deactivate_subscription(&self, user_id: &str, public_key: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE subscribed_keys SET is_active = FALSE, updated_at = NOW()
             WHERE user_id = $1 AND public_key = $2 AND is_active",
        )
        .bind(user_id)
        .bind(public_key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn active_subscriptions(&self) -> Result<Vec<SubscribedKey>> {
        let rows = sqlx::query_as::<_, SubscribedKey>(
            "SELECT * FROM subscribed_keys WHERE is_active ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn subscriptions_for_user(&self, user_id: &str) -> Result<Vec<SubscribedKey>> {
        let rows = sqlx::query_as::<_, SubscribedKey>(
            "SELECT * FROM subscribed_keys WHERE user_id = $1 ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn commit_balance_update(&self, update: &BalanceUpdate) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO balance_updates (id, user_id, public_key, mint_address, old_balance, new_balance, change_amount, change_type, transaction_signature, slot, block_time, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (public_key, mint_address, slot, COALESCE(transaction_signature, ''))
            DO NOTHING
            "#,
        )
        .bind(&update.id)
        .bind(&update.user_id)
        .bind(&update.public_key)
        .bind(&update.mint_address)
        .bind(update.old_balance)
        .bind(update.new_balance)
        .bind(update.change_amount)
        .bind(update.change_type)
        .bind(&update.transaction_signature)
        .bind(update.slot)
        .bind(update.block_time)
        .bind(update.processed_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE indexer_states
             SET last_processed_slot = GREATEST(last_processed_slot, $1), updated_at = NOW()
             WHERE id = $2",
        )
        .bind(update.slot)
        .bind(PRIMARY_STATE_ID)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(result.rows_affected() > 0)
    }

    async fn commit_transaction_event(&self, event: &TransactionEvent) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO transaction_events (id, user_id, public_key, transaction_signature, transaction_type, slot, block_time, success, error_message, program_ids, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (transaction_signature, public_key)
            DO NOTHING
            "#,
        )
        .bind(&event.id)
        .bind(&event.user_id)
        .bind(&event.public_key)
        .bind(&event.transaction_signature)
        .bind(event.transaction_type)
        .bind(event.slot)
        .bind(event.block_time)
        .bind(event.success)
        .bind(&event.error_message)
        .bind(&event.program_ids)
        .bind(event.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE indexer_states
             SET last_processed_slot = GREATEST(last_processed_slot, $1), updated_at = NOW()
             WHERE id = $2",
        )
        .bind(event.slot)
        .bind(PRIMARY_STATE_ID)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(result.rows_affected() > 0)
    }

    async fn load_latest_balances(&self) -> Result<Vec<CachedBalanceRow>> {
        let rows = sqlx::query(
            "SELECT DISTINCT ON (public_key, mint_address)
                 public_key, mint_address, new_balance, slot
             FROM balance_updates
             ORDER BY public_key, mint_address, slot DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut balances = Vec::with_capacity(rows.len());
        for row in rows {
            balances.push(CachedBalanceRow {
                public_key: row.try_get("public_key")?,
                mint_address: row.try_get("mint_address")?,
                balance: row.try_get::<Decimal, _>("new_balance")?,
                slot: row.try_get("slot")?,
            });
        }

        Ok(balances)
    }

    async fn balance_history(
        &self,
        public_key: &str,
        range: SlotRange,
        page: Page,
    ) -> Result<Vec<BalanceUpdate>> {
        let rows = sqlx::query_as::<_, BalanceUpdate>(
            "SELECT * FROM balance_updates
             WHERE public_key = $1
               AND ($2::BIGINT IS NULL OR slot >= $2)
               AND ($3::BIGINT IS NULL OR slot <= $3)
             ORDER BY slot DESC, processed_at DESC
             LIMIT $4 OFFSET $5",
        )
        .bind(public_key)
        .bind(range.from)
        .bind(range.to)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn transaction_history(
        &self,
        public_key: &str,
        range: SlotRange,
        page: Page,
    ) -> Result<Vec<TransactionEvent>> {
        let rows = sqlx::query_as::<_, TransactionEvent>(
            "SELECT * FROM transaction_events
             WHERE public_key = $1
               AND ($2::BIGINT IS NULL OR slot >= $2)
               AND ($3::BIGINT IS NULL OR slot <= $3)
             ORDER BY slot DESC, created_at DESC
             LIMIT $4 OFFSET $5",
        )
        .bind(public_key)
        .bind(range.from)
        .bind(range.to)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn latest_state(&self) -> Result<IndexerState> {
        let state = sqlx::query_as::<_, IndexerState>(
            "SELECT * FROM indexer_states WHERE id = $1",
        )
        .bind(PRIMARY_STATE_ID)
        .fetch_one(&self.pool)
        .await?;

        Ok(state)
    }

    async fn set_status(&self, status: IndexerStatus) -> Result<()> {
        sqlx::query("UPDATE indexer_states SET status = $1, updated_at = NOW() WHERE id = $2")
            .bind(status)
            .bind(PRIMARY_STATE_ID)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn sync_subscription_state(&self, active_keys: &[String]) -> Result<()> {
        sqlx::query(
            "UPDATE indexer_states
             SET subscribed_keys = $1, total_subscriptions = $2, updated_at = NOW()
             WHERE id = $3",
        )
        .bind(serde_json::json!(active_keys))
        .bind(active_keys.len() as i32)
        .bind(PRIMARY_STATE_ID)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_stats(&self, stats: &IndexerStats) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO indexer_stats (id, total_keys_monitored, total_balance_updates, total_transactions, last_processed_slot, avg_processing_time_ms, errors_last_hour, uptime_seconds, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&stats.id)
        .bind(stats.total_keys_monitored)
        .bind(stats.total_balance_updates)
        .bind(stats.total_transactions)
        .bind(stats.last_processed_slot)
        .bind(stats.avg_processing_time_ms)
        .bind(stats.errors_last_hour)
        .bind(stats.uptime_seconds)
        .bind(stats.recorded_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn count_balance_updates(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM balance_updates")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    async fn count_transaction_events(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM transaction_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    async fn count_active_keys(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM subscribed_keys WHERE is_active")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
