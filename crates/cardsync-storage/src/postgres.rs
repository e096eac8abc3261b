//! Postgres-backed stores.

use std::time::Duration;

use async_trait::async_trait;
use cardsync_core::{
    CardGameType, CatalogRecord, Cursor, Expansion, ImportProgress, NaturalKey, Rarity, RunLock,
};
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use crate::{ttl_to_chrono, CatalogStore, LockStore, ProgressStore, StoreError, UpsertOutcome};

pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    info!("database migrations applied");
    Ok(())
}

fn parse_game(raw: &str) -> Result<CardGameType, StoreError> {
    raw.parse()
        .map_err(|err: cardsync_core::ParseGameTypeError| StoreError::Corrupt(err.to_string()))
}

fn cursor_to_db(cursor: Cursor) -> Result<i64, StoreError> {
    i64::try_from(cursor.offset())
        .map_err(|_| StoreError::Corrupt(format!("cursor {cursor} exceeds BIGINT")))
}

fn catalog_record_from_row(row: &PgRow) -> Result<CatalogRecord, StoreError> {
    let game: String = row.try_get("game")?;
    let rarity: String = row.try_get("rarity")?;
    Ok(CatalogRecord {
        id: row.try_get("id")?,
        game: parse_game(&game)?,
        name: row.try_get("name")?,
        set_code: row.try_get("set_code")?,
        card_number: row.try_get("card_number")?,
        rarity: Rarity::normalize(&rarity),
        image_url: row.try_get("image_url")?,
        description: row.try_get("description")?,
        mana_cost: row.try_get("mana_cost")?,
        expansion_id: row.try_get("expansion_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn progress_from_row(row: &PgRow) -> Result<ImportProgress, StoreError> {
    let game: String = row.try_get("game")?;
    let offset: i64 = row.try_get("last_offset")?;
    Ok(ImportProgress {
        game: parse_game(&game)?,
        cursor: Cursor(offset.max(0) as u64),
        complete: row.try_get("is_complete")?,
        last_run_at: row.try_get("last_run_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn find_by_natural_key(
        &self,
        key: &NaturalKey,
    ) -> Result<Option<CatalogRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, game, name, set_code, card_number, rarity, image_url,
                   description, mana_cost, expansion_id, created_at
              FROM card_templates
             WHERE game = $1 AND name = $2 AND set_code = $3 AND card_number = $4
            "#,
        )
        .bind(key.game.slug())
        .bind(&key.name)
        .bind(&key.set_code)
        .bind(&key.card_number)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(catalog_record_from_row).transpose()
    }

    async fn upsert_batch(&self, records: &[CatalogRecord]) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = UpsertOutcome::default();

        // Row by row: a multi-row ON CONFLICT cannot touch the same key twice.
        for record in records {
            let row = sqlx::query(
                r#"
                INSERT INTO card_templates
                    (id, game, name, set_code, card_number, rarity, image_url,
                     description, mana_cost, expansion_id, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
                ON CONFLICT (game, name, set_code, card_number) DO UPDATE
                   SET image_url = EXCLUDED.image_url,
                       description = EXCLUDED.description,
                       updated_at = NOW()
                RETURNING (xmax = 0) AS inserted
                "#,
            )
            .bind(record.id)
            .bind(record.game.slug())
            .bind(&record.name)
            .bind(&record.set_code)
            .bind(&record.card_number)
            .bind(record.rarity.as_str())
            .bind(&record.image_url)
            .bind(&record.description)
            .bind(record.mana_cost)
            .bind(record.expansion_id)
            .bind(record.created_at)
            .fetch_one(&mut *tx)
            .await?;

            if row.try_get::<bool, _>("inserted")? {
                outcome.inserted += 1;
            } else {
                outcome.updated += 1;
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn find_expansion(
        &self,
        title: &str,
        game: CardGameType,
    ) -> Result<Option<Expansion>, StoreError> {
        let row = sqlx::query("SELECT id, title FROM expansions WHERE game = $1 AND title = $2")
            .bind(game.slug())
            .bind(title)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            Ok(Expansion {
                id: row.try_get("id")?,
                title: row.try_get("title")?,
                game,
            })
        })
        .transpose()
    }

    async fn create_expansion(&self, expansion: Expansion) -> Result<Expansion, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO expansions (id, game, title)
            VALUES ($1, $2, $3)
            ON CONFLICT (game, title) DO NOTHING
            "#,
        )
        .bind(expansion.id)
        .bind(expansion.game.slug())
        .bind(&expansion.title)
        .execute(&self.pool)
        .await?;

        self.find_expansion(&expansion.title, expansion.game)
            .await?
            .ok_or_else(|| {
                StoreError::Corrupt(format!(
                    "expansion '{}' vanished right after insert",
                    expansion.title
                ))
            })
    }

    async fn count_records(&self, game: CardGameType) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM card_templates WHERE game = $1")
            .bind(game.slug())
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }
}

#[derive(Debug, Clone)]
pub struct PgProgressStore {
    pool: PgPool,
}

impl PgProgressStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProgressStore for PgProgressStore {
    async fn get_cursor(&self, game: CardGameType) -> Result<Option<ImportProgress>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT game, last_offset, is_complete, last_run_at
              FROM import_progress
             WHERE game = $1
            "#,
        )
        .bind(game.slug())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(progress_from_row).transpose()
    }

    async fn advance_cursor(
        &self,
        game: CardGameType,
        cursor: Cursor,
        complete: bool,
    ) -> Result<ImportProgress, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO import_progress (game, last_offset, is_complete, last_run_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (game) DO UPDATE
               SET last_offset = GREATEST(import_progress.last_offset, EXCLUDED.last_offset),
                   is_complete = EXCLUDED.is_complete,
                   last_run_at = NOW()
            RETURNING game, last_offset, is_complete, last_run_at
            "#,
        )
        .bind(game.slug())
        .bind(cursor_to_db(cursor)?)
        .bind(complete)
        .fetch_one(&self.pool)
        .await?;
        progress_from_row(&row)
    }

    async fn list(&self) -> Result<Vec<ImportProgress>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT game, last_offset, is_complete, last_run_at
              FROM import_progress
             ORDER BY game
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(progress_from_row).collect()
    }
}

#[derive(Debug, Clone)]
pub struct PgLockStore {
    pool: PgPool,
}

impl PgLockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockStore for PgLockStore {
    async fn try_acquire(
        &self,
        name: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let expires_at = now + ttl_to_chrono(ttl);
        let result = sqlx::query(
            r#"
            INSERT INTO scheduler_locks (lock_key, holder_id, acquired_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (lock_key) DO UPDATE
               SET holder_id = EXCLUDED.holder_id,
                   acquired_at = EXCLUDED.acquired_at,
                   expires_at = EXCLUDED.expires_at
             WHERE scheduler_locks.expires_at <= $3
            "#,
        )
        .bind(name)
        .bind(holder_id)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn extend(
        &self,
        name: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE scheduler_locks SET expires_at = $3 WHERE lock_key = $1 AND holder_id = $2",
        )
        .bind(name)
        .bind(holder_id)
        .bind(Utc::now() + ttl_to_chrono(ttl))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, name: &str, holder_id: &str) -> Result<bool, StoreError> {
        let result =
            sqlx::query("DELETE FROM scheduler_locks WHERE lock_key = $1 AND holder_id = $2")
                .bind(name)
                .bind(holder_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM scheduler_locks WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn current(&self, name: &str) -> Result<Option<RunLock>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT lock_key, holder_id, acquired_at, expires_at
              FROM scheduler_locks
             WHERE lock_key = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(RunLock {
                name: row.try_get("lock_key")?,
                holder_id: row.try_get("holder_id")?,
                acquired_at: row.try_get("acquired_at")?,
                expires_at: row.try_get("expires_at")?,
            })
        })
        .transpose()
    }
}
