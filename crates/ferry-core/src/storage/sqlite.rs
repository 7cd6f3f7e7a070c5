//! SQLite-backed runner table

use super::{OrderColumn, TaskFilter, TaskStore};
use crate::error::{FerryError, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use ferry_types::{ErrorCode, GlobalStep, TaskKey, TaskRunner, TransferMode, UpdatedInfo};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::path::Path;

const COLUMNS: &str = "special_id, requester, requested, owner, rule_id, mode, is_sender, \
    filename, original_filename, file_info, file_size, blocksize, rank, global_step, \
    global_last_step, step, step_status, updated_info, is_block_compression, use_digest, \
    info, start, stop";

/// Database connection pool for runner persistence
#[derive(Clone, Debug)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Open (or create) the database file
    pub async fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Private in-memory database, one connection so every query sees it
    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runners (
                special_id INTEGER NOT NULL,
                requester TEXT NOT NULL,
                requested TEXT NOT NULL,
                owner TEXT NOT NULL,
                rule_id TEXT NOT NULL,
                mode TEXT NOT NULL,
                is_sender INTEGER NOT NULL,
                filename TEXT NOT NULL,
                original_filename TEXT NOT NULL,
                file_info TEXT NOT NULL,
                file_size INTEGER,
                blocksize INTEGER NOT NULL,
                rank INTEGER NOT NULL DEFAULT 0,
                global_step TEXT NOT NULL,
                global_last_step TEXT NOT NULL,
                step INTEGER NOT NULL DEFAULT 0,
                step_status TEXT NOT NULL,
                updated_info TEXT NOT NULL,
                is_block_compression INTEGER NOT NULL DEFAULT 0,
                use_digest INTEGER NOT NULL DEFAULT 0,
                info TEXT,
                start TEXT NOT NULL,
                stop TEXT NOT NULL,
                PRIMARY KEY (special_id, requester, requested)
            );

            CREATE INDEX IF NOT EXISTS idx_runners_info ON runners(owner, updated_info);
            CREATE INDEX IF NOT EXISTS idx_runners_start ON runners(start);
            CREATE INDEX IF NOT EXISTS idx_runners_rule ON runners(rule_id);
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Drop terminal rows that finished before `cutoff`
    pub async fn purge(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM runners WHERE updated_info IN ('DONE', 'INERROR') AND stop < ?")
            .bind(timestamp(&cutoff))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, runner: &TaskRunner) -> Result<()> {
        let sql = format!(
            "INSERT INTO runners ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        let result = sqlx::query(&sql)
            .bind(runner.special_id)
            .bind(&runner.requester)
            .bind(&runner.requested)
            .bind(&runner.owner)
            .bind(&runner.rule_id)
            .bind(runner.mode.as_str())
            .bind(runner.is_sender as i64)
            .bind(&runner.filename)
            .bind(&runner.original_filename)
            .bind(&runner.file_info)
            .bind(runner.file_size.map(|s| s as i64))
            .bind(runner.blocksize as i64)
            .bind(runner.rank as i64)
            .bind(runner.global_step.as_str())
            .bind(runner.global_last_step.as_str())
            .bind(runner.step as i64)
            .bind(runner.step_status.code().to_string())
            .bind(runner.updated_info.as_str())
            .bind(runner.is_block_compression as i64)
            .bind(runner.use_digest as i64)
            .bind(runner.info.as_ref())
            .bind(timestamp(&runner.start))
            .bind(timestamp(&runner.stop))
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(FerryError::Conflict(
                format!("transfer {} already exists", runner.key()),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, runner: &TaskRunner) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE runners SET
                owner = ?, rule_id = ?, mode = ?, is_sender = ?, filename = ?,
                original_filename = ?, file_info = ?, file_size = ?, blocksize = ?, rank = ?,
                global_step = ?, global_last_step = ?, step = ?, step_status = ?,
                updated_info = ?, is_block_compression = ?, use_digest = ?, info = ?,
                start = ?, stop = ?
            WHERE special_id = ? AND requester = ? AND requested = ?
            "#,
        )
        .bind(&runner.owner)
        .bind(&runner.rule_id)
        .bind(runner.mode.as_str())
        .bind(runner.is_sender as i64)
        .bind(&runner.filename)
        .bind(&runner.original_filename)
        .bind(&runner.file_info)
        .bind(runner.file_size.map(|s| s as i64))
        .bind(runner.blocksize as i64)
        .bind(runner.rank as i64)
        .bind(runner.global_step.as_str())
        .bind(runner.global_last_step.as_str())
        .bind(runner.step as i64)
        .bind(runner.step_status.code().to_string())
        .bind(runner.updated_info.as_str())
        .bind(runner.is_block_compression as i64)
        .bind(runner.use_digest as i64)
        .bind(runner.info.as_ref())
        .bind(timestamp(&runner.start))
        .bind(timestamp(&runner.stop))
        .bind(runner.special_id)
        .bind(&runner.requester)
        .bind(&runner.requested)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(FerryError::NotFound(runner.key().to_string()));
        }
        Ok(())
    }

    async fn delete(&self, key: &TaskKey) -> Result<()> {
        sqlx::query("DELETE FROM runners WHERE special_id = ? AND requester = ? AND requested = ?")
            .bind(key.special_id)
            .bind(&key.requester)
            .bind(&key.requested)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn select(&self, key: &TaskKey) -> Result<Option<TaskRunner>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM runners WHERE special_id = ? AND requester = ? AND requested = ?"
        );
        let row = sqlx::query(&sql)
            .bind(key.special_id)
            .bind(&key.requester)
            .bind(&key.requested)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        row_to_runner(&row).map(Some)
    }

    async fn find(
        &self,
        filter: &TaskFilter,
        order: OrderColumn,
        ascending: bool,
        limit: usize,
    ) -> Result<Vec<TaskRunner>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!("SELECT {COLUMNS} FROM runners WHERE 1 = 1"));

        if let Some(owner) = &filter.owner {
            qb.push(" AND owner = ").push_bind(owner.clone());
        }
        if !filter.updated_info.is_empty() {
            qb.push(" AND updated_info IN (");
            let mut separated = qb.separated(", ");
            for info in &filter.updated_info {
                separated.push_bind(info.as_str());
            }
            separated.push_unseparated(")");
        }
        if let Some(step) = filter.global_step {
            qb.push(" AND global_step = ").push_bind(step.as_str());
        }
        if let Some(step) = filter.global_last_step {
            qb.push(" AND global_last_step = ").push_bind(step.as_str());
        }
        if let Some(status) = filter.step_status {
            qb.push(" AND step_status = ").push_bind(status.code().to_string());
        }
        if let Some(from) = filter.start_from {
            qb.push(" AND start >= ").push_bind(timestamp(&from));
        }
        if let Some(to) = filter.start_to {
            qb.push(" AND start <= ").push_bind(timestamp(&to));
        }
        if let Some(before) = filter.stop_before {
            qb.push(" AND stop < ").push_bind(timestamp(&before));
        }
        if let Some(rule) = &filter.rule_id {
            qb.push(" AND rule_id = ").push_bind(rule.clone());
        }

        let column = match order {
            OrderColumn::Start => "start",
            OrderColumn::Stop => "stop",
            OrderColumn::SpecialId => "special_id",
        };
        let direction = if ascending { "ASC" } else { "DESC" };
        qb.push(format!(" ORDER BY {column} {direction}, special_id {direction}"));
        if limit > 0 {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_runner).collect()
    }
}

/// Fixed-width UTC text so that string order is time order
fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| FerryError::Serialization(format!("bad timestamp {s}: {e}")))
}

fn row_to_runner(row: &SqliteRow) -> Result<TaskRunner> {
    let corrupt = |field: &str, value: &str| FerryError::Serialization(format!("bad {field} '{value}'"));

    let mode: String = row.get("mode");
    let global_step: String = row.get("global_step");
    let global_last_step: String = row.get("global_last_step");
    let step_status: String = row.get("step_status");
    let updated_info: String = row.get("updated_info");

    Ok(TaskRunner {
        special_id: row.get("special_id"),
        requester: row.get("requester"),
        requested: row.get("requested"),
        owner: row.get("owner"),
        rule_id: row.get("rule_id"),
        mode: TransferMode::parse(&mode).ok_or_else(|| corrupt("mode", &mode))?,
        is_sender: row.get::<i64, _>("is_sender") != 0,
        filename: row.get("filename"),
        original_filename: row.get("original_filename"),
        file_info: row.get("file_info"),
        file_size: row.get::<Option<i64>, _>("file_size").map(|s| s as u64),
        blocksize: row.get::<i64, _>("blocksize") as u32,
        rank: row.get::<i64, _>("rank") as u64,
        global_step: GlobalStep::parse(&global_step).ok_or_else(|| corrupt("global_step", &global_step))?,
        global_last_step: GlobalStep::parse(&global_last_step)
            .ok_or_else(|| corrupt("global_last_step", &global_last_step))?,
        step: row.get::<i64, _>("step") as u32,
        step_status: step_status
            .chars()
            .next()
            .and_then(ErrorCode::from_code)
            .ok_or_else(|| corrupt("step_status", &step_status))?,
        updated_info: UpdatedInfo::parse(&updated_info)
            .ok_or_else(|| corrupt("updated_info", &updated_info))?,
        is_block_compression: row.get::<i64, _>("is_block_compression") != 0,
        use_digest: row.get::<i64, _>("use_digest") != 0,
        info: row.get("info"),
        start: parse_timestamp(&row.get::<String, _>("start"))?,
        stop: parse_timestamp(&row.get::<String, _>("stop"))?,
    })
}
