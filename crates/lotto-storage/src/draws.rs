//! SQLite-backed draw store with conflict-rejecting merge semantics.
//!
//! The store only ever holds rows that passed [`DrawRecord`] validation.
//! `merge` never overwrites; replacing a stored draw goes through the explicit
//! [`DrawStore::restore`] operation.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use lotto_core::{DrawField, DrawId, DrawRecord, RawDrawRow, RowDefect};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tracing::{info, warn};

struct Migration {
    version: i64,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "create draws table",
    sql: "CREATE TABLE IF NOT EXISTS draws (
            draw_id   INTEGER PRIMARY KEY,
            draw_date TEXT    NOT NULL,
            n1 INTEGER NOT NULL, n2 INTEGER NOT NULL, n3 INTEGER NOT NULL,
            n4 INTEGER NOT NULL, n5 INTEGER NOT NULL, n6 INTEGER NOT NULL,
            s1 INTEGER NOT NULL, s2 INTEGER NOT NULL,
            stored_at TEXT NOT NULL
        )",
}];

const SELECT_COLUMNS: &str = "draw_id, draw_date, n1, n2, n3, n4, n5, n6, s1, s2";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("draw {draw_id} already stored with different {}", field_list(.fields))]
    Conflict {
        draw_id: DrawId,
        fields: Vec<DrawField>,
        existing: Box<DrawRecord>,
        incoming: Box<DrawRecord>,
    },
    #[error("stored row for draw {draw_id} is invalid: {defect}")]
    CorruptRow { draw_id: i64, defect: RowDefect },
    #[error("store {operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("creating database directory {path}: {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn field_list(fields: &[DrawField]) -> String {
    fields
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeCounts {
    pub inserted: usize,
    pub updated: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    Inserted,
    Replaced,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct DrawStore {
    pool: SqlitePool,
    write_timeout: Duration,
}

impl DrawStore {
    /// Open or create the database at `database_url` and apply pending migrations.
    pub async fn connect(database_url: &str, write_timeout: Duration) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        let filename = options.get_filename();
        if filename != Path::new(":memory:") {
            if let Some(parent) = filename.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::Directory {
                    path: parent.display().to_string(),
                    source,
                })?;
            }
        }

        // One connection: a single writer per run, and `:memory:` stays alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            write_timeout,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:", Duration::from_secs(10)).await
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        let current: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?;

        for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
            info!(
                version = migration.version,
                description = migration.description,
                "applying migration"
            );
            let mut tx = self.pool.begin().await?;
            sqlx::query(migration.sql).execute(&mut *tx).await?;
            sqlx::query(&format!("PRAGMA user_version = {}", migration.version))
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        }
        Ok(())
    }

    /// Insert absent draws; identical draws are no-ops; any differing draw
    /// rejects the whole batch with [`StoreError::Conflict`].
    pub async fn merge(&self, records: &[DrawRecord]) -> Result<MergeCounts, StoreError> {
        tokio::time::timeout(self.write_timeout, self.merge_inner(records))
            .await
            .map_err(|_| StoreError::Timeout {
                operation: "merge",
                after: self.write_timeout,
            })?
    }

    async fn merge_inner(&self, records: &[DrawRecord]) -> Result<MergeCounts, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut counts = MergeCounts::default();

        for record in records {
            match fetch_in_tx(&mut tx, record.draw_id()).await? {
                None => {
                    insert_in_tx(&mut tx, record).await?;
                    counts.inserted += 1;
                }
                Some(existing) if existing == *record => {}
                Some(existing) => {
                    // Dropping `tx` rolls back every insert of this batch.
                    return Err(StoreError::Conflict {
                        draw_id: record.draw_id(),
                        fields: existing.differing_fields(record),
                        existing: Box::new(existing),
                        incoming: Box::new(record.clone()),
                    });
                }
            }
        }

        tx.commit().await?;
        Ok(counts)
    }

    /// Explicitly replace (or insert) one draw. The only path that may
    /// overwrite a stored record.
    pub async fn restore(&self, record: &DrawRecord) -> Result<RestoreOutcome, StoreError> {
        tokio::time::timeout(self.write_timeout, self.restore_inner(record))
            .await
            .map_err(|_| StoreError::Timeout {
                operation: "restore",
                after: self.write_timeout,
            })?
    }

    async fn restore_inner(&self, record: &DrawRecord) -> Result<RestoreOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let outcome = match fetch_in_tx(&mut tx, record.draw_id()).await? {
            None => {
                insert_in_tx(&mut tx, record).await?;
                RestoreOutcome::Inserted
            }
            Some(existing) if existing == *record => RestoreOutcome::Unchanged,
            Some(existing) => {
                warn!(
                    draw_id = record.draw_id(),
                    previous = %existing,
                    replacement = %record,
                    "replacing stored draw"
                );
                sqlx::query("DELETE FROM draws WHERE draw_id = ?")
                    .bind(i64::from(record.draw_id()))
                    .execute(&mut *tx)
                    .await?;
                insert_in_tx(&mut tx, record).await?;
                RestoreOutcome::Replaced
            }
        };
        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn get(&self, draw_id: DrawId) -> Result<Option<DrawRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM draws WHERE draw_id = ?"
        ))
        .bind(i64::from(draw_id))
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| decode_record(&r)).transpose()
    }

    pub async fn max_draw_id(&self) -> Result<Option<DrawId>, StoreError> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(draw_id) FROM draws")
            .fetch_one(&self.pool)
            .await?;
        Ok(max.and_then(|id| DrawId::try_from(id).ok()))
    }

    /// Ids absent from the store between `floor` (or the lowest stored id)
    /// and the highest stored id.
    pub async fn missing_ids(&self, floor: Option<DrawId>) -> Result<Vec<DrawId>, StoreError> {
        let stored: Vec<i64> = sqlx::query_scalar("SELECT draw_id FROM draws ORDER BY draw_id")
            .fetch_all(&self.pool)
            .await?;
        let stored: Vec<DrawId> = stored
            .into_iter()
            .filter_map(|id| DrawId::try_from(id).ok())
            .collect();
        let (Some(&lowest), Some(&highest)) = (stored.first(), stored.last()) else {
            return Ok(Vec::new());
        };

        let start = floor.unwrap_or(lowest).max(1);
        let mut present = stored.iter().peekable();
        let mut missing = Vec::new();
        for id in start..highest {
            while present.next_if(|&&p| p < id).is_some() {}
            if present.peek() != Some(&&id) {
                missing.push(id);
            }
        }
        Ok(missing)
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM draws")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn all(&self) -> Result<Vec<DrawRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM draws ORDER BY draw_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_record).collect()
    }

    /// Stored rows without validation, for integrity audits.
    pub async fn all_raw(&self) -> Result<Vec<RawDrawRow>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM draws ORDER BY draw_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_raw).collect()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn fetch_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    draw_id: DrawId,
) -> Result<Option<DrawRecord>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {SELECT_COLUMNS} FROM draws WHERE draw_id = ?"
    ))
    .bind(i64::from(draw_id))
    .fetch_optional(&mut **tx)
    .await?;
    row.map(|r| decode_record(&r)).transpose()
}

async fn insert_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    record: &DrawRecord,
) -> Result<(), StoreError> {
    let n = record.numbers();
    let s = record.specials();
    sqlx::query(
        "INSERT INTO draws (draw_id, draw_date, n1, n2, n3, n4, n5, n6, s1, s2, stored_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(i64::from(record.draw_id()))
    .bind(record.date().format("%Y-%m-%d").to_string())
    .bind(i64::from(n[0]))
    .bind(i64::from(n[1]))
    .bind(i64::from(n[2]))
    .bind(i64::from(n[3]))
    .bind(i64::from(n[4]))
    .bind(i64::from(n[5]))
    .bind(i64::from(s[0]))
    .bind(i64::from(s[1]))
    .bind(Utc::now().to_rfc3339())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn decode_raw(row: &SqliteRow) -> Result<RawDrawRow, StoreError> {
    let mut numbers = Vec::with_capacity(6);
    for column in ["n1", "n2", "n3", "n4", "n5", "n6"] {
        numbers.push(row.try_get::<i64, _>(column)?);
    }
    Ok(RawDrawRow {
        draw_id: row.try_get("draw_id")?,
        date: row.try_get("draw_date")?,
        numbers,
        specials: vec![row.try_get("s1")?, row.try_get("s2")?],
    })
}

fn decode_record(row: &SqliteRow) -> Result<DrawRecord, StoreError> {
    let raw = decode_raw(row)?;
    DrawRecord::try_from(&raw).map_err(|defect| StoreError::CorruptRow {
        draw_id: raw.draw_id,
        defect,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn draw(id: i64, numbers: [i64; 6], specials: [i64; 2], date: &str) -> DrawRecord {
        DrawRecord::try_from(RawDrawRow {
            draw_id: id,
            date: Some(date.to_string()),
            numbers: numbers.to_vec(),
            specials: specials.to_vec(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn merging_same_batch_twice_inserts_once() {
        let store = DrawStore::in_memory().await.unwrap();
        let batch = vec![
            draw(275, [1, 2, 3, 4, 5, 6], [1, 2], "2025-01-11"),
            draw(276, [3, 7, 12, 19, 33, 50], [1, 4], "2025-01-15"),
        ];

        let first = store.merge(&batch).await.unwrap();
        let before = store.all().await.unwrap();
        let second = store.merge(&batch).await.unwrap();
        let after = store.all().await.unwrap();

        assert_eq!(first, MergeCounts { inserted: 2, updated: 0 });
        assert_eq!(second, MergeCounts { inserted: 0, updated: 0 });
        assert_eq!(before, after);
        assert_eq!(store.max_draw_id().await.unwrap(), Some(276));
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn conflicting_draw_rejects_whole_batch() {
        let store = DrawStore::in_memory().await.unwrap();
        store
            .merge(&[draw(10, [1, 2, 3, 4, 5, 6], [1, 2], "2024-06-01")])
            .await
            .unwrap();

        let batch = vec![
            draw(11, [7, 8, 9, 10, 11, 12], [3, 4], "2024-06-05"),
            draw(10, [1, 2, 3, 4, 5, 7], [1, 2], "2024-06-01"),
        ];
        let err = store.merge(&batch).await.unwrap_err();
        match err {
            StoreError::Conflict { draw_id, fields, .. } => {
                assert_eq!(draw_id, 10);
                assert_eq!(fields, vec![DrawField::Numbers]);
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        assert_eq!(store.get(11).await.unwrap(), None);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn restore_is_the_only_way_to_replace() {
        let store = DrawStore::in_memory().await.unwrap();
        let original = draw(42, [1, 2, 3, 4, 5, 6], [1, 2], "2024-03-02");
        let corrected = draw(42, [1, 2, 3, 4, 5, 9], [1, 2], "2024-03-02");

        assert_eq!(store.restore(&original).await.unwrap(), RestoreOutcome::Inserted);
        assert_eq!(store.restore(&original).await.unwrap(), RestoreOutcome::Unchanged);
        assert_eq!(store.restore(&corrected).await.unwrap(), RestoreOutcome::Replaced);
        assert_eq!(store.get(42).await.unwrap(), Some(corrected));
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("nested/draws.db").display());

        let store = DrawStore::connect(&url, Duration::from_secs(5)).await.unwrap();
        store
            .merge(&[draw(1, [1, 2, 3, 4, 5, 6], [1, 2], "2022-05-28")])
            .await
            .unwrap();
        store.close().await;

        let reopened = DrawStore::connect(&url, Duration::from_secs(5)).await.unwrap();
        assert_eq!(reopened.max_draw_id().await.unwrap(), Some(1));
        assert_eq!(reopened.all_raw().await.unwrap()[0].date.as_deref(), Some("2022-05-28"));
    }

    #[tokio::test]
    async fn holes_between_stored_draws_are_reported() {
        let store = DrawStore::in_memory().await.unwrap();
        store
            .merge(&[
                draw(5, [1, 2, 3, 4, 5, 6], [1, 2], "2024-01-06"),
                draw(7, [1, 2, 3, 4, 5, 6], [1, 2], "2024-01-13"),
                draw(10, [1, 2, 3, 4, 5, 6], [1, 2], "2024-01-24"),
            ])
            .await
            .unwrap();

        assert_eq!(store.missing_ids(None).await.unwrap(), vec![6, 8, 9]);
        assert_eq!(store.missing_ids(Some(3)).await.unwrap(), vec![3, 4, 6, 8, 9]);
        assert!(DrawStore::in_memory()
            .await
            .unwrap()
            .missing_ids(Some(1))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn empty_store_has_no_max() {
        let store = DrawStore::in_memory().await.unwrap();
        assert_eq!(store.max_draw_id().await.unwrap(), None);
        assert!(store.all().await.unwrap().is_empty());
    }
}
