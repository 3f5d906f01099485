//! Relational persistence for reference entities.
//!
//! Storage is reached only through [`EntityStore`]: one bulk existence query and
//! one batch upsert, both keyed by the external id. Which columns may reach a
//! table is decided by that table's [`TableSchema`] allow-list.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use paddock_core::{Category, ColumnValue, EntityRecord};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "paddock-store";

/// Destination table and the non-key columns it accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSchema {
    pub category: Category,
    pub table: &'static str,
    pub columns: &'static [&'static str],
}

const HORSE_COLUMNS: &[&str] = &[
    "date_of_birth",
    "sex_code",
    "colour",
    "region",
    "breeder",
    "sire_id",
    "dam_id",
    "damsire_id",
];
const TRAINER_COLUMNS: &[&str] = &["location"];
const NAME_ONLY: &[&str] = &[];

pub static SCHEMAS: [TableSchema; 7] = [
    TableSchema { category: Category::Horse, table: "horses", columns: HORSE_COLUMNS },
    TableSchema { category: Category::Sire, table: "sires", columns: NAME_ONLY },
    TableSchema { category: Category::Dam, table: "dams", columns: NAME_ONLY },
    TableSchema { category: Category::Damsire, table: "damsires", columns: NAME_ONLY },
    TableSchema { category: Category::Jockey, table: "jockeys", columns: NAME_ONLY },
    TableSchema { category: Category::Trainer, table: "trainers", columns: TRAINER_COLUMNS },
    TableSchema { category: Category::Owner, table: "owners", columns: NAME_ONLY },
];

pub fn schema_for(category: Category) -> &'static TableSchema {
    match category {
        Category::Horse => &SCHEMAS[0],
        Category::Sire => &SCHEMAS[1],
        Category::Dam => &SCHEMAS[2],
        Category::Damsire => &SCHEMAS[3],
        Category::Jockey => &SCHEMAS[4],
        Category::Trainer => &SCHEMAS[5],
        Category::Owner => &SCHEMAS[6],
    }
}

/// A record reduced to what its table accepts. Null values are not carried, so
/// an upsert can never overwrite stored data with null.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRow {
    pub id: String,
    pub name: String,
    pub values: Vec<(&'static str, ColumnValue)>,
    /// Columns the record carried that the table does not accept.
    pub dropped: Vec<&'static str>,
}

impl TableSchema {
    pub fn accepts(&self, column: &str) -> bool {
        self.columns.contains(&column)
    }

    pub fn filter(&self, record: &EntityRecord) -> EntityRow {
        let mut values = Vec::new();
        let mut dropped = Vec::new();
        for (column, value) in record.columns() {
            if !self.accepts(column) {
                dropped.push(column);
                continue;
            }
            if let Some(value) = value {
                values.push((column, value));
            }
        }
        EntityRow {
            id: record.id.clone(),
            name: record.name.clone(),
            values,
            dropped,
        }
    }

    pub fn column_sql_type(column: &str) -> &'static str {
        match column {
            "date_of_birth" => "DATE",
            _ => "TEXT",
        }
    }

    pub fn create_table_sql(&self) -> String {
        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    id TEXT PRIMARY KEY,\n    name TEXT NOT NULL,\n    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),\n    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()",
            self.table
        );
        for column in self.columns {
            sql.push_str(&format!(",\n    {} {}", column, Self::column_sql_type(column)));
        }
        sql.push_str("\n)");
        sql
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub failed: Vec<RecordFailure>,
}

impl BatchOutcome {
    pub fn absorb(&mut self, other: BatchOutcome) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.failed.extend(other.failed);
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl StoreError {
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        if is_connectivity_error(&err) {
            StoreError::Unavailable(err)
        } else {
            StoreError::Database(err)
        }
    }
}

pub fn is_connectivity_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Protocol(_)
    )
}

/// Failures that belong to one row rather than to the connection.
pub fn is_record_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(_) | sqlx::Error::Encode(_) | sqlx::Error::ColumnDecode { .. }
    )
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Stored name of every id in `ids` already present for `category`, in one
    /// query.
    async fn existing_names(
        &self,
        category: Category,
        ids: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, String>, StoreError>;

    /// The subset of `ids` already stored for `category`.
    async fn existing_ids(
        &self,
        category: Category,
        ids: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.existing_names(category, ids).await?.into_keys().collect())
    }

    /// Insert-or-update every row keyed by id. Rows that fail on their own are
    /// reported in [`BatchOutcome::failed`]; the rest are committed.
    async fn upsert_batch(
        &self,
        category: Category,
        rows: &[EntityRow],
    ) -> Result<BatchOutcome, StoreError>;
}

#[async_trait]
impl<T: EntityStore + ?Sized> EntityStore for Arc<T> {
    async fn existing_names(
        &self,
        category: Category,
        ids: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, String>, StoreError> {
        (**self).existing_names(category, ids).await
    }

    async fn upsert_batch(
        &self,
        category: Category,
        rows: &[EntityRow],
    ) -> Result<BatchOutcome, StoreError> {
        (**self).upsert_batch(category, rows).await
    }
}

#[derive(Debug, Clone)]
pub struct PgEntityStore {
    pool: PgPool,
}

impl PgEntityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(StoreError::Unavailable)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create any missing entity table. No versioning: existing tables are left
    /// as they are.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for schema in &SCHEMAS {
            let ddl = schema.create_table_sql();
            sqlx::query(&ddl)
                .execute(&self.pool)
                .await
                .map_err(StoreError::from_sqlx)?;
        }
        info!(tables = SCHEMAS.len(), "entity schema ensured");
        Ok(())
    }
}

/// `INSERT .. ON CONFLICT (id) DO UPDATE` for one row. Only `name`,
/// `updated_at` and the columns the row actually carries are updated.
pub fn upsert_statement<'args>(
    schema: &TableSchema,
    row: &EntityRow,
    now: DateTime<Utc>,
) -> QueryBuilder<'args, Postgres> {
    let mut qb: QueryBuilder<'args, Postgres> = QueryBuilder::new("INSERT INTO ");
    qb.push(schema.table);
    qb.push(" (id, name, created_at, updated_at");
    for (column, _) in &row.values {
        qb.push(", ");
        qb.push(*column);
    }
    qb.push(") VALUES (");
    {
        let mut values = qb.separated(", ");
        values.push_bind(row.id.clone());
        values.push_bind(row.name.clone());
        values.push_bind(now);
        values.push_bind(now);
        for (_, value) in &row.values {
            match value {
                ColumnValue::Text(text) => values.push_bind(text.clone()),
                ColumnValue::Date(date) => values.push_bind(*date),
            };
        }
    }
    qb.push(") ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, updated_at = EXCLUDED.updated_at");
    for (column, _) in &row.values {
        qb.push(format!(", {column} = EXCLUDED.{column}"));
    }
    qb.push(" RETURNING (xmax = 0) AS inserted");
    qb
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn existing_names(
        &self,
        category: Category,
        ids: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, String>, StoreError> {
        if ids.is_empty() {
            return Ok(BTreeMap::new());
        }
        let schema = schema_for(category);
        let sql = format!("SELECT id, name FROM {} WHERE id = ANY($1)", schema.table);
        let found: Vec<(String, String)> = sqlx::query_as(&sql)
            .bind(ids.iter().cloned().collect::<Vec<_>>())
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;
        Ok(found.into_iter().collect())
    }

    async fn upsert_batch(
        &self,
        category: Category,
        rows: &[EntityRow],
    ) -> Result<BatchOutcome, StoreError> {
        let schema = schema_for(category);
        let now = Utc::now();
        let mut outcome = BatchOutcome::default();
        let mut tx = self.pool.begin().await.map_err(StoreError::from_sqlx)?;

        for row in rows {
            // One savepoint per row keeps a constraint violation from poisoning
            // the surrounding transaction.
            let mut savepoint = Connection::begin(&mut *tx)
                .await
                .map_err(StoreError::from_sqlx)?;
            let mut statement = upsert_statement(schema, row, now);
            let result = statement
                .build_query_scalar::<bool>()
                .fetch_one(&mut *savepoint)
                .await;

            match result {
                Ok(inserted) => {
                    savepoint.commit().await.map_err(StoreError::from_sqlx)?;
                    if inserted {
                        outcome.inserted += 1;
                    } else {
                        outcome.updated += 1;
                    }
                }
                Err(err) if is_record_error(&err) => {
                    savepoint.rollback().await.map_err(StoreError::from_sqlx)?;
                    outcome.failed.push(RecordFailure {
                        id: row.id.clone(),
                        reason: err.to_string(),
                    });
                }
                Err(err) => return Err(StoreError::from_sqlx(err)),
            }
        }

        tx.commit().await.map_err(StoreError::from_sqlx)?;
        debug!(
            table = schema.table,
            inserted = outcome.inserted,
            updated = outcome.updated,
            failed = outcome.failed.len(),
            "batch committed"
        );
        Ok(outcome)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredEntity {
    pub id: String,
    pub name: String,
    pub values: BTreeMap<&'static str, ColumnValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredEntity {
    pub fn text(&self, column: &str) -> Option<&str> {
        match self.values.get(column) {
            Some(ColumnValue::Text(text)) => Some(text),
            _ => None,
        }
    }
}

/// Store with the same upsert semantics as [`PgEntityStore`], held in memory.
/// Backs dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    rows: Mutex<BTreeMap<(Category, String), StoredEntity>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, category: Category, id: &str) -> Option<StoredEntity> {
        self.rows
            .lock()
            .await
            .get(&(category, id.to_string()))
            .cloned()
    }

    pub async fn count(&self, category: Category) -> usize {
        self.rows
            .lock()
            .await
            .keys()
            .filter(|(c, _)| *c == category)
            .count()
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn existing_names(
        &self,
        category: Category,
        ids: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, String>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| {
                rows.get(&(category, id.clone()))
                    .map(|stored| (id.clone(), stored.name.clone()))
            })
            .collect())
    }

    async fn upsert_batch(
        &self,
        category: Category,
        rows: &[EntityRow],
    ) -> Result<BatchOutcome, StoreError> {
        let now = Utc::now();
        let mut stored = self.rows.lock().await;
        let mut outcome = BatchOutcome::default();

        for row in rows {
            match stored.get_mut(&(category, row.id.clone())) {
                Some(existing) => {
                    existing.name = row.name.clone();
                    existing.updated_at = now;
                    for (column, value) in &row.values {
                        existing.values.insert(*column, value.clone());
                    }
                    outcome.updated += 1;
                }
                None => {
                    stored.insert(
                        (category, row.id.clone()),
                        StoredEntity {
                            id: row.id.clone(),
                            name: row.name.clone(),
                            values: row.values.iter().cloned().collect(),
                            created_at: now,
                            updated_at: now,
                        },
                    );
                    outcome.inserted += 1;
                }
            }
        }
        Ok(outcome)
    }
}
