//! SQLite-backed authoritative store of normalized job records.
//!
//! Writes are append-only: a fingerprint that is already present is reported as a
//! duplicate and the stored row is left untouched. Every read filters on the active
//! flag and orders by collection time, newest first.
//!
//! SQLite's `LIKE` only folds ASCII case, so each row also carries lowercased shadow
//! columns (`search_text`, `location_lc`, `company_lc`) that text matching runs against.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use jobscope_core::{
    CompanyInsight, ContractType, ExperienceLevel, JobFilters, JobRecord, MarketInsight,
    RemoteType, Salary,
};
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{QueryBuilder, Row, Sqlite};
use thiserror::Error;
use tracing::debug;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        fingerprint       TEXT PRIMARY KEY,
        title             TEXT NOT NULL,
        company           TEXT NOT NULL,
        location          TEXT NOT NULL,
        description_raw   TEXT NOT NULL,
        description       TEXT NOT NULL,
        technologies      TEXT NOT NULL,
        requirements      TEXT NOT NULL,
        salary            TEXT,
        remote_type       TEXT NOT NULL,
        remote_confidence REAL NOT NULL,
        is_remote         INTEGER NOT NULL,
        experience_level  TEXT NOT NULL,
        contract_type     TEXT NOT NULL,
        quality_score     REAL NOT NULL,
        source_id         TEXT NOT NULL,
        url               TEXT,
        search_term       TEXT NOT NULL,
        collected_at      TEXT NOT NULL,
        is_active         INTEGER NOT NULL DEFAULT 1,
        search_text       TEXT NOT NULL DEFAULT '',
        location_lc       TEXT NOT NULL DEFAULT '',
        company_lc        TEXT NOT NULL DEFAULT ''
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_collected_at ON jobs (collected_at)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_source ON jobs (source_id)",
    r#"
    CREATE TABLE IF NOT EXISTS job_embeddings (
        fingerprint TEXT NOT NULL REFERENCES jobs (fingerprint),
        model       TEXT NOT NULL,
        dims        INTEGER NOT NULL,
        vector      BLOB NOT NULL,
        PRIMARY KEY (fingerprint, model)
    )
    "#,
];

/// Lowercased shadow columns, added in place to databases created before they existed.
const FOLDED_COLUMNS: [&str; 3] = ["search_text", "location_lc", "company_lc"];

/// SQLite caps bound parameters per statement; `get_many` batches below it.
const MAX_BINDS_PER_QUERY: usize = 500;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt row {fingerprint}: {message}")]
    Corrupt { fingerprint: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Inserted,
    Duplicate,
}

impl StoreOutcome {
    pub fn is_inserted(self) -> bool {
        self == StoreOutcome::Inserted
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStats {
    pub total_jobs: usize,
    pub active_jobs: usize,
    pub jobs_per_source: BTreeMap<String, usize>,
    pub embedded_jobs: usize,
    pub last_collected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct KnowledgeStore {
    pool: SqlitePool,
}

impl KnowledgeStore {
    /// Accepts `sqlite://path/to.db`, `sqlite:path` or `sqlite::memory:`.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        if database_url.contains(":memory:") {
            return Self::open_in_memory().await;
        }
        let path = database_url
            .strip_prefix("sqlite://")
            .or_else(|| database_url.strip_prefix("sqlite:"))
            .unwrap_or(database_url);
        Self::open(Path::new(path)).await
    }

    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Single long-lived connection: every new in-memory connection would be a fresh database.
    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        let store = Self { pool };
        store.add_folded_columns().await?;
        Ok(store)
    }

    async fn add_folded_columns(&self) -> Result<(), StorageError> {
        let existing: Vec<String> =
            sqlx::query_scalar("SELECT name FROM pragma_table_info('jobs')")
                .fetch_all(&self.pool)
                .await?;
        let missing = FOLDED_COLUMNS
            .iter()
            .filter(|column| !existing.iter().any(|name| name == *column))
            .collect::<Vec<_>>();
        if missing.is_empty() {
            return Ok(());
        }
        for column in &missing {
            sqlx::query(&format!(
                "ALTER TABLE jobs ADD COLUMN {column} TEXT NOT NULL DEFAULT ''"
            ))
            .execute(&self.pool)
            .await?;
        }

        let rows = sqlx::query("SELECT * FROM jobs").fetch_all(&self.pool).await?;
        let mut tx = self.pool.begin().await?;
        for row in &rows {
            let record = record_from_row(row)?;
            let folded = Folded::of(&record);
            sqlx::query(
                "UPDATE jobs SET search_text = ?, location_lc = ?, company_lc = ? \
                 WHERE fingerprint = ?",
            )
            .bind(folded.search_text)
            .bind(folded.location)
            .bind(folded.company)
            .bind(&record.fingerprint)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(?missing, backfilled = rows.len(), "lowercased search columns added");
        Ok(())
    }

    /// The underlying pool, for maintenance statements outside the store's own API.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Inserts the record unless its fingerprint is already stored. Never overwrites.
    pub async fn store(&self, record: &JobRecord) -> Result<StoreOutcome, StorageError> {
        let salary = record
            .salary
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let folded = Folded::of(record);
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (fingerprint, title, company, location, description_raw,
                              description, technologies, requirements, salary, remote_type,
                              remote_confidence, is_remote, experience_level, contract_type,
                              quality_score, source_id, url, search_term, collected_at,
                              is_active, search_text, location_lc, company_lc)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(fingerprint) DO NOTHING
            "#,
        )
        .bind(&record.fingerprint)
        .bind(&record.title)
        .bind(&record.company)
        .bind(&record.location)
        .bind(&record.description_raw)
        .bind(&record.description)
        .bind(serde_json::to_string(&record.technologies)?)
        .bind(serde_json::to_string(&record.requirements)?)
        .bind(salary)
        .bind(record.remote_type.as_str())
        .bind(record.remote_confidence)
        .bind(record.is_remote())
        .bind(record.experience_level.as_str())
        .bind(record.contract_type.as_str())
        .bind(record.quality_score)
        .bind(&record.source_id)
        .bind(&record.url)
        .bind(&record.search_term)
        .bind(format_ts(record.collected_at))
        .bind(record.active)
        .bind(folded.search_text)
        .bind(folded.location)
        .bind(folded.company)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(StoreOutcome::Inserted)
        } else {
            debug!(fingerprint = %record.fingerprint, "fingerprint already stored");
            Ok(StoreOutcome::Duplicate)
        }
    }

    pub async fn contains(&self, fingerprint: &str) -> Result<bool, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE fingerprint = ?")
            .bind(fingerprint)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    /// Case-insensitive substring match over title, company, description, technologies and
    /// location combined with conjunctive filters, newest first. An empty `text` matches
    /// everything.
    pub async fn query(
        &self,
        text: &str,
        filters: &JobFilters,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM jobs WHERE is_active = 1");

        let text = text.trim();
        if !text.is_empty() {
            qb.push(" AND search_text LIKE ")
                .push_bind(like_pattern(&text.to_lowercase()))
                .push(" ESCAPE '\\'");
        }
        push_filters(&mut qb, filters);
        qb.push(" ORDER BY collected_at DESC, fingerprint ASC LIMIT ")
            .push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Loads records by fingerprint, including inactive ones. Missing fingerprints are absent
    /// from the map.
    pub async fn get_many(
        &self,
        fingerprints: &[String],
    ) -> Result<HashMap<String, JobRecord>, StorageError> {
        let mut out = HashMap::with_capacity(fingerprints.len());
        for chunk in fingerprints.chunks(MAX_BINDS_PER_QUERY) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("SELECT * FROM jobs WHERE fingerprint IN (");
            let mut separated = qb.separated(", ");
            for fingerprint in chunk {
                separated.push_bind(fingerprint.as_str());
            }
            separated.push_unseparated(")");

            for row in qb.build().fetch_all(&self.pool).await? {
                let record = record_from_row(&row)?;
                out.insert(record.fingerprint.clone(), record);
            }
        }
        Ok(out)
    }

    /// Every active record, oldest first (replay order for index rebuilds).
    pub async fn active_records(&self) -> Result<Vec<JobRecord>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE is_active = 1 ORDER BY collected_at ASC, fingerprint ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn set_active(&self, fingerprint: &str, active: bool) -> Result<bool, StorageError> {
        let result = sqlx::query("UPDATE jobs SET is_active = ? WHERE fingerprint = ?")
            .bind(active)
            .bind(fingerprint)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn aggregate_insights(&self) -> Result<MarketInsight, StorageError> {
        let records = self.active_records().await?;
        Ok(MarketInsight::from_records(&records))
    }

    /// Aggregates every active posting whose company contains `name` (case-insensitive).
    pub async fn company_insights(&self, name: &str) -> Result<CompanyInsight, StorageError> {
        let name = name.trim();
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE is_active = 1 AND company_lc LIKE ? ESCAPE '\\' \
             ORDER BY collected_at DESC",
        )
        .bind(like_pattern(&name.to_lowercase()))
        .fetch_all(&self.pool)
        .await?;
        let records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CompanyInsight::from_records(name, &records))
    }

    pub async fn stats(&self) -> Result<StoreStats, StorageError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await?;
        let active: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE is_active = 1")
            .fetch_one(&self.pool)
            .await?;
        let embedded: i64 =
            sqlx::query_scalar("SELECT COUNT(DISTINCT fingerprint) FROM job_embeddings")
                .fetch_one(&self.pool)
                .await?;
        let last: Option<String> = sqlx::query_scalar("SELECT MAX(collected_at) FROM jobs")
            .fetch_one(&self.pool)
            .await?;

        let mut jobs_per_source = BTreeMap::new();
        let rows = sqlx::query(
            "SELECT source_id, COUNT(*) AS n FROM jobs WHERE is_active = 1 GROUP BY source_id",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            let source: String = row.try_get("source_id")?;
            let n: i64 = row.try_get("n")?;
            jobs_per_source.insert(source, n as usize);
        }

        Ok(StoreStats {
            total_jobs: total as usize,
            active_jobs: active as usize,
            jobs_per_source,
            embedded_jobs: embedded as usize,
            last_collected_at: last.as_deref().and_then(|ts| parse_ts(ts).ok()),
        })
    }

    pub async fn store_embedding(
        &self,
        fingerprint: &str,
        model: &str,
        vector: &[f32],
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO job_embeddings (fingerprint, model, dims, vector)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(fingerprint, model) DO UPDATE SET
                dims = excluded.dims,
                vector = excluded.vector
            "#,
        )
        .bind(fingerprint)
        .bind(model)
        .bind(vector.len() as i64)
        .bind(vec_to_blob(vector))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_embeddings(
        &self,
        model: &str,
    ) -> Result<Vec<(String, Vec<f32>)>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT e.fingerprint, e.vector
            FROM job_embeddings e
            JOIN jobs j ON j.fingerprint = e.fingerprint
            WHERE e.model = ? AND j.is_active = 1
            "#,
        )
        .bind(model)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let fingerprint: String = row.try_get("fingerprint")?;
                let blob: Vec<u8> = row.try_get("vector")?;
                Ok((fingerprint, blob_to_vec(&blob)))
            })
            .collect()
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, filters: &JobFilters) {
    if let Some(location) = filters.location.as_deref().map(str::trim) {
        qb.push(" AND location_lc LIKE ")
            .push_bind(like_pattern(&location.to_lowercase()))
            .push(" ESCAPE '\\'");
    }
    if let Some(company) = filters.company.as_deref().map(str::trim) {
        qb.push(" AND company_lc LIKE ")
            .push_bind(like_pattern(&company.to_lowercase()))
            .push(" ESCAPE '\\'");
    }
    if let Some(level) = filters.experience_level {
        qb.push(" AND experience_level = ")
            .push_bind(level.as_str());
    }
    if let Some(remote) = filters.remote {
        qb.push(" AND is_remote = ").push_bind(remote);
    }
}

/// Lowercased copies of the matchable fields. Fields are joined with a unit separator so
/// a pattern cannot match across a field boundary.
struct Folded {
    search_text: String,
    location: String,
    company: String,
}

impl Folded {
    fn of(record: &JobRecord) -> Self {
        let technologies = record
            .technologies
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ");
        let search_text = [
            record.title.as_str(),
            record.company.as_str(),
            record.description.as_str(),
            technologies.as_str(),
            record.location.as_str(),
        ]
        .join("\u{1f}")
        .to_lowercase();
        Self {
            search_text,
            location: record.location.to_lowercase(),
            company: record.company.to_lowercase(),
        }
    }
}

/// `%text%` with LIKE metacharacters escaped by backslash.
fn like_pattern(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('%');
    for ch in text.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('%');
    out
}

/// Fixed-width UTC timestamps so lexical order in SQL equals chronological order.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(text: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(text).map(|ts| ts.with_timezone(&Utc))
}

pub(crate) fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub(crate) fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn corrupt(fingerprint: &str, message: impl Into<String>) -> StorageError {
    StorageError::Corrupt {
        fingerprint: fingerprint.to_string(),
        message: message.into(),
    }
}

fn record_from_row(row: &SqliteRow) -> Result<JobRecord, StorageError> {
    let fingerprint: String = row.try_get("fingerprint")?;

    let remote_label: String = row.try_get("remote_type")?;
    let remote_type = RemoteType::from_label(&remote_label)
        .ok_or_else(|| corrupt(&fingerprint, format!("remote_type `{remote_label}`")))?;
    let level_label: String = row.try_get("experience_level")?;
    let experience_level = ExperienceLevel::from_label(&level_label)
        .ok_or_else(|| corrupt(&fingerprint, format!("experience_level `{level_label}`")))?;
    let contract_label: String = row.try_get("contract_type")?;
    let contract_type = ContractType::from_label(&contract_label)
        .ok_or_else(|| corrupt(&fingerprint, format!("contract_type `{contract_label}`")))?;
    let collected_raw: String = row.try_get("collected_at")?;
    let collected_at = parse_ts(&collected_raw)
        .map_err(|e| corrupt(&fingerprint, format!("collected_at: {e}")))?;

    let technologies: String = row.try_get("technologies")?;
    let requirements: String = row.try_get("requirements")?;
    let salary: Option<String> = row.try_get("salary")?;
    let salary = salary
        .as_deref()
        .map(serde_json::from_str::<Salary>)
        .transpose()?;

    Ok(JobRecord {
        title: row.try_get("title")?,
        company: row.try_get("company")?,
        location: row.try_get("location")?,
        description_raw: row.try_get("description_raw")?,
        description: row.try_get("description")?,
        technologies: serde_json::from_str(&technologies)?,
        requirements: serde_json::from_str(&requirements)?,
        salary,
        remote_type,
        remote_confidence: row.try_get("remote_confidence")?,
        experience_level,
        contract_type,
        quality_score: row.try_get("quality_score")?,
        source_id: row.try_get("source_id")?,
        url: row.try_get("url")?,
        search_term: row.try_get("search_term")?,
        collected_at,
        active: row.try_get("is_active")?,
        fingerprint,
    })
}
