use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};
use crate::model::{
    ChangeEvent, ChangeEventUpdate, ChangeType, EventSource, EventStatus, Initiator,
    NewChangeEvent, StoreStats, VelocityMetric,
};

const DEFAULT_QUERY_LIMIT: i64 = 50;
const DEFAULT_SEARCH_LIMIT: i64 = 20;
const RECENT_LIMIT: i64 = 100;

/// Filter options for [`EventStore::query`]. All filters are optional and
/// AND-combined.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventQuery {
    /// Matches the primary `service` or any element of `additional_services`.
    pub services: Vec<String>,
    pub change_types: Vec<ChangeType>,
    pub sources: Vec<EventSource>,
    pub environment: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub initiator: Option<Initiator>,
    pub status: Option<EventStatus>,
    pub limit: Option<i64>,
}

/// Durable, indexed, full-text-searchable store of change events backed by
/// a single local SQLite file.
#[derive(Clone)]
pub struct EventStore {
    pool: Pool<Sqlite>,
}

impl EventStore {
    /// Open (creating if necessary) the store at `database_url`, e.g.
    /// `sqlite://data/changelens.db` or `sqlite::memory:`.
    pub async fn open(database_url: &str) -> CoreResult<Self> {
        use sqlx::migrate::MigrateDatabase;

        let in_memory = database_url.contains(":memory:");

        // Ensure parent directory exists
        if let Some(db_path) = database_url.strip_prefix("sqlite://") {
            if let Some(parent) = std::path::Path::new(db_path).parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| CoreError::unavailable(format!("cannot create db dir: {}", e)))?;
            }
        }

        if !in_memory && !Sqlite::database_exists(database_url).await.unwrap_or(false) {
            info!("creating database at {}", database_url);
            Sqlite::create_database(database_url).await?;
        }

        // An in-memory database exists per connection, so it must be pinned
        // to exactly one.
        let options = if in_memory {
            sqlx::sqlite::SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            sqlx::sqlite::SqlitePoolOptions::new()
                .max_connections(20)
                .min_connections(1)
                .acquire_timeout(std::time::Duration::from_secs(30))
        };

        let pool = options.connect(database_url).await?;
        let store = Self { pool };
        store.create_schema().await?;
        Ok(store)
    }

    /// Private throwaway store for tests.
    pub async fn open_in_memory() -> CoreResult<Self> {
        Self::open("sqlite::memory:").await
    }

    async fn create_schema(&self) -> CoreResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS change_events (
                id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                service TEXT NOT NULL,
                additional_services TEXT NOT NULL DEFAULT '[]',
                change_type TEXT NOT NULL,
                source TEXT NOT NULL,
                initiator TEXT NOT NULL,
                initiator_identity TEXT,
                author_type TEXT,
                status TEXT NOT NULL,
                environment TEXT NOT NULL,
                summary TEXT NOT NULL,
                commit_sha TEXT,
                pr_number INTEGER,
                pr_url TEXT,
                repository TEXT,
                branch TEXT,
                diff TEXT,
                files_changed TEXT NOT NULL DEFAULT '[]',
                config_keys TEXT NOT NULL DEFAULT '[]',
                previous_version TEXT,
                new_version TEXT,
                blast_radius TEXT,
                idempotency_key TEXT,
                change_set_id TEXT,
                canonical_url TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_change_events_timestamp ON change_events(timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_change_events_service ON change_events(service)",
            "CREATE INDEX IF NOT EXISTS idx_change_events_change_type ON change_events(change_type)",
            "CREATE INDEX IF NOT EXISTS idx_change_events_environment ON change_events(environment)",
            "CREATE INDEX IF NOT EXISTS idx_change_events_status ON change_events(status)",
            "CREATE INDEX IF NOT EXISTS idx_change_events_commit_sha ON change_events(commit_sha)",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_change_events_idempotency_key
                ON change_events(idempotency_key) WHERE idempotency_key IS NOT NULL",
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        // Full-text index over summary and service, kept in sync with the
        // row table by triggers so every write is immediately searchable.
        sqlx::query(
            "CREATE VIRTUAL TABLE IF NOT EXISTS change_events_fts USING fts5(
                summary, service,
                content='change_events', content_rowid='rowid'
            )",
        )
        .execute(&self.pool)
        .await?;

        for statement in [
            "CREATE TRIGGER IF NOT EXISTS change_events_fts_ai AFTER INSERT ON change_events BEGIN
                INSERT INTO change_events_fts(rowid, summary, service)
                VALUES (new.rowid, new.summary, new.service);
            END",
            "CREATE TRIGGER IF NOT EXISTS change_events_fts_ad AFTER DELETE ON change_events BEGIN
                INSERT INTO change_events_fts(change_events_fts, rowid, summary, service)
                VALUES ('delete', old.rowid, old.summary, old.service);
            END",
            "CREATE TRIGGER IF NOT EXISTS change_events_fts_au AFTER UPDATE ON change_events BEGIN
                INSERT INTO change_events_fts(change_events_fts, rowid, summary, service)
                VALUES ('delete', old.rowid, old.summary, old.service);
                INSERT INTO change_events_fts(rowid, summary, service)
                VALUES (new.rowid, new.summary, new.service);
            END",
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Validates and persists a new event, filling server defaults.
    /// A duplicate idempotency key attempted as a fresh insert surfaces as
    /// `Conflict`; the ingestion pipeline looks the key up first to get
    /// duplicate-returns-existing semantics.
    pub async fn insert(&self, partial: NewChangeEvent) -> CoreResult<ChangeEvent> {
        validate_new_event(&partial)?;
        let event = partial.into_event(Utc::now());
        insert_event(&self.pool, &event).await?;
        debug!(event_id = %event.id, service = %event.service, "stored change event");
        Ok(event)
    }

    pub async fn get_by_idempotency_key(&self, key: &str) -> CoreResult<Option<ChangeEvent>> {
        let row = sqlx::query("SELECT * FROM change_events WHERE idempotency_key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    pub async fn find(&self, id: &str) -> CoreResult<Option<ChangeEvent>> {
        let row = sqlx::query("SELECT * FROM change_events WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    pub async fn get(&self, id: &str) -> CoreResult<ChangeEvent> {
        self.find(id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("change event {}", id)))
    }

    /// Applies the provided fields only and bumps `updated_at`. An update
    /// carrying no recognized field returns the current event untouched.
    pub async fn update(&self, id: &str, update: ChangeEventUpdate) -> CoreResult<ChangeEvent> {
        let current = self.get(id).await?;
        if update.is_empty() {
            return Ok(current);
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE change_events SET ");
        let mut fields = builder.separated(", ");
        if let Some(status) = update.status {
            fields.push("status = ");
            fields.push_bind_unseparated(status.as_str());
        }
        if let Some(summary) = &update.summary {
            if summary.trim().is_empty() {
                return Err(CoreError::validation("summary cannot be empty"));
            }
            fields.push("summary = ");
            fields.push_bind_unseparated(summary.clone());
        }
        if let Some(tags) = &update.tags {
            fields.push("tags = ");
            fields.push_bind_unseparated(encode_json(tags)?);
        }
        if let Some(metadata) = &update.metadata {
            fields.push("metadata = ");
            fields.push_bind_unseparated(encode_json(metadata)?);
        }
        if let Some(blast_radius) = &update.blast_radius {
            fields.push("blast_radius = ");
            fields.push_bind_unseparated(encode_json(blast_radius)?);
        }
        if let Some(change_set_id) = &update.change_set_id {
            fields.push("change_set_id = ");
            fields.push_bind_unseparated(change_set_id.clone());
        }
        fields.push("updated_at = ");
        fields.push_bind_unseparated(Utc::now());
        builder.push(" WHERE id = ");
        builder.push_bind(id);

        builder.build().execute(&self.pool).await?;
        self.get(id).await
    }

    pub async fn delete(&self, id: &str) -> CoreResult<()> {
        let result = sqlx::query("DELETE FROM change_events WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("change event {}", id)));
        }
        Ok(())
    }

    /// Filtered query ordered by `timestamp DESC`, insertion order on ties.
    pub async fn query(&self, options: &EventQuery) -> CoreResult<Vec<ChangeEvent>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM change_events WHERE 1=1");

        if !options.services.is_empty() {
            builder.push(" AND (service IN (");
            let mut in_list = builder.separated(", ");
            for service in &options.services {
                in_list.push_bind(service.clone());
            }
            builder.push(") OR EXISTS (SELECT 1 FROM json_each(change_events.additional_services) WHERE json_each.value IN (");
            let mut json_list = builder.separated(", ");
            for service in &options.services {
                json_list.push_bind(service.clone());
            }
            builder.push(")))");
        }
        if !options.change_types.is_empty() {
            builder.push(" AND change_type IN (");
            let mut in_list = builder.separated(", ");
            for ct in &options.change_types {
                in_list.push_bind(ct.as_str());
            }
            builder.push(")");
        }
        if !options.sources.is_empty() {
            builder.push(" AND source IN (");
            let mut in_list = builder.separated(", ");
            for source in &options.sources {
                in_list.push_bind(source.as_str());
            }
            builder.push(")");
        }
        if let Some(environment) = &options.environment {
            builder.push(" AND environment = ");
            builder.push_bind(environment.clone());
        }
        if let Some(since) = options.since {
            builder.push(" AND timestamp >= ");
            builder.push_bind(since);
        }
        if let Some(until) = options.until {
            builder.push(" AND timestamp <= ");
            builder.push_bind(until);
        }
        if let Some(initiator) = options.initiator {
            builder.push(" AND initiator = ");
            builder.push_bind(initiator.as_str());
        }
        if let Some(status) = options.status {
            builder.push(" AND status = ");
            builder.push_bind(status.as_str());
        }
        builder.push(" ORDER BY timestamp DESC, rowid ASC LIMIT ");
        builder.push_bind(options.limit.unwrap_or(DEFAULT_QUERY_LIMIT));

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(event_from_row).collect()
    }

    /// Full-text prefix search over summary and service, ranked by FTS5
    /// relevance.
    pub async fn search(&self, q: &str, limit: Option<i64>) -> CoreResult<Vec<ChangeEvent>> {
        let match_expr = match build_match_expr(q) {
            Some(expr) => expr,
            None => return Ok(Vec::new()),
        };
        let rows = sqlx::query(
            "SELECT ce.* FROM change_events_fts
             JOIN change_events ce ON ce.rowid = change_events_fts.rowid
             WHERE change_events_fts MATCH ?1
             ORDER BY rank
             LIMIT ?2",
        )
        .bind(match_expr)
        .bind(limit.unwrap_or(DEFAULT_SEARCH_LIMIT))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    /// Events touching any of `services` within the trailing window.
    pub async fn recent_for_services(
        &self,
        services: &[String],
        window_minutes: i64,
    ) -> CoreResult<Vec<ChangeEvent>> {
        self.query(&EventQuery {
            services: services.to_vec(),
            since: Some(Utc::now() - Duration::minutes(window_minutes)),
            limit: Some(RECENT_LIMIT),
            ..Default::default()
        })
        .await
    }

    /// Change velocity for one service over the trailing window. Two passes:
    /// a grouped count per change type and a timestamp scan for the mean
    /// interval between consecutive changes.
    pub async fn velocity(&self, service: &str, window_minutes: i64) -> CoreResult<VelocityMetric> {
        let window_end = Utc::now();
        let window_start = window_end - Duration::minutes(window_minutes);
        self.velocity_between(service, window_minutes, window_start, window_end, false)
            .await
    }

    /// `periods` sequential windows ending at now, oldest first. Window
    /// upper bounds are inclusive; an event exactly on a boundary counts
    /// once, in the later window.
    pub async fn velocity_trend(
        &self,
        service: &str,
        window_minutes: i64,
        periods: u32,
    ) -> CoreResult<Vec<VelocityMetric>> {
        let now = Utc::now();
        let mut out = Vec::with_capacity(periods as usize);
        for i in 0..periods as i64 {
            let offset = periods as i64 - 1 - i;
            let end = now - Duration::minutes(offset * window_minutes);
            let start = end - Duration::minutes(window_minutes);
            out.push(
                self.velocity_between(service, window_minutes, start, end, true)
                    .await?,
            );
        }
        Ok(out)
    }

    async fn velocity_between(
        &self,
        service: &str,
        window_minutes: i64,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        exclusive_lower: bool,
    ) -> CoreResult<VelocityMetric> {
        let lower_op = if exclusive_lower { ">" } else { ">=" };

        let grouped: Vec<SqliteRow> = sqlx::query(&format!(
            "SELECT change_type, COUNT(*) AS cnt FROM change_events
             WHERE service = ?1 AND timestamp {} ?2 AND timestamp <= ?3
             GROUP BY change_type",
            lower_op
        ))
        .bind(service)
        .bind(window_start)
        .bind(window_end)
        .fetch_all(&self.pool)
        .await?;

        let mut change_types: BTreeMap<ChangeType, i64> = BTreeMap::new();
        let mut change_count = 0i64;
        for row in &grouped {
            let raw: String = row.try_get("change_type")?;
            let count: i64 = row.try_get("cnt")?;
            let change_type = ChangeType::from_str(&raw)
                .map_err(|_| CoreError::invariant(format!("corrupt change_type: {}", raw)))?;
            change_types.insert(change_type, count);
            change_count += count;
        }

        let timestamps: Vec<SqliteRow> = sqlx::query(&format!(
            "SELECT timestamp FROM change_events
             WHERE service = ?1 AND timestamp {} ?2 AND timestamp <= ?3
             ORDER BY timestamp ASC",
            lower_op
        ))
        .bind(service)
        .bind(window_start)
        .bind(window_end)
        .fetch_all(&self.pool)
        .await?;

        let parsed: Vec<DateTime<Utc>> = timestamps
            .iter()
            .map(|row| row.try_get::<DateTime<Utc>, _>("timestamp"))
            .collect::<Result<_, _>>()?;
        let average_interval_minutes = mean_interval_minutes(&parsed);

        Ok(VelocityMetric {
            service: service.to_string(),
            window_minutes,
            window_start,
            window_end,
            change_count,
            change_types,
            average_interval_minutes,
        })
    }

    /// Busiest services by event count within the trailing window, used by
    /// triage when no suspects are supplied.
    pub async fn top_services(&self, window_minutes: i64, limit: i64) -> CoreResult<Vec<String>> {
        let since = Utc::now() - Duration::minutes(window_minutes);
        let rows = sqlx::query(
            "SELECT service, COUNT(*) AS cnt FROM change_events
             WHERE timestamp >= ?1
             GROUP BY service
             ORDER BY cnt DESC, service ASC
             LIMIT ?2",
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("service").map_err(CoreError::from))
            .collect()
    }

    /// Deletes events older than `days` days; returns how many were removed.
    pub async fn prune_older_than(&self, days: i64) -> CoreResult<u64> {
        let cutoff = Utc::now() - Duration::days(days);
        let result = sqlx::query("DELETE FROM change_events WHERE timestamp < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        let pruned = result.rows_affected();
        if pruned > 0 {
            info!(pruned, days, "pruned old change events");
        }
        Ok(pruned)
    }

    pub async fn stats(&self) -> CoreResult<StoreStats> {
        let total: i64 = sqlx::query("SELECT COUNT(*) AS cnt FROM change_events")
            .fetch_one(&self.pool)
            .await?
            .try_get("cnt")?;

        let mut stats = StoreStats {
            total,
            ..Default::default()
        };
        for (column, bucket) in [
            ("change_type", &mut stats.by_type),
            ("source", &mut stats.by_source),
            ("environment", &mut stats.by_environment),
        ] {
            let rows = sqlx::query(&format!(
                "SELECT {col}, COUNT(*) AS cnt FROM change_events GROUP BY {col}",
                col = column
            ))
            .fetch_all(&self.pool)
            .await?;
            for row in rows {
                let key: String = row.try_get(column)?;
                let count: i64 = row.try_get("cnt")?;
                bucket.insert(key, count);
            }
        }
        Ok(stats)
    }

    /// Grouping primitive for batch ingest: all inserts inside the returned
    /// transaction commit atomically or not at all.
    pub async fn begin(&self) -> CoreResult<StoreTransaction> {
        Ok(StoreTransaction {
            tx: self.pool.begin().await?,
        })
    }

    /// Closes the backing pool; subsequent operations fail `Unavailable`.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// In-flight atomic insert group. Dropping without `commit` rolls back.
pub struct StoreTransaction {
    tx: sqlx::Transaction<'static, Sqlite>,
}

impl StoreTransaction {
    pub async fn insert(&mut self, partial: NewChangeEvent) -> CoreResult<ChangeEvent> {
        validate_new_event(&partial)?;
        let event = partial.into_event(Utc::now());
        insert_event(&mut *self.tx, &event).await?;
        Ok(event)
    }

    pub async fn commit(self) -> CoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> CoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn validate_new_event(partial: &NewChangeEvent) -> CoreResult<()> {
    if partial
        .service
        .as_deref()
        .map(str::trim)
        .unwrap_or_default()
        .is_empty()
    {
        return Err(CoreError::validation("service is required")
            .with_hint("set `service` to the primary affected service id"));
    }
    if partial
        .summary
        .as_deref()
        .map(str::trim)
        .unwrap_or_default()
        .is_empty()
    {
        return Err(CoreError::validation("summary is required")
            .with_hint("describe the change in one sentence"));
    }
    if partial.change_type.is_none() {
        return Err(CoreError::validation("change_type is required"));
    }
    Ok(())
}

async fn insert_event<'e, E>(executor: E, event: &ChangeEvent) -> CoreResult<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO change_events (
            id, timestamp, service, additional_services, change_type, source,
            initiator, initiator_identity, author_type, status, environment,
            summary, commit_sha, pr_number, pr_url, repository, branch, diff,
            files_changed, config_keys, previous_version, new_version,
            blast_radius, idempotency_key, change_set_id, canonical_url,
            tags, metadata, created_at, updated_at
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
            ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28,
            ?29, ?30
        )",
    )
    .bind(&event.id)
    .bind(event.timestamp)
    .bind(&event.service)
    .bind(encode_json(&event.additional_services)?)
    .bind(event.change_type.as_str())
    .bind(event.source.as_str())
    .bind(event.initiator.as_str())
    .bind(&event.initiator_identity)
    .bind(event.author_type.map(|a| a.as_str()))
    .bind(event.status.as_str())
    .bind(&event.environment)
    .bind(&event.summary)
    .bind(&event.commit_sha)
    .bind(event.pr_number)
    .bind(&event.pr_url)
    .bind(&event.repository)
    .bind(&event.branch)
    .bind(&event.diff)
    .bind(encode_json(&event.files_changed)?)
    .bind(encode_json(&event.config_keys)?)
    .bind(&event.previous_version)
    .bind(&event.new_version)
    .bind(
        event
            .blast_radius
            .as_ref()
            .map(encode_json)
            .transpose()?,
    )
    .bind(&event.idempotency_key)
    .bind(&event.change_set_id)
    .bind(&event.canonical_url)
    .bind(encode_json(&event.tags)?)
    .bind(encode_json(&event.metadata)?)
    .bind(event.created_at)
    .bind(event.updated_at)
    .execute(executor)
    .await?;
    Ok(())
}

fn encode_json<T: serde::Serialize>(value: &T) -> CoreResult<String> {
    serde_json::to_string(value)
        .map_err(|e| CoreError::invariant(format!("JSON encode failed: {}", e)))
}

fn decode_json<T: serde::de::DeserializeOwned>(raw: &str, column: &str) -> CoreResult<T> {
    serde_json::from_str(raw)
        .map_err(|e| CoreError::invariant(format!("corrupt {} column: {}", column, e)))
}

fn parse_enum<T>(raw: &str, column: &str) -> CoreResult<T>
where
    T: FromStr<Err = CoreError>,
{
    raw.parse()
        .map_err(|_| CoreError::invariant(format!("corrupt {} column: {}", column, raw)))
}

fn event_from_row(row: &SqliteRow) -> CoreResult<ChangeEvent> {
    let change_type: String = row.try_get("change_type")?;
    let source: String = row.try_get("source")?;
    let initiator: String = row.try_get("initiator")?;
    let author_type: Option<String> = row.try_get("author_type")?;
    let status: String = row.try_get("status")?;
    let additional_services: String = row.try_get("additional_services")?;
    let files_changed: String = row.try_get("files_changed")?;
    let config_keys: String = row.try_get("config_keys")?;
    let blast_radius: Option<String> = row.try_get("blast_radius")?;
    let tags: String = row.try_get("tags")?;
    let metadata: String = row.try_get("metadata")?;

    Ok(ChangeEvent {
        id: row.try_get("id")?,
        timestamp: row.try_get("timestamp")?,
        service: row.try_get("service")?,
        additional_services: decode_json(&additional_services, "additional_services")?,
        change_type: parse_enum(&change_type, "change_type")?,
        source: parse_enum(&source, "source")?,
        initiator: parse_enum(&initiator, "initiator")?,
        initiator_identity: row.try_get("initiator_identity")?,
        author_type: author_type
            .as_deref()
            .map(|raw| parse_enum(raw, "author_type"))
            .transpose()?,
        status: parse_enum(&status, "status")?,
        environment: row.try_get("environment")?,
        summary: row.try_get("summary")?,
        commit_sha: row.try_get("commit_sha")?,
        pr_number: row.try_get("pr_number")?,
        pr_url: row.try_get("pr_url")?,
        repository: row.try_get("repository")?,
        branch: row.try_get("branch")?,
        diff: row.try_get("diff")?,
        files_changed: decode_json(&files_changed, "files_changed")?,
        config_keys: decode_json(&config_keys, "config_keys")?,
        previous_version: row.try_get("previous_version")?,
        new_version: row.try_get("new_version")?,
        blast_radius: blast_radius
            .as_deref()
            .map(|raw| decode_json(raw, "blast_radius"))
            .transpose()?,
        idempotency_key: row.try_get("idempotency_key")?,
        change_set_id: row.try_get("change_set_id")?,
        canonical_url: row.try_get("canonical_url")?,
        tags: decode_json(&tags, "tags")?,
        metadata: decode_json(&metadata, "metadata")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Whitespace-split the query, drop tokens shorter than two characters, and
/// OR the rest together as quoted prefix terms. Returns None when nothing
/// searchable remains.
fn build_match_expr(q: &str) -> Option<String> {
    let terms: Vec<String> = q
        .split_whitespace()
        .filter(|token| token.chars().count() >= 2)
        .map(|token| format!("\"{}\"*", token.replace('"', "\"\"")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

fn mean_interval_minutes(timestamps: &[DateTime<Utc>]) -> f64 {
    if timestamps.len() < 2 {
        return 0.0;
    }
    let total_minutes: f64 = timestamps
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).num_milliseconds() as f64 / 60_000.0)
        .sum();
    total_minutes / (timestamps.len() - 1) as f64
}
