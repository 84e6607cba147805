//! PostgreSQL implementation of EventLog
//!
//! Persistence using PostgreSQL with:
//! - One row per stream in `event_streams` holding `next_offset` and `closed`
//! - Appends serialized per stream by `SELECT ... FOR UPDATE` on that row
//! - Events in `stream_events`, primary key `(stream_id, stream_offset)`

use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::{debug, error, instrument};

use agentdeck_core::{Channel, Event, Offset, StreamId};

use super::store::{EventLog, LogError, StreamHead, StreamSchema};

/// PostgreSQL implementation of EventLog
///
/// # Example
///
/// ```ignore
/// use agentdeck_durable::PostgresEventLog;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/agentdeck").await?;
/// let log = PostgresEventLog::new(pool);
/// log.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresEventLog {
    pool: PgPool,
}

impl PostgresEventLog {
    /// Create a new PostgreSQL log with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and build a log
    pub async fn connect(database_url: &str) -> Result<Self, LogError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| LogError::Database(e.to_string()))?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply embedded migrations
    pub async fn migrate(&self) -> Result<(), LogError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                LogError::Database(e.to_string())
            })
    }
}

fn db_offset(offset: Offset) -> i64 {
    i64::try_from(offset).unwrap_or(i64::MAX)
}

fn parse_schema(value: Option<serde_json::Value>) -> Result<StreamSchema, LogError> {
    match value {
        None => Ok(StreamSchema::All),
        Some(value) => {
            serde_json::from_value(value).map_err(|e| LogError::Serialization(e.to_string()))
        }
    }
}

fn event_from_row(row: &PgRow) -> Event {
    let channel: String = row.get("channel");
    Event {
        id: row.get("id"),
        stream_id: StreamId::new(row.get::<String, _>("stream_id")),
        channel: Channel::parse(&channel),
        payload: row.get("payload"),
        timestamp: row.get("timestamp_ms"),
        offset: row.get::<i64, _>("stream_offset") as Offset,
    }
}

#[async_trait]
impl EventLog for PostgresEventLog {
    #[instrument(skip(self))]
    async fn create_stream(
        &self,
        stream_id: &StreamId,
        schema: StreamSchema,
    ) -> Result<(), LogError> {
        let schema_json = match &schema {
            StreamSchema::All => None,
            other => Some(
                serde_json::to_value(other).map_err(|e| LogError::Serialization(e.to_string()))?,
            ),
        };

        let result = sqlx::query(
            r#"
            INSERT INTO event_streams (stream_id, schema)
            VALUES ($1, $2)
            ON CONFLICT (stream_id) DO NOTHING
            "#,
        )
        .bind(stream_id.as_str())
        .bind(&schema_json)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create stream: {}", e);
            LogError::Database(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            return Err(LogError::StreamAlreadyExists(stream_id.clone()));
        }

        debug!(%stream_id, "created stream");
        Ok(())
    }

    #[instrument(skip(self, payload))]
    async fn append(
        &self,
        stream_id: &StreamId,
        channel: Channel,
        payload: serde_json::Value,
    ) -> Result<Event, LogError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LogError::Database(e.to_string()))?;

        // Row lock serializes appends to this stream only
        let row = sqlx::query(
            r#"
            SELECT next_offset, closed, schema
            FROM event_streams
            WHERE stream_id = $1
            FOR UPDATE
            "#,
        )
        .bind(stream_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| LogError::Database(e.to_string()))?
        .ok_or_else(|| LogError::StreamNotFound(stream_id.clone()))?;

        let closed: bool = row.get("closed");
        if closed {
            return Err(LogError::StreamClosed(stream_id.clone()));
        }
        let schema = parse_schema(row.get("schema"))?;
        if !schema.allows(channel) {
            return Err(LogError::ChannelNotAllowed {
                stream_id: stream_id.clone(),
                channel,
            });
        }

        let offset = row.get::<i64, _>("next_offset") as Offset;
        let event = Event::new(stream_id.clone(), channel, payload, offset);

        sqlx::query(
            r#"
            INSERT INTO stream_events (stream_id, stream_offset, id, channel, payload, timestamp_ms)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(stream_id.as_str())
        .bind(db_offset(offset))
        .bind(&event.id)
        .bind(channel.as_str())
        .bind(&event.payload)
        .bind(event.timestamp)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to insert event: {}", e);
            LogError::Database(e.to_string())
        })?;

        sqlx::query("UPDATE event_streams SET next_offset = next_offset + 1 WHERE stream_id = $1")
            .bind(stream_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| LogError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| LogError::Database(e.to_string()))?;

        debug!(%stream_id, offset, %channel, "appended event");
        Ok(event)
    }

    #[instrument(skip(self))]
    async fn read(
        &self,
        stream_id: &StreamId,
        from_offset: Offset,
        limit: usize,
    ) -> Result<Vec<Event>, LogError> {
        let rows = sqlx::query(
            r#"
            SELECT stream_id, stream_offset, id, channel, payload, timestamp_ms
            FROM stream_events
            WHERE stream_id = $1 AND stream_offset >= $2
            ORDER BY stream_offset
            LIMIT $3
            "#,
        )
        .bind(stream_id.as_str())
        .bind(db_offset(from_offset))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to read events: {}", e);
            LogError::Database(e.to_string())
        })?;

        if rows.is_empty() {
            // Distinguish an empty range from a missing stream
            self.head(stream_id).await?;
        }

        Ok(rows.iter().map(event_from_row).collect())
    }

    #[instrument(skip(self))]
    async fn head(&self, stream_id: &StreamId) -> Result<StreamHead, LogError> {
        let row = sqlx::query(
            r#"
            SELECT next_offset, closed FROM event_streams WHERE stream_id = $1
            "#,
        )
        .bind(stream_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LogError::Database(e.to_string()))?
        .ok_or_else(|| LogError::StreamNotFound(stream_id.clone()))?;

        Ok(StreamHead {
            next_offset: row.get::<i64, _>("next_offset") as Offset,
            closed: row.get("closed"),
        })
    }

    #[instrument(skip(self))]
    async fn close_stream(&self, stream_id: &StreamId) -> Result<(), LogError> {
        let result = sqlx::query("UPDATE event_streams SET closed = TRUE WHERE stream_id = $1")
            .bind(stream_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to close stream: {}", e);
                LogError::Database(e.to_string())
            })?;

        if result.rows_affected() == 0 {
            return Err(LogError::StreamNotFound(stream_id.clone()));
        }

        debug!(%stream_id, "closed stream");
        Ok(())
    }
}
