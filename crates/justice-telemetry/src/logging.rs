//! Persisted warnings for case rooms.
//!
//! Only WARN and ERROR events are kept. Each row carries the room context it
//! was emitted under (`case_id`, `connection_id`, `party`), taken from the
//! event's own fields or else from the nearest enclosing span that recorded
//! them, so `system.logs` can answer "what went wrong in this case".

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{span, Level};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    CREATE TABLE IF NOT EXISTS logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        severity INTEGER NOT NULL,
        level TEXT NOT NULL,
        target TEXT NOT NULL,
        message TEXT NOT NULL,
        case_id TEXT,
        connection_id TEXT,
        party TEXT,
        fields TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_logs_case ON logs(case_id, id);
    CREATE INDEX IF NOT EXISTS idx_logs_connection ON logs(connection_id, id);
";

/// Shared by `query` and `count`; parameters are
/// `(min_severity, case_id, connection_id, since)`.
const FILTER: &str = "
    WHERE severity >= ?1
      AND (?2 IS NULL OR case_id = ?2)
      AND (?3 IS NULL OR connection_id = ?3)
      AND (?4 IS NULL OR timestamp >= ?4)";

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 1000;

fn severity(level: Level) -> i64 {
    match level {
        Level::ERROR => 2,
        Level::WARN => 1,
        _ => 0,
    }
}

/// Room context attached to a log row.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub case_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub party: Option<String>,
}

impl RoomContext {
    fn is_empty(&self) -> bool {
        self.case_id.is_none() && self.connection_id.is_none() && self.party.is_none()
    }

    /// Fill whatever this context lacks from an enclosing one.
    fn inherit(&mut self, outer: &RoomContext) {
        for (mine, theirs) in [
            (&mut self.case_id, &outer.case_id),
            (&mut self.connection_id, &outer.connection_id),
            (&mut self.party, &outer.party),
        ] {
            if mine.is_none() {
                mine.clone_from(theirs);
            }
        }
    }
}

/// A persisted warning or error.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(flatten)]
    pub context: RoomContext,
    /// Remaining structured fields of the event (`error`, `sequence`, ...).
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

/// Filter for `SqliteLogSink::query`. Results are newest first.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    /// Lowest level to include; `WARN` also returns errors.
    pub min_level: Option<Level>,
    pub case_id: Option<String>,
    pub connection_id: Option<String>,
    /// RFC 3339 lower bound on the event timestamp.
    pub since: Option<String>,
    pub limit: Option<u32>,
}

impl LogQuery {
    fn filter_params(&self) -> (i64, Option<&str>, Option<&str>, Option<&str>) {
        (
            self.min_level.map_or(0, severity),
            self.case_id.as_deref(),
            self.connection_id.as_deref(),
            self.since.as_deref(),
        )
    }
}

/// One event on its way into the table.
struct Entry {
    timestamp: String,
    level: Level,
    target: String,
    message: String,
    context: RoomContext,
    fields: Map<String, Value>,
}

/// SQLite store for warn+ events.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        Self::with_connection(Connection::open(db_path)?)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, entry: &Entry) -> Result<(), rusqlite::Error> {
        let fields = if entry.fields.is_empty() {
            None
        } else {
            Some(Value::Object(entry.fields.clone()).to_string())
        };
        self.conn.lock().execute(
            "INSERT INTO logs
                 (timestamp, severity, level, target, message,
                  case_id, connection_id, party, fields)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                entry.timestamp,
                severity(entry.level),
                entry.level.as_str(),
                entry.target,
                entry.message,
                entry.context.case_id,
                entry.context.connection_id,
                entry.context.party,
                fields,
            ],
        )?;
        Ok(())
    }

    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let (min, case_id, connection_id, since) = q.filter_params();
        let limit = q.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, timestamp, level, target, message, case_id, connection_id, party, fields
             FROM logs {FILTER} ORDER BY id DESC LIMIT ?5"
        ))?;
        let rows = stmt.query_map(
            rusqlite::params![min, case_id, connection_id, since, limit],
            |row| {
                let fields: Option<String> = row.get(8)?;
                Ok(LogRecord {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    level: row.get(2)?,
                    target: row.get(3)?,
                    message: row.get(4)?,
                    context: RoomContext {
                        case_id: row.get(5)?,
                        connection_id: row.get(6)?,
                        party: row.get(7)?,
                    },
                    fields: fields
                        .and_then(|raw| serde_json::from_str(&raw).ok())
                        .unwrap_or_default(),
                })
            },
        )?;
        rows.collect()
    }

    /// Number of stored rows matching `q`, ignoring its limit.
    pub fn count(&self, q: &LogQuery) -> Result<i64, rusqlite::Error> {
        let (min, case_id, connection_id, since) = q.filter_params();
        self.conn.lock().query_row(
            &format!("SELECT COUNT(*) FROM logs {FILTER}"),
            rusqlite::params![min, case_id, connection_id, since],
            |row| row.get(0),
        )
    }
}

/// Collects an event's or span's fields, splitting out the room context.
#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    context: RoomContext,
    fields: Map<String, Value>,
}

impl FieldCollector {
    fn put(&mut self, field: &Field, value: Value) {
        let slot = match field.name() {
            "message" => &mut self.message,
            "case_id" => &mut self.context.case_id,
            "connection_id" => &mut self.context.connection_id,
            "party" => &mut self.context.party,
            name => {
                self.fields.insert(name.to_string(), value);
                return;
            }
        };
        *slot = Some(match value {
            Value::String(s) => s,
            other => other.to_string(),
        });
    }
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.put(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.into());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.put(field, Value::String(value.to_string()));
    }
}

/// tracing layer feeding warn+ events into a `SqliteLogSink`.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut collector = FieldCollector::default();
        attrs.record(&mut collector);
        if collector.context.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(collector.context);
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }

        let mut collector = FieldCollector::default();
        event.record(&mut collector);
        for span in ctx.event_scope(event).into_iter().flatten() {
            if let Some(outer) = span.extensions().get::<RoomContext>() {
                collector.context.inherit(outer);
            }
        }

        let entry = Entry {
            timestamp: Utc::now().to_rfc3339(),
            level,
            target: event.metadata().target().to_string(),
            message: collector.message.unwrap_or_default(),
            context: collector.context,
            fields: collector.fields,
        };
        let _ = self.sink.insert(&entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn entry(level: Level, message: &str, case_id: Option<&str>, timestamp: &str) -> Entry {
        Entry {
            timestamp: timestamp.into(),
            level,
            target: "justice_server::broadcast".into(),
            message: message.into(),
            context: RoomContext {
                case_id: case_id.map(String::from),
                ..Default::default()
            },
            fields: Map::new(),
        }
    }

    fn capture(f: impl FnOnce()) -> Arc<SqliteLogSink> {
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));
        tracing::subscriber::with_default(subscriber, f);
        sink
    }

    #[test]
    fn delivery_failure_keeps_room_context_and_fields() {
        let sink = capture(|| {
            tracing::info!(case_id = "case_1", "room created");
            tracing::warn!(
                case_id = "case_1",
                connection_id = "conn_9",
                sequence = 4_i64,
                error = "send queue full",
                "delivery failed, message dropped for this connection"
            );
        });

        let logs = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(logs.len(), 1);
        let log = &logs[0];
        assert_eq!(log.level, "WARN");
        assert_eq!(log.message, "delivery failed, message dropped for this connection");
        assert_eq!(log.context.case_id.as_deref(), Some("case_1"));
        assert_eq!(log.context.connection_id.as_deref(), Some("conn_9"));
        assert_eq!(log.fields["sequence"], 4);
        assert_eq!(log.fields["error"], "send queue full");
    }

    #[test]
    fn fallback_warning_inherits_case_and_party_from_span() {
        let sink = capture(|| {
            let span = tracing::info_span!("submit", case_id = "case_7", party = "b");
            let _enter = span.enter();
            tracing::warn!(error = "timed out", "commentary unavailable, using fallback text");
        });

        let logs = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(
            logs[0].context,
            RoomContext {
                case_id: Some("case_7".into()),
                connection_id: None,
                party: Some("b".into()),
            }
        );
    }

    #[test]
    fn event_fields_win_over_span_fields() {
        let sink = capture(|| {
            let span = tracing::info_span!("outer", case_id = "case_outer");
            let _enter = span.enter();
            tracing::error!(case_id = "case_inner", "evaluation failed");
        });
        let logs = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(logs[0].context.case_id.as_deref(), Some("case_inner"));
        assert_eq!(logs[0].level, "ERROR");
    }

    #[test]
    fn min_level_warn_includes_errors() {
        let sink = SqliteLogSink::in_memory().unwrap();
        sink.insert(&entry(Level::WARN, "queue full", None, "2026-10-01T12:00:00Z"))
            .unwrap();
        sink.insert(&entry(Level::ERROR, "ledger down", None, "2026-10-01T12:00:01Z"))
            .unwrap();

        let errors_only = LogQuery {
            min_level: Some(Level::ERROR),
            ..Default::default()
        };
        let logs = sink.query(&errors_only).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "ledger down");

        let warn_and_up = LogQuery {
            min_level: Some(Level::WARN),
            ..Default::default()
        };
        assert_eq!(sink.query(&warn_and_up).unwrap().len(), 2);
    }

    #[test]
    fn filters_by_case_and_since() {
        let sink = SqliteLogSink::in_memory().unwrap();
        sink.insert(&entry(Level::WARN, "old a", Some("case_a"), "2026-10-01T11:00:00Z"))
            .unwrap();
        sink.insert(&entry(Level::WARN, "new a", Some("case_a"), "2026-10-01T13:00:00Z"))
            .unwrap();
        sink.insert(&entry(Level::WARN, "new b", Some("case_b"), "2026-10-01T13:00:00Z"))
            .unwrap();

        let q = LogQuery {
            case_id: Some("case_a".into()),
            since: Some("2026-10-01T12:00:00Z".into()),
            ..Default::default()
        };
        let logs = sink.query(&q).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "new a");
        assert_eq!(sink.count(&q).unwrap(), 1);
    }

    #[test]
    fn limit_returns_newest_and_count_ignores_it() {
        let sink = SqliteLogSink::in_memory().unwrap();
        for i in 0..10 {
            let ts = format!("2026-10-01T12:00:{i:02}Z");
            sink.insert(&entry(Level::WARN, &format!("msg {i}"), None, &ts))
                .unwrap();
        }
        let q = LogQuery {
            limit: Some(3),
            ..Default::default()
        };
        let logs = sink.query(&q).unwrap();
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0].message, "msg 9");
        assert_eq!(sink.count(&q).unwrap(), 10);
    }

    #[test]
    fn record_serializes_flat_camel_case() {
        let record = LogRecord {
            id: 1,
            timestamp: "2026-10-01T12:00:00Z".into(),
            level: "WARN".into(),
            target: "justice_server::broadcast".into(),
            message: "delivery failed".into(),
            context: RoomContext {
                case_id: Some("case_1".into()),
                connection_id: Some("conn_1".into()),
                party: None,
            },
            fields: Map::new(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["caseId"], "case_1");
        assert_eq!(json["connectionId"], "conn_1");
        assert!(json.get("party").is_none());
        assert!(json.get("fields").is_none());
    }
}
