//! Document store for persisted daily totals.
//!
//! Documents are JSON objects addressed by `(collection, key)`. Writes use
//! merge-upsert semantics: fields in the write replace stored fields, every
//! other stored field is left untouched. The SQLite backend keeps the whole
//! object in one row so a merge is a read-modify-write inside a transaction.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use serde_json::{Map, Value};
use std::path::PathBuf;

use crate::error::StoreError;

pub type Document = Map<String, Value>;

pub trait DocumentStore: Send + Sync {
    fn get(&self, collection: &str, key: &str) -> Result<Option<Document>, StoreError>;

    fn merge_upsert(&self, collection: &str, key: &str, fields: &Document)
        -> Result<(), StoreError>;

    /// Returns `(key, document)` pairs whose key starts with `prefix`, ordered by key.
    fn list_prefix(
        &self,
        collection: &str,
        prefix: &str,
    ) -> Result<Vec<(String, Document)>, StoreError>;
}

/// Cumulative totals for one user on one day.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DailyTotals {
    pub good: f64,
    pub bad: f64,
    pub alarms: u64,
}

impl DailyTotals {
    /// Reads totals from a stored document; missing fields count as zero.
    pub fn from_document(doc: &Document) -> Self {
        let number = |field: &str| doc.get(field).and_then(Value::as_f64).unwrap_or(0.0);
        let alarms = doc
            .get("alarms")
            .and_then(|value| {
                value
                    .as_u64()
                    .or_else(|| value.as_f64().map(|v| v.max(0.0).round() as u64))
            })
            .unwrap_or(0);
        Self {
            good: number("good").max(0.0),
            bad: number("bad").max(0.0),
            alarms,
        }
    }

    pub fn to_fields(self) -> Document {
        let mut fields = Map::new();
        fields.insert("good".to_string(), Value::from(self.good));
        fields.insert("bad".to_string(), Value::from(self.bad));
        fields.insert("alarms".to_string(), Value::from(self.alarms));
        fields
    }

    pub fn combined(self, other: DailyTotals) -> Self {
        Self {
            good: self.good + other.good,
            bad: self.bad + other.bad,
            alarms: self.alarms + other.alarms,
        }
    }
}

pub fn report_date(now: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    now.with_timezone(&offset).date_naive()
}

pub fn document_key(user_id: &str, date: NaiveDate) -> String {
    format!("{}_{}", user_id, date.format("%Y-%m-%d"))
}

pub fn user_key_prefix(user_id: &str) -> String {
    format!("{}_", user_id)
}

/// Extracts the report date from a key produced by [`document_key`].
pub fn parse_report_date(user_id: &str, key: &str) -> Option<NaiveDate> {
    let date = key.strip_prefix(&user_key_prefix(user_id))?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: PathBuf) -> Result<Self, StoreError> {
        let store = Self { path };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS documents (
                    collection TEXT NOT NULL,
                    key TEXT NOT NULL,
                    body TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (collection, key)
                 );",
            )
            .map_err(|err| StoreError::Open(format!("Failed to initialize schema: {}", err)))
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, StoreError> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| StoreError::Open(format!("Failed to create data dir: {}", err)))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| StoreError::Open(format!("Failed to open sqlite db: {}", err)))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| StoreError::Open(format!("Failed to enable WAL: {}", err)))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| StoreError::Open(format!("Failed to set synchronous: {}", err)))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| StoreError::Open(format!("Failed to set busy_timeout: {}", err)))?;

        Ok(conn)
    }
}

fn read_body(conn: &Connection, collection: &str, key: &str) -> Result<Option<Document>, StoreError> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM documents WHERE collection = ?1 AND key = ?2",
            params![collection, key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|err| StoreError::Read {
            key: key.to_string(),
            details: err.to_string(),
        })?;

    body.map(|body| parse_body(key, &body)).transpose()
}

fn parse_body(key: &str, body: &str) -> Result<Document, StoreError> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(StoreError::Corrupt {
            key: key.to_string(),
            details: "document body is not an object".to_string(),
        }),
        Err(err) => Err(StoreError::Corrupt {
            key: key.to_string(),
            details: err.to_string(),
        }),
    }
}

impl DocumentStore for SqliteStore {
    fn get(&self, collection: &str, key: &str) -> Result<Option<Document>, StoreError> {
        self.with_connection(|conn| read_body(conn, collection, key))
    }

    fn merge_upsert(
        &self,
        collection: &str,
        key: &str,
        fields: &Document,
    ) -> Result<(), StoreError> {
        let write_err = |details: String| StoreError::Write {
            key: key.to_string(),
            details,
        };

        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|err| write_err(err.to_string()))?;

            let mut merged = read_body(&tx, collection, key)?.unwrap_or_default();
            for (field, value) in fields {
                merged.insert(field.clone(), value.clone());
            }
            let body = serde_json::to_string(&Value::Object(merged))
                .map_err(|err| write_err(format!("Failed to serialize document: {}", err)))?;

            tx.execute(
                "INSERT INTO documents (collection, key, body, updated_at) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(collection, key) DO UPDATE SET \
                    body = excluded.body, \
                    updated_at = excluded.updated_at",
                params![collection, key, body, Utc::now().to_rfc3339()],
            )
            .map_err(|err| write_err(err.to_string()))?;

            tx.commit().map_err(|err| write_err(err.to_string()))
        })
    }

    fn list_prefix(
        &self,
        collection: &str,
        prefix: &str,
    ) -> Result<Vec<(String, Document)>, StoreError> {
        let read_err = |details: String| StoreError::Read {
            key: format!("{}*", prefix),
            details,
        };

        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT key, body FROM documents \
                     WHERE collection = ?1 AND substr(key, 1, length(?2)) = ?2 \
                     ORDER BY key ASC",
                )
                .map_err(|err| read_err(err.to_string()))?;

            let rows = stmt
                .query_map(params![collection, prefix], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(|err| read_err(err.to_string()))?;

            let mut documents = Vec::new();
            for row in rows {
                let (key, body) = row.map_err(|err| read_err(err.to_string()))?;
                let document = parse_body(&key, &body)?;
                documents.push((key, document));
            }
            Ok(documents)
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    const COLLECTION: &str = "posture_reports";

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {}", other),
        }
    }

    fn temp_store() -> (tempfile::TempDir, SqliteStore) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let store = SqliteStore::new(temp_dir.path().join("reports.db")).expect("store init");
        (temp_dir, store)
    }

    #[test]
    fn missing_document_reads_as_none() {
        let (_dir, store) = temp_store();
        assert!(store
            .get(COLLECTION, "u1_2026-01-31")
            .expect("get")
            .is_none());
    }

    #[test]
    fn merge_upsert_preserves_untouched_fields() {
        let (_dir, store) = temp_store();
        store
            .merge_upsert(
                COLLECTION,
                "u1_2026-01-31",
                &doc(json!({"good": 100.0, "bad": 20.0, "alarms": 1, "note": "keep"})),
            )
            .expect("first write");
        store
            .merge_upsert(COLLECTION, "u1_2026-01-31", &doc(json!({"good": 110.0})))
            .expect("second write");

        let stored = store
            .get(COLLECTION, "u1_2026-01-31")
            .expect("get")
            .expect("document exists");
        assert_eq!(Value::Object(stored), json!({"good": 110.0, "bad": 20.0, "alarms": 1, "note": "keep"}));
    }

    #[test]
    fn collections_are_isolated() {
        let (_dir, store) = temp_store();
        store
            .merge_upsert("other", "u1_2026-01-31", &doc(json!({"good": 1.0})))
            .expect("write");
        assert!(store
            .get(COLLECTION, "u1_2026-01-31")
            .expect("get")
            .is_none());
    }

    #[test]
    fn list_prefix_returns_user_documents_in_key_order() {
        let (_dir, store) = temp_store();
        for key in ["u1_2026-02-01", "u1_2026-01-31", "u10_2026-01-31", "u2_2026-01-31"] {
            store
                .merge_upsert(COLLECTION, key, &doc(json!({"good": 1.0})))
                .expect("write");
        }

        let keys: Vec<String> = store
            .list_prefix(COLLECTION, &user_key_prefix("u1"))
            .expect("list")
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec!["u1_2026-01-31", "u1_2026-02-01"]);
    }

    #[test]
    fn daily_totals_default_missing_fields_to_zero() {
        let totals = DailyTotals::from_document(&doc(json!({"good": 12.5})));
        assert_eq!(
            totals,
            DailyTotals {
                good: 12.5,
                bad: 0.0,
                alarms: 0
            }
        );
    }

    #[test]
    fn daily_totals_accept_integer_and_float_fields() {
        let totals = DailyTotals::from_document(&doc(json!({"good": 100, "bad": 20, "alarms": 1.0})));
        assert_eq!(
            totals,
            DailyTotals {
                good: 100.0,
                bad: 20.0,
                alarms: 1
            }
        );
    }

    #[test]
    fn document_key_uses_report_offset_date() {
        let offset = FixedOffset::east_opt(330 * 60).unwrap();
        // 20:00 UTC is already the next day in Colombo.
        let now = Utc.with_ymd_and_hms(2026, 1, 31, 20, 0, 0).unwrap();
        let key = document_key("u1", report_date(now, offset));
        assert_eq!(key, "u1_2026-02-01");
        assert_eq!(
            parse_report_date("u1", &key),
            NaiveDate::from_ymd_opt(2026, 2, 1)
        );
    }

    #[test]
    fn parse_report_date_rejects_other_users_keys() {
        assert_eq!(parse_report_date("u1", "u1_x_2026-01-31"), None);
        assert_eq!(parse_report_date("u1", "u2_2026-01-31"), None);
    }
}
