//! SQLite storage driver
//!
//! Two connection pools: a single-connection writer pool (SQLite write
//! lock) and a multi-connection reader pool. Events are stored with their
//! raw JSON for cheap retrieval plus indexed columns for filtering; a side
//! table carries tag name/value pairs for tag queries.

use crate::error::{RelayError, Result};
use crate::storage::{NotifyFn, PutOutcome, QueryHandle, Storage};
use nostr_core::nip77::{ReconciliationState, Record};
use nostr_core::{Event, Filter, KindClassification, classify_kind, sort_events};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};

/// Hard ceiling on rows fetched per filter, above any client limit
const QUERY_CEILING: usize = 5_000;

pub struct SqliteStore {
    writer: Pool<SqliteConnectionManager>,
    reader: Pool<SqliteConnectionManager>,
    notify: Mutex<Option<NotifyFn>>,
}

impl SqliteStore {
    pub fn open(uri: &str) -> Result<Self> {
        let writer = Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::file(uri))?;
        let reader = Pool::builder()
            .max_size(8)
            .build(SqliteConnectionManager::file(uri))?;

        let conn = writer.get()?;
        Self::init_schema(&conn)?;
        drop(conn);

        info!(uri, "sqlite store opened");
        Ok(Self {
            writer,
            reader,
            notify: Mutex::new(None),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS events (
                key INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                pubkey TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                kind INTEGER NOT NULL,
                d_tag TEXT,
                content TEXT NOT NULL,
                raw_event TEXT NOT NULL,
                relay_url TEXT,
                first_seen INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_pubkey ON events(pubkey)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_created_at ON events(created_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_replaceable ON events(pubkey, kind, d_tag)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS event_tags (
                event_key INTEGER NOT NULL,
                tag_name TEXT NOT NULL,
                tag_value TEXT,
                FOREIGN KEY (event_key) REFERENCES events(key) ON DELETE CASCADE
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_event_tags_name_value
             ON event_tags(tag_name, tag_value)",
            [],
        )?;

        debug!("schema initialized");
        Ok(())
    }

    fn insert(
        &self,
        conn: &Connection,
        event: &Event,
        d_tag: Option<&str>,
        relay_url: Option<&str>,
    ) -> Result<u64> {
        let raw_event = serde_json::to_string(event)?;
        let now = unix_now();

        conn.execute(
            "INSERT INTO events (id, pubkey, created_at, kind, d_tag, content, raw_event, relay_url, first_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                &event.id,
                &event.pubkey,
                event.created_at,
                event.kind,
                d_tag,
                &event.content,
                raw_event,
                relay_url,
                now,
            ],
        )?;
        let key = conn.last_insert_rowid() as u64;

        for tag in &event.tags {
            if let Some(tag_name) = tag.first() {
                conn.execute(
                    "INSERT INTO event_tags (event_key, tag_name, tag_value) VALUES (?1, ?2, ?3)",
                    params![key, tag_name, tag.get(1).map(|s| s.as_str())],
                )?;
            }
        }

        Ok(key)
    }

    fn put(&self, event: &Event, relay_url: Option<&str>) -> Result<PutOutcome> {
        let classification = classify_kind(event.kind);
        if classification == KindClassification::Ephemeral {
            return Ok(PutOutcome::Ephemeral);
        }

        let mut conn = self.writer.get()?;

        let exists: Option<i64> = conn
            .query_row(
                "SELECT key FROM events WHERE id = ?1",
                params![&event.id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Ok(PutOutcome::Duplicate);
        }

        let d_tag: Option<String> = match classification {
            KindClassification::Addressable => Some(event.d_tag().unwrap_or_default().to_string()),
            _ => None,
        };

        // one transaction covers the overwrite delete and the insert, so a
        // crash in between cannot drop the stored event
        let tx = conn.transaction()?;

        let mut replaced = false;
        if matches!(
            classification,
            KindClassification::Replaceable | KindClassification::Addressable
        ) {
            let existing: Option<(i64, i64)> = tx
                .query_row(
                    "SELECT key, created_at FROM events
                     WHERE pubkey = ?1 AND kind = ?2 AND d_tag IS ?3",
                    params![&event.pubkey, event.kind, d_tag.as_deref()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            if let Some((existing_key, existing_created_at)) = existing {
                // ties keep the event already stored
                if event.created_at <= existing_created_at {
                    return Ok(PutOutcome::Superseded);
                }
                tx.execute("DELETE FROM events WHERE key = ?1", params![existing_key])?;
                tx.execute(
                    "DELETE FROM event_tags WHERE event_key = ?1",
                    params![existing_key],
                )?;
                replaced = true;
            }
        }

        let key = self.insert(&tx, event, d_tag.as_deref(), relay_url)?;
        tx.commit()?;
        drop(conn);

        if let Ok(guard) = self.notify.lock()
            && let Some(ref callback) = *guard
        {
            callback(key);
        }

        Ok(if replaced {
            PutOutcome::Replaced
        } else {
            PutOutcome::Stored
        })
    }

    /// Run one filter against SQL, post-filtering tag predicates in Rust.
    fn query_one(&self, conn: &Connection, filter: &Filter, ceiling: usize) -> Result<Vec<Event>> {
        let mut sql = String::from("SELECT raw_event FROM events WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref ids) = filter.ids
            && !ids.is_empty()
        {
            let clauses = ids
                .iter()
                .map(|id| if id.len() == 64 { "id = ?" } else { "id LIKE ?" })
                .collect::<Vec<_>>()
                .join(" OR ");
            sql.push_str(&format!(" AND ({})", clauses));
            for id in ids {
                if id.len() == 64 {
                    args.push(Box::new(id.clone()));
                } else {
                    args.push(Box::new(format!("{}%", id)));
                }
            }
        }

        if let Some(ref authors) = filter.authors
            && !authors.is_empty()
        {
            let clauses = authors
                .iter()
                .map(|_| "pubkey LIKE ?")
                .collect::<Vec<_>>()
                .join(" OR ");
            sql.push_str(&format!(" AND ({})", clauses));
            for author in authors {
                args.push(Box::new(format!("{}%", author)));
            }
        }

        if let Some(ref kinds) = filter.kinds
            && !kinds.is_empty()
        {
            let placeholders = kinds.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            sql.push_str(&format!(" AND kind IN ({})", placeholders));
            for kind in kinds {
                args.push(Box::new(*kind));
            }
        }

        if let Some(since) = filter.since {
            sql.push_str(" AND created_at >= ?");
            args.push(Box::new(since));
        }
        if let Some(until) = filter.until {
            sql.push_str(" AND created_at <= ?");
            args.push(Box::new(until));
        }

        sql.push_str(" ORDER BY created_at DESC, id ASC LIMIT ?");
        args.push(Box::new(ceiling as i64));

        let mut stmt = conn.prepare(&sql)?;
        let arg_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let rows = stmt.query_map(arg_refs.as_slice(), |row| row.get::<_, String>(0))?;

        let mut events = Vec::new();
        for row in rows {
            let event: Event = serde_json::from_str(&row?)?;
            if filter.matches(&event) {
                events.push(event);
            }
        }
        Ok(events)
    }

    fn collect(&self, filters: &[Filter], ceiling: usize) -> Result<Vec<Event>> {
        let conn = self.reader.get()?;
        let mut by_id: HashMap<String, Event> = HashMap::new();
        for filter in filters {
            let per_filter = filter.limit.unwrap_or(ceiling).min(ceiling);
            for event in self.query_one(&conn, filter, per_filter)? {
                by_id.entry(event.id.clone()).or_insert(event);
            }
        }
        let mut events: Vec<Event> = by_id.into_values().collect();
        sort_events(&mut events);
        Ok(events)
    }
}

impl Storage for SqliteStore {
    fn put_event(&self, event: &Event) -> Result<PutOutcome> {
        self.put(event, None)
    }

    fn put_event_with_relay(&self, event: &Event, relay_url: &str) -> Result<PutOutcome> {
        self.put(event, Some(relay_url))
    }

    fn delete_event(&self, id_hex: &str) -> Result<bool> {
        let conn = self.writer.get()?;
        let key: Option<i64> = conn
            .query_row(
                "SELECT key FROM events WHERE id = ?1",
                params![id_hex],
                |row| row.get(0),
            )
            .optional()?;
        let Some(key) = key else {
            return Ok(false);
        };
        conn.execute("DELETE FROM events WHERE key = ?1", params![key])?;
        conn.execute("DELETE FROM event_tags WHERE event_key = ?1", params![key])?;
        Ok(true)
    }

    fn query(&self, filters: &[Filter], limit: usize) -> Result<QueryHandle> {
        let mut events = self.collect(filters, limit.min(QUERY_CEILING))?;
        events.truncate(limit.min(QUERY_CEILING));
        Ok(QueryHandle::new(events))
    }

    fn count(&self, filters: &[Filter]) -> Result<u64> {
        Ok(self.collect(filters, QUERY_CEILING)?.len() as u64)
    }

    fn search(&self, query: &str, scope: &Filter, limit: usize) -> Result<Option<QueryHandle>> {
        let conn = self.reader.get()?;
        let pattern = format!("%{}%", query.replace('%', "\\%").replace('_', "\\_"));
        let mut stmt = conn.prepare(
            "SELECT raw_event FROM events
             WHERE content LIKE ?1 ESCAPE '\\'
             ORDER BY created_at DESC, id ASC LIMIT ?2",
        )?;
        let ceiling = limit.min(QUERY_CEILING) as i64;
        let rows = stmt.query_map(params![pattern, ceiling], |row| row.get::<_, String>(0))?;

        let mut events = Vec::new();
        for row in rows {
            let event: Event = serde_json::from_str(&row?)?;
            if scope.matches(&event) {
                events.push(event);
            }
        }
        Ok(Some(QueryHandle::new(events)))
    }

    fn set_digest(&self, scope: &Filter) -> Result<Option<ReconciliationState>> {
        let events = self.collect(std::slice::from_ref(scope), QUERY_CEILING)?;
        let mut records = Vec::with_capacity(events.len());
        for event in &events {
            let bytes = hex::decode(&event.id)
                .map_err(|e| RelayError::Storage(format!("bad stored id: {}", e)))?;
            if bytes.len() != 32 {
                return Err(RelayError::Storage("bad stored id length".to_string()));
            }
            let mut id = [0u8; 32];
            id.copy_from_slice(&bytes);
            records.push(Record::new(event.created_at.max(0) as u64, id));
        }
        Ok(Some(ReconciliationState::new(records)))
    }

    fn notify_callback(&self, callback: NotifyFn) {
        if let Ok(mut guard) = self.notify.lock() {
            *guard = Some(callback);
        }
    }

    fn get_by_key(&self, key: u64) -> Result<Option<Event>> {
        let conn = self.reader.get()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT raw_event FROM events WHERE key = ?1",
                params![key as i64],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_core::{EventTemplate, finalize_event, generate_secret_key};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;

    fn open_store() -> (SqliteStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let store = SqliteStore::open(path.to_str().unwrap()).unwrap();
        (store, dir)
    }

    fn event_with(sk: &[u8; 32], kind: u32, created_at: i64, content: &str) -> Event {
        let template = EventTemplate {
            kind,
            tags: vec![],
            content: content.to_string(),
            created_at,
        };
        finalize_event(&template, sk).unwrap()
    }

    fn text_note(content: &str) -> Event {
        event_with(&generate_secret_key(), 1, 1_700_000_000, content)
    }

    #[test]
    fn test_put_and_query() {
        let (store, _dir) = open_store();
        let event = text_note("hello");
        assert_eq!(store.put_event(&event).unwrap(), PutOutcome::Stored);

        let filter = Filter {
            kinds: Some(vec![1]),
            ..Default::default()
        };
        let mut handle = store.query(&[filter], 10).unwrap();
        let batch = handle.next_batch(10);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, event.id);
    }

    #[test]
    fn test_duplicate_put() {
        let (store, _dir) = open_store();
        let event = text_note("once");
        assert_eq!(store.put_event(&event).unwrap(), PutOutcome::Stored);
        assert_eq!(store.put_event(&event).unwrap(), PutOutcome::Duplicate);
        assert_eq!(store.count(&[Filter::default()]).unwrap(), 1);
    }

    #[test]
    fn test_ephemeral_not_stored() {
        let (store, _dir) = open_store();
        let event = event_with(&generate_secret_key(), 20001, 1_700_000_000, "gone");
        assert_eq!(store.put_event(&event).unwrap(), PutOutcome::Ephemeral);
        assert_eq!(store.count(&[Filter::default()]).unwrap(), 0);
    }

    #[test]
    fn test_replaceable_overwrite_newer_wins() {
        let (store, _dir) = open_store();
        let sk = generate_secret_key();
        let e1 = event_with(&sk, 0, 100, "{\"name\":\"old\"}");
        let e2 = event_with(&sk, 0, 200, "{\"name\":\"new\"}");

        assert_eq!(store.put_event(&e1).unwrap(), PutOutcome::Stored);
        assert_eq!(store.put_event(&e2).unwrap(), PutOutcome::Replaced);

        let filter = Filter {
            authors: Some(vec![e1.pubkey.clone()]),
            kinds: Some(vec![0]),
            ..Default::default()
        };
        let mut handle = store.query(&[filter], 10).unwrap();
        let batch = handle.next_batch(10);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, e2.id);
    }

    #[test]
    fn test_replaceable_older_is_superseded() {
        let (store, _dir) = open_store();
        let sk = generate_secret_key();
        let e1 = event_with(&sk, 0, 200, "{\"name\":\"current\"}");
        let e2 = event_with(&sk, 0, 100, "{\"name\":\"stale\"}");

        assert_eq!(store.put_event(&e1).unwrap(), PutOutcome::Stored);
        assert_eq!(store.put_event(&e2).unwrap(), PutOutcome::Superseded);

        let filter = Filter {
            kinds: Some(vec![0]),
            ..Default::default()
        };
        let mut handle = store.query(&[filter], 10).unwrap();
        let batch = handle.next_batch(10);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, e1.id);
    }

    #[test]
    fn test_overwrite_drops_old_tag_rows() {
        let (store, _dir) = open_store();
        let sk = generate_secret_key();
        let make = |created_at: i64, label: &str| {
            let template = EventTemplate {
                kind: 0,
                tags: vec![vec!["t".to_string(), label.to_string()]],
                content: "{}".to_string(),
                created_at,
            };
            finalize_event(&template, &sk).unwrap()
        };

        assert_eq!(store.put_event(&make(100, "old")).unwrap(), PutOutcome::Stored);
        assert_eq!(
            store.put_event(&make(200, "new")).unwrap(),
            PutOutcome::Replaced
        );

        let tag_filter = |label: &str| {
            let mut tags = std::collections::HashMap::new();
            tags.insert("#t".to_string(), vec![label.to_string()]);
            Filter {
                tags: Some(tags),
                ..Default::default()
            }
        };
        let mut handle = store.query(&[tag_filter("old")], 10).unwrap();
        assert!(handle.next_batch(10).is_empty());
        let mut handle = store.query(&[tag_filter("new")], 10).unwrap();
        assert_eq!(handle.next_batch(10).len(), 1);
    }

    #[test]
    fn test_addressable_scoped_by_d_tag() {
        let (store, _dir) = open_store();
        let sk = generate_secret_key();
        let make = |d: &str, created_at: i64| {
            let template = EventTemplate {
                kind: 30023,
                tags: vec![vec!["d".to_string(), d.to_string()]],
                content: "article".to_string(),
                created_at,
            };
            finalize_event(&template, &sk).unwrap()
        };

        assert_eq!(store.put_event(&make("a", 100)).unwrap(), PutOutcome::Stored);
        assert_eq!(store.put_event(&make("b", 100)).unwrap(), PutOutcome::Stored);
        assert_eq!(
            store.put_event(&make("a", 200)).unwrap(),
            PutOutcome::Replaced
        );
        assert_eq!(store.count(&[Filter::default()]).unwrap(), 2);
    }

    #[test]
    fn test_query_ordering_and_limit() {
        let (store, _dir) = open_store();
        let sk = generate_secret_key();
        for i in 0..5 {
            store
                .put_event(&event_with(&sk, 1, 1_700_000_000 + i, &format!("n{}", i)))
                .unwrap();
        }

        let mut handle = store.query(&[Filter::default()], 3).unwrap();
        let batch = handle.next_batch(10);
        assert_eq!(batch.len(), 3);
        assert!(batch[0].created_at >= batch[1].created_at);
        assert!(batch[1].created_at >= batch[2].created_at);
    }

    #[test]
    fn test_tag_filter_query() {
        let (store, _dir) = open_store();
        let sk = generate_secret_key();
        let template = EventTemplate {
            kind: 1,
            tags: vec![vec!["e".to_string(), "aa".repeat(32)]],
            content: "reply".to_string(),
            created_at: 1_700_000_000,
        };
        let tagged = finalize_event(&template, &sk).unwrap();
        store.put_event(&tagged).unwrap();
        store.put_event(&text_note("untagged")).unwrap();

        let mut tags = HashMap::new();
        tags.insert("#e".to_string(), vec!["aa".repeat(32)]);
        let filter = Filter {
            tags: Some(tags),
            ..Default::default()
        };
        let mut handle = store.query(&[filter], 10).unwrap();
        let batch = handle.next_batch(10);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, tagged.id);
    }

    #[test]
    fn test_search() {
        let (store, _dir) = open_store();
        store.put_event(&text_note("the quick brown fox")).unwrap();
        store.put_event(&text_note("lazy dog")).unwrap();

        let handle = store.search("brown", &Filter::default(), 10).unwrap();
        let mut handle = handle.unwrap();
        let batch = handle.next_batch(10);
        assert_eq!(batch.len(), 1);
        assert!(batch[0].content.contains("brown"));
    }

    #[test]
    fn test_delete_event() {
        let (store, _dir) = open_store();
        let event = text_note("doomed");
        store.put_event(&event).unwrap();
        assert!(store.delete_event(&event.id).unwrap());
        assert!(!store.delete_event(&event.id).unwrap());
        assert_eq!(store.count(&[Filter::default()]).unwrap(), 0);
    }

    #[test]
    fn test_notify_and_get_by_key() {
        let (store, _dir) = open_store();
        let seen = Arc::new(AtomicU64::new(0));
        let seen_clone = Arc::clone(&seen);
        store.notify_callback(Arc::new(move |key| {
            seen_clone.store(key, Ordering::SeqCst);
        }));

        let event = text_note("notified");
        store.put_event(&event).unwrap();

        let key = seen.load(Ordering::SeqCst);
        assert!(key > 0);
        let fetched = store.get_by_key(key).unwrap().unwrap();
        assert_eq!(fetched.id, event.id);
        assert!(store.get_by_key(key + 100).unwrap().is_none());
    }

    #[test]
    fn test_set_digest_reconciles_identical_sets() {
        let (store, _dir) = open_store();
        let event = text_note("shared");
        store.put_event(&event).unwrap();

        let state = store.set_digest(&Filter::default()).unwrap().unwrap();
        let bytes = hex::decode(&event.id).unwrap();
        let mut id = [0u8; 32];
        id.copy_from_slice(&bytes);
        let peer = ReconciliationState::new(vec![Record::new(
            event.created_at as u64,
            id,
        )]);
        // both sides hold the same single record
        assert_eq!(state.records(), peer.records());
    }
}
