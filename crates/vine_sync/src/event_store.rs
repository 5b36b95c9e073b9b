/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info};
use vine_protocol::{Event, Filter};

/// Durable, deduplicated event storage backed by SQLite in WAL mode.
///
/// Writers are serialized through `writer`; every query opens its own
/// connection so readers never wait on each other or on a writer.
#[derive(Clone)]
pub struct EventStore {
    path: PathBuf,
    writer: Arc<TokioMutex<()>>,
}

impl EventStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create data dir: {}", parent.display()))?;
        }
        let conn = open_conn(&path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS events (
              id TEXT PRIMARY KEY,
              pubkey TEXT NOT NULL,
              created_at INTEGER NOT NULL,
              kind INTEGER NOT NULL,
              event_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_created ON events(created_at DESC, id);
            CREATE INDEX IF NOT EXISTS idx_events_pubkey ON events(pubkey, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind, created_at DESC);

            CREATE TABLE IF NOT EXISTS event_tags (
              event_id TEXT NOT NULL,
              name TEXT NOT NULL,
              value TEXT NOT NULL,
              PRIMARY KEY(event_id, name, value)
            );
            CREATE INDEX IF NOT EXISTS idx_event_tags_value ON event_tags(name, value);

            CREATE TABLE IF NOT EXISTS local_meta (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );
            "#,
        )
        .with_context(|| format!("init event store: {}", path.display()))?;
        info!("event store: {}", path.display());
        Ok(Self {
            path,
            writer: Arc::new(TokioMutex::new(())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn health_check(&self) -> Result<()> {
        let conn = open_conn(&self.path)?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    /// Insert-or-ignore; returns how many events were new.
    pub async fn store(&self, events: Vec<Event>) -> Result<usize> {
        Ok(self.store_new(events).await?.len())
    }

    /// Insert-or-ignore; returns the events that were not stored before, in input order.
    /// Duplicates inside one batch are inserted once.
    pub async fn store_new(&self, events: Vec<Event>) -> Result<Vec<Event>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let _guard = self.writer.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Event>> {
            let mut conn = open_conn(&path)?;
            let tx = conn.transaction()?;
            let mut inserted = Vec::new();
            for ev in events {
                let json = serde_json::to_string(&ev)?;
                let n = tx.execute(
                    "INSERT OR IGNORE INTO events(id, pubkey, created_at, kind, event_json) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![ev.id, ev.pubkey, sql_secs(ev.created_at), ev.kind as i64, json],
                )?;
                if n == 0 {
                    continue;
                }
                for tag in ev.tags.iter().filter(|t| t.len() >= 2) {
                    tx.execute(
                        "INSERT OR IGNORE INTO event_tags(event_id, name, value) VALUES (?1, ?2, ?3)",
                        params![ev.id, tag[0], tag[1]],
                    )?;
                }
                inserted.push(ev);
            }
            tx.commit()?;
            Ok(inserted)
        })
        .await
        .context("store task")?
        .context("store events")
    }

    /// Union of every filter's matches, newest first with ties broken by id;
    /// each filter's `limit` applies to its own sorted matches.
    pub async fn query(&self, filters: Vec<Filter>) -> Result<Vec<Event>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Event>> {
            let conn = open_conn(&path)?;
            let mut seen = HashSet::new();
            let mut out = Vec::new();
            for f in &filters {
                for ev in query_one(&conn, f)? {
                    if seen.insert(ev.id.clone()) {
                        out.push(ev);
                    }
                }
            }
            sort_events(&mut out);
            Ok(out)
        })
        .await
        .context("query task")?
        .context("query events")
    }

    pub async fn count(&self) -> Result<u64> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<u64> {
            let conn = open_conn(&path)?;
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?;
            Ok(n as u64)
        })
        .await
        .context("count task")?
    }

    /// Keeps the newest `max_events` events; returns how many were removed.
    pub async fn prune_to_max(&self, max_events: u64) -> Result<u64> {
        let _guard = self.writer.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<u64> {
            let mut conn = open_conn(&path)?;
            let tx = conn.transaction()?;
            let removed = tx.execute(
                r#"
                DELETE FROM events WHERE id IN (
                  SELECT id FROM events ORDER BY created_at DESC, id ASC LIMIT -1 OFFSET ?1
                )
                "#,
                params![max_events as i64],
            )?;
            if removed > 0 {
                tx.execute(
                    "DELETE FROM event_tags WHERE event_id NOT IN (SELECT id FROM events)",
                    [],
                )?;
            }
            tx.commit()?;
            if removed > 0 {
                debug!(removed, max_events, "pruned event store");
            }
            Ok(removed as u64)
        })
        .await
        .context("prune task")?
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = open_conn(&self.path)?;
        conn.query_row(
            "SELECT value FROM local_meta WHERE key=?1",
            params![key],
            |r| r.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let conn = open_conn(&self.path)?;
        conn.execute(
            "INSERT OR REPLACE INTO local_meta(key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }
}

/// Newest first, ties broken by ascending id.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
}

fn open_conn(path: &Path) -> Result<Connection> {
    let conn =
        Connection::open(path).with_context(|| format!("open db: {}", path.display()))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}

fn query_one(conn: &Connection, f: &Filter) -> Result<Vec<Event>> {
    if f.limit == Some(0) {
        return Ok(Vec::new());
    }
    let mut clauses: Vec<String> = Vec::new();
    let mut args: Vec<SqlValue> = Vec::new();

    if let Some(ids) = &f.ids {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        clauses.push(format!("id IN ({})", placeholders(ids.len())));
        args.extend(ids.iter().cloned().map(SqlValue::Text));
    }
    if let Some(authors) = &f.authors {
        if authors.is_empty() {
            return Ok(Vec::new());
        }
        clauses.push(format!("pubkey IN ({})", placeholders(authors.len())));
        args.extend(authors.iter().cloned().map(SqlValue::Text));
    }
    if let Some(kinds) = &f.kinds {
        if kinds.is_empty() {
            return Ok(Vec::new());
        }
        clauses.push(format!("kind IN ({})", placeholders(kinds.len())));
        args.extend(kinds.iter().map(|k| SqlValue::Integer(*k as i64)));
    }
    if let Some(since) = f.since {
        clauses.push("created_at >= ?".to_string());
        args.push(SqlValue::Integer(sql_secs(since)));
    }
    if let Some(until) = f.until {
        clauses.push("created_at <= ?".to_string());
        args.push(SqlValue::Integer(sql_secs(until)));
    }
    for (name, values) in f.tag_filters() {
        if values.is_empty() {
            return Ok(Vec::new());
        }
        clauses.push(format!(
            "EXISTS (SELECT 1 FROM event_tags t WHERE t.event_id = events.id AND t.name = ? AND t.value IN ({}))",
            placeholders(values.len())
        ));
        args.push(SqlValue::Text(name.to_string()));
        args.extend(values.iter().cloned().map(SqlValue::Text));
    }

    let mut sql = "SELECT event_json FROM events".to_string();
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY created_at DESC, id ASC");
    if let Some(limit) = f.limit {
        sql.push_str(" LIMIT ?");
        args.push(SqlValue::Integer(limit.min(i64::MAX as usize) as i64));
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(args), |r| r.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        let json = row?;
        match serde_json::from_str::<Event>(&json) {
            Ok(ev) => out.push(ev),
            Err(e) => debug!("skipping undecodable stored event: {e}"),
        }
    }
    Ok(out)
}

/// SQLite integers are signed; larger timestamps saturate instead of wrapping.
fn sql_secs(secs: u64) -> i64 {
    secs.min(i64::MAX as u64) as i64
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}
