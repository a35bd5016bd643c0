use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::fs;
use std::path::{Path, PathBuf};

pub fn app_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| std::env::temp_dir());
    base.join("chapter_merge")
}

pub fn default_db_path() -> PathBuf {
    app_data_dir().join("chapters.db")
}

pub struct ProjectDb {
    conn: Connection,
    path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ChapterRow {
    pub id: String,
    pub title: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct MergeJobRow {
    pub id: String,
    pub chapter_id: String,
    pub kind: String,
    pub status: String,
    pub retry_count: i64,
    pub json: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Borrowed view of a merge job written by the orchestrator.
pub struct MergeJobUpsert<'a> {
    pub id: &'a str,
    pub chapter_id: &'a str,
    pub kind: &'a str,
    pub status: &'a str,
    pub retry_count: i64,
    pub json: &'a str,
}

impl ProjectDb {
    pub fn open_or_create(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", &"WAL")?;
        conn.pragma_update(None, "synchronous", &"NORMAL")?;
        conn.pragma_update(None, "foreign_keys", &"ON")?;
        let _ = conn.pragma_update(None, "cache_size", &"-20000"); // ~20MB page cache
        apply_migrations(&conn)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn begin_tx(&self) -> Result<Transaction<'_>> {
        Ok(self.conn.unchecked_transaction()?)
    }

    pub fn upsert_chapter(&self, id: &str, title: &str, json: &str) -> Result<()> {
        let now = now_millis();
        self.conn.execute(
            "INSERT INTO chapters(id, title, json, created_at, updated_at) VALUES(?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(id) DO UPDATE SET title = excluded.title, json = excluded.json, updated_at = excluded.updated_at",
            params![id, title, json, now],
        )?;
        Ok(())
    }

    pub fn get_chapter_json(&self, id: &str) -> Result<Option<String>> {
        let json = self
            .conn
            .query_row(
                "SELECT json FROM chapters WHERE id = ?1 LIMIT 1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(json)
    }

    pub fn list_chapters(&self) -> Result<Vec<ChapterRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, created_at, updated_at FROM chapters ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ChapterRow {
                id: row.get(0)?,
                title: row.get(1)?,
                created_at: row.get(2)?,
                updated_at: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Deletes a chapter together with its merge job history.
    pub fn delete_chapter(&self, id: &str) -> Result<bool> {
        let tx = self.begin_tx()?;
        tx.execute("DELETE FROM merge_jobs WHERE chapter_id = ?1", params![id])?;
        let removed = tx.execute("DELETE FROM chapters WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    pub fn upsert_merge_job(&self, job: &MergeJobUpsert<'_>) -> Result<()> {
        let now = now_millis();
        self.conn.execute(
            "INSERT INTO merge_jobs(id, chapter_id, kind, status, retry_count, json, created_at, updated_at) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status, retry_count = excluded.retry_count, json = excluded.json, updated_at = excluded.updated_at",
            params![
                job.id,
                job.chapter_id,
                job.kind,
                job.status,
                job.retry_count,
                job.json,
                now
            ],
        )?;
        Ok(())
    }

    pub fn get_merge_job(&self, id: &str) -> Result<Option<MergeJobRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, chapter_id, kind, status, retry_count, json, created_at, updated_at FROM merge_jobs WHERE id = ?1 LIMIT 1",
                params![id],
                merge_job_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Every attempt recorded for a chapter, newest first.
    pub fn list_merge_jobs_for_chapter(&self, chapter_id: &str) -> Result<Vec<MergeJobRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, chapter_id, kind, status, retry_count, json, created_at, updated_at FROM merge_jobs WHERE chapter_id = ?1 ORDER BY created_at DESC, rowid DESC",
        )?;
        let rows = stmt.query_map(params![chapter_id], merge_job_from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn list_merge_jobs_by_status(&self, statuses: &[&str]) -> Result<Vec<MergeJobRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, chapter_id, kind, status, retry_count, json, created_at, updated_at FROM merge_jobs WHERE status = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let mut out = Vec::new();
        for status in statuses {
            let rows = stmt.query_map(params![status], merge_job_from_row)?;
            for r in rows {
                out.push(r?);
            }
        }
        out.sort_by_key(|row| row.created_at);
        Ok(out)
    }

    pub fn delete_merge_job(&self, id: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM merge_jobs WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }
}

fn merge_job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MergeJobRow> {
    Ok(MergeJobRow {
        id: row.get(0)?,
        chapter_id: row.get(1)?,
        kind: row.get(2)?,
        status: row.get(3)?,
        retry_count: row.get(4)?,
        json: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn apply_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(include_str!("../migrations/V0001__init.sql"))?;
    conn.execute(
        "INSERT OR IGNORE INTO migrations(name, applied_at) VALUES(?1, strftime('%s','now'))",
        params!["V0001__init"],
    )?;
    conn.execute_batch(include_str!("../migrations/V0002__merge_jobs.sql"))?;
    conn.execute(
        "INSERT OR IGNORE INTO migrations(name, applied_at) VALUES(?1, strftime('%s','now'))",
        params!["V0002__merge_jobs"],
    )?;
    Ok(())
}
