//! Session Store (SPEC_FULL.md §6.3) — the durable home for a `ChatSession`.
//! One SQLite database per session directory, `PRAGMA journal_mode=WAL`, and
//! a `Save` that replaces the message rows inside a single transaction so a
//! crash mid-write leaves the previously-committed session intact rather
//! than a half-written one.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use wardloop_core::{ChatMessage, ChatRole, ChatSession};

const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    "CREATE TABLE IF NOT EXISTS sessions (
        session_id TEXT PRIMARY KEY,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS session_messages (
        session_id TEXT NOT NULL,
        ord INTEGER NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        PRIMARY KEY (session_id, ord)
    );",
)];

pub trait SessionStore {
    fn load_or_create(&self, session_id: &str, system_prompt: Option<&str>) -> Result<ChatSession>;
    fn save(&self, session: &ChatSession) -> Result<()>;
    fn reset(&self, session_id: &str, system_prompt: Option<&str>) -> Result<ChatSession>;
}

pub struct SqliteSessionStore {
    db_path: PathBuf,
}

impl SqliteSessionStore {
    /// `session_dir` is the directory dedicated to one session; the database
    /// file lives directly inside it so multiple concurrent sessions never
    /// share a database.
    pub fn new(session_dir: &Path) -> Result<Self> {
        fs::create_dir_all(session_dir)
            .with_context(|| format!("creating session dir {}", session_dir.display()))?;
        let db_path = session_dir.join("agent_sessions.db");
        let store = Self { db_path };
        store.init_db()?;
        Ok(store)
    }

    fn conn(&self) -> Result<Connection> {
        Ok(Connection::open(&self.db_path)?)
    }

    fn init_db(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        for (_version, sql) in MIGRATIONS {
            conn.execute_batch(sql)?;
        }
        Ok(())
    }

    fn row_to_session(conn: &Connection, session_id: &str) -> Result<Option<ChatSession>> {
        let header: Option<(String, String)> = conn
            .query_row(
                "SELECT created_at, updated_at FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((created_at, updated_at)) = header else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT role, content FROM session_messages WHERE session_id = ?1 ORDER BY ord ASC",
        )?;
        let messages = stmt
            .query_map(params![session_id], |row| {
                let role: String = row.get(0)?;
                let content: String = row.get(1)?;
                Ok((role, content))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(role, content)| ChatMessage { role: parse_role(&role), content })
            .collect();

        Ok(Some(ChatSession {
            id: session_id.to_string(),
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
            messages,
        }))
    }

    fn insert_new(&self, conn: &Connection, session: &ChatSession) -> Result<()> {
        conn.execute(
            "INSERT INTO sessions (session_id, created_at, updated_at) VALUES (?1, ?2, ?3)",
            params![session.id, session.created_at.to_rfc3339(), session.updated_at.to_rfc3339()],
        )?;
        Self::write_messages(conn, session)?;
        Ok(())
    }

    fn write_messages(conn: &Connection, session: &ChatSession) -> Result<()> {
        conn.execute(
            "DELETE FROM session_messages WHERE session_id = ?1",
            params![session.id],
        )?;
        for (ord, message) in session.messages.iter().enumerate() {
            conn.execute(
                "INSERT INTO session_messages (session_id, ord, role, content) VALUES (?1, ?2, ?3, ?4)",
                params![session.id, ord as i64, role_str(message.role), message.content],
            )?;
        }
        Ok(())
    }
}

impl SessionStore for SqliteSessionStore {
    fn load_or_create(&self, session_id: &str, system_prompt: Option<&str>) -> Result<ChatSession> {
        let conn = self.conn()?;
        if let Some(existing) = Self::row_to_session(&conn, session_id)? {
            return Ok(existing);
        }
        let fresh = ChatSession::new(session_id, system_prompt);
        self.insert_new(&conn, &fresh)?;
        Ok(fresh)
    }

    fn save(&self, session: &ChatSession) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO sessions (session_id, created_at, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(session_id) DO UPDATE SET updated_at = excluded.updated_at",
            params![session.id, session.created_at.to_rfc3339(), Utc::now().to_rfc3339()],
        )?;
        Self::write_messages(&tx, session)?;
        tx.commit()?;
        Ok(())
    }

    fn reset(&self, session_id: &str, system_prompt: Option<&str>) -> Result<ChatSession> {
        let fresh = ChatSession::new(session_id, system_prompt);
        let conn = self.conn()?;
        conn.execute("DELETE FROM session_messages WHERE session_id = ?1", params![session_id])?;
        conn.execute("DELETE FROM sessions WHERE session_id = ?1", params![session_id])?;
        self.insert_new(&conn, &fresh)?;
        Ok(fresh)
    }
}

fn role_str(role: ChatRole) -> &'static str {
    match role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
    }
}

fn parse_role(role: &str) -> ChatRole {
    match role {
        "system" => ChatRole::System,
        "assistant" => ChatRole::Assistant,
        _ => ChatRole::User,
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}
