pub mod models;

use models::{Attachment, AttachmentKind, Conversation, Message, Sender};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Result, Row};

/// Local cache: conversations, messages, pending attachments and settings.
pub struct Database {
    pub conn: Mutex<Connection>,
}

impl Database {
    pub fn new(app_dir: &std::path::Path) -> Result<Self> {
        std::fs::create_dir_all(app_dir).ok();
        let db_path = app_dir.join("prompt-pilot.db");
        Self::from_connection(Connection::open(db_path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                question TEXT NOT NULL,
                answer TEXT NOT NULL,
                sender TEXT NOT NULL CHECK (sender IN ('USER', 'ASSISTANT')),
                timestamp INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                attachments TEXT NOT NULL DEFAULT '[]',
                model TEXT NOT NULL DEFAULT ''
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages (conversation_id, timestamp);

            CREATE TABLE IF NOT EXISTS pending_attachments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                name TEXT NOT NULL,
                url TEXT NOT NULL,
                type TEXT NOT NULL CHECK (type IN ('IMAGE', 'PDF'))
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // ── Conversations ──

    pub fn upsert_conversation(&self, conversation: &Conversation) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO conversations (id, title, created_at) VALUES (?1, ?2, ?3)",
            params![conversation.id, conversation.title, conversation.created_at],
        )?;
        Ok(())
    }

    pub fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, title, created_at FROM conversations ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Conversation {
                id: row.get(0)?,
                title: row.get(1)?,
                created_at: row.get(2)?,
            })
        })?;
        rows.collect()
    }

    /// Removes the conversation together with its messages.
    pub fn delete_conversation(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM messages WHERE conversation_id = ?1", params![id])?;
        tx.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        tx.commit()
    }

    // ── Messages ──

    pub fn upsert_message(&self, message: &Message) -> Result<()> {
        let attachments = serde_json::to_string(&message.attachments)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO messages
                (id, conversation_id, question, answer, sender, timestamp, created_at, attachments, model)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                message.id,
                message.conversation_id,
                message.question,
                message.answer,
                message.sender.as_str(),
                message.timestamp,
                message.created_at,
                attachments,
                message.model,
            ],
        )?;
        Ok(())
    }

    pub fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, question, answer, sender, timestamp, created_at, attachments, model
             FROM messages WHERE conversation_id = ?1 ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![conversation_id], message_from_row)?;
        rows.collect()
    }

    // ── Pending attachments ──

    pub fn insert_pending_attachment(
        &self,
        conversation_id: &str,
        attachment: &Attachment,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO pending_attachments (conversation_id, name, url, type) VALUES (?1, ?2, ?3, ?4)",
            params![
                conversation_id,
                attachment.name,
                attachment.url,
                attachment.kind.as_str()
            ],
        )?;
        Ok(())
    }

    pub fn get_pending_attachments(&self, conversation_id: &str) -> Result<Vec<Attachment>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name, url, type FROM pending_attachments WHERE conversation_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![conversation_id], |row| {
            let kind: String = row.get(2)?;
            Ok(Attachment {
                name: row.get(0)?,
                url: row.get(1)?,
                kind: AttachmentKind::parse(&kind),
            })
        })?;
        rows.collect()
    }

    /// Deletes one staged row matching `attachment`; returns whether a row was removed.
    pub fn delete_pending_attachment(
        &self,
        conversation_id: &str,
        attachment: &Attachment,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM pending_attachments WHERE id = (
                SELECT id FROM pending_attachments
                WHERE conversation_id = ?1 AND name = ?2 AND url = ?3
                ORDER BY id ASC LIMIT 1
            )",
            params![conversation_id, attachment.name, attachment.url],
        )?;
        Ok(removed > 0)
    }

    pub fn clear_pending_attachments(&self, conversation_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM pending_attachments WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        Ok(())
    }

    // ── Settings ──

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        );
        match result {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }
}

fn message_from_row(row: &Row<'_>) -> Result<Message> {
    let sender: String = row.get(4)?;
    let attachments: String = row.get(7)?;
    let attachments = serde_json::from_str(&attachments).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        question: row.get(2)?,
        answer: row.get(3)?,
        sender: Sender::parse(&sender),
        timestamp: row.get(5)?,
        created_at: row.get(6)?,
        attachments,
        model: row.get(8)?,
    })
}
