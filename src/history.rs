//! Conversation persistence in the host database.
//!
//! Two tables: `ai_chat_history` holds one row per conversation and
//! `ai_chat_messages` holds the ordered turns. Saves run in a transaction,
//! so a conversation is either fully persisted or absent.
use rusqlite::{Connection, params};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::conversation::{Message, Role};
use crate::error::Result;

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS ai_chat_history (
    id TEXT PRIMARY KEY,
    title TEXT,
    meta TEXT,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS ai_chat_messages (
    history_id TEXT NOT NULL REFERENCES ai_chat_history(id),
    seq INTEGER NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    PRIMARY KEY (history_id, seq)
);
CREATE INDEX IF NOT EXISTS ai_chat_messages_by_history
    ON ai_chat_messages(history_id);
";

/// Create the history tables when they do not exist yet. Safe to call on
/// every connection open.
pub fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Summary row for listing saved conversations. Identifiers are
/// time-ordered, so sorting by id is sorting by creation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedConversation {
    pub id: Uuid,
    pub title: Option<String>,
    pub created_at: String,
}

/// Persist a conversation, replacing any earlier save under the same id.
/// Returns `Ok(None)` when the conversation has no messages; an empty
/// conversation is not worth a row.
pub fn save(
    conn: &mut Connection,
    convo: &crate::conversation::Conversation,
    title: Option<&str>,
    meta: Option<&serde_json::Value>,
) -> Result<Option<Uuid>> {
    let messages = convo.messages();
    if messages.is_empty() {
        return Ok(None);
    }
    let id = convo.id();
    let id_text = id.to_string();
    let created_at = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(|e| crate::error::EngineError::runtime(format!("timestamp format: {e}")))?;
    let meta_text = meta.map(serde_json::Value::to_string);

    let tx = conn.transaction()?;
    tx.execute(
        "DELETE FROM ai_chat_messages WHERE history_id = ?1",
        params![id_text],
    )?;
    tx.execute("DELETE FROM ai_chat_history WHERE id = ?1", params![id_text])?;
    tx.execute(
        "INSERT INTO ai_chat_history (id, title, meta, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![id_text, title, meta_text, created_at],
    )?;
    {
        let mut insert = tx.prepare(
            "INSERT INTO ai_chat_messages (history_id, seq, role, content)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (seq, message) in messages.iter().enumerate() {
            insert.execute(params![
                id_text,
                seq as i64 + 1,
                message.role.as_str(),
                message.content
            ])?;
        }
    }
    tx.commit()?;
    tracing::debug!(conversation = %id, messages = messages.len(), "conversation saved");
    Ok(Some(id))
}

/// Load the messages of a saved conversation in turn order. An unknown id
/// yields an empty list, not an error.
pub fn load(conn: &Connection, id: &Uuid) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(
        "SELECT role, content FROM ai_chat_messages WHERE history_id = ?1 ORDER BY seq",
    )?;
    let rows = stmt.query_map(params![id.to_string()], |row| {
        let role: String = row.get(0)?;
        let content: String = row.get(1)?;
        Ok(Message {
            role: Role::from_name(&role),
            content,
        })
    })?;
    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    Ok(messages)
}

/// All saved conversations, oldest first.
pub fn list(conn: &Connection) -> Result<Vec<SavedConversation>> {
    let mut stmt = conn.prepare("SELECT id, title, created_at FROM ai_chat_history ORDER BY id")?;
    let rows = stmt.query_map([], |row| {
        let id: String = row.get(0)?;
        let title: Option<String> = row.get(1)?;
        let created_at: String = row.get(2)?;
        Ok((id, title, created_at))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (id, title, created_at) = row?;
        let id = Uuid::parse_str(&id)
            .map_err(|e| crate::error::EngineError::runtime(format!("bad stored id: {e}")))?;
        out.push(SavedConversation {
            id,
            title,
            created_at,
        });
    }
    Ok(out)
}
