//! Chat History Store (§4.K) — append-only per `(module, profile, session)`
//! message log.

use crate::error::{CoreError, Result};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const CHAT_HISTORY_TABLE: TableDefinition<&str, &str> = TableDefinition::new("chat_history");

/// Bound on the timestamp-collision retry loop (§9 Open Questions:
/// "define the retry bound (suggested: 3)" — adopted as-is, see DESIGN.md).
const TIMESTAMP_COLLISION_RETRY_LIMIT: u32 = 3;

pub const DEFAULT_SESSION_ID: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    pub arguments_json: String,
}

/// Tagged variant body (§9 "Chat-history typed messages"): persisted as a
/// JSON column plus a `message_type` discriminator, matching the teacher's
/// `ChatMessageRecord` JSON-blob-in-redb convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum MessageBody {
    Text { content: String },
    ToolCall { calls: Vec<ToolCall> },
    ToolResult { call_id: String, name: String, content: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub module_id: String,
    pub profile: String,
    pub session_id: String,
    pub role: Role,
    pub body: MessageBody,
    pub timestamp: u64,
}

fn history_key(module_id: &str, profile: &str, session_id: &str, timestamp: u64) -> String {
    // Zero-padded so string ordering matches numeric ordering.
    format!("{module_id}|{profile}|{session_id}|{timestamp:020}")
}

pub struct ChatHistoryStore {
    db: Arc<Database>,
}

impl ChatHistoryStore {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(CHAT_HISTORY_TABLE)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    /// Appends a message, retrying on timestamp collision with a monotonic
    /// 1µs bump up to [`TIMESTAMP_COLLISION_RETRY_LIMIT`] times (§4.K,
    /// §5 "timestamp-collision append (yes — bump and retry once)").
    ///
    /// Per §3 invariant, a `ToolResult` body's `call_id` must reference an
    /// earlier `ToolCall` message in the same session; this is checked
    /// before any write is attempted.
    pub fn add_message(
        &self,
        module_id: &str,
        profile: &str,
        session_id: &str,
        role: Role,
        body: MessageBody,
    ) -> Result<ChatMessage> {
        if let MessageBody::ToolResult { call_id, .. } = &body {
            self.require_preceding_tool_call(module_id, profile, session_id, call_id)?;
        }

        let mut timestamp = crate::util::now_ts_micros();
        let mut attempts = 0u32;
        loop {
            let key = history_key(module_id, profile, session_id, timestamp);
            let write_txn = self.db.begin_write()?;
            let collided = {
                let table = write_txn.open_table(CHAT_HISTORY_TABLE)?;
                table.get(key.as_str())?.is_some()
            };
            if collided && attempts < TIMESTAMP_COLLISION_RETRY_LIMIT {
                attempts += 1;
                timestamp += 1;
                continue;
            }
            if collided {
                return Err(CoreError::DbError(format!(
                    "timestamp collision persisted after {TIMESTAMP_COLLISION_RETRY_LIMIT} retries"
                )));
            }

            let message = ChatMessage {
                id: crate::util::generate_readable_uid("msg"),
                module_id: module_id.to_string(),
                profile: profile.to_string(),
                session_id: session_id.to_string(),
                role,
                body,
                timestamp,
            };
            {
                let mut table = write_txn.open_table(CHAT_HISTORY_TABLE)?;
                table.insert(key.as_str(), serde_json::to_string(&message)?.as_str())?;
            }
            write_txn.commit()?;
            return Ok(message);
        }
    }

    fn require_preceding_tool_call(
        &self,
        module_id: &str,
        profile: &str,
        session_id: &str,
        call_id: &str,
    ) -> Result<()> {
        let messages = self.get_messages(module_id, profile, session_id)?;
        let exists = messages.iter().any(|m| match &m.body {
            MessageBody::ToolCall { calls } => calls.iter().any(|c| c.id == call_id),
            _ => false,
        });
        if exists {
            Ok(())
        } else {
            Err(CoreError::MalformedKit(format!(
                "tool_result references unknown tool_call_id {call_id:?}"
            )))
        }
    }

    /// Returns the full history for `(module, profile, session)` in
    /// ascending timestamp (= insertion) order.
    pub fn get_messages(
        &self,
        module_id: &str,
        profile: &str,
        session_id: &str,
    ) -> Result<Vec<ChatMessage>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CHAT_HISTORY_TABLE)?;
        let prefix = format!("{module_id}|{profile}|{session_id}|");
        let mut out = Vec::new();
        for row in table.iter()? {
            let (key, value) = row?;
            if !key.value().starts_with(&prefix) {
                continue;
            }
            out.push(serde_json::from_str(value.value())?);
        }
        // redb's lexicographic key order already matches insertion order
        // (zero-padded timestamps), but sort defensively since messages
        // from other (module, profile, session) prefixes share the table.
        out.sort_by_key(|m: &ChatMessage| m.timestamp);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> ChatHistoryStore {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(redb::Database::create(dir.path().join("test.redb")).unwrap());
        std::mem::forget(dir);
        ChatHistoryStore::new(db).unwrap()
    }

    #[test]
    fn messages_come_back_in_insertion_order() {
        let store = test_store();
        for i in 0..5 {
            store
                .add_message(
                    "m1",
                    "p1",
                    DEFAULT_SESSION_ID,
                    Role::User,
                    MessageBody::Text { content: format!("msg {i}") },
                )
                .unwrap();
        }
        let messages = store.get_messages("m1", "p1", DEFAULT_SESSION_ID).unwrap();
        assert_eq!(messages.len(), 5);
        for w in messages.windows(2) {
            assert!(w[0].timestamp <= w[1].timestamp);
        }
    }

    #[test]
    fn tool_result_requires_preceding_tool_call() {
        let store = test_store();
        let err = store
            .add_message(
                "m1",
                "p1",
                DEFAULT_SESSION_ID,
                Role::Tool,
                MessageBody::ToolResult {
                    call_id: "missing".into(),
                    name: "square".into(),
                    content: "4".into(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::MalformedKit(_)));

        store
            .add_message(
                "m1",
                "p1",
                DEFAULT_SESSION_ID,
                Role::Assistant,
                MessageBody::ToolCall {
                    calls: vec![ToolCall {
                        id: "call-1".into(),
                        call_type: "function".into(),
                        function: ToolCallFunction {
                            name: "square".into(),
                            arguments_json: "{}".into(),
                        },
                    }],
                },
            )
            .unwrap();
        store
            .add_message(
                "m1",
                "p1",
                DEFAULT_SESSION_ID,
                Role::Tool,
                MessageBody::ToolResult {
                    call_id: "call-1".into(),
                    name: "square".into(),
                    content: "16".into(),
                },
            )
            .unwrap();
    }
}
