//! Rolling conversation history for the efficient backend.
//!
//! The premium backend keeps history server-side; this window exists only
//! for the REST chain. Appends are strictly ordered and entries are never
//! mutated; trimming drops the oldest non-system messages.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

/// Maximum retained non-system messages.
pub const MAX_HISTORY: usize = 10;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// A tool call recorded on an assistant message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedToolCall {
    pub call_id: String,
    pub name: String,
    /// JSON-encoded arguments, exactly as the provider sent them.
    pub arguments: String,
}

/// One conversation message. Created during reasoning, never mutated
/// after append.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Tool calls issued by an assistant message.
    pub tool_calls: Vec<RecordedToolCall>,
    /// For tool messages: the call this result answers.
    pub tool_call_id: Option<String>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp,
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

/// Bounded message window: optional system message plus the last
/// [`MAX_HISTORY`] conversation messages.
#[derive(Debug, Default)]
pub struct MessageHistory {
    system: Option<Message>,
    messages: Vec<Message>,
}

impl MessageHistory {
    /// Create a history, optionally seeded with a system message.
    pub fn new(system: Option<&str>, now: DateTime<Utc>) -> Self {
        Self {
            system: system.map(|text| Message::new(Role::System, text, now)),
            messages: Vec::new(),
        }
    }

    /// Append a user message.
    pub fn push_user(&mut self, text: impl Into<String>, now: DateTime<Utc>) {
        self.messages.push(Message::new(Role::User, text, now));
        self.trim();
    }

    /// Append an assistant message with any tool calls it issued.
    pub fn push_assistant(
        &mut self,
        text: impl Into<String>,
        tool_calls: Vec<RecordedToolCall>,
        now: DateTime<Utc>,
    ) {
        let mut message = Message::new(Role::Assistant, text, now);
        message.tool_calls = tool_calls;
        self.messages.push(message);
        self.trim();
    }

    /// Append a tool result answering `call_id`.
    pub fn push_tool_result(
        &mut self,
        call_id: impl Into<String>,
        content: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        let mut message = Message::new(Role::Tool, content, now);
        message.tool_call_id = Some(call_id.into());
        self.messages.push(message);
        self.trim();
    }

    fn trim(&mut self) {
        while self.messages.len() > MAX_HISTORY {
            self.messages.remove(0);
        }
    }

    /// Non-system message count.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Total length including the system message.
    pub fn total_len(&self) -> usize {
        self.messages.len() + usize::from(self.system.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Drop every conversation message, keeping the system message.
    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Render the active context in chat-completions wire form.
    pub fn to_wire(&self) -> Vec<Value> {
        let mut wire = Vec::with_capacity(self.total_len());
        if let Some(system) = &self.system {
            wire.push(json!({ "role": "system", "content": system.content }));
        }
        for message in &self.messages {
            match message.role {
                Role::Assistant if !message.tool_calls.is_empty() => {
                    let calls: Vec<Value> = message
                        .tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.call_id,
                                "type": "function",
                                "function": {
                                    "name": call.name,
                                    "arguments": call.arguments,
                                }
                            })
                        })
                        .collect();
                    let mut entry = json!({
                        "role": "assistant",
                        "tool_calls": calls,
                    });
                    if !message.content.is_empty()
                        && let Some(obj) = entry.as_object_mut()
                    {
                        obj.insert("content".into(), json!(message.content));
                    }
                    wire.push(entry);
                }
                Role::Tool => {
                    wire.push(json!({
                        "role": "tool",
                        "tool_call_id": message.tool_call_id,
                        "content": message.content,
                    }));
                }
                role => {
                    wire.push(json!({ "role": role.as_str(), "content": message.content }));
                }
            }
        }
        wire
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn history_bounded_to_max_plus_system() {
        let mut history = MessageHistory::new(Some("be brief"), now());
        for i in 0..25 {
            history.push_user(format!("message {i}"), now());
        }
        assert_eq!(history.len(), MAX_HISTORY);
        assert_eq!(history.total_len(), MAX_HISTORY + 1);
    }

    #[test]
    fn oldest_dropped_first_system_survives() {
        let mut history = MessageHistory::new(Some("sys"), now());
        for i in 0..12 {
            history.push_user(format!("u{i}"), now());
        }
        let wire = history.to_wire();
        assert_eq!(wire[0]["role"], "system");
        // u0 and u1 fell off; the window starts at u2.
        assert_eq!(wire[1]["content"], "u2");
        assert_eq!(wire.last().unwrap()["content"], "u11");
    }

    #[test]
    fn appends_stay_in_order() {
        let mut history = MessageHistory::new(None, now());
        history.push_user("question", now());
        history.push_assistant("answer", Vec::new(), now());
        history.push_user("follow-up", now());

        let wire = history.to_wire();
        let roles: Vec<&str> = wire
            .iter()
            .filter_map(|m| m["role"].as_str())
            .collect();
        assert_eq!(roles, vec!["user", "assistant", "user"]);
    }

    #[test]
    fn assistant_tool_calls_render_on_the_wire() {
        let mut history = MessageHistory::new(None, now());
        history.push_user("read it", now());
        history.push_assistant(
            "",
            vec![RecordedToolCall {
                call_id: "call_1".into(),
                name: "read_file".into(),
                arguments: r#"{"path":"/tmp/x"}"#.into(),
            }],
            now(),
        );
        history.push_tool_result("call_1", r#"{"content":"hi"}"#, now());

        let wire = history.to_wire();
        assert_eq!(wire[1]["tool_calls"][0]["function"]["name"], "read_file");
        assert_eq!(wire[2]["role"], "tool");
        assert_eq!(wire[2]["tool_call_id"], "call_1");
    }

    #[test]
    fn clear_keeps_system_message() {
        let mut history = MessageHistory::new(Some("sys"), now());
        history.push_user("hello", now());
        history.clear();
        assert!(history.is_empty());
        assert_eq!(history.total_len(), 1);
        assert_eq!(history.to_wire()[0]["role"], "system");
    }

    #[test]
    fn without_system_message_total_equals_len() {
        let mut history = MessageHistory::new(None, now());
        history.push_user("x", now());
        assert_eq!(history.total_len(), history.len());
    }
}
