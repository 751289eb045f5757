//! Ordered conversation history with projected views for the LLM.
//!
//! Grounded on `examples/original_source/memory/sequential.py`:
//! `SequentialMemory` keeps every entry in arrival order, `reset()`
//! preserves the system prompt, and `get_view` truncates everything but
//! the system entries to the most recent `max_entries`.

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<serde_json::Value>,
}

impl MemoryEntry {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn assistant_with_tool_calls(tool_calls: serde_json::Value) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            tool_call_id: None,
            tool_calls: Some(tool_calls),
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewType {
    /// Every entry, unfiltered.
    Full,
    /// System entries plus the most recent `max_entries` others — the
    /// shape handed to the LLM as `chat_messages`.
    ChatMessages,
}

/// Append-only, order-preserving conversation log.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Memory {
    system_prompt: Option<String>,
    entries: Vec<MemoryEntry>,
}

impl Memory {
    pub fn new(system_prompt: Option<String>) -> Self {
        let mut entries = Vec::new();
        if let Some(prompt) = &system_prompt {
            entries.push(MemoryEntry::system(prompt.clone()));
        }
        Self { system_prompt, entries }
    }

    pub fn add(&mut self, entry: MemoryEntry) {
        self.entries.push(entry);
    }

    pub fn add_many(&mut self, entries: impl IntoIterator<Item = MemoryEntry>) {
        self.entries.extend(entries);
    }

    /// Drops the last entry. Used by the control loop to roll back the
    /// assistant turn that triggered a permission denial before retrying.
    pub fn pop(&mut self) -> Option<MemoryEntry> {
        self.entries.pop()
    }

    pub fn last(&self) -> Option<&MemoryEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Restores the memory to just its system prompt, discarding history.
    pub fn reset(&mut self) {
        self.entries.clear();
        if let Some(prompt) = &self.system_prompt {
            self.entries.push(MemoryEntry::system(prompt.clone()));
        }
    }

    pub fn get_view(&self, view: ViewType, max_entries: usize) -> Vec<&MemoryEntry> {
        match view {
            ViewType::Full => self.entries.iter().collect(),
            ViewType::ChatMessages => {
                let (system, rest): (Vec<&MemoryEntry>, Vec<&MemoryEntry>) =
                    self.entries.iter().partition(|e| e.role == Role::System);
                let truncated = if rest.len() > max_entries {
                    rest[rest.len() - max_entries..].to_vec()
                } else {
                    rest
                };
                system.into_iter().chain(truncated).collect()
            }
        }
    }

    pub fn export(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn load(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_preserves_system_prompt_only() {
        let mut memory = Memory::new(Some("be helpful".to_string()));
        memory.add(MemoryEntry::user("hi"));
        memory.add(MemoryEntry::assistant("hello"));
        memory.reset();
        assert_eq!(memory.len(), 1);
        assert_eq!(memory.last().unwrap().role, Role::System);
    }

    #[test]
    fn chat_messages_view_truncates_but_keeps_system_entries() {
        let mut memory = Memory::new(Some("sys".to_string()));
        for i in 0..10 {
            memory.add(MemoryEntry::user(format!("msg {i}")));
        }
        let view = memory.get_view(ViewType::ChatMessages, 3);
        assert_eq!(view.len(), 4); // 1 system + 3 most recent
        assert_eq!(view[0].role, Role::System);
        assert_eq!(view[1].content, "msg 7");
        assert_eq!(view[3].content, "msg 9");
    }

    #[test]
    fn pop_removes_the_most_recently_added_entry() {
        let mut memory = Memory::new(None);
        memory.add(MemoryEntry::user("a"));
        memory.add(MemoryEntry::assistant("b"));
        let popped = memory.pop().unwrap();
        assert_eq!(popped.content, "b");
        assert_eq!(memory.len(), 1);
    }

    #[test]
    fn export_then_load_round_trips() {
        let mut memory = Memory::new(Some("sys".to_string()));
        memory.add(MemoryEntry::user("hi"));
        let json = memory.export().unwrap();
        let loaded = Memory::load(&json).unwrap();
        assert_eq!(loaded.len(), memory.len());
    }
}
