//! Session-scoped shared key/value store with bounded history.
//!
//! Tools and subscribers use the blackboard to share small facts between
//! turns. Entries are persisted as they are posted but are not rehydrated on
//! resume; a resumed session starts with an empty board.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::bus::{BusMessage, EventType, MessageBus};

const DEFAULT_MAX_HISTORY: usize = 1_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub value: String,
    pub posted_by: String,
    pub time: DateTime<Utc>,
}

struct State {
    live: HashMap<String, Entry>,
    history: Vec<Entry>,
}

pub struct Blackboard {
    state: Mutex<State>,
    bus: MessageBus,
    max_history: usize,
}

impl Blackboard {
    pub fn new(bus: MessageBus) -> Self {
        Self::with_capacity(bus, DEFAULT_MAX_HISTORY)
    }

    pub fn with_capacity(bus: MessageBus, max_history: usize) -> Self {
        Self {
            state: Mutex::new(State {
                live: HashMap::new(),
                history: Vec::new(),
            }),
            bus,
            max_history: max_history.max(1),
        }
    }

    pub fn post(&self, key: &str, value: &str, posted_by: &str) {
        let entry = Entry {
            key: key.to_string(),
            value: value.to_string(),
            posted_by: posted_by.to_string(),
            time: Utc::now(),
        };
        {
            let mut state = self.state.lock().expect("blackboard lock poisoned");
            state.live.insert(key.to_string(), entry.clone());
            state.history.push(entry.clone());
            if state.history.len() > self.max_history {
                let excess = state.history.len() - self.max_history;
                state.history.drain(..excess);
            }
        }
        self.bus.publish(
            BusMessage::new(EventType::BlackboardUpdate)
                .with_payload(json!({ "key": key, "value": value, "posted_by": posted_by })),
        );
    }

    pub fn get(&self, key: &str) -> Option<Entry> {
        self.state
            .lock()
            .expect("blackboard lock poisoned")
            .live
            .get(key)
            .cloned()
    }

    pub fn all(&self) -> HashMap<String, Entry> {
        self.state
            .lock()
            .expect("blackboard lock poisoned")
            .live
            .clone()
    }

    pub fn history(&self) -> Vec<Entry> {
        self.state
            .lock()
            .expect("blackboard lock poisoned")
            .history
            .clone()
    }

    /// Reset both the live map and the history.
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("blackboard lock poisoned");
        state.live.clear();
        state.history = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_and_get() {
        let board = Blackboard::new(MessageBus::new(10));
        board.post("plan", "three phases", "queen");
        let entry = board.get("plan").unwrap();
        assert_eq!(entry.value, "three phases");
        assert_eq!(entry.posted_by, "queen");
    }

    #[test]
    fn history_is_bounded() {
        let board = Blackboard::with_capacity(MessageBus::new(10), 3);
        for i in 0..5 {
            board.post("k", &i.to_string(), "t");
        }
        let hist = board.history();
        assert_eq!(hist.len(), 3);
        assert_eq!(hist[0].value, "2");
        assert_eq!(hist[2].value, "4");
    }

    #[test]
    fn clear_resets_live_and_history() {
        let board = Blackboard::new(MessageBus::new(10));
        board.post("a", "1", "t");
        board.clear();
        assert!(board.get("a").is_none());
        assert!(board.history().is_empty());
    }

    #[test]
    fn post_publishes_update_event() {
        let bus = MessageBus::new(10);
        let board = Blackboard::new(bus.clone());
        board.post("k", "v", "worker-1");
        let events = bus.history(0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::BlackboardUpdate);
        assert_eq!(events[0].payload["key"], "k");
    }
}
