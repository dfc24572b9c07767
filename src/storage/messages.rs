use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use tokio::sync::watch;

use crate::api::models::{Message, MessagePatch};

struct Entry {
    message: Message,
    tombstoned: bool,
}

/// Messages of the single active conversation.
///
/// The message id is the only dedup key. Appends go to the tail in arrival
/// order; the store never re-sorts by timestamp, so two rapid sends can show
/// in the order the server delivered them rather than the order they were
/// created.
pub struct MessageStore {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
    published: watch::Sender<Arc<[Message]>>,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            published: watch::Sender::new(Arc::from(Vec::new())),
        }
    }

    fn publish(&self) {
        let visible: Vec<Message> = self.iter().cloned().collect();
        self.published.send_replace(Arc::from(visible));
    }

    fn reindex(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(pos, e)| (e.message.id.clone(), pos))
            .collect();
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.publish();
    }

    /// Apply a fetched page. `replace` swaps the whole sequence; otherwise the
    /// page is an older page and goes in front of what is loaded.
    pub fn load_page(&mut self, messages: Vec<Message>, replace: bool) {
        if replace {
            self.entries.clear();
            self.index.clear();
            for message in messages {
                self.push_entry(message);
            }
        } else {
            let mut older: Vec<Entry> = Vec::with_capacity(messages.len());
            for message in messages {
                let seen = self.index.contains_key(&message.id)
                    || older.iter().any(|e| e.message.id == message.id);
                if !seen {
                    older.push(Entry { message, tombstoned: false });
                }
            }
            older.append(&mut self.entries);
            self.entries = older;
            self.reindex();
        }
        self.publish();
    }

    fn push_entry(&mut self, message: Message) -> bool {
        if self.index.contains_key(&message.id) {
            return false;
        }
        self.index.insert(message.id.clone(), self.entries.len());
        self.entries.push(Entry { message, tombstoned: false });
        true
    }

    /// Append at the tail unless the id is already known. Tombstoned ids count
    /// as known, so a late echo cannot bring a deleted message back.
    pub fn append_if_new(&mut self, message: Message) -> bool {
        let id = message.id.clone();
        let inserted = self.push_entry(message);
        if inserted {
            self.publish();
        } else {
            debug!("message {id} already stored");
        }
        inserted
    }

    pub fn apply_update(&mut self, message_id: &str, patch: MessagePatch) -> bool {
        let Some(&pos) = self.index.get(message_id) else {
            return false;
        };
        let entry = &mut self.entries[pos];
        if entry.tombstoned {
            return false;
        }
        if let Some(status) = patch.status {
            entry.message.status = status;
        }
        if let Some(read_by) = patch.read_by {
            entry.message.read_by = read_by;
        }
        if let Some(delivered_to) = patch.delivered_to {
            entry.message.delivered_to = delivered_to;
        }
        self.publish();
        true
    }

    /// Hide a message; surviving entries keep their positions.
    pub fn tombstone(&mut self, message_id: &str) -> bool {
        let Some(&pos) = self.index.get(message_id) else {
            return false;
        };
        let entry = &mut self.entries[pos];
        if entry.tombstoned {
            return false;
        }
        entry.tombstoned = true;
        self.publish();
        true
    }

    pub fn get(&self, message_id: &str) -> Option<&Message> {
        let pos = *self.index.get(message_id)?;
        let entry = &self.entries[pos];
        (!entry.tombstoned).then_some(&entry.message)
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.get(message_id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().filter(|e| !e.tombstoned).map(|e| &e.message)
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.tombstoned).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cursor for fetching the page before the loaded history.
    pub fn oldest_id(&self) -> Option<&str> {
        self.entries.first().map(|e| e.message.id.as_str())
    }

    pub fn snapshot(&self) -> Arc<[Message]> {
        self.published.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<[Message]>> {
        self.published.subscribe()
    }
}
