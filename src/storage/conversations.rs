use std::sync::Arc;

use log::debug;
use tokio::sync::watch;

use crate::api::models::{Conversation, ConversationPatch, LastMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewOutcome {
    Applied,
    /// The preview already points at this message; nothing was bumped again.
    AlreadyApplied,
    UnknownConversation,
}

/// Ordered conversation summaries keyed by id.
pub struct ConversationStore {
    items: Vec<Conversation>,
    published: watch::Sender<Arc<[Conversation]>>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            published: watch::Sender::new(Arc::from(Vec::new())),
        }
    }

    fn publish(&self) {
        self.published.send_replace(Arc::from(self.items.clone()));
    }

    fn position(&self, conversation_id: &str) -> Option<usize> {
        self.items.iter().position(|c| c.id == conversation_id)
    }

    /// Full refresh; the given order is kept as is.
    pub fn replace_all(&mut self, conversations: Vec<Conversation>) {
        let mut items: Vec<Conversation> = Vec::with_capacity(conversations.len());
        for mut conv in conversations {
            conv.normalize();
            if let Some(existing) = items.iter_mut().find(|c| c.id == conv.id) {
                *existing = conv;
            } else {
                items.push(conv);
            }
        }
        self.items = items;
        self.publish();
    }

    /// Insert a conversation at the front, or replace the stored record in place.
    pub fn upsert(&mut self, mut conversation: Conversation) {
        conversation.normalize();
        match self.position(&conversation.id) {
            Some(idx) => self.items[idx] = conversation,
            None => self.items.insert(0, conversation),
        }
        self.publish();
    }

    /// Record a new last message and bump unread for everyone but its sender.
    ///
    /// The conversation moves to the front of the collection.
    pub fn upsert_preview(
        &mut self,
        conversation_id: &str,
        preview: LastMessage,
    ) -> PreviewOutcome {
        let Some(idx) = self.position(conversation_id) else {
            return PreviewOutcome::UnknownConversation;
        };
        let conv = &mut self.items[idx];
        if conv
            .last_message
            .as_ref()
            .is_some_and(|last| last.message_id == preview.message_id)
        {
            debug!("preview {} already applied to {}", preview.message_id, conversation_id);
            return PreviewOutcome::AlreadyApplied;
        }
        for p in &mut conv.participants {
            if p.user_id != preview.sender_id {
                p.unread_count = p.unread_count.saturating_add(1);
            }
        }
        if preview.timestamp > conv.last_activity {
            conv.last_activity = preview.timestamp;
        }
        conv.total_messages += 1;
        conv.last_message = Some(preview);
        let conv = self.items.remove(idx);
        self.items.insert(0, conv);
        self.publish();
        PreviewOutcome::Applied
    }

    /// Merge only the fields the patch names. Returns false for an unknown id.
    pub fn apply_patch(&mut self, conversation_id: &str, patch: ConversationPatch) -> bool {
        let Some(idx) = self.position(conversation_id) else {
            return false;
        };
        let conv = &mut self.items[idx];
        if let Some(name) = patch.name {
            conv.name = Some(name);
        }
        if let Some(description) = patch.description {
            conv.description = Some(description);
        }
        if let Some(avatar) = patch.avatar_url {
            conv.avatar_url = Some(avatar);
        }
        if let Some(participants) = patch.participants {
            // Keep local counters for members that stay.
            let merged = participants
                .into_iter()
                .map(|mut incoming| {
                    if let Some(old) = conv.participant(&incoming.user_id) {
                        incoming.unread_count = old.unread_count;
                        incoming.last_read_at = incoming.last_read_at.or(old.last_read_at);
                    }
                    incoming
                })
                .collect();
            conv.participants = merged;
        }
        if let Some(admins) = patch.admin_ids {
            conv.admin_ids = admins;
        }
        if let Some(ts) = patch.last_activity {
            conv.last_activity = ts;
        }
        if patch.updated_at.is_some() {
            conv.updated_at = patch.updated_at;
        }
        if let Some(member) = patch.member {
            match conv.participant_mut(&member.user_id) {
                Some(p) => {
                    if let Some(n) = member.unread_count {
                        p.unread_count = n;
                    }
                    if let Some(m) = member.is_muted {
                        p.is_muted = m;
                    }
                    if let Some(a) = member.is_archived {
                        p.is_archived = a;
                    }
                    if member.last_read_at.is_some() {
                        p.last_read_at = member.last_read_at;
                    }
                }
                None => debug!("{} is not a member of {}", member.user_id, conversation_id),
            }
        }
        conv.normalize();
        self.publish();
        true
    }

    pub fn evict(&mut self, conversation_id: &str) -> Option<Conversation> {
        let idx = self.position(conversation_id)?;
        let removed = self.items.remove(idx);
        self.publish();
        Some(removed)
    }

    pub fn get(&self, conversation_id: &str) -> Option<&Conversation> {
        self.items.iter().find(|c| c.id == conversation_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Conversation> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn snapshot(&self) -> Arc<[Conversation]> {
        self.published.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<[Conversation]>> {
        self.published.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::{ConversationKind, MemberPatch, Participant};
    use chrono::{TimeZone, Utc};

    fn conv(id: &str, members: &[&str]) -> Conversation {
        Conversation {
            id: id.into(),
            kind: ConversationKind::Direct,
            name: None,
            description: None,
            avatar_url: None,
            participants: members.iter().map(|m| Participant::new(*m)).collect(),
            participant_ids: Vec::new(),
            admin_ids: Vec::new(),
            last_message: None,
            last_activity: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            total_messages: 0,
            created_at: None,
            updated_at: None,
        }
    }

    fn preview(id: &str, sender: &str, minute: u32) -> LastMessage {
        LastMessage {
            message_id: id.into(),
            text_preview: Some("hi".into()),
            sender_id: sender.into(),
            has_attachments: false,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 0, minute, 0).unwrap(),
        }
    }

    #[test]
    fn replace_all_keeps_order_and_syncs_ids() {
        let mut store = ConversationStore::new();
        store.replace_all(vec![conv("c2", &["a", "b"]), conv("c1", &["a", "c"])]);
        let ids: Vec<_> = store.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c2", "c1"]);
        assert_eq!(store.get("c1").unwrap().participant_ids, vec!["a", "c"]);
    }

    #[test]
    fn preview_bumps_everyone_but_sender_and_moves_to_front() {
        let mut store = ConversationStore::new();
        store.replace_all(vec![conv("c1", &["a", "b"]), conv("c2", &["a", "b"])]);
        let outcome = store.upsert_preview("c2", preview("m1", "b", 1));
        assert_eq!(outcome, PreviewOutcome::Applied);
        let c2 = store.get("c2").unwrap();
        assert_eq!(c2.unread_count("a"), 1);
        assert_eq!(c2.unread_count("b"), 0);
        assert_eq!(c2.total_messages, 1);
        assert_eq!(c2.last_activity, Utc.with_ymd_and_hms(2024, 1, 2, 0, 1, 0).unwrap());
        assert_eq!(store.iter().next().unwrap().id, "c2");
    }

    #[test]
    fn duplicate_preview_does_not_double_count() {
        let mut store = ConversationStore::new();
        store.replace_all(vec![conv("c1", &["a", "b"])]);
        store.upsert_preview("c1", preview("m1", "b", 1));
        assert_eq!(
            store.upsert_preview("c1", preview("m1", "b", 1)),
            PreviewOutcome::AlreadyApplied
        );
        assert_eq!(store.get("c1").unwrap().unread_count("a"), 1);
        store.upsert_preview("c1", preview("m2", "b", 2));
        assert_eq!(store.get("c1").unwrap().unread_count("a"), 2);
    }

    #[test]
    fn preview_for_unknown_conversation_is_reported() {
        let mut store = ConversationStore::new();
        assert_eq!(
            store.upsert_preview("nope", preview("m1", "b", 1)),
            PreviewOutcome::UnknownConversation
        );
    }

    #[test]
    fn patch_merges_named_fields_only() {
        let mut store = ConversationStore::new();
        let mut group = conv("g1", &["a", "b"]);
        group.kind = ConversationKind::Group;
        group.name = Some("old".into());
        group.description = Some("keep".into());
        group.admin_ids = vec!["a".into()];
        store.replace_all(vec![group]);
        store.upsert_preview("g1", preview("m1", "b", 1));

        let mut members = vec![Participant::new("a"), Participant::new("b"), Participant::new("c")];
        members[0].is_admin = true;
        let applied = store.apply_patch(
            "g1",
            ConversationPatch {
                name: Some("new".into()),
                participants: Some(members),
                ..ConversationPatch::default()
            },
        );
        assert!(applied);
        let g = store.get("g1").unwrap();
        assert_eq!(g.name.as_deref(), Some("new"));
        assert_eq!(g.description.as_deref(), Some("keep"));
        assert_eq!(g.participant_ids, vec!["a", "b", "c"]);
        assert_eq!(g.unread_count("a"), 1);
        assert!(g.is_admin("a"));
    }

    #[test]
    fn member_patch_sets_flags() {
        let mut store = ConversationStore::new();
        store.replace_all(vec![conv("c1", &["a", "b"])]);
        store.upsert_preview("c1", preview("m1", "b", 1));
        let mut member = MemberPatch::for_user("a");
        member.unread_count = Some(0);
        member.is_muted = Some(true);
        assert!(store.apply_patch("c1", ConversationPatch::member(member)));
        let c = store.get("c1").unwrap();
        assert_eq!(c.unread_count("a"), 0);
        assert!(c.is_muted("a"));
        assert!(!c.is_archived("a"));
        assert!(!store.apply_patch("missing", ConversationPatch::default()));
    }

    #[test]
    fn evict_removes_and_publishes() {
        let mut store = ConversationStore::new();
        let rx = store.subscribe();
        store.replace_all(vec![conv("c1", &["a", "b"]), conv("c2", &["a", "c"])]);
        assert_eq!(rx.borrow().len(), 2);
        assert!(store.evict("c1").is_some());
        assert!(store.evict("c1").is_none());
        assert_eq!(rx.borrow().len(), 1);
        assert_eq!(store.snapshot()[0].id, "c2");
    }
}
