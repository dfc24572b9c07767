use std::collections::HashSet;

/// Ephemeral online/typing sets, fed only by push events.
///
/// Last processed event wins per user. Entries never expire here.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    online: HashSet<String>,
    typing: HashSet<String>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_online(&mut self, user_id: &str) {
        self.online.insert(user_id.to_string());
    }

    pub fn mark_offline(&mut self, user_id: &str) {
        self.online.remove(user_id);
    }

    pub fn mark_typing(&mut self, user_id: &str) {
        self.typing.insert(user_id.to_string());
    }

    pub fn mark_not_typing(&mut self, user_id: &str) {
        self.typing.remove(user_id);
    }

    pub fn set_online(&mut self, user_id: &str, online: bool) {
        if online { self.mark_online(user_id) } else { self.mark_offline(user_id) }
    }

    pub fn set_typing(&mut self, user_id: &str, typing: bool) {
        if typing { self.mark_typing(user_id) } else { self.mark_not_typing(user_id) }
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.contains(user_id)
    }

    pub fn is_typing(&self, user_id: &str) -> bool {
        self.typing.contains(user_id)
    }

    pub fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.online.iter().cloned().collect();
        users.sort();
        users
    }

    pub fn typing_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.typing.iter().cloned().collect();
        users.sort();
        users
    }

    pub fn clear(&mut self) {
        self.online.clear();
        self.typing.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marks_are_idempotent() {
        let mut p = PresenceTracker::new();
        p.mark_online("a");
        p.mark_online("a");
        assert_eq!(p.online_users(), vec!["a"]);
        p.mark_offline("a");
        p.mark_offline("a");
        assert!(!p.is_online("a"));
    }

    #[test]
    fn most_recent_event_wins() {
        let mut p = PresenceTracker::new();
        p.set_typing("b", true);
        p.set_typing("b", false);
        p.set_typing("b", true);
        assert!(p.is_typing("b"));
        p.set_online("b", true);
        p.set_online("b", false);
        assert!(!p.is_online("b"));
    }

    #[test]
    fn online_and_typing_are_independent() {
        let mut p = PresenceTracker::new();
        p.mark_typing("c");
        assert!(p.is_typing("c"));
        assert!(!p.is_online("c"));
        p.clear();
        assert!(p.typing_users().is_empty());
    }
}
