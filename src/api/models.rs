use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Participant {
    pub user_id: String,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub is_muted: bool,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<DateTime<Utc>>,
}

impl Participant {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            unread_count: 0,
            is_muted: false,
            is_archived: false,
            is_admin: false,
            last_read_at: None,
            joined_at: None,
        }
    }
}

/// Denormalized summary of the newest message, kept for list rendering.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LastMessage {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_preview: Option<String>,
    pub sender_id: String,
    #[serde(default)]
    pub has_attachments: bool,
    pub timestamp: DateTime<Utc>,
}

impl LastMessage {
    pub fn from_message(message: &Message) -> Self {
        Self {
            message_id: message.id.clone(),
            text_preview: message.text_content.as_deref().map(preview_text),
            sender_id: message.sender_id.clone(),
            has_attachments: !message.attachments.is_empty(),
            timestamp: message.created_at,
        }
    }
}

const PREVIEW_CHARS: usize = 100;

fn preview_text(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Conversation {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    #[serde(rename = "conversation_type")]
    pub kind: ConversationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub participant_ids: Vec<String>,
    #[serde(default)]
    pub admin_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessage>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub total_messages: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Conversation {
    /// Restore the membership invariants after ingesting server data.
    ///
    /// `participant_ids` is rebuilt from `participants`, direct conversations
    /// lose any admin entries, and group admins not drawn from the member set
    /// are dropped. Shape violations the client cannot repair are logged.
    pub fn normalize(&mut self) {
        self.participant_ids = self.participants.iter().map(|p| p.user_id.clone()).collect();
        match self.kind {
            ConversationKind::Direct => {
                self.admin_ids.clear();
                for p in &mut self.participants {
                    p.is_admin = false;
                }
                if self.participants.len() != 2 {
                    warn!(
                        "direct conversation {} has {} participants",
                        self.id,
                        self.participants.len()
                    );
                }
            }
            ConversationKind::Group => {
                let ids = &self.participant_ids;
                self.admin_ids.retain(|a| ids.contains(a));
                if self.admin_ids.is_empty() {
                    warn!("group conversation {} has no admin", self.id);
                }
            }
        }
    }

    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn participant_mut(&mut self, user_id: &str) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.user_id == user_id)
    }

    pub fn has_member(&self, user_id: &str) -> bool {
        self.participant_ids.iter().any(|id| id == user_id)
    }

    pub fn is_group(&self) -> bool {
        self.kind == ConversationKind::Group
    }

    /// Group admin check used for UI gating only; the server decides.
    pub fn is_admin(&self, user_id: &str) -> bool {
        self.is_group()
            && (self.admin_ids.iter().any(|a| a == user_id)
                || self.participant(user_id).is_some_and(|p| p.is_admin))
    }

    pub fn is_muted(&self, user_id: &str) -> bool {
        self.participant(user_id).is_some_and(|p| p.is_muted)
    }

    pub fn is_archived(&self, user_id: &str) -> bool {
        self.participant(user_id).is_some_and(|p| p.is_archived)
    }

    pub fn unread_count(&self, user_id: &str) -> u32 {
        self.participant(user_id).map_or(0, |p| p.unread_count)
    }

    /// The counterpart in a direct conversation.
    pub fn other_participant(&self, self_id: &str) -> Option<&str> {
        self.participant_ids
            .iter()
            .find(|id| id.as_str() != self_id)
            .map(String::as_str)
    }

    /// Group name, or the other member's id for direct conversations.
    pub fn display_name(&self, self_id: &str) -> String {
        match self.kind {
            ConversationKind::Group => self
                .name
                .clone()
                .unwrap_or_else(|| "Unnamed Group".to_string()),
            ConversationKind::Direct => self
                .other_participant(self_id)
                .unwrap_or("Unknown")
                .to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Attachment {
    pub url: String,
    pub media_type: String,
    pub mime_type: String,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    #[default]
    Sent,
    Delivered,
    Read,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// May point at a message that is not loaded locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub status: DeliveryStatus,
    #[serde(default)]
    pub read_by: Vec<String>,
    #[serde(default)]
    pub delivered_to: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Status/read-state fields a message update may carry.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
pub struct MessagePatch {
    #[serde(default)]
    pub status: Option<DeliveryStatus>,
    #[serde(default)]
    pub read_by: Option<Vec<String>>,
    #[serde(default)]
    pub delivered_to: Option<Vec<String>>,
}

/// Per-member flags merged by a conversation patch.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MemberPatch {
    pub user_id: String,
    pub unread_count: Option<u32>,
    pub is_muted: Option<bool>,
    pub is_archived: Option<bool>,
    pub last_read_at: Option<DateTime<Utc>>,
}

impl MemberPatch {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }
}

/// Named fields to merge into a stored conversation; `None` leaves a field as is.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ConversationPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub avatar_url: Option<String>,
    pub participants: Option<Vec<Participant>>,
    pub admin_ids: Option<Vec<String>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub member: Option<MemberPatch>,
}

impl ConversationPatch {
    /// Metadata and membership taken from a server-returned conversation.
    /// Unread counters and the preview are left to the local record.
    pub fn from_server(conversation: &Conversation) -> Self {
        Self {
            name: conversation.name.clone(),
            description: conversation.description.clone(),
            avatar_url: conversation.avatar_url.clone(),
            participants: Some(conversation.participants.clone()),
            admin_ids: Some(conversation.admin_ids.clone()),
            last_activity: Some(conversation.last_activity),
            updated_at: conversation.updated_at,
            member: None,
        }
    }

    pub fn member(member: MemberPatch) -> Self {
        Self {
            member: Some(member),
            ..Self::default()
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConversationList {
    pub conversations: Vec<Conversation>,
    #[serde(default)]
    pub total: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub has_more: bool,
}

/// A file queued for a multipart send.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct OnlineUsers {
    #[serde(default)]
    pub online_users: Vec<String>,
    #[serde(default)]
    pub count: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct UserChatStats {
    #[serde(default)]
    pub total_conversations: u64,
    #[serde(default)]
    pub total_unread: u64,
    #[serde(default)]
    pub total_messages_sent: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct ConversationStats {
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub total_messages: u64,
    #[serde(default)]
    pub participant_count: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct AdminConversationDetails {
    pub conversation: Conversation,
    #[serde(default)]
    pub message_count: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}
