#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chat_sync::api::client::{ChatApi, MultipartSend};
use chat_sync::api::models::{
    AdminConversationDetails, Conversation, ConversationKind, ConversationStats, Message,
    MessagePage, OnlineUsers, Participant, UserChatStats,
};
use chat_sync::app::{AppState, Credentials};
use chat_sync::error::RequestError;
use chat_sync::session::{PushSession, SessionConfig};
use chat_sync::{EngineConfig, SyncEngine};
use chrono::{TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

pub const ME: &str = "alice";
pub const BOB: &str = "bob";

pub fn ts(minute: u32) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap()
}

pub fn direct(id: &str, other: &str) -> Conversation {
    Conversation {
        id: id.into(),
        kind: ConversationKind::Direct,
        name: None,
        description: None,
        avatar_url: None,
        participants: vec![Participant::new(ME), Participant::new(other)],
        participant_ids: vec![ME.into(), other.into()],
        admin_ids: Vec::new(),
        last_message: None,
        last_activity: ts(0),
        total_messages: 0,
        created_at: None,
        updated_at: None,
    }
}

pub fn group(id: &str, name: &str, members: &[&str], admins: &[&str]) -> Conversation {
    Conversation {
        id: id.into(),
        kind: ConversationKind::Group,
        name: Some(name.into()),
        description: None,
        avatar_url: None,
        participants: members.iter().map(|m| Participant::new(*m)).collect(),
        participant_ids: members.iter().map(|m| m.to_string()).collect(),
        admin_ids: admins.iter().map(|a| a.to_string()).collect(),
        last_message: None,
        last_activity: ts(0),
        total_messages: 0,
        created_at: None,
        updated_at: None,
    }
}

pub fn message(id: &str, conversation_id: &str, sender: &str, text: &str, minute: u32) -> Message {
    Message {
        id: id.into(),
        conversation_id: conversation_id.into(),
        sender_id: sender.into(),
        text_content: Some(text.into()),
        attachments: Vec::new(),
        reply_to: None,
        status: Default::default(),
        read_by: Vec::new(),
        delivered_to: Vec::new(),
        created_at: ts(minute),
    }
}

pub fn message_json(m: &Message) -> serde_json::Value {
    serde_json::to_value(m).unwrap()
}

#[derive(Default)]
pub struct FakeState {
    pub conversations: Vec<Conversation>,
    pub pages: HashMap<String, Vec<Message>>,
    pub has_more: bool,
    pub send_result: Option<Message>,
    pub membership_result: Option<Conversation>,
    pub fail_next: Option<String>,
    pub calls: Vec<String>,
    pub sent: Vec<MultipartSend>,
    pub mark_read: Vec<(String, Option<String>)>,
    pub fetches: Vec<(String, Option<String>)>,
    /// Holds `list_conversations` open this long before it answers.
    pub list_delay: Option<std::time::Duration>,
}

/// In-memory request/response API; every call is recorded by name.
#[derive(Clone, Default)]
pub struct FakeApi {
    pub state: Arc<Mutex<FakeState>>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F: FnOnce(&mut FakeState)>(&self, f: F) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn calls(&self, name: &str) -> usize {
        self.state.lock().unwrap().calls.iter().filter(|c| c.as_str() == name).count()
    }

    fn enter(&self, name: &str) -> Result<std::sync::MutexGuard<'_, FakeState>, RequestError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(name.to_string());
        let failure = state.fail_next.take();
        if let Some(reason) = failure {
            return Err(RequestError::Rejected(reason));
        }
        Ok(state)
    }

    fn membership(&self, name: &str, conversation_id: &str) -> Result<Conversation, RequestError> {
        let state = self.enter(name)?;
        state
            .membership_result
            .clone()
            .or_else(|| state.conversations.iter().find(|c| c.id == conversation_id).cloned())
            .ok_or_else(|| RequestError::Rejected("not found".into()))
    }
}

impl ChatApi for FakeApi {
    async fn list_conversations(
        &self,
        _archived: Option<bool>,
    ) -> Result<Vec<Conversation>, RequestError> {
        let (list, delay) = {
            let state = self.enter("list_conversations")?;
            (state.conversations.clone(), state.list_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(list)
    }

    async fn create_direct(&self, other_user_id: &str) -> Result<Conversation, RequestError> {
        self.enter("create_direct")?;
        Ok(direct(&format!("dm-{other_user_id}"), other_user_id))
    }

    async fn create_group(
        &self,
        participant_ids: &[String],
        name: &str,
        _description: Option<&str>,
    ) -> Result<Conversation, RequestError> {
        self.enter("create_group")?;
        let mut members: Vec<&str> = vec![ME];
        members.extend(participant_ids.iter().map(String::as_str));
        Ok(group("g-new", name, &members, &[ME]))
    }

    async fn update_group(
        &self,
        conversation_id: &str,
        _name: &str,
        _description: Option<&str>,
    ) -> Result<Conversation, RequestError> {
        self.membership("update_group", conversation_id)
    }

    async fn add_participant(
        &self,
        conversation_id: &str,
        _user_id: &str,
    ) -> Result<Conversation, RequestError> {
        self.membership("add_participant", conversation_id)
    }

    async fn remove_participant(
        &self,
        conversation_id: &str,
        _user_id: &str,
    ) -> Result<Conversation, RequestError> {
        self.membership("remove_participant", conversation_id)
    }

    async fn set_muted(&self, _conversation_id: &str, _muted: bool) -> Result<(), RequestError> {
        self.enter("set_muted").map(|_| ())
    }

    async fn set_archived(
        &self,
        _conversation_id: &str,
        _archived: bool,
    ) -> Result<(), RequestError> {
        self.enter("set_archived").map(|_| ())
    }

    async fn fetch_messages(
        &self,
        conversation_id: &str,
        _limit: u32,
        before: Option<&str>,
    ) -> Result<MessagePage, RequestError> {
        let mut state = self.enter("fetch_messages")?;
        state.fetches.push((conversation_id.to_string(), before.map(str::to_string)));
        let messages = state.pages.get(conversation_id).cloned().unwrap_or_default();
        Ok(MessagePage { total: messages.len() as u64, messages, has_more: state.has_more })
    }

    async fn send_message(&self, request: MultipartSend) -> Result<Message, RequestError> {
        let mut state = self.enter("send_message")?;
        state.sent.push(request);
        state
            .send_result
            .clone()
            .ok_or_else(|| RequestError::Malformed("no message".into()))
    }

    async fn delete_message(&self, _message_id: &str) -> Result<(), RequestError> {
        self.enter("delete_message").map(|_| ())
    }

    async fn mark_read(
        &self,
        conversation_id: &str,
        up_to_message_id: Option<&str>,
    ) -> Result<(), RequestError> {
        let mut state = self.enter("mark_read")?;
        state
            .mark_read
            .push((conversation_id.to_string(), up_to_message_id.map(str::to_string)));
        Ok(())
    }

    async fn online_users(&self) -> Result<OnlineUsers, RequestError> {
        self.enter("online_users")?;
        Ok(OnlineUsers { online_users: vec![BOB.into()], count: 1 })
    }

    async fn conversation_online_users(
        &self,
        _conversation_id: &str,
    ) -> Result<OnlineUsers, RequestError> {
        self.enter("conversation_online_users")?;
        Ok(OnlineUsers::default())
    }

    async fn user_stats(&self) -> Result<UserChatStats, RequestError> {
        self.enter("user_stats")?;
        Ok(UserChatStats { total_conversations: 2, ..UserChatStats::default() })
    }

    async fn conversation_stats(
        &self,
        conversation_id: &str,
    ) -> Result<ConversationStats, RequestError> {
        self.enter("conversation_stats")?;
        Ok(ConversationStats {
            conversation_id: conversation_id.into(),
            ..ConversationStats::default()
        })
    }

    async fn admin_conversation_details(
        &self,
        conversation_id: &str,
    ) -> Result<AdminConversationDetails, RequestError> {
        let conversation = self.membership("admin_conversation_details", conversation_id)?;
        Ok(AdminConversationDetails { conversation, message_count: 0, extra: Default::default() })
    }

    async fn admin_delete_conversation(&self, _conversation_id: &str) -> Result<(), RequestError> {
        self.enter("admin_delete_conversation").map(|_| ())
    }
}

pub fn credentials() -> Arc<dyn Credentials> {
    let mut state = AppState::new();
    state.token = Some("secret".into());
    state.user_id = Some(ME.into());
    Arc::new(state)
}

pub fn session(url: &str) -> PushSession {
    PushSession::new(SessionConfig {
        url: url.into(),
        device_type: "test".into(),
        device_id: "device-1".into(),
    })
}

/// Engine wired to a fake API and a push session that is never connected.
pub fn offline_engine(api: &FakeApi) -> SyncEngine<FakeApi> {
    let session = session("ws://127.0.0.1:1/ws");
    SyncEngine::new(api.clone(), session, credentials(), EngineConfig::default())
}

/// Server side of one accepted push connection.
pub struct ServerConn {
    pub uri: String,
    pub to_client: mpsc::UnboundedSender<WsMessage>,
    pub from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerConn {
    pub fn push(&self, event: &str, data: serde_json::Value) {
        let frame = serde_json::json!({ "event": event, "data": data });
        self.to_client.send(WsMessage::Text(frame.to_string())).unwrap();
    }

    pub fn close(&self) {
        let _ = self.to_client.send(WsMessage::Close(None));
    }

    pub async fn next_frame(&mut self) -> serde_json::Value {
        let text = tokio::time::timeout(std::time::Duration::from_secs(5), self.from_client.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("client connection ended");
        serde_json::from_str(&text).unwrap()
    }
}

/// Loopback websocket server; yields one `ServerConn` per accepted client.
pub async fn spawn_server() -> (String, mpsc::UnboundedReceiver<ServerConn>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (conn_tx, conn_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let uri = Arc::new(Mutex::new(String::new()));
            let seen = Arc::clone(&uri);
            let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                *seen.lock().unwrap() = req.uri().to_string();
                Ok(resp)
            };
            let Ok(ws) = tokio_tungstenite::accept_hdr_async(tcp, callback).await else {
                continue;
            };
            let (mut sink, mut stream) = ws.split();
            let (to_client, mut outbound) = mpsc::unbounded_channel::<WsMessage>();
            let (inbound, from_client) = mpsc::unbounded_channel::<String>();
            tokio::spawn(async move {
                while let Some(msg) = outbound.recv().await {
                    let closing = matches!(msg, WsMessage::Close(_));
                    if sink.send(msg).await.is_err() || closing {
                        break;
                    }
                }
            });
            tokio::spawn(async move {
                while let Some(Ok(msg)) = stream.next().await {
                    if let WsMessage::Text(text) = msg {
                        if inbound.send(text).is_err() {
                            break;
                        }
                    }
                }
            });
            let uri = uri.lock().unwrap().clone();
            if conn_tx.send(ServerConn { uri, to_client, from_client }).is_err() {
                break;
            }
        }
    });
    (format!("ws://{addr}/ws"), conn_rx)
}

pub async fn next_conn(conns: &mut mpsc::UnboundedReceiver<ServerConn>) -> ServerConn {
    tokio::time::timeout(std::time::Duration::from_secs(5), conns.recv())
        .await
        .expect("timed out waiting for connection")
        .expect("server stopped")
}
