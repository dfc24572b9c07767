//! Synchronization engine.
//!
//! Owns the stores and the push session, routes inbound push events, picks
//! the transport for every send and guards the active conversation against
//! late fetch results.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::time::Instant;

use crate::api::client::{ChatApi, MultipartSend};
use crate::api::events::{
    INBOUND_EVENTS, PushEvent, SEND_MESSAGE, SendMessagePayload, TYPING_START, TYPING_STOP,
    TypingPayload,
};
use crate::api::models::{
    AdminConversationDetails, Conversation, ConversationPatch, ConversationStats, DeliveryStatus,
    LastMessage, MemberPatch, Message, MessagePage, MessagePatch, OnlineUsers, OutgoingFile,
    UserChatStats,
};
use crate::app::{Credentials, DEFAULT_PAGE_SIZE};
use crate::error::{ConnectionError, RequestError, SyncError};
use crate::presence::PresenceTracker;
use crate::session::{ConnectionState, PushSession};
use crate::storage::{ConversationStore, MessageStore, PreviewOutcome};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub page_size: u32,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

/// Identifies one message fetch for one selection of a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    conversation_id: String,
    generation: u64,
}

impl FetchTicket {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }
}

/// What a caller wants to send. Files or a reply make it a rich send.
#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub text: Option<String>,
    pub reply_to: Option<String>,
    pub files: Vec<OutgoingFile>,
}

impl SendRequest {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to = Some(message_id.into());
        self
    }

    pub fn with_file(mut self, file: OutgoingFile) -> Self {
        self.files.push(file);
        self
    }

    pub fn is_rich(&self) -> bool {
        !self.files.is_empty() || self.reply_to.is_some()
    }

    fn trimmed_text(&self) -> Option<String> {
        self.text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Server-confirmed message, already merged into the active store.
    Confirmed(Message),
    /// Emitted over push; the message shows up once the server echoes it.
    AwaitingEcho { conversation_id: String },
}

/// Work an inbound event asks the engine to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Followup {
    RefreshConversations,
}

/// Jittered exponential backoff for reconnect attempts.
#[derive(Debug)]
struct Backoff {
    attempt: u32,
    base: Duration,
    max: Duration,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self { attempt: 0, base, max }
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        let exp = self.base.as_secs_f64() * 2f64.powi(self.attempt as i32 - 1);
        let capped = exp.min(self.max.as_secs_f64());
        // ±25% jitter
        let jitter = 1.0 + (rand_jitter() * 0.5 - 0.25);
        Duration::from_secs_f64((capped * jitter).max(0.05))
    }
}

/// Jitter in [0, 1) seeded from the clock.
fn rand_jitter() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos as f64 % 1000.0) / 1000.0
}

pub struct SyncEngine<A: ChatApi> {
    api: Arc<A>,
    session: PushSession,
    credentials: Arc<dyn Credentials>,
    config: EngineConfig,
    conversations: ConversationStore,
    messages: MessageStore,
    presence: PresenceTracker,
    active: Option<String>,
    generation: u64,
    /// Subscribed by `start` before connecting; consumed by `run`.
    pending_inbound: Option<BoxStream<'static, PushEvent>>,
}

impl<A: ChatApi> SyncEngine<A> {
    pub fn new(
        api: A,
        session: PushSession,
        credentials: Arc<dyn Credentials>,
        config: EngineConfig,
    ) -> Self {
        Self {
            api: Arc::new(api),
            session,
            credentials,
            config,
            conversations: ConversationStore::new(),
            messages: MessageStore::new(),
            presence: PresenceTracker::new(),
            active: None,
            generation: 0,
            pending_inbound: None,
        }
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    pub fn messages(&self) -> &MessageStore {
        &self.messages
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn session(&self) -> &PushSession {
        &self.session
    }

    pub fn active_conversation(&self) -> Option<&str> {
        self.active.as_deref()
    }

    fn self_id(&self) -> Result<String, SyncError> {
        self.credentials.current_user_id().ok_or(SyncError::NotAuthenticated)
    }

    fn is_active(&self, conversation_id: &str) -> bool {
        self.active.as_deref() == Some(conversation_id)
    }

    /// Connect the push session and load the conversation list.
    ///
    /// Listeners are registered before connecting, so events pushed while the
    /// list is loading are buffered and dispatched once `run` starts.
    pub async fn start(&mut self) -> Result<(), SyncError> {
        let user = self.self_id()?;
        let inbound = self.inbound();
        self.session.connect(self.credentials.current_token().as_deref()).await?;
        self.pending_inbound = Some(inbound);
        info!("sync engine started for {user}");
        self.refresh_conversations(None).await
    }

    pub fn stop(&mut self) {
        self.pending_inbound = None;
        self.session.disconnect();
        self.presence.clear();
        info!("sync engine stopped");
    }

    pub async fn refresh_conversations(&mut self, archived: Option<bool>) -> Result<(), SyncError> {
        let list = self.api.list_conversations(archived).await?;
        debug!("conversation refresh: {} entries", list.len());
        self.conversations.replace_all(list);
        Ok(())
    }

    /// Make `conversation_id` active. The message store is empty on return.
    pub fn select_conversation(&mut self, conversation_id: &str) -> FetchTicket {
        self.messages.clear();
        self.active = Some(conversation_id.to_string());
        self.next_ticket(conversation_id)
    }

    fn next_ticket(&mut self, conversation_id: &str) -> FetchTicket {
        self.generation += 1;
        FetchTicket {
            conversation_id: conversation_id.to_string(),
            generation: self.generation,
        }
    }

    pub fn deselect(&mut self) {
        self.messages.clear();
        self.active = None;
        self.generation += 1;
    }

    pub fn is_current(&self, ticket: &FetchTicket) -> bool {
        ticket.generation == self.generation && self.is_active(&ticket.conversation_id)
    }

    fn check_ticket(&self, ticket: &FetchTicket) -> Result<(), SyncError> {
        if self.is_current(ticket) {
            Ok(())
        } else {
            Err(SyncError::StaleResult {
                conversation_id: ticket.conversation_id.clone(),
            })
        }
    }

    /// Start a page fetch. The future does not borrow the engine, so a caller
    /// may keep selecting while it is in flight.
    pub fn fetch_page(
        &self,
        ticket: &FetchTicket,
        before: Option<String>,
    ) -> BoxFuture<'static, Result<MessagePage, RequestError>> {
        let api = Arc::clone(&self.api);
        let conversation_id = ticket.conversation_id.clone();
        let limit = self.config.page_size;
        async move { api.fetch_messages(&conversation_id, limit, before.as_deref()).await }.boxed()
    }

    /// Merge a fetched page unless its selection is no longer current.
    pub fn apply_page(&mut self, ticket: &FetchTicket, page: MessagePage, replace: bool) -> bool {
        match self.check_ticket(ticket) {
            Ok(()) => {
                self.messages.load_page(page.messages, replace);
                true
            }
            Err(e) => {
                debug!("discarding page: {e}");
                false
            }
        }
    }

    /// Select, load the newest page and mark the conversation read.
    pub async fn open_conversation(&mut self, conversation_id: &str) -> Result<(), SyncError> {
        let ticket = self.select_conversation(conversation_id);
        let page = self.fetch_page(&ticket, None).await?;
        if self.apply_page(&ticket, page, true) {
            self.mark_active_read().await?;
        }
        Ok(())
    }

    /// Fetch the page before the oldest loaded message. Returns whether the
    /// server reported more history.
    pub async fn load_older(&mut self) -> Result<bool, SyncError> {
        let Some(active) = self.active.clone() else {
            return Ok(false);
        };
        let ticket = FetchTicket {
            conversation_id: active,
            generation: self.generation,
        };
        let before = self.messages.oldest_id().map(str::to_string);
        let page = self.fetch_page(&ticket, before).await?;
        let has_more = page.has_more;
        self.apply_page(&ticket, page, false);
        Ok(has_more)
    }

    /// Reload the newest page of the active conversation without clearing first.
    pub async fn reload_active(&mut self) -> Result<(), SyncError> {
        let Some(active) = self.active.clone() else {
            return Ok(());
        };
        let ticket = self.next_ticket(&active);
        let page = self.fetch_page(&ticket, None).await?;
        self.apply_page(&ticket, page, true);
        Ok(())
    }

    pub async fn mark_active_read(&mut self) -> Result<(), SyncError> {
        let Some(active) = self.active.clone() else {
            return Ok(());
        };
        let me = self.self_id()?;
        let last_id = self.messages.iter().last().map(|m| m.id.clone());
        self.api.mark_read(&active, last_id.as_deref()).await?;

        let mut member = MemberPatch::for_user(me.clone());
        member.unread_count = Some(0);
        member.last_read_at = Some(Utc::now());
        self.conversations.apply_patch(&active, ConversationPatch::member(member));

        let unread: Vec<(String, Vec<String>)> = self
            .messages
            .iter()
            .filter(|m| m.sender_id != me && !m.read_by.contains(&me))
            .map(|m| (m.id.clone(), m.read_by.clone()))
            .collect();
        for (id, mut read_by) in unread {
            read_by.push(me.clone());
            self.messages.apply_update(
                &id,
                MessagePatch {
                    status: Some(DeliveryStatus::Read),
                    read_by: Some(read_by),
                    delivered_to: None,
                },
            );
        }
        Ok(())
    }

    /// Route one inbound push event to the stores.
    pub fn handle_push(&mut self, event: PushEvent) -> Vec<Followup> {
        let mut followups = Vec::new();
        match event {
            PushEvent::NewMessage(message) => {
                let conversation_id = message.conversation_id.clone();
                let preview = LastMessage::from_message(&message);
                if self.is_active(&conversation_id) {
                    self.messages.append_if_new(message);
                }
                let outcome = self.conversations.upsert_preview(&conversation_id, preview);
                if outcome == PreviewOutcome::UnknownConversation {
                    debug!("message for unknown conversation {conversation_id}");
                    followups.push(Followup::RefreshConversations);
                }
            }
            PushEvent::MessageDeleted(deleted) => {
                // The preview keeps the deleted message until the next full refresh.
                if self.is_active(&deleted.conversation_id) {
                    self.messages.tombstone(&deleted.message_id);
                }
            }
            PushEvent::Typing(update) => {
                self.presence.set_typing(&update.user_id, update.is_typing)
            }
            PushEvent::Presence(update) => {
                self.presence.set_online(&update.user_id, update.is_online)
            }
        }
        followups
    }

    async fn run_followups(&mut self, followups: Vec<Followup>) {
        for followup in followups {
            match followup {
                Followup::RefreshConversations => {
                    if let Err(e) = self.refresh_conversations(None).await {
                        warn!("conversation refresh failed: {e}");
                    }
                }
            }
        }
    }

    /// One merged stream of typed inbound events. Malformed payloads are
    /// logged and skipped.
    pub fn inbound(&self) -> BoxStream<'static, PushEvent> {
        let streams = INBOUND_EVENTS.iter().map(|&event| {
            self.session
                .subscribe(event)
                .filter_map(move |payload| {
                    let parsed = match PushEvent::parse(event, payload) {
                        Ok(ev) => Some(ev),
                        Err(e) => {
                            warn!("ignoring push event: {e}");
                            None
                        }
                    };
                    futures_util::future::ready(parsed)
                })
                .boxed()
        });
        futures_util::stream::select_all(streams).boxed()
    }

    /// Send a message over the transport its shape calls for.
    pub async fn send(
        &mut self,
        conversation_id: &str,
        request: SendRequest,
    ) -> Result<SendOutcome, SyncError> {
        let text = request.trimmed_text();
        if text.is_none() && request.files.is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        if request.is_rich() {
            let message = self
                .api
                .send_message(MultipartSend {
                    conversation_id: conversation_id.to_string(),
                    text_content: text,
                    reply_to: request.reply_to,
                    files: request.files,
                })
                .await?;
            if self.is_active(&message.conversation_id) {
                self.messages.append_if_new(message.clone());
            }
            return Ok(SendOutcome::Confirmed(message));
        }
        let payload = SendMessagePayload {
            conversation_id: conversation_id.to_string(),
            text_content: text.unwrap_or_default(),
        };
        self.session.emit(SEND_MESSAGE, &payload);
        Ok(SendOutcome::AwaitingEcho {
            conversation_id: conversation_id.to_string(),
        })
    }

    pub fn start_typing(&self, conversation_id: &str) {
        self.session.emit(
            TYPING_START,
            &TypingPayload {
                conversation_id: conversation_id.to_string(),
                is_typing: true,
            },
        );
    }

    pub fn stop_typing(&self, conversation_id: &str) {
        self.session.emit(
            TYPING_STOP,
            &TypingPayload {
                conversation_id: conversation_id.to_string(),
                is_typing: false,
            },
        );
    }

    pub async fn create_direct(&mut self, other_user_id: &str) -> Result<Conversation, SyncError> {
        let conversation = self.api.create_direct(other_user_id).await?;
        self.conversations.upsert(conversation.clone());
        Ok(conversation)
    }

    pub async fn create_group(
        &mut self,
        participant_ids: &[String],
        name: &str,
        description: Option<&str>,
    ) -> Result<Conversation, SyncError> {
        let conversation = self.api.create_group(participant_ids, name, description).await?;
        self.conversations.upsert(conversation.clone());
        Ok(conversation)
    }

    fn merge_server_conversation(&mut self, conversation: &Conversation) {
        if !self
            .conversations
            .apply_patch(&conversation.id, ConversationPatch::from_server(conversation))
        {
            self.conversations.upsert(conversation.clone());
        }
    }

    pub async fn update_group(
        &mut self,
        conversation_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<Conversation, SyncError> {
        let conversation = self.api.update_group(conversation_id, name, description).await?;
        self.merge_server_conversation(&conversation);
        Ok(conversation)
    }

    pub async fn add_participant(
        &mut self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Conversation, SyncError> {
        let conversation = self.api.add_participant(conversation_id, user_id).await?;
        self.merge_server_conversation(&conversation);
        Ok(conversation)
    }

    /// Remove a member; removing yourself leaves the group locally too.
    pub async fn remove_participant(
        &mut self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Conversation, SyncError> {
        let conversation = self.api.remove_participant(conversation_id, user_id).await?;
        if self.credentials.current_user_id().as_deref() == Some(user_id) {
            self.evict_local(conversation_id);
        } else {
            self.merge_server_conversation(&conversation);
        }
        Ok(conversation)
    }

    pub async fn set_muted(&mut self, conversation_id: &str, muted: bool) -> Result<(), SyncError> {
        let me = self.self_id()?;
        self.api.set_muted(conversation_id, muted).await?;
        let mut member = MemberPatch::for_user(me);
        member.is_muted = Some(muted);
        self.conversations.apply_patch(conversation_id, ConversationPatch::member(member));
        Ok(())
    }

    pub async fn set_archived(
        &mut self,
        conversation_id: &str,
        archived: bool,
    ) -> Result<(), SyncError> {
        let me = self.self_id()?;
        self.api.set_archived(conversation_id, archived).await?;
        let mut member = MemberPatch::for_user(me);
        member.is_archived = Some(archived);
        self.conversations.apply_patch(conversation_id, ConversationPatch::member(member));
        Ok(())
    }

    pub async fn delete_message(&mut self, message_id: &str) -> Result<(), SyncError> {
        self.api.delete_message(message_id).await?;
        self.messages.tombstone(message_id);
        Ok(())
    }

    fn evict_local(&mut self, conversation_id: &str) {
        self.conversations.evict(conversation_id);
        if self.is_active(conversation_id) {
            self.deselect();
        }
    }

    pub async fn admin_delete_conversation(
        &mut self,
        conversation_id: &str,
    ) -> Result<(), SyncError> {
        self.api.admin_delete_conversation(conversation_id).await?;
        self.evict_local(conversation_id);
        Ok(())
    }

    pub async fn admin_conversation_details(
        &self,
        conversation_id: &str,
    ) -> Result<AdminConversationDetails, SyncError> {
        Ok(self.api.admin_conversation_details(conversation_id).await?)
    }

    /// Server view of who is online. Does not feed the presence tracker.
    pub async fn online_users(&self) -> Result<OnlineUsers, SyncError> {
        Ok(self.api.online_users().await?)
    }

    pub async fn conversation_online_users(
        &self,
        conversation_id: &str,
    ) -> Result<OnlineUsers, SyncError> {
        Ok(self.api.conversation_online_users(conversation_id).await?)
    }

    pub async fn user_stats(&self) -> Result<UserChatStats, SyncError> {
        Ok(self.api.user_stats().await?)
    }

    pub async fn conversation_stats(
        &self,
        conversation_id: &str,
    ) -> Result<ConversationStats, SyncError> {
        Ok(self.api.conversation_stats(conversation_id).await?)
    }

    /// UI gating only; the server makes the real decision.
    pub fn can_manage(&self, conversation_id: &str) -> bool {
        match (self.credentials.current_user_id(), self.conversations.get(conversation_id)) {
            (Some(me), Some(conv)) => conv.is_admin(&me),
            _ => false,
        }
    }

    /// Members may leave; admins may remove other members.
    pub fn can_remove_member(&self, conversation_id: &str, user_id: &str) -> bool {
        let Some(conv) = self.conversations.get(conversation_id) else {
            return false;
        };
        if !conv.has_member(user_id) {
            return false;
        }
        self.credentials.current_user_id().as_deref() == Some(user_id)
            || self.can_manage(conversation_id)
    }

    /// Reconnect with a freshly read token, then refresh what the gap may have hidden.
    async fn resume(&mut self) -> Result<(), SyncError> {
        self.session.connect(self.credentials.current_token().as_deref()).await?;
        info!("push session resumed");
        if let Err(e) = self.refresh_conversations(None).await {
            warn!("refresh after reconnect failed: {e}");
        }
        if let Err(e) = self.reload_active().await {
            warn!("reload after reconnect failed: {e}");
        }
        Ok(())
    }

    /// Event loop: dispatch push events until `shutdown` resolves, reconnecting
    /// with backoff when the push connection drops.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<(), SyncError>
    where
        F: Future<Output = ()>,
    {
        let mut inbound = match self.pending_inbound.take() {
            Some(inbound) => inbound,
            None => self.inbound(),
        };
        let mut states = self.session.state_changes();
        let mut backoff = Backoff::new(self.config.reconnect_base, self.config.reconnect_max);
        let mut retry_at: Option<Instant> = None;
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => break Ok(()),
                event = inbound.next() => match event {
                    Some(event) => {
                        let followups = self.handle_push(event);
                        self.run_followups(followups).await;
                    }
                    None => break Ok(()),
                },
                changed = states.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                    let state = *states.borrow_and_update();
                    if state == ConnectionState::Disconnected && retry_at.is_none() {
                        let delay = backoff.next_delay();
                        warn!("push connection lost, retrying in {:.1}s", delay.as_secs_f64());
                        retry_at = Some(Instant::now() + delay);
                    }
                }
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)),
                    if retry_at.is_some() =>
                {
                    retry_at = None;
                    match self.resume().await {
                        Ok(()) => backoff.reset(),
                        Err(SyncError::Connection(ConnectionError::MissingToken)) => {
                            error!("cannot reconnect: no auth token");
                            break Err(ConnectionError::MissingToken.into());
                        }
                        Err(e) => {
                            let delay = backoff.next_delay();
                            warn!("reconnect failed: {e}; retrying in {:.1}s", delay.as_secs_f64());
                            retry_at = Some(Instant::now() + delay);
                        }
                    }
                }
            }
        };
        self.stop();
        result
    }
}
