use std::future::Future;
use std::sync::Arc;

use log::{debug, warn};
use reqwest::Client as HttpClient;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde_json::json;

use crate::api::models::{
    AdminConversationDetails, Conversation, ConversationList, ConversationStats, Message,
    MessagePage, OnlineUsers, OutgoingFile, UserChatStats,
};
use crate::app::Credentials;
use crate::error::RequestError;

/// Response wrapper every request/response call returns.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    pub data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    pub fn into_data(self) -> Result<T, RequestError> {
        if !self.success {
            return Err(RequestError::Rejected(self.message));
        }
        self.data
            .ok_or_else(|| RequestError::Malformed("missing data".into()))
    }

    /// Success check alone; `data` may be null or absent.
    pub fn into_ack(self) -> Result<(), RequestError> {
        if self.success {
            Ok(())
        } else {
            Err(RequestError::Rejected(self.message))
        }
    }
}

/// Decode a raw body into the `data` of a successful envelope.
pub fn decode_envelope<T: DeserializeOwned>(body: &[u8]) -> Result<T, RequestError> {
    let envelope: ApiEnvelope<T> =
        serde_json::from_slice(body).map_err(|e| RequestError::Malformed(e.to_string()))?;
    envelope.into_data()
}

/// Decode a raw body as an acknowledgement, ignoring whatever `data` holds.
pub fn decode_ack(body: &[u8]) -> Result<(), RequestError> {
    let envelope: ApiEnvelope<IgnoredAny> =
        serde_json::from_slice(body).map_err(|e| RequestError::Malformed(e.to_string()))?;
    envelope.into_ack()
}

#[derive(Deserialize)]
struct ConversationData {
    conversation: Conversation,
}

#[derive(Deserialize)]
struct MessageData {
    message: Message,
}

/// A message to send over the request/response transport.
#[derive(Debug, Clone, Default)]
pub struct MultipartSend {
    pub conversation_id: String,
    pub text_content: Option<String>,
    pub reply_to: Option<String>,
    pub files: Vec<OutgoingFile>,
}

/// The request/response operations the engine consumes.
pub trait ChatApi: Send + Sync + 'static {
    fn list_conversations(
        &self,
        archived: Option<bool>,
    ) -> impl Future<Output = Result<Vec<Conversation>, RequestError>> + Send;
    fn create_direct(
        &self,
        other_user_id: &str,
    ) -> impl Future<Output = Result<Conversation, RequestError>> + Send;
    fn create_group(
        &self,
        participant_ids: &[String],
        name: &str,
        description: Option<&str>,
    ) -> impl Future<Output = Result<Conversation, RequestError>> + Send;
    fn update_group(
        &self,
        conversation_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> impl Future<Output = Result<Conversation, RequestError>> + Send;
    fn add_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> impl Future<Output = Result<Conversation, RequestError>> + Send;
    fn remove_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> impl Future<Output = Result<Conversation, RequestError>> + Send;
    fn set_muted(
        &self,
        conversation_id: &str,
        muted: bool,
    ) -> impl Future<Output = Result<(), RequestError>> + Send;
    fn set_archived(
        &self,
        conversation_id: &str,
        archived: bool,
    ) -> impl Future<Output = Result<(), RequestError>> + Send;
    fn fetch_messages(
        &self,
        conversation_id: &str,
        limit: u32,
        before: Option<&str>,
    ) -> impl Future<Output = Result<MessagePage, RequestError>> + Send;
    fn send_message(
        &self,
        request: MultipartSend,
    ) -> impl Future<Output = Result<Message, RequestError>> + Send;
    fn delete_message(
        &self,
        message_id: &str,
    ) -> impl Future<Output = Result<(), RequestError>> + Send;
    fn mark_read(
        &self,
        conversation_id: &str,
        up_to_message_id: Option<&str>,
    ) -> impl Future<Output = Result<(), RequestError>> + Send;
    fn online_users(&self) -> impl Future<Output = Result<OnlineUsers, RequestError>> + Send;
    fn conversation_online_users(
        &self,
        conversation_id: &str,
    ) -> impl Future<Output = Result<OnlineUsers, RequestError>> + Send;
    fn user_stats(&self) -> impl Future<Output = Result<UserChatStats, RequestError>> + Send;
    fn conversation_stats(
        &self,
        conversation_id: &str,
    ) -> impl Future<Output = Result<ConversationStats, RequestError>> + Send;
    fn admin_conversation_details(
        &self,
        conversation_id: &str,
    ) -> impl Future<Output = Result<AdminConversationDetails, RequestError>> + Send;
    fn admin_delete_conversation(
        &self,
        conversation_id: &str,
    ) -> impl Future<Output = Result<(), RequestError>> + Send;
}

pub struct ApiClient {
    pub http: HttpClient,
    base_url: String,
    credentials: Arc<dyn Credentials>,
}

impl ApiClient {
    pub fn new(base_url: &str, credentials: Arc<dyn Credentials>) -> Self {
        Self::with_http(HttpClient::new(), base_url, credentials)
    }

    pub fn with_http(
        http: HttpClient,
        base_url: &str,
        credentials: Arc<dyn Credentials>,
    ) -> Self {
        Self {
            http,
            base_url: crate::utils::normalize_url(base_url),
            credentials,
        }
    }

    fn base_api(base_url: &str) -> String {
        let trimmed = base_url.trim_end_matches('/');
        if trimmed.ends_with("/api") {
            format!("{}/v1/chat", trimmed)
        } else {
            format!("{}/api/v1/chat", trimmed)
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", Self::base_api(&self.base_url), path)
    }

    fn with_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.credentials.current_token() {
            Some(t) => req.bearer_auth(t),
            None => {
                warn!("request sent without a bearer token");
                req
            }
        }
    }

    /// Send with auth and return the body of a 2xx response.
    async fn send_checked(&self, req: reqwest::RequestBuilder) -> Result<Vec<u8>, RequestError> {
        let resp = self.with_auth(req).send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;
        if !status.is_success() {
            // Error bodies usually still carry the envelope with a reason.
            if let Ok(envelope) = serde_json::from_slice::<ApiEnvelope<IgnoredAny>>(&body) {
                if !envelope.message.is_empty() {
                    return Err(RequestError::Rejected(envelope.message));
                }
            }
            return Err(RequestError::Status(status.as_u16()));
        }
        Ok(body.to_vec())
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<T, RequestError> {
        let body = self.send_checked(req).await?;
        decode_envelope(&body)
    }

    /// For calls that only acknowledge; a null or missing `data` is fine.
    async fn execute_unit(&self, req: reqwest::RequestBuilder) -> Result<(), RequestError> {
        let body = self.send_checked(req).await?;
        decode_ack(&body)
    }

    fn file_part(file: OutgoingFile) -> Result<Part, RequestError> {
        Part::bytes(file.bytes)
            .file_name(file.file_name)
            .mime_str(&file.mime_type)
            .map_err(RequestError::Http)
    }
}

impl ChatApi for ApiClient {
    async fn list_conversations(
        &self,
        archived: Option<bool>,
    ) -> Result<Vec<Conversation>, RequestError> {
        let mut req = self.http.get(self.endpoint("/conversations"));
        if let Some(a) = archived {
            req = req.query(&[("archived", a)]);
        }
        let list: ConversationList = self.execute(req).await?;
        debug!("fetched {} of {} conversations", list.conversations.len(), list.total);
        Ok(list.conversations)
    }

    async fn create_direct(&self, other_user_id: &str) -> Result<Conversation, RequestError> {
        let req = self
            .http
            .post(self.endpoint("/conversations/direct"))
            .json(&json!({ "other_user_id": other_user_id }));
        let data: ConversationData = self.execute(req).await?;
        Ok(data.conversation)
    }

    async fn create_group(
        &self,
        participant_ids: &[String],
        name: &str,
        description: Option<&str>,
    ) -> Result<Conversation, RequestError> {
        let req = self.http.post(self.endpoint("/conversations/group")).json(&json!({
            "participant_ids": participant_ids,
            "name": name,
            "description": description,
        }));
        let data: ConversationData = self.execute(req).await?;
        Ok(data.conversation)
    }

    async fn update_group(
        &self,
        conversation_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<Conversation, RequestError> {
        let req = self
            .http
            .put(self.endpoint(&format!("/conversations/{conversation_id}")))
            .json(&json!({ "name": name, "description": description }));
        let data: ConversationData = self.execute(req).await?;
        Ok(data.conversation)
    }

    async fn add_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Conversation, RequestError> {
        let req = self
            .http
            .post(self.endpoint(&format!("/conversations/{conversation_id}/participants")))
            .json(&json!({ "user_id": user_id }));
        let data: ConversationData = self.execute(req).await?;
        Ok(data.conversation)
    }

    async fn remove_participant(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Conversation, RequestError> {
        let path = format!("/conversations/{conversation_id}/participants/{user_id}");
        let req = self.http.delete(self.endpoint(&path));
        let data: ConversationData = self.execute(req).await?;
        Ok(data.conversation)
    }

    async fn set_muted(&self, conversation_id: &str, muted: bool) -> Result<(), RequestError> {
        let req = self
            .http
            .put(self.endpoint(&format!("/conversations/{conversation_id}/mute")))
            .json(&json!({ "is_muted": muted }));
        self.execute_unit(req).await
    }

    async fn set_archived(
        &self,
        conversation_id: &str,
        archived: bool,
    ) -> Result<(), RequestError> {
        let req = self
            .http
            .put(self.endpoint(&format!("/conversations/{conversation_id}/archive")))
            .json(&json!({ "is_archived": archived }));
        self.execute_unit(req).await
    }

    async fn fetch_messages(
        &self,
        conversation_id: &str,
        limit: u32,
        before: Option<&str>,
    ) -> Result<MessagePage, RequestError> {
        let mut req = self
            .http
            .get(self.endpoint(&format!("/conversations/{conversation_id}/messages")))
            .query(&[("limit", limit)]);
        if let Some(cursor) = before {
            req = req.query(&[("before", cursor)]);
        }
        self.execute(req).await
    }

    async fn send_message(&self, request: MultipartSend) -> Result<Message, RequestError> {
        let mut form = Form::new().text("conversation_id", request.conversation_id);
        if let Some(text) = request.text_content {
            form = form.text("text_content", text);
        }
        if let Some(reply) = request.reply_to {
            form = form.text("reply_to", reply);
        }
        for file in request.files {
            form = form.part("files", Self::file_part(file)?);
        }
        let req = self.http.post(self.endpoint("/messages")).multipart(form);
        let data: MessageData = self.execute(req).await?;
        Ok(data.message)
    }

    async fn delete_message(&self, message_id: &str) -> Result<(), RequestError> {
        let req = self.http.delete(self.endpoint(&format!("/messages/{message_id}")));
        self.execute_unit(req).await
    }

    async fn mark_read(
        &self,
        conversation_id: &str,
        up_to_message_id: Option<&str>,
    ) -> Result<(), RequestError> {
        let req = self
            .http
            .put(self.endpoint(&format!("/conversations/{conversation_id}/read")))
            .json(&json!({ "up_to_message_id": up_to_message_id }));
        self.execute_unit(req).await
    }

    async fn online_users(&self) -> Result<OnlineUsers, RequestError> {
        self.execute(self.http.get(self.endpoint("/online-users"))).await
    }

    async fn conversation_online_users(
        &self,
        conversation_id: &str,
    ) -> Result<OnlineUsers, RequestError> {
        let req = self
            .http
            .get(self.endpoint(&format!("/conversations/{conversation_id}/online-users")));
        self.execute(req).await
    }

    async fn user_stats(&self) -> Result<UserChatStats, RequestError> {
        self.execute(self.http.get(self.endpoint("/stats"))).await
    }

    async fn conversation_stats(
        &self,
        conversation_id: &str,
    ) -> Result<ConversationStats, RequestError> {
        let req = self
            .http
            .get(self.endpoint(&format!("/conversations/{conversation_id}/stats")));
        self.execute(req).await
    }

    async fn admin_conversation_details(
        &self,
        conversation_id: &str,
    ) -> Result<AdminConversationDetails, RequestError> {
        let req = self
            .http
            .get(self.endpoint(&format!("/admin/conversations/{conversation_id}")));
        self.execute(req).await
    }

    async fn admin_delete_conversation(&self, conversation_id: &str) -> Result<(), RequestError> {
        let req = self
            .http
            .delete(self.endpoint(&format!("/admin/conversations/{conversation_id}")));
        self.execute_unit(req).await
    }
}
