use std::future::Future;
use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use souk_models::conversation::{Conversation, ReadState};
use souk_models::message::Message;

use crate::ClientError;

/// The two message calls the fallback loop and the send path need.
pub trait MessageApi: Send + Sync {
    /// Messages after `after` (exclusive), ascending by id.
    fn list_since(
        &self,
        conversation_id: i64,
        after: Option<i64>,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<Message>, ClientError>> + Send;

    fn post_message(
        &self,
        conversation_id: i64,
        content: &str,
        nonce: &str,
    ) -> impl Future<Output = Result<Message, ClientError>> + Send;
}

/// Bearer-authenticated client for `/api/v1`.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}/api/v1{path}", self.base_url))
            .bearer_auth(&self.token)
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let message = response
            .json::<Value>()
            .await
            .ok()
            .and_then(|body| body["message"].as_str().map(str::to_string))
            .unwrap_or_else(|| status.to_string());
        Err(ClientError::Status {
            status: status.as_u16(),
            message,
        })
    }

    pub async fn start_conversation(
        &self,
        listing_id: i64,
        peer_id: Option<i64>,
    ) -> Result<Conversation, ClientError> {
        let mut body = json!({ "listing_id": listing_id.to_string() });
        if let Some(peer_id) = peer_id {
            body["peer_id"] = Value::String(peer_id.to_string());
        }
        let response = self
            .request(Method::POST, "/conversations")
            .json(&body)
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn list_conversations(&self) -> Result<Vec<Conversation>, ClientError> {
        let response = self.request(Method::GET, "/conversations").send().await?;
        Self::decode(response).await
    }

    pub async fn get_conversation(&self, conversation_id: i64) -> Result<Conversation, ClientError> {
        let response = self
            .request(Method::GET, &format!("/conversations/{conversation_id}"))
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn mark_read(
        &self,
        conversation_id: i64,
        last_message_id: i64,
    ) -> Result<ReadState, ClientError> {
        let response = self
            .request(Method::PUT, &format!("/conversations/{conversation_id}/read"))
            .json(&json!({ "last_message_id": last_message_id.to_string() }))
            .send()
            .await?;
        Self::decode(response).await
    }
}

impl MessageApi for RestClient {
    async fn list_since(
        &self,
        conversation_id: i64,
        after: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Message>, ClientError> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(after) = after {
            query.push(("after", after.to_string()));
        }
        let response = self
            .request(Method::GET, &format!("/conversations/{conversation_id}/messages"))
            .query(&query)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn post_message(
        &self,
        conversation_id: i64,
        content: &str,
        nonce: &str,
    ) -> Result<Message, ClientError> {
        let response = self
            .request(Method::POST, &format!("/conversations/{conversation_id}/messages"))
            .json(&json!({ "content": content, "nonce": nonce }))
            .send()
            .await?;
        Self::decode(response).await
    }
}
