//! Chat backend abstraction and its HTTP implementation

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::{
    error::{Error, Result},
    trace::{TraceRecord, decode_trace_list},
    types::{ChatRequest, DonePayload},
};

/// Status codes meaning "the streaming endpoint is not available here"
pub const FALLBACK_STATUSES: [u16; 4] = [404, 405, 406, 501];

/// Upper bound the trace API accepts for `limit`
const TRACE_PAGE_LIMIT: u32 = 1000;

/// Raw response body chunks
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Outcome of opening the streaming endpoint
pub enum StreamOpen {
    /// Event-framed body ready to be read
    Streaming(ByteStream),
    /// Streaming is unusable; the caller should use the blocking call
    Unavailable { status: Option<u16> },
}

impl std::fmt::Debug for StreamOpen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamOpen::Streaming(_) => f.write_str("Streaming(..)"),
            StreamOpen::Unavailable { status } => f
                .debug_struct("Unavailable")
                .field("status", status)
                .finish(),
        }
    }
}

/// Conversational backend the transmission controller talks to
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Open the event-stream endpoint
    async fn open_stream(&self, request: &ChatRequest) -> Result<StreamOpen>;

    /// Single blocking call returning the full `done` payload
    async fn complete(&self, request: &ChatRequest) -> Result<DonePayload>;
}

/// External store of persisted trace records
#[async_trait]
pub trait TraceSource: Send + Sync {
    /// All trace records of one conversation, in any order
    async fn conversation_traces(&self, conversation_id: &str) -> Result<Vec<TraceRecord>>;
}

/// What to do with a response from the streaming endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDisposition {
    Read,
    Fallback,
    Fail,
}

/// Decide how to treat a streaming response from its status and content type
pub fn classify_stream_response(status: u16, content_type: Option<&str>) -> StreamDisposition {
    if FALLBACK_STATUSES.contains(&status) {
        return StreamDisposition::Fallback;
    }
    if !(200..300).contains(&status) {
        return StreamDisposition::Fail;
    }
    match content_type {
        Some(ct) if ct.to_ascii_lowercase().starts_with("text/event-stream") => {
            StreamDisposition::Read
        }
        _ => StreamDisposition::Fallback,
    }
}

/// HTTP client for the dashboard's chat and trace endpoints
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    /// Create a backend for the given base URL
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(Error::InvalidConfig(format!(
                "base URL must start with http:// or https://, got '{}'",
                base_url
            )));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn build_stream_request(&self, request: &ChatRequest) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/api/chat/stream", self.base_url))
            .header("accept", "text/event-stream")
            .json(request)
    }

    pub fn build_complete_request(&self, request: &ChatRequest) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/api/chat", self.base_url))
            .json(request)
    }

    pub fn build_traces_request(&self, conversation_id: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}/api/traces", self.base_url))
            .query(&[
                ("conversation_id", conversation_id.to_string()),
                ("limit", TRACE_PAGE_LIMIT.to_string()),
            ])
    }
}

async fn api_error(response: reqwest::Response) -> Error {
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    Error::api(status, text)
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn open_stream(&self, request: &ChatRequest) -> Result<StreamOpen> {
        let response = self.build_stream_request(request).send().await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        match classify_stream_response(status, content_type.as_deref()) {
            StreamDisposition::Read => {
                let body = response
                    .bytes_stream()
                    .map(|chunk| chunk.map(|b| b.to_vec()).map_err(|e| Error::Body(e.to_string())));
                Ok(StreamOpen::Streaming(Box::pin(body)))
            }
            StreamDisposition::Fallback => {
                tracing::debug!(
                    status,
                    content_type = content_type.as_deref().unwrap_or("<none>"),
                    "streaming endpoint unusable"
                );
                Ok(StreamOpen::Unavailable {
                    status: Some(status),
                })
            }
            StreamDisposition::Fail => Err(api_error(response).await),
        }
    }

    async fn complete(&self, request: &ChatRequest) -> Result<DonePayload> {
        let response = self.build_complete_request(request).send().await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl TraceSource for HttpBackend {
    async fn conversation_traces(&self, conversation_id: &str) -> Result<Vec<TraceRecord>> {
        let response = self.build_traces_request(conversation_id).send().await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        let body: serde_json::Value = response.json().await?;
        Ok(decode_trace_list(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatTurn, Role, SessionId};

    fn request() -> ChatRequest {
        ChatRequest {
            conversation_id: SessionId::from_existing("conv-9"),
            agent_config_id: Some(3),
            messages: vec![ChatTurn::new(Role::User, "hi")],
        }
    }

    #[test]
    fn test_classify_event_stream() {
        assert_eq!(
            classify_stream_response(200, Some("text/event-stream; charset=utf-8")),
            StreamDisposition::Read
        );
    }

    #[test]
    fn test_classify_fallback_statuses() {
        for status in FALLBACK_STATUSES {
            assert_eq!(
                classify_stream_response(status, Some("text/event-stream")),
                StreamDisposition::Fallback
            );
        }
    }

    #[test]
    fn test_classify_non_stream_body_falls_back() {
        assert_eq!(
            classify_stream_response(200, Some("application/json")),
            StreamDisposition::Fallback
        );
        assert_eq!(classify_stream_response(200, None), StreamDisposition::Fallback);
    }

    #[test]
    fn test_classify_server_error_fails() {
        assert_eq!(
            classify_stream_response(500, Some("text/event-stream")),
            StreamDisposition::Fail
        );
        assert_eq!(classify_stream_response(401, None), StreamDisposition::Fail);
    }

    #[test]
    fn test_stream_request_shape() {
        let backend = HttpBackend::new("http://localhost:8000/").unwrap();
        let built = backend.build_stream_request(&request()).build().unwrap();
        assert_eq!(built.method(), "POST");
        assert_eq!(built.url().as_str(), "http://localhost:8000/api/chat/stream");
        assert_eq!(built.headers()["accept"], "text/event-stream");
    }

    #[test]
    fn test_traces_request_query() {
        let backend = HttpBackend::new("https://dash.example.com").unwrap();
        let built = backend.build_traces_request("conv 1").build().unwrap();
        assert_eq!(built.method(), "GET");
        assert_eq!(built.url().path(), "/api/traces");
        let query = built.url().query().unwrap();
        assert!(query.contains("conversation_id=conv+1"), "got {}", query);
        assert!(query.contains("limit=1000"));
    }

    #[test]
    fn test_rejects_bad_base_url() {
        assert!(matches!(
            HttpBackend::new("localhost:8000"),
            Err(Error::InvalidConfig(_))
        ));
    }
}
