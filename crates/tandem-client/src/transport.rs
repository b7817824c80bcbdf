//! Transports carrying the collaboration protocol.

use crate::error::{ClientError, RequestError, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tandem_server::{
    ApiError, DocSnapshot, EventsResponse, InstanceInfo, PollResult, Registry, SubmitEvents,
    Versions,
};
use tracing::debug;

/// Operations an editor connection needs from the server.
#[async_trait]
pub trait CollabTransport: Send + Sync + 'static {
    /// Fetch the full document state.
    async fn fetch_doc(&self) -> std::result::Result<DocSnapshot, RequestError>;

    /// Long-poll for events after the given versions. An empty response
    /// means the poll timed out.
    async fn poll_events(
        &self,
        version: u64,
        comment_version: u64,
    ) -> std::result::Result<EventsResponse, RequestError>;

    /// Submit steps and comment events.
    async fn send_events(&self, submit: &SubmitEvents) -> std::result::Result<Versions, RequestError>;
}

/// Talks to a server over HTTP.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    docs_url: Url,
    doc_url: Url,
}

impl HttpTransport {
    /// Connect to document `doc_id` on the server at `base`.
    pub fn new(base: &str, doc_id: &str) -> Result<Self> {
        let base = Url::parse(base).map_err(|e| ClientError::Url(format!("{base}: {e}")))?;
        Ok(Self {
            client: reqwest::Client::new(),
            docs_url: with_segments(&base, &["docs"])?,
            doc_url: with_segments(&base, &["docs", doc_id])?,
        })
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn doc_url(&self) -> &Url {
        &self.doc_url
    }

    /// List the documents the server knows about.
    pub async fn list_docs(&self) -> std::result::Result<Vec<InstanceInfo>, RequestError> {
        let response = self.client.get(self.docs_url.clone()).send().await?;
        read(response).await
    }

    fn events_url(&self) -> Url {
        let mut url = self.doc_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.push("events");
        }
        url
    }
}

fn with_segments(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| ClientError::Url(format!("{base} cannot be a base URL")))?;
        path.pop_if_empty().extend(segments);
    }
    Ok(url)
}

async fn read<T: DeserializeOwned>(
    response: reqwest::Response,
) -> std::result::Result<T, RequestError> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(RequestError::new(status.as_u16(), text));
    }
    response
        .json()
        .await
        .map_err(|e| RequestError::network(format!("invalid response: {e}")))
}

#[async_trait]
impl CollabTransport for HttpTransport {
    async fn fetch_doc(&self) -> std::result::Result<DocSnapshot, RequestError> {
        let response = self.client.get(self.doc_url.clone()).send().await?;
        read(response).await
    }

    async fn poll_events(
        &self,
        version: u64,
        comment_version: u64,
    ) -> std::result::Result<EventsResponse, RequestError> {
        let response = self
            .client
            .get(self.events_url())
            .query(&[("version", version), ("commentVersion", comment_version)])
            .send()
            .await?;
        read(response).await
    }

    async fn send_events(&self, submit: &SubmitEvents) -> std::result::Result<Versions, RequestError> {
        debug!(
            version = submit.version,
            steps = submit.steps.len(),
            comments = submit.comment.len(),
            "submitting events"
        );
        let response = self
            .client
            .post(self.events_url())
            .json(submit)
            .send()
            .await?;
        read(response).await
    }
}

/// Talks to a registry in the same process, with the same status codes and
/// messages the HTTP layer would produce.
#[derive(Clone)]
pub struct LocalTransport {
    registry: Arc<Registry>,
    doc_id: String,
    client_key: String,
}

impl LocalTransport {
    pub fn new(registry: Arc<Registry>, doc_id: impl Into<String>, client_key: impl Into<String>) -> Self {
        Self {
            registry,
            doc_id: doc_id.into(),
            client_key: client_key.into(),
        }
    }
}

impl From<ApiError> for RequestError {
    fn from(err: ApiError) -> Self {
        RequestError::new(err.status().as_u16(), err.to_string())
    }
}

#[async_trait]
impl CollabTransport for LocalTransport {
    async fn fetch_doc(&self) -> std::result::Result<DocSnapshot, RequestError> {
        Ok(self.registry.snapshot(&self.doc_id, &self.client_key))
    }

    async fn poll_events(
        &self,
        version: u64,
        comment_version: u64,
    ) -> std::result::Result<EventsResponse, RequestError> {
        let result = self
            .registry
            .poll_events(&self.doc_id, &self.client_key, version, comment_version)
            .await
            .map_err(ApiError::from)?;
        match result {
            PollResult::Events(events) => Ok(events.into()),
            PollResult::KeepAlive => Ok(EventsResponse::default()),
            PollResult::Gone => Err(ApiError::Gone.into()),
        }
    }

    async fn send_events(&self, submit: &SubmitEvents) -> std::result::Result<Versions, RequestError> {
        self.registry
            .add_events(&self.doc_id, &self.client_key, submit.clone())
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::Conflict.into())
    }
}
