//! Outbound HTTP surface of the dashboard service.
//!
//! Notifications and action queueing go over plain POSTs to the API base
//! derived from the websocket endpoint, authenticated with the same key as
//! the socket. Responses are discriminated unions on `type`.

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;

use crate::{
    config::{ConfigError, HostConfig},
    wire::{
        DequeueActionInputs,
        DequeueActionReturns,
        EnqueueActionInputs,
        EnqueueActionReturns,
        NotifyInputs,
        NotifyReturns,
    },
};

/// Errors surfaced by the HTTP API client.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The endpoint could not be converted into an API base.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The request could not be built or transported.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The response body was not a recognised API shape.
    #[error("received invalid API response")]
    InvalidResponse,
    /// The server answered with an error result.
    #[error("{0}")]
    Server(String),
}

/// An invocation queued for later execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedAction {
    /// Queued invocation id.
    pub id: String,
    /// Operator the invocation is assigned to.
    pub assignee: Option<String>,
    /// Params handed to the handler when the invocation starts.
    pub params: Option<Value>,
}

/// Client for the dashboard's REST API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    config: HostConfig,
}

impl ApiClient {
    /// Build a client authenticated with the configured API key.
    ///
    /// # Errors
    /// Fails when the API key is not a valid header value or the HTTP
    /// client cannot be constructed.
    pub fn new(config: HostConfig) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        let bearer = format!("Bearer {}", config.api_key);
        let mut auth = HeaderValue::from_str(&bearer)
            .map_err(|_| ApiError::Server("API key is not a valid header value".to_owned()))?;
        auth.set_sensitive(true);
        let _ = headers.insert(AUTHORIZATION, auth);
        let _ = headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let http = reqwest::Client::builder().default_headers(headers).build()?;
        Ok(Self { http, config })
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = self.config.api_url(path)?;
        let response = self.http.post(url).json(body).send().await?;
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|_| ApiError::InvalidResponse)
    }

    /// Send a notification through the organisation's channels.
    ///
    /// # Errors
    /// Fails when the request cannot be delivered or the server rejects
    /// it.
    pub async fn notify(&self, inputs: NotifyInputs) -> Result<(), ApiError> {
        match self.post::<_, NotifyReturns>("notify", &inputs).await? {
            NotifyReturns::Success {} => Ok(()),
            NotifyReturns::Error { message } => Err(ApiError::Server(format!(
                "there was a problem sending the notification: {}",
                message.unwrap_or_default()
            ))),
        }
    }

    /// Queue an action invocation.
    ///
    /// # Errors
    /// Fails when the request cannot be delivered or the server refuses
    /// to queue the invocation.
    pub async fn enqueue(
        &self,
        slug: impl Into<String> + Send,
        assignee: Option<String>,
        params: Option<Value>,
    ) -> Result<QueuedAction, ApiError> {
        let inputs = EnqueueActionInputs {
            slug: slug.into(),
            assignee: assignee.clone(),
            params: params.clone(),
        };
        match self
            .post::<_, EnqueueActionReturns>("actions/enqueue", &inputs)
            .await?
        {
            EnqueueActionReturns::Success { id } => Ok(QueuedAction {
                id,
                assignee,
                params,
            }),
            EnqueueActionReturns::Error { message } => Err(ApiError::Server(format!(
                "there was a problem enqueueing the action: {message}"
            ))),
        }
    }

    /// Remove a queued invocation.
    ///
    /// # Errors
    /// Fails when the request cannot be delivered or the invocation is
    /// not queued.
    pub async fn dequeue(&self, id: impl Into<String> + Send) -> Result<QueuedAction, ApiError> {
        let inputs = DequeueActionInputs { id: id.into() };
        match self
            .post::<_, DequeueActionReturns>("actions/dequeue", &inputs)
            .await?
        {
            DequeueActionReturns::Success {
                id,
                assignee,
                params,
            } => Ok(QueuedAction {
                id,
                assignee,
                params,
            }),
            DequeueActionReturns::Error { message } => Err(ApiError::Server(format!(
                "there was a problem dequeueing the action: {message}"
            ))),
        }
    }
}
