use std::future::Future;
use std::time::Duration;

use estimate_ledger_core::{
    decode_versions, EstimateVersion, LedgerError, ParentKey, VersionedRecord,
};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_ESTIMATES_PATH: &str = "/api/estimates";
pub const DEFAULT_LIST_ACTION: &str = "getAll";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

const FALLBACK_FAILURE_MESSAGE: &str = "request was not successful";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("application error: {0}")]
    Application(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("validation error: {0}")]
    Validation(String),
}

/// Where a failure originated, for deciding how it is surfaced.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    Application,
    Validation,
}

impl ClientError {
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Transport(_) | Self::Status { .. } | Self::Decode(_) => FailureKind::Network,
            Self::Application(_) => FailureKind::Application,
            Self::Validation(_) => FailureKind::Validation,
        }
    }
}

impl From<LedgerError> for ClientError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Validation(message) => Self::Validation(message),
            LedgerError::Decode(message) => Self::Decode(message),
        }
    }
}

#[derive(Debug, Serialize)]
struct ActionRequest<'a, P>
where
    P: Serialize + ?Sized,
{
    action: &'a str,
    payload: &'a P,
}

/// Response body shared by every backend action: `{ success, result?, error? }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ActionEnvelope {
    #[serde(default)]
    pub success: Value,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl ActionEnvelope {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.success == Value::Bool(true)
    }

    /// Unwrap `result`, treating anything but `success: true` as an application failure.
    ///
    /// # Errors
    /// Returns [`ClientError::Application`] carrying the server message, or a generic
    /// fallback when the server sent none.
    pub fn into_result(self) -> Result<Value, ClientError> {
        if self.is_success() {
            return Ok(self.result.unwrap_or(Value::Null));
        }
        Err(ClientError::Application(failure_message(self.error.as_ref())))
    }
}

fn failure_message(error: Option<&Value>) -> String {
    match error {
        Some(Value::String(message)) if !message.trim().is_empty() => message.clone(),
        Some(Value::Null | Value::String(_)) | None => FALLBACK_FAILURE_MESSAGE.to_string(),
        Some(other) => other.to_string(),
    }
}

/// Body returned by the upload endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    pub url: String,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
}

impl UploadReceipt {
    /// Decode `{ success, url, thumbnailUrl? }`.
    ///
    /// # Errors
    /// Returns [`ClientError::Application`] when `success` is not `true`, or
    /// [`ClientError::Decode`] when a successful body has no `url`.
    pub fn from_response(body: Value) -> Result<Self, ClientError> {
        if body.get("success") != Some(&Value::Bool(true)) {
            return Err(ClientError::Application(failure_message(body.get("error"))));
        }
        serde_json::from_value(body)
            .map_err(|err| ClientError::Decode(format!("invalid upload response: {err}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub base_url: String,
    pub estimates_path: String,
    pub list_action: String,
    pub timeout: Duration,
}

impl ClientConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            estimates_path: DEFAULT_ESTIMATES_PATH.to_string(),
            list_action: DEFAULT_LIST_ACTION.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

/// Anything that can list every stored revision of an estimate.
pub trait VersionSource: Send + Sync {
    fn fetch_versions(
        &self,
        parent_key: &ParentKey,
    ) -> impl Future<Output = Result<Vec<EstimateVersion>, ClientError>> + Send;
}

/// JSON action client for the back-office API.
#[derive(Debug, Clone)]
pub struct BackendClient {
    client: Client,
    base_url: String,
    estimates_path: String,
    list_action: String,
}

impl BackendClient {
    /// Build a client with the configured request timeout.
    ///
    /// # Errors
    /// Returns [`ClientError::Transport`] when the HTTP client cannot be constructed.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            estimates_path: config.estimates_path,
            list_action: config.list_action,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// POST `{ action, payload }` to `path` and unwrap the response envelope.
    ///
    /// # Errors
    /// Returns [`ClientError::Transport`] or [`ClientError::Status`] for network
    /// failures, [`ClientError::Decode`] for a malformed envelope, and
    /// [`ClientError::Application`] when the server reports `success != true`.
    pub async fn post_action<P>(
        &self,
        path: &str,
        action: &str,
        payload: &P,
    ) -> Result<Value, ClientError>
    where
        P: Serialize + ?Sized,
    {
        let url = self.url(path);
        tracing::debug!(%url, action, "posting backend action");

        let response =
            self.client.post(&url).json(&ActionRequest { action, payload }).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // Size only; bodies may carry customer data.
            tracing::debug!(%status, bytes = body.len(), "backend returned error status");
            return Err(ClientError::Status { status, body });
        }

        let envelope: ActionEnvelope = response
            .json()
            .await
            .map_err(|err| ClientError::Decode(format!("invalid response envelope: {err}")))?;
        envelope.into_result()
    }

    /// Fetch every stored revision for `parent_key` through the list action.
    ///
    /// # Errors
    /// Propagates [`BackendClient::post_action`] failures, and returns
    /// [`ClientError::Decode`] when `result` is not an array of estimates.
    pub async fn list_versions(
        &self,
        parent_key: &ParentKey,
    ) -> Result<Vec<EstimateVersion>, ClientError> {
        let payload = serde_json::json!({ "estimateNumber": parent_key.as_str() });
        let result = self.post_action(&self.estimates_path, &self.list_action, &payload).await?;
        let versions = decode_versions(result)?;
        tracing::debug!(
            estimate = %parent_key,
            versions = versions.len(),
            "listed estimate versions"
        );
        Ok(versions)
    }

    /// Validate `record` locally, then submit it. Invalid records never reach the network.
    ///
    /// # Errors
    /// Returns [`ClientError::Validation`] for a record missing required fields, otherwise
    /// any [`BackendClient::post_action`] failure.
    pub async fn submit<R>(
        &self,
        path: &str,
        action: &str,
        record: &R,
    ) -> Result<Value, ClientError>
    where
        R: VersionedRecord + Serialize,
    {
        record.validate_for_submit()?;
        self.post_action(path, action, record).await
    }
}

impl VersionSource for BackendClient {
    fn fetch_versions(
        &self,
        parent_key: &ParentKey,
    ) -> impl Future<Output = Result<Vec<EstimateVersion>, ClientError>> + Send {
        self.list_versions(parent_key)
    }
}
