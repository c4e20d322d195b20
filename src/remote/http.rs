use std::error::Error as _;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::{AccountMode, Challenge, RemoteAuthApi, SessionValidation, VerifyResult};
use crate::error::{Error, NetworkError, SessionError};

/// `reqwest` client for the remote authentication API.
#[derive(Debug, Clone)]
pub struct HttpAuthApi {
    base_url: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponse {
    token: String,
    #[serde(default)]
    user: Value,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct DisconnectResponse {
    #[serde(default)]
    success: bool,
}

impl HttpAuthApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, Error> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NetworkError::Unreachable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(base_url, client))
    }

    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl RemoteAuthApi for HttpAuthApi {
    async fn challenge(&self, address: &str) -> Result<Challenge, Error> {
        let response = self
            .client
            .post(self.url("/auth/challenge"))
            .json(&json!({ "address": address }))
            .send()
            .await
            .map_err(transport_error)?;
        decode(check_status(response, false).await?).await
    }

    async fn verify(
        &self,
        message: &str,
        signature: &str,
        account_mode: AccountMode,
    ) -> Result<VerifyResult, Error> {
        let response = self
            .client
            .post(self.url("/auth/verify"))
            .json(&json!({
                "message": message,
                "signature": signature,
                "accountMode": account_mode,
            }))
            .send()
            .await
            .map_err(transport_error)?;
        let body: VerifyResponse = decode(check_status(response, false).await?).await?;
        if body.token.trim().is_empty() {
            return Err(NetworkError::Decode("verify response carried an empty token".into()).into());
        }
        Ok(VerifyResult {
            token: SecretString::from(body.token),
            user: body.user,
            expires_at: body.expires_at,
        })
    }

    async fn validate_session(&self, token: &SecretString) -> Result<SessionValidation, Error> {
        let response = self
            .client
            .get(self.url("/auth/session"))
            .bearer_auth(token.expose_secret())
            .send()
            .await
            .map_err(transport_error)?;
        decode(check_status(response, true).await?).await
    }

    async fn disconnect(&self, token: &SecretString) -> Result<bool, Error> {
        let response = self
            .client
            .post(self.url("/auth/disconnect"))
            .bearer_auth(token.expose_secret())
            .send()
            .await
            .map_err(transport_error)?;
        let body: DisconnectResponse = decode(check_status(response, true).await?).await?;
        Ok(body.success)
    }
}

/// Map non-2xx statuses to errors. On session-bound calls a 401 means the
/// token itself is no longer accepted.
async fn check_status(response: Response, session_bound: bool) -> Result<Response, Error> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if session_bound && status == StatusCode::UNAUTHORIZED {
        return Err(SessionError::Invalid.into());
    }
    let body = response.text().await.unwrap_or_default();
    Err(NetworkError::Rejected {
        status: status.as_u16(),
        message: rejection_message(&body, status),
    }
    .into())
}

fn rejection_message(body: &str, status: StatusCode) -> String {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|v| {
        v.get("error")
            .or_else(|| v.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    match from_json {
        Some(message) => message,
        None if !body.trim().is_empty() => body.trim().chars().take(200).collect(),
        None => status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string(),
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, Error> {
    response
        .json::<T>()
        .await
        .map_err(|e| NetworkError::Decode(e.to_string()).into())
}

fn transport_error(error: reqwest::Error) -> Error {
    NetworkError::Unreachable(classify_transport_error(&error)).into()
}

fn classify_transport_error(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        return "request timed out".to_string();
    }

    let mut source = error.source();
    while let Some(err) = source {
        if let Some(io_error) = err.downcast_ref::<std::io::Error>() {
            return match io_error.kind() {
                std::io::ErrorKind::ConnectionRefused => "connection refused".to_string(),
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted => {
                    "connection reset".to_string()
                }
                _ => format!("connect failure: {io_error}"),
            };
        }
        source = err.source();
    }

    let lowered = error.to_string().to_ascii_lowercase();
    if lowered.contains("dns")
        || lowered.contains("lookup")
        || lowered.contains("name or service not known")
        || lowered.contains("no such host")
    {
        "dns failure".to_string()
    } else {
        format!("connect failure: {error}")
    }
}
