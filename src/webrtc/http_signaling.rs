//! HTTP implementation of the signaling contract

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::signaling::{
    CloseTracksRequest, CloseTracksResponse, NewSessionRequest, NewSessionResponse,
    RenegotiateRequest, RenegotiateResponse, SessionDescription, SignalingApi, SoftError,
    TracksRequest, TracksResponse,
};
use crate::config::SignalingConfig;
use crate::error::{AppError, Result};

/// Signaling client talking JSON over HTTPS with bearer authentication
pub struct HttpSignaling {
    client: reqwest::Client,
    api_base: String,
    app_id: String,
    token: String,
}

impl HttpSignaling {
    pub fn new(config: &SignalingConfig) -> Result<Self> {
        if config.app_id.trim().is_empty() {
            return Err(AppError::Config("signaling app id is empty".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            app_id: config.app_id.clone(),
            token: config.token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.api_base, self.app_id, path)
    }

    async fn send<B, T>(&self, method: Method, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned + SoftError,
    {
        let url = self.url(path);
        debug!("{} {}", method, url);

        let response = self
            .client
            .request(method.clone(), &url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .map_err(|e| AppError::Transport(format!("{} {} failed: {}", method, url, e)))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| AppError::Transport(format!("Failed to read {}: {}", url, e)))?;

        // Soft errors take precedence over the HTTP status
        match serde_json::from_slice::<T>(&bytes) {
            Ok(parsed) => {
                if let Some(e) = parsed.soft_error() {
                    return Err(e);
                }
                if !status.is_success() {
                    return Err(AppError::Transport(format!("{} returned HTTP {}", url, status)));
                }
                Ok(parsed)
            }
            Err(_) if !status.is_success() => Err(AppError::Transport(format!(
                "{} returned HTTP {}",
                url, status
            ))),
            Err(e) => Err(AppError::Transport(format!(
                "Invalid response from {}: {}",
                url, e
            ))),
        }
    }
}

#[async_trait]
impl SignalingApi for HttpSignaling {
    async fn new_session(&self, offer: SessionDescription) -> Result<NewSessionResponse> {
        let body = NewSessionRequest {
            session_description: offer,
        };
        self.send(Method::POST, "sessions/new", &body).await
    }

    async fn new_tracks(&self, session_id: &str, request: TracksRequest) -> Result<TracksResponse> {
        self.send(
            Method::POST,
            &format!("sessions/{}/tracks/new", session_id),
            &request,
        )
        .await
    }

    async fn renegotiate(&self, session_id: &str, answer: SessionDescription) -> Result<()> {
        let body = RenegotiateRequest {
            session_description: answer,
        };
        let _: RenegotiateResponse = self
            .send(
                Method::PUT,
                &format!("sessions/{}/renegotiate", session_id),
                &body,
            )
            .await?;
        Ok(())
    }

    async fn close_tracks(
        &self,
        session_id: &str,
        request: CloseTracksRequest,
    ) -> Result<CloseTracksResponse> {
        self.send(
            Method::PUT,
            &format!("sessions/{}/tracks/close", session_id),
            &request,
        )
        .await
    }
}
