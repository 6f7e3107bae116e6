//! Run status publication.

use async_trait::async_trait;
use recon_core::Notification;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::HttpClientConfig;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("publishing notification: {0}")]
    Request(#[from] reqwest::Error),
    #[error("notification endpoint {url} answered http status {status}")]
    HttpStatus { status: u16, url: String },
    #[error(transparent)]
    Client(#[from] anyhow::Error),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(
        &self,
        destination: &str,
        notification: &Notification,
    ) -> Result<(), NotifyError>;
}

/// Posts `{subject, message}` as JSON to the destination URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(config: &HttpClientConfig) -> Result<Self, NotifyError> {
        Ok(Self {
            client: config.build_client()?,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn publish(
        &self,
        destination: &str,
        notification: &Notification,
    ) -> Result<(), NotifyError> {
        let resp = self.client.post(destination).json(notification).send().await?;
        let status = resp.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), destination, "notification rejected");
            return Err(NotifyError::HttpStatus {
                status: status.as_u16(),
                url: destination.to_string(),
            });
        }
        info!(
            destination,
            status = notification.status().label(),
            subject = notification.subject(),
            "published notification"
        );
        Ok(())
    }
}

/// Writes the notification to the log only; used when no endpoints are configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn publish(
        &self,
        destination: &str,
        notification: &Notification,
    ) -> Result<(), NotifyError> {
        let message = render_message(notification.message());
        info!(
            destination,
            subject = notification.subject(),
            %message,
            "notification"
        );
        Ok(())
    }
}

fn render_message(message: &impl Serialize) -> String {
    serde_json::to_string(message).unwrap_or_else(|err| format!("<unserializable: {err}>"))
}
