//! Outbound workspace events.
//!
//! Publishing is fire-and-forget from the caller's point of view: the write
//! path goes through [`publish_best_effort`], which logs delivery failures and
//! never returns them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::config::EventsConfig;
use crate::error::NotificationDeliveryError;

/// Name of the event emitted after a workspace is created or updated in master.
pub const WORKSPACE_UPSERTED: &str = "workspace.upserted";

#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one event.
    ///
    /// # Errors
    /// Any transport or endpoint failure.
    async fn publish(&self, event: &str, payload: &Value) -> Result<(), NotificationDeliveryError>;
}

/// Sink that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn publish(&self, event: &str, _payload: &Value) -> Result<(), NotificationDeliveryError> {
        tracing::trace!(event, "event publishing disabled");
        Ok(())
    }
}

/// Posts `{event, payload}` as JSON to a fixed endpoint.
#[derive(Debug, Clone)]
pub struct HttpEventSink {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpEventSink {
    /// # Errors
    /// `Http` if the client cannot be built.
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, NotificationDeliveryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }
}

#[async_trait]
impl EventSink for HttpEventSink {
    async fn publish(&self, event: &str, payload: &Value) -> Result<(), NotificationDeliveryError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "event": event, "payload": payload }));
        if let Some(key) = &self.api_key {
            request = request.header("X-Api-Key", key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotificationDeliveryError::Status(status.as_u16()));
        }
        tracing::debug!(event, endpoint = %self.endpoint, "event delivered");
        Ok(())
    }
}

/// Build the sink described by `cfg`.
///
/// # Errors
/// `NotConfigured` when events are enabled without an endpoint, `Http` when
/// the client cannot be built.
pub fn sink_from_config(cfg: &EventsConfig) -> Result<Arc<dyn EventSink>, NotificationDeliveryError> {
    if !cfg.enabled {
        return Ok(Arc::new(NoopEventSink));
    }
    let endpoint = cfg
        .endpoint
        .as_deref()
        .filter(|e| !e.is_empty())
        .ok_or(NotificationDeliveryError::NotConfigured)?;
    Ok(Arc::new(HttpEventSink::new(
        endpoint,
        cfg.api_key.clone(),
        cfg.timeout,
    )?))
}

/// Publish and log failures; never fails.
pub async fn publish_best_effort(sink: &dyn EventSink, event: &str, payload: &Value) {
    if let Err(err) = sink.publish(event, payload).await {
        tracing::warn!(event, error = %err, "event delivery failed");
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use tracing_test::traced_test;

    fn config(endpoint: Option<String>) -> EventsConfig {
        EventsConfig {
            enabled: true,
            endpoint,
            api_key: Some("secret".to_owned()),
            timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn test_http_sink_posts_event_envelope() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/events")
                    .header("X-Api-Key", "secret")
                    .json_body(json!({ "event": "workspace.upserted", "payload": { "id": 3 } }));
                then.status(202);
            })
            .await;

        let sink = sink_from_config(&config(Some(server.url("/events")))).unwrap();
        sink.publish(WORKSPACE_UPSERTED, &json!({ "id": 3 }))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_sink_reports_error_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/events");
                then.status(503);
            })
            .await;

        let sink = HttpEventSink::new(server.url("/events"), None, Duration::from_secs(2)).unwrap();
        let err = sink.publish("x", &json!({})).await.unwrap_err();
        assert!(matches!(err, NotificationDeliveryError::Status(503)));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_best_effort_logs_and_swallows_failure() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/events");
                then.status(500);
            })
            .await;

        let sink = HttpEventSink::new(server.url("/events"), None, Duration::from_secs(2)).unwrap();
        publish_best_effort(&sink, WORKSPACE_UPSERTED, &json!({})).await;

        mock.assert_async().await;
        assert!(logs_contain("event delivery failed"));
    }

    #[test]
    fn test_sink_from_config() {
        assert!(sink_from_config(&EventsConfig::default()).is_ok());
        assert!(matches!(
            sink_from_config(&config(None)),
            Err(NotificationDeliveryError::NotConfigured)
        ));
        assert!(matches!(
            sink_from_config(&config(Some(String::new()))),
            Err(NotificationDeliveryError::NotConfigured)
        ));
    }
}
