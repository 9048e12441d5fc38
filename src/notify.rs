//! Event publication. The capture paths hand a formatted text event to the
//! [EventRouter]; delivery is fire-and-forget so a slow webhook never blocks
//! the reply to the attacker.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, warn};
use serde_json::json;
use url::Url;

/// Go's time.RFC850 layout, which frames the event log
const RFC850_FORMAT: &str = "%A, %d-%b-%y %H:%M:%S UTC";

/// Something that can publish a text event somewhere a human will see it.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, text: &str);
    fn name(&self) -> &str;
}

/// Posts `{"username": "knary", "icon_emoji": ":bird:", "text": ...}` to a
/// webhook URL. Slack-shaped, which Discord (`/slack` suffix) and most
/// compatible receivers accept.
pub struct WebhookSink {
    label: String,
    url: Url,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(label: &str, url: Url) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            label: label.to_string(),
            url,
            client,
        }
    }
}

#[async_trait]
impl EventSink for WebhookSink {
    async fn publish(&self, text: &str) {
        let body = json!({
            "username": "knary",
            "icon_emoji": ":bird:",
            "text": text,
        });
        if let Err(error) = self.client.post(self.url.clone()).json(&body).send().await {
            // never propagated, the interaction reply must not care
            error!("Failed to post to {}: {error}", self.label);
        }
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// Fans one event out to every configured sink on its own task.
#[derive(Clone, Default)]
pub struct EventRouter {
    sinks: Arc<Vec<Box<dyn EventSink>>>,
}

impl EventRouter {
    pub fn new(sinks: Vec<Box<dyn EventSink>>) -> Self {
        Self {
            sinks: Arc::new(sinks),
        }
    }

    pub fn from_webhooks(webhooks: &[(String, Url)]) -> Self {
        let sinks: Vec<Box<dyn EventSink>> = webhooks
            .iter()
            .map(|(label, url)| {
                Box::new(WebhookSink::new(label, url.clone())) as Box<dyn EventSink>
            })
            .collect();
        Self::new(sinks)
    }

    /// Non-blocking publish to all sinks.
    pub fn publish(&self, text: impl Into<String>) {
        let text = text.into();
        debug!("event: {text}");
        let sinks = self.sinks.clone();
        tokio::spawn(async move {
            for sink in sinks.iter() {
                sink.publish(&text).await;
            }
        });
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }
}

/// The append-only text log of interactions, framed as
/// `[<RFC 850 timestamp>]\n<line>`. Unset path means no log.
#[derive(Clone, Default)]
pub struct EventLog {
    path: Option<PathBuf>,
}

impl EventLog {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn write(&self, message: &str) {
        let Some(path) = &self.path else {
            return;
        };
        let mut framed = format!("[{}]\n{}", Utc::now().format(RFC850_FORMAT), message);
        if !framed.ends_with('\n') {
            framed.push('\n');
        }
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| file.write_all(framed.as_bytes()));
        if let Err(error) = result {
            warn!("Failed to append to event log {path:?}: {error}");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_log_framing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("knary.log");
        let log = EventLog::new(Some(path.clone()));
        log.write("198.51.100.1:5353 - a.ex.com.");
        log.write("second line\n");

        let contents = std::fs::read_to_string(&path).expect("log exists");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("UTC]"));
        assert_eq!(lines[1], "198.51.100.1:5353 - a.ex.com.");
        assert_eq!(lines[3], "second line");
    }

    #[test]
    fn test_event_log_without_path_is_a_noop() {
        let log = EventLog::new(None);
        log.write("nothing happens");
    }

    #[tokio::test]
    async fn test_router_fan_out() {
        let sink = Arc::new(test_sink::MemorySink::default());
        // keep a handle for assertions alongside the boxed one
        struct Fwd(Arc<test_sink::MemorySink>);
        #[async_trait]
        impl EventSink for Fwd {
            async fn publish(&self, text: &str) {
                self.0.publish(text).await
            }
            fn name(&self) -> &str {
                "fwd"
            }
        }
        let router = EventRouter::new(vec![Box::new(Fwd(sink.clone()))]);
        router.publish("hello");
        // publish is fire-and-forget, give the task a beat
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let events = sink.events.lock().expect("lock poisoned");
        assert_eq!(events.as_slice(), ["hello".to_string()]);
    }
}
