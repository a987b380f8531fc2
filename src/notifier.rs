use async_trait::async_trait;

/// Outbound alert channel, decoupled from the core. The executor and
/// decision loop hold a `Box<dyn Notifier>`; neither depends on a concrete
/// transport.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_high(&self, message: &str);
    async fn notify_critical(&self, message: &str);
}

/// Used when no transport is configured.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify_high(&self, message: &str) {
        log::debug!("notify(high, no transport configured): {message}");
    }

    async fn notify_critical(&self, message: &str) {
        log::warn!("notify(critical, no transport configured): {message}");
    }
}

/// Sends alerts to a Telegram chat via long-poll bot API, matching the
/// companion notification bot's HTTP shape.
pub struct TelegramNotifier {
    client: reqwest::Client,
    token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(token: String, chat_id: String) -> Self {
        TelegramNotifier { client: reqwest::Client::new(), token, chat_id }
    }

    async fn send(&self, text: &str) {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let result = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "chat_id": self.chat_id, "text": text }))
            .send()
            .await;
        if let Err(e) = result {
            log::error!("failed to deliver telegram notification: {e}");
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify_high(&self, message: &str) {
        self.send(&format!("[HIGH] {message}")).await;
    }

    async fn notify_critical(&self, message: &str) {
        self.send(&format!("[CRITICAL] {message}")).await;
    }
}
