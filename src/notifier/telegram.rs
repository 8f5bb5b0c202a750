use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use serde::Deserialize;

use crate::error::NotifyError;
use crate::notifier::Notifier;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Delivers alerts through the Telegram Bot API.
pub struct TelegramNotifier {
    client: reqwest::Client,
    token: String,
}

impl TelegramNotifier {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: token.into(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{TELEGRAM_API_BASE}/bot{}/{method}", self.token)
    }
}

impl Notifier for TelegramNotifier {
    fn send(
        &self,
        channel_id: i64,
        text: &str,
    ) -> BoxFuture<'_, Result<(), Report<NotifyError>>> {
        let text = text.to_owned();
        Box::pin(async move {
            let response = self
                .client
                .post(self.method_url("sendMessage"))
                .json(&serde_json::json!({
                    "chat_id": channel_id,
                    "text": text,
                }))
                .send()
                .await
                .change_context(NotifyError::Transport)?;

            let status = response.status();
            let body: TelegramResponse = response
                .json()
                .await
                .change_context(NotifyError::Transport)?;

            if !body.ok {
                return Err(Report::new(NotifyError::Rejected {
                    description: body
                        .description
                        .unwrap_or_else(|| format!("HTTP status: {status}")),
                }));
            }
            Ok(())
        })
    }
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    description: Option<String>,
}
