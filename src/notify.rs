//! Severity-tagged notifications: always logged, optionally mirrored to a
//! Telegram chat. Delivery failures are logged and never surfaced to callers.

use once_cell::sync::Lazy;
use serde_json::json;
use std::env;
use std::sync::Arc;
use std::time::Duration;

static NOTIFIER: Lazy<Arc<Notifier>> = Lazy::new(|| Arc::new(Notifier::from_env()));

const TELEGRAM_CHUNK_CHARS: usize = 1_900;
const TELEGRAM_SEND_ATTEMPTS: u32 = 3;
const TELEGRAM_RETRY_DELAY_SECS: u64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
    Debug,
}

impl Severity {
    fn emoji(self) -> &'static str {
        match self {
            Severity::Info => "ℹ️",
            Severity::Success => "✅",
            Severity::Warning => "⚠️",
            Severity::Error => "❌",
            Severity::Debug => "⚙️",
        }
    }
}

/// Logs `text` at the matching level and pushes it to the configured chat.
pub fn notify(severity: Severity, text: impl Into<String>) {
    let text = text.into();
    match severity {
        Severity::Info | Severity::Success => log::info!("{}", text),
        Severity::Warning => log::warn!("{}", text),
        Severity::Error => log::error!("{}", text),
        Severity::Debug => log::debug!("{}", text),
    }
    NOTIFIER.push(severity, text);
}

/// Same as `notify` but skips the chat push; for chatty periodic lines.
pub fn notify_quiet(severity: Severity, text: impl Into<String>) {
    let text = text.into();
    match severity {
        Severity::Info | Severity::Success => log::info!("{}", text),
        Severity::Warning => log::warn!("{}", text),
        Severity::Error => log::error!("{}", text),
        Severity::Debug => log::debug!("{}", text),
    }
}

struct Notifier {
    bot_token: Option<String>,
    chat_id: Option<String>,
    http: reqwest::Client,
}

impl Notifier {
    fn from_env() -> Self {
        let bot_token = env::var("TG_BOT_TOKEN").ok().filter(|v| !v.trim().is_empty());
        let chat_id = env::var("TG_CHAT_ID").ok().filter(|v| !v.trim().is_empty());
        if bot_token.is_none() || chat_id.is_none() {
            log::warn!("[NOTIFY] Telegram credentials not set; chat notifications disabled");
        }
        Self {
            bot_token,
            chat_id,
            http: reqwest::Client::new(),
        }
    }

    fn push(self: &Arc<Self>, severity: Severity, text: String) {
        let (Some(_), Some(_)) = (&self.bot_token, &self.chat_id) else {
            return;
        };
        // Fire and forget; the calling operation must never block or fail on
        // notification delivery.
        let notifier = Arc::clone(self);
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn(async move {
            let message = format!("{} {}", severity.emoji(), text.trim_start_matches('\n'));
            notifier.deliver(&message).await;
        });
    }

    async fn deliver(&self, message: &str) {
        let (Some(token), Some(chat_id)) = (&self.bot_token, &self.chat_id) else {
            return;
        };
        let url = format!("https://api.telegram.org/bot{}/sendMessage", token);
        for chunk in chunk_message(message) {
            let mut delivered = false;
            for attempt in 1..=TELEGRAM_SEND_ATTEMPTS {
                let result = self
                    .http
                    .post(&url)
                    .json(&json!({
                        "chat_id": chat_id,
                        "text": chunk,
                        "disable_web_page_preview": true,
                    }))
                    .send()
                    .await;
                match result {
                    Ok(response) if response.status().is_success() => {
                        delivered = true;
                        break;
                    }
                    Ok(response) => {
                        log::warn!(
                            "[NOTIFY] Telegram push failed ({}/{}): <{}>",
                            attempt,
                            TELEGRAM_SEND_ATTEMPTS,
                            response.status()
                        );
                    }
                    Err(err) => {
                        log::warn!(
                            "[NOTIFY] Telegram push failed ({}/{}): {}",
                            attempt,
                            TELEGRAM_SEND_ATTEMPTS,
                            err
                        );
                    }
                }
                tokio::time::sleep(Duration::from_secs(TELEGRAM_RETRY_DELAY_SECS)).await;
            }
            if !delivered {
                return;
            }
        }
    }
}

fn chunk_message(message: &str) -> Vec<String> {
    let chars: Vec<char> = message.chars().collect();
    chars
        .chunks(TELEGRAM_CHUNK_CHARS)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_messages_stay_in_one_chunk() {
        let chunks = chunk_message("hello");
        assert_eq!(chunks, vec!["hello".to_string()]);
    }

    #[test]
    fn long_messages_split_on_char_boundaries() {
        let message = "x".repeat(TELEGRAM_CHUNK_CHARS * 2 + 5);
        let chunks = chunk_message(&message);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chars().count(), TELEGRAM_CHUNK_CHARS);
        assert_eq!(chunks[2].chars().count(), 5);
    }
}
