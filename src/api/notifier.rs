use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::models::MoversResult;

const MAX_MESSAGE_CHARS: usize = 4_000;
const SEND_SPACING_MS: u64 = 400;

#[derive(Clone)]
struct ChatCredentials {
    token: String,
    chat_id: String,
}

/// Chat-channel notifier. A silent no-op when credentials are absent.
///
/// Long messages are split on line boundaries into chunks of at most 4000
/// characters, and consecutive sends are paced at least 400 ms apart.
#[derive(Clone)]
pub struct ChatNotifier {
    client: Client,
    credentials: Option<ChatCredentials>,
    last_send: Arc<Mutex<Option<Instant>>>,
}

impl ChatNotifier {
    pub fn new(token: Option<String>, chat_id: Option<String>) -> Self {
        let credentials = match (token, chat_id) {
            (Some(token), Some(chat_id)) if !token.is_empty() && !chat_id.is_empty() => {
                Some(ChatCredentials { token, chat_id })
            }
            _ => None,
        };

        if credentials.is_none() {
            tracing::info!("Chat notifier disabled (credentials not configured)");
        }

        Self {
            client: Client::new(),
            credentials,
            last_send: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.credentials.is_some()
    }

    /// Send a (possibly multi-chunk) message. Failures are surfaced but the
    /// caller typically just logs them; notifications are best-effort.
    pub async fn send(&self, text: &str) -> Result<()> {
        let Some(credentials) = self.credentials.clone() else {
            return Ok(());
        };

        for chunk in split_message(text, MAX_MESSAGE_CHARS) {
            self.pace().await;
            self.post_chunk(&credentials, &chunk).await?;
        }
        Ok(())
    }

    /// Wait until at least the pacing interval has passed since the previous
    /// send. The lock is held across the sleep so concurrent sends queue up.
    async fn pace(&self) {
        let mut last = self.last_send.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            let spacing = Duration::from_millis(SEND_SPACING_MS);
            if elapsed < spacing {
                tokio::time::sleep(spacing - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn post_chunk(&self, credentials: &ChatCredentials, text: &str) -> Result<()> {
        let url = format!(
            "https://api.telegram.org/bot{}/sendMessage",
            credentials.token
        );
        let body = json!({
            "chat_id": credentials.chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("Failed to send chat message")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Chat API error ({}): {}", status, body);
        }
        Ok(())
    }
}

/// Split on line boundaries into chunks of at most `max_chars` characters.
/// A single oversized line is hard-split on character boundaries.
fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;

    let flush = |current: &mut String, current_chars: &mut usize, chunks: &mut Vec<String>| {
        if !current.is_empty() {
            chunks.push(std::mem::take(current));
            *current_chars = 0;
        }
    };

    for line in text.lines() {
        let line_chars = line.chars().count();

        if line_chars > max_chars {
            flush(&mut current, &mut current_chars, &mut chunks);
            let pieces: Vec<char> = line.chars().collect();
            for piece in pieces.chunks(max_chars) {
                chunks.push(piece.iter().collect());
            }
            continue;
        }

        let separator = if current.is_empty() { 0 } else { 1 };
        if current_chars + separator + line_chars > max_chars {
            flush(&mut current, &mut current_chars, &mut chunks);
        }

        if !current.is_empty() {
            current.push('\n');
            current_chars += 1;
        }
        current.push_str(line);
        current_chars += line_chars;
    }

    flush(&mut current, &mut current_chars, &mut chunks);
    chunks
}

/// Human-readable per-cycle summary of the aggregated movers board.
pub fn format_movers_message(result: &MoversResult) -> String {
    let mut lines = vec!["Top movers".to_string()];

    for (rank, aggregated) in result.aggregated_top.iter().enumerate() {
        let entry = &aggregated.entry;
        let flow = entry
            .flow_percent
            .map(|pct| format!(" flow {:.1}%", pct))
            .unwrap_or_default();
        lines.push(format!(
            "{}. {} [{}] {:+.2}% score {:.3}{}",
            rank + 1,
            entry.symbol,
            aggregated.timeframe,
            entry.change_percent,
            entry.scores.final_score,
            flow,
        ));
    }

    if result.aggregated_top.is_empty() {
        lines.push("(no candidates this cycle)".to_string());
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_without_credentials() {
        let notifier = ChatNotifier::new(None, None);
        assert!(!notifier.is_enabled());

        let notifier = ChatNotifier::new(Some("token".to_string()), None);
        assert!(!notifier.is_enabled());

        let notifier = ChatNotifier::new(Some("token".to_string()), Some("42".to_string()));
        assert!(notifier.is_enabled());
    }

    #[tokio::test]
    async fn test_send_without_credentials_is_noop() {
        let notifier = ChatNotifier::new(None, None);
        notifier.send("hello").await.unwrap();
    }

    #[test]
    fn test_split_short_message() {
        let chunks = split_message("line one\nline two", 4_000);
        assert_eq!(chunks, vec!["line one\nline two".to_string()]);
    }

    #[test]
    fn test_split_on_line_boundaries() {
        let text = "aaaa\nbbbb\ncccc";
        let chunks = split_message(text, 9);

        assert_eq!(chunks, vec!["aaaa\nbbbb".to_string(), "cccc".to_string()]);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 9);
        }
    }

    #[test]
    fn test_split_oversized_line() {
        let text = "x".repeat(25);
        let chunks = split_message(&text, 10);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 10);
        assert_eq!(chunks[2].len(), 5);
    }

    #[test]
    fn test_empty_message_has_no_chunks() {
        assert!(split_message("", 10).is_empty());
    }
}
