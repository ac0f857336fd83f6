use crate::traits::ChannelAdapter;
use crate::types::{
    BotIdentity, ChatId, InboundMessage, MessageId, OutboundBody, OutboundMessage, Sender,
    StickerRef, Update, UserId,
};
use anyhow::Result;
use chrono::Utc;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const TELEGRAM_CHANNEL_ID: &str = "telegram";
const TELEGRAM_LONG_POLL_TIMEOUT_SECS: &str = "30";
const TELEGRAM_ALLOWED_UPDATES: &str = r#"["message"]"#;
const TELEGRAM_NON_TRANSIENT_DELAY: Duration = Duration::from_secs(10);
const TELEGRAM_RETRY_BASE_MS: u64 = 250;
const TELEGRAM_RETRY_MAX_MS: u64 = 30_000;

#[derive(Clone)]
pub struct TelegramAdapter {
    http: reqwest::Client,
    bot_token: String,
    skip_pending: bool,
}

impl TelegramAdapter {
    pub fn new(bot_token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            bot_token: bot_token.to_string(),
            skip_pending: true,
        })
    }

    /// Drop updates queued while the bot was offline before polling.
    pub fn with_skip_pending(mut self, skip_pending: bool) -> Self {
        self.skip_pending = skip_pending;
        self
    }

    fn api_url(&self, method: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "https://api.telegram.org/bot{}/{}",
            self.bot_token, method
        ))?)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: serde_json::Value) -> Result<T> {
        let url = self.api_url(method)?;
        let resp = self.http.post(url).json(&body).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(anyhow::anyhow!(
                "telegram {method} failed: status={status} body={text}"
            ));
        }
        let parsed: TelegramResponse<T> = serde_json::from_str(&text)
            .map_err(|e| anyhow::anyhow!("telegram {method} payload parse failed: {e}"))?;
        parsed.into_result(method)
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn channel_id(&self) -> &str {
        TELEGRAM_CHANNEL_ID
    }

    async fn start(&self, tx: mpsc::Sender<Update>, cancel: CancellationToken) -> Result<()> {
        let adapter = self.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.run_poll_loop(tx, cancel).await {
                tracing::error!(%e, "telegram poll loop exited");
            }
        });
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(chat_id = %message.chat_id))]
    async fn send(&self, message: OutboundMessage) -> Result<()> {
        let (method, body) = build_send_request(&message);
        let _: serde_json::Value = self.call(method, body).await?;
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn sticker_set(&self, name: &str) -> Result<Vec<StickerRef>> {
        let set: TelegramStickerSet = self
            .call("getStickerSet", serde_json::json!({ "name": name }))
            .await?;
        Ok(set
            .stickers
            .into_iter()
            .map(|s| StickerRef::new(s.file_id))
            .collect())
    }

    async fn me(&self) -> Result<BotIdentity> {
        let user: TelegramUser = self.call("getMe", serde_json::json!({})).await?;
        Ok(BotIdentity {
            id: UserId::new(user.id),
            username: user.username.unwrap_or_default(),
        })
    }
}

impl TelegramAdapter {
    #[tracing::instrument(level = "info", skip_all)]
    async fn run_poll_loop(
        &self,
        tx: mpsc::Sender<Update>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut offset: i64 = 0;
        if self.skip_pending {
            offset = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                skipped = self.skip_pending_updates() => skipped.unwrap_or_else(|error| {
                    tracing::warn!(%error, "failed to skip pending telegram updates");
                    0
                }),
            };
        }
        let mut consecutive_failures: u32 = 0;

        loop {
            let url = self.api_url("getUpdates")?;
            let request = self
                .http
                .get(url)
                .query(&[
                    ("timeout", TELEGRAM_LONG_POLL_TIMEOUT_SECS),
                    ("offset", &offset.to_string()),
                    ("allowed_updates", TELEGRAM_ALLOWED_UPDATES),
                ])
                .send();
            let response = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("telegram poll loop cancelled");
                    return Ok(());
                }
                response = request => response,
            };
            let response = match response {
                Ok(response) => response,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates request failed; retrying with backoff"
                    );
                    sleep_or_cancel(delay, &cancel).await;
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_else(|error| {
                    format!("<failed to read telegram error body: {error}>")
                });
                if is_transient_status(status) {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %status,
                        %body,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates transient failure; retrying with backoff"
                    );
                    sleep_or_cancel(delay, &cancel).await;
                } else {
                    consecutive_failures = 0;
                    tracing::error!(
                        %status,
                        %body,
                        ?TELEGRAM_NON_TRANSIENT_DELAY,
                        "telegram getUpdates non-transient failure; keeping poll loop alive"
                    );
                    sleep_or_cancel(TELEGRAM_NON_TRANSIENT_DELAY, &cancel).await;
                }
                continue;
            }

            let parsed = match response.json::<TelegramResponse<Vec<TelegramUpdate>>>().await {
                Ok(parsed) => parsed,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates payload parse failed; retrying with backoff"
                    );
                    sleep_or_cancel(delay, &cancel).await;
                    continue;
                }
            };

            consecutive_failures = 0;

            let mut updates = parsed.result.unwrap_or_default();
            updates.sort_by_key(|update| update.update_id);
            for update in updates {
                // Advance offset before conversion to avoid poison-update replay loops.
                if update.update_id < offset {
                    continue;
                }
                offset = update.update_id.saturating_add(1);
                tracing::debug!(update_id = update.update_id, "received new update");

                // Blocks while the worker queue is full.
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    sent = tx.send(build_update(update)) => {
                        sent.map_err(|e| anyhow::anyhow!("telegram update queue closed: {e}"))?;
                    }
                }
            }
        }
    }

    /// Acknowledge everything queued so far and return the next offset.
    async fn skip_pending_updates(&self) -> Result<i64> {
        let latest: Vec<TelegramUpdate> = self
            .call(
                "getUpdates",
                serde_json::json!({ "offset": -1, "timeout": 0 }),
            )
            .await?;
        let next = latest
            .iter()
            .map(|u| u.update_id.saturating_add(1))
            .max()
            .unwrap_or(0);
        tracing::info!(next_offset = next, "skipped queued telegram updates");
        Ok(next)
    }
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}

fn transient_retry_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((TELEGRAM_RETRY_BASE_MS * multiplier).min(TELEGRAM_RETRY_MAX_MS))
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn build_update(update: TelegramUpdate) -> Update {
    Update {
        update_id: update.update_id,
        message: update.message.and_then(build_inbound_message),
    }
}

fn build_inbound_message(message: TelegramMessage) -> Option<InboundMessage> {
    // Channel posts carry no sender; the bot has nothing to attribute them to.
    let from = message.from?;
    Some(InboundMessage {
        message_id: MessageId::new(message.message_id),
        chat_id: ChatId::new(message.chat.id),
        sender: Sender {
            id: UserId::new(from.id),
            username: from.username,
            first_name: from.first_name,
            last_name: from.last_name,
        },
        text: message.text.unwrap_or_default(),
        reply_to_text: message
            .reply_to_message
            .map(|m| m.text.unwrap_or_default()),
        received_at: Utc::now(),
    })
}

fn build_send_request(message: &OutboundMessage) -> (&'static str, serde_json::Value) {
    let mut body = serde_json::json!({ "chat_id": message.chat_id.get() });
    if let Some(reply_to) = message.reply_to_message_id {
        let mut reply = serde_json::json!({
            "message_id": reply_to.get(),
            "allow_sending_without_reply": true,
        });
        if let Some(quote) = &message.quote {
            reply["quote"] = serde_json::json!(quote.text);
            reply["quote_position"] = serde_json::json!(quote.position);
        }
        body["reply_parameters"] = reply;
    }

    match &message.body {
        OutboundBody::Text(text) => {
            body["text"] = serde_json::json!(text);
            ("sendMessage", body)
        }
        OutboundBody::Sticker(sticker) => {
            body["sticker"] = serde_json::json!(sticker.as_str());
            ("sendSticker", body)
        }
    }
}

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    result: Option<T>,
}

impl<T> TelegramResponse<T> {
    fn into_result(self, method: &str) -> Result<T> {
        if !self.ok {
            return Err(anyhow::anyhow!(
                "telegram {method} rejected: {}",
                self.description.unwrap_or_else(|| "no description".to_string())
            ));
        }
        self.result
            .ok_or_else(|| anyhow::anyhow!("telegram {method} returned no result"))
    }
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    message_id: i64,
    #[serde(default)]
    from: Option<TelegramUser>,
    chat: TelegramChat,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    reply_to_message: Option<Box<TelegramMessage>>,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramStickerSet {
    #[serde(default)]
    stickers: Vec<TelegramSticker>,
}

#[derive(Debug, Deserialize)]
struct TelegramSticker {
    file_id: String,
}

#[cfg(test)]
mod tests {
    use super::{
        TelegramResponse, TelegramUpdate, build_send_request, build_update, transient_retry_delay,
    };
    use crate::types::{ChatId, MessageId, OutboundBody, OutboundMessage, Quote, StickerRef};
    use serde_json::json;

    #[test]
    fn retry_delay_grows_exponentially_and_caps() {
        assert_eq!(transient_retry_delay(1).as_millis(), 250);
        assert_eq!(transient_retry_delay(2).as_millis(), 500);
        assert_eq!(transient_retry_delay(3).as_millis(), 1000);
        assert_eq!(transient_retry_delay(20).as_millis(), 30000);
    }

    #[test]
    fn update_with_sender_becomes_inbound_message() {
        let raw: TelegramUpdate = serde_json::from_value(json!({
            "update_id": 10,
            "message": {
                "message_id": 5,
                "from": {"id": 42, "first_name": "Ivan", "last_name": "Petrov", "username": "ivan"},
                "chat": {"id": -100, "type": "supergroup"},
                "text": "сво",
                "reply_to_message": {
                    "message_id": 4,
                    "chat": {"id": -100, "type": "supergroup"},
                    "text": "earlier"
                }
            }
        }))
        .expect("valid update");

        let update = build_update(raw);
        assert_eq!(update.update_id, 10);
        let msg = update.message.expect("message present");
        assert_eq!(msg.chat_id, ChatId::new(-100));
        assert_eq!(msg.message_id, MessageId::new(5));
        assert_eq!(msg.sender.display_name(), "Ivan Petrov");
        assert_eq!(msg.sender.username.as_deref(), Some("ivan"));
        assert_eq!(msg.text, "сво");
        assert_eq!(msg.reply_to_text.as_deref(), Some("earlier"));
    }

    #[test]
    fn update_without_sender_or_text_is_tolerated() {
        let raw: TelegramUpdate = serde_json::from_value(json!({
            "update_id": 11,
            "message": {"message_id": 1, "chat": {"id": 5, "type": "channel"}, "text": "x"}
        }))
        .expect("valid update");
        assert!(build_update(raw).message.is_none());

        let raw: TelegramUpdate = serde_json::from_value(json!({
            "update_id": 12,
            "message": {"message_id": 2, "from": {"id": 1}, "chat": {"id": 5, "type": "private"}}
        }))
        .expect("valid update");
        let msg = build_update(raw).message.expect("message present");
        assert_eq!(msg.text, "");

        let raw: TelegramUpdate =
            serde_json::from_value(json!({"update_id": 13})).expect("valid update");
        assert!(build_update(raw).message.is_none());
    }

    #[test]
    fn quoted_text_reply_uses_send_message_with_reply_parameters() {
        let msg = OutboundMessage::text(ChatId::new(-1), "ГОООЛ")
            .reply_to(MessageId::new(9))
            .with_quote(Quote {
                text: "СВО".to_string(),
                position: 4,
            });
        let (method, body) = build_send_request(&msg);
        assert_eq!(method, "sendMessage");
        assert_eq!(body["chat_id"], -1);
        assert_eq!(body["text"], "ГОООЛ");
        assert_eq!(body["reply_parameters"]["message_id"], 9);
        assert_eq!(body["reply_parameters"]["quote"], "СВО");
        assert_eq!(body["reply_parameters"]["quote_position"], 4);
    }

    #[test]
    fn sticker_without_reply_has_no_reply_parameters() {
        let msg = OutboundMessage {
            chat_id: ChatId::new(3),
            reply_to_message_id: None,
            quote: None,
            body: OutboundBody::Sticker(StickerRef::new("file-1")),
        };
        let (method, body) = build_send_request(&msg);
        assert_eq!(method, "sendSticker");
        assert_eq!(body["sticker"], "file-1");
        assert!(body.get("reply_parameters").is_none());
    }

    #[test]
    fn rejected_api_call_surfaces_description() {
        let resp: TelegramResponse<serde_json::Value> =
            serde_json::from_value(json!({"ok": false, "description": "Bad Request: chat not found"}))
                .expect("valid envelope");
        let err = resp.into_result("sendMessage").expect_err("rejected");
        assert!(err.to_string().contains("chat not found"));
    }
}
