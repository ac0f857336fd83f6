//! Test doubles for the transport, randomness and AI collaborators.

use crate::ai::AiResponder;
use crate::random::RandomSource;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use svoi_channels::{
    BotIdentity, ChannelAdapter, ChatId, InboundMessage, MessageId, OutboundBody, OutboundMessage,
    Sender, StickerRef, Update, UserId,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const BOT_USERNAME: &str = "test_helper_bot";

pub fn sender(id: i64) -> Sender {
    Sender {
        id: UserId::new(id),
        username: Some(format!("user{id}")),
        first_name: "Иван".to_string(),
        last_name: Some("Петров".to_string()),
    }
}

pub fn message(chat: i64, from: i64, text: &str) -> InboundMessage {
    InboundMessage {
        message_id: MessageId::new(500),
        chat_id: ChatId::new(chat),
        sender: sender(from),
        text: text.to_string(),
        reply_to_text: None,
        received_at: chrono::Utc::now(),
    }
}

pub fn update(id: i64, msg: InboundMessage) -> Update {
    Update {
        update_id: id,
        message: Some(msg),
    }
}

/// Channel that records everything sent through it.
#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<OutboundMessage>>,
    sticker_sets: Mutex<HashMap<String, Vec<StickerRef>>>,
    sticker_fetches: AtomicUsize,
    sticker_delay: Option<Duration>,
    failing_chats: Mutex<HashSet<ChatId>>,
    fail_all_sends: bool,
    fail_me: bool,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sticker_set(self, name: &str, ids: &[&str]) -> Self {
        self.sticker_sets
            .lock()
            .expect("sticker sets lock")
            .insert(name.to_string(), ids.iter().map(|id| StickerRef::new(*id)).collect());
        self
    }

    pub fn with_sticker_delay(mut self, delay: Duration) -> Self {
        self.sticker_delay = Some(delay);
        self
    }

    pub fn failing_sends(mut self) -> Self {
        self.fail_all_sends = true;
        self
    }

    pub fn failing_me(mut self) -> Self {
        self.fail_me = true;
        self
    }

    pub fn fail_chat(self, chat: ChatId) -> Self {
        self.failing_chats
            .lock()
            .expect("failing chats lock")
            .insert(chat);
        self
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m.body {
                OutboundBody::Text(text) => Some(text),
                OutboundBody::Sticker(_) => None,
            })
            .collect()
    }

    pub fn sticker_fetches(&self) -> usize {
        self.sticker_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelAdapter for RecordingChannel {
    fn channel_id(&self) -> &str {
        "recording"
    }

    async fn start(&self, _tx: mpsc::Sender<Update>, cancel: CancellationToken) -> Result<()> {
        cancel.cancelled().await;
        Ok(())
    }

    async fn send(&self, message: OutboundMessage) -> Result<()> {
        if self.fail_all_sends {
            anyhow::bail!("send rejected");
        }
        if self
            .failing_chats
            .lock()
            .expect("failing chats lock")
            .contains(&message.chat_id)
        {
            anyhow::bail!("chat {} unreachable", message.chat_id);
        }
        self.sent.lock().expect("sent lock").push(message);
        Ok(())
    }

    async fn sticker_set(&self, name: &str) -> Result<Vec<StickerRef>> {
        self.sticker_fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.sticker_delay {
            tokio::time::sleep(delay).await;
        }
        self.sticker_sets
            .lock()
            .expect("sticker sets lock")
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("sticker set {name:?} not found"))
    }

    async fn me(&self) -> Result<BotIdentity> {
        if self.fail_me {
            anyhow::bail!("getMe failed");
        }
        Ok(BotIdentity {
            id: UserId::new(1),
            username: BOT_USERNAME.to_string(),
        })
    }
}

/// Replays a fixed list of draws. Each draw is clamped into range; once the
/// script runs out every draw returns `upper - 1`.
pub struct ScriptedRandom {
    draws: Mutex<VecDeque<usize>>,
}

impl ScriptedRandom {
    pub fn new(draws: &[usize]) -> Self {
        Self {
            draws: Mutex::new(draws.iter().copied().collect()),
        }
    }
}

impl RandomSource for ScriptedRandom {
    fn below(&self, upper: usize) -> usize {
        let next = self.draws.lock().expect("draws lock").pop_front();
        next.unwrap_or(upper - 1).min(upper - 1)
    }
}

/// AI double returning a fixed reply or error.
pub struct StubAi {
    reply: std::result::Result<String, String>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl StubAi {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: Ok(text.to_string()),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    pub fn failing(error: &str) -> Self {
        Self {
            reply: Err(error.to_string()),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AiResponder for StubAi {
    async fn generate(
        &self,
        _prompt: &str,
        _sender: &Sender,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = cancel.cancelled() => anyhow::bail!("cancelled"),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.reply.clone().map_err(|e| anyhow::anyhow!(e))
    }
}
