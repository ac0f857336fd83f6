//! Response generation: one weighted roll per trigger.
//!
//! A roll in `[0, 100)` picks the outcome:
//!
//! | roll        | outcome                                   |
//! |-------------|-------------------------------------------|
//! | 0           | rare event                                |
//! | 1..20       | sticker (default text if lookup fails)    |
//! | 60..100     | AI reply, when the sender may get one     |
//! | otherwise   | default text                              |
//!
//! Replies are built for the whole message before anything is sent. An AI
//! reply replaces every other reply of the same message.

use crate::ai::AiResponder;
use crate::cache::CoalescingCache;
use crate::config::StickerSetConfig;
use crate::metrics;
use crate::random::RandomSource;
use crate::store::NamedStats;
use crate::throttle::AiThrottle;
use crate::triggers::{Trigger, is_ai_respondable};
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use svoi_channels::{
    ChannelAdapter, InboundMessage, OutboundBody, OutboundMessage, Quote, StickerRef,
};
use tokio_util::sync::CancellationToken;

pub const ROLL_RANGE: usize = 100;
const RARE_EVENT_ROLL: usize = 0;
const STICKER_BELOW: usize = 20;
const AI_FROM: usize = 60;

pub const RARE_EVENT_TEXT: &str = "ЛИКВИДИРОВАН";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    RareEvent,
    Sticker,
    AiReply,
    Default,
}

impl Outcome {
    pub fn from_roll(roll: usize, ai_allowed: bool) -> Self {
        match roll {
            RARE_EVENT_ROLL => Outcome::RareEvent,
            r if r < STICKER_BELOW => Outcome::Sticker,
            r if r >= AI_FROM && ai_allowed => Outcome::AiReply,
            _ => Outcome::Default,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    PlainText,
    Sticker,
    RareEvent,
    AiGenerated,
}

impl ResponseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseKind::PlainText => "plain_text",
            ResponseKind::Sticker => "sticker",
            ResponseKind::RareEvent => "rare_event",
            ResponseKind::AiGenerated => "ai_generated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    PlainText(String),
    Sticker(StickerRef),
    RareEvent(String),
    AiGenerated(String),
}

impl Response {
    pub fn kind(&self) -> ResponseKind {
        match self {
            Response::PlainText(_) => ResponseKind::PlainText,
            Response::Sticker(_) => ResponseKind::Sticker,
            Response::RareEvent(_) => ResponseKind::RareEvent,
            Response::AiGenerated(_) => ResponseKind::AiGenerated,
        }
    }

    pub fn into_body(self) -> OutboundBody {
        match self {
            Response::PlainText(text) | Response::RareEvent(text) | Response::AiGenerated(text) => {
                OutboundBody::Text(text)
            }
            Response::Sticker(sticker) => OutboundBody::Sticker(sticker),
        }
    }
}

/// A response bound to the trigger it quotes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub trigger: Trigger,
    pub response: Response,
}

impl Reply {
    pub fn into_outbound(self, msg: &InboundMessage) -> OutboundMessage {
        OutboundMessage {
            chat_id: msg.chat_id,
            reply_to_message_id: Some(msg.message_id),
            quote: Some(Quote {
                text: self.trigger.quote,
                position: self.trigger.position,
            }),
            body: self.response.into_body(),
        }
    }
}

pub fn sticker_set_key(name: &str) -> String {
    format!("sticker_set:{name}")
}

/// Random sticker from a random configured set, with set contents cached
/// until explicitly invalidated.
pub struct StickerPicker {
    channel: Arc<dyn ChannelAdapter>,
    sets: Vec<StickerSetConfig>,
    cache: Arc<CoalescingCache<Arc<Vec<StickerRef>>>>,
    rng: Arc<dyn RandomSource>,
}

impl StickerPicker {
    pub fn new(
        channel: Arc<dyn ChannelAdapter>,
        sets: Vec<StickerSetConfig>,
        cache: Arc<CoalescingCache<Arc<Vec<StickerRef>>>>,
        rng: Arc<dyn RandomSource>,
    ) -> Self {
        Self {
            channel,
            sets,
            cache,
            rng,
        }
    }

    pub async fn pick(&self) -> anyhow::Result<StickerRef> {
        if self.sets.is_empty() {
            anyhow::bail!("no sticker sets configured");
        }
        let set = &self.sets[self.rng.below(self.sets.len())];
        let stickers = self
            .cache
            .get_or_fill(&sticker_set_key(&set.name), None, || self.fetch(set))
            .await
            .with_context(|| format!("load sticker set {:?}", set.name))?;
        if stickers.is_empty() {
            anyhow::bail!("sticker set {:?} has no usable stickers", set.name);
        }
        Ok(stickers[self.rng.below(stickers.len())].clone())
    }

    async fn fetch(&self, set: &StickerSetConfig) -> anyhow::Result<Arc<Vec<StickerRef>>> {
        let result = self.channel.sticker_set(&set.name).await;
        metrics::record_sticker_set_fetch(result.is_ok());
        let stickers = result?
            .into_iter()
            .filter(|sticker| {
                !set
                    .exclude_sticker_ids
                    .iter()
                    .any(|excluded| excluded == sticker.as_str())
            })
            .collect::<Vec<_>>();
        tracing::debug!(set = %set.name, stickers = stickers.len(), "sticker set loaded");
        Ok(Arc::new(stickers))
    }

    /// Drop every cached set; returns how many were cached.
    pub fn invalidate_all(&self) -> usize {
        self.sets
            .iter()
            .filter(|set| self.cache.delete(&sticker_set_key(&set.name)))
            .count()
    }
}

pub struct AiSettings {
    pub responder: Arc<dyn AiResponder>,
    pub reset_period: Duration,
}

pub struct ResponseGenerator {
    rng: Arc<dyn RandomSource>,
    stickers: StickerPicker,
    ai: Option<AiSettings>,
    throttle: AiThrottle,
}

impl ResponseGenerator {
    pub fn new(
        rng: Arc<dyn RandomSource>,
        stickers: StickerPicker,
        ai: Option<AiSettings>,
        throttle: AiThrottle,
    ) -> Self {
        Self {
            rng,
            stickers,
            ai,
            throttle,
        }
    }

    pub fn stickers(&self) -> &StickerPicker {
        &self.stickers
    }

    /// Build the final reply set for `msg`.
    ///
    /// Trigger counters for every trigger land in `stats` regardless of
    /// which replies survive; the rare-event counter only counts replies
    /// that will actually be sent.
    pub async fn make_replies(
        &self,
        msg: &InboundMessage,
        triggers: &[Trigger],
        stats: &mut NamedStats,
        cancel: &CancellationToken,
    ) -> Vec<Reply> {
        for trigger in triggers {
            stats.add_trigger(trigger.kind);
            metrics::record_trigger(msg.chat_id, trigger.kind.as_str());
        }

        let mut replies = Vec::with_capacity(triggers.len());
        for trigger in triggers {
            let response = self.generate(msg, cancel).await;
            let reply = Reply {
                trigger: trigger.clone(),
                response,
            };
            if reply.response.kind() == ResponseKind::AiGenerated {
                tracing::debug!(discarded = replies.len(), "ai reply replaces other replies");
                replies.clear();
                replies.push(reply);
                break;
            }
            replies.push(reply);
        }

        stats.likvidirovan_count += replies
            .iter()
            .filter(|r| r.response.kind() == ResponseKind::RareEvent)
            .count() as u64;
        replies
    }

    /// Roll and produce the response for one trigger. Never fails: every
    /// failing branch degrades to the default text.
    pub async fn generate(&self, msg: &InboundMessage, cancel: &CancellationToken) -> Response {
        let roll = self.rng.below(ROLL_RANGE);
        let ai_allowed = self.ai.is_some() && !self.throttle.is_throttled(msg.sender.id);
        let outcome = Outcome::from_roll(roll, ai_allowed);
        tracing::debug!(roll, ?outcome, "rolled response");

        match outcome {
            Outcome::RareEvent => Response::RareEvent(RARE_EVENT_TEXT.to_string()),
            Outcome::Sticker => match self.stickers.pick().await {
                Ok(sticker) => Response::Sticker(sticker),
                Err(e) => {
                    tracing::warn!(error = %format!("{e:#}"), "sticker lookup failed; using default text");
                    self.default_response()
                }
            },
            Outcome::AiReply => self.ai_response(msg, cancel).await,
            Outcome::Default => self.default_response(),
        }
    }

    async fn ai_response(&self, msg: &InboundMessage, cancel: &CancellationToken) -> Response {
        let Some(ai) = &self.ai else {
            return self.default_response();
        };
        if !is_ai_respondable(&msg.text) {
            return self.default_response();
        }
        let sender = msg.sender.id;
        let Some(claim) = self.throttle.try_acquire(sender, ai.reset_period) else {
            tracing::debug!(sender_id = %sender, "ai slot already claimed");
            return self.default_response();
        };

        tracing::info!(sender_id = %sender, "generating ai response");
        match ai.responder.generate(&msg.text, &msg.sender, cancel).await {
            Ok(text) => Response::AiGenerated(text),
            Err(e) => {
                self.throttle.release(claim);
                tracing::warn!(sender_id = %sender, error = %format!("{e:#}"), "ai generation failed; using default text");
                self.default_response()
            }
        }
    }

    pub fn default_response(&self) -> Response {
        let middle = "О".repeat(3 + self.rng.below(10));
        Response::PlainText(format!("Г{middle}Л"))
    }
}
