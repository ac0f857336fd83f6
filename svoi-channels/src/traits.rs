use crate::types::{BotIdentity, OutboundMessage, StickerRef, Update};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier, e.g. "telegram".
    fn channel_id(&self) -> &str;

    /// Start receiving updates and push each one to `tx`.
    ///
    /// `tx` is bounded; a full queue stalls the receiving loop instead of
    /// dropping updates. The loop stops once `cancel` fires.
    async fn start(&self, tx: mpsc::Sender<Update>, cancel: CancellationToken) -> Result<()>;

    /// Send a text or sticker, optionally as a quoted reply.
    async fn send(&self, message: OutboundMessage) -> Result<()>;

    /// List the stickers of a named set, in platform order.
    async fn sticker_set(&self, name: &str) -> Result<Vec<StickerRef>>;

    /// Resolve the bot's own account.
    async fn me(&self) -> Result<BotIdentity>;
}
