//! Messaging transport for svoibot.
//!
//! Adapters are pure I/O: they convert platform updates to/from the
//! transport-neutral `Update` / `OutboundMessage` types consumed by the bot.

mod telegram;
mod traits;
mod types;

pub use telegram::TelegramAdapter;
pub use traits::ChannelAdapter;
pub use types::{
    BotIdentity, ChatId, InboundMessage, MessageId, OutboundBody, OutboundMessage, Quote, Sender,
    StickerRef, Update, UserId,
};
