//! End-to-end processing of one update.
//!
//! detect triggers -> spam check -> build replies -> send -> commit stats.

use crate::cache::CoalescingCache;
use crate::commands::{self, Command};
use crate::metrics;
use crate::gateway::UpdateProcessor;
use crate::responses::ResponseGenerator;
use crate::store::{NamedStats, StatsStore, StoreError};
use crate::triggers::{find_triggers, is_spam};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use svoi_channels::{BotIdentity, ChannelAdapter, ChatId, InboundMessage, OutboundMessage, Update};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub const SPAM_REPLY: &str = "Спамер";
const SELF_IDENTITY_KEY: &str = "self_identity";

#[derive(Debug, Error)]
pub enum HandleError {
    #[error("transport: {0:#}")]
    Transport(anyhow::Error),

    #[error("storage: {0}")]
    Storage(#[from] StoreError),
}

pub struct UpdateHandler {
    channel: Arc<dyn ChannelAdapter>,
    store: StatsStore,
    generator: ResponseGenerator,
    identity: Arc<CoalescingCache<BotIdentity>>,
    admin_ids: HashSet<i64>,
}

fn simple_reply(msg: &InboundMessage, text: impl Into<String>) -> OutboundMessage {
    OutboundMessage::text(msg.chat_id, text).reply_to(msg.message_id)
}

impl UpdateHandler {
    pub fn new(
        channel: Arc<dyn ChannelAdapter>,
        store: StatsStore,
        generator: ResponseGenerator,
        identity: Arc<CoalescingCache<BotIdentity>>,
        admin_ids: impl IntoIterator<Item = i64>,
    ) -> Self {
        Self {
            channel,
            store,
            generator,
            identity,
            admin_ids: admin_ids.into_iter().collect(),
        }
    }

    fn is_admin(&self, chat_id: ChatId) -> bool {
        self.admin_ids.contains(&chat_id.get())
    }

    async fn send(&self, message: OutboundMessage) -> Result<(), HandleError> {
        self.channel
            .send(message)
            .await
            .map_err(HandleError::Transport)
    }

    pub async fn handle_update(
        &self,
        update: &Update,
        cancel: &CancellationToken,
    ) -> Result<(), HandleError> {
        let Some(msg) = &update.message else {
            tracing::debug!("update carries no message; ignoring");
            return Ok(());
        };

        if msg.text.starts_with('/') {
            let username = self.bot_username().await;
            if let Some(cmd) = Command::parse(&msg.text, username.as_deref()) {
                return self.run_command(cmd, msg).await;
            }
        }
        self.handle_regular_message(msg, cancel).await
    }

    /// Resolved once per process; on failure only bare `/name` commands match.
    async fn bot_username(&self) -> Option<String> {
        match self
            .identity
            .get_or_fill(SELF_IDENTITY_KEY, None, || self.channel.me())
            .await
        {
            Ok(me) => Some(me.username),
            Err(e) => {
                tracing::warn!(error = %e, "could not resolve bot identity");
                None
            }
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(command = cmd.name()))]
    async fn run_command(&self, cmd: Command, msg: &InboundMessage) -> Result<(), HandleError> {
        metrics::record_command(msg.chat_id, cmd.name());
        let is_admin = self.is_admin(msg.chat_id);
        if cmd.admin_only() && !is_admin {
            tracing::debug!(
                user_id = %msg.sender.id,
                username = ?msg.sender.username,
                "non-admin tried an admin command"
            );
            return self.send(simple_reply(msg, commands::NOT_AUTHORIZED)).await;
        }

        match cmd {
            Command::Stats => {
                let rows = self.store.retrieve_stats(msg.chat_id).await?;
                self.send(simple_reply(msg, commands::format_stats(&rows)))
                    .await
            }
            Command::Pwd => {
                self.send(simple_reply(
                    msg,
                    commands::format_pwd(msg.chat_id.get(), is_admin),
                ))
                .await
            }
            Command::Broadcast => self.broadcast(msg).await,
            Command::RefreshStickers => {
                let dropped = self.generator.stickers().invalidate_all();
                tracing::info!(dropped, "sticker cache invalidated");
                self.send(simple_reply(
                    msg,
                    format!("Sticker cache cleared ({dropped} sets)"),
                ))
                .await
            }
        }
    }

    async fn broadcast(&self, msg: &InboundMessage) -> Result<(), HandleError> {
        let text = match msg.reply_to_text.as_deref() {
            None => return self.send(simple_reply(msg, commands::BROADCAST_NEEDS_REPLY)).await,
            Some("") => return self.send(simple_reply(msg, commands::BROADCAST_NEEDS_TEXT)).await,
            Some(text) => text,
        };

        let targets: Vec<ChatId> = self
            .store
            .all_chats()
            .await?
            .into_iter()
            .filter(|chat| *chat != msg.chat_id)
            .collect();
        tracing::debug!(targets = ?targets, "broadcasting message");

        let mut succeeded = 0;
        let mut failed = 0;
        for chat in &targets {
            match self.channel.send(OutboundMessage::text(*chat, text)).await {
                Ok(()) => succeeded += 1,
                Err(e) => {
                    failed += 1;
                    tracing::warn!(chat_id = %chat, error = %format!("{e:#}"), "broadcast delivery failed");
                }
            }
        }

        self.send(simple_reply(
            msg,
            commands::format_broadcast_report(targets.len(), succeeded, failed),
        ))
        .await
    }

    async fn handle_regular_message(
        &self,
        msg: &InboundMessage,
        cancel: &CancellationToken,
    ) -> Result<(), HandleError> {
        let triggers = find_triggers(&msg.text);
        if triggers.is_empty() {
            return Ok(());
        }
        tracing::debug!(triggers = ?triggers, "found triggers");

        let matched_len: usize = triggers.iter().map(|t| t.length).sum();
        let text_len = msg.text.chars().count();
        let spam = is_spam(triggers.len(), matched_len, text_len);
        tracing::debug!(
            trigger_count = triggers.len(),
            matched_len,
            text_len,
            spam,
            "checked for spam"
        );
        if spam {
            metrics::record_response(msg.chat_id, "spam");
            return self.send(simple_reply(msg, SPAM_REPLY)).await;
        }

        let mut stats = NamedStats::for_message(msg);
        let replies = self
            .generator
            .make_replies(msg, &triggers, &mut stats, cancel)
            .await;

        for reply in replies {
            metrics::record_response(msg.chat_id, reply.response.kind().as_str());
            self.send(reply.into_outbound(msg)).await?;
        }

        if !stats.is_empty() {
            self.store.increase_stats(stats).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl UpdateProcessor for UpdateHandler {
    async fn process(
        &self,
        update: &Update,
        cancel: &CancellationToken,
    ) -> Result<(), HandleError> {
        self.handle_update(update, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StickerSetConfig;
    use crate::random::RandomSource;
    use crate::responses::{AiSettings, StickerPicker};
    use crate::testing::{BOT_USERNAME, RecordingChannel, ScriptedRandom, StubAi, message, update};
    use std::time::Duration;
    use crate::throttle::AiThrottle;
    use svoi_channels::{OutboundBody, Quote, UserId};

    const ADMIN_CHAT: i64 = -1001;

    struct Fixture {
        channel: Arc<RecordingChannel>,
        store: StatsStore,
        handler: UpdateHandler,
    }

    fn fixture(channel: RecordingChannel, draws: &[usize]) -> Fixture {
        fixture_with_ai(channel, draws, None)
    }

    fn fixture_with_ai(
        channel: RecordingChannel,
        draws: &[usize],
        ai: Option<Arc<StubAi>>,
    ) -> Fixture {
        let channel = Arc::new(channel);
        let store = StatsStore::open(":memory:").expect("open store");
        let rng: Arc<dyn RandomSource> = Arc::new(ScriptedRandom::new(draws));
        let stickers = StickerPicker::new(
            channel.clone(),
            vec![StickerSetConfig {
                name: "pack".to_string(),
                exclude_sticker_ids: vec![],
            }],
            Arc::new(CoalescingCache::new()),
            rng.clone(),
        );
        let ai = ai.map(|responder| AiSettings {
            responder,
            reset_period: Duration::from_secs(3600),
        });
        let generator = ResponseGenerator::new(
            rng,
            stickers,
            ai,
            AiThrottle::new(Arc::new(CoalescingCache::new())),
        );
        let handler = UpdateHandler::new(
            channel.clone(),
            store.clone(),
            generator,
            Arc::new(CoalescingCache::new()),
            [ADMIN_CHAT],
        );
        Fixture {
            channel,
            store,
            handler,
        }
    }

    async fn handle(f: &Fixture, chat: i64, text: &str) -> Result<(), HandleError> {
        f.handler
            .handle_update(&update(1, message(chat, 2, text)), &CancellationToken::new())
            .await
    }

    async fn seed(store: &StatsStore, user: i64, chat: i64, svo: u64) {
        store
            .increase_stats(NamedStats {
                svo_count: svo,
                ..NamedStats::new(UserId::new(user), ChatId::new(chat), format!("User {user}"))
            })
            .await
            .expect("seed stats");
    }

    #[tokio::test]
    async fn message_without_triggers_sends_nothing() {
        let f = fixture(RecordingChannel::new(), &[]);
        handle(&f, 1, "привет всем").await.expect("handled");
        assert!(f.channel.sent().is_empty());
        assert!(f.store.all_chats().await.expect("chats").is_empty());
    }

    #[tokio::test]
    async fn update_without_message_is_ignored() {
        let f = fixture(RecordingChannel::new(), &[]);
        let empty = Update {
            update_id: 3,
            message: None,
        };
        f.handler
            .handle_update(&empty, &CancellationToken::new())
            .await
            .expect("ignored");
        assert!(f.channel.sent().is_empty());
    }

    #[tokio::test]
    async fn trigger_gets_quoted_reply_and_stats() {
        let f = fixture(RecordingChannel::new(), &[30, 0]);
        handle(&f, 1, "ура сво").await.expect("handled");

        let sent = f.channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].body, OutboundBody::Text("ГОООЛ".to_string()));
        assert_eq!(
            sent[0].quote,
            Some(Quote {
                text: "сво".to_string(),
                position: 4
            })
        );

        let rows = f.store.retrieve_stats(ChatId::new(1)).await.expect("stats");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].svo_count, 1);
        assert_eq!(rows[0].display_name, "Иван Петров");
    }

    #[tokio::test]
    async fn ai_reply_is_the_only_reply_but_all_triggers_count() {
        let ai = Arc::new(StubAi::replying("Слава героям"));
        // First trigger: default text. Second: AI reply.
        let f = fixture_with_ai(RecordingChannel::new(), &[30, 0, 70], Some(ai.clone()));
        handle(
            &f,
            1,
            "сегодня мы снова обсуждали сво и зов а потом своих друзей весь вечер",
        )
        .await
        .expect("handled");

        let sent = f.channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].body, OutboundBody::Text("Слава героям".to_string()));
        assert_eq!(ai.calls(), 1);

        let rows = f.store.retrieve_stats(ChatId::new(1)).await.expect("stats");
        assert_eq!(rows.len(), 1);
        assert_eq!((rows[0].svo_count, rows[0].zov_count), (2, 1));
        assert_eq!(rows[0].likvidirovan_count, 0);
    }

    #[tokio::test]
    async fn sticker_reply_is_sent_as_sticker() {
        let channel = RecordingChannel::new().with_sticker_set("pack", &["s1"]);
        let f = fixture(channel, &[7, 0, 0]);
        handle(&f, 1, "зов").await.expect("handled");
        let sent = f.channel.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].body, OutboundBody::Sticker(_)));
    }

    #[tokio::test]
    async fn spam_gets_single_reply_and_no_stats() {
        let f = fixture(RecordingChannel::new(), &[]);
        handle(&f, 1, "сво сво").await.expect("handled");

        let sent = f.channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].body, OutboundBody::Text(SPAM_REPLY.to_string()));
        assert_eq!(sent[0].quote, None);
        assert!(sent[0].reply_to_message_id.is_some());
        assert!(f.store.all_chats().await.expect("chats").is_empty());
    }

    #[tokio::test]
    async fn send_failure_surfaces_and_skips_stats() {
        let f = fixture(RecordingChannel::new().failing_sends(), &[30, 0]);
        let err = handle(&f, 1, "сво").await.expect_err("send fails");
        assert!(matches!(err, HandleError::Transport(_)));
        assert!(f.store.all_chats().await.expect("chats").is_empty());
    }

    #[tokio::test]
    async fn storage_failure_surfaces_after_replies() {
        let f = fixture(RecordingChannel::new(), &[30, 0]);
        f.store.execute_raw("DROP TABLE stats;").await.expect("drop");
        let err = handle(&f, 1, "сво").await.expect_err("commit fails");
        assert!(matches!(err, HandleError::Storage(_)));
        assert_eq!(f.channel.sent().len(), 1);
    }

    #[tokio::test]
    async fn pwd_reports_chat_and_admin_flag() {
        let f = fixture(RecordingChannel::new(), &[]);
        handle(&f, 5, "/pwd").await.expect("pwd");
        handle(&f, ADMIN_CHAT, &format!("/pwd@{BOT_USERNAME}"))
            .await
            .expect("admin pwd");
        assert_eq!(
            f.channel.sent_texts(),
            vec![
                "chat_id: 5".to_string(),
                "chat_id: -1001\nis_admin: true".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn command_for_another_bot_is_a_regular_message() {
        let f = fixture(RecordingChannel::new(), &[]);
        handle(&f, 5, "/pwd@someone_else").await.expect("handled");
        assert!(f.channel.sent().is_empty());
    }

    #[tokio::test]
    async fn unresolved_identity_still_accepts_bare_commands() {
        let f = fixture(RecordingChannel::new().failing_me(), &[]);
        handle(&f, 5, &format!("/pwd@{BOT_USERNAME}"))
            .await
            .expect("handled");
        assert!(f.channel.sent().is_empty());
        handle(&f, 5, "/pwd").await.expect("pwd");
        assert_eq!(f.channel.sent_texts(), vec!["chat_id: 5".to_string()]);
    }

    #[tokio::test]
    async fn unmatched_mention_is_scanned_for_triggers() {
        let f = fixture(RecordingChannel::new().failing_me(), &[30, 0]);
        handle(&f, 5, "/pwd@svoi_bot").await.expect("handled");

        let sent = f.channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].body, OutboundBody::Text("ГОООЛ".to_string()));
        assert_eq!(
            sent[0].quote,
            Some(Quote {
                text: "svo".to_string(),
                position: 5
            })
        );
    }

    #[tokio::test]
    async fn stats_command_lists_chat_rows() {
        let f = fixture(RecordingChannel::new(), &[]);
        handle(&f, 9, "/svoistats").await.expect("empty stats");
        seed(&f.store, 1, 9, 2).await;
        handle(&f, 9, "/svoistats").await.expect("stats");

        assert_eq!(
            f.channel.sent_texts(),
            vec![
                commands::NO_STATS_YET.to_string(),
                "User 1: 2 СВО и 0 ЗОВ-ов повлекли за собой 0 ЛИКВИДАЦИЙ".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn admin_commands_refuse_non_admins() {
        let f = fixture(RecordingChannel::new(), &[]);
        handle(&f, 5, "/broadcast").await.expect("refused");
        handle(&f, 5, "/refreshstickers").await.expect("refused");
        assert_eq!(
            f.channel.sent_texts(),
            vec![
                commands::NOT_AUTHORIZED.to_string(),
                commands::NOT_AUTHORIZED.to_string()
            ]
        );
    }

    #[tokio::test]
    async fn broadcast_requires_a_replied_text() {
        let f = fixture(RecordingChannel::new(), &[]);
        handle(&f, ADMIN_CHAT, "/broadcast").await.expect("no reply");

        let mut msg = message(ADMIN_CHAT, 2, "/broadcast");
        msg.reply_to_text = Some(String::new());
        f.handler
            .handle_update(&update(2, msg), &CancellationToken::new())
            .await
            .expect("no text");

        assert_eq!(
            f.channel.sent_texts(),
            vec![
                commands::BROADCAST_NEEDS_REPLY.to_string(),
                commands::BROADCAST_NEEDS_TEXT.to_string()
            ]
        );
    }

    #[tokio::test]
    async fn broadcast_reaches_every_other_known_chat() {
        let f = fixture(RecordingChannel::new().fail_chat(ChatId::new(30)), &[]);
        seed(&f.store, 1, ADMIN_CHAT, 1).await;
        seed(&f.store, 1, 20, 1).await;
        seed(&f.store, 2, 30, 1).await;

        let mut msg = message(ADMIN_CHAT, 2, "/broadcast");
        msg.reply_to_text = Some("Внимание всем".to_string());
        f.handler
            .handle_update(&update(4, msg), &CancellationToken::new())
            .await
            .expect("broadcast");

        let sent = f.channel.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].chat_id, ChatId::new(20));
        assert_eq!(sent[0].body, OutboundBody::Text("Внимание всем".to_string()));
        assert_eq!(sent[0].reply_to_message_id, None);
        assert_eq!(sent[1].chat_id, ChatId::new(ADMIN_CHAT));
        assert_eq!(
            sent[1].body,
            OutboundBody::Text("Finished broadcasting to 2 chats: 1 success, 1 failure".to_string())
        );
    }

    #[tokio::test]
    async fn refresh_stickers_drops_cached_sets() {
        let channel = RecordingChannel::new().with_sticker_set("pack", &["s1"]);
        let f = fixture(channel, &[7, 0, 0, 7, 0, 0]);
        handle(&f, ADMIN_CHAT, "зов").await.expect("first sticker");
        handle(&f, ADMIN_CHAT, "/refreshstickers").await.expect("refresh");
        handle(&f, ADMIN_CHAT, "зов").await.expect("second sticker");

        assert_eq!(f.channel.sticker_fetches(), 2);
        assert!(
            f.channel
                .sent_texts()
                .contains(&"Sticker cache cleared (1 sets)".to_string())
        );
    }
}
