//! Prometheus instruments for the update pipeline.
//!
//! Registered in the default registry; scraping is left to whoever embeds
//! the process.

use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramVec, IntCounterVec, IntGauge, histogram_opts, register_histogram,
    register_histogram_vec, register_int_counter_vec, register_int_gauge,
};
use crate::store::StatsStore;
use std::time::Duration;
use svoi_channels::ChatId;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const UPDATE_DURATION_BUCKETS: [f64; 10] = [0.001, 0.01, 0.1, 0.25, 0.5, 0.75, 1.0, 2.0, 5.0, 10.0];

lazy_static! {
    static ref SUCCESSFUL_UPDATES: IntCounterVec = register_int_counter_vec!(
        "svoibot_successful_updates_total",
        "Updates processed without error",
        &["chat_id", "update_type"]
    )
    .expect("register svoibot_successful_updates_total");
    static ref FAILED_UPDATES: IntCounterVec = register_int_counter_vec!(
        "svoibot_failed_updates_total",
        "Updates whose processing failed",
        &["chat_id", "update_type"]
    )
    .expect("register svoibot_failed_updates_total");
    static ref UPDATE_DURATION: HistogramVec = register_histogram_vec!(
        histogram_opts!(
            "svoibot_update_duration_seconds",
            "Time spent processing one update",
            UPDATE_DURATION_BUCKETS.to_vec()
        ),
        &["chat_id", "update_type"]
    )
    .expect("register svoibot_update_duration_seconds");
    static ref UPDATE_QUEUE_WAIT: Histogram = register_histogram!(
        histogram_opts!(
            "svoibot_update_queue_wait_seconds",
            "Time between receiving an update and a worker picking it up",
            UPDATE_DURATION_BUCKETS.to_vec()
        )
    )
    .expect("register svoibot_update_queue_wait_seconds");
    static ref COMMAND_USAGE: IntCounterVec = register_int_counter_vec!(
        "svoibot_command_usage_total",
        "Chat command invocations",
        &["chat_id", "command"]
    )
    .expect("register svoibot_command_usage_total");
    static ref TRIGGERS: IntCounterVec = register_int_counter_vec!(
        "svoibot_trigger_total",
        "Detected triggers by family",
        &["chat_id", "trigger"]
    )
    .expect("register svoibot_trigger_total");
    static ref RESPONSES: IntCounterVec = register_int_counter_vec!(
        "svoibot_response_total",
        "Replies sent by kind",
        &["chat_id", "response"]
    )
    .expect("register svoibot_response_total");
    static ref AI_GENERATIONS: IntCounterVec = register_int_counter_vec!(
        "svoibot_ai_generations_total",
        "AI generation attempts",
        &["status"]
    )
    .expect("register svoibot_ai_generations_total");
    static ref AI_GENERATION_DURATION: Histogram = register_histogram!(
        "svoibot_ai_generation_duration_seconds",
        "Latency of AI generation requests"
    )
    .expect("register svoibot_ai_generation_duration_seconds");
    static ref AI_TOKENS: IntCounterVec = register_int_counter_vec!(
        "svoibot_ai_tokens_total",
        "Tokens consumed by AI generation",
        &["model", "kind"]
    )
    .expect("register svoibot_ai_tokens_total");
    static ref STICKER_SET_FETCHES: IntCounterVec = register_int_counter_vec!(
        "svoibot_sticker_set_fetch_total",
        "Upstream sticker set lookups",
        &["status"]
    )
    .expect("register svoibot_sticker_set_fetch_total");
    static ref TOTAL_USERS: IntGauge =
        register_int_gauge!("svoibot_total_users", "Users with stored stats")
            .expect("register svoibot_total_users");
    static ref TOTAL_CHATS: IntGauge =
        register_int_gauge!("svoibot_total_chats", "Chats with stored stats")
            .expect("register svoibot_total_chats");
}

fn status_label(ok: bool) -> &'static str {
    if ok { "success" } else { "failure" }
}

pub fn record_update(chat_id: ChatId, update_type: &str, ok: bool, elapsed: Duration) {
    let chat_id = chat_id.to_string();
    let labels = [chat_id.as_str(), update_type];
    if ok {
        SUCCESSFUL_UPDATES.with_label_values(&labels).inc();
    } else {
        FAILED_UPDATES.with_label_values(&labels).inc();
    }
    UPDATE_DURATION
        .with_label_values(&labels)
        .observe(elapsed.as_secs_f64());
}

pub fn record_queue_wait(waited: Duration) {
    UPDATE_QUEUE_WAIT.observe(waited.as_secs_f64());
}

pub fn record_totals(users: u64, chats: u64) {
    TOTAL_USERS.set(i64::try_from(users).unwrap_or(i64::MAX));
    TOTAL_CHATS.set(i64::try_from(chats).unwrap_or(i64::MAX));
}

/// Re-read user/chat totals from `store` every `period` until `cancel`
/// fires. Read failures are logged and retried on the next tick.
pub fn spawn_totals_refresher(
    store: StatsStore,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match store.totals().await {
                Ok(totals) => {
                    tracing::debug!(users = totals.users, chats = totals.chats, "stats totals");
                    record_totals(totals.users, totals.chats);
                }
                Err(e) => tracing::error!(error = %e, "failed to read stats totals"),
            }
        }
    })
}

pub fn record_command(chat_id: ChatId, command: &str) {
    let chat_id = chat_id.to_string();
    COMMAND_USAGE
        .with_label_values(&[chat_id.as_str(), command])
        .inc();
}

pub fn record_trigger(chat_id: ChatId, trigger: &str) {
    let chat_id = chat_id.to_string();
    TRIGGERS
        .with_label_values(&[chat_id.as_str(), trigger])
        .inc();
}

pub fn record_response(chat_id: ChatId, response: &str) {
    let chat_id = chat_id.to_string();
    RESPONSES
        .with_label_values(&[chat_id.as_str(), response])
        .inc();
}

pub fn record_ai_generation(ok: bool, elapsed: Duration) {
    AI_GENERATIONS.with_label_values(&[status_label(ok)]).inc();
    AI_GENERATION_DURATION.observe(elapsed.as_secs_f64());
}

pub fn record_ai_tokens(model: &str, prompt: u32, completion: u32, total: u32) {
    AI_TOKENS
        .with_label_values(&[model, "prompt"])
        .inc_by(u64::from(prompt));
    AI_TOKENS
        .with_label_values(&[model, "completion"])
        .inc_by(u64::from(completion));
    AI_TOKENS
        .with_label_values(&[model, "total"])
        .inc_by(u64::from(total));
}

pub fn record_sticker_set_fetch(ok: bool) {
    STICKER_SET_FETCHES
        .with_label_values(&[status_label(ok)])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorders_update_counters() {
        let chat = ChatId::new(-100_123);
        let before = SUCCESSFUL_UPDATES
            .with_label_values(&["-100123", "message"])
            .get();
        record_update(chat, "message", true, Duration::from_millis(5));
        assert_eq!(
            SUCCESSFUL_UPDATES
                .with_label_values(&["-100123", "message"])
                .get(),
            before + 1
        );

        record_ai_tokens("test-model", 10, 5, 15);
        assert!(AI_TOKENS.with_label_values(&["test-model", "total"]).get() >= 15);

        record_command(chat, "pwd");
        record_trigger(chat, "svo");
        record_response(chat, "plain_text");
        record_ai_generation(false, Duration::from_millis(1));
        record_sticker_set_fetch(true);
    }

    #[test]
    fn update_duration_uses_fixed_buckets() {
        let chat = ChatId::new(-100_456);
        record_update(chat, "message", false, Duration::from_millis(300));

        let families = prometheus::gather();
        let family = families
            .iter()
            .find(|f| f.get_name() == "svoibot_update_duration_seconds")
            .expect("histogram registered");
        let metric = family
            .get_metric()
            .iter()
            .find(|m| {
                m.get_label()
                    .iter()
                    .any(|l| l.get_name() == "chat_id" && l.get_value() == "-100456")
            })
            .expect("series for chat");
        let bounds: Vec<f64> = metric
            .get_histogram()
            .get_bucket()
            .iter()
            .map(|b| b.get_upper_bound())
            .collect();
        assert_eq!(bounds, UPDATE_DURATION_BUCKETS.to_vec());
    }

    #[test]
    fn queue_wait_is_observed() {
        let before = UPDATE_QUEUE_WAIT.get_sample_count();
        record_queue_wait(Duration::from_millis(2));
        assert!(UPDATE_QUEUE_WAIT.get_sample_count() > before);
    }

    #[tokio::test]
    async fn totals_refresher_publishes_store_counts_until_cancelled() {
        let store = StatsStore::open(":memory:").expect("open");
        for (user, chat) in [(1, 10), (2, 10), (3, 20)] {
            store
                .increase_stats(crate::store::NamedStats {
                    svo_count: 1,
                    ..crate::store::NamedStats::new(
                        svoi_channels::UserId::new(user),
                        ChatId::new(chat),
                        "User",
                    )
                })
                .await
                .expect("seed");
        }

        let cancel = CancellationToken::new();
        let handle = spawn_totals_refresher(store, Duration::from_millis(10), cancel.clone());
        for _ in 0..100 {
            if TOTAL_USERS.get() == 3 && TOTAL_CHATS.get() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(TOTAL_USERS.get(), 3);
        assert_eq!(TOTAL_CHATS.get(), 2);

        cancel.cancel();
        handle.await.expect("refresher stops");
    }
}
