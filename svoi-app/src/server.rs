//! Process wiring: config, storage, transport, caches, worker pool, shutdown.

use crate::ai::{AiResponder, LlmResponder};
use crate::cache::CoalescingCache;
use crate::config::SvoiConfig;
use crate::gateway::WorkerPool;
use crate::handler::UpdateHandler;
use crate::metrics;
use crate::random::{RandomSource, ThreadRandom};
use crate::responses::{AiSettings, ResponseGenerator, StickerPicker};
use crate::store::StatsStore;
use crate::throttle::AiThrottle;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use svoi_channels::{BotIdentity, ChannelAdapter, StickerRef, TelegramAdapter};
use svoi_llm::{ClientConfig, LlmClient};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = SvoiConfig::load_with_path(config_path).await?;
    let store = StatsStore::open(&cfg.storage.sqlite_path)
        .with_context(|| format!("open sqlite store {}", cfg.storage.sqlite_path))?;
    let totals = store.totals().await?;
    tracing::info!(
        config_path = %path.display(),
        sqlite_path = %cfg.storage.sqlite_path,
        known_users = totals.users,
        known_chats = totals.chats,
        workers = cfg.bot.workers,
        sticker_sets = cfg.sticker_sets.len(),
        ai_enabled = cfg.enabled_ai().is_some(),
        "config ok"
    );
    Ok(())
}

fn build_ai(cfg: &SvoiConfig) -> Result<Option<AiSettings>> {
    let Some(ai) = cfg.enabled_ai() else {
        tracing::warn!("no AI API key configured; AI replies disabled");
        return Ok(None);
    };
    let client = LlmClient::new(ClientConfig {
        base_url: ai.base_url.clone(),
        api_key: ai.api_key().unwrap_or_default().to_string(),
        model: ai.model.clone(),
        fallback_models: ai.fallback_models.clone(),
        timeout: Some(ai.timeout()),
    })
    .context("build AI client")?;
    tracing::info!(
        model = %client.model(),
        fallback_models = ?ai.fallback_models,
        reset_period_secs = ai.reset_period_secs,
        "AI replies enabled"
    );
    let responder: Arc<dyn AiResponder> =
        Arc::new(LlmResponder::new(client, ai.system_prompt.clone()));
    Ok(Some(AiSettings {
        responder,
        reset_period: ai.reset_period(),
    }))
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = SvoiConfig::load_with_path(config_path).await?;
    tracing::info!(
        config_path = %path.display(),
        sqlite_path = %cfg.storage.sqlite_path,
        workers = cfg.bot.workers,
        queue_capacity = cfg.bot.queue_capacity,
        admin_ids = ?cfg.bot.admin_ids,
        sticker_sets = cfg.sticker_sets.len(),
        skip_pending_updates = cfg.bot.skip_pending_updates,
        "starting svoibot"
    );

    let store = StatsStore::open(&cfg.storage.sqlite_path)
        .with_context(|| format!("open sqlite store {}", cfg.storage.sqlite_path))?;

    let channel: Arc<dyn ChannelAdapter> = Arc::new(
        TelegramAdapter::new(&cfg.bot.token)?.with_skip_pending(cfg.bot.skip_pending_updates),
    );

    let sticker_cache: Arc<CoalescingCache<Arc<Vec<StickerRef>>>> =
        Arc::new(CoalescingCache::new());
    let identity_cache: Arc<CoalescingCache<BotIdentity>> = Arc::new(CoalescingCache::new());
    let throttle_markers: Arc<CoalescingCache<u64>> = Arc::new(CoalescingCache::new());

    let rng: Arc<dyn RandomSource> = Arc::new(ThreadRandom);
    let stickers = StickerPicker::new(
        channel.clone(),
        cfg.sticker_sets.clone(),
        sticker_cache.clone(),
        rng.clone(),
    );
    let generator = ResponseGenerator::new(
        rng,
        stickers,
        build_ai(&cfg)?,
        AiThrottle::new(throttle_markers.clone()),
    );
    let handler = Arc::new(UpdateHandler::new(
        channel.clone(),
        store.clone(),
        generator,
        identity_cache,
        cfg.bot.admin_ids.iter().copied(),
    ));

    let shutdown = CancellationToken::new();
    let (tx, rx) = mpsc::channel(cfg.bot.queue_capacity);
    channel
        .start(tx, shutdown.child_token())
        .await
        .with_context(|| format!("start {} channel", channel.channel_id()))?;
    tracing::info!(channel = %channel.channel_id(), "channel started");

    let sweep_interval = cfg.cache.sweep_interval();
    let background = [
        throttle_markers.spawn_sweeper(sweep_interval, shutdown.child_token()),
        sticker_cache.spawn_sweeper(sweep_interval, shutdown.child_token()),
        metrics::spawn_totals_refresher(
            store,
            cfg.metrics.update_period(),
            shutdown.child_token(),
        ),
    ];
    tokio::spawn(shutdown_signal(shutdown.clone()));

    WorkerPool::new(handler, cfg.bot.workers)
        .run(rx, shutdown.clone())
        .await;

    shutdown.cancel();
    for task in background {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "background task join failed during shutdown");
        }
    }
    tracing::info!("svoibot shutdown completed");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
            _ = shutdown.cancelled() => return,
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            res = tokio::signal::ctrl_c() => match res {
                Ok(()) => tracing::warn!("received ctrl-c; beginning graceful shutdown"),
                Err(e) => tracing::error!(error = %e, "failed to await ctrl-c signal"),
            },
            _ = shutdown.cancelled() => return,
        }
    }
    shutdown.cancel();
}
