//! Live polling loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use pt_core::store::ListeningStore;
use pt_core::{EventSink, Pipeline, Stores};
use pt_db::Database;
use pt_poll::MediaServerClient;
use tokio::time::{Instant, MissedTickBehavior};

use crate::Config;
use crate::output::JsonLinesSink;

pub fn run(db: Database, config: &Config) -> Result<()> {
    let server_url = config
        .server_url
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow!("missing media server URL (set PT_SERVER_URL or config.toml)"))?;
    let api_key = config
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow!("missing media server API key (set PT_API_KEY or config.toml)"))?;

    let client = MediaServerClient::new(server_url, api_key)
        .context("failed to create media server client")?;
    let runtime = tokio::runtime::Runtime::new().context("failed to initialize tokio runtime")?;
    runtime.block_on(poll_loop(&client, db, config));
    Ok(())
}

async fn poll_loop(client: &MediaServerClient, db: Database, config: &Config) {
    let db = Arc::new(db);
    let sink: Arc<dyn EventSink> = Arc::new(JsonLinesSink::new(std::io::stdout()));
    let mut pipeline = Pipeline::new(config.tracker.clone(), Stores::from_shared(&db), sink)
        .with_listening_store(Arc::clone(&db) as Arc<dyn ListeningStore>);

    let mut poll = tokio::time::interval(Duration::from_secs(config.poll_interval_secs.max(1)));
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let flush_period = Duration::from_secs(config.flush_interval_secs.max(1));
    let mut flush = tokio::time::interval_at(Instant::now() + flush_period, flush_period);
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    tracing::info!(
        client = ?client,
        interval_secs = config.poll_interval_secs,
        "polling started"
    );
    loop {
        tokio::select! {
            _ = poll.tick() => {
                let now = Utc::now();
                match client.active_streams(now).await {
                    Ok(streams) => {
                        pipeline.run_tick(&streams, now);
                    }
                    // A failed poll is not an empty poll: no absence is counted.
                    Err(err) => tracing::warn!(error = %err, "failed to fetch sessions; skipping tick"),
                }
            }
            _ = flush.tick() => {
                pipeline.flush(Utc::now());
            }
            result = &mut shutdown => {
                if let Err(err) = result {
                    tracing::error!(error = %err, "failed to listen for ctrl-c");
                }
                break;
            }
        }
    }

    tracing::info!(
        active_sessions = pipeline.tracker().session_count(),
        "shutting down"
    );
    pipeline.shutdown(Utc::now()).await;
}
