//! lifeboat demo
//!
//! In-memory stores で「canonical が落ちる → フォールバックに退避 → 復旧後に sweep」
//! の一連の流れを動かす。`lifeboat.toml` / `LIFEBOAT_*` があればそれを使う。

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use lifeboat_core::app::{HealthReport, ReplayDispatcher, SweepLoop};
use lifeboat_core::config::LifeboatConfig;
use lifeboat_core::domain::{StoreErrorKind, mask_url};
use lifeboat_core::impls::{InMemoryDatastore, InMemoryReplayQueue, StoreMode};
use lifeboat_core::ports::{Clock, Datastore, ReplayQueue, SystemClock};
use lifeboat_core::webhook::{WebhookCapture, webhook_log_action};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEMO_STORES: [&str; 2] = ["memory://primary", "memory://fallback"];

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    // (A) 設定。ストアが設定されていなければデモ用の 2 ストア
    let config = match LifeboatConfig::load() {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "no usable configuration, using demo stores");
            LifeboatConfig {
                store_urls: DEMO_STORES.iter().map(|s| s.to_string()).collect(),
                ..LifeboatConfig::default()
            }
        }
    };
    info!(
        action = %config.action,
        stores = ?config.masked_store_urls(),
        "configuration loaded"
    );

    // (B) ストア・キュー・action を組み立てる
    let stores: Vec<Arc<InMemoryDatastore>> = config
        .store_urls
        .iter()
        .map(|url| Arc::new(InMemoryDatastore::new(url.clone())))
        .collect();
    let queue = Arc::new(InMemoryReplayQueue::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let action = Arc::new(
        webhook_log_action(
            &config,
            stores.iter().map(|s| s.clone() as Arc<dyn Datastore>).collect(),
            queue.clone(),
            clock.clone(),
        )
        .context("failed to build webhook log action")?,
    );

    // (C) canonical を落として webhook を受ける
    let canonical = stores.first().context("no canonical store")?;
    canonical.set_mode(StoreMode::Unavailable(StoreErrorKind::Connection));
    for i in 0..3 {
        let capture = WebhookCapture::new(format!(r#"{{"event":"order.paid","seq":{i}}}"#))
            .source_ip("203.0.113.7")
            .content_type("application/json")
            .header("X-Webhook-Id", format!("evt_{i}"));
        match action.insert(capture.into_record(clock.as_ref())).await {
            Ok(logged) => info!(
                record_id = %logged.id,
                stored_in = ?logged.insert_attempted_stores.last(),
                "webhook captured"
            ),
            Err(e) => warn!(error = %e, "webhook lost"),
        }
    }

    let report = HealthReport::collect(&action).await;
    println!("{}", report.to_json().context("failed to render health report")?);

    // (D) 復旧させて sweep loop を回す
    canonical.set_mode(StoreMode::Available);
    let token = CancellationToken::new();
    let dispatcher = ReplayDispatcher::new(action.clone(), config.sweep_config());
    let sweep_loop = SweepLoop::new(dispatcher, config.sweep_interval(), token.clone());
    let trigger = sweep_loop.trigger();
    let sweeps = tokio::spawn(sweep_loop.run());
    trigger.fire();

    // (E) リプレイされた ID を下流の代わりに受け取る
    let mut replayed = 0;
    while replayed < 3 {
        tokio::select! {
            popped = queue.pop(action.name(), Duration::from_secs(5)) => {
                match popped.context("replay queue failed")? {
                    Some(id) => {
                        replayed += 1;
                        info!(canonical_id = %id, "replayed record ready for processing");
                    }
                    None => {
                        warn!("timed out waiting for replayed records");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received CTRL+C signal");
                break;
            }
        }
    }

    token.cancel();
    let sweeps = sweeps.await.context("sweep loop panicked")?;
    for store in &stores {
        info!(
            store = %mask_url(store.url()),
            remaining = store.len(action.table()),
            "store contents"
        );
    }
    info!(sweeps, replayed, "demo finished");
    Ok(())
}

fn init_tracing() -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,lifeboat=debug"))
        .context("invalid RUST_LOG filter")?;

    let fmt_layer = fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;
    Ok(())
}
