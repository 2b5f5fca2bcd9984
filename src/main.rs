use std::{future::Future, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use rand::Rng;

use maush_relay::{
    backend::BackendClient,
    config::Config,
    events::init_logging,
    matrix::MatrixTransport,
    relay::ExecRelay,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::parse();
    init_logging(&cfg)?;

    let transport = Arc::new(MatrixTransport::new(
        cfg.homeserver.clone(),
        cfg.access_token.clone(),
        cfg.user_id.clone(),
    ));
    let backend = BackendClient::new(cfg.backend_url.clone());
    let relay = Arc::new(ExecRelay::new(transport.clone(), backend, cfg.relay_policy()));

    // Skip history: only events after startup are handled.
    let initial = transport
        .sync(None, 0)
        .await
        .context("initial sync failed")?;
    tracing::info!(
        target = "maush_relay::main",
        user_id = %cfg.user_id,
        rooms = cfg.rooms_vec().len(),
        backend = %cfg.backend_url,
        "relay started"
    );

    let mut since = initial.next_batch;
    let mut attempt = 0u32;
    loop {
        let batch = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(target = "maush_relay::main", "shutting down");
                return Ok(());
            }
            batch = transport.sync(Some(&since), cfg.sync_timeout_ms) => batch,
        };
        match batch {
            Ok(batch) => {
                attempt = 0;
                since = batch.next_batch;
                for event in batch.events {
                    let relay = relay.clone();
                    tokio::spawn(async move { relay.handle(event).await });
                }
            }
            Err(error) => {
                attempt = attempt.saturating_add(1);
                let delay = reconnect_delay(attempt);
                tracing::warn!(
                    target = "maush_relay::main",
                    error = %error,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "sync failed, retrying"
                );
                if sleep_or_shutdown(delay, tokio::signal::ctrl_c()).await {
                    tracing::info!(target = "maush_relay::main", "shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// Returns `true` when `shutdown` resolves before `delay` elapses.
async fn sleep_or_shutdown<F: Future>(delay: Duration, shutdown: F) -> bool {
    tokio::select! {
        _ = shutdown => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

fn reconnect_delay(attempt: u32) -> Duration {
    let base_ms = 1_000u64.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    let jitter = rand::thread_rng().gen_range(0..=250);
    Duration::from_millis(base_ms.min(30_000) + jitter)
}

#[cfg(test)]
mod tests {
    use std::{future, time::Duration};

    use super::{reconnect_delay, sleep_or_shutdown};

    #[test]
    fn reconnect_delay_backs_off_and_caps() {
        let first = reconnect_delay(1);
        assert!(first >= Duration::from_millis(1_000) && first <= Duration::from_millis(1_250));
        let third = reconnect_delay(3);
        assert!(third >= Duration::from_millis(4_000));
        let late = reconnect_delay(40);
        assert!(late <= Duration::from_millis(30_250));
    }

    #[tokio::test]
    async fn shutdown_interrupts_backoff() {
        let interrupted = tokio::time::timeout(
            Duration::from_secs(5),
            sleep_or_shutdown(Duration::from_secs(30), future::ready(())),
        )
        .await
        .expect("backoff should end as soon as shutdown fires");
        assert!(interrupted);

        assert!(!sleep_or_shutdown(Duration::from_millis(10), future::pending::<()>()).await);
    }
}
