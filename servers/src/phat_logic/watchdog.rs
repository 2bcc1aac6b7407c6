use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sd_notify::NotifyState;
use tokio::sync::broadcast;
use tokio::time::{MissedTickBehavior, interval};

/// Ping period for a systemd watchdog timeout of `usec` microseconds.
pub fn ping_period(usec: u64) -> Option<Duration> {
    (usec > 0).then(|| Duration::from_micros(usec / 2).max(Duration::from_millis(1)))
}

fn notify(state: NotifyState<'_>) {
    if let Err(e) = sd_notify::notify(false, &[state]) {
        tracing::warn!(error = %e, "systemd notification failed");
    }
}

/// Reports READY to systemd and keeps the watchdog fed while `connected` is
/// set. A lost broker connection stops the pings so systemd restarts us.
pub async fn run(connected: Arc<AtomicBool>, mut shutdown: broadcast::Receiver<()>) {
    notify(NotifyState::Ready);

    let mut usec = 0;
    let period = if sd_notify::watchdog_enabled(false, &mut usec) {
        ping_period(usec)
    } else {
        None
    };
    let Some(period) = period else {
        tracing::warn!("systemd watchdog not enabled; liveness pings disabled");
        let _ = shutdown.recv().await;
        notify(NotifyState::Stopping);
        return;
    };

    tracing::info!(period_ms = period.as_millis() as u64, "systemd watchdog enabled");
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("watchdog received shutdown signal");
                notify(NotifyState::Stopping);
                break;
            }
            _ = ticker.tick() => {
                if connected.load(Ordering::SeqCst) {
                    notify(NotifyState::Watchdog);
                } else {
                    tracing::warn!("MQTT disconnected; withholding watchdog ping");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pings_at_half_the_timeout() {
        assert_eq!(ping_period(30_000_000), Some(Duration::from_secs(15)));
        assert_eq!(ping_period(0), None);
        assert_eq!(ping_period(1), Some(Duration::from_millis(1)));
    }

    #[tokio::test]
    async fn exits_on_shutdown_outside_systemd() {
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(run(Arc::new(AtomicBool::new(true)), rx));
        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
