//! Periodic re-dial of known addresses without a live connection.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::manager::Command;

/// `run_reconnector` asks the manager to dial every current candidate once
/// per interval. The manager drops addresses that are already being dialed.
pub async fn run_reconnector(
    commands: mpsc::Sender<Command>,
    candidates: watch::Receiver<Vec<String>>,
    interval: Duration,
    jitter_ratio: f64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut rng = StdRng::from_os_rng();
    loop {
        let sleep_dur = with_jitter(interval, jitter_ratio, &mut rng);
        tokio::select! {
            () = tokio::time::sleep(sleep_dur) => {},
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            },
        }

        let addresses = candidates.borrow().clone();
        if !addresses.is_empty() {
            debug!("reconnect: {} candidates", addresses.len());
        }
        for address in addresses {
            if commands.send(Command::ConnectTo { address }).await.is_err() {
                info!("reconnect: manager gone");
                return;
            }
        }
    }
    info!("reconnect: shutdown");
}

pub(crate) fn with_jitter(base: Duration, ratio: f64, rng: &mut StdRng) -> Duration {
    if ratio <= 0.0 {
        return base;
    }
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let extra = ((base_ms as f64) * ratio * rng.random::<f64>()) as u64;
    Duration::from_millis(base_ms.saturating_add(extra))
}
