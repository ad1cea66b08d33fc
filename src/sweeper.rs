// =============================================================================
// AUTO-CANCEL SWEEPER
// =============================================================================
// Background task that cancels orders left unpaid past the configured window.
// The interval is read from the current config snapshot before every wait, so
// a reload takes effect after the pending tick.
// =============================================================================

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::service::OrderService;

pub fn spawn(service: Arc<OrderService>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Auto-cancel sweeper started");
        loop {
            let every = Duration::from_secs(service.config().order.sweep_interval_secs.max(1));
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(every) => sweep_once(&service).await,
            }
        }
        info!("Auto-cancel sweeper stopped");
    })
}

async fn sweep_once(service: &OrderService) {
    match service.auto_cancel_expired(Utc::now()).await {
        Ok(0) => debug!("Sweep found nothing to cancel"),
        Ok(_) => {}
        Err(e) => error!(error = %e, "Auto-cancel sweep failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ConfigHandle};
    use crate::memory::MemoryStore;
    use crate::notify::RecordingNotifier;
    use crate::permissions::PermissionCache;
    use crate::store::Store;

    #[tokio::test]
    async fn stops_on_shutdown() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let service = Arc::new(OrderService::new(
            store.clone(),
            ConfigHandle::new(Config::for_tests()),
            Arc::new(RecordingNotifier::default()),
            PermissionCache::new(None, store),
        ));
        let shutdown = CancellationToken::new();
        let handle = spawn(service, shutdown.clone());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
