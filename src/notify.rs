// =============================================================================
// NOTIFICATIONS
// =============================================================================
// Fire-and-forget: the order service queues a notification after its store
// call has committed and moves on. A background worker delivers through a
// `Transport`, retrying with backoff; a notification that keeps failing is
// logged and dropped. Delivery never affects the order.
// =============================================================================

use async_trait::async_trait;
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BASE_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug)]
pub enum NotificationKind {
    OrderCreated,
    PaymentConfirmed,
    /// Item contents are looked up by the transport from the order.
    VirtualDelivered { items: usize },
    Shipped { tracking_no: String },
    Completed,
    Cancelled,
    Refunded,
    ResubmitRequested { form_url: String },
    /// Account created from a shipping form. `password` is set when the
    /// service generated it.
    Welcome { email: String, password: Option<SecretString> },
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::OrderCreated => "order_created",
            NotificationKind::PaymentConfirmed => "payment_confirmed",
            NotificationKind::VirtualDelivered { .. } => "virtual_delivered",
            NotificationKind::Shipped { .. } => "shipped",
            NotificationKind::Completed => "completed",
            NotificationKind::Cancelled => "cancelled",
            NotificationKind::Refunded => "refunded",
            NotificationKind::ResubmitRequested { .. } => "resubmit_requested",
            NotificationKind::Welcome { .. } => "welcome",
        }
    }
}

#[derive(Debug)]
pub struct Notification {
    pub kind: NotificationKind,
    pub order_no: Option<String>,
    pub recipient: Option<String>,
}

impl Notification {
    pub fn for_order(kind: NotificationKind, order_no: &str, recipient: Option<&str>) -> Self {
        Self {
            kind,
            order_no: Some(order_no.to_string()),
            recipient: recipient.map(str::to_string),
        }
    }
}

/// Accepts notifications without waiting for delivery.
pub trait Notifier: Send + Sync {
    fn queue(&self, notification: Notification);
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Default transport: writes a structured log line per notification. Secret
/// fields are never rendered.
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn send(&self, notification: &Notification) -> anyhow::Result<()> {
        info!(
            kind = notification.kind.as_str(),
            order_no = notification.order_no.as_deref().unwrap_or("-"),
            recipient = notification.recipient.as_deref().unwrap_or("-"),
            "Notification delivered"
        );
        Ok(())
    }
}

// =============================================================================
// QUEUE + WORKER
// =============================================================================

pub struct NotificationQueue {
    tx: mpsc::UnboundedSender<Notification>,
}

impl NotificationQueue {
    /// Spawn the delivery worker. It drains what is already queued and stops
    /// once `shutdown` is cancelled.
    pub fn start(
        transport: Arc<dyn Transport>,
        max_attempts: u32,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(rx, transport, max_attempts.max(1), shutdown));
        (Self { tx }, worker)
    }
}

impl Notifier for NotificationQueue {
    fn queue(&self, notification: Notification) {
        let kind = notification.kind.as_str();
        if self.tx.send(notification).is_err() {
            warn!(kind, "Notification worker stopped; notification dropped");
            crate::metrics::record_notification_failure(kind);
        }
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<Notification>,
    transport: Arc<dyn Transport>,
    max_attempts: u32,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Some(notification) => deliver(transport.as_ref(), &notification, max_attempts).await,
                None => return,
            },
        }
    }

    rx.close();
    while let Some(notification) = rx.recv().await {
        deliver(transport.as_ref(), &notification, max_attempts).await;
    }
    debug!("Notification worker stopped");
}

async fn deliver(transport: &dyn Transport, notification: &Notification, max_attempts: u32) {
    let kind = notification.kind.as_str();
    for attempt in 1..=max_attempts {
        match transport.send(notification).await {
            Ok(()) => return,
            Err(e) if attempt < max_attempts => {
                let backoff = BASE_BACKOFF * 2u32.pow(attempt - 1);
                debug!(kind, attempt, error = %e, "Notification attempt failed; retrying");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                warn!(
                    kind,
                    order_no = notification.order_no.as_deref().unwrap_or("-"),
                    attempts = max_attempts,
                    error = %e,
                    "Notification dropped after retries"
                );
                crate::metrics::record_notification_failure(kind);
            }
        }
    }
}

// =============================================================================
// TEST DOUBLE
// =============================================================================

#[cfg(test)]
#[derive(Default)]
pub struct RecordingNotifier {
    queued: parking_lot::Mutex<Vec<Notification>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.queued.lock())
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.queued.lock().iter().map(|n| n.kind.as_str()).collect()
    }
}

#[cfg(test)]
impl Notifier for RecordingNotifier {
    fn queue(&self, notification: Notification) {
        self.queued.lock().push(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures_left: AtomicU32,
        sent: AtomicU32,
    }

    #[async_trait]
    impl Transport for Flaky {
        async fn send(&self, _notification: &Notification) -> anyhow::Result<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("smtp unavailable");
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_delivered() {
        let transport = Arc::new(Flaky { failures_left: AtomicU32::new(2), sent: AtomicU32::new(0) });
        let shutdown = CancellationToken::new();
        let (queue, worker) = NotificationQueue::start(transport.clone(), 3, shutdown.clone());

        queue.queue(Notification::for_order(NotificationKind::Completed, "ORD1", None));
        drop(queue);
        worker.await.unwrap();

        assert_eq!(transport.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let transport = Arc::new(Flaky { failures_left: AtomicU32::new(10), sent: AtomicU32::new(0) });
        let (queue, worker) = NotificationQueue::start(transport.clone(), 3, CancellationToken::new());

        queue.queue(Notification::for_order(NotificationKind::Cancelled, "ORD2", None));
        queue.queue(Notification::for_order(NotificationKind::Refunded, "ORD2", None));
        drop(queue);
        worker.await.unwrap();

        assert_eq!(transport.sent.load(Ordering::SeqCst), 0);
        assert_eq!(transport.failures_left.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn welcome_debug_hides_password() {
        let notification = Notification {
            kind: NotificationKind::Welcome {
                email: "buyer@shop.test".into(),
                password: Some(SecretString::from("Xy7!abcdEFGH".to_string())),
            },
            order_no: None,
            recipient: Some("buyer@shop.test".into()),
        };
        assert!(!format!("{notification:?}").contains("Xy7!abcdEFGH"));
    }
}
