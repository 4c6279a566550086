//! Order watcher: polls one rented number until its code arrives.
//!
//! Each watch is a tokio task that sleeps through a fixed ascending schedule
//! and classifies one status reply per step:
//! - `CodeReady` and `TerminalNegative` notify once and end the watch
//! - `TransientError` is counted; the first one sends a single "slow
//!   connection" notice and hitting the ceiling ends the watch early
//! - `Pending` clears the error streak
//!
//! Running out of schedule is a normal outcome (one "timed out" notice).

pub mod registry;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::WatchConfig,
    domain::{ChatId, OrderId, OrderStatus},
    formatting,
    messaging::port::MessagingPort,
    orders::OrderBook,
    ports::{StatusQuery, StatusReply, TerminalReason},
};

use registry::{SessionGuard, WatchKey, WatchRegistry};

/// How a watch ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchOutcome {
    CodeReceived { code: String, phone: String },
    Terminated(TerminalReason),
    ErrorBudgetExhausted,
    TimedOut,
    Cancelled,
}

/// Summary of a finished watch, mostly for logs and tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchReport {
    pub outcome: WatchOutcome,
    pub queries: usize,
    pub consecutive_errors: u32,
    pub notified_slow: bool,
}

/// Handle to a running watch.
///
/// Dropping it does not stop the watch.
#[derive(Debug)]
pub struct WatchHandle {
    key: WatchKey,
    cancel: CancellationToken,
    join: JoinHandle<Option<WatchReport>>,
}

impl WatchHandle {
    pub fn key(&self) -> &WatchKey {
        &self.key
    }

    /// Stop the watch at its next suspension point, without notifying anyone.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the watch to end. `None` if it died from an internal fault.
    pub async fn finished(self) -> Option<WatchReport> {
        self.join.await.ok().flatten()
    }
}

#[derive(Clone)]
pub struct OrderWatcher {
    inner: Arc<WatcherInner>,
}

struct WatcherInner {
    cfg: WatchConfig,
    status: Arc<dyn StatusQuery>,
    messenger: Arc<dyn MessagingPort>,
    orders: Arc<OrderBook>,
    registry: Arc<WatchRegistry>,
}

/// Mutable state of one in-flight watch. Lives only inside its task.
struct WatchSession {
    guard: SessionGuard,
    consecutive_errors: u32,
    notified_slow: bool,
    queries: usize,
}

impl WatchSession {
    fn new(guard: SessionGuard) -> Self {
        Self {
            guard,
            consecutive_errors: 0,
            notified_slow: false,
            queries: 0,
        }
    }

    fn key(&self) -> &WatchKey {
        self.guard.key()
    }

    fn finish(self, outcome: WatchOutcome) -> WatchReport {
        WatchReport {
            outcome,
            queries: self.queries,
            consecutive_errors: self.consecutive_errors,
            notified_slow: self.notified_slow,
        }
    }
}

impl OrderWatcher {
    pub fn new(
        cfg: WatchConfig,
        status: Arc<dyn StatusQuery>,
        messenger: Arc<dyn MessagingPort>,
        orders: Arc<OrderBook>,
    ) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                cfg,
                status,
                messenger,
                orders,
                registry: Arc::new(WatchRegistry::new()),
            }),
        }
    }

    /// Start watching `order_id` on behalf of `requester`.
    ///
    /// Returns immediately. `None` means the same order is already being
    /// watched for this requester and nothing was started.
    pub fn watch(&self, order_id: OrderId, requester: ChatId) -> Option<WatchHandle> {
        let key = WatchKey {
            requester,
            order_id,
        };
        let Some(guard) = self.inner.registry.admit(key.clone()) else {
            debug!(
                order_id = %key.order_id,
                chat_id = requester.0,
                "watch already running, ignoring duplicate"
            );
            return None;
        };
        let cancel = guard.cancel_token();

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.run(WatchSession::new(guard)).await });

        let log_key = key.clone();
        let join = tokio::spawn(async move {
            match task.await {
                Ok(report) => Some(report),
                Err(e) if e.is_panic() => {
                    error!(
                        order_id = %log_key.order_id,
                        chat_id = log_key.requester.0,
                        "watch aborted by internal fault: {e}"
                    );
                    None
                }
                Err(e) => {
                    warn!(order_id = %log_key.order_id, "watch task ended abnormally: {e}");
                    None
                }
            }
        });

        Some(WatchHandle { key, cancel, join })
    }

    pub fn is_watching(&self, requester: ChatId, order_id: &OrderId) -> bool {
        self.inner.registry.contains(&WatchKey {
            requester,
            order_id: order_id.clone(),
        })
    }

    pub fn active_watches(&self) -> usize {
        self.inner.registry.active_count()
    }

    /// Abandon every in-flight watch silently (process shutdown).
    pub fn shutdown(&self) {
        let n = self.inner.registry.cancel_all();
        if n > 0 {
            info!("cancelled {n} in-flight watches");
        }
    }
}

impl WatcherInner {
    async fn run(&self, mut session: WatchSession) -> WatchReport {
        let key = session.key().clone();
        let cancel = session.guard.cancel_token();
        info!(
            order_id = %key.order_id,
            chat_id = key.requester.0,
            steps = self.cfg.schedule.len(),
            "watch started"
        );

        for wait in &self.cfg.schedule {
            tokio::select! {
                _ = cancel.cancelled() => return self.cancelled(session),
                _ = sleep(*wait) => {}
            }

            session.queries += 1;
            let reply = tokio::select! {
                _ = cancel.cancelled() => return self.cancelled(session),
                reply = self.status.query(&key.order_id) => reply,
            };

            match reply {
                StatusReply::Pending => {
                    session.consecutive_errors = 0;
                }
                StatusReply::CodeReady { code, phone } => {
                    session.consecutive_errors = 0;
                    let phone = phone
                        .or_else(|| {
                            self.orders
                                .find(key.requester, &key.order_id)
                                .map(|o| o.phone().to_string())
                        })
                        .unwrap_or_else(|| "unknown".to_string());

                    self.notify(key.requester, &formatting::code_received(&code, &phone))
                        .await;
                    self.settle(&key, OrderStatus::Fulfilled, Some(code.clone()));
                    info!(order_id = %key.order_id, queries = session.queries, "code received");
                    return session.finish(WatchOutcome::CodeReceived { code, phone });
                }
                StatusReply::TerminalNegative(reason) => {
                    session.consecutive_errors = 0;
                    self.notify(
                        key.requester,
                        &formatting::order_terminated(&key.order_id, reason),
                    )
                    .await;
                    let status = match reason {
                        TerminalReason::Cancelled => OrderStatus::Cancelled,
                        TerminalReason::NotFound => OrderStatus::Expired,
                    };
                    self.settle(&key, status, None);
                    info!(order_id = %key.order_id, ?reason, "order ended at vendor");
                    return session.finish(WatchOutcome::Terminated(reason));
                }
                StatusReply::TransientError { message } => {
                    session.consecutive_errors += 1;
                    warn!(
                        order_id = %key.order_id,
                        consecutive = session.consecutive_errors,
                        "status query failed: {message}"
                    );

                    if session.consecutive_errors >= self.cfg.error_ceiling {
                        self.notify(key.requester, &formatting::check_manually(&key.order_id))
                            .await;
                        warn!(order_id = %key.order_id, "error ceiling reached, giving up");
                        return session.finish(WatchOutcome::ErrorBudgetExhausted);
                    }

                    if !session.notified_slow {
                        session.notified_slow = true;
                        self.notify(key.requester, &formatting::connection_slow())
                            .await;
                    }
                }
            }
        }

        self.notify(
            key.requester,
            &formatting::timed_out(self.cfg.total_wait().as_secs()),
        )
        .await;
        info!(order_id = %key.order_id, "watch schedule exhausted without a code");
        session.finish(WatchOutcome::TimedOut)
    }

    fn cancelled(&self, session: WatchSession) -> WatchReport {
        info!(order_id = %session.key().order_id, "watch cancelled");
        session.finish(WatchOutcome::Cancelled)
    }

    /// Best-effort send. Failures are logged, never retried.
    async fn notify(&self, chat_id: ChatId, html: &str) {
        if let Err(e) = self.messenger.send_html(chat_id, html).await {
            warn!(chat_id = chat_id.0, "failed to deliver notice: {e}");
        }
    }

    fn settle(&self, key: &WatchKey, status: OrderStatus, code: Option<String>) {
        if self.orders.find(key.requester, &key.order_id).is_none() {
            debug!(order_id = %key.order_id, "order not tracked in order book");
            return;
        }
        if let Err(e) = self
            .orders
            .settle(key.requester, &key.order_id, status, code)
        {
            warn!(order_id = %key.order_id, "could not record order status: {e}");
        }
    }
}

#[cfg(test)]
mod tests;
