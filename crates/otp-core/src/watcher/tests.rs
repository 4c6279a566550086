use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::Instant;

use super::*;
use crate::{
    domain::{MessageId, MessageRef, Order},
    errors::Error,
    Result,
};

/// Replays scripted replies, then repeats `fallback` forever.
struct ScriptedStatus {
    replies: Mutex<VecDeque<StatusReply>>,
    fallback: StatusReply,
    calls: AtomicUsize,
}

impl ScriptedStatus {
    fn new(replies: Vec<StatusReply>, fallback: StatusReply) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            fallback,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusQuery for ScriptedStatus {
    async fn query(&self, _order_id: &OrderId) -> StatusReply {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

struct PanickingStatus;

#[async_trait]
impl StatusQuery for PanickingStatus {
    async fn query(&self, _order_id: &OrderId) -> StatusReply {
        panic!("unexpected vendor payload");
    }
}

#[derive(Default)]
struct FakeMessenger {
    sends: Mutex<Vec<(ChatId, String, Instant)>>,
    fail: bool,
}

impl FakeMessenger {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    fn texts(&self) -> Vec<String> {
        self.sends
            .lock()
            .unwrap()
            .iter()
            .map(|(_, t, _)| t.clone())
            .collect()
    }

    fn count_containing(&self, needle: &str) -> usize {
        self.texts().iter().filter(|t| t.contains(needle)).count()
    }
}

#[async_trait]
impl MessagingPort for FakeMessenger {
    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        self.sends
            .lock()
            .unwrap()
            .push((chat_id, html.to_string(), Instant::now()));
        if self.fail {
            return Err(Error::External("telegram is down".to_string()));
        }
        Ok(MessageRef {
            chat_id,
            message_id: MessageId(1),
        })
    }
}

const SLOW: &str = "slow";
const MANUAL: &str = "check it manually";
const TIMED_OUT: &str = "No OTP received";

fn pending() -> StatusReply {
    StatusReply::Pending
}

fn transient() -> StatusReply {
    StatusReply::TransientError {
        message: "timeout".to_string(),
    }
}

fn code(code: &str, phone: Option<&str>) -> StatusReply {
    StatusReply::CodeReady {
        code: code.to_string(),
        phone: phone.map(str::to_string),
    }
}

struct Harness {
    watcher: OrderWatcher,
    status: Arc<ScriptedStatus>,
    messenger: Arc<FakeMessenger>,
    orders: Arc<OrderBook>,
}

fn harness(replies: Vec<StatusReply>, fallback: StatusReply) -> Harness {
    harness_with(WatchConfig::default(), replies, fallback, FakeMessenger::default())
}

fn harness_with(
    cfg: WatchConfig,
    replies: Vec<StatusReply>,
    fallback: StatusReply,
    messenger: FakeMessenger,
) -> Harness {
    let status = ScriptedStatus::new(replies, fallback);
    let messenger = Arc::new(messenger);
    let orders = Arc::new(OrderBook::new());
    let watcher = OrderWatcher::new(cfg, status.clone(), messenger.clone(), orders.clone());
    Harness {
        watcher,
        status,
        messenger,
        orders,
    }
}

const CHAT: ChatId = ChatId(42);

fn order_id() -> OrderId {
    OrderId("900100".to_string())
}

#[tokio::test(start_paused = true)]
async fn delivers_code_after_pending_replies() {
    let h = harness(
        vec![pending(), pending(), pending(), pending()],
        code("1234", Some("+1555")),
    );

    let report = h
        .watcher
        .watch(order_id(), CHAT)
        .expect("admitted")
        .finished()
        .await
        .expect("no fault");

    assert_eq!(
        report.outcome,
        WatchOutcome::CodeReceived {
            code: "1234".to_string(),
            phone: "+1555".to_string()
        }
    );
    assert_eq!(report.queries, 5);
    assert_eq!(h.status.calls(), 5);

    let texts = h.messenger.texts();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].contains("1234"));
    assert!(texts[0].contains("+1555"));
    assert_eq!(h.watcher.active_watches(), 0);
}

#[tokio::test(start_paused = true)]
async fn one_slow_notice_then_success_clears_error_streak() {
    let h = harness(vec![transient(), pending()], code("5678", None));
    h.orders
        .open(Order::new(order_id(), "+84901112233", CHAT))
        .unwrap();

    let report = h
        .watcher
        .watch(order_id(), CHAT)
        .unwrap()
        .finished()
        .await
        .unwrap();

    assert_eq!(h.messenger.count_containing(SLOW), 1);
    assert_eq!(h.messenger.texts().len(), 2);
    // Phone comes from the order book when the vendor does not echo it.
    assert!(h.messenger.texts()[1].contains("+84901112233"));
    assert_eq!(report.consecutive_errors, 0);
    assert!(report.notified_slow);

    let order = h.orders.get(CHAT).unwrap();
    assert_eq!(order.status(), OrderStatus::Fulfilled);
    assert_eq!(order.code(), Some("5678"));
}

#[tokio::test(start_paused = true)]
async fn aborts_at_error_ceiling_without_further_queries() {
    let h = harness(vec![], transient());

    let report = h
        .watcher
        .watch(order_id(), CHAT)
        .unwrap()
        .finished()
        .await
        .unwrap();

    assert_eq!(report.outcome, WatchOutcome::ErrorBudgetExhausted);
    assert_eq!(report.queries, 4);
    assert_eq!(report.consecutive_errors, 4);
    assert_eq!(h.messenger.count_containing(MANUAL), 1);
    assert_eq!(h.messenger.count_containing(SLOW), 1);
    assert_eq!(h.messenger.texts().len(), 2);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.status.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn times_out_once_after_the_last_interval() {
    // Also covers vendors that never report a terminal state.
    let cfg = WatchConfig::default();
    let total = cfg.total_wait();
    let h = harness_with(cfg, vec![], pending(), FakeMessenger::default());
    h.orders
        .open(Order::new(order_id(), "+84901112233", CHAT))
        .unwrap();

    let started = Instant::now();
    let report = h
        .watcher
        .watch(order_id(), CHAT)
        .unwrap()
        .finished()
        .await
        .unwrap();

    assert_eq!(report.outcome, WatchOutcome::TimedOut);
    assert_eq!(report.queries, 9);

    let sends = h.messenger.sends.lock().unwrap();
    assert_eq!(sends.len(), 1);
    assert!(sends[0].1.contains(TIMED_OUT));
    assert!(sends[0].2 - started >= total);
    drop(sends);

    // Timing out leaves the order open for a manual check.
    assert_eq!(h.orders.get(CHAT).unwrap().status(), OrderStatus::Pending);
}

#[tokio::test(start_paused = true)]
async fn duplicate_watch_is_a_no_op() {
    let h = harness(vec![pending()], code("1111", None));

    let (a, b) = tokio::join!(async { h.watcher.watch(order_id(), CHAT) }, async {
        h.watcher.watch(order_id(), CHAT)
    });
    assert!(a.is_some() ^ b.is_some());
    assert!(h.watcher.is_watching(CHAT, &order_id()));

    let report = a.or(b).unwrap().finished().await.unwrap();
    assert_eq!(report.queries, 2);
    assert_eq!(h.status.calls(), 2);
    assert_eq!(h.messenger.count_containing("1111"), 1);

    // Once finished, the same order may be watched again.
    assert!(!h.watcher.is_watching(CHAT, &order_id()));
    assert!(h.watcher.watch(order_id(), CHAT).is_some());
}

#[tokio::test(start_paused = true)]
async fn repeated_code_ready_notifies_only_once() {
    let h = harness(vec![], code("2222", Some("+1")));

    let report = h
        .watcher
        .watch(order_id(), CHAT)
        .unwrap()
        .finished()
        .await
        .unwrap();

    assert_eq!(report.queries, 1);
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.status.calls(), 1);
    assert_eq!(h.messenger.texts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn interleaved_errors_never_repeat_the_slow_notice() {
    let cfg = WatchConfig {
        error_ceiling: 3,
        ..WatchConfig::default()
    };
    let replies = vec![
        transient(),
        transient(),
        pending(),
        transient(),
        transient(),
        pending(),
        transient(),
        transient(),
        pending(),
    ];
    let h = harness_with(cfg, replies, pending(), FakeMessenger::default());

    let report = h
        .watcher
        .watch(order_id(), CHAT)
        .unwrap()
        .finished()
        .await
        .unwrap();

    assert_eq!(report.outcome, WatchOutcome::TimedOut);
    assert_eq!(h.messenger.count_containing(SLOW), 1);
    assert_eq!(h.messenger.count_containing(MANUAL), 0);
    assert_eq!(h.messenger.count_containing(TIMED_OUT), 1);
}

#[tokio::test(start_paused = true)]
async fn terminal_negative_settles_the_order() {
    for (reason, status) in [
        (TerminalReason::Cancelled, OrderStatus::Cancelled),
        (TerminalReason::NotFound, OrderStatus::Expired),
    ] {
        let h = harness(vec![pending()], StatusReply::TerminalNegative(reason));
        h.orders
            .open(Order::new(order_id(), "+84900000000", CHAT))
            .unwrap();

        let report = h
            .watcher
            .watch(order_id(), CHAT)
            .unwrap()
            .finished()
            .await
            .unwrap();

        assert_eq!(report.outcome, WatchOutcome::Terminated(reason));
        assert_eq!(h.messenger.texts().len(), 1);
        assert!(h.messenger.texts()[0].contains("900100"));
        assert_eq!(h.orders.get(CHAT).unwrap().status(), status);
    }
}

#[tokio::test(start_paused = true)]
async fn internal_fault_aborts_silently_and_releases_key() {
    let messenger = Arc::new(FakeMessenger::default());
    let watcher = OrderWatcher::new(
        WatchConfig::default(),
        Arc::new(PanickingStatus),
        messenger.clone(),
        Arc::new(OrderBook::new()),
    );

    let handle = watcher.watch(order_id(), CHAT).unwrap();
    assert!(handle.finished().await.is_none());

    assert!(messenger.texts().is_empty());
    assert_eq!(watcher.active_watches(), 0);
    assert!(watcher.watch(order_id(), CHAT).is_some());
}

#[tokio::test(start_paused = true)]
async fn cancellation_ends_watch_without_notice() {
    let h = harness(vec![], pending());

    let handle = h.watcher.watch(order_id(), CHAT).unwrap();
    tokio::time::sleep(Duration::from_secs(12)).await;
    handle.cancel();

    let report = handle.finished().await.unwrap();
    assert_eq!(report.outcome, WatchOutcome::Cancelled);
    assert_eq!(report.queries, 2);
    assert!(h.messenger.texts().is_empty());
    assert_eq!(h.watcher.active_watches(), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_abandons_all_watches() {
    let h = harness(vec![], pending());

    let a = h.watcher.watch(OrderId("1".to_string()), CHAT).unwrap();
    let b = h.watcher.watch(OrderId("2".to_string()), ChatId(7)).unwrap();
    assert_eq!(h.watcher.active_watches(), 2);

    h.watcher.shutdown();

    assert_eq!(a.finished().await.unwrap().outcome, WatchOutcome::Cancelled);
    assert_eq!(b.finished().await.unwrap().outcome, WatchOutcome::Cancelled);
    assert_eq!(h.watcher.active_watches(), 0);
    assert!(h.messenger.texts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn notifier_failures_do_not_break_the_watch() {
    let h = harness_with(
        WatchConfig::default(),
        vec![transient()],
        code("3333", Some("+1")),
        FakeMessenger::failing(),
    );
    h.orders.open(Order::new(order_id(), "+1", CHAT)).unwrap();

    let report = h
        .watcher
        .watch(order_id(), CHAT)
        .unwrap()
        .finished()
        .await
        .unwrap();

    assert!(matches!(report.outcome, WatchOutcome::CodeReceived { .. }));
    // Attempted once each, never retried.
    assert_eq!(h.messenger.texts().len(), 2);
    assert_eq!(h.orders.get(CHAT).unwrap().status(), OrderStatus::Fulfilled);
}

#[tokio::test(start_paused = true)]
async fn watches_of_different_orders_run_independently() {
    let h = harness(vec![], code("4444", Some("+1")));

    let a = h.watcher.watch(OrderId("1".to_string()), CHAT).unwrap();
    let b = h.watcher.watch(OrderId("2".to_string()), CHAT).unwrap();

    let (ra, rb) = tokio::join!(a.finished(), b.finished());
    assert!(ra.is_some() && rb.is_some());
    assert_eq!(h.messenger.count_containing("4444"), 2);
}
