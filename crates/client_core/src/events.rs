use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local, NaiveDateTime, NaiveTime, Utc};
use futures::future::BoxFuture;
use shared::{domain::ChangeKind, protocol::RawMessage};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace, warn};

/// Reserved internal path that terminates the bus loop; never dispatched.
pub const SHUTDOWN_PATH: &str = "/sig/stoploop";

/// Immutable event envelope: created by one producer, consumed once by the
/// merge stage, fanned out read-only to at most one matched handler.
#[derive(Debug, Clone)]
pub struct Event {
    pub path: String,
    pub source: String,
    pub time: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(path: impl Into<String>, source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            path: path.into(),
            source: source.into(),
            time: Utc::now(),
            payload,
        }
    }

    fn shutdown() -> Self {
        Event::new(SHUTDOWN_PATH, "internal", EventPayload::Shutdown)
    }
}

#[derive(Debug, Clone)]
pub enum EventPayload {
    Message(MessageEvent),
    ContactChange {
        kind: ChangeKind,
        user_name: String,
    },
    LoginResult {
        success: bool,
    },
    TimerTick {
        period: Duration,
        count: u64,
    },
    DailyTick {
        spec: String,
        count: u64,
    },
    Shutdown,
}

/// Routed message envelope plus the fields handlers commonly branch on.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub is_group_msg: bool,
    pub is_media_msg: bool,
    pub is_sent_by_self: bool,
    pub at_me: bool,
    pub msg_type: i64,
    pub media_url: String,
    pub content: String,
    pub from_user_name: String,
    pub sender_user_name: String,
    pub raw: RawMessage,
}

type Handler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;
type Hook = Arc<dyn Fn(&Event) + Send + Sync>;

/// Fan-in of N producers into one ordered stream, with longest-prefix path
/// dispatch. Events are observed in arrival order by the single merge loop
/// and handled concurrently, one task per dispatched event.
pub struct EventBus {
    intake: Mutex<Option<UnboundedSender<Event>>>,
    merged: Mutex<Option<UnboundedReceiver<Event>>>,
    handlers: RwLock<HashMap<String, Handler>>,
    hook: RwLock<Option<Hook>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            intake: Mutex::new(Some(tx)),
            merged: Mutex::new(Some(rx)),
            handlers: RwLock::new(HashMap::new()),
            hook: RwLock::new(None),
        }
    }

    /// Push one event into the merged stream on behalf of an in-process
    /// producer (server pushes, login results).
    pub fn emit(&self, event: Event) {
        let intake = self.intake.lock().expect("bus intake poisoned");
        match intake.as_ref() {
            Some(tx) => {
                if tx.send(event).is_err() {
                    warn!("event dropped: bus loop has terminated");
                }
            }
            None => warn!("event dropped: bus intake is closed"),
        }
    }

    /// Merge one more producer into the stream. Each producer gets its own
    /// forwarder task holding a sender clone; the merged stream closes only
    /// once every clone is gone (reference-counted completion). Attaching
    /// after `run()` has started is fine.
    pub fn attach(&self, source: &str, mut events: UnboundedReceiver<Event>) {
        let tx = {
            let intake = self.intake.lock().expect("bus intake poisoned");
            intake.as_ref().cloned()
        };
        let Some(tx) = tx else {
            warn!(source, "producer not attached: bus intake is closed");
            return;
        };
        let source = source.to_string();
        tokio::spawn(async move {
            while let Some(mut event) = events.recv().await {
                event.source = source.clone();
                if tx.send(event).is_err() {
                    break;
                }
            }
            trace!(source, "producer stream exhausted");
        });
    }

    /// Drop the bus's own sender: after this, the merged stream terminates
    /// as soon as every attached producer finishes.
    pub fn close_intake(&self) {
        self.intake.lock().expect("bus intake poisoned").take();
    }

    /// Register a handler for a path prefix. When several registered
    /// patterns prefix an event's path, the longest one wins.
    pub fn handle<F, Fut>(&self, path: &str, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |event| Box::pin(handler(event)));
        self.handlers
            .write()
            .expect("bus handlers poisoned")
            .insert(clean_path(path), handler);
    }

    pub fn reset_handlers(&self) {
        self.handlers
            .write()
            .expect("bus handlers poisoned")
            .clear();
    }

    /// Pass-through observer invoked with every event right after dispatch,
    /// matched or not. Must be cheap: it runs on the merge loop.
    pub fn hook<F>(&self, hook: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        *self.hook.write().expect("bus hook poisoned") = Some(Arc::new(hook));
    }

    /// Main loop: consume the merged stream until it closes or the shutdown
    /// sentinel arrives. Every matched event is handled in its own task so
    /// a slow handler never stalls the stream.
    pub async fn run(&self) -> Result<()> {
        let mut merged = self
            .merged
            .lock()
            .expect("bus stream poisoned")
            .take()
            .ok_or_else(|| anyhow!("event bus is already running"))?;

        while let Some(event) = merged.recv().await {
            if event.path == SHUTDOWN_PATH {
                debug!("event bus stopping");
                break;
            }

            if let Some(handler) = self.match_handler(&event.path) {
                let dispatched = event.clone();
                tokio::spawn(async move {
                    handler(dispatched).await;
                });
            } else {
                trace!(path = %event.path, "no handler matched, event dropped");
            }

            let hook = self.hook.read().expect("bus hook poisoned").clone();
            if let Some(hook) = hook {
                hook(&event);
            }
        }
        Ok(())
    }

    /// Asynchronously inject the shutdown sentinel; in-flight handler tasks
    /// are left to drain on their own.
    pub fn stop(&self) {
        self.emit(Event::shutdown());
    }

    fn match_handler(&self, path: &str) -> Option<Handler> {
        let handlers = self.handlers.read().expect("bus handlers poisoned");
        find_match(handlers.keys().map(String::as_str), path)
            .and_then(|pattern| handlers.get(pattern).cloned())
    }

    /// Fixed-interval tick producer; counts up forever.
    pub fn add_timer(&self, period: Duration) {
        let (tx, rx) = mpsc::unbounded_channel();
        let path = format!("/timer/{}", format_period(period));
        tokio::spawn(async move {
            let mut count = 0u64;
            loop {
                tokio::time::sleep(period).await;
                count += 1;
                let event = Event::new(
                    path.clone(),
                    "timer",
                    EventPayload::TimerTick { period, count },
                );
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
        self.attach("timer", rx);
    }

    /// Daily wall-clock tick producer. The spec is validated here, at
    /// configuration time; a fire already past today rolls to tomorrow.
    /// Drift across the long sleeps is not compensated.
    pub fn add_timing(&self, spec: &str) -> Result<()> {
        let at = NaiveTime::parse_from_str(spec, "%H:%M")
            .map_err(|_| anyhow!("invalid daily timing spec '{spec}', expected HH:MM"))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let path = format!("/timing/{spec}");
        let spec = spec.to_string();
        tokio::spawn(async move {
            let mut count = 0u64;
            loop {
                let now = Local::now().naive_local();
                let next = next_daily(now, at);
                debug!(%next, "next daily fire scheduled");
                let wait = (next - now)
                    .to_std()
                    .unwrap_or_else(|_| Duration::from_secs(0));
                tokio::time::sleep(wait).await;
                count += 1;
                let event = Event::new(
                    path.clone(),
                    "timing",
                    EventPayload::DailyTick {
                        spec: spec.clone(),
                        count,
                    },
                );
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
        self.attach("timing", rx);
        Ok(())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn clean_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    let mut cleaned = String::new();
    if !path.starts_with('/') {
        cleaned.push('/');
    }
    cleaned.push_str(path);
    while cleaned.len() > 1 && cleaned.ends_with('/') {
        cleaned.pop();
    }
    cleaned
}

/// Longest registered pattern that prefixes `path`.
fn find_match<'a>(patterns: impl Iterator<Item = &'a str>, path: &str) -> Option<&'a str> {
    patterns
        .filter(|pattern| !pattern.is_empty() && path.starts_with(pattern))
        .max_by_key(|pattern| pattern.len())
}

/// Next occurrence of `at` strictly after `now`, rolling to tomorrow when
/// today's fire time has already passed.
fn next_daily(now: NaiveDateTime, at: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(at);
    if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    }
}

/// Tick paths use a compact period label: `/timer/60s`, `/timer/500ms`.
fn format_period(period: Duration) -> String {
    if period.subsec_nanos() == 0 {
        format!("{}s", period.as_secs())
    } else {
        format!("{}ms", period.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn clean_path_normalizes() {
        assert_eq!(clean_path(""), "/");
        assert_eq!(clean_path("msg"), "/msg");
        assert_eq!(clean_path("/msg/"), "/msg");
        assert_eq!(clean_path("/"), "/");
    }

    #[test]
    fn longest_prefix_wins() {
        let patterns = ["/msg", "/msg/group", "/contact"];
        assert_eq!(
            find_match(patterns.iter().copied(), "/msg/group/x"),
            Some("/msg/group")
        );
        assert_eq!(
            find_match(patterns.iter().copied(), "/msg/solo/x"),
            Some("/msg")
        );
        assert_eq!(find_match(patterns.iter().copied(), "/timer/60s"), None);
    }

    #[test]
    fn daily_fire_rolls_to_tomorrow_when_past() {
        let now = NaiveDateTime::parse_from_str("2017-03-01 10:00:00", "%Y-%m-%d %H:%M:%S")
            .expect("now");
        let at = NaiveTime::from_hms_opt(9, 0, 0).expect("time");
        let next = next_daily(now, at);
        assert_eq!(next.to_string(), "2017-03-02 09:00:00");

        let upcoming = NaiveTime::from_hms_opt(18, 30, 0).expect("time");
        assert_eq!(next_daily(now, upcoming).to_string(), "2017-03-01 18:30:00");
    }

    #[test]
    fn period_labels_are_compact() {
        assert_eq!(format_period(Duration::from_secs(60)), "60s");
        assert_eq!(format_period(Duration::from_millis(500)), "500ms");
    }

    fn message_stub() -> EventPayload {
        EventPayload::LoginResult { success: true }
    }

    #[tokio::test]
    async fn dispatches_to_the_most_specific_handler() {
        let bus = Arc::new(EventBus::new());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<&'static str>();

        let tx = seen_tx.clone();
        bus.handle("/msg", move |_| {
            let tx = tx.clone();
            async move {
                let _ = tx.send("/msg");
            }
        });
        let tx = seen_tx;
        bus.handle("/msg/group", move |_| {
            let tx = tx.clone();
            async move {
                let _ = tx.send("/msg/group");
            }
        });

        let runner = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.run().await })
        };

        bus.emit(Event::new("/msg/group/x", "server", message_stub()));
        assert_eq!(seen_rx.recv().await, Some("/msg/group"));

        bus.emit(Event::new("/msg/solo/x", "server", message_stub()));
        assert_eq!(seen_rx.recv().await, Some("/msg"));

        bus.stop();
        runner.await.expect("join").expect("run");
    }

    #[tokio::test]
    async fn unmatched_events_are_dropped_silently() {
        let bus = Arc::new(EventBus::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let observed = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        bus.handle("/known", move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let seen = Arc::clone(&observed);
        bus.hook(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let runner = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.run().await })
        };

        bus.emit(Event::new("/unknown/path", "server", message_stub()));
        bus.stop();
        runner.await.expect("join").expect("run");

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        // The hook still observes the unmatched event (not the sentinel).
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn merged_stream_closes_when_every_producer_finishes() {
        let bus = Arc::new(EventBus::new());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();

        let tx = seen_tx;
        bus.handle("/", move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.path);
            }
        });

        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        bus.attach("a", a_rx);
        bus.attach("b", b_rx);
        bus.close_intake();

        let runner = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.run().await })
        };

        a_tx.send(Event::new("/from/a", "", message_stub()))
            .expect("send");
        b_tx.send(Event::new("/from/b", "", message_stub()))
            .expect("send");
        drop(a_tx);
        drop(b_tx);

        // run() only returns once both producer streams are exhausted.
        runner.await.expect("join").expect("run");

        let mut paths = vec![
            seen_rx.recv().await.expect("event"),
            seen_rx.recv().await.expect("event"),
        ];
        paths.sort();
        assert_eq!(paths, ["/from/a", "/from/b"]);
    }

    #[tokio::test]
    async fn producers_attached_after_run_still_feed_the_stream() {
        let bus = Arc::new(EventBus::new());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();

        let tx = seen_tx;
        bus.handle("/late", move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.source);
            }
        });

        let runner = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.run().await })
        };

        let (late_tx, late_rx) = mpsc::unbounded_channel();
        bus.attach("late-producer", late_rx);
        late_tx
            .send(Event::new("/late", "", message_stub()))
            .expect("send");

        assert_eq!(seen_rx.recv().await.as_deref(), Some("late-producer"));

        bus.stop();
        runner.await.expect("join").expect("run");
    }

    #[tokio::test]
    async fn run_twice_is_an_error() {
        let bus = Arc::new(EventBus::new());
        let runner = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.run().await })
        };
        bus.stop();
        runner.await.expect("join").expect("first run");

        assert!(bus.run().await.is_err());
    }

    #[test]
    fn rejects_malformed_timing_specs() {
        let bus = EventBus::new();
        assert!(bus.add_timing("9am").is_err());
        assert!(bus.add_timing("25:00").is_err());
    }

    #[tokio::test]
    async fn timer_ticks_carry_an_increasing_count() {
        let bus = Arc::new(EventBus::new());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<u64>();

        let tx = seen_tx;
        bus.handle("/timer", move |event| {
            let tx = tx.clone();
            async move {
                if let EventPayload::TimerTick { count, .. } = event.payload {
                    let _ = tx.send(count);
                }
            }
        });

        let runner = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.run().await })
        };

        bus.add_timer(Duration::from_millis(10));

        let mut counts = vec![
            seen_rx.recv().await.expect("tick"),
            seen_rx.recv().await.expect("tick"),
        ];
        counts.sort_unstable();
        assert_eq!(counts, [1, 2]);

        bus.stop();
        runner.await.expect("join").expect("run");
    }
}
