//! Durable output log with replaying fan-out.
//!
//! A session's producer appends [`OutputEvent`]s to an [`OutputLog`]. Each
//! subscriber is a cursor into that log, so a subscriber attaching late first
//! replays everything already recorded and then follows live output. Events
//! become visible to subscribers only after they are stored, and a slow
//! subscriber never holds back the producer or other subscribers.
//!
//! Appending a terminal event (`Exit` or `Terminated`) seals the log. A sealed
//! log rejects further appends, which keeps exactly one terminal event per
//! session no matter how many parties race to end it.

use std::ops::Range;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures_util::Stream;
use protocol::{OutputEvent, SessionId};
use tokio::sync::watch;

use super::now_millis;

/// A boxed stream of output events, as handed to subscribers.
pub type OutputStream = Pin<Box<dyn Stream<Item = OutputEvent> + Send>>;

/// A stored event. Payloads live once, in `LogState::bytes`.
enum Entry {
    Stdout(Range<usize>),
    Stderr(Range<usize>),
    Exit(i32),
    Terminated,
}

#[derive(Default)]
struct LogState {
    entries: Vec<Entry>,
    /// Concatenated stdout and stderr payloads, in append order.
    bytes: Vec<u8>,
    sealed: bool,
}

impl LogState {
    fn push(&mut self, event: OutputEvent) {
        let start = self.bytes.len();
        let entry = match event {
            OutputEvent::Stdout(data) => {
                self.bytes.extend_from_slice(&data);
                Entry::Stdout(start..self.bytes.len())
            }
            OutputEvent::Stderr(data) => {
                self.bytes.extend_from_slice(&data);
                Entry::Stderr(start..self.bytes.len())
            }
            OutputEvent::Exit(code) => {
                self.sealed = true;
                Entry::Exit(code)
            }
            OutputEvent::Terminated => {
                self.sealed = true;
                Entry::Terminated
            }
        };
        self.entries.push(entry);
    }

    fn event(&self, index: usize) -> Option<OutputEvent> {
        Some(match self.entries.get(index)? {
            Entry::Stdout(range) => OutputEvent::Stdout(self.bytes[range.clone()].to_vec()),
            Entry::Stderr(range) => OutputEvent::Stderr(self.bytes[range.clone()].to_vec()),
            Entry::Exit(code) => OutputEvent::Exit(*code),
            Entry::Terminated => OutputEvent::Terminated,
        })
    }
}

/// Append-only event log of one session.
pub struct OutputLog {
    session_id: SessionId,
    state: RwLock<LogState>,
    /// Number of stored events; bumped on every append to wake subscribers.
    version: watch::Sender<usize>,
    subscribers: AtomicUsize,
    last_activity: AtomicU64,
}

impl OutputLog {
    pub fn new(session_id: impl Into<SessionId>) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            session_id: session_id.into(),
            state: RwLock::new(LogState::default()),
            version,
            subscribers: AtomicUsize::new(0),
            last_activity: AtomicU64::new(now_millis()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn read(&self) -> RwLockReadGuard<'_, LogState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LogState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an event and wake subscribers.
    ///
    /// Returns `false` if the log is already sealed; the event is dropped.
    pub fn append(&self, event: OutputEvent) -> bool {
        let mut state = self.write();
        if state.sealed {
            tracing::debug!(
                session_id = %self.session_id,
                event = event_kind(&event),
                "Dropping output appended after terminal event"
            );
            return false;
        }

        state.push(event);

        // Published while still holding the lock so wakeups stay in append order.
        self.version.send_replace(state.entries.len());
        drop(state);

        self.touch();
        true
    }

    /// All stdout and stderr bytes recorded so far.
    pub fn buffer(&self) -> Vec<u8> {
        self.read().bytes.clone()
    }

    /// Size of [`OutputLog::buffer`] without copying it.
    pub fn byte_len(&self) -> u64 {
        self.read().bytes.len() as u64
    }

    /// Number of stored events.
    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all stored events.
    pub fn events(&self) -> Vec<OutputEvent> {
        let state = self.read();
        (0..state.entries.len()).filter_map(|i| state.event(i)).collect()
    }

    pub fn is_sealed(&self) -> bool {
        self.read().sealed
    }

    /// The terminal event, once the log is sealed.
    pub fn terminal_event(&self) -> Option<OutputEvent> {
        let state = self.read();
        if state.sealed {
            state.event(state.entries.len().checked_sub(1)?)
        } else {
            None
        }
    }

    /// Resolve once the log is sealed.
    pub async fn sealed(&self) {
        let mut version = self.version.subscribe();
        loop {
            version.borrow_and_update();
            if self.is_sealed() {
                return;
            }
            if version.changed().await.is_err() {
                return;
            }
        }
    }

    /// Attach a new cursor positioned at the first event.
    pub fn subscribe(self: &Arc<Self>) -> OutputSubscriber {
        let count = self.subscribers.fetch_add(1, Ordering::SeqCst) + 1;
        self.touch();
        tracing::debug!(session_id = %self.session_id, subscribers = count, "Subscriber attached");

        OutputSubscriber {
            log: Arc::clone(self),
            version: self.version.subscribe(),
            cursor: 0,
        }
    }

    /// Shorthand for `subscribe().into_stream()`.
    pub fn stream(self: &Arc<Self>) -> OutputStream {
        self.subscribe().into_stream()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::SeqCst)
    }

    /// Unix milliseconds of the last append or attach.
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }
}

impl std::fmt::Debug for OutputLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("OutputLog")
            .field("session_id", &self.session_id)
            .field("events", &state.entries.len())
            .field("bytes", &state.bytes.len())
            .field("sealed", &state.sealed)
            .finish()
    }
}

fn event_kind(event: &OutputEvent) -> &'static str {
    match event {
        OutputEvent::Stdout(_) => "stdout",
        OutputEvent::Stderr(_) => "stderr",
        OutputEvent::Exit(_) => "exit",
        OutputEvent::Terminated => "terminated",
    }
}

/// A cursor over an [`OutputLog`].
///
/// Dropping the subscriber detaches it; the log and other subscribers are
/// unaffected.
pub struct OutputSubscriber {
    log: Arc<OutputLog>,
    version: watch::Receiver<usize>,
    cursor: usize,
}

impl OutputSubscriber {
    /// Next event in log order, waiting for the producer if caught up.
    ///
    /// Returns `None` after the terminal event has been delivered.
    pub async fn next_event(&mut self) -> Option<OutputEvent> {
        loop {
            // Mark the current version seen before inspecting the log, so an
            // append racing with this check still wakes `changed()` below.
            self.version.borrow_and_update();
            {
                let state = self.log.read();
                if let Some(event) = state.event(self.cursor) {
                    self.cursor += 1;
                    return Some(event);
                }
                if state.sealed {
                    return None;
                }
            }

            if self.version.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Number of events delivered so far.
    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn into_stream(self) -> OutputStream {
        Box::pin(futures_util::stream::unfold(self, |mut subscriber| async move {
            let event = subscriber.next_event().await?;
            Some((event, subscriber))
        }))
    }
}

impl Drop for OutputSubscriber {
    fn drop(&mut self) {
        let remaining = self.log.subscribers.fetch_sub(1, Ordering::SeqCst) - 1;
        tracing::trace!(
            session_id = %self.log.session_id,
            subscribers = remaining,
            "Subscriber detached"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::time::Duration;

    fn stdout(s: &str) -> OutputEvent {
        OutputEvent::Stdout(s.as_bytes().to_vec())
    }

    fn stderr(s: &str) -> OutputEvent {
        OutputEvent::Stderr(s.as_bytes().to_vec())
    }

    #[test]
    fn test_buffer_concatenates_in_append_order() {
        let log = OutputLog::new("s1");
        assert!(log.buffer().is_empty());

        log.append(stdout("a"));
        log.append(stderr("b"));
        log.append(stdout("c"));

        assert_eq!(log.buffer(), b"abc");
        assert_eq!(log.byte_len(), 3);
        assert_eq!(log.len(), 3);
        assert!(!log.is_sealed());
    }

    #[test]
    fn test_terminal_event_seals_log() {
        let log = OutputLog::new("s1");
        log.append(stdout("x"));
        assert!(log.append(OutputEvent::Exit(0)));

        assert!(log.is_sealed());
        assert!(!log.append(stdout("late")));
        assert!(!log.append(OutputEvent::Terminated));

        assert_eq!(log.buffer(), b"x");
        assert_eq!(log.events(), vec![stdout("x"), OutputEvent::Exit(0)]);
        assert_eq!(log.terminal_event(), Some(OutputEvent::Exit(0)));
    }

    #[test]
    fn test_events_are_rebuilt_from_single_buffer() {
        let log = OutputLog::new("s1");
        let appended = vec![
            stdout("first "),
            stderr(""),
            stderr("warn "),
            stdout("last"),
            OutputEvent::Terminated,
        ];
        for event in appended.clone() {
            log.append(event);
        }

        assert_eq!(log.events(), appended);
        assert_eq!(log.buffer(), b"first warn last");
        assert_eq!(log.byte_len(), 15);
        assert_eq!(log.len(), 5);
        assert_eq!(log.terminal_event(), Some(OutputEvent::Terminated));
    }

    #[tokio::test]
    async fn test_late_subscriber_replays_complete_history_once() {
        let log = Arc::new(OutputLog::new("s1"));
        log.append(stdout("one"));
        log.append(stderr("two"));
        log.append(OutputEvent::Exit(0));

        let events: Vec<_> = log.stream().collect().await;
        assert_eq!(
            events,
            vec![stdout("one"), stderr("two"), OutputEvent::Exit(0)]
        );
    }

    #[tokio::test]
    async fn test_live_subscriber_follows_producer() {
        let log = Arc::new(OutputLog::new("s1"));
        let mut subscriber = log.subscribe();

        let producer = {
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                for i in 0..50 {
                    log.append(stdout(&i.to_string()));
                    if i % 7 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                log.append(OutputEvent::Exit(3));
            })
        };

        let mut received = Vec::new();
        while let Some(event) = subscriber.next_event().await {
            received.push(event);
        }
        producer.await.unwrap();

        assert_eq!(received.len(), 51);
        assert_eq!(received, log.events());
    }

    #[tokio::test]
    async fn test_subscribers_at_different_times_see_identical_sequences() {
        let log = Arc::new(OutputLog::new("s1"));
        let early = log.stream();

        log.append(stdout("hello "));
        let late = log.stream();
        log.append(stdout("world"));
        log.append(OutputEvent::Exit(0));

        let early: Vec<_> = early.collect().await;
        let late: Vec<_> = late.collect().await;
        assert_eq!(early, late);
        assert_eq!(
            early.iter().filter(|e| **e == OutputEvent::Exit(0)).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_buffer_matches_observed_prefix() {
        let log = Arc::new(OutputLog::new("s1"));
        let mut subscriber = log.subscribe();
        let mut observed = Vec::new();

        for chunk in ["ab", "cd", "ef"] {
            log.append(stdout(chunk));
            let event = subscriber.next_event().await.unwrap();
            observed.extend_from_slice(event.payload().unwrap());
            assert_eq!(log.buffer(), observed);
        }
    }

    #[tokio::test]
    async fn test_dropping_subscriber_does_not_affect_others() {
        let log = Arc::new(OutputLog::new("s1"));
        let first = log.subscribe();
        let mut second = log.subscribe();
        assert_eq!(log.subscriber_count(), 2);

        drop(first);
        assert_eq!(log.subscriber_count(), 1);

        log.append(stdout("still here"));
        assert_eq!(second.next_event().await, Some(stdout("still here")));
    }

    #[tokio::test]
    async fn test_pending_subscriber_wakes_on_append() {
        let log = Arc::new(OutputLog::new("s1"));
        let mut subscriber = log.subscribe();

        let waiter = tokio::spawn(async move { subscriber.next_event().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        log.append(OutputEvent::Terminated);
        let event = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, Some(OutputEvent::Terminated));
    }

    #[tokio::test]
    async fn test_sealed_resolves_after_terminal_event() {
        let log = Arc::new(OutputLog::new("s1"));
        let waiter = {
            let log = Arc::clone(&log);
            tokio::spawn(async move { log.sealed().await })
        };

        log.append(stdout("x"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        log.append(OutputEvent::Exit(1));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_last_activity_advances() {
        let log = OutputLog::new("s1");
        let before = log.last_activity();
        std::thread::sleep(Duration::from_millis(5));
        log.append(stdout("x"));
        assert!(log.last_activity() >= before);
    }
}
