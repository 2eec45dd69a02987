// Subscription manager - Live event stream into per-variable queues
use crate::domain::{FetchResult, StreamLine};
use crate::domain::record::{parse_line, split_channel};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SubscriptionStatus {
    Init,
    Initialised,
    Started,
    Stopping,
    Stopped,
    Error,
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("subscription to '{0}' is already started")]
    AlreadyStarted(String),
    #[error("cannot connect to event stream: {0}")]
    Connect(String),
    #[error("event stream read failed: {0}")]
    Read(String),
}

/// Lines of the provider's event stream, one record per item.
pub type LineStream = BoxStream<'static, Result<String, StreamError>>;

#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn connect(&self, source_id: &str, variables: &[String]) -> Result<LineStream, StreamError>;
    async fn unsubscribe(&self, source_id: &str) -> Result<(), StreamError>;
}

/// A requested variable. Periodic variables get the smaller queue bound.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    #[serde(default)]
    pub periodic: bool,
}

impl VariableSpec {
    pub fn periodic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            periodic: true,
        }
    }
}

impl From<&str> for VariableSpec {
    fn from(name: &str) -> Self {
        Self {
            name: name.to_string(),
            periodic: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamingOptions {
    pub url: String,
    /// First token of keep-alive lines.
    pub heartbeat_token: String,
    /// Multiplier turning stream timestamps into nanoseconds.
    pub timestamp_scale: i64,
    pub periodic_capacity: usize,
    pub continuous_capacity: usize,
}

impl Default for StreamingOptions {
    fn default() -> Self {
        Self {
            url: "http://localhost:8090".to_string(),
            heartbeat_token: "HEARTBEAT".to_string(),
            timestamp_scale: 1_000,
            periodic_capacity: 100,
            continuous_capacity: 1_000,
        }
    }
}

/// Bounded FIFO for one occurrence of a variable.
struct Channel {
    name: String,
    duplicate: usize,
    capacity: usize,
    queue: VecDeque<FetchResult>,
}

impl Channel {
    fn push(&mut self, result: FetchResult) {
        if self.queue.len() == self.capacity {
            self.queue.pop_front();
        }
        self.queue.push_back(result);
    }
}

type Channels = Arc<Mutex<Vec<Channel>>>;

fn lock(channels: &Channels) -> MutexGuard<'_, Vec<Channel>> {
    channels.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One live subscription per instance, against one data source.
pub struct SubscriptionManager {
    source_id: String,
    transport: Arc<dyn EventTransport>,
    options: StreamingOptions,
    channels: Channels,
    status: Arc<watch::Sender<SubscriptionStatus>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl SubscriptionManager {
    pub fn new(source_id: impl Into<String>, transport: Arc<dyn EventTransport>, options: StreamingOptions) -> Self {
        let (status, _) = watch::channel(SubscriptionStatus::Init);
        Self {
            source_id: source_id.into(),
            transport,
            options,
            channels: Arc::new(Mutex::new(Vec::new())),
            status: Arc::new(status),
            cancel: Mutex::new(None),
        }
    }

    pub fn status(&self) -> SubscriptionStatus {
        *self.status.borrow()
    }

    /// Open the event stream and start draining it into the queues.
    ///
    /// A variable listed twice gets two queues, addressed as `name@0` and
    /// `name@1`.
    pub async fn start_subscription(&self, variables: Vec<VariableSpec>) -> Result<(), StreamError> {
        // Claim the manager before connecting; a concurrent start sees Initialised.
        let claimed = self.status.send_if_modified(|status| match status {
            SubscriptionStatus::Initialised | SubscriptionStatus::Started | SubscriptionStatus::Stopping => false,
            _ => {
                *status = SubscriptionStatus::Initialised;
                true
            }
        });
        if !claimed {
            return Err(StreamError::AlreadyStarted(self.source_id.clone()));
        }

        let mut channels = Vec::with_capacity(variables.len());
        for spec in &variables {
            let duplicate = channels.iter().filter(|c: &&Channel| c.name == spec.name).count();
            let capacity = if spec.periodic {
                self.options.periodic_capacity
            } else {
                self.options.continuous_capacity
            };
            channels.push(Channel {
                name: spec.name.clone(),
                duplicate,
                capacity: capacity.max(1),
                queue: VecDeque::with_capacity(capacity.min(64)),
            });
        }
        *lock(&self.channels) = channels;

        let names: Vec<String> = variables.into_iter().map(|v| v.name).collect();
        let stream = match self.transport.connect(&self.source_id, &names).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Subscription to '{}' failed: {}", self.source_id, e);
                self.status.send_replace(SubscriptionStatus::Error);
                return Err(e);
            }
        };

        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        self.status.send_replace(SubscriptionStatus::Started);
        tracing::info!("Subscribed to {} variable(s) on '{}'", names.len(), self.source_id);

        let reader = StreamReader {
            source_id: self.source_id.clone(),
            transport: self.transport.clone(),
            heartbeat_token: self.options.heartbeat_token.clone(),
            timestamp_scale: self.options.timestamp_scale,
            channels: self.channels.clone(),
            status: self.status.clone(),
        };
        tokio::spawn(reader.run(stream, token));
        Ok(())
    }

    /// Pop the oldest sample for `variable` (`name` or `name@k`).
    ///
    /// Never waits: an empty queue yields an empty result.
    pub fn get_next_data(&self, variable: &str) -> FetchResult {
        let (name, duplicate) = split_channel(variable);
        let duplicate = duplicate.unwrap_or(0);
        lock(&self.channels)
            .iter_mut()
            .find(|c| c.name == name && c.duplicate == duplicate)
            .and_then(|c| c.queue.pop_front())
            .unwrap_or_else(FetchResult::empty)
    }

    /// Number of samples waiting for `variable`.
    pub fn pending(&self, variable: &str) -> usize {
        let (name, duplicate) = split_channel(variable);
        let duplicate = duplicate.unwrap_or(0);
        lock(&self.channels)
            .iter()
            .find(|c| c.name == name && c.duplicate == duplicate)
            .map_or(0, |c| c.queue.len())
    }

    /// Ask the reader to shut down. Returns without waiting for it.
    pub fn stop_subscription(&self) {
        let stopping = self.status.send_if_modified(|status| {
            if *status != SubscriptionStatus::Started {
                return false;
            }
            *status = SubscriptionStatus::Stopping;
            true
        });
        if !stopping {
            return;
        }
        if let Some(token) = self.cancel.lock().unwrap_or_else(PoisonError::into_inner).take() {
            token.cancel();
        }
        tracing::info!("Stopping subscription to '{}'", self.source_id);
    }

    /// Resolve once no reader is running any more.
    pub async fn wait_stopped(&self) -> SubscriptionStatus {
        let mut rx = self.status.subscribe();
        match rx
            .wait_for(|s| !matches!(s, SubscriptionStatus::Started | SubscriptionStatus::Stopping))
            .await
        {
            Ok(status) => *status,
            Err(_) => self.status(),
        }
    }
}

/// Reader half, moved onto its own task.
struct StreamReader {
    source_id: String,
    transport: Arc<dyn EventTransport>,
    heartbeat_token: String,
    timestamp_scale: i64,
    channels: Channels,
    status: Arc<watch::Sender<SubscriptionStatus>>,
}

impl StreamReader {
    async fn run(self, mut stream: LineStream, token: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                line = stream.next() => match line {
                    Some(Ok(line)) => self.dispatch(&line),
                    Some(Err(e)) => {
                        tracing::warn!("Event stream for '{}' failed: {}", self.source_id, e);
                        if self.fail() {
                            return;
                        }
                        break;
                    }
                    None => {
                        tracing::warn!("Event stream for '{}' ended unexpectedly", self.source_id);
                        if self.fail() {
                            return;
                        }
                        break;
                    }
                },
            }
        }

        drop(stream);
        if let Err(e) = self.transport.unsubscribe(&self.source_id).await {
            tracing::warn!("Unsubscribe from '{}' failed: {}", self.source_id, e);
        }
        for channel in lock(&self.channels).iter_mut() {
            channel.queue.clear();
        }
        self.status.send_replace(SubscriptionStatus::Stopped);
        tracing::info!("Subscription to '{}' stopped", self.source_id);
    }

    /// Publish Error unless a stop is already under way, in which case the
    /// caller finishes the stop instead.
    fn fail(&self) -> bool {
        self.status.send_if_modified(|status| {
            if *status == SubscriptionStatus::Stopping {
                return false;
            }
            *status = SubscriptionStatus::Error;
            true
        })
    }

    fn dispatch(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let record = match parse_line(line, &self.heartbeat_token) {
            Ok(StreamLine::Heartbeat) => {
                tracing::trace!("Heartbeat on '{}'", self.source_id);
                return;
            }
            Ok(StreamLine::Record(record)) => record,
            Err(e) => {
                tracing::warn!("Skipping malformed record on '{}': {}", self.source_id, e);
                return;
            }
        };

        let result = record.to_fetch_result(self.timestamp_scale);
        let mut channels = lock(&self.channels);
        let mut delivered = false;
        for channel in channels
            .iter_mut()
            .filter(|c| c.name == record.variable && record.duplicate.is_none_or(|k| k == c.duplicate))
        {
            channel.push(result.clone());
            delivered = true;
        }
        if !delivered {
            tracing::debug!("Record for unsubscribed '{}' dropped", record.variable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    /// Transport handing out a stream fed by the test.
    #[derive(Default)]
    struct ChannelTransport {
        feed: Mutex<Option<mpsc::UnboundedReceiver<Result<String, StreamError>>>>,
        refuse: bool,
        unsubscribed: AtomicUsize,
    }

    impl ChannelTransport {
        fn with_feed() -> (Arc<Self>, mpsc::UnboundedSender<Result<String, StreamError>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let transport = Self {
                feed: Mutex::new(Some(rx)),
                ..Self::default()
            };
            (Arc::new(transport), tx)
        }
    }

    #[async_trait]
    impl EventTransport for ChannelTransport {
        async fn connect(&self, _source_id: &str, _variables: &[String]) -> Result<LineStream, StreamError> {
            if self.refuse {
                return Err(StreamError::Connect("connection refused".to_string()));
            }
            let rx = self.feed.lock().unwrap().take().ok_or_else(|| StreamError::Connect("used".to_string()))?;
            Ok(UnboundedReceiverStream::new(rx).boxed())
        }

        async fn unsubscribe(&self, _source_id: &str) -> Result<(), StreamError> {
            self.unsubscribed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Transport whose connect takes a while and never yields lines.
    #[derive(Default)]
    struct SlowTransport {
        connects: AtomicUsize,
    }

    #[async_trait]
    impl EventTransport for SlowTransport {
        async fn connect(&self, _source_id: &str, _variables: &[String]) -> Result<LineStream, StreamError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(futures::stream::pending().boxed())
        }

        async fn unsubscribe(&self, _source_id: &str) -> Result<(), StreamError> {
            Ok(())
        }
    }

    async fn wait_pending(manager: &SubscriptionManager, variable: &str, expected: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while manager.pending(variable) < expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn event(name: &str, t: i64, v: f64) -> Result<String, StreamError> {
        Ok(format!("{name} 1 1 {t} V {v} A"))
    }

    #[tokio::test]
    async fn test_heartbeat_is_not_queued() {
        let (transport, feed) = ChannelTransport::with_feed();
        let manager = SubscriptionManager::new("tokamak", transport, StreamingOptions::default());
        manager.start_subscription(vec!["V".into()]).await.unwrap();
        assert_eq!(manager.status(), SubscriptionStatus::Started);

        for i in 0..3 {
            feed.send(event("V", i, i as f64)).unwrap();
        }
        feed.send(Ok("HEARTBEAT".to_string())).unwrap();
        for i in 3..5 {
            feed.send(event("V", i, i as f64)).unwrap();
        }
        wait_pending(&manager, "V", 5).await;

        let mut received = Vec::new();
        loop {
            let next = manager.get_next_data("V");
            if next.is_empty() {
                break;
            }
            received.push(next);
        }
        assert_eq!(received.len(), 5);
        assert_eq!(received[4].x, vec![4_000.0]);
        assert_eq!(received[4].y, vec![4.0]);
        assert_eq!(received[4].x_unit, "ns");
        assert_eq!(received[4].y_unit, "A");
    }

    #[tokio::test]
    async fn test_duplicate_variables_have_independent_queues() {
        let (transport, feed) = ChannelTransport::with_feed();
        let manager = SubscriptionManager::new("tokamak", transport, StreamingOptions::default());
        manager
            .start_subscription(vec!["A".into(), "B".into(), "A".into()])
            .await
            .unwrap();

        feed.send(event("A@0", 1, 10.0)).unwrap();
        feed.send(event("A@1", 1, 20.0)).unwrap();
        feed.send(event("B", 1, 30.0)).unwrap();
        wait_pending(&manager, "B", 1).await;

        assert_eq!(manager.get_next_data("A@0").y, vec![10.0]);
        assert_eq!(manager.get_next_data("A@1").y, vec![20.0]);
        assert!(manager.get_next_data("A@0").is_empty());
        assert!(manager.get_next_data("A@1").is_empty());

        // An untagged record reaches every occurrence.
        feed.send(event("A", 2, 40.0)).unwrap();
        wait_pending(&manager, "A@1", 1).await;
        assert_eq!(manager.get_next_data("A").y, vec![40.0]);
        assert_eq!(manager.get_next_data("A@1").y, vec![40.0]);
    }

    #[tokio::test]
    async fn test_queue_drops_oldest_when_full() {
        let (transport, feed) = ChannelTransport::with_feed();
        let options = StreamingOptions {
            periodic_capacity: 2,
            ..StreamingOptions::default()
        };
        let manager = SubscriptionManager::new("tokamak", transport, options);
        manager.start_subscription(vec![VariableSpec::periodic("T"), "M".into()]).await.unwrap();

        for i in 0..3 {
            feed.send(event("T", i, i as f64)).unwrap();
        }
        feed.send(event("M", 0, 0.0)).unwrap();
        wait_pending(&manager, "M", 1).await;

        assert_eq!(manager.pending("T"), 2);
        assert_eq!(manager.get_next_data("T").y, vec![1.0]);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let (transport, _feed) = ChannelTransport::with_feed();
        let manager = SubscriptionManager::new("tokamak", transport, StreamingOptions::default());
        manager.start_subscription(vec!["V".into()]).await.unwrap();

        let err = manager.start_subscription(vec!["W".into()]).await.unwrap_err();
        assert!(matches!(err, StreamError::AlreadyStarted(_)));
        assert_eq!(manager.status(), SubscriptionStatus::Started);
    }

    #[tokio::test]
    async fn test_concurrent_starts_connect_once() {
        let transport = Arc::new(SlowTransport::default());
        let manager = SubscriptionManager::new("tokamak", transport.clone(), StreamingOptions::default());

        let (first, second) = tokio::join!(
            manager.start_subscription(vec!["V".into()]),
            manager.start_subscription(vec!["W".into()]),
        );
        assert!(first.is_ok() != second.is_ok());
        assert!(matches!(first.err().or(second.err()), Some(StreamError::AlreadyStarted(_))));
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
        assert_eq!(manager.status(), SubscriptionStatus::Started);

        manager.stop_subscription();
        assert_eq!(manager.wait_stopped().await, SubscriptionStatus::Stopped);
    }

    #[tokio::test]
    async fn test_connect_failure_sets_error() {
        let transport = Arc::new(ChannelTransport {
            refuse: true,
            ..ChannelTransport::default()
        });
        let manager = SubscriptionManager::new("tokamak", transport, StreamingOptions::default());

        assert!(manager.start_subscription(vec!["V".into()]).await.is_err());
        assert_eq!(manager.status(), SubscriptionStatus::Error);
    }

    #[tokio::test]
    async fn test_stop_closes_and_clears() {
        let (transport, feed) = ChannelTransport::with_feed();
        let manager = SubscriptionManager::new("tokamak", transport.clone(), StreamingOptions::default());
        manager.start_subscription(vec!["V".into()]).await.unwrap();
        feed.send(event("V", 1, 1.0)).unwrap();
        wait_pending(&manager, "V", 1).await;

        manager.stop_subscription();
        assert_ne!(manager.status(), SubscriptionStatus::Started);
        assert_eq!(manager.wait_stopped().await, SubscriptionStatus::Stopped);
        assert_eq!(transport.unsubscribed.load(Ordering::SeqCst), 1);
        assert_eq!(manager.pending("V"), 0);
    }

    #[tokio::test]
    async fn test_unexpected_end_keeps_samples() {
        let (transport, feed) = ChannelTransport::with_feed();
        let manager = SubscriptionManager::new("tokamak", transport, StreamingOptions::default());
        manager.start_subscription(vec!["V".into()]).await.unwrap();
        feed.send(event("V", 1, 1.0)).unwrap();
        drop(feed);

        assert_eq!(manager.wait_stopped().await, SubscriptionStatus::Error);
        assert_eq!(manager.get_next_data("V").y, vec![1.0]);
    }

    #[tokio::test]
    async fn test_stop_after_stream_failure_leaves_manager_usable() {
        let (transport, feed) = ChannelTransport::with_feed();
        let manager = SubscriptionManager::new("tokamak", transport, StreamingOptions::default());
        manager.start_subscription(vec!["V".into()]).await.unwrap();
        feed.send(Err(StreamError::Read("reset".to_string()))).unwrap();
        assert_eq!(manager.wait_stopped().await, SubscriptionStatus::Error);

        manager.stop_subscription();
        assert_eq!(manager.status(), SubscriptionStatus::Error);
        assert_eq!(manager.wait_stopped().await, SubscriptionStatus::Error);
    }

    #[tokio::test]
    async fn test_stream_end_during_stop_finishes_stopped() {
        let (transport, feed) = ChannelTransport::with_feed();
        let manager = SubscriptionManager::new("tokamak", transport.clone(), StreamingOptions::default());
        manager.start_subscription(vec!["V".into()]).await.unwrap();

        drop(feed);
        manager.stop_subscription();
        assert_eq!(manager.wait_stopped().await, SubscriptionStatus::Stopped);
        assert_eq!(transport.unsubscribed.load(Ordering::SeqCst), 1);
    }
}
