//! The priority send buffer: water-mark hysteresis, a
//! tail-first low-priority eviction policy, and slow-client detection, all guarded by
//! one `tokio::sync::Mutex` so a producer task can enqueue while a separate task
//! drains, the same "one writer, many producers" shape.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::close_code::CloseCode;
use crate::connection::Connection;
use crate::error::Error;
use crate::message::{Message, MessageType};
use crate::stream::Stream;

/// Writes one queued item through `connection`, picking the frame kind that matches
/// what was queued rather than flattening everything to a binary data frame. A
/// queued `Ping`/`Pong`/`Close` must still leave the wire as a control frame.
async fn write_queued<S: Stream>(
    connection: &mut Connection<S>,
    message_type: MessageType,
    data: Vec<u8>,
) -> Result<(), Error> {
    match message_type {
        MessageType::Text => {
            connection
                .send_text(String::from_utf8_lossy(&data).into_owned())
                .await
        }
        MessageType::Binary => connection.send_binary(data).await,
        MessageType::Ping => connection.ping(data).await,
        MessageType::Pong => connection.pong(data).await,
        MessageType::Close => {
            let message = Message {
                kind: MessageType::Close,
                data,
            };
            let (code, reason) = message
                .close_code_and_reason()
                .unwrap_or((CloseCode::NORMAL, String::new()));
            connection.close(code, &reason).await;
            Ok(())
        }
    }
}

/// Ascending = served first: a `Control` item at the head always beats a `High` item,
/// which always beats `Normal`, which always beats `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Control,
    High,
    Normal,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Ordered by `(priority asc, enqueued_at asc)`.
    Priority,
    /// Insertion order only, ignoring priority.
    Fifo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureState {
    Flowing,
    Paused,
    Critical,
}

/// What to do once a peer has kept the connection `Paused`/`Critical` continuously
/// for `slow_client_timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlowClientPolicy {
    /// Close with code 1008, reason "slow client".
    Disconnect,
    /// Drop everything currently queued (accounted as dropped) and keep going.
    DropMessages,
    /// Fire `on_slow_client` only.
    LogOnly,
    /// Fire `on_slow_client` only; the application decides what to do.
    Custom,
}

#[derive(Debug, Clone, Copy)]
pub struct BackpressureConfig {
    pub max_bytes: usize,
    pub max_messages: usize,
    pub high_water: usize,
    pub low_water: usize,
    pub mode: QueueMode,
    pub slow_client_timeout: Duration,
    pub slow_client_policy: SlowClientPolicy,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        BackpressureConfig {
            max_bytes: 16 * 1024 * 1024,
            max_messages: 1024,
            high_water: 8 * 1024 * 1024,
            low_water: 2 * 1024 * 1024,
            mode: QueueMode::Priority,
            slow_client_timeout: Duration::from_secs(30),
            slow_client_policy: SlowClientPolicy::LogOnly,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub buffered_amount: usize,
    pub pending_messages: usize,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub bytes_sent: u64,
    pub bytes_dropped: u64,
    pub times_paused: u64,
    pub drain_events: u64,
    pub slow_client_detections: u64,
    pub total_paused_duration: Duration,
    pub peak_buffered_amount: usize,
}

struct QueueItem {
    data: Vec<u8>,
    message_type: MessageType,
    priority: Priority,
    enqueued_at: Instant,
}

struct Inner {
    items: VecDeque<QueueItem>,
    total_bytes: usize,
    state: BackpressureState,
    paused_since: Option<Instant>,
    slow_marked: bool,
    stats: Stats,
}

type StateChangeHook = Box<dyn Fn(BackpressureState, BackpressureState) + Send + Sync>;
type UnitHook = Box<dyn Fn() + Send + Sync>;

/// A priority-aware, mutex-guarded outbound queue. Safe to share (behind an `Arc`)
/// between the task that enqueues and the task that drains.
pub struct SendBuffer {
    config: BackpressureConfig,
    inner: Mutex<Inner>,
    on_state_change: Option<StateChangeHook>,
    on_drain: Option<UnitHook>,
    on_slow_client: Option<UnitHook>,
}

impl SendBuffer {
    pub fn new(config: BackpressureConfig) -> Self {
        SendBuffer {
            config,
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                total_bytes: 0,
                state: BackpressureState::Flowing,
                paused_since: None,
                slow_marked: false,
                stats: Stats::default(),
            }),
            on_state_change: None,
            on_drain: None,
            on_slow_client: None,
        }
    }

    pub fn with_on_state_change(
        mut self,
        hook: impl Fn(BackpressureState, BackpressureState) + Send + Sync + 'static,
    ) -> Self {
        self.on_state_change = Some(Box::new(hook));
        self
    }

    pub fn with_on_drain(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_drain = Some(Box::new(hook));
        self
    }

    pub fn with_on_slow_client(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_slow_client = Some(Box::new(hook));
        self
    }

    pub async fn state(&self) -> BackpressureState {
        self.inner.lock().await.state
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.items.is_empty()
    }

    pub async fn stats(&self) -> Stats {
        let inner = self.inner.lock().await;
        Stats {
            pending_messages: inner.items.len(),
            buffered_amount: inner.total_bytes,
            ..inner.stats
        }
    }

    /// Admission policy: evict `Low`-priority entries tail-first to
    /// make room; drop the incoming item only if its priority is `Normal` or higher
    /// and room still can't be made. Sub-`Normal` (`Low`) items are always admitted,
    /// best-effort, after evicting whatever `Low` traffic already exists.
    pub async fn enqueue(&self, data: Vec<u8>, message_type: MessageType, priority: Priority) -> bool {
        let mut inner = self.inner.lock().await;
        let data_len = data.len();

        let over_capacity = inner.total_bytes + data_len > self.config.max_bytes
            || inner.items.len() >= self.config.max_messages;

        if over_capacity {
            self.evict_low_priority(&mut inner, data_len);
            let still_over = inner.total_bytes + data_len > self.config.max_bytes
                || inner.items.len() >= self.config.max_messages;
            if still_over && priority >= Priority::Normal {
                inner.stats.messages_dropped += 1;
                inner.stats.bytes_dropped += data_len as u64;
                self.reevaluate_state(&mut inner);
                return false;
            }
        }

        let item = QueueItem {
            data,
            message_type,
            priority,
            enqueued_at: Instant::now(),
        };
        inner.total_bytes += data_len;

        match self.config.mode {
            QueueMode::Fifo => inner.items.push_back(item),
            QueueMode::Priority => {
                let pos = inner
                    .items
                    .iter()
                    .position(|existing| existing.priority > priority)
                    .unwrap_or(inner.items.len());
                inner.items.insert(pos, item);
            }
        }

        if inner.total_bytes > inner.stats.peak_buffered_amount {
            inner.stats.peak_buffered_amount = inner.total_bytes;
        }
        self.reevaluate_state(&mut inner);
        true
    }

    /// Removes `Low`-priority entries tail-first until `incoming_len` more bytes
    /// would fit, or no `Low` entries remain, whichever comes first. This is
    /// intentionally best-effort: a sub-`Normal` item may still be admitted over the
    /// configured cap once every evictable entry is gone.
    fn evict_low_priority(&self, inner: &mut Inner, incoming_len: usize) {
        loop {
            let fits = inner.total_bytes + incoming_len <= self.config.max_bytes
                && inner.items.len() < self.config.max_messages;
            if fits {
                return;
            }
            let victim = inner.items.iter().rposition(|item| item.priority == Priority::Low);
            match victim {
                Some(idx) => {
                    let removed = inner.items.remove(idx).expect("index from rposition");
                    inner.total_bytes -= removed.data.len();
                    inner.stats.messages_dropped += 1;
                    inner.stats.bytes_dropped += removed.data.len() as u64;
                }
                None => return,
            }
        }
    }

    fn reevaluate_state(&self, inner: &mut Inner) {
        let buffered = inner.total_bytes;
        let old_state = inner.state;

        let new_state = match old_state {
            BackpressureState::Flowing => {
                if buffered >= self.config.high_water {
                    BackpressureState::Paused
                } else {
                    BackpressureState::Flowing
                }
            }
            BackpressureState::Paused => {
                if buffered <= self.config.low_water {
                    BackpressureState::Flowing
                } else if buffered >= self.config.max_bytes || inner.items.len() >= self.config.max_messages {
                    BackpressureState::Critical
                } else {
                    BackpressureState::Paused
                }
            }
            BackpressureState::Critical => {
                if buffered <= self.config.low_water {
                    BackpressureState::Flowing
                } else if buffered < self.config.high_water {
                    BackpressureState::Paused
                } else {
                    BackpressureState::Critical
                }
            }
        };

        if new_state == old_state {
            return;
        }

        if old_state == BackpressureState::Flowing && new_state == BackpressureState::Paused {
            inner.paused_since = Some(Instant::now());
            inner.stats.times_paused += 1;
        }

        if new_state == BackpressureState::Flowing {
            if let Some(since) = inner.paused_since.take() {
                inner.stats.total_paused_duration += since.elapsed();
            }
            inner.stats.drain_events += 1;
            inner.slow_marked = false;
            if let Some(hook) = &self.on_drain {
                hook();
            }
        }

        inner.state = new_state;
        if let Some(hook) = &self.on_state_change {
            hook(old_state, new_state);
        }
    }

    /// Checks whether the connection has been `Paused`/`Critical` for at least
    /// `slow_client_timeout` and, if so, applies `slow_client_policy` (marking the
    /// client slow exactly once). Returns the policy that was applied, so a caller
    /// wrapping a [`Connection`] can act on `Disconnect`.
    pub async fn check_slow_client(&self) -> Option<SlowClientPolicy> {
        let mut inner = self.inner.lock().await;
        if inner.state == BackpressureState::Flowing {
            return None;
        }
        let since = inner.paused_since?;
        if inner.slow_marked || since.elapsed() < self.config.slow_client_timeout {
            return None;
        }

        inner.slow_marked = true;
        inner.stats.slow_client_detections += 1;
        if let Some(hook) = &self.on_slow_client {
            hook();
        }

        if self.config.slow_client_policy == SlowClientPolicy::DropMessages {
            let bytes = inner.total_bytes;
            let count = inner.items.len();
            inner.items.clear();
            inner.total_bytes = 0;
            inner.stats.messages_dropped += count as u64;
            inner.stats.bytes_dropped += bytes as u64;
            self.reevaluate_state(&mut inner);
        }

        Some(self.config.slow_client_policy)
    }

    async fn pop_matching(&self, select: impl Fn(Priority) -> bool) -> Option<(Vec<u8>, MessageType, usize)> {
        let mut inner = self.inner.lock().await;
        let idx = inner.items.iter().position(|item| select(item.priority))?;
        let item = inner.items.remove(idx).expect("index from position");
        inner.total_bytes = inner.total_bytes.saturating_sub(item.data.len());
        let len = item.data.len();
        Some((item.data, item.message_type, len))
    }

    async fn record_sent(&self, len: usize) {
        let mut inner = self.inner.lock().await;
        inner.stats.messages_sent += 1;
        inner.stats.bytes_sent += len as u64;
        self.reevaluate_state(&mut inner);
    }

    async fn record_dropped_after_failure(&self) {
        let mut inner = self.inner.lock().await;
        self.reevaluate_state(&mut inner);
    }

    /// Dequeues items (in priority order) and writes them through `connection` until
    /// the buffer is empty, a write fails, or `limit` items have been sent, whichever
    /// comes first.
    pub async fn drain_limit<S: Stream>(
        &self,
        connection: &mut Connection<S>,
        limit: usize,
    ) -> Result<usize, Error> {
        let mut sent = 0;
        while sent < limit {
            let Some((data, message_type, len)) = self.pop_matching(|_| true).await else {
                break;
            };

            let result = write_queued(connection, message_type, data).await;

            match result {
                Ok(()) => {
                    self.record_sent(len).await;
                    sent += 1;
                }
                Err(e) => {
                    self.record_dropped_after_failure().await;
                    return Err(e);
                }
            }
        }
        Ok(sent)
    }

    pub async fn drain<S: Stream>(&self, connection: &mut Connection<S>) -> Result<usize, Error> {
        self.drain_limit(connection, usize::MAX).await
    }

    /// Drains only `Control`/`High` items. Used during close to let control frames
    /// escape ahead of whatever `Normal`/`Low` traffic is still queued.
    pub async fn flush_high_priority<S: Stream>(&self, connection: &mut Connection<S>) -> Result<usize, Error> {
        let mut sent = 0;
        loop {
            let Some((data, message_type, len)) = self.pop_matching(|p| p <= Priority::High).await else {
                break;
            };

            let result = write_queued(connection, message_type, data).await;

            match result {
                Ok(()) => {
                    self.record_sent(len).await;
                    sent += 1;
                }
                Err(e) => {
                    self.record_dropped_after_failure().await;
                    return Err(e);
                }
            }
        }
        Ok(sent)
    }
}

/// Wraps a [`Connection`] with a [`SendBuffer`]: sends go straight through when
/// `Flowing` and the buffer is empty, otherwise they're queued; `receive()` drains
/// opportunistically afterward, matching the "send path" and "called after
/// each receive" rules.
pub struct BackpressureConnection<S: Stream> {
    connection: Connection<S>,
    buffer: SendBuffer,
}

impl<S: Stream> BackpressureConnection<S> {
    pub fn new(connection: Connection<S>, config: BackpressureConfig) -> Self {
        BackpressureConnection {
            connection,
            buffer: SendBuffer::new(config),
        }
    }

    pub async fn send(
        &mut self,
        data: Vec<u8>,
        message_type: MessageType,
        priority: Priority,
    ) -> Result<(), Error> {
        if self.buffer.state().await == BackpressureState::Flowing && self.buffer.is_empty().await {
            let len = data.len();
            let result = write_queued(&mut self.connection, message_type, data).await;
            if result.is_ok() {
                self.buffer.record_sent(len).await;
            }
            result
        } else {
            self.buffer.enqueue(data, message_type, priority).await;
            Ok(())
        }
    }

    pub async fn drain(&mut self) -> Result<usize, Error> {
        self.buffer.drain(&mut self.connection).await
    }

    pub async fn flush_high_priority(&mut self) -> Result<usize, Error> {
        self.buffer.flush_high_priority(&mut self.connection).await
    }

    /// Receives the next message, then opportunistically drains the send buffer.
    /// Draining never fails this call; a failed drain is left for the next send to
    /// surface.
    pub async fn receive(&mut self) -> Result<crate::message::Message, Error> {
        let message = self.connection.receive().await?;
        let _ = self.drain().await;
        Ok(message)
    }

    pub async fn check_slow_client(&mut self) {
        if let Some(SlowClientPolicy::Disconnect) = self.buffer.check_slow_client().await {
            self.connection
                .close(CloseCode::POLICY_VIOLATION, "slow client")
                .await;
        }
    }

    /// Gracefully closes the wrapped connection: flushes whatever `Control`/`High`
    /// priority items are still queued (so the close frame doesn't get stuck behind
    /// bulk traffic), then drives the underlying connection's own close handshake.
    /// Never raises, matching [`Connection::close`]'s contract.
    pub async fn close(&mut self, code: CloseCode, reason: &str) {
        let _ = self.flush_high_priority().await;
        self.connection.close(code, reason).await;
    }

    pub async fn stats(&self) -> Stats {
        self.buffer.stats().await
    }

    pub fn connection(&self) -> &Connection<S> {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut Connection<S> {
        &mut self.connection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, Mode};

    fn scenario_config() -> BackpressureConfig {
        BackpressureConfig {
            max_bytes: 1000,
            max_messages: 100,
            high_water: 750,
            low_water: 250,
            mode: QueueMode::Priority,
            slow_client_timeout: Duration::from_secs(30),
            slow_client_policy: SlowClientPolicy::LogOnly,
        }
    }

    #[tokio::test]
    async fn backpressure_drain_scenario() {
        let (a, _b) = tokio::io::duplex(1 << 16);
        let mut conn = Connection::new(a, ConnectionConfig::new(Mode::Server));
        let buffer = SendBuffer::new(scenario_config());

        for _ in 0..8 {
            assert!(buffer.enqueue(vec![0u8; 100], MessageType::Binary, Priority::Normal).await);
        }

        let stats = buffer.stats().await;
        assert_eq!(stats.buffered_amount, 800);
        assert_eq!(buffer.state().await, BackpressureState::Paused);
        assert_eq!(stats.times_paused, 1);

        let sent = buffer.drain_limit(&mut conn, 6).await.unwrap();
        assert_eq!(sent, 6);

        let stats = buffer.stats().await;
        assert_eq!(stats.buffered_amount, 200);
        assert_eq!(buffer.state().await, BackpressureState::Flowing);
        assert_eq!(stats.drain_events, 1);
    }

    #[tokio::test]
    async fn control_items_dequeue_before_non_control() {
        let buffer = SendBuffer::new(BackpressureConfig::default());
        buffer.enqueue(vec![1], MessageType::Binary, Priority::Normal).await;
        buffer.enqueue(vec![2], MessageType::Binary, Priority::Low).await;
        buffer.enqueue(vec![3], MessageType::Close, Priority::Control).await;

        let (first, _, _) = buffer.pop_matching(|_| true).await.unwrap();
        assert_eq!(first, vec![3]);
    }

    #[tokio::test]
    async fn fifo_within_same_priority() {
        let buffer = SendBuffer::new(BackpressureConfig::default());
        buffer.enqueue(vec![1], MessageType::Binary, Priority::Normal).await;
        buffer.enqueue(vec![2], MessageType::Binary, Priority::Normal).await;
        buffer.enqueue(vec![3], MessageType::Binary, Priority::Normal).await;

        let (first, _, _) = buffer.pop_matching(|_| true).await.unwrap();
        let (second, _, _) = buffer.pop_matching(|_| true).await.unwrap();
        let (third, _, _) = buffer.pop_matching(|_| true).await.unwrap();
        assert_eq!((first, second, third), (vec![1], vec![2], vec![3]));
    }

    #[tokio::test]
    async fn over_capacity_normal_priority_is_dropped_without_low_to_evict() {
        let config = BackpressureConfig {
            max_bytes: 100,
            max_messages: 10,
            ..scenario_config()
        };
        let buffer = SendBuffer::new(config);
        assert!(buffer.enqueue(vec![0u8; 100], MessageType::Binary, Priority::Normal).await);
        assert!(!buffer.enqueue(vec![0u8; 10], MessageType::Binary, Priority::Normal).await);
        assert_eq!(buffer.stats().await.messages_dropped, 1);
    }

    #[tokio::test]
    async fn low_priority_evicts_to_make_room_for_higher_priority() {
        let config = BackpressureConfig {
            max_bytes: 100,
            max_messages: 10,
            ..scenario_config()
        };
        let buffer = SendBuffer::new(config);
        assert!(buffer.enqueue(vec![0u8; 100], MessageType::Binary, Priority::Low).await);
        assert!(buffer.enqueue(vec![0u8; 50], MessageType::Binary, Priority::Normal).await);
        assert_eq!(buffer.stats().await.buffered_amount, 50);
    }

    #[tokio::test]
    async fn hysteresis_requires_crossing_low_water_not_just_high_water() {
        let buffer = SendBuffer::new(scenario_config());
        buffer.enqueue(vec![0u8; 800], MessageType::Binary, Priority::Normal).await;
        assert_eq!(buffer.state().await, BackpressureState::Paused);

        // Drop back under high_water (750) but still above low_water (250): stays Paused.
        let (_, _, _) = buffer.pop_matching(|_| true).await.unwrap();
        buffer.enqueue(vec![0u8; 500], MessageType::Binary, Priority::Normal).await;
        assert_eq!(buffer.stats().await.buffered_amount, 500);
        assert_eq!(buffer.state().await, BackpressureState::Paused);
    }

    #[tokio::test]
    async fn wrapper_close_flushes_queued_high_priority_items_before_closing() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let client = Connection::new(client_io, ConnectionConfig::new(Mode::Client));
        let mut server = Connection::new(server_io, ConnectionConfig::new(Mode::Server));
        let mut wrapped = BackpressureConnection::new(client, scenario_config());

        // Populate the buffer directly (past `send`'s Flowing-and-empty fast path) with
        // a bulk Normal-priority item and a High-priority one.
        wrapped
            .buffer
            .enqueue(vec![0u8; 800], MessageType::Binary, Priority::Normal)
            .await;
        wrapped
            .buffer
            .enqueue(b"urgent".to_vec(), MessageType::Binary, Priority::High)
            .await;
        assert_eq!(wrapped.buffer.state().await, BackpressureState::Paused);

        // `close` flushes only Control/High items, then closes the underlying
        // connection. The queued Normal item never reaches the wire, but the
        // High-priority one and the Close frame do, in that order.
        wrapped.close(CloseCode::NORMAL, "bye").await;

        let first = server.receive().await.unwrap();
        assert_eq!(first.kind, MessageType::Binary);
        assert_eq!(first.data, b"urgent");
        let err = server.receive().await.unwrap_err();
        match err {
            Error::ConnectionClosed { code, .. } => assert_eq!(code, CloseCode::NORMAL),
            other => panic!("expected ConnectionClosed, got {other:?}"),
        }
    }
}
