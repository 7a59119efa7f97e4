//! Rate-limited delivery of text lines to an output sink.
//!
//! Implements a token bucket drained by a background task so bursts of chat
//! events do not flood whatever consumes the forwarded text.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// How often the drain task wakes up.
pub const DRAIN_TICK: Duration = Duration::from_millis(50);

/// Tokens are restored to capacity once per window.
pub const REFILL_WINDOW: Duration = Duration::from_secs(1);

/// A display colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const YELLOW: Rgb = Rgb::new(255, 255, 0);
    pub const WHITE: Rgb = Rgb::new(255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Parse `RRGGBB` or `#RRGGBB`. Anything else yields yellow.
    pub fn from_hex(hex: &str) -> Self {
        Self::try_from_hex(hex).unwrap_or(Self::YELLOW)
    }

    fn try_from_hex(hex: &str) -> Option<Self> {
        let hex = hex.trim();
        let hex = hex.strip_prefix('#').unwrap_or(hex);
        if hex.len() != 6 || !hex.is_ascii() {
            return None;
        }
        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
        Some(Self::new(channel(0)?, channel(2)?, channel(4)?))
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgPriority {
    High,
    #[default]
    Normal,
    Low,
}

/// One line of text waiting to be shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastItem {
    pub text: String,
    pub color: Rgb,
    pub priority: MsgPriority,
}

impl BroadcastItem {
    pub fn new(text: impl Into<String>, color: Rgb) -> Self {
        Self {
            text: text.into(),
            color,
            priority: MsgPriority::Normal,
        }
    }

    pub fn with_priority(mut self, priority: MsgPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Where delivered items end up.
pub trait BroadcastSink: Send + Sync {
    fn deliver(&self, item: &BroadcastItem);
}

impl<F> BroadcastSink for F
where
    F: Fn(&BroadcastItem) + Send + Sync,
{
    fn deliver(&self, item: &BroadcastItem) {
        self(item)
    }
}

/// Token bucket refilled to capacity once per [`REFILL_WINDOW`].
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(max_per_second: u32, now: Instant) -> Self {
        let capacity = max_per_second.max(1);
        Self {
            capacity,
            tokens: capacity,
            last_refill: now,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn tokens(&self) -> u32 {
        self.tokens
    }

    /// Takes effect at the next refill.
    pub fn set_capacity(&mut self, max_per_second: u32) {
        self.capacity = max_per_second.max(1);
    }

    pub fn refill_if_due(&mut self, now: Instant) {
        if now.duration_since(self.last_refill) >= REFILL_WINDOW {
            self.tokens = self.capacity;
            self.last_refill = now;
        }
    }

    pub fn try_take(&mut self) -> bool {
        if self.tokens == 0 {
            return false;
        }
        self.tokens -= 1;
        true
    }
}

/// Pending items, one FIFO per priority.
#[derive(Debug, Default)]
struct Lanes {
    high: VecDeque<BroadcastItem>,
    normal: VecDeque<BroadcastItem>,
    low: VecDeque<BroadcastItem>,
}

impl Lanes {
    fn push(&mut self, item: BroadcastItem) {
        match item.priority {
            MsgPriority::High => self.high.push_back(item),
            MsgPriority::Normal => self.normal.push_back(item),
            MsgPriority::Low => self.low.push_back(item),
        }
    }

    fn pop(&mut self) -> Option<BroadcastItem> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    fn is_empty(&self) -> bool {
        self.high.is_empty() && self.normal.is_empty() && self.low.is_empty()
    }
}

/// Queue in front of a sink, drained at most `max_per_second` items per second.
///
/// Must be created inside a Tokio runtime. Dropping it stops the drain task and
/// discards anything still queued.
pub struct BroadcastLimiter {
    tx: mpsc::UnboundedSender<BroadcastItem>,
    capacity: Arc<AtomicU32>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl BroadcastLimiter {
    pub fn new(sink: Arc<dyn BroadcastSink>, max_per_second: u32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let capacity = Arc::new(AtomicU32::new(max_per_second.max(1)));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(drain(rx, sink, capacity.clone(), cancel.clone()));
        debug!(max_per_second, "Broadcast limiter started");
        Self {
            tx,
            capacity,
            cancel,
            task,
        }
    }

    /// Queue an item. Never blocks.
    pub fn enqueue(&self, item: BroadcastItem) {
        if self.tx.send(item).is_err() {
            trace!("Broadcast limiter stopped, dropping item");
        }
    }

    pub fn max_per_second(&self) -> u32 {
        self.capacity.load(Ordering::Relaxed)
    }

    pub fn set_max_per_second(&self, max_per_second: u32) {
        self.capacity
            .store(max_per_second.max(1), Ordering::Relaxed);
    }

    /// Stop draining. Queued items are discarded.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.task.is_finished()
    }
}

impl Drop for BroadcastLimiter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drain(
    mut rx: mpsc::UnboundedReceiver<BroadcastItem>,
    sink: Arc<dyn BroadcastSink>,
    capacity: Arc<AtomicU32>,
    cancel: CancellationToken,
) {
    let mut bucket = TokenBucket::new(capacity.load(Ordering::Relaxed), Instant::now());
    let mut lanes = Lanes::default();
    let mut ticker = tokio::time::interval(DRAIN_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        while let Ok(item) = rx.try_recv() {
            lanes.push(item);
        }

        bucket.set_capacity(capacity.load(Ordering::Relaxed));
        bucket.refill_if_due(Instant::now());

        while !lanes.is_empty() && bucket.try_take() {
            if let Some(item) = lanes.pop() {
                sink.deliver(&item);
            }
        }
    }

    debug!("Broadcast limiter stopped");
}

/// Sends items either through a [`BroadcastLimiter`] or straight to the sink.
///
/// The mode can be switched while running.
pub struct Broadcaster {
    sink: Arc<dyn BroadcastSink>,
    limiter: Mutex<Option<BroadcastLimiter>>,
}

impl Broadcaster {
    /// A broadcaster that delivers synchronously.
    pub fn direct(sink: Arc<dyn BroadcastSink>) -> Self {
        Self {
            sink,
            limiter: Mutex::new(None),
        }
    }

    /// A broadcaster with a limiter. Must be called inside a Tokio runtime.
    pub fn throttled(sink: Arc<dyn BroadcastSink>, max_per_second: u32) -> Self {
        let limiter = BroadcastLimiter::new(sink.clone(), max_per_second);
        Self {
            sink,
            limiter: Mutex::new(Some(limiter)),
        }
    }

    pub fn send(&self, item: BroadcastItem) {
        match self.limiter.lock().as_ref() {
            Some(limiter) => limiter.enqueue(item),
            None => self.sink.deliver(&item),
        }
    }

    /// Switch throttling on or off, or change the rate, keeping queued items
    /// when only the rate changes.
    pub fn reconfigure(&self, throttle: bool, max_per_second: u32) {
        let mut limiter = self.limiter.lock();
        match (throttle, limiter.as_ref()) {
            (true, Some(existing)) => existing.set_max_per_second(max_per_second),
            (true, None) => {
                *limiter = Some(BroadcastLimiter::new(self.sink.clone(), max_per_second));
            }
            (false, _) => {
                limiter.take();
            }
        }
        debug!(throttle, max_per_second, "Broadcast mode updated");
    }

    pub fn is_throttled(&self) -> bool {
        self.limiter.lock().is_some()
    }

    /// Stop the limiter, if any, and fall back to direct delivery.
    pub fn shutdown(&self) {
        self.limiter.lock().take();
    }
}
