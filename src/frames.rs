//! Frame capture dispatch and fan-out.
//!
//! The capture task owns the camera stream. Every frame it receives becomes
//! the hub's latest frame and is offered to each subscriber's bounded queue.
//! A full queue never blocks capture; the configured [`OverflowPolicy`]
//! decides which frame that subscriber loses.
//!
//! ```text
//! CameraDriver --next_frame--> capture task --publish--> FrameHub
//!                                                  |-- latest (watch)
//!                                                  |-- queue[tracking]
//!                                                  `-- queue[...]
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::camera::{CameraLease, Frame};

/// Back-off after a failed capture before asking the driver again.
const CAPTURE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// What a full subscriber queue does with a new frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued frame to make room.
    #[default]
    DropOldest,
    /// Discard the incoming frame.
    DropNewest,
}

/// Queue settings for one subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameQueueConfig {
    /// Maximum queued frames.
    pub capacity: usize,
    /// Behaviour when full.
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

impl Default for FrameQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 2,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

struct FrameQueue {
    frames: ArrayQueue<Frame>,
    notify: Notify,
    overflow: OverflowPolicy,
    dropped: AtomicU64,
}

impl FrameQueue {
    fn new(config: FrameQueueConfig) -> Self {
        Self {
            // ArrayQueue rejects a zero capacity.
            frames: ArrayQueue::new(config.capacity.max(1)),
            notify: Notify::new(),
            overflow: config.overflow,
            dropped: AtomicU64::new(0),
        }
    }

    fn offer(&self, frame: Frame) {
        let lost = match self.overflow {
            OverflowPolicy::DropOldest => self.frames.force_push(frame).is_some(),
            OverflowPolicy::DropNewest => self.frames.push(frame).is_err(),
        };
        if lost {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
    }
}

/// Fan-out point for captured frames.
pub struct FrameHub {
    listeners: Mutex<Vec<(u64, Arc<FrameQueue>)>>,
    next_id: AtomicU64,
    latest: watch::Sender<Option<Frame>>,
}

impl FrameHub {
    /// Hub with no subscribers and no frame yet.
    pub fn new() -> Arc<Self> {
        let (latest, _) = watch::channel(None);
        Arc::new(Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            latest,
        })
    }

    /// Registers a bounded listener queue.
    ///
    /// The registration lives as long as the returned subscription.
    pub fn subscribe(self: &Arc<Self>, config: FrameQueueConfig) -> FrameSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(FrameQueue::new(config));
        self.listeners.lock().push((id, queue.clone()));
        tracing::debug!(listener = id, capacity = config.capacity, "Registered frame listener");

        FrameSubscription {
            id,
            queue,
            hub: Arc::downgrade(self),
        }
    }

    /// Makes `frame` the latest frame and offers it to every listener.
    pub fn publish(&self, frame: Frame) {
        let listeners: Vec<Arc<FrameQueue>> =
            self.listeners.lock().iter().map(|(_, q)| q.clone()).collect();
        for queue in listeners {
            queue.offer(frame.clone());
        }
        self.latest.send_replace(Some(frame));
    }

    /// Most recently published frame.
    pub fn latest(&self) -> Option<Frame> {
        self.latest.borrow().clone()
    }

    /// Watch handle that changes on every published frame.
    pub fn watch_latest(&self) -> watch::Receiver<Option<Frame>> {
        self.latest.subscribe()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn deregister(&self, id: u64) {
        self.listeners.lock().retain(|(listener, _)| *listener != id);
        tracing::debug!(listener = id, "Deregistered frame listener");
    }
}

/// A registered frame listener; deregisters on drop.
pub struct FrameSubscription {
    id: u64,
    queue: Arc<FrameQueue>,
    hub: Weak<FrameHub>,
}

impl FrameSubscription {
    /// Waits for the next queued frame.
    pub async fn recv(&mut self) -> Frame {
        loop {
            if let Some(frame) = self.queue.frames.pop() {
                return frame;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Next queued frame without waiting.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.queue.frames.pop()
    }

    /// Frames this listener lost to overflow.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for FrameSubscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.deregister(self.id);
        }
    }
}

/// Spawns the capture task: pulls frames from `camera` into `hub` until
/// `cancel` fires, then stops the stream.
pub fn spawn_capture(
    camera: Arc<CameraLease>,
    hub: Arc<FrameHub>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(camera = camera.name(), "Capture started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = camera.next_frame() => match result {
                    Ok(frame) => hub.publish(frame),
                    Err(e) => {
                        tracing::warn!("Frame capture failed: {e:#}");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(CAPTURE_RETRY_DELAY) => {}
                        }
                    }
                },
            }
        }

        if let Err(e) = camera.stop().await {
            tracing::warn!("Failed to stop camera: {e:#}");
        }
        tracing::info!("Capture stopped");
    })
}
