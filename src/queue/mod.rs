//! # Outbound Mesh Queue
//!
//! FIFO queue with rate limiting for every radio send. Messages are queued
//! in memory and dispatched in order at the configured rate so back-to-back
//! sends never overwhelm the mesh; the firmware silently drops packets sent
//! faster than one per two seconds. The queue holds its head item while the
//! transport is down or reconnecting, so an outage never reorders or drops
//! pending work.
//!
//! Mapping persistence lives here on purpose: a message-map row for replies
//! and reactions is only written after the send thunk returns a real mesh
//! packet id, so readers either see no mapping or the final one.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};

use crate::config::FIRMWARE_MIN_MESSAGE_DELAY;
use crate::db::Db;

/// Maximum queued messages before enqueue refuses.
pub const MAX_QUEUE_SIZE: usize = 100;
/// Depth above which the drainer logs a warning.
pub const QUEUE_HIGH_WATER_MARK: usize = 75;
/// Depth above which the drainer logs at info.
pub const QUEUE_MEDIUM_WATER_MARK: usize = 50;

/// Poll interval while waiting for the transport to come back.
const LINK_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Poll interval while the queue is empty.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Result of a send thunk. `mesh_id` carries the radio-assigned packet id
/// when the transport reported one.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOutcome {
    pub mesh_id: Option<u32>,
}

pub type SendFuture = Pin<Box<dyn Future<Output = Result<SendOutcome>> + Send>>;
pub type SendThunk = Box<dyn FnOnce() -> SendFuture + Send>;

/// Message-map metadata persisted after a successful send.
#[derive(Debug, Clone)]
pub struct MappingInfo {
    pub matrix_event_id: String,
    pub room_id: String,
    pub text: String,
    pub meshnet: String,
    pub msgs_to_keep: u32,
}

/// Transport availability snapshot published by the Meshtastic transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkState {
    /// An interface is attached at all.
    pub attached: bool,
    /// A reconnect is in progress.
    pub reconnecting: bool,
    /// The interface believes it is connected.
    pub connected: bool,
}

impl LinkState {
    pub fn ready(&self) -> bool {
        self.attached && !self.reconnecting && self.connected
    }
}

struct QueuedMessage {
    thunk: SendThunk,
    description: String,
    #[allow(dead_code)]
    queued_at: Instant,
    mapping_info: Option<MappingInfo>,
}

struct QueueInner {
    queue: Mutex<VecDeque<QueuedMessage>>,
    running: AtomicBool,
    processor: Mutex<Option<JoinHandle<()>>>,
    in_flight: Mutex<Option<String>>,
    link: watch::Receiver<LinkState>,
    db: Db,
}

/// Rate-limited FIFO dispatcher for all radio sends.
#[derive(Clone)]
pub struct MessageQueue {
    inner: Arc<QueueInner>,
}

impl MessageQueue {
    pub fn new(db: Db, link: watch::Receiver<LinkState>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                queue: Mutex::new(VecDeque::new()),
                running: AtomicBool::new(false),
                processor: Mutex::new(None),
                in_flight: Mutex::new(None),
                link,
                db,
            }),
        }
    }

    /// Start the drainer with the given minimum delay between sends.
    /// Delays below the firmware minimum are clamped with a warning.
    pub fn start(&self, message_delay: f64) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let delay = if message_delay < FIRMWARE_MIN_MESSAGE_DELAY {
            warn!(
                "Message delay {}s below firmware minimum ({}s), using {}s",
                message_delay, FIRMWARE_MIN_MESSAGE_DELAY, FIRMWARE_MIN_MESSAGE_DELAY
            );
            FIRMWARE_MIN_MESSAGE_DELAY
        } else {
            message_delay
        };
        let delay = Duration::from_secs_f64(delay);
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { process_queue(inner, delay).await });
        *self.inner.processor.lock().unwrap() = Some(handle);
        info!("Message queue started with {:.1}s message delay", delay.as_secs_f64());
    }

    /// Stop the drainer. Any in-flight send is abandoned with a warning;
    /// remaining queued items stay unsent.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.inner.processor.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(description) = self.inner.in_flight.lock().unwrap().take() {
            warn!("Message in flight was dropped during shutdown: {}", description);
        }
        let remaining = self.inner.queue.lock().unwrap().len();
        if remaining > 0 {
            warn!("Message queue stopped with {} messages unsent", remaining);
        }
        info!("Message queue stopped");
    }

    /// Queue a send. Returns false (and logs) when the queue is stopped or
    /// full; never blocks the caller.
    pub fn enqueue(
        &self,
        thunk: SendThunk,
        description: impl Into<String>,
        mapping_info: Option<MappingInfo>,
    ) -> bool {
        let description = description.into();
        if !self.inner.running.load(Ordering::SeqCst) {
            error!("Queue not running, cannot send message: {}", description);
            return false;
        }
        let mut queue = self.inner.queue.lock().unwrap();
        if queue.len() >= MAX_QUEUE_SIZE {
            warn!(
                "Message queue full ({}/{}), dropping message: {}",
                queue.len(),
                MAX_QUEUE_SIZE,
                description
            );
            return false;
        }
        queue.push_back(QueuedMessage {
            thunk,
            description: description.clone(),
            queued_at: Instant::now(),
            mapping_info,
        });
        let size = queue.len();
        if size >= 2 {
            debug!("Queued message ({}/{}): {}", size, MAX_QUEUE_SIZE, description);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

async fn process_queue(inner: Arc<QueueInner>, delay: Duration) {
    debug!("Message queue processor started");
    let mut current: Option<QueuedMessage> = None;
    let mut last_send: Option<Instant> = None;

    while inner.running.load(Ordering::SeqCst) {
        if current.is_none() {
            let (popped, depth) = {
                let mut queue = inner.queue.lock().unwrap();
                (queue.pop_front(), queue.len())
            };
            if depth > QUEUE_HIGH_WATER_MARK {
                warn!("Queue depth high: {} messages pending", depth);
            } else if depth > QUEUE_MEDIUM_WATER_MARK {
                info!("Queue depth moderate: {} messages pending", depth);
            }
            match popped {
                Some(message) => current = Some(message),
                None => {
                    sleep(IDLE_POLL_INTERVAL).await;
                    continue;
                }
            }
        }

        // Hold the head item while the transport is unavailable; requeueing
        // would break FIFO order.
        let link = *inner.link.borrow();
        if !link.ready() {
            debug!(
                "Connection not ready, waiting to send: {}",
                current.as_ref().map(|m| m.description.as_str()).unwrap_or("")
            );
            sleep(LINK_POLL_INTERVAL).await;
            continue;
        }

        if let Some(last) = last_send {
            let since = last.elapsed();
            if since < delay {
                let wait = delay - since;
                debug!("Rate limiting: waiting {:.1}s before sending", wait.as_secs_f64());
                sleep(wait).await;
                continue;
            }
        }

        let message = current.take().expect("head item present");
        *inner.in_flight.lock().unwrap() = Some(message.description.clone());
        debug!("Sending queued message: {}", message.description);
        let result = (message.thunk)().await;
        last_send = Some(Instant::now());
        inner.in_flight.lock().unwrap().take();

        match result {
            Ok(outcome) => {
                debug!("Successfully sent queued message: {}", message.description);
                if let (Some(mapping), Some(mesh_id)) = (message.mapping_info, outcome.mesh_id) {
                    persist_mapping(&inner.db, mesh_id, &mapping);
                }
            }
            Err(e) => {
                error!("Error sending queued message '{}': {}", message.description, e);
            }
        }
    }
    debug!("Message queue processor terminated");
}

fn persist_mapping(db: &Db, mesh_id: u32, mapping: &MappingInfo) {
    if let Err(e) = db.store_message_map(
        mesh_id,
        &mapping.matrix_event_id,
        &mapping.room_id,
        &mapping.text,
        &mapping.meshnet,
    ) {
        error!("Error handling message mapping: {}", e);
        return;
    }
    if mapping.msgs_to_keep > 0 {
        if let Err(e) = db.prune_message_map(mapping.msgs_to_keep) {
            error!("Error pruning message map: {}", e);
        }
    }
}
