use anyhow::{bail, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard};

/// Encoded JPEG shared by every subscriber queue.
pub type SharedJpeg = Arc<Vec<u8>>;

pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 2;

/// One HTTP viewer's end of the fan-out.
///
/// The receiver disconnects once the hub drops the subscriber, either
/// because it fell behind or because the hub was closed.
pub struct Subscription {
    pub id: u64,
    pub frames: Receiver<SharedJpeg>,
}

struct Slot {
    id: u64,
    tx: Sender<SharedJpeg>,
}

#[derive(Default)]
struct HubInner {
    next_id: u64,
    slots: Vec<Slot>,
    closed: bool,
}

/// Set of independent bounded subscriber queues.
///
/// The producer never blocks: a subscriber whose queue is full when a new
/// frame arrives is dropped on the spot (drop-slow-consumer).
#[derive(Clone)]
pub struct SubscriberHub {
    inner: Arc<Mutex<HubInner>>,
    queue_capacity: usize,
}

impl SubscriberHub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner::default())),
            queue_capacity: queue_capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn subscribe(&self) -> Result<Subscription> {
        let mut inner = self.lock();
        if inner.closed {
            bail!("stream publisher is shut down");
        }
        let (tx, rx) = bounded(self.queue_capacity);
        inner.next_id += 1;
        let id = inner.next_id;
        inner.slots.push(Slot { id, tx });
        log::info!("subscriber {} attached ({} active)", id, inner.slots.len());
        Ok(Subscription { id, frames: rx })
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut inner = self.lock();
        let before = inner.slots.len();
        inner.slots.retain(|slot| slot.id != id);
        if inner.slots.len() != before {
            log::info!("subscriber {} detached ({} active)", id, inner.slots.len());
        }
    }

    /// Offer `jpeg` to every subscriber; returns how many accepted it.
    pub fn broadcast(&self, jpeg: &SharedJpeg) -> usize {
        let mut inner = self.lock();
        let mut delivered = 0;
        inner.slots.retain(|slot| match slot.tx.try_send(jpeg.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                log::info!("subscriber {} dropped: queue full", slot.id);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                log::info!("subscriber {} dropped: disconnected", slot.id);
                false
            }
        });
        delivered
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disconnect every subscriber and refuse new ones.
    pub fn close_all(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        let n = inner.slots.len();
        inner.slots.clear();
        if n > 0 {
            log::info!("disconnected {} subscribers", n);
        }
    }
}
