//! Bounded FIFOs between producers and the rule executor
//!
//! Producers never wait: a full queue is reported straight back as
//! `queue full: <name>`.

use errors::{RhilexError, RhilexResult};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Queue fed by `work_in_end`
pub const INEND_QUEUE: &str = "inend";
/// Queue fed by `work_device`
pub const DEVICE_QUEUE: &str = "device";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub resource_id: String,
    pub data: String,
}

pub struct InternalQueue {
    name: &'static str,
    capacity: usize,
    tx: mpsc::Sender<QueueItem>,
    rx: Mutex<Option<mpsc::Receiver<QueueItem>>>,
}

impl InternalQueue {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            name,
            capacity,
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn push(&self, resource_id: &str, data: &str) -> RhilexResult<()> {
        let item = QueueItem {
            resource_id: resource_id.to_string(),
            data: data.to_string(),
        };
        self.tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RhilexError::QueueFull(self.name.to_string()),
            mpsc::error::TrySendError::Closed(_) => {
                RhilexError::runtime(format!("queue closed: {}", self.name))
            },
        })
    }

    /// Hand the receiving end to the drainer; only the first call gets it
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<QueueItem>> {
        self.rx.lock().take()
    }

    /// Items waiting to be drained
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
