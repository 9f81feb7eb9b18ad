//! Bounded Job Queues
//!
//! Fixed-capacity FIFO queues feeding the worker pools. Producers never
//! block: a full queue is reported back immediately as
//! [`EngineError::QueueFull`].

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::{EngineError, Result};

pub struct BoundedQueue<T> {
    name: &'static str,
    capacity: usize,
    sender: mpsc::Sender<T>,
}

impl<T> BoundedQueue<T> {
    /// Creates a queue and the receiver its pool consumes from.
    pub fn new(name: &'static str, capacity: usize) -> (Self, mpsc::Receiver<T>) {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        (
            Self {
                name,
                capacity,
                sender,
            },
            receiver,
        )
    }

    /// Appends a job without waiting for space.
    pub fn enqueue(&self, job: T) -> Result<()> {
        self.sender.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => self.full(),
            TrySendError::Closed(_) => EngineError::ShutDown,
        })
    }

    /// Claims one slot ahead of time, so the caller can do fallible work
    /// before committing the job.
    pub fn reserve(&self) -> Result<mpsc::Permit<'_, T>> {
        self.sender.try_reserve().map_err(|e| match e {
            TrySendError::Full(_) => self.full(),
            TrySendError::Closed(_) => EngineError::ShutDown,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Jobs currently waiting.
    pub fn len(&self) -> usize {
        self.capacity - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn full(&self) -> EngineError {
        EngineError::QueueFull {
            queue: self.name,
            capacity: self.capacity,
        }
    }
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            capacity: self.capacity,
            sender: self.sender.clone(),
        }
    }
}
