/// Fixed-capacity queue with a non-blocking producer side.
///
/// HTTP handlers push with [`WorkQueue::try_push`] and get an immediate
/// accept/reject signal, so a full queue can be surfaced to the event
/// sender as a retryable failure instead of stalling the request.
pub struct WorkQueue<T> {
    tx: flume::Sender<T>,
    rx: flume::Receiver<T>,
}

impl<T> WorkQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity);
        Self { tx, rx }
    }

    /// Returns false when the queue is full; never blocks.
    pub fn try_push(&self, item: T) -> bool {
        self.tx.try_send(item).is_ok()
    }

    /// Pushes every item or none of them. Returns false without enqueuing
    /// anything when the batch does not fit, so a rejected delivery can be
    /// retried without duplicating the items that would have fit.
    pub fn try_push_all(&self, items: Vec<T>) -> bool {
        let free = self
            .tx
            .capacity()
            .map_or(usize::MAX, |c| c.saturating_sub(self.tx.len()));
        if items.len() > free {
            return false;
        }
        for item in items {
            if self.tx.try_send(item).is_err() {
                return false;
            }
        }
        true
    }

    pub fn receiver(&self) -> flume::Receiver<T> {
        self.rx.clone()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}
