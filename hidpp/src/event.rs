use parking_lot::Mutex;

/// A simple event emitter sending a single event to multiple MPMC channels.
#[derive(Debug)]
pub struct EventEmitter<T: Clone> {
    senders: Mutex<Vec<flume::Sender<T>>>,
}

impl<T: Clone> Default for EventEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> EventEmitter<T> {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    /// Creates a new receiver and adds the corresponding sender to the sender
    /// list.
    pub fn create_receiver(&self) -> flume::Receiver<T> {
        let (tx, rx) = flume::unbounded();
        self.senders.lock().push(tx);
        rx
    }

    /// Emits an event to all senders. Senders whose receivers were dropped are
    /// removed from the list.
    pub fn emit(&self, event: &T) {
        self.senders
            .lock()
            .retain(|sender| sender.send(event.clone()).is_ok());
    }

    /// Drops every sender, disconnecting all receivers.
    pub fn close(&self) {
        self.senders.lock().clear();
    }

    /// The amount of receivers that were alive at the last emit.
    pub fn receiver_count(&self) -> usize {
        self.senders.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_to_every_receiver() {
        let emitter = EventEmitter::new();
        let first = emitter.create_receiver();
        let second = emitter.create_receiver();

        emitter.emit(&7u8);

        assert_eq!(first.try_recv(), Ok(7));
        assert_eq!(second.try_recv(), Ok(7));
    }

    #[test]
    fn forgets_dropped_receivers() {
        let emitter = EventEmitter::new();
        let kept = emitter.create_receiver();
        drop(emitter.create_receiver());

        emitter.emit(&1u8);

        assert_eq!(emitter.receiver_count(), 1);
        assert_eq!(kept.try_recv(), Ok(1));

        emitter.close();
        assert!(kept.recv().is_err());
    }
}
