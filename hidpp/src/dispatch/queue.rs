//! Named FIFO queues with blocking, timed reads.

use std::{
    collections::VecDeque,
    fmt,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;

/// The name of a dispatcher queue.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum QueueName {
    Important,
    Common,
    Mouse,
    Keyboard,
    Touchpad,
    Gaming,
    Peripheral,

    /// Unsolicited HID++2.0 events without a dedicated queue.
    Event,
    BatteryEvent,

    /// HID++2.0 errors, transport errors and failed VLP transfers.
    Error,

    /// Plain HID input reports.
    Hid,
    ReceiverResponse,
    ReceiverError,
    ReceiverEvent,
    ReceiverConnectionEvent,
    VlpImportant,
    VlpCommon,
    VlpEvent,

    /// Traffic no other queue accepted.
    Default,
}

impl QueueName {
    pub const ALL: [QueueName; 19] = [
        QueueName::Important,
        QueueName::Common,
        QueueName::Mouse,
        QueueName::Keyboard,
        QueueName::Touchpad,
        QueueName::Gaming,
        QueueName::Peripheral,
        QueueName::Event,
        QueueName::BatteryEvent,
        QueueName::Error,
        QueueName::Hid,
        QueueName::ReceiverResponse,
        QueueName::ReceiverError,
        QueueName::ReceiverEvent,
        QueueName::ReceiverConnectionEvent,
        QueueName::VlpImportant,
        QueueName::VlpCommon,
        QueueName::VlpEvent,
        QueueName::Default,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Important => "Important Queue",
            Self::Common => "Common Queue",
            Self::Mouse => "Mouse Queue",
            Self::Keyboard => "Keyboard Queue",
            Self::Touchpad => "Touchpad Queue",
            Self::Gaming => "Gaming Queue",
            Self::Peripheral => "Peripheral Queue",
            Self::Event => "Event Queue",
            Self::BatteryEvent => "Battery Event Queue",
            Self::Error => "Errors Queue",
            Self::Hid => "HID Queue",
            Self::ReceiverResponse => "Receiver Response Queue",
            Self::ReceiverError => "Receiver Errors Queue",
            Self::ReceiverEvent => "Receiver Event Queue",
            Self::ReceiverConnectionEvent => "Receiver Connection Event Queue",
            Self::VlpImportant => "VLP Important Queue",
            Self::VlpCommon => "VLP Common Queue",
            Self::VlpEvent => "VLP Event Queue",
            Self::Default => "Default Queue",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents an error returned when reading from a queue.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchError {
    /// Nothing arrived within the given window.
    #[error("no message arrived in time")]
    Timeout,

    /// The queue was closed, usually because its channel shut down.
    #[error("the channel was closed")]
    ChannelClosed,
}

#[derive(Debug)]
struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// An unbounded FIFO queue safe for one producer and many consumers.
///
/// Once closed, every read fails with [`DispatchError::ChannelClosed`], even
/// if items remain. Those can still be drained with [`Self::clear`].
#[derive(Debug)]
pub struct Queue<T> {
    name: QueueName,
    state: Mutex<State<T>>,
    cond: Condvar,
}

impl<T> Queue<T> {
    pub fn new(name: QueueName) -> Self {
        Self {
            name,
            state: Mutex::new(State {
                items: VecDeque::new(),
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn name(&self) -> QueueName {
        self.name
    }

    /// Appends an item. Returns `false` if the queue is closed, in which case
    /// the item is dropped.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.items.push_back(item);
        drop(state);
        self.cond.notify_all();
        true
    }

    /// Takes the oldest item, waiting up to `timeout` for one to arrive.
    pub fn get(&self, timeout: Duration) -> Result<T, DispatchError> {
        self.get_matching(timeout, |_| true)
    }

    /// Takes the oldest item matching `predicate`, waiting up to `timeout`.
    ///
    /// Items that do not match keep their place in the queue.
    pub fn get_matching(
        &self,
        timeout: Duration,
        mut predicate: impl FnMut(&T) -> bool,
    ) -> Result<T, DispatchError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();

        loop {
            if state.closed {
                return Err(DispatchError::ChannelClosed);
            }
            if let Some(pos) = state.items.iter().position(&mut predicate) {
                if let Some(item) = state.items.remove(pos) {
                    return Ok(item);
                }
            }
            if !self.wait(&mut state, deadline) {
                return Err(DispatchError::Timeout);
            }
        }
    }

    /// Takes the oldest item without waiting.
    pub fn try_get(&self) -> Result<Option<T>, DispatchError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(DispatchError::ChannelClosed);
        }
        Ok(state.items.pop_front())
    }

    /// Waits until the queue holds at least one item, without taking it.
    pub fn wait_non_empty(&self, timeout: Duration) -> Result<(), DispatchError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();

        loop {
            if state.closed {
                return Err(DispatchError::ChannelClosed);
            }
            if !state.items.is_empty() {
                return Ok(());
            }
            if !self.wait(&mut state, deadline) {
                return Err(DispatchError::Timeout);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Removes and returns every queued item.
    pub fn clear(&self) -> Vec<T> {
        self.state.lock().items.drain(..).collect()
    }

    /// Closes the queue and wakes every waiting reader.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Blocks until notified. Returns `false` once the deadline has passed.
    fn wait(&self, state: &mut MutexGuard<'_, State<T>>, deadline: Option<Instant>) -> bool {
        match deadline {
            Some(deadline) => {
                if Instant::now() >= deadline {
                    return false;
                }
                self.cond.wait_until(state, deadline);
                true
            },
            None => {
                self.cond.wait(state);
                true
            },
        }
    }
}
