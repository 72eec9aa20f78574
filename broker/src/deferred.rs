use futures::{
    channel::oneshot,
    future::{FutureExt, Shared},
};
use std::sync::Mutex;

/// A value that is set exactly once and can be awaited by any number of
/// tasks. Dropping an unresolved `Deferred` wakes all waiters with `Canceled`.
pub struct Deferred<T: Clone> {
    sender: Mutex<Option<oneshot::Sender<T>>>,
    receiver: Shared<oneshot::Receiver<T>>,
}

impl<T: Clone> Deferred<T> {
    pub fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: receiver.shared(),
        }
    }

    /// Sets the value. Returns false if it was already set.
    pub fn resolve(&self, value: T) -> bool {
        let sender = match self.sender.lock() {
            Ok(mut sender) => sender.take(),
            Err(_) => None,
        };
        match sender {
            Some(sender) => sender.send(value).is_ok(),
            None => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.sender
            .lock()
            .map(|sender| sender.is_none())
            .unwrap_or(true)
    }

    /// A future for the value, independent of `self`'s lifetime.
    pub fn wait(&self) -> Shared<oneshot::Receiver<T>> {
        self.receiver.clone()
    }
}

impl<T: Clone> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}
