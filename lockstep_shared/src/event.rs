//! Event queue.
//!
//! Agents report connection and room changes by pushing events here. The
//! embedding application drains them once per frame, or installs a hook to
//! observe each event as it is pushed.

/// Callback invoked for every pushed event.
pub type EventHook<E> = Box<dyn FnMut(&E) + Send>;

/// FIFO of agent events.
pub struct EventQueue<E> {
    pending: Vec<E>,
    hook: Option<EventHook<E>>,
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            hook: None,
        }
    }
}

impl<E> EventQueue<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes an event into the queue.
    pub fn push(&mut self, event: E) {
        if let Some(hook) = self.hook.as_mut() {
            hook(&event);
        }
        self.pending.push(event);
    }

    /// Drains all queued events.
    pub fn drain(&mut self) -> Vec<E> {
        std::mem::take(&mut self.pending)
    }

    pub fn pending(&self) -> &[E] {
        &self.pending
    }

    pub fn set_hook(&mut self, hook: EventHook<E>) {
        self.hook = Some(hook);
    }

    pub fn clear_hook(&mut self) {
        self.hook = None;
    }
}

impl<E: std::fmt::Debug> std::fmt::Debug for EventQueue<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("pending", &self.pending)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn drain_returns_events_in_order() {
        let mut q = EventQueue::new();
        q.push(1);
        q.push(2);
        assert_eq!(q.drain(), vec![1, 2]);
        assert!(q.drain().is_empty());
    }

    #[test]
    fn hook_sees_every_event() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut q = EventQueue::new();
        let counter = Arc::clone(&seen);
        q.set_hook(Box::new(move |_: &&str| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));
        q.push("a");
        q.push("b");
        assert_eq!(seen.load(Ordering::Relaxed), 2);
        assert_eq!(q.pending().len(), 2);
    }
}
