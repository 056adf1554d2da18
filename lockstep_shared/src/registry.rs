//! Per-agent function registry.
//!
//! Maps a message type id to a handler that decodes the frame content into a
//! typed payload and runs against the owning agent. Each agent owns its own
//! registry, so two agents in one process never share handlers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::payload::{NetPayload, PayloadError};
use crate::wire::WireMessage;

type ErasedHandler<C, S> = Arc<dyn Fn(&mut C, S, &[u8]) -> Result<(), PayloadError> + Send + Sync>;

/// Result of routing one message through a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    /// A handler exists but the content did not decode as its payload type.
    PayloadRejected(PayloadError),
    Unregistered,
}

impl Dispatch {
    pub fn is_handled(&self) -> bool {
        matches!(self, Dispatch::Handled)
    }
}

/// Handler table keyed by message type id.
///
/// `C` is the context handlers mutate (the agent), `S` identifies the sender.
pub struct FunctionRegistry<C, S> {
    handlers: HashMap<u32, ErasedHandler<C, S>>,
}

impl<C, S> Default for FunctionRegistry<C, S> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<C, S> Clone for FunctionRegistry<C, S> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
        }
    }
}

impl<C, S> fmt::Debug for FunctionRegistry<C, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.handlers.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("FunctionRegistry").field("type_ids", &ids).finish()
    }
}

impl<C: 'static, S: 'static> FunctionRegistry<C, S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `type_id`.
    ///
    /// The first registration for an id wins; later ones are ignored and
    /// return `false`.
    pub fn register<P, F>(&mut self, type_id: u32, handler: F) -> bool
    where
        P: NetPayload + 'static,
        F: Fn(&mut C, S, P) + Send + Sync + 'static,
    {
        if self.handlers.contains_key(&type_id) {
            debug!(type_id, "handler already registered, keeping the first");
            return false;
        }
        let erased: ErasedHandler<C, S> = Arc::new(move |ctx: &mut C, sender: S, content: &[u8]| {
            let payload = P::decode(content)?;
            handler(ctx, sender, payload);
            Ok(())
        });
        self.handlers.insert(type_id, erased);
        true
    }

    pub fn contains(&self, type_id: u32) -> bool {
        self.handlers.contains_key(&type_id)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn dispatch(&self, ctx: &mut C, sender: S, msg: &WireMessage<'_>) -> Dispatch {
        self.dispatch_raw(ctx, sender, msg.type_id, msg.content)
    }

    pub fn dispatch_raw(&self, ctx: &mut C, sender: S, type_id: u32, content: &[u8]) -> Dispatch {
        match self.handlers.get(&type_id) {
            None => Dispatch::Unregistered,
            Some(handler) => match handler(ctx, sender, content) {
                Ok(()) => Dispatch::Handled,
                Err(e) => Dispatch::PayloadRejected(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PlayerId;

    #[derive(Default)]
    struct Ctx {
        seen: Vec<(PlayerId, u32)>,
    }

    #[test]
    fn dispatches_decoded_payload_to_handler() {
        let mut reg: FunctionRegistry<Ctx, PlayerId> = FunctionRegistry::new();
        assert!(reg.register(1000, |ctx: &mut Ctx, from, value: u32| ctx.seen.push((from, value))));

        let mut ctx = Ctx::default();
        let out = reg.dispatch_raw(&mut ctx, PlayerId(3), 1000, &42u32.to_le_bytes());
        assert_eq!(out, Dispatch::Handled);
        assert_eq!(ctx.seen, vec![(PlayerId(3), 42)]);
    }

    #[test]
    fn first_registration_wins() {
        let mut reg: FunctionRegistry<Ctx, PlayerId> = FunctionRegistry::new();
        assert!(reg.register(1000, |ctx: &mut Ctx, _, v: u32| ctx.seen.push((PlayerId(1), v))));
        assert!(!reg.register(1000, |ctx: &mut Ctx, _, v: u32| ctx.seen.push((PlayerId(2), v))));

        let mut ctx = Ctx::default();
        reg.dispatch_raw(&mut ctx, PlayerId(9), 1000, &5u32.to_le_bytes());
        assert_eq!(ctx.seen, vec![(PlayerId(1), 5)]);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn short_content_is_rejected_not_panicking() {
        let mut reg: FunctionRegistry<Ctx, PlayerId> = FunctionRegistry::new();
        reg.register(1000, |ctx: &mut Ctx, from, v: u32| ctx.seen.push((from, v)));

        let mut ctx = Ctx::default();
        let out = reg.dispatch_raw(&mut ctx, PlayerId(1), 1000, &[1, 2]);
        assert!(matches!(out, Dispatch::PayloadRejected(PayloadError::TooShort { .. })));
        assert!(ctx.seen.is_empty());
    }

    #[test]
    fn unknown_type_is_unregistered() {
        let reg: FunctionRegistry<Ctx, PlayerId> = FunctionRegistry::new();
        let mut ctx = Ctx::default();
        assert_eq!(reg.dispatch_raw(&mut ctx, PlayerId(1), 77, &[0]), Dispatch::Unregistered);
    }

    #[test]
    fn registries_are_independent() {
        let mut a: FunctionRegistry<Ctx, PlayerId> = FunctionRegistry::new();
        let b: FunctionRegistry<Ctx, PlayerId> = FunctionRegistry::new();
        a.register(1000, |_: &mut Ctx, _, _: u32| {});
        assert!(a.contains(1000));
        assert!(!b.contains(1000));
    }
}
