// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Typed message envelopes: fire-and-forget `send` and synchronous `call`.
//!
//! Message classes are modeled as unit structs implementing [`Tag`], since
//! Rust has no runtime class hierarchy to subclass a message type. Subtyping
//! is expressed explicitly: a tag may declare its parent tags via
//! [`Tag::supertags`], and [`Envelope::matches`] walks that small registry.

use std::any::{Any, TypeId};
use std::sync::Arc;

use crate::channel::Channel;
use crate::error::RecvError;
use crate::task::TaskRef;

/// A message class. Implement for a unit struct to declare a new message kind.
pub trait Tag: Any + Send + Sync + 'static {
    /// `TypeId`s of tags this tag should also match under. Empty by default.
    fn supertags() -> &'static [TypeId]
    where
        Self: Sized,
    {
        &[]
    }
}

type ReplyChannel = Arc<Channel<Box<dyn Any + Send>>>;

/// A message in flight: a type-erased payload, tagged with its originating
/// [`Tag`] type, and an optional reply channel for synchronous `call`s.
pub struct Envelope {
    tag: TypeId,
    supertags: &'static [TypeId],
    payload: Box<dyn Any + Send>,
    reply: Option<ReplyChannel>,
    sender: Option<TaskRef>,
}

impl Envelope {
    /// True if this envelope's tag is `X` or declares `X` as a supertag.
    #[must_use]
    pub fn matches<X: Tag>(&self) -> bool {
        let target = TypeId::of::<X>();
        self.tag == target || self.supertags.contains(&target)
    }

    /// The task that sent this envelope, if it was sent from inside a task.
    #[must_use]
    pub fn sender(&self) -> Option<&TaskRef> {
        self.sender.as_ref()
    }

    /// Downcasts the payload and returns a reply slot if this was a `call`.
    ///
    /// # Panics
    /// Panics if `P` does not match the type the sender actually provided;
    /// callers should dispatch on [`Envelope::matches`] first.
    #[must_use]
    pub fn payload<P: Any>(self) -> (P, Option<ReplySlot>) {
        let payload = *self
            .payload
            .downcast::<P>()
            .unwrap_or_else(|_| panic!("message payload type mismatch"));
        (payload, self.reply.map(ReplySlot))
    }
}

/// A synchronous caller's reply channel, handed back alongside the payload
/// so the handler can [`ReplySlot::reply`] exactly once.
pub struct ReplySlot(ReplyChannel);

impl ReplySlot {
    /// Sends `v` back to the caller. A no-op (not an error) if the caller
    /// already gave up (e.g. it timed out), since there is no one left to
    /// tell.
    pub fn reply<V: Send + 'static>(self, v: V) {
        let _ = self.0.send(Box::new(v), 0.0);
    }
}

/// Fire-and-forget send: appends an envelope to `target`'s mailbox and
/// returns immediately.
pub fn send<T: Tag, P: Send + 'static>(target: &TaskRef, payload: P) {
    target.mailbox().append(Envelope {
        tag: TypeId::of::<T>(),
        supertags: T::supertags(),
        payload: Box::new(payload),
        reply: None,
        sender: crate::scheduler::is_running().then(crate::task::current),
    });
}

/// Synchronous call: appends an envelope with a fresh reply channel and
/// blocks on that channel, up to `timeout` seconds (negative defers to the
/// ambient deadline).
///
/// # Errors
/// Returns [`RecvError::Timeout`] if the reply does not arrive in time.
pub fn call<T: Tag, P: Send + 'static, R: Send + 'static>(
    target: &TaskRef,
    payload: P,
    timeout: f64,
) -> Result<R, RecvError> {
    let reply: ReplyChannel = Arc::new(Channel::new());
    target.mailbox().append(Envelope {
        tag: TypeId::of::<T>(),
        supertags: T::supertags(),
        payload: Box::new(payload),
        reply: Some(reply.clone()),
        sender: Some(crate::task::current()),
    });
    let boxed = reply.receive(timeout)?;
    Ok(*boxed
        .downcast::<R>()
        .unwrap_or_else(|_| panic!("reply payload type mismatch")))
}
