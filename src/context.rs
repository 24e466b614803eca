// Copyright (c) 2025, The Coworkers Authors
// MIT License
// All rights reserved.

//! # Per-Message Context
//!
//! This module provides the context object handed to every middleware in a
//! queue's pipeline. It bundles the inbound message, a type-keyed state bag
//! for inter-middleware communication, and the acknowledgement slots the
//! responder reads once the pipeline has completed.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};

/// Broker-supplied envelope fields of an inbound message.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    /// String-valued headers; used for trace propagation among other things.
    pub headers: BTreeMap<String, String>,
}

/// An inbound message: content bytes plus the broker envelope.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub payload: Vec<u8>,
    pub envelope: Envelope,
}

/// The acknowledgement decision pending on a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Ack,
    Nack { requeue: bool },
}

/// A reply to publish back to the message's `reply_to` queue.
#[derive(Debug, Clone)]
pub struct Reply {
    pub payload: Vec<u8>,
    pub content_type: Option<String>,
}

/// Per-message request/response bundle exposed to middleware.
///
/// Created when a message arrives and discarded after the responder
/// finishes; contexts are never reused across messages.
pub struct Context {
    queue_name: String,
    message: Message,
    state: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    decision: Option<AckDecision>,
    reply: Option<Reply>,
}

impl Context {
    pub(crate) fn new(queue_name: impl Into<String>, message: Message) -> Context {
        Context {
            queue_name: queue_name.into(),
            message,
            state: HashMap::new(),
            decision: None,
            reply: None,
        }
    }

    /// The queue this message was consumed from.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// The inbound message.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Requests a positive acknowledgement. This is also the default when no
    /// decision is made.
    pub fn ack(&mut self) {
        self.decision = Some(AckDecision::Ack);
    }

    /// Requests a negative acknowledgement.
    ///
    /// # Parameters
    /// * `requeue` - Whether the broker should redeliver the message
    pub fn nack(&mut self, requeue: bool) {
        self.decision = Some(AckDecision::Nack { requeue });
    }

    /// Sets a reply to publish to the message's `reply_to` queue. The
    /// responder publishes it and then acks the original message.
    pub fn reply(&mut self, payload: Vec<u8>) {
        self.reply = Some(Reply {
            payload,
            content_type: None,
        });
    }

    /// Like [`Context::reply`], with an explicit content type.
    pub fn reply_with_content_type(&mut self, payload: Vec<u8>, content_type: &str) {
        self.reply = Some(Reply {
            payload,
            content_type: Some(content_type.to_owned()),
        });
    }

    /// The pending acknowledgement decision, defaulting to ack.
    pub fn decision(&self) -> AckDecision {
        self.decision.unwrap_or(AckDecision::Ack)
    }

    /// Whether any middleware made an explicit decision.
    pub fn has_decision(&self) -> bool {
        self.decision.is_some()
    }

    pub(crate) fn take_reply(&mut self) -> Option<Reply> {
        self.reply.take()
    }

    /// Stores a value in the state bag, keyed by its type.
    ///
    /// # Returns
    /// The previously stored value of the same type, if any
    pub fn set<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.state
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|previous| previous.downcast().ok())
            .map(|boxed| *boxed)
    }

    /// Reads a value from the state bag.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.state
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref())
    }

    /// Reads a value from the state bag mutably.
    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.state
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut())
    }

    /// Removes a value from the state bag.
    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.state
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast().ok())
            .map(|boxed| *boxed)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("queue_name", &self.queue_name)
            .field("delivery_tag", &self.message.envelope.delivery_tag)
            .field("decision", &self.decision)
            .field("has_reply", &self.reply.is_some())
            .finish()
    }
}
