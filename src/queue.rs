// Copyright (c) 2025, The Coworkers Authors
// MIT License
// All rights reserved.

//! # Queue and Consume Options
//!
//! This module provides the per-queue configuration a consumer declares:
//! assertion options passed through to the broker when the queue is
//! declared, and consume options applied when the consumer is attached.
//! Both follow a builder pattern.

use std::sync::Arc;

use crate::middleware::Middleware;

/// Options applied when asserting a queue on the broker.
///
/// This struct implements the builder pattern. It supports the standard
/// declaration flags as well as message TTL and max-length arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) message_ttl: Option<u32>,
    pub(crate) max_length: Option<u32>,
}

impl QueueOptions {
    pub fn new() -> QueueOptions {
        QueueOptions::default()
    }

    /// Makes the queue durable, persisting across broker restarts.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the declaration passive, checking for existence without
    /// creating the queue.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sets the no-wait flag, making the declaration non-blocking.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Sets the message Time-To-Live for the queue.
    ///
    /// # Parameters
    /// * `ttl` - TTL in milliseconds
    ///
    /// # Returns
    /// Self for method chaining
    pub fn message_ttl(mut self, ttl: u32) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn max_length(mut self, max: u32) -> Self {
        self.max_length = Some(max);
        self
    }
}

/// Options applied when attaching the consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub(crate) no_ack: bool,
    pub(crate) exclusive: bool,
    pub(crate) no_local: bool,
}

impl ConsumeOptions {
    pub fn new() -> ConsumeOptions {
        ConsumeOptions::default()
    }

    /// Disables acknowledgements; the broker considers messages settled on
    /// delivery.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn no_ack(mut self) -> Self {
        self.no_ack = true;
        self
    }

    /// Requests exclusive consumer access to the queue.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Asks the broker not to deliver messages published on this connection.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn no_local(mut self) -> Self {
        self.no_local = true;
        self
    }
}

/// A registered queue: its name, options, and middleware pipeline.
#[derive(Clone)]
pub struct QueueEntry {
    pub(crate) name: String,
    pub(crate) queue_options: QueueOptions,
    pub(crate) consume_options: ConsumeOptions,
    pub(crate) middleware: Vec<Arc<dyn Middleware>>,
}

impl QueueEntry {
    /// The queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The assertion options this queue was registered with.
    pub fn queue_options(&self) -> &QueueOptions {
        &self.queue_options
    }

    /// The consume options this queue was registered with.
    pub fn consume_options(&self) -> &ConsumeOptions {
        &self.consume_options
    }
}

impl std::fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEntry")
            .field("name", &self.name)
            .field("queue_options", &self.queue_options)
            .field("consume_options", &self.consume_options)
            .field("middleware", &self.middleware.len())
            .finish()
    }
}
