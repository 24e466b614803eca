// Copyright (c) 2025, The Coworkers Authors
// MIT License
// All rights reserved.

//! Test-only transport double recording every call the framework makes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::context::{Envelope, Message};
use crate::errors::Error;
use crate::queue::{ConsumeOptions, QueueOptions};
use crate::transport::{DeliveryHandler, PublishProperties, Transport};

/// Serializes tests that touch `COWORKERS_*` environment variables.
pub(crate) static ENV_LOCK: Mutex<()> = Mutex::new(());

#[derive(Default)]
struct MockState {
    calls: Mutex<Vec<String>>,
    published: Mutex<Vec<(String, Vec<u8>, PublishProperties)>>,
    handlers: Mutex<Vec<(String, DeliveryHandler)>>,
    connect_failure: Mutex<Option<Error>>,
    consume_failure: Mutex<Option<Error>>,
    publish_failure: Mutex<Option<Error>>,
    ack_failure: Mutex<Option<Error>>,
    close_channel_failure: Mutex<Option<Error>>,
    connect_gate: Mutex<Option<Arc<Semaphore>>>,
    close_channel_gate: Mutex<Option<Arc<Semaphore>>>,
    next_channel: AtomicU32,
}

/// Clonable fake transport; clones share state.
#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub(crate) fn new() -> MockTransport {
        MockTransport::default()
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self, call: &str) -> usize {
        self.state
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|recorded| recorded.as_str() == call)
            .count()
    }

    pub(crate) fn published(&self) -> Vec<(String, Vec<u8>, PublishProperties)> {
        self.state.published.lock().unwrap().clone()
    }

    /// The delivery handlers attached by `consume`, by queue name.
    pub(crate) fn handlers(&self) -> Vec<(String, DeliveryHandler)> {
        self.state.handlers.lock().unwrap().clone()
    }

    pub(crate) fn fail_connect(&self, error: Error) {
        *self.state.connect_failure.lock().unwrap() = Some(error);
    }

    pub(crate) fn fail_consume(&self, error: Error) {
        *self.state.consume_failure.lock().unwrap() = Some(error);
    }

    pub(crate) fn fail_publish(&self, error: Error) {
        *self.state.publish_failure.lock().unwrap() = Some(error);
    }

    pub(crate) fn fail_ack(&self, error: Error) {
        *self.state.ack_failure.lock().unwrap() = Some(error);
    }

    pub(crate) fn fail_close_channel(&self, error: Error) {
        *self.state.close_channel_failure.lock().unwrap() = Some(error);
    }

    /// Makes `connect` block until the returned semaphore gets a permit.
    pub(crate) fn gate_connect(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.state.connect_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Makes `close_channel` block until the returned semaphore gets a
    /// permit.
    pub(crate) fn gate_close_channel(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.state.close_channel_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    fn record(&self, call: impl Into<String>) {
        self.state.calls.lock().unwrap().push(call.into());
    }

    fn take(&self, slot: &Mutex<Option<Error>>) -> Result<(), Error> {
        match slot.lock().unwrap().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Connection = u32;
    type Channel = u32;

    async fn connect(&self, _url: &str, _connection_name: &str) -> Result<u32, Error> {
        let gate = self.state.connect_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        self.record("connect");
        self.take(&self.state.connect_failure)?;
        Ok(1)
    }

    async fn create_channel(&self, _connection: &u32) -> Result<u32, Error> {
        self.record("create_channel");
        Ok(self.state.next_channel.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn set_prefetch(&self, _channel: &u32, prefetch: u16) -> Result<(), Error> {
        self.record(format!("set_prefetch:{prefetch}"));
        Ok(())
    }

    async fn assert_queue(
        &self,
        _channel: &u32,
        queue_name: &str,
        _options: &QueueOptions,
    ) -> Result<(), Error> {
        self.record(format!("assert_queue:{queue_name}"));
        Ok(())
    }

    async fn consume(
        &self,
        _channel: &u32,
        queue_name: &str,
        _options: &ConsumeOptions,
        handler: DeliveryHandler,
    ) -> Result<String, Error> {
        self.record(format!("consume:{queue_name}"));
        self.take(&self.state.consume_failure)?;
        self.state
            .handlers
            .lock()
            .unwrap()
            .push((queue_name.to_owned(), handler));
        Ok(format!("tag-{queue_name}"))
    }

    async fn cancel_consumer(&self, _channel: &u32, consumer_tag: &str) -> Result<(), Error> {
        self.record(format!("cancel:{consumer_tag}"));
        Ok(())
    }

    async fn publish(
        &self,
        _channel: &u32,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: PublishProperties,
    ) -> Result<(), Error> {
        self.record(format!("publish:{exchange}:{routing_key}"));
        self.take(&self.state.publish_failure)?;
        self.state.published.lock().unwrap().push((
            routing_key.to_owned(),
            payload.to_vec(),
            properties,
        ));
        Ok(())
    }

    async fn ack(&self, _channel: &u32, delivery_tag: u64) -> Result<(), Error> {
        self.record(format!("ack:{delivery_tag}"));
        self.take(&self.state.ack_failure)
    }

    async fn nack(&self, _channel: &u32, delivery_tag: u64, requeue: bool) -> Result<(), Error> {
        self.record(format!("nack:{delivery_tag}:{requeue}"));
        Ok(())
    }

    async fn close_channel(&self, _channel: &u32) -> Result<(), Error> {
        let gate = self.state.close_channel_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        self.record("close_channel");
        self.take(&self.state.close_channel_failure)
    }

    async fn close_connection(&self, _connection: &u32) -> Result<(), Error> {
        self.record("close_connection");
        Ok(())
    }
}

/// An inbound message with the given delivery tag.
pub(crate) fn message(delivery_tag: u64) -> Message {
    Message {
        payload: b"{}".to_vec(),
        envelope: Envelope {
            delivery_tag,
            exchange: "".to_owned(),
            routing_key: "jobs".to_owned(),
            redelivered: false,
            reply_to: None,
            correlation_id: None,
            content_type: None,
            headers: BTreeMap::new(),
        },
    }
}
