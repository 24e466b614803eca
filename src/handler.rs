// Copyright (c) 2025, The Coworkers Authors
// MIT License
// All rights reserved.

//! # Message Handler and Responder
//!
//! This module binds a queue's middleware pipeline to the delivery handler
//! the transport invokes once per message. The handler builds a fresh
//! context, walks the pipeline and, on success, hands the context to the
//! responder, which issues exactly one acknowledgement decision: a reply
//! publish followed by an ack, a plain ack, or a nack. Pipeline failures are
//! emitted on the application's error sink and deliberately leave the
//! message unacknowledged so the broker's redelivery owns consistency.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::context::{AckDecision, Context, Message};
use crate::errors::{BoxError, Error};
use crate::middleware::{run_pipeline, Middleware};
use crate::otel;
use crate::transport::{DeliveryHandler, PublishProperties, Transport};

/// Asynchronous error emitted when a pipeline or the responder fails.
///
/// Carries the failure and the per-message context it happened on.
pub struct ErrorEvent {
    pub error: BoxError,
    pub context: Context,
}

pub(crate) type ErrorSink = tokio::sync::broadcast::Sender<Arc<ErrorEvent>>;

/// Builds the delivery handler for one queue.
///
/// The handler owns the queue's flattened pipeline (global middleware first)
/// and the channels the responder needs; the completion it returns resolves
/// once the message is fully processed, so channel prefetch provides
/// backpressure.
pub(crate) fn message_handler<T: Transport>(
    transport: Arc<T>,
    queue_name: String,
    pipeline: Vec<Arc<dyn Middleware>>,
    consumer_channel: T::Channel,
    publisher_channel: T::Channel,
    errors: ErrorSink,
) -> DeliveryHandler {
    let pipeline: Arc<[Arc<dyn Middleware>]> = pipeline.into();
    let tracer = Arc::new(opentelemetry::global::tracer("amqp consumer"));

    Arc::new(move |message: Message| {
        let transport = transport.clone();
        let queue_name = queue_name.clone();
        let pipeline = pipeline.clone();
        let consumer_channel = consumer_channel.clone();
        let publisher_channel = publisher_channel.clone();
        let errors = errors.clone();
        let tracer = tracer.clone();

        Box::pin(async move {
            handle_delivery(
                transport,
                queue_name,
                pipeline,
                consumer_channel,
                publisher_channel,
                errors,
                tracer,
                message,
            )
            .await
        })
    })
}

#[allow(clippy::too_many_arguments)]
async fn handle_delivery<T: Transport>(
    transport: Arc<T>,
    queue_name: String,
    pipeline: Arc<[Arc<dyn Middleware>]>,
    consumer_channel: T::Channel,
    publisher_channel: T::Channel,
    errors: ErrorSink,
    tracer: Arc<BoxedTracer>,
    message: Message,
) {
    debug!("received message from queue: {}", queue_name);

    let mut ctx = Context::new(queue_name.clone(), message);
    let (otel_ctx, mut span) =
        otel::consumer_span(&ctx.message().envelope.headers, &tracer, &queue_name);

    if let Err(err) = run_pipeline(&pipeline, &mut ctx).await {
        span.record_error(&*err);
        span.set_status(Status::Error {
            description: Cow::from("pipeline failed"),
        });
        emit_error(&errors, err, ctx);
        return;
    }

    match respond(
        transport.as_ref(),
        &consumer_channel,
        &publisher_channel,
        &mut ctx,
        &otel_ctx,
    )
    .await
    {
        Ok(()) => span.set_status(Status::Ok),
        Err(err) => {
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("responder failed"),
            });
            emit_error(&errors, err.into(), ctx);
        }
    }
}

/// Issues the context's acknowledgement decision.
///
/// A set reply is published to the message's `reply_to` queue on the
/// publisher channel, carrying the original correlation id and a fresh
/// message id, followed by an ack of the original delivery. Otherwise the
/// pending decision applies, defaulting to ack. A publish failure skips the
/// ack so the broker redelivers.
async fn respond<T: Transport>(
    transport: &T,
    consumer_channel: &T::Channel,
    publisher_channel: &T::Channel,
    ctx: &mut Context,
    otel_ctx: &opentelemetry::Context,
) -> Result<(), Error> {
    let delivery_tag = ctx.message().envelope.delivery_tag;

    if let Some(reply) = ctx.take_reply() {
        match ctx.message().envelope.reply_to.clone() {
            None => {
                warn!(
                    queue = ctx.queue_name(),
                    "reply set but message carries no reply_to, acking without publishing"
                );
            }
            Some(reply_to) => {
                let mut headers = BTreeMap::new();
                otel::inject_context(otel_ctx, &mut headers);

                let properties = PublishProperties {
                    content_type: reply.content_type,
                    correlation_id: ctx.message().envelope.correlation_id.clone(),
                    message_id: Some(Uuid::new_v4().to_string()),
                    headers,
                };
                transport
                    .publish(publisher_channel, "", &reply_to, &reply.payload, properties)
                    .await?;
            }
        }
        return transport.ack(consumer_channel, delivery_tag).await;
    }

    match ctx.decision() {
        AckDecision::Ack => transport.ack(consumer_channel, delivery_tag).await,
        AckDecision::Nack { requeue } => {
            transport.nack(consumer_channel, delivery_tag, requeue).await
        }
    }
}

fn emit_error(errors: &ErrorSink, error: BoxError, context: Context) {
    error!(
        error = error.to_string(),
        queue = context.queue_name(),
        "error consume msg"
    );
    // Without a subscriber the tracing line above is the record.
    let _ = errors.send(Arc::new(ErrorEvent { error, context }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BoxError;
    use crate::middleware::Next;
    use crate::testing::{message, MockTransport};
    use async_trait::async_trait;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Step {
        id: &'static str,
        log: Log,
        call_next: bool,
        fail: Option<&'static str>,
        decision: Option<AckDecision>,
        reply: Option<&'static [u8]>,
    }

    impl Step {
        fn new(id: &'static str, log: &Log) -> Step {
            Step {
                id,
                log: log.clone(),
                call_next: true,
                fail: None,
                decision: None,
                reply: None,
            }
        }

        fn mounted(self) -> Arc<dyn Middleware> {
            Arc::new(self)
        }
    }

    #[async_trait]
    impl Middleware for Step {
        async fn handle(&self, ctx: &mut Context, mut next: Next<'_>) -> Result<(), BoxError> {
            self.log.lock().unwrap().push(self.id.to_owned());
            if let Some(message) = self.fail {
                return Err(message.into());
            }
            if let Some(decision) = self.decision {
                match decision {
                    AckDecision::Ack => ctx.ack(),
                    AckDecision::Nack { requeue } => ctx.nack(requeue),
                }
            }
            if let Some(payload) = self.reply {
                ctx.reply(payload.to_vec());
            }
            if self.call_next {
                next.run(ctx).await?;
            }
            self.log.lock().unwrap().push(format!("{}'", self.id));
            Ok(())
        }
    }

    fn handler_for(
        transport: &MockTransport,
        pipeline: Vec<Arc<dyn Middleware>>,
    ) -> (DeliveryHandler, ErrorSink) {
        let errors = tokio::sync::broadcast::channel(32).0;
        let handler = message_handler(
            Arc::new(transport.clone()),
            "jobs".to_owned(),
            pipeline,
            10,
            11,
            errors.clone(),
        );
        (handler, errors)
    }

    #[tokio::test]
    async fn full_traversal_then_default_ack() {
        let log: Log = Arc::default();
        let transport = MockTransport::new();
        let pipeline = vec![
            Step::new("a", &log).mounted(),
            Step::new("b", &log).mounted(),
            Step::new("c", &log).mounted(),
            Step::new("d", &log).mounted(),
        ];
        let (handler, _errors) = handler_for(&transport, pipeline);

        handler(message(7)).await;

        assert_eq!(
            log.lock().unwrap().clone(),
            vec!["a", "b", "c", "d", "d'", "c'", "b'", "a'"]
        );
        assert_eq!(transport.calls(), vec!["ack:7"]);
    }

    #[tokio::test]
    async fn short_circuit_still_reaches_the_responder() {
        let log: Log = Arc::default();
        let transport = MockTransport::new();
        let mut blocker = Step::new("b", &log);
        blocker.call_next = false;
        let pipeline = vec![
            Step::new("a", &log).mounted(),
            blocker.mounted(),
            Step::new("c", &log).mounted(),
        ];
        let (handler, _errors) = handler_for(&transport, pipeline);

        handler(message(1)).await;

        assert_eq!(log.lock().unwrap().clone(), vec!["a", "b", "b'", "a'"]);
        assert_eq!(transport.calls(), vec!["ack:1"]);
    }

    #[tokio::test]
    async fn pipeline_failure_emits_event_and_skips_responder() {
        let log: Log = Arc::default();
        let transport = MockTransport::new();
        let mut failing = Step::new("b", &log);
        failing.fail = Some("boom");
        let pipeline = vec![
            Step::new("a", &log).mounted(),
            failing.mounted(),
            Step::new("c", &log).mounted(),
        ];
        let (handler, errors) = handler_for(&transport, pipeline);
        let mut events = errors.subscribe();

        handler(message(1)).await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.error.to_string(), "boom");
        assert_eq!(event.context.queue_name(), "jobs");
        assert_eq!(log.lock().unwrap().clone(), vec!["a", "b"]);
        assert!(transport.calls().is_empty(), "no ack, no nack");
    }

    #[tokio::test]
    async fn explicit_nack_is_issued() {
        let log: Log = Arc::default();
        let transport = MockTransport::new();
        let mut step = Step::new("a", &log);
        step.decision = Some(AckDecision::Nack { requeue: false });
        let (handler, _errors) = handler_for(&transport, vec![step.mounted()]);

        handler(message(3)).await;

        assert_eq!(transport.calls(), vec!["nack:3:false"]);
    }

    #[tokio::test]
    async fn reply_publishes_then_acks() {
        let log: Log = Arc::default();
        let transport = MockTransport::new();
        let mut step = Step::new("a", &log);
        step.reply = Some(b"done");
        let (handler, _errors) = handler_for(&transport, vec![step.mounted()]);

        let mut msg = message(5);
        msg.envelope.reply_to = Some("rpc.replies".to_owned());
        msg.envelope.correlation_id = Some("corr-1".to_owned());
        handler(msg).await;

        assert_eq!(transport.calls(), vec!["publish::rpc.replies", "ack:5"]);
        let published = transport.published();
        assert_eq!(published.len(), 1);
        let (routing_key, payload, properties) = &published[0];
        assert_eq!(routing_key, "rpc.replies");
        assert_eq!(payload, b"done");
        assert_eq!(properties.correlation_id.as_deref(), Some("corr-1"));
        assert!(properties.message_id.is_some());
    }

    #[tokio::test]
    async fn reply_publish_failure_skips_the_ack() {
        let log: Log = Arc::default();
        let transport = MockTransport::new();
        transport.fail_publish(Error::transport_msg("failure to publish"));
        let mut step = Step::new("a", &log);
        step.reply = Some(b"done");
        let (handler, errors) = handler_for(&transport, vec![step.mounted()]);
        let mut events = errors.subscribe();

        let mut msg = message(5);
        msg.envelope.reply_to = Some("rpc.replies".to_owned());
        handler(msg).await;

        assert_eq!(transport.calls(), vec!["publish::rpc.replies"]);
        let event = events.recv().await.unwrap();
        assert_eq!(event.error.to_string(), "failure to publish");
    }

    #[tokio::test]
    async fn ack_failure_is_reported_but_completion_resolves() {
        let log: Log = Arc::default();
        let transport = MockTransport::new();
        transport.fail_ack(Error::transport_msg("failure to ack message"));
        let (handler, errors) = handler_for(&transport, vec![Step::new("a", &log).mounted()]);
        let mut events = errors.subscribe();

        handler(message(9)).await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.error.to_string(), "failure to ack message");
        assert_eq!(transport.calls(), vec!["ack:9"]);
    }
}
