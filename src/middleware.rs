// Copyright (c) 2025, The Coworkers Authors
// MIT License
// All rights reserved.

//! # Middleware Contract and Pipeline Executor
//!
//! This module provides the middleware trait and the executor that walks an
//! ordered pipeline over a per-message [`Context`]. Traversal is two-phase:
//! each middleware runs up to its `next.run(..)` call, the remainder of the
//! pipeline completes, and the middleware then resumes after the await in
//! reverse registration order. A middleware that never invokes `next`
//! short-circuits the pipeline; one that fails unwinds it, with upstream
//! middleware observing the failure as the `Err` returned by their `next`.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::context::Context;
use crate::errors::{BoxError, Error};

/// A unit of message processing mounted on a queue's pipeline.
///
/// Implementations observe and mutate the context before and after invoking
/// `next`, which runs the remainder of the pipeline. `next` may be invoked
/// at most once; dropping it without a call skips all downstream middleware.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), BoxError>;
}

/// Continuation that runs the downstream remainder of a pipeline.
pub struct Next<'a> {
    chain: Option<&'a [Arc<dyn Middleware>]>,
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn Middleware>]) -> Next<'a> {
        Next { chain: Some(chain) }
    }

    /// Runs the downstream middleware to completion.
    ///
    /// Resolves once every remaining middleware has finished both its
    /// downstream and upstream halves, or fails with the first downstream
    /// error. A second invocation fails with [`Error::PipelineMisuse`].
    pub async fn run(&mut self, ctx: &mut Context) -> Result<(), BoxError> {
        let Some(chain) = self.chain.take() else {
            return Err(Error::PipelineMisuse.into());
        };

        match chain.split_first() {
            None => Ok(()),
            Some((head, rest)) => head.handle(ctx, Next::new(rest)).await,
        }
    }
}

/// Runs a middleware pipeline over a context.
///
/// The completion resolves after every entered middleware has observed both
/// its downstream entry and its upstream return, and fails with the original
/// error if any middleware raises.
///
/// # Parameters
/// * `middleware` - The ordered pipeline, outermost first
/// * `ctx` - The per-message context shared by the whole pipeline
pub async fn run_pipeline(
    middleware: &[Arc<dyn Middleware>],
    ctx: &mut Context,
) -> Result<(), BoxError> {
    Next::new(middleware).run(ctx).await
}

/// Adapter mounting a plain function as middleware.
///
/// Most useful with free `async`-shaped functions:
///
/// ```ignore
/// fn audit<'a>(ctx: &'a mut Context, mut next: Next<'a>) -> BoxFuture<'a, Result<(), BoxError>> {
///     Box::pin(async move {
///         next.run(ctx).await?;
///         Ok(())
///     })
/// }
///
/// app.add_middleware(middleware_fn(audit));
/// ```
pub struct MiddlewareFn<F> {
    f: F,
}

#[async_trait]
impl<F> Middleware for MiddlewareFn<F>
where
    F: for<'a> Fn(
            &'a mut Context,
            Next<'a>,
        ) -> futures_util::future::BoxFuture<'a, Result<(), BoxError>>
        + Send
        + Sync,
{
    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), BoxError> {
        (self.f)(ctx, next).await
    }
}

/// Wraps a function into an `Arc`'d middleware.
pub fn middleware_fn<F>(f: F) -> Arc<dyn Middleware>
where
    F: for<'a> Fn(
            &'a mut Context,
            Next<'a>,
        ) -> futures_util::future::BoxFuture<'a, Result<(), BoxError>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(MiddlewareFn { f })
}

/// Middleware template that converts a downstream failure into a nack.
///
/// By default an unhandled pipeline error leaves the message unacknowledged
/// and relies on broker redelivery; mount this first to opt into an explicit
/// nack instead.
///
/// # Parameters
/// * `requeue` - Whether the nack should ask the broker to redeliver
pub fn nack_on_error(requeue: bool) -> Arc<dyn Middleware> {
    Arc::new(NackOnError { requeue })
}

struct NackOnError {
    requeue: bool,
}

#[async_trait]
impl Middleware for NackOnError {
    async fn handle(&self, ctx: &mut Context, mut next: Next<'_>) -> Result<(), BoxError> {
        if let Err(err) = next.run(ctx).await {
            warn!(
                error = err.to_string(),
                queue = ctx.queue_name(),
                "pipeline failed, message will be nacked"
            );
            ctx.nack(self.requeue);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AckDecision, Message};
    use futures_util::future::BoxFuture;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    /// Records `{id}` on entry and `{id}'` after its `next` completes.
    struct Recorder {
        id: &'static str,
        log: Log,
        call_next: bool,
        fail: Option<&'static str>,
    }

    impl Recorder {
        fn mounted(id: &'static str, log: &Log) -> Arc<dyn Middleware> {
            Arc::new(Recorder {
                id,
                log: log.clone(),
                call_next: true,
                fail: None,
            })
        }

        fn short_circuiting(id: &'static str, log: &Log) -> Arc<dyn Middleware> {
            Arc::new(Recorder {
                id,
                log: log.clone(),
                call_next: false,
                fail: None,
            })
        }

        fn failing(id: &'static str, log: &Log, message: &'static str) -> Arc<dyn Middleware> {
            Arc::new(Recorder {
                id,
                log: log.clone(),
                call_next: true,
                fail: Some(message),
            })
        }
    }

    #[async_trait]
    impl Middleware for Recorder {
        async fn handle(&self, ctx: &mut Context, mut next: Next<'_>) -> Result<(), BoxError> {
            self.log.lock().unwrap().push(self.id.to_owned());
            if let Some(message) = self.fail {
                return Err(message.into());
            }
            if self.call_next {
                next.run(ctx).await?;
                self.log.lock().unwrap().push(format!("{}'", self.id));
            } else {
                self.log.lock().unwrap().push(format!("{}'", self.id));
            }
            Ok(())
        }
    }

    fn context() -> Context {
        Context::new("jobs", Message::default())
    }

    fn recorded(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn traversal_is_downstream_then_upstream_in_reverse() {
        let log: Log = Arc::default();
        let pipeline = vec![
            Recorder::mounted("1", &log),
            Recorder::mounted("2", &log),
            Recorder::mounted("3", &log),
            Recorder::mounted("4", &log),
        ];
        let mut ctx = context();

        run_pipeline(&pipeline, &mut ctx).await.unwrap();

        assert_eq!(
            recorded(&log),
            vec!["1", "2", "3", "4", "4'", "3'", "2'", "1'"]
        );
    }

    #[tokio::test]
    async fn skipping_next_short_circuits_downstream() {
        let log: Log = Arc::default();
        let pipeline = vec![
            Recorder::mounted("a", &log),
            Recorder::short_circuiting("b", &log),
            Recorder::mounted("c", &log),
        ];
        let mut ctx = context();

        run_pipeline(&pipeline, &mut ctx).await.unwrap();

        assert_eq!(recorded(&log), vec!["a", "b", "b'", "a'"]);
    }

    #[tokio::test]
    async fn failure_unwinds_without_upstream_halves() {
        let log: Log = Arc::default();
        let pipeline = vec![
            Recorder::mounted("a", &log),
            Recorder::failing("b", &log, "boom"),
            Recorder::mounted("c", &log),
        ];
        let mut ctx = context();

        let err = run_pipeline(&pipeline, &mut ctx).await.unwrap_err();

        assert_eq!(err.to_string(), "boom");
        assert_eq!(recorded(&log), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn empty_pipeline_resolves_immediately() {
        let mut ctx = context();
        run_pipeline(&[], &mut ctx).await.unwrap();
    }

    #[tokio::test]
    async fn second_next_invocation_is_pipeline_misuse() {
        struct DoubleNext;

        #[async_trait]
        impl Middleware for DoubleNext {
            async fn handle(&self, ctx: &mut Context, mut next: Next<'_>) -> Result<(), BoxError> {
                next.run(ctx).await?;
                next.run(ctx).await
            }
        }

        let pipeline: Vec<Arc<dyn Middleware>> = vec![Arc::new(DoubleNext)];
        let mut ctx = context();

        let err = run_pipeline(&pipeline, &mut ctx).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::PipelineMisuse)
        ));
    }

    #[tokio::test]
    async fn function_middleware_mounts() {
        fn mark<'a>(
            ctx: &'a mut Context,
            mut next: Next<'a>,
        ) -> BoxFuture<'a, Result<(), BoxError>> {
            Box::pin(async move {
                ctx.set(42u32);
                next.run(ctx).await
            })
        }

        let pipeline = vec![middleware_fn(mark)];
        let mut ctx = context();

        run_pipeline(&pipeline, &mut ctx).await.unwrap();
        assert_eq!(ctx.get::<u32>(), Some(&42));
    }

    #[tokio::test]
    async fn nack_on_error_swallows_and_nacks() {
        let log: Log = Arc::default();
        let pipeline = vec![nack_on_error(true), Recorder::failing("b", &log, "boom")];
        let mut ctx = context();

        run_pipeline(&pipeline, &mut ctx).await.unwrap();
        assert_eq!(ctx.decision(), AckDecision::Nack { requeue: true });
    }
}
