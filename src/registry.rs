// Copyright (c) 2025, The Coworkers Authors
// MIT License
// All rights reserved.

//! # Queue Registry
//!
//! This module stores what the application consumes: the global middleware
//! applied to every queue, and one entry per declared queue holding its
//! options and middleware pipeline. Registration is validated and
//! append-only; entries keep their insertion order.
//!
//! When a schema collaborator is attached, it owns queue-assertion options:
//! every registered queue must resolve in the schema and may not carry
//! caller-supplied options.

use std::sync::Arc;

use crate::errors::Error;
use crate::middleware::Middleware;
use crate::queue::{ConsumeOptions, QueueEntry, QueueOptions};

/// Maps queue names to the payload contract the application consumes.
///
/// When present, the schema constrains registration: a queue must resolve
/// here, and the assertion options it resolves to are used in place of any
/// caller-supplied ones.
pub trait Schema: Send + Sync {
    /// Resolves a queue name to its assertion options.
    ///
    /// # Returns
    /// The options to assert the queue with, or `None` when the queue is
    /// not part of the schema
    fn resolve(&self, queue_name: &str) -> Option<QueueOptions>;
}

/// Validates and stores queue registrations and the global middleware list.
pub(crate) struct Registry {
    global: Vec<Arc<dyn Middleware>>,
    entries: Vec<QueueEntry>,
    schema: Option<Arc<dyn Schema>>,
}

impl Registry {
    pub(crate) fn new(schema: Option<Arc<dyn Schema>>) -> Registry {
        Registry {
            global: Vec::new(),
            entries: Vec::new(),
            schema,
        }
    }

    /// Appends middleware to the global list applied to every queue.
    pub(crate) fn add_middleware(&mut self, middleware: Arc<dyn Middleware>) {
        self.global.push(middleware);
    }

    /// Registers a queue entry.
    ///
    /// # Parameters
    /// * `name` - Queue name, unique within the registry
    /// * `queue_options` - Assertion options; must be absent under a schema
    /// * `consume_options` - Consumer attachment options
    /// * `middleware` - Ordered, non-empty pipeline for this queue
    pub(crate) fn add_queue(
        &mut self,
        name: &str,
        queue_options: Option<QueueOptions>,
        consume_options: Option<ConsumeOptions>,
        middleware: Vec<Arc<dyn Middleware>>,
    ) -> Result<(), Error> {
        if name.is_empty() {
            return Err(Error::Validation(
                "queue name must be a non-empty string".to_owned(),
            ));
        }
        if middleware.is_empty() {
            return Err(Error::Validation(format!(
                "queue `{name}` requires at least one middleware"
            )));
        }
        if self.entries.iter().any(|entry| entry.name == name) {
            return Err(Error::AlreadyExists(name.to_owned()));
        }

        let queue_options = match &self.schema {
            None => queue_options.unwrap_or_default(),
            Some(schema) => {
                if queue_options.is_some() {
                    return Err(Error::SchemaViolation(format!(
                        "queue `{name}`: assertion options are owned by the schema"
                    )));
                }
                schema.resolve(name).ok_or_else(|| {
                    Error::SchemaViolation(format!("queue `{name}` does not resolve in the schema"))
                })?
            }
        };

        self.entries.push(QueueEntry {
            name: name.to_owned(),
            queue_options,
            consume_options: consume_options.unwrap_or_default(),
            middleware,
        });
        Ok(())
    }

    /// Registered queue names in insertion order.
    pub(crate) fn queue_names(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.name.clone()).collect()
    }

    pub(crate) fn entry(&self, name: &str) -> Option<&QueueEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    pub(crate) fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    /// The flattened pipeline for a queue: global middleware first, in
    /// registration order, then the queue's own.
    pub(crate) fn pipeline_for(&self, name: &str) -> Option<Vec<Arc<dyn Middleware>>> {
        let entry = self.entry(name)?;
        let mut pipeline = Vec::with_capacity(self.global.len() + entry.middleware.len());
        pipeline.extend(self.global.iter().cloned());
        pipeline.extend(entry.middleware.iter().cloned());
        Some(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::errors::BoxError;
    use crate::middleware::Next;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl Middleware for Noop {
        async fn handle(&self, ctx: &mut Context, mut next: Next<'_>) -> Result<(), BoxError> {
            next.run(ctx).await
        }
    }

    fn noop() -> Arc<dyn Middleware> {
        Arc::new(Noop)
    }

    struct FixedSchema(Vec<&'static str>);

    impl Schema for FixedSchema {
        fn resolve(&self, queue_name: &str) -> Option<QueueOptions> {
            self.0
                .iter()
                .any(|known| *known == queue_name)
                .then(|| QueueOptions::new().durable())
        }
    }

    #[test]
    fn names_keep_insertion_order() {
        let mut registry = Registry::new(None);
        registry.add_queue("c", None, None, vec![noop()]).unwrap();
        registry.add_queue("a", None, None, vec![noop()]).unwrap();
        registry.add_queue("b", None, None, vec![noop()]).unwrap();

        assert_eq!(registry.queue_names(), vec!["c", "a", "b"]);
    }

    #[test]
    fn empty_name_is_rejected() {
        let mut registry = Registry::new(None);
        let err = registry.add_queue("", None, None, vec![noop()]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn missing_middleware_is_rejected() {
        let mut registry = Registry::new(None);
        let err = registry.add_queue("jobs", None, None, vec![]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = Registry::new(None);
        registry.add_queue("jobs", None, None, vec![noop()]).unwrap();

        let err = registry
            .add_queue("jobs", None, None, vec![noop()])
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(name) if name == "jobs"));
        assert_eq!(registry.queue_names(), vec!["jobs"]);
    }

    #[test]
    fn schema_owns_queue_options() {
        let mut registry = Registry::new(Some(Arc::new(FixedSchema(vec!["jobs"]))));

        let err = registry
            .add_queue("jobs", Some(QueueOptions::new()), None, vec![noop()])
            .unwrap_err();
        assert!(matches!(err, Error::SchemaViolation(_)));

        registry.add_queue("jobs", None, None, vec![noop()]).unwrap();
        let entry = registry.entry("jobs").unwrap();
        assert!(entry.queue_options().durable);
    }

    #[test]
    fn unresolved_queue_violates_schema() {
        let mut registry = Registry::new(Some(Arc::new(FixedSchema(vec!["jobs"]))));

        let err = registry
            .add_queue("other", None, None, vec![noop()])
            .unwrap_err();
        assert!(matches!(err, Error::SchemaViolation(_)));
    }

    #[test]
    fn pipeline_flattens_global_then_queue_middleware() {
        let mut registry = Registry::new(None);
        registry.add_middleware(noop());
        registry.add_middleware(noop());
        registry
            .add_queue("jobs", None, None, vec![noop(), noop(), noop()])
            .unwrap();

        assert_eq!(registry.pipeline_for("jobs").unwrap().len(), 5);
        assert!(registry.pipeline_for("missing").is_none());
    }
}
