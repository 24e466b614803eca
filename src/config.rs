// Copyright (c) 2025, The Coworkers Authors
// MIT License
// All rights reserved.

//! # Application Configuration
//!
//! This module provides the configuration consumed by [`crate::app::App`].
//! Options follow a builder pattern; a handful of `COWORKERS_*` environment
//! variables supply defaults and the master/worker process split.

use std::env;
use std::time::Duration;

/// Overrides the `cluster` option when set to the string `"true"`.
pub const ENV_CLUSTER: &str = "COWORKERS_CLUSTER";
/// Default for `queue_name` in single-process mode; injected into workers.
pub const ENV_QUEUE: &str = "COWORKERS_QUEUE";
/// Injected by the cluster manager; marks the process as a cluster worker
/// and identifies the worker index within its queue's pool.
pub const ENV_QUEUE_WORKER_NUM: &str = "COWORKERS_QUEUE_WORKER_NUM";
/// Default broker URL when `connect` is invoked without one.
pub const ENV_RABBITMQ_URL: &str = "COWORKERS_RABBITMQ_URL";

/// Application configuration.
///
/// Created with [`Config::default`] or [`Config::from_env`] and refined with
/// the chainable setters.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) cluster: bool,
    pub(crate) queue_name: Option<String>,
    pub(crate) prefetch: Option<u16>,
    pub(crate) url: Option<String>,
    pub(crate) connection_name: String,
    pub(crate) graceful_timeout: Duration,
    pub(crate) term_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cluster: true,
            queue_name: None,
            prefetch: None,
            url: None,
            connection_name: "coworkers".to_owned(),
            graceful_timeout: Duration::from_secs(10),
            term_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Creates a configuration with defaults and environment overrides
    /// applied.
    ///
    /// `COWORKERS_CLUSTER="true"` forces clustering on and
    /// `COWORKERS_RABBITMQ_URL` supplies the default broker URL. The queue
    /// name fallback from `COWORKERS_QUEUE` is resolved lazily at connect
    /// time so worker processes pick up the value the manager injected.
    pub fn from_env() -> Config {
        let mut config = Config::default();
        if let Ok(value) = env::var(ENV_CLUSTER) {
            if value == "true" {
                config.cluster = true;
            }
        }
        if let Ok(url) = env::var(ENV_RABBITMQ_URL) {
            config.url = Some(url);
        }
        config
    }

    /// Enables or disables master/worker supervision.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn cluster(mut self, cluster: bool) -> Self {
        self.cluster = cluster;
        self
    }

    /// Sets the single queue this process consumes.
    ///
    /// Required when clustering is disabled; ignored (with a warning) when
    /// clustering is enabled.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn queue_name(mut self, name: &str) -> Self {
        self.queue_name = Some(name.to_owned());
        self
    }

    /// Sets the per-channel prefetch applied before consuming.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    /// Sets the broker URL used when `connect` is invoked without one.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn url(mut self, url: &str) -> Self {
        self.url = Some(url.to_owned());
        self
    }

    /// Sets the connection name reported to the broker.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn connection_name(mut self, name: &str) -> Self {
        self.connection_name = name.to_owned();
        self
    }

    /// Sets the budget workers get to exit after a graceful SIGINT.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn graceful_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_timeout = timeout;
        self
    }

    /// Sets the budget workers get after escalation to SIGTERM, before
    /// SIGKILL.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn term_timeout(mut self, timeout: Duration) -> Self {
        self.term_timeout = timeout;
        self
    }

    /// The queue name this process should consume, if any.
    ///
    /// Worker processes use the name injected by the manager; otherwise the
    /// configured name wins, falling back to `COWORKERS_QUEUE`.
    pub(crate) fn resolved_queue_name(&self) -> Option<String> {
        if is_cluster_worker() {
            return env::var(ENV_QUEUE).ok();
        }
        self.queue_name
            .clone()
            .or_else(|| env::var(ENV_QUEUE).ok())
    }

    /// The broker URL to connect with, preferring the explicit argument.
    pub(crate) fn resolved_url(&self, url: Option<&str>) -> Option<String> {
        url.map(str::to_owned)
            .or_else(|| self.url.clone())
            .or_else(|| env::var(ENV_RABBITMQ_URL).ok())
    }
}

/// Whether this process was forked by a cluster manager.
pub(crate) fn is_cluster_worker() -> bool {
    env::var(ENV_QUEUE_WORKER_NUM).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_clustering() {
        let config = Config::default();
        assert!(config.cluster);
        assert!(config.queue_name.is_none());
        assert!(config.prefetch.is_none());
    }

    #[test]
    fn builder_chains() {
        let config = Config::default()
            .cluster(false)
            .queue_name("jobs")
            .prefetch(32)
            .url("amqp://localhost:5672")
            .connection_name("billing");

        assert!(!config.cluster);
        assert_eq!(config.queue_name.as_deref(), Some("jobs"));
        assert_eq!(config.prefetch, Some(32));
        assert_eq!(config.connection_name, "billing");
    }

    #[test]
    fn explicit_url_wins_over_configured_default() {
        let config = Config::default().url("amqp://configured:5672");

        assert_eq!(
            config.resolved_url(Some("amqp://explicit:5672")).as_deref(),
            Some("amqp://explicit:5672")
        );
        assert_eq!(
            config.resolved_url(None).as_deref(),
            Some("amqp://configured:5672")
        );
    }

    #[test]
    fn env_overrides_apply() {
        let _env = crate::testing::ENV_LOCK.lock().unwrap();
        env::set_var(ENV_CLUSTER, "true");
        env::set_var(ENV_RABBITMQ_URL, "amqp://from-env:5672");

        let config = Config::from_env();
        assert!(config.cluster);
        assert_eq!(config.url.as_deref(), Some("amqp://from-env:5672"));

        env::remove_var(ENV_CLUSTER);
        env::remove_var(ENV_RABBITMQ_URL);
    }
}
