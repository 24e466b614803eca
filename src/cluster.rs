// Copyright (c) 2025, The Coworkers Authors
// MIT License
// All rights reserved.

//! # Cluster Manager
//!
//! This module supervises one worker process per declared queue. The master
//! forks workers through a [`WorkerSpawner`], waits for each to signal
//! readiness, restarts workers that exit non-zero while the fleet is
//! running, and shuts the fleet down with an escalating
//! SIGINT/SIGTERM/SIGKILL sequence. While the fleet is quiescent in the
//! running state, the live-worker-to-queue mapping is a bijection over the
//! registered queues.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, warn};

use crate::config::{ENV_QUEUE, ENV_QUEUE_WORKER_NUM};
use crate::errors::Error;

/// Line a worker prints on stdout once it is consuming its queue.
pub(crate) const READY_MARKER: &str = "coworkers:ready";

/// Signals the manager sends to workers during shutdown, in escalation
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    Interrupt,
    Terminate,
    Kill,
}

/// A live worker as seen by the manager.
#[async_trait]
pub trait WorkerHandle: Send + 'static {
    type Signaller: WorkerSignaller;

    /// A handle that can signal this worker after the manager has handed
    /// the worker to its monitor.
    fn signaller(&self) -> Self::Signaller;

    /// Resolves once the worker signalled readiness; fails if the worker
    /// exits first.
    async fn wait_ready(&mut self) -> Result<(), Error>;

    /// Awaits the worker's exit.
    ///
    /// # Returns
    /// The exit code; deaths without one (signals) map to -1
    async fn wait_exit(&mut self) -> i32;
}

/// Sends shutdown signals to a worker.
pub trait WorkerSignaller: Clone + Send + Sync + 'static {
    fn signal(&self, signal: WorkerSignal) -> Result<(), Error>;
}

/// Forks workers; the seam between the manager and the operating system.
#[async_trait]
pub trait WorkerSpawner: Send + Sync + 'static {
    type Handle: WorkerHandle;

    /// Forks a worker bound to one queue.
    ///
    /// # Parameters
    /// * `queue_name` - The queue the worker consumes
    /// * `worker_num` - Worker index within the queue's pool
    async fn spawn(&self, queue_name: &str, worker_num: u32) -> Result<Self::Handle, Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopping,
}

struct WorkerSlot<S: WorkerSpawner> {
    queue_name: String,
    signaller: <S::Handle as WorkerHandle>::Signaller,
}

struct ClusterState<S: WorkerSpawner> {
    phase: Phase,
    workers: HashMap<u64, WorkerSlot<S>>,
    next_worker_id: u64,
    spawn_counts: HashMap<String, u32>,
}

struct ClusterInner<S: WorkerSpawner> {
    spawner: S,
    queues: Vec<String>,
    graceful_timeout: Duration,
    term_timeout: Duration,
    state: Mutex<ClusterState<S>>,
    worker_count: watch::Sender<usize>,
}

/// Supervises one worker process per declared queue.
pub struct ClusterManager<S: WorkerSpawner = ProcessSpawner> {
    inner: Arc<ClusterInner<S>>,
}

impl<S: WorkerSpawner> Clone for ClusterManager<S> {
    fn clone(&self) -> Self {
        ClusterManager {
            inner: self.inner.clone(),
        }
    }
}

impl<S: WorkerSpawner> ClusterManager<S> {
    /// Creates a manager for the given queues.
    ///
    /// # Parameters
    /// * `spawner` - Forks workers
    /// * `queues` - One worker is kept alive per entry
    /// * `graceful_timeout` - Budget for workers to exit after SIGINT
    /// * `term_timeout` - Budget after escalation to SIGTERM, before SIGKILL
    pub fn new(
        spawner: S,
        queues: Vec<String>,
        graceful_timeout: Duration,
        term_timeout: Duration,
    ) -> ClusterManager<S> {
        ClusterManager {
            inner: Arc::new(ClusterInner {
                spawner,
                queues,
                graceful_timeout,
                term_timeout,
                state: Mutex::new(ClusterState {
                    phase: Phase::Idle,
                    workers: HashMap::new(),
                    next_worker_id: 1,
                    spawn_counts: HashMap::new(),
                }),
                worker_count: watch::channel(0).0,
            }),
        }
    }

    /// Forks one worker per queue and resolves once every worker signalled
    /// readiness. The first worker exit before that fails the start and
    /// kills the partial fleet.
    pub async fn start(&self) -> Result<(), Error> {
        let mut state = self.inner.state.lock().await;
        match state.phase {
            Phase::Running => return Ok(()),
            Phase::Stopping => {
                return Err(Error::Validation("cluster is stopping".to_owned()));
            }
            Phase::Idle => {}
        }

        let mut spawned = Vec::with_capacity(self.inner.queues.len());
        for queue_name in &self.inner.queues {
            let worker_num = next_spawn_num(&mut state.spawn_counts, queue_name);
            match self.inner.spawner.spawn(queue_name, worker_num).await {
                Ok(handle) => spawned.push((queue_name.clone(), handle)),
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        queue = queue_name.as_str(),
                        "failure to fork worker"
                    );
                    kill_fleet(&spawned);
                    return Err(err);
                }
            }
        }

        let ready = futures_util::future::try_join_all(
            spawned.iter_mut().map(|(_, handle)| handle.wait_ready()),
        )
        .await;
        if let Err(err) = ready {
            error!(error = err.to_string(), "worker exited before readiness");
            kill_fleet(&spawned);
            return Err(err);
        }

        for (queue_name, handle) in spawned {
            install_worker(&self.inner, &mut state, queue_name, handle);
        }
        state.phase = Phase::Running;
        debug!(workers = state.workers.len(), "cluster running");
        Ok(())
    }

    /// Signals every worker to shut down and resolves once the worker set
    /// is empty, escalating SIGINT to SIGTERM to SIGKILL as the budgets
    /// run out.
    pub async fn stop(&self) -> Result<(), Error> {
        let signallers: Vec<_> = {
            let mut state = self.inner.state.lock().await;
            if state.phase == Phase::Idle && state.workers.is_empty() {
                return Ok(());
            }
            state.phase = Phase::Stopping;
            state
                .workers
                .values()
                .map(|slot| slot.signaller.clone())
                .collect()
        };

        debug!(workers = signallers.len(), "stopping cluster workers");
        for signaller in &signallers {
            if let Err(err) = signaller.signal(WorkerSignal::Interrupt) {
                warn!(error = err.to_string(), "failure to signal worker");
            }
        }
        if self.await_empty(self.inner.graceful_timeout).await {
            return self.finish_stop().await;
        }

        warn!("workers outlived the graceful budget, escalating to SIGTERM");
        self.signal_remaining(WorkerSignal::Terminate).await;
        if self.await_empty(self.inner.term_timeout).await {
            return self.finish_stop().await;
        }

        error!("workers outlived the SIGTERM budget, escalating to SIGKILL");
        self.signal_remaining(WorkerSignal::Kill).await;
        let mut worker_count = self.inner.worker_count.subscribe();
        let _ = worker_count.wait_for(|count| *count == 0).await;
        self.finish_stop().await
    }

    /// The queues currently covered by a live worker.
    pub async fn live_queues(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        state
            .workers
            .values()
            .map(|slot| slot.queue_name.clone())
            .collect()
    }

    async fn await_empty(&self, budget: Duration) -> bool {
        let mut worker_count = self.inner.worker_count.subscribe();
        let result = tokio::time::timeout(budget, worker_count.wait_for(|count| *count == 0)).await;
        result.is_ok()
    }

    async fn signal_remaining(&self, signal: WorkerSignal) {
        let signallers: Vec<_> = {
            let state = self.inner.state.lock().await;
            state
                .workers
                .values()
                .map(|slot| slot.signaller.clone())
                .collect()
        };
        for signaller in &signallers {
            if let Err(err) = signaller.signal(signal) {
                warn!(error = err.to_string(), "failure to signal worker");
            }
        }
    }

    async fn finish_stop(&self) -> Result<(), Error> {
        let mut state = self.inner.state.lock().await;
        state.phase = Phase::Idle;
        debug!("cluster stopped");
        Ok(())
    }
}

fn next_spawn_num(spawn_counts: &mut HashMap<String, u32>, queue_name: &str) -> u32 {
    let count = spawn_counts.entry(queue_name.to_owned()).or_insert(0);
    *count += 1;
    *count
}

fn kill_fleet<H: WorkerHandle>(spawned: &[(String, H)]) {
    for (_, handle) in spawned {
        let _ = handle.signaller().signal(WorkerSignal::Kill);
    }
}

fn install_worker<S: WorkerSpawner>(
    inner: &Arc<ClusterInner<S>>,
    state: &mut ClusterState<S>,
    queue_name: String,
    handle: S::Handle,
) {
    let worker_id = state.next_worker_id;
    state.next_worker_id += 1;
    state.workers.insert(
        worker_id,
        WorkerSlot {
            queue_name: queue_name.clone(),
            signaller: handle.signaller(),
        },
    );
    inner.worker_count.send_replace(state.workers.len());
    tokio::spawn(monitor(inner.clone(), worker_id, queue_name, handle));
}

/// Awaits one worker's exit and applies the restart policy.
fn monitor<S: WorkerSpawner>(
    inner: Arc<ClusterInner<S>>,
    worker_id: u64,
    queue_name: String,
    mut handle: S::Handle,
) -> BoxFuture<'static, ()> {
    // Boxed: the restart path spawns a monitor for the replacement.
    async move {
        let code = handle.wait_exit().await;
        handle_exit(inner, worker_id, queue_name, code).await;
    }
    .boxed()
}

async fn handle_exit<S: WorkerSpawner>(
    inner: Arc<ClusterInner<S>>,
    worker_id: u64,
    queue_name: String,
    code: i32,
) {
    let respawn_num = {
        let mut state = inner.state.lock().await;
        state.workers.remove(&worker_id);
        inner.worker_count.send_replace(state.workers.len());

        match state.phase {
            Phase::Stopping | Phase::Idle => {
                debug!(queue = queue_name.as_str(), code = code, "worker exited");
                None
            }
            Phase::Running if code == 0 => {
                warn!(
                    queue = queue_name.as_str(),
                    "worker exited cleanly, not restarting"
                );
                None
            }
            Phase::Running => Some(next_spawn_num(&mut state.spawn_counts, &queue_name)),
        }
    };
    let Some(worker_num) = respawn_num else {
        return;
    };

    error!(
        queue = queue_name.as_str(),
        code = code,
        "worker exited, forking a replacement"
    );
    match inner.spawner.spawn(&queue_name, worker_num).await {
        Ok(replacement) => {
            let mut state = inner.state.lock().await;
            if state.phase == Phase::Running {
                install_worker(&inner, &mut state, queue_name, replacement);
            } else {
                warn!(
                    queue = queue_name.as_str(),
                    "fleet is stopping, discarding replacement worker"
                );
                let _ = replacement.signaller().signal(WorkerSignal::Kill);
            }
        }
        Err(err) => error!(
            error = err.to_string(),
            queue = queue_name.as_str(),
            "failure to fork replacement worker"
        ),
    }
}

/// Forks workers by re-executing the current binary.
///
/// Each worker inherits the parent environment plus `COWORKERS_QUEUE` and
/// `COWORKERS_QUEUE_WORKER_NUM`; its stdout is piped so the manager can
/// observe the readiness line, then forwarded through.
pub struct ProcessSpawner {
    program: PathBuf,
}

impl ProcessSpawner {
    /// Spawner re-executing the current binary for each worker.
    pub fn from_current_exe() -> Result<ProcessSpawner, Error> {
        let program = std::env::current_exe()
            .map_err(|err| Error::transport("failure to resolve current executable", err))?;
        Ok(ProcessSpawner { program })
    }

    /// Spawner executing an explicit worker binary.
    pub fn new(program: impl Into<PathBuf>) -> ProcessSpawner {
        ProcessSpawner {
            program: program.into(),
        }
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    type Handle = ProcessWorker;

    async fn spawn(&self, queue_name: &str, worker_num: u32) -> Result<ProcessWorker, Error> {
        let mut child = Command::new(&self.program)
            .env(ENV_QUEUE, queue_name)
            .env(ENV_QUEUE_WORKER_NUM, worker_num.to_string())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|err| {
                Error::transport(format!("failure to fork worker for queue `{queue_name}`"), err)
            })?;

        let lines = child
            .stdout
            .take()
            .map(|stdout| BufReader::new(stdout).lines());
        let pid = child.id();
        debug!(queue = queue_name, pid = pid, "worker forked");

        Ok(ProcessWorker { child, lines, pid })
    }
}

/// A forked worker process.
pub struct ProcessWorker {
    child: Child,
    lines: Option<Lines<BufReader<ChildStdout>>>,
    pid: Option<u32>,
}

impl ProcessWorker {
    /// Forwards any remaining worker output to the parent's stdout.
    fn forward_stdout(&mut self) {
        if let Some(mut lines) = self.lines.take() {
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    println!("{line}");
                }
            });
        }
    }
}

#[async_trait]
impl WorkerHandle for ProcessWorker {
    type Signaller = ProcessSignaller;

    fn signaller(&self) -> ProcessSignaller {
        ProcessSignaller { pid: self.pid }
    }

    async fn wait_ready(&mut self) -> Result<(), Error> {
        let Some(lines) = self.lines.as_mut() else {
            return Ok(());
        };
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim() == READY_MARKER => {
                    self.forward_stdout();
                    return Ok(());
                }
                Ok(Some(line)) => println!("{line}"),
                Ok(None) => {
                    return Err(Error::transport_msg("worker exited before signalling ready"))
                }
                Err(err) => {
                    return Err(Error::transport("failure to read worker output", err));
                }
            }
        }
    }

    async fn wait_exit(&mut self) -> i32 {
        self.forward_stdout();
        match self.child.wait().await {
            Ok(status) => status.code().unwrap_or(-1),
            Err(err) => {
                error!(error = err.to_string(), "failure to await worker exit");
                -1
            }
        }
    }
}

/// Sends signals to a worker process by pid.
#[derive(Debug, Clone)]
pub struct ProcessSignaller {
    pid: Option<u32>,
}

impl WorkerSignaller for ProcessSignaller {
    fn signal(&self, signal: WorkerSignal) -> Result<(), Error> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        let signal = match signal {
            WorkerSignal::Interrupt => Signal::SIGINT,
            WorkerSignal::Terminate => Signal::SIGTERM,
            WorkerSignal::Kill => Signal::SIGKILL,
        };
        match kill(Pid::from_raw(pid as i32), signal) {
            // Already-gone workers are not an error
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(err) => Err(Error::transport(
                format!("failure to signal worker {pid}"),
                err,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;
    use tokio::time::sleep;

    #[derive(Clone)]
    struct MockControl {
        queue: String,
        worker_num: u32,
        exit_tx: mpsc::UnboundedSender<i32>,
        signals: Arc<StdMutex<Vec<WorkerSignal>>>,
    }

    #[derive(Clone, Default)]
    struct MockSpawner {
        controls: Arc<StdMutex<Vec<MockControl>>>,
        fail_ready_for: Option<String>,
        stubborn: bool,
    }

    impl MockSpawner {
        fn controls(&self) -> Vec<MockControl> {
            self.controls.lock().unwrap().clone()
        }
    }

    struct MockWorker {
        ready_ok: bool,
        exit_rx: mpsc::UnboundedReceiver<i32>,
        signaller: MockSignaller,
    }

    #[derive(Clone)]
    struct MockSignaller {
        exit_tx: mpsc::UnboundedSender<i32>,
        signals: Arc<StdMutex<Vec<WorkerSignal>>>,
        stubborn: bool,
    }

    impl WorkerSignaller for MockSignaller {
        fn signal(&self, signal: WorkerSignal) -> Result<(), Error> {
            self.signals.lock().unwrap().push(signal);
            let exits = match signal {
                WorkerSignal::Kill => true,
                _ => !self.stubborn,
            };
            if exits {
                let code = if signal == WorkerSignal::Kill { -1 } else { 0 };
                let _ = self.exit_tx.send(code);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl WorkerHandle for MockWorker {
        type Signaller = MockSignaller;

        fn signaller(&self) -> MockSignaller {
            self.signaller.clone()
        }

        async fn wait_ready(&mut self) -> Result<(), Error> {
            if self.ready_ok {
                Ok(())
            } else {
                Err(Error::transport_msg("worker exited before signalling ready"))
            }
        }

        async fn wait_exit(&mut self) -> i32 {
            self.exit_rx.recv().await.unwrap_or(-1)
        }
    }

    #[async_trait]
    impl WorkerSpawner for MockSpawner {
        type Handle = MockWorker;

        async fn spawn(&self, queue_name: &str, worker_num: u32) -> Result<MockWorker, Error> {
            let (exit_tx, exit_rx) = mpsc::unbounded_channel();
            let signals = Arc::new(StdMutex::new(Vec::new()));
            self.controls.lock().unwrap().push(MockControl {
                queue: queue_name.to_owned(),
                worker_num,
                exit_tx: exit_tx.clone(),
                signals: signals.clone(),
            });
            Ok(MockWorker {
                ready_ok: self.fail_ready_for.as_deref() != Some(queue_name),
                exit_rx,
                signaller: MockSignaller {
                    exit_tx,
                    signals,
                    stubborn: self.stubborn,
                },
            })
        }
    }

    fn manager(spawner: &MockSpawner, queues: &[&str]) -> ClusterManager<MockSpawner> {
        ClusterManager::new(
            spawner.clone(),
            queues.iter().map(|queue| queue.to_string()).collect(),
            Duration::from_millis(50),
            Duration::from_millis(50),
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn start_forks_one_worker_per_queue() {
        let spawner = MockSpawner::default();
        let manager = manager(&spawner, &["a", "b", "c"]);

        manager.start().await.unwrap();

        let controls = spawner.controls();
        assert_eq!(controls.len(), 3);
        let queues: Vec<&str> = controls.iter().map(|control| control.queue.as_str()).collect();
        assert_eq!(queues, vec!["a", "b", "c"]);
        assert!(controls.iter().all(|control| control.worker_num == 1));

        let mut live = manager.live_queues().await;
        live.sort();
        assert_eq!(live, vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn start_fails_when_a_worker_exits_before_ready() {
        let spawner = MockSpawner {
            fail_ready_for: Some("b".to_owned()),
            ..MockSpawner::default()
        };
        let manager = manager(&spawner, &["a", "b"]);

        let err = manager.start().await.unwrap_err();
        assert!(err.to_string().contains("before signalling ready"));

        // the partial fleet is killed and nothing is installed
        for control in spawner.controls() {
            assert!(control.signals.lock().unwrap().contains(&WorkerSignal::Kill));
        }
        assert!(manager.live_queues().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn nonzero_exit_respawns_for_the_same_queue() {
        let spawner = MockSpawner::default();
        let manager = manager(&spawner, &["a", "b"]);
        manager.start().await.unwrap();

        let crashed = spawner
            .controls()
            .into_iter()
            .find(|control| control.queue == "a")
            .unwrap();
        crashed.exit_tx.send(1).unwrap();

        let spawner_poll = spawner.clone();
        wait_until(move || spawner_poll.controls().len() == 3).await;

        let replacement = &spawner.controls()[2];
        assert_eq!(replacement.queue, "a");
        assert_eq!(replacement.worker_num, 2);

        let mut live = manager.live_queues().await;
        live.sort();
        assert_eq!(live, vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_exit_while_running_is_not_restarted() {
        let spawner = MockSpawner::default();
        let manager = manager(&spawner, &["a", "b"]);
        manager.start().await.unwrap();

        let finished = spawner
            .controls()
            .into_iter()
            .find(|control| control.queue == "a")
            .unwrap();
        finished.exit_tx.send(0).unwrap();

        wait_until(|| *manager.inner.worker_count.subscribe().borrow() == 1).await;
        assert_eq!(manager.live_queues().await, vec!["b"]);
        assert_eq!(spawner.controls().len(), 2, "no replacement forked");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_workers_and_drains_the_fleet() {
        let spawner = MockSpawner::default();
        let manager = manager(&spawner, &["a", "b"]);
        manager.start().await.unwrap();

        manager.stop().await.unwrap();

        for control in spawner.controls() {
            assert_eq!(
                control.signals.lock().unwrap().clone(),
                vec![WorkerSignal::Interrupt]
            );
        }
        assert!(manager.live_queues().await.is_empty());
        assert_eq!(spawner.controls().len(), 2, "exits during stop never restart");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_escalates_to_sigterm_then_sigkill() {
        let spawner = MockSpawner {
            stubborn: true,
            ..MockSpawner::default()
        };
        let manager = manager(&spawner, &["a"]);
        manager.start().await.unwrap();

        manager.stop().await.unwrap();

        let signals = spawner.controls()[0].signals.lock().unwrap().clone();
        assert_eq!(
            signals,
            vec![
                WorkerSignal::Interrupt,
                WorkerSignal::Terminate,
                WorkerSignal::Kill
            ]
        );
        assert!(manager.live_queues().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_while_running_is_a_no_op() {
        let spawner = MockSpawner::default();
        let manager = manager(&spawner, &["a"]);

        manager.start().await.unwrap();
        manager.start().await.unwrap();

        assert_eq!(spawner.controls().len(), 1);
    }
}
