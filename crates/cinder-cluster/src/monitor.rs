//! Per-peer health monitoring workers.
//!
//! Each watched peer gets one long-lived [`NodeMonitor`] task that owns
//! the control-plane connection to that peer. The task alternates
//! between two duties: when its inbox is quiet for `interval`, it sends
//! a ping probe; when a message arrives, it executes the queued work.
//! Probe results feed a debounced counter that publishes `down_node` /
//! `up_node` transitions to the directory.

use std::sync::{Arc, Mutex};

use cinder_protocol::{Connection, Ping};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::directory::{NodeAddress, NodeDirectory, NodeState};
use crate::error::MonitorError;
use crate::queue::{MonitorOption, ThreadQueue};
use crate::shutdown::Shutdown;

/// Inbox capacity per monitor. Control-plane traffic is light; a full
/// inbox means the peer (or this worker) is badly wedged, and callers
/// treat a failed enqueue as such.
const INBOX_CAPACITY: usize = 128;

/// What a transition decision asks the directory to publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Publish {
    Down,
    Up,
}

/// The debounced health counter.
///
/// Tracks consecutive probe failures against the peer. Lives on the
/// monitor task's stack; no locking. The threshold is passed in on each
/// call because it is runtime-mutable via `update_monitor_option`.
#[derive(Debug, Default)]
struct HealthState {
    down_state: u32,
}

impl HealthState {
    /// Realigns the counter with the directory's authoritative state, so
    /// out-of-band transitions are reflected in local accounting.
    fn resync(&mut self, reported_down: bool, threshold: u32) {
        self.down_state = if reported_down { threshold } else { 0 };
    }

    /// Records one failed probe. Publishes a down transition exactly
    /// when the counter reaches the threshold; strict equality keeps
    /// repeated failures after escalation from re-publishing. With a
    /// threshold of zero the post-increment counter never matches, so
    /// escalation is disabled.
    fn failure(&mut self, threshold: u32) -> Option<Publish> {
        self.down_state = self.down_state.saturating_add(1);
        (self.down_state == threshold).then_some(Publish::Down)
    }

    /// Records one successful probe. Publishes an up transition only if
    /// the peer was in the escalated range, then resets the counter.
    fn success(&mut self, threshold: u32) -> Option<Publish> {
        let was_escalated = self.is_escalated(threshold);
        self.down_state = 0;
        was_escalated.then_some(Publish::Up)
    }

    /// Whether the peer is currently considered down.
    fn is_escalated(&self, threshold: u32) -> bool {
        threshold > 0 && self.down_state >= threshold
    }
}

/// Diagnostic snapshot of a monitor worker: which peer it serves, what
/// it is doing, and which op is in flight. Pure metadata for the stats
/// surface.
pub struct MonitorStatus {
    peer: NodeAddress,
    inner: Mutex<StatusInner>,
}

struct StatusInner {
    state: String,
    op: String,
}

impl MonitorStatus {
    fn new(peer: NodeAddress) -> Self {
        Self {
            peer,
            inner: Mutex::new(StatusInner {
                state: String::new(),
                op: String::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatusInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn peer(&self) -> &NodeAddress {
        &self.peer
    }

    pub fn state(&self) -> String {
        self.lock().state.clone()
    }

    pub fn op(&self) -> String {
        self.lock().op.clone()
    }

    fn set_state(&self, state: &str) {
        self.lock().state = state.to_string();
    }

    fn set_op(&self, op: &str) {
        self.lock().op = op.to_string();
    }
}

/// Owning handle to a spawned monitor: the enqueue side of its inbox,
/// its diagnostics, and the join handle for teardown.
pub struct MonitorHandle {
    address: NodeAddress,
    inbox: mpsc::Sender<ThreadQueue>,
    status: Arc<MonitorStatus>,
    join: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn status(&self) -> Arc<MonitorStatus> {
        Arc::clone(&self.status)
    }

    /// Enqueues control-plane work for the worker, waiting for inbox
    /// space if needed. Returns false if the worker is gone.
    pub async fn enqueue(&self, queue: ThreadQueue) -> bool {
        if self.inbox.send(queue).await.is_err() {
            warn!("monitor for {} is gone, dropping queue", self.address);
            return false;
        }
        true
    }

    /// Waits for the worker to finish. Meaningful only after shutdown
    /// has been requested (or the handle's inbox sender dropped).
    pub async fn join(self) {
        let _ = self.join.await;
    }

    /// Aborts the worker outright. Teardown normally goes through the
    /// cooperative shutdown flag; this is the escalation for a worker
    /// stuck in peer I/O.
    pub fn abort(&self) {
        self.join.abort();
    }
}

enum Dequeued {
    Message(ThreadQueue),
    TimedOut,
    Closed,
}

/// The per-peer monitoring worker.
pub struct NodeMonitor {
    address: NodeAddress,
    directory: Arc<NodeDirectory>,
    inbox: mpsc::Receiver<ThreadQueue>,
    shutdown: Shutdown,
    status: Arc<MonitorStatus>,
    connection: Connection,
    option: MonitorOption,
    health: HealthState,
}

impl NodeMonitor {
    /// Spawns a monitor task for the given peer and returns its handle.
    ///
    /// The monitor starts with [`MonitorOption::DISABLED`]; the caller
    /// delivers real parameters by enqueueing an `update_monitor_option`
    /// message, the same path used for runtime reconfiguration.
    pub fn spawn(
        address: NodeAddress,
        directory: Arc<NodeDirectory>,
        shutdown: Shutdown,
    ) -> MonitorHandle {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let status = Arc::new(MonitorStatus::new(address.clone()));
        let connection = Connection::new(address.host.clone(), address.port);

        let monitor = NodeMonitor {
            address: address.clone(),
            directory,
            inbox: rx,
            shutdown,
            status: Arc::clone(&status),
            connection,
            option: MonitorOption::DISABLED,
            health: HealthState::default(),
        };

        let join = tokio::spawn(monitor.run());

        MonitorHandle {
            address,
            inbox: tx,
            status,
            join,
        }
    }

    async fn run(mut self) {
        info!("starting monitor for {}", self.address);
        self.status.set_state("connect");
        if let Err(e) = self.connection.open().await {
            warn!("failed to connect to node server {}: {e}", self.address);
            self.record_failure();
        }

        loop {
            self.status.set_state("wait");
            self.status.set_op("");

            if self.shutdown.is_requested() {
                info!("shutdown requested, stopping monitor for {}", self.address);
                self.status.set_state("shutdown");
                break;
            }

            let dequeued = self.dequeue().await;

            if self.shutdown.is_requested() {
                info!("shutdown requested, stopping monitor for {}", self.address);
                self.status.set_state("shutdown");
                break;
            }

            // Realign the debounce counter with the directory before
            // acting: another subsystem may have transitioned the node.
            let reported_down = matches!(
                self.directory.get_node(&self.address).map(|n| n.state),
                Some(NodeState::Down)
            );
            self.health.resync(reported_down, self.option.threshold);

            match dequeued {
                Dequeued::TimedOut => {
                    debug!("inbox quiet, probing {}", self.address);
                    match self.process_monitor().await {
                        Ok(()) => self.record_success(),
                        Err(e) => {
                            debug!("probe of {} failed: {e}", self.address);
                            self.record_failure();
                        }
                    }
                }
                Dequeued::Message(queue) => {
                    if let Err(e) = self.process_queue(queue).await {
                        debug!("queue processing for {} failed: {e}", self.address);
                        self.record_failure();
                    }
                }
                Dequeued::Closed => {
                    info!("inbox closed, stopping monitor for {}", self.address);
                    self.status.set_state("shutdown");
                    break;
                }
            }
        }

        self.connection.close();
    }

    /// Waits up to `interval` for the next inbox message. A zero
    /// interval waits indefinitely (probing disabled), but messages and
    /// shutdown are still serviced. A shutdown wakeup surfaces as
    /// `TimedOut`; the caller's re-check handles it before any probe.
    async fn dequeue(&mut self) -> Dequeued {
        if self.option.interval.is_zero() {
            tokio::select! {
                message = self.inbox.recv() => match message {
                    Some(queue) => Dequeued::Message(queue),
                    None => Dequeued::Closed,
                },
                _ = self.shutdown.requested() => Dequeued::TimedOut,
            }
        } else {
            tokio::select! {
                result = timeout(self.option.interval, self.inbox.recv()) => match result {
                    Ok(Some(queue)) => Dequeued::Message(queue),
                    Ok(None) => Dequeued::Closed,
                    Err(_) => Dequeued::TimedOut,
                },
                _ = self.shutdown.requested() => Dequeued::TimedOut,
            }
        }
    }

    /// Sends one ping probe, lazily reopening the connection if the last
    /// I/O left it unusable.
    async fn process_monitor(&mut self) -> Result<(), MonitorError> {
        if !self.connection.is_available() {
            info!("connection to {} unavailable, reopening", self.address);
            self.connection
                .open()
                .await
                .map_err(MonitorError::Transport)?;
        }

        self.status.set_state("execute");
        self.status.set_op(Ping::IDENT);

        Ping::new(&mut self.connection)
            .run_client()
            .await
            .map_err(MonitorError::Operation)
    }

    /// Executes one queued message.
    async fn process_queue(&mut self, queue: ThreadQueue) -> Result<(), MonitorError> {
        debug!("queue for {}: {}", self.address, queue.ident());
        self.status.set_state("execute");
        self.status.set_op(queue.ident());

        match queue {
            ThreadQueue::UpdateMonitorOption(option) => {
                debug!(
                    "updating monitor option for {} [threshold: {} -> {}, interval: {:?} -> {:?}]",
                    self.address,
                    self.option.threshold,
                    option.threshold,
                    self.option.interval,
                    option.interval
                );
                self.option = option;
                Ok(())
            }
            ThreadQueue::NodeSync(sync) => {
                // A node believed down must not accept sync work until it
                // recovers; the refusal is counted as another failure.
                if self.health.is_escalated(self.option.threshold) {
                    info!("node {} seems down, skipping node sync", self.address);
                    return Err(MonitorError::SyncRefused);
                }
                sync.run(&mut self.connection)
                    .await
                    .map_err(MonitorError::Sync)
            }
            ThreadQueue::Unknown(ident) => {
                warn!("unknown queue [ident={ident}] for {}, skipping", self.address);
                Err(MonitorError::UnknownQueue(ident))
            }
        }
    }

    fn record_failure(&mut self) {
        if self.health.failure(self.option.threshold) == Some(Publish::Down) {
            info!(
                "node {} reached down threshold ({}), dispatching down event",
                self.address, self.option.threshold
            );
            self.directory.down_node(&self.address);
        } else {
            debug!(
                "node {} seems down (down_state={})",
                self.address, self.health.down_state
            );
        }
    }

    fn record_success(&mut self) {
        if self.health.success(self.option.threshold) == Some(Publish::Up) {
            info!("node {} recovered, dispatching up event", self.address);
            self.directory.up_node(&self.address);
        }
    }
}
