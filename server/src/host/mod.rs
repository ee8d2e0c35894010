//! Interfaces the network layer consumes from its host application
//!
//! The manager never reaches into the host directly. It receives an executor
//! for the host's main context, a sink for dispatched packets and a source
//! for the local player list, and nothing else.

use protocol::NetworkPacket;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Unit of work handed to the host's main context
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks on the host's designated single-threaded context (`runTask`)
pub trait MainThreadExecutor: Send + Sync {
    fn execute(&self, task: Task);
}

/// Event bus sink for authenticated, decoded remote packets
pub trait PacketListener: Send + Sync {
    /// `origin` is the authenticated server id of the connection
    fn on_packet(&self, origin: &str, packet: NetworkPacket);
}

impl<F> PacketListener for F
where
    F: Fn(&str, NetworkPacket) + Send + Sync,
{
    fn on_packet(&self, origin: &str, packet: NetworkPacket) {
        self(origin, packet)
    }
}

/// Source of the local online player list
pub trait PlayerDirectory: Send + Sync {
    fn online_players(&self) -> Vec<String>;
}

impl<F> PlayerDirectory for F
where
    F: Fn() -> Vec<String> + Send + Sync,
{
    fn online_players(&self) -> Vec<String> {
        self()
    }
}

/// Everything the manager needs from the host
#[derive(Clone)]
pub struct HostBindings {
    pub executor: Arc<dyn MainThreadExecutor>,
    pub listener: Arc<dyn PacketListener>,
    pub players: Arc<dyn PlayerDirectory>,
}

impl HostBindings {
    pub fn new(
        executor: Arc<dyn MainThreadExecutor>,
        listener: Arc<dyn PacketListener>,
        players: Arc<dyn PlayerDirectory>,
    ) -> Self {
        Self {
            executor,
            listener,
            players,
        }
    }
}

/// Executor for hosts without a main thread: runs the task on the caller
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl MainThreadExecutor for InlineExecutor {
    fn execute(&self, task: Task) {
        task()
    }
}

/// Queue-backed main context
///
/// `MainLoop` is the cloneable submit side; the single `MainLoopDriver`
/// executes tasks one at a time in submission order, either as a dedicated
/// task (`run`) or from the host's own tick (`run_pending`).
#[derive(Debug, Clone)]
pub struct MainLoop {
    tx: mpsc::UnboundedSender<Task>,
}

pub struct MainLoopDriver {
    rx: mpsc::UnboundedReceiver<Task>,
}

impl MainLoop {
    pub fn new() -> (Self, MainLoopDriver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, MainLoopDriver { rx })
    }
}

impl MainThreadExecutor for MainLoop {
    fn execute(&self, task: Task) {
        if self.tx.send(task).is_err() {
            warn!("Main loop has stopped, dropping task");
        }
    }
}

impl MainLoopDriver {
    /// Run until every `MainLoop` handle is dropped
    pub async fn run(mut self) {
        while let Some(task) = self.rx.recv().await {
            task();
        }
    }

    /// Run whatever is queued right now; returns the number of tasks run
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.rx.try_recv() {
            task();
            ran += 1;
        }
        ran
    }
}
