//! Completion Queue Poller
//!
//! One dedicated thread per completion queue drains completions in batches
//! and hands each to a [`CompletionHandler`]. Completion queues are usually
//! shared by many channels, so the stock handler is a [`MessageDispatcher`]
//! routing on queue pair, completion kind and the message type encoded in
//! the wr_id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::Sender;
use fabric_common::config::{PollStrategyKind, PollerConfig};
use fabric_common::{Classify, ErrorClass};

use crate::channel::{Channel, Direction};
use crate::data_channel::{DataChannel, TransferComplete};
use crate::error::{ChannelError, ChannelResult};
use crate::stats::{PollerStats, PollerStatsSnapshot, WorkerStats};
use crate::transport::{Completion, CompletionKind, CqId, QpId, RdmaTransport};
use crate::wr_id::{decode_wr_id, MessageType};

/// What a worker does after an empty poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStrategy {
    /// Spin with a pause hint; lowest latency, burns the core
    BusySpin,
    /// Give the core to other runnable threads
    Yield,
    /// Sleep for the given duration
    Park(Duration),
}

impl PollStrategy {
    pub fn from_config(config: &PollerConfig) -> Self {
        match config.strategy {
            PollStrategyKind::BusySpin => PollStrategy::BusySpin,
            PollStrategyKind::Yield => PollStrategy::Yield,
            PollStrategyKind::Park => PollStrategy::Park(Duration::from_micros(config.park_micros)),
        }
    }

    #[inline]
    fn idle(&self) {
        match self {
            PollStrategy::BusySpin => std::hint::spin_loop(),
            PollStrategy::Yield => thread::yield_now(),
            PollStrategy::Park(d) => thread::sleep(*d),
        }
    }
}

/// Consumer of drained completions
pub trait CompletionHandler: Send + Sync {
    fn handle(&self, completion: &Completion) -> ChannelResult<()>;
}

impl<F> CompletionHandler for F
where
    F: Fn(&Completion) -> ChannelResult<()> + Send + Sync,
{
    fn handle(&self, completion: &Completion) -> ChannelResult<()> {
        self(completion)
    }
}

/// Routes completions to per-channel handlers
#[derive(Default)]
pub struct MessageDispatcher {
    routes: HashMap<(QpId, CompletionKind, MessageType), Arc<dyn CompletionHandler>>,
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send `kind` completions of `message_type` on `qp` to `handler`,
    /// replacing any previous route.
    pub fn route(
        &mut self,
        qp: QpId,
        kind: CompletionKind,
        message_type: MessageType,
        handler: Arc<dyn CompletionHandler>,
    ) -> &mut Self {
        self.routes.insert((qp, kind, message_type), handler);
        self
    }

    /// Route the completions of a control channel
    pub fn route_channel(&mut self, channel: Arc<Channel>, deliveries: Option<Sender<Delivery>>) -> &mut Self {
        let kind = if channel.is_inbound() {
            CompletionKind::Recv
        } else {
            CompletionKind::Send
        };
        let key = (channel.qp(), kind, channel.message_type());
        self.routes
            .insert(key, Arc::new(ChannelHandler::new(channel, deliveries)));
        self
    }

    /// Route data-packet completions of a data channel
    pub fn route_data_channel(
        &mut self,
        channel: Arc<DataChannel>,
        completions: Sender<TransferComplete>,
    ) -> &mut Self {
        let kind = match channel.direction() {
            Direction::Inbound => CompletionKind::Recv,
            Direction::Outbound => CompletionKind::Send,
        };
        let key = (channel.qp(), kind, MessageType::DataPacket);
        self.routes
            .insert(key, Arc::new(TransferHandler::new(channel, completions)));
        self
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl CompletionHandler for MessageDispatcher {
    fn handle(&self, completion: &Completion) -> ChannelResult<()> {
        let (_, message_type) = decode_wr_id(completion.wr_id)?;
        match self.routes.get(&(completion.qp, completion.kind, message_type)) {
            Some(handler) => handler.handle(completion),
            None => Err(ChannelError::NoHandler(message_type, completion.qp)),
        }
    }
}

/// Control message taken off an inbound channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub wr_id: u64,
    pub sender_id: u32,
    pub message_type: MessageType,
    pub payload: Bytes,
}

/// Frees the slot of every completed work request; inbound payloads are
/// forwarded and their receive replaced.
pub struct ChannelHandler {
    channel: Arc<Channel>,
    deliveries: Option<Sender<Delivery>>,
}

impl ChannelHandler {
    pub fn new(channel: Arc<Channel>, deliveries: Option<Sender<Delivery>>) -> Self {
        Self { channel, deliveries }
    }
}

impl CompletionHandler for ChannelHandler {
    fn handle(&self, completion: &Completion) -> ChannelResult<()> {
        let inbound = self.channel.is_inbound();
        let payload = self.channel.extract_channel_item(completion.wr_id, inbound)?;

        if !completion.is_success() {
            return Err(ChannelError::CompletionFailed {
                wr_id: completion.wr_id,
                status: completion.status,
            });
        }

        if let (true, Some(tx)) = (inbound, &self.deliveries) {
            let (sender_id, message_type) = decode_wr_id(completion.wr_id)?;
            let delivery = Delivery {
                wr_id: completion.wr_id,
                sender_id,
                message_type,
                payload,
            };
            if tx.send(delivery).is_err() {
                tracing::debug!(wr_id = completion.wr_id, "delivery receiver dropped");
            }
        }
        Ok(())
    }
}

/// Acks data packets and forwards finished transfers
pub struct TransferHandler {
    channel: Arc<DataChannel>,
    completions: Sender<TransferComplete>,
}

impl TransferHandler {
    pub fn new(channel: Arc<DataChannel>, completions: Sender<TransferComplete>) -> Self {
        Self { channel, completions }
    }
}

impl CompletionHandler for TransferHandler {
    fn handle(&self, completion: &Completion) -> ChannelResult<()> {
        if let Some(done) = self.channel.handle_completion(completion)? {
            if self.completions.send(done).is_err() {
                tracing::debug!("transfer completion receiver dropped");
            }
        }
        Ok(())
    }
}

/// Poller errors
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("poller already running")]
    AlreadyRunning,

    #[error("no completion queues to poll")]
    NoQueues,

    #[error("failed to spawn poller thread: {0}")]
    SpawnFailed(String),
}

struct WorkerHandle {
    thread: Option<thread::JoinHandle<()>>,
    cq: CqId,
}

/// Dedicated completion polling threads
pub struct CompletionPoller {
    config: PollerConfig,
    running: Arc<AtomicBool>,
    workers: Vec<WorkerHandle>,
    stats: Arc<PollerStats>,
}

impl CompletionPoller {
    pub fn new(config: PollerConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
            stats: Arc::new(PollerStats::new(0)),
        }
    }

    /// Spawn one worker per completion queue
    pub fn start(
        &mut self,
        transport: Arc<dyn RdmaTransport>,
        cqs: &[CqId],
        handler: Arc<dyn CompletionHandler>,
    ) -> Result<(), PollerError> {
        if self.running.load(Ordering::Acquire) {
            return Err(PollerError::AlreadyRunning);
        }
        if cqs.is_empty() {
            return Err(PollerError::NoQueues);
        }

        self.running.store(true, Ordering::Release);
        self.stats = Arc::new(PollerStats::new(cqs.len()));
        let strategy = PollStrategy::from_config(&self.config);

        for (idx, &cq) in cqs.iter().enumerate() {
            let worker = Worker {
                idx,
                cq,
                max_entries: self.config.max_poll_entries.max(1),
                strategy,
                running: self.running.clone(),
                stats: self.stats.clone(),
                transport: transport.clone(),
                handler: handler.clone(),
            };

            let spawned = thread::Builder::new()
                .name(format!("fabric-cq-{}", cq))
                .spawn(move || worker.run());
            let handle = match spawned {
                Ok(handle) => handle,
                Err(e) => {
                    self.stop();
                    return Err(PollerError::SpawnFailed(e.to_string()));
                }
            };

            self.workers.push(WorkerHandle {
                thread: Some(handle),
                cq,
            });
        }

        tracing::info!(queues = cqs.len(), strategy = ?strategy, "completion poller started");
        Ok(())
    }

    /// Signal workers and join them; pending completions stay queued
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);

        for worker in &mut self.workers {
            if let Some(handle) = worker.thread.take() {
                if handle.join().is_err() {
                    tracing::error!(cq = worker.cq, "poller worker panicked");
                }
            }
        }

        if !self.workers.is_empty() {
            self.workers.clear();
            tracing::info!("completion poller stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Totals over all workers of the current (or last) run
    pub fn stats(&self) -> PollerStatsSnapshot {
        self.stats.total()
    }
}

impl Drop for CompletionPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    idx: usize,
    cq: CqId,
    max_entries: usize,
    strategy: PollStrategy,
    running: Arc<AtomicBool>,
    stats: Arc<PollerStats>,
    transport: Arc<dyn RdmaTransport>,
    handler: Arc<dyn CompletionHandler>,
}

impl Worker {
    fn run(self) {
        tracing::debug!(cq = self.cq, "poller worker starting");
        let Some(stats) = self.stats.worker(self.idx) else {
            tracing::error!(cq = self.cq, idx = self.idx, "no stats block for worker");
            return;
        };

        while self.running.load(Ordering::Relaxed) {
            let batch = self.transport.poll_completions(self.cq, self.max_entries);
            stats.record_poll(batch.len());
            if batch.is_empty() {
                self.strategy.idle();
                continue;
            }
            for completion in &batch {
                stats.record_completion(completion.byte_len, completion.is_success());
                if let Err(e) = self.handler.handle(completion) {
                    Self::report(stats, completion, &e);
                }
            }
        }

        tracing::debug!(cq = self.cq, "poller worker stopped");
    }

    fn report(stats: &WorkerStats, completion: &Completion, e: &ChannelError) {
        match e.class() {
            ErrorClass::Miss => {
                stats.record_miss();
                tracing::warn!(wr_id = completion.wr_id, qp = completion.qp, error = %e, "dropping completion");
            }
            _ => {
                stats.record_error();
                tracing::error!(wr_id = completion.wr_id, qp = completion.qp, error = %e, "completion handler failed");
            }
        }
    }
}
