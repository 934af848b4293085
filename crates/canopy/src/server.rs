//! Async serving loop around the scheduler.

use anyhow::{bail, Context, Result};
use canopy_core::{
    config::SchedulerConfig,
    engine::ExecutionEngine,
    error::CanopyError,
    scheduler::{RequestEvent, RequestId, Scheduler, SchedulerStats, SubmitRequest},
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How often an idle loop retries delivery to clients that are behind.
const BACKLOG_RETRY: Duration = Duration::from_millis(2);

/// Configuration for the serving loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Scheduler settings.
    pub scheduler: SchedulerConfig,
    /// Commands buffered before submissions are refused.
    pub intake_capacity: usize,
    /// Events buffered in each submission's channel. Events beyond this
    /// wait inside the loop until the client reads.
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            intake_capacity: 1024,
            event_capacity: 256,
        }
    }
}

impl ServerConfig {
    /// Load from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading server config {}", path.display()))?;
        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("parsing server config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check channel sizes and the scheduler settings.
    pub fn validate(&self) -> Result<()> {
        if self.intake_capacity == 0 {
            bail!("intake_capacity must be at least 1");
        }
        if self.event_capacity == 0 {
            bail!("event_capacity must be at least 1");
        }
        self.scheduler.validate()?;
        Ok(())
    }
}

/// Builder for a [`Server`].
#[derive(Debug, Default)]
pub struct ServerBuilder {
    config: ServerConfig,
}

impl ServerBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the scheduler settings.
    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.config.scheduler = config;
        self
    }

    /// Set the number of KV slots.
    pub fn max_total_tokens(mut self, n: usize) -> Self {
        self.config.scheduler.max_total_tokens = n;
        self
    }

    /// Set the running request limit.
    pub fn max_running_requests(mut self, n: usize) -> Self {
        self.config.scheduler.max_running_requests = n;
        self
    }

    /// Set the intake queue size.
    pub fn intake_capacity(mut self, n: usize) -> Self {
        self.config.intake_capacity = n;
        self
    }

    /// Set the per-submission event buffer.
    pub fn event_capacity(mut self, n: usize) -> Self {
        self.config.event_capacity = n;
        self
    }

    /// Build the scheduler and start the loop on the current tokio runtime.
    pub fn spawn(
        self,
        engine: Arc<dyn ExecutionEngine>,
    ) -> Result<(ServerHandle, JoinHandle<Result<()>>)> {
        self.config.validate()?;
        let mut scheduler =
            Scheduler::new(self.config.scheduler.clone()).context("building scheduler")?;
        scheduler.set_eos_token_id(engine.eos_token_id());

        let (intake_tx, intake_rx) = mpsc::channel(self.config.intake_capacity);
        let stats = Arc::new(RwLock::new(scheduler.stats()));

        let server = Server {
            scheduler,
            engine,
            intake: intake_rx,
            streams: HashMap::new(),
            stats: stats.clone(),
            event_capacity: self.config.event_capacity,
            draining: false,
        };
        let handle = ServerHandle {
            intake: intake_tx,
            capacity: self.config.intake_capacity,
            stats,
        };

        info!(
            intake_capacity = self.config.intake_capacity,
            event_capacity = self.config.event_capacity,
            "server starting"
        );
        Ok((handle, tokio::spawn(server.run())))
    }
}

enum Command {
    Submit {
        request: SubmitRequest,
        reply: oneshot::Sender<canopy_core::Result<Submission>>,
    },
    Abort {
        id: RequestId,
        reply: oneshot::Sender<canopy_core::Result<()>>,
    },
    FlushCache {
        reply: oneshot::Sender<canopy_core::Result<()>>,
    },
    Shutdown,
}

/// Client side of a running [`Server`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    intake: mpsc::Sender<Command>,
    capacity: usize,
    stats: Arc<RwLock<SchedulerStats>>,
}

impl ServerHandle {
    /// Queue a request and get its event stream.
    ///
    /// Fails with [`CanopyError::Backpressure`] when the intake queue is full.
    pub async fn submit(&self, request: SubmitRequest) -> canopy_core::Result<Submission> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Submit { request, reply })?;
        rx.await.map_err(|_| CanopyError::Shutdown)?
    }

    /// Cancel a submission or a single sample.
    pub async fn abort(&self, id: RequestId) -> canopy_core::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Abort { id, reply })?;
        rx.await.map_err(|_| CanopyError::Shutdown)?
    }

    /// Drop the prefix cache. Fails while requests are running.
    pub async fn flush_cache(&self) -> canopy_core::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::FlushCache { reply })?;
        rx.await.map_err(|_| CanopyError::Shutdown)?
    }

    /// Stop taking submissions and finish the ones already queued.
    pub async fn shutdown(&self) {
        // The loop is already gone if this fails.
        let _ = self.intake.send(Command::Shutdown).await;
    }

    /// Scheduler counters as of the last tick.
    pub fn stats(&self) -> SchedulerStats {
        self.stats.read().clone()
    }

    fn send(&self, command: Command) -> canopy_core::Result<()> {
        self.intake.try_send(command).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => CanopyError::Backpressure {
                capacity: self.capacity,
            },
            mpsc::error::TrySendError::Closed(_) => CanopyError::Shutdown,
        })
    }
}

/// Event stream of one submission.
///
/// Ends after every sample has produced a terminal event. Dropping it
/// aborts whatever is still running.
#[derive(Debug)]
pub struct Submission {
    id: RequestId,
    events: mpsc::Receiver<RequestEvent>,
}

impl Submission {
    /// The id every event of this submission carries.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Next event, or `None` once the submission is done.
    pub async fn next(&mut self) -> Option<RequestEvent> {
        self.events.recv().await
    }

    /// Wait for every remaining event.
    pub async fn collect(mut self) -> Vec<RequestEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        events
    }
}

struct Stream {
    tx: mpsc::Sender<RequestEvent>,
    /// Events the client has not made room for yet.
    backlog: VecDeque<RequestEvent>,
    /// Samples without a terminal event yet.
    remaining: usize,
}

impl Stream {
    fn is_done(&self) -> bool {
        self.remaining == 0 && self.backlog.is_empty()
    }
}

enum Delivery {
    Pending,
    Done,
    Gone,
}

/// Owns the scheduler and drives it against an engine.
pub struct Server {
    scheduler: Scheduler,
    engine: Arc<dyn ExecutionEngine>,
    intake: mpsc::Receiver<Command>,
    streams: HashMap<RequestId, Stream>,
    stats: Arc<RwLock<SchedulerStats>>,
    event_capacity: usize,
    draining: bool,
}

impl Server {
    /// Create a server builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    async fn run(mut self) -> Result<()> {
        loop {
            let mut disconnected = false;
            loop {
                match self.intake.try_recv() {
                    Ok(command) => self.handle(command),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        disconnected = true;
                        break;
                    }
                }
            }

            if self.scheduler.is_idle() {
                self.flush();
                let closed = self.draining || disconnected;
                let backlogged = self.streams.values().any(|s| !s.backlog.is_empty());

                if backlogged {
                    tokio::select! {
                        Some(command) = self.intake.recv(), if !closed => self.handle(command),
                        _ = tokio::time::sleep(BACKLOG_RETRY) => {}
                    }
                    continue;
                }
                if closed {
                    info!("server stopped");
                    return Ok(());
                }
                match self.intake.recv().await {
                    Some(command) => self.handle(command),
                    None => {
                        info!("all handles dropped, server stopped");
                        return Ok(());
                    }
                }
                continue;
            }

            if let Err(err) = self.step().await {
                error!(error = %err, "scheduler loop failed");
                self.publish();
                return Err(err).context("scheduler loop stopped");
            }
            // Let clients on the same runtime thread submit and read.
            tokio::task::yield_now().await;
        }
    }

    /// Run one tick and deliver its events.
    async fn step(&mut self) -> canopy_core::Result<()> {
        let Some(plan) = self.scheduler.schedule()? else {
            self.publish();
            return Ok(());
        };

        match self.engine.run(&plan).await {
            Ok(sampled) => self.scheduler.process_output(&plan, sampled)?,
            Err(err) => self.scheduler.fail_batch(&plan, &err)?,
        }
        self.publish();
        Ok(())
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Submit { request, reply } => {
                if self.draining {
                    let _ = reply.send(Err(CanopyError::Shutdown));
                    return;
                }
                let samples = request.sampling_params.n;
                let result = self.scheduler.submit(request).map(|id| {
                    let (tx, events) = mpsc::channel(self.event_capacity);
                    self.streams.insert(
                        id,
                        Stream {
                            tx,
                            backlog: VecDeque::new(),
                            remaining: samples,
                        },
                    );
                    Submission { id, events }
                });
                if let Err(err) = &result {
                    debug!(error = %err, "submission rejected");
                }
                self.refresh_stats();
                // A dropped reply means the client gave up; the stream is
                // then dropped too and the request aborts on its first event.
                let _ = reply.send(result);
            }
            Command::Abort { id, reply } => {
                let result = self.scheduler.abort(id);
                let _ = reply.send(result);
            }
            Command::FlushCache { reply } => {
                let result = self.scheduler.flush_cache();
                self.refresh_stats();
                let _ = reply.send(result);
            }
            Command::Shutdown => {
                info!(
                    waiting = self.scheduler.num_waiting(),
                    running = self.scheduler.num_running(),
                    "draining before shutdown"
                );
                self.draining = true;
                self.intake.close();
            }
        }
    }

    fn refresh_stats(&self) {
        *self.stats.write() = self.scheduler.stats();
    }

    /// Queue collected events on their submissions and deliver what fits.
    fn publish(&mut self) {
        for event in self.scheduler.take_events() {
            let Some(stream) = self.streams.get_mut(&event.request_id) else {
                continue;
            };
            if event.is_terminal() {
                stream.remaining = stream.remaining.saturating_sub(1);
            }
            stream.backlog.push_back(event);
        }
        self.flush();
        self.refresh_stats();
    }

    /// Move backlogged events into client channels without waiting on any
    /// client. Streams whose client went away abort their requests.
    fn flush(&mut self) {
        let mut settled = Vec::new();
        for (group, stream) in &mut self.streams {
            match deliver(stream) {
                Delivery::Pending => {}
                Delivery::Done => settled.push((*group, false)),
                Delivery::Gone => settled.push((*group, stream.remaining > 0)),
            }
        }

        for (group, abort) in settled {
            self.streams.remove(&group);
            if abort {
                warn!(request = %group, "client went away, aborting");
                if let Err(err) = self.scheduler.abort(group) {
                    debug!(request = %group, error = %err, "nothing left to abort");
                }
            }
        }
    }
}

fn deliver(stream: &mut Stream) -> Delivery {
    if stream.tx.is_closed() {
        return Delivery::Gone;
    }
    while let Some(event) = stream.backlog.pop_front() {
        match stream.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                stream.backlog.push_front(event);
                return Delivery::Pending;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return Delivery::Gone,
        }
    }
    if stream.is_done() {
        Delivery::Done
    } else {
        Delivery::Pending
    }
}
