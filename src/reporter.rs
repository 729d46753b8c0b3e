//! Reporter supervisor: owns the queues, the duty loops and the transport

use crate::backoff::{BackoffRunner, ReporterState, ShutdownSignal};
use crate::buffer::BoundedQueue;
use crate::command::{CommandDispatcher, CommandService, ProfileTask, ProfileTaskExecutor, PROFILE_TASK_COMMAND};
use crate::config::Config;
use crate::errors::{ReporterError, Result};
use crate::identity::{InstanceIdentity, SharedIdentity};
use crate::telemetry::{LogEntry, MeterData, ProfileSnapshot, Segment, TelemetryRecord};
use crate::transport::{build_transport, Reportable, Transport, TransportMetricsSnapshot};

use futures::future::{join_all, BoxFuture};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

const SNAPSHOT_REPORT_INTERVAL: Duration = Duration::from_millis(500);
const STATUS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Lifecycle phase of a supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Stopped,
    Starting,
    Running,
    Draining,
}

struct Queues {
    segments: Arc<BoundedQueue<Segment>>,
    logs: Option<Arc<BoundedQueue<LogEntry>>>,
    meters: Option<Arc<BoundedQueue<MeterData>>>,
    snapshots: Option<Arc<BoundedQueue<ProfileSnapshot>>>,
}

impl Queues {
    fn from_config(config: &Config) -> Self {
        let window = config.queue_timeout;
        Self {
            segments: Arc::new(BoundedQueue::new("segment", config.max_buffer_size, window)),
            logs: config
                .log_reporter_active
                .then(|| Arc::new(BoundedQueue::new("log", config.log_reporter_max_buffer_size, window))),
            meters: config
                .meter_reporter_active
                .then(|| Arc::new(BoundedQueue::new("meter", config.meter_reporter_max_buffer_size, window))),
            snapshots: config.profiler_active.then(|| {
                Arc::new(BoundedQueue::new(
                    "snapshot",
                    config.profile_snapshot_transport_buffer_size,
                    window,
                ))
            }),
        }
    }
}

/// Everything that exists only between `start()` and the end of `stop()`
struct Active {
    queues: Queues,
    shutdown: ShutdownSignal,
    duties: Mutex<Vec<JoinHandle<ReporterState>>>,
}

struct Inner {
    phase: Phase,
    active: Option<Arc<Active>>,
}

/// Occupancy of one queue
#[derive(Debug, Clone, PartialEq)]
pub struct QueueStatus {
    pub len: usize,
    pub capacity: usize,
}

impl QueueStatus {
    fn of<T>(queue: &BoundedQueue<T>) -> Self {
        Self {
            len: queue.len(),
            capacity: queue.capacity(),
        }
    }
}

/// Point-in-time view of the supervisor
#[derive(Debug, Clone)]
pub struct ReporterStatus {
    pub phase: Phase,
    pub segments: Option<QueueStatus>,
    pub logs: Option<QueueStatus>,
    pub meters: Option<QueueStatus>,
    pub snapshots: Option<QueueStatus>,
    pub transport: Option<TransportMetricsSnapshot>,
}

/// Buffers telemetry and ships it through one transport, one duty loop per
/// reporting responsibility.
pub struct ReporterSupervisor {
    config: Config,
    identity: SharedIdentity,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<dyn CommandDispatcher>,
    profile_tasks: Option<Arc<ProfileTaskExecutor>>,
    inner: RwLock<Inner>,
}

impl ReporterSupervisor {
    /// Wire a supervisor around an existing transport and command dispatcher.
    pub fn new(
        config: Config,
        identity: SharedIdentity,
        transport: Arc<dyn Transport>,
        dispatcher: Arc<dyn CommandDispatcher>,
    ) -> Result<Self> {
        config.validate().map_err(ReporterError::Config)?;

        Ok(Self {
            config,
            identity,
            transport,
            dispatcher,
            profile_tasks: None,
            inner: RwLock::new(Inner {
                phase: Phase::Stopped,
                active: None,
            }),
        })
    }

    /// Build the identity, command service and transport described by `config`.
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate().map_err(ReporterError::Config)?;

        let identity = SharedIdentity::new(
            InstanceIdentity::from_config(&config),
            config.instance_property_report_factor,
        );

        let commands = Arc::new(CommandService::new());
        let profile_tasks = Arc::new(ProfileTaskExecutor::new(config.profile_max_parallel));
        commands.register(PROFILE_TASK_COMMAND, profile_tasks.clone());

        let transport = build_transport(&config, identity.clone(), Arc::clone(&commands))?;

        let mut supervisor = Self::new(config, identity, transport, commands)?;
        supervisor.profile_tasks = Some(profile_tasks);
        Ok(supervisor)
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start buffering and launch the duty loops. A second call while
    /// started is a no-op. Must be called from within a tokio runtime.
    #[instrument(skip(self), fields(service = %self.config.service_name))]
    pub fn start(&self) -> Result<()> {
        let handle = Handle::try_current().map_err(|e| ReporterError::Scheduling(e.to_string()))?;

        {
            let mut inner = self.write();
            if inner.phase != Phase::Stopped {
                debug!("reporter already started");
                return Ok(());
            }
            inner.phase = Phase::Starting;
        }

        let active = Arc::new(Active {
            queues: Queues::from_config(&self.config),
            shutdown: ShutdownSignal::new(),
            duties: Mutex::new(Vec::new()),
        });

        let duties = self.launch_duties(&handle, &active);
        let duty_count = duties.len();
        *active.duties.lock().unwrap_or_else(PoisonError::into_inner) = duties;

        {
            let mut inner = self.write();
            inner.active = Some(active);
            inner.phase = Phase::Running;
        }

        info!(
            "Reporter started with {} transport, {} duties, instance {}",
            self.transport.name(),
            duty_count,
            self.identity.snapshot().service_instance
        );
        Ok(())
    }

    fn spawn_duty<F, Fut>(
        &self,
        handle: &Handle,
        duty: &'static str,
        base: Duration,
        shutdown: &ShutdownSignal,
        work: F,
    ) -> JoinHandle<ReporterState>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let runner = BackoffRunner::new(duty, base, self.config.backoff_ceiling, shutdown.clone());
        handle.spawn(runner.run(work))
    }

    fn launch_duties(&self, handle: &Handle, active: &Arc<Active>) -> Vec<JoinHandle<ReporterState>> {
        let shutdown = &active.shutdown;
        let queues = &active.queues;
        let mut duties = Vec::new();

        let transport = Arc::clone(&self.transport);
        duties.push(self.spawn_duty(handle, "heartbeat", self.config.heartbeat_period, shutdown, move || {
            let transport = Arc::clone(&transport);
            async move { transport.heartbeat().await }
        }));

        duties.push(self.spawn_duty(
            handle,
            "segment-report",
            Duration::ZERO,
            shutdown,
            queue_work(Arc::clone(&self.transport), Arc::clone(&queues.segments), shutdown.clone()),
        ));

        let dispatcher = Arc::clone(&self.dispatcher);
        let signal = shutdown.clone();
        duties.push(self.spawn_duty(handle, "command-dispatch", Duration::ZERO, shutdown, move || {
            let dispatcher = Arc::clone(&dispatcher);
            let signal = signal.clone();
            async move {
                tokio::select! {
                    outcome = dispatcher.dispatch() => outcome,
                    _ = signal.wait() => Ok(()),
                }
            }
        }));

        if let Some(meters) = &queues.meters {
            duties.push(self.spawn_duty(
                handle,
                "meter-report",
                self.config.meter_reporter_period,
                shutdown,
                queue_work(Arc::clone(&self.transport), Arc::clone(meters), shutdown.clone()),
            ));
        }

        if let Some(logs) = &queues.logs {
            duties.push(self.spawn_duty(
                handle,
                "log-report",
                Duration::ZERO,
                shutdown,
                queue_work(Arc::clone(&self.transport), Arc::clone(logs), shutdown.clone()),
            ));
        }

        if let Some(snapshots) = &queues.snapshots {
            let transport = Arc::clone(&self.transport);
            duties.push(self.spawn_duty(
                handle,
                "profile-query",
                self.config.get_profile_task_interval,
                shutdown,
                move || {
                    let transport = Arc::clone(&transport);
                    async move { transport.query_profile_commands().await }
                },
            ));

            duties.push(self.spawn_duty(
                handle,
                "profile-send",
                SNAPSHOT_REPORT_INTERVAL,
                shutdown,
                queue_work(Arc::clone(&self.transport), Arc::clone(snapshots), shutdown.clone()),
            ));
        }

        let transport = Arc::clone(&self.transport);
        let watched = Arc::clone(active);
        duties.push(self.spawn_duty(handle, "status", STATUS_REPORT_INTERVAL, shutdown, move || {
            log_status(&watched, transport.as_ref());
            async { Ok(()) }
        }));

        duties
    }

    /// Flush every queue, wait for in-flight batches, then stop the duty
    /// loops. A no-op unless running.
    #[instrument(skip(self), fields(service = %self.config.service_name))]
    pub async fn stop(&self) {
        let active = {
            let mut inner = self.write();
            if inner.phase != Phase::Running {
                debug!("reporter not running, nothing to stop");
                return;
            }
            inner.phase = Phase::Draining;
            inner.active.clone()
        };

        if let Some(active) = active {
            info!("Draining reporter queues");
            let limit = self.config.drain_timeout;

            self.flush(&*active.queues.segments, limit).await;
            if let Some(logs) = &active.queues.logs {
                self.flush(&**logs, limit).await;
            }
            if let Some(meters) = &active.queues.meters {
                self.flush(&**meters, limit).await;
            }
            if let Some(snapshots) = &active.queues.snapshots {
                self.flush(&**snapshots, limit).await;
            }

            active.shutdown.set();

            let duties = std::mem::take(&mut *active.duties.lock().unwrap_or_else(PoisonError::into_inner));
            match tokio::time::timeout(limit, join_all(duties)).await {
                Ok(finished) => {
                    for outcome in finished {
                        match outcome {
                            Ok(state) => {
                                if let Some(err) = state.last_error() {
                                    debug!("duty stopped while failing: {}", err);
                                }
                            }
                            Err(e) => warn!("duty task ended abnormally: {}", e),
                        }
                    }
                }
                Err(_) => warn!("timed out waiting for reporter duties to stop"),
            }
        }

        {
            let mut inner = self.write();
            inner.active = None;
            inner.phase = Phase::Stopped;
        }

        if let Some(metrics) = self.transport.metrics() {
            info!(
                "Final transport metrics - Success rate: {:.1}%, Total attempts: {}, Avg duration: {}ms",
                metrics.success_rate, metrics.attempts, metrics.avg_duration_ms
            );
        }
        info!("Reporter stopped");
    }

    /// One best-effort, non-blocking send, then a bounded wait for the queue to empty.
    async fn flush<T: Reportable>(&self, queue: &BoundedQueue<T>, limit: Duration) {
        match tokio::time::timeout(limit, T::report(self.transport.as_ref(), queue, false)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(queue = queue.name(), "final flush failed: {}", e),
            Err(_) => warn!(queue = queue.name(), "final flush timed out"),
        }

        if !queue.wait_until_drained(limit).await {
            warn!(
                queue = queue.name(),
                remaining = queue.unfinished(),
                "queue not drained before timeout, remaining records are lost"
            );
        }
    }

    fn active(&self) -> Option<Arc<Active>> {
        let inner = self.read();
        match inner.phase {
            Phase::Running | Phase::Draining => inner.active.clone(),
            Phase::Stopped | Phase::Starting => None,
        }
    }

    fn offer<T: Reportable>(&self, pick: impl FnOnce(&Queues) -> Option<&Arc<BoundedQueue<T>>>, record: T) -> bool {
        let Some(active) = self.active() else {
            debug!("reporter is not running, the {} will be abandoned", T::KIND);
            return false;
        };

        let Some(queue) = pick(&active.queues) else {
            debug!("{} reporting is disabled, the {} will be abandoned", T::KIND, T::KIND);
            return false;
        };

        match queue.push(record) {
            Ok(()) => true,
            Err(_) => {
                warn!("the {} queue is full, the {} will be abandoned", queue.name(), T::KIND);
                false
            }
        }
    }

    /// Buffer a finished segment. Never blocks; returns false if the segment was dropped.
    pub fn archive_segment(&self, segment: Segment) -> bool {
        self.offer(|q| Some(&q.segments), segment)
    }

    pub fn archive_log(&self, log: LogEntry) -> bool {
        self.offer(|q| q.logs.as_ref(), log)
    }

    pub fn archive_meter(&self, meter: MeterData) -> bool {
        self.offer(|q| q.meters.as_ref(), meter)
    }

    pub fn add_profiling_snapshot(&self, snapshot: ProfileSnapshot) -> bool {
        self.offer(|q| q.snapshots.as_ref(), snapshot)
    }

    pub fn archive_record(&self, record: TelemetryRecord) -> bool {
        match record {
            TelemetryRecord::Segment(segment) => self.archive_segment(segment),
            TelemetryRecord::Log(log) => self.archive_log(log),
            TelemetryRecord::Meter(meter) => self.archive_meter(meter),
            TelemetryRecord::Snapshot(snapshot) => self.add_profiling_snapshot(snapshot),
        }
    }

    /// Tell the collector a profile task finished. Failures are logged, not retried.
    pub async fn notify_profile_finish(&self, task: &ProfileTask) {
        if let Err(e) = self.transport.notify_profile_task_finish(task).await {
            warn!("notify profile task {} finish to backend failed: {}", task.task_id, e);
        }
    }

    /// Profile tasks accepted from the collector since the last call.
    pub fn take_profile_tasks(&self) -> Vec<ProfileTask> {
        self.profile_tasks
            .as_ref()
            .map(|executor| executor.take_pending())
            .unwrap_or_default()
    }

    /// Re-derive process-scoped identity after a fork.
    pub fn reinit_after_fork(&self) -> InstanceIdentity {
        let identity = self.identity.reinitialize(self.config.experimental_fork_support);
        info!("Reporter identity reinitialized, instance {}", identity.service_instance);
        identity
    }

    pub fn started(&self) -> bool {
        self.phase() != Phase::Stopped
    }

    /// Whether the segment queue is at capacity. Advisory.
    pub fn is_full(&self) -> bool {
        self.active()
            .map(|active| active.queues.segments.is_full())
            .unwrap_or(false)
    }

    pub fn phase(&self) -> Phase {
        self.read().phase
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn status(&self) -> ReporterStatus {
        let active = self.active();
        let queues = active.as_ref().map(|a| &a.queues);

        ReporterStatus {
            phase: self.phase(),
            segments: queues.map(|q| QueueStatus::of(&*q.segments)),
            logs: queues.and_then(|q| q.logs.as_deref()).map(QueueStatus::of),
            meters: queues.and_then(|q| q.meters.as_deref()).map(QueueStatus::of),
            snapshots: queues.and_then(|q| q.snapshots.as_deref()).map(QueueStatus::of),
            transport: self.transport.metrics(),
        }
    }
}

/// Unit of work for a queue duty: park until records arrive, then ship them.
fn queue_work<T: Reportable>(
    transport: Arc<dyn Transport>,
    queue: Arc<BoundedQueue<T>>,
    shutdown: ShutdownSignal,
) -> impl FnMut() -> BoxFuture<'static, Result<()>> + Send + 'static {
    move || {
        let transport = Arc::clone(&transport);
        let queue = Arc::clone(&queue);
        let shutdown = shutdown.clone();
        let work: BoxFuture<'static, Result<()>> = Box::pin(async move {
            tokio::select! {
                _ = queue.wait_non_empty() => {}
                _ = shutdown.wait() => return Ok(()),
            }
            T::report(transport.as_ref(), &queue, true).await
        });
        work
    }
}

fn log_status(active: &Active, transport: &dyn Transport) {
    let segments = active.queues.segments.len();
    let logs = active.queues.logs.as_ref().map_or(0, |q| q.len());
    let meters = active.queues.meters.as_ref().map_or(0, |q| q.len());

    match transport.metrics() {
        Some(metrics) => info!(
            "Reporter status - Buffered: {} segments, {} logs, {} meters, Transport: {:.1}% success rate, {} attempts",
            segments, logs, meters, metrics.success_rate, metrics.attempts
        ),
        None => info!(
            "Reporter status - Buffered: {} segments, {} logs, {} meters",
            segments, logs, meters
        ),
    }
}
