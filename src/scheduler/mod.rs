use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::pipeline::Pipeline;
use crate::sink::{EventSink, MetricSink, ModelApplier};

/// The periodic drain tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Task {
    MetricFlush,
    EventFlush,
    DatamapFlush,
    SubresourceDiscovery,
}

impl Task {
    pub const ALL: [Task; 4] = [
        Task::MetricFlush,
        Task::EventFlush,
        Task::DatamapFlush,
        Task::SubresourceDiscovery,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::MetricFlush => "metric-flush",
            Self::EventFlush => "event-flush",
            Self::DatamapFlush => "datamap-flush",
            Self::SubresourceDiscovery => "subresource-discovery",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::MetricFlush => 0,
            Self::EventFlush => 1,
            Self::DatamapFlush => 2,
            Self::SubresourceDiscovery => 3,
        }
    }

    /// Whether the task runs once more when the scheduler stops.
    const fn flushes_on_stop(self) -> bool {
        !matches!(self, Self::SubresourceDiscovery)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    Active,
}

/// Diagnostics view of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub name: &'static str,
    pub state: TaskState,
    pub runs: u64,
    pub errors: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Default)]
struct TaskSlot {
    active: AtomicBool,
    runs: AtomicU64,
    errors: AtomicU64,
    last_error: Mutex<Option<String>>,
}

/// Observable state of every task.
#[derive(Default)]
pub struct TaskStates {
    slots: [TaskSlot; 4],
}

impl TaskStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, task: Task) -> TaskState {
        if self.slot(task).active.load(Ordering::Acquire) {
            TaskState::Active
        } else {
            TaskState::Idle
        }
    }

    pub fn runs(&self, task: Task) -> u64 {
        self.slot(task).runs.load(Ordering::Relaxed)
    }

    pub fn errors(&self, task: Task) -> u64 {
        self.slot(task).errors.load(Ordering::Relaxed)
    }

    pub fn last_error(&self, task: Task) -> Option<String> {
        self.slot(task).last_error.lock().clone()
    }

    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        Task::ALL
            .iter()
            .map(|&task| TaskSnapshot {
                name: task.name(),
                state: self.state(task),
                runs: self.runs(task),
                errors: self.errors(task),
                last_error: self.last_error(task),
            })
            .collect()
    }

    /// Marks the task active until the returned guard drops.
    fn begin(&self, task: Task) -> ActiveGuard<'_> {
        let slot = self.slot(task);
        slot.active.store(true, Ordering::Release);
        ActiveGuard { slot }
    }

    fn finish(&self, task: Task, result: &Result<usize>) {
        let slot = self.slot(task);
        slot.runs.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = result {
            slot.errors.fetch_add(1, Ordering::Relaxed);
            *slot.last_error.lock() = Some(format!("{e:#}"));
        }
    }

    fn slot(&self, task: Task) -> &TaskSlot {
        &self.slots[task.index()]
    }
}

/// Resets a task to idle on drop, including on early return and unwind.
struct ActiveGuard<'a> {
    slot: &'a TaskSlot,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.slot.active.store(false, Ordering::Release);
    }
}

/// Runs one cycle of `task` with state tracking, metrics and logging.
async fn tracked<F>(task: Task, pipeline: &Pipeline, cycle: F) -> Result<usize>
where
    F: Future<Output = Result<usize>>,
{
    let started = Instant::now();
    let result = {
        let _active = pipeline.tasks().begin(task);
        cycle.await
    };

    let health = pipeline.health();
    health.task_runs.with_label_values(&[task.name()]).inc();
    health
        .task_duration
        .with_label_values(&[task.name()])
        .observe(started.elapsed().as_secs_f64());

    pipeline.tasks().finish(task, &result);

    match &result {
        Ok(n) if *n > 0 => debug!(task = task.name(), items = n, "task cycle complete"),
        Ok(_) => {}
        Err(e) => {
            health.task_errors.with_label_values(&[task.name()]).inc();
            error!(task = task.name(), error = %format!("{e:#}"), "task cycle failed");
        }
    }

    result
}

/// Awaits one collaborator call, bounded by `limit`.
async fn bounded<F>(limit: Duration, call: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    match timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("timed out after {limit:?}")),
    }
}

/// Drains the metric queue into `sink`, in submission order.
///
/// The first failed write fails the cycle and the rest of the batch is
/// dropped.
pub async fn run_metric_flush_once<S>(
    pipeline: &Pipeline,
    sink: &S,
    call_timeout: Duration,
) -> Result<usize>
where
    S: MetricSink,
{
    tracked(Task::MetricFlush, pipeline, async {
        let batch = pipeline.take_metrics();
        let total = batch.len();

        for (i, sample) in batch.iter().enumerate() {
            if let Err(e) = bounded(call_timeout, sink.write(sample)).await {
                bail!(
                    "metric write failed, dropped {} of {total}: {e:#}",
                    total - i
                );
            }
            pipeline.health().metric_writes.inc();
        }
        Ok(total)
    })
    .await
}

/// Drains the event queue into `sink`, in submission order.
pub async fn run_event_flush_once<S>(
    pipeline: &Pipeline,
    sink: &S,
    call_timeout: Duration,
) -> Result<usize>
where
    S: EventSink,
{
    tracked(Task::EventFlush, pipeline, async {
        let batch = pipeline.take_events();
        let total = batch.len();

        for (i, event) in batch.iter().enumerate() {
            if let Err(e) = bounded(call_timeout, sink.send(event)).await {
                bail!("event send failed, dropped {} of {total}: {e:#}", total - i);
            }
            pipeline.health().events_sent.inc();
        }
        Ok(total)
    })
    .await
}

/// Drains every consolidation queue and applies one batch per target.
///
/// Targets are isolated from each other: a failed batch is dropped and
/// the remaining targets are still applied.
pub async fn run_datamap_flush_once<S>(
    pipeline: &Pipeline,
    applier: &S,
    call_timeout: Duration,
) -> Result<usize>
where
    S: ModelApplier,
{
    tracked(Task::DatamapFlush, pipeline, async {
        let batches = pipeline.drain_datamaps();
        let mut applied = 0;
        let mut failed = Vec::new();

        for batch in &batches {
            match bounded(call_timeout, applier.apply(&batch.target, &batch.records)).await {
                Ok(()) => {
                    applied += batch.records.len();
                    pipeline.health().model_batches.inc();
                }
                Err(e) => {
                    warn!(
                        target_system = %batch.target,
                        records = batch.records.len(),
                        error = %format!("{e:#}"),
                        "model batch failed, dropping",
                    );
                    failed.push(batch.target.as_str());
                }
            }
        }

        if !failed.is_empty() {
            bail!(
                "{} of {} model batches failed: {}",
                failed.len(),
                batches.len(),
                failed.join(", ")
            );
        }
        Ok(applied)
    })
    .await
}

/// Attempts sub-resource discovery for every target.
pub async fn run_discovery_once(pipeline: &Pipeline) -> Result<usize> {
    tracked(Task::SubresourceDiscovery, pipeline, async {
        Ok(pipeline.discover_subresources())
    })
    .await
}

/// Runs one cycle of `task`.
pub async fn run_once<S>(
    task: Task,
    pipeline: &Pipeline,
    sink: &S,
    call_timeout: Duration,
) -> Result<usize>
where
    S: MetricSink + EventSink + ModelApplier,
{
    match task {
        Task::MetricFlush => run_metric_flush_once(pipeline, sink, call_timeout).await,
        Task::EventFlush => run_event_flush_once(pipeline, sink, call_timeout).await,
        Task::DatamapFlush => run_datamap_flush_once(pipeline, sink, call_timeout).await,
        Task::SubresourceDiscovery => run_discovery_once(pipeline).await,
    }
}

/// Owns the spawned task loops.
pub struct Scheduler {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawns one loop per task. Loops stop when `cancel` fires; the flush
    /// tasks run a final cycle before exiting.
    pub fn start<S>(
        pipeline: Arc<Pipeline>,
        sink: Arc<S>,
        cfg: &SchedulerConfig,
        call_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self
    where
        S: MetricSink + EventSink + ModelApplier + 'static,
    {
        let handles = Task::ALL
            .iter()
            .map(|&task| {
                spawn_loop(
                    task,
                    cfg.interval(task),
                    Arc::clone(&pipeline),
                    Arc::clone(&sink),
                    call_timeout,
                    cancel.clone(),
                )
            })
            .collect();

        info!(
            metric_flush = ?cfg.metric_flush_interval,
            event_flush = ?cfg.event_flush_interval,
            datamap_flush = ?cfg.datamap_flush_interval,
            discovery = ?cfg.discovery_interval,
            "scheduler started",
        );

        Self { cancel, handles }
    }

    /// Cancels every loop and waits for the final flushes.
    pub async fn stop(&mut self) {
        self.cancel.cancel();

        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "scheduler task join failed");
            }
        }

        info!("scheduler stopped");
    }
}

fn spawn_loop<S>(
    task: Task,
    period: Duration,
    pipeline: Arc<Pipeline>,
    sink: Arc<S>,
    call_timeout: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    S: MetricSink + EventSink + ModelApplier + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if task.flushes_on_stop() {
                        let _ = run_once(task, &pipeline, sink.as_ref(), call_timeout).await;
                    }
                    debug!(task = task.name(), "task loop stopped");
                    return;
                }
                _ = interval.tick() => {
                    // Errors are recorded by the cycle itself.
                    let _ = run_once(task, &pipeline, sink.as_ref(), call_timeout).await;
                }
            }
        }
    })
}
