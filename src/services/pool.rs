use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use crate::services::transform::{SelectionCriteria, TransformError, Transformer};

/// User-facing error for transformations that exhausted memory. Raw allocator
/// or interpreter output is never shown to callers.
pub const OUT_OF_MEMORY_MESSAGE: &str = "out of memory — input may exceed capacity";

type TaskResult = Result<(), TransformError>;

struct Task {
    input: PathBuf,
    output: PathBuf,
    criteria: SelectionCriteria,
    reply: oneshot::Sender<TaskResult>,
}

/// How a dispatched transformation ended, as seen by whoever awaited it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    /// The deadline passed. The worker may still be running.
    TimedOut(Duration),
    ResourceExhausted,
    Failed(String),
}

impl ExecutionOutcome {
    /// Error to record on the job, `None` for success.
    pub fn error_message(&self) -> Option<String> {
        match self {
            ExecutionOutcome::Completed => None,
            ExecutionOutcome::TimedOut(deadline) => Some(format!(
                "timed out after {} seconds",
                deadline.as_secs_f64()
            )),
            ExecutionOutcome::ResourceExhausted => Some(OUT_OF_MEMORY_MESSAGE.to_string()),
            ExecutionOutcome::Failed(message) => Some(message.clone()),
        }
    }
}

/// Pending result of one submitted transformation.
pub struct TaskHandle {
    reply: oneshot::Receiver<TaskResult>,
}

impl TaskHandle {
    /// Wait at most `deadline` for the worker. Only the wait is bounded; a
    /// timed-out transformation keeps its thread until it returns.
    pub async fn wait(self, deadline: Duration) -> ExecutionOutcome {
        match tokio::time::timeout(deadline, self.reply).await {
            Err(_) => ExecutionOutcome::TimedOut(deadline),
            Ok(Err(_)) => {
                ExecutionOutcome::Failed("worker exited before reporting a result".to_string())
            }
            Ok(Ok(Ok(()))) => ExecutionOutcome::Completed,
            Ok(Ok(Err(TransformError::ResourceExhausted(detail)))) => {
                tracing::warn!(detail = %detail, "Transformation exhausted resources");
                ExecutionOutcome::ResourceExhausted
            }
            Ok(Ok(Err(TransformError::Failed(message)))) => ExecutionOutcome::Failed(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    ShutDown,

    #[error("worker pool queue is full ({capacity} jobs waiting)")]
    Saturated { capacity: usize },

    #[error("worker pool is unavailable")]
    Unavailable,
}

/// Bounded pool of OS threads running the blocking transformation.
///
/// Tasks wait in a queue of `queue_capacity`; a full queue rejects new work.
/// If the pool is found unusable at submission (queue closed or no live
/// worker) a fresh generation of workers is started and the submission is
/// retried once. Workers of the previous generation finish whatever they
/// already took.
pub struct WorkerPool {
    transformer: Arc<dyn Transformer>,
    workers: usize,
    queue_capacity: usize,
    state: Mutex<PoolState>,
}

struct PoolState {
    sender: Option<mpsc::Sender<Task>>,
    alive: Arc<AtomicUsize>,
    generation: u64,
    shut_down: bool,
}

impl PoolState {
    fn is_healthy(&self) -> bool {
        let open = self.sender.as_ref().is_some_and(|tx| !tx.is_closed());
        open && self.alive.load(Ordering::SeqCst) > 0
    }

    fn try_send(&self, task: Task) -> Result<(), TrySendError<Task>> {
        match &self.sender {
            Some(tx) => tx.try_send(task),
            None => Err(TrySendError::Closed(task)),
        }
    }
}

impl WorkerPool {
    pub fn new(transformer: impl Transformer, workers: usize, queue_capacity: usize) -> Self {
        let pool = Self {
            transformer: Arc::new(transformer),
            workers: workers.max(1),
            queue_capacity: queue_capacity.max(1),
            state: Mutex::new(PoolState {
                sender: None,
                alive: Arc::new(AtomicUsize::new(0)),
                generation: 0,
                shut_down: false,
            }),
        };
        {
            let mut state = pool.lock_state();
            pool.spawn_generation(&mut state);
        }
        pool
    }

    /// Queue a transformation. Never waits for a free worker.
    pub fn submit(
        &self,
        input: PathBuf,
        output: PathBuf,
        criteria: SelectionCriteria,
    ) -> Result<TaskHandle, PoolError> {
        let mut state = self.lock_state();
        if state.shut_down {
            return Err(PoolError::ShutDown);
        }

        let (reply, receiver) = oneshot::channel();
        let handle = TaskHandle { reply: receiver };
        let task = Task {
            input,
            output,
            criteria,
            reply,
        };

        let task = if state.is_healthy() {
            match state.try_send(task) {
                Ok(()) => return Ok(handle),
                Err(TrySendError::Full(_)) => {
                    return Err(PoolError::Saturated {
                        capacity: self.queue_capacity,
                    })
                }
                Err(TrySendError::Closed(task)) => task,
            }
        } else {
            task
        };

        tracing::warn!(
            generation = state.generation,
            alive_workers = state.alive.load(Ordering::SeqCst),
            "Worker pool unusable, recreating and retrying submission"
        );
        self.spawn_generation(&mut state);

        match state.try_send(task) {
            Ok(()) => Ok(handle),
            Err(TrySendError::Full(_)) => Err(PoolError::Saturated {
                capacity: self.queue_capacity,
            }),
            Err(TrySendError::Closed(_)) => Err(PoolError::Unavailable),
        }
    }

    pub fn is_healthy(&self) -> bool {
        let state = self.lock_state();
        !state.shut_down && state.is_healthy()
    }

    pub fn alive_workers(&self) -> usize {
        self.lock_state().alive.load(Ordering::SeqCst)
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Stop accepting work. Already queued tasks still run.
    pub fn shutdown(&self) {
        let mut state = self.lock_state();
        state.shut_down = true;
        state.sender = None;
        tracing::info!(generation = state.generation, "Worker pool shut down");
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_generation(&self, state: &mut PoolState) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let queue = Arc::new(Mutex::new(rx));
        let alive = Arc::new(AtomicUsize::new(0));
        state.generation += 1;

        for index in 0..self.workers {
            let queue = Arc::clone(&queue);
            let transformer = Arc::clone(&self.transformer);
            let guard = AliveGuard::new(Arc::clone(&alive));
            let spawned = thread::Builder::new()
                .name(format!("transform-{}-{}", state.generation, index))
                .spawn(move || worker_loop(queue, transformer, guard));
            if let Err(e) = spawned {
                tracing::error!(error = %e, index, "Failed to spawn transform worker");
            }
        }

        tracing::info!(
            generation = state.generation,
            workers = alive.load(Ordering::SeqCst),
            queue_capacity = self.queue_capacity,
            "Worker pool started"
        );

        state.sender = Some(tx);
        state.alive = alive;
    }
}

/// Counts a worker as alive for as long as its thread holds it.
struct AliveGuard(Arc<AtomicUsize>);

impl AliveGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn worker_loop(
    queue: Arc<Mutex<mpsc::Receiver<Task>>>,
    transformer: Arc<dyn Transformer>,
    _alive: AliveGuard,
) {
    loop {
        let next = match queue.lock() {
            Ok(mut rx) => rx.blocking_recv(),
            Err(_) => break,
        };
        let Some(task) = next else {
            break;
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            transformer.transform(&task.input, &task.output, &task.criteria)
        }))
        .unwrap_or_else(|payload| Err(TransformError::Failed(panic_message(payload.as_ref()))));

        if task.reply.send(result).is_err() {
            tracing::debug!(
                output = %task.output.display(),
                "Transformation finished after its waiter gave up"
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("transformation panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("transformation panicked: {message}")
    } else {
        "transformation panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::mpsc as std_mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    fn ok_transformer(_: &Path, _: &Path, _: &SelectionCriteria) -> TaskResult {
        Ok(())
    }

    fn submit(pool: &WorkerPool) -> Result<TaskHandle, PoolError> {
        pool.submit(
            PathBuf::from("in.ifc"),
            PathBuf::from("out.ifc"),
            SelectionCriteria::default(),
        )
    }

    #[tokio::test]
    async fn test_successful_transform_completes() {
        let pool = WorkerPool::new(ok_transformer, 1, 4);
        assert!(pool.is_healthy());
        assert_eq!(pool.alive_workers(), 1);
        let outcome = submit(&pool).unwrap().wait(WAIT).await;
        assert_eq!(outcome, ExecutionOutcome::Completed);
        assert_eq!(outcome.error_message(), None);
    }

    #[tokio::test]
    async fn test_failure_message_is_verbatim() {
        let pool = WorkerPool::new(
            |_: &Path, _: &Path, _: &SelectionCriteria| {
                Err(TransformError::Failed("Input file not found: in.ifc".to_string()))
            },
            1,
            4,
        );
        let outcome = submit(&pool).unwrap().wait(WAIT).await;
        assert_eq!(
            outcome.error_message().as_deref(),
            Some("Input file not found: in.ifc")
        );
    }

    #[tokio::test]
    async fn test_resource_exhaustion_hides_raw_detail() {
        let pool = WorkerPool::new(
            |_: &Path, _: &Path, _: &SelectionCriteria| {
                Err(TransformError::ResourceExhausted(
                    "std::bad_alloc at 0x7ffe".to_string(),
                ))
            },
            1,
            4,
        );
        let outcome = submit(&pool).unwrap().wait(WAIT).await;
        assert_eq!(outcome, ExecutionOutcome::ResourceExhausted);
        assert_eq!(outcome.error_message().as_deref(), Some(OUT_OF_MEMORY_MESSAGE));
    }

    #[tokio::test]
    async fn test_timeout_reports_deadline() {
        let pool = WorkerPool::new(
            |_: &Path, _: &Path, _: &SelectionCriteria| -> TaskResult {
                thread::sleep(Duration::from_millis(500));
                Ok(())
            },
            1,
            4,
        );
        let deadline = Duration::from_millis(50);
        let outcome = submit(&pool).unwrap().wait(deadline).await;
        assert_eq!(outcome, ExecutionOutcome::TimedOut(deadline));
        assert_eq!(
            outcome.error_message().as_deref(),
            Some("timed out after 0.05 seconds")
        );
        assert_eq!(
            ExecutionOutcome::TimedOut(Duration::from_secs(300))
                .error_message()
                .as_deref(),
            Some("timed out after 300 seconds")
        );
    }

    #[tokio::test]
    async fn test_panicking_transform_fails_and_worker_survives() {
        let pool = WorkerPool::new(
            |_: &Path, output: &Path, _: &SelectionCriteria| -> TaskResult {
                if output.ends_with("bad.ifc") {
                    panic!("unexpected entity");
                }
                Ok(())
            },
            1,
            4,
        );
        let outcome = pool
            .submit(
                PathBuf::from("in.ifc"),
                PathBuf::from("bad.ifc"),
                SelectionCriteria::default(),
            )
            .unwrap()
            .wait(WAIT)
            .await;
        match outcome {
            ExecutionOutcome::Failed(message) => assert!(message.contains("unexpected entity")),
            other => panic!("expected failure, got {other:?}"),
        }

        assert!(pool.is_healthy());
        assert_eq!(
            submit(&pool).unwrap().wait(WAIT).await,
            ExecutionOutcome::Completed
        );
    }

    #[tokio::test]
    async fn test_full_queue_rejects_submission() {
        let (started_tx, started_rx) = std_mpsc::channel::<()>();
        let (release_tx, release_rx) = std_mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);
        let release_rx = Mutex::new(release_rx);

        let pool = WorkerPool::new(
            move |_: &Path, _: &Path, _: &SelectionCriteria| -> TaskResult {
                let _ = started_tx.lock().unwrap().send(());
                let _ = release_rx.lock().unwrap().recv();
                Ok(())
            },
            1,
            1,
        );

        let running = submit(&pool).unwrap();
        started_rx.recv_timeout(WAIT).unwrap();
        let queued = submit(&pool).unwrap();
        assert_eq!(
            submit(&pool).err(),
            Some(PoolError::Saturated { capacity: 1 })
        );

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        assert_eq!(running.wait(WAIT).await, ExecutionOutcome::Completed);
        assert_eq!(queued.wait(WAIT).await, ExecutionOutcome::Completed);
    }

    #[tokio::test]
    async fn test_broken_pool_is_recreated_once() {
        let pool = WorkerPool::new(ok_transformer, 2, 4);
        let generation = {
            let mut state = pool.lock_state();
            let (tx, rx) = mpsc::channel(1);
            drop(rx);
            state.sender = Some(tx);
            state.generation
        };
        assert!(!pool.is_healthy());

        let outcome = submit(&pool).unwrap().wait(WAIT).await;
        assert_eq!(outcome, ExecutionOutcome::Completed);
        assert!(pool.is_healthy());
        assert_eq!(pool.lock_state().generation, generation + 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work_but_drains_queue() {
        let pool = WorkerPool::new(
            |_: &Path, _: &Path, _: &SelectionCriteria| -> TaskResult {
                thread::sleep(Duration::from_millis(20));
                Ok(())
            },
            1,
            4,
        );
        let queued = submit(&pool).unwrap();
        pool.shutdown();
        assert_eq!(submit(&pool).err(), Some(PoolError::ShutDown));
        assert!(!pool.is_healthy());
        assert_eq!(queued.wait(WAIT).await, ExecutionOutcome::Completed);
    }
}
