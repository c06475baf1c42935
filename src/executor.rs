//! Job execution.
//!
//! The [JobExecutor] capability dispatches one task per partition,
//! potentially across a pool of workers, and streams per-partition partial
//! results back to the caller as they complete. Dispatch follows partition
//! order, completion does not; the merge step in [crate::result] is
//! order-independent, so intermediate states of the result buffer are valid
//! for progressive display.
//!
//! [LocalExecutor] is the in-process implementation: a fan-in channel fed
//! by tasks running CPU-bound reductions on the rayon pool, bounded by a
//! [ResourceManager]. A distributed substrate would implement the same
//! trait; no design obligation flows from it into this crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::QuadStemError;
use crate::job::{Job, PartialResult};
use crate::resource_manager::ResourceManager;
use crate::result::ResultBuffer;

/// Cooperative cancellation signal.
///
/// Cancelling prevents dispatch of further partitions and requests that
/// in-flight tasks abandon their remaining tile iteration. Already
/// delivered partial results remain valid and are not retracted.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Handle to one running job: a stream of per-partition partial results
/// plus the cancellation signal.
///
/// The stream ends (returns `None`) once every dispatched partition has
/// either delivered its partial result, failed, or been cancelled. A failed
/// partition surfaces as an `Err` item; other partitions are unaffected.
pub struct JobHandle {
    results: mpsc::Receiver<Result<PartialResult, QuadStemError>>,
    cancel: CancelToken,
}

impl JobHandle {
    /// The next partial result, or `None` when the job has completed.
    pub async fn next_partial(&mut self) -> Option<Result<PartialResult, QuadStemError>> {
        self.results.recv().await
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Consume the handle as a [tokio_stream] stream.
    pub fn into_stream(self) -> ReceiverStream<Result<PartialResult, QuadStemError>> {
        ReceiverStream::new(self.results)
    }
}

/// Capability for running jobs.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Start a job, returning its handle immediately.
    ///
    /// At most one computation should be in flight per job instance; run a
    /// fresh job for a fresh computation.
    async fn run_job(&self, job: Arc<dyn Job>) -> Result<JobHandle, QuadStemError>;
}

/// In-process executor over a bounded worker pool.
pub struct LocalExecutor {
    resources: Arc<ResourceManager>,
}

impl LocalExecutor {
    /// Returns an executor sized to the local machine, leaving one core for
    /// the caller.
    pub fn new() -> Self {
        Self::with_limits(Some((num_cpus::get() - 1).max(1)), None)
    }

    /// Returns an executor with explicit task and memory bounds.
    pub fn with_limits(task_limit: Option<usize>, memory_limit: Option<usize>) -> Self {
        LocalExecutor {
            resources: Arc::new(ResourceManager::new(task_limit, memory_limit)),
        }
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobExecutor for LocalExecutor {
    async fn run_job(&self, job: Arc<dyn Job>) -> Result<JobHandle, QuadStemError> {
        // Partitioning is validated eagerly, before any task is spawned.
        let partitions = job.get_partitions()?;
        tracing::debug!("dispatching {} partitions", partitions.len());
        let cancel = CancelToken::new();
        let (tx, rx) = mpsc::channel(partitions.len().max(1));
        let resources = self.resources.clone();
        let dispatch_cancel = cancel.clone();
        tokio::spawn(async move {
            for (index, partition) in partitions.into_iter().enumerate() {
                if dispatch_cancel.is_cancelled() {
                    tracing::debug!("cancelled before partition {}, stopping dispatch", index);
                    break;
                }
                let task_permit = match resources.task().await {
                    Ok(permit) => permit,
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        break;
                    }
                };
                let memory_permit = match resources.memory(partition.num_bytes()).await {
                    Ok(permit) => permit,
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        break;
                    }
                };
                let job = job.clone();
                let tx = tx.clone();
                let cancel = dispatch_cancel.clone();
                tokio::spawn(async move {
                    let result =
                        tokio_rayon::spawn(move || job.reduce_partition(&partition, &cancel)).await;
                    drop(task_permit);
                    drop(memory_permit);
                    match result {
                        Ok(Some(partial)) => {
                            // The receiver may be gone; nothing to do then.
                            let _ = tx.send(Ok(partial)).await;
                        }
                        Ok(None) => {
                            tracing::debug!("partition {} abandoned after cancellation", index);
                        }
                        Err(err) => {
                            let _ = tx.send(Err(err)).await;
                        }
                    }
                });
            }
        });
        Ok(JobHandle {
            results: rx,
            cancel,
        })
    }
}

/// Run a job to completion, merging every partial result into a fresh
/// result buffer.
///
/// This is the non-progressive convenience path; callers that want to
/// observe intermediate states drive [JobHandle::next_partial] themselves
/// and merge into their own buffer.
pub async fn run_and_merge(
    executor: &dyn JobExecutor,
    job: Arc<dyn Job>,
) -> Result<ResultBuffer, QuadStemError> {
    let mut buffer = ResultBuffer::for_job(job.as_ref());
    let mut handle = executor.run_job(job).await?;
    while let Some(partial) = handle.next_partial().await {
        buffer.merge(&partial?)?;
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::dataset::DataSet;
    use crate::geometry::Shape;
    use crate::job::{ResultData, ResultKind};
    use crate::partition::Partition;

    use ndarray::{ArrayD, IxDyn};

    /// A job over an in-memory dataset that records nothing but produces
    /// one unit value per partition row.
    struct CountingJob {
        dataset: Arc<crate::dataset::MemoryDataSet>,
        delay: std::time::Duration,
    }

    impl CountingJob {
        fn new(rows: usize, delay: std::time::Duration) -> Self {
            let shape = Shape::new(vec![rows, 2, 2], 2).unwrap();
            let data = bytes::Bytes::from(vec![1_u8; shape.size()]);
            let dataset = crate::dataset::MemoryDataSet::new(
                data,
                shape,
                crate::types::DType::Uint8,
                Shape::new(vec![1, 2, 2], 2).unwrap(),
            )
            .unwrap()
            .with_partition_shape(Shape::new(vec![1, 2, 2], 2).unwrap())
            .unwrap();
            CountingJob {
                dataset: Arc::new(dataset),
                delay,
            }
        }
    }

    impl Job for CountingJob {
        fn result_shape(&self) -> Vec<usize> {
            vec![self.dataset.shape()[0]]
        }

        fn result_kind(&self) -> ResultKind {
            ResultKind::Real
        }

        fn get_partitions(&self) -> Result<Vec<Partition>, QuadStemError> {
            self.dataset.get_partitions()
        }

        fn reduce_partition(
            &self,
            partition: &Partition,
            cancel: &CancelToken,
        ) -> Result<Option<PartialResult>, QuadStemError> {
            std::thread::sleep(self.delay);
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let region = partition.slice().nav_region();
            let data = ArrayD::from_elem(IxDyn(region.shape().dims()), 1.0);
            Ok(Some(PartialResult::new(region, ResultData::Real(data))))
        }
    }

    #[tokio::test]
    async fn all_partitions_delivered() {
        let executor = LocalExecutor::with_limits(Some(2), None);
        let job = Arc::new(CountingJob::new(5, std::time::Duration::ZERO));
        let buffer = run_and_merge(&executor, job).await.unwrap();
        let result = buffer.as_real().unwrap();
        assert_eq!(&[5], result.shape());
        assert!(result.iter().all(|v| *v == 1.0));
    }

    #[tokio::test]
    async fn partial_results_stream_incrementally() {
        let executor = LocalExecutor::with_limits(Some(1), None);
        let job = Arc::new(CountingJob::new(3, std::time::Duration::ZERO));
        let mut handle = executor.run_job(job).await.unwrap();
        let mut delivered = 0;
        while let Some(partial) = handle.next_partial().await {
            partial.unwrap();
            delivered += 1;
        }
        assert_eq!(3, delivered);
    }

    #[tokio::test]
    async fn cancellation_stops_dispatch() {
        let executor = LocalExecutor::with_limits(Some(1), None);
        let job = Arc::new(CountingJob::new(
            64,
            std::time::Duration::from_millis(5),
        ));
        let mut handle = executor.run_job(job).await.unwrap();
        // Take one partial, then cancel.
        let first = handle.next_partial().await.unwrap();
        first.unwrap();
        handle.cancel();
        let mut rest = 0;
        while let Some(partial) = handle.next_partial().await {
            partial.unwrap();
            rest += 1;
        }
        // Delivered partials stay valid; most of the 64 partitions were
        // never dispatched.
        assert!(rest < 63);
    }

    struct FailingJob {
        inner: CountingJob,
    }

    impl Job for FailingJob {
        fn result_shape(&self) -> Vec<usize> {
            self.inner.result_shape()
        }

        fn get_partitions(&self) -> Result<Vec<Partition>, QuadStemError> {
            self.inner.get_partitions()
        }

        fn reduce_partition(
            &self,
            partition: &Partition,
            cancel: &CancelToken,
        ) -> Result<Option<PartialResult>, QuadStemError> {
            if partition.slice().origin()[0] == 1 {
                return Err(QuadStemError::geometry("injected failure"));
            }
            self.inner.reduce_partition(partition, cancel)
        }
    }

    #[tokio::test]
    async fn per_partition_errors_leave_others_unaffected() {
        let executor = LocalExecutor::with_limits(Some(1), None);
        let job = Arc::new(FailingJob {
            inner: CountingJob::new(3, std::time::Duration::ZERO),
        });
        let mut handle = executor.run_job(job).await.unwrap();
        let mut ok = 0;
        let mut failed = 0;
        while let Some(partial) = handle.next_partial().await {
            match partial {
                Ok(_) => ok += 1,
                Err(_) => failed += 1,
            }
        }
        assert_eq!(2, ok);
        assert_eq!(1, failed);
    }
}
