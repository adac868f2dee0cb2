// 并行传输协调器
//
// - 同时执行的任务数不超过并发上限
// - 一个任务结束后才调度下一个任务
// - 默认模式：部分失败不中断批量，汇总为成功 / 失败两个列表
// - 快速失败模式：首个失败取消其余任务并返回 BatchAborted

use super::job::{BatchReport, TransferJob, TransferOutput};
use crate::error::{Result, TransferError};
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 默认并发上限
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 10;

/// 任务执行者
#[async_trait]
pub trait TransferWorker: Send + Sync {
    /// 执行一个任务
    async fn run(&self, job: &TransferJob, cancel: &CancellationToken) -> Result<TransferOutput>;
}

/// 并行传输协调器
#[derive(Debug, Clone)]
pub struct TransferCoordinator {
    concurrency_limit: usize,
    fail_fast: bool,
    cancel: CancellationToken,
}

impl Default for TransferCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY_LIMIT)
    }
}

impl TransferCoordinator {
    pub fn new(concurrency_limit: usize) -> Self {
        Self {
            concurrency_limit: concurrency_limit.max(1),
            fail_fast: false,
            cancel: CancellationToken::new(),
        }
    }

    /// 首个失败即中止整个批量
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// 使用外部取消令牌
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// 执行一批相互独立的任务
    ///
    /// # 返回
    /// 默认模式下总是返回 `Ok(BatchReport)`；快速失败模式下首个失败返回 `BatchAborted`
    pub async fn run_many(
        &self,
        jobs: Vec<TransferJob>,
        worker: Arc<dyn TransferWorker>,
    ) -> Result<BatchReport> {
        let total = jobs.len();
        let mut jobs = jobs;
        let mut results: Vec<Option<Result<TransferOutput>>> = (0..total).map(|_| None).collect();
        let batch_cancel = self.cancel.child_token();
        let mut join_set: JoinSet<(usize, Result<TransferOutput>)> = JoinSet::new();
        let mut next = 0usize;
        let mut aborted: Option<usize> = None;

        info!(
            "开始批量传输: {} 个任务, 并发上限 {}, 快速失败={}",
            total, self.concurrency_limit, self.fail_fast
        );

        loop {
            // 补足空闲槽位
            while join_set.len() < self.concurrency_limit
                && next < total
                && !batch_cancel.is_cancelled()
            {
                jobs[next].mark_in_flight();
                let job = jobs[next].clone();
                let worker = worker.clone();
                let cancel = batch_cancel.clone();
                let index = next;

                debug!("调度任务 #{}: {} -> {}", index, job.source, job.destination);
                join_set.spawn(async move {
                    let result = AssertUnwindSafe(worker.run(&job, &cancel))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| Err(TransferError::WorkerPanicked(panic_message(&*panic))));
                    (index, result)
                });
                next += 1;
            }

            let joined = match join_set.join_next().await {
                Some(joined) => joined,
                None => break,
            };

            let (index, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    // 任务体已捕获 panic，这里只会是运行时关闭导致的中止
                    error!("传输任务被中止: {}", e);
                    continue;
                }
            };

            if let Err(err) = &result {
                warn!("任务 #{} 失败: {}: {}", index, jobs[index].source, err);
                if self.fail_fast && aborted.is_none() && !err.is_cancelled() {
                    batch_cancel.cancel();
                    aborted = Some(index);
                }
            }
            results[index] = Some(result);
        }

        if let Some(index) = aborted {
            let source = match results[index].take() {
                Some(Err(err)) => err,
                _ => TransferError::Cancelled,
            };
            error!("批量传输已中止: 任务 {} 失败: {}", jobs[index].id, source);
            return Err(TransferError::BatchAborted {
                job_id: jobs[index].id.clone(),
                source: Box::new(source),
            });
        }

        let mut report = BatchReport::default();
        for (mut job, result) in jobs.into_iter().zip(results) {
            match result {
                Some(Ok(output)) => {
                    job.mark_succeeded();
                    report.succeeded.push((job, output));
                }
                Some(Err(err)) => {
                    job.mark_failed(&err);
                    report.failed.push((job, err));
                }
                None => {
                    // 未被调度（批量被取消）或任务被中止
                    let err = TransferError::Cancelled;
                    job.mark_failed(&err);
                    report.failed.push((job, err));
                }
            }
        }

        info!("批量传输结束: {}", report.summary());
        Ok(report)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ObjectMetadata, ObjectRef};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// 按对象名决定结果，并记录最大并发数
    #[derive(Default)]
    struct ScriptedWorker {
        running: AtomicUsize,
        peak: AtomicUsize,
        started: AtomicUsize,
    }

    #[async_trait]
    impl TransferWorker for ScriptedWorker {
        async fn run(&self, job: &TransferJob, cancel: &CancellationToken) -> Result<TransferOutput> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let name = match &job.source {
                crate::transfer::TransferEndpoint::Object(o) => o.name.clone(),
                _ => String::new(),
            };

            let result = tokio::select! {
                _ = cancel.cancelled() => Err(TransferError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(10)) => {
                    if name.starts_with("fail") {
                        Err(TransferError::http(500, format!("{} failed", name)))
                    } else if name.starts_with("panic") {
                        panic!("worker exploded");
                    } else if name.starts_with("slow") {
                        let waited: Result<()> = tokio::select! {
                            _ = cancel.cancelled() => Err(TransferError::Cancelled),
                            _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(()),
                        };
                        waited.map(|_| TransferOutput::Uploaded(ObjectMetadata::default()))
                    } else {
                        Ok(TransferOutput::Uploaded(ObjectMetadata {
                            name,
                            ..ObjectMetadata::default()
                        }))
                    }
                }
            };

            self.running.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn jobs(names: &[&str]) -> Vec<TransferJob> {
        names
            .iter()
            .map(|name| TransferJob::download(ObjectRef::new("bucket", *name), format!("/tmp/{}", name)))
            .collect()
    }

    #[tokio::test]
    async fn test_partial_failure_is_reported() {
        let worker = Arc::new(ScriptedWorker::default());
        let report = TransferCoordinator::new(2)
            .run_many(jobs(&["a", "fail-1", "b", "fail-2", "c"]), worker)
            .await
            .unwrap();

        let ok: Vec<String> = report
            .succeeded
            .iter()
            .map(|(job, _)| job.source.to_string())
            .collect();
        let failed: Vec<String> = report
            .failed
            .iter()
            .map(|(job, _)| job.source.to_string())
            .collect();

        assert_eq!(ok, vec!["gs://bucket/a", "gs://bucket/b", "gs://bucket/c"]);
        assert_eq!(failed, vec!["gs://bucket/fail-1", "gs://bucket/fail-2"]);
        assert!(report
            .failed
            .iter()
            .all(|(job, err)| job.error.is_some() && err.status() == Some(500)));
        assert!(report
            .succeeded
            .iter()
            .all(|(job, _)| job.status == crate::transfer::JobStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_concurrency_limit_is_respected() {
        let worker = Arc::new(ScriptedWorker::default());
        let names: Vec<String> = (0..12).map(|i| format!("job-{}", i)).collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();

        let report = TransferCoordinator::new(3)
            .run_many(jobs(&names), worker.clone())
            .await
            .unwrap();

        assert_eq!(report.succeeded.len(), 12);
        assert!(worker.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(worker.started.load(Ordering::SeqCst), 12);
    }

    #[tokio::test]
    async fn test_fail_fast_aborts_batch() {
        let worker = Arc::new(ScriptedWorker::default());
        let names = ["slow-1", "fail-1", "a", "b", "c", "d"];
        let err = TransferCoordinator::new(2)
            .with_fail_fast(true)
            .run_many(jobs(&names), worker.clone())
            .await
            .unwrap_err();

        match err {
            TransferError::BatchAborted { source, .. } => assert_eq!(source.status(), Some(500)),
            other => panic!("unexpected error: {:?}", other),
        }
        // 失败后不再调度新任务
        assert!(worker.started.load(Ordering::SeqCst) < names.len());
    }

    #[tokio::test]
    async fn test_panicking_worker_becomes_job_failure() {
        let worker = Arc::new(ScriptedWorker::default());
        let report = TransferCoordinator::default()
            .run_many(jobs(&["a", "panic-1"]), worker)
            .await
            .unwrap();

        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(report.failed[0].1, TransferError::WorkerPanicked(_)));
    }

    #[tokio::test]
    async fn test_cancelled_batch_marks_unstarted_jobs() {
        let worker = Arc::new(ScriptedWorker::default());
        let coordinator = TransferCoordinator::new(1);
        coordinator.cancel_token().cancel();

        let report = coordinator.run_many(jobs(&["a", "b"]), worker).await.unwrap();
        assert_eq!(report.failed.len(), 2);
        assert!(report.failed.iter().all(|(_, e)| e.is_cancelled()));
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let worker = Arc::new(ScriptedWorker::default());
        let report = TransferCoordinator::default()
            .run_many(Vec::new(), worker)
            .await
            .unwrap();
        assert_eq!(report.total(), 0);
        assert!(report.is_success());
    }
}
