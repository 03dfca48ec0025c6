//! 分析编排器 - 编排层
//!
//! ## 职责
//!
//! 把一个 job 的所有步骤分发出去并行执行，等待全部结束后汇总结果。
//!
//! ## 流程
//!
//! 1. 校验任务配置（权重之和为 100），不合法直接返回错误，不发布任何事件
//! 2. 发布 `started`
//! 3. 为第一波任务批量预取互不相同的 key
//! 4. 用 Semaphore 限制并发，每个步骤一个 tokio 任务，执行 [`TaskFlow`]
//! 5. 等待所有任务结束（panic 记为永久失败）
//! 6. 至少一个成功 → `completed`；全部失败 → `error`
//!
//! 编排器不提供取消：`run` 开始后所有步骤都会执行到结束或重试用完。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::clients::ProviderClient;
use crate::error::OrchestratorError;
use crate::infrastructure::CredentialPool;
use crate::models::{FailureKind, Job, JobPlan, JobStatus, TaskId, TaskOutcome, TaskSpec, TOTAL_WEIGHT};
use crate::services::{Broadcaster, JobProgress};
use crate::utils::logging::{log_job_complete, log_job_start};
use crate::workflow::task_flow::{FlowSettings, SUMMARY_FAILED};
use crate::workflow::{TaskCtx, TaskFlow};

/// 编排参数
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// 单个 job 内的最大并发数
    pub max_concurrency: usize,
    /// 单次调用超时
    pub call_timeout: Duration,
    /// 成功后是否发布 preview
    pub emit_previews: bool,
    /// preview 摘录的最大字符数
    pub preview_chars: usize,
    /// 完成后跳转地址模板，`{job_id}` 会被替换
    pub redirect_template: Option<String>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            call_timeout: Duration::from_secs(120),
            emit_previews: true,
            preview_chars: 200,
            redirect_template: None,
        }
    }
}

impl OrchestratorSettings {
    fn flow_settings(&self) -> FlowSettings {
        FlowSettings {
            call_timeout: self.call_timeout,
            emit_previews: self.emit_previews,
            preview_chars: self.preview_chars,
        }
    }

    fn redirect_url(&self, job_id: &str) -> Option<String> {
        self.redirect_template
            .as_ref()
            .map(|template| template.replace("{job_id}", job_id))
    }
}

type OutcomeMap = Arc<Mutex<HashMap<TaskId, TaskOutcome>>>;

/// 分析编排器
///
/// 可以廉价 clone，所有依赖都是共享的。
#[derive(Clone)]
pub struct AnalysisOrchestrator {
    pool: Arc<CredentialPool>,
    provider: Arc<dyn ProviderClient>,
    broadcaster: Arc<dyn Broadcaster>,
    settings: OrchestratorSettings,
}

impl AnalysisOrchestrator {
    pub fn new(
        pool: Arc<CredentialPool>,
        provider: Arc<dyn ProviderClient>,
        broadcaster: Arc<dyn Broadcaster>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            pool,
            provider,
            broadcaster,
            settings,
        }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// 在后台执行一个 job
    ///
    /// 想收到 `started` 的订阅者必须在调用之前订阅。
    pub fn submit(
        &self,
        job_id: impl Into<String>,
        specs: Vec<TaskSpec>,
    ) -> JoinHandle<Result<Job, OrchestratorError>> {
        let this = self.clone();
        let job_id = job_id.into();
        tokio::spawn(async move { this.run(job_id, specs).await })
    }

    /// 等待 [`submit`](Self::submit) 返回的后台任务
    pub async fn join(handle: JoinHandle<Result<Job, OrchestratorError>>) -> Result<Job, OrchestratorError> {
        handle
            .await
            .map_err(|e| OrchestratorError::Join(e.to_string()))?
    }

    /// 执行一个 job，等待所有步骤结束后返回汇总结果
    ///
    /// # 参数
    /// - `job_id`: job ID，同时决定事件 topic
    /// - `specs`: 按声明顺序排列的步骤
    ///
    /// # 返回
    /// 只有任务配置不合法时返回错误；步骤失败体现在 `Job::outcomes` 里
    pub async fn run(&self, job_id: impl Into<String>, specs: Vec<TaskSpec>) -> Result<Job, OrchestratorError> {
        let job_id = job_id.into();
        let plan = JobPlan::new(job_id.clone(), specs).map_err(|e| {
            error!("[Job {}] ❌ 任务配置不合法: {}", job_id, e);
            e
        })?;
        let (job_id, specs) = plan.into_parts();

        let started_at = Utc::now();
        let clock = Instant::now();
        let concurrency = specs.len().min(self.settings.max_concurrency.max(1));
        log_job_start(&job_id, specs.len(), concurrency);

        let progress = Arc::new(JobProgress::new(
            job_id.clone(),
            &specs,
            self.broadcaster.clone(),
        ));
        let _ = progress.start();

        let outcomes = self
            .dispatch(&job_id, &specs, concurrency, progress.clone())
            .await;

        let success = outcomes.iter().filter(|(_, o)| o.is_success()).count();
        let (status, final_progress) = if success > 0 {
            let message = format!("分析完成：{}/{} 个步骤成功", success, outcomes.len());
            let _ = progress.complete(&message, self.settings.redirect_url(&job_id));
            (JobStatus::Completed, TOTAL_WEIGHT)
        } else {
            let _ = progress.fail("所有分析步骤都失败了，请稍后重试", true);
            (JobStatus::Failed, progress.progress())
        };

        let job = Job {
            id: job_id,
            specs,
            outcomes,
            progress: final_progress,
            status,
            started_at,
            total_time: clock.elapsed(),
        };
        log_job_complete(&job);
        Ok(job)
    }

    /// 并行分发所有步骤，等待全部结束，按声明顺序返回结果
    async fn dispatch(
        &self,
        job_id: &str,
        specs: &[TaskSpec],
        concurrency: usize,
        progress: Arc<JobProgress>,
    ) -> Vec<(TaskId, TaskOutcome)> {
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let results: OutcomeMap = Arc::new(Mutex::new(HashMap::with_capacity(specs.len())));
        let flow = Arc::new(TaskFlow::new(
            self.pool.clone(),
            self.provider.clone(),
            progress.clone(),
            self.settings.flow_settings(),
        ));

        // 第一波每个任务一个不同的 key
        let mut leases = self.pool.acquire_many(concurrency).into_iter();
        let mut handles = Vec::with_capacity(specs.len());

        for (idx, spec) in specs.iter().enumerate() {
            let ctx = TaskCtx::new(job_id, spec.id.clone(), idx + 1, specs.len());
            let lease = leases.next();

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!("{} 无法获取并发许可: {}", ctx, e);
                    record(&results, &spec.id, TaskOutcome::failure(FailureKind::Permanent, e.to_string()));
                    continue;
                }
            };

            let flow = flow.clone();
            let results = results.clone();
            let task_id = spec.id.clone();
            let spec = spec.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                let outcome = flow.run(&spec, &ctx, lease).await;
                record(&results, &spec.id, outcome);
            });
            handles.push((task_id, handle));
        }

        // 等待所有任务结束
        let (ids, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        for (task_id, joined) in ids.into_iter().zip(join_all(handles).await) {
            if let Err(e) = joined {
                error!("[Job {} 任务 {}] 💥 任务异常退出: {}", job_id, task_id, e);
                record(
                    &results,
                    &task_id,
                    TaskOutcome::failure(FailureKind::Permanent, format!("任务异常退出: {}", e)),
                );
                let _ = progress.step_completed(&task_id, SUMMARY_FAILED);
            }
        }

        let mut results = results.lock().unwrap_or_else(|e| e.into_inner());
        specs
            .iter()
            .map(|spec| {
                let outcome = results.remove(&spec.id).unwrap_or_else(|| {
                    warn!("[Job {} 任务 {}] 没有记录到结果", job_id, spec.id);
                    TaskOutcome::failure(FailureKind::Permanent, "没有记录到结果")
                });
                (spec.id.clone(), outcome)
            })
            .collect()
    }
}

fn record(results: &OutcomeMap, task_id: &str, outcome: TaskOutcome) {
    results
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(task_id.to_string(), outcome);
    debug!("任务 {} 的结果已记录", task_id);
}
