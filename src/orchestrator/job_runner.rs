//! 批量 job 执行器 - 编排层
//!
//! ## 职责
//!
//! 本模块是二进制程序的入口，负责批量 job 的加载、执行和统计。
//!
//! 1. **初始化**：日志文件、凭证池、provider、广播、编排器
//! 2. **批量加载**：扫描 `job_folder` 下的所有 job 定义
//! 3. **并发控制**：分批执行，每批最多 `max_concurrent_jobs` 个 job
//! 4. **进度订阅**：每个 job 在提交前挂一个 [`ClientSession`]，把进度写进日志
//! 5. **全局统计**：汇总所有 job 的结果

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::clients::{OpenAiProvider, ProviderClient};
use crate::config::Config;
use crate::infrastructure::CredentialPool;
use crate::models::{load_all_job_files, Job, JobFile, JobStatus};
use crate::orchestrator::AnalysisOrchestrator;
use crate::services::InMemoryBroadcaster;
use crate::subscriber::{ClientSession, DeferredAction};
use crate::utils::logging::{init_log_file, log_startup, print_final_stats};

/// 批量执行器
pub struct JobRunner {
    config: Config,
    broadcaster: Arc<InMemoryBroadcaster>,
    orchestrator: AnalysisOrchestrator,
}

impl JobRunner {
    /// 使用 OpenAI 兼容服务初始化
    pub fn initialize(config: Config) -> Result<Self> {
        let provider = Arc::new(OpenAiProvider::new(&config));
        Self::with_provider(config, provider)
    }

    /// 使用指定的 provider 初始化
    pub fn with_provider(config: Config, provider: Arc<dyn ProviderClient>) -> Result<Self> {
        init_log_file(&config.output_log_file)?;
        log_startup(&config);

        let pool = CredentialPool::new(config.credentials(), config.pool_settings())
            .context("请设置 LLM_API_KEYS 或 LLM_API_KEY")?;
        let broadcaster = Arc::new(InMemoryBroadcaster::new(config.event_channel_capacity));
        let orchestrator = AnalysisOrchestrator::new(
            Arc::new(pool),
            provider,
            broadcaster.clone(),
            config.orchestrator_settings(),
        );

        Ok(Self {
            config,
            broadcaster,
            orchestrator,
        })
    }

    pub fn orchestrator(&self) -> &AnalysisOrchestrator {
        &self.orchestrator
    }

    /// 运行主逻辑：加载并执行 `job_folder` 下所有 job
    pub async fn run(&self) -> Result<RunStats> {
        info!("\n📁 正在扫描待处理的 job...");
        let jobs = load_all_job_files(&self.config.job_folder).await?;

        if jobs.is_empty() {
            warn!("⚠️ 没有找到待处理的 job 文件，程序结束");
            return Ok(RunStats::default());
        }

        let stats = self.run_jobs(jobs).await;
        print_final_stats(
            stats.success,
            stats.failed,
            stats.total,
            &self.config.output_log_file,
        );
        info!("🔑 凭证使用情况: {:?}", self.orchestrator.pool().stats());

        Ok(stats)
    }

    /// 分批执行 job，每批全部结束后再开始下一批
    pub async fn run_jobs(&self, jobs: Vec<JobFile>) -> RunStats {
        let batch_size = self.config.max_concurrent_jobs.max(1);
        let total = jobs.len();
        let mut stats = RunStats {
            total,
            ..Default::default()
        };

        info!("✓ 找到 {} 个待处理的 job，每批 {} 个", total, batch_size);

        let mut jobs = jobs.into_iter().peekable();
        let mut batch_num = 0;
        while jobs.peek().is_some() {
            batch_num += 1;
            let batch: Vec<JobFile> = jobs.by_ref().take(batch_size).collect();
            info!("📦 开始第 {} 批 ({} 个 job)", batch_num, batch.len());

            let results = futures::future::join_all(batch.into_iter().map(|job| self.run_job(job))).await;
            for result in results {
                match result {
                    Ok(job) if job.status == JobStatus::Completed => stats.success += 1,
                    Ok(_) => stats.failed += 1,
                    Err(e) => {
                        error!("❌ job 执行失败: {:#}", e);
                        stats.failed += 1;
                    }
                }
            }
        }

        stats
    }

    /// 执行单个 job，同时挂一个订阅会话把进度写进日志
    pub async fn run_job(&self, job_file: JobFile) -> Result<Job> {
        let default_retries = self.config.default_max_retries;
        let plan = job_file.into_plan()?;
        let (job_id, specs) = plan.into_parts();
        let specs = specs
            .into_iter()
            .map(|spec| match spec.max_retries {
                Some(_) => spec,
                None => spec.with_max_retries(default_retries),
            })
            .collect();

        // 先订阅再提交，才能收到 started
        let mut session =
            ClientSession::new(self.broadcaster.subscribe(&job_id)).with_grace_delay(Duration::ZERO);
        let watch_id = job_id.clone();
        let watcher = tokio::spawn(async move {
            session
                .run_until_terminal(|state| info!("[Job {}] {}", watch_id, state.status_line()))
                .await
        });

        let handle = self.orchestrator.submit(job_id.clone(), specs);
        let job = AnalysisOrchestrator::join(handle)
            .await
            .with_context(|| format!("job {} 执行失败", job_id))?;

        match watcher.await {
            Ok(Some(DeferredAction::Navigate { url: Some(url), .. })) => {
                info!("[Job {}] 🔗 结果地址: {}", job_id, url)
            }
            Ok(_) => {}
            Err(e) => warn!("[Job {}] 进度订阅异常退出: {}", job_id, e),
        }

        Ok(job)
    }
}

/// 批量执行统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    pub success: usize,
    pub failed: usize,
    pub total: usize,
}
