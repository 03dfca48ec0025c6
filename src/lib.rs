//! # Parallel Analysis
//!
//! 把一个分析请求拆成多个独立步骤，并行调用有限流的文本生成服务，
//! 同时把进度实时推送给等待中的客户端。
//!
//! ## 架构设计
//!
//! 本系统采用分层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有稀缺资源（API Key），只暴露能力
//! - `CredentialPool` - 负载均衡、限流冷却、错误计数、全局重置
//!
//! ### ② 外部服务（Clients）
//! - `clients/` - `ProviderClient` 抽象 + OpenAI 兼容实现
//!
//! ### ③ 业务能力层（Services）
//! - `services/` - 进度广播
//! - `InMemoryBroadcaster` - 每个 job 一个 topic
//! - `JobProgress` - 单个 job 的有序事件发布，负责进度计算
//!
//! ### ④ 流程层（Workflow）
//! - `workflow/` - 定义"一个步骤"的完整处理流程
//! - `TaskCtx` - 上下文封装（job_id + task_id）
//! - `TaskFlow` - 取 key → 调用 → 上报 → 重试
//!
//! ### ⑤ 编排层（Orchestration）
//! - `orchestrator/analysis_orchestrator` - 单个 job 的并行分发与汇总
//! - `orchestrator/job_runner` - 批量 job 执行器
//!
//! ### 客户端（Subscriber）
//! - `subscriber/` - 订阅事件，维护进度显示状态
//!
//! ## 模块结构

pub mod clients;
pub mod config;
pub mod error;
pub mod infrastructure;
pub mod models;
pub mod orchestrator;
pub mod services;
pub mod subscriber;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use clients::{OpenAiProvider, ProviderClient, ProviderResponse};
pub use config::Config;
pub use error::{ConfigurationError, OrchestratorError};
pub use infrastructure::{CredentialPool, PoolSettings};
pub use models::{Credential, FailureKind, Job, JobStatus, ProgressEvent, TaskOutcome, TaskPayload, TaskSpec};
pub use orchestrator::{AnalysisOrchestrator, JobRunner, OrchestratorSettings};
pub use services::{Broadcaster, InMemoryBroadcaster};
pub use subscriber::{ClientSession, ProgressState};
pub use workflow::{TaskCtx, TaskFlow};
