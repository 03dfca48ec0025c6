//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责并发分发和结果汇总，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `analysis_orchestrator` - 单个 job 的编排器
//! - 校验任务配置
//! - 预取第一波 key
//! - 控制并发数量（Semaphore）
//! - 等待所有步骤结束，按声明顺序汇总结果
//! - 发布 started / completed / error
//!
//! ### `job_runner` - 批量 job 执行器
//! - 组装凭证池、provider、广播和编排器
//! - 批量加载 job 文件并分批执行
//! - 为每个 job 挂订阅会话记录进度
//! - 输出全局统计信息
//!
//! ## 层次关系
//!
//! ```text
//! job_runner (处理 Vec<JobFile>)
//!     ↓
//! analysis_orchestrator (处理 Vec<TaskSpec>)
//!     ↓
//! workflow::TaskFlow (处理单个 TaskSpec)
//!     ↓
//! services (能力层：进度发布 / 广播)   clients (provider)
//!     ↓
//! infrastructure (基础设施：CredentialPool)
//! ```

pub mod analysis_orchestrator;
pub mod job_runner;

// 重新导出主要类型
pub use analysis_orchestrator::{AnalysisOrchestrator, OrchestratorSettings};
pub use job_runner::{JobRunner, RunStats};
