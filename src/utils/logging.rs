//! 日志工具模块
//!
//! 提供 tracing 初始化以及日志格式化和输出的辅助函数

use anyhow::{Context, Result};
use std::fs;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::models::{Job, JobStatus};

/// 初始化 tracing
///
/// `RUST_LOG` 优先；否则 `verbose` 为 true 时用 debug 级别，默认 info。
/// 重复调用不会报错，测试里可以随便调。
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 初始化日志文件
///
/// # 参数
/// - `log_file_path`: 日志文件路径
pub fn init_log_file(log_file_path: &str) -> Result<()> {
    let log_header = format!(
        "{}\n并行分析日志 - {}\n{}\n\n",
        "=".repeat(60),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        "=".repeat(60)
    );
    fs::write(log_file_path, log_header)
        .with_context(|| format!("无法写入日志文件: {}", log_file_path))?;
    Ok(())
}

/// 记录程序启动信息
pub fn log_startup(config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 并行分析模式");
    info!("🔑 API Key 数量: {}", config.llm_api_keys.len());
    info!("📊 单个 job 最大并发数: {}", config.max_concurrency);
    info!("⏱️ 单次调用超时: {} 秒", config.call_timeout_secs);
    info!("{}", "=".repeat(60));
}

/// 记录 job 开始信息
///
/// # 参数
/// - `job_id`: job ID
/// - `total_steps`: 步骤总数
/// - `concurrency`: 实际并发数
pub fn log_job_start(job_id: &str, total_steps: usize, concurrency: usize) {
    info!("\n{}", "=".repeat(60));
    info!("📦 开始分析 Job {}", job_id);
    info!("📄 共 {} 个步骤，并发 {}", total_steps, concurrency);
    info!("{}", "=".repeat(60));
}

/// 记录 job 完成信息
pub fn log_job_complete(job: &Job) {
    info!("\n{}", "─".repeat(60));
    let marker = match job.status {
        JobStatus::Completed => "✓",
        JobStatus::Failed => "❌",
    };
    info!(
        "{} Job {} 结束: 成功 {}/{}，耗时 {:.1} 秒",
        marker,
        job.id,
        job.success_count(),
        job.outcomes.len(),
        job.total_time.as_secs_f64()
    );
    info!("{}", "─".repeat(60));
}

/// 打印最终统计信息
///
/// # 参数
/// - `success`: 成功的 job 数量
/// - `failed`: 失败的 job 数量
/// - `total`: job 总数
/// - `log_file_path`: 日志文件路径
pub fn print_final_stats(success: usize, failed: usize, total: usize, log_file_path: &str) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("✅ 成功: {}/{}", success, total);
    info!("❌ 失败: {}", failed);
    info!("{}", "=".repeat(60));
    info!("\n日志已保存至: {}", log_file_path);
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大字符数
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}
