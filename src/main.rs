use anyhow::{Context, Result};
use parallel_analysis::utils::logging;
use parallel_analysis::{Config, JobRunner};

#[tokio::main]
async fn main() -> Result<()> {
    // 加载配置
    let config = Config::from_env().context("环境变量解析失败")?;

    // 初始化日志
    logging::init(config.verbose_logging);

    // 初始化并运行
    let stats = JobRunner::initialize(config)?.run().await?;

    if stats.total > 0 && stats.success == 0 {
        anyhow::bail!("所有 job 都失败了");
    }

    Ok(())
}
