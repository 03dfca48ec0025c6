use crate::models::job::JobPlan;
use crate::models::task::TaskSpec;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::fs;

/// 一个 job 定义文件
///
/// ```toml
/// job_id = "cover-letter-42"
///
/// [[tasks]]
/// id = "strengths"
/// name = "优势分析"
/// weight = 25
///
/// [tasks.payload]
/// prompt = "..."
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct JobFile {
    pub job_id: String,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
    #[serde(skip)]
    pub file_path: Option<String>,
}

impl JobFile {
    /// 校验并转换为 [`JobPlan`]
    pub fn into_plan(self) -> Result<JobPlan> {
        let source = self.file_path.clone().unwrap_or_default();
        JobPlan::new(self.job_id, self.tasks)
            .with_context(|| format!("job 配置不合法: {}", source))
    }
}

/// 从 TOML 文件加载 job 定义
pub async fn load_job_file(toml_file_path: &Path) -> Result<JobFile> {
    let content = fs::read_to_string(toml_file_path)
        .await
        .with_context(|| format!("无法读取TOML文件: {}", toml_file_path.display()))?;

    let mut job: JobFile = toml::from_str(&content)
        .with_context(|| format!("无法解析TOML文件: {}", toml_file_path.display()))?;

    job.file_path = Some(toml_file_path.to_string_lossy().to_string());

    Ok(job)
}

/// 从文件夹中加载所有 job 定义，按文件名排序
///
/// 单个文件解析失败只记录警告，不影响其他文件。
pub async fn load_all_job_files(folder_path: &str) -> Result<Vec<JobFile>> {
    let folder = PathBuf::from(folder_path);

    if !folder.exists() {
        anyhow::bail!("文件夹不存在: {}", folder_path);
    }

    let mut paths = Vec::new();
    let mut entries = fs::read_dir(&folder)
        .await
        .with_context(|| format!("无法读取文件夹: {}", folder_path))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut jobs = Vec::new();
    for path in paths {
        tracing::info!(
            "正在加载: {}",
            path.file_name().unwrap_or_default().to_string_lossy()
        );

        match load_job_file(&path).await {
            Ok(job) => {
                tracing::info!("成功加载 job {}，共 {} 个步骤", job.job_id, job.tasks.len());
                jobs.push(job);
            }
            Err(e) => {
                tracing::warn!("加载文件失败 {}: {:#}", path.display(), e);
            }
        }
    }

    Ok(jobs)
}
