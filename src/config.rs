//! 程序配置
//!
//! 每个字段都可以用同名的大写环境变量覆盖，未设置时使用默认值。

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::infrastructure::PoolSettings;
use crate::models::{Credential, DEFAULT_MAX_RETRIES};
use crate::orchestrator::OrchestratorSettings;
use crate::services::broadcaster::DEFAULT_CHANNEL_CAPACITY;

/// 程序配置
#[derive(Clone)]
pub struct Config {
    // --- LLM 配置 ---
    /// API Key 列表（`LLM_API_KEYS` 逗号分隔，或 `LLM_API_KEY`、`LLM_API_KEY_2..4`）
    pub llm_api_keys: Vec<String>,
    pub llm_api_base_url: String,
    pub llm_model_name: String,
    // --- 编排配置 ---
    /// 单个 job 内的最大并发数
    pub max_concurrency: usize,
    /// 同时执行的 job 数量
    pub max_concurrent_jobs: usize,
    /// 单次调用超时（秒）
    pub call_timeout_secs: u64,
    /// 任务没有指定 `max_retries` 时使用
    pub default_max_retries: u32,
    pub emit_previews: bool,
    pub preview_chars: usize,
    /// 完成后的跳转地址模板，如 `/analyses/{job_id}`
    pub redirect_template: Option<String>,
    // --- 凭证池配置 ---
    pub error_threshold: u32,
    pub recency_window_ms: u64,
    pub rate_limit_wait_secs: u64,
    // --- 广播配置 ---
    pub event_channel_capacity: usize,
    // --- 运行配置 ---
    /// job TOML 文件存放目录
    pub job_folder: String,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    /// 输出日志文件
    pub output_log_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm_api_keys: Vec::new(),
            llm_api_base_url: "https://api.openai.com/v1".to_string(),
            llm_model_name: "gpt-4o-mini".to_string(),
            max_concurrency: 4,
            max_concurrent_jobs: 2,
            call_timeout_secs: 120,
            default_max_retries: DEFAULT_MAX_RETRIES,
            emit_previews: true,
            preview_chars: 200,
            redirect_template: None,
            error_threshold: 5,
            recency_window_ms: 1000,
            rate_limit_wait_secs: 20,
            event_channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            job_folder: "jobs".to_string(),
            verbose_logging: false,
            output_log_file: "output.txt".to_string(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("llm_api_keys", &format!("<{} keys>", self.llm_api_keys.len()))
            .field("llm_api_base_url", &self.llm_api_base_url)
            .field("llm_model_name", &self.llm_model_name)
            .field("max_concurrency", &self.max_concurrency)
            .field("max_concurrent_jobs", &self.max_concurrent_jobs)
            .field("call_timeout_secs", &self.call_timeout_secs)
            .field("default_max_retries", &self.default_max_retries)
            .field("job_folder", &self.job_folder)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let default = Self::default();
        Ok(Self {
            llm_api_keys: read_api_keys(),
            llm_api_base_url: std::env::var("LLM_API_BASE_URL").unwrap_or(default.llm_api_base_url),
            llm_model_name: std::env::var("LLM_MODEL_NAME").unwrap_or(default.llm_model_name),
            max_concurrency: env_parse("MAX_CONCURRENCY", default.max_concurrency)?,
            max_concurrent_jobs: env_parse("MAX_CONCURRENT_JOBS", default.max_concurrent_jobs)?,
            call_timeout_secs: env_parse("CALL_TIMEOUT_SECS", default.call_timeout_secs)?,
            default_max_retries: env_parse("DEFAULT_MAX_RETRIES", default.default_max_retries)?,
            emit_previews: env_parse("EMIT_PREVIEWS", default.emit_previews)?,
            preview_chars: env_parse("PREVIEW_CHARS", default.preview_chars)?,
            redirect_template: std::env::var("REDIRECT_TEMPLATE").ok().or(default.redirect_template),
            error_threshold: env_parse("ERROR_THRESHOLD", default.error_threshold)?,
            recency_window_ms: env_parse("RECENCY_WINDOW_MS", default.recency_window_ms)?,
            rate_limit_wait_secs: env_parse("RATE_LIMIT_WAIT_SECS", default.rate_limit_wait_secs)?,
            event_channel_capacity: env_parse("EVENT_CHANNEL_CAPACITY", default.event_channel_capacity)?,
            job_folder: std::env::var("JOB_FOLDER").unwrap_or(default.job_folder),
            verbose_logging: env_parse("VERBOSE_LOGGING", default.verbose_logging)?,
            output_log_file: std::env::var("OUTPUT_LOG_FILE").unwrap_or(default.output_log_file),
        })
    }

    /// 按顺序生成 `key-1`、`key-2` ... 的凭证
    pub fn credentials(&self) -> Vec<Credential> {
        self.llm_api_keys
            .iter()
            .enumerate()
            .map(|(i, secret)| Credential::new(format!("key-{}", i + 1), secret.as_str()))
            .collect()
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            error_threshold: self.error_threshold,
            recency_window: Duration::from_millis(self.recency_window_ms),
            default_rate_limit_wait: Duration::from_secs(self.rate_limit_wait_secs),
            ..PoolSettings::default()
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            max_concurrency: self.max_concurrency.max(1),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            emit_previews: self.emit_previews,
            preview_chars: self.preview_chars,
            redirect_template: self.redirect_template.clone(),
        }
    }
}

/// 读取环境变量并解析，未设置时返回默认值
fn env_parse<T: FromStr>(var_name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var_name) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::EnvVarParseFailed {
            var_name: var_name.to_string(),
            value,
            expected_type: std::any::type_name::<T>().to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// `LLM_API_KEYS` 优先，否则依次读取 `LLM_API_KEY`、`LLM_API_KEY_2` ~ `LLM_API_KEY_4`
fn read_api_keys() -> Vec<String> {
    if let Ok(list) = std::env::var("LLM_API_KEYS") {
        return split_keys(&list);
    }

    std::iter::once("LLM_API_KEY".to_string())
        .chain((2..=4).map(|i| format!("LLM_API_KEY_{}", i)))
        .filter_map(|name| std::env::var(name).ok())
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
        .collect()
}

fn split_keys(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_keys() {
        assert_eq!(split_keys(" sk-a, sk-b ,,sk-c "), vec!["sk-a", "sk-b", "sk-c"]);
        assert!(split_keys("").is_empty());
    }

    #[test]
    fn test_env_parse_reports_bad_value() {
        std::env::set_var("PA_TEST_BAD_NUMBER", "four");
        let err = env_parse::<usize>("PA_TEST_BAD_NUMBER", 4).unwrap_err();
        assert!(matches!(err, ConfigError::EnvVarParseFailed { ref var_name, .. } if var_name == "PA_TEST_BAD_NUMBER"));
        assert_eq!(env_parse::<usize>("PA_TEST_UNSET_NUMBER", 4).unwrap(), 4);
    }

    #[test]
    fn test_derived_settings() {
        let config = Config {
            llm_api_keys: vec!["sk-one".to_string(), "sk-two".to_string()],
            rate_limit_wait_secs: 7,
            max_concurrency: 0,
            redirect_template: Some("/analyses/{job_id}".to_string()),
            ..Config::default()
        };

        let creds = config.credentials();
        assert_eq!(creds[1].id().as_str(), "key-2");
        assert_eq!(config.pool_settings().default_rate_limit_wait, Duration::from_secs(7));
        assert_eq!(config.orchestrator_settings().max_concurrency, 1);
    }

    #[test]
    fn test_debug_hides_keys() {
        let config = Config {
            llm_api_keys: vec!["sk-very-secret-value".to_string()],
            ..Config::default()
        };
        let printed = format!("{:?}", config);
        assert!(!printed.contains("sk-very-secret-value"));
    }
}
