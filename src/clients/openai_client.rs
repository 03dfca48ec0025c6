//! OpenAI 兼容的 provider 实现
//!
//! ## 技术栈
//! - 使用 `async-openai` crate 进行 API 调用
//! - 每个 key 对应一个 `Client`，按 key 缓存
//! - 兼容 OpenAI API 的服务（如 Azure, Gemini, Doubao 等）

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::clients::provider::{ProviderClient, ProviderResponse};
use crate::config::Config;
use crate::models::{Credential, CredentialId, TaskPayload};

/// 默认最大 token 数
const DEFAULT_MAX_TOKENS: u32 = 2000;

/// 限流提示里的等待时间，只编译一次
static WAIT_HINT_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"try again in (\d+(?:\.\d+)?)\s*(ms|s)\b").ok());

/// OpenAI 兼容的 provider
pub struct OpenAiProvider {
    api_base_url: String,
    model_name: String,
    temperature: f32,
    clients: Mutex<HashMap<CredentialId, Client<OpenAIConfig>>>,
}

impl OpenAiProvider {
    pub fn new(config: &Config) -> Self {
        Self {
            api_base_url: config.llm_api_base_url.clone(),
            model_name: config.llm_model_name.clone(),
            temperature: 0.7,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// 使用自定义模型
    pub fn with_model(config: &Config, model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            ..Self::new(config)
        }
    }

    fn client_for(&self, credential: &Credential) -> Client<OpenAIConfig> {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients
            .entry(credential.id().clone())
            .or_insert_with(|| {
                let openai_config = OpenAIConfig::new()
                    .with_api_key(credential.expose_secret())
                    .with_api_base(&self.api_base_url);
                Client::with_config(openai_config)
            })
            .clone()
    }

    async fn chat(
        &self,
        client: &Client<OpenAIConfig>,
        payload: &TaskPayload,
    ) -> Result<Option<String>, OpenAIError> {
        let mut messages = Vec::new();

        if let Some(role) = &payload.system_role {
            let system_msg = ChatCompletionRequestSystemMessageArgs::default()
                .content(role.as_str())
                .build()?;
            messages.push(ChatCompletionRequestMessage::System(system_msg));
        }

        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(payload.prompt.as_str())
            .build()?;
        messages.push(ChatCompletionRequestMessage::User(user_msg));

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(messages)
            .temperature(self.temperature)
            .max_tokens(payload.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS))
            .build()?;

        let response = client.chat().create(request).await?;

        Ok(response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone()))
    }
}

#[async_trait]
impl ProviderClient for OpenAiProvider {
    async fn send(
        &self,
        credential: &Credential,
        payload: &TaskPayload,
        timeout: Duration,
    ) -> ProviderResponse {
        debug!(
            "调用 LLM API，模型: {}，key: {}，消息长度: {} 字符",
            self.model_name,
            credential.id(),
            payload.prompt.len()
        );

        let client = self.client_for(credential);
        match tokio::time::timeout(timeout, self.chat(&client, payload)).await {
            Err(_) => ProviderResponse::transient(format!(
                "Timeout after {} seconds",
                timeout.as_secs()
            )),
            Ok(Ok(Some(content))) if !content.trim().is_empty() => {
                debug!("LLM API 调用成功");
                ProviderResponse::Success(content.trim().to_string())
            }
            Ok(Ok(_)) => ProviderResponse::transient("LLM 返回内容为空"),
            Ok(Err(e)) => {
                warn!("LLM API 调用失败: {}", e);
                classify_error(&e)
            }
        }
    }
}

/// 把 `async-openai` 的错误映射为三种结果之一
fn classify_error(err: &OpenAIError) -> ProviderResponse {
    match err {
        OpenAIError::ApiError(api) => {
            let code = api.code.as_deref().unwrap_or_default();
            let kind = api.r#type.as_deref().unwrap_or_default();
            classify_api_error(code, kind, &api.message)
        }
        OpenAIError::InvalidArgument(msg) => ProviderResponse::permanent(msg.clone()),
        other => ProviderResponse::transient(other.to_string()),
    }
}

fn classify_api_error(code: &str, kind: &str, message: &str) -> ProviderResponse {
    // 额度用尽换 key 才有用，按普通失败计入该 key 的错误次数
    if code == "insufficient_quota" {
        return ProviderResponse::transient(message);
    }

    if code == "rate_limit_exceeded"
        || kind == "requests"
        || kind == "tokens"
        || message.to_lowercase().contains("rate limit")
    {
        return ProviderResponse::RateLimited {
            wait_hint: parse_wait_hint(message),
        };
    }

    // key 本身失效是凭证问题，不是任务问题
    if code == "invalid_api_key" {
        return ProviderResponse::transient(message);
    }

    if kind == "invalid_request_error" {
        return ProviderResponse::permanent(message);
    }

    ProviderResponse::transient(message)
}

/// 从限流提示中解析等待时间，例如 `Please try again in 1.5s` / `try again in 120ms`
pub fn parse_wait_hint(message: &str) -> Option<Duration> {
    let caps = WAIT_HINT_RE.as_ref()?.captures(message)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;

    match caps.get(2)?.as_str() {
        "ms" => Some(Duration::from_millis(value.ceil() as u64)),
        _ => Some(Duration::from_secs(value.ceil() as u64)),
    }
}
