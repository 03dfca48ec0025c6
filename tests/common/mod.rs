#![allow(dead_code)]

use async_trait::async_trait;
use parallel_analysis::models::{CredentialId, EventEnvelope, ProgressEvent};
use parallel_analysis::{
    AnalysisOrchestrator, Broadcaster, Credential, CredentialPool, OrchestratorSettings, PoolSettings,
    ProviderClient, ProviderResponse, TaskPayload, TaskSpec,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 一次调用记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub prompt: String,
    pub key: CredentialId,
}

/// 按 prompt 脚本化返回结果的 provider；脚本用完之后一律成功
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<String, VecDeque<ProviderResponse>>>,
    calls: Mutex<Vec<Call>>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn script(self, prompt: &str, responses: Vec<ProviderResponse>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(prompt.to_string(), responses.into());
        self
    }

    /// 同时进行中的调用数的峰值
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, prompt: &str) -> Vec<CredentialId> {
        self.calls()
            .into_iter()
            .filter(|c| c.prompt == prompt)
            .map(|c| c.key)
            .collect()
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    async fn send(&self, credential: &Credential, payload: &TaskPayload, _timeout: Duration) -> ProviderResponse {
        self.calls.lock().unwrap().push(Call {
            prompt: payload.prompt.clone(),
            key: credential.id().clone(),
        });
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.scripts
            .lock()
            .unwrap()
            .get_mut(&payload.prompt)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| ProviderResponse::Success(format!("analysis of {}", payload.prompt)))
    }
}

/// 记录所有发布的事件
#[derive(Default)]
pub struct RecordingBroadcaster {
    events: Mutex<Vec<EventEnvelope>>,
}

impl RecordingBroadcaster {
    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.event.kind()).collect()
    }

    pub fn progresses(&self) -> Vec<u32> {
        self.events().iter().filter_map(|e| e.event.progress()).collect()
    }

    pub fn step_summaries(&self) -> HashMap<String, String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e.event {
                ProgressEvent::StepCompleted { step, summary, .. } => Some((step, summary)),
                _ => None,
            })
            .collect()
    }
}

impl Broadcaster for RecordingBroadcaster {
    fn publish(&self, _job_id: &str, envelope: EventEnvelope) {
        self.events.lock().unwrap().push(envelope);
    }
}

pub fn credentials(n: usize) -> Vec<Credential> {
    (1..=n)
        .map(|i| Credential::new(format!("key-{}", i), format!("sk-test-secret-{:04}", i)))
        .collect()
}

pub fn pool(n: usize) -> Arc<CredentialPool> {
    Arc::new(CredentialPool::new(credentials(n), PoolSettings::default()).unwrap())
}

/// 以 prompt = id 构造任务
pub fn task(id: &str, weight: u32) -> TaskSpec {
    TaskSpec::new(id, weight, TaskPayload::new(id))
}

pub fn orchestrator(
    pool: Arc<CredentialPool>,
    provider: Arc<ScriptedProvider>,
    broadcaster: Arc<dyn Broadcaster>,
) -> AnalysisOrchestrator {
    let settings = OrchestratorSettings {
        emit_previews: false,
        ..Default::default()
    };
    AnalysisOrchestrator::new(pool, provider, broadcaster, settings)
}
