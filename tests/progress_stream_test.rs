mod common;

use common::{pool, task, ScriptedProvider};
use parallel_analysis::subscriber::{DeferredAction, Phase, StepView};
use parallel_analysis::{
    AnalysisOrchestrator, ClientSession, InMemoryBroadcaster, JobStatus, OrchestratorSettings,
    ProgressState, ProviderResponse,
};
use std::sync::Arc;
use std::time::Duration;

fn setup(provider: ScriptedProvider) -> (Arc<InMemoryBroadcaster>, AnalysisOrchestrator) {
    let broadcaster = Arc::new(InMemoryBroadcaster::default());
    let settings = OrchestratorSettings {
        redirect_template: Some("/analyses/{job_id}".to_string()),
        ..Default::default()
    };
    let orch = AnalysisOrchestrator::new(pool(3), Arc::new(provider), broadcaster.clone(), settings);
    (broadcaster, orch)
}

#[tokio::test(start_paused = true)]
async fn test_client_follows_job_to_completion() {
    let provider = ScriptedProvider::new()
        .with_delay(Duration::from_secs(2))
        .script("t2", vec![ProviderResponse::permanent("rejected")]);
    let (broadcaster, orch) = setup(provider);

    let mut session = ClientSession::new(broadcaster.subscribe("job-42"));
    let handle = orch.submit("job-42", vec![task("t1", 40), task("t2", 30), task("t3", 30)]);

    let mut seen = Vec::new();
    let action = session
        .run_until_terminal(|state| seen.push(state.progress()))
        .await;

    let job = AnalysisOrchestrator::join(handle).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    for pair in seen.windows(2) {
        assert!(pair[0] <= pair[1]);
    }
    assert_eq!(seen.last(), Some(&100));

    let state = session.state();
    assert_eq!(state.phase(), Phase::Completed);
    assert_eq!(state.steps().len(), 3);
    assert_eq!(state.steps()[1].view, StepView::Failed);
    assert!(
        matches!(&state.steps()[0].view, StepView::Done(summary) if summary.contains("第 1 次尝试成功")),
        "{:?}",
        state.steps()[0].view
    );
    assert!(state.last_preview().is_some());

    assert_eq!(
        action,
        Some(DeferredAction::Navigate {
            url: Some("/analyses/job-42".to_string()),
            after: Duration::from_secs(3),
        })
    );

    // topic 在终止事件后被移除
    assert_eq!(broadcaster.subscriber_count("job-42"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_client_sees_retryable_error_when_everything_fails() {
    let provider = ScriptedProvider::new()
        .script("only", vec![ProviderResponse::permanent("auth rejected")]);
    let (broadcaster, orch) = setup(provider);

    let mut session = ClientSession::new(broadcaster.subscribe("job-err"));
    let handle = orch.submit("job-err", vec![task("only", 100)]);

    let action = session.run_until_terminal(|_| {}).await;
    assert_eq!(action, None);
    assert_eq!(session.state().phase(), Phase::Error);
    assert!(session.state().retry_available());

    let job = AnalysisOrchestrator::join(handle).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribing_does_not_stop_the_job() {
    let provider = ScriptedProvider::new().with_delay(Duration::from_secs(5));
    let (broadcaster, orch) = setup(provider);

    let mut session = ClientSession::new(broadcaster.subscribe("job-bye"));
    let handle = orch.submit("job-bye", vec![task("a", 50), task("b", 50)]);

    // 收到 started 后离开
    assert_eq!(session.next_update().await, Some(true));
    session.unsubscribe();

    let job = AnalysisOrchestrator::join(handle).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.success_count(), 2);
    assert_eq!(session.state().phase(), Phase::Started);
}

#[tokio::test]
async fn test_wire_payloads_drive_the_state_machine() {
    let (broadcaster, orch) = setup(ScriptedProvider::new());
    let mut sub = broadcaster.subscribe("job-wire");
    let handle = orch.submit("job-wire", vec![task("a", 60), task("b", 40)]);

    let mut state = ProgressState::with_grace_delay(Duration::ZERO);
    state.apply_json(r#"{"type":"heartbeat"}"#);
    while let Some(envelope) = sub.recv().await {
        let payload = envelope.to_json().unwrap();
        state.apply_json(&payload);
    }

    AnalysisOrchestrator::join(handle).await.unwrap();
    assert_eq!(state.phase(), Phase::Completed);
    assert_eq!(state.progress(), 100);
    assert_eq!(state.remaining(), 0);
}

#[tokio::test]
async fn test_late_subscriber_gets_no_replay() {
    let (broadcaster, orch) = setup(ScriptedProvider::new());
    orch.run("job-late", vec![task("a", 100)]).await.unwrap();

    // job 已结束，新的订阅收不到任何历史事件
    let mut sub = broadcaster.subscribe("job-late");
    let next = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await;
    assert!(next.is_err());

    // 放弃订阅后不留下空 topic
    drop(sub);
    assert_eq!(broadcaster.topic_count(), 0);
}
