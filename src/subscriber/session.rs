//! 客户端订阅会话
//!
//! 单个消费者：从订阅里逐条取事件，喂给 [`ProgressState`]。
//! 取消订阅只影响本地，服务端的 job 照常执行到结束。

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::models::EventEnvelope;
use crate::services::Subscription;
use crate::subscriber::progress_state::{DeferredAction, ProgressState};

pub struct ClientSession {
    job_id: String,
    subscription: Option<Subscription>,
    state: ProgressState,
    last_seq: u64,
}

impl ClientSession {
    pub fn new(subscription: Subscription) -> Self {
        Self {
            job_id: subscription.job_id().to_string(),
            subscription: Some(subscription),
            state: ProgressState::new(),
            last_seq: 0,
        }
    }

    /// 自定义完成后的停留时间
    pub fn with_grace_delay(mut self, grace_delay: Duration) -> Self {
        self.state = ProgressState::with_grace_delay(grace_delay);
        self
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    /// 处理下一条事件
    ///
    /// # 返回
    /// - `Some(changed)`：收到一条事件，`changed` 表示状态是否变化
    /// - `None`：事件流结束或已取消订阅
    pub async fn next_update(&mut self) -> Option<bool> {
        let subscription = self.subscription.as_mut()?;
        match subscription.recv().await {
            Some(envelope) => Some(self.fold(envelope)),
            None => {
                debug!("[Job {}] 事件流结束", self.job_id);
                self.subscription = None;
                None
            }
        }
    }

    /// 一直处理到终止事件或事件流结束
    ///
    /// 每次状态变化都会回调 `on_update`。收到 `completed` 后等待停留时间，
    /// 再把延迟动作交给调用方执行。
    pub async fn run_until_terminal<F>(&mut self, mut on_update: F) -> Option<DeferredAction>
    where
        F: FnMut(&ProgressState),
    {
        while let Some(changed) = self.next_update().await {
            if changed {
                on_update(&self.state);
            }
            if self.state.is_terminal() {
                break;
            }
        }

        if !self.state.is_terminal() {
            warn!("[Job {}] 事件流在终止事件之前结束", self.job_id);
        }

        let action = self.state.take_deferred_action()?;
        tokio::time::sleep(action.after()).await;
        Some(action)
    }

    /// 取消订阅，只断开本地接收
    pub fn unsubscribe(&mut self) {
        if self.subscription.take().is_some() {
            info!("[Job {}] 已取消订阅", self.job_id);
        }
    }

    fn fold(&mut self, envelope: EventEnvelope) -> bool {
        if self.last_seq != 0 && envelope.seq > self.last_seq + 1 {
            debug!(
                "[Job {}] 丢失了 {} 条事件",
                self.job_id,
                envelope.seq - self.last_seq - 1
            );
        }
        self.last_seq = self.last_seq.max(envelope.seq);
        self.state.apply(&envelope.event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProgressEvent;
    use crate::services::{Broadcaster, InMemoryBroadcaster};
    use crate::subscriber::progress_state::Phase;

    fn envelope(seq: u64, event: ProgressEvent) -> EventEnvelope {
        EventEnvelope::new("job-1", seq, event)
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_completed_waits_grace_delay() {
        let broadcaster = InMemoryBroadcaster::default();
        let mut session = ClientSession::new(broadcaster.subscribe("job-1"));

        broadcaster.publish(
            "job-1",
            envelope(
                1,
                ProgressEvent::Started {
                    total_steps: 1,
                    steps: vec!["only".to_string()],
                },
            ),
        );
        broadcaster.publish(
            "job-1",
            envelope(
                2,
                ProgressEvent::Completed {
                    total_time: 3,
                    progress: 100,
                    message: String::new(),
                    redirect_url: Some("/analyses/job-1".to_string()),
                },
            ),
        );

        let mut updates = 0;
        let before = tokio::time::Instant::now();
        let action = session.run_until_terminal(|_| updates += 1).await;

        assert_eq!(updates, 2);
        assert!(before.elapsed() >= Duration::from_secs(3));
        assert_eq!(
            action,
            Some(DeferredAction::Navigate {
                url: Some("/analyses/job-1".to_string()),
                after: Duration::from_secs(3),
            })
        );
        assert_eq!(session.state().phase(), Phase::Completed);
    }

    #[tokio::test]
    async fn test_error_has_no_deferred_action() {
        let broadcaster = InMemoryBroadcaster::default();
        let mut session = ClientSession::new(broadcaster.subscribe("job-1"));
        broadcaster.publish(
            "job-1",
            envelope(
                1,
                ProgressEvent::Error {
                    message: "boom".to_string(),
                    retryable: true,
                },
            ),
        );

        assert_eq!(session.run_until_terminal(|_| {}).await, None);
        assert!(session.state().retry_available());
    }

    #[tokio::test]
    async fn test_unsubscribe_is_local() {
        let broadcaster = InMemoryBroadcaster::default();
        let mut session = ClientSession::new(broadcaster.subscribe("job-1"));
        assert_eq!(broadcaster.subscriber_count("job-1"), 1);

        session.unsubscribe();
        assert!(!session.is_subscribed());
        assert_eq!(broadcaster.subscriber_count("job-1"), 0);
        assert_eq!(session.next_update().await, None);
    }
}
