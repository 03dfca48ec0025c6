//! 进度广播 - 业务能力层
//!
//! 每个 job 一个 topic（`progress.<job_id>`），fire-and-forget 投递给当前所有订阅者。
//!
//! 约定：
//! - 不做缓冲重放：订阅之前发布的事件不会补发
//! - 同一个 topic 内按发布顺序投递；不同 topic 之间没有顺序保证
//! - 发布永不阻塞：慢订阅者会丢失事件（`Lagged`），不会拖慢工作协程
//! - 终止事件发布后 topic 被移除，订阅者读完缓冲区后收到流结束
//! - 没有订阅者的 topic 在发布时或最后一个订阅者丢弃时移除

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::models::EventEnvelope;

/// 默认的 topic 缓冲容量
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// topic 命名
pub fn topic_name(job_id: &str) -> String {
    format!("progress.{}", job_id)
}

/// 广播能力
pub trait Broadcaster: Send + Sync {
    /// 发布一条事件；没有订阅者时直接丢弃
    fn publish(&self, job_id: &str, envelope: EventEnvelope);
}

type Topics = Mutex<HashMap<String, broadcast::Sender<EventEnvelope>>>;

fn lock_topics(topics: &Topics) -> MutexGuard<'_, HashMap<String, broadcast::Sender<EventEnvelope>>> {
    topics.lock().unwrap_or_else(|e| e.into_inner())
}

/// 基于 `tokio::sync::broadcast` 的进程内广播
pub struct InMemoryBroadcaster {
    topics: Arc<Topics>,
    capacity: usize,
}

impl InMemoryBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// 订阅某个 job 的事件
    pub fn subscribe(&self, job_id: &str) -> Subscription {
        let topic = topic_name(job_id);
        let mut topics = lock_topics(&self.topics);
        let receiver = topics
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        debug!("订阅 topic: {}", topic);

        Subscription {
            job_id: job_id.to_string(),
            topic,
            receiver,
            topics: Arc::downgrade(&self.topics),
        }
    }

    /// 当前订阅者数量
    pub fn subscriber_count(&self, job_id: &str) -> usize {
        lock_topics(&self.topics)
            .get(&topic_name(job_id))
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// 当前存活的 topic 数量
    pub fn topic_count(&self) -> usize {
        lock_topics(&self.topics).len()
    }
}

impl Default for InMemoryBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl Broadcaster for InMemoryBroadcaster {
    fn publish(&self, job_id: &str, envelope: EventEnvelope) {
        let topic = topic_name(job_id);
        let terminal = envelope.event.is_terminal();
        let mut topics = lock_topics(&self.topics);

        let delivered = match topics.get(&topic) {
            Some(sender) => sender.send(envelope).is_ok(),
            None => false,
        };
        if !delivered {
            debug!("topic {} 没有订阅者，事件被丢弃", topic);
        }

        if terminal || !delivered {
            topics.remove(&topic);
        }
    }
}

/// 一个订阅
///
/// 丢弃即取消订阅，对服务端的 job 没有任何影响。
pub struct Subscription {
    job_id: String,
    topic: String,
    receiver: broadcast::Receiver<EventEnvelope>,
    topics: Weak<Topics>,
}

impl Subscription {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// 接收下一条事件；topic 关闭后返回 `None`
    ///
    /// 落后太多时跳过丢失的事件继续接收。
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, topic = %self.topic, "订阅者处理过慢，跳过 {} 条事件", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(topics) = self.topics.upgrade() else {
            return;
        };
        let mut topics = lock_topics(&topics);
        // 自己的 receiver 还没释放，计数里包含自己
        let last = topics
            .get(&self.topic)
            .is_some_and(|sender| sender.receiver_count() <= 1);
        if last {
            topics.remove(&self.topic);
            debug!("最后一个订阅者离开，移除 topic: {}", self.topic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProgressEvent;

    fn started(job_id: &str, seq: u64) -> EventEnvelope {
        EventEnvelope::new(
            job_id,
            seq,
            ProgressEvent::Started {
                total_steps: 1,
                steps: vec![],
            },
        )
    }

    fn completed(job_id: &str, seq: u64) -> EventEnvelope {
        EventEnvelope::new(
            job_id,
            seq,
            ProgressEvent::Completed {
                total_time: 1,
                progress: 100,
                message: String::new(),
                redirect_url: None,
            },
        )
    }

    #[test]
    fn test_topic_name() {
        assert_eq!(topic_name("42"), "progress.42");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let broadcaster = InMemoryBroadcaster::default();
        broadcaster.publish("job-1", started("job-1", 1));

        // 之后才订阅的不会收到之前的事件
        let mut sub = broadcaster.subscribe("job-1");
        broadcaster.publish("job-1", completed("job-1", 2));
        let received = sub.recv().await.unwrap();
        assert_eq!(received.seq, 2);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let broadcaster = InMemoryBroadcaster::default();
        let mut first = broadcaster.subscribe("job-1");
        let mut second = broadcaster.subscribe("job-1");
        assert_eq!(broadcaster.subscriber_count("job-1"), 2);

        broadcaster.publish("job-1", started("job-1", 1));
        broadcaster.publish("job-1", completed("job-1", 2));

        for sub in [&mut first, &mut second] {
            assert_eq!(sub.recv().await.unwrap().seq, 1);
            assert_eq!(sub.recv().await.unwrap().seq, 2);
            assert!(sub.recv().await.is_none());
        }
        assert_eq!(broadcaster.subscriber_count("job-1"), 0);
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let broadcaster = InMemoryBroadcaster::default();
        let mut a = broadcaster.subscribe("a");
        let _b = broadcaster.subscribe("b");

        broadcaster.publish("b", completed("b", 1));
        broadcaster.publish("a", completed("a", 1));

        let received = a.recv().await.unwrap();
        assert_eq!(received.job_id, "a");
    }

    #[tokio::test]
    async fn test_slow_subscriber_never_blocks_publisher() {
        let broadcaster = InMemoryBroadcaster::new(2);
        let mut sub = broadcaster.subscribe("job-1");

        for seq in 1..=10 {
            broadcaster.publish("job-1", started("job-1", seq));
        }

        // 只剩最后 2 条
        assert_eq!(sub.recv().await.unwrap().seq, 9);
        assert_eq!(sub.recv().await.unwrap().seq, 10);
    }

    #[tokio::test]
    async fn test_abandoned_topics_are_removed() {
        let broadcaster = InMemoryBroadcaster::default();

        // 订阅了但 job 从未运行
        let ghost = broadcaster.subscribe("never-runs");
        assert_eq!(broadcaster.topic_count(), 1);
        drop(ghost);
        assert_eq!(broadcaster.topic_count(), 0);

        // 终止事件之后才订阅
        broadcaster.publish("done", completed("done", 1));
        let late = broadcaster.subscribe("done");
        let other = broadcaster.subscribe("done");
        drop(late);
        assert_eq!(broadcaster.topic_count(), 1);
        drop(other);
        assert_eq!(broadcaster.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_to_deserted_topic_removes_it() {
        let broadcaster = InMemoryBroadcaster::default();
        // 订阅者已经不在但 topic 仍残留
        let (sender, receiver) = broadcast::channel(4);
        drop(receiver);
        lock_topics(&broadcaster.topics).insert(topic_name("job-2"), sender);
        assert_eq!(broadcaster.topic_count(), 1);

        broadcaster.publish("job-2", started("job-2", 1));
        assert_eq!(broadcaster.topic_count(), 0);
    }
}
