//! 凭证池 - 基础设施层
//!
//! 持有全部 API Key 及其计数器，是系统里唯一需要互斥的共享状态。
//!
//! ## 选择规则
//!
//! 1. 只考虑 `error_count < error_threshold` 且 `available_at <= now` 的 key
//! 2. 分数 = `usage_count`，1 秒内刚用过的 key 额外加 100 分
//! 3. 取分数最低的 key
//! 4. 一个都没有时执行 fail-open 重置（清空所有错误计数）再选一次；
//!    仍然没有（全部处于限流冷却中）就返回冷却最先结束的 key
//! 5. 重试取 key 时排除上一次的 key；如果只有被排除的 key 可用，
//!    不做重置，直接从其余 key 里取冷却最先结束的
//!
//! 选择和更新都在同一把锁里完成，锁内不做任何网络调用。

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::PoolError;
use crate::models::{Credential, CredentialId};

/// 凭证池参数
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// 错误次数达到该值后 key 被停用，直到重置
    pub error_threshold: u32,
    /// 最近使用判定窗口
    pub recency_window: Duration,
    /// 最近使用过的 key 的额外分数
    pub recency_penalty: u64,
    /// provider 没有给出等待时间时的默认限流冷却
    pub default_rate_limit_wait: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            error_threshold: 5,
            recency_window: Duration::from_secs(1),
            recency_penalty: 100,
            default_rate_limit_wait: Duration::from_secs(20),
        }
    }
}

#[derive(Debug)]
struct KeySlot {
    credential: Credential,
    usage_count: u64,
    error_count: u32,
    available_at: Instant,
    last_used: Option<Instant>,
}

impl KeySlot {
    fn new(credential: Credential, now: Instant) -> Self {
        Self {
            credential,
            usage_count: 0,
            error_count: 0,
            available_at: now,
            last_used: None,
        }
    }

    fn score(&self, now: Instant, settings: &PoolSettings) -> u64 {
        let recently_used = self
            .last_used
            .map(|t| now.saturating_duration_since(t) < settings.recency_window)
            .unwrap_or(false);
        if recently_used {
            self.usage_count + settings.recency_penalty
        } else {
            self.usage_count
        }
    }

    fn is_eligible(&self, now: Instant, settings: &PoolSettings) -> bool {
        self.error_count < settings.error_threshold && self.available_at <= now
    }
}

/// 单个 key 的统计快照
#[derive(Debug, Clone, Serialize)]
pub struct KeyStats {
    pub id: String,
    pub usage_count: u64,
    pub error_count: u32,
    /// 剩余冷却时间
    pub cooldown: Option<Duration>,
}

/// 凭证池统计
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total_keys: usize,
    pub keys: Vec<KeyStats>,
}

/// 凭证池
///
/// 显式构造后以 `Arc<CredentialPool>` 注入编排层，每个测试都可以拥有独立的池。
#[derive(Debug)]
pub struct CredentialPool {
    slots: Mutex<Vec<KeySlot>>,
    settings: PoolSettings,
}

impl CredentialPool {
    pub fn new(credentials: Vec<Credential>, settings: PoolSettings) -> Result<Self, PoolError> {
        if credentials.is_empty() {
            return Err(PoolError::NoCredentials);
        }

        let now = Instant::now();
        let slots: Vec<KeySlot> = credentials
            .into_iter()
            .map(|c| KeySlot::new(c, now))
            .collect();

        info!("凭证池初始化完成，共 {} 个 API Key", slots.len());

        Ok(Self {
            slots: Mutex::new(slots),
            settings,
        })
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// 获取一个 key，永不阻塞，永不返回空
    pub fn acquire(&self) -> Credential {
        let mut slots = self.lock();
        let now = Instant::now();
        let idx = self.select_with_fallback(&mut slots, now, &[]);
        Self::mark_used(&mut slots[idx], now)
    }

    /// 获取一个与 `exclude` 不同的 key
    ///
    /// 池中只有一个 key 时无法避开，只能返回它。
    pub fn acquire_excluding(&self, exclude: &CredentialId) -> Credential {
        let mut slots = self.lock();
        let now = Instant::now();
        let excluded = if slots.len() > 1 {
            vec![exclude.clone()]
        } else {
            Vec::new()
        };
        let idx = self.select_with_fallback(&mut slots, now, &excluded);
        Self::mark_used(&mut slots[idx], now)
    }

    /// 获取最多 `count` 个互不相同的 key，用于并行分发
    ///
    /// 第一个 key 按 [`acquire`](Self::acquire) 的规则获取；
    /// 其余只从当前可用的 key 中选，不够就少返回。
    pub fn acquire_many(&self, count: usize) -> Vec<Credential> {
        let mut leased = Vec::with_capacity(count);
        if count == 0 {
            return leased;
        }

        let mut slots = self.lock();
        let now = Instant::now();
        let mut taken: Vec<CredentialId> = Vec::with_capacity(count);

        let first = self.select_with_fallback(&mut slots, now, &taken);
        taken.push(slots[first].credential.id().clone());
        leased.push(Self::mark_used(&mut slots[first], now));

        while leased.len() < count {
            match self.select_eligible(&slots, now, &taken) {
                Some(idx) => {
                    taken.push(slots[idx].credential.id().clone());
                    leased.push(Self::mark_used(&mut slots[idx], now));
                }
                None => break,
            }
        }

        debug!("批量获取 {} 个 key（请求 {} 个）", leased.len(), count);
        leased
    }

    /// 调用成功，清零错误计数
    pub fn report_success(&self, credential: &Credential) {
        let mut slots = self.lock();
        if let Some(slot) = Self::find_mut(&mut slots, credential.id()) {
            slot.error_count = 0;
        }
    }

    /// 调用失败，错误计数加一
    pub fn report_failure(&self, credential: &Credential, reason: &str) {
        let mut slots = self.lock();
        let threshold = self.settings.error_threshold;
        if let Some(slot) = Self::find_mut(&mut slots, credential.id()) {
            slot.error_count += 1;
            warn!("API Key 错误: {} - {}", credential, reason);

            if slot.error_count == threshold {
                error!(
                    "API Key 连续失败 {} 次，暂时停用: {}",
                    threshold, credential
                );
            }
        }
    }

    /// 限流冷却：`wait` 之内不会被 `acquire` 选中
    pub fn quarantine(&self, credential: &Credential, wait: Duration) {
        let mut slots = self.lock();
        if let Some(slot) = Self::find_mut(&mut slots, credential.id()) {
            slot.available_at = Instant::now() + wait;
            info!(
                "API Key 触发限流: {}，冷却 {:.1} 秒",
                credential,
                wait.as_secs_f64()
            );
        }
    }

    /// 剩余冷却时间，没有冷却时返回 `None`
    pub fn cooldown_remaining(&self, id: &CredentialId) -> Option<Duration> {
        let slots = self.lock();
        let now = Instant::now();
        slots
            .iter()
            .find(|s| s.credential.id() == id)
            .and_then(|s| {
                let left = s.available_at.saturating_duration_since(now);
                (!left.is_zero()).then_some(left)
            })
    }

    /// 清空所有错误计数
    pub fn reset(&self) {
        let mut slots = self.lock();
        Self::reset_locked(&mut slots);
    }

    pub fn stats(&self) -> PoolStats {
        let slots = self.lock();
        let now = Instant::now();
        PoolStats {
            total_keys: slots.len(),
            keys: slots
                .iter()
                .map(|s| {
                    let left = s.available_at.saturating_duration_since(now);
                    KeyStats {
                        id: s.credential.id().to_string(),
                        usage_count: s.usage_count,
                        error_count: s.error_count,
                        cooldown: (!left.is_zero()).then_some(left),
                    }
                })
                .collect(),
        }
    }

    // ========== 内部实现 ==========

    fn lock(&self) -> MutexGuard<'_, Vec<KeySlot>> {
        // 锁内没有会 panic 的逻辑，中毒时直接取回数据
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn find_mut<'a>(slots: &'a mut [KeySlot], id: &CredentialId) -> Option<&'a mut KeySlot> {
        slots.iter_mut().find(|s| s.credential.id() == id)
    }

    fn select_eligible(
        &self,
        slots: &[KeySlot],
        now: Instant,
        exclude: &[CredentialId],
    ) -> Option<usize> {
        slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !exclude.contains(s.credential.id()))
            .filter(|(_, s)| s.is_eligible(now, &self.settings))
            .min_by_key(|(_, s)| s.score(now, &self.settings))
            .map(|(idx, _)| idx)
    }

    /// 不看资格，优先未超错误阈值的，再按冷却结束时间和分数选
    fn select_soonest(
        &self,
        slots: &[KeySlot],
        now: Instant,
        exclude: &[CredentialId],
    ) -> Option<usize> {
        let threshold = self.settings.error_threshold;
        slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !exclude.contains(s.credential.id()))
            .min_by_key(|(_, s)| {
                (
                    s.error_count >= threshold,
                    s.available_at,
                    s.score(now, &self.settings),
                )
            })
            .map(|(idx, _)| idx)
    }

    fn select_with_fallback(
        &self,
        slots: &mut [KeySlot],
        now: Instant,
        exclude: &[CredentialId],
    ) -> usize {
        if let Some(idx) = self.select_eligible(slots, now, exclude) {
            return idx;
        }

        // 唯一可用的 key 被排除了：不重置计数，从其余 key 里退而求其次
        if !exclude.is_empty() && self.select_eligible(slots, now, &[]).is_some() {
            if let Some(idx) = self.select_soonest(slots, now, exclude) {
                warn!(
                    "除被排除的 key 外没有可用的 API Key，改用: {}",
                    slots[idx].credential
                );
                return idx;
            }
        }

        Self::reset_locked(slots);
        if let Some(idx) = self.select_eligible(slots, now, exclude) {
            return idx;
        }

        // 全部在冷却中：取冷却最先结束的
        match self.select_soonest(slots, now, exclude) {
            Some(idx) => {
                warn!(
                    "所有 API Key 都在冷却中，选择最早可用的: {}",
                    slots[idx].credential
                );
                idx
            }
            // exclude 覆盖了全部 key，只有调用方传错时才会发生
            None => 0,
        }
    }

    fn reset_locked(slots: &mut [KeySlot]) {
        for slot in slots.iter_mut() {
            slot.error_count = 0;
        }
        info!("所有 API Key 的错误计数已重置");
    }

    fn mark_used(slot: &mut KeySlot, now: Instant) -> Credential {
        slot.usage_count += 1;
        slot.last_used = Some(now);
        if slot.available_at < now {
            slot.available_at = now;
        }
        slot.credential.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> CredentialPool {
        let creds = (1..=n)
            .map(|i| Credential::new(format!("key-{}", i), format!("sk-test-secret-{:04}", i)))
            .collect();
        CredentialPool::new(creds, PoolSettings::default()).unwrap()
    }

    fn stats_for(pool: &CredentialPool, id: &str) -> KeyStats {
        pool.stats().keys.into_iter().find(|k| k.id == id).unwrap()
    }

    #[test]
    fn test_empty_pool_is_rejected() {
        let err = CredentialPool::new(vec![], PoolSettings::default()).unwrap_err();
        assert_eq!(err, PoolError::NoCredentials);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_balances_by_usage() {
        let pool = pool(3);
        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire();

        let mut ids = vec![a.id().clone(), b.id().clone(), c.id().clone()];
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);

        for key in pool.stats().keys {
            assert_eq!(key.usage_count, 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recency_penalty_prefers_idle_key() {
        let pool = pool(2);
        // 各用一次，过了 1 秒后两者分数相同
        let first = pool.acquire();
        let _ = pool.acquire();
        tokio::time::advance(Duration::from_secs(2)).await;
        let again = pool.acquire();
        assert_eq!(again.id(), first.id());
        let second = pool.acquire();
        assert_ne!(second.id(), first.id());

        // 现在两个 key 都在 1 秒窗口内，按使用次数选
        let third = pool.acquire();
        assert_eq!(stats_for(&pool, third.id().as_str()).usage_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_key_is_skipped_until_reset() {
        let pool = pool(2);
        let bad = Credential::new("key-1", "sk-test-secret-0001");
        for _ in 0..5 {
            pool.report_failure(&bad, "timeout");
        }

        for _ in 0..10 {
            assert_eq!(pool.acquire().id().as_str(), "key-2");
        }
        assert_eq!(stats_for(&pool, "key-1").error_count, 5);

        pool.reset();
        assert_eq!(stats_for(&pool, "key-1").error_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_error_count() {
        let pool = pool(1);
        let cred = pool.acquire();
        pool.report_failure(&cred, "500");
        pool.report_failure(&cred, "500");
        assert_eq!(stats_for(&pool, "key-1").error_count, 2);

        pool.report_success(&cred);
        assert_eq!(stats_for(&pool, "key-1").error_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_open_reset_when_all_keys_exhausted() {
        let pool = pool(2);
        for id in ["key-1", "key-2"] {
            let cred = Credential::new(id, "x");
            for _ in 0..5 {
                pool.report_failure(&cred, "boom");
            }
        }

        let cred = pool.acquire();
        assert_eq!(stats_for(&pool, cred.id().as_str()).error_count, 0);
        for key in pool.stats().keys {
            assert_eq!(key.error_count, 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_quarantined_key_is_not_returned() {
        let pool = pool(2);
        let a = Credential::new("key-1", "x");
        pool.quarantine(&a, Duration::from_secs(5));
        assert!(pool.cooldown_remaining(a.id()).is_some());

        for _ in 0..5 {
            assert_eq!(pool.acquire().id().as_str(), "key-2");
        }

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(pool.cooldown_remaining(a.id()).is_none());
        assert_eq!(pool.acquire().id().as_str(), "key-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_quarantined_returns_soonest_available() {
        let pool = pool(2);
        pool.quarantine(&Credential::new("key-1", "x"), Duration::from_secs(30));
        pool.quarantine(&Credential::new("key-2", "x"), Duration::from_secs(5));

        let cred = pool.acquire();
        assert_eq!(cred.id().as_str(), "key-2");
        // 冷却时间不会因为被取走而被覆盖
        let left = pool.cooldown_remaining(cred.id()).unwrap();
        assert!(left <= Duration::from_secs(5) && left > Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_excluding_never_returns_excluded() {
        let pool = pool(3);
        let excluded = CredentialId::new("key-1");
        for _ in 0..20 {
            assert_ne!(pool.acquire_excluding(&excluded).id(), &excluded);
        }

        // 其他 key 全部冷却，仍然不返回被排除的 key
        pool.quarantine(&Credential::new("key-2", "x"), Duration::from_secs(10));
        pool.quarantine(&Credential::new("key-3", "x"), Duration::from_secs(10));
        assert_ne!(pool.acquire_excluding(&excluded).id(), &excluded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_excluding_only_healthy_key_keeps_error_counts() {
        let pool = pool(3);
        pool.report_failure(&Credential::new("key-1", "x"), "500");
        for id in ["key-2", "key-3"] {
            let cred = Credential::new(id, "x");
            for _ in 0..5 {
                pool.report_failure(&cred, "500");
            }
        }

        let retry = pool.acquire_excluding(&CredentialId::new("key-1"));

        assert_ne!(retry.id().as_str(), "key-1");
        let errors: Vec<u32> = pool.stats().keys.iter().map(|k| k.error_count).collect();
        assert_eq!(errors, vec![1, 5, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_excluding_single_key_pool() {
        let pool = pool(1);
        let only = CredentialId::new("key-1");
        assert_eq!(pool.acquire_excluding(&only).id(), &only);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_many_is_deduplicated() {
        let pool = pool(3);
        let keys = pool.acquire_many(5);
        assert_eq!(keys.len(), 3);

        let mut ids: Vec<_> = keys.iter().map(|k| k.id().clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);

        assert!(pool.acquire_many(0).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_many_returns_fewer_when_keys_unavailable() {
        let pool = pool(3);
        pool.quarantine(&Credential::new("key-3", "x"), Duration::from_secs(10));
        let keys = pool.acquire_many(3);
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| k.id().as_str() != "key-3"));
    }
}
