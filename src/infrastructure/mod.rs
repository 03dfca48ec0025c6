//! 基础设施层：持有稀缺资源（API Key），只暴露获取/归还能力

pub mod credential_pool;

pub use credential_pool::{CredentialPool, KeyStats, PoolSettings, PoolStats};
