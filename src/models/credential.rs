//! API 凭证
//!
//! 凭证本身不可变，计数器和冷却时间由 [`crate::infrastructure::CredentialPool`] 持有。

use std::fmt;
use std::sync::Arc;

/// 凭证标识（如 `key-1`），可以安全地写入日志
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CredentialId(String);

impl CredentialId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 一组 API 访问密钥
///
/// `Debug` 和 `Display` 只输出脱敏后的密钥。
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    id: CredentialId,
    secret: Arc<str>,
}

impl Credential {
    pub fn new(id: impl Into<String>, secret: impl Into<String>) -> Self {
        let secret: String = secret.into();
        Self {
            id: CredentialId::new(id),
            secret: Arc::from(secret),
        }
    }

    pub fn id(&self) -> &CredentialId {
        &self.id
    }

    /// 原始密钥，只能交给 provider 使用，不要写日志
    pub fn expose_secret(&self) -> &str {
        &self.secret
    }

    /// 脱敏后的密钥：前 10 个字符 + `...`
    pub fn redacted(&self) -> String {
        redact(&self.secret)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("secret", &self.redacted())
            .finish()
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.redacted())
    }
}

fn redact(secret: &str) -> String {
    let prefix: String = secret.chars().take(10).collect();
    if secret.chars().count() > 10 {
        format!("{}...", prefix)
    } else {
        // 短密钥只保留一半
        let keep = secret.chars().count() / 2;
        format!("{}...", secret.chars().take(keep).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_never_prints_full_secret() {
        let cred = Credential::new("key-1", "sk-abcdefghijklmnopqrstuvwxyz");
        let debug = format!("{:?}", cred);
        let display = format!("{}", cred);

        assert!(!debug.contains("sk-abcdefghijklmnopqrstuvwxyz"));
        assert!(!display.contains("sk-abcdefghijklmnopqrstuvwxyz"));
        assert!(display.contains("sk-abcdefg..."));
        assert!(display.starts_with("key-1"));
    }

    #[test]
    fn test_short_secret_is_redacted() {
        let cred = Credential::new("key-2", "short");
        assert_eq!(cred.redacted(), "sh...");
    }
}
