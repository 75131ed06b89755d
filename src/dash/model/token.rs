//! OAuth Token 状态与授权端点的请求/响应模型

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Token 提前失效的时间窗（毫秒），提前 1 分钟视为过期
pub const EXPIRY_SKEW_MS: i64 = 60_000;

/// 授权端点未返回 expires_in 时采用的有效期（秒）
pub const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// 当前时间（Unix 毫秒）
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Token 状态
///
/// 只在授权端点成功响应后被修改，每次修改后立即持久化
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenState {
    /// 用户访问令牌
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    /// 刷新令牌
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// 访问令牌过期时间（Unix 毫秒）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,

    /// Partner Token（client_credentials 授权，仅用于区域注册）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partner_token: Option<String>,

    /// Partner Token 过期时间（Unix 毫秒）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partner_token_expires_at: Option<i64>,
}

impl TokenState {
    /// 访问令牌是否已过期（没有令牌或没有过期时间都视为过期）
    pub fn is_expired(&self, now: i64) -> bool {
        if self.access_token.as_deref().is_none_or(str::is_empty) {
            return true;
        }
        match self.expires_at {
            Some(expires_at) => now >= expires_at - EXPIRY_SKEW_MS,
            None => true,
        }
    }

    /// 仍在有效期内的访问令牌
    pub fn usable_access_token(&self, now: i64) -> Option<&str> {
        if self.is_expired(now) {
            None
        } else {
            self.access_token.as_deref()
        }
    }

    /// 仍在有效期内的 Partner Token
    pub fn cached_partner_token(&self, now: i64) -> Option<&str> {
        let token = self.partner_token.as_deref().filter(|t| !t.is_empty())?;
        let expires_at = self.partner_token_expires_at?;
        (now < expires_at - EXPIRY_SKEW_MS).then_some(token)
    }

    /// 写入授权码交换或刷新得到的用户令牌
    ///
    /// 响应未携带新的 refresh_token 时保留旧值
    pub fn apply_user_grant(&mut self, grant: TokenResponse, now: i64) {
        self.expires_at = Some(now + grant.expires_in_ms());
        let TokenResponse {
            access_token,
            refresh_token,
            ..
        } = grant;
        self.access_token = Some(access_token);
        if let Some(refresh_token) = refresh_token.filter(|t| !t.is_empty()) {
            self.refresh_token = Some(refresh_token);
        }
    }

    /// 写入 client_credentials 授权得到的 Partner Token
    pub fn apply_partner_grant(&mut self, grant: TokenResponse, now: i64) {
        self.partner_token_expires_at = Some(now + grant.expires_in_ms());
        self.partner_token = Some(grant.access_token);
    }
}

impl fmt::Debug for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenState")
            .field("access_token", &self.access_token.as_deref().map(redact))
            .field("refresh_token", &self.refresh_token.as_deref().map(redact))
            .field("expires_at", &self.expires_at)
            .field("partner_token", &self.partner_token.as_deref().map(redact))
            .field("partner_token_expires_at", &self.partner_token_expires_at)
            .finish()
    }
}

/// 日志中只保留令牌前 6 位
pub fn redact(secret: &str) -> String {
    let prefix: String = secret.chars().take(6).collect();
    format!("{}***", prefix)
}

/// 授权端点响应
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// 有效期（秒）
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl TokenResponse {
    fn expires_in_ms(&self) -> i64 {
        self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS) * 1000
    }
}

/// 授权端点错误响应
#[derive(Debug, Default, Deserialize)]
pub struct TokenErrorResponse {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// authorization_code 授权请求
#[derive(Serialize)]
pub struct AuthorizationCodeGrant<'a> {
    pub grant_type: &'static str,
    pub client_id: &'a str,
    pub client_secret: &'a str,
    pub code: &'a str,
    pub redirect_uri: &'a str,
    pub audience: &'a str,
}

/// refresh_token 授权请求
#[derive(Serialize)]
pub struct RefreshGrant<'a> {
    pub grant_type: &'static str,
    pub client_id: &'a str,
    pub client_secret: &'a str,
    pub refresh_token: &'a str,
}

/// client_credentials 授权请求
#[derive(Serialize)]
pub struct ClientCredentialsGrant<'a> {
    pub grant_type: &'static str,
    pub client_id: &'a str,
    pub client_secret: &'a str,
    pub audience: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_expiry(expires_at: Option<i64>) -> TokenState {
        TokenState {
            access_token: Some("T".to_string()),
            expires_at,
            ..Default::default()
        }
    }

    #[test]
    fn test_is_expired_without_expiry() {
        assert!(with_expiry(None).is_expired(0));
        assert!(TokenState::default().is_expired(0));
    }

    #[test]
    fn test_is_expired_boundary() {
        let expires_at = 1_000_000;
        let state = with_expiry(Some(expires_at));
        // 在 expires_at - 60000 前一毫秒仍可用，之后一律过期
        assert!(!state.is_expired(expires_at - EXPIRY_SKEW_MS - 1));
        assert!(state.is_expired(expires_at - EXPIRY_SKEW_MS));
        assert!(state.is_expired(expires_at));
        assert!(state.is_expired(expires_at + 1));
    }

    #[test]
    fn test_is_expired_matches_definition_over_range() {
        let expires_at = 10_000_000;
        let state = with_expiry(Some(expires_at));
        for now in (expires_at - 200_000..expires_at + 50_000).step_by(997) {
            assert_eq!(state.is_expired(now), now >= expires_at - EXPIRY_SKEW_MS);
        }
    }

    #[test]
    fn test_is_expired_empty_access_token() {
        let mut state = with_expiry(Some(i64::MAX));
        state.access_token = Some(String::new());
        assert!(state.is_expired(0));
    }

    #[test]
    fn test_apply_user_grant_keeps_old_refresh_token() {
        let mut state = TokenState {
            refresh_token: Some("old-refresh".to_string()),
            ..Default::default()
        };
        state.apply_user_grant(
            TokenResponse {
                access_token: "new-access".to_string(),
                refresh_token: None,
                expires_in: Some(28800),
            },
            1_000,
        );
        assert_eq!(state.access_token.as_deref(), Some("new-access"));
        assert_eq!(state.refresh_token.as_deref(), Some("old-refresh"));
        assert_eq!(state.expires_at, Some(1_000 + 28_800_000));
    }

    #[test]
    fn test_apply_user_grant_rotates_refresh_token() {
        let mut state = TokenState {
            refresh_token: Some("old-refresh".to_string()),
            ..Default::default()
        };
        state.apply_user_grant(
            TokenResponse {
                access_token: "A2".to_string(),
                refresh_token: Some("R2".to_string()),
                expires_in: None,
            },
            0,
        );
        assert_eq!(state.access_token.as_deref(), Some("A2"));
        assert_eq!(state.refresh_token.as_deref(), Some("R2"));
        assert_eq!(state.expires_at, Some(3_600_000));
    }

    #[test]
    fn test_cached_partner_token_respects_skew() {
        let mut state = TokenState::default();
        state.apply_partner_grant(
            TokenResponse {
                access_token: "P".to_string(),
                refresh_token: None,
                expires_in: Some(120),
            },
            0,
        );
        assert_eq!(state.cached_partner_token(59_999), Some("P"));
        assert_eq!(state.cached_partner_token(60_000), None);
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let state = TokenState {
            access_token: Some("secret-access-token".to_string()),
            ..Default::default()
        };
        let rendered = format!("{:?}", state);
        assert!(!rendered.contains("secret-access-token"));
        assert!(rendered.contains("secret***"));
    }
}
