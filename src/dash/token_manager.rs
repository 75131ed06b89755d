//! Token 管理模块
//!
//! 负责 OAuth 授权码交换、Token 过期检测与刷新、Partner Token 获取，
//! 以及授权流程中 CSRF state 的签发与一次性校验

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use rand::distributions::Alphanumeric;
use reqwest::Client;
use serde::Serialize;
use subtle::ConstantTimeEq;
use tokio::sync::Mutex as TokioMutex;
use url::Url;

use crate::dash::db::Database;
use crate::dash::error::DashError;
use crate::dash::model::record::DashRecord;
use crate::dash::model::token::{
    AuthorizationCodeGrant, ClientCredentialsGrant, RefreshGrant, TokenErrorResponse,
    TokenResponse, TokenState, now_ms, redact,
};

/// 授权请求的 scope
pub const OAUTH_SCOPE: &str = "openid offline_access vehicle_device_data vehicle_cmds";

/// CSRF state 长度
const STATE_LENGTH: usize = 32;

/// 已签发 state 的有效期
const STATE_TTL: Duration = Duration::from_secs(600);

/// OAuth 流程阶段
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "phase", content = "message")]
pub enum OAuthPhase {
    Idle,
    /// 已生成授权地址，等待浏览器跳转
    AwaitingRedirect,
    /// 收到回调，正在校验 state
    AwaitingCallback,
    ExchangingCode,
    Authenticated,
    Failed(String),
}

/// 已签发、尚未使用的 state
struct PendingState {
    value: String,
    issued_at: Instant,
}

/// Token 管理器
///
/// Token 状态只存在于持久化记录中，每次操作开始时重新读取
pub struct TokenManager {
    db: Arc<Database>,
    client: Client,
    auth_base: String,
    /// authorization_code / client_credentials 的 audience（Fleet API 地址）
    audience: String,
    pending_state: Mutex<Option<PendingState>>,
    phase: Mutex<OAuthPhase>,
    /// Token 刷新锁，确保同一时间只有一个刷新操作
    refresh_lock: TokioMutex<()>,
}

impl TokenManager {
    pub fn new(
        db: Arc<Database>,
        client: Client,
        auth_base: impl Into<String>,
        audience: impl Into<String>,
    ) -> Self {
        Self {
            db,
            client,
            auth_base: auth_base.into().trim_end_matches('/').to_string(),
            audience: audience.into(),
            pending_state: Mutex::new(None),
            phase: Mutex::new(OAuthPhase::Idle),
            refresh_lock: TokioMutex::new(()),
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn phase(&self) -> OAuthPhase {
        self.phase.lock().clone()
    }

    fn set_phase(&self, phase: OAuthPhase) {
        tracing::debug!("OAuth 阶段: {:?}", phase);
        *self.phase.lock() = phase;
    }

    fn token_url(&self) -> String {
        format!("{}/oauth2/v3/token", self.auth_base)
    }

    /// 读取当前 Token 状态
    pub fn token_state(&self) -> Result<TokenState, DashError> {
        Ok(self.db.load_record()?.token)
    }

    /// 生成授权地址并签发新的 state
    ///
    /// 之前未使用的 state 会被替换
    pub fn begin_authorization(&self) -> Result<String, DashError> {
        let record = self.db.load_record()?;
        let client_id = record.credentials.client_id.trim();
        if client_id.is_empty() {
            return Err(DashError::NotConfigured("clientId".to_string()));
        }
        let redirect_uri = record
            .redirect_uri()
            .ok_or_else(|| DashError::NotConfigured("redirectUri".to_string()))?;

        let state = generate_state();
        let url = Url::parse_with_params(
            &format!("{}/oauth2/v3/authorize", self.auth_base),
            &[
                ("client_id", client_id),
                ("redirect_uri", redirect_uri),
                ("response_type", "code"),
                ("scope", OAUTH_SCOPE),
                ("state", state.as_str()),
            ],
        )
        .map_err(|e| DashError::NotConfigured(format!("authBase 无效: {}", e)))?;

        self.store_state(state);
        self.set_phase(OAuthPhase::AwaitingRedirect);
        tracing::info!("准备跳转到授权页面: {}", self.auth_base);
        Ok(url.into())
    }

    fn store_state(&self, value: String) {
        *self.pending_state.lock() = Some(PendingState {
            value,
            issued_at: Instant::now(),
        });
    }

    /// 校验回调中的 state
    ///
    /// 无论是否匹配，已签发的 state 都会被立即清除
    pub fn validate_state(&self, received: &str) -> Result<(), DashError> {
        let pending = self.pending_state.lock().take();
        let Some(pending) = pending else {
            tracing::warn!("没有待验证的 state");
            return Err(DashError::StateMismatch);
        };

        if pending.issued_at.elapsed() > STATE_TTL {
            tracing::warn!("state 已过期");
            return Err(DashError::StateMismatch);
        }

        let matched: bool = pending
            .value
            .as_bytes()
            .ct_eq(received.as_bytes())
            .into();
        if !matched {
            tracing::warn!("State 验证失败");
            return Err(DashError::StateMismatch);
        }
        Ok(())
    }

    /// 处理授权回调
    ///
    /// 没有 code/state 也没有 error 时不是回调，返回 `Ok(None)`
    pub async fn handle_callback(
        &self,
        code: Option<&str>,
        state: Option<&str>,
        error: Option<&str>,
    ) -> Result<Option<TokenState>, DashError> {
        if let Some(error) = error {
            self.pending_state.lock().take();
            tracing::error!("OAuth 授权错误: {}", error);
            self.set_phase(OAuthPhase::Failed(error.to_string()));
            return Err(DashError::AuthorizationDenied(error.to_string()));
        }

        let (Some(code), Some(state)) = (code, state) else {
            return Ok(None);
        };

        self.set_phase(OAuthPhase::AwaitingCallback);
        if let Err(e) = self.validate_state(state) {
            self.set_phase(OAuthPhase::Failed(e.to_string()));
            return Err(e);
        }

        self.set_phase(OAuthPhase::ExchangingCode);
        match self.exchange_authorization_code(code).await {
            Ok(token) => {
                self.set_phase(OAuthPhase::Authenticated);
                Ok(Some(token))
            }
            Err(e) => {
                self.set_phase(OAuthPhase::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// 用授权码换取 Token 并持久化
    pub async fn exchange_authorization_code(&self, code: &str) -> Result<TokenState, DashError> {
        let record = self.db.load_record()?;
        ensure_credentials(&record)?;
        let redirect_uri = record
            .redirect_uri()
            .ok_or_else(|| DashError::NotConfigured("redirectUri".to_string()))?;

        tracing::info!("正在用授权码交换 Token...");
        let grant = self
            .post_token(&AuthorizationCodeGrant {
                grant_type: "authorization_code",
                client_id: record.credentials.client_id.trim(),
                client_secret: record.credentials.client_secret.trim(),
                code,
                redirect_uri,
                audience: &self.audience,
            })
            .await?;

        let now = now_ms();
        let token = self.db.update_record(|record| {
            record.token.apply_user_grant(grant, now);
            record.token.clone()
        })?;
        tracing::info!(
            "Token 获取成功: {}",
            token.access_token.as_deref().map(redact).unwrap_or_default()
        );
        Ok(token)
    }

    /// 刷新访问令牌
    ///
    /// 使用双重检查锁定：获取锁后重新读取记录，
    /// 如果 Token 已经不是 `observed` 且仍然有效，说明其他调用已完成刷新。
    /// 失败时保留原有 Token
    pub async fn refresh_access_token(
        &self,
        observed: Option<&str>,
    ) -> Result<TokenState, DashError> {
        let _guard = self.refresh_lock.lock().await;

        let record = self.db.load_record()?;
        let now = now_ms();
        if !record.token.is_expired(now) && record.token.access_token.as_deref() != observed {
            tracing::debug!("Token 已被其他请求刷新，跳过刷新");
            return Ok(record.token);
        }

        ensure_credentials(&record)?;
        let refresh_token = record
            .token
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| DashError::InvalidGrant("缺少 refreshToken".to_string()))?;

        tracing::info!("正在刷新 Token...");
        let grant = self
            .post_token(&RefreshGrant {
                grant_type: "refresh_token",
                client_id: record.credentials.client_id.trim(),
                client_secret: record.credentials.client_secret.trim(),
                refresh_token,
            })
            .await
            .inspect_err(|e| tracing::error!("Token 刷新失败: {}", e))?;

        let now = now_ms();
        let token = self.db.update_record(|record| {
            record.token.apply_user_grant(grant, now);
            record.token.clone()
        })?;
        tracing::info!("Token 刷新成功");
        Ok(token)
    }

    /// 获取有效的访问令牌，过期时先刷新
    pub async fn ensure_valid_token(&self) -> Result<String, DashError> {
        let token = self.token_state()?;
        if let Some(access_token) = token.usable_access_token(now_ms()) {
            return Ok(access_token.to_string());
        }
        let refreshed = self
            .refresh_access_token(token.access_token.as_deref())
            .await?;
        refreshed
            .access_token
            .ok_or(DashError::AuthExpired)
    }

    /// 获取 Partner Token（client_credentials 授权）
    ///
    /// 在有效期内直接返回缓存值
    pub async fn partner_token(&self) -> Result<String, DashError> {
        let record = self.db.load_record()?;
        if let Some(token) = record.token.cached_partner_token(now_ms()) {
            tracing::debug!("使用缓存的 Partner Token");
            return Ok(token.to_string());
        }

        ensure_credentials(&record)?;
        tracing::info!("正在获取 Partner Token...");
        let grant = self
            .post_token(&ClientCredentialsGrant {
                grant_type: "client_credentials",
                client_id: record.credentials.client_id.trim(),
                client_secret: record.credentials.client_secret.trim(),
                audience: &self.audience,
            })
            .await?;

        let token = grant.access_token.clone();
        let now = now_ms();
        self.db
            .update_record(|record| record.token.apply_partner_grant(grant, now))?;
        Ok(token)
    }

    /// 向授权端点提交表单
    async fn post_token<F: Serialize>(&self, form: &F) -> Result<TokenResponse, DashError> {
        let response = self
            .client
            .post(self.token_url())
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(token_endpoint_error(status.as_u16(), &body));
        }

        Ok(response.json().await?)
    }
}

/// 授权端点错误归类
///
/// 错误信息优先取 error_description，其次 error，最后原始响应体
fn token_endpoint_error(status: u16, body: &str) -> DashError {
    let parsed: TokenErrorResponse = serde_json::from_str(body).unwrap_or_default();
    let is_invalid_grant = parsed.error.as_deref() == Some("invalid_grant")
        || body.contains("invalid_grant")
        || matches!(status, 400 | 401);
    let message = parsed
        .error_description
        .or(parsed.error)
        .unwrap_or_else(|| body.to_string());

    if is_invalid_grant {
        DashError::InvalidGrant(message)
    } else {
        DashError::HttpError {
            status,
            body: message,
        }
    }
}

fn ensure_credentials(record: &DashRecord) -> Result<(), DashError> {
    if record.credentials.is_complete() {
        Ok(())
    } else {
        Err(DashError::NotConfigured("clientId / clientSecret".to_string()))
    }
}

/// 生成 32 位字母数字 state
fn generate_state() -> String {
    rand::rngs::OsRng
        .sample_iter(&Alphanumeric)
        .take(STATE_LENGTH)
        .map(char::from)
        .collect()
}
