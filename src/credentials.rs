//! Credential acquisition for upstream calls.
//!
//! [`CredentialProvider`] hands out credentials for a [`CredentialScope`]. The
//! assume-role provider caches per scope and refreshes ahead of expiry, with a
//! single STS call in flight per scope.

use async_trait::async_trait;
use aws_sdk_sts::config::retry::RetryConfig;
use aws_sdk_sts::config::timeout::TimeoutConfig;
use aws_sdk_sts::config::{BehaviorVersion, Region};
use aws_sdk_sts::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_sts::operation::assume_role::AssumeRoleError;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

pub use aws_credential_types::Credentials;

use crate::upstream::{Operation, UpstreamError};

const PROVIDER_NAME: &str = "BedrockProxy";

/// Base credentials from the config: long-lived keys, optionally with a session token.
pub fn base_credentials(
    access_key_id: impl Into<String>,
    secret_access_key: impl Into<String>,
    session_token: Option<String>,
) -> Credentials {
    Credentials::new(access_key_id, secret_access_key, session_token, None, PROVIDER_NAME)
}

/// True when `creds` stay valid for more than `margin` after `now`.
pub fn is_fresh(creds: &Credentials, now: SystemTime, margin: Duration) -> bool {
    match creds.expiry() {
        Some(expires_at) => expires_at
            .duration_since(now)
            .is_ok_and(|left| left > margin),
        None => true,
    }
}

/// What a set of credentials is good for: an optional role and the region it is used in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialScope {
    pub role_arn: Option<String>,
    pub region: String,
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credentials(&self, scope: &CredentialScope) -> Result<Credentials, UpstreamError>;
}

/// Long-lived keys used as-is.
pub struct StaticCredentialProvider {
    credentials: Credentials,
}

impl StaticCredentialProvider {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn credentials(&self, _scope: &CredentialScope) -> Result<Credentials, UpstreamError> {
        if self.credentials.access_key_id().is_empty() {
            return Err(UpstreamError::Credentials(
                "no bedrock access key configured".to_string(),
            ));
        }
        Ok(self.credentials.clone())
    }
}

#[derive(Debug, Clone)]
pub struct AssumeRoleSettings {
    /// Region the STS client signs for.
    pub sts_region: String,
    /// Overrides the regional STS endpoint.
    pub sts_endpoint: Option<String>,
    pub session_name: String,
    pub duration_seconds: u64,
    pub refresh_margin: Duration,
    pub timeout: Duration,
}

type CacheCell = Arc<RwLock<Option<Credentials>>>;

/// Exchanges base credentials for temporary role credentials through STS `AssumeRole`.
pub struct AssumeRoleCredentialProvider {
    sts: aws_sdk_sts::Client,
    base: Credentials,
    settings: AssumeRoleSettings,
    cache: DashMap<CredentialScope, CacheCell>,
}

impl AssumeRoleCredentialProvider {
    pub fn new(base: Credentials, settings: AssumeRoleSettings) -> Self {
        let mut conf = aws_sdk_sts::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(settings.sts_region.clone()))
            .credentials_provider(base.clone())
            .retry_config(RetryConfig::disabled())
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(settings.timeout)
                    .build(),
            );
        if let Some(endpoint) = &settings.sts_endpoint {
            conf = conf.endpoint_url(endpoint.trim_end_matches('/'));
        }
        Self {
            sts: aws_sdk_sts::Client::from_conf(conf.build()),
            base,
            settings,
            cache: DashMap::new(),
        }
    }

    fn cell(&self, scope: &CredentialScope) -> CacheCell {
        self.cache
            .entry(scope.clone())
            .or_insert_with(|| Arc::new(RwLock::new(None)))
            .clone()
    }

    async fn assume_role(&self, role_arn: &str) -> Result<Credentials, UpstreamError> {
        let out = self
            .sts
            .assume_role()
            .role_arn(role_arn)
            .role_session_name(&self.settings.session_name)
            .duration_seconds(i32::try_from(self.settings.duration_seconds).unwrap_or(i32::MAX))
            .send()
            .await
            .map_err(|err| sts_error(err, self.settings.timeout))?;
        let creds = out.credentials().ok_or_else(|| {
            UpstreamError::Credentials("AssumeRole response carried no credentials".to_string())
        })?;
        let expires_at = u64::try_from(creds.expiration().secs())
            .map(|secs| UNIX_EPOCH + Duration::from_secs(secs))
            .map_err(|_| {
                UpstreamError::Credentials("AssumeRole response has an invalid expiration".to_string())
            })?;
        Ok(Credentials::new(
            creds.access_key_id(),
            creds.secret_access_key(),
            Some(creds.session_token().to_string()),
            Some(expires_at),
            PROVIDER_NAME,
        ))
    }
}

/// Keeps the STS error code so callers can tell a denied role from a broken network.
fn sts_error(err: SdkError<AssumeRoleError>, timeout: Duration) -> UpstreamError {
    let operation = Operation::AssumeRole;
    let timed_out = UpstreamError::Timeout {
        operation,
        after_ms: timeout.as_millis() as u64,
    };
    match &err {
        SdkError::TimeoutError(_) => timed_out,
        SdkError::DispatchFailure(failure) if failure.is_timeout() => timed_out,
        SdkError::DispatchFailure(_) => UpstreamError::Network {
            operation,
            message: DisplayErrorContext(&err).to_string(),
        },
        SdkError::ServiceError(_) => UpstreamError::api(
            operation,
            err.raw_response().map_or(500, |resp| resp.status().as_u16()),
            err.code().unwrap_or("Unknown"),
            err.message().unwrap_or_default(),
        ),
        _ => UpstreamError::Credentials(DisplayErrorContext(&err).to_string()),
    }
}

#[async_trait]
impl CredentialProvider for AssumeRoleCredentialProvider {
    async fn credentials(&self, scope: &CredentialScope) -> Result<Credentials, UpstreamError> {
        let Some(role_arn) = scope.role_arn.as_deref() else {
            return Ok(self.base.clone());
        };
        let cell = self.cell(scope);
        let margin = self.settings.refresh_margin;

        {
            let cached = cell.read().await;
            if let Some(creds) = cached.as_ref() {
                if is_fresh(creds, SystemTime::now(), margin) {
                    return Ok(creds.clone());
                }
            }
        }

        let mut guard = cell.write().await;
        // Another task may have refreshed while we waited for the write lock.
        if let Some(creds) = guard.as_ref() {
            if is_fresh(creds, SystemTime::now(), margin) {
                return Ok(creds.clone());
            }
        }

        match self.assume_role(role_arn).await {
            Ok(creds) => {
                metrics::counter!("bedrock_assume_role_total", "outcome" => "success").increment(1);
                tracing::info!(
                    role_arn,
                    region = %scope.region,
                    expires_at = ?creds.expiry(),
                    "assumed role"
                );
                *guard = Some(creds.clone());
                Ok(creds)
            }
            Err(err) => {
                metrics::counter!("bedrock_assume_role_total", "outcome" => "failure").increment(1);
                tracing::warn!(role_arn, error = %err, "assume role failed");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expiring_in(secs: u64) -> Credentials {
        Credentials::new(
            "ASIA",
            "secret",
            Some("token".to_string()),
            Some(SystemTime::now() + Duration::from_secs(secs)),
            "test",
        )
    }

    #[test]
    fn freshness_respects_margin() {
        let now = SystemTime::now();
        let margin = Duration::from_secs(300);
        assert!(is_fresh(&base_credentials("a", "b", None), now, margin));
        assert!(!is_fresh(&expiring_in(240), now, margin));
        assert!(is_fresh(&expiring_in(1800), now, margin));
    }

    #[test]
    fn expired_credentials_are_stale() {
        let creds = Credentials::new(
            "ASIA",
            "secret",
            None,
            Some(SystemTime::now() - Duration::from_secs(60)),
            "test",
        );
        assert!(!is_fresh(&creds, SystemTime::now(), Duration::ZERO));
    }

    #[test]
    fn debug_hides_secrets() {
        let creds = base_credentials("AKID", "topsecret", Some("tok-value".into()));
        let out = format!("{creds:?}");
        assert!(!out.contains("topsecret"));
        assert!(!out.contains("tok-value"));
    }

    #[tokio::test]
    async fn static_provider_requires_key() {
        let provider = StaticCredentialProvider::new(base_credentials("", "", None));
        let scope = CredentialScope {
            role_arn: None,
            region: "us-east-1".to_string(),
        };
        assert!(matches!(
            provider.credentials(&scope).await,
            Err(UpstreamError::Credentials(_))
        ));
    }

    #[tokio::test]
    async fn scope_without_role_uses_base_keys() {
        let provider = AssumeRoleCredentialProvider::new(
            base_credentials("AKIDBASE", "secret", None),
            AssumeRoleSettings {
                sts_region: "us-east-1".to_string(),
                sts_endpoint: Some("http://127.0.0.1:1".to_string()),
                session_name: "s".to_string(),
                duration_seconds: 900,
                refresh_margin: Duration::from_secs(300),
                timeout: Duration::from_secs(1),
            },
        );
        let scope = CredentialScope {
            role_arn: None,
            region: "us-east-1".to_string(),
        };
        let creds = provider.credentials(&scope).await.unwrap();
        assert_eq!(creds.access_key_id(), "AKIDBASE");
    }
}
