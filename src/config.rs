use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:3000";
pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";
pub const DEFAULT_MAX_BODY_BYTES: usize = 25_000_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnknownFieldPolicy {
    Reject,
    Ignore,
    Preserve,
}

impl Default for UnknownFieldPolicy {
    fn default() -> Self {
        UnknownFieldPolicy::Ignore
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub listen: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub metrics_path: String,
    pub max_body_bytes: usize,
    pub max_inbound_bytes: usize,
    pub unknown_fields: UnknownFieldPolicy,
    /// Send error envelopes with HTTP 200, as older deployments of this proxy did.
    pub errors_with_ok_status: bool,
    pub count_tokens_requires_beta: bool,
    #[serde(rename = "bedrock_config")]
    pub bedrock: BedrockConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            api_key: None,
            metrics_path: "/metrics".to_string(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            max_inbound_bytes: 64 * 1024 * 1024,
            unknown_fields: UnknownFieldPolicy::default(),
            errors_with_ok_status: false,
            count_tokens_requires_beta: true,
            bedrock: BedrockConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BedrockConfig {
    pub access_key: String,
    pub secret_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    pub region: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_arn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_region: Option<String>,
    pub role_session_name: String,
    pub role_duration_seconds: u64,
    pub refresh_margin_seconds: u64,
    pub model_mappings: HashMap<String, String>,
    pub anthropic_version_mappings: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anthropic_default_model: Option<String>,
    pub anthropic_default_version: String,
    pub request_timeout_ms: u64,
    pub stream_read_timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sts_endpoint: Option<String>,
}

impl Default for BedrockConfig {
    fn default() -> Self {
        Self {
            access_key: String::new(),
            secret_key: String::new(),
            session_token: None,
            region: DEFAULT_REGION.to_string(),
            role_arn: None,
            role_region: None,
            role_session_name: "bedrockruntime-session".to_string(),
            role_duration_seconds: 3600,
            refresh_margin_seconds: 300,
            model_mappings: HashMap::new(),
            anthropic_version_mappings: HashMap::new(),
            anthropic_default_model: None,
            anthropic_default_version: DEFAULT_ANTHROPIC_VERSION.to_string(),
            request_timeout_ms: 300_000,
            stream_read_timeout_ms: 60_000,
            runtime_endpoint: None,
            sts_endpoint: None,
        }
    }
}

impl BedrockConfig {
    /// Region the runtime client talks to. With an assumed role this is the role region.
    pub fn invoke_region(&self) -> &str {
        match (&self.role_arn, &self.role_region) {
            (Some(_), Some(region)) if !region.is_empty() => region,
            _ => &self.region,
        }
    }

    pub fn runtime_base_url(&self) -> String {
        match &self.runtime_endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://bedrock-runtime.{}.amazonaws.com", self.invoke_region()),
        }
    }
}

impl Config {
    /// Reads the JSON file when it exists; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn merge_process_env(&mut self) {
        self.merge_env(|key| std::env::var(key).ok());
    }

    /// Overlays environment values. Listen address and API key only fill gaps left by the
    /// file; credentials, region, role and mappings from the environment win when non-empty.
    pub fn merge_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if self.listen.trim().is_empty() || self.listen == DEFAULT_LISTEN {
            if let Some(listen) = get("HTTP_LISTEN") {
                self.listen = listen;
            }
        }
        if self.api_key.as_deref().unwrap_or("").is_empty() {
            self.api_key = get("API_KEY");
        }
        if let Some(path) = get("PROXY_METRICS_PATH") {
            self.metrics_path = path;
        }
        if let Some(limit) = get("PROXY_MAX_BODY_BYTES").and_then(|v| v.parse().ok()) {
            self.max_body_bytes = limit;
        }

        let bedrock = &mut self.bedrock;
        if let Some(v) = get("AWS_BEDROCK_ACCESS_KEY") {
            bedrock.access_key = v;
        }
        if let Some(v) = get("AWS_BEDROCK_SECRET_KEY") {
            bedrock.secret_key = v;
        }
        if let Some(v) = get("AWS_BEDROCK_SESSION_TOKEN") {
            bedrock.session_token = Some(v);
        }
        if let Some(v) = get("AWS_BEDROCK_REGION") {
            bedrock.region = v;
        }
        if let Some(v) = get("AWS_BEDROCK_ROLE_ARN") {
            bedrock.role_arn = Some(v);
        }
        if let Some(v) = get("AWS_BEDROCK_ROLE_REGION") {
            bedrock.role_region = Some(v);
        }
        if let Some(v) = get("AWS_BEDROCK_MODEL_MAPPINGS") {
            let mappings = parse_mappings(&v);
            if !mappings.is_empty() {
                bedrock.model_mappings = mappings;
            }
        }
        if let Some(v) = get("AWS_BEDROCK_ANTHROPIC_VERSION_MAPPINGS") {
            let mappings = parse_mappings(&v);
            if !mappings.is_empty() {
                bedrock.anthropic_version_mappings = mappings;
            }
        }
        if let Some(v) = get("AWS_BEDROCK_ANTHROPIC_DEFAULT_MODEL") {
            bedrock.anthropic_default_model = Some(v);
        }
        if let Some(v) = get("AWS_BEDROCK_ANTHROPIC_DEFAULT_VERSION") {
            bedrock.anthropic_default_version = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let has_access = !self.bedrock.access_key.is_empty();
        let has_secret = !self.bedrock.secret_key.is_empty();
        if has_access != has_secret {
            return Err(ConfigError::Invalid(
                "bedrock access_key and secret_key must be set together".to_string(),
            ));
        }
        if self.bedrock.role_arn.is_some() && !has_access {
            return Err(ConfigError::Invalid(
                "role_arn requires base access_key/secret_key".to_string(),
            ));
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::Invalid("max_body_bytes must be > 0".to_string()));
        }
        if !self.metrics_path.starts_with('/') {
            return Err(ConfigError::Invalid(
                "metrics_path must start with '/'".to_string(),
            ));
        }
        Ok(())
    }

    /// Pretty JSON with secrets masked, for startup logging.
    pub fn redacted_json(&self) -> String {
        let mut copy = self.clone();
        if copy.api_key.is_some() {
            copy.api_key = Some("***".to_string());
        }
        if !copy.bedrock.secret_key.is_empty() {
            copy.bedrock.secret_key = "***".to_string();
        }
        if copy.bedrock.session_token.is_some() {
            copy.bedrock.session_token = Some("***".to_string());
        }
        serde_json::to_string_pretty(&copy).unwrap_or_default()
    }
}

/// Parses `a=b, c=d` pairs; malformed pairs are skipped.
pub fn parse_mappings(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let mut kv = pair.split('=');
            let key = kv.next()?.trim();
            let value = kv.next()?.trim();
            if kv.next().is_some() || key.is_empty() || value.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mappings_skips_malformed_pairs() {
        let m = parse_mappings(
            "claude-3-5-sonnet-20241022=anthropic.claude-3-5-sonnet-20241022-v2:0, bad, a=b=c",
        );
        assert_eq!(m.len(), 1);
        assert_eq!(
            m.get("claude-3-5-sonnet-20241022").map(String::as_str),
            Some("anthropic.claude-3-5-sonnet-20241022-v2:0")
        );
    }

    #[test]
    fn invoke_region_prefers_role_region() {
        let mut cfg = BedrockConfig::default();
        cfg.region = "us-east-1".to_string();
        cfg.role_region = Some("us-west-2".to_string());
        assert_eq!(cfg.invoke_region(), "us-east-1");
        cfg.role_arn = Some("arn:aws:iam::123456789012:role/bedrock".to_string());
        assert_eq!(cfg.invoke_region(), "us-west-2");
        assert_eq!(
            cfg.runtime_base_url(),
            "https://bedrock-runtime.us-west-2.amazonaws.com"
        );
    }

    #[test]
    fn validate_rejects_half_credentials() {
        let mut cfg = Config::default();
        cfg.bedrock.access_key = "AKID".to_string();
        assert!(cfg.validate().is_err());
        cfg.bedrock.secret_key = "secret".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn redacted_json_masks_secrets() {
        let mut cfg = Config::default();
        cfg.api_key = Some("test123".to_string());
        cfg.bedrock.secret_key = "very-secret".to_string();
        let out = cfg.redacted_json();
        assert!(!out.contains("test123"));
        assert!(!out.contains("very-secret"));
    }
}
