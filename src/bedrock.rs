use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crate::config::BedrockConfig;
use crate::credentials::{
    AssumeRoleCredentialProvider, AssumeRoleSettings, CredentialProvider, CredentialScope,
    StaticCredentialProvider, base_credentials,
};
use crate::eventstream::decode_chunks;
use crate::sigv4::{self, OutgoingRequest, uri_encode};
use crate::upstream::{ChunkStream, Operation, UpstreamClient, UpstreamError, error_from_response};

const SERVICE: &str = "bedrock";
const EVENT_STREAM_CONTENT_TYPE: &str = "application/vnd.amazon.eventstream";

/// Bedrock Runtime client for `InvokeModel` and `InvokeModelWithResponseStream`.
pub struct BedrockClient {
    http: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
    scope: CredentialScope,
    base_url: String,
    request_timeout: Duration,
    stream_read_timeout: Duration,
}

impl BedrockClient {
    pub fn new(
        http: reqwest::Client,
        credentials: Arc<dyn CredentialProvider>,
        scope: CredentialScope,
        base_url: String,
        request_timeout: Duration,
        stream_read_timeout: Duration,
    ) -> Self {
        Self {
            http,
            credentials,
            scope,
            base_url,
            request_timeout,
            stream_read_timeout,
        }
    }

    /// Static keys when no role is configured, otherwise assume-role on top of them.
    pub fn from_config(http: reqwest::Client, cfg: &BedrockConfig) -> Self {
        let base = base_credentials(
            cfg.access_key.clone(),
            cfg.secret_key.clone(),
            cfg.session_token.clone(),
        );
        let request_timeout = Duration::from_millis(cfg.request_timeout_ms);
        let credentials: Arc<dyn CredentialProvider> = match &cfg.role_arn {
            Some(_) => Arc::new(AssumeRoleCredentialProvider::new(
                base,
                AssumeRoleSettings {
                    sts_region: cfg.region.clone(),
                    sts_endpoint: cfg.sts_endpoint.clone(),
                    session_name: cfg.role_session_name.clone(),
                    duration_seconds: cfg.role_duration_seconds,
                    refresh_margin: Duration::from_secs(cfg.refresh_margin_seconds),
                    timeout: request_timeout,
                },
            )),
            None => Arc::new(StaticCredentialProvider::new(base)),
        };
        let scope = CredentialScope {
            role_arn: cfg.role_arn.clone(),
            region: cfg.invoke_region().to_string(),
        };
        Self::new(
            http,
            credentials,
            scope,
            cfg.runtime_base_url(),
            request_timeout,
            Duration::from_millis(cfg.stream_read_timeout_ms),
        )
    }

    async fn send(
        &self,
        operation: Operation,
        model_id: &str,
        body: Bytes,
    ) -> Result<reqwest::Response, UpstreamError> {
        let suffix = match operation {
            Operation::InvokeModelWithResponseStream => "invoke-with-response-stream",
            _ => "invoke",
        };
        let accept = match operation {
            Operation::InvokeModelWithResponseStream => EVENT_STREAM_CONTENT_TYPE,
            _ => "application/json",
        };
        let url = reqwest::Url::parse(&format!(
            "{}/model/{}/{suffix}",
            self.base_url,
            uri_encode(model_id)
        ))
        .map_err(|err| UpstreamError::Network {
            operation,
            message: format!("invalid bedrock endpoint: {err}"),
        })?;

        let creds = self.credentials.credentials(&self.scope).await?;
        let headers = sigv4::sign_headers(
            &creds,
            &self.scope.region,
            SERVICE,
            &OutgoingRequest {
                method: "POST",
                url: url.as_str(),
                headers: &[("content-type", "application/json"), ("accept", accept)],
                payload: &body,
            },
            SystemTime::now(),
        )
        .map_err(|err| UpstreamError::Credentials(err.to_string()))?;

        let mut req = self.http.post(url).body(body);
        if operation == Operation::InvokeModel {
            req = req.timeout(self.request_timeout);
        }
        for (k, v) in &headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let timeout_err = || UpstreamError::Timeout {
            operation,
            after_ms: self.request_timeout.as_millis() as u64,
        };
        // Streaming calls bound only the wait for response headers.
        let resp = tokio::time::timeout(self.request_timeout, req.send())
            .await
            .map_err(|_| timeout_err())?
            .map_err(|err| {
                if err.is_timeout() {
                    timeout_err()
                } else {
                    UpstreamError::Network {
                        operation,
                        message: err.to_string(),
                    }
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let headers = resp.headers().clone();
            let text = tokio::time::timeout(self.request_timeout, resp.text())
                .await
                .map_err(|_| timeout_err())?
                .map_err(|err| {
                    if err.is_timeout() {
                        timeout_err()
                    } else {
                        UpstreamError::Network {
                            operation,
                            message: format!("failed to read error body (status {status}): {err}"),
                        }
                    }
                })?;
            let err = error_from_response(operation, status.as_u16(), &headers, &text);
            tracing::warn!(
                model_id,
                operation = %operation,
                status = status.as_u16(),
                code = err.code().unwrap_or_default(),
                "bedrock call failed"
            );
            return Err(err);
        }
        Ok(resp)
    }
}

#[async_trait]
impl UpstreamClient for BedrockClient {
    async fn invoke(&self, model_id: &str, body: Bytes) -> Result<Bytes, UpstreamError> {
        let operation = Operation::InvokeModel;
        let started = Instant::now();
        let result = async {
            let resp = self.send(operation, model_id, body).await?;
            resp.bytes().await.map_err(|err| {
                if err.is_timeout() {
                    UpstreamError::Timeout {
                        operation,
                        after_ms: self.request_timeout.as_millis() as u64,
                    }
                } else {
                    UpstreamError::Network {
                        operation,
                        message: err.to_string(),
                    }
                }
            })
        }
        .await;
        let elapsed = started.elapsed();
        metrics::histogram!("bedrock_invoke_duration_seconds", "operation" => operation.as_str())
            .record(elapsed.as_secs_f64());
        tracing::debug!(
            model_id,
            operation = %operation,
            ok = result.is_ok(),
            latency_ms = elapsed.as_millis() as u64,
            "bedrock call finished"
        );
        result
    }

    async fn invoke_stream(&self, model_id: &str, body: Bytes) -> Result<ChunkStream, UpstreamError> {
        let operation = Operation::InvokeModelWithResponseStream;
        let started = Instant::now();
        let resp = self.send(operation, model_id, body).await;
        metrics::histogram!("bedrock_invoke_duration_seconds", "operation" => operation.as_str())
            .record(started.elapsed().as_secs_f64());
        let resp = resp?;
        tracing::debug!(
            model_id,
            operation = %operation,
            latency_ms = started.elapsed().as_millis() as u64,
            "bedrock stream opened"
        );

        let read_timeout = self.stream_read_timeout;
        let body = resp.bytes_stream().boxed();
        let timed = stream::unfold(Some(body), move |state| async move {
            let mut body = state?;
            match tokio::time::timeout(read_timeout, body.next()).await {
                Ok(Some(Ok(bytes))) => Some((Ok(bytes), Some(body))),
                Ok(Some(Err(err))) => Some((
                    Err(UpstreamError::Network {
                        operation,
                        message: err.to_string(),
                    }),
                    None,
                )),
                Ok(None) => None,
                Err(_) => Some((
                    Err(UpstreamError::Timeout {
                        operation,
                        after_ms: read_timeout.as_millis() as u64,
                    }),
                    None,
                )),
            }
        })
        .boxed();
        Ok(decode_chunks(timed))
    }
}
