//! HTTP implementation of the reasoning oracle.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::{check_schema, extract_json_from_completion, OracleOutput, PromptKind, ReasoningOracle, ResponseCache};
use crate::config::{CacheConfig, OracleConfig, RequestConfig};
use crate::error::{OracleError, OracleResult};
use crate::prompts::system_prompt;

/// Wire request for the oracle's generate endpoint.
#[derive(Debug, Clone, Serialize)]
struct GenerateRequest<'a> {
    kind: &'a str,
    system: &'a str,
    context: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    repair_hint: Option<&'a str>,
}

/// Wire response from the oracle's generate endpoint.
#[derive(Debug, Clone, Deserialize)]
struct GenerateResponse {
    success: bool,
    completion: String,
}

/// Reasoning oracle backed by an HTTP inference endpoint, with bounded
/// retries, a per-request timeout, one schema-repair attempt, and a TTL
/// response cache.
pub struct HttpOracle {
    client: Client,
    base_url: String,
    api_key: String,
    request_config: RequestConfig,
    cache: ResponseCache,
}

impl HttpOracle {
    /// Create a new oracle client.
    pub fn new(
        config: &OracleConfig,
        request_config: RequestConfig,
        cache_config: &CacheConfig,
    ) -> OracleResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(OracleError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            request_config,
            cache: ResponseCache::new(cache_config),
        })
    }

    /// Get the base URL (for testing)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Issue one generate call with retry/backoff on transport failure.
    async fn call_with_retries(
        &self,
        kind: PromptKind,
        context: &Value,
        repair_hint: Option<&str>,
    ) -> OracleResult<GenerateResponse> {
        let url = format!("{}/v1/generate", self.base_url);
        let request = GenerateRequest {
            kind: kind.as_str(),
            system: system_prompt(kind),
            context,
            repair_hint,
        };

        let mut last_error = None;
        let mut retries = 0;

        while retries <= self.request_config.max_retries {
            if retries > 0 {
                let delay = Duration::from_millis(
                    self.request_config.retry_delay_ms * (2_u64.pow(retries - 1)),
                );
                warn!(
                    kind = %kind,
                    retry = retries,
                    delay_ms = delay.as_millis(),
                    "Retrying oracle request"
                );
                tokio::time::sleep(delay).await;
            }

            let start = Instant::now();
            match self.execute_request(&url, &request).await {
                Ok(response) => {
                    info!(
                        kind = %kind,
                        latency_ms = start.elapsed().as_millis(),
                        "Oracle call succeeded"
                    );
                    return Ok(response);
                }
                Err(e) => {
                    error!(
                        kind = %kind,
                        error = %e,
                        latency_ms = start.elapsed().as_millis(),
                        retry = retries,
                        "Oracle call failed"
                    );
                    last_error = Some(e);
                    retries += 1;
                }
            }
        }

        Err(OracleError::Unavailable {
            message: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "Unknown error".to_string()),
            retries,
        })
    }

    /// Execute a single request (internal)
    async fn execute_request(
        &self,
        url: &str,
        request: &GenerateRequest<'_>,
    ) -> OracleResult<GenerateResponse> {
        debug!(kind = %request.kind, "Calling reasoning oracle");

        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OracleError::Timeout {
                        timeout_ms: self.request_config.timeout_ms,
                    }
                } else {
                    OracleError::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(OracleError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        let generate_response: GenerateResponse =
            response
                .json()
                .await
                .map_err(|e| OracleError::InvalidResponse {
                    message: format!("Failed to parse response: {}", e),
                })?;

        if !generate_response.success {
            return Err(OracleError::InvalidResponse {
                message: "oracle reported failure".to_string(),
            });
        }

        Ok(generate_response)
    }

    /// Parse and schema-check a completion.
    fn parse_completion(kind: PromptKind, completion: &str) -> Result<Value, String> {
        let json_str = extract_json_from_completion(completion)?;
        let value: Value =
            serde_json::from_str(json_str).map_err(|e| format!("JSON parse error: {}", e))?;
        check_schema(kind, &value)?;
        Ok(value)
    }
}

#[async_trait]
impl ReasoningOracle for HttpOracle {
    async fn generate(&self, kind: PromptKind, context: &Value) -> OracleResult<OracleOutput> {
        let cache_key = ResponseCache::key(kind, context);
        if let Some(result) = self.cache.get(cache_key) {
            debug!(kind = %kind, "Oracle cache hit");
            return Ok(OracleOutput {
                result,
                cached: true,
            });
        }

        let response = self.call_with_retries(kind, context, None).await?;

        let result = match Self::parse_completion(kind, &response.completion) {
            Ok(value) => value,
            Err(first_error) => {
                // One repair attempt: re-prompt with the schema complaint.
                warn!(
                    kind = %kind,
                    error = %first_error,
                    "Oracle result failed schema check, attempting repair"
                );
                let repaired = self
                    .call_with_retries(kind, context, Some(&first_error))
                    .await?;
                Self::parse_completion(kind, &repaired.completion).map_err(|second_error| {
                    OracleError::SchemaRepairExhausted {
                        message: second_error,
                    }
                })?
            }
        };

        self.cache.insert(cache_key, result.clone());
        Ok(OracleOutput {
            result,
            cached: false,
        })
    }
}
