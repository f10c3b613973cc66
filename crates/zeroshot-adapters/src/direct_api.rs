//! Direct Anthropic API fast path.
//!
//! Agents that request structured output can bypass the CLI subprocess and
//! call the Messages API directly. The response text is recovered as JSON
//! with a resilient extraction ladder: strict parse, then a fenced
//! ```json``` block, then the first balanced object, then a validation
//! error. HTTP 429 maps to the retryable [`Error::RateLimited`].

use crate::executor::{InvocationOutcome, InvokeContext, ProviderInvoker};
use crate::levels::ModelTable;
use crate::provider::InvocationRequest;
use crate::stream::ProviderEvent;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroshot_proto::{Error, Result};

/// Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MAX_TOKENS: u32 = 8192;

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ApiMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ApiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ApiContentBlock>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: u64,
    output_tokens: u64,
}

/// One completed direct-API call.
#[derive(Debug)]
pub struct DirectApiResponse {
    pub text: String,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

/// Thin client over the Anthropic Messages API.
pub struct DirectApiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl DirectApiClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Builds a client from `ANTHROPIC_API_KEY`, or `None` when unset.
    pub fn from_env() -> Option<Self> {
        std::env::var(crate::discover::ANTHROPIC_API_KEY_ENV)
            .ok()
            .filter(|key| !key.is_empty())
            .map(Self::new)
    }

    /// Overrides the API endpoint, for tests and proxies.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Sends one user turn and returns the concatenated text content.
    pub async fn complete(&self, model: &str, context: &str) -> Result<DirectApiResponse> {
        let request = ApiRequest {
            model,
            max_tokens: DEFAULT_MAX_TOKENS,
            messages: vec![ApiMessage {
                role: "user",
                content: context,
            }],
        };

        debug!(model = model, "Sending direct API request");
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::TransientProviderFailure(format!("request failed: {e}")))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status(status, &body));
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| Error::TransientProviderFailure(format!("malformed response: {e}")))?;

        let text = api_response
            .content
            .iter()
            .filter(|b| b.block_type == "text")
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let (input_tokens, output_tokens) = api_response
            .usage
            .map(|u| (Some(u.input_tokens), Some(u.output_tokens)))
            .unwrap_or((None, None));

        Ok(DirectApiResponse {
            text,
            input_tokens,
            output_tokens,
        })
    }
}

/// Maps a non-2xx status to the error taxonomy.
fn error_for_status(status: u16, body: &str) -> Error {
    if status == 429 {
        Error::RateLimited
    } else {
        Error::TransientProviderFailure(format!(
            "API returned {status}: {}",
            body.chars().take(200).collect::<String>()
        ))
    }
}

/// Recovers a JSON value from model output.
///
/// Ladder: strict parse of the whole text; a fenced code block; the first
/// balanced top-level object. Raises [`Error::SchemaValidation`] when all
/// three fail.
pub fn extract_json(text: &str) -> Result<serde_json::Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    if let Some(block) = fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str(block.trim()) {
            return Ok(value);
        }
    }

    if let Some(object) = first_balanced_object(trimmed) {
        if let Ok(value) = serde_json::from_str(object) {
            return Ok(value);
        }
    }

    Err(Error::SchemaValidation(
        "no JSON object found in provider output".to_string(),
    ))
}

/// Extracts the contents of the first fenced code block, preferring
/// ```json fences.
fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```json").map(|i| i + 7).or_else(|| {
        text.find("```").map(|i| i + 3)
    })?;
    let rest = &text[start..];
    let end = rest.find("```")?;
    Some(&rest[..end])
}

/// Finds the first balanced `{…}` span, respecting strings and escapes.
fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Light structural validation: the value must be an object, and every key
/// the schema lists as `required` must be present.
pub fn validate_against_schema(
    value: &serde_json::Value,
    schema: &serde_json::Value,
) -> Result<()> {
    let object = value.as_object().ok_or_else(|| {
        Error::SchemaValidation("structured output is not a JSON object".to_string())
    })?;

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !object.contains_key(key) {
                return Err(Error::SchemaValidation(format!(
                    "missing required field '{key}'"
                )));
            }
        }
    }
    Ok(())
}

/// Runs provider invocations through the direct API instead of a subprocess.
pub struct DirectApiInvoker {
    client: DirectApiClient,
    models: ModelTable,
}

impl DirectApiInvoker {
    pub fn new(client: DirectApiClient, models: ModelTable) -> Self {
        Self { client, models }
    }
}

#[async_trait]
impl ProviderInvoker for DirectApiInvoker {
    async fn invoke(
        &self,
        request: &InvocationRequest,
        ctx: InvokeContext,
    ) -> Result<InvocationOutcome> {
        let spec = self.models.resolve(request.level);
        let call = self.client.complete(&spec.model_id, &request.context);
        let response = match ctx.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, call).await {
                Ok(response) => response?,
                Err(_) => {
                    return Ok(InvocationOutcome {
                        timed_out: true,
                        success: false,
                        ..InvocationOutcome::default()
                    })
                }
            },
            None => call.await?,
        };

        let structured = match request.json_schema {
            Some(ref schema) => {
                let value = extract_json(&response.text)?;
                validate_against_schema(&value, schema)?;
                Some(value)
            }
            None => None,
        };

        Ok(InvocationOutcome {
            events: vec![ProviderEvent::Result {
                success: true,
                input_tokens: response.input_tokens,
                output_tokens: response.output_tokens,
                error: None,
            }],
            raw_output: response.text.clone(),
            text: response.text,
            structured,
            success: true,
            exit_code: None,
            timed_out: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_strict() {
        let value = extract_json(r#"{"verdict": "ok", "score": 3}"#).unwrap();
        assert_eq!(value["verdict"], "ok");
    }

    #[test]
    fn test_extract_fenced_block() {
        let text = "Here is the answer:\n```json\n{\"verdict\": \"ok\"}\n```\nDone.";
        let value = extract_json(text).unwrap();
        assert_eq!(value["verdict"], "ok");
    }

    #[test]
    fn test_extract_unlabeled_fence() {
        let text = "```\n{\"a\": 1}\n```";
        let value = extract_json(text).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_extract_balanced_object() {
        let text = r#"The result is {"nested": {"deep": true}, "s": "has { brace"} trailing"#;
        let value = extract_json(text).unwrap();
        assert_eq!(value["nested"]["deep"], true);
        assert_eq!(value["s"], "has { brace");
    }

    #[test]
    fn test_extract_handles_escaped_quotes() {
        let text = r#"prefix {"quote": "she said \"hi\""} suffix"#;
        let value = extract_json(text).unwrap();
        assert_eq!(value["quote"], r#"she said "hi""#);
    }

    #[test]
    fn test_extract_failure_is_validation_error() {
        let err = extract_json("no json here at all").unwrap_err();
        assert!(matches!(err, Error::SchemaValidation(_)));
    }

    #[test]
    fn test_schema_required_fields() {
        let schema = json!({"type": "object", "required": ["verdict", "score"]});
        assert!(validate_against_schema(&json!({"verdict": "ok", "score": 1}), &schema).is_ok());

        let err =
            validate_against_schema(&json!({"verdict": "ok"}), &schema).unwrap_err();
        assert!(matches!(err, Error::SchemaValidation(_)));
    }

    #[test]
    fn test_schema_rejects_non_object() {
        let schema = json!({"type": "object"});
        assert!(validate_against_schema(&json!([1, 2]), &schema).is_err());
    }

    #[test]
    fn test_rate_limit_maps_to_retryable() {
        let err = error_for_status(429, "slow down");
        assert!(matches!(err, Error::RateLimited));
        assert!(err.is_retryable());

        let err = error_for_status(500, "oops");
        assert!(matches!(err, Error::TransientProviderFailure(_)));
    }
}
