//! Chat-session advisory client
//!
//! The service speaks a small session protocol:
//!
//! - `POST {endpoint}/v1/sessions` with the model id opens a session and
//!   answers with `session_id` (or `id`)
//! - `POST {endpoint}/v1/sessions/{id}/messages` sends one prompt and answers
//!   with the reply text in one of several envelope shapes
//!
//! Every request carries the API key as a bearer token. The session is
//! opened lazily and dropped after any failed request, so the next attempt
//! starts clean.

use crate::reply::{extract_text, parse_assessment};
use async_trait::async_trait;
use dmo_core::advisory::{
    AdvisoryContext, AdvisoryError, AdvisoryGateway, Assessment, ExecutionDigest,
};
use dmo_core::connector::AdvisoryConnector;
use dmo_core::descriptor::AdvisoryDescriptor;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Response};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const SYSTEM_PROMPT: &str = "You are an expert database migration assistant.";
const ERROR_BODY_LIMIT: usize = 512;

/// HTTP advisory gateway
pub struct HttpAdvisoryGateway {
    base_url: String,
    model_id: String,
    client: Client,
    request_timeout: Duration,
    session: Mutex<Option<String>>,
}

impl std::fmt::Debug for HttpAdvisoryGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAdvisoryGateway")
            .field("base_url", &self.base_url)
            .field("model_id", &self.model_id)
            .finish_non_exhaustive()
    }
}

impl HttpAdvisoryGateway {
    /// Build a client for `descriptor`.
    ///
    /// # Errors
    ///
    /// Returns [`AdvisoryError::Transport`] when the API key is not a valid
    /// header value or the HTTP client cannot be built.
    pub fn new(
        descriptor: &AdvisoryDescriptor,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, AdvisoryError> {
        let mut headers = HeaderMap::new();
        if !descriptor.api_key.is_empty() {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", descriptor.api_key))
                .map_err(|_| AdvisoryError::Transport("invalid api key".to_string()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|err| AdvisoryError::Transport(err.to_string()))?;

        Ok(Self {
            base_url: descriptor.endpoint.trim_end_matches('/').to_string(),
            model_id: descriptor.model_id.clone(),
            client,
            request_timeout,
            session: Mutex::new(None),
        })
    }

    /// Base URL without a trailing slash
    #[inline]
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post(&self, url: String, body: &Value) -> Result<Value, AdvisoryError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|err| self.transport_error(&err))?;
        let response = ensure_success(response).await?;
        response
            .json::<Value>()
            .await
            .map_err(|err| AdvisoryError::InvalidResponse(err.to_string()))
    }

    async fn open_session(&self) -> Result<String, AdvisoryError> {
        let body = json!({
            "model": self.model_id,
            "system_prompt": SYSTEM_PROMPT,
        });
        let reply = self
            .post(format!("{}/v1/sessions", self.base_url), &body)
            .await?;
        let id = ["session_id", "id"]
            .iter()
            .find_map(|k| reply.get(*k))
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .ok_or_else(|| {
                AdvisoryError::InvalidResponse("session reply carried no id".to_string())
            })?;
        tracing::info!("Opened advisory session {}", id);
        Ok(id)
    }

    /// Session id, opening one if needed
    async fn session_id(&self) -> Result<String, AdvisoryError> {
        let mut session = self.session.lock().await;
        if let Some(id) = session.as_ref() {
            return Ok(id.clone());
        }
        let id = self.open_session().await?;
        *session = Some(id.clone());
        Ok(id)
    }

    async fn send_message(&self, prompt: String) -> Result<String, AdvisoryError> {
        let id = self.session_id().await?;
        let body = json!({
            "message": prompt,
            "model": self.model_id,
        });
        match self
            .post(format!("{}/v1/sessions/{id}/messages", self.base_url), &body)
            .await
        {
            Ok(reply) => Ok(extract_text(&reply)),
            Err(err) => {
                self.session.lock().await.take();
                Err(err)
            }
        }
    }

    fn transport_error(&self, err: &reqwest::Error) -> AdvisoryError {
        if err.is_timeout() {
            AdvisoryError::Timeout(self.request_timeout)
        } else {
            AdvisoryError::Transport(err.to_string())
        }
    }
}

async fn ensure_success(response: Response) -> Result<Response, AdvisoryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > ERROR_BODY_LIMIT {
        let mut cut = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Err(AdvisoryError::Rejected {
        status: status.as_u16(),
        body,
    })
}

/// The assessment prompt: instructions followed by the context as a fenced
/// JSON block
pub(crate) fn assessment_prompt(context: &AdvisoryContext) -> Result<String, AdvisoryError> {
    let context = serde_json::to_string_pretty(context)
        .map_err(|err| AdvisoryError::InvalidResponse(err.to_string()))?;
    Ok(format!(
        "You are reviewing a planned table-by-table copy between two relational databases.\n\
         \n\
         Tasks to perform:\n\
         1. Assess the risk of running the plan as shown.\n\
         2. Recommend whether the operator should approve or deny it.\n\
         3. Explain your reasoning briefly.\n\
         \n\
         Answer with a JSON object with the fields \"risk_level\" (LOW, MEDIUM or HIGH), \
         \"recommendation\" (APPROVE or DENY) and \"narrative\".\n\
         \n\
         Context:\n```json\n{context}\n```"
    ))
}

/// The final report prompt over a finished execution
pub(crate) fn final_report_prompt(digest: &ExecutionDigest) -> Result<String, AdvisoryError> {
    let digest = serde_json::to_string_pretty(digest)
        .map_err(|err| AdvisoryError::InvalidResponse(err.to_string()))?;
    Ok(format!(
        "The approved table-by-table copy has finished. Write the final migration report.\n\
         \n\
         Cover the overall outcome, the tables that failed or were cancelled and why, \
         and what the operator should check or rerun next. Answer in plain prose.\n\
         \n\
         Execution results:\n```json\n{digest}\n```"
    ))
}

#[async_trait]
impl AdvisoryGateway for HttpAdvisoryGateway {
    async fn check_health(&self) -> Result<(), AdvisoryError> {
        self.session_id().await.map(|_| ())
    }

    async fn assess(&self, context: &AdvisoryContext) -> Result<Assessment, AdvisoryError> {
        let prompt = assessment_prompt(context)?;
        let text = self.send_message(prompt).await?;
        let assessment = parse_assessment(&text);
        tracing::info!(
            "Advisory assessment: risk {}, recommends {}",
            assessment.risk_level,
            assessment.recommendation
        );
        Ok(assessment)
    }

    async fn summarize(&self, digest: &ExecutionDigest) -> Result<String, AdvisoryError> {
        let prompt = final_report_prompt(digest)?;
        let text = self.send_message(prompt).await?;
        let report = text.trim();
        if report.is_empty() {
            return Err(AdvisoryError::InvalidResponse(
                "final report reply was empty".to_string(),
            ));
        }
        tracing::info!("Advisory final report received ({} chars)", report.len());
        Ok(report.to_string())
    }
}

/// Creates an [`HttpAdvisoryGateway`] per descriptor
#[derive(Debug, Clone)]
pub struct HttpAdvisoryConnector {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl Default for HttpAdvisoryConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl HttpAdvisoryConnector {
    /// Connector with default timeouts
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: per-request deadline
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl AdvisoryConnector for HttpAdvisoryConnector {
    fn connect(
        &self,
        descriptor: &AdvisoryDescriptor,
    ) -> Result<Arc<dyn AdvisoryGateway>, AdvisoryError> {
        let gateway =
            HttpAdvisoryGateway::new(descriptor, self.connect_timeout, self.request_timeout)?;
        Ok(Arc::new(gateway))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_trimmed() {
        let descriptor = AdvisoryDescriptor::new("https://advisory.example/", "key");
        let gateway = HttpAdvisoryGateway::new(
            &descriptor,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(gateway.base_url(), "https://advisory.example");
        assert!(!format!("{gateway:?}").contains("key"));
    }

    #[test]
    fn test_invalid_api_key_is_rejected() {
        let descriptor = AdvisoryDescriptor::new("https://advisory.example", "bad\nkey");
        let err = HttpAdvisoryGateway::new(
            &descriptor,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, AdvisoryError::Transport(_)));
    }

    #[test]
    fn test_final_report_prompt_embeds_digest() {
        use dmo_kernel::engine::ExecutionOutcome;

        let digest = ExecutionDigest {
            outcome: ExecutionOutcome::PartialFailure,
            cancelled: false,
            rows_copied: 12,
            duration_ms: 40,
            tables: vec![],
        };
        let prompt = final_report_prompt(&digest).unwrap();
        assert!(prompt.starts_with("The approved table-by-table copy has finished."));
        assert!(prompt.contains("\"outcome\": \"partial_failure\""));
        assert!(prompt.contains("\"rows_copied\": 12"));
        assert!(prompt.trim_end().ends_with("```"));
    }

    #[tokio::test]
    async fn test_unreachable_service_is_a_transport_error() {
        // Port 9 (discard) on loopback is not expected to accept HTTP
        let descriptor = AdvisoryDescriptor::new("http://127.0.0.1:9", "key");
        let gateway = HttpAdvisoryGateway::new(
            &descriptor,
            Duration::from_millis(200),
            Duration::from_millis(500),
        )
        .unwrap();
        let err = gateway.check_health().await.unwrap_err();
        assert!(err.is_retryable());
    }
}
