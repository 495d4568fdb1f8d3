//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Analysis reports produced by an external text generator."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gridtel_common::reading::{CURRENT_ALARM_THRESHOLD, NOMINAL_VOLTAGE_RANGE};
use gridtel_common::{Reading, ReportConfig};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{GridError, ServiceError, ValidationError};

/// Opaque prompt-to-text collaborator.
#[async_trait]
pub trait TextGenerator: Send + Sync + 'static {
    async fn generate(&self, prompt: &str) -> Result<String, ServiceError>;
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

/// Text generator speaking the `generateContent` JSON protocol over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTextGenerator {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
    key_source: String,
}

impl HttpTextGenerator {
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ServiceError::Unavailable(format!("unable to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            endpoint,
            api_key: None,
            key_source: String::from("api key"),
        })
    }

    /// Build from configuration. The API key is read from the configured
    /// environment variable; a missing key surfaces on the first request.
    pub fn from_config(config: &ReportConfig) -> Result<Self, ServiceError> {
        let mut generator = Self::new(config.endpoint.clone(), config.timeout)?;
        generator.key_source = config.api_key_env.clone();
        match std::env::var(&config.api_key_env) {
            Ok(key) if !key.trim().is_empty() => generator.api_key = Some(key),
            _ => warn!(env = %config.api_key_env, "report API key not set; /report will be unavailable"),
        }
        Ok(generator)
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl TextGenerator for HttpTextGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, ServiceError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ServiceError::NotConfigured(format!("{} is not set", self.key_source)))?;

        let body = GenerateRequest {
            contents: [Content {
                parts: [Part { text: prompt }],
            }],
        };
        debug!(endpoint = %self.endpoint, prompt_len = prompt.len(), "requesting report");
        let response = self
            .client
            .post(self.endpoint.clone())
            .header("x-goog-api-key", key)
            .json(&body)
            .send()
            .await
            .map_err(|err| ServiceError::Unavailable(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ServiceError::Unavailable(format!(
                "text generator responded with {status}: {}",
                detail.trim()
            )));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|err| ServiceError::InvalidResponse(err.to_string()))?;
        let text: String = parsed
            .candidates
            .into_iter()
            .next()
            .map(|candidate| {
                candidate
                    .content
                    .parts
                    .into_iter()
                    .map(|part| part.text)
                    .collect()
            })
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(ServiceError::InvalidResponse(
                "response contained no generated text".into(),
            ));
        }
        Ok(text)
    }
}

/// Build the analysis prompt for a set of readings.
pub fn build_prompt(readings: &[Reading]) -> Result<String, ValidationError> {
    let records = serde_json::to_string_pretty(readings)
        .map_err(|err| ValidationError::Unencodable(err.to_string()))?;
    let (low, high) = NOMINAL_VOLTAGE_RANGE;
    Ok(format!(
        "You are an expert power grid analyst. Analyze the following grid sensor \
readings and write a concise report in Markdown.\n\
\n\
The report must contain these sections:\n\
1. **Overview**: a short summary of the data set and the time span it covers.\n\
2. **Key Metrics**: the average, minimum and maximum voltage and current.\n\
3. **Anomaly Detection**: identify readings where voltage falls outside the \
{low}V-{high}V range or current exceeds {CURRENT_ALARM_THRESHOLD}A, listing their ids and timestamps.\n\
4. **Conclusion**: the overall state of the grid and any recommended actions.\n\
\n\
Readings ({count} records):\n\
```json\n{records}\n```\n",
        count = readings.len(),
    ))
}

/// Turns readings into a narrative report via a [`TextGenerator`].
#[derive(Clone)]
pub struct ReportService {
    generator: Arc<dyn TextGenerator>,
}

impl ReportService {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    pub async fn generate_report(&self, readings: &[Reading]) -> Result<String, GridError> {
        if readings.is_empty() {
            return Err(ValidationError::EmptyReportInput.into());
        }
        let prompt = build_prompt(readings)?;
        let report = self.generator.generate(&prompt).await.map_err(|err| {
            warn!(error = %err, readings = readings.len(), "report generation failed");
            err
        })?;
        info!(readings = readings.len(), chars = report.len(), "report generated");
        Ok(report)
    }
}

impl std::fmt::Debug for ReportService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportService").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use parking_lot::Mutex;

    struct Recording {
        prompts: Mutex<Vec<String>>,
        reply: Result<String, ()>,
    }

    #[async_trait]
    impl TextGenerator for Recording {
        async fn generate(&self, prompt: &str) -> Result<String, ServiceError> {
            self.prompts.lock().push(prompt.to_owned());
            self.reply
                .clone()
                .map_err(|_| ServiceError::Unavailable("offline".into()))
        }
    }

    fn readings() -> Vec<Reading> {
        let ts = chrono::Utc.with_ymd_and_hms(2024, 2, 1, 8, 0, 0).unwrap();
        vec![
            Reading {
                id: 1,
                timestamp: ts,
                voltage: 212.3,
                current: 25.0,
                frequency: Some(50.0),
            },
            Reading {
                id: 2,
                timestamp: ts,
                voltage: 230.0,
                current: 11.0,
                frequency: None,
            },
        ]
    }

    #[test]
    fn prompt_names_sections_and_thresholds() {
        let prompt = build_prompt(&readings()).unwrap();
        for section in ["Overview", "Key Metrics", "Anomaly Detection", "Conclusion"] {
            assert!(prompt.contains(section), "missing {section}");
        }
        assert!(prompt.contains("215V-245V"));
        assert!(prompt.contains("exceeds 20A"));
        assert!(prompt.contains("\"voltage\": 212.3"));
        assert!(prompt.contains("Readings (2 records)"));
    }

    #[tokio::test]
    async fn empty_input_never_reaches_the_generator() {
        let generator = Arc::new(Recording {
            prompts: Mutex::new(Vec::new()),
            reply: Ok("unused".into()),
        });
        let service = ReportService::new(generator.clone());
        let err = service.generate_report(&[]).await.unwrap_err();
        assert!(matches!(err, GridError::Validation(ValidationError::EmptyReportInput)));
        assert!(generator.prompts.lock().is_empty());
    }

    #[tokio::test]
    async fn generator_failures_are_service_errors() {
        let service = ReportService::new(Arc::new(Recording {
            prompts: Mutex::new(Vec::new()),
            reply: Err(()),
        }));
        let err = service.generate_report(&readings()).await.unwrap_err();
        assert!(matches!(err, GridError::Service(ServiceError::Unavailable(_))));
    }

    #[tokio::test]
    async fn missing_key_is_not_configured() {
        let generator =
            HttpTextGenerator::new("http://127.0.0.1:9/".parse().unwrap(), Duration::from_secs(1)).unwrap();
        let err = generator.generate("hi").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotConfigured(_)));
    }
}
