//! Client for the local classification service.
//!
//! The service takes a fundus photograph as a multipart upload and answers
//! with a classification, per-class probabilities, and preliminary findings.
//! Everything past the HTTP edge is mapped into crate types here, so the
//! rest of the application never sees the wire format.

use std::collections::BTreeMap;

use base64::Engine as _;
use serde::Deserialize;
use thiserror::Error;

use crate::models::{
    Classification, ConfidenceTier, DetectionStatus, NewDetection, PreliminaryFinding,
    ReviewUrgency,
};

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("cannot reach classification service at {0}")]
    Connection(String),

    #[error("classification service HTTP error: {status}: {body}")]
    Service { status: u16, body: String },

    #[error("failed to parse classification response: {0}")]
    ResponseParsing(String),

    #[error("HTTP client error: {0}")]
    HttpClient(String),
}

/// What an analysis produced, already in crate types.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    pub classification: Classification,
    pub confidence: f64,
    pub all_probabilities: BTreeMap<Classification, f64>,
    pub preliminary_findings: Vec<PreliminaryFinding>,
    pub review_urgency: ReviewUrgency,
    /// The service answers with canned output when no model is loaded.
    pub demo_mode: bool,
}

impl AnalysisResult {
    /// Build the detection record for this analysis. The image itself is
    /// embedded base64 so the record is self-contained.
    pub fn into_new_detection(
        self,
        user_id: &str,
        patient_name: &str,
        patient_age: u32,
        image: &[u8],
        image_path: Option<String>,
    ) -> NewDetection {
        let description = format!(
            "Automated screening: {} ({:.0}% confidence)",
            self.classification.display_name(),
            self.confidence * 100.0
        );
        NewDetection {
            user_id: user_id.to_string(),
            patient_name: patient_name.to_string(),
            patient_age,
            image_path,
            image_base64: Some(base64::engine::general_purpose::STANDARD.encode(image)),
            classification: Some(self.classification),
            confidence: self.confidence,
            description,
            remarks: String::new(),
            status: DetectionStatus::Analyzed,
            preliminary_findings: Some(self.preliminary_findings),
            all_probabilities: Some(self.all_probabilities),
            review_urgency: Some(self.review_urgency),
        }
    }
}

pub trait Classifier {
    fn classify(&self, image: &[u8], file_name: &str) -> Result<AnalysisResult, InferenceError>;
    fn health(&self) -> Result<bool, InferenceError>;
}

/// HTTP client for the classification service.
pub struct RemoteClassifier {
    base_url: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

impl RemoteClassifier {
    pub fn new(base_url: &str, timeout_secs: u64) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            timeout_secs,
        }
    }

    /// Default service instance at localhost:5000 with a 60s timeout.
    pub fn default_local() -> Self {
        Self::new("http://localhost:5000", 60)
    }

    fn map_send_error(&self, e: reqwest::Error) -> InferenceError {
        if e.is_connect() {
            InferenceError::Connection(self.base_url.clone())
        } else if e.is_timeout() {
            InferenceError::HttpClient(format!("Request timed out after {}s", self.timeout_secs))
        } else {
            InferenceError::HttpClient(e.to_string())
        }
    }
}

/// Response body from POST /predict
#[derive(Deserialize)]
struct PredictResponse {
    classification: Classification,
    confidence: f64,
    #[serde(default)]
    all_probabilities: BTreeMap<Classification, f64>,
    #[serde(default)]
    preliminary_findings: Vec<RawFinding>,
    #[serde(default)]
    review_urgency: Option<ReviewUrgency>,
    #[serde(default)]
    demo_mode: bool,
}

/// Findings come over the wire without a confidence tier; the tier is
/// derived from the overall confidence.
#[derive(Deserialize)]
struct RawFinding {
    finding: String,
    detected: bool,
}

/// Response body from GET /health
#[derive(Deserialize)]
struct HealthResponse {
    status: String,
}

fn map_response(parsed: PredictResponse) -> AnalysisResult {
    let tier = ConfidenceTier::from_confidence(parsed.confidence);
    let review_urgency = parsed.review_urgency.unwrap_or_else(|| {
        ReviewUrgency::for_classification(parsed.classification, parsed.confidence)
    });
    AnalysisResult {
        classification: parsed.classification,
        confidence: parsed.confidence,
        all_probabilities: parsed.all_probabilities,
        preliminary_findings: parsed
            .preliminary_findings
            .into_iter()
            .map(|f| PreliminaryFinding {
                finding: f.finding,
                detected: f.detected,
                confidence: tier,
            })
            .collect(),
        review_urgency,
        demo_mode: parsed.demo_mode,
    }
}

impl Classifier for RemoteClassifier {
    fn classify(&self, image: &[u8], file_name: &str) -> Result<AnalysisResult, InferenceError> {
        let url = format!("{}/predict", self.base_url);
        let part = reqwest::blocking::multipart::Part::bytes(image.to_vec())
            .file_name(file_name.to_string());
        let form = reqwest::blocking::multipart::Form::new().part("image", part);

        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(InferenceError::Service {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: PredictResponse = response
            .json()
            .map_err(|e| InferenceError::ResponseParsing(e.to_string()))?;
        tracing::debug!(
            classification = parsed.classification.as_str(),
            confidence = parsed.confidence,
            demo_mode = parsed.demo_mode,
            "classification received"
        );
        Ok(map_response(parsed))
    }

    fn health(&self) -> Result<bool, InferenceError> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| self.map_send_error(e))?;
        if !response.status().is_success() {
            return Ok(false);
        }
        let parsed: HealthResponse = response
            .json()
            .map_err(|e| InferenceError::ResponseParsing(e.to_string()))?;
        Ok(parsed.status == "healthy")
    }
}

/// Canned classifier for tests and offline demos.
pub struct MockClassifier {
    pub result: AnalysisResult,
}

impl MockClassifier {
    pub fn normal() -> Self {
        Self {
            result: AnalysisResult {
                classification: Classification::Normal,
                confidence: 0.97,
                all_probabilities: BTreeMap::from([(Classification::Normal, 0.97)]),
                preliminary_findings: vec![PreliminaryFinding {
                    finding: "No abnormality detected".into(),
                    detected: false,
                    confidence: ConfidenceTier::High,
                }],
                review_urgency: ReviewUrgency::Routine,
                demo_mode: true,
            },
        }
    }
}

impl Classifier for MockClassifier {
    fn classify(&self, _image: &[u8], _file_name: &str) -> Result<AnalysisResult, InferenceError> {
        Ok(self.result.clone())
    }

    fn health(&self) -> Result<bool, InferenceError> {
        Ok(true)
    }
}
