use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::enums::{
    Classification, ConfidenceTier, DetectionStatus, ReviewSeverity, ReviewUrgency,
};

/// One screening case: an uploaded fundus image, its classification result,
/// and the review workflow state.
///
/// `preliminary_findings` and `all_probabilities` are stored as JSON text
/// columns; serde field names are camelCase for continuity with records
/// imported from the legacy flat store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub id: String,
    pub user_id: String,
    pub patient_name: String,
    pub patient_age: u32,
    pub image_path: Option<String>,
    pub image_base64: Option<String>,
    pub classification: Option<Classification>,
    pub confidence: f64,
    pub description: String,
    pub remarks: String,
    pub status: DetectionStatus,
    pub preliminary_findings: Option<Vec<PreliminaryFinding>>,
    pub all_probabilities: Option<BTreeMap<Classification, f64>>,
    pub review_urgency: Option<ReviewUrgency>,
    pub doctor_review: Option<DoctorReview>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single automated finding attached to a detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreliminaryFinding {
    pub finding: String,
    pub detected: bool,
    pub confidence: ConfidenceTier,
}

/// A clinician's assessment of one detection. At most one per detection;
/// attaching a new review replaces the old one outright.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoctorReview {
    pub doctor_id: String,
    pub doctor_name: String,
    pub diagnosis: String,
    pub recommendations: String,
    pub severity: ReviewSeverity,
    pub follow_up_date: Option<NaiveDate>,
    pub reviewed_at: DateTime<Utc>,
}

/// Review fields as submitted; the repository stamps `reviewed_at` and the
/// row id. Unknown JSON fields (e.g. a legacy `reviewedAt`) are ignored on
/// deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewInput {
    pub doctor_id: String,
    pub doctor_name: String,
    pub diagnosis: String,
    pub recommendations: String,
    pub severity: ReviewSeverity,
    #[serde(default)]
    pub follow_up_date: Option<NaiveDate>,
}

/// Input for detection creation; id and both timestamps are stamped by the
/// repository.
#[derive(Debug, Clone, Default)]
pub struct NewDetection {
    pub user_id: String,
    pub patient_name: String,
    pub patient_age: u32,
    pub image_path: Option<String>,
    pub image_base64: Option<String>,
    pub classification: Option<Classification>,
    pub confidence: f64,
    pub description: String,
    pub remarks: String,
    pub status: DetectionStatus,
    pub preliminary_findings: Option<Vec<PreliminaryFinding>>,
    pub all_probabilities: Option<BTreeMap<Classification, f64>>,
    pub review_urgency: Option<ReviewUrgency>,
}

/// Partial update. `None` fields are left untouched; `updated_at` is always
/// refreshed. Optional columns cannot be cleared back to NULL through this
/// type, matching the original update surface.
#[derive(Debug, Clone, Default)]
pub struct DetectionUpdate {
    pub patient_name: Option<String>,
    pub patient_age: Option<u32>,
    pub classification: Option<Classification>,
    pub confidence: Option<f64>,
    pub description: Option<String>,
    pub remarks: Option<String>,
    pub status: Option<DetectionStatus>,
    pub preliminary_findings: Option<Vec<PreliminaryFinding>>,
    pub all_probabilities: Option<BTreeMap<Classification, f64>>,
    pub review_urgency: Option<ReviewUrgency>,
}

impl DetectionUpdate {
    /// True when no field is set; the repository still refreshes
    /// `updated_at` in that case.
    pub fn is_empty(&self) -> bool {
        self.patient_name.is_none()
            && self.patient_age.is_none()
            && self.classification.is_none()
            && self.confidence.is_none()
            && self.description.is_none()
            && self.remarks.is_none()
            && self.status.is_none()
            && self.preliminary_findings.is_none()
            && self.all_probabilities.is_none()
            && self.review_urgency.is_none()
    }
}
