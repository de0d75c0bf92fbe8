use std::str::FromStr;
use std::sync::Arc;

use rusqlite::{params, Row, ToSql};
use serde::Serialize;
use uuid::Uuid;

use crate::db::engine::StorageEngine;
use crate::db::{format_timestamp, now, parse_timestamp, StorageError};
use crate::models::{
    Classification, Detection, DetectionStatus, DetectionUpdate, DoctorReview, NewDetection,
    ReviewInput, ReviewSeverity, ReviewUrgency,
};

const DETECTION_COLUMNS: &str =
    "d.id, d.user_id, d.patient_name, d.patient_age, d.image_path, d.image_base64, \
     d.classification, d.confidence, d.description, d.remarks, d.status, \
     d.preliminary_findings, d.all_probabilities, d.review_urgency, d.created_at, d.updated_at";

const REVIEW_COLUMNS: &str = "r.doctor_id, r.doctor_name, r.diagnosis, r.recommendations, \
     r.severity, r.follow_up_date, r.reviewed_at";

/// A detection and its 0..1 review always travel in one LEFT JOIN
/// statement, so every entity is assembled from a single consistent
/// snapshot under one engine-lock acquisition. Reading them separately
/// would let a concurrent review attach (or delete) land between the two
/// reads, yielding a reviewed status without its review or the reverse.
fn select_sql(filter: &str) -> String {
    format!(
        "SELECT {DETECTION_COLUMNS}, {REVIEW_COLUMNS}
         FROM detections d
         LEFT JOIN doctor_reviews r ON r.detection_id = d.id
         {filter}"
    )
}

/// Screening cases. Nothing is cached outside the engine.
pub struct DetectionRepository {
    engine: Arc<StorageEngine>,
}

impl DetectionRepository {
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        Self { engine }
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<Detection>, StorageError> {
        let row = self
            .engine
            .get(&select_sql("WHERE d.id = ?1"), params![id], map_joined_row)?;
        row.map(detection_from_row).transpose()
    }

    /// All detections recorded by one user, most recent first.
    pub fn find_by_user(&self, user_id: &str) -> Result<Vec<Detection>, StorageError> {
        let rows = self.engine.all(
            &select_sql("WHERE d.user_id = ?1 ORDER BY d.created_at DESC"),
            params![user_id],
            map_joined_row,
        )?;
        rows.into_iter().map(detection_from_row).collect()
    }

    /// Every detection, most recent first.
    pub fn find_all(&self) -> Result<Vec<Detection>, StorageError> {
        let rows = self.engine.all(
            &select_sql("ORDER BY d.created_at DESC"),
            [],
            map_joined_row,
        )?;
        rows.into_iter().map(detection_from_row).collect()
    }

    /// Insert a new case and persist. Both timestamps are stamped to the
    /// same instant; structured fields are JSON-encoded for storage.
    pub fn create(&self, fields: NewDetection) -> Result<Detection, StorageError> {
        let stamp = now();
        let detection = Detection {
            id: Uuid::new_v4().to_string(),
            user_id: fields.user_id,
            patient_name: fields.patient_name,
            patient_age: fields.patient_age,
            image_path: fields.image_path,
            image_base64: fields.image_base64,
            classification: fields.classification,
            confidence: fields.confidence,
            description: fields.description,
            remarks: fields.remarks,
            status: fields.status,
            preliminary_findings: fields.preliminary_findings,
            all_probabilities: fields.all_probabilities,
            review_urgency: fields.review_urgency,
            doctor_review: None,
            created_at: stamp,
            updated_at: stamp,
        };

        let findings_json = detection
            .preliminary_findings
            .as_ref()
            .map(|f| encode_json(f, "preliminary_findings"))
            .transpose()?;
        let probabilities_json = detection
            .all_probabilities
            .as_ref()
            .map(|p| encode_json(p, "all_probabilities"))
            .transpose()?;

        self.engine.run(
            "INSERT INTO detections (
                id, user_id, patient_name, patient_age, image_path, image_base64,
                classification, confidence, description, remarks, status,
                preliminary_findings, all_probabilities, review_urgency,
                created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                detection.id,
                detection.user_id,
                detection.patient_name,
                detection.patient_age,
                detection.image_path,
                detection.image_base64,
                detection.classification.map(|c| c.as_str()),
                detection.confidence,
                detection.description,
                detection.remarks,
                detection.status.as_str(),
                findings_json,
                probabilities_json,
                detection.review_urgency.map(|u| u.as_str()),
                format_timestamp(&detection.created_at),
                format_timestamp(&detection.updated_at),
            ],
        )?;

        self.engine.save()?;
        tracing::info!(detection_id = %detection.id, status = detection.status.as_str(), "detection created");
        Ok(detection)
    }

    /// Apply only the provided fields, always refreshing `updated_at`.
    /// Returns `None` when the id does not exist.
    pub fn update(
        &self,
        id: &str,
        changes: DetectionUpdate,
    ) -> Result<Option<Detection>, StorageError> {
        if self.find_by_id(id)?.is_none() {
            return Ok(None);
        }

        let mut sets: Vec<&'static str> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(name) = changes.patient_name {
            sets.push("patient_name = ?");
            values.push(Box::new(name));
        }
        if let Some(age) = changes.patient_age {
            sets.push("patient_age = ?");
            values.push(Box::new(age));
        }
        if let Some(classification) = changes.classification {
            sets.push("classification = ?");
            values.push(Box::new(classification.as_str()));
        }
        if let Some(confidence) = changes.confidence {
            sets.push("confidence = ?");
            values.push(Box::new(confidence));
        }
        if let Some(description) = changes.description {
            sets.push("description = ?");
            values.push(Box::new(description));
        }
        if let Some(remarks) = changes.remarks {
            sets.push("remarks = ?");
            values.push(Box::new(remarks));
        }
        if let Some(status) = changes.status {
            sets.push("status = ?");
            values.push(Box::new(status.as_str()));
        }
        if let Some(findings) = changes.preliminary_findings {
            sets.push("preliminary_findings = ?");
            values.push(Box::new(encode_json(&findings, "preliminary_findings")?));
        }
        if let Some(probabilities) = changes.all_probabilities {
            sets.push("all_probabilities = ?");
            values.push(Box::new(encode_json(&probabilities, "all_probabilities")?));
        }
        if let Some(urgency) = changes.review_urgency {
            sets.push("review_urgency = ?");
            values.push(Box::new(urgency.as_str()));
        }

        sets.push("updated_at = ?");
        values.push(Box::new(format_timestamp(&now())));
        values.push(Box::new(id.to_string()));

        let sql = format!("UPDATE detections SET {} WHERE id = ?", sets.join(", "));
        let param_refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
        self.engine.run(&sql, &param_refs[..])?;

        self.engine.save()?;
        self.find_by_id(id)
    }

    /// Remove a detection; the engine's cascade removes its review.
    /// Returns `false` when the id does not exist.
    pub fn delete(&self, id: &str) -> Result<bool, StorageError> {
        let removed = self
            .engine
            .run("DELETE FROM detections WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Ok(false);
        }
        self.engine.save()?;
        tracing::info!(detection_id = %id, "detection deleted");
        Ok(true)
    }

    /// Attach (or replace) the doctor review for a detection and force its
    /// status to reviewed. Runs as one critical section: a concurrent
    /// reader can never see the reviewed status without the review row, or
    /// a half-replaced review. Returns `None` when the id does not exist.
    pub fn add_doctor_review(
        &self,
        detection_id: &str,
        review: ReviewInput,
    ) -> Result<Option<Detection>, StorageError> {
        let review_id = Uuid::new_v4().to_string();
        let reviewed_at = now();

        let applied = self.engine.with_transaction(|tx| {
            let exists = tx
                .prepare("SELECT 1 FROM detections WHERE id = ?1")?
                .exists(params![detection_id])?;
            if !exists {
                return Ok(false);
            }

            // Replace semantics: any prior review goes away wholesale.
            tx.execute(
                "DELETE FROM doctor_reviews WHERE detection_id = ?1",
                params![detection_id],
            )?;
            tx.execute(
                "INSERT INTO doctor_reviews (
                    id, detection_id, doctor_id, doctor_name, diagnosis,
                    recommendations, severity, follow_up_date, reviewed_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    review_id,
                    detection_id,
                    review.doctor_id,
                    review.doctor_name,
                    review.diagnosis,
                    review.recommendations,
                    review.severity.as_str(),
                    review.follow_up_date.map(|d| d.to_string()),
                    format_timestamp(&reviewed_at),
                ],
            )?;
            tx.execute(
                "UPDATE detections SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![
                    DetectionStatus::Reviewed.as_str(),
                    format_timestamp(&reviewed_at),
                    detection_id,
                ],
            )?;
            Ok(true)
        })?;

        if !applied {
            return Ok(None);
        }
        tracing::info!(detection_id = %detection_id, "doctor review attached");
        self.find_by_id(detection_id)
    }

}

fn encode_json<T: Serialize>(value: &T, field: &str) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|e| StorageError::Decode {
        field: field.into(),
        reason: e.to_string(),
    })
}

fn decode_json<T: serde::de::DeserializeOwned>(
    raw: &str,
    field: &str,
) -> Result<T, StorageError> {
    serde_json::from_str(raw).map_err(|e| StorageError::Decode {
        field: field.into(),
        reason: e.to_string(),
    })
}

struct DetectionRow {
    id: String,
    user_id: String,
    patient_name: String,
    patient_age: u32,
    image_path: Option<String>,
    image_base64: Option<String>,
    classification: Option<String>,
    confidence: f64,
    description: String,
    remarks: String,
    status: String,
    preliminary_findings: Option<String>,
    all_probabilities: Option<String>,
    review_urgency: Option<String>,
    created_at: String,
    updated_at: String,
}

/// Map one joined row. A NULL right side (no review) shows up as a NULL
/// `r.doctor_id`, which is NOT NULL on real review rows.
fn map_joined_row(row: &Row<'_>) -> rusqlite::Result<(DetectionRow, Option<ReviewRow>)> {
    let detection = DetectionRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        patient_name: row.get(2)?,
        patient_age: row.get(3)?,
        image_path: row.get(4)?,
        image_base64: row.get(5)?,
        classification: row.get(6)?,
        confidence: row.get(7)?,
        description: row.get(8)?,
        remarks: row.get(9)?,
        status: row.get(10)?,
        preliminary_findings: row.get(11)?,
        all_probabilities: row.get(12)?,
        review_urgency: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    };
    let review = match row.get::<_, Option<String>>(16)? {
        Some(doctor_id) => Some(ReviewRow {
            doctor_id,
            doctor_name: row.get(17)?,
            diagnosis: row.get(18)?,
            recommendations: row.get(19)?,
            severity: row.get(20)?,
            follow_up_date: row.get(21)?,
            reviewed_at: row.get(22)?,
        }),
        None => None,
    };
    Ok((detection, review))
}

fn detection_from_row(
    (row, review): (DetectionRow, Option<ReviewRow>),
) -> Result<Detection, StorageError> {
    Ok(Detection {
        id: row.id,
        user_id: row.user_id,
        patient_name: row.patient_name,
        patient_age: row.patient_age,
        image_path: row.image_path,
        image_base64: row.image_base64,
        classification: row
            .classification
            .as_deref()
            .map(Classification::from_str)
            .transpose()?,
        confidence: row.confidence,
        description: row.description,
        remarks: row.remarks,
        status: DetectionStatus::from_str(&row.status)?,
        preliminary_findings: row
            .preliminary_findings
            .as_deref()
            .map(|raw| decode_json(raw, "preliminary_findings"))
            .transpose()?,
        all_probabilities: row
            .all_probabilities
            .as_deref()
            .map(|raw| decode_json(raw, "all_probabilities"))
            .transpose()?,
        review_urgency: row
            .review_urgency
            .as_deref()
            .map(ReviewUrgency::from_str)
            .transpose()?,
        doctor_review: review.map(review_from_row).transpose()?,
        created_at: parse_timestamp(&row.created_at, "detections.created_at")?,
        updated_at: parse_timestamp(&row.updated_at, "detections.updated_at")?,
    })
}

struct ReviewRow {
    doctor_id: String,
    doctor_name: String,
    diagnosis: String,
    recommendations: String,
    severity: String,
    follow_up_date: Option<String>,
    reviewed_at: String,
}

fn review_from_row(row: ReviewRow) -> Result<DoctorReview, StorageError> {
    let follow_up_date = row
        .follow_up_date
        .as_deref()
        .map(|raw| {
            raw.parse().map_err(|_| StorageError::Decode {
                field: "doctor_reviews.follow_up_date".into(),
                reason: format!("not a calendar date: {raw}"),
            })
        })
        .transpose()?;
    Ok(DoctorReview {
        doctor_id: row.doctor_id,
        doctor_name: row.doctor_name,
        diagnosis: row.diagnosis,
        recommendations: row.recommendations,
        severity: ReviewSeverity::from_str(&row.severity)?,
        follow_up_date,
        reviewed_at: parse_timestamp(&row.reviewed_at, "doctor_reviews.reviewed_at")?,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use chrono::NaiveDate;

    use super::*;
    use crate::db::byte_store::MemoryByteStore;
    use crate::db::schema::DEFAULT_DOCTOR;
    use crate::models::{ConfidenceTier, PreliminaryFinding};

    fn setup() -> (Arc<StorageEngine>, DetectionRepository) {
        let engine = Arc::new(StorageEngine::new(Box::new(MemoryByteStore::new())));
        engine.initialize().unwrap();
        let repo = DetectionRepository::new(Arc::clone(&engine));
        (engine, repo)
    }

    fn glaucoma_case() -> NewDetection {
        let mut probabilities = BTreeMap::new();
        probabilities.insert(Classification::Glaucoma, 0.91);
        probabilities.insert(Classification::Normal, 0.04);
        probabilities.insert(Classification::Cataract, 0.03);
        probabilities.insert(Classification::DiabeticRetinopathy, 0.02);

        NewDetection {
            user_id: DEFAULT_DOCTOR.id.into(),
            patient_name: "Jane Roe".into(),
            patient_age: 58,
            image_path: Some("/scans/jane-roe.jpg".into()),
            image_base64: None,
            classification: Some(Classification::Glaucoma),
            confidence: 0.91,
            description: "Right eye fundus".into(),
            remarks: "Routine screening".into(),
            status: DetectionStatus::Analyzed,
            preliminary_findings: Some(vec![PreliminaryFinding {
                finding: "Optic disk abnormality noted".into(),
                detected: true,
                confidence: ConfidenceTier::High,
            }]),
            all_probabilities: Some(probabilities),
            review_urgency: Some(ReviewUrgency::Urgent),
        }
    }

    fn review_by_default_doctor(diagnosis: &str) -> ReviewInput {
        ReviewInput {
            doctor_id: DEFAULT_DOCTOR.id.into(),
            doctor_name: DEFAULT_DOCTOR.name.into(),
            diagnosis: diagnosis.into(),
            recommendations: "Refer to specialist".into(),
            severity: ReviewSeverity::Moderate,
            follow_up_date: Some(NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()),
        }
    }

    #[test]
    fn create_then_find_returns_equal_entity() {
        let (_, repo) = setup();
        let created = repo.create(glaucoma_case()).unwrap();
        assert_eq!(created.created_at, created.updated_at);

        let loaded = repo.find_by_id(&created.id).unwrap().unwrap();
        assert_eq!(loaded, created);
    }

    #[test]
    fn analyzed_case_stays_analyzed_until_reviewed() {
        let (_, repo) = setup();
        let created = repo.create(glaucoma_case()).unwrap();
        assert_eq!(created.status, DetectionStatus::Analyzed);
        assert!(created.doctor_review.is_none());

        let loaded = repo.find_by_id(&created.id).unwrap().unwrap();
        assert_eq!(loaded.status, DetectionStatus::Analyzed);
    }

    #[test]
    fn partial_update_touches_only_named_fields() {
        let (_, repo) = setup();
        let created = repo.create(glaucoma_case()).unwrap();

        std::thread::sleep(Duration::from_millis(2));
        let updated = repo
            .update(
                &created.id,
                DetectionUpdate {
                    remarks: Some("needs second opinion".into()),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();

        assert_eq!(updated.remarks, "needs second opinion");
        assert!(updated.updated_at > created.updated_at);
        assert_eq!(
            Detection {
                remarks: created.remarks.clone(),
                updated_at: created.updated_at,
                ..updated
            },
            created,
            "all other fields must retain prior values"
        );
    }

    #[test]
    fn update_unknown_id_returns_none() {
        let (_, repo) = setup();
        let result = repo
            .update(
                "no-such-detection",
                DetectionUpdate {
                    remarks: Some("x".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn listings_are_most_recent_first_with_reviews_attached() {
        let (_, repo) = setup();
        let first = repo.create(glaucoma_case()).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let second = repo.create(glaucoma_case()).unwrap();
        repo.add_doctor_review(&first.id, review_by_default_doctor("dx"))
            .unwrap()
            .unwrap();

        let all = repo.find_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, second.id);
        assert_eq!(all[1].id, first.id);
        assert!(all[1].doctor_review.is_some());

        let by_user = repo.find_by_user(DEFAULT_DOCTOR.id).unwrap();
        assert_eq!(by_user.len(), 2);
        assert_eq!(by_user[0].id, second.id);

        assert!(repo.find_by_user("nobody").unwrap().is_empty());
    }

    #[test]
    fn add_review_forces_reviewed_status_and_attaches_fields() {
        let (_, repo) = setup();
        let created = repo.create(glaucoma_case()).unwrap();
        let input = review_by_default_doctor("Early-stage glaucoma");

        let reviewed = repo
            .add_doctor_review(&created.id, input.clone())
            .unwrap()
            .unwrap();

        assert_eq!(reviewed.status, DetectionStatus::Reviewed);
        let review = reviewed.doctor_review.unwrap();
        assert_eq!(review.doctor_id, input.doctor_id);
        assert_eq!(review.diagnosis, input.diagnosis);
        assert_eq!(review.severity, input.severity);
        assert_eq!(review.follow_up_date, input.follow_up_date);
        assert_eq!(reviewed.updated_at, review.reviewed_at);
    }

    #[test]
    fn replacing_a_review_does_not_leak_prior_fields() {
        let (_, repo) = setup();
        let created = repo.create(glaucoma_case()).unwrap();
        repo.add_doctor_review(&created.id, review_by_default_doctor("first opinion"))
            .unwrap()
            .unwrap();

        let replacement = ReviewInput {
            doctor_id: DEFAULT_DOCTOR.id.into(),
            doctor_name: DEFAULT_DOCTOR.name.into(),
            diagnosis: "second opinion".into(),
            recommendations: "Monitor quarterly".into(),
            severity: ReviewSeverity::Mild,
            follow_up_date: None,
        };
        let reviewed = repo
            .add_doctor_review(&created.id, replacement)
            .unwrap()
            .unwrap();

        let review = reviewed.doctor_review.unwrap();
        assert_eq!(review.diagnosis, "second opinion");
        assert_eq!(review.severity, ReviewSeverity::Mild);
        assert_eq!(review.follow_up_date, None, "prior follow-up must not leak");
        assert_eq!(reviewed.status, DetectionStatus::Reviewed);
    }

    #[test]
    fn reader_never_sees_review_attach_half_applied() {
        let (_, repo) = setup();
        let repo = Arc::new(repo);
        let ids: Vec<String> = (0..40)
            .map(|_| repo.create(glaucoma_case()).unwrap().id)
            .collect();

        let writer = {
            let repo = Arc::clone(&repo);
            let ids = ids.clone();
            std::thread::spawn(move || {
                for id in ids {
                    repo.add_doctor_review(&id, review_by_default_doctor("dx"))
                        .unwrap()
                        .unwrap();
                }
            })
        };

        // Each load must be internally consistent: a review implies the
        // reviewed status and the reviewed status implies a review,
        // whatever the writer is doing at that moment.
        while !writer.is_finished() {
            for id in &ids {
                let detection = repo.find_by_id(id).unwrap().unwrap();
                match detection.doctor_review {
                    Some(_) => assert_eq!(detection.status, DetectionStatus::Reviewed),
                    None => assert_ne!(detection.status, DetectionStatus::Reviewed),
                }
            }
        }
        writer.join().unwrap();
    }

    #[test]
    fn add_review_to_unknown_detection_returns_none() {
        let (engine, repo) = setup();
        let result = repo
            .add_doctor_review("ghost", review_by_default_doctor("dx"))
            .unwrap();
        assert!(result.is_none());

        let reviews: i64 = engine
            .get("SELECT COUNT(*) FROM doctor_reviews", [], |row| row.get(0))
            .unwrap()
            .unwrap();
        assert_eq!(reviews, 0);
    }

    #[test]
    fn delete_cascades_to_review() {
        let (engine, repo) = setup();
        let created = repo.create(glaucoma_case()).unwrap();
        repo.add_doctor_review(&created.id, review_by_default_doctor("dx"))
            .unwrap()
            .unwrap();

        assert!(repo.delete(&created.id).unwrap());
        assert!(repo.find_by_id(&created.id).unwrap().is_none());

        let orphaned: i64 = engine
            .get(
                "SELECT COUNT(*) FROM doctor_reviews WHERE detection_id = ?1",
                params![created.id],
                |row| row.get(0),
            )
            .unwrap()
            .unwrap();
        assert_eq!(orphaned, 0);

        assert!(!repo.delete(&created.id).unwrap());
    }

    #[test]
    fn malformed_stored_findings_surface_decode_error() {
        let (engine, repo) = setup();
        let created = repo.create(glaucoma_case()).unwrap();

        engine
            .run(
                "UPDATE detections SET preliminary_findings = 'not json' WHERE id = ?1",
                params![created.id],
            )
            .unwrap();

        let err = repo.find_by_id(&created.id).unwrap_err();
        match err {
            StorageError::Decode { field, .. } => assert_eq!(field, "preliminary_findings"),
            other => panic!("expected Decode, got: {other}"),
        }
    }
}
