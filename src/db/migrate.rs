//! One-shot import of records from the legacy flat key-value store into the
//! relational engine.
//!
//! The legacy deployment kept JSON blobs under well-known keys plus one
//! plaintext credential entry per account. The import runs once per
//! database: a singleton row in `migration_state` records completion, so a
//! fresh image (or a lost one) triggers the import again while a restored
//! image skips it.
//!
//! Legacy records carried their own ids, and the legacy store never enforced
//! referential integrity. Imported users get fresh ids; an id map carries
//! the old ids forward so detections and reviews land on the right accounts.
//!
//! Detections deliberately bypass the repository `create` path: the import
//! inserts rows directly so legacy detection ids and timestamps survive
//! verbatim (a re-created record would be re-stamped and re-identified,
//! breaking anything that kept a reference to the old id).

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Transaction};
use serde::Deserialize;
use uuid::Uuid;

use crate::db::engine::StorageEngine;
use crate::db::repository::UserRepository;
use crate::db::schema::DEFAULT_DOCTOR;
use crate::db::{format_timestamp, now, StorageError};
use crate::models::{
    Classification, DetectionStatus, NewUser, PreliminaryFinding, ReviewSeverity, ReviewUrgency,
    UserRole,
};

const USERS_KEY: &str = "eyecare_users";
const DETECTIONS_KEY: &str = "eyecare_detections";
const FALLBACK_PASSWORD: &str = "migrated";

fn password_key(email: &str) -> String {
    format!("eyecare_pwd_{email}")
}

/// Read access to the legacy flat store.
pub trait LegacyStore {
    fn get(&self, key: &str) -> Option<String>;
}

/// Legacy store dumped to a single JSON object file (key to string value).
/// A missing file is an empty store.
pub struct JsonFileLegacyStore {
    entries: HashMap<String, String>,
}

impl JsonFileLegacyStore {
    pub fn open(path: &Path) -> io::Result<Self> {
        let entries = match fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(io::Error::other)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e),
        };
        Ok(Self { entries })
    }
}

impl LegacyStore for JsonFileLegacyStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }
}

/// In-memory legacy store for tests.
#[derive(Default)]
pub struct MemoryLegacyStore {
    entries: HashMap<String, String>,
}

impl MemoryLegacyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }
}

impl LegacyStore for MemoryLegacyStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub users_migrated: usize,
    pub detections_migrated: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyUser {
    id: String,
    email: String,
    name: String,
    #[serde(default)]
    role: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyDetection {
    id: String,
    user_id: String,
    patient_name: String,
    patient_age: u32,
    #[serde(default)]
    image_path: Option<String>,
    #[serde(default)]
    image_base64: Option<String>,
    #[serde(default)]
    classification: Option<Classification>,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    description: String,
    #[serde(default)]
    remarks: String,
    #[serde(default)]
    status: Option<DetectionStatus>,
    #[serde(default)]
    preliminary_findings: Option<Vec<PreliminaryFinding>>,
    #[serde(default)]
    all_probabilities: Option<BTreeMap<Classification, f64>>,
    #[serde(default)]
    review_urgency: Option<ReviewUrgency>,
    #[serde(default)]
    doctor_review: Option<LegacyReview>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyReview {
    doctor_id: String,
    doctor_name: String,
    diagnosis: String,
    recommendations: String,
    severity: ReviewSeverity,
    #[serde(default)]
    follow_up_date: Option<NaiveDate>,
    #[serde(default)]
    reviewed_at: Option<String>,
}

/// Runs the legacy import against an initialized engine.
pub struct MigrationRunner {
    engine: Arc<StorageEngine>,
    users: UserRepository,
}

impl MigrationRunner {
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        let users = UserRepository::new(Arc::clone(&engine));
        Self { engine, users }
    }

    /// Import everything the legacy store holds, then mark the import done.
    /// A malformed record is logged and skipped; it never aborts the run.
    /// The completion marker is written even when the store is empty.
    pub fn run(&self, legacy: &dyn LegacyStore) -> Result<MigrationReport, StorageError> {
        if self.is_complete()? {
            tracing::debug!("legacy import already completed, skipping");
            return Ok(MigrationReport::default());
        }

        let mut report = MigrationReport::default();
        let id_map = self.import_users(legacy, &mut report)?;
        self.import_detections(legacy, &id_map, &mut report)?;

        self.mark_complete()?;
        self.engine.save()?;
        tracing::info!(
            users = report.users_migrated,
            detections = report.detections_migrated,
            "legacy import completed"
        );
        Ok(report)
    }

    pub fn is_complete(&self) -> Result<bool, StorageError> {
        let done = self.engine.get(
            "SELECT legacy_import_done FROM migration_state WHERE id = 1",
            [],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(done.unwrap_or(0) != 0)
    }

    fn mark_complete(&self) -> Result<(), StorageError> {
        self.engine.run(
            "UPDATE migration_state SET legacy_import_done = 1, completed_at = ?1 WHERE id = 1",
            params![format_timestamp(&now())],
        )?;
        Ok(())
    }

    /// First pass: accounts. Returns the legacy-id to new-id map. An email
    /// already present (the seeded doctor, or a re-registered account) is
    /// not duplicated; its legacy id maps to the existing row.
    fn import_users(
        &self,
        legacy: &dyn LegacyStore,
        report: &mut MigrationReport,
    ) -> Result<HashMap<String, String>, StorageError> {
        let mut id_map = HashMap::new();
        let Some(raw) = legacy.get(USERS_KEY) else {
            return Ok(id_map);
        };

        let records: Vec<serde_json::Value> = match serde_json::from_str(&raw) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "legacy user list is not a JSON array, skipping");
                return Ok(id_map);
            }
        };

        for record in records {
            let user: LegacyUser = match serde_json::from_value(record) {
                Ok(user) => user,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed legacy user record");
                    continue;
                }
            };

            if let Some(existing) = self.users.find_by_email(&user.email)? {
                tracing::debug!(email = %user.email, "legacy user already present, remapping id");
                id_map.insert(user.id, existing.id);
                continue;
            }

            let role = user
                .role
                .as_deref()
                .and_then(|r| UserRole::from_str(r).ok())
                .unwrap_or(UserRole::Technician);
            let password = legacy
                .get(&password_key(&user.email))
                .unwrap_or_else(|| FALLBACK_PASSWORD.to_string());

            match self.users.create(
                NewUser {
                    email: user.email.clone(),
                    name: user.name,
                    role,
                },
                &password,
            ) {
                Ok(created) => {
                    id_map.insert(user.id, created.id);
                    report.users_migrated += 1;
                }
                Err(e) => {
                    tracing::warn!(email = %user.email, error = %e, "skipping legacy user");
                }
            }
        }

        Ok(id_map)
    }

    /// Second pass: detections with their optional reviews, each in its own
    /// transaction so one bad record cannot take down the rest.
    fn import_detections(
        &self,
        legacy: &dyn LegacyStore,
        id_map: &HashMap<String, String>,
        report: &mut MigrationReport,
    ) -> Result<(), StorageError> {
        let Some(raw) = legacy.get(DETECTIONS_KEY) else {
            return Ok(());
        };

        let records: Vec<serde_json::Value> = match serde_json::from_str(&raw) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "legacy detection list is not a JSON array, skipping");
                return Ok(());
            }
        };

        for record in records {
            let detection: LegacyDetection = match serde_json::from_value(record) {
                Ok(detection) => detection,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed legacy detection record");
                    continue;
                }
            };

            let id = detection.id.clone();
            let inserted = self
                .engine
                .with_transaction(|tx| insert_detection(tx, &detection, id_map));
            match inserted {
                Ok(true) => report.detections_migrated += 1,
                Ok(false) => {
                    tracing::warn!(detection_id = %id, "legacy detection owner unknown, skipping");
                }
                Err(e) => {
                    tracing::warn!(detection_id = %id, error = %e, "skipping legacy detection");
                }
            }
        }

        Ok(())
    }
}

/// Map a legacy user reference to a row in `users`: remapped when the first
/// pass saw it, kept when the id already exists, otherwise `None`.
fn resolve_user_id(
    tx: &Transaction<'_>,
    id_map: &HashMap<String, String>,
    legacy_id: &str,
) -> Result<Option<String>, StorageError> {
    if let Some(mapped) = id_map.get(legacy_id) {
        return Ok(Some(mapped.clone()));
    }
    let exists = tx
        .prepare("SELECT 1 FROM users WHERE id = ?1")?
        .exists(params![legacy_id])?;
    Ok(exists.then(|| legacy_id.to_string()))
}

fn parse_legacy_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|r| DateTime::parse_from_rfc3339(r).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(now)
}

fn insert_detection(
    tx: &Transaction<'_>,
    detection: &LegacyDetection,
    id_map: &HashMap<String, String>,
) -> Result<bool, StorageError> {
    let Some(user_id) = resolve_user_id(tx, id_map, &detection.user_id)? else {
        return Ok(false);
    };

    // A record that already carries a review lands directly in reviewed
    // state, whatever its stored status said.
    let status = if detection.doctor_review.is_some() {
        DetectionStatus::Reviewed
    } else {
        detection.status.unwrap_or_default()
    };

    let findings_json = detection
        .preliminary_findings
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StorageError::Decode {
            field: "preliminary_findings".into(),
            reason: e.to_string(),
        })?;
    let probabilities_json = detection
        .all_probabilities
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StorageError::Decode {
            field: "all_probabilities".into(),
            reason: e.to_string(),
        })?;

    let created_at = parse_legacy_timestamp(detection.created_at.as_deref());
    let updated_at = parse_legacy_timestamp(detection.updated_at.as_deref());

    tx.execute(
        "INSERT INTO detections (
            id, user_id, patient_name, patient_age, image_path, image_base64,
            classification, confidence, description, remarks, status,
            preliminary_findings, all_probabilities, review_urgency,
            created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            detection.id,
            user_id,
            detection.patient_name,
            detection.patient_age,
            detection.image_path,
            detection.image_base64,
            detection.classification.map(|c| c.as_str()),
            detection.confidence,
            detection.description,
            detection.remarks,
            status.as_str(),
            findings_json,
            probabilities_json,
            detection.review_urgency.map(|u| u.as_str()),
            format_timestamp(&created_at),
            format_timestamp(&updated_at),
        ],
    )?;

    if let Some(review) = &detection.doctor_review {
        let doctor_id = resolve_user_id(tx, id_map, &review.doctor_id)?
            .unwrap_or_else(|| DEFAULT_DOCTOR.id.to_string());
        let reviewed_at = parse_legacy_timestamp(review.reviewed_at.as_deref());
        tx.execute(
            "INSERT INTO doctor_reviews (
                id, detection_id, doctor_id, doctor_name, diagnosis,
                recommendations, severity, follow_up_date, reviewed_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                Uuid::new_v4().to_string(),
                detection.id,
                doctor_id,
                review.doctor_name,
                review.diagnosis,
                review.recommendations,
                review.severity.as_str(),
                review.follow_up_date.map(|d| d.to_string()),
                format_timestamp(&reviewed_at),
            ],
        )?;
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::byte_store::MemoryByteStore;
    use crate::db::repository::DetectionRepository;

    fn engine() -> Arc<StorageEngine> {
        let engine = Arc::new(StorageEngine::new(Box::new(MemoryByteStore::new())));
        engine.initialize().unwrap();
        engine
    }

    fn legacy_with_one_of_each() -> MemoryLegacyStore {
        let mut legacy = MemoryLegacyStore::new();
        legacy.insert(
            USERS_KEY,
            r#"[{"id":"legacy-u1","email":"tech@clinic.com","name":"Tech One","role":"technician"}]"#,
        );
        legacy.insert("eyecare_pwd_tech@clinic.com", "hunter2");
        legacy.insert(
            DETECTIONS_KEY,
            r#"[{
                "id": "legacy-d1",
                "userId": "legacy-u1",
                "patientName": "John Doe",
                "patientAge": 61,
                "classification": "cataract",
                "confidence": 0.88,
                "status": "analyzed",
                "reviewUrgency": "priority",
                "createdAt": "2024-03-01T10:00:00.000Z",
                "updatedAt": "2024-03-01T10:00:00.000Z"
            }]"#,
        );
        legacy
    }

    #[test]
    fn empty_store_still_writes_completion_marker() {
        let engine = engine();
        let runner = MigrationRunner::new(Arc::clone(&engine));

        let report = runner.run(&MemoryLegacyStore::new()).unwrap();
        assert_eq!(report, MigrationReport::default());
        assert!(runner.is_complete().unwrap());
    }

    #[test]
    fn migrates_users_and_detections_with_id_remap() {
        let engine = engine();
        let runner = MigrationRunner::new(Arc::clone(&engine));
        let report = runner.run(&legacy_with_one_of_each()).unwrap();

        assert_eq!(report.users_migrated, 1);
        assert_eq!(report.detections_migrated, 1);

        let users = UserRepository::new(Arc::clone(&engine));
        let tech = users.find_by_email("tech@clinic.com").unwrap().unwrap();
        assert_ne!(tech.id, "legacy-u1", "migrated accounts get fresh ids");
        assert!(users.validate_password("tech@clinic.com", "hunter2").unwrap());

        let detections = DetectionRepository::new(engine);
        let migrated = detections.find_by_id("legacy-d1").unwrap().unwrap();
        assert_eq!(migrated.user_id, tech.id);
        assert_eq!(migrated.patient_name, "John Doe");
        assert_eq!(migrated.classification, Some(Classification::Cataract));
        assert_eq!(migrated.status, DetectionStatus::Analyzed);
    }

    #[test]
    fn second_run_is_a_no_op() {
        let engine = engine();
        let runner = MigrationRunner::new(Arc::clone(&engine));
        runner.run(&legacy_with_one_of_each()).unwrap();

        let second = runner.run(&legacy_with_one_of_each()).unwrap();
        assert_eq!(second, MigrationReport::default());

        let users = UserRepository::new(engine);
        assert_eq!(users.get_all().unwrap().len(), 2);
    }

    #[test]
    fn missing_password_entry_falls_back_to_sentinel() {
        let engine = engine();
        let runner = MigrationRunner::new(Arc::clone(&engine));

        let mut legacy = MemoryLegacyStore::new();
        legacy.insert(
            USERS_KEY,
            r#"[{"id":"legacy-u2","email":"nopwd@clinic.com","name":"No Password"}]"#,
        );
        runner.run(&legacy).unwrap();

        let users = UserRepository::new(Arc::clone(&engine));
        let user = users.find_by_email("nopwd@clinic.com").unwrap().unwrap();
        assert_eq!(user.role, UserRole::Technician);
        assert!(users
            .validate_password("nopwd@clinic.com", FALLBACK_PASSWORD)
            .unwrap());
    }

    #[test]
    fn seeded_doctor_is_not_duplicated_and_its_records_remap() {
        let engine = engine();
        let runner = MigrationRunner::new(Arc::clone(&engine));

        let mut legacy = MemoryLegacyStore::new();
        legacy.insert(
            USERS_KEY,
            r#"[{"id":"old-doc","email":"doctor@clinic.com","name":"Dr. Ophthalmologist","role":"doctor"}]"#,
        );
        legacy.insert(
            DETECTIONS_KEY,
            r#"[{
                "id": "legacy-d2",
                "userId": "old-doc",
                "patientName": "Mary Major",
                "patientAge": 47,
                "status": "reviewed",
                "doctorReview": {
                    "doctorId": "old-doc",
                    "doctorName": "Dr. Ophthalmologist",
                    "diagnosis": "Mild cataract",
                    "recommendations": "Annual follow-up",
                    "severity": "mild",
                    "reviewedAt": "2024-04-01T09:30:00.000Z"
                }
            }]"#,
        );
        let report = runner.run(&legacy).unwrap();
        assert_eq!(report.users_migrated, 0);
        assert_eq!(report.detections_migrated, 1);

        let users = UserRepository::new(Arc::clone(&engine));
        assert_eq!(users.get_all().unwrap().len(), 1);

        let detections = DetectionRepository::new(engine);
        let migrated = detections.find_by_id("legacy-d2").unwrap().unwrap();
        assert_eq!(migrated.user_id, DEFAULT_DOCTOR.id);
        let review = migrated.doctor_review.unwrap();
        assert_eq!(review.doctor_id, DEFAULT_DOCTOR.id);
        assert_eq!(review.severity, ReviewSeverity::Mild);
    }

    #[test]
    fn record_with_review_lands_in_reviewed_status() {
        let engine = engine();
        let runner = MigrationRunner::new(Arc::clone(&engine));

        let mut legacy = MemoryLegacyStore::new();
        legacy.insert(
            DETECTIONS_KEY,
            r#"[{
                "id": "legacy-d3",
                "userId": "default-doctor-001",
                "patientName": "P",
                "patientAge": 30,
                "status": "analyzed",
                "doctorReview": {
                    "doctorId": "default-doctor-001",
                    "doctorName": "Dr. Ophthalmologist",
                    "diagnosis": "dx",
                    "recommendations": "rx",
                    "severity": "moderate"
                }
            }]"#,
        );
        runner.run(&legacy).unwrap();

        let detections = DetectionRepository::new(engine);
        let migrated = detections.find_by_id("legacy-d3").unwrap().unwrap();
        assert_eq!(migrated.status, DetectionStatus::Reviewed);
        assert!(migrated.doctor_review.is_some());
    }

    #[test]
    fn malformed_records_are_skipped_not_fatal() {
        let engine = engine();
        let runner = MigrationRunner::new(Arc::clone(&engine));

        let mut legacy = MemoryLegacyStore::new();
        legacy.insert(
            USERS_KEY,
            r#"[{"bogus": true}, {"id":"legacy-u3","email":"ok@clinic.com","name":"Ok"}]"#,
        );
        legacy.insert(
            DETECTIONS_KEY,
            r#"[{"id": 5}, {
                "id": "legacy-d4",
                "userId": "legacy-u3",
                "patientName": "P",
                "patientAge": 20
            }, {
                "id": "legacy-d5",
                "userId": "nobody-knows",
                "patientName": "Q",
                "patientAge": 21
            }]"#,
        );
        let report = runner.run(&legacy).unwrap();

        assert_eq!(report.users_migrated, 1);
        assert_eq!(report.detections_migrated, 1);
        assert!(runner.is_complete().unwrap());

        let detections = DetectionRepository::new(engine);
        assert!(detections.find_by_id("legacy-d4").unwrap().is_some());
        assert!(detections.find_by_id("legacy-d5").unwrap().is_none());
    }

    #[test]
    fn json_file_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileLegacyStore::open(&dir.path().join("legacy.json")).unwrap();
        assert!(store.get(USERS_KEY).is_none());
    }

    #[test]
    fn json_file_store_reads_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.json");
        fs::write(&path, r#"{"eyecare_users": "[]"}"#).unwrap();
        let store = JsonFileLegacyStore::open(&path).unwrap();
        assert_eq!(store.get(USERS_KEY).unwrap(), "[]");
    }
}
