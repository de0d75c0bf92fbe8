use crate::db::StorageError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern.
///
/// Serde names match the stored strings (snake_case), so the same enums
/// serve SQLite CHECK columns, JSON columns, and the classifier wire format.
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = StorageError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(StorageError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }
    };
}

str_enum!(UserRole {
    Admin => "admin",
    Doctor => "doctor",
    Technician => "technician",
});

str_enum!(Classification {
    Cataract => "cataract",
    DiabeticRetinopathy => "diabetic_retinopathy",
    Glaucoma => "glaucoma",
    Normal => "normal",
});

str_enum!(DetectionStatus {
    Pending => "pending",
    Analyzed => "analyzed",
    Reviewed => "reviewed",
});

str_enum!(ReviewUrgency {
    Routine => "routine",
    Priority => "priority",
    Urgent => "urgent",
});

str_enum!(ReviewSeverity {
    Mild => "mild",
    Moderate => "moderate",
    Severe => "severe",
});

str_enum!(ConfidenceTier {
    High => "high",
    Medium => "medium",
    Low => "low",
});

impl Default for DetectionStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl Classification {
    /// Human-readable disease name for reports and summaries.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Cataract => "Cataract",
            Self::DiabeticRetinopathy => "Diabetic Retinopathy",
            Self::Glaucoma => "Glaucoma",
            Self::Normal => "Normal/Healthy",
        }
    }
}

impl ConfidenceTier {
    /// Qualitative tier derived from the classifier's overall confidence.
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.85 {
            Self::High
        } else if confidence >= 0.70 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

impl ReviewUrgency {
    /// Triage tag for a classification at a given confidence.
    ///
    /// Normal findings are always routine. High-confidence sight-threatening
    /// classes (diabetic retinopathy, glaucoma) escalate to urgent.
    pub fn for_classification(classification: Classification, confidence: f64) -> Self {
        if classification == Classification::Normal {
            return Self::Routine;
        }
        if confidence >= 0.85 {
            match classification {
                Classification::DiabeticRetinopathy | Classification::Glaucoma => Self::Urgent,
                _ => Self::Priority,
            }
        } else if confidence >= 0.70 {
            Self::Priority
        } else {
            Self::Routine
        }
    }
}
