use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::UserRole;

/// An account that can record or review screenings.
///
/// The credential is stored only in the `users` row, never on the entity,
/// so a `User` can be handed to callers without leaking the secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    pub role: UserRole,
    pub created_at: DateTime<Utc>,
}

/// Input for user creation; id and creation timestamp are stamped by the
/// repository.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub name: String,
    pub role: UserRole,
}
