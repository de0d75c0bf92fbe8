use std::str::FromStr;
use std::sync::Arc;

use rusqlite::{params, Row};
use uuid::Uuid;

use crate::db::engine::StorageEngine;
use crate::db::{format_timestamp, is_constraint_violation, now, parse_timestamp, StorageError};
use crate::models::{NewUser, User, UserRole};

const USER_COLUMNS: &str = "id, email, name, role, created_at";

/// Accounts. Users are created once and never updated or deleted; the
/// credential column is written at creation and read only by
/// `validate_password`.
pub struct UserRepository {
    engine: Arc<StorageEngine>,
}

impl UserRepository {
    pub fn new(engine: Arc<StorageEngine>) -> Self {
        Self { engine }
    }

    pub fn find_by_email(&self, email: &str) -> Result<Option<User>, StorageError> {
        let row = self.engine.get(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
            params![email],
            map_user_row,
        )?;
        row.map(user_from_row).transpose()
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<User>, StorageError> {
        let row = self.engine.get(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            params![id],
            map_user_row,
        )?;
        row.map(user_from_row).transpose()
    }

    pub fn get_all(&self) -> Result<Vec<User>, StorageError> {
        let rows = self
            .engine
            .all(&format!("SELECT {USER_COLUMNS} FROM users"), [], map_user_row)?;
        rows.into_iter().map(user_from_row).collect()
    }

    /// Insert a new account and persist. A duplicate email surfaces the
    /// engine's uniqueness constraint as `ConstraintViolation`; no row is
    /// added.
    pub fn create(&self, profile: NewUser, password: &str) -> Result<User, StorageError> {
        let user = User {
            id: Uuid::new_v4().to_string(),
            email: profile.email,
            name: profile.name,
            role: profile.role,
            created_at: now(),
        };

        let inserted = self.engine.run(
            "INSERT INTO users (id, email, name, password_hash, role, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user.id,
                user.email,
                user.name,
                password,
                user.role.as_str(),
                format_timestamp(&user.created_at),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(StorageError::Sqlite(e)) if is_constraint_violation(&e) => {
                return Err(StorageError::ConstraintViolation(format!(
                    "user with email {} already exists",
                    user.email
                )));
            }
            Err(e) => return Err(e),
        }

        self.engine.save()?;
        tracing::info!(user_id = %user.id, role = user.role.as_str(), "user created");
        Ok(user)
    }

    /// Exact-equality credential check. Uniformly `false` for an unknown
    /// email, so callers cannot probe which addresses are registered.
    pub fn validate_password(&self, email: &str, candidate: &str) -> Result<bool, StorageError> {
        let stored = self.engine.get(
            "SELECT password_hash FROM users WHERE email = ?1",
            params![email],
            |row| row.get::<_, String>(0),
        )?;
        Ok(stored.is_some_and(|hash| hash == candidate))
    }
}

struct UserRow {
    id: String,
    email: String,
    name: String,
    role: String,
    created_at: String,
}

fn map_user_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        email: row.get(1)?,
        name: row.get(2)?,
        role: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn user_from_row(row: UserRow) -> Result<User, StorageError> {
    Ok(User {
        id: row.id,
        email: row.email,
        name: row.name,
        role: UserRole::from_str(&row.role)?,
        created_at: parse_timestamp(&row.created_at, "users.created_at")?,
    })
}
