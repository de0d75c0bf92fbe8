//! Thin session glue over the user repository. Credentials are exact-match
//! strings, same as the records the legacy import carries over.

use crate::db::repository::UserRepository;
use crate::db::StorageError;
use crate::models::{NewUser, User, UserRole};

pub struct AuthService<'a> {
    users: &'a UserRepository,
}

impl<'a> AuthService<'a> {
    pub fn new(users: &'a UserRepository) -> Self {
        Self { users }
    }

    /// `None` for a wrong password and for an unknown email alike.
    pub fn login(&self, email: &str, password: &str) -> Result<Option<User>, StorageError> {
        if !self.users.validate_password(email, password)? {
            tracing::debug!(email = %email, "login rejected");
            return Ok(None);
        }
        self.users.find_by_email(email)
    }

    /// Self-registration always lands on the technician role; doctor
    /// accounts are provisioned, not registered.
    pub fn register(
        &self,
        email: &str,
        name: &str,
        password: &str,
    ) -> Result<User, StorageError> {
        self.users.create(
            NewUser {
                email: email.to_string(),
                name: name.to_string(),
                role: UserRole::Technician,
            },
            password,
        )
    }
}
