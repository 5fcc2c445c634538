//! Credential store over the `users` table, bcrypt-hashed.

use crate::storage::{Store, User};
use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

pub struct UserStore {
    store: Store,
}

impl UserStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Seed the operator account from the environment if absent.
    pub fn seed_admin(&self, email: &str, name: &str, password: &str) -> Result<()> {
        if self.store.get_user_by_email(email)?.is_some() {
            return Ok(());
        }
        let password_hash =
            bcrypt::hash(password, bcrypt::DEFAULT_COST).context("Failed to hash password")?;
        self.store.insert_user(&User {
            id: uuid::Uuid::new_v4().to_string(),
            email: email.to_string(),
            name: name.to_string(),
            password_hash,
            created_at: Utc::now(),
        })?;
        info!(email, "Seeded operator account");
        Ok(())
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        self.store.get_user_by_email(email)
    }

    pub fn verify_password(&self, email: &str, password: &str) -> Result<bool> {
        match self.store.get_user_by_email(email)? {
            Some(user) => {
                Ok(bcrypt::verify(password, &user.password_hash).unwrap_or(false))
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_and_verify() {
        let store = Store::open_in_memory().unwrap();
        let users = UserStore::new(store);
        users.seed_admin("ops@local", "Ops", "hunter2").unwrap();

        assert!(users.verify_password("ops@local", "hunter2").unwrap());
        assert!(!users.verify_password("ops@local", "wrong").unwrap());
        assert!(!users.verify_password("ghost@local", "hunter2").unwrap());

        // Idempotent reseed keeps the original credentials.
        users.seed_admin("ops@local", "Ops", "other").unwrap();
        assert!(users.verify_password("ops@local", "hunter2").unwrap());
    }
}
