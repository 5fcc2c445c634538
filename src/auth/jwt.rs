//! JWT token generation and validation.

use crate::auth::models::Claims;
use crate::storage::User;
use anyhow::{Context, Result};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use tracing::debug;

/// Tokens are valid for seven days and renewable via the refresh endpoint.
const EXPIRATION_DAYS: i64 = 7;

pub struct JwtHandler {
    secret: String,
}

impl JwtHandler {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    pub fn generate_token(&self, user: &User) -> Result<(String, usize)> {
        let now = Utc::now();
        let expiration = now
            .checked_add_signed(chrono::Duration::days(EXPIRATION_DAYS))
            .context("Invalid timestamp")?
            .timestamp() as usize;
        let expires_in = (EXPIRATION_DAYS * 24 * 3600) as usize;

        let claims = Claims {
            sub: user.id.clone(),
            email: user.email.clone(),
            name: user.name.clone(),
            exp: expiration,
        };

        debug!(email = %user.email, "Generating JWT");
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .context("Failed to generate JWT")?;

        Ok((token, expires_in))
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        let decoded = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .context("Invalid or expired token")?;
        Ok(decoded.claims)
    }

    /// Re-issue a token for still-valid claims.
    pub fn refresh_token(&self, claims: &Claims) -> Result<(String, usize)> {
        let user = User {
            id: claims.sub.clone(),
            email: claims.email.clone(),
            name: claims.name.clone(),
            password_hash: String::new(),
            created_at: Utc::now(),
        };
        self.generate_token(&user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_user() -> User {
        User {
            id: uuid::Uuid::new_v4().to_string(),
            email: "ops@cadastro.local".to_string(),
            name: "Operador".to_string(),
            password_hash: "hash".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn generation_and_validation_round_trip() {
        let handler = JwtHandler::new("test-secret-key-12345".to_string());
        let user = test_user();

        let (token, expires_in) = handler.generate_token(&user).unwrap();
        assert!(!token.is_empty());
        assert_eq!(expires_in, 7 * 24 * 3600);

        let claims = handler.validate_token(&token).unwrap();
        assert_eq!(claims.email, user.email);
        assert_eq!(claims.sub, user.id);
    }

    #[test]
    fn invalid_token_rejected() {
        let handler = JwtHandler::new("test-secret-key-12345".to_string());
        assert!(handler.validate_token("invalid.token.here").is_err());
    }

    #[test]
    fn different_secrets_reject() {
        let handler1 = JwtHandler::new("secret1".to_string());
        let handler2 = JwtHandler::new("secret2".to_string());
        let (token, _) = handler1.generate_token(&test_user()).unwrap();
        assert!(handler2.validate_token(&token).is_err());
    }

    #[test]
    fn refresh_preserves_identity() {
        let handler = JwtHandler::new("secret".to_string());
        let user = test_user();
        let (token, _) = handler.generate_token(&user).unwrap();
        let claims = handler.validate_token(&token).unwrap();
        let (refreshed, _) = handler.refresh_token(&claims).unwrap();
        let refreshed_claims = handler.validate_token(&refreshed).unwrap();
        assert_eq!(refreshed_claims.sub, user.id);
        assert_eq!(refreshed_claims.email, user.email);
    }
}
