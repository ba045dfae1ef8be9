use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{AppError, Result};

/// Claims carried in bearer tokens. Tokens are issued by the account
/// service; this service only verifies them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: i64,
    pub username: String,
    pub exp: i64,
}

pub struct AuthService {
    jwt_secret: String,
}

impl AuthService {
    pub fn new(config: &Config) -> Self {
        Self {
            jwt_secret: config.jwt_secret.clone(),
        }
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims> {
        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| AppError::Unauthorized)?;

        Ok(token_data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret-test-secret-test-secret!";

    fn service() -> AuthService {
        AuthService {
            jwt_secret: SECRET.to_string(),
        }
    }

    fn token(claims: &Claims, secret: &str) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn accepts_valid_token() {
        let claims = Claims {
            sub: 42,
            username: "alice".to_string(),
            exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp(),
        };
        let verified = service().verify_token(&token(&claims, SECRET)).unwrap();
        assert_eq!(verified.sub, 42);
        assert_eq!(verified.username, "alice");
    }

    #[test]
    fn rejects_expired_and_forged_tokens() {
        let expired = Claims {
            sub: 42,
            username: "alice".to_string(),
            exp: (chrono::Utc::now() - chrono::Duration::hours(1)).timestamp(),
        };
        assert!(service().verify_token(&token(&expired, SECRET)).is_err());

        let claims = Claims {
            sub: 42,
            username: "alice".to_string(),
            exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp(),
        };
        let forged = token(&claims, "another-secret-another-secret-xx");
        assert!(service().verify_token(&forged).is_err());
    }
}
