use hmac::{Hmac, Mac};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind,
};
use sha2::Sha256;
use thiserror::Error;

use taskpilot_proto::{AuthClaims, User};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing authorization header")]
    MissingAuthorization,
    #[error("invalid authorization scheme")]
    InvalidAuthorizationScheme,
    #[error("invalid token")]
    InvalidToken,
    #[error("token expired")]
    TokenExpired,
    #[error("token could not be issued")]
    IssueFailed,
}

impl AuthError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingAuthorization => "missing_authorization",
            Self::InvalidAuthorizationScheme => "invalid_authorization_scheme",
            Self::InvalidToken => "invalid_token",
            Self::TokenExpired => "token_expired",
            Self::IssueFailed => "issue_failed",
        }
    }
}

/// Issues and verifies the bearer tokens protecting every task and
/// proposal route. HS256 with a shared signing key; claims carry the
/// fields the web client reads back out of the token.
#[derive(Clone)]
pub struct TokenAuthority {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl_seconds: u64,
}

impl TokenAuthority {
    #[must_use]
    pub fn new(signing_key: &str, ttl_seconds: u64) -> Self {
        let validation = Validation::new(Algorithm::HS256);
        Self {
            encoding_key: EncodingKey::from_secret(signing_key.as_bytes()),
            decoding_key: DecodingKey::from_secret(signing_key.as_bytes()),
            validation,
            ttl_seconds: ttl_seconds.max(1),
        }
    }

    pub fn issue(&self, user: &User) -> Result<String, AuthError> {
        let now = chrono::Utc::now().timestamp().max(0) as usize;
        let claims = AuthClaims {
            user_id: user.id,
            email: user.email.clone(),
            name: user.name.clone(),
            iat: now,
            exp: now + self.ttl_seconds as usize,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|_| AuthError::IssueFailed)
    }

    pub fn verify(&self, token: &str) -> Result<AuthClaims, AuthError> {
        match decode::<AuthClaims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => Ok(data.claims),
            Err(error) => match error.kind() {
                ErrorKind::ExpiredSignature => Err(AuthError::TokenExpired),
                _ => Err(AuthError::InvalidToken),
            },
        }
    }

    pub fn extract_bearer_token(header_value: Option<&str>) -> Result<&str, AuthError> {
        let raw = header_value.ok_or(AuthError::MissingAuthorization)?;
        let trimmed = raw.trim();
        let Some(token) = trimmed.strip_prefix("Bearer ") else {
            return Err(AuthError::InvalidAuthorizationScheme);
        };
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::InvalidAuthorizationScheme);
        }
        Ok(token)
    }
}

/// Credential hashing seam. The production hasher lives outside this
/// service; the keyed-HMAC implementation below is the reference
/// collaborator used by local runs and tests.
pub trait PasswordHasher: Send + Sync {
    fn hash(&self, password: &str) -> String;
    fn verify(&self, password: &str, hash: &str) -> bool;
}

pub struct HmacPasswordHasher {
    key: Vec<u8>,
}

impl HmacPasswordHasher {
    #[must_use]
    pub fn new(key: &str) -> Self {
        Self {
            key: key.as_bytes().to_vec(),
        }
    }

    fn digest(&self, password: &str) -> String {
        // Key material comes from config and is never empty, but an
        // HMAC key of any length is accepted anyway.
        let mut mac = match Hmac::<Sha256>::new_from_slice(&self.key) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(password.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

impl PasswordHasher for HmacPasswordHasher {
    fn hash(&self, password: &str) -> String {
        self.digest(password)
    }

    fn verify(&self, password: &str, hash: &str) -> bool {
        !hash.is_empty() && self.digest(password) == hash
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    fn test_user() -> User {
        User {
            id: 7,
            email: "ada@example.com".to_string(),
            name: "Ada".to_string(),
        }
    }

    #[test]
    fn issued_tokens_verify_and_round_trip_claims() -> Result<()> {
        let authority = TokenAuthority::new("test-signing-key", 3600);
        let token = authority.issue(&test_user())?;
        let claims = authority.verify(&token)?;
        assert_eq!(claims.user_id, 7);
        assert_eq!(claims.email, "ada@example.com");
        assert!(claims.exp > claims.iat);
        Ok(())
    }

    #[test]
    fn tokens_signed_with_another_key_are_rejected() -> Result<()> {
        let authority = TokenAuthority::new("test-signing-key", 3600);
        let other = TokenAuthority::new("other-key", 3600);
        let token = other.issue(&test_user())?;
        assert_eq!(authority.verify(&token), Err(AuthError::InvalidToken));
        Ok(())
    }

    #[test]
    fn bearer_extraction_requires_the_scheme() {
        assert_eq!(
            TokenAuthority::extract_bearer_token(None),
            Err(AuthError::MissingAuthorization)
        );
        assert_eq!(
            TokenAuthority::extract_bearer_token(Some("Basic abc")),
            Err(AuthError::InvalidAuthorizationScheme)
        );
        assert_eq!(
            TokenAuthority::extract_bearer_token(Some("Bearer abc.def.ghi")),
            Ok("abc.def.ghi")
        );
    }

    #[test]
    fn password_hasher_verifies_only_matching_passwords() {
        let hasher = HmacPasswordHasher::new("pepper");
        let hash = hasher.hash("hunter2");
        assert!(hasher.verify("hunter2", &hash));
        assert!(!hasher.verify("hunter3", &hash));
        assert!(!hasher.verify("hunter2", ""));
    }
}
