use crate::error::{AppError, InternalError};
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
}

pub fn encode(secret: &str, claims: &Claims) -> String {
    jsonwebtoken::encode(&Header::default(), claims, &EncodingKey::from_secret(secret.as_bytes()))
        .expect("encoding a JWT with a well-formed secret never fails")
}

pub fn decode(secret: &str, token: &str) -> Result<Claims, AppError> {
    jsonwebtoken::decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &Validation::default())
        .map(|data| data.claims)
        .map_err(|e| AppError::Internal(InternalError::from(e)))
}

pub fn gen_token(lifetime_secs: i64, secret: &str, name: &str) -> String {
    let claims = Claims {
        sub: name.to_string(),
        exp: (Utc::now() + Duration::seconds(lifetime_secs)).timestamp(),
    };
    encode(secret, &claims)
}
