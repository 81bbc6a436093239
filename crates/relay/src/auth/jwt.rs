use anyhow::{anyhow, bail, Context};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub const ACCESS_TOKEN_TTL_SECONDS: i64 = 15 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessTokenClaims {
    sub: String,
    email: String,
    iat: i64,
    exp: i64,
}

/// The authenticated identity a verified token resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub email: String,
}

/// HS256 access-token verification (and issuance, for tests and the
/// co-deployed auth service). The relay itself only ever verifies.
#[derive(Clone)]
pub struct JwtTokenVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtTokenVerifier {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("jwt secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn issue_access_token(&self, user_id: Uuid, email: &str) -> anyhow::Result<String> {
        self.issue_access_token_at(user_id, email, current_unix_timestamp()?)
    }

    fn issue_access_token_at(
        &self,
        user_id: Uuid,
        email: &str,
        issued_at: i64,
    ) -> anyhow::Result<String> {
        let claims = AccessTokenClaims {
            sub: user_id.to_string(),
            email: email.to_string(),
            iat: issued_at,
            exp: issued_at + ACCESS_TOKEN_TTL_SECONDS,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode access token")
    }

    pub fn verify_token(&self, token: &str) -> anyhow::Result<Identity> {
        let claims = decode::<AccessTokenClaims>(token, &self.decoding_key, &self.validation)
            .context("failed to decode access token")?
            .claims;

        let user_id = Uuid::parse_str(&claims.sub)
            .with_context(|| format!("access token subject '{}' is not a UUID", claims.sub))?;

        Ok(Identity { user_id, email: claims.email })
    }
}

fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}

#[cfg(test)]
mod tests {
    use super::{current_unix_timestamp, JwtTokenVerifier, ACCESS_TOKEN_TTL_SECONDS};
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde::Serialize;
    use uuid::Uuid;

    const TEST_SECRET: &str = "beacon_test_secret_that_is_definitely_long_enough";

    #[test]
    fn issues_and_verifies_identity_tokens() {
        let verifier = JwtTokenVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let user_id = Uuid::new_v4();

        let token = verifier
            .issue_access_token(user_id, "ada@example.com")
            .expect("token should be issued");
        let identity = verifier.verify_token(&token).expect("token should verify");

        assert_eq!(identity.user_id, user_id);
        assert_eq!(identity.email, "ada@example.com");
    }

    #[test]
    fn rejects_short_secrets() {
        assert!(JwtTokenVerifier::new("too short").is_err());
    }

    #[test]
    fn rejects_tampered_tokens() {
        let verifier = JwtTokenVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let token = verifier
            .issue_access_token(Uuid::new_v4(), "ada@example.com")
            .expect("token should be issued");
        let tampered = format!("{token}x");

        assert!(verifier.verify_token(&tampered).is_err());
    }

    #[test]
    fn rejects_expired_tokens() {
        let verifier = JwtTokenVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let issued_at = current_unix_timestamp().expect("current timestamp should resolve")
            - ACCESS_TOKEN_TTL_SECONDS
            - 1;
        let token = verifier
            .issue_access_token_at(Uuid::new_v4(), "ada@example.com", issued_at)
            .expect("token should be issued");

        assert!(verifier.verify_token(&token).is_err());
    }

    #[test]
    fn rejects_tokens_with_invalid_subject_claim() {
        #[derive(Serialize)]
        struct InvalidSubjectClaims {
            sub: &'static str,
            email: &'static str,
            iat: i64,
            exp: i64,
        }

        let verifier = JwtTokenVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let now = current_unix_timestamp().expect("current timestamp should resolve");
        let claims = InvalidSubjectClaims {
            sub: "not-a-uuid",
            email: "ada@example.com",
            iat: now,
            exp: now + ACCESS_TOKEN_TTL_SECONDS,
        };

        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .expect("token should encode");

        assert!(verifier.verify_token(&token).is_err());
    }
}
