//! Auth token signing.
//!
//! Every connection is authenticated with a JWT carrying the producer id.
//! Signing goes through the [`TokenSigner`] trait so applications can plug
//! in their own key handling; [`JwtSigner`] is the HMAC implementation used
//! by default.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{Map, Value};

use crate::error::{Result, SnapperError};

/// Token lifetime used when the configured one is too short.
pub const DEFAULT_EXPIRES_IN: Duration = Duration::from_secs(2 * 24 * 60 * 60);

/// Configured lifetimes at or below this are replaced by [`DEFAULT_EXPIRES_IN`].
pub const MIN_EXPIRES_IN: Duration = Duration::from_secs(60);

/// Claim carrying the producer id in the connection token.
pub const CLAIM_PRODUCER_ID: &str = "producerId";

/// Claim carrying the expiry as seconds since the Unix epoch.
pub const CLAIM_EXP: &str = "exp";

/// Signs claim sets into bearer tokens.
///
/// Called from the connection task on every (re)connect, so implementations
/// must not block for long.
pub trait TokenSigner: Send + Sync + 'static {
    /// Sign `claims`, which already include `exp`.
    ///
    /// # Errors
    ///
    /// Returns [`SnapperError::Signing`] if no token could be produced.
    fn sign(&self, claims: &Map<String, Value>) -> Result<String>;
}

/// HMAC JWT signer.
///
/// The header is `{"typ":"JWT","alg":<algorithm>}`.
///
/// ```
/// use snapper_producer::auth::{JwtSigner, TokenSigner};
/// use snapper_producer::Algorithm;
///
/// let signer = JwtSigner::new(b"secret", Algorithm::HS256).unwrap();
/// let token = signer.sign(&serde_json::Map::new()).unwrap();
/// assert_eq!(token.split('.').count(), 3);
/// ```
#[derive(Clone)]
pub struct JwtSigner {
    key: EncodingKey,
    algorithm: Algorithm,
}

impl JwtSigner {
    /// Create a signer keyed with `secret`.
    ///
    /// # Errors
    ///
    /// Returns [`SnapperError::InvalidConfig`] for non-HMAC algorithms.
    pub fn new(secret: &[u8], algorithm: Algorithm) -> Result<Self> {
        if !matches!(
            algorithm,
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
        ) {
            return Err(SnapperError::InvalidConfig(format!(
                "unsupported signing algorithm {algorithm:?}, expected HS256, HS384 or HS512"
            )));
        }
        Ok(Self {
            key: EncodingKey::from_secret(secret),
            algorithm,
        })
    }

    /// The algorithm named in the token header.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }
}

impl TokenSigner for JwtSigner {
    fn sign(&self, claims: &Map<String, Value>) -> Result<String> {
        jsonwebtoken::encode(&Header::new(self.algorithm), claims, &self.key)
            .map_err(|e| SnapperError::Signing(e.to_string()))
    }
}

impl std::fmt::Debug for JwtSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtSigner")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Clamp a configured token lifetime: whole seconds, and at least
/// [`MIN_EXPIRES_IN`] or the default applies.
pub fn normalize_expires_in(expires_in: Duration) -> Duration {
    let whole = Duration::from_secs(expires_in.as_secs());
    if whole > MIN_EXPIRES_IN {
        whole
    } else {
        DEFAULT_EXPIRES_IN
    }
}

/// Adds expiry to claim sets and hands them to the signer. Shared by the
/// client handle and the connection task.
#[derive(Clone)]
pub(crate) struct TokenIssuer {
    signer: Arc<dyn TokenSigner>,
    producer_id: String,
    expires_in: Duration,
}

impl TokenIssuer {
    pub(crate) fn new(signer: Arc<dyn TokenSigner>, producer_id: String, expires_in: Duration) -> Self {
        Self {
            signer,
            producer_id,
            expires_in,
        }
    }

    /// Sign arbitrary claims with `exp = now + expires_in`.
    pub(crate) fn sign(&self, mut claims: Map<String, Value>) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| SnapperError::Signing(format!("system clock before Unix epoch: {e}")))?;
        let exp = now.saturating_add(self.expires_in).as_secs();
        claims.insert(CLAIM_EXP.to_string(), Value::from(exp));
        self.signer.sign(&claims)
    }

    /// The token sent in the `auth` command of every connection.
    pub(crate) fn producer_token(&self) -> Result<String> {
        let mut claims = Map::new();
        claims.insert(
            CLAIM_PRODUCER_ID.to_string(),
            Value::String(self.producer_id.clone()),
        );
        self.sign(claims)
    }
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("producer_id", &self.producer_id)
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use jsonwebtoken::{DecodingKey, Validation};

    fn decode(token: &str, secret: &[u8], algorithm: Algorithm) -> (Header, Map<String, Value>) {
        let mut validation = Validation::new(algorithm);
        validation.required_spec_claims.clear();
        let data =
            jsonwebtoken::decode::<Map<String, Value>>(token, &DecodingKey::from_secret(secret), &validation)
                .unwrap();
        (data.header, data.claims)
    }

    #[test]
    fn producer_token_carries_id_and_expiry() {
        let signer = Arc::new(JwtSigner::new(b"key-1", Algorithm::HS256).unwrap());
        let issuer = TokenIssuer::new(signer, "producer-7".into(), Duration::from_secs(3600));

        let before = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let token = issuer.producer_token().unwrap();
        let (header, claims) = decode(&token, b"key-1", Algorithm::HS256);

        assert_eq!(header.typ.as_deref(), Some("JWT"));
        assert_eq!(header.alg, Algorithm::HS256);
        assert_eq!(claims[CLAIM_PRODUCER_ID], "producer-7");
        let exp = claims[CLAIM_EXP].as_u64().unwrap();
        assert!(exp >= before + 3600 && exp <= before + 3601, "exp = {exp}");
    }

    #[test]
    fn arbitrary_claims_are_preserved() {
        let signer = Arc::new(JwtSigner::new(b"k", Algorithm::HS512).unwrap());
        let issuer = TokenIssuer::new(signer, "p".into(), DEFAULT_EXPIRES_IN);

        let mut claims = Map::new();
        claims.insert("userId".into(), Value::from("u-1"));
        let (header, decoded) = decode(&issuer.sign(claims).unwrap(), b"k", Algorithm::HS512);

        assert_eq!(header.alg, Algorithm::HS512);
        assert_eq!(decoded["userId"], "u-1");
        assert!(decoded.contains_key(CLAIM_EXP));
        assert!(!decoded.contains_key(CLAIM_PRODUCER_ID));
    }

    #[test]
    fn non_hmac_algorithms_are_rejected() {
        let err = JwtSigner::new(b"k", Algorithm::RS256).unwrap_err();
        assert!(matches!(err, SnapperError::InvalidConfig(_)));
    }

    #[test]
    fn short_lifetimes_fall_back_to_default() {
        assert_eq!(normalize_expires_in(Duration::from_secs(60)), DEFAULT_EXPIRES_IN);
        assert_eq!(normalize_expires_in(Duration::ZERO), DEFAULT_EXPIRES_IN);
        assert_eq!(
            normalize_expires_in(Duration::from_millis(90_900)),
            Duration::from_secs(90)
        );
    }

    #[test]
    fn debug_output_hides_the_key() {
        let signer = JwtSigner::new(b"super-secret", Algorithm::HS256).unwrap();
        let debug = format!("{signer:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("redacted"));
    }
}
