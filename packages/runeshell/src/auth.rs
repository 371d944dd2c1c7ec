//! Client authorization: JWT claims, token issuance, tailnet gating.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Authorization result for a client connection.
///
/// Empty claims (no agent, no session) are valid in tailnet mode; the
/// attach handshake then supplies the target and write access is implied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Claims {
    pub agent_id: String,
    pub session_id: String,
    pub write: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    #[serde(default)]
    agent_id: String,
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    write: bool,
    exp: i64,
    iat: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The manager was built with an empty signing secret.
    MissingSecret,
    /// Signature, shape, or expiry check failed.
    InvalidToken,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::MissingSecret => write!(f, "signing secret required"),
            AuthError::InvalidToken => write!(f, "invalid token"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Issues and verifies HS256 client tokens.
pub struct TokenManager {
    secret: Vec<u8>,
}

impl TokenManager {
    pub fn new(secret: &str) -> Self {
        Self { secret: secret.as_bytes().to_vec() }
    }

    pub fn issue(&self, claims: &Claims, ttl: std::time::Duration) -> Result<String, AuthError> {
        if self.secret.is_empty() {
            return Err(AuthError::MissingSecret);
        }
        let now = Utc::now().timestamp();
        let token_claims = TokenClaims {
            agent_id: claims.agent_id.clone(),
            session_id: claims.session_id.clone(),
            write: claims.write,
            exp: now + ttl.as_secs() as i64,
            iat: now,
        };
        encode(&Header::default(), &token_claims, &EncodingKey::from_secret(&self.secret))
            .map_err(|_| AuthError::InvalidToken)
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        if self.secret.is_empty() {
            return Err(AuthError::MissingSecret);
        }
        let data = decode::<TokenClaims>(
            token,
            &DecodingKey::from_secret(&self.secret),
            &Validation::default(),
        )
        .map_err(|_| AuthError::InvalidToken)?;
        Ok(Claims {
            agent_id: data.claims.agent_id,
            session_id: data.claims.session_id,
            write: data.claims.write,
            expires_at: Utc.timestamp_opt(data.claims.exp, 0).single(),
        })
    }
}

/// Whether a peer address is acceptable in tailnet mode: loopback or the
/// CGNAT range tailscale assigns (100.64.0.0/10).
pub fn is_tailnet_addr(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || (v4.octets()[0] == 100 && (64..=127).contains(&v4.octets()[1]))
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() {
                return true;
            }
            match v6.to_ipv4_mapped() {
                Some(v4) => is_tailnet_addr(IpAddr::V4(v4)),
                None => false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn claims() -> Claims {
        Claims {
            agent_id: "agent1".to_string(),
            session_id: "ai".to_string(),
            write: true,
            expires_at: None,
        }
    }

    #[test]
    fn issue_then_verify_roundtrips_claims() {
        let manager = TokenManager::new("test-secret");
        let token = manager.issue(&claims(), Duration::from_secs(60)).unwrap();
        let verified = manager.verify(&token).unwrap();
        assert_eq!(verified.agent_id, "agent1");
        assert_eq!(verified.session_id, "ai");
        assert!(verified.write);
        assert!(verified.expires_at.is_some());
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let issuer = TokenManager::new("secret-a");
        let verifier = TokenManager::new("secret-b");
        let token = issuer.issue(&claims(), Duration::from_secs(60)).unwrap();
        assert_eq!(verifier.verify(&token), Err(AuthError::InvalidToken));
    }

    #[test]
    fn verify_rejects_garbage() {
        let manager = TokenManager::new("test-secret");
        assert_eq!(manager.verify("not-a-token"), Err(AuthError::InvalidToken));
        assert_eq!(manager.verify(""), Err(AuthError::InvalidToken));
    }

    #[test]
    fn empty_secret_is_refused() {
        let manager = TokenManager::new("");
        assert_eq!(
            manager.issue(&claims(), Duration::from_secs(60)),
            Err(AuthError::MissingSecret)
        );
        assert_eq!(manager.verify("whatever"), Err(AuthError::MissingSecret));
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let manager = TokenManager::new("test-secret");
        // Well past the default validation leeway.
        let now = Utc::now().timestamp();
        let stale = TokenClaims {
            agent_id: "agent1".to_string(),
            session_id: "ai".to_string(),
            write: false,
            exp: now - 600,
            iat: now - 1200,
        };
        let token = encode(
            &Header::default(),
            &stale,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();
        assert_eq!(manager.verify(&token), Err(AuthError::InvalidToken));
    }

    #[test]
    fn tailnet_addresses() {
        for addr in ["127.0.0.1", "::1", "100.64.0.1", "100.100.7.9", "100.127.255.255"] {
            assert!(is_tailnet_addr(addr.parse().unwrap()), "{addr} should pass");
        }
        for addr in ["100.128.0.1", "100.63.255.255", "10.0.0.1", "8.8.8.8", "fe80::1"] {
            assert!(!is_tailnet_addr(addr.parse().unwrap()), "{addr} should fail");
        }
    }

    #[test]
    fn ipv4_mapped_ipv6_is_classified_like_ipv4() {
        assert!(is_tailnet_addr("::ffff:100.64.0.1".parse().unwrap()));
        assert!(!is_tailnet_addr("::ffff:8.8.8.8".parse().unwrap()));
    }
}
