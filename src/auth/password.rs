use hmac::{Hmac, Mac};
use rand::{distributions::Alphanumeric, Rng, RngCore};
use sha2::Sha256;

use super::AuthError;

type HmacSha256 = Hmac<Sha256>;

const PREFIX: &str = "hs256";
const MIN_COST: u32 = 4;
const MAX_COST: u32 = 20;
const SALT_LEN: usize = 16;

/// Hash a password as `hs256$<cost>$<salt>$<digest>`, iterating HMAC-SHA256 `2^cost` times.
pub fn hash_password(password: &str, cost: u32) -> Result<String, AuthError> {
    let cost = cost.clamp(MIN_COST, MAX_COST);
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let digest = derive(password, &salt, 1u64 << cost)?;
    Ok(format!(
        "{}${}${}${}",
        PREFIX,
        cost,
        hex::encode(salt),
        hex::encode(digest)
    ))
}

pub fn verify_password(password: &str, hashed: &str) -> Result<bool, AuthError> {
    let mut parts = hashed.split('$');
    let (Some(PREFIX), Some(cost), Some(salt), Some(digest), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return Err(AuthError::Hash("unrecognized password hash format".into()));
    };
    let cost: u32 = cost
        .parse()
        .map_err(|_| AuthError::Hash("invalid hash cost".into()))?;
    let salt = hex::decode(salt).map_err(|e| AuthError::Hash(e.to_string()))?;
    let expected = hex::decode(digest).map_err(|e| AuthError::Hash(e.to_string()))?;

    let iterations = 1u64 << cost.clamp(MIN_COST, MAX_COST);
    let previous = derive(password, &salt, iterations - 1)?;
    let mut last = new_mac(password)?;
    last.update(&previous);
    Ok(last.verify_slice(&expected).is_ok())
}

/// Random alphanumeric password handed out on reset.
pub fn generate_password(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Random hex secret for API keys and reset tokens.
pub fn generate_secret(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

fn new_mac(password: &str) -> Result<HmacSha256, AuthError> {
    HmacSha256::new_from_slice(password.as_bytes()).map_err(|e| AuthError::Hash(e.to_string()))
}

fn derive(password: &str, salt: &[u8], iterations: u64) -> Result<Vec<u8>, AuthError> {
    let mut block = salt.to_vec();
    for _ in 0..iterations {
        let mut mac = new_mac(password)?;
        mac.update(&block);
        block = mac.finalize().into_bytes().to_vec();
    }
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hashed = hash_password("123456", 4).unwrap();
        assert!(hashed.starts_with("hs256$4$"));
        assert!(verify_password("123456", &hashed).unwrap());
        assert!(!verify_password("1234567", &hashed).unwrap());
    }

    #[test]
    fn test_hashes_are_salted() {
        let a = hash_password("secret", 4).unwrap();
        let b = hash_password("secret", 4).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_cost_is_clamped() {
        let hashed = hash_password("secret", 1).unwrap();
        assert!(hashed.starts_with("hs256$4$"));
    }

    #[test]
    fn test_rejects_unknown_format() {
        assert!(verify_password("x", "$2a$10$abc").is_err());
    }

    #[test]
    fn test_generated_secrets() {
        assert_eq!(generate_password(12).len(), 12);
        assert_eq!(generate_secret(20).len(), 40);
    }
}
