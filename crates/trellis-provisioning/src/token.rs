//! Random credentials, bearer derivation and hashed token storage
//!
//! Randomness comes from the aws-lc-rs RNG. Comparisons of secret values
//! go through constant-time equality.

use aws_lc_rs::constant_time::verify_slices_are_equal;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use trellis_common::naming::sha256;
use trellis_common::{Error, Result};

/// Prefix marking a stored token as `$2:<salt>:<hash>`
pub const HASHED_TOKEN_PREFIX: &str = "$2:";

/// Generate a URL-safe random token from `bytes` bytes of entropy
pub fn generate_token(bytes: usize) -> Result<String> {
    let mut raw = vec![0u8; bytes];
    aws_lc_rs::rand::fill(&mut raw)
        .map_err(|_| Error::internal_with_context("token", "system RNG unavailable"))?;
    Ok(URL_SAFE_NO_PAD.encode(&raw))
}

/// Bearer value a node presents for a service account token
///
/// Agents never see the raw service account token in the install script;
/// they present `base64url(sha256(token))` and the server maps it back
/// through the bearer-hash index.
pub fn bearer_for(service_account_token: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(sha256(service_account_token))
}

/// Constant-time string equality
pub fn secure_eq(a: &str, b: &str) -> bool {
    verify_slices_are_equal(a.as_bytes(), b.as_bytes()).is_ok()
}

/// Hash a token for storage as `$2:<salt>:<hash>`
pub fn hash_token(token: &str) -> Result<String> {
    let mut salt = vec![0u8; 16];
    aws_lc_rs::rand::fill(&mut salt)
        .map_err(|_| Error::internal_with_context("token", "system RNG unavailable"))?;
    Ok(format!(
        "{}{}:{}",
        HASHED_TOKEN_PREFIX,
        STANDARD_NO_PAD.encode(&salt),
        STANDARD_NO_PAD.encode(salted_digest(&salt, token))
    ))
}

/// Check a presented token against its stored (plain or hashed) form
pub fn verify_token(stored: &str, presented: &str) -> bool {
    let Some(rest) = stored.strip_prefix(HASHED_TOKEN_PREFIX) else {
        return secure_eq(stored, presented);
    };
    let Some((salt, hash)) = rest.split_once(':') else {
        return false;
    };
    let (Ok(salt), Ok(hash)) = (STANDARD_NO_PAD.decode(salt), STANDARD_NO_PAD.decode(hash)) else {
        return false;
    };
    verify_slices_are_equal(&salted_digest(&salt, presented), &hash).is_ok()
}

fn salted_digest(salt: &[u8], token: &str) -> Vec<u8> {
    let mut input = salt.to_vec();
    input.extend_from_slice(token.as_bytes());
    sha256(&input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_tokens_are_unique_and_url_safe() {
        let a = generate_token(32).unwrap();
        let b = generate_token(32).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_bearer_is_stable() {
        assert_eq!(bearer_for(b"sa-token"), bearer_for(b"sa-token"));
        assert_ne!(bearer_for(b"sa-token"), bearer_for(b"other"));
        assert!(!bearer_for(b"sa-token").contains('='));
    }

    #[test]
    fn test_hashed_token_verifies() {
        let stored = hash_token("secret-value").unwrap();
        assert!(stored.starts_with(HASHED_TOKEN_PREFIX));
        assert!(verify_token(&stored, "secret-value"));
        assert!(!verify_token(&stored, "other"));
    }

    #[test]
    fn test_plain_token_verifies() {
        assert!(verify_token("abc", "abc"));
        assert!(!verify_token("abc", "abd"));
        assert!(!verify_token("$2:broken", "abc"));
    }
}
