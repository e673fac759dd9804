// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Challenge/response authentication.
//!
//! The server opens every connection with a `#CHALLENGE#` frame carrying a
//! random salt. The client answers with HMAC-SHA256(authkey, salt), using an
//! empty key when it has none. The server checks the digest against each
//! configured secret and answers `{"authenticated": bool}`.

use crate::error::RpcError;
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};

pub const CHALLENGE_TAG: &[u8] = b"#CHALLENGE#";
pub const SALT_LEN: usize = 20;
pub const AUTHKEY_LENGTH: usize = 16;

/// Generate a fresh challenge salt.
pub fn make_salt(rng: &SystemRandom) -> Result<[u8; SALT_LEN], RpcError> {
    let mut salt = [0u8; SALT_LEN];
    rng.fill(&mut salt)
        .map_err(|_| RpcError::exception("RNG failed"))?;
    Ok(salt)
}

/// Payload of the challenge frame.
pub fn challenge_frame(salt: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(CHALLENGE_TAG.len() + salt.len());
    frame.extend_from_slice(CHALLENGE_TAG);
    frame.extend_from_slice(salt);
    frame
}

/// Extract the salt from a challenge frame.
pub fn parse_challenge(frame: &[u8]) -> Option<&[u8]> {
    frame.strip_prefix(CHALLENGE_TAG)
}

/// Client side answer to a challenge.
pub fn digest(salt: &[u8], authkey: Option<&str>) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, authkey.unwrap_or("").as_bytes());
    hmac::sign(&key, salt).as_ref().to_vec()
}

/// Find the secret that produced `answer`, if any.
pub fn verify<'a>(
    salt: &[u8],
    answer: &[u8],
    secrets: impl IntoIterator<Item = &'a str>,
) -> Option<String> {
    secrets.into_iter().find_map(|secret| {
        let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
        hmac::verify(&key, salt, answer)
            .ok()
            .map(|_| secret.to_string())
    })
}

/// A random authkey made of decimal digits.
pub fn rand_authkey(rng: &SystemRandom) -> Result<String, RpcError> {
    rand_digits(rng, AUTHKEY_LENGTH)
}

/// Largest multiple of 10 that fits a byte. Bytes from here up would skew
/// the digits toward 0-5.
const DIGIT_BOUND: u8 = 250;

/// Unbiased decimal digits from random bytes. Some bytes yield nothing.
fn digits_from(bytes: &[u8]) -> impl Iterator<Item = char> + '_ {
    bytes
        .iter()
        .filter(|b| **b < DIGIT_BOUND)
        .map(|b| char::from(b'0' + b % 10))
}

/// `len` random decimal digits.
pub fn rand_digits(rng: &SystemRandom, len: usize) -> Result<String, RpcError> {
    let mut digits = String::with_capacity(len);
    let mut bytes = [0u8; 32];
    while digits.len() < len {
        rng.fill(&mut bytes)
            .map_err(|_| RpcError::exception("RNG failed"))?;
        let missing = len - digits.len();
        digits.extend(digits_from(&bytes).take(missing));
    }
    Ok(digits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_verifies_against_matching_key() {
        let rng = SystemRandom::new();
        let salt = make_salt(&rng).unwrap();
        let answer = digest(&salt, Some("share-key"));
        assert_eq!(
            verify(&salt, &answer, ["admin-key", "share-key"]),
            Some("share-key".to_string())
        );
        assert_eq!(verify(&salt, &answer, ["admin-key"]), None);
    }

    #[test]
    fn test_anonymous_digest_matches_nothing() {
        let salt = [7u8; SALT_LEN];
        let answer = digest(&salt, None);
        assert_eq!(verify(&salt, &answer, ["admin-key"]), None);
        assert_eq!(verify(&salt, b"garbage", ["admin-key"]), None);
    }

    #[test]
    fn test_challenge_frame_parses() {
        let salt = [1u8; SALT_LEN];
        let frame = challenge_frame(&salt);
        assert_eq!(parse_challenge(&frame), Some(&salt[..]));
        assert_eq!(parse_challenge(b"{\"result\":1}"), None);
    }

    #[test]
    fn test_rand_authkey_is_digits() {
        let key = rand_authkey(&SystemRandom::new()).unwrap();
        assert_eq!(key.len(), AUTHKEY_LENGTH);
        assert!(key.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_digits_skip_biased_bytes() {
        let digits: String = digits_from(&[0, 9, 249, 250, 255, 10, 123]).collect();
        assert_eq!(digits, "09903");
        assert_eq!(digits_from(&[250, 251, 252, 253, 254, 255]).count(), 0);
    }
}
