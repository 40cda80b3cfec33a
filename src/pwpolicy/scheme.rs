use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// A password storage scheme. Encoded values are stored with a
/// `{SCHEME}` prefix so the matching scheme can be recovered from the
/// stored value alone.
pub trait PasswordStorageScheme: Send + Sync {
    /// The scheme tag without braces, uppercase.
    fn name(&self) -> &'static str;

    /// Encodes a cleartext password into the scheme-specific form, without
    /// the `{SCHEME}` prefix.
    fn encode(&self, clear: &str) -> String;

    /// Whether a cleartext password matches an encoded value (prefix already
    /// stripped).
    fn matches(&self, clear: &str, encoded: &str) -> bool;
}

/// Salted SHA-256: base64(sha256(password || salt) || salt) with an 8-byte
/// random salt.
pub struct SaltedSha256Scheme;

const SALT_LEN: usize = 8;
const DIGEST_LEN: usize = 32;

impl PasswordStorageScheme for SaltedSha256Scheme {
    fn name(&self) -> &'static str {
        "SSHA256"
    }

    fn encode(&self, clear: &str) -> String {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut hasher = Sha256::new();
        hasher.update(clear.as_bytes());
        hasher.update(salt);
        let digest = hasher.finalize();
        let mut combined = Vec::with_capacity(DIGEST_LEN + SALT_LEN);
        combined.extend_from_slice(&digest);
        combined.extend_from_slice(&salt);
        BASE64.encode(combined)
    }

    fn matches(&self, clear: &str, encoded: &str) -> bool {
        let Ok(combined) = BASE64.decode(encoded) else {
            return false;
        };
        if combined.len() <= DIGEST_LEN {
            return false;
        }
        let (stored_digest, salt) = combined.split_at(DIGEST_LEN);
        let mut hasher = Sha256::new();
        hasher.update(clear.as_bytes());
        hasher.update(salt);
        let digest = hasher.finalize();
        digest.as_slice().ct_eq(stored_digest).into()
    }
}

/// Stores the password as given. Kept for interoperability with entries
/// imported from systems that never hashed.
pub struct ClearScheme;

impl PasswordStorageScheme for ClearScheme {
    fn name(&self) -> &'static str {
        "CLEAR"
    }

    fn encode(&self, clear: &str) -> String {
        clear.to_string()
    }

    fn matches(&self, clear: &str, encoded: &str) -> bool {
        clear.as_bytes().ct_eq(encoded.as_bytes()).into()
    }
}

/// Whether a value already carries a `{SCHEME}` prefix.
pub fn is_pre_encoded(value: &str) -> bool {
    split_scheme(value).is_some()
}

/// Splits `{SCHEME}rest` into the scheme tag and the encoded remainder.
pub fn split_scheme(value: &str) -> Option<(&str, &str)> {
    let rest = value.strip_prefix('{')?;
    let close = rest.find('}')?;
    if close == 0 {
        return None;
    }
    Some((&rest[..close], &rest[close + 1..]))
}

/// Prepends the scheme tag to an encoded value.
pub fn tag_value(scheme: &dyn PasswordStorageScheme, encoded: &str) -> String {
    format!("{{{}}}{}", scheme.name(), encoded)
}

/// Whether a cleartext password matches any of the stored values. Tagged
/// values are checked with the scheme named by their tag; untagged values
/// are compared in constant time against the cleartext.
pub fn password_matches(
    schemes: &[std::sync::Arc<dyn PasswordStorageScheme>],
    clear: &str,
    stored_values: &[String],
) -> bool {
    for stored in stored_values {
        match split_scheme(stored) {
            Some((tag, encoded)) => {
                if schemes
                    .iter()
                    .any(|s| s.name().eq_ignore_ascii_case(tag) && s.matches(clear, encoded))
                {
                    return true;
                }
            }
            None => {
                if bool::from(clear.as_bytes().ct_eq(stored.as_bytes())) {
                    return true;
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::{
        ClearScheme, PasswordStorageScheme, SaltedSha256Scheme, is_pre_encoded, password_matches,
        split_scheme, tag_value,
    };
    use std::sync::Arc;

    #[test]
    fn ssha256_round_trip() {
        let scheme = SaltedSha256Scheme;
        let encoded = scheme.encode("secret12");
        assert!(scheme.matches("secret12", &encoded));
        assert!(!scheme.matches("secret13", &encoded));
        // Two encodings of the same password differ because of the salt.
        assert_ne!(encoded, scheme.encode("secret12"));
    }

    #[test]
    fn scheme_prefix_parsing() {
        assert!(is_pre_encoded("{SSHA256}abc"));
        assert!(!is_pre_encoded("plain"));
        assert!(!is_pre_encoded("{}empty"));
        assert_eq!(split_scheme("{CLEAR}pw"), Some(("CLEAR", "pw")));
    }

    #[test]
    fn matching_respects_tags() {
        let schemes: Vec<Arc<dyn PasswordStorageScheme>> =
            vec![Arc::new(SaltedSha256Scheme), Arc::new(ClearScheme)];
        let tagged = tag_value(&SaltedSha256Scheme, &SaltedSha256Scheme.encode("pw"));
        assert!(password_matches(&schemes, "pw", &[tagged.clone()]));
        assert!(!password_matches(&schemes, "other", &[tagged]));
        // Untagged values compare as cleartext.
        assert!(password_matches(&schemes, "pw", &["pw".to_string()]));
        // Unknown tags never match.
        assert!(!password_matches(&schemes, "pw", &["{MD5}pw".to_string()]));
    }
}
