//! Deterministic naming and hashing helpers
//!
//! Every object the controllers produce has a name derived only from its
//! inputs, so a retried reconciliation lands on the same objects.

use std::fmt::Write;

use aws_lc_rs::digest;
use kube::core::ApiResource;

/// Maximum length of a Kubernetes object name that is also a valid label value
pub const MAX_NAME_LENGTH: usize = 63;

const RFC4648_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
const RFC4648_HEX_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHIJKLMNOPQRSTUV";

/// Known plurals for kinds that don't follow simple English rules
const KIND_PLURALS: &[(&str, &str)] = &[
    ("configmap", "configmaps"),
    ("secret", "secrets"),
    ("serviceaccount", "serviceaccounts"),
    ("role", "roles"),
    ("rolebinding", "rolebindings"),
    ("dynamicschema", "dynamicschemas"),
];

/// SHA-256 digest of the input bytes
pub fn sha256(input: &[u8]) -> Vec<u8> {
    digest::digest(&digest::SHA256, input).as_ref().to_vec()
}

/// Lowercase hex encoding
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Full lowercase hex SHA-256 of the input
pub fn sha256_hex(input: &[u8]) -> String {
    hex(&sha256(input))
}

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Uses truncated SHA-256 so the value is stable when persisted in labels
/// and annotations.
pub fn deterministic_hash(input: &str) -> String {
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hex(&hash.as_ref()[..8])
}

/// Join name parts with `-`, hashing the tail when the result is too long
///
/// Names longer than 63 characters are cut to 52 characters and suffixed
/// with the first 10 hex characters of the SHA-256 of the full name.
pub fn safe_concat_name(parts: &[&str]) -> String {
    let full = parts.join("-");
    if full.len() <= MAX_NAME_LENGTH {
        return full;
    }
    let digest = sha256_hex(full.as_bytes());
    let prefix = full[..52].trim_end_matches(['-', '.']);
    format!("{}-{}", prefix, &digest[..10])
}

/// RFC 4648 base32 encoding
pub fn base32(input: &[u8], pad: bool) -> String {
    encode_base32(input, RFC4648_ALPHABET, pad)
}

/// RFC 4648 base32 encoding with the extended hex alphabet
pub fn base32_hex(input: &[u8], pad: bool) -> String {
    encode_base32(input, RFC4648_HEX_ALPHABET, pad)
}

fn encode_base32(input: &[u8], alphabet: &[u8; 32], pad: bool) -> String {
    let mut out = String::with_capacity(input.len().div_ceil(5) * 8);
    for chunk in input.chunks(5) {
        let mut block = [0u8; 5];
        block[..chunk.len()].copy_from_slice(chunk);
        let bits = block.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        let symbols = (chunk.len() * 8).div_ceil(5);
        for i in 0..8 {
            if i < symbols {
                let index = ((bits >> (35 - i * 5)) & 0x1f) as usize;
                out.push(alphabet[index] as char);
            } else if pad {
                out.push('=');
            }
        }
    }
    out
}

/// Pluralize a Kubernetes kind for API paths
///
/// Uses a lookup table for known kinds, falling back to simple
/// pluralization rules for dynamic kinds.
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    for (singular, plural) in KIND_PLURALS {
        if *singular == lower {
            return (*plural).to_string();
        }
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Split an apiVersion into (group, version); core resources have an empty group
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Build an ApiResource from a known apiVersion and kind.
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_hash_is_stable() {
        assert_eq!(deterministic_hash("abc"), deterministic_hash("abc"));
        assert_ne!(deterministic_hash("abc"), deterministic_hash("abd"));
        assert_eq!(deterministic_hash("abc").len(), 16);
        // sha256("abc") starts with ba7816bf8f01cfea
        assert_eq!(deterministic_hash("abc"), "ba7816bf8f01cfea");
    }

    #[test]
    fn test_safe_concat_short_names_are_joined() {
        assert_eq!(safe_concat_name(&["prod", "pool-a"]), "prod-pool-a");
        assert_eq!(
            safe_concat_name(&["m-0", "machine", "plan"]),
            "m-0-machine-plan"
        );
    }

    #[test]
    fn test_safe_concat_long_names_are_hashed() {
        let long = "a".repeat(60);
        let name = safe_concat_name(&[&long, "machine", "bootstrap"]);
        assert_eq!(name.len(), 63);
        assert!(name.starts_with(&"a".repeat(52)));
        assert_eq!(name, safe_concat_name(&[&long, "machine", "bootstrap"]));
        assert_ne!(name, safe_concat_name(&[&long, "machine", "plan"]));
    }

    #[test]
    fn test_safe_concat_trims_separator_before_hash() {
        let first = "b".repeat(51);
        let name = safe_concat_name(&[&first, "xxxxxxxxxxxxxxxxxxx"]);
        // character 52 is the separator, which is trimmed before the suffix
        assert!(name.starts_with(&format!("{}-", first)));
        assert!(!name.contains("--"));
    }

    #[test]
    fn test_base32_matches_rfc4648_vectors() {
        assert_eq!(base32(b"", true), "");
        assert_eq!(base32(b"f", true), "MY======");
        assert_eq!(base32(b"fo", true), "MZXQ====");
        assert_eq!(base32(b"foobar", true), "MZXW6YTBOI======");
        assert_eq!(base32(b"foobar", false), "MZXW6YTBOI");
        assert_eq!(base32_hex(b"foobar", true), "CPNMUOJ1E8======");
        assert_eq!(base32_hex(b"f", false), "CO");
    }

    #[test]
    fn test_pluralize_kind() {
        assert_eq!(pluralize_kind("Secret"), "secrets");
        assert_eq!(pluralize_kind("Amazonec2MachineTemplate"), "amazonec2machinetemplates");
        assert_eq!(pluralize_kind("Policy"), "policies");
        assert_eq!(pluralize_kind("Address"), "addresses");
    }

    #[test]
    fn test_build_api_resource() {
        let ar = build_api_resource("rke-machine.trellis.dev/v1", "DigitaloceanMachineTemplate");
        assert_eq!(ar.group, "rke-machine.trellis.dev");
        assert_eq!(ar.version, "v1");
        assert_eq!(ar.plural, "digitaloceanmachinetemplates");

        let core = build_api_resource("v1", "Secret");
        assert_eq!(core.group, "");
        assert_eq!(core.version, "v1");
    }
}
