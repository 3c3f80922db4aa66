//! Cache path derivation.
//!
//! Every source gets its own directory named after a hash of its URI, and
//! every cached response inside it is named after a sanitized cache key.

use sha1::{Digest, Sha1};

/// Number of trailing URI characters kept readable in a source directory name
const TRAILING_CHARS: usize = 32;

/// Characters rejected in file names on at least one supported platform
const INVALID_FILE_NAME_CHARS: &[char] = &['"', '<', '>', '|', ':', '*', '?', '\\', '/'];

/// Compute the directory name for a source URI.
///
/// The name is the SHA-1 of the UTF-8 URI, hex encoded with the digest bytes in
/// reverse order, followed by `$` and the last 32 characters of the URI. The
/// result still needs [`sanitize_file_name`] before it touches disk.
pub fn compute_hash(source_uri: &str) -> String {
    let digest = Sha1::digest(source_uri.as_bytes());
    let mut reversed = digest.to_vec();
    reversed.reverse();

    let char_count = source_uri.chars().count();
    let trailing: String = if char_count > TRAILING_CHARS {
        source_uri.chars().skip(char_count - TRAILING_CHARS).collect()
    } else {
        source_uri.to_string()
    };

    format!("{}${trailing}", hex::encode(reversed))
}

/// Replace characters that are invalid in file names with `_` and collapse
/// runs of `_` into one.
pub fn sanitize_file_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| {
            if c.is_control() || INVALID_FILE_NAME_CHARS.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect();

    let mut sanitized = String::with_capacity(replaced.len());
    for c in replaced.chars() {
        if c == '_' && sanitized.ends_with('_') {
            continue;
        }
        sanitized.push(c);
    }
    sanitized
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_hash_is_deterministic_and_keeps_uri_tail() {
        let uri = "https://api.example.org/v3/index.json";
        let first = compute_hash(uri);
        let second = compute_hash(uri);

        assert_eq!(first, second);
        let (digest, tail) = first.split_once('$').unwrap();
        assert_eq!(digest.len(), 40);
        assert_eq!(tail, "://api.example.org/v3/index.json");
    }

    #[test]
    fn test_short_uri_is_kept_whole() {
        let hash = compute_hash("http://a/b");
        assert!(hash.ends_with("$http://a/b"));
    }

    #[test]
    fn test_different_sources_get_different_directories() {
        assert_ne!(
            compute_hash("https://feed-a.example.org/v3/index.json"),
            compute_hash("https://feed-b.example.org/v3/index.json")
        );
    }

    #[test]
    fn test_sanitize_replaces_and_collapses() {
        assert_eq!(sanitize_file_name("list_newtonsoft.json"), "list_newtonsoft.json");
        assert_eq!(sanitize_file_name("a:/b??c"), "a_b_c");
        assert_eq!(sanitize_file_name("https://x/y"), "https_x_y");
        assert_eq!(sanitize_file_name("a\u{0}b"), "a_b");
    }

    proptest! {
        #[test]
        fn test_sanitized_names_contain_no_invalid_chars(name in ".{0,64}") {
            let sanitized = sanitize_file_name(&name);
            prop_assert!(!sanitized.chars().any(|c| c.is_control() || INVALID_FILE_NAME_CHARS.contains(&c)));
            prop_assert!(!sanitized.contains("__"));
        }

        #[test]
        fn test_sanitize_is_idempotent(name in ".{0,64}") {
            let once = sanitize_file_name(&name);
            prop_assert_eq!(sanitize_file_name(&once), once);
        }
    }
}
