//! Content fingerprints for change detection
//!
//! Hashes are only compared against each other to decide whether an
//! artifact must be rewritten, so MD5 is sufficient.

use std::collections::BTreeMap;

use md5::{Digest, Md5};

/// Prefix of every fingerprint produced here
pub const HASH_PREFIX: &str = "md5:";

/// Fingerprint of a key/value map: `md5:<32 lowercase hex chars>`.
///
/// Keys are fed in lexicographic order, each key's bytes followed by its
/// value's bytes, so equal maps always hash equal.
pub fn hash_string_map(items: &BTreeMap<String, String>) -> String {
    let mut hasher = Md5::new();
    for (key, value) in items {
        hasher.update(key.as_bytes());
        hasher.update(value.as_bytes());
    }
    format!("{}{}", HASH_PREFIX, hex::encode(hasher.finalize()))
}

/// Same as [`hash_string_map`] for pairs in arbitrary order
pub fn hash_pairs<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let sorted: BTreeMap<String, String> = pairs
        .into_iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    hash_string_map(&sorted)
}
