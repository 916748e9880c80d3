//! 64-bit SimHash fingerprints
//!
//! Locality-sensitive: small textual edits flip few bits, so near
//! duplicates sit at small Hamming distances. Token features are word
//! unigrams plus adjacent bigrams, hashed with FNV-1a for stability
//! across processes and releases.

/// FNV-1a, 64-bit
fn fnv1a(data: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

fn tokens(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|t| {
            t.chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|t| !t.is_empty())
        .collect()
}

/// Compute the 64-bit SimHash of a text
pub fn simhash(text: &str) -> u64 {
    let tokens = tokens(text);
    if tokens.is_empty() {
        return 0;
    }

    let mut votes = [0i32; 64];
    let mut feature = |data: &[u8], weight: i32| {
        let hash = fnv1a(data);
        for (bit, vote) in votes.iter_mut().enumerate() {
            if hash >> bit & 1 == 1 {
                *vote += weight;
            } else {
                *vote -= weight;
            }
        }
    };

    for token in &tokens {
        feature(token.as_bytes(), 1);
    }
    for pair in tokens.windows(2) {
        feature(format!("{} {}", pair[0], pair[1]).as_bytes(), 2);
    }

    let mut hash = 0u64;
    for (bit, vote) in votes.iter().enumerate() {
        if *vote > 0 {
            hash |= 1 << bit;
        }
    }
    hash
}

/// Bits differing between two fingerprints
pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}
