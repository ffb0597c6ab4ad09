use sha1::{Digest, Sha1};

/// `0xFFF_FFFF_FFFF_FFFF`, the largest value of 15 hex digits.
const LONG_SCALE: f64 = 0xFFF_FFFF_FFFF_FFFF_u64 as f64;

/// Map `(key, distinct_id, salt)` to a stable number in `[0, 1)`.
///
/// Uses the first 15 hex digits (60 bits) of the SHA-1 of `"{key}.{distinct_id}{salt}"`, so every
/// SDK and the server put a given subject into the same bucket.
pub(crate) fn hash(key: &str, distinct_id: &str, salt: &str) -> f64 {
    let digest = Sha1::digest(format!("{key}.{distinct_id}{salt}").as_bytes());

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let value = u64::from_be_bytes(prefix) >> 4;

    value as f64 / LONG_SCALE
}

#[cfg(test)]
mod tests {
    use super::hash;

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-12,
            "{actual} is not close to {expected}"
        );
    }

    #[test]
    fn test_hash() {
        assert_close(hash("simple-flag", "distinct_id_0", ""), 0.7836963764220432);
        assert_close(hash("simple-flag", "distinct_id_1", ""), 0.3397069926995401);
        assert_close(hash("simple-flag", "user-2", ""), 0.1962789067725905);
    }

    #[test]
    fn test_hash_with_salt() {
        assert_close(
            hash("multivariate-flag", "distinct_id_0", "variant"),
            0.6186454537930379,
        );
        assert_close(
            hash("multivariate-flag", "distinct_id_9", "variant"),
            0.9801222895396041,
        );
    }
}
