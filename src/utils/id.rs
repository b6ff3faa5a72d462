use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

fn to_short(hash: u64) -> String {
    let encoded = base62::encode(hash);
    let cut = encoded.len().min(8);
    // small hashes encode to fewer than 8 digits
    format!("{:0>8}", &encoded[..cut])
}

pub fn short_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();

    let mut hasher = DefaultHasher::new();
    now.hash(&mut hasher);
    let hash = hasher.finish();

    to_short(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id() {
        let id = short_id();
        assert_eq!(id.len(), 8);
    }

    #[test]
    fn test_short_encodings_are_padded() {
        assert_eq!(to_short(0), "00000000");
        assert_eq!(to_short(61).len(), 8);
        assert_eq!(to_short(u64::MAX).len(), 8);
    }
}
