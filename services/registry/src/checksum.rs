//! Incremental content checksums

use md5::{Digest, Md5};

/// Running checksum and byte count over an image's content.
///
/// Each upload owns its own accumulator and folds chunks into it as they
/// pass through to the storage backend.
#[derive(Debug, Clone, Default)]
pub struct Checksum {
    hasher: Md5,
    size: u64,
}

impl Checksum {
    /// Start an empty checksum.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a chunk into the checksum.
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.size += chunk.len() as u64;
    }

    /// Number of bytes folded in so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Finish the checksum, returning the lowercase hex digest and the total
    /// byte count.
    pub fn finalize(self) -> (String, u64) {
        (hex::encode(self.hasher.finalize()), self.size)
    }
}

/// Checksum a complete buffer in one go.
pub fn digest(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Whether a client supplied checksum matches a computed one.
pub fn matches(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incremental_matches_one_shot() {
        let mut checksum = Checksum::new();
        checksum.update(b"chunk00000");
        checksum.update(b"");
        checksum.update(b"remainder");
        assert_eq!(checksum.size(), 19);

        let (hex, size) = checksum.finalize();
        assert_eq!(size, 19);
        assert_eq!(hex, digest(b"chunk00000remainder"));
    }

    #[test]
    fn known_digest() {
        assert_eq!(Checksum::new().finalize().0, "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(digest(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn comparison_ignores_case() {
        let actual = digest(b"chunk00000remainder");
        assert!(matches(&actual.to_uppercase(), &actual));
        assert!(!matches(&digest(b"invalid"), &actual));
    }
}
