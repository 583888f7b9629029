use sha2::{Digest as ShaDigest, Sha512};

pub type Digest = [u8; 64];

pub trait Hashable {
    fn hash(&self) -> Digest;
}

/// Incremental SHA-512 over fixed-width big-endian fields.
pub struct DigestBuilder {
    hasher: Sha512,
}

impl DigestBuilder {
    pub fn new() -> Self {
        DigestBuilder {
            hasher: Sha512::new(),
        }
    }

    pub fn update_u64(&mut self, value: u64) -> &mut Self {
        self.hasher.update(value.to_be_bytes());
        self
    }

    pub fn update_i64(&mut self, value: i64) -> &mut Self {
        self.hasher.update(value.to_be_bytes());
        self
    }

    pub fn finish(self) -> Digest {
        let result = self.hasher.finalize();
        let mut digest = [0u8; 64];
        digest.copy_from_slice(&result[..]);
        digest
    }
}

impl Default for DigestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub fn to_hex(digest: &Digest) -> String {
    hex::encode(digest)
}
