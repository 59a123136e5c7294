//! BLAKE3 hashing utilities
//!
//! Every digest in the engine (proposal IDs, challenge IDs, island chain
//! hashes, aggregate digests) is a 256-bit BLAKE3 output.

/// Hash data using BLAKE3 (256-bit output)
pub fn hash_blake3(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Derive key material for a named purpose
pub fn derive_key(context: &str, key_material: &[u8]) -> [u8; 32] {
    blake3::derive_key(context, key_material)
}

/// Incremental hasher with optional length framing.
///
/// `update_framed` prefixes each field with its length so variable-length
/// fields cannot be shifted across boundaries to forge a collision.
pub struct IncrementalHasher {
    hasher: blake3::Hasher,
}

impl IncrementalHasher {
    pub fn new() -> Self {
        Self {
            hasher: blake3::Hasher::new(),
        }
    }

    /// Hasher bound to a domain tag
    pub fn with_domain(domain: &str) -> Self {
        let mut hasher = Self::new();
        hasher.update_framed(domain.as_bytes());
        hasher
    }

    pub fn new_keyed(key: &[u8; 32]) -> Self {
        Self {
            hasher: blake3::Hasher::new_keyed(key),
        }
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.hasher.update(data);
        self
    }

    /// Update with a length-prefixed field
    pub fn update_framed(&mut self, data: &[u8]) -> &mut Self {
        self.hasher.update(&(data.len() as u64).to_le_bytes());
        self.hasher.update(data);
        self
    }

    pub fn update_u64(&mut self, value: u64) -> &mut Self {
        self.hasher.update(&value.to_le_bytes());
        self
    }

    pub fn update_i64(&mut self, value: i64) -> &mut Self {
        self.hasher.update(&value.to_le_bytes());
        self
    }

    pub fn finalize(&self) -> [u8; 32] {
        *self.hasher.finalize().as_bytes()
    }
}

impl Default for IncrementalHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Digest of a floating point vector, stable across platforms
pub fn hash_f64_slice(values: &[f64]) -> [u8; 32] {
    let mut hasher = IncrementalHasher::with_domain("sovereign.vector.v1");
    hasher.update_u64(values.len() as u64);
    for value in values {
        hasher.update(&value.to_bits().to_le_bytes());
    }
    hasher.finalize()
}
