use anyhow::Result;
use sha2::{Digest, Sha256};

/// Address of a stored payload: the SHA-256 digest of its canonical bytes.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Hash([u8; 32]);

impl Hash {
    pub fn new(hash: [u8; 32]) -> Self {
        Self(hash)
    }

    /// Hashes canonical bytes into an address.
    pub fn digest(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }
}

impl From<Hash> for [u8; 32] {
    fn from(hash: Hash) -> Self {
        hash.0
    }
}

impl AsRef<[u8; 32]> for Hash {
    fn as_ref(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[0..4]))
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::str::FromStr for Hash {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(anyhow::anyhow!("invalid hash length {}", s.len()));
        }
        let mut hash = [0; 32];
        hex::decode_to_slice(s, &mut hash)?;
        Ok(Self(hash))
    }
}

/// Address of an ID projection: the SHA-256 digest of the ID frame.
///
/// The ID frame carries an extra attribute on the outer tag, so an [`IdHash`]
/// can never collide with the [`Hash`] of any full object.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct IdHash([u8; 32]);

impl IdHash {
    pub fn new(hash: [u8; 32]) -> Self {
        Self(hash)
    }

    pub fn digest(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    /// The ID object is itself stored under its digest like any other object.
    pub fn as_object_hash(&self) -> Hash {
        Hash::new(self.0)
    }
}

impl From<IdHash> for [u8; 32] {
    fn from(hash: IdHash) -> Self {
        hash.0
    }
}

impl AsRef<[u8; 32]> for IdHash {
    fn as_ref(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for IdHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[0..4]))
    }
}

impl std::fmt::Display for IdHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::str::FromStr for IdHash {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(anyhow::anyhow!("invalid id hash length {}", s.len()));
        }
        let mut hash = [0; 32];
        hex::decode_to_slice(s, &mut hash)?;
        Ok(Self(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable() {
        let a = Hash::digest(b"chum");
        let b = Hash::digest(b"chum");
        assert_eq!(a, b);
        assert_eq!(a.to_string().len(), 64);
        assert_eq!(a.to_string().parse::<Hash>().unwrap(), a);
    }

    #[test]
    fn id_digest_differs_from_object_digest_frames() {
        // same payload bytes hash equal, the frames differ upstream
        let h = Hash::digest(b"<o t=\"Person\"></o>");
        let i = IdHash::digest(b"<o t=\"Person\" id></o>");
        assert_ne!(h.as_ref(), i.as_ref());
    }
}
