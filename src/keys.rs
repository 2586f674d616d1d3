use anyhow::{anyhow, Result};
use chacha20poly1305::aead::{AeadInPlace, NewAead};
use chacha20poly1305::ChaCha8Poly1305;
use chum_store::StoreError;
use ed25519_dalek::{PublicKey, SecretKey, Signature, Signer, Verifier};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

/// An ed25519 keypair held as its 32-byte seed.
#[derive(Clone, Copy)]
pub struct Keypair([u8; 32]);

impl Keypair {
    pub fn generate() -> Self {
        let mut secret = [0; 32];
        getrandom::getrandom(&mut secret).unwrap();
        Self(secret)
    }

    pub fn new(seed: [u8; 32]) -> Self {
        Self(seed)
    }

    fn to_keypair(self) -> ed25519_dalek::Keypair {
        let secret = SecretKey::from_bytes(&self.0).unwrap();
        let public = PublicKey::from(&secret);
        ed25519_dalek::Keypair { secret, public }
    }

    /// Hex form of the public key, the value carried by `Instance` objects.
    pub fn public_hex(self) -> String {
        hex::encode(self.to_keypair().public.to_bytes())
    }

    pub fn sign(self, payload: &[u8]) -> [u8; 64] {
        self.to_keypair().sign(payload).to_bytes()
    }

    pub fn verify(public_hex: &str, payload: &[u8], sig: &[u8; 64]) -> Result<()> {
        let mut public = [0; 32];
        hex::decode_to_slice(public_hex, &mut public)?;
        let public = PublicKey::from_bytes(&public)?;
        public.verify(payload, &Signature::from(*sig))?;
        Ok(())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Keypair({}..)", &self.public_hex()[..8])
    }
}

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// The instance keychain: one keypair persisted in the instance directory,
/// optionally sealed with a key derived from the init secret.
#[derive(Debug)]
pub struct Keychain {
    path: PathBuf,
    keypair: Keypair,
    sealed: bool,
}

impl Keychain {
    /// Unlocks (or creates) the keychain. Sealing without a secret is
    /// refused with `invalid-secret`; so is unsealing with the wrong one.
    pub fn unlock(dir: &Path, secret: Option<&str>, seal: bool) -> Result<Self> {
        let key = match (seal, secret) {
            (true, Some(secret)) => Some(derive_key(secret)),
            (true, None) => return Err(StoreError::InvalidSecret.into()),
            (false, _) => None,
        };
        let path = dir.join("keys");
        let keypair = if path.is_file() {
            let bytes = fs::read(&path)?;
            match &key {
                Some(key) => open_sealed(key, &bytes)?,
                None => {
                    let seed: [u8; 32] = bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| anyhow!("malformed keychain file"))?;
                    Keypair::new(seed)
                }
            }
        } else {
            let keypair = Keypair::generate();
            let bytes = match &key {
                Some(key) => seal_seed(key, &keypair.0),
                None => keypair.0.to_vec(),
            };
            fs::write(&path, bytes)?;
            keypair
        };
        Ok(Self {
            path,
            keypair,
            sealed: seal,
        })
    }

    pub fn keypair(&self) -> Keypair {
        self.keypair
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn derive_key(secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

fn seal_seed(key: &[u8; 32], seed: &[u8; 32]) -> Vec<u8> {
    let mut nonce = [0; NONCE_LEN];
    getrandom::getrandom(&mut nonce).unwrap();
    let mut payload = seed.to_vec();
    let tag = ChaCha8Poly1305::new(&(*key).into())
        .encrypt_in_place_detached(&nonce.into(), &[], &mut payload)
        .unwrap();
    let mut out = nonce.to_vec();
    out.extend_from_slice(&payload);
    out.extend_from_slice(&tag);
    out
}

fn open_sealed(key: &[u8; 32], bytes: &[u8]) -> Result<Keypair> {
    if bytes.len() != NONCE_LEN + 32 + TAG_LEN {
        return Err(anyhow!("malformed sealed keychain file"));
    }
    let nonce: [u8; NONCE_LEN] = bytes[..NONCE_LEN].try_into().unwrap();
    let mut payload: Vec<u8> = bytes[NONCE_LEN..NONCE_LEN + 32].to_vec();
    let tag: [u8; TAG_LEN] = bytes[NONCE_LEN + 32..].try_into().unwrap();
    ChaCha8Poly1305::new(&(*key).into())
        .decrypt_in_place_detached(&nonce.into(), &[], &mut payload, &tag.into())
        .map_err(|_| StoreError::InvalidSecret)?;
    let seed: [u8; 32] = payload.as_slice().try_into().unwrap();
    Ok(Keypair::new(seed))
}
