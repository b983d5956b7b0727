// Hybrid Key Encapsulation — ML-KEM-768 + X25519
//
// The initiator encapsulates against whichever hop public keys are present,
// concatenates the shared values (KEM first, then ECDH) and runs them through
// HKDF under a fixed label. The hop reverses the handshake with its secret
// keys. There is no fallback: a hop with neither key type is refused.

use super::CryptoError;
use crate::rng::RngHandle;
use hkdf::Hkdf;
use ml_kem::kem::{Decapsulate, DecapsulationKey, EncapsulationKey, Encapsulate};
use ml_kem::{Ciphertext, Encoded, EncodedSizeUser, KemCore, MlKem768, MlKem768Params};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Size of X25519 public key (bytes)
pub const X25519_KEY_SIZE: usize = 32;

/// Size of a derived hop secret (bytes)
pub const SHARED_SECRET_SIZE: usize = 32;

/// HKDF salt for combining hybrid KEM output
const HYBRID_KEM_LABEL: &[u8] = b"SHROUD-HYBRID-KEM";

/// HKDF info for the combined secret
const HYBRID_KEM_INFO: &[u8] = b"shroud hop secret v1";

/// Per-hop shared secret
///
/// Zeroized on drop. `wipe` overwrites it with random bytes first so that a
/// retired key never lingers as its original value.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; SHARED_SECRET_SIZE]);

impl SharedSecret {
    pub fn from_bytes(bytes: [u8; SHARED_SECRET_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.0
    }

    /// Overwrite with random bytes
    pub fn wipe(&mut self, rng: &mut RngHandle) {
        rng.fill_bytes(&mut self.0);
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

impl PartialEq for SharedSecret {
    // Constant time over the fixed-size secret
    fn eq(&self, other: &Self) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
    }
}

/// Public keys a hop advertises
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopPublicKeys {
    /// ML-KEM-768 encapsulation key (1184 bytes)
    pub kyber_pk: Option<Vec<u8>>,
    /// X25519 public key
    pub x25519_pk: Option<[u8; X25519_KEY_SIZE]>,
}

impl HopPublicKeys {
    pub fn has_key_material(&self) -> bool {
        self.kyber_pk.is_some() || self.x25519_pk.is_some()
    }

    /// Short, non-secret identifier for logs
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        if let Some(pk) = &self.kyber_pk {
            hasher.update(pk);
        }
        if let Some(pk) = &self.x25519_pk {
            hasher.update(pk);
        }
        hex::encode(&hasher.finalize().as_bytes()[..8])
    }
}

/// Handshake values the hop needs to reproduce the initiator's secret
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopHandshake {
    /// ML-KEM-768 ciphertext (1088 bytes)
    pub kem_ciphertext: Option<Vec<u8>>,
    /// Initiator's ephemeral X25519 public key
    pub ephemeral_x25519: Option<[u8; X25519_KEY_SIZE]>,
}

/// A hop's long-term secret keys
pub struct HopSecretKeys {
    kem: Option<(DecapsulationKey<MlKem768Params>, EncapsulationKey<MlKem768Params>)>,
    x25519: Option<StaticSecret>,
}

impl HopSecretKeys {
    /// Generate hop keys; either half may be omitted
    pub fn generate(rng: &mut RngHandle, with_kem: bool, with_x25519: bool) -> Self {
        let kem = with_kem.then(|| MlKem768::generate(rng));
        let x25519 = with_x25519.then(|| StaticSecret::random_from_rng(&mut *rng));
        Self { kem, x25519 }
    }

    /// Public half to advertise to circuit builders
    pub fn public_keys(&self) -> HopPublicKeys {
        HopPublicKeys {
            kyber_pk: self
                .kem
                .as_ref()
                .map(|(_, ek)| ek.as_bytes().as_slice().to_vec()),
            x25519_pk: self
                .x25519
                .as_ref()
                .map(|sk| PublicKey::from(sk).to_bytes()),
        }
    }
}

impl std::fmt::Debug for HopSecretKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HopSecretKeys")
            .field("kem", &self.kem.is_some())
            .field("x25519", &self.x25519.is_some())
            .finish()
    }
}

/// Initiator side: derive the hop secret from its public keys
pub fn derive_shared_secret(
    node_id: &str,
    keys: &HopPublicKeys,
    rng: &mut RngHandle,
) -> Result<(SharedSecret, HopHandshake), CryptoError> {
    let mut material = Zeroizing::new(Vec::with_capacity(2 * SHARED_SECRET_SIZE));
    let mut handshake = HopHandshake::default();

    if let Some(pk) = &keys.kyber_pk {
        let encoded = Encoded::<EncapsulationKey<MlKem768Params>>::try_from(pk.as_slice())
            .map_err(|_| CryptoError::InvalidKey(format!("ML-KEM-768 public key for {}", node_id)))?;
        let ek = EncapsulationKey::<MlKem768Params>::from_bytes(&encoded);
        let (ciphertext, shared) = ek
            .encapsulate(rng)
            .map_err(|_| CryptoError::InvalidKey(format!("ML-KEM-768 encapsulation for {}", node_id)))?;
        material.extend_from_slice(shared.as_slice());
        handshake.kem_ciphertext = Some(ciphertext.as_slice().to_vec());
    }

    if let Some(pk) = keys.x25519_pk {
        let ephemeral = EphemeralSecret::random_from_rng(&mut *rng);
        let ephemeral_pk = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&PublicKey::from(pk));
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKey(format!(
                "non-contributory X25519 key for {}",
                node_id
            )));
        }
        material.extend_from_slice(shared.as_bytes());
        handshake.ephemeral_x25519 = Some(ephemeral_pk.to_bytes());
    }

    // Fail closed: never substitute random or weaker key material
    if material.is_empty() {
        return Err(CryptoError::NoKeyMaterial {
            node_id: node_id.to_string(),
        });
    }

    Ok((combine(&material)?, handshake))
}

/// Hop side: reproduce the initiator's secret from the handshake
pub fn respond_shared_secret(
    node_id: &str,
    keys: &HopSecretKeys,
    handshake: &HopHandshake,
) -> Result<SharedSecret, CryptoError> {
    let mut material = Zeroizing::new(Vec::with_capacity(2 * SHARED_SECRET_SIZE));

    if let Some(ct_bytes) = &handshake.kem_ciphertext {
        let (dk, _) = keys
            .kem
            .as_ref()
            .ok_or_else(|| CryptoError::InvalidKey(format!("{} has no ML-KEM key", node_id)))?;
        let ciphertext = Ciphertext::<MlKem768>::try_from(ct_bytes.as_slice())
            .map_err(|_| CryptoError::InvalidKey("ML-KEM-768 ciphertext".to_string()))?;
        let shared = dk
            .decapsulate(&ciphertext)
            .map_err(|_| CryptoError::InvalidKey("ML-KEM-768 decapsulation".to_string()))?;
        material.extend_from_slice(shared.as_slice());
    }

    if let Some(ephemeral) = handshake.ephemeral_x25519 {
        let sk = keys
            .x25519
            .as_ref()
            .ok_or_else(|| CryptoError::InvalidKey(format!("{} has no X25519 key", node_id)))?;
        let shared = sk.diffie_hellman(&PublicKey::from(ephemeral));
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKey(
                "non-contributory X25519 ephemeral".to_string(),
            ));
        }
        material.extend_from_slice(shared.as_bytes());
    }

    if material.is_empty() {
        return Err(CryptoError::NoKeyMaterial {
            node_id: node_id.to_string(),
        });
    }

    combine(&material)
}

fn combine(material: &[u8]) -> Result<SharedSecret, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(HYBRID_KEM_LABEL), material);
    let mut out = [0u8; SHARED_SECRET_SIZE];
    hk.expand(HYBRID_KEM_INFO, &mut out)
        .map_err(|_| CryptoError::InvalidKey("HKDF output length".to_string()))?;
    Ok(SharedSecret(out))
}
