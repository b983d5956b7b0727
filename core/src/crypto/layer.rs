// Layer Keys — per-layer key derivation, AEAD sealing and header tags
//
// Blob format: [24-byte nonce][ciphertext + 16-byte Poly1305 tag]
// AAD is rebuilt by the opener from (layer index, node id, version) and never
// travels inside the blob.

use super::kem::SharedSecret;
use super::CryptoError;
use crate::rng::RngHandle;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

/// XChaCha20 nonce size (bytes)
pub const NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size (bytes)
pub const AEAD_TAG_SIZE: usize = 16;

/// Layer format version bound into every AAD
pub const LAYER_VERSION: u8 = 1;

/// HKDF salt for per-layer key derivation
const LAYER_KDF_SALT: &[u8] = b"SHROUD-ONION-LAYER";

/// Independent encryption and MAC keys for one layer
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct LayerKeys {
    enc: [u8; 32],
    mac: [u8; 32],
}

impl LayerKeys {
    /// Expand a hop secret into keys bound to `layer_index`
    pub fn derive(secret: &SharedSecret, layer_index: u8) -> Result<Self, CryptoError> {
        let hk = Hkdf::<Sha256>::new(Some(LAYER_KDF_SALT), secret.as_bytes());
        let mut enc = [0u8; 32];
        let mut mac = [0u8; 32];
        hk.expand(format!("ENC-L{}", layer_index).as_bytes(), &mut enc)
            .map_err(|_| CryptoError::InvalidKey("layer ENC expansion".to_string()))?;
        hk.expand(format!("MAC-L{}", layer_index).as_bytes(), &mut mac)
            .map_err(|_| CryptoError::InvalidKey("layer MAC expansion".to_string()))?;
        Ok(Self { enc, mac })
    }

    /// Seal one layer
    pub fn seal(
        &self,
        layer_index: u8,
        node_id: &str,
        plaintext: &[u8],
        rng: &mut RngHandle,
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new_from_slice(&self.enc)
            .map_err(|_| CryptoError::InvalidKey("layer ENC key".to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);

        let aad = layer_aad(layer_index, node_id);
        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Encoding("layer seal".to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Open one layer; any modification yields `LayerAuthFailure`
    pub fn open(&self, layer_index: u8, node_id: &str, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let failure = CryptoError::LayerAuthFailure { layer: layer_index };
        if blob.len() < NONCE_SIZE + AEAD_TAG_SIZE {
            return Err(failure);
        }

        let cipher = XChaCha20Poly1305::new_from_slice(&self.enc)
            .map_err(|_| CryptoError::InvalidKey("layer ENC key".to_string()))?;
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_SIZE);
        let aad = layer_aad(layer_index, node_id);

        cipher
            .decrypt(
                XNonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| failure)
    }

    /// HMAC-SHA256 over envelope header bytes
    pub fn tag(&self, data: &[u8]) -> Result<[u8; 32], CryptoError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac)
            .map_err(|_| CryptoError::InvalidKey("layer MAC key".to_string()))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().into())
    }

    /// Constant-time tag check
    pub fn verify_tag(&self, layer_index: u8, data: &[u8], tag: &[u8]) -> Result<(), CryptoError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac)
            .map_err(|_| CryptoError::InvalidKey("layer MAC key".to_string()))?;
        mac.update(data);
        mac.verify_slice(tag)
            .map_err(|_| CryptoError::LayerAuthFailure { layer: layer_index })
    }
}

impl std::fmt::Debug for LayerKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LayerKeys(<redacted>)")
    }
}

fn layer_aad(layer_index: u8, node_id: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(8 + node_id.len());
    aad.push(LAYER_VERSION);
    aad.push(layer_index);
    aad.extend_from_slice(&(node_id.len() as u32).to_be_bytes());
    aad.extend_from_slice(node_id.as_bytes());
    aad
}
