// Quantum Ratchet — HMAC-SHA256 KDF chain for per-message keys
//
// message_key[n] = HMAC(chain_key[n], "MESSAGE-" || n)
// chain_key[n+1] = HMAC(chain_key[n], "RATCHET")
//
// Circuit key rotation seeds a ratchet with each layer secret and takes its
// first message key as the next epoch's secret, so a relay holding epoch n
// derives epoch n+1 without another handshake and cannot go back.

use super::kem::SharedSecret;
use super::CryptoError;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Forward-secret symmetric ratchet seeded from a hop secret
pub struct QuantumRatchet {
    chain_key: Zeroizing<[u8; 32]>,
    message_counter: u64,
}

impl QuantumRatchet {
    pub fn new(initial_key: &SharedSecret) -> Self {
        Self {
            chain_key: Zeroizing::new(*initial_key.as_bytes()),
            message_counter: 0,
        }
    }

    pub fn message_counter(&self) -> u64 {
        self.message_counter
    }

    /// Derive the key for the current message and advance the chain
    pub fn ratchet_forward(&mut self) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let message_key = self.current_message_key()?;
        let next = hmac(&self.chain_key[..], b"RATCHET")?;
        *self.chain_key = *next;
        self.message_counter += 1;
        Ok(message_key)
    }

    /// Key for the current message without advancing
    pub fn current_message_key(&self) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        hmac(
            &self.chain_key[..],
            format!("MESSAGE-{}", self.message_counter).as_bytes(),
        )
    }
}

/// Layer secret for the next key epoch
pub fn ratchet_secret(secret: &SharedSecret) -> Result<SharedSecret, CryptoError> {
    let mut ratchet = QuantumRatchet::new(secret);
    let next = ratchet.ratchet_forward()?;
    Ok(SharedSecret::from_bytes(*next))
}

impl std::fmt::Debug for QuantumRatchet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuantumRatchet")
            .field("message_counter", &self.message_counter)
            .finish()
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidKey("ratchet chain key".to_string()))?;
    mac.update(data);
    Ok(Zeroizing::new(mac.finalize().into_bytes().into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_key_matches_next_forward() {
        let mut ratchet = QuantumRatchet::new(&SharedSecret::from_bytes([1u8; 32]));
        let peeked = ratchet.current_message_key().unwrap();
        let used = ratchet.ratchet_forward().unwrap();
        assert_eq!(*peeked, *used);
        assert_eq!(ratchet.message_counter(), 1);
    }

    #[test]
    fn test_keys_never_repeat() {
        let mut ratchet = QuantumRatchet::new(&SharedSecret::from_bytes([2u8; 32]));
        let keys: Vec<[u8; 32]> = (0..16).map(|_| *ratchet.ratchet_forward().unwrap()).collect();
        for i in 0..keys.len() {
            for j in i + 1..keys.len() {
                assert_ne!(keys[i], keys[j]);
            }
        }
    }

    #[test]
    fn test_epoch_secret_is_first_message_key() {
        let seed = SharedSecret::from_bytes([4u8; 32]);
        let next = ratchet_secret(&seed).unwrap();
        assert_ne!(next, seed);
        let expected = QuantumRatchet::new(&seed).current_message_key().unwrap();
        assert_eq!(next.as_bytes(), &*expected);
        // Deterministic on both ends of a hop
        assert_eq!(ratchet_secret(&seed).unwrap(), next);
    }

    #[test]
    fn test_peers_stay_in_step() {
        let seed = SharedSecret::from_bytes([3u8; 32]);
        let mut a = QuantumRatchet::new(&seed);
        let mut b = QuantumRatchet::new(&seed);
        for _ in 0..5 {
            assert_eq!(*a.ratchet_forward().unwrap(), *b.ratchet_forward().unwrap());
        }
    }
}
