//! Device identity for Envoy peers.
//!
//! Every daemon owns an Ed25519 keypair. Its [`DeviceId`] is derived from the
//! public key, so the id of a device is stable for as long as the key file is
//! kept, and a peer can prove it owns an id by signing a challenge.

use ed25519_dalek::{
    Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH,
    SECRET_KEY_LENGTH, SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Length of a device ID in bytes (SHA-256 of the public key, truncated).
pub const DEVICE_ID_LENGTH: usize = 16;

/// Length of the random challenge sent in a `Hello`.
pub const NONCE_LENGTH: usize = 32;

/// A device identifier derived from the public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(#[serde(with = "serde_bytes")] pub [u8; DEVICE_ID_LENGTH]);

impl DeviceId {
    pub fn from_bytes(bytes: [u8; DEVICE_ID_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DEVICE_ID_LENGTH] {
        &self.0
    }

    /// Colon-separated groups of four hex digits, e.g.
    /// `a1b2:c3d4:e5f6:7890:1234:5678:9abc:def0`.
    pub fn fingerprint(&self) -> String {
        self.0
            .chunks(2)
            .map(|pair| format!("{:02x}{:02x}", pair[0], pair[1]))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Parse a fingerprint produced by [`DeviceId::fingerprint`].
    ///
    /// Colons are optional; case is ignored.
    pub fn from_fingerprint(fingerprint: &str) -> Option<Self> {
        let hex: Vec<u8> = fingerprint.bytes().filter(|b| *b != b':').collect();
        if hex.len() != DEVICE_ID_LENGTH * 2 {
            return None;
        }

        let mut id = [0u8; DEVICE_ID_LENGTH];
        for (slot, pair) in id.iter_mut().zip(hex.chunks(2)) {
            let text = std::str::from_utf8(pair).ok()?;
            *slot = u8::from_str_radix(text, 16).ok()?;
        }
        Some(Self(id))
    }

    fn from_public_key(public_key: &VerifyingKey) -> Self {
        use sha2::{Digest, Sha256};
        let hash = Sha256::digest(public_key.as_bytes());
        let mut id = [0u8; DEVICE_ID_LENGTH];
        id.copy_from_slice(&hash[..DEVICE_ID_LENGTH]);
        Self(id)
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.fingerprint())
    }
}

/// A 64-byte Ed25519 signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_bytes")] pub [u8; SIGNATURE_LENGTH]);

impl Signature {
    pub fn from_bytes(bytes: [u8; SIGNATURE_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }
}

/// The local device's keypair.
#[derive(Clone)]
pub struct DeviceIdentity {
    signing_key: SigningKey,
    device_id: DeviceId,
}

impl DeviceIdentity {
    /// Generate a fresh identity from the OS random source.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Restore an identity from its 32 secret key bytes.
    pub fn from_secret_key_bytes(bytes: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(bytes))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let device_id = DeviceId::from_public_key(&signing_key.verifying_key());
        Self {
            signing_key,
            device_id,
        }
    }

    /// Secret key bytes, for persisting the identity. Keep them private.
    pub fn secret_key_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn fingerprint(&self) -> String {
        self.device_id.fingerprint()
    }

    /// The public half of this identity.
    pub fn to_peer_identity(&self) -> PeerIdentity {
        PeerIdentity {
            verifying_key: self.signing_key.verifying_key(),
            device_id: self.device_id,
        }
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature::from_bytes(self.signing_key.sign(message).to_bytes())
    }
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// The public identity of a remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerIdentity {
    verifying_key: VerifyingKey,
    device_id: DeviceId,
}

impl PeerIdentity {
    /// Build a peer identity from raw public key bytes of any length.
    ///
    /// Fails with [`ProtocolError::InvalidPublicKey`] unless the slice is a
    /// valid 32-byte Ed25519 point.
    pub fn from_public_key_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; PUBLIC_KEY_LENGTH] = bytes.try_into().map_err(|_| {
            ProtocolError::InvalidPublicKey(format!(
                "expected {} bytes, got {}",
                PUBLIC_KEY_LENGTH,
                bytes.len()
            ))
        })?;
        let verifying_key = VerifyingKey::from_bytes(&array)
            .map_err(|e| ProtocolError::InvalidPublicKey(e.to_string()))?;

        Ok(Self {
            device_id: DeviceId::from_public_key(&verifying_key),
            verifying_key,
        })
    }

    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.to_bytes()
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Verify a signature made by this peer.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let sig = Ed25519Signature::from_bytes(signature.as_bytes());
        self.verifying_key
            .verify(message, &sig)
            .map_err(ProtocolError::from)
    }
}

/// A random challenge for the connection handshake.
pub fn generate_nonce() -> [u8; NONCE_LENGTH] {
    let mut nonce = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_identities_differ() {
        let a = DeviceIdentity::generate();
        let b = DeviceIdentity::generate();
        assert_ne!(a.public_key_bytes(), b.public_key_bytes());
        assert_ne!(a.device_id(), b.device_id());
    }

    #[test]
    fn test_device_id_stable_across_restore() {
        let identity = DeviceIdentity::generate();
        let restored = DeviceIdentity::from_secret_key_bytes(&identity.secret_key_bytes());

        assert_eq!(identity.device_id(), restored.device_id());
        assert_eq!(identity.public_key_bytes(), restored.public_key_bytes());
    }

    #[test]
    fn test_fingerprint_format() {
        let fingerprint = DeviceIdentity::generate().fingerprint();

        assert_eq!(fingerprint.len(), 39);
        for group in fingerprint.split(':') {
            assert_eq!(group.len(), 4);
            assert!(group
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        }
    }

    #[test]
    fn test_fingerprint_parse_roundtrip() {
        let id = *DeviceIdentity::generate().device_id();

        assert_eq!(DeviceId::from_fingerprint(&id.fingerprint()), Some(id));
        let compact: String = id.fingerprint().replace(':', "").to_uppercase();
        assert_eq!(DeviceId::from_fingerprint(&compact), Some(id));
    }

    #[test]
    fn test_fingerprint_parse_rejects_garbage() {
        assert!(DeviceId::from_fingerprint("").is_none());
        assert!(DeviceId::from_fingerprint("abcd").is_none());
        assert!(DeviceId::from_fingerprint(&"zz".repeat(16)).is_none());
    }

    #[test]
    fn test_peer_verifies_signature() {
        let identity = DeviceIdentity::generate();
        let peer = PeerIdentity::from_public_key_slice(&identity.public_key_bytes()).unwrap();

        let signature = identity.sign(b"challenge");
        assert!(peer.verify(b"challenge", &signature).is_ok());
        assert!(peer.verify(b"other", &signature).is_err());
        assert_eq!(peer.device_id(), identity.device_id());
    }

    #[test]
    fn test_signature_from_other_key_rejected() {
        let signer = DeviceIdentity::generate();
        let other = DeviceIdentity::generate().to_peer_identity();

        let signature = signer.sign(b"challenge");
        assert!(matches!(
            other.verify(b"challenge", &signature),
            Err(ProtocolError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_public_key_slice_wrong_length() {
        let result = PeerIdentity::from_public_key_slice(&[0u8; 12]);
        assert!(matches!(result, Err(ProtocolError::InvalidPublicKey(_))));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let debug = format!("{:?}", DeviceIdentity::generate());
        assert!(debug.contains("REDACTED"));
        assert!(debug.contains("device_id"));
    }

    #[test]
    fn test_nonces_are_random() {
        assert_ne!(generate_nonce(), generate_nonce());
    }
}
