use anyhow::Result;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Signing engine for reserve attestations.
/// Holds the one Ed25519 reserve-signer key in process; a stricter
/// deployment would back it with an HSM/KMS behind the same interface.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoSignature {
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
    pub algorithm: String,
}

pub struct CryptoEngine {
    signing_key: SigningKey,
}

impl CryptoEngine {
    /// Engine with a freshly generated signing key.
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        let mut secret_bytes: [u8; 32] = [0u8; 32];
        csprng.fill_bytes(&mut secret_bytes);

        Self {
            signing_key: SigningKey::from_bytes(&secret_bytes),
        }
    }

    /// Engine from key material held elsewhere (secret store, env).
    pub fn from_secret_bytes(secret_bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret_bytes),
        }
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign data with the reserve-signer key.
    pub fn sign(&self, data: &[u8]) -> CryptoSignature {
        let signature = self.signing_key.sign(data);

        CryptoSignature {
            signature: signature.to_bytes().to_vec(),
            public_key: self.signing_key.verifying_key().to_bytes().to_vec(),
            algorithm: "Ed25519".to_string(),
        }
    }

    /// Verify a signature against the public key it carries.
    pub fn verify(signature: &CryptoSignature, data: &[u8]) -> Result<bool> {
        let public_key_bytes: [u8; 32] = signature
            .public_key
            .clone()
            .try_into()
            .map_err(|_| anyhow::anyhow!("Invalid public key length"))?;
        let public_key = VerifyingKey::from_bytes(&public_key_bytes)
            .map_err(|e| anyhow::anyhow!("Invalid public key: {}", e))?;

        let signature_bytes: [u8; 64] = signature
            .signature
            .clone()
            .try_into()
            .map_err(|_| anyhow::anyhow!("Invalid signature length"))?;
        let sig = Signature::from_bytes(&signature_bytes);

        Ok(public_key.verify(data, &sig).is_ok())
    }

    /// Hash data using SHA-256
    pub fn hash(data: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hasher.finalize().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let crypto = CryptoEngine::generate();

        let sig = crypto.sign(b"attestation payload");

        assert_eq!(sig.algorithm, "Ed25519");
        assert!(CryptoEngine::verify(&sig, b"attestation payload").unwrap());
        assert!(!CryptoEngine::verify(&sig, b"tampered payload").unwrap());
    }

    #[test]
    fn fixed_key_material_yields_stable_identity() {
        let secret = [7u8; 32];
        let a = CryptoEngine::from_secret_bytes(&secret);
        let b = CryptoEngine::from_secret_bytes(&secret);

        assert_eq!(a.public_key(), b.public_key());

        let sig = a.sign(b"payload");
        assert!(CryptoEngine::verify(&sig, b"payload").unwrap());
        assert_eq!(sig.public_key, b.public_key().to_bytes().to_vec());
    }

    #[test]
    fn mangled_signature_is_rejected() {
        let crypto = CryptoEngine::generate();
        let mut sig = crypto.sign(b"payload");
        sig.signature.truncate(10);
        assert!(CryptoEngine::verify(&sig, b"payload").is_err());
    }
}
