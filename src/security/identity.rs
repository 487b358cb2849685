//! Ed25519 device keys
//!
//! The server only ever holds public keys. [`DeviceKeypair`] is the device-side
//! half, used by the CLI `keygen`/`sign` commands and by tests.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::{Error, Result};

/// Device-side Ed25519 keypair
#[derive(Clone)]
pub struct DeviceKeypair {
    signing_key: SigningKey,
}

impl std::fmt::Debug for DeviceKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceKeypair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

impl DeviceKeypair {
    /// Generate a new random keypair
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore a keypair from its base64 encoded secret key
    ///
    /// # Errors
    ///
    /// Returns error if the secret key is not valid base64 or has the wrong length
    pub fn from_secret(secret_key: &str) -> Result<Self> {
        let key_bytes = base64_decode(secret_key)?;
        let signing_key = SigningKey::try_from(key_bytes.as_slice())
            .map_err(|e| Error::Auth(format!("invalid secret key: {e}")))?;
        Ok(Self { signing_key })
    }

    /// Public key (base64 encoded), as submitted at registration
    #[must_use]
    pub fn public_key(&self) -> String {
        base64_encode(self.signing_key.verifying_key().as_bytes())
    }

    /// Secret key (base64 encoded)
    #[must_use]
    pub fn secret_key(&self) -> String {
        base64_encode(self.signing_key.as_bytes())
    }

    /// Sign a payload, returning a base64 encoded signature
    #[must_use]
    pub fn sign(&self, payload: &[u8]) -> String {
        let signature = self.signing_key.sign(payload);
        base64_encode(&signature.to_bytes())
    }
}

/// Check that a string is a well-formed Ed25519 public key
///
/// # Errors
///
/// Returns a validation error describing what is wrong with the key
pub fn validate_public_key(public_key: &str) -> Result<()> {
    decode_public_key(public_key)
        .map(|_| ())
        .map_err(|e| Error::Validation(e.to_string()))
}

/// Verify a signature from a public key
///
/// # Errors
///
/// Returns error if public key or signature format is invalid
pub fn verify_signature(public_key: &str, payload: &[u8], signature: &str) -> Result<bool> {
    let verifying_key = decode_public_key(public_key)?;

    let sig_bytes = base64_decode(signature)?;
    let signature = Signature::try_from(sig_bytes.as_slice())
        .map_err(|e| Error::Auth(format!("invalid signature format: {e}")))?;

    Ok(verifying_key.verify(payload, &signature).is_ok())
}

fn decode_public_key(public_key: &str) -> Result<VerifyingKey> {
    let public_key_bytes = base64_decode(public_key)?;
    VerifyingKey::try_from(public_key_bytes.as_slice())
        .map_err(|e| Error::Auth(format!("invalid public key: {e}")))
}

fn base64_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn base64_decode(data: &str) -> Result<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| Error::Auth(format!("invalid base64: {e}")))
}
