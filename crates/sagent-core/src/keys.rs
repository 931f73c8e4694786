//! Per-instance signing keypair generation.
//!
//! Every instance gets a freshly generated ed25519 keypair at contract
//! materialization. Keys are serialized with a leading `ed` type octet, so
//! the public key hex is 66 characters and the expanded secret key hex is
//! 130. The secret never leaves the contract directory's config file.

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

/// Key-type octet prefixed to serialized ed25519 keys.
const KEY_TYPE_ED25519: u8 = 0xed;

/// A freshly generated instance keypair, hex-encoded for the config file.
pub struct SigningKeypair {
    /// `ed`-prefixed public key hex (66 characters).
    pub public_key_hex: String,
    /// `ed`-prefixed expanded secret key hex (130 characters). Zeroized on
    /// drop.
    pub secret_key_hex: Zeroizing<String>,
}

impl SigningKeypair {
    /// Generates a new keypair from the OS entropy source.
    #[must_use]
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(&signing_key)
    }

    fn from_signing_key(signing_key: &SigningKey) -> Self {
        let mut public = Vec::with_capacity(33);
        public.push(KEY_TYPE_ED25519);
        public.extend_from_slice(signing_key.verifying_key().as_bytes());

        // Expanded form: 32-byte seed followed by the 32-byte public key.
        let keypair_bytes = Zeroizing::new(signing_key.to_keypair_bytes());
        let mut secret = Zeroizing::new(Vec::with_capacity(65));
        secret.push(KEY_TYPE_ED25519);
        secret.extend_from_slice(&*keypair_bytes);

        Self {
            public_key_hex: hex::encode(public),
            secret_key_hex: Zeroizing::new(hex::encode(secret.as_slice())),
        }
    }
}

impl std::fmt::Debug for SigningKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The secret is intentionally absent.
        f.debug_struct("SigningKeypair")
            .field("public_key_hex", &self.public_key_hex)
            .finish_non_exhaustive()
    }
}
