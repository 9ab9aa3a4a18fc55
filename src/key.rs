use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit};
use rand::{rngs::OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// length of the symmetric pack secret
pub const SECRET_LEN: usize = 32;

/// store identity: a public id plus the pack secret
///
/// only the public id ever leaves the store in plaintext. peers that sync
/// with each other share the same key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Key {
    #[zeroize(skip)]
    public_id: String,
    secret: [u8; SECRET_LEN],
}

impl Key {
    /// generate a fresh identity
    pub fn generate() -> Self {
        let mut secret = [0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut secret);
        Self {
            public_id: uuid::Uuid::new_v4().to_string(),
            secret,
        }
    }

    /// create from raw parts
    pub fn from_bytes(public_id: impl Into<String>, secret: [u8; SECRET_LEN]) -> Self {
        Self {
            public_id: public_id.into(),
            secret,
        }
    }

    /// restore a persisted identity
    pub fn from_base64(public_id: impl Into<String>, secret: &str) -> Result<Self> {
        let mut bytes = STANDARD.decode(secret)?;
        if bytes.len() != SECRET_LEN {
            let len = bytes.len();
            bytes.zeroize();
            return Err(Error::InvalidKey(format!(
                "expected {} secret bytes, got {}",
                SECRET_LEN, len
            )));
        }
        let mut arr = [0u8; SECRET_LEN];
        arr.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(Self::from_bytes(public_id, arr))
    }

    pub fn public_id(&self) -> &str {
        &self.public_id
    }

    /// secret encoded for persistence
    pub fn secret_base64(&self) -> String {
        STANDARD.encode(self.secret)
    }

    pub(crate) fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(self.secret.as_ref().into())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("public_id", &self.public_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}
