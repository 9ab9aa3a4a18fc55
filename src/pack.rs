//! encrypted revision bundles exchanged between peers
//!
//! wire format:
//!   magic: 4 bytes "RTPK"
//!   format version: 1 byte
//!   header_len: 4 bytes LE
//!   header: CBOR { origin, recipient }
//!   nonce: 12 bytes
//!   ciphertext: ChaCha20-Poly1305 over zstd(CBOR(body)), tag appended
//!
//! everything before the nonce is authenticated as associated data, so the
//! plaintext origin and recipient ids cannot be swapped without failing
//! decryption.

use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::Nonce;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::RevisionGraph;
use crate::key::Key;
use crate::types::Revision;

const MAGIC: &[u8; 4] = b"RTPK";
const FORMAT_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const ZSTD_LEVEL: i32 = 3;

/// a bundle of revisions plus sender metadata
#[derive(Clone, Debug, PartialEq)]
pub struct Pack {
    /// public id of the sending store
    pub origin: String,
    /// public id the pack is addressed to
    pub recipient: String,
    /// sender's merge counter at encode time
    pub history_merge_version: u64,
    /// revisions, parents before children
    pub revisions: Vec<Revision>,
}

#[derive(Serialize, Deserialize)]
struct Header {
    origin: String,
    recipient: String,
}

#[derive(Serialize, Deserialize)]
struct Body {
    history_merge_version: u64,
    revisions: Vec<Revision>,
}

impl Pack {
    /// bundle a whole graph
    pub fn from_graph(graph: &RevisionGraph, origin: impl Into<String>, version: u64) -> Self {
        Self {
            origin: origin.into(),
            recipient: String::new(),
            history_merge_version: version,
            revisions: graph.revisions().into_iter().cloned().collect(),
        }
    }

    /// serialize, compress and encrypt for `recipient`
    pub fn encode(&self, key: &Key, recipient: &str) -> Result<Vec<u8>> {
        let body = Body {
            history_merge_version: self.history_merge_version,
            revisions: self.revisions.clone(),
        };
        let mut cbor_bytes = Vec::new();
        ciborium::into_writer(&body, &mut cbor_bytes)?;

        let compressed = zstd::encode_all(&cbor_bytes[..], ZSTD_LEVEL)
            .map_err(|e| Error::CorruptPack(format!("compression failed: {}", e)))?;

        let header = Header {
            origin: self.origin.clone(),
            recipient: recipient.to_string(),
        };
        let mut header_bytes = Vec::new();
        ciborium::into_writer(&header, &mut header_bytes)?;

        let mut out = Vec::with_capacity(9 + header_bytes.len() + NONCE_LEN + compressed.len() + TAG_LEN);
        out.extend_from_slice(MAGIC);
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&header_bytes);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = key
            .cipher()
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &compressed,
                    aad: &out,
                },
            )
            .map_err(|e| Error::Encryption(e.to_string()))?;

        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);

        tracing::debug!(
            origin = %self.origin,
            recipient,
            revisions = self.revisions.len(),
            bytes = out.len(),
            "encoded pack"
        );
        Ok(out)
    }

    /// decrypt and parse, verifying every revision id
    pub fn decode(bytes: &[u8], key: &Key) -> Result<Self> {
        if bytes.len() < 9 || &bytes[..4] != MAGIC {
            return Err(Error::CorruptPack("bad magic".to_string()));
        }
        if bytes[4] != FORMAT_VERSION {
            return Err(Error::CorruptPack(format!(
                "unsupported format version {}",
                bytes[4]
            )));
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[5..9]);
        let header_len = u32::from_le_bytes(len_bytes) as usize;
        let header_end = 9usize
            .checked_add(header_len)
            .filter(|end| *end + NONCE_LEN + TAG_LEN <= bytes.len())
            .ok_or_else(|| Error::CorruptPack("truncated pack".to_string()))?;

        let header: Header = ciborium::from_reader(&bytes[9..header_end])
            .map_err(|e| Error::CorruptPack(format!("bad header: {}", e)))?;

        let aad = &bytes[..header_end];
        let nonce = Nonce::from_slice(&bytes[header_end..header_end + NONCE_LEN]);
        let ciphertext = &bytes[header_end + NONCE_LEN..];

        let compressed = key
            .cipher()
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| Error::Decryption(format!("cannot open pack from {}", header.origin)))?;

        let cbor_bytes = zstd::decode_all(&compressed[..])
            .map_err(|e| Error::CorruptPack(format!("decompression failed: {}", e)))?;
        let body: Body = ciborium::from_reader(&cbor_bytes[..])
            .map_err(|e| Error::CorruptPack(format!("bad body: {}", e)))?;

        if let Some(bad) = body.revisions.iter().find(|r| !r.verify()) {
            return Err(Error::CorruptPack(format!("revision id mismatch for {}", bad.id)));
        }

        tracing::debug!(
            origin = %header.origin,
            revisions = body.revisions.len(),
            "decoded pack"
        );

        Ok(Self {
            origin: header.origin,
            recipient: header.recipient,
            history_merge_version: body.history_merge_version,
            revisions: body.revisions,
        })
    }

    /// rebuild the graph carried by this pack
    pub fn to_graph(&self) -> Result<RevisionGraph> {
        RevisionGraph::from_revisions(self.revisions.iter().cloned()).map_err(|e| match e {
            Error::RevisionNotFound(parent) => {
                Error::CorruptPack(format!("parent {} missing from pack", parent))
            }
            Error::CorruptRevision(id) => Error::CorruptPack(format!("revision id mismatch for {}", id)),
            other => other,
        })
    }
}
