//! Immutable content-addressed blocks.

use bytes::Bytes;
use cid::Cid;

use crate::content_id::{self, codec, hash_code};
use crate::{CraftBlockError, Result};

/// A CID together with the bytes it addresses.
///
/// Every constructor except [`Block::new_unchecked`] guarantees that the CID's
/// multihash matches the data.
#[derive(Clone, PartialEq, Eq)]
pub struct Block {
    cid: Cid,
    data: Bytes,
}

impl Block {
    /// CIDv0 block (dag-pb, SHA2-256).
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let cid = content_id::cid_v0(&data);
        Self { cid, data }
    }

    pub fn new_v1(codec: u64, code: u64, data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        let cid = content_id::cid_v1(codec, code, &data)?;
        Ok(Self { cid, data })
    }

    /// Raw-codec CIDv1 block hashed with SHA2-256.
    pub fn raw(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let cid = Cid::new_v1(codec::RAW, content_id::sha2_256(&data));
        Self { cid, data }
    }

    /// Build a block for an externally supplied CID, rejecting data that does
    /// not hash to it.
    pub fn with_cid(cid: Cid, data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        verify_data(&cid, &data)?;
        Ok(Self { cid, data })
    }

    /// Trusted producers only: skips hash verification.
    pub fn new_unchecked(cid: Cid, data: impl Into<Bytes>) -> Self {
        Self {
            cid,
            data: data.into(),
        }
    }

    /// The block an identity CID carries inline, if `cid` is one.
    pub fn from_identity(cid: &Cid) -> Option<Self> {
        if !content_id::is_identity(cid) {
            return None;
        }
        Some(Self {
            cid: *cid,
            data: Bytes::copy_from_slice(cid.hash().digest()),
        })
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_parts(self) -> (Cid, Bytes) {
        (self.cid, self.data)
    }

    /// Same bytes addressed by a different (equivalent) CID.
    pub fn with_alias(&self, cid: Cid) -> Self {
        Self {
            cid,
            data: self.data.clone(),
        }
    }

    pub fn verify(&self) -> Result<()> {
        verify_data(&self.cid, &self.data)
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("cid", &self.cid.to_string())
            .field("len", &self.data.len())
            .finish()
    }
}

/// Check that `data` hashes to the multihash in `cid`.
pub fn verify_data(cid: &Cid, data: &[u8]) -> Result<()> {
    let expected = cid.hash();
    if expected.code() == hash_code::IDENTITY {
        if expected.digest() == data {
            return Ok(());
        }
        return Err(CraftBlockError::HashMismatch {
            cid: *cid,
            actual: format!("identity payload of {} bytes", data.len()),
        });
    }
    let actual = content_id::multihash_of(expected.code(), data)?;
    if actual.digest() != expected.digest() {
        return Err(CraftBlockError::HashMismatch {
            cid: *cid,
            actual: hex::encode(actual.digest()),
        });
    }
    Ok(())
}
