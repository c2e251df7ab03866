//! CID construction, version equivalence and hash policy.

use cid::multihash::Multihash;
use cid::{Cid, Version};
use sha2::{Digest, Sha256, Sha512};

use crate::{CraftBlockError, Result};

/// Multicodec content codes used by CraftBlock.
pub mod codec {
    pub const RAW: u64 = 0x55;
    pub const DAG_PB: u64 = 0x70;
    pub const DAG_CBOR: u64 = 0x71;
    pub const DAG_JSON: u64 = 0x0129;
}

/// Multihash algorithm codes.
pub mod hash_code {
    pub const IDENTITY: u64 = 0x00;
    pub const SHA1: u64 = 0x11;
    pub const SHA2_256: u64 = 0x12;
    pub const SHA2_512: u64 = 0x13;
    pub const SHA3_512: u64 = 0x14;
    pub const SHA3_384: u64 = 0x15;
    pub const SHA3_256: u64 = 0x16;
    pub const SHA3_224: u64 = 0x17;
    pub const BLAKE3: u64 = 0x1e;
    pub const MD5: u64 = 0xd5;
    pub const BLAKE2B_256: u64 = 0xb220;
    pub const BLAKE2B_512: u64 = 0xb240;
    pub const BLAKE2S_256: u64 = 0xb260;
}

/// Hash algorithms considered strong enough to address content by.
pub const SECURE_HASHES: &[u64] = &[
    hash_code::IDENTITY,
    hash_code::SHA2_256,
    hash_code::SHA2_512,
    hash_code::SHA3_224,
    hash_code::SHA3_256,
    hash_code::SHA3_384,
    hash_code::SHA3_512,
    hash_code::BLAKE3,
    hash_code::BLAKE2B_256,
    hash_code::BLAKE2B_512,
    hash_code::BLAKE2S_256,
];

/// Digests shorter than this are rejected even for allowlisted algorithms.
pub const MIN_DIGEST_LEN: usize = 20;

/// Payloads at most this long fit in an identity multihash.
pub const MAX_IDENTITY_LEN: usize = 64;

/// SHA2-256 multihash of `data`.
pub fn sha2_256(data: &[u8]) -> Multihash<64> {
    Multihash::wrap(hash_code::SHA2_256, &Sha256::digest(data)).unwrap_or_default()
}

/// Hash `data` with the algorithm `code`.
///
/// Only the algorithms the node can verify are supported; anything else
/// yields [`CraftBlockError::UnsupportedHash`].
pub fn multihash_of(code: u64, data: &[u8]) -> Result<Multihash<64>> {
    let mh = match code {
        hash_code::IDENTITY => {
            if data.len() > MAX_IDENTITY_LEN {
                return Err(CraftBlockError::InvalidCid(format!(
                    "identity payload of {} bytes exceeds {}",
                    data.len(),
                    MAX_IDENTITY_LEN
                )));
            }
            Multihash::wrap(code, data)?
        }
        hash_code::SHA2_256 => Multihash::wrap(code, &Sha256::digest(data))?,
        hash_code::SHA2_512 => Multihash::wrap(code, &Sha512::digest(data))?,
        hash_code::BLAKE3 => Multihash::wrap(code, blake3::hash(data).as_bytes())?,
        other => return Err(CraftBlockError::UnsupportedHash(other)),
    };
    Ok(mh)
}

/// CIDv0 (dag-pb, SHA2-256) for `data`.
pub fn cid_v0(data: &[u8]) -> Cid {
    let mh = sha2_256(data);
    Cid::new_v0(mh).unwrap_or_else(|_| Cid::new_v1(codec::DAG_PB, mh))
}

/// CIDv1 for `data` with the given codec and hash algorithm.
pub fn cid_v1(codec: u64, code: u64, data: &[u8]) -> Result<Cid> {
    Ok(Cid::new_v1(codec, multihash_of(code, data)?))
}

/// Identity CID carrying `data` inline.
pub fn identity_cid(codec: u64, data: &[u8]) -> Result<Cid> {
    cid_v1(codec, hash_code::IDENTITY, data)
}

pub fn is_identity(cid: &Cid) -> bool {
    cid.hash().code() == hash_code::IDENTITY
}

/// Keys under which the same content may be stored with the other CID version.
///
/// A v0 CID maps to v1 dag-pb (its exact upgrade) and v1 raw. A v1 CID whose
/// multihash is a 32-byte SHA2-256 maps back to v0. Anything else has no
/// equivalent.
pub fn other_versions(cid: &Cid) -> Vec<Cid> {
    let mh = *cid.hash();
    match cid.version() {
        Version::V0 => vec![
            Cid::new_v1(codec::DAG_PB, mh),
            Cid::new_v1(codec::RAW, mh),
        ],
        Version::V1 => {
            if mh.code() == hash_code::SHA2_256 && mh.size() == 32 {
                Cid::new_v0(mh).map(|v0| vec![v0]).unwrap_or_default()
            } else {
                Vec::new()
            }
        }
    }
}

pub fn is_secure_hash(code: u64) -> bool {
    SECURE_HASHES.contains(&code)
}

/// Reject CIDs whose multihash is not strong enough to trust.
pub fn validate_cid(cid: &Cid) -> Result<()> {
    let mh = cid.hash();
    if !is_secure_hash(mh.code()) {
        return Err(CraftBlockError::InsecureHash {
            cid: *cid,
            code: mh.code(),
        });
    }
    if mh.code() != hash_code::IDENTITY && (mh.size() as usize) < MIN_DIGEST_LEN {
        return Err(CraftBlockError::InsecureHash {
            cid: *cid,
            code: mh.code(),
        });
    }
    Ok(())
}

/// Parse a CID from its binary form.
pub fn cid_from_bytes(bytes: &[u8]) -> Result<Cid> {
    Ok(Cid::try_from(bytes)?)
}

/// Hex of the CID's binary form, used for store file names and DHT keys.
pub fn to_hex(cid: &Cid) -> String {
    hex::encode(cid.to_bytes())
}

pub fn from_hex(s: &str) -> Result<Cid> {
    let bytes = hex::decode(s).map_err(|e| CraftBlockError::InvalidCid(e.to_string()))?;
    cid_from_bytes(&bytes)
}

/// Abbreviated display for log lines.
pub fn short(cid: &Cid) -> String {
    let s = cid.to_string();
    if s.len() <= 16 {
        s
    } else {
        format!("{}…{}", &s[..8], &s[s.len() - 6..])
    }
}
