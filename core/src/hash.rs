/// Hash collaborator for the pool front end.
///
/// All hashing the Stratum engine needs lives behind this module; the engine
/// itself only compares digests against targets.

pub type Hash = [u8; 32];

/// Domain separator for merkle leaves, so a leaf digest can never collide
/// with an interior-node digest of the same bytes.
const LEAF_PREFIX: [u8; 1] = [0x00];

/// Leaf hash of one transaction id, as carried in `mining.notify` so miners
/// can rebuild the merkle root client-side.
pub fn leaf_hash(txid: &Hash) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&LEAF_PREFIX);
    hasher.update(txid);
    *hasher.finalize().as_bytes()
}

/// Digest of an assembled header preimage.
pub fn header_hash(blob: &[u8]) -> Hash {
    *blake3::hash(blob).as_bytes()
}

pub fn to_hex(hash: &Hash) -> String {
    hex::encode(hash)
}

/// Parse a 64-digit hex string. Returns None for any other width or content.
pub fn from_hex(s: &str) -> Option<Hash> {
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}
