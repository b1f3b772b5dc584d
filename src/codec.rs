//! Reputation key/value encoding and the ledger hash function
//!
//! Every byte produced here feeds a root hash the ledger verifies, so the
//! layouts must match the ledger contract exactly:
//!
//! ```text
//! key   = domain (20) | skill_id as uint256 (32) | user (20)      = 72 bytes
//! value = amount as uint256 (32)      | uid as uint256 (32)      = 64 bytes
//! hash  = keccak256
//! ```
//!
//! Integers are big-endian 256-bit words.

use crate::error::{MinerError, Result};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;

/// 32-byte digest
pub type Hash = [u8; 32];

/// 20-byte account / domain identifier
pub type Address = [u8; 20];

/// Root hash of an empty trie
pub const EMPTY_ROOT: Hash = [0u8; 32];

/// Sentinel user for a skill's colony-wide aggregate
pub const ZERO_ADDRESS: Address = [0u8; 20];

/// Encoded key length
pub const KEY_LEN: usize = 72;

/// Encoded value length
pub const VALUE_LEN: usize = 64;

/// Largest representable reputation amount (2^127 - 1)
pub const MAX_REPUTATION: u128 = i128::MAX as u128;

/// keccak256 over a byte string
pub fn keccak256(bytes: &[u8]) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// keccak256 over the concatenation of several byte strings
pub fn keccak256_concat(parts: &[&[u8]]) -> Hash {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Encode an unsigned integer as a big-endian uint256 word
pub fn u256_word(value: u128) -> Hash {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

/// Decode a uint256 word that must fit in a u128
pub fn word_to_u128(word: &[u8]) -> Result<u128> {
    if word.len() != 32 {
        return Err(MinerError::InvalidValue(format!(
            "expected 32-byte word, got {} bytes",
            word.len()
        )));
    }
    if word[..16].iter().any(|b| *b != 0) {
        return Err(MinerError::InvalidValue(
            "word exceeds 128-bit range".to_string(),
        ));
    }
    let mut low = [0u8; 16];
    low.copy_from_slice(&word[16..]);
    Ok(u128::from_be_bytes(low))
}

fn word_to_u64(word: &[u8]) -> Result<u64> {
    let value = word_to_u128(word)?;
    u64::try_from(value)
        .map_err(|_| MinerError::InvalidValue(format!("word {} exceeds 64-bit range", value)))
}

/// Format bytes as 0x-prefixed hex
pub fn to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Parse 0x-prefixed (or bare) hex into a fixed-size array
pub fn from_hex_fixed<const N: usize>(s: &str) -> Result<[u8; N]> {
    let bytes = from_hex(s)?;
    bytes.as_slice().try_into().map_err(|_| {
        MinerError::Serialization(format!("expected {} bytes, got {}", N, bytes.len()))
    })
}

/// Parse 0x-prefixed (or bare) hex into bytes
pub fn from_hex(s: &str) -> Result<Vec<u8>> {
    let trimmed = s.strip_prefix("0x").unwrap_or(s);
    Ok(hex::decode(trimmed)?)
}

/// Parse an address from hex
pub fn parse_address(s: &str) -> Result<Address> {
    from_hex_fixed::<20>(s).map_err(|e| MinerError::InvalidKey(format!("address {}: {}", s, e)))
}

/// Identifies one reputation entry: (domain, skill, user).
///
/// The derived ordering matches the ordering of the encoded bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReputationKey {
    #[serde(with = "hex_serde")]
    pub domain: Address,
    pub skill_id: u64,
    #[serde(with = "hex_serde")]
    pub user: Address,
}

impl ReputationKey {
    pub fn new(domain: Address, skill_id: u64, user: Address) -> Self {
        Self {
            domain,
            skill_id,
            user,
        }
    }

    /// Colony-wide aggregate key for a skill
    pub fn aggregate(domain: Address, skill_id: u64) -> Self {
        Self::new(domain, skill_id, ZERO_ADDRESS)
    }

    pub fn is_aggregate(&self) -> bool {
        self.user == ZERO_ADDRESS
    }

    /// Same domain and user, different skill
    pub fn with_skill(&self, skill_id: u64) -> Self {
        Self::new(self.domain, skill_id, self.user)
    }

    /// The aggregate key for this key's skill
    pub fn to_aggregate(&self) -> Self {
        Self::aggregate(self.domain, self.skill_id)
    }
}

impl fmt::Debug for ReputationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for ReputationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            to_hex(&self.domain),
            self.skill_id,
            to_hex(&self.user)
        )
    }
}

/// Reputation held under one key
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationEntry {
    pub amount: u128,
    pub uid: u64,
}

impl ReputationEntry {
    pub fn new(amount: u128, uid: u64) -> Self {
        Self { amount, uid }
    }
}

/// Encode a key in the ledger's 72-byte layout
pub fn encode_key(key: &ReputationKey) -> [u8; KEY_LEN] {
    let mut out = [0u8; KEY_LEN];
    out[..20].copy_from_slice(&key.domain);
    out[20..52].copy_from_slice(&u256_word(key.skill_id as u128));
    out[52..].copy_from_slice(&key.user);
    out
}

/// Decode a 72-byte key
pub fn decode_key(bytes: &[u8]) -> Result<ReputationKey> {
    if bytes.len() != KEY_LEN {
        return Err(MinerError::InvalidKey(format!(
            "expected {} bytes, got {}",
            KEY_LEN,
            bytes.len()
        )));
    }
    let mut domain = [0u8; 20];
    domain.copy_from_slice(&bytes[..20]);
    let skill_id =
        word_to_u64(&bytes[20..52]).map_err(|e| MinerError::InvalidKey(e.to_string()))?;
    let mut user = [0u8; 20];
    user.copy_from_slice(&bytes[52..]);
    Ok(ReputationKey::new(domain, skill_id, user))
}

/// Encode a value in the ledger's 64-byte layout
pub fn encode_value(entry: &ReputationEntry) -> [u8; VALUE_LEN] {
    let mut out = [0u8; VALUE_LEN];
    out[..32].copy_from_slice(&u256_word(entry.amount));
    out[32..].copy_from_slice(&u256_word(entry.uid as u128));
    out
}

/// Decode a 64-byte value
pub fn decode_value(bytes: &[u8]) -> Result<ReputationEntry> {
    if bytes.len() != VALUE_LEN {
        return Err(MinerError::InvalidValue(format!(
            "expected {} bytes, got {}",
            VALUE_LEN,
            bytes.len()
        )));
    }
    let amount = word_to_u128(&bytes[..32])?;
    if amount > MAX_REPUTATION {
        return Err(MinerError::InvalidValue(format!(
            "amount {} exceeds maximum reputation",
            amount
        )));
    }
    let uid = word_to_u64(&bytes[32..])?;
    Ok(ReputationEntry::new(amount, uid))
}

/// Produces the value bytes stored in the reputation trie.
///
/// The ledger only accepts [`LedgerEncoding`]; alternate encoders exist so
/// simulated adversaries can be built without forking the client.
pub trait ValueEncoder: Send + Sync {
    fn encode(&self, entry: &ReputationEntry) -> Vec<u8>;
}

/// The ledger's value layout
#[derive(Clone, Copy, Debug, Default)]
pub struct LedgerEncoding;

impl ValueEncoder for LedgerEncoding {
    fn encode(&self, entry: &ReputationEntry) -> Vec<u8> {
        encode_value(entry).to_vec()
    }
}

/// Serde adapters that write byte arrays as 0x-prefixed hex strings.
pub mod hex_serde {
    use super::{from_hex, from_hex_fixed, to_hex};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&to_hex(bytes))
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        from_hex_fixed::<N>(&s).map_err(D::Error::custom)
    }

    /// `Vec<u8>` as a single hex string
    pub mod bytes {
        use super::*;

        pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_str(&to_hex(bytes))
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s = String::deserialize(deserializer)?;
            from_hex(&s).map_err(D::Error::custom)
        }
    }

    /// `Vec<[u8; 32]>` as a list of hex strings
    pub mod hashes {
        use super::*;
        use crate::codec::Hash;
        use serde::ser::SerializeSeq;

        pub fn serialize<S>(hashes: &[Hash], serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            let mut seq = serializer.serialize_seq(Some(hashes.len()))?;
            for hash in hashes {
                seq.serialize_element(&to_hex(hash))?;
            }
            seq.end()
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Hash>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let items = Vec::<String>::deserialize(deserializer)?;
            items
                .iter()
                .map(|s| from_hex_fixed::<32>(s).map_err(D::Error::custom))
                .collect()
        }
    }

    /// `Vec<[u8; 20]>` as a list of hex strings
    pub mod addresses {
        use super::*;
        use crate::codec::Address;
        use serde::ser::SerializeSeq;

        pub fn serialize<S>(addresses: &[Address], serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            let mut seq = serializer.serialize_seq(Some(addresses.len()))?;
            for address in addresses {
                seq.serialize_element(&to_hex(address))?;
            }
            seq.end()
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Address>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let items = Vec::<String>::deserialize(deserializer)?;
            items
                .iter()
                .map(|s| from_hex_fixed::<20>(s).map_err(D::Error::custom))
                .collect()
        }
    }

    /// `Option<[u8; 32]>` as a hex string or null
    pub mod option {
        use super::*;
        use crate::codec::Hash;

        pub fn serialize<S>(hash: &Option<Hash>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match hash {
                Some(h) => serializer.serialize_some(&to_hex(h)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Hash>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s = Option::<String>::deserialize(deserializer)?;
            s.map(|s| from_hex_fixed::<32>(&s).map_err(D::Error::custom))
                .transpose()
        }
    }
}

/// 128-bit integers as decimal strings; JSON numbers cannot carry them.
pub mod decimal {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::fmt::Display;
    use std::str::FromStr;

    pub fn serialize<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Display,
    {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: FromStr,
        T::Err: Display,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
