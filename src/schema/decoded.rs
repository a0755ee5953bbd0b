// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides the `Decoded<T>` type, a byte vector that remembers the string
//! encoding it was parsed from so that metadata round-trips byte-identically.

use crate::schema::error::{self, Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::OptionExt;
use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::Deref;

/// A string encoding scheme used for byte data in metadata documents.
pub trait Encode {
    /// Encode raw bytes into a string.
    fn encode(bytes: &[u8]) -> String;
}

/// The inverse of [`Encode`].
pub trait Decode {
    /// Decode a string into raw bytes.
    fn decode(s: &str) -> Result<Vec<u8>>;
}

/// [`Decoded`] bytes that are written as lowercase hexadecimal, used for key
/// IDs and digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hex;

impl Encode for Hex {
    fn encode(bytes: &[u8]) -> String {
        hex::encode(bytes)
    }
}

impl Decode for Hex {
    fn decode(s: &str) -> Result<Vec<u8>> {
        hex::decode(s).ok().context(error::HexDecodeSnafu { s })
    }
}

/// [`Decoded`] bytes that are written as standard base64, used for
/// signatures and key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Base64;

impl Encode for Base64 {
    fn encode(bytes: &[u8]) -> String {
        base64::encode(bytes)
    }
}

impl Decode for Base64 {
    fn decode(s: &str) -> Result<Vec<u8>> {
        base64::decode(s)
            .ok()
            .context(error::Base64DecodeSnafu { s })
    }
}

/// A wrapper around a `Vec<u8>` that contains the original string it was
/// decoded from. The original is reused during serialization so that a
/// parse-then-serialize round trip reproduces the input bytes exactly, which
/// signature verification depends on.
#[derive(Debug, Clone)]
pub struct Decoded<T> {
    bytes: Vec<u8>,
    original: String,
    spooky: PhantomData<T>,
}

impl<T> Decoded<T> {
    /// Consume this object and return its raw bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }
}

impl<T: Encode> From<Vec<u8>> for Decoded<T> {
    fn from(bytes: Vec<u8>) -> Self {
        let original = T::encode(&bytes);
        Self {
            bytes,
            original,
            spooky: PhantomData,
        }
    }
}

impl<T: Decode> std::str::FromStr for Decoded<T> {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(Self {
            bytes: T::decode(s)?,
            original: s.to_owned(),
            spooky: PhantomData,
        })
    }
}

impl<T> AsRef<[u8]> for Decoded<T> {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl<T> Borrow<[u8]> for Decoded<T> {
    fn borrow(&self) -> &[u8] {
        &self.bytes
    }
}

impl<T> Deref for Decoded<T> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl<T> fmt::Display for Decoded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.original.fmt(f)
    }
}

// Equality and ordering are on the bytes, not the original encoding, so two
// encodings of the same key ID compare equal.

impl<T> PartialEq for Decoded<T> {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl<T> Eq for Decoded<T> {}

impl<T> PartialEq<[u8]> for Decoded<T> {
    fn eq(&self, other: &[u8]) -> bool {
        self.bytes == other
    }
}

impl<T> PartialEq<Vec<u8>> for Decoded<T> {
    fn eq(&self, other: &Vec<u8>) -> bool {
        &self.bytes == other
    }
}

impl<T> Hash for Decoded<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl<T> PartialOrd for Decoded<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Decoded<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

impl<'de, T: Decode> Deserialize<'de> for Decoded<T> {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let original = String::deserialize(deserializer)?;
        Ok(Self {
            bytes: T::decode(&original).map_err(serde::de::Error::custom)?,
            original,
            spooky: PhantomData,
        })
    }
}

impl<T> Serialize for Decoded<T> {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.original)
    }
}

#[cfg(test)]
mod tests {
    use super::{Base64, Decoded, Hex};

    #[test]
    fn hex_round_trip() {
        let decoded: Decoded<Hex> = "c0ffee".parse().unwrap();
        assert_eq!(decoded.as_ref(), &[0xc0, 0xff, 0xee]);
        assert_eq!(decoded.to_string(), "c0ffee");
    }

    #[test]
    fn base64_round_trip() {
        let decoded: Decoded<Base64> = "aGVsbG8=".parse().unwrap();
        assert_eq!(decoded.as_ref(), b"hello");
        assert_eq!(serde_json::to_string(&decoded).unwrap(), "\"aGVsbG8=\"");
    }

    #[test]
    fn rejects_bad_hex() {
        assert!("zz".parse::<Decoded<Hex>>().is_err());
    }
}
