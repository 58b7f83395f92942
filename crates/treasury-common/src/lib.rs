// SPDX-License-Identifier: MIT

//! # Treasury Common
//! Provides utility functions shared by the treasury crates: content hashing
//! of consensus-encodable values, bounded-length decoding guards and unix
//! time helpers.

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use bitcoin::consensus::encode;
use bitcoin::consensus::Decodable;
use bitcoin::consensus::Encodable;
use bitcoin::hashes::sha256d;
use bitcoin::hashes::Hash;
use bitcoin::VarInt;

/// Computes the double-SHA256 digest of a value's consensus encoding.
///
/// This matches the hash Bitcoin Core computes when it serializes an object
/// into a hash writer, so ids derived from it are stable across
/// implementations.
pub fn serialize_hash<T: Encodable>(value: &T) -> sha256d::Hash {
    let mut bytes = Vec::new();
    value
        .consensus_encode(&mut bytes)
        .expect("writing to a Vec never fails");
    sha256d::Hash::hash(&bytes)
}

/// Reads a VarInt from the given reader and ensures it is less than or equal to `max`.
///
/// Returns an error if the VarInt is larger than `max`.
pub fn read_bounded_len<R: bitcoin::io::Read + ?Sized>(
    reader: &mut R,
    max: usize,
) -> Result<usize, encode::Error> {
    let n64 = VarInt::consensus_decode(reader)?.0;
    if n64 > max as u64 {
        return Err(encode::Error::OversizedVectorAllocation {
            requested: n64 as usize,
            max,
        });
    }
    Ok(n64 as usize)
}

/// Reads a length-prefixed UTF-8 string, rejecting lengths above `max`.
pub fn read_bounded_string<R: bitcoin::io::Read + ?Sized>(
    reader: &mut R,
    max: usize,
) -> Result<String, encode::Error> {
    let len = read_bounded_len(reader, max)?;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| encode::Error::ParseFailed("string is not valid utf-8"))
}

/// Returns the current unix timestamp, truncated to 32 bits.
///
/// The on-disk treasury format stores seconds as `u32`, like every other
/// timestamp in the legacy serialization.
pub fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is set before the unix epoch")
        .as_secs() as u32
}
