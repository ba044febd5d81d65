// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;
use std::io::{self, Read, Write};
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use digest::consts::U32;
use generic_array::GenericArray;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as Sha256Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};

pub const FINGERPRINT_SIZE: usize = 32;

/// The SHA-256 of zero bytes of input.
pub const EMPTY_FINGERPRINT: Fingerprint = Fingerprint([
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9,
    0x24, 0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52,
    0xb8, 0x55,
]);

pub const EMPTY_DIGEST: Digest = Digest {
    hash: EMPTY_FINGERPRINT,
    size_bytes: 0,
};

#[derive(Clone, Copy, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct Fingerprint(pub [u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    pub fn from_bytes_unsafe(bytes: &[u8]) -> Fingerprint {
        assert!(
            bytes.len() == FINGERPRINT_SIZE,
            "Input value was not a fingerprint; had length: {}",
            bytes.len()
        );
        let mut buf = [0; FINGERPRINT_SIZE];
        buf.copy_from_slice(bytes);
        Fingerprint(buf)
    }

    pub fn from_digest_output(bytes: GenericArray<u8, U32>) -> Fingerprint {
        Fingerprint(bytes.into())
    }

    pub fn from_hex_string(hex_string: &str) -> Result<Fingerprint, String> {
        <[u8; FINGERPRINT_SIZE] as hex::FromHex>::from_hex(hex_string)
            .map(Fingerprint)
            .map_err(|e| format!("{e:?}"))
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// A fingerprint is the output of a strong hash function, so a prefix of it is itself a
    /// strong (if short) hash.
    pub fn prefix_hash(&self) -> u64 {
        use byteorder::ByteOrder;
        byteorder::BigEndian::read_u64(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint<{}>", self.to_hex())
    }
}

impl AsRef<[u8]> for Fingerprint {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}

impl FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Fingerprint::from_hex_string(s)
    }
}

impl TryFrom<&str> for Fingerprint {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Fingerprint::from_hex_string(s)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FingerprintVisitor;

        impl Visitor<'_> for FingerprintVisitor {
            type Value = Fingerprint;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(
                    formatter,
                    "a hex representation of a {FINGERPRINT_SIZE} byte value"
                )
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Fingerprint::from_hex_string(v).map_err(|err| {
                    de::Error::invalid_value(de::Unexpected::Str(&format!("{v:?}: {err}")), &self)
                })
            }
        }

        deserializer.deserialize_str(FingerprintVisitor)
    }
}

/// A fingerprint paired with the length in bytes of the fingerprinted content.
///
/// Equivalent to a remote execution API Digest, without the overhead of carrying an entire
/// protobuf message around for two fields.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Digest {
    #[serde(rename = "fingerprint")]
    pub hash: Fingerprint,
    pub size_bytes: u64,
}

impl Digest {
    pub fn new(hash: Fingerprint, size_bytes: u64) -> Digest {
        Digest { hash, size_bytes }
    }

    pub fn of_bytes(bytes: &[u8]) -> Digest {
        let mut hasher = Sha256::default();
        hasher.update(bytes);
        Digest::new(
            Fingerprint::from_digest_output(hasher.finalize()),
            bytes.len() as u64,
        )
    }
}

/// A fingerprint annotated with how long ago its lease expired, for garbage collection
/// ordering. `expired_seconds_ago == 0` indicates an unexpired lease.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct AgedFingerprint {
    // Ordered first so that the derived Ord sorts by expiry.
    pub expired_seconds_ago: u64,
    pub fingerprint: Fingerprint,
    pub size_bytes: u64,
}

/// A writer that fingerprints everything that passes through it.
pub struct WriterHasher<W> {
    hasher: Sha256,
    byte_count: u64,
    inner: W,
}

impl<W> WriterHasher<W> {
    pub fn new(inner: W) -> WriterHasher<W> {
        WriterHasher {
            hasher: Sha256::default(),
            byte_count: 0,
            inner,
        }
    }

    /// Returns the digest of the written stream, and the wrapped writer.
    pub fn finish(self) -> (Digest, W) {
        (
            Digest::new(
                Fingerprint::from_digest_output(self.hasher.finalize()),
                self.byte_count,
            ),
            self.inner,
        )
    }
}

impl<W: Write> Write for WriterHasher<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        // Only hash the bytes that were actually written.
        self.hasher.update(&buf[..written]);
        self.byte_count += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<AW: ?Sized + AsyncWrite + Unpin> AsyncWrite for WriterHasher<&mut AW> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let result = Pin::new(&mut *self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = result {
            // Only hash the bytes that were actually written.
            self.hasher.update(&buf[..written]);
            self.byte_count += written as u64;
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}

/// Copy from reader to writer, hashing the copied bytes in one pass.
pub fn sync_copy_and_hash<R: ?Sized + Read, W: ?Sized + Write>(
    reader: &mut R,
    writer: &mut W,
) -> io::Result<Digest> {
    let mut hasher = WriterHasher::new(writer);
    let _ = io::copy(reader, &mut hasher)?;
    Ok(hasher.finish().0)
}

/// Copy from reader to writer and return whether the copied data matched `expected_digest`.
///
/// When the source is immutable, trusts the content and only validates its length.
pub fn sync_verified_copy<R: ?Sized + Read, W: ?Sized + Write>(
    expected_digest: Digest,
    data_is_immutable: bool,
    reader: &mut R,
    writer: &mut W,
) -> io::Result<bool> {
    if data_is_immutable {
        let copied = io::copy(reader, writer)?;
        Ok(copied == expected_digest.size_bytes)
    } else {
        Ok(expected_digest == sync_copy_and_hash(reader, writer)?)
    }
}

/// Async form of `sync_copy_and_hash`.
pub async fn async_copy_and_hash<R, W>(reader: &mut R, writer: &mut W) -> io::Result<Digest>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut hasher = WriterHasher::new(writer);
    let _ = tokio::io::copy(reader, &mut hasher).await?;
    Ok(hasher.finish().0)
}

/// Async form of `sync_verified_copy`.
pub async fn async_verified_copy<R, W>(
    expected_digest: Digest,
    data_is_immutable: bool,
    reader: &mut R,
    writer: &mut W,
) -> io::Result<bool>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    if data_is_immutable {
        let copied = tokio::io::copy(reader, writer).await?;
        Ok(copied == expected_digest.size_bytes)
    } else {
        Ok(expected_digest == async_copy_and_hash(reader, writer).await?)
    }
}

#[cfg(test)]
mod tests;
