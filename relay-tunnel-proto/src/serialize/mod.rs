//! Defines the [`ByteRead`] and [`ByteWrite`] traits and implements them for the basic types the
//! relay session protocol is made of.
//!
//! This includes `()`, [`bool`], [`u8`], [`u16`], [`u32`] and [`u64`] (big-endian), [`str`]
//! (write-only), [`String`], `[u8]` (write-only), [`Vec<u8>`], references to any [`ByteWrite`],
//! and tuples of up to 5 elements.
//!
//! # Serialization of strings and byte strings
//! Strings and byte strings are serialized the way SSH does it: an [`u32`] indicating the length
//! in bytes, followed by said amount of bytes. Strings must be valid UTF-8. To prevent a
//! malicious peer from making us allocate huge buffers, any length above [`MAX_BLOB_LENGTH`] is
//! rejected before allocating.
//!
//! # Serialization of tuples
//! [`ByteRead`] and [`ByteWrite`] are also implemented for any tuple of up to 5 elements, with all
//! the element types being [`ByteRead`] and/or [`ByteWrite`]. This allows easily turning multiple
//! writes such as this:
//! ```ignore
//! channel_id.write(writer).await?;
//! originator_address.write(writer).await?;
//! port.write(writer).await?;
//! ```
//!
//! into this:
//! ```ignore
//! (channel_id, originator_address, port).write(writer).await?;
//! ```
//!
//! # Payloads
//! Global request and channel-open payloads travel as opaque byte strings inside a session frame.
//! [`to_bytes`] and [`from_bytes`] convert between a typed payload and those bytes.

use std::io::{self, Error, ErrorKind};

use tokio::io::{AsyncRead, AsyncWrite};

mod primitives;
mod string;
mod tuples;
mod u8_repr_enum;

pub use u8_repr_enum::*;

/// The maximum length, in bytes, of a string or byte string accepted by the decoder.
pub const MAX_BLOB_LENGTH: usize = 1024 * 1024;

/// Serializes a type into bytes, writing it to an [`AsyncWrite`] asynchronously.
#[allow(async_fn_in_trait)]
pub trait ByteWrite {
    /// Serializes this instance into bytes, writing those bytes into a writer.
    ///
    /// When an error occurs, there's no guarantee on how many bytes were written.
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()>;
}

/// Deserializes a type from raw bytes, reading it from an [`AsyncRead`] asynchronously.
#[allow(async_fn_in_trait)]
pub trait ByteRead: Sized {
    /// Deserializes bytes into an instance of this type by reading bytes from a reader.
    ///
    /// When an error occurs, there's no guarantee on how many bytes were read.
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self>;
}

impl<T: ByteWrite + ?Sized> ByteWrite for &T {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        (**self).write(writer).await
    }
}

/// Serializes a value into a newly allocated buffer.
pub async fn to_bytes<T: ByteWrite + ?Sized>(value: &T) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    value.write(&mut buf).await?;
    Ok(buf)
}

/// Deserializes a value from a buffer, failing if the buffer holds anything past the value.
pub async fn from_bytes<T: ByteRead>(bytes: &[u8]) -> io::Result<T> {
    let mut remaining = bytes;
    let value = T::read(&mut remaining).await?;
    if !remaining.is_empty() {
        let msg = format!("{} unexpected trailing bytes", remaining.len());
        return Err(Error::new(ErrorKind::InvalidData, msg));
    }

    Ok(value)
}
