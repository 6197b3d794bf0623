use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{ByteRead, ByteWrite};

impl ByteWrite for () {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, _: &mut W) -> io::Result<()> {
        Ok(())
    }
}

impl ByteRead for () {
    async fn read<R: AsyncRead + Unpin + ?Sized>(_: &mut R) -> io::Result<Self> {
        Ok(())
    }
}

impl ByteWrite for bool {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u8(*self as u8).await
    }
}

impl ByteRead for bool {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        Ok(reader.read_u8().await? != 0)
    }
}

/// Implements [`ByteRead`] and [`ByteWrite`] for an integer type using tokio's big-endian helpers.
macro_rules! impl_integer {
    ($ty:ty, $read_fn:ident, $write_fn:ident) => {
        impl ByteWrite for $ty {
            async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
                writer.$write_fn(*self).await
            }
        }

        impl ByteRead for $ty {
            async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
                reader.$read_fn().await
            }
        }
    };
}

impl_integer!(u8, read_u8, write_u8);
impl_integer!(u16, read_u16, write_u16);
impl_integer!(u32, read_u32, write_u32);
impl_integer!(u64, read_u64, write_u64);

#[cfg(test)]
mod tests {
    use crate::serialize::{from_bytes, to_bytes};

    #[tokio::test]
    async fn integers_are_big_endian() {
        assert_eq!(to_bytes(&0x0102_0304u32).await.unwrap(), [1, 2, 3, 4]);
        assert_eq!(from_bytes::<u16>(&[0x1f, 0x41]).await.unwrap(), 8001);
    }

    #[tokio::test]
    async fn any_nonzero_byte_is_true() {
        assert!(from_bytes::<bool>(&[0x80]).await.unwrap());
        assert!(!from_bytes::<bool>(&[0]).await.unwrap());
    }
}
