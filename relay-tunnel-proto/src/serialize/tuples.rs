use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

use super::{ByteRead, ByteWrite};

/// Implements [`ByteRead`] and [`ByteWrite`] for a tuple, serializing its elements in order.
macro_rules! impl_tuple {
    ($($name:ident . $idx:tt),+) => {
        impl<$($name: ByteWrite),+> ByteWrite for ($($name,)+) {
            async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
                $(self.$idx.write(writer).await?;)+
                Ok(())
            }
        }

        impl<$($name: ByteRead),+> ByteRead for ($($name,)+) {
            async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
                Ok(($($name::read(reader).await?,)+))
            }
        }
    };
}

impl_tuple!(T0 . 0, T1 . 1);
impl_tuple!(T0 . 0, T1 . 1, T2 . 2);
impl_tuple!(T0 . 0, T1 . 1, T2 . 2, T3 . 3);
impl_tuple!(T0 . 0, T1 . 1, T2 . 2, T3 . 3, T4 . 4);
