use std::io::{self, Error, ErrorKind};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{ByteRead, ByteWrite, MAX_BLOB_LENGTH};

async fn write_blob<W: AsyncWrite + Unpin + ?Sized>(bytes: &[u8], writer: &mut W) -> io::Result<()> {
    if bytes.len() > MAX_BLOB_LENGTH {
        let msg = format!("Byte string is too long ({} > {MAX_BLOB_LENGTH} bytes)", bytes.len());
        return Err(Error::new(ErrorKind::InvalidData, msg));
    }

    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(bytes).await
}

async fn read_blob<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Vec<u8>> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_BLOB_LENGTH {
        let msg = format!("Byte string is too long ({len} > {MAX_BLOB_LENGTH} bytes)");
        return Err(Error::new(ErrorKind::InvalidData, msg));
    }

    let mut v = vec![0u8; len];
    reader.read_exact(&mut v).await?;
    Ok(v)
}

impl ByteWrite for [u8] {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        write_blob(self, writer).await
    }
}

impl ByteWrite for Vec<u8> {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        write_blob(self, writer).await
    }
}

impl ByteRead for Vec<u8> {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        read_blob(reader).await
    }
}

impl ByteWrite for str {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        write_blob(self.as_bytes(), writer).await
    }
}

impl ByteWrite for String {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        self.as_str().write(writer).await
    }
}

impl ByteRead for String {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let bytes = read_blob(reader).await?;
        String::from_utf8(bytes).map_err(|_| Error::new(ErrorKind::InvalidData, "String is not valid UTF-8"))
    }
}
