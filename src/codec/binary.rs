//! The default codec: a length-framed, bincode-encoded binary protocol.
//! Plays the role the reference implementation gives Gob — a
//! self-describing binary encoding good enough for a pedagogical RPC
//! core, adapted here to an explicit frame format since Rust's `bincode`
//! (unlike Go's `encoding/gob`) has no wire-level message boundaries of
//! its own.
//!
//! Frame layout: `[1 magic byte][4-byte big-endian length][payload]`.
//! The magic byte is a cheap resync aid directly modeled on the
//! teacher's `transport/frame.rs`.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{split, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};

use super::{CodecReader, CodecWriter, OwnedBody};
use crate::message::Header;
use crate::transport::Stream;
use crate::Error;

const FRAME_MAGIC: u8 = 0xC0;
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

pub fn new(stream: Box<dyn Stream>) -> (Box<dyn CodecReader>, Box<dyn CodecWriter>) {
    let (read_half, write_half) = split(stream);
    let reader = BinaryReader {
        inner: BufReader::new(read_half),
    };
    let writer = BinaryWriter {
        inner: BufWriter::new(write_half),
    };
    (Box::new(reader), Box::new(writer))
}

pub struct BinaryReader {
    inner: BufReader<ReadHalf<Box<dyn Stream>>>,
}

pub struct BinaryWriter {
    inner: BufWriter<WriteHalf<Box<dyn Stream>>>,
}

async fn read_frame<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, Error> {
    let mut magic = [0u8; 1];
    match reader.read_exact(&mut magic).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    if magic[0] != FRAME_MAGIC {
        return Err(Error::Decode(format!(
            "frame magic mismatch: expected {:#x}, found {:#x}",
            FRAME_MAGIC, magic[0]
        )));
    }

    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(Error::Decode(format!(
            "frame length {} exceeds maximum {}",
            len, MAX_FRAME_LEN
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), Error> {
    if payload.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(Error::Encode(format!(
            "frame length {} exceeds maximum {}",
            payload.len(),
            MAX_FRAME_LEN
        )));
    }
    writer.write_all(&[FRAME_MAGIC]).await?;
    writer
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await?;
    writer.write_all(payload).await?;
    Ok(())
}

fn bincode_options() -> impl bincode::Options {
    use bincode::Options;
    bincode::DefaultOptions::new().with_fixint_encoding()
}

pub(super) fn bincode_serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    use bincode::Options;
    bincode_options()
        .serialize(value)
        .map_err(|e| Error::Encode(e.to_string()))
}

pub(super) fn bincode_deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    use bincode::Options;
    bincode_options()
        .deserialize(bytes)
        .map_err(|e| Error::Decode(e.to_string()))
}

#[async_trait]
impl CodecReader for BinaryReader {
    async fn read_header(&mut self) -> Result<Option<Header>, Error> {
        let frame = match read_frame(&mut self.inner).await? {
            Some(f) => f,
            None => return Ok(None),
        };
        Ok(Some(bincode_deserialize(&frame)?))
    }

    async fn read_body(&mut self) -> Result<OwnedBody, Error> {
        let frame = read_frame(&mut self.inner)
            .await?
            .ok_or_else(|| Error::Decode("stream ended before body frame".to_string()))?;
        Ok(OwnedBody(frame))
    }

    async fn close(&mut self) -> Result<(), Error> {
        // The read half has no shutdown of its own; the underlying stream
        // is released once both halves (this one and the writer's) drop,
        // or explicitly via the writer's `close`.
        Ok(())
    }
}

#[async_trait]
impl CodecWriter for BinaryWriter {
    async fn write(&mut self, header: &Header, body: &OwnedBody) -> Result<(), Error> {
        let header_bytes = bincode_serialize(header)?;
        write_frame(&mut self.inner, &header_bytes).await?;
        write_frame(&mut self.inner, &body.0).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), Error> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
