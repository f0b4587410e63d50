// src/rpc/wire.rs

//! The cluster wire protocol: a length-delimited `[u32 len][u8 tag][body]`
//! frame, coded with `tokio_util::codec` the way `core/protocol/resp_frame.rs`
//! frames RESP — an `Encoder`/`Decoder` pair driving a `Framed` stream,
//! swapping the RESP grammar for a single tagged envelope around a
//! `bincode` archive.

use crate::error::{NuError, NuResult};
use bytes::{Buf, BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(2);
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Rejects a claimed frame body larger than this before allocating for it —
/// a malformed or hostile length prefix must not drive an unbounded reserve.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// RPC request kinds, per spec §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    ProcletCall = 0,
    Construct = 1,
    Destroy = 2,
    RefcountDelta = 3,
    MigrationStream = 4,
    RegisterCallback = 5,
}

impl FrameKind {
    pub fn from_u8(b: u8) -> NuResult<Self> {
        Ok(match b {
            0 => Self::ProcletCall,
            1 => Self::Construct,
            2 => Self::Destroy,
            3 => Self::RefcountDelta,
            4 => Self::MigrationStream,
            5 => Self::RegisterCallback,
            other => return Err(NuError::UnrecognizedReply(other)),
        })
    }
}

/// RPC reply status codes, per spec §6 and §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCode {
    Ok = 0,
    WrongClient = 1,
    OutOfMemory = 2,
    Destroyed = 3,
    Exception = 4,
}

impl StatusCode {
    pub fn from_u8(b: u8) -> NuResult<Self> {
        Ok(match b {
            0 => Self::Ok,
            1 => Self::WrongClient,
            2 => Self::OutOfMemory,
            3 => Self::Destroyed,
            4 => Self::Exception,
            other => return Err(NuError::UnrecognizedReply(other)),
        })
    }
}

fn encode<T: Serialize>(payload: &T) -> NuResult<Vec<u8>> {
    bincode::serde::encode_to_vec(payload, bincode::config::standard()).map_err(Into::into)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> NuResult<T> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(Into::into)
}

/// One `[tag][body]` frame, the unit [`NuFrameCodec`] moves over the wire.
/// `tag` is a raw `FrameKind` or `StatusCode` discriminant depending on
/// direction; interpreting it is the caller's job, same as the old
/// read-then-match-on-tag shape.
#[derive(Debug)]
struct RawFrame {
    tag: u8,
    body: Vec<u8>,
}

/// `tokio_util::codec` implementation of the frame format, mirroring
/// `RespFrameCodec`'s Encoder/Decoder split: `encode` pushes length-prefixed
/// bytes into the write buffer, `decode` returns `Ok(None)` until a full
/// frame has arrived so `Framed` knows to wait for more data.
#[derive(Debug, Default)]
pub struct NuFrameCodec;

impl Encoder<RawFrame> for NuFrameCodec {
    type Error = NuError;

    fn encode(&mut self, item: RawFrame, dst: &mut BytesMut) -> NuResult<()> {
        let len = item.body.len() + 1;
        dst.reserve(4 + len);
        dst.put_u32(len as u32);
        dst.put_u8(item.tag);
        dst.extend_from_slice(&item.body);
        Ok(())
    }
}

impl Decoder for NuFrameCodec {
    type Item = RawFrame;
    type Error = NuError;

    fn decode(&mut self, src: &mut BytesMut) -> NuResult<Option<RawFrame>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes(src[..4].try_into().unwrap()) as usize;
        if len == 0 {
            return Err(NuError::Io("zero-length frame".into()));
        }
        if len > MAX_FRAME_LEN {
            return Err(NuError::Io(format!("frame of {len} bytes exceeds the frame limit")));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let tag = src[0];
        let body = src[1..len].to_vec();
        src.advance(len);
        Ok(Some(RawFrame { tag, body }))
    }
}

/// A connection framed for the cluster wire protocol — what every RPC
/// client and the proclet server drive instead of a raw `TcpStream`.
pub type NuConn = Framed<TcpStream, NuFrameCodec>;

async fn write_tagged<T: Serialize>(conn: &mut NuConn, tag: u8, payload: &T) -> NuResult<()> {
    let body = encode(payload)?;
    tokio::time::timeout(WRITE_TIMEOUT, conn.send(RawFrame { tag, body }))
        .await
        .map_err(|_| NuError::Io("write timeout".into()))??;
    Ok(())
}

async fn read_tagged_raw(conn: &mut NuConn) -> NuResult<(u8, Vec<u8>)> {
    let frame = tokio::time::timeout(READ_TIMEOUT, conn.next())
        .await
        .map_err(|_| NuError::Io("read timeout".into()))?
        .ok_or_else(|| NuError::Io("connection closed by peer".into()))??;
    Ok((frame.tag, frame.body))
}

async fn read_tagged<T: DeserializeOwned>(conn: &mut NuConn) -> NuResult<(u8, T)> {
    let (tag, bytes) = read_tagged_raw(conn).await?;
    Ok((tag, decode(&bytes)?))
}

pub async fn write_request<T: Serialize>(conn: &mut NuConn, kind: FrameKind, payload: &T) -> NuResult<()> {
    write_tagged(conn, kind as u8, payload).await
}

pub async fn read_request<T: DeserializeOwned>(conn: &mut NuConn) -> NuResult<(FrameKind, T)> {
    let (tag, payload) = read_tagged(conn).await?;
    Ok((FrameKind::from_u8(tag)?, payload))
}

/// Reads a request frame without decoding its payload — used by the
/// proclet server, whose payload shape depends on the frame `kind` it has
/// not read yet until this returns.
pub async fn read_request_raw(conn: &mut NuConn) -> NuResult<(FrameKind, Vec<u8>)> {
    let (tag, bytes) = read_tagged_raw(conn).await?;
    Ok((FrameKind::from_u8(tag)?, bytes))
}

pub async fn write_reply<T: Serialize>(conn: &mut NuConn, status: StatusCode, payload: &T) -> NuResult<()> {
    write_tagged(conn, status as u8, payload).await
}

pub async fn read_reply<T: DeserializeOwned>(conn: &mut NuConn) -> NuResult<(StatusCode, T)> {
    let (tag, payload) = read_tagged(conn).await?;
    Ok((StatusCode::from_u8(tag)?, payload))
}

/// Serializes a value into the self-describing binary archive used for
/// closure arguments/results and migration streams.
pub fn archive_encode<T: Serialize>(value: &T) -> NuResult<Vec<u8>> {
    encode(value)
}

pub fn archive_decode<T: DeserializeOwned>(bytes: &[u8]) -> NuResult<T> {
    decode(bytes)
}

pub async fn connect(addr: std::net::SocketAddr) -> NuResult<NuConn> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| NuError::Io(format!("connect timeout to {addr}")))??;
    stream.set_nodelay(true).ok();
    Ok(Framed::new(stream, NuFrameCodec))
}

/// Frames an already-accepted inbound connection — the proclet server's
/// counterpart to [`connect`].
pub fn from_accepted(stream: TcpStream) -> NuConn {
    Framed::new(stream, NuFrameCodec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Ping(u64);

    async fn paired_conns() -> (NuConn, NuConn) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(connect(addr));
        let (server, _) = listener.accept().await.unwrap();
        (client.await.unwrap().unwrap(), from_accepted(server))
    }

    #[tokio::test]
    async fn request_reply_round_trips_through_the_codec() {
        let (mut client, mut server) = paired_conns().await;
        write_request(&mut client, FrameKind::ProcletCall, &Ping(7)).await.unwrap();
        let (kind, req): (FrameKind, Ping) = read_request(&mut server).await.unwrap();
        assert_eq!(kind, FrameKind::ProcletCall);
        assert_eq!(req, Ping(7));

        write_reply(&mut server, StatusCode::Ok, &Ping(8)).await.unwrap();
        let (status, reply): (StatusCode, Ping) = read_reply(&mut client).await.unwrap();
        assert_eq!(status, StatusCode::Ok);
        assert_eq!(reply, Ping(8));
    }

    #[tokio::test]
    async fn read_request_raw_defers_payload_decoding() {
        let (mut client, mut server) = paired_conns().await;
        write_request(&mut client, FrameKind::Construct, &Ping(42)).await.unwrap();
        let (kind, bytes) = read_request_raw(&mut server).await.unwrap();
        assert_eq!(kind, FrameKind::Construct);
        assert_eq!(archive_decode::<Ping>(&bytes).unwrap(), Ping(42));
    }
}
