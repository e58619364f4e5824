//! Framed packets shuttled between clients and the upstream target.
//!
//! A record on the wire is `[len: u32 BE][id: u64 BE][body]` where `len`
//! covers the id and the body. The id is assigned by whichever side issues
//! the request and is echoed back verbatim on the response, which is what
//! lets both the clients and the upstream channel match responses delivered
//! out of order.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use monoio_codec::{Decoded, Decoder, Encoder};

/// Bytes in front of the body within a record: the request id.
const PACKET_HEADER: usize = 8;
/// Size of the length prefix.
const LEN_PREFIX: usize = 4;

/// A framed request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: u64,
    pub body: Bytes,
}

impl Packet {
    pub fn new(id: u64, body: Bytes) -> Self {
        Self { id, body }
    }
}

/// Codec for length-prefixed packets, bounded by a maximum frame size.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    max_frame: usize,
}

impl PacketCodec {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Decoded<Packet>, io::Error> {
        if src.len() < LEN_PREFIX {
            return Ok(Decoded::Insufficient);
        }
        let mut prefix = [0u8; LEN_PREFIX];
        prefix.copy_from_slice(&src[..LEN_PREFIX]);
        let len = u32::from_be_bytes(prefix) as usize;
        if len < PACKET_HEADER {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame length {len} shorter than the packet header"),
            ));
        }
        if len > self.max_frame {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame length {len} exceeds the {} byte limit", self.max_frame),
            ));
        }
        if src.len() < LEN_PREFIX + len {
            src.reserve(LEN_PREFIX + len - src.len());
            return Ok(Decoded::InsufficientAtLeast(LEN_PREFIX + len));
        }
        src.advance(LEN_PREFIX);
        let id = src.get_u64();
        let body = src.split_to(len - PACKET_HEADER).freeze();
        Ok(Decoded::Some(Packet { id, body }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), io::Error> {
        let len = PACKET_HEADER + item.body.len();
        if len > self.max_frame {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame length {len} exceeds the {} byte limit", self.max_frame),
            ));
        }
        dst.reserve(LEN_PREFIX + len);
        dst.put_u32(len as u32);
        dst.put_u64(item.id);
        dst.extend_from_slice(&item.body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> PacketCodec {
        PacketCodec::new(64)
    }

    fn encoded(id: u64, body: &'static [u8]) -> Bytes {
        let mut wire = BytesMut::new();
        codec()
            .encode(Packet::new(id, Bytes::from_static(body)), &mut wire)
            .unwrap();
        wire.freeze()
    }

    #[test]
    fn decode_waits_for_a_full_frame() {
        let wire = encoded(7, b"ping");
        let mut codec = codec();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&wire[..3]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Decoded::Insufficient);

        buf.extend_from_slice(&wire[3..10]);
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Decoded::InsufficientAtLeast(_)
        ));

        buf.extend_from_slice(&wire[10..]);
        let packet = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.id, 7);
        assert_eq!(&packet.body[..], b"ping");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_splits_back_to_back_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded(1, b"first"));
        buf.extend_from_slice(&encoded(2, b"second"));

        let mut codec = codec();
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!((first.id, &first.body[..]), (1, &b"first"[..]));
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!((second.id, &second.body[..]), (2, &b"second"[..]));
        assert_eq!(codec.decode(&mut buf).unwrap(), Decoded::Insufficient);
    }

    #[test]
    fn decode_rejects_oversized_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&256u32.to_be_bytes());
        let err = codec().decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn decode_rejects_runt_length() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&4u32.to_be_bytes());
        let err = codec().decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn encode_rejects_bodies_over_the_limit() {
        let mut dst = BytesMut::new();
        let body = Bytes::from(vec![0u8; 100]);
        let err = codec().encode(Packet::new(1, body), &mut dst).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn empty_body_roundtrips() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded(9, b""));
        let packet = codec().decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.id, 9);
        assert!(packet.body.is_empty());
    }
}
