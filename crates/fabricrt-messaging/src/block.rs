//! The `Block`: an opaque framed byte buffer with two regions separated by
//! `offset1` (body, then metadata). See spec.md §3 and GLOSSARY.

use bytes::{Buf, BufMut, BytesMut};

/// A single message unit exchanged with the broker.
///
/// `data[..offset1]` is the payload body; `data[offset1..]` is the
/// broker-protocol metadata region (spec.md §6). The bridge crate fills in
/// both regions; this crate only needs to move the bytes around and frame
/// them on the wire.
#[derive(Clone, Debug)]
pub struct Block {
    data: BytesMut,
    offset1: usize,
}

impl Block {
    pub fn new(data: BytesMut, offset1: usize) -> Self {
        debug_assert!(offset1 <= data.len());
        Block { data, offset1 }
    }

    pub fn body(&self) -> &[u8] {
        &self.data[..self.offset1]
    }

    pub fn metadata(&self) -> &[u8] {
        &self.data[self.offset1..]
    }

    pub fn offset1(&self) -> usize {
        self.offset1
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_parts(self) -> (BytesMut, usize) {
        (self.data, self.offset1)
    }

    /// Serializes a length-prefixed wire frame: 4-byte big-endian `offset1`,
    /// 4-byte big-endian total length, then the raw bytes.
    pub fn encode_frame(&self) -> BytesMut {
        let mut framed = BytesMut::with_capacity(8 + self.data.len());
        framed.put_u32(self.offset1 as u32);
        framed.put_u32(self.data.len() as u32);
        framed.put_slice(&self.data);
        framed
    }

    /// Parses a frame previously produced by [`Block::encode_frame`] from a
    /// complete in-memory buffer.
    pub fn decode_frame(mut framed: BytesMut) -> Option<Block> {
        if framed.len() < 8 {
            return None;
        }
        let offset1 = framed.get_u32() as usize;
        let total_len = framed.get_u32() as usize;
        if framed.len() != total_len || offset1 > total_len {
            return None;
        }
        Some(Block::new(framed, offset1))
    }
}
