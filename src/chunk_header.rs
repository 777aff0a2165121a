use anyhow::bail;
use bytes::{Buf, BufMut};

use crate::safe_converter::PrecheckedCast;

/// Distinguishes a sender-initiated transmission from the answer to a NAK. The
///  receiver's quiet timer is only re-armed by INIT chunks - a RESEND merely fills
///  its slot in the bitmap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransmissionType {
    Init,
    Resend,
}

impl TransmissionType {
    fn to_wire(self) -> u16 {
        match self {
            TransmissionType::Init => 0,
            TransmissionType::Resend => 1,
        }
    }

    fn from_wire(raw: u16) -> anyhow::Result<TransmissionType> {
        match raw {
            0 => Ok(TransmissionType::Init),
            1 => Ok(TransmissionType::Resend),
            _ => bail!("invalid transmission type {}", raw),
        }
    }
}

/// The fixed-layout header starting every datagram, INIT / RESEND / NAK alike.
///
/// For chunk datagrams `chunk_size` payload bytes follow the header; a NAK is the
///  bare header with only `id`, `chunk_index` and `total_chunks` filled in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    pub id: u32,
    pub total_size: u32,
    pub total_chunks: u16,
    pub chunk_index: u16,
    pub chunk_size: u32,
    pub transmission_type: TransmissionType,
}

impl ChunkHeader {
    /// The six fields occupy 18 bytes; two zero bytes of trailing padding keep the
    ///  on-wire length at 20.
    pub const SERIALIZED_LEN: usize = 20;

    /// header for the first chunk of a fresh outbound frame - `chunk_index` and
    ///  `chunk_size` are filled in per chunk while fragmenting
    pub fn for_frame(id: u32, total_size: usize, payload_per_chunk: usize) -> ChunkHeader {
        let total_chunks = total_size.div_ceil(payload_per_chunk);
        ChunkHeader {
            id,
            total_size: total_size.prechecked_cast(),
            total_chunks: total_chunks.prechecked_cast(),
            chunk_index: 0,
            chunk_size: 0,
            transmission_type: TransmissionType::Init,
        }
    }

    /// header-only NAK shape: the receiver does not know (or need) the frame's
    ///  size fields, so they go out as zero
    pub fn nak(id: u32, chunk_index: u16, total_chunks: u16) -> ChunkHeader {
        ChunkHeader {
            id,
            total_size: 0,
            total_chunks,
            chunk_index,
            chunk_size: 0,
            transmission_type: TransmissionType::Init,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.id);
        buf.put_u32(self.total_size);
        buf.put_u16(self.total_chunks);
        buf.put_u16(self.chunk_index);
        buf.put_u32(self.chunk_size);
        buf.put_u16(self.transmission_type.to_wire());
        buf.put_u16(0);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ChunkHeader> {
        let id = buf.try_get_u32()?;
        let total_size = buf.try_get_u32()?;
        let total_chunks = buf.try_get_u16()?;
        let chunk_index = buf.try_get_u16()?;
        let chunk_size = buf.try_get_u32()?;
        let transmission_type = TransmissionType::from_wire(buf.try_get_u16()?)?;
        let _padding = buf.try_get_u16()?;

        Ok(ChunkHeader {
            id,
            total_size,
            total_chunks,
            chunk_index,
            chunk_size,
            transmission_type,
        })
    }
}
