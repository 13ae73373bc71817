//! Chunk serialization
//!
//! Binary layout (little endian):
//!
//! ```text
//! magic "SCHK" | u16 version
//! i32 x, y, z            chunk coordinate
//! i32 sx, sy, sz         dimensions
//! u8 flags               bit 0 = empty, bit 1 = explored
//! [sx*sy*sz bytes]       only when not empty
//! u32 record count
//! records: u8 tag | u32 len | len bytes
//! ```
//!
//! Every object is a length-prefixed record, so a reader that does not know a
//! tag skips exactly `len` bytes and stays aligned. Tag 1 is an object:
//! `u64 id | u16 address | u16 kind_len | kind | payload`.

use crate::core::{Error, Result};
use crate::streaming::chunk::{ChunkData, NO_DATA};
use crate::streaming::coord::ChunkCoord;
use crate::streaming::objects::AttachedObject;

const CHUNK_MAGIC: &[u8; 4] = b"SCHK";

/// Current chunk record version
pub const CHUNK_FORMAT_VERSION: u16 = 1;

const FLAG_EMPTY: u8 = 1 << 0;
const FLAG_EXPLORED: u8 = 1 << 1;

/// Record tag for an attached object
pub const RECORD_OBJECT: u8 = 1;

/// Upper bound on a decoded grid, guards against corrupt dimensions
const MAX_CELLS: usize = 1 << 26;

/// Longest object kind name a record can carry
pub const MAX_KIND_LEN: usize = u16::MAX as usize;

/// Serialize a chunk to bytes (uncompressed)
///
/// Emptiness is taken from the grid itself, so identical contents always
/// encode identically whatever the chunk's edit history.
pub fn encode_chunk(chunk: &ChunkData) -> Result<Vec<u8>> {
    let dims = chunk.dims().unwrap_or([0, 0, 0]);
    let coord = chunk.coord();
    let empty = !chunk.is_dimensioned() || chunk.data().iter().all(|&b| b == NO_DATA);

    let mut out = Vec::with_capacity(32 + if empty { 0 } else { chunk.data().len() });
    out.extend_from_slice(CHUNK_MAGIC);
    out.extend_from_slice(&CHUNK_FORMAT_VERSION.to_le_bytes());
    for v in [coord.x, coord.y, coord.z] {
        out.extend_from_slice(&v.to_le_bytes());
    }
    for d in dims {
        out.extend_from_slice(&(d as i32).to_le_bytes());
    }

    let mut flags = 0u8;
    if empty {
        flags |= FLAG_EMPTY;
    }
    if chunk.explored {
        flags |= FLAG_EXPLORED;
    }
    out.push(flags);

    if !empty {
        out.extend_from_slice(chunk.data());
    }

    out.extend_from_slice(&(chunk.objects().len() as u32).to_le_bytes());
    for object in chunk.objects() {
        let record = encode_object(object)?;
        let len = u32::try_from(record.len()).map_err(|_| {
            Error::Codec(format!("object {} in chunk {} is too large", object.id, coord))
        })?;
        out.push(RECORD_OBJECT);
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&record);
    }

    Ok(out)
}

fn encode_object(object: &AttachedObject) -> Result<Vec<u8>> {
    let kind = object.kind.as_bytes();
    if kind.len() > MAX_KIND_LEN {
        return Err(Error::Codec(format!(
            "object {} kind is {} bytes, limit is {}",
            object.id,
            kind.len(),
            MAX_KIND_LEN
        )));
    }
    let mut record = Vec::with_capacity(12 + kind.len() + object.payload.len());
    record.extend_from_slice(&object.id.to_le_bytes());
    record.extend_from_slice(&object.address.to_le_bytes());
    record.extend_from_slice(&(kind.len() as u16).to_le_bytes());
    record.extend_from_slice(kind);
    record.extend_from_slice(&object.payload);
    Ok(record)
}

/// Deserialize a chunk from bytes (uncompressed)
pub fn decode_chunk(bytes: &[u8]) -> Result<ChunkData> {
    let mut reader = ByteReader::new(bytes);

    if reader.take(4)? != CHUNK_MAGIC {
        return Err(Error::Codec("bad chunk magic".into()));
    }
    let version = reader.u16()?;
    if version > CHUNK_FORMAT_VERSION {
        return Err(Error::Codec(format!("unsupported chunk version {}", version)));
    }

    let coord = ChunkCoord::new(reader.i32()?, reader.i32()?, reader.i32()?);
    let raw_dims = [reader.i32()?, reader.i32()?, reader.i32()?];
    if raw_dims.iter().any(|&d| d <= 0) {
        return Err(Error::Codec(format!(
            "chunk {} has invalid dimensions {:?}",
            coord, raw_dims
        )));
    }
    let dims = raw_dims.map(|d| d as usize);
    let cells = dims[0]
        .checked_mul(dims[1])
        .and_then(|n| n.checked_mul(dims[2]))
        .filter(|&n| n <= MAX_CELLS)
        .ok_or_else(|| Error::Codec(format!("chunk {} is too large: {:?}", coord, dims)))?;

    let flags = reader.u8()?;
    let data = if flags & FLAG_EMPTY != 0 {
        vec![0u8; cells]
    } else {
        reader.take(cells)?.to_vec()
    };

    let record_count = reader.u32()?;
    let mut objects = Vec::new();
    for _ in 0..record_count {
        let tag = reader.u8()?;
        let len = reader.u32()? as usize;
        let record = reader.take(len)?;
        match tag {
            RECORD_OBJECT => objects.push(decode_object(record)?),
            other => {
                log::warn!(
                    "Skipping unknown record tag {} ({} bytes) in chunk {}",
                    other,
                    len,
                    coord
                );
            }
        }
    }

    if reader.remaining() != 0 {
        log::debug!(
            "Chunk {} has {} trailing bytes after its records",
            coord,
            reader.remaining()
        );
    }

    Ok(ChunkData::from_parts(
        coord,
        dims,
        data,
        objects,
        flags & FLAG_EXPLORED != 0,
    ))
}

fn decode_object(record: &[u8]) -> Result<AttachedObject> {
    let mut reader = ByteReader::new(record);
    let id = reader.u64()?;
    let address = reader.u16()?;
    let kind_len = reader.u16()? as usize;
    let kind = std::str::from_utf8(reader.take(kind_len)?)
        .map_err(|e| Error::Codec(format!("object {} kind is not utf-8: {}", id, e)))?
        .to_string();
    let payload = reader.rest().to_vec();

    let mut object = AttachedObject::new(id, kind, payload);
    object.address = address;
    Ok(object)
}

/// Compress a serialized chunk using LZ4
pub fn compress_chunk(chunk: &ChunkData) -> Result<Vec<u8>> {
    Ok(lz4_flex::compress_prepend_size(&encode_chunk(chunk)?))
}

/// Decompress and deserialize a chunk
pub fn decompress_chunk(data: &[u8]) -> Result<ChunkData> {
    let decompressed = lz4_flex::decompress_size_prepended(data)
        .map_err(|e| Error::Codec(format!("LZ4 decompression failed: {}", e)))?;
    decode_chunk(&decompressed)
}

/// Bounds-checked little-endian cursor
struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| {
                Error::Codec(format!(
                    "truncated: wanted {} bytes at offset {}, have {}",
                    n,
                    self.pos,
                    self.buf.len() - self.pos
                ))
            })?;
        let buf = self.buf;
        let slice = &buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn rest(&mut self) -> &'a [u8] {
        let buf = self.buf;
        let slice = &buf[self.pos..];
        self.pos = buf.len();
        slice
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::chunk::layer;
    use proptest::prelude::*;

    fn populated_chunk() -> ChunkData {
        let mut chunk = ChunkData::with_dims(ChunkCoord::new(5, 0, -3), [8, layer::COUNT, 8]).unwrap();
        chunk.set_layer(1, 1, layer::SURFACE, 3);
        chunk.set_layer(2, 5, layer::OVERLAY, 7);
        chunk.mark_explored(1, 1);
        chunk
            .attach_object(4, 4, AttachedObject::new(11, "chest", vec![1, 2, 3]))
            .unwrap();
        chunk
            .attach_object(6, 0, AttachedObject::new(12, "tree", Vec::new()))
            .unwrap();
        chunk
    }

    #[test]
    fn test_roundtrip_empty_chunk() {
        let chunk = ChunkData::with_dims(ChunkCoord::new(0, 0, 0), [32, 32, 32]).unwrap();
        let bytes = encode_chunk(&chunk).unwrap();
        // Empty chunks do not carry their grid
        assert!(bytes.len() < 64);

        let decoded = decode_chunk(&bytes).expect("decode failed");
        assert_eq!(decoded, chunk);
        assert!(decoded.empty);
    }

    #[test]
    fn test_roundtrip_populated_chunk() {
        let chunk = populated_chunk();
        let decoded = decode_chunk(&encode_chunk(&chunk).unwrap()).expect("decode failed");
        assert_eq!(decoded, chunk);
        assert!(!decoded.empty);
        assert!(decoded.explored);
        assert_eq!(decoded.object_at(4, 4).map(|o| o.id), Some(11));
        assert_eq!(decoded.next_address(), 3);
    }

    #[test]
    fn test_compress_decompress_chunk() {
        let chunk = populated_chunk();
        let compressed = compress_chunk(&chunk).unwrap();
        let uncompressed = encode_chunk(&chunk).unwrap();
        assert!(compressed.len() <= uncompressed.len());

        let decoded = decompress_chunk(&compressed).expect("decompress failed");
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let chunk = populated_chunk();
        assert_eq!(compress_chunk(&chunk).unwrap(), compress_chunk(&chunk).unwrap());
    }

    #[test]
    fn test_unknown_record_is_skipped() {
        let chunk = populated_chunk();
        let mut bytes = encode_chunk(&chunk).unwrap();

        // Append a record with a future tag and bump the record count
        let count_offset = bytes.len()
            - chunk
                .objects()
                .iter()
                .map(|o| 1 + 4 + encode_object(o).unwrap().len())
                .sum::<usize>()
            - 4;
        let count = u32::from_le_bytes(bytes[count_offset..count_offset + 4].try_into().unwrap());
        bytes[count_offset..count_offset + 4].copy_from_slice(&(count + 2).to_le_bytes());
        bytes.push(42);
        bytes.extend_from_slice(&5u32.to_le_bytes());
        bytes.extend_from_slice(&[9, 9, 9, 9, 9]);
        // A known record after the unknown one must still decode
        let extra = AttachedObject {
            address: 9,
            ..AttachedObject::new(99, "late", vec![4])
        };
        let record = encode_object(&extra).unwrap();
        bytes.push(RECORD_OBJECT);
        bytes.extend_from_slice(&(record.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&record);

        let decoded = decode_chunk(&bytes).expect("decode failed");
        let ids: Vec<u64> = decoded.objects().iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![11, 12, 99]);
        assert_eq!(decoded.object(99).map(|o| o.payload.clone()), Some(vec![4]));
    }

    #[test]
    fn test_truncated_input_is_error() {
        let bytes = encode_chunk(&populated_chunk()).unwrap();
        for cut in [0, 3, 10, 30, bytes.len() - 1] {
            assert!(
                matches!(decode_chunk(&bytes[..cut]), Err(Error::Codec(_))),
                "cut at {} should fail",
                cut
            );
        }
    }

    #[test]
    fn test_bad_magic_and_version() {
        let mut bytes = encode_chunk(&populated_chunk()).unwrap();
        bytes[0] = b'X';
        assert!(decode_chunk(&bytes).is_err());

        let mut bytes = encode_chunk(&populated_chunk()).unwrap();
        bytes[4..6].copy_from_slice(&(CHUNK_FORMAT_VERSION + 1).to_le_bytes());
        assert!(decode_chunk(&bytes).is_err());
    }

    #[test]
    fn test_cleared_grid_encodes_as_empty() {
        let mut chunk = ChunkData::with_dims(ChunkCoord::new(0, 0, 0), [8, 8, 8]).unwrap();
        chunk.set(2, 2, 2, 9);
        chunk.set(2, 2, 2, 0);
        assert!(!chunk.empty);

        let pristine = ChunkData::with_dims(ChunkCoord::new(0, 0, 0), [8, 8, 8]).unwrap();
        let bytes = encode_chunk(&chunk).unwrap();
        assert_eq!(bytes, encode_chunk(&pristine).unwrap());
        assert!(decode_chunk(&bytes).unwrap().empty);
    }

    #[test]
    fn test_oversized_kind_is_rejected() {
        let mut chunk = ChunkData::with_dims(ChunkCoord::new(0, 0, 0), [4, 4, 4]).unwrap();
        chunk
            .attach_object(0, 0, AttachedObject::new(1, "crate", Vec::new()))
            .unwrap();
        chunk.objects_mut()[0].kind = "k".repeat(MAX_KIND_LEN + 1);
        assert!(matches!(encode_chunk(&chunk), Err(Error::Codec(_))));
        assert!(matches!(compress_chunk(&chunk), Err(Error::Codec(_))));

        chunk.objects_mut()[0].kind = "k".repeat(MAX_KIND_LEN);
        let decoded = decode_chunk(&encode_chunk(&chunk).unwrap()).unwrap();
        assert_eq!(decoded.objects()[0].kind.len(), MAX_KIND_LEN);
    }

    #[test]
    fn test_corrupt_lz4_is_error() {
        assert!(matches!(decompress_chunk(&[1, 2, 3]), Err(Error::Codec(_))));
    }

    proptest! {
        #[test]
        fn prop_chunk_roundtrip(
            cells in proptest::collection::vec((0i32..4, 0i32..6, 0i32..4, any::<u8>()), 0..32),
            objects in proptest::collection::vec(
                (any::<u64>(), "[a-z]{0,12}", proptest::collection::vec(any::<u8>(), 0..16)),
                0..6,
            ),
            x in -1000i32..1000,
            z in -1000i32..1000,
        ) {
            let mut chunk = ChunkData::with_dims(ChunkCoord::new(x, 0, z), [4, 6, 4]).unwrap();
            for (cx, cy, cz, v) in cells {
                chunk.set(cx, cy, cz, v);
            }
            for (i, (id, kind, payload)) in objects.into_iter().enumerate() {
                chunk.attach_object(i as i32 % 4, 0, AttachedObject::new(id, kind, payload)).unwrap();
            }

            let decoded = decompress_chunk(&compress_chunk(&chunk).unwrap()).unwrap();
            prop_assert_eq!(decoded.data(), chunk.data());
            prop_assert_eq!(decoded.empty, chunk.data().iter().all(|&b| b == 0));
            let ids: Vec<u64> = decoded.objects().iter().map(|o| o.id).collect();
            let expected: Vec<u64> = chunk.objects().iter().map(|o| o.id).collect();
            prop_assert_eq!(ids, expected);
        }
    }
}
