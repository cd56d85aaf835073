//! Chunk file format for compressed chunks
//!
//! A compressed chunk is written to a single file. The same file is moved to
//! cold storage when the chunk is tiered.
//!
//! Layout:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ HEADER (64 bytes)                       │
//! │   magic: [u8; 4] = "HCHK"               │
//! │   version: u16                          │
//! │   chunk_id: u32                         │
//! │   segment_count: u32                    │
//! │   range_start: i64                      │
//! │   range_end: i64                        │
//! │   compression: u8                       │
//! │   layout_len: u32                       │
//! │   reserved: [u8; 25]                    │
//! │   checksum: u32                         │
//! ├─────────────────────────────────────────┤
//! │ LAYOUT                                  │
//! │   layout: [u8; layout_len] (bincode)    │
//! │   layout_checksum: u32                  │
//! ├─────────────────────────────────────────┤
//! │ SEGMENTS (variable)                     │
//! │   For each segment:                     │
//! │     segment_size: u32                   │
//! │     segment_data: [u8; segment_size]    │
//! │     segment_checksum: u32               │
//! ├─────────────────────────────────────────┤
//! │ FOOTER                                  │
//! │   segment entries: Vec<[u8; 32]>        │
//! │   footer_size: u32                      │
//! │   footer_checksum: u32                  │
//! └─────────────────────────────────────────┘
//! ```

use crate::storage::compression::{CompressedChunk, CompressedSegment, CompressionLayout};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::TimeRange;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Magic bytes for chunk file identification
const CHUNK_MAGIC: [u8; 4] = *b"HCHK";

/// Current chunk file format version
const CHUNK_VERSION: u16 = 1;

/// Header size in bytes
const HEADER_SIZE: usize = 64;

/// Footer entry: offset(8) + size(4) + row_count(4) + min_ts(8) + max_ts(8)
const FOOTER_ENTRY_SIZE: usize = 32;

/// Compression applied to segment payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    Lz4 = 1,
}

impl TryFrom<u8> for CompressionType {
    type Error = StorageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Lz4),
            _ => Err(StorageError::InvalidChunkFile(format!(
                "Unknown compression type: {}",
                value
            ))),
        }
    }
}

/// Chunk file header
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkFileHeader {
    pub version: u16,
    pub chunk_id: u32,
    pub segment_count: u32,
    pub range: TimeRange,
    pub compression: CompressionType,
    pub layout_len: u32,
}

impl ChunkFileHeader {
    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];

        buf[0..4].copy_from_slice(&CHUNK_MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..10].copy_from_slice(&self.chunk_id.to_le_bytes());
        buf[10..14].copy_from_slice(&self.segment_count.to_le_bytes());
        buf[14..22].copy_from_slice(&self.range.start.to_le_bytes());
        buf[22..30].copy_from_slice(&self.range.end.to_le_bytes());
        buf[30] = self.compression as u8;
        buf[31..35].copy_from_slice(&self.layout_len.to_le_bytes());
        // bytes 35-59 reserved

        let checksum = crc32fast::hash(&buf[0..60]);
        buf[60..64].copy_from_slice(&checksum.to_le_bytes());

        buf
    }

    /// Parse header from bytes
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> StorageResult<Self> {
        let stored_checksum = read_u32(buf, 60);
        let computed_checksum = crc32fast::hash(&buf[0..60]);
        if stored_checksum != computed_checksum {
            return Err(StorageError::Corruption(format!(
                "Header checksum mismatch: stored={}, computed={}",
                stored_checksum, computed_checksum
            )));
        }

        if buf[0..4] != CHUNK_MAGIC {
            return Err(StorageError::InvalidChunkFile(format!(
                "Invalid magic: {:?}",
                &buf[0..4]
            )));
        }

        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version > CHUNK_VERSION {
            return Err(StorageError::InvalidChunkFile(format!(
                "Unsupported version: {}",
                version
            )));
        }

        let start = read_i64(buf, 14);
        let end = read_i64(buf, 22);
        let range = TimeRange::try_new(start, end).ok_or_else(|| {
            StorageError::InvalidChunkFile(format!("Empty chunk range [{}, {})", start, end))
        })?;

        Ok(Self {
            version,
            chunk_id: read_u32(buf, 6),
            segment_count: read_u32(buf, 10),
            range,
            compression: CompressionType::try_from(buf[30])?,
            layout_len: read_u32(buf, 31),
        })
    }
}

/// Location and bounds of one segment within a chunk file
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentEntry {
    /// Offset from start of file
    pub offset: u64,
    /// Size of the serialized segment
    pub size: u32,
    /// Rows in the segment
    pub row_count: u32,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
}

impl SegmentEntry {
    fn to_bytes(&self) -> [u8; FOOTER_ENTRY_SIZE] {
        let mut buf = [0u8; FOOTER_ENTRY_SIZE];
        buf[0..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..12].copy_from_slice(&self.size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.row_count.to_le_bytes());
        buf[16..24].copy_from_slice(&self.min_timestamp.to_le_bytes());
        buf[24..32].copy_from_slice(&self.max_timestamp.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        Self {
            offset: read_u64(buf, 0),
            size: read_u32(buf, 8),
            row_count: read_u32(buf, 12),
            min_timestamp: read_i64(buf, 16),
            max_timestamp: read_i64(buf, 24),
        }
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn read_i64(buf: &[u8], at: usize) -> i64 {
    read_u64(buf, at) as i64
}

/// Read `size` bytes followed by their CRC32
fn read_checked<R: Read>(reader: &mut R, size: usize, what: &str) -> StorageResult<Vec<u8>> {
    let mut data = vec![0u8; size];
    reader.read_exact(&mut data)?;

    let mut checksum_buf = [0u8; 4];
    reader.read_exact(&mut checksum_buf)?;
    let stored = u32::from_le_bytes(checksum_buf);
    let computed = crc32fast::hash(&data);
    if stored != computed {
        return Err(StorageError::Corruption(format!(
            "{} checksum mismatch: stored={}, computed={}",
            what, stored, computed
        )));
    }
    Ok(data)
}

/// Reading and writing of whole chunk files
pub struct ChunkFile;

impl ChunkFile {
    /// Write a compressed chunk, returning the file size in bytes
    ///
    /// The file is written beside its final path and renamed into place, so a
    /// reader never observes a partially written chunk.
    pub fn write(
        path: impl AsRef<Path>,
        chunk_id: u32,
        range: TimeRange,
        chunk: &CompressedChunk,
    ) -> StorageResult<u64> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let layout = bincode::serialize(&chunk.layout)?;
        let header = ChunkFileHeader {
            version: CHUNK_VERSION,
            chunk_id,
            segment_count: chunk.segments.len() as u32,
            range,
            compression: CompressionType::Lz4,
            layout_len: layout.len() as u32,
        };

        let tmp_path = path.with_extension("chk.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        writer.write_all(&header.to_bytes())?;
        writer.write_all(&layout)?;
        writer.write_all(&crc32fast::hash(&layout).to_le_bytes())?;

        let mut offset = (HEADER_SIZE + layout.len() + 4) as u64;
        let mut footer = Vec::with_capacity(chunk.segments.len() * FOOTER_ENTRY_SIZE);

        // Write segments: size (4) + data (N) + checksum (4)
        for segment in &chunk.segments {
            let data = bincode::serialize(segment)?;
            writer.write_all(&(data.len() as u32).to_le_bytes())?;
            writer.write_all(&data)?;
            writer.write_all(&crc32fast::hash(&data).to_le_bytes())?;

            let entry = SegmentEntry {
                offset,
                size: data.len() as u32,
                row_count: segment.row_count,
                min_timestamp: segment.time_index.min,
                max_timestamp: segment.time_index.max,
            };
            footer.extend_from_slice(&entry.to_bytes());
            offset += data.len() as u64 + 8;
        }

        writer.write_all(&footer)?;
        writer.write_all(&(footer.len() as u32).to_le_bytes())?;
        writer.write_all(&crc32fast::hash(&footer).to_le_bytes())?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        std::fs::rename(&tmp_path, path)?;
        Ok(offset + footer.len() as u64 + 8)
    }

    /// Read only the header and segment directory
    pub fn read_directory(
        path: impl AsRef<Path>,
    ) -> StorageResult<(ChunkFileHeader, Vec<SegmentEntry>)> {
        let mut file = BufReader::new(File::open(path.as_ref())?);
        let header = Self::read_header(&mut file)?;
        let entries = Self::read_footer(&mut file, &header)?;
        Ok((header, entries))
    }

    /// Read a complete compressed chunk
    pub fn read(path: impl AsRef<Path>) -> StorageResult<(ChunkFileHeader, CompressedChunk)> {
        let mut file = BufReader::new(File::open(path.as_ref())?);
        let header = Self::read_header(&mut file)?;

        let layout_bytes = read_checked(&mut file, header.layout_len as usize, "Layout")?;
        let layout: CompressionLayout = bincode::deserialize(&layout_bytes)?;

        let entries = Self::read_footer(&mut file, &header)?;
        let mut segments = Vec::with_capacity(entries.len());
        for (idx, entry) in entries.iter().enumerate() {
            file.seek(SeekFrom::Start(entry.offset))?;

            let mut size_buf = [0u8; 4];
            file.read_exact(&mut size_buf)?;
            let size = u32::from_le_bytes(size_buf);
            if size != entry.size {
                return Err(StorageError::Corruption(format!(
                    "Segment {} size mismatch: footer={}, block={}",
                    idx, entry.size, size
                )));
            }

            let data = read_checked(&mut file, size as usize, "Segment")?;
            let segment: CompressedSegment = bincode::deserialize(&data)?;
            segments.push(segment);
        }

        Ok((header, CompressedChunk { layout, segments }))
    }

    fn read_header(file: &mut BufReader<File>) -> StorageResult<ChunkFileHeader> {
        let mut header_buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_buf)?;
        ChunkFileHeader::from_bytes(&header_buf)
    }

    fn read_footer(
        file: &mut BufReader<File>,
        header: &ChunkFileHeader,
    ) -> StorageResult<Vec<SegmentEntry>> {
        let resume = file.stream_position()?;

        // Seek to end minus footer size indicator
        file.seek(SeekFrom::End(-8))?;
        let mut tail = [0u8; 8];
        file.read_exact(&mut tail)?;
        let footer_size = read_u32(&tail, 0) as usize;
        let stored_checksum = read_u32(&tail, 4);

        if footer_size != header.segment_count as usize * FOOTER_ENTRY_SIZE {
            return Err(StorageError::InvalidChunkFile(format!(
                "Footer holds {} bytes for {} segments",
                footer_size, header.segment_count
            )));
        }

        file.seek(SeekFrom::End(-(footer_size as i64) - 8))?;
        let mut footer = vec![0u8; footer_size];
        file.read_exact(&mut footer)?;
        if crc32fast::hash(&footer) != stored_checksum {
            return Err(StorageError::Corruption("Footer checksum mismatch".into()));
        }

        file.seek(SeekFrom::Start(resume))?;
        Ok(footer
            .chunks_exact(FOOTER_ENTRY_SIZE)
            .map(SegmentEntry::from_bytes)
            .collect())
    }

    /// Parse a chunk id from a `chunk_NNNNNN.chk` file name
    pub fn id_from_path(path: impl AsRef<Path>) -> Option<u32> {
        path.as_ref()
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix("chunk_"))
            .and_then(|s| s.parse().ok())
    }

    /// File name for a chunk id
    pub fn file_name(chunk_id: u32) -> String {
        format!("chunk_{:06}.chk", chunk_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::compression::compress_rows;
    use crate::storage::types::{Event, OrderBy};
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    fn sample_chunk() -> CompressedChunk {
        let rows: Vec<Event> = (0..300)
            .map(|i| {
                Event::new(1000 + i * 100)
                    .with_seq(i as u64 + 1)
                    .tag("equipment_id", if i % 3 == 0 { "PUMP_001" } else { "MOTOR_001" })
                    .field("temperature", 50.0 + (i % 17) as f64)
            })
            .collect();
        let layout = CompressionLayout {
            segment_by: vec!["equipment_id".into()],
            order_by: OrderBy::time_desc(),
            bloom_columns: vec![],
        };
        compress_rows(&rows, &layout).unwrap()
    }

    #[test]
    fn test_header_roundtrip() {
        let header = ChunkFileHeader {
            version: CHUNK_VERSION,
            chunk_id: 12,
            segment_count: 5,
            range: TimeRange::new(-86_400_000, 0),
            compression: CompressionType::Lz4,
            layout_len: 77,
        };

        let restored = ChunkFileHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(restored, header);
    }

    #[test]
    fn test_header_checksum_detects_damage() {
        let header = ChunkFileHeader {
            version: CHUNK_VERSION,
            chunk_id: 1,
            segment_count: 1,
            range: TimeRange::new(0, 10),
            compression: CompressionType::Lz4,
            layout_len: 0,
        };
        let mut bytes = header.to_bytes();
        bytes[15] ^= 0xFF;
        assert!(matches!(
            ChunkFileHeader::from_bytes(&bytes),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_chunk_file_write_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(ChunkFile::file_name(3));
        let chunk = sample_chunk();
        let range = TimeRange::new(0, 100_000);

        let size = ChunkFile::write(&path, 3, range, &chunk).unwrap();
        assert_eq!(size, std::fs::metadata(&path).unwrap().len());
        assert_eq!(ChunkFile::id_from_path(&path), Some(3));

        let (header, restored) = ChunkFile::read(&path).unwrap();
        assert_eq!(header.chunk_id, 3);
        assert_eq!(header.range, range);
        assert_eq!(restored.layout, chunk.layout);
        assert_eq!(restored.row_count(), 300);
        assert_eq!(
            restored.decompress_all().unwrap().len(),
            chunk.decompress_all().unwrap().len()
        );

        let (_, entries) = ChunkFile::read_directory(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries.iter().map(|e| e.row_count).sum::<u32>(), 300);
    }

    #[test]
    fn test_chunk_file_segment_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(ChunkFile::file_name(1));
        ChunkFile::write(&path, 1, TimeRange::new(0, 100_000), &sample_chunk()).unwrap();

        let (header, entries) = ChunkFile::read_directory(&path).unwrap();
        assert_eq!(header.segment_count, 2);
        {
            let mut file = OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(entries[0].offset + 20)).unwrap();
            file.write_all(&[0xAB, 0xCD, 0xEF]).unwrap();
        }

        assert!(matches!(
            ChunkFile::read(&path),
            Err(StorageError::Corruption(_))
        ));
    }
}
