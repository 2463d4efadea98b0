/*
 * Copyright 2025 Vijaykumar Singh
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Binary layout primitives
//!
//! ```text
//! +--------------------------------------------------------------+
//! | magic "MMDB" | version | sample rate | joints | frames | flags |
//! | section count | section table: (offset, length, count) x 12   |
//! +--------------------------------------------------------------+
//! | fixed-size record tables, one per section, little endian      |
//! | arena: strings, payloads, tag lists, metric and codebook data |
//! +--------------------------------------------------------------+
//! | CRC32 of everything above                                     |
//! +--------------------------------------------------------------+
//! ```
//!
//! All offsets are absolute positions in the blob except [`ArenaRef`]s, which are
//! relative to the start of the arena section.

use crate::core::error::DataIntegrityError;
use crate::core::types::EndOfSegmentPolicy;

pub const MAGIC: [u8; 4] = *b"MMDB";
pub const FORMAT_VERSION: u32 = 1;
pub const CHECKSUM_SIZE: usize = 4;
const SECTION_ENTRY_SIZE: usize = 12;
const FIXED_HEADER_SIZE: usize = 28;
pub const HEADER_SIZE: usize = FIXED_HEADER_SIZE + Section::COUNT * SECTION_ENTRY_SIZE;

type Result<T> = std::result::Result<T, DataIntegrityError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Joints,
    Segments,
    Intervals,
    Types,
    Traits,
    Tags,
    Markers,
    TagLists,
    Metrics,
    CodeBooks,
    Transforms,
    Arena,
}

impl Section {
    pub const COUNT: usize = 12;

    pub const ALL: [Section; Section::COUNT] = [
        Section::Joints,
        Section::Segments,
        Section::Intervals,
        Section::Types,
        Section::Traits,
        Section::Tags,
        Section::Markers,
        Section::TagLists,
        Section::Metrics,
        Section::CodeBooks,
        Section::Transforms,
        Section::Arena,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Section::Joints => "joints",
            Section::Segments => "segments",
            Section::Intervals => "intervals",
            Section::Types => "types",
            Section::Traits => "traits",
            Section::Tags => "tags",
            Section::Markers => "markers",
            Section::TagLists => "tag_lists",
            Section::Metrics => "metrics",
            Section::CodeBooks => "codebooks",
            Section::Transforms => "transforms",
            Section::Arena => "arena",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Position of one section in the blob.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionEntry {
    pub offset: u32,
    pub length: u32,
    pub count: u32,
}

impl SectionEntry {
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset as usize..self.offset as usize + self.length as usize
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub version: u32,
    pub sample_rate: f32,
    pub num_joints: u32,
    pub num_frames: u32,
    pub extraction_policy: EndOfSegmentPolicy,
    pub sections: [SectionEntry; Section::COUNT],
}

impl Header {
    pub fn section(&self, section: Section) -> &SectionEntry {
        &self.sections[section.index()]
    }

    pub fn write(&self, out: &mut ByteWriter) {
        out.put_bytes(&MAGIC);
        out.put_u32(self.version);
        out.put_f32(self.sample_rate);
        out.put_u32(self.num_joints);
        out.put_u32(self.num_frames);
        out.put_u32(match self.extraction_policy {
            EndOfSegmentPolicy::Saturate => 0,
            EndOfSegmentPolicy::FollowLink => 1,
        });
        out.put_u32(Section::COUNT as u32);
        for entry in &self.sections {
            out.put_u32(entry.offset);
            out.put_u32(entry.length);
            out.put_u32(entry.count);
        }
    }

    pub fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        let magic = reader.take(4)?;
        if magic != MAGIC {
            let mut found = [0u8; 4];
            found.copy_from_slice(magic);
            return Err(DataIntegrityError::BadMagic(found));
        }
        let version = reader.u32()?;
        if version != FORMAT_VERSION {
            return Err(DataIntegrityError::UnsupportedVersion {
                found: version,
                expected: FORMAT_VERSION,
            });
        }
        let sample_rate = reader.f32()?;
        let num_joints = reader.u32()?;
        let num_frames = reader.u32()?;
        let extraction_policy = match reader.u32()? {
            0 => EndOfSegmentPolicy::Saturate,
            1 => EndOfSegmentPolicy::FollowLink,
            other => {
                return Err(DataIntegrityError::Payload(format!(
                    "unknown end-of-segment policy {}",
                    other
                )))
            }
        };
        let section_count = reader.u32()? as usize;
        if section_count != Section::COUNT {
            return Err(DataIntegrityError::Payload(format!(
                "expected {} sections, found {}",
                Section::COUNT,
                section_count
            )));
        }
        let mut sections = [SectionEntry::default(); Section::COUNT];
        for entry in sections.iter_mut() {
            entry.offset = reader.u32()?;
            entry.length = reader.u32()?;
            entry.count = reader.u32()?;
        }
        Ok(Self {
            version,
            sample_rate,
            num_joints,
            num_frames,
            extraction_policy,
            sections,
        })
    }
}

/// `(offset, length)` in bytes, relative to the arena section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ArenaRef {
    pub offset: u32,
    pub length: u32,
}

impl ArenaRef {
    pub fn resolve<'a>(&self, arena: &'a [u8], what: &'static str) -> Result<&'a [u8]> {
        let start = self.offset as usize;
        start
            .checked_add(self.length as usize)
            .and_then(|end| arena.get(start..end))
            .ok_or(DataIntegrityError::InvalidReference {
                what,
                index: self.offset as i64,
            })
    }

    pub fn resolve_str<'a>(&self, arena: &'a [u8], what: &'static str) -> Result<&'a str> {
        std::str::from_utf8(self.resolve(arena, what)?)
            .map_err(|e| DataIntegrityError::Payload(format!("{} is not UTF-8: {}", what, e)))
    }

    pub fn resolve_f32s(&self, arena: &[u8], what: &'static str) -> Result<Vec<f32>> {
        let bytes = self.resolve(arena, what)?;
        if bytes.len() % 4 != 0 {
            return Err(DataIntegrityError::Payload(format!(
                "{} length {} is not a multiple of 4",
                what,
                bytes.len()
            )));
        }
        Ok(bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    pub fn resolve_i32s(&self, arena: &[u8], what: &'static str) -> Result<Vec<i32>> {
        let bytes = self.resolve(arena, what)?;
        if bytes.len() % 4 != 0 {
            return Err(DataIntegrityError::Payload(format!(
                "{} length {} is not a multiple of 4",
                what,
                bytes.len()
            )));
        }
        Ok(bytes
            .chunks_exact(4)
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }
}

/// Fixed-size little-endian table entry.
pub trait Record: Sized {
    const SIZE: usize;

    fn write(&self, out: &mut ByteWriter);

    fn read(reader: &mut ByteReader<'_>) -> Result<Self>;
}

#[derive(Debug, Default, Clone)]
pub struct ByteWriter {
    buffer: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_f32(&mut self, value: f32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn put_arena_ref(&mut self, reference: ArenaRef) {
        self.put_u32(reference.offset);
        self.put_u32(reference.length);
    }

    pub fn pad_to(&mut self, alignment: usize) {
        while self.buffer.len() % alignment != 0 {
            self.buffer.push(0);
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }
}

/// Bounds-checked cursor over a byte slice.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.position)
    }

    pub fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        let end = self
            .position
            .checked_add(count)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(DataIntegrityError::Truncated {
                needed: self.position.saturating_add(count),
                available: self.bytes.len(),
            })?;
        let slice = &self.bytes[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn array4(&mut self) -> Result<[u8; 4]> {
        let bytes = self.take(4)?;
        Ok([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.array4().map(u32::from_le_bytes)
    }

    pub fn i32(&mut self) -> Result<i32> {
        self.array4().map(i32::from_le_bytes)
    }

    pub fn f32(&mut self) -> Result<f32> {
        self.array4().map(f32::from_le_bytes)
    }

    pub fn arena_ref(&mut self) -> Result<ArenaRef> {
        Ok(ArenaRef {
            offset: self.u32()?,
            length: self.u32()?,
        })
    }
}

/// Append-only arena used while writing a blob.
#[derive(Debug, Default)]
pub struct ArenaWriter {
    writer: ByteWriter,
}

impl ArenaWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> ArenaRef {
        self.writer.pad_to(4);
        let reference = ArenaRef {
            offset: self.writer.len() as u32,
            length: bytes.len() as u32,
        };
        self.writer.put_bytes(bytes);
        reference
    }

    pub fn push_str(&mut self, value: &str) -> ArenaRef {
        self.push_bytes(value.as_bytes())
    }

    pub fn push_f32s(&mut self, values: &[f32]) -> ArenaRef {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.push_bytes(&bytes)
    }

    pub fn push_i32s(&mut self, values: &[i32]) -> ArenaRef {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.push_bytes(&bytes)
    }

    pub fn into_inner(mut self) -> Vec<u8> {
        self.writer.pad_to(4);
        self.writer.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let mut sections = [SectionEntry::default(); Section::COUNT];
        sections[Section::Arena.index()] = SectionEntry { offset: 200, length: 16, count: 16 };
        let header = Header {
            version: FORMAT_VERSION,
            sample_rate: 30.0,
            num_joints: 4,
            num_frames: 90,
            extraction_policy: EndOfSegmentPolicy::FollowLink,
            sections,
        };

        let mut writer = ByteWriter::new();
        header.write(&mut writer);
        assert_eq!(writer.len(), HEADER_SIZE);

        let decoded = Header::read(&mut ByteReader::new(writer.as_slice())).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_reader_bounds() {
        let mut reader = ByteReader::new(&[1, 0, 0, 0, 2]);
        assert_eq!(reader.u32().unwrap(), 1);
        assert!(matches!(
            reader.u32(),
            Err(DataIntegrityError::Truncated { needed: 8, available: 5 })
        ));
    }

    #[test]
    fn test_arena_refs() {
        let mut arena = ArenaWriter::new();
        let name = arena.push_str("walk");
        let floats = arena.push_f32s(&[1.5, -2.0]);
        assert_eq!(floats.offset % 4, 0);
        let bytes = arena.into_inner();

        assert_eq!(name.resolve_str(&bytes, "name").unwrap(), "walk");
        assert_eq!(floats.resolve_f32s(&bytes, "floats").unwrap(), vec![1.5, -2.0]);

        let dangling = ArenaRef { offset: 60, length: 8 };
        assert!(dangling.resolve(&bytes, "dangling").is_err());
    }
}
