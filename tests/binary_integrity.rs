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

//! Load-time validation of motion database blobs

mod common;

use tempfile::TempDir;

use motiondb::core::error::DataIntegrityError;
use motiondb::core::registry::{Anchor, Locomotion};
use motiondb::core::types::{MarkerIndex, SamplingTime, TraitIndex};
use motiondb::storage::{FORMAT_VERSION, MAGIC};
use motiondb::Binary;

#[test]
fn test_round_trip_through_file() {
    let binary = common::build_binary();
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("locomotion.mmdb");

    binary.save(&path).unwrap();
    let mapped = Binary::open(&path).unwrap();

    assert_eq!(mapped.as_bytes(), binary.as_bytes());
    assert_eq!(mapped.num_codebooks(), binary.num_codebooks());
    assert_eq!(mapped.metrics(), binary.metrics());
    let walk = mapped.find_segment("walk");
    let time = SamplingTime::at_frame(walk, 12);
    assert_eq!(mapped.sample_pose(time).unwrap(), binary.sample_pose(time).unwrap());
}

#[test]
fn test_missing_file_is_io_error() {
    let temp_dir = TempDir::new().unwrap();
    assert!(matches!(
        Binary::open(temp_dir.path().join("missing.mmdb")),
        Err(DataIntegrityError::Io(_))
    ));
}

#[test]
fn test_truncated_blob_rejected() {
    let bytes = common::build_binary().as_bytes().to_vec();

    assert!(matches!(
        Binary::from_bytes(bytes[..64].to_vec()),
        Err(DataIntegrityError::Truncated { .. })
    ));
    assert!(Binary::from_bytes(bytes[..bytes.len() - 9].to_vec()).is_err());
    assert!(Binary::from_bytes(Vec::new()).is_err());
}

#[test]
fn test_bad_magic_rejected() {
    let mut bytes = common::build_binary().as_bytes().to_vec();
    assert_eq!(&bytes[..4], &MAGIC);
    bytes[0] = b'X';
    assert!(matches!(Binary::from_bytes(bytes), Err(DataIntegrityError::BadMagic(_))));
}

#[test]
fn test_wrong_version_rejected() {
    let mut bytes = common::build_binary().as_bytes().to_vec();
    bytes[4..8].copy_from_slice(&(FORMAT_VERSION + 1).to_le_bytes());
    assert!(matches!(
        Binary::from_bytes(bytes),
        Err(DataIntegrityError::UnsupportedVersion { .. })
    ));
}

#[test]
fn test_flipped_byte_fails_checksum() {
    let mut bytes = common::build_binary().as_bytes().to_vec();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x40;
    assert!(matches!(
        Binary::from_bytes(bytes),
        Err(DataIntegrityError::ChecksumMismatch { .. })
    ));
}

#[test]
fn test_typed_payload_access() {
    let binary = common::build_binary();

    let locomotion = binary.find_type::<Locomotion>();
    assert!(locomotion.is_valid());
    assert!(!binary.find_type::<Anchor>().is_valid());

    let first = (0..binary.num_traits())
        .map(TraitIndex::new)
        .find(|&index| binary.trait_record(index).map(|t| t.type_index) == Some(locomotion))
        .unwrap();
    assert_eq!(binary.trait_payload::<Locomotion>(first), Some(Locomotion {}));
    assert_eq!(binary.trait_payload::<Anchor>(first), None);

    assert_eq!(binary.find_marker(binary.find_segment("walk"), locomotion), MarkerIndex::INVALID);
    assert!(binary.trait_record(TraitIndex(-1)).is_none());
    assert!(binary.segment(motiondb::core::types::SegmentIndex(99)).is_none());
}
