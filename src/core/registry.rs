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

//! Trait type registry
//!
//! Tags and markers carry typed payloads. A payload type is any serde type that
//! implements [`TraitType`]; registering it records a stable type tag (name plus
//! CRC32 of the name) and a small handler table used to convert authoring JSON into
//! the bincode bytes stored in the binary, and to describe stored payloads.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

use crate::core::error::BuildError;

/// A payload type that can be attached to tags and markers.
pub trait TraitType: Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static {
    /// Stable name stored in the binary's type table
    const TYPE_NAME: &'static str;

    fn type_hash() -> u32 {
        type_hash(Self::TYPE_NAME)
    }
}

pub fn type_hash(name: &str) -> u32 {
    crc32fast::hash(name.as_bytes())
}

/// Encoded trait: a registered type name plus its bincode payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraitValue {
    pub type_name: String,
    pub payload: Vec<u8>,
}

/// Handler table for one registered type.
#[derive(Clone, Copy)]
pub struct TypeHandler {
    pub name: &'static str,
    pub hash: u32,
    encode_json: fn(&serde_json::Value) -> Result<Vec<u8>, String>,
    describe: fn(&[u8]) -> Result<String, String>,
}

impl fmt::Debug for TypeHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeHandler")
            .field("name", &self.name)
            .field("hash", &format_args!("{:#010x}", self.hash))
            .finish()
    }
}

fn encode_json_payload<T: TraitType>(value: &serde_json::Value) -> Result<Vec<u8>, String> {
    let typed: T = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
    bincode::serialize(&typed).map_err(|e| e.to_string())
}

fn describe_payload<T: TraitType>(bytes: &[u8]) -> Result<String, String> {
    let typed: T = bincode::deserialize(bytes).map_err(|e| e.to_string())?;
    Ok(format!("{:?}", typed))
}

/// Explicit table of trait types known to a build or an inspection tool.
#[derive(Debug, Default, Clone)]
pub struct TypeRegistry {
    handlers: Vec<TypeHandler>,
    by_name: HashMap<&'static str, usize>,
    by_hash: HashMap<u32, usize>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with [`Locomotion`], [`Idle`] and [`Anchor`].
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register::<Locomotion>()
            .register::<Idle>()
            .register::<Anchor>();
        registry
    }

    /// Registers `T`. Registering the same type twice is a no-op; a different
    /// type whose name hashes to an existing entry is ignored with a warning.
    pub fn register<T: TraitType>(&mut self) -> &mut Self {
        let hash = T::type_hash();
        if let Some(&existing) = self.by_hash.get(&hash) {
            if self.handlers[existing].name != T::TYPE_NAME {
                warn!(
                    "Type '{}' collides with '{}' (hash {:#010x}), not registered",
                    T::TYPE_NAME,
                    self.handlers[existing].name,
                    hash
                );
            }
            return self;
        }

        debug!("Registering trait type '{}' ({:#010x})", T::TYPE_NAME, hash);
        let index = self.handlers.len();
        self.handlers.push(TypeHandler {
            name: T::TYPE_NAME,
            hash,
            encode_json: encode_json_payload::<T>,
            describe: describe_payload::<T>,
        });
        self.by_name.insert(T::TYPE_NAME, index);
        self.by_hash.insert(hash, index);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn handler(&self, name: &str) -> Option<&TypeHandler> {
        self.by_name.get(name).map(|&i| &self.handlers[i])
    }

    pub fn handler_by_hash(&self, hash: u32) -> Option<&TypeHandler> {
        self.by_hash.get(&hash).map(|&i| &self.handlers[i])
    }

    pub fn encode<T: TraitType>(&self, value: &T) -> Result<TraitValue, BuildError> {
        if self.handler(T::TYPE_NAME).is_none() {
            return Err(BuildError::UnknownTraitType(T::TYPE_NAME.to_string()));
        }
        let payload = bincode::serialize(value).map_err(|e| BuildError::InvalidPayload {
            type_name: T::TYPE_NAME.to_string(),
            reason: e.to_string(),
        })?;
        Ok(TraitValue {
            type_name: T::TYPE_NAME.to_string(),
            payload,
        })
    }

    /// Converts an authoring-time JSON payload through the registered handler.
    pub fn encode_json(
        &self,
        type_name: &str,
        value: &serde_json::Value,
    ) -> Result<TraitValue, BuildError> {
        let handler = self
            .handler(type_name)
            .ok_or_else(|| BuildError::UnknownTraitType(type_name.to_string()))?;
        let payload = (handler.encode_json)(value).map_err(|reason| BuildError::InvalidPayload {
            type_name: type_name.to_string(),
            reason,
        })?;
        Ok(TraitValue {
            type_name: handler.name.to_string(),
            payload,
        })
    }

    /// Debug rendering of a stored payload, `None` when the type is unknown here.
    pub fn describe(&self, hash: u32, payload: &[u8]) -> Option<String> {
        let handler = self.handler_by_hash(hash)?;
        Some((handler.describe)(payload).unwrap_or_else(|e| format!("<undecodable: {}>", e)))
    }
}

/// Marks clips usable for locomotion matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Locomotion {}

impl TraitType for Locomotion {
    const TYPE_NAME: &'static str = "Locomotion";
}

/// Marks standing-still ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Idle {}

impl TraitType for Idle {
    const TYPE_NAME: &'static str = "Idle";
}

/// Contact anchor in character space, typically attached as a marker.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Anchor {
    pub translation: [f32; 3],
    /// Quaternion as `[x, y, z, w]`
    pub rotation: [f32; 4],
}

impl TraitType for Anchor {
    const TYPE_NAME: &'static str = "Anchor";
}
