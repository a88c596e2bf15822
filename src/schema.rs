/// Minimal schema collaborator.
///
/// Only the parts the reactive layer needs: a normalized form, the schema
/// version, a stable content hash (used to detect a conflicting redefinition
/// of an existing collection), and the primary key field. Validation and
/// migration are handled elsewhere.
use crate::error::{ReactiveError, ReactiveResult};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

/// Primary key used when the schema does not name one.
pub const DEFAULT_PRIMARY_KEY: &str = "id";

/// A normalized collection schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    normalized: JsonValue,
    version: u32,
    hash: String,
    primary_key: String,
}

impl Schema {
    /// Normalize a JSON schema definition.
    ///
    /// The definition must be a JSON object. `version` defaults to 0 and must
    /// be a non-negative integer; `primaryKey` defaults to `"id"`.
    pub fn create(definition: &JsonValue) -> ReactiveResult<Self> {
        let JsonValue::Object(map) = definition else {
            return Err(ReactiveError::InvalidSchema {
                reason: "schema must be a JSON object".to_string(),
            });
        };

        let version = match map.get("version") {
            None => 0,
            Some(v) => v
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| ReactiveError::InvalidSchema {
                    reason: format!("version must be a non-negative integer, got {}", v),
                })?,
        };

        let primary_key = match map.get("primaryKey") {
            None => DEFAULT_PRIMARY_KEY.to_string(),
            Some(JsonValue::String(key)) if !key.is_empty() => key.clone(),
            Some(other) => {
                return Err(ReactiveError::InvalidSchema {
                    reason: format!("primaryKey must be a non-empty string, got {}", other),
                });
            }
        };

        // serde_json objects keep keys sorted, so the string form is canonical.
        let normalized = definition.clone();
        let hash = hex::encode(Sha256::digest(normalized.to_string().as_bytes()));

        Ok(Self {
            normalized,
            version,
            hash,
            primary_key,
        })
    }

    pub fn normalized(&self) -> &JsonValue {
        &self.normalized
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Stable content hash of the normalized schema.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    /// Extract the primary key value of a document body.
    pub fn primary_of(&self, data: &JsonValue) -> Option<String> {
        match data.get(&self.primary_key)? {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}
