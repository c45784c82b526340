// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Decoding of the mounted credentials file.
//!
//! The file is a JSON document holding one entry per output, either as a bare
//! array or wrapped in `{"secrets": [...]}`. Entries are keyed by
//! `(environment, type)` and that pair must be unique.

use crate::error::DecodeError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;
use tracing::warn;

/// Credential fields for one output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SecretData {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretEntry {
    pub label: Option<String>,
    pub data: SecretData,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(rename = "type")]
    target_type: String,
    #[serde(alias = "enviroment")]
    environment: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    data: SecretData,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawDocument {
    Bare(Vec<RawEntry>),
    Wrapped { secrets: Vec<RawEntry> },
}

/// Decoded credentials keyed by `(environment, target type)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretBundle {
    entries: BTreeMap<(String, String), SecretEntry>,
}

impl SecretBundle {
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }

        let entries = match serde_json::from_slice::<RawDocument>(raw)? {
            RawDocument::Bare(entries) | RawDocument::Wrapped { secrets: entries } => entries,
        };

        let mut bundle = Self::default();
        for entry in entries {
            let key = (entry.environment, entry.target_type);
            if bundle.entries.contains_key(&key) {
                return Err(DecodeError::DuplicateSecret {
                    environment: key.0,
                    target_type: key.1,
                });
            }
            bundle.entries.insert(
                key,
                SecretEntry {
                    label: entry.label,
                    data: entry.data,
                },
            );
        }
        Ok(bundle)
    }

    /// Reads and decodes the secret file. A missing file yields an empty bundle.
    pub async fn load(path: &Path) -> Result<Self, DecodeError> {
        match tokio::fs::read(path).await {
            Ok(raw) => Self::decode(&raw),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(
                    "secret file {} not found, rendering without credentials",
                    path.display()
                );
                Ok(Self::default())
            }
            Err(e) => Err(DecodeError::Io(e)),
        }
    }

    pub fn lookup(&self, environment: &str, target_type: &str) -> Option<&SecretEntry> {
        self.entries
            .get(&(environment.to_string(), target_type.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
