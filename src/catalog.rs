// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Tile catalog loaded from a GeoJSON index.
//!
//! The index is a `FeatureCollection`; each feature's `properties` carry the
//! tile number (`kaartbladNr`), the download `url`, the file `name` and the
//! expected byte size (`length`). Geometry is ignored.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Deserialize;

use crate::error::ConfigError;

/// One downloadable tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogItem {
    /// Unique key (the tile number)
    pub id: String,
    /// Remote location
    pub url: String,
    /// Exact size the downloaded file must have
    pub expected_size: u64,
    /// Human-readable name, also the basis of the local file name
    pub name: String,
}

impl CatalogItem {
    /// Local file name, stripped of any directory components.
    pub fn file_name(&self) -> String {
        sanitize_file_name(&self.name).unwrap_or_else(|| {
            let id = sanitize_file_name(&self.id).unwrap_or_else(|| "tile".to_string());
            format!("{id}.tif")
        })
    }

    /// Path of this item's artifact inside `download_dir`.
    pub fn local_path(&self, download_dir: &Path) -> PathBuf {
        download_dir.join(self.file_name())
    }
}

/// Keep only the final path component so a hostile name cannot escape the
/// download directory.
fn sanitize_file_name(name: &str) -> Option<String> {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    match base {
        "" | "." | ".." => None,
        other => Some(other.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    #[serde(default)]
    properties: Properties,
}

#[derive(Debug, Default, Deserialize)]
struct Properties {
    #[serde(rename = "kaartbladNr")]
    id: Option<Scalar>,
    url: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    length: Option<Scalar>,
}

/// Index files are inconsistent about quoting numbers.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Int(u64),
    Float(f64),
    Text(String),
}

impl Scalar {
    fn as_text(&self) -> String {
        match self {
            Scalar::Int(n) => n.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Text(s) => s.trim().to_string(),
        }
    }

    fn as_size(&self) -> Option<u64> {
        match self {
            Scalar::Int(n) => Some(*n),
            Scalar::Float(f) if *f >= 0.0 && f.fract() == 0.0 => Some(*f as u64),
            Scalar::Float(_) => None,
            Scalar::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// The full, read-only tile catalog in index-file order.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    items: IndexMap<String, CatalogItem>,
}

impl Catalog {
    /// Load and validate the index at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::CatalogMissing(path.to_path_buf()));
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::CatalogUnreadable {
            path: path.to_path_buf(),
            source,
        })?;

        let catalog = Self::from_geojson(&content).map_err(|reason| ConfigError::CatalogInvalid {
            path: path.to_path_buf(),
            reason,
        })?;

        tracing::info!(path = %path.display(), items = catalog.len(), "Loaded catalog");
        Ok(catalog)
    }

    /// Parse a GeoJSON `FeatureCollection`.
    pub fn from_geojson(content: &str) -> Result<Self, String> {
        let collection: FeatureCollection =
            serde_json::from_str(content).map_err(|e| e.to_string())?;

        let mut items = Vec::with_capacity(collection.features.len());
        for (index, feature) in collection.features.into_iter().enumerate() {
            let props = feature.properties;

            let id = props
                .id
                .map(|v| v.as_text())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| format!("feature {index} has no kaartbladNr"))?;
            let url = props
                .url
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| format!("feature {index} ({id}) has no url"))?;
            let expected_size = match props.length {
                Some(length) => length
                    .as_size()
                    .ok_or_else(|| format!("feature {index} ({id}) has an invalid length"))?,
                None => 0,
            };

            items.push(CatalogItem {
                id,
                url,
                expected_size,
                name: props.name.unwrap_or_default(),
            });
        }

        Ok(Self::from_items(items))
    }

    /// Build a catalog from already-parsed items. Later duplicates of an
    /// identifier are dropped. An item whose local file name is already
    /// taken by an earlier item is renamed to `<id>.tif` (or `<id>_<n>.tif`)
    /// so no two items ever share a file.
    pub fn from_items(items: impl IntoIterator<Item = CatalogItem>) -> Self {
        let mut map = IndexMap::new();
        let mut taken = HashSet::new();
        for mut item in items {
            if map.contains_key(&item.id) {
                tracing::warn!(id = %item.id, "Duplicate catalog entry ignored");
                continue;
            }

            if !taken.insert(item.file_name().to_lowercase()) {
                let stem = sanitize_file_name(&item.id).unwrap_or_else(|| "tile".to_string());
                let mut renamed = format!("{stem}.tif");
                let mut n = 1;
                while taken.contains(&renamed.to_lowercase()) {
                    renamed = format!("{stem}_{n}.tif");
                    n += 1;
                }
                tracing::warn!(
                    id = %item.id,
                    name = %item.name,
                    file = %renamed,
                    "File name already used by another catalog entry; renamed"
                );
                taken.insert(renamed.to_lowercase());
                item.name = renamed;
            }

            map.insert(item.id.clone(), item);
        }
        Self { items: map }
    }

    pub fn get(&self, id: &str) -> Option<&CatalogItem> {
        self.items.get(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items in index-file order.
    pub fn iter(&self) -> impl Iterator<Item = &CatalogItem> {
        self.items.values()
    }
}
