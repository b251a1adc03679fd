//! Identity of a fetchable artifact.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifies one artifact in the content-addressed network.
///
/// A key is a collection (contract) identifier plus an item (token) id.
/// Its canonical string form is `{collection}/{id}`, which is what shows up
/// in logs; two keys are equal exactly when both fields are equal, so the
/// derived `Hash` agrees with hashing the canonical string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetKey {
    pub collection: String,
    pub id: u64,
}

impl AssetKey {
    pub fn new(collection: impl Into<String>, id: u64) -> Self {
        Self {
            collection: collection.into(),
            id,
        }
    }

    /// Canonical string form.
    pub fn canonical(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Error parsing a canonical key string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid asset key '{0}': expected <collection>/<id>")]
pub struct AssetKeyParseError(String);

impl FromStr for AssetKey {
    type Err = AssetKeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Collections may contain '/', the id never does.
        let (collection, id) = s
            .rsplit_once('/')
            .ok_or_else(|| AssetKeyParseError(s.to_string()))?;
        if collection.is_empty() {
            return Err(AssetKeyParseError(s.to_string()));
        }
        let id = id
            .parse::<u64>()
            .map_err(|_| AssetKeyParseError(s.to_string()))?;
        Ok(Self::new(collection, id))
    }
}
