use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ledger::{RegionId, WorldId};

/// What a placed item belongs to.
///
/// Stored by id only; the owner itself lives in its own map and is looked
/// up through it when needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Owner {
    Region(RegionId),
    World(WorldId),
}

impl Owner {
    pub fn region(&self) -> Option<RegionId> {
        match self {
            Owner::Region(id) => Some(*id),
            Owner::World(_) => None,
        }
    }

    /// Whether placements must fit inside the owner's boundary.
    pub fn is_bounded(&self) -> bool {
        matches!(self, Owner::Region(_))
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Region(id) => write!(f, "region-{}", id),
            Owner::World(id) => write!(f, "{}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_lookups() {
        let region = Owner::Region(RegionId(3));
        let world = Owner::World(WorldId(1));
        assert_eq!(region.region(), Some(RegionId(3)));
        assert_eq!(world.region(), None);
        assert!(region.is_bounded());
        assert!(!world.is_bounded());
        assert_eq!(region.to_string(), "region-3");
        assert_eq!(world.to_string(), "world-1");
    }
}
