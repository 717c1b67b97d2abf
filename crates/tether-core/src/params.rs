//! # Operation Parameters
//!
//! Flags and targets configuring one link/append operation.

use crate::BlockId;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Behaviour switches of an import context.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct LinkFlags: u32 {
        /// Link only: Appending is skipped.
        const LINK = 1 << 0;
        /// Tag directly requested blocks as indirect.
        const FORCE_INDIRECT = 1 << 1;
        /// Create placeholders for blocks missing from their archive.
        const USE_PLACEHOLDERS = 1 << 2;
        /// Make indirect dependencies from other libraries local too.
        const RECURSIVE = 1 << 3;
        /// Reuse unmodified local copies from earlier appends.
        const REUSE_LOCAL = 1 << 4;
        /// Drop override metadata from appended blocks.
        const CLEAR_OVERRIDES = 1 << 5;
        /// Mark linked data packed after Linking.
        const PACK = 1 << 6;
        /// Bulk enumeration only returns blocks with asset metadata.
        const ASSETS_ONLY = 1 << 7;
        /// Give appended blocks (other than objects and collections) a fake user.
        const SET_FAKE_USER = 1 << 8;
        /// Drop asset metadata from appended blocks.
        const CLEAR_ASSET_DATA = 1 << 9;
        /// Instantiate loose object-data through a new object.
        const OBDATA_INSTANCE = 1 << 10;
        /// Instantiate collections through a new empty object.
        const COLLECTION_INSTANCE = 1 << 11;
        /// Rename appended blocks whose local name is taken.
        const RENAME_ON_COLLISION = 1 << 12;
    }
}

impl Default for LinkFlags {
    fn default() -> Self {
        LinkFlags::RENAME_ON_COLLISION
    }
}

impl LinkFlags {
    /// Flag names accepted by [`LinkFlags::from_config_name`], in bit order.
    pub const NAMES: [(&'static str, LinkFlags); 13] = [
        ("link", LinkFlags::LINK),
        ("force_indirect", LinkFlags::FORCE_INDIRECT),
        ("use_placeholders", LinkFlags::USE_PLACEHOLDERS),
        ("recursive", LinkFlags::RECURSIVE),
        ("reuse_local", LinkFlags::REUSE_LOCAL),
        ("clear_overrides", LinkFlags::CLEAR_OVERRIDES),
        ("pack", LinkFlags::PACK),
        ("assets_only", LinkFlags::ASSETS_ONLY),
        ("set_fake_user", LinkFlags::SET_FAKE_USER),
        ("clear_asset_data", LinkFlags::CLEAR_ASSET_DATA),
        ("obdata_instance", LinkFlags::OBDATA_INSTANCE),
        ("collection_instance", LinkFlags::COLLECTION_INSTANCE),
        ("rename_on_collision", LinkFlags::RENAME_ON_COLLISION),
    ];

    /// Look up a single flag by its snake_case name.
    #[must_use]
    pub fn from_config_name(name: &str) -> Option<LinkFlags> {
        Self::NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, flag)| *flag)
    }
}

/// Where the Instantiating stage places content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstantiateTarget {
    pub scene: BlockId,
    /// Collection receiving new placements. When `None`, a collection named
    /// after the operation is created under the scene's master collection.
    pub active_collection: Option<BlockId>,
}

/// Configuration of one operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkParams {
    pub flags: LinkFlags,
    pub instantiate: Option<InstantiateTarget>,
}

impl LinkParams {
    #[must_use]
    pub fn new(flags: LinkFlags) -> Self {
        Self {
            flags,
            instantiate: None,
        }
    }

    /// Builder: place content into `scene`.
    #[must_use]
    pub fn with_scene(mut self, scene: BlockId, active_collection: Option<BlockId>) -> Self {
        self.instantiate = Some(InstantiateTarget {
            scene,
            active_collection,
        });
        self
    }

    #[must_use]
    pub fn is_link(&self) -> bool {
        self.flags.contains(LinkFlags::LINK)
    }
}
