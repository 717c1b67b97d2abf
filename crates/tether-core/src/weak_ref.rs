//! # Weak References
//!
//! Serializable, path-based pointers to data-blocks living in another
//! archive ("asset library"). A weak reference does not keep its target
//! alive; it is resolved on demand by [`crate::asset_registry`].
//!
//! The relative identifier has the form `"<archive path>/<Group>/<Name>"`,
//! or `"<Group>/<Name>"` for data of the current session. The archive path
//! is relative to the library identifier (a root directory) when one is set.

use crate::primitives::MAX_WEAK_REFERENCE_LENGTH;
use crate::{BlockId, BlockKind, Database, TetherError};
use serde::{Deserialize, Serialize};
use std::path::Path;

// =============================================================================
// LIBRARY KIND
// =============================================================================

/// Which kind of asset library a weak reference points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LibraryKind {
    /// The current session's own data.
    Local = 0,
    /// Bundled essentials.
    Essentials = 1,
    /// A user-configured library.
    Custom = 2,
}

impl LibraryKind {
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Local),
            1 => Some(Self::Essentials),
            2 => Some(Self::Custom),
            _ => None,
        }
    }
}

// =============================================================================
// WEAK REFERENCE
// =============================================================================

/// A path-based pointer to a data-block in some library.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "WeakReferenceRecord", try_from = "WeakReferenceRecord")]
pub struct WeakReference {
    pub library_kind: LibraryKind,
    pub library_identifier: Option<String>,
    pub relative_identifier: String,
}

/// Wire form of [`WeakReference`]: the library kind is stored as a small integer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeakReferenceRecord {
    pub library_kind: u8,
    pub library_identifier: Option<String>,
    pub relative_identifier: String,
}

impl From<WeakReference> for WeakReferenceRecord {
    fn from(weak: WeakReference) -> Self {
        Self {
            library_kind: weak.library_kind.code(),
            library_identifier: weak.library_identifier,
            relative_identifier: weak.relative_identifier,
        }
    }
}

impl TryFrom<WeakReferenceRecord> for WeakReference {
    type Error = TetherError;

    fn try_from(record: WeakReferenceRecord) -> Result<Self, Self::Error> {
        let library_kind = LibraryKind::from_code(record.library_kind).ok_or_else(|| {
            TetherError::InvalidWeakReference(format!(
                "unknown library kind {}",
                record.library_kind
            ))
        })?;
        Ok(Self {
            library_kind,
            library_identifier: record.library_identifier,
            relative_identifier: record.relative_identifier,
        })
    }
}

/// The components of a resolved weak reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeakReferenceParts {
    /// Full archive path, or `None` for data of the current session.
    pub library_path: Option<String>,
    pub kind: BlockKind,
    pub name: String,
}

impl WeakReference {
    /// A reference to data of the current session.
    #[must_use]
    pub fn local(kind: BlockKind, name: &str) -> Self {
        Self {
            library_kind: LibraryKind::Local,
            library_identifier: None,
            relative_identifier: format!("{}/{}", kind.group_name(), name),
        }
    }

    /// A reference to `name` inside `archive`, relative to `root`.
    #[must_use]
    pub fn in_library(root: Option<&str>, archive: &str, kind: BlockKind, name: &str) -> Self {
        Self {
            library_kind: LibraryKind::Custom,
            library_identifier: root.map(str::to_string),
            relative_identifier: format!("{}/{}/{}", archive, kind.group_name(), name),
        }
    }

    /// Split into archive path, kind and name.
    pub fn split(&self) -> Result<WeakReferenceParts, TetherError> {
        if self.relative_identifier.len() > MAX_WEAK_REFERENCE_LENGTH {
            return Err(TetherError::InvalidWeakReference(
                "relative identifier too long".to_string(),
            ));
        }
        let mut parts = self.relative_identifier.rsplitn(3, '/');
        let name = parts.next().unwrap_or_default();
        let group = parts.next().ok_or_else(|| {
            TetherError::InvalidWeakReference(self.relative_identifier.clone())
        })?;
        let archive = parts.next().filter(|a| !a.is_empty());
        if name.is_empty() {
            return Err(TetherError::InvalidWeakReference(
                self.relative_identifier.clone(),
            ));
        }
        let kind = BlockKind::from_group_name(group).ok_or_else(|| {
            TetherError::InvalidWeakReference(format!("unknown group {group:?}"))
        })?;

        let library_path = match (self.library_kind, archive) {
            (LibraryKind::Local, _) | (_, None) => None,
            (_, Some(archive)) => Some(match self.library_identifier.as_deref() {
                Some(root) if !Path::new(archive).is_absolute() => {
                    format!("{}/{}", root.trim_end_matches('/'), archive)
                }
                _ => archive.to_string(),
            }),
        };

        Ok(WeakReferenceParts {
            library_path,
            kind,
            name: name.to_string(),
        })
    }
}

impl std::fmt::Display for WeakReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.library_identifier {
            Some(root) => write!(f, "{}:{}", root, self.relative_identifier),
            None => f.write_str(&self.relative_identifier),
        }
    }
}

/// Build a weak reference pointing at `id`.
///
/// Linked blocks get a reference into their library's archive; local blocks
/// get a local reference. Names containing `/` cannot be expressed.
pub fn make_reference(db: &Database, id: BlockId) -> Result<WeakReference, TetherError> {
    let block = db.require(id)?;
    if block.name.contains('/') {
        return Err(TetherError::InvalidWeakReference(format!(
            "name {:?} contains a path separator",
            block.name
        )));
    }
    let Some(library_path) = db.library_path_of(id) else {
        return Ok(WeakReference::local(block.kind, &block.name));
    };

    let path = Path::new(library_path);
    let archive = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| library_path.to_string());
    let root = path
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .filter(|p| !p.is_empty());
    Ok(WeakReference::in_library(
        root.as_deref(),
        &archive,
        block.kind,
        &block.name,
    ))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Scope;

    #[test]
    fn split_joins_root_and_archive() {
        let weak = WeakReference::in_library(
            Some("/assets/"),
            "props/chairs.tether",
            BlockKind::Object,
            "Chair",
        );
        let parts = weak.split().expect("split");
        assert_eq!(
            parts.library_path.as_deref(),
            Some("/assets/props/chairs.tether")
        );
        assert_eq!(parts.kind, BlockKind::Object);
        assert_eq!(parts.name, "Chair");
    }

    #[test]
    fn local_reference_has_no_library_path() {
        let parts = WeakReference::local(BlockKind::Material, "Steel")
            .split()
            .expect("split");
        assert_eq!(parts.library_path, None);
        assert_eq!(parts.kind, BlockKind::Material);
    }

    #[test]
    fn split_rejects_unknown_group() {
        let weak = WeakReference {
            library_kind: LibraryKind::Custom,
            library_identifier: None,
            relative_identifier: "lib.tether/Spaceship/X".to_string(),
        };
        assert!(matches!(
            weak.split(),
            Err(TetherError::InvalidWeakReference(_))
        ));
    }

    #[test]
    fn make_reference_for_linked_block() {
        let mut db = Database::new();
        let lib = db.ensure_library("/assets/materials.tether");
        let ma = db
            .create_block(BlockKind::Material, "Steel", Scope::Library(lib))
            .expect("create");

        let weak = make_reference(&db, ma).expect("reference");
        assert_eq!(weak.library_identifier.as_deref(), Some("/assets"));
        assert_eq!(weak.relative_identifier, "materials.tether/Material/Steel");
        assert_eq!(
            weak.split().expect("split").library_path.as_deref(),
            Some("/assets/materials.tether")
        );
    }

    #[test]
    fn make_reference_rejects_slash_in_name() {
        let mut db = Database::new();
        let ma = db
            .create_block(BlockKind::Material, "a/b", Scope::Local)
            .expect("create");
        assert!(make_reference(&db, ma).is_err());
    }

    #[test]
    fn library_kind_serializes_as_integer() {
        let weak = WeakReference::local(BlockKind::Mesh, "Cube");
        let bytes = postcard::to_stdvec(&weak).expect("serialize");
        assert_eq!(bytes.first(), Some(&0));
        let back: WeakReference = postcard::from_bytes(&bytes).expect("deserialize");
        assert_eq!(back, weak);
    }
}
