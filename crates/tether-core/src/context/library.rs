//! # Library Descriptors
//!
//! One source archive registered with a context: its path, its handle and
//! what happened while reading it.
//!
//! A handle is either owned by the descriptor (opened lazily through the
//! codec, closed when the descriptor is dropped) or borrowed from the
//! caller, who keeps it open and closes it.

use crate::archive::{ArchiveCodec, ArchiveReader, BlockListing, RawBlock};
use crate::{BlockKind, KindFilter, TetherError};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, trace};

// =============================================================================
// ARCHIVE HANDLE
// =============================================================================

/// An open archive and who owns it.
#[derive(Debug)]
pub enum ArchiveHandle {
    /// Closed by the descriptor.
    Owned(Box<dyn ArchiveReader>),
    /// Shared with the caller, who stays responsible for closing it.
    Borrowed(Rc<RefCell<dyn ArchiveReader>>),
}

impl ArchiveHandle {
    fn with_reader<R>(
        &mut self,
        f: impl FnOnce(&mut dyn ArchiveReader) -> Result<R, TetherError>,
    ) -> Result<R, TetherError> {
        match self {
            ArchiveHandle::Owned(reader) => f(reader.as_mut()),
            ArchiveHandle::Borrowed(shared) => {
                let mut reader = shared
                    .try_borrow_mut()
                    .map_err(|e| TetherError::IoError(format!("archive handle busy: {e}")))?;
                f(&mut *reader)
            }
        }
    }

    #[must_use]
    pub fn is_borrowed(&self) -> bool {
        matches!(self, ArchiveHandle::Borrowed(_))
    }
}

// =============================================================================
// DIAGNOSTICS
// =============================================================================

/// What happened while reading one library.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadDiagnostics {
    pub blocks_read: u32,
    pub blocks_absent: u32,
    /// Reason the archive could not be opened, if it could not.
    pub open_error: Option<String>,
}

// =============================================================================
// DESCRIPTOR
// =============================================================================

#[derive(Debug)]
pub struct LibraryDescriptor {
    path: String,
    handle: Option<ArchiveHandle>,
    diagnostics: ReadDiagnostics,
    indirect: bool,
    /// Index of the library whose data pulled this one in.
    parent: Option<usize>,
}

impl LibraryDescriptor {
    pub(crate) fn new(path: &str, handle: Option<ArchiveHandle>) -> Self {
        Self {
            path: path.to_string(),
            handle,
            diagnostics: ReadDiagnostics::default(),
            indirect: false,
            parent: None,
        }
    }

    pub(crate) fn new_indirect(path: &str, parent: usize) -> Self {
        let mut descriptor = Self::new(path, None);
        descriptor.indirect = true;
        descriptor.parent = Some(parent);
        descriptor
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Registered internally because another library references it.
    pub fn is_indirect(&self) -> bool {
        self.indirect
    }

    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    pub fn diagnostics(&self) -> &ReadDiagnostics {
        &self.diagnostics
    }

    /// Open the archive if needed. A failed open is remembered and not retried.
    pub(crate) fn open(&mut self, codec: &dyn ArchiveCodec) -> Result<(), TetherError> {
        if self.handle.is_some() {
            return Ok(());
        }
        if let Some(reason) = &self.diagnostics.open_error {
            return Err(TetherError::ArchiveUnreadable {
                path: self.path.clone(),
                reason: reason.clone(),
            });
        }
        match codec.open(&self.path) {
            Ok(reader) => {
                debug!(path = %self.path, "opened archive");
                self.handle = Some(ArchiveHandle::Owned(reader));
                Ok(())
            }
            Err(e) => {
                let reason = match e {
                    TetherError::ArchiveUnreadable { reason, .. } => reason,
                    other => other.to_string(),
                };
                self.diagnostics.open_error = Some(reason.clone());
                Err(TetherError::ArchiveUnreadable {
                    path: self.path.clone(),
                    reason,
                })
            }
        }
    }

    fn handle_mut(&mut self) -> Result<&mut ArchiveHandle, TetherError> {
        let path = &self.path;
        self.handle
            .as_mut()
            .ok_or_else(|| TetherError::ArchiveUnreadable {
                path: path.clone(),
                reason: "archive is not open".to_string(),
            })
    }

    pub(crate) fn read_block(
        &mut self,
        kind: BlockKind,
        name: &str,
    ) -> Result<Option<RawBlock>, TetherError> {
        let raw = self
            .handle_mut()?
            .with_reader(|reader| reader.read_named_block(kind, name))?;
        match raw {
            Some(_) => self.diagnostics.blocks_read += 1,
            None => self.diagnostics.blocks_absent += 1,
        }
        trace!(path = %self.path, %kind, name, found = raw.is_some(), "read block");
        Ok(raw)
    }

    pub(crate) fn enumerate(
        &mut self,
        filter: KindFilter,
        assets_only: bool,
    ) -> Result<Vec<BlockListing>, TetherError> {
        self.handle_mut()?
            .with_reader(|reader| reader.enumerate_blocks(filter, assets_only))
    }

    /// Give up the handle. Owned handles are closed, borrowed ones left to the caller.
    pub(crate) fn release(&mut self) {
        match self.handle.take() {
            Some(ArchiveHandle::Owned(reader)) => {
                debug!(path = %self.path, "closing archive");
                drop(reader);
            }
            Some(ArchiveHandle::Borrowed(_)) => {
                trace!(path = %self.path, "leaving borrowed archive open");
            }
            None => {}
        }
    }
}

impl Drop for LibraryDescriptor {
    fn drop(&mut self) {
        self.release();
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveContents, MemoryArchive, MemoryCodec};

    fn codec() -> MemoryCodec {
        MemoryCodec::new().with(
            "lib.tether",
            ArchiveContents::new().with(RawBlock::new(BlockKind::Mesh, "Cube")),
        )
    }

    #[test]
    fn opens_lazily_and_counts_reads() {
        let codec = codec();
        let mut lib = LibraryDescriptor::new("lib.tether", None);
        assert!(!lib.is_open());
        lib.open(&codec).expect("open");

        assert!(lib.read_block(BlockKind::Mesh, "Cube").expect("read").is_some());
        assert!(lib.read_block(BlockKind::Mesh, "Sphere").expect("read").is_none());
        assert_eq!(lib.diagnostics().blocks_read, 1);
        assert_eq!(lib.diagnostics().blocks_absent, 1);
    }

    #[test]
    fn failed_open_is_remembered() {
        let codec = MemoryCodec::new();
        let mut lib = LibraryDescriptor::new("missing.tether", None);
        assert!(lib.open(&codec).is_err());
        assert!(lib.diagnostics().open_error.is_some());
        assert!(matches!(
            lib.open(&codec),
            Err(TetherError::ArchiveUnreadable { .. })
        ));
    }

    #[test]
    fn borrowed_handle_survives_release() {
        let shared: Rc<RefCell<dyn ArchiveReader>> = Rc::new(RefCell::new(MemoryArchive::new(
            "shared.tether",
            ArchiveContents::new().with(RawBlock::new(BlockKind::Image, "Wood")),
        )));
        {
            let mut lib = LibraryDescriptor::new(
                "shared.tether",
                Some(ArchiveHandle::Borrowed(Rc::clone(&shared))),
            );
            assert!(lib.read_block(BlockKind::Image, "Wood").expect("read").is_some());
        }
        assert_eq!(Rc::strong_count(&shared), 1);
        assert!(
            shared
                .borrow_mut()
                .read_named_block(BlockKind::Image, "Wood")
                .expect("still usable")
                .is_some()
        );
    }
}
