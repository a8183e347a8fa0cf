//! Two-phase block relocation.
//!
//! Phase 1 allocates a target for every live block and copies the data,
//! through the device offload when there is one and by a software read and
//! write otherwise. A failed copy invalidates every target allocated so
//! far, so the victim keeps its full valid count. Phase 2 repoints each
//! owner and only then invalidates the source.

use lfs_alloc::SegmentAllocator;
use lfs_block::{BlockDevice, ReferenceResolver, RelocationOffload};
use lfs_error::{LfsError, Result};
use lfs_types::{AllocMode, BlockAddr, ObjectRef, SegKind, SegmentNo};

#[derive(Debug, Clone, Copy)]
struct Copied {
    owner: ObjectRef,
    src: BlockAddr,
    dst: BlockAddr,
}

pub(crate) struct Relocator<'a> {
    pub alloc: &'a SegmentAllocator,
    pub resolver: &'a dyn ReferenceResolver,
    pub device: &'a dyn BlockDevice,
    pub offload: Option<&'a dyn RelocationOffload>,
}

impl Relocator<'_> {
    /// Move `blocks` of `seg` to the `kind` head. Returns how many moved.
    pub(crate) fn relocate(
        &self,
        seg: SegmentNo,
        kind: SegKind,
        mode: AllocMode,
        blocks: &[(ObjectRef, BlockAddr)],
    ) -> Result<u64> {
        let copies = self.copy_all(seg, kind, mode, blocks)?;
        self.repoint_all(seg, &copies)
    }

    fn copy_all(
        &self,
        seg: SegmentNo,
        kind: SegKind,
        mode: AllocMode,
        blocks: &[(ObjectRef, BlockAddr)],
    ) -> Result<Vec<Copied>> {
        let mut copies = Vec::with_capacity(blocks.len());
        for &(owner, src) in blocks {
            let dst = match self.alloc.allocate_for_relocation(kind, mode, src) {
                Ok(dst) => dst,
                Err(err) => {
                    self.roll_back(&copies)?;
                    return Err(err);
                }
            };
            copies.push(Copied { owner, src, dst });
            if let Err(err) = self.copy_block(src, dst) {
                self.roll_back(&copies)?;
                return Err(LfsError::RelocationFailed {
                    segment: seg.0,
                    detail: format!("copy {src} -> {dst}: {err}"),
                });
            }
        }
        Ok(copies)
    }

    fn copy_block(&self, src: BlockAddr, dst: BlockAddr) -> Result<()> {
        if let Some(offload) = self.offload {
            match offload.relocate(src, dst) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::debug!(
                        target: "lfs::gc",
                        %src,
                        %dst,
                        error = %err,
                        "offload_copy_failed"
                    );
                }
            }
        }
        let buf = self.device.read_block(src)?;
        self.device.write_block(dst, buf.as_slice())
    }

    fn roll_back(&self, copies: &[Copied]) -> Result<()> {
        for copy in copies {
            self.alloc.invalidate_block(copy.dst)?;
        }
        if !copies.is_empty() {
            tracing::debug!(target: "lfs::gc", targets = copies.len(), "relocation_rolled_back");
        }
        Ok(())
    }

    fn repoint_all(&self, seg: SegmentNo, copies: &[Copied]) -> Result<u64> {
        let mut moved = 0_u64;
        let mut first_failure: Option<(BlockAddr, LfsError)> = None;
        for copy in copies {
            match self.resolver.repoint(copy.owner, copy.src, copy.dst) {
                Ok(()) => {
                    self.alloc.invalidate_block(copy.src)?;
                    moved += 1;
                }
                Err(err) => {
                    self.alloc.invalidate_block(copy.dst)?;
                    if first_failure.is_none() {
                        first_failure = Some((copy.src, err));
                    }
                }
            }
        }
        match first_failure {
            None => Ok(moved),
            Some((src, err)) => Err(LfsError::RelocationFailed {
                segment: seg.0,
                detail: format!("repoint of {src} failed after {moved} moved: {err}"),
            }),
        }
    }
}
