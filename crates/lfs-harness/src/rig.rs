//! In-memory volume with a minimal object layer on top.

use anyhow::{Context, Result};
use lfs::{
    AllocDiscipline, BlockAddr, BlockDevice, Geometry, IoMonitor, MetaStore, ObjectRef,
    ReferenceResolver, SegKind, TrimDevice, Volume, VolumeConfig, VolumeDevices, VolumeStats,
};
use lfs_block::{MemBlockDevice, MemMetaStore, MemResolver, MemTrimDevice, TrimMode};
use lfs_segment::{ManualClock, MtimeSource};
use std::sync::Arc;

/// Payload for version `version` of `owner`, `block_size` bytes long.
#[must_use]
pub fn payload(block_size: u32, owner: ObjectRef, version: u32) -> Vec<u8> {
    let seed = owner
        .owner
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(owner.offset)
        .wrapping_add(u64::from(version) << 32);
    let mut bytes = Vec::with_capacity(block_size as usize);
    let mut x = seed | 1;
    while bytes.len() < block_size as usize {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        bytes.extend_from_slice(&x.to_le_bytes());
    }
    bytes.truncate(block_size as usize);
    bytes
}

/// A [`Volume`] over in-memory devices, with handles to every device so
/// tests can inject faults and inspect what reached them.
pub struct MemVolume {
    pub geometry: Geometry,
    pub config: VolumeConfig,
    pub block_size: u32,
    pub volume: Volume,
    pub device: Arc<MemBlockDevice>,
    pub meta: Arc<MemMetaStore>,
    pub resolver: Arc<MemResolver>,
    pub trim: Arc<MemTrimDevice>,
    pub clock: Arc<ManualClock>,
    pub monitor: Arc<IoMonitor>,
}

impl std::fmt::Debug for MemVolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemVolume")
            .field("geometry", &self.geometry)
            .field("block_size", &self.block_size)
            .field("volume", &self.volume)
            .finish_non_exhaustive()
    }
}

struct Parts {
    device: Arc<MemBlockDevice>,
    meta: Arc<MemMetaStore>,
    resolver: Arc<MemResolver>,
    trim: Arc<MemTrimDevice>,
    clock: Arc<ManualClock>,
    monitor: Arc<IoMonitor>,
}

impl Parts {
    fn devices(&self) -> VolumeDevices {
        VolumeDevices {
            device: Arc::clone(&self.device) as Arc<dyn BlockDevice>,
            trim: Arc::clone(&self.trim) as Arc<dyn TrimDevice>,
            meta: Arc::clone(&self.meta) as Arc<dyn MetaStore>,
            resolver: Arc::clone(&self.resolver) as Arc<dyn ReferenceResolver>,
            offload: None,
            monitor: Arc::clone(&self.monitor),
            clock: Some(Arc::clone(&self.clock) as Arc<dyn MtimeSource>),
        }
    }
}

impl MemVolume {
    /// Format a fresh volume. The TRIM device completes inline.
    pub fn format(geometry: Geometry, config: VolumeConfig, block_size: u32) -> Result<Self> {
        let parts = Parts {
            device: Arc::new(MemBlockDevice::new(
                block_size,
                geometry.main_blkaddr + geometry.main_blocks(),
            )),
            meta: Arc::new(MemMetaStore::new()),
            resolver: Arc::new(MemResolver::new()),
            trim: Arc::new(MemTrimDevice::new(1 << 16, TrimMode::Immediate)),
            clock: Arc::new(ManualClock::new(1)),
            monitor: Arc::new(IoMonitor::new()),
        };
        let volume = Volume::format(geometry, config.clone(), parts.devices())
            .context("format in-memory volume")?;
        Ok(Self {
            geometry,
            config,
            block_size,
            volume,
            device: parts.device,
            meta: parts.meta,
            resolver: parts.resolver,
            trim: parts.trim,
            clock: parts.clock,
            monitor: parts.monitor,
        })
    }

    fn parts(&self) -> Parts {
        Parts {
            device: Arc::clone(&self.device),
            meta: Arc::clone(&self.meta),
            resolver: Arc::clone(&self.resolver),
            trim: Arc::clone(&self.trim),
            clock: Arc::clone(&self.clock),
            monitor: Arc::clone(&self.monitor),
        }
    }

    /// Clean unmount followed by a mount from the last checkpoint. Returns
    /// the retired volume's final counters, unmount checkpoint included.
    pub fn remount(&mut self) -> Result<VolumeStats> {
        self.volume.shutdown().context("shutdown before remount")?;
        let retired = self.volume.stats();
        let volume = Volume::mount(self.geometry, self.config.clone(), self.parts().devices())
            .context("mount from last checkpoint")?;
        self.volume = volume;
        Ok(retired)
    }

    /// Write version `version` of `owner` to a fresh block and drop the
    /// block it replaces. Returns the new address.
    pub fn write_object(
        &self,
        owner: ObjectRef,
        kind: SegKind,
        discipline: AllocDiscipline,
        version: u32,
    ) -> lfs::Result<BlockAddr> {
        let addr = self.volume.allocate_block(kind, discipline)?;
        self.monitor.begin_io();
        let written = self
            .device
            .write_block(addr, &payload(self.block_size, owner, version));
        self.monitor.end_io();
        if let Err(err) = written {
            self.volume.invalidate_block(addr)?;
            return Err(err);
        }
        if let Some(prev) = self.resolver.bind(owner, addr) {
            self.volume.invalidate_block(prev)?;
        }
        Ok(addr)
    }

    /// Drop `owner`. Returns whether it existed.
    pub fn delete_object(&self, owner: ObjectRef) -> lfs::Result<bool> {
        match self.resolver.unbind(owner) {
            Some(addr) => {
                self.volume.invalidate_block(addr)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Current contents of `owner`, if it exists.
    pub fn read_object(&self, owner: ObjectRef) -> lfs::Result<Option<Vec<u8>>> {
        let Some(addr) = self.resolver.block_of(owner) else {
            return Ok(None);
        };
        Ok(Some(self.device.read_block(addr)?.into_inner()))
    }

    /// Whether `owner` exists and reads back as `version`.
    pub fn verify_object(&self, owner: ObjectRef, version: u32) -> lfs::Result<bool> {
        Ok(self
            .read_object(owner)?
            .is_some_and(|bytes| bytes == payload(self.block_size, owner, version)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::small_geometry;

    fn obj(owner: u64) -> ObjectRef {
        ObjectRef { owner, offset: 0 }
    }

    #[test]
    fn payloads_differ_by_owner_and_version() {
        assert_eq!(payload(64, obj(1), 0).len(), 64);
        assert_ne!(payload(64, obj(1), 0), payload(64, obj(2), 0));
        assert_ne!(payload(64, obj(1), 0), payload(64, obj(1), 1));
        assert_eq!(payload(64, obj(7), 3), payload(64, obj(7), 3));
    }

    #[test]
    fn overwrite_moves_the_object_and_frees_the_old_block() {
        let rig = MemVolume::format(small_geometry(), VolumeConfig::default(), 64).expect("rig");
        let first = rig
            .write_object(obj(1), SegKind::WarmData, AllocDiscipline::Auto, 0)
            .expect("write");
        let second = rig
            .write_object(obj(1), SegKind::WarmData, AllocDiscipline::Auto, 1)
            .expect("overwrite");
        assert_ne!(first, second);
        assert_eq!(rig.volume.stats().usage.valid_blocks, 1);
        assert!(rig.verify_object(obj(1), 1).expect("read"));
        assert!(!rig.verify_object(obj(1), 0).expect("read"));

        assert!(rig.delete_object(obj(1)).expect("delete"));
        assert!(!rig.delete_object(obj(1)).expect("delete again"));
        assert_eq!(rig.volume.stats().usage.valid_blocks, 0);
        assert_eq!(rig.read_object(obj(1)).expect("read"), None);
    }

    #[test]
    fn failed_device_write_releases_the_block() {
        let rig = MemVolume::format(small_geometry(), VolumeConfig::default(), 64).expect("rig");
        let first = rig
            .write_object(obj(1), SegKind::HotData, AllocDiscipline::Append, 0)
            .expect("write");
        rig.device.inject_write_failure(BlockAddr(first.0 + 1));
        let err = rig
            .write_object(obj(2), SegKind::HotData, AllocDiscipline::Append, 0)
            .expect_err("write fails");
        assert!(matches!(err, lfs::LfsError::Io(_)));
        assert_eq!(rig.volume.stats().usage.valid_blocks, 1);
        assert_eq!(rig.resolver.len(), 1);
    }

    #[test]
    fn remount_keeps_objects_readable() {
        let mut rig =
            MemVolume::format(small_geometry(), VolumeConfig::default(), 64).expect("rig");
        for id in 1..=40 {
            rig.write_object(obj(id), SegKind::HotNode, AllocDiscipline::Auto, 0)
                .expect("write");
        }
        let retired = rig.remount().expect("remount");
        assert!(retired.checkpoint.committed >= 1, "unmount checkpoint");
        assert_eq!(retired.usage.valid_blocks, 40);
        assert_eq!(rig.volume.stats().checkpoint.committed, 0);
        assert_eq!(rig.volume.stats().usage.valid_blocks, 40);
        for id in 1..=40 {
            assert!(rig.verify_object(obj(id), 0).expect("read"));
        }
    }
}
