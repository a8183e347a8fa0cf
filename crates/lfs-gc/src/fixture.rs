//! Small in-memory volume for collector tests.

use crate::{GcCollaborators, GcConfig, GcManager};
use lfs_alloc::{AllocConfig, SegmentAllocator, Tuning};
use lfs_block::{
    BlockDevice, IoMonitor, MemBlockDevice, MemMetaStore, MemResolver, MemTrimDevice, MetaStore,
    ReferenceResolver, RelocationOffload, TrimDevice, TrimMode,
};
use lfs_checkpoint::CheckpointPipeline;
use lfs_discard::{DiscardConfig, DiscardManager};
use lfs_segment::{
    ConsistencyPolicy, GcLevels, ManualClock, MtimeSource, SegmentArena, SegmentTable,
    VolumeHealth,
};
use lfs_types::{AllocDiscipline, BlockAddr, Geometry, ObjectRef, SegKind, SegmentNo};
use lfs_victim::VictimSelector;
use std::sync::Arc;

pub const BLOCK_SIZE: u32 = 16;
const BLOCK_LEN: usize = 16;

pub fn geo(blocks_per_seg: u32, segs_per_sec: u32) -> Geometry {
    Geometry {
        blocks_per_seg,
        segs_per_sec,
        secs_per_zone: 1,
        main_blkaddr: 4,
        main_segments: 8,
        reserved_segments: 0,
        overprov_segments: 0,
        slc_segs_per_sec: 0,
    }
}

pub fn owner(id: u64) -> ObjectRef {
    ObjectRef {
        owner: id,
        offset: 0,
    }
}

/// Block contents written for owner `id`.
pub fn pattern(id: u64) -> Vec<u8> {
    vec![u8::try_from(id % 251).unwrap_or(0); BLOCK_LEN]
}

pub struct Fixture {
    pub alloc: Arc<SegmentAllocator>,
    pub meta: Arc<MemMetaStore>,
    pub resolver: Arc<MemResolver>,
    pub device: Arc<MemBlockDevice>,
    pub gc: Arc<GcManager>,
    next_owner: u64,
}

impl Fixture {
    pub fn new(blocks_per_seg: u32) -> Self {
        Self::build(geo(blocks_per_seg, 1), GcConfig::default(), None)
    }

    pub fn with_config(blocks_per_seg: u32, config: GcConfig) -> Self {
        Self::build(geo(blocks_per_seg, 1), config, None)
    }

    pub fn build(
        g: Geometry,
        config: GcConfig,
        offload: Option<Arc<dyn RelocationOffload>>,
    ) -> Self {
        let health = Arc::new(VolumeHealth::new(ConsistencyPolicy::Halt));
        let table = SegmentTable::new(g, Arc::clone(&health)).expect("table");
        let arena = Arc::new(SegmentArena::new(table));
        let discard = Arc::new(DiscardManager::new(
            Arc::new(MemTrimDevice::new(1 << 20, TrimMode::Immediate)) as Arc<dyn TrimDevice>,
            Arc::new(IoMonitor::new()),
            health,
            DiscardConfig::default(),
        ));
        let meta = Arc::new(MemMetaStore::new());
        let alloc = Arc::new(SegmentAllocator::new(
            arena,
            VictimSelector::default(),
            Arc::clone(&discard),
            Arc::clone(&meta) as Arc<dyn MetaStore>,
            Arc::new(ManualClock::new(10)) as Arc<dyn MtimeSource>,
            AllocConfig::default(),
            Tuning::new(GcLevels::compute(&g, 0).expect("levels")),
        ));
        let checkpoint = Arc::new(CheckpointPipeline::new(
            Arc::clone(&alloc),
            discard,
            Arc::clone(&meta) as Arc<dyn MetaStore>,
            0,
        ));
        let resolver = Arc::new(MemResolver::new());
        let device = Arc::new(MemBlockDevice::new(
            BLOCK_SIZE,
            g.main_blkaddr + g.main_blocks(),
        ));
        let gc = Arc::new(GcManager::new(
            Arc::clone(&alloc),
            checkpoint,
            VictimSelector::default(),
            GcCollaborators {
                meta: Arc::clone(&meta) as Arc<dyn MetaStore>,
                resolver: Arc::clone(&resolver) as Arc<dyn ReferenceResolver>,
                device: Arc::clone(&device) as Arc<dyn BlockDevice>,
                offload,
                monitor: Arc::new(IoMonitor::new()),
            },
            config,
        ));
        Self {
            alloc,
            meta,
            resolver,
            device,
            gc,
            next_owner: 0,
        }
    }

    /// Append `n` blocks of `kind`, each owned by a fresh object and filled
    /// with its pattern. Owner ids count up from 1 across calls.
    pub fn write(&mut self, kind: SegKind, n: usize) -> Vec<BlockAddr> {
        let mut addrs = Vec::with_capacity(n);
        for _ in 0..n {
            let addr = self
                .alloc
                .allocate_block(kind, AllocDiscipline::Append)
                .expect("alloc");
            self.next_owner += 1;
            self.resolver.bind(owner(self.next_owner), addr);
            self.device
                .write_block(addr, &pattern(self.next_owner))
                .expect("write");
            addrs.push(addr);
        }
        addrs
    }

    /// Drop the owner's reference and invalidate the block.
    pub fn kill(&self, addr: BlockAddr) {
        let who = self.resolver.owner_of(addr).expect("owned");
        self.resolver.unbind(who);
        self.alloc.invalidate_block(addr).expect("invalidate");
    }

    pub fn seg_of(&self, addr: BlockAddr) -> SegmentNo {
        self.alloc
            .arena()
            .geometry()
            .segment_of(addr)
            .expect("main area")
    }

    pub fn valid(&self, seg: SegmentNo) -> u32 {
        self.alloc.arena().read(|table, _| table.valid_blocks(seg))
    }

    pub fn free_sections(&self) -> u32 {
        self.alloc.arena().usage().free_sections
    }
}
