use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use block_dev::BlockDevice;
use spin::Mutex;

use crate::{DataBlock, FreeMap, SECTOR_SIZE};

/// 记录读写次数的内存盘
pub struct RamDisk {
    sectors: Mutex<Vec<DataBlock>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RamDisk {
    pub fn new(sectors: usize) -> Arc<Self> {
        Arc::new(Self {
            sectors: Mutex::new(vec![[0; SECTOR_SIZE]; sectors]),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        })
    }

    pub fn sector(&self, sector: usize) -> DataBlock {
        self.sectors.lock()[sector]
    }

    pub fn fill(&self, sector: usize, byte: u8) {
        self.sectors.lock()[sector].fill(byte);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, sector: usize, buf: &mut [u8]) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        buf.copy_from_slice(&self.sectors.lock()[sector]);
    }

    fn write_block(&self, sector: usize, buf: &[u8]) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.sectors.lock()[sector].copy_from_slice(buf);
    }
}

/// 包装一个空闲位图：统计分配与归还次数，并可限制还能分配多少次
pub struct CountingFreeMap<M> {
    inner: M,
    allocs: AtomicUsize,
    releases: AtomicUsize,
    budget: AtomicUsize,
}

impl<M: FreeMap> CountingFreeMap<M> {
    pub fn new(inner: M) -> Self {
        Self {
            inner,
            allocs: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            budget: AtomicUsize::new(usize::MAX),
        }
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }

    /// 之后只允许再成功分配 `budget` 次
    pub fn limit(&self, budget: usize) {
        self.budget.store(budget, Ordering::Relaxed);
    }

    pub fn unlimit(&self) {
        self.limit(usize::MAX);
    }

    pub fn allocs(&self) -> usize {
        self.allocs.load(Ordering::Relaxed)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::Relaxed)
    }
}

impl<M: FreeMap> FreeMap for CountingFreeMap<M> {
    fn alloc(&self, count: usize) -> Option<u32> {
        self.budget
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |budget| {
                budget.checked_sub(1)
            })
            .ok()?;
        let sector = self.inner.alloc(count)?;
        self.allocs.fetch_add(1, Ordering::Relaxed);
        Some(sector)
    }

    fn release(&self, sector: u32, count: usize) {
        self.releases.fetch_add(1, Ordering::Relaxed);
        self.inner.release(sector, count);
    }
}
