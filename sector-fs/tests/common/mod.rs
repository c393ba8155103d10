#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

use sector_fs::{BlockDevice, Bitmap, DataBlock, FileSystem, FreeMap, SECTOR_SIZE};

/// 内存盘
///
/// 与单元测试的 `test_util::RamDisk` 同源：后者只在 `cfg(test)` 下编译，集成测试引用不到。
pub struct RamDisk {
    sectors: Mutex<Vec<DataBlock>>,
    writes: AtomicUsize,
}

impl RamDisk {
    pub fn new(sectors: usize) -> Arc<Self> {
        Arc::new(Self {
            sectors: Mutex::new(vec![[0; SECTOR_SIZE]; sectors]),
            writes: AtomicUsize::new(0),
        })
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, sector: usize, buf: &mut [u8]) {
        buf.copy_from_slice(&self.sectors.lock().unwrap()[sector]);
    }

    fn write_block(&self, sector: usize, buf: &[u8]) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.sectors.lock().unwrap()[sector].copy_from_slice(buf);
    }
}

pub struct Fixture {
    pub disk: Arc<RamDisk>,
    pub bitmap: Arc<Bitmap>,
    pub fs: Arc<FileSystem>,
}

impl Fixture {
    /// 扇区号 0 表示空指针，不能分配出去
    pub fn new(sectors: usize) -> Self {
        Self::with_cache_capacity(sectors, sector_fs::CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(sectors: usize, cache_capacity: usize) -> Self {
        let disk = RamDisk::new(sectors);
        let bitmap = Arc::new(Bitmap::new(sectors));
        bitmap.reserve(0, 1);
        let fs = FileSystem::with_cache_capacity(disk.clone(), bitmap.clone(), cache_capacity);
        Self { disk, bitmap, fs }
    }

    /// 申请一个扇区并在上面创建空文件
    pub fn create(&self, is_dir: bool) -> u32 {
        let sector = self.bitmap.alloc(1).unwrap();
        self.fs.create(sector, 0, is_dir).unwrap();
        sector
    }
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ seed).collect()
}
