//! 间接索引块
//! - 一级：整个块连续存储**扇区号**，每个编号都指向一个**数据块**
//! - 二级：整个块连续存储**扇区号**，每个编号都指向一个一级索引块
//!
//! 扇区号 0 表示空指针。
//!
//! ## 块索引编码
//!
//! - x+1 级块索引模 x 级块的**可编号数量**，可得**最后**一块 x 的内部索引
//! - x+1 级块索引除以 x 级块的**可编号数量**，可得 x 级块的位置
//!
//! ## 伸缩
//!
//! [`DiskInode::resize`] 按 直接 → 一级 → 二级 的顺序逐层比较每个槽位：
//! 新长度需要而尚未分配的数据块就分配并清零，新长度之外仍持有的数据块就归还；
//! 索引块在第一次需要时分配，其下不再挂任何块时归还。
//! 空闲扇区耗尽时按撤销日志回滚，伸缩要么完整生效，要么什么也没发生。

use alloc::vec::Vec;
use core::mem;

use log::{debug, warn};

use crate::block_cache::{BufferCache, Plain};
use crate::{DataBlock, Error, FreeMap, MAGIC, SECTOR_SIZE};

/// 间接索引块的编号容量
const INDIRECT_COUNT: usize = SECTOR_SIZE / 4;
/// 间接索引块
type IndirectBlock = [u32; INDIRECT_COUNT];

/// 直接索引块可编号数量
const DIRECT_COUNT: usize = 12;
/// 一级索引块可编号数量
const INDIRECT1_COUNT: usize = INDIRECT_COUNT;
/// 二级索引块可编号数量
const INDIRECT2_COUNT: usize = INDIRECT_COUNT.pow(2);
/// 直接索引时的编号容量
const DIRECT_CAP: usize = DIRECT_COUNT;
/// 用上一级索引时的编号容量
const INDIRECT1_CAP: usize = DIRECT_CAP + INDIRECT1_COUNT;
/// 用上二级索引时的编号容量
const INDIRECT2_CAP: usize = INDIRECT1_CAP + INDIRECT2_COUNT;

/// 单个文件最多占用的数据块数
pub const MAX_FILE_SECTORS: usize = INDIRECT2_CAP;
/// 单个文件的最大字节数
pub const MAX_LENGTH: usize = MAX_FILE_SECTORS * SECTOR_SIZE;

const ZERO_BLOCK: DataBlock = [0; SECTOR_SIZE];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct DiskInode {
    /// 文件字节数，不用usize是为了严控布局
    pub length: u32,
    is_dir: u32,
    /// 目录下存活的子项个数
    pub children: u32,
    magic: u32,
    /// 直接索引块，包含 DIRECT_COUNT 个块编号，
    /// 存储容量：DIRECT_CAP * SECTOR_SIZE 字节
    direct: [u32; DIRECT_COUNT],
    /// 指向一个一级索引块
    indirect1: u32,
    /// 指向一个二级索引块
    indirect2: u32,
    /// 填满一个扇区
    unused: [u32; 110],
}

const _: () = assert!(mem::size_of::<DiskInode>() == SECTOR_SIZE);

unsafe impl Plain for DiskInode {}

/// 一次伸缩的撤销日志
#[derive(Default)]
struct Journal {
    /// 本次新分配的扇区
    allocated: Vec<u32>,
    /// 被覆写的已有索引块及其原内容
    overwritten: Vec<(u32, IndirectBlock)>,
}

/// 逐层调整索引树时共享的上下文
struct Mapper<'a> {
    cache: &'a BufferCache,
    free_map: &'a dyn FreeMap,
    journal: Journal,
}

impl DiskInode {
    #[inline]
    pub fn new(is_dir: bool) -> Self {
        Self {
            length: 0,
            is_dir: is_dir as u32,
            children: 0,
            magic: MAGIC,
            direct: [0; DIRECT_COUNT],
            indirect1: 0,
            indirect2: 0,
            unused: [0; 110],
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.magic == MAGIC
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.is_dir != 0
    }

    /// 返回存放第 `pos` 字节的扇区；越过文件末尾或未分配时返回空
    pub fn byte_to_sector(&self, pos: usize, cache: &BufferCache) -> Option<u32> {
        if pos >= self.length as usize {
            return None;
        }

        let dev = cache.device();
        let block_index = pos / SECTOR_SIZE;
        let sector = if block_index < DIRECT_CAP {
            self.direct[block_index]
        } else if block_index < INDIRECT1_CAP {
            if self.indirect1 == 0 {
                return None;
            }
            // 剔去直接索引的部分
            cache.map(dev, self.indirect1, 0, |indirect1: &IndirectBlock| {
                indirect1[block_index - DIRECT_CAP]
            })
        } else {
            if self.indirect2 == 0 {
                return None;
            }
            // 剔去使用了一级索引的部分
            let index = block_index - INDIRECT1_CAP;

            let indirect1 = cache.map(dev, self.indirect2, 0, |indirect2: &IndirectBlock| {
                indirect2[index / INDIRECT1_COUNT]
            });
            if indirect1 == 0 {
                return None;
            }
            cache.map(dev, indirect1, 0, |indirect1: &IndirectBlock| {
                indirect1[index % INDIRECT1_COUNT]
            })
        };

        (sector != 0).then_some(sector)
    }

    /// 把文件伸缩到 `length` 字节，成功后持久化到 inode 所在的扇区 `sector`。
    ///
    /// 失败时索引树与 inode 都回到调用前的样子，期间分配的扇区全部归还。
    pub fn resize(
        &mut self,
        sector: u32,
        length: usize,
        cache: &BufferCache,
        free_map: &dyn FreeMap,
    ) -> Result<(), Error> {
        if length > MAX_LENGTH {
            return Err(Error::TooLarge);
        }

        let snapshot = *self;
        let mut mapper = Mapper {
            cache,
            free_map,
            journal: Journal::default(),
        };

        if let Err(err) = self.remap(length, &mut mapper) {
            warn!(
                "inode {sector}: resize {} -> {length} failed, rolling back {} sectors",
                self.length,
                mapper.journal.allocated.len()
            );
            mapper.rollback();
            *self = snapshot;
            return Err(err);
        }

        debug!(
            "inode {sector}: resize {} -> {length}, {} sectors allocated",
            self.length,
            mapper.journal.allocated.len()
        );
        self.length = length as u32;
        cache.store(cache.device(), sector, 0, &*self);
        Ok(())
    }

    /// 释放整棵索引树，长度归零。inode 自身所在的扇区由调用者归还
    pub fn clear(&mut self, cache: &BufferCache, free_map: &dyn FreeMap) {
        let mut mapper = Mapper {
            cache,
            free_map,
            journal: Journal::default(),
        };
        self.remap(0, &mut mapper).expect("shrinking never allocates");
        self.length = 0;
    }

    /// 索引树当前占用的全部扇区(数据块与索引块)，按遍历顺序
    pub fn sectors(&self, cache: &BufferCache) -> Vec<u32> {
        let mut sectors: Vec<u32> = self.direct.iter().copied().filter(|&s| s != 0).collect();
        collect(self.indirect1, 1, cache, &mut sectors);
        collect(self.indirect2, 2, cache, &mut sectors);
        sectors
    }

    /// 从指定位置(字节偏移)读出数据填充`buf`。
    /// 读取范围越过文件末尾时什么也不读。
    pub fn read_at(&self, offset: usize, buf: &mut [u8], cache: &BufferCache) -> usize {
        let Some(end) = offset.checked_add(buf.len()) else {
            return 0;
        };
        if end > self.length as usize {
            return 0;
        }

        let mut start = offset;
        // 已读取多少字节
        let mut read_size = 0;
        while start < end {
            let Some(sector) = self.byte_to_sector(start, cache) else {
                break;
            };
            // 绝对地址 % 块大小 = 块内偏移
            let inoffset = start % SECTOR_SIZE;
            // 当前块的末地址(字节)
            let current_block_end = (start - inoffset + SECTOR_SIZE).min(end);
            let block_read_size = current_block_end - start;

            cache.read_at(
                cache.device(),
                sector,
                &mut buf[read_size..read_size + block_read_size],
                inoffset,
            );

            read_size += block_read_size;
            start = current_block_end;
        }

        read_size
    }

    /// 在已分配的范围内写入`buf`，不会扩展文件
    pub fn write_at(&self, offset: usize, buf: &[u8], cache: &BufferCache) -> usize {
        let Some(end) = offset.checked_add(buf.len()) else {
            return 0;
        };
        let end = end.min(self.length as usize);

        let mut start = offset;
        let mut written_size = 0;
        while start < end {
            let Some(sector) = self.byte_to_sector(start, cache) else {
                break;
            };
            let inoffset = start % SECTOR_SIZE;
            let current_block_end = (start - inoffset + SECTOR_SIZE).min(end);
            let block_write_size = current_block_end - start;

            // 首尾不完整的扇区只覆盖涉及的字节
            cache.write_at(
                cache.device(),
                sector,
                &buf[written_size..written_size + block_write_size],
                inoffset,
            );

            written_size += block_write_size;
            start = current_block_end;
        }

        written_size
    }

    /// 计算容纳指定数据量需要多少个**数据块**
    #[inline]
    pub fn count_data_block(length: usize) -> usize {
        length.div_ceil(SECTOR_SIZE)
    }

    /// 计算容纳指定数据量需要多少个 **数据块** 和 **索引块**(`IndirectBlock`)
    pub fn count_total_block(length: usize) -> usize {
        let data_blocks = Self::count_data_block(length);
        let mut total = data_blocks;

        // 超出直接索引，使用一级索引块
        if data_blocks > DIRECT_CAP {
            total += 1;
        }

        // 超出一级索引，使用二级索引块以及它下面的一级索引块
        if data_blocks > INDIRECT1_CAP {
            total += 1 + (data_blocks - INDIRECT1_CAP).div_ceil(INDIRECT1_COUNT);
        }

        total
    }
}

impl DiskInode {
    fn remap(&mut self, length: usize, mapper: &mut Mapper<'_>) -> Result<(), Error> {
        let data_blocks = Self::count_data_block(length);

        /******************** 直接索引 ********************/
        for (block_index, block) in self.direct.iter_mut().enumerate() {
            mapper.data(block, block_index < data_blocks)?;
        }
        /******************** 一级索引 ********************/
        mapper.indirect(
            &mut self.indirect1,
            1,
            data_blocks.saturating_sub(DIRECT_CAP),
        )?;
        /******************** 二级索引 ********************/
        mapper.indirect(
            &mut self.indirect2,
            2,
            data_blocks.saturating_sub(INDIRECT1_CAP),
        )?;

        Ok(())
    }
}

impl Mapper<'_> {
    fn alloc(&mut self) -> Result<u32, Error> {
        let sector = self.free_map.alloc(1).ok_or(Error::NoSpace)?;
        self.journal.allocated.push(sector);
        Ok(sector)
    }

    /// 数据块：需要就分配并清零，不需要就归还
    fn data(&mut self, block: &mut u32, needed: bool) -> Result<(), Error> {
        if needed && *block == 0 {
            *block = self.alloc()?;
            self.cache.write(self.cache.device(), *block, &ZERO_BLOCK);
        } else if !needed && *block != 0 {
            self.free_map.release(*block, 1);
            *block = 0;
        }

        Ok(())
    }

    /// `level` 级索引块，其下需要挂 `needed` 个数据块
    fn indirect(&mut self, block: &mut u32, level: u32, needed: usize) -> Result<(), Error> {
        if needed == 0 && *block == 0 {
            return Ok(());
        }

        let cache = self.cache;
        let dev = cache.device();
        let mut entries: IndirectBlock = if *block == 0 {
            *block = self.alloc()?;
            [0; INDIRECT_COUNT]
        } else {
            let entries = cache.load(dev, *block, 0);
            self.journal.overwritten.push((*block, entries));
            entries
        };

        // 每个子项覆盖的数据块数
        let span = INDIRECT_COUNT.pow(level - 1);
        for (index, entry) in entries.iter_mut().enumerate() {
            let child_needed = needed.saturating_sub(index * span).min(span);
            if level == 1 {
                self.data(entry, child_needed > 0)?;
            } else {
                self.indirect(entry, level - 1, child_needed)?;
            }
        }

        if needed == 0 {
            // 其下已经没有任何块
            self.free_map.release(*block, 1);
            *block = 0;
        } else {
            cache.store(dev, *block, 0, &entries);
        }

        Ok(())
    }

    /// 恢复被覆写的索引块，归还本次分配的扇区
    fn rollback(&mut self) {
        let dev = self.cache.device();
        for (sector, entries) in self.journal.overwritten.iter().rev() {
            self.cache.store(dev, *sector, 0, entries);
        }
        for &sector in self.journal.allocated.iter().rev() {
            self.free_map.release(sector, 1);
        }
    }
}

/// 收集 `level` 级索引块 `block` 及其下的全部扇区
fn collect(block: u32, level: u32, cache: &BufferCache, sectors: &mut Vec<u32>) {
    if block == 0 {
        return;
    }

    sectors.push(block);
    let entries: IndirectBlock = cache.load(cache.device(), block, 0);
    for entry in entries.into_iter().filter(|&entry| entry != 0) {
        if level == 1 {
            sectors.push(entry);
        } else {
            collect(entry, level - 1, cache, sectors);
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use alloc::vec;

    use block_dev::BlockDevice;

    use super::*;
    use crate::test_util::{CountingFreeMap, RamDisk};
    use crate::Bitmap;

    const DISK_SECTORS: usize = 20_000;

    struct Fixture {
        cache: BufferCache,
        free_map: CountingFreeMap<Bitmap>,
    }

    impl Fixture {
        fn new() -> Self {
            let dev: Arc<dyn BlockDevice> = RamDisk::new(DISK_SECTORS);
            let bitmap = Bitmap::new(DISK_SECTORS);
            // 0 号扇区是空指针，1 号扇区放 inode
            bitmap.reserve(0, 2);

            Self {
                cache: BufferCache::with_capacity(dev, 16),
                free_map: CountingFreeMap::new(bitmap),
            }
        }

        fn persisted(&self) -> DiskInode {
            self.cache.load(self.cache.device(), 1, 0)
        }
    }

    fn check_mapping(inode: &DiskInode, cache: &BufferCache, free_map: &Bitmap) {
        let length = inode.length as usize;
        for pos in (0..length).step_by(SECTOR_SIZE).chain([length.saturating_sub(1)]) {
            if pos >= length {
                continue;
            }
            let sector = inode.byte_to_sector(pos, cache).unwrap();
            assert!(free_map.is_allocated(sector));
        }
        assert_eq!(inode.byte_to_sector(length, cache), None);
        assert_eq!(inode.byte_to_sector(length + SECTOR_SIZE * 200, cache), None);
    }

    #[test]
    fn layout_is_one_sector() {
        assert_eq!(mem::size_of::<DiskInode>(), SECTOR_SIZE);
        assert_eq!(mem::offset_of!(DiskInode, direct), 16);
        assert_eq!(mem::offset_of!(DiskInode, indirect1), 64);
        assert_eq!(mem::offset_of!(DiskInode, indirect2), 68);
    }

    #[test]
    fn count_blocks() {
        assert_eq!(DiskInode::count_total_block(0), 0);
        assert_eq!(DiskInode::count_total_block(1), 1);
        assert_eq!(DiskInode::count_total_block(12 * SECTOR_SIZE), 12);
        assert_eq!(DiskInode::count_total_block(12 * SECTOR_SIZE + 1), 14);
        assert_eq!(DiskInode::count_total_block(140 * SECTOR_SIZE), 141);
        assert_eq!(DiskInode::count_total_block(140 * SECTOR_SIZE + 1), 144);
        assert_eq!(DiskInode::count_total_block(MAX_LENGTH), MAX_FILE_SECTORS + 1 + 1 + 128);
    }

    #[test]
    fn resize_maps_exactly_the_length() {
        let fx = Fixture::new();
        let mut inode = DiskInode::new(false);

        let lengths = [
            1,
            SECTOR_SIZE,
            5000,
            12 * SECTOR_SIZE,
            12 * SECTOR_SIZE + 1,
            70_000,
            140 * SECTOR_SIZE + 1,
            600_010,
            3 * SECTOR_SIZE,
            0,
        ];
        for length in lengths {
            inode.resize(1, length, &fx.cache, &fx.free_map).unwrap();
            assert_eq!(inode.length as usize, length);
            check_mapping(&inode, &fx.cache, fx.free_map.inner());

            let sectors = inode.sectors(&fx.cache);
            assert_eq!(sectors.len(), DiskInode::count_total_block(length));
            assert_eq!(
                fx.free_map.inner().free_count(),
                DISK_SECTORS - 2 - sectors.len()
            );
            assert_eq!(fx.persisted(), inode);
        }

        assert_eq!(fx.free_map.allocs(), fx.free_map.releases());
    }

    #[test]
    fn resize_is_idempotent() {
        let fx = Fixture::new();
        let mut inode = DiskInode::new(false);

        inode.resize(1, 200_000, &fx.cache, &fx.free_map).unwrap();
        let tree = inode.sectors(&fx.cache);
        let persisted = fx.persisted();
        let allocs = fx.free_map.allocs();

        inode.resize(1, 200_000, &fx.cache, &fx.free_map).unwrap();
        assert_eq!(inode.sectors(&fx.cache), tree);
        assert_eq!(fx.persisted(), persisted);
        assert_eq!(fx.free_map.allocs(), allocs);
        assert_eq!(fx.free_map.releases(), 0);
    }

    #[test]
    fn new_blocks_are_zeroed() {
        let fx = Fixture::new();
        let dev = fx.cache.device().clone();
        let mut inode = DiskInode::new(false);

        // 弄脏一个之后会被分配出去的扇区
        let dirty = fx.free_map.alloc(1).unwrap();
        fx.cache.write(&dev, dirty, &[0xEE; SECTOR_SIZE]);
        fx.free_map.release(dirty, 1);

        inode.resize(1, 3 * SECTOR_SIZE, &fx.cache, &fx.free_map).unwrap();
        let mut buf = vec![0xFF; 3 * SECTOR_SIZE];
        assert_eq!(inode.read_at(0, &mut buf, &fx.cache), buf.len());
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn rollback_restores_everything() {
        let fx = Fixture::new();
        let mut inode = DiskInode::new(false);

        // 先长到二级索引内部，使已有索引块也会被覆写
        let original = 150 * SECTOR_SIZE + 7;
        inode.resize(1, original, &fx.cache, &fx.free_map).unwrap();
        let before = inode;
        let tree = inode.sectors(&fx.cache);
        let free = fx.free_map.inner().free_count();
        let mapping: Vec<_> = (0..original)
            .step_by(SECTOR_SIZE)
            .map(|pos| inode.byte_to_sector(pos, &fx.cache))
            .collect();

        for budget in [0, 1, 5, 130, 250] {
            let allocs = fx.free_map.allocs();
            let releases = fx.free_map.releases();
            fx.free_map.limit(budget);

            let err = inode.resize(1, 400 * SECTOR_SIZE, &fx.cache, &fx.free_map);
            assert_eq!(err, Err(Error::NoSpace));
            fx.free_map.unlimit();

            assert_eq!(inode, before);
            assert_eq!(fx.persisted(), before);
            assert_eq!(inode.sectors(&fx.cache), tree);
            assert_eq!(fx.free_map.inner().free_count(), free);
            assert_eq!(
                fx.free_map.allocs() - allocs,
                fx.free_map.releases() - releases
            );
            let after: Vec<_> = (0..original)
                .step_by(SECTOR_SIZE)
                .map(|pos| inode.byte_to_sector(pos, &fx.cache))
                .collect();
            assert_eq!(after, mapping);
        }

        // 空间足够时同样的伸缩可以成功
        inode.resize(1, 400 * SECTOR_SIZE, &fx.cache, &fx.free_map).unwrap();
        check_mapping(&inode, &fx.cache, fx.free_map.inner());
    }

    #[test]
    fn too_large() {
        let fx = Fixture::new();
        let mut inode = DiskInode::new(false);
        assert_eq!(
            inode.resize(1, MAX_LENGTH + 1, &fx.cache, &fx.free_map),
            Err(Error::TooLarge)
        );
        assert_eq!(fx.free_map.allocs(), 0);
    }

    #[test]
    fn clear_releases_tree() {
        let fx = Fixture::new();
        let mut inode = DiskInode::new(false);
        inode.resize(1, 600_010, &fx.cache, &fx.free_map).unwrap();

        inode.clear(&fx.cache, &fx.free_map);
        assert_eq!(inode.length, 0);
        assert!(inode.sectors(&fx.cache).is_empty());
        assert_eq!(fx.free_map.inner().free_count(), DISK_SECTORS - 2);
    }
}
