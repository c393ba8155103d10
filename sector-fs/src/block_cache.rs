//! # 块缓存层
//!
//! 块设备读写速度一般慢于内存读写速度，因此我们在内存中开辟固定数量的槽位，
//! 把即将操作的扇区复制到槽位中，提高对块设备的操作效率。
//!
//! 块缓存层对使用者来说是透明的：inode 层对扇区的所有读写都经过块缓存层，
//! 写操作只会弄脏槽位，直到槽位被置换或调用 [`BufferCache::flush`] 时才写回设备。
//!
//! 置换采用时钟(二次机会)算法：时钟指针逐个扫过槽位，
//! 访问位为 1 的槽位被清零并放过一次，访问位为 0 的槽位被选为牺牲者。
//!
//! 锁的层次：
//! - 每个槽位一把锁，命中只需要锁住该槽位；
//! - 一把全局锁保护时钟指针，未命中时先取全局锁再取槽位锁。

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use block_dev::BlockDevice;
use log::trace;
use spin::Mutex;

use crate::{CACHE_CAPACITY, DataBlock, SECTOR_SIZE};

/// 能直接映射到扇区字节上的类型
///
/// # Safety
///
/// 实现者必须是纯数据(`repr(C)` 或基本类型数组)，任意位模式都是合法值，
/// 且对齐要求不超过 8 字节。
pub unsafe trait Plain: Sized {}

unsafe impl<const N: usize> Plain for [u8; N] {}
unsafe impl<const N: usize> Plain for [u32; N] {}

pub struct BufferCache {
    /// 受缓存管理的设备
    device: Arc<dyn BlockDevice>,
    slots: Box<[Mutex<Slot>]>,
    /// 全局仲裁锁，保护时钟指针
    hand: Mutex<usize>,
    stats: Stats,
}

/// 缓存运行以来的计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    /// 有效槽位被换出的次数
    pub evictions: usize,
    /// 脏槽位写回设备的次数
    pub write_backs: usize,
}

#[derive(Default)]
struct Stats {
    hits: AtomicUsize,
    misses: AtomicUsize,
    evictions: AtomicUsize,
    write_backs: AtomicUsize,
}

/// 缓存槽位
struct Slot {
    valid: bool,
    /// 是否为脏块
    dirty: bool,
    /// 时钟算法的访问位
    accessed: bool,
    /// 对应的扇区号
    sector: u32,
    data: SlotData,
}

#[repr(C, align(8))]
struct SlotData(DataBlock);

impl BufferCache {
    #[inline]
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self::with_capacity(device, CACHE_CAPACITY)
    }

    pub fn with_capacity(device: Arc<dyn BlockDevice>, capacity: usize) -> Self {
        assert!(capacity > 0, "buffer cache needs at least one slot");

        Self {
            device,
            slots: (0..capacity).map(|_| Mutex::new(Slot::empty())).collect(),
            hand: Mutex::new(0),
            stats: Stats::default(),
        }
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// 读出整个扇区
    pub fn read(&self, dev: &Arc<dyn BlockDevice>, sector: u32, buf: &mut [u8]) {
        assert_eq!(buf.len(), SECTOR_SIZE, "not a complete sector!");
        self.read_at(dev, sector, buf, 0);
    }

    /// 从扇区内 `offset` 处读出 `buf.len()` 字节
    pub fn read_at(&self, dev: &Arc<dyn BlockDevice>, sector: u32, buf: &mut [u8], offset: usize) {
        assert!(offset + buf.len() <= SECTOR_SIZE);
        self.access(dev, sector, true, false, |data| {
            buf.copy_from_slice(&data.0[offset..offset + buf.len()]);
        });
    }

    /// 覆写整个扇区，未命中时无需先从设备读入
    pub fn write(&self, dev: &Arc<dyn BlockDevice>, sector: u32, buf: &[u8]) {
        assert_eq!(buf.len(), SECTOR_SIZE, "not a complete sector!");
        self.write_at(dev, sector, buf, 0);
    }

    /// 把 `buf` 写到扇区内 `offset` 处，扇区的其余字节保持不变
    pub fn write_at(&self, dev: &Arc<dyn BlockDevice>, sector: u32, buf: &[u8], offset: usize) {
        assert!(offset + buf.len() <= SECTOR_SIZE);
        let whole = buf.len() == SECTOR_SIZE;
        self.access(dev, sector, !whole, true, |data| {
            data.0[offset..offset + buf.len()].copy_from_slice(buf);
        });
    }

    /// 读取对扇区的映射并处理
    #[inline]
    pub fn map<T: Plain, V>(
        &self,
        dev: &Arc<dyn BlockDevice>,
        sector: u32,
        offset: usize,
        f: impl FnOnce(&T) -> V,
    ) -> V {
        self.access(dev, sector, true, false, |data| f(data.get(offset)))
    }

    /// 以某种方式修改对扇区的映射
    #[inline]
    pub fn map_mut<T: Plain, V>(
        &self,
        dev: &Arc<dyn BlockDevice>,
        sector: u32,
        offset: usize,
        f: impl FnOnce(&mut T) -> V,
    ) -> V {
        self.access(dev, sector, true, true, |data| f(data.get_mut(offset)))
    }

    /// 复制出扇区上的一个值
    #[inline]
    pub fn load<T: Plain + Copy>(&self, dev: &Arc<dyn BlockDevice>, sector: u32, offset: usize) -> T {
        self.map(dev, sector, offset, |value: &T| *value)
    }

    /// 把值写到扇区上；值恰好占满整个扇区时不必读入旧内容
    pub fn store<T: Plain + Copy>(
        &self,
        dev: &Arc<dyn BlockDevice>,
        sector: u32,
        offset: usize,
        value: &T,
    ) {
        let whole = offset == 0 && mem::size_of::<T>() == SECTOR_SIZE;
        self.access(dev, sector, !whole, true, |data| {
            *data.get_mut(offset) = *value;
        });
    }

    /// 写回全部脏槽位
    pub fn flush(&self) {
        let _hand = self.hand.lock();
        for slot in self.slots.iter() {
            let mut slot = slot.lock();
            if slot.valid && slot.dirty {
                self.device.write_block(slot.sector as usize, &slot.data.0);
                slot.dirty = false;
                self.stats.write_backs.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// 扇区当前是否在缓存中
    pub fn contains(&self, sector: u32) -> bool {
        self.slots.iter().any(|slot| slot.lock().holds(sector))
    }

    /// 当前缓存的所有扇区，按槽位顺序
    pub fn cached_sectors(&self) -> Vec<u32> {
        self.slots
            .iter()
            .filter_map(|slot| {
                let slot = slot.lock();
                slot.valid.then_some(slot.sector)
            })
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            write_backs: self.stats.write_backs.load(Ordering::Relaxed),
        }
    }
}

impl BufferCache {
    /// `dev` 是否就是受缓存管理的设备；不是的话所有操作直通设备
    #[inline]
    fn manages(&self, dev: &Arc<dyn BlockDevice>) -> bool {
        ptr::addr_eq(Arc::as_ptr(dev), Arc::as_ptr(&self.device))
    }

    /// 在扇区的缓存副本上执行 `f`。
    ///
    /// - `load`：未命中时是否需要先从设备读入扇区
    /// - `dirty`：`f` 是否会修改扇区
    fn access<V>(
        &self,
        dev: &Arc<dyn BlockDevice>,
        sector: u32,
        load: bool,
        dirty: bool,
        f: impl FnOnce(&mut SlotData) -> V,
    ) -> V {
        if !self.manages(dev) {
            let mut data = SlotData([0; SECTOR_SIZE]);
            if load {
                dev.read_block(sector as usize, &mut data.0);
            }
            let ret = f(&mut data);
            if dirty {
                dev.write_block(sector as usize, &data.0);
            }
            return ret;
        }

        match self.hit(sector, dirty, f) {
            Ok(ret) => ret,
            Err(f) => self.evict(sector, load, dirty, f),
        }
    }

    /// 线性查找已缓存的扇区，找不到就把 `f` 原样交还
    fn hit<V, F: FnOnce(&mut SlotData) -> V>(
        &self,
        sector: u32,
        dirty: bool,
        f: F,
    ) -> Result<V, F> {
        for slot in self.slots.iter() {
            // 扇区号要在槽位锁内确认，换出可能正在进行
            let mut slot = slot.lock();
            if slot.holds(sector) {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(slot.touch(dirty, f));
            }
        }

        Err(f)
    }

    /// 时钟算法：找到访问位为 0 的槽位，写回后装入 `sector`
    fn evict<V>(
        &self,
        sector: u32,
        load: bool,
        dirty: bool,
        f: impl FnOnce(&mut SlotData) -> V,
    ) -> V {
        let mut hand = self.hand.lock();

        // 换入只发生在持有全局锁时，再查一遍就不会让同一扇区占用两个槽位
        let f = match self.hit(sector, dirty, f) {
            Ok(ret) => return ret,
            Err(f) => f,
        };
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        loop {
            *hand = (*hand + 1) % self.slots.len();
            let mut slot = self.slots[*hand].lock();

            if slot.accessed {
                // 再给一次机会
                slot.accessed = false;
                continue;
            }

            if slot.valid {
                trace!("evict sector {} from slot {}", slot.sector, *hand);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                if slot.dirty {
                    self.device.write_block(slot.sector as usize, &slot.data.0);
                    self.stats.write_backs.fetch_add(1, Ordering::Relaxed);
                }
            }

            slot.valid = true;
            slot.dirty = false;
            slot.sector = sector;
            if load {
                self.device.read_block(sector as usize, &mut slot.data.0);
            }

            drop(hand);
            return slot.touch(dirty, f);
        }
    }
}

impl Drop for BufferCache {
    fn drop(&mut self) {
        self.flush();
    }
}

impl Slot {
    const fn empty() -> Self {
        Self {
            valid: false,
            dirty: false,
            accessed: false,
            sector: 0,
            data: SlotData([0; SECTOR_SIZE]),
        }
    }

    #[inline]
    fn holds(&self, sector: u32) -> bool {
        self.valid && self.sector == sector
    }

    #[inline]
    fn touch<V>(&mut self, dirty: bool, f: impl FnOnce(&mut SlotData) -> V) -> V {
        self.accessed = true;
        self.dirty |= dirty;
        f(&mut self.data)
    }
}

impl SlotData {
    fn get<T: Plain>(&self, offset: usize) -> &T {
        let type_size = mem::size_of::<T>();
        assert!(type_size + offset <= SECTOR_SIZE);
        let addr = self.0[offset..].as_ptr().cast::<T>();
        assert!(addr.is_aligned());
        unsafe { &*addr }
    }

    fn get_mut<T: Plain>(&mut self, offset: usize) -> &mut T {
        let type_size = mem::size_of::<T>();
        assert!(type_size + offset <= SECTOR_SIZE);
        let addr = self.0[offset..].as_mut_ptr().cast::<T>();
        assert!(addr.is_aligned());
        unsafe { &mut *addr }
    }
}
