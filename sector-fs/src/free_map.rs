//! # 空闲扇区分配
//!
//! inode 层只通过 [`FreeMap`] 申请和归还扇区；
//! [`Bitmap`] 是一个驻留内存的参考实现，每个比特对应设备上的一个扇区。

use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

pub trait FreeMap: Send + Sync {
    /// 分配 `count` 个连续扇区，返回首个扇区号；空间用尽则返回空
    fn alloc(&self, count: usize) -> Option<u32>;
    /// 归还从 `sector` 开始的 `count` 个扇区
    fn release(&self, sector: u32, count: usize);
}

/// 位图，记录设备扇区的分配情况
#[derive(Debug)]
pub struct Bitmap {
    groups: Mutex<Vec<u64>>,
    /// 位图所指示的扇区总数
    capacity: usize,
}

impl Bitmap {
    pub fn new(capacity: usize) -> Self {
        let mut groups = vec![0; capacity.div_ceil(64)];
        // 超出容量的尾部比特视为已占用
        if capacity % 64 != 0 {
            *groups.last_mut().unwrap() = u64::MAX << (capacity % 64);
        }

        Self {
            groups: Mutex::new(groups),
            capacity,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 标记扇区为已占用，用于保留空闲位图之外已有用途的扇区
    pub fn reserve(&self, sector: u32, count: usize) {
        let mut groups = self.groups.lock();
        for sector in sector as usize..sector as usize + count {
            let (group_index, ingroup_index) = locate(sector);
            assert_eq!(groups[group_index] & (1 << ingroup_index), 0);
            groups[group_index] |= 1 << ingroup_index;
        }
    }

    pub fn is_allocated(&self, sector: u32) -> bool {
        let (group_index, ingroup_index) = locate(sector as usize);
        self.groups.lock()[group_index] & (1 << ingroup_index) != 0
    }

    /// 剩余的空闲扇区数
    pub fn free_count(&self) -> usize {
        self.groups
            .lock()
            .iter()
            .map(|bits| bits.count_zeros() as usize)
            .sum()
    }
}

impl FreeMap for Bitmap {
    fn alloc(&self, count: usize) -> Option<u32> {
        let mut groups = self.groups.lock();

        if count == 1 {
            // 寻找还有剩余空间的比特组(即还有0)
            let (group_index, ingroup_index) =
                groups
                    .iter()
                    .enumerate()
                    .find_map(|(group_index, &bits)| {
                        (bits != u64::MAX).then_some((group_index, bits.trailing_ones()))
                    })?;
            groups[group_index] |= 1 << ingroup_index;
            return Some((group_index * 64 + ingroup_index as usize) as u32);
        }

        // 连续分配：逐位寻找长度为 count 的空闲区间
        let mut start = 0;
        let mut run = 0;
        for sector in 0..self.capacity {
            let (group_index, ingroup_index) = locate(sector);
            if groups[group_index] & (1 << ingroup_index) != 0 {
                run = 0;
                start = sector + 1;
                continue;
            }

            run += 1;
            if run == count {
                for sector in start..start + count {
                    let (group_index, ingroup_index) = locate(sector);
                    groups[group_index] |= 1 << ingroup_index;
                }
                return Some(start as u32);
            }
        }

        None
    }

    fn release(&self, sector: u32, count: usize) {
        let mut groups = self.groups.lock();
        for sector in sector as usize..sector as usize + count {
            let (group_index, ingroup_index) = locate(sector);
            // 编号一定得有对应的位
            assert_ne!(
                groups[group_index] & (1 << ingroup_index),
                0,
                "release of free sector {sector}"
            );
            groups[group_index] &= !(1 << ingroup_index);
        }
    }
}

/// 扇区号到 (比特组, 组内位置) 的线性映射
#[inline]
fn locate(sector: usize) -> (usize, usize) {
    (sector / 64, sector % 64)
}
