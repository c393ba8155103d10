#![no_std]

extern crate alloc;

/* sector-fs 的整体架构，自上而下 */

// 索引节点层：打开、关闭、读写文件
mod vfs;

// 打开的索引节点登记表
mod fs;

// 磁盘数据结构层：多级块索引
mod layout;

// 空闲扇区分配
mod free_map;

// 块缓存层：时钟置换的扇区缓存
mod block_cache;

mod error;

#[cfg(test)]
mod test_util;

pub use block_dev::{BlockDevice, SECTOR_SIZE};

pub use self::{
    block_cache::{BufferCache, CacheStats, Plain},
    error::Error,
    free_map::{Bitmap, FreeMap},
    fs::FileSystem,
    layout::{DiskInode, MAX_FILE_SECTORS, MAX_LENGTH},
    vfs::Inode,
};

/// 磁盘 inode 的魔数
pub const MAGIC: u32 = 0x494e4f44;
/// 块缓存默认的槽位数
pub const CACHE_CAPACITY: usize = 64;

pub type DataBlock = [u8; SECTOR_SIZE];
