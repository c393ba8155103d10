//! # 磁盘数据结构层
//!
//! 每个 inode 独占一个扇区，通过三级块索引指向数据扇区：
//! 直接索引 | 一级索引 | 二级索引

mod inode;
pub use inode::{DiskInode, MAX_FILE_SECTORS, MAX_LENGTH};
