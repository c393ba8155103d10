//! # 块设备接口层
//!
//! 块设备是以**扇区**为单位存储数据的设备，例如磁盘、U盘等；
//! [`BlockDevice`] 就是对读写块设备的抽象，
//! 实现了此特质的类型称为**块设备驱动**。
//!
//! 读写都是同步的：调用返回时设备操作已经完成。

#![no_std]

use core::any::Any;

/// 扇区大小，设备每次读写恰好一个扇区
pub const SECTOR_SIZE: usize = 512;

/// 块设备驱动特质
pub trait BlockDevice: Send + Sync + Any {
    /// 读出编号为 `sector` 的扇区，`buf` 的长度必须是 [`SECTOR_SIZE`]
    fn read_block(&self, sector: usize, buf: &mut [u8]);
    /// 写入编号为 `sector` 的扇区，`buf` 的长度必须是 [`SECTOR_SIZE`]
    fn write_block(&self, sector: usize, buf: &[u8]);
}
