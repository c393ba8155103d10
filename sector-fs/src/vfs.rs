//! # 索引节点层
//!
//! [`Inode`] 是打开的 inode 的句柄。同一扇区的所有句柄共享一份内存中的 inode，
//! 数据本身永远经由块缓存读写磁盘 inode。

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use log::debug;

use crate::fs::OpenInode;
use crate::layout::DiskInode;
use crate::{Error, FileSystem};

pub struct Inode {
    fs: Arc<FileSystem>,
    open: Arc<OpenInode>,
    /// 本句柄是否禁止了写入
    denied: AtomicBool,
}

impl Inode {
    pub(crate) fn new(fs: Arc<FileSystem>, open: Arc<OpenInode>) -> Self {
        Self {
            fs,
            open,
            denied: AtomicBool::new(false),
        }
    }

    /// 再打开一次，得到一个新句柄
    pub fn reopen(&self) -> Self {
        // 持有句柄意味着计数至少为 1，无需经过登记表
        self.open.state.lock().open_count += 1;
        Self::new(self.fs.clone(), self.open.clone())
    }

    /// 关闭句柄；最后一个句柄关闭时，被删除的 inode 归还所有扇区
    #[inline]
    pub fn close(self) {}

    /// 标记删除，待最后一个句柄关闭时回收
    pub fn remove(&self) {
        self.open.state.lock().removed = true;
        debug!("inode {}: marked removed", self.open.sector);
    }

    pub fn is_removed(&self) -> bool {
        self.open.state.lock().removed
    }

    /// inode 的编号，即其所在扇区
    #[inline]
    pub fn inumber(&self) -> u32 {
        self.open.sector
    }

    pub fn open_count(&self) -> usize {
        self.open.state.lock().open_count
    }

    pub fn is_dir(&self) -> bool {
        self.disk_inode().is_dir()
    }

    pub fn length(&self) -> usize {
        self.disk_inode().length as usize
    }

    /// 目录下存活的子项个数
    pub fn children(&self) -> u32 {
        self.disk_inode().children
    }

    pub fn add_child(&self) {
        self.update(|disk_inode| disk_inode.children += 1);
    }

    pub fn remove_child(&self) {
        self.update(|disk_inode| {
            assert!(disk_inode.children > 0, "no child to remove");
            disk_inode.children -= 1;
        });
    }

    /// 返回存放第 `pos` 字节的扇区
    pub fn byte_to_sector(&self, pos: usize) -> Option<u32> {
        let _guard = self.open.lock.read();
        self.disk_inode().byte_to_sector(pos, self.fs.cache())
    }

    /// 从 `offset` 开始读满 `buf`，返回读取的字节数。
    /// 所读区间越过文件末尾时什么也不读。
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let _guard = self.open.lock.read();
        self.disk_inode().read_at(offset, buf, self.fs.cache())
    }

    /// 从 `offset` 开始写入 `buf`，必要时先扩展文件，返回写入的字节数。
    /// 禁止写入或空间不足时什么也不写。
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        if buf.is_empty() || self.is_write_denied() {
            return 0;
        }
        let Some(end) = offset.checked_add(buf.len()) else {
            return 0;
        };

        // 共享持有 inode 锁期间，索引树只会变大，拷贝出来的 inode 一直有效
        let mut guard = self.open.lock.read();
        let mut disk_inode = self.disk_inode();
        if end > disk_inode.length as usize {
            drop(guard);
            let exclusive = self.open.lock.write();
            // 等锁期间别的写者可能已经扩展过了
            disk_inode = self.disk_inode();
            if end > disk_inode.length as usize
                && disk_inode
                    .resize(self.open.sector, end, self.fs.cache(), self.fs.free_map())
                    .is_err()
            {
                return 0;
            }
            guard = exclusive.downgrade();
        }

        let written = disk_inode.write_at(offset, buf, self.fs.cache());
        drop(guard);
        written
    }

    /// 把文件长度调整为 `length` 字节；缩短时等待进行中的读写全部结束
    pub fn resize(&self, length: usize) -> Result<(), Error> {
        let _guard = self.open.lock.write();
        let mut disk_inode = self.disk_inode();
        disk_inode.resize(self.open.sector, length, self.fs.cache(), self.fs.free_map())
    }

    /// 禁止所有句柄写入，每个句柄至多调用一次
    pub fn deny_write(&self) {
        let mut deny_write = self.open.deny_write.lock();
        assert!(
            !self.denied.swap(true, Ordering::Relaxed),
            "write already denied by this handle"
        );
        *deny_write += 1;
        assert!(*deny_write <= self.open.state.lock().open_count);
    }

    /// 撤销本句柄的 [`Inode::deny_write`]
    pub fn allow_write(&self) {
        let mut deny_write = self.open.deny_write.lock();
        assert!(
            self.denied.swap(false, Ordering::Relaxed),
            "write not denied by this handle"
        );
        *deny_write -= 1;
    }

    pub fn is_write_denied(&self) -> bool {
        *self.open.deny_write.lock() > 0
    }
}

impl Inode {
    #[inline]
    fn disk_inode(&self) -> DiskInode {
        self.fs.disk_inode(self.open.sector)
    }

    /// 独占 inode 锁修改磁盘 inode
    fn update<V>(&self, f: impl FnOnce(&mut DiskInode) -> V) -> V {
        let _guard = self.open.lock.write();
        let dev = self.fs.device();
        self.fs.cache().map_mut(dev, self.open.sector, 0, f)
    }
}

impl Clone for Inode {
    #[inline]
    fn clone(&self) -> Self {
        self.reopen()
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        if *self.denied.get_mut() {
            self.allow_write();
        }
        self.fs.close(&self.open);
    }
}
