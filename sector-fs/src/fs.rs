//! # 打开的索引节点登记表
//!
//! 同一扇区上的 inode 在内存中至多存在一份：
//! 第一次打开时创建并登记，之后的打开共享它，最后一个句柄关闭时注销。
//! 被标记删除的 inode 在注销时归还整棵索引树以及自身所在的扇区。

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use block_dev::BlockDevice;
use log::debug;
use spin::{Mutex, RwLock};

use crate::layout::DiskInode;
use crate::{BufferCache, CACHE_CAPACITY, Error, FreeMap, Inode};

pub struct FileSystem {
    device: Arc<dyn BlockDevice>,
    cache: BufferCache,
    free_map: Arc<dyn FreeMap>,
    /// 以扇区号为键
    open_inodes: Mutex<BTreeMap<u32, Arc<OpenInode>>>,
}

/// 内存中的 inode，由登记表持有
#[derive(Debug)]
pub(crate) struct OpenInode {
    pub sector: u32,
    pub state: Mutex<OpenState>,
    /// inode 锁：读写数据时共享持有，修改磁盘 inode(伸缩、子项计数)时独占
    pub lock: RwLock<()>,
    /// 禁止写入的计数
    pub deny_write: Mutex<usize>,
}

#[derive(Debug)]
pub(crate) struct OpenState {
    pub open_count: usize,
    pub removed: bool,
}

impl FileSystem {
    #[inline]
    pub fn new(device: Arc<dyn BlockDevice>, free_map: Arc<dyn FreeMap>) -> Arc<Self> {
        Self::with_cache_capacity(device, free_map, CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(
        device: Arc<dyn BlockDevice>,
        free_map: Arc<dyn FreeMap>,
        cache_capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache: BufferCache::with_capacity(device.clone(), cache_capacity),
            device,
            free_map,
            open_inodes: Mutex::new(BTreeMap::new()),
        })
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    #[inline]
    pub fn cache(&self) -> &BufferCache {
        &self.cache
    }

    #[inline]
    pub fn free_map(&self) -> &dyn FreeMap {
        &*self.free_map
    }

    /// 在扇区 `sector` 上创建长为 `length` 字节的 inode。
    /// 扇区本身由调用者从空闲位图中申请。
    pub fn create(&self, sector: u32, length: usize, is_dir: bool) -> Result<(), Error> {
        let mut disk_inode = DiskInode::new(is_dir);
        self.cache.store(&self.device, sector, 0, &disk_inode);
        disk_inode.resize(sector, length, &self.cache, &*self.free_map)
    }

    /// 打开扇区 `sector` 上的 inode；已经打开的话共享同一份
    pub fn open(self: &Arc<Self>, sector: u32) -> Inode {
        let mut open_inodes = self.open_inodes.lock();

        let open = match open_inodes.get(&sector) {
            Some(open) => {
                open.state.lock().open_count += 1;
                open.clone()
            }
            None => {
                self.disk_inode(sector);
                debug!("inode {sector}: opened");
                let open = Arc::new(OpenInode::new(sector));
                open_inodes.insert(sector, open.clone());
                open
            }
        };

        Inode::new(self.clone(), open)
    }

    /// 当前打开的 inode 个数
    pub fn open_inodes(&self) -> usize {
        self.open_inodes.lock().len()
    }

    /// 写回块缓存中的全部脏扇区
    #[inline]
    pub fn flush(&self) {
        self.cache.flush();
    }
}

impl FileSystem {
    /// 复制出磁盘 inode；魔数不对说明磁盘已经损坏，无法继续
    pub(crate) fn disk_inode(&self, sector: u32) -> DiskInode {
        let disk_inode: DiskInode = self.cache.load(&self.device, sector, 0);
        assert!(disk_inode.is_valid(), "corrupted inode at sector {sector}");
        disk_inode
    }

    /// 一个句柄关闭
    pub(crate) fn close(&self, open: &OpenInode) {
        let mut open_inodes = self.open_inodes.lock();

        let mut state = open.state.lock();
        state.open_count -= 1;
        if state.open_count > 0 {
            return;
        }
        let removed = state.removed;
        drop(state);

        open_inodes.remove(&open.sector);
        drop(open_inodes);
        debug!("inode {}: closed, removed={removed}", open.sector);

        if removed {
            let mut disk_inode = self.disk_inode(open.sector);
            disk_inode.clear(&self.cache, &*self.free_map);
            self.free_map.release(open.sector, 1);
        }
    }
}

impl OpenInode {
    fn new(sector: u32) -> Self {
        Self {
            sector,
            state: Mutex::new(OpenState {
                open_count: 1,
                removed: false,
            }),
            lock: RwLock::new(()),
            deny_write: Mutex::new(0),
        }
    }
}
