
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use block_dev::{BlockDevice, SECTOR_SIZE};
use log::info;
use sector_fs::{Bitmap, DiskInode, FileSystem, FreeMap};

/// 用宿主机上的文件充当块设备
#[derive(Debug)]
pub struct BlockFile(Mutex<File>);

impl BlockFile {
    pub fn new(fd: File) -> Self {
        Self(Mutex::new(fd))
    }

    /// 镜像包含的扇区数
    pub fn sectors(&self) -> io::Result<usize> {
        let len = self.0.lock().unwrap().metadata()?.len();
        Ok(len as usize / SECTOR_SIZE)
    }
}

impl BlockDevice for BlockFile {
    fn read_block(&self, sector: usize, buf: &mut [u8]) {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start((sector * SECTOR_SIZE) as u64))
            .expect("seeking error");
        file.read_exact(buf).expect("not a complete sector!");
    }

    fn write_block(&self, sector: usize, buf: &[u8]) {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start((sector * SECTOR_SIZE) as u64))
            .expect("seeking error");
        file.write_all(buf).expect("not a complete sector!");
    }
}

/// 格式化一个 `sectors` 个扇区的镜像，把 `files` 逐个拷进去。
/// 返回每个文件的 inode 所在扇区。
pub fn pack(image: &Path, sectors: usize, files: &[PathBuf]) -> io::Result<Vec<u32>> {
    let fd = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(image)?;
    fd.set_len((sectors * SECTOR_SIZE) as u64)?;

    let free_map = Arc::new(Bitmap::new(sectors));
    // 扇区号 0 表示空指针，不能分配出去
    free_map.reserve(0, 1);
    let fs = FileSystem::new(Arc::new(BlockFile::new(fd)), free_map.clone());

    let mut inodes = Vec::with_capacity(files.len());
    for path in files {
        let data = fs::read(path)?;
        let sector = free_map
            .alloc(1)
            .ok_or_else(|| io::Error::other(sector_fs::Error::NoSpace))?;
        fs.create(sector, data.len(), false)
            .map_err(io::Error::other)?;
        let written = fs.open(sector).write_at(0, &data);
        if written != data.len() {
            return Err(io::Error::other(format!(
                "{path:?}: wrote {written} of {} bytes",
                data.len()
            )));
        }

        info!("{path:?}: {} bytes at inode {sector}", data.len());
        inodes.push(sector);
    }

    fs.flush();
    info!("{} sectors left", free_map.free_count());
    Ok(inodes)
}

/// 读出镜像中 inode 位于 `sector` 的整个文件
pub fn cat(image: &Path, sector: u32) -> io::Result<Vec<u8>> {
    let block_file = BlockFile::new(File::open(image)?);
    let sectors = block_file.sectors()?;
    if sector == 0 || sector as usize >= sectors {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("sector {sector} is not an inode of a {sectors}-sector image"),
        ));
    }

    // 只读不写，空闲位图用不上
    let fs = FileSystem::new(Arc::new(block_file), Arc::new(Bitmap::new(sectors)));
    // 打开损坏的 inode 会直接 panic，先确认魔数
    let disk_inode: DiskInode = fs.cache().load(fs.device(), sector, 0);
    if !disk_inode.is_valid() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("sector {sector} does not hold an inode"),
        ));
    }
    let inode = fs.open(sector);
    let mut data = vec![0; inode.length()];
    inode.read_at(0, &mut data);
    Ok(data)
}
