use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use spin::Mutex;
use thiserror::Error;

use crate::hal::storage::{BlockDevice, IoErr, SECTOR_SIZE};

use super::{
    DirEntry, EXT2_GOOD_OLD_INODE_SIZE, EXT2_GOOD_OLD_REV, EXT2_SUPERBLOCK_START, Ext2Err,
    GroupDescriptor, Inode, SuperBlock,
};

#[derive(Debug, Error)]
pub enum ProbeErr {
    #[error("Block device error: {0}")]
    Io(#[from] IoErr),
    #[error("Not an ext2 filesystem")]
    BadMagic,
    #[error("Unusable filesystem geometry")]
    BadGeometry,
}

/// One attached ext2 filesystem.
///
/// The geometry fields are cached from the superblock at probe time and
/// never change afterwards; the engine does not alter geometry on disk. All
/// operations serialize on the device mutex, which is held for the whole
/// operation.
#[derive(Debug)]
pub struct Ext2Dev {
    pub(crate) device: Mutex<Box<dyn BlockDevice>>,

    pub block_size: u32,
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub inodes_per_group: u32,
    pub blocks_per_group: u32,
    pub blockgroups_count: u32,
    pub rev_level: u32,
    pub inode_size: u16,
}

impl Ext2Dev {
    /// Reads the superblock through the non-suspending sector path and
    /// builds a device handle from it.
    ///
    /// A device that does not carry the ext2 magic is not an error in any
    /// interesting sense; callers are expected to skip it.
    pub fn probe(mut device: Box<dyn BlockDevice>) -> Result<Self, ProbeErr> {
        let mut raw = [0u8; 2 * SECTOR_SIZE];
        let first_sector = EXT2_SUPERBLOCK_START / SECTOR_SIZE as u64;

        for i in 0..2 {
            device.read_sector_nosleep(
                first_sector + i as u64,
                &mut raw[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE],
            )?;
        }

        let superblock: SuperBlock = bytemuck::pod_read_unaligned(&raw[..size_of::<SuperBlock>()]);

        if !superblock.is_valid() {
            return Err(ProbeErr::BadMagic);
        }
        if superblock.s_inodes_per_group == 0 || superblock.s_blocks_per_group == 0 {
            return Err(ProbeErr::BadGeometry);
        }

        let inode_size = if superblock.s_rev_level == EXT2_GOOD_OLD_REV {
            EXT2_GOOD_OLD_INODE_SIZE
        } else {
            superblock.s_inode_size
        };
        if (inode_size as usize) < size_of::<Inode>() {
            return Err(ProbeErr::BadGeometry);
        }

        Ok(Self {
            device: Mutex::new(device),
            block_size: superblock.block_size(),
            inodes_count: superblock.s_inodes_count,
            blocks_count: superblock.s_blocks_count,
            inodes_per_group: superblock.s_inodes_per_group,
            blocks_per_group: superblock.s_blocks_per_group,
            blockgroups_count: superblock
                .s_inodes_count
                .div_ceil(superblock.s_inodes_per_group),
            rev_level: superblock.s_rev_level,
            inode_size,
        })
    }

    pub(crate) fn sectors_per_block(&self) -> u64 {
        self.block_size as u64 / SECTOR_SIZE as u64
    }

    pub(crate) fn pointers_per_block(&self) -> u64 {
        self.block_size as u64 / 4
    }

    /// First byte of the block-group descriptor table: the start of the
    /// first block at or past byte 2048.
    pub(crate) fn bgdt_start(&self) -> u64 {
        2048u64.div_ceil(self.block_size as u64) * self.block_size as u64
    }

    pub async fn superblock_read(&self) -> Result<SuperBlock, Ext2Err> {
        let mut device = self.device.lock();
        self.superblock_read_locked(&mut **device).await
    }

    pub async fn bgdesc_read(&self, bgnum: u32) -> Result<GroupDescriptor, Ext2Err> {
        let mut device = self.device.lock();
        self.bgdesc_read_locked(&mut **device, bgnum).await
    }

    pub async fn inode_read(&self, inum: u32) -> Result<Inode, Ext2Err> {
        let mut device = self.device.lock();
        self.inode_read_locked(&mut **device, inum).await
    }

    pub async fn inode_write(&self, inum: u32, inode: &Inode) -> Result<(), Ext2Err> {
        let mut device = self.device.lock();
        self.inode_write_locked(&mut **device, inum, inode).await
    }

    /// Allocates a free inode and returns its number.
    pub async fn inode_allocate(&self) -> Result<u32, Ext2Err> {
        let mut device = self.device.lock();
        self.inode_allocate_locked(&mut **device).await
    }

    pub async fn inode_free(&self, inum: u32) -> Result<(), Ext2Err> {
        let mut device = self.device.lock();
        self.inode_free_locked(&mut **device, inum).await
    }

    /// Allocates a free block, preferring the block group holding
    /// `inode_hint` so a file's data lands near its inode.
    pub async fn block_allocate(&self, inode_hint: u32) -> Result<u32, Ext2Err> {
        let mut device = self.device.lock();
        self.block_allocate_locked(&mut **device, inode_hint).await
    }

    pub async fn block_free(&self, blknum: u32) -> Result<(), Ext2Err> {
        let mut device = self.device.lock();
        self.block_free_locked(&mut **device, blknum).await
    }

    /// Reads `buf.len()` bytes of file content starting at `offset`.
    ///
    /// Holes read as zeroes unless `failonzero` is set, in which case an
    /// unallocated block anywhere on the path is an error.
    pub async fn file_read(
        &self,
        inum: u32,
        buf: &mut [u8],
        offset: u64,
        failonzero: bool,
    ) -> Result<(), Ext2Err> {
        let mut device = self.device.lock();
        self.file_read_locked(&mut **device, inum, buf, offset, failonzero)
            .await
    }

    /// Writes `buf.len()` bytes of file content starting at `offset`,
    /// allocating data and index blocks as needed.
    pub async fn file_write(&self, inum: u32, buf: &[u8], offset: u64) -> Result<(), Ext2Err> {
        let mut device = self.device.lock();
        self.file_write_locked(&mut **device, inum, buf, offset)
            .await
    }

    /// Creates a file, directory, symlink or device node named `name` in
    /// the directory `parent_inum` and returns the new inode number.
    pub async fn create(
        &self,
        parent_inum: u32,
        name: &str,
        mode: u16,
        uid: u16,
        gid: u16,
        symlink_target: Option<&[u8]>,
    ) -> Result<u32, Ext2Err> {
        let mut device = self.device.lock();
        self.create_locked(&mut **device, parent_inum, name, mode, uid, gid, symlink_target)
            .await
    }

    /// Lists the live entries of the directory `inum`.
    pub async fn read_dir(&self, inum: u32) -> Result<Vec<DirEntry>, Ext2Err> {
        let mut device = self.device.lock();
        self.read_dir_locked(&mut **device, inum).await
    }

    /// Looks `name` up in the directory `parent_inum`.
    pub async fn dir_lookup(&self, parent_inum: u32, name: &str) -> Result<Option<u32>, Ext2Err> {
        let mut device = self.device.lock();
        self.dir_lookup_locked(&mut **device, parent_inum, name)
            .await
    }

    /// Resolves a symlink's target bytes.
    pub async fn symlink_target(&self, inum: u32) -> Result<String, Ext2Err> {
        let mut device = self.device.lock();
        self.symlink_target_locked(&mut **device, inum).await
    }
}
