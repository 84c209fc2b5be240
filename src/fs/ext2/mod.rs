pub mod allocator;
pub mod block_map;
pub mod create_file;
pub mod dirs;
pub mod format;
pub mod init;
pub mod managers;
pub mod read;
pub mod structs;
pub mod write;

mod inode;

#[cfg(test)]
mod tests;

use alloc::string::String;
use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use crate::hal::storage::IoErr;

pub use structs::Ext2Dev;

/// The ext2 superblock - located at byte offset 1024 from the start of the
/// device. All fields are stored little-endian on disk.
///
/// Only the geometry and free-counter fields are consumed; everything else
/// is carried through read-modify-write untouched.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SuperBlock {
    // Base fields (revision 0 and 1)
    pub s_inodes_count: u32,
    pub s_blocks_count: u32,
    pub s_r_blocks_count: u32,
    pub s_free_blocks_count: u32,
    pub s_free_inodes_count: u32,
    pub s_first_data_block: u32,
    pub s_log_block_size: u32, // block size = 1024 << s_log_block_size
    pub s_log_frag_size: u32,
    pub s_blocks_per_group: u32,
    pub s_frags_per_group: u32,
    pub s_inodes_per_group: u32,
    pub s_mtime: u32,
    pub s_wtime: u32,
    pub s_mnt_count: u16,
    pub s_max_mnt_count: u16,
    pub s_magic: u16, // 0xEF53
    pub s_state: u16,
    pub s_errors: u16,
    pub s_minor_rev_level: u16,
    pub s_lastcheck: u32,
    pub s_checkinterval: u32,
    pub s_creator_os: u32,
    pub s_rev_level: u32,
    pub s_def_resuid: u16,
    pub s_def_resgid: u16,

    // Extended fields (EXT2_DYNAMIC_REV - revision 1)
    pub s_first_ino: u32,
    pub s_inode_size: u16,
    pub s_block_group_nr: u16,
    pub s_feature_compat: u32,
    pub s_feature_incompat: u32,
    pub s_feature_ro_compat: u32,
    pub s_uuid: [u8; 16],
    pub s_volume_name: [u8; 16],
    pub s_last_mounted: [u8; 64],
    pub s_algo_bitmap: u32,

    // Performance hints
    pub s_prealloc_blocks: u8,
    pub s_prealloc_dir_blocks: u8,
    pub s_padding1: u16,

    // Journaling support (ext3)
    pub s_journal_uuid: [u8; 16],
    pub s_journal_inum: u32,
    pub s_journal_dev: u32,
    pub s_last_orphan: u32,

    // Directory indexing support (HTREE)
    pub s_hash_seed: [u32; 4],
    pub s_def_hash_version: u8,
    pub s_reserved_word: [u8; 3],

    pub s_default_mount_opts: u32,
    pub s_first_meta_bg: u32,
}

/// Block group descriptor - 32 bytes, packed into the descriptor table
/// right after the superblock.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct GroupDescriptor {
    pub bg_block_bitmap: u32,
    pub bg_inode_bitmap: u32,
    pub bg_inode_table: u32,
    pub bg_free_blocks_count: u16,
    pub bg_free_inodes_count: u16,
    pub bg_used_dirs_count: u16,
    pub bg_pad: u16,
    pub bg_reserved: [u8; 12],
}

/// On-disk inode record. Inodes are 1-based; inode 0 does not exist.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct Inode {
    pub i_mode: u16,
    pub i_uid: u16,
    pub i_size: u32,
    pub i_atime: u32,
    pub i_ctime: u32,
    pub i_mtime: u32,
    pub i_dtime: u32,
    pub i_gid: u16,
    pub i_links_count: u16,
    pub i_blocks: u32, // count of 512-byte sectors
    pub i_flags: u32,
    pub i_osd1: u32,
    pub i_block: [u32; 15], // 12 direct + singly/doubly/triply indirect
    pub i_generation: u32,
    pub i_file_acl: u32,
    pub i_dir_acl: u32,
    pub i_faddr: u32,
    pub i_osd2: [u8; 12],
}

/// Fixed-size head of a directory entry; the name bytes follow it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DirEntryHeader {
    pub inode: u32,
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: u8,
}

/// A directory entry record with its decoded name.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub inode: u32,
    pub rec_len: u16,
    pub file_type: u8,
    pub name: String,
}

const _: () = assert!(size_of::<SuperBlock>() == 264);
const _: () = assert!(size_of::<GroupDescriptor>() == 32);
const _: () = assert!(size_of::<Inode>() == 128);
const _: () = assert!(size_of::<DirEntryHeader>() == 8);

pub const EXT2_SUPERBLOCK_START: u64 = 1024;

// Magic number
pub const EXT2_SUPER_MAGIC: u16 = 0xEF53;

// Revision levels for s_rev_level
pub const EXT2_GOOD_OLD_REV: u32 = 0;
pub const EXT2_DYNAMIC_REV: u32 = 1;

// Inode record size when s_rev_level == EXT2_GOOD_OLD_REV
pub const EXT2_GOOD_OLD_INODE_SIZE: u16 = 128;

// Filesystem state values for s_state
pub const EXT2_VALID_FS: u16 = 0x0001;
pub const EXT2_ERROR_FS: u16 = 0x0002;

// Error handling methods for s_errors
pub const EXT2_ERRORS_CONTINUE: u16 = 1;

// Creator OS values for s_creator_os
pub const EXT2_OS_LINUX: u32 = 0;

// File type values for directory entries (file_type field)
pub const EXT2_FT_UNKNOWN: u8 = 0;
pub const EXT2_FT_REG_FILE: u8 = 1;
pub const EXT2_FT_DIR: u8 = 2;
pub const EXT2_FT_CHRDEV: u8 = 3;
pub const EXT2_FT_BLKDEV: u8 = 4;
pub const EXT2_FT_FIFO: u8 = 5;
pub const EXT2_FT_SOCK: u8 = 6;
pub const EXT2_FT_SYMLINK: u8 = 7;

// File mode bits (i_mode)
pub const EXT2_S_IFSOCK: u16 = 0xC000;
pub const EXT2_S_IFLNK: u16 = 0xA000;
pub const EXT2_S_IFREG: u16 = 0x8000;
pub const EXT2_S_IFBLK: u16 = 0x6000;
pub const EXT2_S_IFDIR: u16 = 0x4000;
pub const EXT2_S_IFCHR: u16 = 0x2000;
pub const EXT2_S_IFIFO: u16 = 0x1000;

// Reserved inode numbers
pub const EXT2_ROOT_INO: u32 = 2;

// i_block layout
pub const EXT2_DIRECT_BLOCKS: u32 = 12;
pub const EXT2_SINGLY_INDIRECT_SLOT: usize = 12;
pub const EXT2_DOUBLY_INDIRECT_SLOT: usize = 13;
pub const EXT2_TRIPLY_INDIRECT_SLOT: usize = 14;

// Symlink targets up to this length live inside i_block itself
pub const EXT2_SYMLINK_INLINE_MAX: usize = 60;

pub const DIR_ENTRY_HEADER_SIZE: usize = size_of::<DirEntryHeader>();
pub const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Clone, Error)]
pub enum Ext2Err {
    #[error("Block device error: {0}")]
    Io(#[from] IoErr),
    #[error("Unmapped block under strict read")]
    UnmappedBlock,
    #[error("No space left on device")]
    NoSpace,
    #[error("File too big")]
    FileTooBig,
    #[error("Not a directory")]
    NotDirectory,
    #[error("Name too long")]
    NameTooLong,
    #[error("Malformed directory entry")]
    BadDirEntry,
}

/// Rounds up to the 4-byte alignment directory records are packed with.
pub(crate) const fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Maps the file-format bits of an inode mode to the directory entry
/// type-indicator byte.
pub fn file_type_from_mode(mode: u16) -> u8 {
    match mode & 0xF000 {
        EXT2_S_IFREG => EXT2_FT_REG_FILE,
        EXT2_S_IFDIR => EXT2_FT_DIR,
        EXT2_S_IFCHR => EXT2_FT_CHRDEV,
        EXT2_S_IFBLK => EXT2_FT_BLKDEV,
        EXT2_S_IFIFO => EXT2_FT_FIFO,
        EXT2_S_IFSOCK => EXT2_FT_SOCK,
        EXT2_S_IFLNK => EXT2_FT_SYMLINK,
        _ => EXT2_FT_UNKNOWN,
    }
}

impl SuperBlock {
    /// Returns the block size in bytes.
    pub fn block_size(&self) -> u32 {
        1024 << self.s_log_block_size
    }

    /// Checks the magic signature.
    pub fn is_valid(&self) -> bool {
        self.s_magic == EXT2_SUPER_MAGIC
    }

    pub fn is_dynamic_rev(&self) -> bool {
        self.s_rev_level >= EXT2_DYNAMIC_REV
    }
}

impl Inode {
    /// Returns the file format bits of the mode field.
    pub fn file_type(&self) -> u16 {
        self.i_mode & 0xF000
    }

    pub fn is_directory(&self) -> bool {
        self.file_type() == EXT2_S_IFDIR
    }

    pub fn is_regular_file(&self) -> bool {
        self.file_type() == EXT2_S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == EXT2_S_IFLNK
    }
}

impl DirEntry {
    /// The record length a fresh entry for `name_len` name bytes needs.
    pub fn record_length(name_len: usize) -> u16 {
        align4(DIR_ENTRY_HEADER_SIZE + name_len) as u16
    }

    /// Decodes the record at the start of `buf`.
    ///
    /// Records whose `rec_len` cannot hold their own name, or is not
    /// 4-byte aligned, would wedge every scan loop walking the block and
    /// are rejected instead.
    pub fn parse(buf: &[u8]) -> Result<DirEntry, Ext2Err> {
        if buf.len() < DIR_ENTRY_HEADER_SIZE {
            return Err(Ext2Err::BadDirEntry);
        }
        let header: DirEntryHeader =
            bytemuck::pod_read_unaligned(&buf[..DIR_ENTRY_HEADER_SIZE]);

        let rec_len = header.rec_len as usize;
        if rec_len < DIR_ENTRY_HEADER_SIZE + header.name_len as usize
            || rec_len % 4 != 0
            || rec_len > buf.len()
        {
            return Err(Ext2Err::BadDirEntry);
        }

        let name_end = DIR_ENTRY_HEADER_SIZE + header.name_len as usize;
        let name = String::from_utf8_lossy(&buf[DIR_ENTRY_HEADER_SIZE..name_end]).into_owned();

        Ok(DirEntry {
            inode: header.inode,
            rec_len: header.rec_len,
            file_type: header.file_type,
            name,
        })
    }

    /// Encodes the record into `buf`, which must hold at least
    /// `8 + name.len()` bytes. Bytes between the name and `rec_len` are
    /// left as they are.
    pub fn encode_into(&self, buf: &mut [u8]) {
        let header = DirEntryHeader {
            inode: self.inode,
            rec_len: self.rec_len,
            name_len: self.name.len() as u8,
            file_type: self.file_type,
        };
        buf[..DIR_ENTRY_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
        buf[DIR_ENTRY_HEADER_SIZE..DIR_ENTRY_HEADER_SIZE + self.name.len()]
            .copy_from_slice(self.name.as_bytes());
    }
}
