use alloc::vec;
use bytemuck::Zeroable;
use thiserror::Error;

use crate::hal::storage::{BlockDevice, IoErr, SECTOR_SIZE};
use crate::utils::bitmap_set;

use super::{
    DirEntry, EXT2_DYNAMIC_REV, EXT2_ERRORS_CONTINUE, EXT2_FT_DIR, EXT2_GOOD_OLD_INODE_SIZE,
    EXT2_OS_LINUX, EXT2_ROOT_INO, EXT2_S_IFDIR, EXT2_SUPER_MAGIC, EXT2_VALID_FS, GroupDescriptor,
    Inode, SuperBlock,
};

/// The formatter writes 1 KiB blocks only; the engine itself takes the
/// block size from whatever superblock it probes.
pub const FORMAT_BLOCK_SIZE: u32 = 1024;

/// Inodes reserved by the format; the root directory is inode 2.
pub const RESERVED_INODES: u32 = 10;

#[derive(Debug, Error)]
pub enum FormatErr {
    #[error("Block device error: {0}")]
    Io(#[from] IoErr),
    #[error("The device is too small for the requested geometry")]
    DeviceTooSmall,
    #[error("Unusable format geometry")]
    BadGeometry,
}

#[derive(Debug, Clone)]
pub struct FormatOpts {
    pub groups: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
}

impl Default for FormatOpts {
    fn default() -> Self {
        Self {
            groups: 1,
            blocks_per_group: 8 * FORMAT_BLOCK_SIZE,
            inodes_per_group: 2 * FORMAT_BLOCK_SIZE,
        }
    }
}

async fn write_block(dev: &mut dyn BlockDevice, blknum: u64, buf: &[u8]) -> Result<(), FormatErr> {
    let sectors = FORMAT_BLOCK_SIZE as u64 / SECTOR_SIZE as u64;

    for i in 0..sectors as usize {
        dev.write_sector(blknum * sectors + i as u64, &buf[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE])
            .await?;
    }

    Ok(())
}

/// Writes a fresh revision-1 ext2 image onto `dev`.
///
/// Every group gets the same layout: a pad/boot block, a superblock copy, a
/// descriptor table copy, the block and inode bitmaps, the inode table and
/// then data blocks. Group 0's first data block holds the root directory.
pub async fn format(dev: &mut dyn BlockDevice, opts: &FormatOpts) -> Result<(), FormatErr> {
    let block_size = FORMAT_BLOCK_SIZE;
    let bits_per_block = block_size * 8;

    let groups = opts.groups;
    let blocks_per_group = opts.blocks_per_group;
    let inodes_per_group = opts.inodes_per_group;

    if groups == 0
        || blocks_per_group == 0
        || blocks_per_group > bits_per_block
        || inodes_per_group <= RESERVED_INODES
        || inodes_per_group > bits_per_block
    {
        return Err(FormatErr::BadGeometry);
    }

    let blocks_count = groups * blocks_per_group;
    let inodes_count = groups * inodes_per_group;

    let gdt_blocks = (groups * size_of::<GroupDescriptor>() as u32).div_ceil(block_size);
    let inode_table_blocks =
        (inodes_per_group * EXT2_GOOD_OLD_INODE_SIZE as u32).div_ceil(block_size);

    // pad/boot + superblock + descriptor table + two bitmaps + inode table
    let overhead = 4 + gdt_blocks + inode_table_blocks;
    if overhead + 1 >= blocks_per_group {
        return Err(FormatErr::BadGeometry);
    }

    let sectors_needed = blocks_count as u64 * (block_size as u64 / SECTOR_SIZE as u64);
    if dev.sector_count() < sectors_needed {
        return Err(FormatErr::DeviceTooSmall);
    }

    let group_base = |g: u32| g * blocks_per_group;
    let block_bitmap_block = |g: u32| group_base(g) + 2 + gdt_blocks;
    let inode_bitmap_block = |g: u32| block_bitmap_block(g) + 1;
    let inode_table_block = |g: u32| inode_bitmap_block(g) + 1;
    let data_start_block = |g: u32| inode_table_block(g) + inode_table_blocks;

    let root_dir_block = data_start_block(0);

    let superblock = SuperBlock {
        s_inodes_count: inodes_count,
        s_blocks_count: blocks_count,
        s_free_blocks_count: groups * (blocks_per_group - overhead) - 1,
        s_free_inodes_count: inodes_count - RESERVED_INODES,
        s_first_data_block: 1,
        s_log_block_size: 0,
        s_log_frag_size: 0,
        s_blocks_per_group: blocks_per_group,
        s_frags_per_group: blocks_per_group,
        s_inodes_per_group: inodes_per_group,
        s_max_mnt_count: 64,
        s_magic: EXT2_SUPER_MAGIC,
        s_state: EXT2_VALID_FS,
        s_errors: EXT2_ERRORS_CONTINUE,
        s_creator_os: EXT2_OS_LINUX,
        s_rev_level: EXT2_DYNAMIC_REV,
        s_first_ino: RESERVED_INODES + 1,
        s_inode_size: EXT2_GOOD_OLD_INODE_SIZE,
        ..SuperBlock::zeroed()
    };

    // boot block
    let zero_block = vec![0u8; block_size as usize];
    write_block(dev, 0, &zero_block).await?;

    // descriptor table, shared by all groups
    let mut gdt = vec![0u8; (gdt_blocks * block_size) as usize];
    for g in 0..groups {
        let bgdesc = GroupDescriptor {
            bg_block_bitmap: block_bitmap_block(g),
            bg_inode_bitmap: inode_bitmap_block(g),
            bg_inode_table: inode_table_block(g),
            bg_free_blocks_count: (blocks_per_group - overhead - if g == 0 { 1 } else { 0 }) as u16,
            bg_free_inodes_count: (inodes_per_group - if g == 0 { RESERVED_INODES } else { 0 })
                as u16,
            bg_used_dirs_count: if g == 0 { 1 } else { 0 },
            ..GroupDescriptor::default()
        };

        let at = g as usize * size_of::<GroupDescriptor>();
        gdt[at..at + size_of::<GroupDescriptor>()].copy_from_slice(bytemuck::bytes_of(&bgdesc));
    }

    let mut superblock_block = vec![0u8; block_size as usize];
    superblock_block[..size_of::<SuperBlock>()].copy_from_slice(bytemuck::bytes_of(&superblock));

    for g in 0..groups {
        let base = group_base(g) as u64;

        write_block(dev, base + 1, &superblock_block).await?;
        for j in 0..gdt_blocks as u64 {
            let at = j as usize * block_size as usize;
            write_block(dev, base + 2 + j, &gdt[at..at + block_size as usize]).await?;
        }

        // block bitmap: metadata blocks used, bits past the group padded
        let mut bitmap = vec![0u8; block_size as usize];
        for bit in 0..overhead {
            bitmap_set(&mut bitmap, bit as usize);
        }
        if g == 0 {
            bitmap_set(&mut bitmap, (root_dir_block - group_base(0)) as usize);
        }
        for bit in blocks_per_group..bits_per_block {
            bitmap_set(&mut bitmap, bit as usize);
        }
        write_block(dev, block_bitmap_block(g) as u64, &bitmap).await?;

        // inode bitmap: reserved inodes in group 0, pad bits everywhere
        let mut bitmap = vec![0u8; block_size as usize];
        if g == 0 {
            for bit in 0..RESERVED_INODES {
                bitmap_set(&mut bitmap, bit as usize);
            }
        }
        for bit in inodes_per_group..bits_per_block {
            bitmap_set(&mut bitmap, bit as usize);
        }
        write_block(dev, inode_bitmap_block(g) as u64, &bitmap).await?;

        for j in 0..inode_table_blocks as u64 {
            write_block(dev, inode_table_block(g) as u64 + j, &zero_block).await?;
        }
    }

    // root directory: inode 2 plus its `.`/`..` block
    let root = Inode {
        i_mode: EXT2_S_IFDIR | 0o755,
        i_size: block_size,
        i_links_count: 2,
        i_blocks: block_size / SECTOR_SIZE as u32,
        i_block: {
            let mut blocks = [0u32; 15];
            blocks[0] = root_dir_block;
            blocks
        },
        ..Inode::default()
    };

    let mut table_block = vec![0u8; block_size as usize];
    let root_at = (EXT2_ROOT_INO - 1) as usize * EXT2_GOOD_OLD_INODE_SIZE as usize;
    table_block[root_at..root_at + size_of::<Inode>()].copy_from_slice(bytemuck::bytes_of(&root));
    write_block(dev, inode_table_block(0) as u64, &table_block).await?;

    let mut dir_block = vec![0u8; block_size as usize];
    let dot = DirEntry {
        inode: EXT2_ROOT_INO,
        rec_len: 12,
        file_type: EXT2_FT_DIR,
        name: ".".into(),
    };
    let dotdot = DirEntry {
        inode: EXT2_ROOT_INO,
        rec_len: (block_size - 12) as u16,
        file_type: EXT2_FT_DIR,
        name: "..".into(),
    };
    dot.encode_into(&mut dir_block);
    dotdot.encode_into(&mut dir_block[12..]);
    write_block(dev, root_dir_block as u64, &dir_block).await?;

    log::info!(
        "ext2: formatted {} groups of {} blocks, {} inodes",
        groups,
        blocks_per_group,
        inodes_count
    );

    Ok(())
}
