use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use futures_lite::future::block_on;

use crate::fs::ext2::format::{FORMAT_BLOCK_SIZE, FormatOpts, format};
use crate::fs::ext2::structs::ProbeErr;
use crate::fs::ext2::{
    DIR_ENTRY_HEADER_SIZE, DirEntry, EXT2_ROOT_INO, EXT2_S_IFDIR, EXT2_S_IFLNK, EXT2_S_IFREG,
    EXT2_SUPERBLOCK_START, Ext2Dev, Ext2Err, SuperBlock, align4,
};
use crate::hal::storage::testdev::RamDisk;

const B: u64 = FORMAT_BLOCK_SIZE as u64;
const K: u64 = B / 4;

const REG: u16 = EXT2_S_IFREG | 0o644;
const DIR: u16 = EXT2_S_IFDIR | 0o755;
const LNK: u16 = EXT2_S_IFLNK | 0o777;

fn fresh_fs(opts: FormatOpts) -> Ext2Dev {
    let sectors = opts.groups as u64 * opts.blocks_per_group as u64 * (B / 512);
    let mut disk = RamDisk::new(sectors);
    block_on(format(&mut disk, &opts)).unwrap();

    Ext2Dev::probe(Box::new(disk)).unwrap()
}

/// 8 MiB, one group.
fn small_fs() -> Ext2Dev {
    fresh_fs(FormatOpts::default())
}

/// Eight groups, so the 1/3/5/7 redundancy set is non-trivial.
fn multi_group_fs() -> Ext2Dev {
    fresh_fs(FormatOpts {
        groups: 8,
        blocks_per_group: 512,
        inodes_per_group: 64,
    })
}

/// A cramped image for exhaustion tests.
fn tiny_fs() -> Ext2Dev {
    fresh_fs(FormatOpts {
        groups: 1,
        blocks_per_group: 256,
        inodes_per_group: 32,
    })
}

fn create_file(fs: &Ext2Dev, name: &str) -> u32 {
    block_on(fs.create(EXT2_ROOT_INO, name, REG, 0, 0, None)).unwrap()
}

fn free_counts(fs: &Ext2Dev) -> (u32, u32) {
    let superblock = block_on(fs.superblock_read()).unwrap();
    (
        superblock.s_free_blocks_count,
        superblock.s_free_inodes_count,
    )
}

/// Group counters must always sum to the superblock counters.
fn assert_counter_consistency(fs: &Ext2Dev) {
    let superblock = block_on(fs.superblock_read()).unwrap();

    let mut free_blocks = 0u32;
    let mut free_inodes = 0u32;
    for bgnum in 0..fs.blockgroups_count {
        let bgdesc = block_on(fs.bgdesc_read(bgnum)).unwrap();
        free_blocks += bgdesc.bg_free_blocks_count as u32;
        free_inodes += bgdesc.bg_free_inodes_count as u32;
    }

    assert_eq!(free_blocks, superblock.s_free_blocks_count);
    assert_eq!(free_inodes, superblock.s_free_inodes_count);
}

fn pattern(offset: u64, len: usize) -> Vec<u8> {
    (0..len).map(|i| ((offset + i as u64) % 251) as u8).collect()
}

#[test]
fn hello_world_roundtrip() {
    let fs = small_fs();
    let inum = create_file(&fs, "hello");

    block_on(fs.file_write(inum, b"Hello, world!\n", 0)).unwrap();

    let mut readback = [0u8; 14];
    block_on(fs.file_read(inum, &mut readback, 0, false)).unwrap();
    assert_eq!(&readback, b"Hello, world!\n");

    let inode = block_on(fs.inode_read(inum)).unwrap();
    assert_eq!(inode.i_size, 14);
    assert_ne!(inode.i_block[0], 0);
    assert!(inode.i_block[1..].iter().all(|blk| *blk == 0));

    assert_eq!(
        block_on(fs.dir_lookup(EXT2_ROOT_INO, "hello")).unwrap(),
        Some(inum)
    );
}

#[test]
fn new_directory_has_dot_and_dotdot() {
    let fs = small_fs();
    let inum = block_on(fs.create(EXT2_ROOT_INO, "d", DIR, 0, 0, None)).unwrap();

    let entries = block_on(fs.read_dir(inum)).unwrap();
    assert_eq!(entries.len(), 2);

    assert_eq!(entries[0].name, ".");
    assert_eq!(entries[0].inode, inum);
    assert_eq!(entries[0].rec_len, 12);

    assert_eq!(entries[1].name, "..");
    assert_eq!(entries[1].inode, EXT2_ROOT_INO);
    assert_eq!(entries[1].rec_len, B as u16 - 12);

    let inode = block_on(fs.inode_read(inum)).unwrap();
    assert!(inode.is_directory());
    assert_eq!(inode.i_size as u64, B);
}

#[test]
fn directory_fill_keeps_records_packed() {
    let fs = small_fs();

    for i in 0..100 {
        let name = format!("entry-{:0>10}", i); // 16-byte names
        assert_eq!(name.len(), 16);
        block_on(fs.create(EXT2_ROOT_INO, &name, REG, 0, 0, None)).unwrap();
    }

    // every name resolves
    for i in 0..100 {
        let name = format!("entry-{:0>10}", i);
        assert!(
            block_on(fs.dir_lookup(EXT2_ROOT_INO, &name))
                .unwrap()
                .is_some()
        );
    }

    // walk the raw blocks: records partition each block exactly
    let root = block_on(fs.inode_read(EXT2_ROOT_INO)).unwrap();
    assert_eq!(root.i_size as u64 % B, 0);

    let mut blockbuf = vec![0u8; B as usize];
    for lblock in 0..root.i_size as u64 / B {
        block_on(fs.file_read(EXT2_ROOT_INO, &mut blockbuf, lblock * B, true)).unwrap();

        let mut pos = 0usize;
        while pos < B as usize {
            let entry = DirEntry::parse(&blockbuf[pos..]).unwrap();
            assert!(entry.rec_len as usize >= align4(DIR_ENTRY_HEADER_SIZE + entry.name.len()));
            pos += entry.rec_len as usize;
        }
        assert_eq!(pos, B as usize);
    }

    assert_counter_consistency(&fs);
}

#[test]
fn singly_indirect_index_block() {
    let fs = small_fs();
    let inum = create_file(&fs, "f");

    block_on(fs.file_write(inum, &[0x5A], 12 * B)).unwrap();

    let inode = block_on(fs.inode_read(inum)).unwrap();
    assert!(inode.i_block[..12].iter().all(|blk| *blk == 0));
    assert_ne!(inode.i_block[12], 0);

    // the index block carries one live pointer
    let mut indexbuf = vec![0u8; B as usize];
    {
        let mut device = fs.device.lock();
        block_on(fs.block_read(&mut **device, inode.i_block[12], &mut indexbuf)).unwrap();
    }

    let first: u32 = bytemuck::pod_read_unaligned(&indexbuf[..4]);
    assert_ne!(first, 0);
    assert!(indexbuf[4..].iter().all(|byte| *byte == 0));

    let mut readback = [0u8; 1];
    block_on(fs.file_read(inum, &mut readback, 12 * B, false)).unwrap();
    assert_eq!(readback[0], 0x5A);
}

#[test]
fn inode_exhaustion_and_reuse() {
    let fs = tiny_fs();

    let mut allocated = Vec::new();
    loop {
        match block_on(fs.inode_allocate()) {
            Ok(inum) => allocated.push(inum),
            Err(Ext2Err::NoSpace) => break,
            Err(err) => panic!("unexpected error: {err:?}"),
        }
    }
    assert_eq!(allocated.len() as u32, fs.inodes_count - 10);

    let freed = allocated[4];
    block_on(fs.inode_free(freed)).unwrap();

    assert_eq!(block_on(fs.inode_allocate()).unwrap(), freed);
    assert_counter_consistency(&fs);
}

#[test]
fn symlink_targets() {
    let fs = small_fs();

    let short = block_on(fs.create(EXT2_ROOT_INO, "s", LNK, 0, 0, Some(b"short"))).unwrap();
    let inode = block_on(fs.inode_read(short)).unwrap();
    let inline: &[u8] = bytemuck::cast_slice(&inode.i_block);
    assert_eq!(&inline[..6], b"short\0");
    assert_eq!(inode.i_size, 5);
    assert_eq!(block_on(fs.symlink_target(short)).unwrap(), "short");

    let target: String = core::iter::repeat('t').take(100).collect();
    let long = block_on(fs.create(EXT2_ROOT_INO, "l", LNK, 0, 0, Some(target.as_bytes()))).unwrap();
    let inode = block_on(fs.inode_read(long)).unwrap();
    assert_ne!(inode.i_block[0], 0);
    assert_eq!(inode.i_size, 100);
    assert_eq!(block_on(fs.symlink_target(long)).unwrap(), target);
}

#[test]
fn read_write_roundtrip_sweep() {
    let fs = small_fs();
    let inum = create_file(&fs, "sweep");

    let offsets = [
        0,
        1,
        511,
        512,
        B - 1,
        B,
        B + 1,
        3 * B + 100,
        11 * B + 1023,
        16 * B,
    ];
    let lens = [1usize, 513, B as usize, (2 * B + 7) as usize, 4 * B as usize];

    for &offset in &offsets {
        for &len in &lens {
            let data = pattern(offset, len);
            block_on(fs.file_write(inum, &data, offset)).unwrap();

            let mut readback = vec![0u8; len];
            block_on(fs.file_read(inum, &mut readback, offset, false)).unwrap();
            assert_eq!(readback, data, "offset {offset} len {len}");
        }
    }

    assert_counter_consistency(&fs);
}

#[test]
fn holes_read_as_zeroes() {
    let fs = small_fs();
    let inum = create_file(&fs, "sparse");

    block_on(fs.file_write(inum, &[0xFF], 5 * B)).unwrap();

    // the first five blocks were never written
    let mut readback = vec![0u8; 2 * B as usize];
    block_on(fs.file_read(inum, &mut readback, 0, false)).unwrap();
    assert!(readback.iter().all(|byte| *byte == 0));

    // strict resolution refuses the hole
    let result = block_on(fs.file_read(inum, &mut readback, 0, true));
    assert!(matches!(result, Err(Ext2Err::UnmappedBlock)));
}

#[test]
fn alloc_free_cycles_restore_state() {
    let fs = small_fs();

    let initial = free_counts(&fs);

    let bgdesc = block_on(fs.bgdesc_read(0)).unwrap();
    let mut bitmap_before = vec![0u8; B as usize];
    {
        let mut device = fs.device.lock();
        block_on(fs.block_read(&mut **device, bgdesc.bg_block_bitmap, &mut bitmap_before))
            .unwrap();
    }

    for _ in 0..5 {
        let blknum = block_on(fs.block_allocate(EXT2_ROOT_INO)).unwrap();
        let inum = block_on(fs.inode_allocate()).unwrap();
        block_on(fs.block_free(blknum)).unwrap();
        block_on(fs.inode_free(inum)).unwrap();
    }

    assert_eq!(free_counts(&fs), initial);

    let mut bitmap_after = vec![0u8; B as usize];
    {
        let mut device = fs.device.lock();
        block_on(fs.block_read(&mut **device, bgdesc.bg_block_bitmap, &mut bitmap_after)).unwrap();
    }
    assert_eq!(bitmap_before, bitmap_after);

    assert_counter_consistency(&fs);
}

#[test]
fn counters_stay_consistent_across_groups() {
    let fs = multi_group_fs();
    assert_counter_consistency(&fs);

    for i in 0..20 {
        let name = format!("file-{i}");
        let inum = block_on(fs.create(EXT2_ROOT_INO, &name, REG, 0, 0, None)).unwrap();
        block_on(fs.file_write(inum, &pattern(0, 2000), 0)).unwrap();
        assert_counter_consistency(&fs);
    }
}

#[test]
fn block_allocation_prefers_the_inode_group() {
    let fs = multi_group_fs();

    // an inode number sitting in group 2; the group is untouched, so the
    // block must come from it
    let hint = 2 * fs.inodes_per_group + 1;
    let blknum = block_on(fs.block_allocate(hint)).unwrap();
    assert_eq!(blknum / fs.blocks_per_group, 2);
}

#[test]
fn indirect_boundaries_cost_exactly_the_index_blocks() {
    let fs = small_fs();
    let inum = create_file(&fs, "deep");

    // direct data block only
    let before = free_counts(&fs).0;
    block_on(fs.file_write(inum, &[1], 0)).unwrap();
    assert_eq!(before - free_counts(&fs).0, 1);

    // singly: one index block + one data block
    let before = free_counts(&fs).0;
    block_on(fs.file_write(inum, &[1], 12 * B)).unwrap();
    assert_eq!(before - free_counts(&fs).0, 2);

    // doubly: two index blocks + one data block
    let before = free_counts(&fs).0;
    block_on(fs.file_write(inum, &[1], (12 + K) * B)).unwrap();
    assert_eq!(before - free_counts(&fs).0, 3);

    // triply: three index blocks + one data block
    let before = free_counts(&fs).0;
    block_on(fs.file_write(inum, &[1], (12 + K + K * K) * B)).unwrap();
    assert_eq!(before - free_counts(&fs).0, 4);

    let inode = block_on(fs.inode_read(inum)).unwrap();
    assert_ne!(inode.i_block[12], 0);
    assert_ne!(inode.i_block[13], 0);
    assert_ne!(inode.i_block[14], 0);

    // i_blocks counts 512-byte sectors of data and index blocks alike
    assert_eq!(inode.i_blocks as u64, 10 * (B / 512));

    assert_counter_consistency(&fs);
}

#[test]
fn file_too_big_allocates_nothing() {
    let fs = small_fs();
    let inum = create_file(&fs, "huge");

    let before = free_counts(&fs);

    let limit = 12 + K + K * K + K * K * K;
    let result = block_on(fs.file_write(inum, &[1], limit * B));
    assert!(matches!(result, Err(Ext2Err::FileTooBig)));

    assert_eq!(free_counts(&fs), before);

    let inode = block_on(fs.inode_read(inum)).unwrap();
    assert_eq!(inode.i_size, 0);
    assert_eq!(inode.i_blocks, 0);
}

#[test]
fn metadata_mirrors_track_the_primary() {
    let fs = multi_group_fs();

    // touch the counters so every copy has been rewritten at least once
    let inum = block_on(fs.inode_allocate()).unwrap();
    block_on(fs.block_allocate(inum)).unwrap();

    let group_bytes = fs.blocks_per_group as u64 * B;
    let gdt_len = fs.blockgroups_count as usize * 32;

    let mut primary_sb = vec![0u8; size_of::<SuperBlock>()];
    let mut primary_gdt = vec![0u8; gdt_len];
    {
        let mut device = fs.device.lock();
        block_on(fs.nbytes_read(&mut **device, &mut primary_sb, EXT2_SUPERBLOCK_START)).unwrap();
        block_on(fs.nbytes_read(&mut **device, &mut primary_gdt, 2048)).unwrap();
    }

    for mirror_group in [1u64, 3, 5, 7] {
        let mut mirror_sb = vec![0u8; size_of::<SuperBlock>()];
        let mut mirror_gdt = vec![0u8; gdt_len];
        {
            let mut device = fs.device.lock();
            block_on(fs.nbytes_read(
                &mut **device,
                &mut mirror_sb,
                EXT2_SUPERBLOCK_START + mirror_group * group_bytes,
            ))
            .unwrap();
            block_on(fs.nbytes_read(
                &mut **device,
                &mut mirror_gdt,
                2048 + mirror_group * group_bytes,
            ))
            .unwrap();
        }

        assert_eq!(primary_sb, mirror_sb, "superblock mirror {mirror_group}");
        assert_eq!(primary_gdt, mirror_gdt, "descriptor mirror {mirror_group}");
    }
}

#[test]
fn create_rejects_bad_names_and_parents() {
    let fs = small_fs();

    let result = block_on(fs.create(EXT2_ROOT_INO, "", REG, 0, 0, None));
    assert!(matches!(result, Err(Ext2Err::NameTooLong)));

    let long_name: String = core::iter::repeat('x').take(256).collect();
    let result = block_on(fs.create(EXT2_ROOT_INO, &long_name, REG, 0, 0, None));
    assert!(matches!(result, Err(Ext2Err::NameTooLong)));

    let file = create_file(&fs, "plain");
    let result = block_on(fs.create(file, "child", REG, 0, 0, None));
    assert!(matches!(result, Err(Ext2Err::NotDirectory)));
}

#[test]
fn probe_skips_foreign_devices() {
    let blank = RamDisk::new(64);
    match Ext2Dev::probe(Box::new(blank)) {
        Err(ProbeErr::BadMagic) => {}
        other => panic!("expected BadMagic, got {other:?}"),
    }
}

#[test]
fn probe_caches_the_format_geometry() {
    let fs = multi_group_fs();

    assert_eq!(fs.block_size as u64, B);
    assert_eq!(fs.blocks_per_group, 512);
    assert_eq!(fs.inodes_per_group, 64);
    assert_eq!(fs.blockgroups_count, 8);
    assert_eq!(fs.blocks_count, 8 * 512);
    assert_eq!(fs.inodes_count, 8 * 64);
    assert_eq!(fs.inode_size, 128);
}
