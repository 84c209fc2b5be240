use alloc::vec;
use alloc::vec::Vec;

use crate::hal::storage::BlockDevice;
use crate::utils::{Bit, BitIterator, bitmap_clear, bitmap_set};

use super::{Ext2Dev, Ext2Err};

impl Ext2Dev {
    async fn inode_counter_add(
        &self,
        dev: &mut dyn BlockDevice,
        inum: u32,
        delta: i32,
    ) -> Result<(), Ext2Err> {
        let bgnum = (inum - 1) / self.inodes_per_group;

        let mut bgdesc = self.bgdesc_read_locked(dev, bgnum).await?;
        bgdesc.bg_free_inodes_count = bgdesc.bg_free_inodes_count.wrapping_add_signed(delta as i16);
        self.bgdesc_write_all_copies(dev, bgnum, &bgdesc).await?;

        let mut superblock = self.superblock_read_locked(dev).await?;
        superblock.s_free_inodes_count = superblock.s_free_inodes_count.wrapping_add_signed(delta);
        self.superblock_write_all_copies(dev, &superblock).await?;

        Ok(())
    }

    async fn block_counter_add(
        &self,
        dev: &mut dyn BlockDevice,
        blknum: u32,
        delta: i32,
    ) -> Result<(), Ext2Err> {
        let bgnum = blknum / self.blocks_per_group;

        let mut bgdesc = self.bgdesc_read_locked(dev, bgnum).await?;
        bgdesc.bg_free_blocks_count = bgdesc.bg_free_blocks_count.wrapping_add_signed(delta as i16);
        self.bgdesc_write_all_copies(dev, bgnum, &bgdesc).await?;

        let mut superblock = self.superblock_read_locked(dev).await?;
        superblock.s_free_blocks_count = superblock.s_free_blocks_count.wrapping_add_signed(delta);
        self.superblock_write_all_copies(dev, &superblock).await?;

        Ok(())
    }

    /// Scans the inode bitmaps group by group for the first clear bit.
    ///
    /// The bitmap flip is written before the counters are touched: a crash
    /// in between leaks the inode but can never hand it out twice.
    pub(crate) async fn inode_allocate_locked(
        &self,
        dev: &mut dyn BlockDevice,
    ) -> Result<u32, Ext2Err> {
        let mut bitmap = vec![0u8; self.block_size as usize];

        for bgnum in 0..self.blockgroups_count {
            let bgdesc = self.bgdesc_read_locked(dev, bgnum).await?;

            self.block_read(dev, bgdesc.bg_inode_bitmap, &mut bitmap)
                .await?;

            let free_bit = BitIterator::new(&bitmap)
                .take(self.inodes_per_group as usize)
                .position(|bit| bit == Bit::Zero);

            if let Some(index) = free_bit {
                bitmap_set(&mut bitmap, index);
                self.block_write(dev, bgdesc.bg_inode_bitmap, &bitmap)
                    .await?;

                let inum = bgnum * self.inodes_per_group + index as u32 + 1;
                self.inode_counter_add(dev, inum, -1).await?;

                return Ok(inum);
            }
        }

        Err(Ext2Err::NoSpace)
    }

    pub(crate) async fn inode_free_locked(
        &self,
        dev: &mut dyn BlockDevice,
        inum: u32,
    ) -> Result<(), Ext2Err> {
        let bgnum = (inum - 1) / self.inodes_per_group;
        let index = (inum - 1) % self.inodes_per_group;

        let bgdesc = self.bgdesc_read_locked(dev, bgnum).await?;

        let mut bitmap = vec![0u8; self.block_size as usize];
        self.block_read(dev, bgdesc.bg_inode_bitmap, &mut bitmap)
            .await?;

        bitmap_clear(&mut bitmap, index as usize);

        self.block_write(dev, bgdesc.bg_inode_bitmap, &bitmap)
            .await?;

        self.inode_counter_add(dev, inum, 1).await
    }

    /// Claims the first clear bit of one group's block bitmap, if any.
    async fn block_allocate_in_group(
        &self,
        dev: &mut dyn BlockDevice,
        bgnum: u32,
        bitmap: &mut Vec<u8>,
    ) -> Result<Option<u32>, Ext2Err> {
        let bgdesc = self.bgdesc_read_locked(dev, bgnum).await?;

        self.block_read(dev, bgdesc.bg_block_bitmap, bitmap).await?;

        let free_bit = BitIterator::new(bitmap)
            .take(self.blocks_per_group as usize)
            .position(|bit| bit == Bit::Zero);

        let Some(index) = free_bit else {
            return Ok(None);
        };

        bitmap_set(bitmap, index);
        self.block_write(dev, bgdesc.bg_block_bitmap, bitmap).await?;

        let blknum = bgnum * self.blocks_per_group + index as u32;
        self.block_counter_add(dev, blknum, -1).await?;

        Ok(Some(blknum))
    }

    /// Allocates a block, trying the group that holds `inode_hint` first so
    /// a file's data stays close to its inode, then falling back to every
    /// other group in ascending order.
    pub(crate) async fn block_allocate_locked(
        &self,
        dev: &mut dyn BlockDevice,
        inode_hint: u32,
    ) -> Result<u32, Ext2Err> {
        let bgnum_hint = (inode_hint - 1) / self.inodes_per_group;
        let mut bitmap = vec![0u8; self.block_size as usize];

        if let Some(blknum) = self
            .block_allocate_in_group(dev, bgnum_hint, &mut bitmap)
            .await?
        {
            return Ok(blknum);
        }

        for bgnum in 0..self.blockgroups_count {
            if bgnum == bgnum_hint {
                continue;
            }

            if let Some(blknum) = self.block_allocate_in_group(dev, bgnum, &mut bitmap).await? {
                return Ok(blknum);
            }
        }

        Err(Ext2Err::NoSpace)
    }

    pub(crate) async fn block_free_locked(
        &self,
        dev: &mut dyn BlockDevice,
        blknum: u32,
    ) -> Result<(), Ext2Err> {
        let bgnum = blknum / self.blocks_per_group;
        let index = blknum % self.blocks_per_group;

        let bgdesc = self.bgdesc_read_locked(dev, bgnum).await?;

        let mut bitmap = vec![0u8; self.block_size as usize];
        self.block_read(dev, bgdesc.bg_block_bitmap, &mut bitmap)
            .await?;

        bitmap_clear(&mut bitmap, index as usize);

        self.block_write(dev, bgdesc.bg_block_bitmap, &bitmap)
            .await?;

        self.block_counter_add(dev, blknum, 1).await
    }
}
