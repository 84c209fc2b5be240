use alloc::vec;

use crate::hal::storage::{BlockDevice, SECTOR_SIZE};

use super::{EXT2_SUPERBLOCK_START, Ext2Dev, Ext2Err, GroupDescriptor, SuperBlock};

impl Ext2Dev {
    /// Transfers one filesystem block as consecutive sector reads.
    pub(crate) async fn block_read(
        &self,
        dev: &mut dyn BlockDevice,
        blknum: u32,
        buf: &mut [u8],
    ) -> Result<(), Ext2Err> {
        let sectors = self.sectors_per_block();
        let base = blknum as u64 * sectors;

        for i in 0..sectors as usize {
            dev.read_sector(base + i as u64, &mut buf[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE])
                .await?;
        }

        Ok(())
    }

    pub(crate) async fn block_write(
        &self,
        dev: &mut dyn BlockDevice,
        blknum: u32,
        buf: &[u8],
    ) -> Result<(), Ext2Err> {
        let sectors = self.sectors_per_block();
        let base = blknum as u64 * sectors;

        for i in 0..sectors as usize {
            dev.write_sector(base + i as u64, &buf[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE])
                .await?;
        }

        Ok(())
    }

    /// Reads `buf.len()` bytes starting at the absolute byte `offset`,
    /// crossing block boundaries as needed.
    pub(crate) async fn nbytes_read(
        &self,
        dev: &mut dyn BlockDevice,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<(), Ext2Err> {
        let block_size = self.block_size as u64;
        let len = buf.len() as u64;
        let firstblock = offset / block_size;
        let lastblock = (offset + len) / block_size;

        let mut blockbuf = vec![0u8; self.block_size as usize];
        let mut ncopied = 0u64;

        for curblock in firstblock..=lastblock {
            let (inblock_off, inblock_len) = if curblock == firstblock {
                let inblock_off = offset - curblock * block_size;
                (inblock_off, (block_size - inblock_off).min(len))
            } else if curblock == lastblock {
                (0, len - ncopied)
            } else {
                (0, block_size)
            };

            // a transfer ending exactly on a block boundary leaves a
            // zero-length final iteration
            if inblock_len == 0 {
                continue;
            }

            self.block_read(dev, curblock as u32, &mut blockbuf).await?;

            buf[ncopied as usize..(ncopied + inblock_len) as usize].copy_from_slice(
                &blockbuf[inblock_off as usize..(inblock_off + inblock_len) as usize],
            );

            ncopied += inblock_len;
        }

        Ok(())
    }

    /// Writes `buf.len()` bytes starting at the absolute byte `offset`.
    ///
    /// Partial blocks are read back first so the bytes around the span
    /// survive; whole blocks are written without a prior read.
    pub(crate) async fn nbytes_write(
        &self,
        dev: &mut dyn BlockDevice,
        buf: &[u8],
        offset: u64,
    ) -> Result<(), Ext2Err> {
        let block_size = self.block_size as u64;
        let len = buf.len() as u64;
        let firstblock = offset / block_size;
        let lastblock = (offset + len) / block_size;

        let mut blockbuf = vec![0u8; self.block_size as usize];
        let mut ncopied = 0u64;

        for curblock in firstblock..=lastblock {
            let (inblock_off, inblock_len) = if curblock == firstblock {
                let inblock_off = offset - curblock * block_size;
                (inblock_off, (block_size - inblock_off).min(len))
            } else if curblock == lastblock {
                (0, len - ncopied)
            } else {
                (0, block_size)
            };

            if inblock_len == 0 {
                continue;
            }

            if inblock_len != block_size {
                self.block_read(dev, curblock as u32, &mut blockbuf).await?;
            }

            blockbuf[inblock_off as usize..(inblock_off + inblock_len) as usize]
                .copy_from_slice(&buf[ncopied as usize..(ncopied + inblock_len) as usize]);

            self.block_write(dev, curblock as u32, &blockbuf).await?;

            ncopied += inblock_len;
        }

        Ok(())
    }

    pub(crate) async fn superblock_read_locked(
        &self,
        dev: &mut dyn BlockDevice,
    ) -> Result<SuperBlock, Ext2Err> {
        let mut raw = [0u8; size_of::<SuperBlock>()];
        self.nbytes_read(dev, &mut raw, EXT2_SUPERBLOCK_START).await?;

        Ok(bytemuck::pod_read_unaligned(&raw))
    }

    /// Writes a metadata record to its primary location, then mirrors it
    /// into group 1 and every group whose index is a power of 3, 5 or 7.
    ///
    /// The primary copy always goes out first; a failed mirror leaves the
    /// primary newer than the replicas, which is an inconsistency but not a
    /// corruption.
    async fn metadata_write_all_copies(
        &self,
        dev: &mut dyn BlockDevice,
        bytes: &[u8],
        primary_offset: u64,
    ) -> Result<(), Ext2Err> {
        self.nbytes_write(dev, bytes, primary_offset).await?;

        let group_bytes = self.blocks_per_group as u64 * self.block_size as u64;

        if self.blockgroups_count > 1 {
            self.nbytes_write(dev, bytes, primary_offset + group_bytes)
                .await?;
        }

        for base in [3u64, 5, 7] {
            let mut group = base;
            while group < self.blockgroups_count as u64 {
                self.nbytes_write(dev, bytes, primary_offset + group * group_bytes)
                    .await?;
                group *= base;
            }
        }

        Ok(())
    }

    pub(crate) async fn superblock_write_all_copies(
        &self,
        dev: &mut dyn BlockDevice,
        superblock: &SuperBlock,
    ) -> Result<(), Ext2Err> {
        self.metadata_write_all_copies(dev, bytemuck::bytes_of(superblock), EXT2_SUPERBLOCK_START)
            .await
    }

    pub(crate) async fn bgdesc_read_locked(
        &self,
        dev: &mut dyn BlockDevice,
        bgnum: u32,
    ) -> Result<GroupDescriptor, Ext2Err> {
        let mut raw = [0u8; size_of::<GroupDescriptor>()];
        self.nbytes_read(
            dev,
            &mut raw,
            self.bgdt_start() + bgnum as u64 * size_of::<GroupDescriptor>() as u64,
        )
        .await?;

        Ok(bytemuck::pod_read_unaligned(&raw))
    }

    pub(crate) async fn bgdesc_write_all_copies(
        &self,
        dev: &mut dyn BlockDevice,
        bgnum: u32,
        bgdesc: &GroupDescriptor,
    ) -> Result<(), Ext2Err> {
        self.metadata_write_all_copies(
            dev,
            bytemuck::bytes_of(bgdesc),
            self.bgdt_start() + bgnum as u64 * size_of::<GroupDescriptor>() as u64,
        )
        .await
    }
}
