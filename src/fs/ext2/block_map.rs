use alloc::vec;

use crate::hal::storage::BlockDevice;

use super::{
    EXT2_DIRECT_BLOCKS, EXT2_DOUBLY_INDIRECT_SLOT, EXT2_SINGLY_INDIRECT_SLOT,
    EXT2_TRIPLY_INDIRECT_SLOT, Ext2Dev, Ext2Err, Inode,
};

impl Ext2Dev {
    /// Reads pointer `index` out of the index block `blknum`.
    async fn indirect_entry(
        &self,
        dev: &mut dyn BlockDevice,
        blknum: u32,
        index: u64,
    ) -> Result<u32, Ext2Err> {
        let mut blockbuf = vec![0u8; self.block_size as usize];
        self.block_read(dev, blknum, &mut blockbuf).await?;

        let at = index as usize * 4;
        Ok(bytemuck::pod_read_unaligned(&blockbuf[at..at + 4]))
    }

    /// Resolves logical file block `lblock` to its on-disk block number.
    ///
    /// Zero means the block was never allocated; the hole may sit at any
    /// level of the indirect tree. The sub-index into each level is
    /// recomputed from the logical index alone.
    pub(crate) async fn inode_block_map(
        &self,
        dev: &mut dyn BlockDevice,
        inode: &Inode,
        lblock: u64,
    ) -> Result<u32, Ext2Err> {
        let k = self.pointers_per_block();

        if lblock < EXT2_DIRECT_BLOCKS as u64 {
            return Ok(inode.i_block[lblock as usize]);
        }

        let mut index = lblock - EXT2_DIRECT_BLOCKS as u64;
        if index < k {
            let singly = inode.i_block[EXT2_SINGLY_INDIRECT_SLOT];
            if singly == 0 {
                return Ok(0);
            }
            return self.indirect_entry(dev, singly, index).await;
        }

        index -= k;
        if index < k * k {
            let doubly = inode.i_block[EXT2_DOUBLY_INDIRECT_SLOT];
            if doubly == 0 {
                return Ok(0);
            }
            let singly = self.indirect_entry(dev, doubly, index / k).await?;
            if singly == 0 {
                return Ok(0);
            }
            return self.indirect_entry(dev, singly, index % k).await;
        }

        index -= k * k;
        if index < k * k * k {
            let triply = inode.i_block[EXT2_TRIPLY_INDIRECT_SLOT];
            if triply == 0 {
                return Ok(0);
            }
            let doubly = self.indirect_entry(dev, triply, index / (k * k)).await?;
            if doubly == 0 {
                return Ok(0);
            }
            let singly = self.indirect_entry(dev, doubly, index / k % k).await?;
            if singly == 0 {
                return Ok(0);
            }
            return self.indirect_entry(dev, singly, index % k).await;
        }

        Err(Ext2Err::FileTooBig)
    }

    /// Allocates a block near the file's inode, zero-fills it on disk and
    /// accounts it in the inode record. The caller stores the returned
    /// number into the parent pointer slot.
    async fn allocate_attached_block(
        &self,
        dev: &mut dyn BlockDevice,
        inum: u32,
        inode: &mut Inode,
    ) -> Result<u32, Ext2Err> {
        let blknum = self.block_allocate_locked(dev, inum).await?;

        let zeroes = vec![0u8; self.block_size as usize];
        self.block_write(dev, blknum, &zeroes).await?;

        // i_blocks counts 512-byte sectors
        inode.i_blocks += self.sectors_per_block() as u32;

        Ok(blknum)
    }

    /// Ensures slot `slot` of `i_block` points at a block.
    async fn root_slot_alloc(
        &self,
        dev: &mut dyn BlockDevice,
        inum: u32,
        inode: &mut Inode,
        slot: usize,
    ) -> Result<u32, Ext2Err> {
        if inode.i_block[slot] != 0 {
            return Ok(inode.i_block[slot]);
        }

        let fresh = self.allocate_attached_block(dev, inum, inode).await?;
        inode.i_block[slot] = fresh;
        self.inode_write_locked(dev, inum, inode).await?;

        Ok(fresh)
    }

    /// Ensures pointer `index` of the index block `blknum` points at a
    /// block, patching the index block on disk when it has to allocate.
    async fn indirect_entry_alloc(
        &self,
        dev: &mut dyn BlockDevice,
        inum: u32,
        inode: &mut Inode,
        blknum: u32,
        index: u64,
    ) -> Result<u32, Ext2Err> {
        let mut blockbuf = vec![0u8; self.block_size as usize];
        self.block_read(dev, blknum, &mut blockbuf).await?;

        let at = index as usize * 4;
        let entry: u32 = bytemuck::pod_read_unaligned(&blockbuf[at..at + 4]);
        if entry != 0 {
            return Ok(entry);
        }

        let fresh = self.allocate_attached_block(dev, inum, inode).await?;

        blockbuf[at..at + 4].copy_from_slice(bytemuck::bytes_of(&fresh));
        self.block_write(dev, blknum, &blockbuf).await?;
        self.inode_write_locked(dev, inum, inode).await?;

        Ok(fresh)
    }

    /// Write-path variant of [`Self::inode_block_map`]: any zero pointer on
    /// the way down, index or data, gets a freshly allocated, zero-filled
    /// block.
    pub(crate) async fn inode_block_map_alloc(
        &self,
        dev: &mut dyn BlockDevice,
        inum: u32,
        inode: &mut Inode,
        lblock: u64,
    ) -> Result<u32, Ext2Err> {
        let k = self.pointers_per_block();

        if lblock < EXT2_DIRECT_BLOCKS as u64 {
            return self.root_slot_alloc(dev, inum, inode, lblock as usize).await;
        }

        let mut index = lblock - EXT2_DIRECT_BLOCKS as u64;
        if index < k {
            let singly = self
                .root_slot_alloc(dev, inum, inode, EXT2_SINGLY_INDIRECT_SLOT)
                .await?;
            return self.indirect_entry_alloc(dev, inum, inode, singly, index).await;
        }

        index -= k;
        if index < k * k {
            let doubly = self
                .root_slot_alloc(dev, inum, inode, EXT2_DOUBLY_INDIRECT_SLOT)
                .await?;
            let singly = self
                .indirect_entry_alloc(dev, inum, inode, doubly, index / k)
                .await?;
            return self
                .indirect_entry_alloc(dev, inum, inode, singly, index % k)
                .await;
        }

        index -= k * k;
        if index < k * k * k {
            let triply = self
                .root_slot_alloc(dev, inum, inode, EXT2_TRIPLY_INDIRECT_SLOT)
                .await?;
            let doubly = self
                .indirect_entry_alloc(dev, inum, inode, triply, index / (k * k))
                .await?;
            let singly = self
                .indirect_entry_alloc(dev, inum, inode, doubly, index / k % k)
                .await?;
            return self
                .indirect_entry_alloc(dev, inum, inode, singly, index % k)
                .await;
        }

        Err(Ext2Err::FileTooBig)
    }
}
