use alloc::vec;

use crate::hal::storage::BlockDevice;

use super::{Ext2Dev, Ext2Err, Inode};

impl Ext2Dev {
    pub(crate) async fn file_read_locked(
        &self,
        dev: &mut dyn BlockDevice,
        inum: u32,
        buf: &mut [u8],
        offset: u64,
        failonzero: bool,
    ) -> Result<(), Ext2Err> {
        let inode = self.inode_read_locked(dev, inum).await?;
        self.file_read_inode(dev, &inode, buf, offset, failonzero)
            .await
    }

    /// Byte-range read with every logical block routed through the inode's
    /// block map. Holes read back as zeroes, or as [`Ext2Err::UnmappedBlock`]
    /// when the caller asked for strict resolution.
    pub(crate) async fn file_read_inode(
        &self,
        dev: &mut dyn BlockDevice,
        inode: &Inode,
        buf: &mut [u8],
        offset: u64,
        failonzero: bool,
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

            let blknum = self.inode_block_map(dev, inode, curblock).await?;

            if blknum == 0 {
                if failonzero {
                    return Err(Ext2Err::UnmappedBlock);
                }
                blockbuf.fill(0);
            } else {
                self.block_read(dev, blknum, &mut blockbuf).await?;
            }

            buf[ncopied as usize..(ncopied + inblock_len) as usize].copy_from_slice(
                &blockbuf[inblock_off as usize..(inblock_off + inblock_len) as usize],
            );

            ncopied += inblock_len;
        }

        Ok(())
    }
}
