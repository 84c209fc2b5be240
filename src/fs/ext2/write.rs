use alloc::vec;

use crate::hal::storage::BlockDevice;

use super::{Ext2Dev, Ext2Err};

impl Ext2Dev {
    /// Byte-range write with lazy allocation of data and index blocks.
    ///
    /// Partial first/last blocks are read back before the merge; whole
    /// blocks are written blind. The inode's size is extended to cover the
    /// span before the final inode write.
    pub(crate) async fn file_write_locked(
        &self,
        dev: &mut dyn BlockDevice,
        inum: u32,
        buf: &[u8],
        offset: u64,
    ) -> Result<(), Ext2Err> {
        let mut inode = self.inode_read_locked(dev, inum).await?;

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

            let blknum = self
                .inode_block_map_alloc(dev, inum, &mut inode, curblock)
                .await?;

            if inblock_len != block_size {
                self.block_read(dev, blknum, &mut blockbuf).await?;
            }

            blockbuf[inblock_off as usize..(inblock_off + inblock_len) as usize]
                .copy_from_slice(&buf[ncopied as usize..(ncopied + inblock_len) as usize]);

            self.block_write(dev, blknum, &blockbuf).await?;

            ncopied += inblock_len;
        }

        let end = offset + len;
        if end > inode.i_size as u64 {
            inode.i_size = end.min(u32::MAX as u64) as u32;
        }

        self.inode_write_locked(dev, inum, &inode).await
    }
}
