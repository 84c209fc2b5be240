use crate::hal::storage::BlockDevice;

use super::{Ext2Dev, Ext2Err, Inode};

impl Ext2Dev {
    /// Byte offset of the record for inode `inum` inside its group's inode
    /// table.
    async fn inode_record_offset(
        &self,
        dev: &mut dyn BlockDevice,
        inum: u32,
    ) -> Result<u64, Ext2Err> {
        let bgnum = (inum - 1) / self.inodes_per_group;
        let index = (inum - 1) % self.inodes_per_group;

        let bgdesc = self.bgdesc_read_locked(dev, bgnum).await?;

        Ok(bgdesc.bg_inode_table as u64 * self.block_size as u64
            + index as u64 * self.inode_size as u64)
    }

    pub(crate) async fn inode_read_locked(
        &self,
        dev: &mut dyn BlockDevice,
        inum: u32,
    ) -> Result<Inode, Ext2Err> {
        let offset = self.inode_record_offset(dev, inum).await?;

        let mut raw = [0u8; size_of::<Inode>()];
        self.nbytes_read(dev, &mut raw, offset).await?;

        Ok(bytemuck::pod_read_unaligned(&raw))
    }

    pub(crate) async fn inode_write_locked(
        &self,
        dev: &mut dyn BlockDevice,
        inum: u32,
        inode: &Inode,
    ) -> Result<(), Ext2Err> {
        let offset = self.inode_record_offset(dev, inum).await?;

        self.nbytes_write(dev, bytemuck::bytes_of(inode), offset)
            .await
    }
}
