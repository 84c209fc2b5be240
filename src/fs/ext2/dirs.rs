use alloc::vec;
use alloc::vec::Vec;

use crate::hal::storage::BlockDevice;

use super::{DirEntry, Ext2Dev, Ext2Err};

impl Ext2Dev {
    /// Lists the live records of a directory, in on-disk order.
    ///
    /// Directory blocks are always materialized, so they are read strictly;
    /// records with `inode == 0` are padding and skipped.
    pub(crate) async fn read_dir_locked(
        &self,
        dev: &mut dyn BlockDevice,
        inum: u32,
    ) -> Result<Vec<DirEntry>, Ext2Err> {
        let inode = self.inode_read_locked(dev, inum).await?;
        if !inode.is_directory() {
            return Err(Ext2Err::NotDirectory);
        }

        let block_size = self.block_size as usize;
        let block_count = inode.i_size as u64 / block_size as u64;

        let mut entries = Vec::new();
        let mut blockbuf = vec![0u8; block_size];

        for lblock in 0..block_count {
            self.file_read_inode(dev, &inode, &mut blockbuf, lblock * block_size as u64, true)
                .await?;

            let mut pos = 0;
            while pos < block_size {
                let entry = DirEntry::parse(&blockbuf[pos..])?;
                pos += entry.rec_len as usize;

                if entry.inode != 0 {
                    entries.push(entry);
                }
            }
        }

        Ok(entries)
    }

    /// Finds the record named `name` and returns its inode number.
    pub(crate) async fn dir_lookup_locked(
        &self,
        dev: &mut dyn BlockDevice,
        parent_inum: u32,
        name: &str,
    ) -> Result<Option<u32>, Ext2Err> {
        let inode = self.inode_read_locked(dev, parent_inum).await?;
        if !inode.is_directory() {
            return Err(Ext2Err::NotDirectory);
        }

        let block_size = self.block_size as usize;
        let block_count = inode.i_size as u64 / block_size as u64;

        let mut blockbuf = vec![0u8; block_size];

        for lblock in 0..block_count {
            self.file_read_inode(dev, &inode, &mut blockbuf, lblock * block_size as u64, true)
                .await?;

            let mut pos = 0;
            while pos < block_size {
                let entry = DirEntry::parse(&blockbuf[pos..])?;
                pos += entry.rec_len as usize;

                if entry.inode != 0 && entry.name == name {
                    return Ok(Some(entry.inode));
                }
            }
        }

        Ok(None)
    }
}
