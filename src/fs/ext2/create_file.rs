use alloc::string::{String, ToString};
use alloc::vec;

use crate::hal::storage::BlockDevice;

use super::{
    DIR_ENTRY_HEADER_SIZE, DirEntry, DirEntryHeader, EXT2_FT_DIR, EXT2_S_IFDIR,
    EXT2_SYMLINK_INLINE_MAX, Ext2Dev, Ext2Err, Inode, MAX_NAME_LEN, align4, file_type_from_mode,
};

impl Ext2Dev {
    /// Creates a file, directory, symlink or device node in `parent_inum`.
    ///
    /// The parent is scanned record by record for a slot: an unused record
    /// wide enough is reused in place, a live record with enough slack is
    /// split, and a strict read past the directory's last block means no
    /// slot exists before EOF, so a record spanning a whole fresh block is
    /// appended.
    pub(crate) async fn create_locked(
        &self,
        dev: &mut dyn BlockDevice,
        parent_inum: u32,
        name: &str,
        mode: u16,
        uid: u16,
        gid: u16,
        symlink_target: Option<&[u8]>,
    ) -> Result<u32, Ext2Err> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(Ext2Err::NameTooLong);
        }

        let parent = self.inode_read_locked(dev, parent_inum).await?;
        if !parent.is_directory() {
            return Err(Ext2Err::NotDirectory);
        }

        let mut child = Inode {
            i_mode: mode,
            i_uid: uid,
            i_gid: gid,
            i_links_count: 1,
            ..Default::default()
        };

        // short symlink targets live inside the pointer array itself
        let mut long_symlink = None;
        if let Some(target) = symlink_target {
            if target.len() <= EXT2_SYMLINK_INLINE_MAX {
                bytemuck::cast_slice_mut::<u32, u8>(&mut child.i_block)[..target.len()]
                    .copy_from_slice(target);
                child.i_size = target.len() as u32;
            } else {
                long_symlink = Some(target);
            }
        }

        let file_type = file_type_from_mode(mode);
        let needed = DirEntry::record_length(name.len());

        let mut offset = 0u64;
        let inum = loop {
            let mut raw = [0u8; DIR_ENTRY_HEADER_SIZE];
            match self
                .file_read_inode(dev, &parent, &mut raw, offset, true)
                .await
            {
                // no slots before EOF
                Err(Ext2Err::UnmappedBlock) => break self.append_entry(dev, parent_inum, offset, name, file_type).await?,
                Err(err) => return Err(err),
                Ok(()) => {}
            }

            let header: DirEntryHeader = bytemuck::pod_read_unaligned(&raw);
            if (header.rec_len as usize) < DIR_ENTRY_HEADER_SIZE + header.name_len as usize
                || header.rec_len % 4 != 0
            {
                return Err(Ext2Err::BadDirEntry);
            }

            if header.inode == 0 && header.rec_len >= needed {
                // reuse the unused record, keeping its width
                let inum = self.inode_allocate_locked(dev).await?;
                self.write_entry(dev, parent_inum, offset, inum, header.rec_len, name, file_type)
                    .await?;
                break inum;
            }

            let left_len = align4(DIR_ENTRY_HEADER_SIZE + header.name_len as usize);
            if header.rec_len as usize >= left_len + needed as usize {
                // split: shrink the record to its minimum and put the new
                // one in the freed tail
                let inum = self.inode_allocate_locked(dev).await?;

                let mut shrunk = header;
                shrunk.rec_len = left_len as u16;
                self.file_write_locked(dev, parent_inum, bytemuck::bytes_of(&shrunk), offset)
                    .await?;

                self.write_entry(
                    dev,
                    parent_inum,
                    offset + left_len as u64,
                    inum,
                    header.rec_len - left_len as u16,
                    name,
                    file_type,
                )
                .await?;
                break inum;
            }

            offset += header.rec_len as u64;
        };

        self.inode_write_locked(dev, inum, &child).await?;

        if mode & 0xF000 == EXT2_S_IFDIR {
            self.init_directory_block(dev, inum, parent_inum).await?;

            let bgnum = (inum - 1) / self.inodes_per_group;
            let mut bgdesc = self.bgdesc_read_locked(dev, bgnum).await?;
            bgdesc.bg_used_dirs_count += 1;
            self.bgdesc_write_all_copies(dev, bgnum, &bgdesc).await?;
        }

        if let Some(target) = long_symlink {
            self.file_write_locked(dev, inum, target, 0).await?;
        }

        Ok(inum)
    }

    /// Writes an entry record of width `rec_len` at `offset` in the parent.
    async fn write_entry(
        &self,
        dev: &mut dyn BlockDevice,
        parent_inum: u32,
        offset: u64,
        inum: u32,
        rec_len: u16,
        name: &str,
        file_type: u8,
    ) -> Result<(), Ext2Err> {
        let entry = DirEntry {
            inode: inum,
            rec_len,
            file_type,
            name: name.to_string(),
        };

        let mut raw = vec![0u8; DIR_ENTRY_HEADER_SIZE + name.len()];
        entry.encode_into(&mut raw);

        self.file_write_locked(dev, parent_inum, &raw, offset).await
    }

    /// Appends a record covering one whole fresh directory block, so the
    /// directory's size stays a multiple of the block size.
    async fn append_entry(
        &self,
        dev: &mut dyn BlockDevice,
        parent_inum: u32,
        offset: u64,
        name: &str,
        file_type: u8,
    ) -> Result<u32, Ext2Err> {
        let inum = self.inode_allocate_locked(dev).await?;

        let entry = DirEntry {
            inode: inum,
            rec_len: self.block_size as u16,
            file_type,
            name: name.to_string(),
        };

        let mut blockbuf = vec![0u8; self.block_size as usize];
        entry.encode_into(&mut blockbuf);

        self.file_write_locked(dev, parent_inum, &blockbuf, offset)
            .await?;

        Ok(inum)
    }

    /// Writes the `.` and `..` records into a fresh directory's first
    /// block.
    async fn init_directory_block(
        &self,
        dev: &mut dyn BlockDevice,
        inum: u32,
        parent_inum: u32,
    ) -> Result<(), Ext2Err> {
        let mut blockbuf = vec![0u8; self.block_size as usize];

        let dot = DirEntry {
            inode: inum,
            rec_len: 12,
            file_type: EXT2_FT_DIR,
            name: ".".to_string(),
        };
        let dotdot = DirEntry {
            inode: parent_inum,
            rec_len: self.block_size as u16 - 12,
            file_type: EXT2_FT_DIR,
            name: "..".to_string(),
        };

        dot.encode_into(&mut blockbuf);
        dotdot.encode_into(&mut blockbuf[12..]);

        self.file_write_locked(dev, inum, &blockbuf, 0).await
    }

    /// Reads back a symlink's target, inline or out of line.
    pub(crate) async fn symlink_target_locked(
        &self,
        dev: &mut dyn BlockDevice,
        inum: u32,
    ) -> Result<String, Ext2Err> {
        let inode = self.inode_read_locked(dev, inum).await?;
        let len = inode.i_size as usize;

        if len <= EXT2_SYMLINK_INLINE_MAX {
            let raw = bytemuck::cast_slice::<u32, u8>(&inode.i_block);
            return Ok(String::from_utf8_lossy(&raw[..len]).into_owned());
        }

        let mut raw = vec![0u8; len];
        self.file_read_inode(dev, &inode, &mut raw, 0, false).await?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }
}
