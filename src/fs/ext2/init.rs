use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use once_cell_no_std::OnceCell;

use crate::hal::storage::BlockDevice;

use super::structs::{Ext2Dev, ProbeErr};

static EXT2_DEVICES: OnceCell<Vec<Arc<Ext2Dev>>> = OnceCell::new();

/// Probes every candidate block device and registers the ones carrying an
/// ext2 filesystem. Meant to run once at startup, before interrupts are
/// enabled - probing only uses the non-suspending sector path.
pub fn ext2_init(devices: Vec<Box<dyn BlockDevice>>) -> &'static [Arc<Ext2Dev>] {
    let mut attached = Vec::new();

    for (devnum, device) in devices.into_iter().enumerate() {
        match Ext2Dev::probe(device) {
            Ok(fs) => {
                log::info!(
                    "ext2: device {}: {} blocks of {} bytes in {} groups",
                    devnum,
                    fs.blocks_count,
                    fs.block_size,
                    fs.blockgroups_count
                );
                attached.push(Arc::new(fs));
            }
            Err(ProbeErr::BadMagic) => {
                log::debug!("ext2: device {} is not ext2, skipping", devnum);
            }
            Err(err) => {
                log::warn!("ext2: probing device {} failed: {}", devnum, err);
            }
        }
    }

    let _ = EXT2_DEVICES.set(attached);
    ext2_devices()
}

/// The filesystems attached by [`ext2_init`]; empty before initialization.
pub fn ext2_devices() -> &'static [Arc<Ext2Dev>] {
    EXT2_DEVICES.get().map(Vec::as_slice).unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use alloc::vec;
    use futures_lite::future::block_on;

    use super::*;
    use crate::fs::ext2::format::{FormatOpts, format};
    use crate::hal::storage::testdev::RamDisk;

    #[test]
    fn init_attaches_only_ext2_devices() {
        let opts = FormatOpts {
            groups: 1,
            blocks_per_group: 256,
            inodes_per_group: 32,
        };
        let mut formatted = RamDisk::new(512);
        block_on(format(&mut formatted, &opts)).unwrap();

        let blank = RamDisk::new(512);

        let attached = ext2_init(vec![
            Box::new(formatted) as Box<dyn BlockDevice>,
            Box::new(blank),
        ]);

        assert_eq!(attached.len(), 1);
        assert_eq!(attached[0].blocks_count, 256);
        assert!(!ext2_devices().is_empty());
    }
}
