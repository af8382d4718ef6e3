// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::{Arc, Mutex};

use log::debug;

use block::{BlockDevice, DeviceList};

use crate::bitmap::ChunkBitmap;

/// Per-device migration state on the sender.
///
/// `cur_sector` is the bulk-phase cursor; `cur_dirty` the dirty-phase
/// scan cursor. `completed_sectors` only ever grows and feeds the
/// progress report and the `bytes_transferred` query.
pub(crate) struct DeviceCursor {
    pub device: Arc<Mutex<BlockDevice>>,
    pub name: String,
    pub total_sectors: u64,
    pub cur_sector: u64,
    pub cur_dirty: u64,
    pub completed_sectors: u64,
    pub bulk_completed: bool,
    pub shared_base: bool,
    pub sparse_enable: bool,
    pub aio_bitmap: ChunkBitmap,
}

/// Build a cursor per eligible device: read-only devices and devices of
/// zero length are skipped. Enumeration order is the registry order, so
/// it is deterministic for a given device set.
pub(crate) fn enumerate_devices(
    list: &DeviceList,
    shared_base: bool,
    sparse_enable: bool,
) -> Vec<DeviceCursor> {
    let mut cursors = Vec::new();

    for device in list.iter() {
        let mut bs = device.lock().unwrap();
        if bs.is_read_only() {
            continue;
        }
        let total_sectors = bs.nb_sectors();
        if total_sectors == 0 {
            continue;
        }

        bs.set_in_use(true);
        let name = bs.name().to_string();
        drop(bs);

        if shared_base {
            debug!("Start migration for {name} with shared base image");
        } else {
            debug!("Start full migration for {name}");
        }

        cursors.push(DeviceCursor {
            device: device.clone(),
            name,
            total_sectors,
            cur_sector: 0,
            cur_dirty: 0,
            completed_sectors: 0,
            bulk_completed: false,
            shared_base,
            sparse_enable,
            aio_bitmap: ChunkBitmap::new(total_sectors),
        });
    }

    cursors
}

#[cfg(test)]
mod tests {
    use super::*;
    use block::mem::MemDisk;
    use block::SECTOR_SHIFT;

    #[test]
    fn test_enumeration_skips_ineligible() {
        let mut list = DeviceList::new();
        list.insert(
            BlockDevice::new("vda", Box::new(MemDisk::new(16 << SECTOR_SHIFT)), false).unwrap(),
        );
        list.insert(
            BlockDevice::new("cdrom", Box::new(MemDisk::new(16 << SECTOR_SHIFT)), true).unwrap(),
        );
        list.insert(BlockDevice::new("empty", Box::new(MemDisk::new(0)), false).unwrap());
        list.insert(
            BlockDevice::new("vdb", Box::new(MemDisk::new(8 << SECTOR_SHIFT)), false).unwrap(),
        );

        let cursors = enumerate_devices(&list, false, true);
        let names: Vec<&str> = cursors.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["vda", "vdb"]);
        assert_eq!(cursors[0].total_sectors, 16);
        assert!(cursors.iter().all(|c| c.sparse_enable));
        assert!(cursors.iter().all(|c| !c.shared_base));

        // Enumerated devices are marked in use, skipped ones are not.
        assert!(list.find("vda").unwrap().lock().unwrap().in_use());
        assert!(!list.find("cdrom").unwrap().lock().unwrap().in_use());
    }
}
