// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::{Arc, Mutex};

use log::info;

use block::{BlockDevice, DeviceList, SECTOR_SHIFT, SECTORS_PER_DIRTY_CHUNK};
use vm_migration::MigrationSource;

use crate::protocol::{
    FLAG_DEVICE_BLOCK, FLAG_EOS, FLAG_MASK, FLAG_PROGRESS, FLAG_ZERO_BLOCK,
};
use crate::{Error, Result, CHUNK_SIZE};

/// Decode a block migration stream and apply it to the local devices,
/// until the first frame carrying the end-of-stream flag.
///
/// Frames carry their own sector address, so out-of-order chunks and
/// chunks sent twice (bulk copy, then dirty recopy) apply correctly:
/// the last write wins. A single scratch buffer holds the payload; on
/// zero-block frames it is re-zeroed only if the previous frame was not
/// zero, which keeps long zero runs cheap.
pub fn load(devices: &DeviceList, f: &mut MigrationSource) -> Result<()> {
    let mut buf = vec![0u8; CHUNK_SIZE as usize];
    let mut buf_is_zeroed = false;
    let mut banner_printed = false;

    let mut device: Option<Arc<Mutex<BlockDevice>>> = None;
    let mut device_name = String::new();
    let mut total_sectors = 0;

    loop {
        let header = f.get_be64().map_err(Error::StreamRead)?;
        let flags = header & FLAG_MASK;
        let addr = header >> SECTOR_SHIFT;

        if flags & FLAG_DEVICE_BLOCK != 0 {
            let len = f.get_u8().map_err(Error::StreamRead)? as usize;
            let mut name = vec![0u8; len];
            f.get_bytes(&mut name).map_err(Error::StreamRead)?;
            let name = String::from_utf8(name).map_err(|_| Error::DeviceName)?;

            // Frames for one device tend to arrive in runs; only look a
            // device up again when the name changes. The cache is only
            // valid once a lookup has populated it, so a first frame
            // never skips validation whatever its name decodes to.
            if device.is_none() || name != device_name {
                let found = devices
                    .find(&name)
                    .ok_or_else(|| Error::UnknownDevice(name.clone()))?;
                total_sectors = found.lock().unwrap().nb_sectors();
                device = Some(found);
                device_name = name;
            }
            // Unwrap can't fail: the lookup above populated it.
            let device = device.as_ref().unwrap();

            if addr >= total_sectors {
                return Err(Error::OutOfRange {
                    device: device_name.clone(),
                    sector: addr,
                });
            }
            let nr_sectors = SECTORS_PER_DIRTY_CHUNK.min(total_sectors - addr);

            if flags & FLAG_ZERO_BLOCK != 0 {
                if !buf_is_zeroed {
                    buf.fill(0);
                }
                buf_is_zeroed = true;
            } else {
                f.get_bytes(&mut buf).map_err(Error::StreamRead)?;
                buf_is_zeroed = false;
            }

            device
                .lock()
                .unwrap()
                .write_sectors(addr, &buf[..(nr_sectors << SECTOR_SHIFT) as usize])?;
        } else if flags & FLAG_PROGRESS != 0 {
            if !banner_printed {
                info!("Receiving block device images");
                banner_printed = true;
            }
            info!("Completed {addr} %");
        } else if flags & FLAG_EOS == 0 {
            return Err(Error::UnknownFlags(flags));
        }

        if flags & FLAG_EOS != 0 {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use block::mem::MemDisk;

    use super::*;
    use crate::protocol;
    use vm_migration::MigrationStream;

    fn mem_list(specs: &[(&str, u64)]) -> DeviceList {
        let mut list = DeviceList::new();
        for (name, sectors) in specs {
            list.insert(
                BlockDevice::new(name, Box::new(MemDisk::new(sectors << SECTOR_SHIFT)), false)
                    .unwrap(),
            );
        }
        list
    }

    fn source_from(bytes: Vec<u8>) -> MigrationSource {
        MigrationSource::new(Box::new(Cursor::new(bytes)))
    }

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_unknown_flags_abort() {
        let list = mem_list(&[("vda", 2 * SECTORS_PER_DIRTY_CHUNK)]);
        let sink = SharedSink::default();
        let mut f = MigrationStream::new(Box::new(sink.clone()));
        f.put_be64(0x40).unwrap();
        f.flush().unwrap();

        let err = load(&list, &mut source_from(sink.0.lock().unwrap().clone())).unwrap_err();
        assert!(matches!(err, Error::UnknownFlags(0x40)));
    }

    #[test]
    fn test_empty_device_name_first_frame() {
        // A device may end up registered with an empty name; the first
        // frame for it must still go through the lookup instead of
        // matching the empty lookup-cache sentinel.
        let list = mem_list(&[("", SECTORS_PER_DIRTY_CHUNK)]);
        let sink = SharedSink::default();
        let mut f = MigrationStream::new(Box::new(sink.clone()));
        let mut data = vec![0u8; CHUNK_SIZE as usize];
        data[0] = 0x9D;
        protocol::send_block(&mut f, "", 0, &data, false, true).unwrap();
        f.put_be64(FLAG_EOS).unwrap();
        f.flush().unwrap();

        load(&list, &mut source_from(sink.0.lock().unwrap().clone())).unwrap();

        let dev = list.find("").unwrap();
        let mut check = vec![0u8; CHUNK_SIZE as usize];
        dev.lock().unwrap().read_sectors(0, &mut check).unwrap();
        assert_eq!(check[0], 0x9D);

        // Without such a device the same frame is an unknown device,
        // not a panic.
        let other = mem_list(&[("vda", SECTORS_PER_DIRTY_CHUNK)]);
        let err =
            load(&other, &mut source_from(sink.0.lock().unwrap().clone())).unwrap_err();
        assert!(matches!(err, Error::UnknownDevice(name) if name.is_empty()));
    }

    #[test]
    fn test_unknown_device_abort() {
        let list = mem_list(&[("vda", 2 * SECTORS_PER_DIRTY_CHUNK)]);
        let sink = SharedSink::default();
        let mut f = MigrationStream::new(Box::new(sink.clone()));
        let buf = vec![1u8; CHUNK_SIZE as usize];
        protocol::send_block(&mut f, "vdx", 0, &buf, false, true).unwrap();
        f.flush().unwrap();

        let err = load(&list, &mut source_from(sink.0.lock().unwrap().clone())).unwrap_err();
        assert!(matches!(err, Error::UnknownDevice(name) if name == "vdx"));
    }

    #[test]
    fn test_truncated_stream_surfaces_read_error() {
        let list = mem_list(&[("vda", 2 * SECTORS_PER_DIRTY_CHUNK)]);
        // Header promising a payload that never arrives.
        let sink = SharedSink::default();
        let mut f = MigrationStream::new(Box::new(sink.clone()));
        f.put_be64(FLAG_DEVICE_BLOCK).unwrap();
        f.put_u8(3).unwrap();
        f.put_bytes(b"vda").unwrap();
        f.flush().unwrap();

        let err = load(&list, &mut source_from(sink.0.lock().unwrap().clone())).unwrap_err();
        assert!(matches!(err, Error::StreamRead(_)));
    }

    #[test]
    fn test_zero_and_payload_frames_apply() {
        let list = mem_list(&[("vda", 2 * SECTORS_PER_DIRTY_CHUNK)]);
        // Pre-dirty the receiver device so the zero frame has to work.
        {
            let dev = list.find("vda").unwrap();
            let junk = vec![0xFF; CHUNK_SIZE as usize];
            dev.lock().unwrap().write_sectors(0, &junk).unwrap();
        }

        let sink = SharedSink::default();
        let mut f = MigrationStream::new(Box::new(sink.clone()));
        let zero = vec![0u8; CHUNK_SIZE as usize];
        protocol::send_block(&mut f, "vda", 0, &zero, false, true).unwrap();
        let mut data = vec![0u8; CHUNK_SIZE as usize];
        data[7] = 0x7E;
        protocol::send_block(&mut f, "vda", SECTORS_PER_DIRTY_CHUNK, &data, false, true).unwrap();
        f.put_be64(FLAG_EOS).unwrap();
        f.flush().unwrap();

        load(&list, &mut source_from(sink.0.lock().unwrap().clone())).unwrap();

        let dev = list.find("vda").unwrap();
        let mut check = vec![0u8; CHUNK_SIZE as usize];
        dev.lock().unwrap().read_sectors(0, &mut check).unwrap();
        assert!(check.iter().all(|&b| b == 0));
        dev.lock()
            .unwrap()
            .read_sectors(SECTORS_PER_DIRTY_CHUNK, &mut check)
            .unwrap();
        assert_eq!(check[7], 0x7E);
    }
}
