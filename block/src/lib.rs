// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

pub mod async_io;
pub mod bitmap;
pub mod mem;
pub mod raw_sync;

use std::sync::{Arc, Mutex};

use log::warn;
use thiserror::Error;

use crate::async_io::{AsyncIo, AsyncIoError, DiskFile, DiskFileError};
use crate::bitmap::DirtyBitmap;

pub const SECTOR_SHIFT: u64 = 9;
pub const SECTOR_SIZE: u64 = 0x01 << SECTOR_SHIFT;

/// Granularity of dirty tracking, in sectors. This is also the transfer
/// granularity of block migration, so it is part of the wire format.
pub const SECTORS_PER_DIRTY_CHUNK: u64 = 2048;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Disk file failure")]
    DiskFile(#[source] DiskFileError),
    #[error("Failed submitting asynchronous read")]
    AsyncRead(#[source] AsyncIoError),
    #[error("The requested operation would cause a seek beyond disk end")]
    InvalidOffset,
    #[error("Can't execute a write on a read-only device")]
    ReadOnly,
}

impl From<DiskFileError> for Error {
    fn from(e: DiskFileError) -> Self {
        Error::DiskFile(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A named block device: a disk backend plus the per-device state the
/// rest of the stack cares about (dirty tracking, in-use marking).
pub struct BlockDevice {
    name: String,
    disk: Box<dyn DiskFile>,
    async_io: Box<dyn AsyncIo>,
    nb_sectors: u64,
    read_only: bool,
    in_use: bool,
    dirty_bitmap: Option<DirtyBitmap>,
}

impl BlockDevice {
    pub fn new(name: &str, mut disk: Box<dyn DiskFile>, read_only: bool) -> Result<Self> {
        let size = disk.size()?;
        let async_io = disk.new_async_io()?;
        Ok(BlockDevice {
            name: name.to_string(),
            disk,
            async_io,
            nb_sectors: size >> SECTOR_SHIFT,
            read_only,
            in_use: false,
            dirty_bitmap: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nb_sectors(&self) -> u64 {
        self.nb_sectors
    }

    pub fn size(&self) -> u64 {
        self.nb_sectors << SECTOR_SHIFT
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn in_use(&self) -> bool {
        self.in_use
    }

    /// Mark the device as participating in an operation that must not be
    /// disturbed by configuration changes (e.g. an ongoing migration).
    pub fn set_in_use(&mut self, in_use: bool) {
        self.in_use = in_use;
    }

    fn check_range(&self, sector: u64, nb_sectors: u64) -> Result<()> {
        if sector
            .checked_add(nb_sectors)
            .is_none_or(|end| end > self.nb_sectors)
        {
            return Err(Error::InvalidOffset);
        }
        Ok(())
    }

    /// Synchronous sector read. `buf` length must be a multiple of the
    /// sector size.
    pub fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(sector, buf.len() as u64 >> SECTOR_SHIFT)?;
        self.disk.read_exact_at(sector << SECTOR_SHIFT, buf)?;
        Ok(())
    }

    /// Synchronous sector write. Marks the covered chunks dirty when
    /// dirty tracking is enabled.
    pub fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let nb_sectors = buf.len() as u64 >> SECTOR_SHIFT;
        self.check_range(sector, nb_sectors)?;
        self.disk.write_all_at(sector << SECTOR_SHIFT, buf)?;
        if let Some(bitmap) = &self.dirty_bitmap {
            bitmap.mark_dirty(sector, nb_sectors);
        }
        Ok(())
    }

    /// Submit an asynchronous read of the sectors described by `iovecs`.
    /// The completion is retrieved through `next_completed_request()`.
    pub fn submit_read(
        &mut self,
        sector: u64,
        iovecs: &[libc::iovec],
        user_data: u64,
    ) -> Result<()> {
        let bytes: usize = iovecs.iter().map(|iov| iov.iov_len).sum();
        self.check_range(sector, bytes as u64 >> SECTOR_SHIFT)?;
        self.async_io
            .read_vectored((sector << SECTOR_SHIFT) as libc::off_t, iovecs, user_data)
            .map_err(Error::AsyncRead)
    }

    pub fn next_completed_request(&mut self) -> Option<(u64, i32)> {
        self.async_io.next_completed_request()
    }

    /// Whether the run starting at `sector` is allocated, along with the
    /// run length in sectors. The search is capped at `max_search`
    /// sectors and at the device end.
    pub fn is_allocated(&mut self, sector: u64, max_search: u64) -> Result<(bool, u64)> {
        let max_sectors = max_search.min(self.nb_sectors - sector);
        let (allocated, run_bytes) = self
            .disk
            .is_allocated(sector << SECTOR_SHIFT, max_sectors << SECTOR_SHIFT)?;
        // Never report an empty run, the callers use it to advance.
        Ok((allocated, (run_bytes >> SECTOR_SHIFT).clamp(1, max_sectors.max(1))))
    }

    pub fn set_dirty_tracking(&mut self, enable: bool) {
        if enable {
            if self.dirty_bitmap.is_none() {
                self.dirty_bitmap = Some(DirtyBitmap::new(self.nb_sectors));
            }
        } else {
            self.dirty_bitmap = None;
        }
    }

    pub fn dirty_tracking(&self) -> bool {
        self.dirty_bitmap.is_some()
    }

    /// Whether the chunk containing `sector` is dirty. Always false when
    /// dirty tracking is disabled.
    pub fn get_dirty(&self, sector: u64) -> bool {
        self.dirty_bitmap
            .as_ref()
            .is_some_and(|b| b.is_dirty(sector))
    }

    pub fn reset_dirty(&self, sector: u64, nb_sectors: u64) {
        if let Some(bitmap) = &self.dirty_bitmap {
            bitmap.reset(sector, nb_sectors);
        }
    }

    /// Number of dirty chunks.
    pub fn dirty_count(&self) -> u64 {
        self.dirty_bitmap.as_ref().map_or(0, |b| b.count())
    }
}

/// Ordered registry of the block devices of a machine. Iteration order
/// is insertion order, which keeps device enumeration deterministic.
#[derive(Clone, Default)]
pub struct DeviceList {
    devices: Vec<Arc<Mutex<BlockDevice>>>,
}

impl DeviceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, device: BlockDevice) -> Arc<Mutex<BlockDevice>> {
        if self.find(device.name()).is_some() {
            warn!("duplicate block device name '{}'", device.name());
        }
        let device = Arc::new(Mutex::new(device));
        self.devices.push(device.clone());
        device
    }

    pub fn find(&self, name: &str) -> Option<Arc<Mutex<BlockDevice>>> {
        self.devices
            .iter()
            .find(|d| d.lock().unwrap().name() == name)
            .cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Mutex<BlockDevice>>> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemDisk;

    fn mem_device(name: &str, sectors: u64) -> BlockDevice {
        BlockDevice::new(
            name,
            Box::new(MemDisk::new(sectors << SECTOR_SHIFT)),
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_write_marks_dirty() {
        let mut device = mem_device("disk0", 4 * SECTORS_PER_DIRTY_CHUNK);
        let buf = vec![0xEE; SECTOR_SIZE as usize];

        // No tracking yet: writes leave no trace.
        device.write_sectors(0, &buf).unwrap();
        assert_eq!(device.dirty_count(), 0);

        device.set_dirty_tracking(true);
        device
            .write_sectors(2 * SECTORS_PER_DIRTY_CHUNK + 17, &buf)
            .unwrap();
        assert!(device.get_dirty(2 * SECTORS_PER_DIRTY_CHUNK));
        assert!(!device.get_dirty(0));
        assert_eq!(device.dirty_count(), 1);

        device.reset_dirty(2 * SECTORS_PER_DIRTY_CHUNK, SECTORS_PER_DIRTY_CHUNK);
        assert_eq!(device.dirty_count(), 0);

        device.set_dirty_tracking(false);
        assert!(!device.dirty_tracking());
    }

    #[test]
    fn test_bounds_and_read_only() {
        let mut device = mem_device("disk0", 8);
        let buf = vec![0u8; SECTOR_SIZE as usize];
        assert!(matches!(
            device.write_sectors(8, &buf),
            Err(Error::InvalidOffset)
        ));

        let mut ro = BlockDevice::new(
            "cdrom",
            Box::new(MemDisk::new(8 << SECTOR_SHIFT)),
            true,
        )
        .unwrap();
        assert!(matches!(ro.write_sectors(0, &buf), Err(Error::ReadOnly)));
    }

    #[test]
    fn test_device_list_order_and_find() {
        let mut list = DeviceList::new();
        list.insert(mem_device("vda", 8));
        list.insert(mem_device("vdb", 8));

        let names: Vec<String> = list
            .iter()
            .map(|d| d.lock().unwrap().name().to_string())
            .collect();
        assert_eq!(names, ["vda", "vdb"]);

        assert!(list.find("vdb").is_some());
        assert!(list.find("vdz").is_none());
    }

    #[test]
    fn test_submit_read_completion() {
        let mut device = mem_device("disk0", 16);
        let pattern = vec![0x42; (4 * SECTOR_SIZE) as usize];
        device.write_sectors(4, &pattern).unwrap();

        let mut buf = vec![0u8; (4 * SECTOR_SIZE) as usize];
        let iovec = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        device.submit_read(4, &[iovec], 99).unwrap();

        let (user_data, result) = device.next_completed_request().unwrap();
        assert_eq!(user_data, 99);
        assert_eq!(result as usize, buf.len());
        assert_eq!(buf, pattern);
    }
}
