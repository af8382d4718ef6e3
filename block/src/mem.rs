// Copyright © 2022 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use vmm_sys_util::eventfd::EventFd;

use crate::async_io::{
    AsyncIo, AsyncIoError, AsyncIoResult, DiskFile, DiskFileError, DiskFileResult,
};
use crate::{SECTOR_SHIFT, SECTOR_SIZE};

/// In-memory disk with an explicit allocation map.
///
/// Primarily used by tests and demos that need full control over the
/// disk contents and over which sector runs report as allocated.
pub struct MemDisk {
    data: Arc<Mutex<Vec<u8>>>,
    allocated: Vec<bool>,
}

impl MemDisk {
    /// Create a zero-filled, fully allocated disk of `size` bytes.
    /// `size` must be a multiple of the sector size.
    pub fn new(size: u64) -> Self {
        assert_eq!(size & (SECTOR_SIZE - 1), 0);
        MemDisk {
            data: Arc::new(Mutex::new(vec![0u8; size as usize])),
            allocated: vec![true; (size >> SECTOR_SHIFT) as usize],
        }
    }

    /// Override the allocation state of a sector range.
    pub fn set_allocated(&mut self, sector: u64, nb_sectors: u64, allocated: bool) {
        for s in sector..sector + nb_sectors {
            self.allocated[s as usize] = allocated;
        }
    }
}

impl DiskFile for MemDisk {
    fn size(&mut self) -> DiskFileResult<u64> {
        Ok(self.data.lock().unwrap().len() as u64)
    }

    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> DiskFileResult<()> {
        let data = self.data.lock().unwrap();
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .filter(|&e| e <= data.len())
            .ok_or_else(|| {
                DiskFileError::ReadingDisk(std::io::Error::from(
                    std::io::ErrorKind::UnexpectedEof,
                ))
            })?;
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> DiskFileResult<()> {
        let mut data = self.data.lock().unwrap();
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .filter(|&e| e <= data.len())
            .ok_or_else(|| {
                DiskFileError::WritingDisk(std::io::Error::from(
                    std::io::ErrorKind::UnexpectedEof,
                ))
            })?;
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn is_allocated(&mut self, offset: u64, max_bytes: u64) -> DiskFileResult<(bool, u64)> {
        let sector = (offset >> SECTOR_SHIFT) as usize;
        let max_sectors = (max_bytes >> SECTOR_SHIFT) as usize;
        let state = self.allocated[sector];
        let run = self.allocated[sector..]
            .iter()
            .take(max_sectors.max(1))
            .take_while(|&&a| a == state)
            .count();
        Ok((state, (run as u64) << SECTOR_SHIFT))
    }

    fn new_async_io(&self) -> DiskFileResult<Box<dyn AsyncIo>> {
        Ok(Box::new(MemDiskSync::new(self.data.clone())) as Box<dyn AsyncIo>)
    }
}

pub struct MemDiskSync {
    data: Arc<Mutex<Vec<u8>>>,
    eventfd: EventFd,
    completion_list: VecDeque<(u64, i32)>,
}

impl MemDiskSync {
    pub fn new(data: Arc<Mutex<Vec<u8>>>) -> Self {
        MemDiskSync {
            data,
            eventfd: EventFd::new(libc::EFD_NONBLOCK).expect("Failed creating EventFd for MemDisk"),
            completion_list: VecDeque::new(),
        }
    }
}

impl AsyncIo for MemDiskSync {
    fn notifier(&self) -> &EventFd {
        &self.eventfd
    }

    fn read_vectored(
        &mut self,
        offset: libc::off_t,
        iovecs: &[libc::iovec],
        user_data: u64,
    ) -> AsyncIoResult<()> {
        let data = self.data.lock().unwrap();
        let mut pos = offset as usize;
        let mut copied = 0usize;
        for iov in iovecs {
            if pos + iov.iov_len > data.len() {
                return Err(AsyncIoError::ReadVectored(std::io::Error::from(
                    std::io::ErrorKind::UnexpectedEof,
                )));
            }
            // SAFETY: the caller guarantees iov_base points at iov_len
            // writable bytes for the lifetime of the request.
            let dst = unsafe {
                std::slice::from_raw_parts_mut(iov.iov_base as *mut u8, iov.iov_len)
            };
            dst.copy_from_slice(&data[pos..pos + iov.iov_len]);
            pos += iov.iov_len;
            copied += iov.iov_len;
        }

        self.completion_list.push_back((user_data, copied as i32));
        self.eventfd.write(1).unwrap();

        Ok(())
    }

    fn next_completed_request(&mut self) -> Option<(u64, i32)> {
        self.completion_list.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_runs() {
        let mut disk = MemDisk::new(64 * SECTOR_SIZE);
        disk.set_allocated(8, 16, false);

        let (allocated, run) = disk.is_allocated(0, 64 * SECTOR_SIZE).unwrap();
        assert!(allocated);
        assert_eq!(run, 8 * SECTOR_SIZE);

        let (allocated, run) = disk.is_allocated(8 * SECTOR_SIZE, 64 * SECTOR_SIZE).unwrap();
        assert!(!allocated);
        assert_eq!(run, 16 * SECTOR_SIZE);

        // The search cap bounds the reported run.
        let (allocated, run) = disk.is_allocated(0, 4 * SECTOR_SIZE).unwrap();
        assert!(allocated);
        assert_eq!(run, 4 * SECTOR_SIZE);
    }

    #[test]
    fn test_read_write_round_trip() {
        let mut disk = MemDisk::new(16 * SECTOR_SIZE);
        let pattern = vec![0xCD; 2 * SECTOR_SIZE as usize];
        disk.write_all_at(SECTOR_SIZE, &pattern).unwrap();

        let mut buf = vec![0u8; 2 * SECTOR_SIZE as usize];
        disk.read_exact_at(SECTOR_SIZE, &mut buf).unwrap();
        assert_eq!(buf, pattern);

        // Out of bounds access is rejected.
        let mut buf = vec![0u8; SECTOR_SIZE as usize];
        disk.read_exact_at(16 * SECTOR_SIZE, &mut buf).unwrap_err();
    }

    #[test]
    fn test_async_read() {
        let mut disk = MemDisk::new(8 * SECTOR_SIZE);
        disk.write_all_at(0, &vec![0x11; SECTOR_SIZE as usize]).unwrap();
        let mut async_io = disk.new_async_io().unwrap();

        let mut buf = vec![0u8; SECTOR_SIZE as usize];
        let iovec = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        async_io.read_vectored(0, &[iovec], 3).unwrap();

        let (user_data, result) = async_io.next_completed_request().unwrap();
        assert_eq!(user_data, 3);
        assert_eq!(result, SECTOR_SIZE as i32);
        assert!(buf.iter().all(|&b| b == 0x11));
    }
}
