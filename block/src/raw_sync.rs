// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsRawFd, RawFd};

use vmm_sys_util::eventfd::EventFd;

use crate::async_io::{
    AsyncIo, AsyncIoError, AsyncIoResult, DiskFile, DiskFileError, DiskFileResult,
};

/// Raw image file with synchronous-completion async I/O.
pub struct RawFileDisk {
    file: File,
}

impl RawFileDisk {
    pub fn new(file: File) -> Self {
        RawFileDisk { file }
    }
}

impl DiskFile for RawFileDisk {
    fn size(&mut self) -> DiskFileResult<u64> {
        self.file
            .seek(SeekFrom::End(0))
            .map_err(DiskFileError::Size)
    }

    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> DiskFileResult<()> {
        self.file
            .read_exact_at(buf, offset)
            .map_err(DiskFileError::ReadingDisk)
    }

    fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> DiskFileResult<()> {
        self.file
            .write_all_at(buf, offset)
            .map_err(DiskFileError::WritingDisk)
    }

    fn is_allocated(&mut self, offset: u64, max_bytes: u64) -> DiskFileResult<(bool, u64)> {
        let fd = self.file.as_raw_fd();

        // SAFETY: FFI call with valid arguments
        let data = unsafe { libc::lseek(fd, offset as libc::off_t, libc::SEEK_DATA) };
        if data < 0 {
            let err = std::io::Error::last_os_error();
            // ENXIO means there is no data between offset and EOF.
            if err.raw_os_error() == Some(libc::ENXIO) {
                return Ok((false, max_bytes));
            }
            return Err(DiskFileError::Allocation(err));
        }
        if data as u64 > offset {
            // Inside a hole which runs until the next data extent.
            return Ok((false, (data as u64 - offset).min(max_bytes)));
        }

        // SAFETY: FFI call with valid arguments
        let hole = unsafe { libc::lseek(fd, offset as libc::off_t, libc::SEEK_HOLE) };
        if hole < 0 {
            return Err(DiskFileError::Allocation(std::io::Error::last_os_error()));
        }

        Ok((true, (hole as u64 - offset).min(max_bytes)))
    }

    fn new_async_io(&self) -> DiskFileResult<Box<dyn AsyncIo>> {
        Ok(Box::new(RawFileSync::new(self.file.as_raw_fd())) as Box<dyn AsyncIo>)
    }
}

pub struct RawFileSync {
    fd: RawFd,
    eventfd: EventFd,
    completion_list: VecDeque<(u64, i32)>,
}

impl RawFileSync {
    pub fn new(fd: RawFd) -> Self {
        RawFileSync {
            fd,
            eventfd: EventFd::new(libc::EFD_NONBLOCK).expect("Failed creating EventFd for RawFile"),
            completion_list: VecDeque::new(),
        }
    }
}

impl AsyncIo for RawFileSync {
    fn notifier(&self) -> &EventFd {
        &self.eventfd
    }

    fn read_vectored(
        &mut self,
        offset: libc::off_t,
        iovecs: &[libc::iovec],
        user_data: u64,
    ) -> AsyncIoResult<()> {
        // SAFETY: FFI call with valid arguments
        let result = unsafe {
            libc::preadv(
                self.fd as libc::c_int,
                iovecs.as_ptr(),
                iovecs.len() as libc::c_int,
                offset,
            )
        };
        if result < 0 {
            return Err(AsyncIoError::ReadVectored(std::io::Error::last_os_error()));
        }

        self.completion_list.push_back((user_data, result as i32));
        self.eventfd.write(1).unwrap();

        Ok(())
    }

    fn next_completed_request(&mut self) -> Option<(u64, i32)> {
        self.completion_list.pop_front()
    }
}

#[cfg(test)]
mod unit_tests {
    use std::io::Write;

    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    #[test]
    fn test_read_vectored_completion() {
        let temp_file = TempFile::new().unwrap();
        let mut file = temp_file.into_file();

        let data = vec![0x5A; 8192];
        file.write_all(&data).unwrap();
        file.sync_all().unwrap();

        let mut async_io = RawFileSync::new(file.as_raw_fd());

        let mut buf = vec![0u8; 4096];
        let iovec = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        async_io.read_vectored(4096, &[iovec], 7).unwrap();

        // The notifier fires once the completion is queued.
        assert!(async_io.notifier().read().unwrap() >= 1);

        let (user_data, result) = async_io.next_completed_request().unwrap();
        assert_eq!(user_data, 7);
        assert_eq!(result, 4096);
        assert!(buf.iter().all(|&b| b == 0x5A));

        assert!(async_io.next_completed_request().is_none());
    }

    #[test]
    fn test_is_allocated_full_file() {
        let temp_file = TempFile::new().unwrap();
        let mut file = temp_file.into_file();
        file.write_all(&vec![0xAA; 1 << 20]).unwrap();
        file.sync_all().unwrap();

        let mut disk = RawFileDisk::new(file);
        let (allocated, run) = disk.is_allocated(0, 1 << 20).unwrap();
        assert!(allocated);
        assert_eq!(run, 1 << 20);
    }
}
