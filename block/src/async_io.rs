// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use thiserror::Error;
use vmm_sys_util::eventfd::EventFd;

#[derive(Error, Debug)]
pub enum DiskFileError {
    /// Failed getting disk file size.
    #[error("Failed getting disk file size")]
    Size(#[source] std::io::Error),
    /// Failed creating a new AsyncIo.
    #[error("Failed creating a new AsyncIo")]
    NewAsyncIo(#[source] std::io::Error),
    /// Failed reading from the disk file.
    #[error("Failed reading from disk file")]
    ReadingDisk(#[source] std::io::Error),
    /// Failed writing to the disk file.
    #[error("Failed writing to disk file")]
    WritingDisk(#[source] std::io::Error),
    /// Failed querying the allocation status of a range.
    #[error("Failed querying allocation status")]
    Allocation(#[source] std::io::Error),
}

pub type DiskFileResult<T> = std::result::Result<T, DiskFileError>;

/// Abstraction over the effective file backing up a block device, with
/// support for synchronous and asynchronous I/O and allocation queries.
///
/// This allows abstracting over raw image files as well as in-memory
/// disks.
pub trait DiskFile: Send {
    fn size(&mut self) -> DiskFileResult<u64>;

    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> DiskFileResult<()>;

    fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> DiskFileResult<()>;

    /// Report whether the range starting at `offset` is backed by
    /// allocated storage, along with the length in bytes of the run
    /// sharing that state. The search may be capped at `max_bytes`.
    ///
    /// Backends without allocation tracking report everything allocated.
    fn is_allocated(&mut self, _offset: u64, max_bytes: u64) -> DiskFileResult<(bool, u64)> {
        Ok((true, max_bytes))
    }

    fn new_async_io(&self) -> DiskFileResult<Box<dyn AsyncIo>>;
}

#[derive(Error, Debug)]
pub enum AsyncIoError {
    /// Failed vectored reading from file.
    #[error("Failed vectored reading from file")]
    ReadVectored(#[source] std::io::Error),
}

pub type AsyncIoResult<T> = std::result::Result<T, AsyncIoError>;

/// Asynchronous read interface with explicit completion retrieval.
///
/// Submitted requests are identified by `user_data`; completions are
/// reported as `(user_data, result)` pairs where a negative result is an
/// errno value. Implementations are free to complete requests
/// synchronously at submission time, as long as the completion is still
/// reported through `next_completed_request()`.
pub trait AsyncIo: Send {
    /// EventFd signaled whenever a new completion is queued, for callers
    /// that integrate with an event loop.
    fn notifier(&self) -> &EventFd;

    fn read_vectored(
        &mut self,
        offset: libc::off_t,
        iovecs: &[libc::iovec],
        user_data: u64,
    ) -> AsyncIoResult<()>;

    fn next_completed_request(&mut self) -> Option<(u64, i32)>;
}
