// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Live block device migration.
//!
//! The sender side streams the contents of every writable block device
//! to a peer while the guest keeps mutating them: a bulk pass copies
//! each device once, then dirty passes re-copy the chunks the guest
//! rewrote, until the remaining dirty data fits in the configured
//! downtime budget. The receiver side decodes the stream and applies
//! the writes to its local devices.

mod bitmap;
mod device;
pub mod engine;
pub mod protocol;
pub mod receiver;

use thiserror::Error;

use block::{SECTOR_SHIFT, SECTORS_PER_DIRTY_CHUNK};

pub use engine::MigrationEngine;

/// Bytes of one transfer chunk. Chunks are the unit of dirty tracking,
/// of reads, and of device-block frames on the wire.
pub const CHUNK_SIZE: u64 = SECTORS_PER_DIRTY_CHUNK << SECTOR_SHIFT;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Block device failure")]
    BlockDevice(#[source] block::Error),
    #[error("Failed writing to the migration stream")]
    StreamWrite(#[source] std::io::Error),
    #[error("Failed reading from the migration stream")]
    StreamRead(#[source] std::io::Error),
    #[error("Asynchronous chunk read failed")]
    AsyncRead(#[source] std::io::Error),
    #[error("Device name is not valid UTF-8")]
    DeviceName,
    #[error("Device name too long for the wire format: {0} bytes")]
    DeviceNameTooLong(usize),
    #[error("Unknown block device '{0}'")]
    UnknownDevice(String),
    #[error("Sector {sector} is out of range for device '{device}'")]
    OutOfRange { device: String, sector: u64 },
    #[error("Unknown flags in frame header: {0:#x}")]
    UnknownFlags(u64),
}

impl From<block::Error> for Error {
    fn from(e: block::Error) -> Self {
        Error::BlockDevice(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
