// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Wire format of the block migration stream.
//!
//! A frame starts with a 64-bit big-endian header carrying the byte
//! address of the first sector OR'd with flag bits in the low bits
//! (the sector size leaves the low 9 bits free). A device-block frame
//! is followed by a one-byte device name length, the name bytes, and,
//! unless the zero-block flag is set, exactly [`CHUNK_SIZE`] bytes of
//! payload. Progress and end-of-stream frames are header-only; a
//! progress header carries the percentage in place of the address.

use vm_migration::MigrationStream;

use block::{SECTOR_SHIFT, SECTOR_SIZE};

use crate::{Error, Result, CHUNK_SIZE};

pub const FLAG_DEVICE_BLOCK: u64 = 0x01;
pub const FLAG_EOS: u64 = 0x02;
pub const FLAG_PROGRESS: u64 = 0x04;
pub const FLAG_ZERO_BLOCK: u64 = 0x08;

/// Mask of the flag bits within a header word.
pub const FLAG_MASK: u64 = SECTOR_SIZE - 1;

/// What a device-block frame submission turned into on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SentBlock {
    /// Full payload frame.
    Payload,
    /// Zero-flagged frame, no payload.
    Zero,
    /// All-zero chunk elided during the bulk phase of a sparse device.
    Elided,
}

/// Word-at-a-time scan of the whole buffer. This runs for every chunk
/// on the send path, so it works on 128-bit lanes instead of bytes.
pub fn buffer_is_zero(buf: &[u8]) -> bool {
    // SAFETY: u128 has no invalid bit patterns and align_to only hands
    // out the properly aligned middle part of the buffer.
    let (prefix, lanes, suffix) = unsafe { buf.align_to::<u128>() };
    prefix.iter().all(|&b| b == 0)
        && lanes.iter().all(|&w| w == 0)
        && suffix.iter().all(|&b| b == 0)
}

/// Emit one device-block frame for the chunk starting at `sector`.
///
/// All-zero chunks are elided entirely while a sparse device is still
/// in its bulk phase (the destination starts out zeroed), and are sent
/// as payload-less zero-flagged frames otherwise. `buf` is always a
/// full chunk; the receiver derives how many sectors to write from the
/// device length.
pub(crate) fn send_block(
    f: &mut MigrationStream,
    device_name: &str,
    sector: u64,
    buf: &[u8],
    sparse_enable: bool,
    in_bulk: bool,
) -> Result<SentBlock> {
    debug_assert_eq!(buf.len() as u64, CHUNK_SIZE);

    let zero_blk = buffer_is_zero(buf);
    if zero_blk && sparse_enable && in_bulk {
        return Ok(SentBlock::Elided);
    }

    let len = device_name.len();
    if len > u8::MAX as usize {
        return Err(Error::DeviceNameTooLong(len));
    }

    let mut header = (sector << SECTOR_SHIFT) | FLAG_DEVICE_BLOCK;
    if zero_blk {
        header |= FLAG_ZERO_BLOCK;
    }
    f.put_be64(header).map_err(Error::StreamWrite)?;
    f.put_u8(len as u8).map_err(Error::StreamWrite)?;
    f.put_bytes(device_name.as_bytes())
        .map_err(Error::StreamWrite)?;

    if zero_blk {
        // Without payloads between them, long runs of zero frames pile
        // up in the transport buffer and stall behind the rate limiter.
        f.flush().map_err(Error::StreamWrite)?;
        Ok(SentBlock::Zero)
    } else {
        f.put_bytes(buf).map_err(Error::StreamWrite)?;
        Ok(SentBlock::Payload)
    }
}

pub(crate) fn send_progress(f: &mut MigrationStream, percent: u64) -> Result<()> {
    f.put_be64((percent << SECTOR_SHIFT) | FLAG_PROGRESS)
        .map_err(Error::StreamWrite)
}

pub(crate) fn send_eos(f: &mut MigrationStream) -> Result<()> {
    f.put_be64(FLAG_EOS).map_err(Error::StreamWrite)
}
