// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::{HashMap, VecDeque};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use block::{DeviceList, SECTOR_SHIFT, SECTORS_PER_DIRTY_CHUNK};
use vm_migration::{
    LiveMigratable, MigratableError, MigrationParams, MigrationSource, MigrationStream,
};

use crate::device::{enumerate_devices, DeviceCursor};
use crate::protocol::{self, SentBlock};
use crate::{receiver, Error, Result, CHUNK_SIZE};

/// Cap on how far a single allocation probe may look ahead, in sectors.
const MAX_IS_ALLOCATED_SEARCH: u64 = 65536;

/// A chunk read scheduled for transmission.
///
/// Owned by the in-flight table between submission and completion of
/// its read, then by the pending queue until it has been sent. The
/// buffer always spans a full chunk even when `nr_sectors` is shorter
/// (device tail); the receiver only writes `nr_sectors` sectors.
struct PendingRead {
    dev_idx: usize,
    sector: u64,
    nr_sectors: u64,
    buf: Vec<u8>,
    ret: i32,
    /// Whether this chunk was read by the bulk phase. Decides sparse
    /// elision, which must not depend on when the send happens.
    from_bulk: bool,
}

impl PendingRead {
    fn new(dev_idx: usize, sector: u64, nr_sectors: u64, from_bulk: bool) -> Self {
        PendingRead {
            dev_idx,
            sector,
            nr_sectors,
            buf: vec![0u8; CHUNK_SIZE as usize],
            ret: 0,
            from_bulk,
        }
    }
}

#[derive(Default)]
struct TransferStats {
    total_blocks: u64,
    zero_blocks: u64,
    bulk_blocks: u64,
}

/// Sender-side block migration session.
///
/// Streams every writable device of the registry to the peer: one bulk
/// pass over each device, then dirty passes re-copying what the guest
/// rewrote, until [`stage2_done`](MigrationEngine::stage2_done) decides
/// the rest fits in the downtime budget. Reads are pipelined: chunks are
/// submitted asynchronously, queued on completion, and drained to the
/// stream under the transport rate limit.
pub struct MigrationEngine {
    device_list: DeviceList,

    blk_enable: bool,
    shared_base: bool,
    sparse_enable: bool,
    max_downtime: f64,

    devices: Vec<DeviceCursor>,
    inflight: HashMap<u64, PendingRead>,
    pending: VecDeque<PendingRead>,
    next_req_id: u64,

    submitted: usize,
    read_done: usize,
    transferred: u64,

    total_sector_sum: u64,
    prev_progress: Option<u64>,
    bulk_completed: bool,

    total_read_time: Duration,
    prev_time_offset: Instant,
    reads: u64,

    stats: TransferStats,
}

impl MigrationEngine {
    pub fn new(device_list: DeviceList) -> Self {
        MigrationEngine {
            device_list,
            blk_enable: false,
            shared_base: false,
            sparse_enable: false,
            max_downtime: MigrationParams::default().max_downtime,
            devices: Vec::new(),
            inflight: HashMap::new(),
            pending: VecDeque::new(),
            next_req_id: 0,
            submitted: 0,
            read_done: 0,
            transferred: 0,
            total_sector_sum: 0,
            prev_progress: None,
            bulk_completed: false,
            total_read_time: Duration::ZERO,
            prev_time_offset: Instant::now(),
            reads: 0,
            stats: TransferStats::default(),
        }
    }

    /// True while the session has registered devices.
    pub fn active(&self) -> bool {
        !self.devices.is_empty()
    }

    pub fn bytes_total(&self) -> u64 {
        self.devices
            .iter()
            .map(|c| c.total_sectors << SECTOR_SHIFT)
            .sum()
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.devices
            .iter()
            .map(|c| c.completed_sectors << SECTOR_SHIFT)
            .sum()
    }

    pub fn bytes_remaining(&self) -> u64 {
        self.bytes_total() - self.bytes_transferred()
    }

    /// Reads issued but not yet completed.
    pub fn submitted(&self) -> usize {
        self.submitted
    }

    /// Reads completed but not yet sent.
    pub fn read_done(&self) -> usize {
        self.read_done
    }

    /// Device-block frames handed to the stream by the pipeline.
    pub fn blocks_transferred(&self) -> u64 {
        self.transferred
    }

    fn reset_state(&mut self) {
        self.devices.clear();
        self.inflight.clear();
        self.pending.clear();
        self.submitted = 0;
        self.read_done = 0;
        self.transferred = 0;
        self.total_sector_sum = 0;
        self.prev_progress = None;
        self.bulk_completed = false;
        self.total_read_time = Duration::ZERO;
        self.prev_time_offset = Instant::now();
        self.reads = 0;
        self.stats = TransferStats::default();
    }

    /// Submit the asynchronous read of one chunk and mark it in flight.
    fn submit_chunk_read(
        &mut self,
        dev_idx: usize,
        sector: u64,
        nr_sectors: u64,
        from_bulk: bool,
    ) -> Result<()> {
        if self.submitted == 0 {
            self.prev_time_offset = Instant::now();
        }

        let id = self.next_req_id;
        self.next_req_id += 1;

        let mut blk = PendingRead::new(dev_idx, sector, nr_sectors, from_bulk);
        let iovec = libc::iovec {
            iov_base: blk.buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: (nr_sectors << SECTOR_SHIFT) as usize,
        };
        // The heap storage behind `buf` is stable across the move into
        // the in-flight table, so the iovec stays valid until the
        // completion is collected.
        self.inflight.insert(id, blk);

        let res = self.devices[dev_idx]
            .device
            .lock()
            .unwrap()
            .submit_read(sector, &[iovec], id);
        if let Err(e) = res {
            self.inflight.remove(&id);
            return Err(e.into());
        }

        self.devices[dev_idx].aio_bitmap.set(sector, nr_sectors, true);
        self.submitted += 1;
        Ok(())
    }

    /// Collect completions from every device and move the finished reads
    /// to the pending queue. The elapsed wall time since the previous
    /// collection point is attributed to the reads that completed, which
    /// yields the moving read-throughput average without extra sampling.
    fn process_completions(&mut self) {
        for dev_idx in 0..self.devices.len() {
            loop {
                let completed = self.devices[dev_idx]
                    .device
                    .lock()
                    .unwrap()
                    .next_completed_request();
                let Some((id, ret)) = completed else { break };

                let Some(mut blk) = self.inflight.remove(&id) else {
                    warn!("spurious completion for request {id}");
                    continue;
                };
                blk.ret = if ret < 0 { ret } else { 0 };

                let now = Instant::now();
                self.reads += 1;
                self.total_read_time += now.duration_since(self.prev_time_offset);
                self.prev_time_offset = now;

                self.devices[blk.dev_idx]
                    .aio_bitmap
                    .set(blk.sector, blk.nr_sectors, false);
                self.pending.push_back(blk);

                self.submitted -= 1;
                self.read_done += 1;
            }
        }
    }

    /// Wait for every outstanding read to complete. This is the one
    /// blocking point of the engine; the dirty scan uses it to keep two
    /// reads of the same chunk from overlapping, and cleanup uses it so
    /// completions never outlive the device cursors.
    pub fn drain_in_flight(&mut self) {
        while self.submitted > 0 {
            let before = self.read_done;
            self.process_completions();
            if self.submitted > 0 && self.read_done == before {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    /// Encode one pending read, accounting the session statistics.
    fn send_block(&mut self, f: &mut MigrationStream, blk: &PendingRead) -> Result<()> {
        let cursor = &self.devices[blk.dev_idx];
        let sent = protocol::send_block(
            f,
            &cursor.name,
            blk.sector,
            &blk.buf,
            cursor.sparse_enable,
            blk.from_bulk,
        )?;

        self.stats.total_blocks += 1;
        if sent != SentBlock::Payload {
            self.stats.zero_blocks += 1;
        }
        if blk.from_bulk {
            self.stats.bulk_blocks += 1;
        }
        Ok(())
    }

    /// Drain the pending queue head-first until the stream reports its
    /// rate window exhausted. A failed read surfaces here and aborts the
    /// session.
    fn flush_pending(&mut self, f: &mut MigrationStream) -> Result<()> {
        trace!(
            "flush enter submitted {} read_done {} transferred {}",
            self.submitted,
            self.read_done,
            self.transferred
        );

        while !f.rate_limited() {
            let Some(blk) = self.pending.pop_front() else { break };
            if blk.ret < 0 {
                return Err(Error::AsyncRead(std::io::Error::from_raw_os_error(
                    -blk.ret,
                )));
            }
            self.send_block(f, &blk)?;

            self.read_done -= 1;
            self.transferred += 1;
        }

        trace!(
            "flush exit submitted {} read_done {} transferred {}",
            self.submitted,
            self.read_done,
            self.transferred
        );
        Ok(())
    }

    /// Advance the bulk phase of device `dev_idx` by at most one chunk.
    /// Returns true once the device has no bulk work left.
    fn save_device_bulk(&mut self, dev_idx: usize) -> Result<bool> {
        let total_sectors = self.devices[dev_idx].total_sectors;
        let mut cur_sector = self.devices[dev_idx].cur_sector;

        if self.devices[dev_idx].shared_base {
            let device = self.devices[dev_idx].device.clone();
            let mut bs = device.lock().unwrap();
            // Skip the leading unallocated run; those sectors exist
            // identically in the shared base at the destination.
            while cur_sector < total_sectors {
                let (allocated, run) = bs.is_allocated(cur_sector, MAX_IS_ALLOCATED_SEARCH)?;
                if allocated {
                    break;
                }
                cur_sector += run;
            }
        }

        if cur_sector >= total_sectors {
            let cursor = &mut self.devices[dev_idx];
            cursor.cur_sector = total_sectors;
            cursor.completed_sectors = total_sectors;
            return Ok(true);
        }

        self.devices[dev_idx].completed_sectors = cur_sector;

        cur_sector &= !(SECTORS_PER_DIRTY_CHUNK - 1);

        // A full chunk is transferred even when partly unallocated; only
        // the device tail is shorter.
        let nr_sectors = SECTORS_PER_DIRTY_CHUNK.min(total_sectors - cur_sector);

        self.submit_chunk_read(dev_idx, cur_sector, nr_sectors, true)?;

        // Resetting the dirty bits at submission is ordered before the
        // read: any guest write racing with it re-dirties the chunk and
        // the dirty phase recopies it.
        self.devices[dev_idx]
            .device
            .lock()
            .unwrap()
            .reset_dirty(cur_sector, nr_sectors);

        let cursor = &mut self.devices[dev_idx];
        cursor.cur_sector = (cur_sector + SECTORS_PER_DIRTY_CHUNK).min(total_sectors);
        // "Done" is only reported by the cursor check above, so that the
        // final call also accounts the last chunk as completed.
        Ok(false)
    }

    /// One bulk step across the device list: advance the first device
    /// with bulk work left, and report the progress percentage when it
    /// changed. Returns false once every device finished its bulk phase.
    fn save_bulked_block(&mut self, f: &mut MigrationStream) -> Result<bool> {
        let mut completed_sector_sum = 0;
        let mut progressed = false;

        for dev_idx in 0..self.devices.len() {
            if !self.devices[dev_idx].bulk_completed {
                if self.save_device_bulk(dev_idx)? {
                    // Completed the bulk section for this device.
                    self.devices[dev_idx].bulk_completed = true;
                }
                completed_sector_sum += self.devices[dev_idx].completed_sectors;
                progressed = true;
                break;
            } else {
                completed_sector_sum += self.devices[dev_idx].completed_sectors;
            }
        }

        let progress = if self.total_sector_sum != 0 {
            completed_sector_sum * 100 / self.total_sector_sum
        } else {
            100
        };
        if self.prev_progress != Some(progress) {
            self.prev_progress = Some(progress);
            protocol::send_progress(f, progress)?;
            debug!("Completed {progress} %");
        }

        Ok(progressed)
    }

    fn reset_dirty_cursors(&mut self) {
        for cursor in &mut self.devices {
            cursor.cur_dirty = 0;
        }
    }

    /// Scan device `dev_idx` for the next dirty chunk from its dirty
    /// cursor and copy it, asynchronously or inline. Returns true when
    /// the cursor has reached the end of the device for this pass.
    fn save_device_dirty(
        &mut self,
        f: &mut MigrationStream,
        dev_idx: usize,
        is_async: bool,
    ) -> Result<bool> {
        let total_sectors = self.devices[dev_idx].total_sectors;
        let mut sector = self.devices[dev_idx].cur_dirty;

        while sector < total_sectors {
            if self.devices[dev_idx].aio_bitmap.test(sector) {
                // A read of this chunk is still in the pipeline; let it
                // land before looking at the chunk again.
                self.drain_in_flight();
            }

            let dirty = self.devices[dev_idx]
                .device
                .lock()
                .unwrap()
                .get_dirty(sector);
            if dirty {
                let nr_sectors = SECTORS_PER_DIRTY_CHUNK.min(total_sectors - sector);

                if is_async {
                    self.submit_chunk_read(dev_idx, sector, nr_sectors, false)?;
                } else {
                    let mut blk = PendingRead::new(dev_idx, sector, nr_sectors, false);
                    self.devices[dev_idx]
                        .device
                        .lock()
                        .unwrap()
                        .read_sectors(
                            sector,
                            &mut blk.buf[..(nr_sectors << SECTOR_SHIFT) as usize],
                        )?;
                    self.send_block(f, &blk)?;
                }

                self.devices[dev_idx]
                    .device
                    .lock()
                    .unwrap()
                    .reset_dirty(sector, nr_sectors);

                let cursor = &mut self.devices[dev_idx];
                cursor.cur_dirty = sector + SECTORS_PER_DIRTY_CHUNK;
                return Ok(cursor.cur_dirty >= total_sectors);
            }

            sector += SECTORS_PER_DIRTY_CHUNK;
            self.devices[dev_idx].cur_dirty = sector;
        }

        Ok(true)
    }

    /// One dirty step: copy at most one dirty chunk somewhere in the
    /// device list. Returns true when no device had a dirty chunk left
    /// in this pass.
    fn save_dirty_block(&mut self, f: &mut MigrationStream, is_async: bool) -> Result<bool> {
        for dev_idx in 0..self.devices.len() {
            if !self.save_device_dirty(f, dev_idx, is_async)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn remaining_dirty_bytes(&self) -> u64 {
        self.devices
            .iter()
            .map(|c| c.device.lock().unwrap().dirty_count() * CHUNK_SIZE)
            .sum()
    }

    /// Convergence test: the bulk phase is over and the remaining dirty
    /// data can be read and sent within the downtime budget at the
    /// observed read throughput.
    fn stage2_done(&self) -> bool {
        if !self.bulk_completed {
            return false;
        }

        let remaining_dirty = self.remaining_dirty_bytes();
        if remaining_dirty == 0 {
            return true;
        }

        if self.reads == 0 {
            return false;
        }
        let read_secs = self.total_read_time.as_secs_f64();
        if read_secs <= 0.0 {
            // Reads completed faster than the clock resolution.
            return true;
        }
        let bwidth = self.reads as f64 / read_secs * CHUNK_SIZE as f64;

        remaining_dirty as f64 / bwidth <= self.max_downtime
    }

    fn set_dirty_tracking(&mut self, enable: bool) {
        for cursor in &self.devices {
            cursor.device.lock().unwrap().set_dirty_tracking(enable);
        }
    }

    /// Release every resource of the session: let in-flight reads land,
    /// stop dirty tracking, hand the devices back and drop all queued
    /// chunks. Runs on every error exit and on cancel; the engine is
    /// inert afterwards until the next setup.
    fn cleanup(&mut self) {
        self.drain_in_flight();

        self.set_dirty_tracking(false);

        for cursor in &self.devices {
            cursor.device.lock().unwrap().set_in_use(false);
        }
        self.devices.clear();

        self.pending.clear();
        self.read_done = 0;

        if self.stats.total_blocks != 0 {
            info!(
                "block migration: sent {} blocks of which {} were zero and {} were bulk",
                self.stats.total_blocks, self.stats.zero_blocks, self.stats.bulk_blocks
            );
        }
        self.stats = TransferStats::default();
    }

    fn save_setup(&mut self, f: &mut MigrationStream) -> Result<()> {
        self.reset_state();
        self.devices = enumerate_devices(&self.device_list, self.shared_base, self.sparse_enable);
        self.total_sector_sum = self.devices.iter().map(|c| c.total_sectors).sum();

        // Start tracking guest writes.
        self.set_dirty_tracking(true);

        // Nothing has been read yet so this is a no-op, but existing
        // peers expect the stream shape it implies.
        self.flush_pending(f)?;

        self.reset_dirty_cursors();
        protocol::send_eos(f)?;
        Ok(())
    }

    fn save_iterate(&mut self, f: &mut MigrationStream) -> Result<bool> {
        self.process_completions();
        self.flush_pending(f)?;

        self.reset_dirty_cursors();

        // Bound the pipeline by the transport rate window: in-flight
        // plus queued bytes never exceed what the window could send.
        while ((self.submitted + self.read_done) as u64) * CHUNK_SIZE < f.rate_limit_window() {
            self.process_completions();

            if !self.bulk_completed {
                // First finish the bulk phase.
                if !self.save_bulked_block(f)? {
                    // Finished the bulk phase on all devices.
                    self.bulk_completed = true;
                }
            } else if self.save_dirty_block(f, true)? {
                // No dirty chunks left anywhere in this pass.
                break;
            }
        }

        self.process_completions();
        self.flush_pending(f)?;

        protocol::send_eos(f)?;
        Ok(self.stage2_done())
    }

    fn save_complete(&mut self, f: &mut MigrationStream) -> Result<()> {
        self.process_completions();
        self.flush_pending(f)?;

        // The caller has paused the guest and drained the pipeline.
        assert_eq!(self.submitted, 0);

        self.reset_dirty_cursors();

        // Synchronous final pass: read and send inline, no pipeline.
        while !self.save_dirty_block(f, false)? {}

        self.cleanup();

        // Report completion.
        protocol::send_progress(f, 100)?;
        debug!("Block migration completed");

        protocol::send_eos(f)?;
        Ok(())
    }
}

impl LiveMigratable for MigrationEngine {
    fn set_params(&mut self, params: &MigrationParams) {
        self.blk_enable = params.blk;
        self.shared_base = params.shared;
        self.sparse_enable = params.sparse;
        self.max_downtime = params.max_downtime;

        if params.sparse {
            info!("enabling sparse block migration");
        }

        // Shared base and sparse only make sense with block migration
        // enabled at all.
        self.blk_enable |= params.shared;
        self.blk_enable |= params.sparse;
    }

    fn is_active(&self) -> bool {
        self.blk_enable
    }

    fn setup(&mut self, f: &mut MigrationStream) -> std::result::Result<(), MigratableError> {
        self.save_setup(f).map_err(|e| {
            self.cleanup();
            MigratableError::Setup(e.into())
        })
    }

    fn iterate(&mut self, f: &mut MigrationStream) -> std::result::Result<bool, MigratableError> {
        self.save_iterate(f).map_err(|e| {
            self.cleanup();
            MigratableError::Iterate(e.into())
        })
    }

    fn complete(&mut self, f: &mut MigrationStream) -> std::result::Result<(), MigratableError> {
        self.save_complete(f).map_err(|e| {
            self.cleanup();
            MigratableError::CompleteMigration(e.into())
        })
    }

    fn load(&mut self, f: &mut MigrationSource) -> std::result::Result<(), MigratableError> {
        receiver::load(&self.device_list, f).map_err(|e| MigratableError::MigrateReceive(e.into()))
    }

    fn cancel(&mut self) {
        self.cleanup();
    }
}
