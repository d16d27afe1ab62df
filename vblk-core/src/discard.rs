// Copyright (c) 2024 The vblk Authors.
//
// vblk is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the
// Mulan PSL v2. You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! The discard path (spec.md §4.6), shared by both engines.
//!
//! The wire layout of a discard/write-zeroes segment (start sector,
//! sector count, flags) mirrors `virtio::device::block::DiscardWriteZeroesSeg`
//! — the same 16-byte record the virtio-blk spec defines, since that's the
//! only "array of ranges in one iovec" shape a frontend would ever hand us.

use std::os::unix::io::RawFd;

use log::error;

use crate::backing::BackingHandle;
use crate::error::BlockError;
use crate::request::Request;

/// Hard cap spec.md §4.6 puts on top of whatever `discard=<..>:<max_segs>:<..>`
/// configured (`DiscardLimits::max_segments`): "cap total segments at 256".
const HARD_MAX_SEGMENTS: usize = 256;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct DiscardRecord {
    sector: u64,
    num_sectors: u32,
    flags: u32,
}

struct Range {
    sector: u64,
    num_sectors: u64,
}

/// Execute a discard request against `backing`. Common to both engines;
/// neither submits this through their own async machinery.
pub fn execute(backing: &BackingHandle, req: &Request) -> Result<(), BlockError> {
    if backing.read_only {
        return Err(BlockError::ReadOnly);
    }
    let limits = backing.discard.ok_or(BlockError::NotSupported)?;
    let sector_size = backing.logical_sector_size as u64;

    let ranges = parse_ranges(req, sector_size)?;
    let max_segments = limits.max_segments.min(HARD_MAX_SEGMENTS);
    if ranges.len() > max_segments {
        return Err(BlockError::InvalidArg(format!(
            "discard segment count {} exceeds {max_segments}",
            ranges.len()
        )));
    }

    for r in &ranges {
        validate_range(r, &limits, sector_size, backing)?;
    }

    for r in &ranges {
        let abs_start = backing.absolute_offset(r.sector * sector_size);
        let abs_len = r.num_sectors * sector_size;
        do_discard(backing, abs_start, abs_len)?;
    }
    Ok(())
}

fn parse_ranges(req: &Request, sector_size: u64) -> Result<Vec<Range>, BlockError> {
    if req.iov.len() == 1 {
        let iov = &req.iov[0];
        let rec_size = std::mem::size_of::<DiscardRecord>();
        if iov.len == 0 || iov.len % rec_size != 0 {
            return Err(BlockError::InvalidArg(
                "discard range vector is not a whole number of records".into(),
            ));
        }
        let count = iov.len / rec_size;
        // SAFETY: iov describes caller memory of at least `iov.len` bytes,
        // which we've just checked is `count * rec_size`.
        let records: &[DiscardRecord] =
            unsafe { std::slice::from_raw_parts(iov.base as *const DiscardRecord, count) };
        Ok(records
            .iter()
            .map(|r| Range {
                sector: r.sector,
                num_sectors: r.num_sectors as u64,
            })
            .collect())
    } else {
        if req.resid % sector_size != 0 || req.offset % sector_size != 0 {
            return Err(BlockError::InvalidArg(
                "discard range is not sector-aligned".into(),
            ));
        }
        Ok(vec![Range {
            sector: req.offset / sector_size,
            num_sectors: req.resid / sector_size,
        }])
    }
}

fn validate_range(
    r: &Range,
    limits: &crate::config::DiscardLimits,
    sector_size: u64,
    backing: &BackingHandle,
) -> Result<(), BlockError> {
    if r.num_sectors == 0 {
        return Err(BlockError::InvalidArg("zero-length discard range".into()));
    }
    if r.num_sectors > limits.max_sectors {
        return Err(BlockError::InvalidArg(format!(
            "discard range of {} sectors exceeds max {}",
            r.num_sectors, limits.max_sectors
        )));
    }
    if limits.alignment_sectors > 0 && r.sector % limits.alignment_sectors != 0 {
        return Err(BlockError::InvalidArg(format!(
            "discard start sector {} is not aligned to {}",
            r.sector, limits.alignment_sectors
        )));
    }
    let abs_start = backing.absolute_offset(r.sector * sector_size);
    let abs_end = abs_start + r.num_sectors * sector_size;
    if abs_end > backing.bound() {
        return Err(BlockError::InvalidArg(
            "discard range extends past the end of the backing".into(),
        ));
    }
    Ok(())
}

fn do_discard(backing: &BackingHandle, abs_start: u64, abs_len: u64) -> Result<(), BlockError> {
    match backing.kind {
        crate::backing::BackingKind::Block => block_discard_ioctl(backing.fd, abs_start, abs_len),
        crate::backing::BackingKind::Regular => {
            fallocate_punch_hole(backing.fd, abs_start, abs_len)?;
            if crate::rawio::fdatasync(backing.fd) != 0 {
                error!("failed to sync after discard: {}", std::io::Error::last_os_error());
                return Err(BlockError::last_os_error());
            }
            Ok(())
        }
    }
}

#[cfg(target_os = "linux")]
fn block_discard_ioctl(fd: RawFd, start: u64, len: u64) -> Result<(), BlockError> {
    let range: [u64; 2] = [start, len];
    // BLKDISCARD; the exact ioctl number matches <linux/fs.h>'s
    // `_IO(0x12, 119)` that every block driver on Linux implements.
    const BLKDISCARD: libc::c_ulong = 0x1277;
    // SAFETY: fd refers to a block device; range is a valid 2-u64 array
    // the kernel reads for the duration of the call.
    let ret = unsafe { libc::ioctl(fd, BLKDISCARD, range.as_ptr()) };
    if ret != 0 {
        error!("BLKDISCARD ioctl failed: {}", std::io::Error::last_os_error());
        return Err(BlockError::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn block_discard_ioctl(_fd: RawFd, _start: u64, _len: u64) -> Result<(), BlockError> {
    Err(BlockError::NotSupported)
}

#[cfg(target_os = "linux")]
fn fallocate_punch_hole(fd: RawFd, start: u64, len: u64) -> Result<(), BlockError> {
    // SAFETY: fd refers to a regular file opened by this process.
    let ret = unsafe {
        libc::fallocate(
            fd,
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            start as libc::off_t,
            len as libc::off_t,
        )
    };
    if ret != 0 {
        return Err(BlockError::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn fallocate_punch_hole(_fd: RawFd, _start: u64, _len: u64) -> Result<(), BlockError> {
    Err(BlockError::NotSupported)
}
