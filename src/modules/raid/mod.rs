//! Software RAID for Strata
//!
//! Composes multiple [`BlockDevice`] members into one logical device
//! with striping (RAID0), mirroring (RAID1), or distributed parity
//! (RAID5). Each array owns a shared [`MemberSet`] by composition;
//! capacity and health are pure functions of level and geometry.
//!
//! One exclusive lock per array guards the failed-member vector and
//! serializes I/O, which is what makes RAID5's read-modify-write cycle
//! atomic with respect to concurrent writers on the same stripe.
//! `rebuild` holds the lock for its full duration, blocking foreground
//! I/O until it completes.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::blockdev::{check_io, BlockDevice, BlockDeviceError, DeviceKind};

/// RAID error types
#[derive(Error, Debug)]
pub enum RaidError {
    #[error("Block device error: {0}")]
    Device(#[from] BlockDeviceError),
    #[error("{level} requires at least {required} members, got {got}")]
    InsufficientMembers {
        level: RaidLevel,
        required: usize,
        got: usize,
    },
    #[error("Member {index} block size {got} does not match {expected}")]
    MismatchedBlockSize {
        index: usize,
        got: usize,
        expected: usize,
    },
    #[error("Invalid member index {0}")]
    InvalidMemberIndex(usize),
    #[error("RAID0 has no redundancy to rebuild from")]
    RebuildUnsupported,
    #[error("Member {0} is not marked failed")]
    MemberNotFailed(usize),
    #[error("No healthy member available as a rebuild source")]
    NoHealthySource,
    #[error("Array is closed")]
    Closed,
}

/// Result type for RAID operations
pub type Result<T> = std::result::Result<T, RaidError>;

/// Supported RAID levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RaidLevel {
    Raid0,
    Raid1,
    Raid5,
}

impl RaidLevel {
    /// Minimum member count for the level.
    pub fn min_members(&self) -> usize {
        match self {
            RaidLevel::Raid0 | RaidLevel::Raid1 => 2,
            RaidLevel::Raid5 => 3,
        }
    }

    /// How many failed members the level tolerates.
    pub fn failure_tolerance(&self, member_count: usize) -> usize {
        match self {
            RaidLevel::Raid0 => 0,
            RaidLevel::Raid1 => member_count - 1,
            RaidLevel::Raid5 => 1,
        }
    }

    /// Logical capacity in blocks given member geometry.
    pub fn logical_capacity(&self, member_count: usize, blocks_per_member: u64) -> u64 {
        match self {
            RaidLevel::Raid0 => member_count as u64 * blocks_per_member,
            RaidLevel::Raid1 => blocks_per_member,
            RaidLevel::Raid5 => (member_count as u64 - 1) * blocks_per_member,
        }
    }

    fn kind(&self) -> DeviceKind {
        match self {
            RaidLevel::Raid0 => DeviceKind::Raid0,
            RaidLevel::Raid1 => DeviceKind::Raid1,
            RaidLevel::Raid5 => DeviceKind::Raid5,
        }
    }
}

impl std::fmt::Display for RaidLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaidLevel::Raid0 => f.write_str("RAID0"),
            RaidLevel::Raid1 => f.write_str("RAID1"),
            RaidLevel::Raid5 => f.write_str("RAID5"),
        }
    }
}

/// Array health and geometry report.
#[derive(Debug, Clone, Serialize)]
pub struct RaidStatus {
    pub level: RaidLevel,
    pub member_count: usize,
    pub failed_members: Vec<usize>,
    pub healthy: bool,
    pub block_size: usize,
    pub block_count: u64,
}

/// Common contract of all RAID levels on top of [`BlockDevice`].
pub trait RaidArray: BlockDevice {
    /// Mark a member failed; subsequent I/O avoids or reconstructs around it.
    fn mark_device_failed(&self, index: usize) -> Result<()>;

    /// Reconstruct a failed member's contents in place and clear its
    /// failed flag.
    fn rebuild(&self, index: usize) -> Result<()>;

    /// Current array status.
    fn status(&self) -> RaidStatus;
}

/// Member devices plus their failed flags, shared by every level.
struct MemberSet {
    members: Vec<Arc<dyn BlockDevice>>,
    failed: Vec<bool>,
    closed: bool,
}

impl MemberSet {
    fn failed_count(&self) -> usize {
        self.failed.iter().filter(|&&f| f).count()
    }

    fn failed_indices(&self) -> Vec<usize> {
        self.failed
            .iter()
            .enumerate()
            .filter_map(|(i, &f)| if f { Some(i) } else { None })
            .collect()
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.members.len() {
            Err(RaidError::InvalidMemberIndex(index))
        } else {
            Ok(())
        }
    }
}

/// Validate members at construction: minimum count, uniform block size,
/// non-zero capacity. Returns the set plus `(block_size, blocks_per_member)`.
fn validate_members(
    level: RaidLevel,
    members: Vec<Arc<dyn BlockDevice>>,
) -> Result<(MemberSet, usize, u64)> {
    let required = level.min_members();
    if members.len() < required {
        return Err(RaidError::InsufficientMembers {
            level,
            required,
            got: members.len(),
        });
    }
    let block_size = members[0].block_size();
    for (index, member) in members.iter().enumerate() {
        if member.block_size() != block_size {
            return Err(RaidError::MismatchedBlockSize {
                index,
                got: member.block_size(),
                expected: block_size,
            });
        }
    }
    // The smallest member bounds the usable rows on every member.
    let blocks_per_member = members
        .iter()
        .map(|m| m.block_count())
        .min()
        .unwrap_or(0);
    if blocks_per_member == 0 {
        return Err(RaidError::Device(BlockDeviceError::InvalidGeometry(
            "members must hold at least one block".to_string(),
        )));
    }
    let failed = vec![false; members.len()];
    Ok((
        MemberSet {
            members,
            failed,
            closed: false,
        },
        block_size,
        blocks_per_member,
    ))
}

fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

/// Build the concrete array for `level` over `members`.
pub fn build_raid_array(
    level: RaidLevel,
    members: Vec<Arc<dyn BlockDevice>>,
) -> Result<Box<dyn RaidArray>> {
    match level {
        RaidLevel::Raid0 => Ok(Box::new(Raid0::new(members)?)),
        RaidLevel::Raid1 => Ok(Box::new(Raid1::new(members)?)),
        RaidLevel::Raid5 => Ok(Box::new(Raid5::new(members)?)),
    }
}

macro_rules! forward_geometry {
    () => {
        fn block_size(&self) -> usize {
            self.block_size
        }

        fn block_count(&self) -> u64 {
            self.block_count
        }
    };
}

fn flush_members(state: &MemberSet) -> std::result::Result<(), BlockDeviceError> {
    if state.closed {
        return Err(BlockDeviceError::DeviceClosed);
    }
    for (i, member) in state.members.iter().enumerate() {
        if !state.failed[i] {
            member.flush()?;
        }
    }
    Ok(())
}

fn close_members(state: &mut MemberSet) -> std::result::Result<(), BlockDeviceError> {
    if state.closed {
        return Err(BlockDeviceError::DeviceClosed);
    }
    state.closed = true;
    for member in &state.members {
        // A failed member may already be unreachable; closing the array
        // still succeeds as long as the healthy members close.
        if let Err(err) = member.close() {
            log::warn!("error closing array member: {}", err);
        }
    }
    Ok(())
}

fn status_of(level: RaidLevel, state: &MemberSet, block_size: usize, block_count: u64) -> RaidStatus {
    let failed = state.failed_indices();
    let healthy = failed.len() <= level.failure_tolerance(state.members.len());
    RaidStatus {
        level,
        member_count: state.members.len(),
        failed_members: failed,
        healthy,
        block_size,
        block_count,
    }
}

fn mark_failed(level: RaidLevel, state: &mut MemberSet, index: usize) -> Result<()> {
    state.check_index(index)?;
    if !state.failed[index] {
        state.failed[index] = true;
        log::warn!(
            "{} member {} marked failed ({} of {} members down)",
            level,
            index,
            state.failed_count(),
            state.members.len()
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// RAID0
// ---------------------------------------------------------------------------

/// Striping without redundancy. Logical block `b` maps to member
/// `b % N`, local block `b / N`. Any failed member loses its stripes.
pub struct Raid0 {
    state: Mutex<MemberSet>,
    block_size: usize,
    block_count: u64,
}

impl Raid0 {
    pub fn new(members: Vec<Arc<dyn BlockDevice>>) -> Result<Self> {
        let (state, block_size, per_member) = validate_members(RaidLevel::Raid0, members)?;
        let block_count = RaidLevel::Raid0.logical_capacity(state.members.len(), per_member);
        Ok(Self {
            state: Mutex::new(state),
            block_size,
            block_count,
        })
    }
}

impl BlockDevice for Raid0 {
    fn read_block(&self, block: u64, buf: &mut [u8]) -> std::result::Result<(), BlockDeviceError> {
        check_io(block, buf.len(), self.block_size, self.block_count)?;
        let state = self.state.lock();
        if state.closed {
            return Err(BlockDeviceError::DeviceClosed);
        }
        let n = state.members.len() as u64;
        let device = (block % n) as usize;
        if state.failed[device] {
            return Err(BlockDeviceError::DeviceFailed(device));
        }
        state.members[device].read_block(block / n, buf)
    }

    fn write_block(&self, block: u64, data: &[u8]) -> std::result::Result<(), BlockDeviceError> {
        check_io(block, data.len(), self.block_size, self.block_count)?;
        let state = self.state.lock();
        if state.closed {
            return Err(BlockDeviceError::DeviceClosed);
        }
        let n = state.members.len() as u64;
        let device = (block % n) as usize;
        if state.failed[device] {
            return Err(BlockDeviceError::DeviceFailed(device));
        }
        state.members[device].write_block(block / n, data)
    }

    forward_geometry!();

    fn flush(&self) -> std::result::Result<(), BlockDeviceError> {
        flush_members(&self.state.lock())
    }

    fn close(&self) -> std::result::Result<(), BlockDeviceError> {
        close_members(&mut self.state.lock())
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Raid0
    }
}

impl RaidArray for Raid0 {
    fn mark_device_failed(&self, index: usize) -> Result<()> {
        mark_failed(RaidLevel::Raid0, &mut self.state.lock(), index)
    }

    fn rebuild(&self, _index: usize) -> Result<()> {
        Err(RaidError::RebuildUnsupported)
    }

    fn status(&self) -> RaidStatus {
        status_of(
            RaidLevel::Raid0,
            &self.state.lock(),
            self.block_size,
            self.block_count,
        )
    }
}

// ---------------------------------------------------------------------------
// RAID1
// ---------------------------------------------------------------------------

/// Mirroring: every write goes to all healthy members, reads come from
/// the first member that answers. Tolerates up to `N - 1` failures.
pub struct Raid1 {
    state: Mutex<MemberSet>,
    block_size: usize,
    block_count: u64,
}

impl Raid1 {
    pub fn new(members: Vec<Arc<dyn BlockDevice>>) -> Result<Self> {
        let (state, block_size, per_member) = validate_members(RaidLevel::Raid1, members)?;
        let block_count = RaidLevel::Raid1.logical_capacity(state.members.len(), per_member);
        Ok(Self {
            state: Mutex::new(state),
            block_size,
            block_count,
        })
    }
}

impl BlockDevice for Raid1 {
    fn read_block(&self, block: u64, buf: &mut [u8]) -> std::result::Result<(), BlockDeviceError> {
        check_io(block, buf.len(), self.block_size, self.block_count)?;
        let state = self.state.lock();
        if state.closed {
            return Err(BlockDeviceError::DeviceClosed);
        }
        for (i, member) in state.members.iter().enumerate() {
            if state.failed[i] {
                continue;
            }
            match member.read_block(block, buf) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    log::debug!("RAID1 read from member {} failed: {}", i, err);
                }
            }
        }
        Err(BlockDeviceError::NoHealthyDevice)
    }

    fn write_block(&self, block: u64, data: &[u8]) -> std::result::Result<(), BlockDeviceError> {
        check_io(block, data.len(), self.block_size, self.block_count)?;
        let state = self.state.lock();
        if state.closed {
            return Err(BlockDeviceError::DeviceClosed);
        }
        let mut wrote = false;
        for (i, member) in state.members.iter().enumerate() {
            if state.failed[i] {
                continue;
            }
            member.write_block(block, data)?;
            wrote = true;
        }
        if wrote {
            Ok(())
        } else {
            Err(BlockDeviceError::NoHealthyDevice)
        }
    }

    forward_geometry!();

    fn flush(&self) -> std::result::Result<(), BlockDeviceError> {
        flush_members(&self.state.lock())
    }

    fn close(&self) -> std::result::Result<(), BlockDeviceError> {
        close_members(&mut self.state.lock())
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Raid1
    }
}

impl RaidArray for Raid1 {
    fn mark_device_failed(&self, index: usize) -> Result<()> {
        mark_failed(RaidLevel::Raid1, &mut self.state.lock(), index)
    }

    fn rebuild(&self, index: usize) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(RaidError::Closed);
        }
        state.check_index(index)?;
        if !state.failed[index] {
            return Err(RaidError::MemberNotFailed(index));
        }
        let source = state
            .failed
            .iter()
            .position(|&f| !f)
            .ok_or(RaidError::NoHealthySource)?;

        log::info!("RAID1 rebuilding member {} from member {}", index, source);
        let mut buf = vec![0u8; self.block_size];
        for block in 0..self.block_count {
            state.members[source].read_block(block, &mut buf)?;
            state.members[index].write_block(block, &buf)?;
        }
        state.members[index].flush()?;
        state.failed[index] = false;
        log::info!("RAID1 rebuild of member {} complete", index);
        Ok(())
    }

    fn status(&self) -> RaidStatus {
        status_of(
            RaidLevel::Raid1,
            &self.state.lock(),
            self.block_size,
            self.block_count,
        )
    }
}

// ---------------------------------------------------------------------------
// RAID5
// ---------------------------------------------------------------------------

/// Distributed parity over `N >= 3` members: `N - 1` data blocks per
/// parity block. Stripe `s` keeps its parity on member `s % N`; data
/// offsets skip over the parity member. Tolerates exactly one failure.
pub struct Raid5 {
    state: Mutex<MemberSet>,
    block_size: usize,
    block_count: u64,
    blocks_per_member: u64,
}

struct StripeLocation {
    /// Local block row on every member.
    stripe: u64,
    data_device: usize,
    parity_device: usize,
}

impl Raid5 {
    pub fn new(members: Vec<Arc<dyn BlockDevice>>) -> Result<Self> {
        let (state, block_size, per_member) = validate_members(RaidLevel::Raid5, members)?;
        let block_count = RaidLevel::Raid5.logical_capacity(state.members.len(), per_member);
        Ok(Self {
            state: Mutex::new(state),
            block_size,
            block_count,
            blocks_per_member: per_member,
        })
    }

    fn locate(&self, block: u64, member_count: usize) -> StripeLocation {
        let data_width = member_count as u64 - 1;
        let stripe = block / data_width;
        let offset = (block % data_width) as usize;
        let parity_device = (stripe % member_count as u64) as usize;
        let data_device = if offset >= parity_device {
            offset + 1
        } else {
            offset
        };
        StripeLocation {
            stripe,
            data_device,
            parity_device,
        }
    }

    /// XOR of every member's row except `skip`. With one missing member
    /// this reconstructs its contents; parity is included unless `skip`
    /// is the parity device itself.
    fn xor_others(
        &self,
        state: &MemberSet,
        stripe: u64,
        skip: usize,
        out: &mut [u8],
    ) -> std::result::Result<(), BlockDeviceError> {
        out.fill(0);
        let mut tmp = vec![0u8; self.block_size];
        for (i, member) in state.members.iter().enumerate() {
            if i == skip {
                continue;
            }
            if state.failed[i] {
                return Err(BlockDeviceError::DeviceFailed(i));
            }
            member.read_block(stripe, &mut tmp)?;
            xor_into(out, &tmp);
        }
        Ok(())
    }
}

impl BlockDevice for Raid5 {
    fn read_block(&self, block: u64, buf: &mut [u8]) -> std::result::Result<(), BlockDeviceError> {
        check_io(block, buf.len(), self.block_size, self.block_count)?;
        let state = self.state.lock();
        if state.closed {
            return Err(BlockDeviceError::DeviceClosed);
        }
        let loc = self.locate(block, state.members.len());
        if !state.failed[loc.data_device] {
            return state.members[loc.data_device].read_block(loc.stripe, buf);
        }
        if state.failed_count() > 1 {
            return Err(BlockDeviceError::NoHealthyDevice);
        }
        // Reconstruct the missing data block from the surviving stripe.
        self.xor_others(&state, loc.stripe, loc.data_device, buf)
    }

    fn write_block(&self, block: u64, data: &[u8]) -> std::result::Result<(), BlockDeviceError> {
        check_io(block, data.len(), self.block_size, self.block_count)?;
        let state = self.state.lock();
        if state.closed {
            return Err(BlockDeviceError::DeviceClosed);
        }
        if state.failed_count() > 1 {
            return Err(BlockDeviceError::NoHealthyDevice);
        }
        let loc = self.locate(block, state.members.len());
        let data_ok = !state.failed[loc.data_device];
        let parity_ok = !state.failed[loc.parity_device];

        match (data_ok, parity_ok) {
            (true, true) => {
                // Read-modify-write: new parity folds out the old data.
                let mut old_data = vec![0u8; self.block_size];
                let mut parity = vec![0u8; self.block_size];
                state.members[loc.data_device].read_block(loc.stripe, &mut old_data)?;
                state.members[loc.parity_device].read_block(loc.stripe, &mut parity)?;
                xor_into(&mut parity, &old_data);
                xor_into(&mut parity, data);
                state.members[loc.data_device].write_block(loc.stripe, data)?;
                state.members[loc.parity_device].write_block(loc.stripe, &parity)
            }
            (false, true) => {
                // Data member is down: fold the new data into parity so
                // reconstruction yields it.
                let mut parity = vec![0u8; self.block_size];
                let mut tmp = vec![0u8; self.block_size];
                parity.copy_from_slice(data);
                for (i, member) in state.members.iter().enumerate() {
                    if i == loc.data_device || i == loc.parity_device {
                        continue;
                    }
                    member.read_block(loc.stripe, &mut tmp)?;
                    xor_into(&mut parity, &tmp);
                }
                state.members[loc.parity_device].write_block(loc.stripe, &parity)
            }
            (true, false) => state.members[loc.data_device].write_block(loc.stripe, data),
            (false, false) => Err(BlockDeviceError::NoHealthyDevice),
        }
    }

    forward_geometry!();

    fn flush(&self) -> std::result::Result<(), BlockDeviceError> {
        flush_members(&self.state.lock())
    }

    fn close(&self) -> std::result::Result<(), BlockDeviceError> {
        close_members(&mut self.state.lock())
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Raid5
    }
}

impl RaidArray for Raid5 {
    fn mark_device_failed(&self, index: usize) -> Result<()> {
        mark_failed(RaidLevel::Raid5, &mut self.state.lock(), index)
    }

    fn rebuild(&self, index: usize) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(RaidError::Closed);
        }
        state.check_index(index)?;
        if !state.failed[index] {
            return Err(RaidError::MemberNotFailed(index));
        }
        if state.failed_count() > 1 {
            return Err(RaidError::NoHealthySource);
        }

        log::info!("RAID5 rebuilding member {}", index);
        let mut row = vec![0u8; self.block_size];
        for stripe in 0..self.blocks_per_member {
            // Parity makes every full row XOR to zero, so the missing
            // member is the XOR of all the others.
            let mut reconstructed = vec![0u8; self.block_size];
            for (i, member) in state.members.iter().enumerate() {
                if i == index {
                    continue;
                }
                member.read_block(stripe, &mut row)?;
                xor_into(&mut reconstructed, &row);
            }
            state.members[index].write_block(stripe, &reconstructed)?;
        }
        state.members[index].flush()?;
        state.failed[index] = false;
        log::info!("RAID5 rebuild of member {} complete", index);
        Ok(())
    }

    fn status(&self) -> RaidStatus {
        status_of(
            RaidLevel::Raid5,
            &self.state.lock(),
            self.block_size,
            self.block_count,
        )
    }
}
