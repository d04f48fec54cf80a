// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A driver contract for the on-chip flash backing an installed firmware
//! image.
//!
//! This crate does not assume any particular flash controller. [`FlashController`]
//! is the seam: a real device binds it to MMIO registers, tests bind it to
//! [`MockFlash`].

#![cfg_attr(not(any(test, feature = "test-util")), no_std)]

/// Errors a [`FlashController`] implementation can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    /// The controller reported a failure completing the operation.
    ControllerFault,
    /// `program` was asked to write a byte that was not all-ones.
    NotErased,
    /// An address or length fell outside the controller's flash window.
    OutOfBounds,
}

/// The raw operations a flash controller must provide.
///
/// Implementations are expected to be blocking: `erase_sector` and
/// `program_bytes` only return once the hardware operation completes (or
/// fails). There is no concurrent-caller story; callers serialize their own
/// access, matching the single-threaded cooperative model the rest of this
/// workspace assumes.
pub trait FlashController {
    /// Size in bytes of one erase sector.
    fn sector_size(&self) -> u32;

    /// Total number of erase sectors available.
    fn sector_count(&self) -> u32;

    /// Erase sector `sector`. Leaves the sector's bytes all-ones.
    fn erase_sector(&mut self, sector: u32) -> Result<(), FlashError>;

    /// Program `data` starting at byte offset `address`.
    ///
    /// NOR flash can only clear bits; a byte can be programmed to any value
    /// that is a bitwise subset of what is already there; setting a bit back
    /// to one requires an erase. Implementations are expected to detect and
    /// reject a write that would need one rather than silently corrupt
    /// state.
    fn program_bytes(
        &mut self,
        address: u32,
        data: &[u8],
    ) -> Result<(), FlashError>;

    /// Read `len` bytes starting at byte offset `address`.
    fn read_bytes(
        &self,
        address: u32,
        len: u32,
    ) -> Result<&[u8], FlashError>;
}

/// A sector-and-lock-aware wrapper around a [`FlashController`].
///
/// This is the contract spec.md calls C1: `erase`, `program`, `lock`,
/// `unlock`. The controller is unlocked for the duration of each operation
/// and re-locked afterward, mirroring `drv-lpc55-flash`'s write procedure
/// (unlock, operate, lock) but without committing to any particular register
/// layout.
pub struct SectorFlash<C> {
    controller: C,
    locked: bool,
}

impl<C: FlashController> SectorFlash<C> {
    pub fn new(controller: C) -> Self {
        Self {
            controller,
            locked: true,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn unlock(&mut self) {
        self.locked = false;
    }

    /// Erase `sector`. Brackets the operation with unlock/lock regardless of
    /// the entry state, matching C1's "program and erase internally bracket
    /// with unlock/lock" contract.
    pub fn erase(&mut self, sector: u32) -> Result<(), FlashError> {
        if sector >= self.controller.sector_count() {
            return Err(FlashError::OutOfBounds);
        }
        self.unlock();
        let result = self.controller.erase_sector(sector);
        self.lock();
        result
    }

    /// Program `data` at `address`. Caller must have erased the covering
    /// sector(s) first; this driver does not track erase state across calls.
    pub fn program(
        &mut self,
        address: u32,
        data: &[u8],
    ) -> Result<(), FlashError> {
        self.unlock();
        let result = self.controller.program_bytes(address, data);
        self.lock();
        result
    }

    pub fn read(&self, address: u32, len: u32) -> Result<&[u8], FlashError> {
        self.controller.read_bytes(address, len)
    }

    pub fn sector_size(&self) -> u32 {
        self.controller.sector_size()
    }

    pub fn sector_count(&self) -> u32 {
        self.controller.sector_count()
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    //! An in-memory flash double that rejects programming non-erased bytes,
    //! the way real NOR flash would refuse to write a zero bit back to one.

    use super::*;
    use std::vec;
    use std::vec::Vec;

    pub struct MockFlash {
        sector_size: u32,
        bytes: Vec<u8>,
    }

    impl MockFlash {
        pub fn new(sector_size: u32, sector_count: u32) -> Self {
            Self {
                sector_size,
                bytes: vec![0xFFu8; (sector_size * sector_count) as usize],
            }
        }

        pub fn contents(&self) -> &[u8] {
            &self.bytes
        }
    }

    impl FlashController for MockFlash {
        fn sector_size(&self) -> u32 {
            self.sector_size
        }

        fn sector_count(&self) -> u32 {
            self.bytes.len() as u32 / self.sector_size
        }

        fn erase_sector(&mut self, sector: u32) -> Result<(), FlashError> {
            let start = (sector * self.sector_size) as usize;
            let end = start + self.sector_size as usize;
            if end > self.bytes.len() {
                return Err(FlashError::OutOfBounds);
            }
            self.bytes[start..end].fill(0xFF);
            Ok(())
        }

        fn program_bytes(
            &mut self,
            address: u32,
            data: &[u8],
        ) -> Result<(), FlashError> {
            let start = address as usize;
            let end = start + data.len();
            if end > self.bytes.len() {
                return Err(FlashError::OutOfBounds);
            }
            // NOR flash can only clear bits (1 -> 0); turning a bit back to
            // 1 requires an erase. Reject any write that would need one.
            let existing = &self.bytes[start..end];
            if existing
                .iter()
                .zip(data)
                .any(|(&old, &new)| old & new != new)
            {
                return Err(FlashError::NotErased);
            }
            self.bytes[start..end].copy_from_slice(data);
            Ok(())
        }

        fn read_bytes(
            &self,
            address: u32,
            len: u32,
        ) -> Result<&[u8], FlashError> {
            let start = address as usize;
            let end = start + len as usize;
            if end > self.bytes.len() {
                return Err(FlashError::OutOfBounds);
            }
            Ok(&self.bytes[start..end])
        }
    }
}

#[cfg(test)]
mod test {
    use super::mock::MockFlash;
    use super::*;

    fn flash() -> SectorFlash<MockFlash> {
        SectorFlash::new(MockFlash::new(256, 8))
    }

    #[test]
    fn erase_then_program_round_trips() {
        let mut f = flash();
        f.erase(0).unwrap();
        f.program(0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(f.read(0, 4).unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn program_without_erase_is_rejected() {
        let mut f = flash();
        f.erase(0).unwrap();
        f.program(0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(
            f.program(0, &[5, 6, 7, 8]),
            Err(FlashError::NotErased)
        );
    }

    #[test]
    fn erase_and_program_bracket_with_lock() {
        let mut f = flash();
        assert!(f.is_locked());
        f.erase(0).unwrap();
        assert!(f.is_locked());
    }

    #[test]
    fn out_of_bounds_sector_is_rejected() {
        let mut f = flash();
        assert_eq!(f.erase(8), Err(FlashError::OutOfBounds));
    }
}
