// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistent store for authorized firmware-signing public keys.
//!
//! Each slot holds three redundant records in physically distinct flash
//! regions: the zero-padded key itself, a salted hash of the padded key, and
//! an unsalted fingerprint for fast lookup. A slot's state (empty, used,
//! locked) is read back from the bytes already on flash rather than tracked
//! separately, so it survives a reset with no extra bookkeeping.

#![cfg_attr(not(test), no_std)]

use drv_boot_flash::{FlashController, FlashError, SectorFlash};
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;

/// Raw key capacity. Ed25519 public keys are 32 bytes; shorter keys are
/// zero-padded up to this size.
pub const SLOT_SIZE: usize = 32;
/// Fingerprint length: the leading bytes of `H(key)`.
pub const FP_SIZE: usize = 4;
/// Salted-hash length.
pub const HASH_SIZE: usize = 64;
/// Salt length, mixed into every slot's hash.
pub const SALT_SIZE: usize = 32;
/// Number of key slots in the store.
pub const SLOT_COUNT: usize = 4;

/// Layout of one slot's three flash regions.
#[derive(Debug, Clone, Copy)]
pub struct SlotLayout {
    pub pubkey_addr: u32,
    pub pubkey_hash_addr: u32,
    pub pubkey_fp_addr: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Used,
    Locked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubkeyStoreError {
    InvalidArgument,
    SlotOccupied,
    SlotLocked,
    SaltAlreadySet,
    SaltMissing,
    NotFound,
    VerificationFailed,
    FlashError,
}

impl From<FlashError> for PubkeyStoreError {
    fn from(_: FlashError) -> Self {
        PubkeyStoreError::FlashError
    }
}

/// AND-of-all-bytes / OR-of-all-bytes classification over a set of byte
/// slices, per spec: AND == 0xFF means every record is still erased; OR ==
/// 0x00 means every record has been zeroed (locked); anything else is used.
fn classify(regions: &[&[u8]]) -> SlotState {
    let mut and_acc: u8 = 0xFF;
    let mut or_acc: u8 = 0x00;
    for region in regions {
        for &b in *region {
            and_acc &= b;
            or_acc |= b;
        }
    }
    if and_acc == 0xFF {
        SlotState::Empty
    } else if or_acc == 0x00 {
        SlotState::Locked
    } else {
        SlotState::Used
    }
}

fn fingerprint(key: &[u8]) -> [u8; FP_SIZE] {
    let digest = Sha512::digest(key);
    let mut fp = [0u8; FP_SIZE];
    fp.copy_from_slice(&digest[..FP_SIZE]);
    fp
}

fn salted_hash(padded_key: &[u8; SLOT_SIZE], salt: &[u8; SALT_SIZE]) -> [u8; HASH_SIZE] {
    let mut hasher = Sha512::new();
    hasher.update(padded_key);
    hasher.update(salt);
    let digest = hasher.finalize();
    let mut hash = [0u8; HASH_SIZE];
    hash.copy_from_slice(&digest[..HASH_SIZE]);
    hash
}

/// Constant-time byte-slice equality, shared with `drv-boot-image` so both
/// crates' hash/fingerprint comparisons go through one implementation.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// The pubkey slot store, addressed on top of a [`SectorFlash`].
pub struct PubkeyStore<C> {
    flash: SectorFlash<C>,
    salt_addr: u32,
    slots: [SlotLayout; SLOT_COUNT],
}

impl<C: FlashController> PubkeyStore<C> {
    pub fn new(
        flash: SectorFlash<C>,
        salt_addr: u32,
        slots: [SlotLayout; SLOT_COUNT],
    ) -> Self {
        Self {
            flash,
            salt_addr,
            slots,
        }
    }

    fn salt_region(&self) -> Result<&[u8], PubkeyStoreError> {
        Ok(self.flash.read(self.salt_addr, SALT_SIZE as u32)?)
    }

    pub fn verify_salt(&self) -> Result<[u8; SALT_SIZE], PubkeyStoreError> {
        let region = self.salt_region()?;
        if region.iter().all(|&b| b == 0xFF) {
            return Err(PubkeyStoreError::SaltMissing);
        }
        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(region);
        Ok(salt)
    }

    /// Write-once salt. A second call while salt is present is a no-op that
    /// returns `SaltAlreadySet` without touching flash.
    pub fn set_salt(&mut self, bytes: &[u8]) -> Result<(), PubkeyStoreError> {
        if bytes.len() > SALT_SIZE {
            return Err(PubkeyStoreError::InvalidArgument);
        }
        if self.verify_salt().is_ok() {
            return Err(PubkeyStoreError::SaltAlreadySet);
        }
        let mut padded = [0u8; SALT_SIZE];
        padded[..bytes.len()].copy_from_slice(bytes);
        self.flash.program(self.salt_addr, &padded)?;
        Ok(())
    }

    fn slot_regions(
        &self,
        slot: &SlotLayout,
    ) -> Result<([u8; SLOT_SIZE], [u8; HASH_SIZE], [u8; FP_SIZE]), PubkeyStoreError>
    {
        let pubkey = self.flash.read(slot.pubkey_addr, SLOT_SIZE as u32)?;
        let hash = self.flash.read(slot.pubkey_hash_addr, HASH_SIZE as u32)?;
        let fp = self.flash.read(slot.pubkey_fp_addr, FP_SIZE as u32)?;
        let mut pubkey_arr = [0u8; SLOT_SIZE];
        pubkey_arr.copy_from_slice(pubkey);
        let mut hash_arr = [0u8; HASH_SIZE];
        hash_arr.copy_from_slice(hash);
        let mut fp_arr = [0u8; FP_SIZE];
        fp_arr.copy_from_slice(fp);
        Ok((pubkey_arr, hash_arr, fp_arr))
    }

    pub fn check_if_slot_empty(
        &self,
        index: usize,
    ) -> Result<SlotState, PubkeyStoreError> {
        let slot = self
            .slots
            .get(index)
            .ok_or(PubkeyStoreError::InvalidArgument)?;
        let (pubkey, hash, fp) = self.slot_regions(slot)?;
        Ok(classify(&[&pubkey, &hash, &fp]))
    }

    /// Preconditions: `0 < size <= SLOT_SIZE`, slot empty, salt set.
    pub fn set_slot_key(
        &mut self,
        index: usize,
        key: &[u8],
    ) -> Result<(), PubkeyStoreError> {
        if key.is_empty() || key.len() > SLOT_SIZE {
            return Err(PubkeyStoreError::InvalidArgument);
        }
        let slot = *self
            .slots
            .get(index)
            .ok_or(PubkeyStoreError::InvalidArgument)?;

        match self.check_if_slot_empty(index)? {
            SlotState::Used => return Err(PubkeyStoreError::SlotOccupied),
            SlotState::Locked => return Err(PubkeyStoreError::SlotLocked),
            SlotState::Empty => {}
        }

        let salt = self.verify_salt()?;

        let mut padded = [0u8; SLOT_SIZE];
        padded[..key.len()].copy_from_slice(key);

        // Fingerprinted over the zero-padded buffer, not the raw `key`
        // slice: `verify_slot` only ever has the padded bytes read back
        // from flash to recompute against, so the two must agree on
        // padding or every key shorter than SLOT_SIZE fails to verify.
        let fp = fingerprint(&padded);

        let hash = salted_hash(&padded, &salt);

        self.flash.program(slot.pubkey_addr, &padded)?;
        self.flash.program(slot.pubkey_hash_addr, &hash)?;
        self.flash.program(slot.pubkey_fp_addr, &fp)?;
        Ok(())
    }

    /// Recomputes fingerprint and salted hash from the stored padded key and
    /// compares both to what's on flash. Requires the slot be USED.
    pub fn verify_slot(&self, index: usize) -> Result<(), PubkeyStoreError> {
        let slot = self
            .slots
            .get(index)
            .ok_or(PubkeyStoreError::InvalidArgument)?;
        if self.check_if_slot_empty(index)? != SlotState::Used {
            return Err(PubkeyStoreError::VerificationFailed);
        }
        let (pubkey, stored_hash, stored_fp) = self.slot_regions(slot)?;

        let fp = fingerprint(&pubkey);
        if !ct_eq(&fp, &stored_fp) {
            return Err(PubkeyStoreError::VerificationFailed);
        }

        let salt = self.verify_salt()?;
        let hash = salted_hash(&pubkey, &salt);
        if !ct_eq(&hash, &stored_hash) {
            return Err(PubkeyStoreError::VerificationFailed);
        }

        Ok(())
    }

    /// Requires the slot be USED and pass `verify_slot`. Copies the leading
    /// `out.len()` bytes of the stored padded key into `out`.
    pub fn get_slot_key(
        &self,
        index: usize,
        out: &mut [u8],
    ) -> Result<(), PubkeyStoreError> {
        if out.len() > SLOT_SIZE {
            return Err(PubkeyStoreError::InvalidArgument);
        }
        self.verify_slot(index)?;
        let slot = self.slots[index];
        let (pubkey, _, _) = self.slot_regions(&slot)?;
        out.copy_from_slice(&pubkey[..out.len()]);
        Ok(())
    }

    /// Every USED, self-consistent slot whose stored fingerprint matches `fp`
    /// over `min(stored_fp_len, fp.len())` leading bytes, in index order. A
    /// 4-byte fingerprint is not guaranteed unique, so a caller that's about
    /// to check a signature against the returned key should try every
    /// candidate this yields rather than trusting the first.
    pub fn fingerprint_candidates<'s, 'f>(
        &'s self,
        fp: &'f [u8],
    ) -> FingerprintCandidates<'s, 'f, C> {
        FingerprintCandidates {
            store: self,
            fp,
            next: 0,
        }
    }

    /// The first USED slot whose stored fingerprint matches `fp` and whose
    /// own `verify_slot` passes. Convenience wrapper over
    /// [`Self::fingerprint_candidates`] for callers that only need one key,
    /// e.g. a CLI lookup; `FirmwareImage::authenticate` uses the iterator
    /// directly so it can retry against every candidate.
    pub fn get_slot_key_by_fingerprint(
        &self,
        fp: &[u8],
    ) -> Result<(usize, [u8; SLOT_SIZE]), PubkeyStoreError> {
        if fp.len() < FP_SIZE {
            return Err(PubkeyStoreError::InvalidArgument);
        }
        self.fingerprint_candidates(fp)
            .next()
            .ok_or(PubkeyStoreError::NotFound)
    }

    /// Programs all-zeros across the slot's three regions. Irreversible
    /// until a full-sector erase; no precondition on the slot's current
    /// state, so a USED slot can also be locked (destroying the key).
    pub fn lock_slot(&mut self, index: usize) -> Result<(), PubkeyStoreError> {
        let slot = *self
            .slots
            .get(index)
            .ok_or(PubkeyStoreError::InvalidArgument)?;
        self.flash.program(slot.pubkey_addr, &[0u8; SLOT_SIZE])?;
        self.flash
            .program(slot.pubkey_hash_addr, &[0u8; HASH_SIZE])?;
        self.flash.program(slot.pubkey_fp_addr, &[0u8; FP_SIZE])?;
        Ok(())
    }
}

/// Iterator returned by [`PubkeyStore::fingerprint_candidates`].
pub struct FingerprintCandidates<'s, 'f, C> {
    store: &'s PubkeyStore<C>,
    fp: &'f [u8],
    next: usize,
}

impl<'s, 'f, C: FlashController> Iterator for FingerprintCandidates<'s, 'f, C> {
    type Item = (usize, [u8; SLOT_SIZE]);

    fn next(&mut self) -> Option<Self::Item> {
        while self.next < SLOT_COUNT {
            let index = self.next;
            self.next += 1;
            if self.store.check_if_slot_empty(index) != Ok(SlotState::Used) {
                continue;
            }
            let slot = self.store.slots[index];
            let Ok((pubkey, _, stored_fp)) = self.store.slot_regions(&slot) else {
                continue;
            };
            let n = core::cmp::min(stored_fp.len(), self.fp.len());
            if !ct_eq(&stored_fp[..n], &self.fp[..n]) {
                continue;
            }
            if self.store.verify_slot(index).is_ok() {
                return Some((index, pubkey));
            }
        }
        None
    }
}
