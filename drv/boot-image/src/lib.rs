// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The firmware-image container: a tagged-section parser, SHA-512 integrity
//! hash, and Ed25519 authenticity check over an installed image, tracked
//! through a Fresh -> Parsed -> Verified -> Authenticated state machine.

#![cfg_attr(not(test), no_std)]

use boot_progress::{Progress, Signal};
use drv_boot_flash::{FlashController, SectorFlash};
use drv_boot_pubkey_store::{ct_eq, PubkeyStore, FP_SIZE as PUBKEY_FP_SIZE};
use ringbuf::*;
use sha2::{Digest, Sha512};

const MAGIC_VERIFIED: u32 = 0x1eda84bc;
const MAGIC_VERIFICATION: u32 = 0x6ef44bc0;
const MAGIC_DUMMY: u32 = 0xba50911a;
const MAGIC_FIRMWARE: u32 = 0x40b80c0f;
const MAGIC_SHA512: u32 = 0xb6eb9721;
const MAGIC_ED25519: u32 = 0x9d6b1a99;
const MAGIC_FP: u32 = 0x5bf0aa39;

const HASH_LEN: usize = 64;
const SIGNATURE_LEN: usize = 64;
/// Cap on stored fingerprint length. The wire format only requires at least
/// 4 bytes; this is a generous upper bound for the fixed buffer we keep it
/// in, not a format limit.
const FP_MAX_LEN: usize = 32;

/// Progress is reported in units of bytes consumed, throttled to roughly
/// this often so short inputs don't pay per-byte callback overhead.
const HASH_PROGRESS_CHUNK: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ImageState {
    Fresh,
    Parsed,
    Verified,
    Authenticated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageError {
    NotReady,
    Malformed,
    IntegrityFailure,
    AuthFailure,
    FlashError,
}

/// The two 32-bit values at the head of the `FIRMWARE` payload: the initial
/// stack pointer and the reset-handler address. Transferring control to
/// `reset_handler` with `stack_pointer` loaded is a hardware operation this
/// crate deliberately does not perform — that belongs to the out-of-scope
/// MCU bring-up code the orchestrator composes with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoint {
    pub stack_pointer: u32,
    pub reset_handler: u32,
}

#[derive(Clone, Copy)]
struct FingerprintBuf {
    bytes: [u8; FP_MAX_LEN],
    len: usize,
}

impl FingerprintBuf {
    fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

struct ParsedSections {
    verified_payload_addr: u32,
    verified_payload_len: u32,
    firmware_offset: Option<u32>,
    hash: Option<[u8; HASH_LEN]>,
    signature: Option<[u8; SIGNATURE_LEN]>,
    fingerprint: Option<FingerprintBuf>,
}

#[derive(Clone, Copy, PartialEq)]
enum Trace {
    None,
    Parsed,
    Verified,
    Authenticated,
    ParseFailed,
    IntegrityFailed,
    AuthFailed,
}

ringbuf!(Trace, 16, Trace::None);

fn read_header(bytes: &[u8]) -> (u32, u32) {
    let magic = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
    let len = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
    (magic, len)
}

/// Tries an Ed25519 verification of `signature` over `hash` against each
/// candidate public key in turn, stopping at the first that verifies. A
/// candidate that isn't a valid curve point is treated the same as one that
/// fails verification: skip it and keep trying. Spec.md §9's Open Question
/// 3: a 4-byte fingerprint lookup isn't guaranteed to name a unique key, so
/// the first fingerprint match isn't trusted on its own.
fn verify_any_candidate(
    candidates: impl Iterator<Item = [u8; 32]>,
    hash: &[u8; HASH_LEN],
    signature_bytes: &[u8; SIGNATURE_LEN],
) -> bool {
    let Ok(signature) = salty::signature::Signature::try_from(&signature_bytes[..])
    else {
        return false;
    };
    for candidate in candidates {
        let Ok(public_key) = salty::signature::PublicKey::try_from(&candidate[..])
        else {
            continue;
        };
        if public_key.verify(hash, &signature).is_ok() {
            return true;
        }
    }
    false
}

/// A firmware image occupying a contiguous range of erase sectors on a
/// [`FlashController`], with its section container and state machine.
pub struct FirmwareImage<C> {
    flash: SectorFlash<C>,
    base: u32,
    base_sector: u32,
    sectors: u32,
    state: ImageState,
    parsed: Option<ParsedSections>,
}

impl<C: FlashController> FirmwareImage<C> {
    pub fn new(
        flash: SectorFlash<C>,
        base: u32,
        base_sector: u32,
        sectors: u32,
    ) -> Self {
        Self {
            flash,
            base,
            base_sector,
            sectors,
            state: ImageState::Fresh,
            parsed: None,
        }
    }

    pub fn state(&self) -> ImageState {
        self.state
    }

    fn window_end(&self) -> u32 {
        self.base + self.sectors * self.flash.sector_size()
    }

    /// Size in bytes of the image's flash window, `sectors * sector_size`.
    pub fn window_len(&self) -> u32 {
        self.sectors * self.flash.sector_size()
    }

    /// Reads `len` bytes at `base + offset`. Used by staged-file dumping,
    /// which moves raw bytes and does not require the image be parsed.
    pub fn read_raw(&self, offset: u32, len: u32) -> Result<&[u8], ImageError> {
        let addr = self.base + offset;
        self.check_in_bounds(addr, len)?;
        self.flash.read(addr, len).map_err(|_| ImageError::FlashError)
    }

    fn check_in_bounds(&self, addr: u32, len: u32) -> Result<(), ImageError> {
        match addr.checked_add(len) {
            Some(end) if end <= self.window_end() => Ok(()),
            _ => Err(ImageError::Malformed),
        }
    }

    fn walk_subsections(
        &self,
        start: u32,
        len: u32,
        mut f: impl FnMut(u32, u32, u32) -> Result<(), ImageError>,
    ) -> Result<(), ImageError> {
        let end = start + len;
        let mut cursor = start;
        while cursor < end {
            if end - cursor < 8 {
                return Err(ImageError::Malformed);
            }
            let header = self
                .flash
                .read(cursor, 8)
                .map_err(|_| ImageError::FlashError)?;
            let (magic, sec_len) = read_header(header);
            let data_addr = cursor + 8;
            match data_addr.checked_add(sec_len) {
                Some(data_end) if data_end <= end => {
                    f(magic, data_addr, sec_len)?;
                    cursor = data_end;
                }
                _ => return Err(ImageError::Malformed),
            }
        }
        Ok(())
    }

    /// Parses the first two top-level sections (`VERIFIED`, `VERIFICATION`)
    /// and walks their subsections. Sets `parsed = true` on success; any
    /// failure leaves the image in `Fresh`.
    pub fn parse(&mut self) -> Result<(), ImageError> {
        let header = self
            .flash
            .read(self.base, 8)
            .map_err(|_| ImageError::FlashError)?;
        let (verified_magic, verified_len) = read_header(header);
        if verified_magic != MAGIC_VERIFIED {
            ringbuf_entry!(Trace::ParseFailed);
            return Err(ImageError::Malformed);
        }
        let verified_payload_addr = self.base + 8;
        self.check_in_bounds(verified_payload_addr, verified_len)?;

        let verification_header_addr = verified_payload_addr + verified_len;
        let header2 = self
            .flash
            .read(verification_header_addr, 8)
            .map_err(|_| ImageError::FlashError)?;
        let (verification_magic, verification_len) = read_header(header2);
        if verification_magic != MAGIC_VERIFICATION {
            ringbuf_entry!(Trace::ParseFailed);
            return Err(ImageError::Malformed);
        }
        let verification_payload_addr = verification_header_addr + 8;
        self.check_in_bounds(
            verification_payload_addr,
            verification_len,
        )?;

        let mut firmware_offset = None;
        self.walk_subsections(
            verified_payload_addr,
            verified_len,
            |magic, data_addr, data_len| {
                match magic {
                    MAGIC_DUMMY => {}
                    MAGIC_FIRMWARE => {
                        if firmware_offset.is_none() {
                            // Must hold at least the two-word vector table
                            // entry_point reads; anything shorter can't be a
                            // real reset vector table.
                            if data_len < 8 {
                                return Err(ImageError::Malformed);
                            }
                            firmware_offset = Some(data_addr - self.base);
                        }
                    }
                    _ => {}
                }
                Ok(())
            },
        )?;

        let mut hash = None;
        let mut signature = None;
        let mut fingerprint = None;
        self.walk_subsections(
            verification_payload_addr,
            verification_len,
            |magic, data_addr, data_len| {
                match magic {
                    MAGIC_DUMMY => {}
                    MAGIC_SHA512 => {
                        if hash.is_none() && data_len == HASH_LEN as u32 {
                            let bytes = self
                                .flash
                                .read(data_addr, data_len)
                                .map_err(|_| ImageError::FlashError)?;
                            let mut buf = [0u8; HASH_LEN];
                            buf.copy_from_slice(bytes);
                            hash = Some(buf);
                        }
                    }
                    MAGIC_ED25519 => {
                        if signature.is_none()
                            && data_len == SIGNATURE_LEN as u32
                        {
                            let bytes = self
                                .flash
                                .read(data_addr, data_len)
                                .map_err(|_| ImageError::FlashError)?;
                            let mut buf = [0u8; SIGNATURE_LEN];
                            buf.copy_from_slice(bytes);
                            signature = Some(buf);
                        }
                    }
                    MAGIC_FP => {
                        if fingerprint.is_none()
                            && data_len >= PUBKEY_FP_SIZE as u32
                        {
                            let n = core::cmp::min(
                                data_len as usize,
                                FP_MAX_LEN,
                            );
                            let bytes = self
                                .flash
                                .read(data_addr, n as u32)
                                .map_err(|_| ImageError::FlashError)?;
                            let mut buf = [0u8; FP_MAX_LEN];
                            buf[..n].copy_from_slice(bytes);
                            fingerprint =
                                Some(FingerprintBuf { bytes: buf, len: n });
                        }
                    }
                    _ => {}
                }
                Ok(())
            },
        )?;

        self.parsed = Some(ParsedSections {
            verified_payload_addr,
            verified_payload_len: verified_len,
            firmware_offset,
            hash,
            signature,
            fingerprint,
        });
        self.state = ImageState::Parsed;
        ringbuf_entry!(Trace::Parsed);
        Ok(())
    }

    /// Streams SHA-512 over `[addr, addr+len)`, reporting progress in bytes
    /// consumed, and compares the result to `expected` in constant time.
    fn hash_compare(
        &self,
        addr: u32,
        len: u32,
        expected: &[u8; HASH_LEN],
        progress: &mut dyn Progress,
    ) -> Result<(), ImageError> {
        let mut hasher = Sha512::new();
        let mut offset = 0u32;
        while offset < len {
            let chunk_len =
                core::cmp::min(HASH_PROGRESS_CHUNK, len - offset);
            let chunk = self
                .flash
                .read(addr + offset, chunk_len)
                .map_err(|_| ImageError::FlashError)?;
            hasher.update(chunk);
            offset += chunk_len;
            if progress.on_progress(offset, len) == Signal::Cancel {
                return Err(ImageError::FlashError);
            }
        }
        let digest = hasher.finalize();
        if ct_eq(&digest[..HASH_LEN], expected) {
            Ok(())
        } else {
            Err(ImageError::IntegrityFailure)
        }
    }

    /// Parses if not already parsed, then hashes the `VERIFIED` payload and
    /// compares to the stored `SHA512` section.
    pub fn verify(
        &mut self,
        progress: &mut dyn Progress,
    ) -> Result<(), ImageError> {
        if self.state == ImageState::Fresh {
            self.parse()?;
        }
        let parsed = self.parsed.as_ref().ok_or(ImageError::NotReady)?;
        let hash = parsed.hash.ok_or(ImageError::IntegrityFailure)?;
        let addr = parsed.verified_payload_addr;
        let len = parsed.verified_payload_len;
        match self.hash_compare(addr, len, &hash, progress) {
            Ok(()) => {
                self.state = ImageState::Verified;
                ringbuf_entry!(Trace::Verified);
                Ok(())
            }
            Err(e) => {
                ringbuf_entry!(Trace::IntegrityFailed);
                Err(e)
            }
        }
    }

    /// Verifies if not already verified, then looks up the signing key by
    /// the image's stored fingerprint and checks the Ed25519 signature over
    /// the hash.
    pub fn authenticate<K: FlashController>(
        &mut self,
        keys: &PubkeyStore<K>,
        progress: &mut dyn Progress,
    ) -> Result<(), ImageError> {
        if self.state < ImageState::Verified {
            self.verify(progress)?;
        }
        let parsed = self.parsed.as_ref().ok_or(ImageError::NotReady)?;
        let signature_bytes =
            parsed.signature.ok_or(ImageError::AuthFailure)?;
        let fingerprint =
            parsed.fingerprint.as_ref().ok_or(ImageError::AuthFailure)?;
        let hash = parsed.hash.ok_or(ImageError::AuthFailure)?;

        let candidates = keys
            .fingerprint_candidates(fingerprint.as_slice())
            .map(|(_, key)| key);

        if verify_any_candidate(candidates, &hash, &signature_bytes) {
            self.state = ImageState::Authenticated;
            ringbuf_entry!(Trace::Authenticated);
            Ok(())
        } else {
            ringbuf_entry!(Trace::AuthFailed);
            Err(ImageError::AuthFailure)
        }
    }

    /// Requires `parsed` or later. Returns the stack pointer and
    /// reset-handler address recorded in the `FIRMWARE` section's vector
    /// table; does not transfer control.
    pub fn entry_point(&self) -> Result<EntryPoint, ImageError> {
        if self.state < ImageState::Parsed {
            return Err(ImageError::NotReady);
        }
        let parsed = self.parsed.as_ref().ok_or(ImageError::NotReady)?;
        let offset = parsed.firmware_offset.ok_or(ImageError::Malformed)?;
        self.check_in_bounds(self.base + offset, 8)?;
        let vector_table = self
            .flash
            .read(self.base + offset, 8)
            .map_err(|_| ImageError::FlashError)?;
        Ok(EntryPoint {
            stack_pointer: u32::from_le_bytes(
                vector_table[0..4].try_into().unwrap(),
            ),
            reset_handler: u32::from_le_bytes(
                vector_table[4..8].try_into().unwrap(),
            ),
        })
    }

    fn reset_state(&mut self) {
        self.state = ImageState::Fresh;
        self.parsed = None;
    }

    /// Erases every sector in `[base_sector, base_sector+sectors)`, in
    /// order, reporting `(sectors_done, total_sectors)` after each one. A
    /// cancel aborts with whatever sectors are already erased left that way.
    pub fn erase(
        &mut self,
        progress: &mut dyn Progress,
    ) -> Result<(), ImageError> {
        let total = self.sectors;
        for i in 0..total {
            self.flash
                .erase(self.base_sector + i)
                .map_err(|_| ImageError::FlashError)?;
            if progress.on_progress(i + 1, total) == Signal::Cancel {
                self.reset_state();
                return Err(ImageError::FlashError);
            }
        }
        self.reset_state();
        Ok(())
    }

    /// Writes `data` at `base + offset`. Caller must have erased the
    /// covering sectors first.
    pub fn program(
        &mut self,
        offset: u32,
        data: &[u8],
    ) -> Result<(), ImageError> {
        self.flash
            .program(self.base + offset, data)
            .map_err(|_| ImageError::FlashError)?;
        self.reset_state();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use boot_progress::NoProgress;
    use drv_boot_flash::mock::MockFlash;
    use drv_boot_pubkey_store::{PubkeyStore, SlotLayout, SALT_SIZE, SLOT_COUNT};

    const SECTOR_SIZE: u32 = 4096;
    const SECTORS: u32 = 4;
    const BASE_SECTOR: u32 = 0;
    const BASE: u32 = 0;

    fn keystore() -> PubkeyStore<MockFlash> {
        let mut slots = [SlotLayout {
            pubkey_addr: 0,
            pubkey_hash_addr: 0,
            pubkey_fp_addr: 0,
        }; SLOT_COUNT];
        let mut addr = SALT_SIZE as u32;
        for slot in &mut slots {
            slot.pubkey_addr = addr;
            addr += 32;
            slot.pubkey_hash_addr = addr;
            addr += 64;
            slot.pubkey_fp_addr = addr;
            addr += 4;
        }
        let flash = SectorFlash::new(MockFlash::new(512, 4));
        let mut store = PubkeyStore::new(flash, 0, slots);
        store.set_salt(&[0x11; SALT_SIZE]).unwrap();
        store
    }

    fn put_section(
        buf: &mut std::vec::Vec<u8>,
        magic: u32,
        payload: &[u8],
    ) {
        buf.extend_from_slice(&magic.to_be_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);
    }

    /// Builds a complete, validly signed image and returns (image bytes,
    /// verifying key bytes).
    fn build_signed_image() -> (std::vec::Vec<u8>, [u8; 32]) {
        let seed = [7u8; 32];
        let keypair = salty::signature::Keypair::from(&seed);

        let mut firmware_payload = std::vec![0u8; 256];
        firmware_payload[0..4].copy_from_slice(&0x20010000u32.to_le_bytes());
        firmware_payload[4..8].copy_from_slice(&0x08000011u32.to_le_bytes());

        let mut verified_payload = std::vec::Vec::new();
        put_section(&mut verified_payload, MAGIC_FIRMWARE, &firmware_payload);

        let hash = Sha512::digest(&verified_payload);
        let hash: [u8; 64] = hash.into();
        let signature = keypair.sign(&hash);
        let fp = {
            let d = Sha512::digest(keypair.public.as_bytes());
            let mut fp = [0u8; 4];
            fp.copy_from_slice(&d[..4]);
            fp
        };

        let mut verification_payload = std::vec::Vec::new();
        put_section(&mut verification_payload, MAGIC_SHA512, &hash);
        put_section(
            &mut verification_payload,
            MAGIC_ED25519,
            &signature.to_bytes(),
        );
        put_section(&mut verification_payload, MAGIC_FP, &fp);

        let mut image = std::vec::Vec::new();
        put_section(&mut image, MAGIC_VERIFIED, &verified_payload);
        put_section(&mut image, MAGIC_VERIFICATION, &verification_payload);

        (image, *keypair.public.as_bytes())
    }

    fn image_with(bytes: &[u8]) -> FirmwareImage<MockFlash> {
        let mut mock = MockFlash::new(SECTOR_SIZE, SECTORS);
        mock.program_bytes(BASE, bytes).unwrap();
        let flash = SectorFlash::new(mock);
        FirmwareImage::new(flash, BASE, BASE_SECTOR, SECTORS)
    }

    #[test]
    fn parse_finds_firmware_offset() {
        let (bytes, _) = build_signed_image();
        let mut image = image_with(&bytes);
        image.parse().unwrap();
        assert_eq!(image.state(), ImageState::Parsed);
        assert!(image.parsed.as_ref().unwrap().firmware_offset.is_some());
    }

    #[test]
    fn verify_succeeds_on_untampered_image() {
        let (bytes, _) = build_signed_image();
        let mut image = image_with(&bytes);
        image.verify(&mut NoProgress).unwrap();
        assert_eq!(image.state(), ImageState::Verified);
    }

    #[test]
    fn verify_fails_on_bitflip() {
        let (mut bytes, _) = build_signed_image();
        // Flip one byte inside the FIRMWARE payload (well past the headers).
        let i = bytes.len() / 2;
        bytes[i] ^= 0x01;
        let mut image = image_with(&bytes);
        assert_eq!(
            image.verify(&mut NoProgress),
            Err(ImageError::IntegrityFailure)
        );
    }

    #[test]
    fn authenticate_succeeds_with_matching_key_in_store() {
        let (bytes, pubkey) = build_signed_image();
        let mut image = image_with(&bytes);
        let mut keys = keystore();
        keys.set_slot_key(0, &pubkey).unwrap();
        image.authenticate(&keys, &mut NoProgress).unwrap();
        assert_eq!(image.state(), ImageState::Authenticated);
    }

    #[test]
    fn verify_any_candidate_tries_subsequent_keys_after_a_mismatch() {
        // Regression test for spec.md §9's Open Question 3: a fingerprint
        // match doesn't guarantee the candidate is the signer, so the first
        // candidate failing Ed25519 verification must not end the search.
        let wrong = salty::signature::Keypair::from(&[1u8; 32]);
        let signer = salty::signature::Keypair::from(&[2u8; 32]);

        let hash = Sha512::digest(b"firmware payload");
        let hash: [u8; 64] = hash.into();
        let signature = signer.sign(&hash).to_bytes();

        let candidates = [*wrong.public.as_bytes(), *signer.public.as_bytes()];
        assert!(verify_any_candidate(candidates.into_iter(), &hash, &signature));
    }

    #[test]
    fn verify_any_candidate_fails_once_every_candidate_is_exhausted() {
        let wrong = salty::signature::Keypair::from(&[1u8; 32]);
        let other_wrong = salty::signature::Keypair::from(&[3u8; 32]);
        let signer = salty::signature::Keypair::from(&[2u8; 32]);

        let hash = Sha512::digest(b"firmware payload");
        let hash: [u8; 64] = hash.into();
        let signature = signer.sign(&hash).to_bytes();

        let candidates = [*wrong.public.as_bytes(), *other_wrong.public.as_bytes()];
        assert!(!verify_any_candidate(candidates.into_iter(), &hash, &signature));
    }

    #[test]
    fn authenticate_fails_without_matching_key() {
        let (bytes, _) = build_signed_image();
        let mut image = image_with(&bytes);
        let keys = keystore();
        assert_eq!(
            image.authenticate(&keys, &mut NoProgress),
            Err(ImageError::AuthFailure)
        );
    }

    #[test]
    fn erase_and_program_clear_all_flags() {
        let (bytes, pubkey) = build_signed_image();
        let mut image = image_with(&bytes);
        let mut keys = keystore();
        keys.set_slot_key(0, &pubkey).unwrap();
        image.authenticate(&keys, &mut NoProgress).unwrap();

        image.erase(&mut NoProgress).unwrap();
        assert_eq!(image.state(), ImageState::Fresh);
    }

    #[test]
    fn unknown_subsection_inside_verified_is_skipped() {
        let seed = [3u8; 32];
        let keypair = salty::signature::Keypair::from(&seed);

        let mut firmware_payload = std::vec![0u8; 64];
        firmware_payload[0..4].copy_from_slice(&0x20010000u32.to_le_bytes());
        firmware_payload[4..8].copy_from_slice(&0x08000011u32.to_le_bytes());

        let mut verified_payload = std::vec::Vec::new();
        put_section(&mut verified_payload, 0xDEAD_BEEF, b"unknown-data");
        put_section(&mut verified_payload, MAGIC_FIRMWARE, &firmware_payload);

        let hash = Sha512::digest(&verified_payload);
        let hash: [u8; 64] = hash.into();
        let signature = keypair.sign(&hash);
        let fp = {
            let d = Sha512::digest(keypair.public.as_bytes());
            let mut fp = [0u8; 4];
            fp.copy_from_slice(&d[..4]);
            fp
        };

        let mut verification_payload = std::vec::Vec::new();
        put_section(&mut verification_payload, MAGIC_SHA512, &hash);
        put_section(
            &mut verification_payload,
            MAGIC_ED25519,
            &signature.to_bytes(),
        );
        put_section(&mut verification_payload, MAGIC_FP, &fp);

        let mut image_bytes = std::vec::Vec::new();
        put_section(&mut image_bytes, MAGIC_VERIFIED, &verified_payload);
        put_section(
            &mut image_bytes,
            MAGIC_VERIFICATION,
            &verification_payload,
        );

        let mut image = image_with(&image_bytes);
        let mut keys = keystore();
        keys.set_slot_key(0, keypair.public.as_bytes()).unwrap();
        image.authenticate(&keys, &mut NoProgress).unwrap();
        assert_eq!(image.state(), ImageState::Authenticated);
    }

    #[test]
    fn short_sha512_section_is_not_treated_as_hash() {
        let mut verified_payload = std::vec::Vec::new();
        put_section(&mut verified_payload, MAGIC_DUMMY, &[]);

        let mut verification_payload = std::vec::Vec::new();
        put_section(&mut verification_payload, MAGIC_SHA512, &[0u8; 63]);

        let mut image_bytes = std::vec::Vec::new();
        put_section(&mut image_bytes, MAGIC_VERIFIED, &verified_payload);
        put_section(
            &mut image_bytes,
            MAGIC_VERIFICATION,
            &verification_payload,
        );

        let mut image = image_with(&image_bytes);
        image.parse().unwrap();
        assert!(image.parsed.as_ref().unwrap().hash.is_none());
        assert_eq!(
            image.verify(&mut NoProgress),
            Err(ImageError::IntegrityFailure)
        );
    }

    #[test]
    fn short_fp_section_is_not_treated_as_fingerprint() {
        let mut verified_payload = std::vec::Vec::new();
        put_section(&mut verified_payload, MAGIC_DUMMY, &[]);

        let mut verification_payload = std::vec::Vec::new();
        put_section(&mut verification_payload, MAGIC_FP, &[0u8; 3]);

        let mut image_bytes = std::vec::Vec::new();
        put_section(&mut image_bytes, MAGIC_VERIFIED, &verified_payload);
        put_section(
            &mut image_bytes,
            MAGIC_VERIFICATION,
            &verification_payload,
        );

        let mut image = image_with(&image_bytes);
        image.parse().unwrap();
        assert!(image.parsed.as_ref().unwrap().fingerprint.is_none());
    }

    #[test]
    fn undersized_firmware_section_is_malformed() {
        // A FIRMWARE payload shorter than the two-word vector table
        // entry_point() reads must not be accepted, or a later entry_point()
        // call could read past the image's own flash window.
        let mut verified_payload = std::vec::Vec::new();
        put_section(&mut verified_payload, MAGIC_FIRMWARE, &[0u8; 4]);

        let mut image_bytes = std::vec::Vec::new();
        put_section(&mut image_bytes, MAGIC_VERIFIED, &verified_payload);
        put_section(&mut image_bytes, MAGIC_VERIFICATION, &[]);

        let mut image = image_with(&image_bytes);
        assert_eq!(image.parse(), Err(ImageError::Malformed));
    }

    #[test]
    fn zero_length_section_is_accepted_and_skipped() {
        let mut verified_payload = std::vec::Vec::new();
        put_section(&mut verified_payload, MAGIC_DUMMY, &[]);
        put_section(&mut verified_payload, MAGIC_FIRMWARE, &[0u8; 8]);

        let mut verification_payload = std::vec::Vec::new();
        put_section(&mut verification_payload, MAGIC_DUMMY, &[]);

        let mut image_bytes = std::vec::Vec::new();
        put_section(&mut image_bytes, MAGIC_VERIFIED, &verified_payload);
        put_section(
            &mut image_bytes,
            MAGIC_VERIFICATION,
            &verification_payload,
        );

        let mut image = image_with(&image_bytes);
        image.parse().unwrap();
        assert!(image.parsed.as_ref().unwrap().firmware_offset.is_some());
    }

    #[test]
    fn truncated_subsection_header_is_malformed() {
        let mut verified_payload = std::vec::Vec::new();
        // Four bytes of header where eight are required: cursor can't reach
        // the payload, let alone the length claimed inside it.
        verified_payload.extend_from_slice(&MAGIC_DUMMY.to_be_bytes());

        let mut image_bytes = std::vec::Vec::new();
        put_section(&mut image_bytes, MAGIC_VERIFIED, &verified_payload);
        put_section(&mut image_bytes, MAGIC_VERIFICATION, &[]);

        let mut image = image_with(&image_bytes);
        assert_eq!(image.parse(), Err(ImageError::Malformed));
    }

    #[test]
    fn entry_point_reads_stack_pointer_and_reset_handler() {
        let (bytes, _) = build_signed_image();
        let mut image = image_with(&bytes);
        image.parse().unwrap();
        let entry = image.entry_point().unwrap();
        assert_eq!(entry.stack_pointer, 0x2001_0000);
        assert_eq!(entry.reset_handler, 0x0800_0011);
    }

    #[test]
    fn authenticate_fails_when_signature_forged_under_wrong_key() {
        // Two keypairs; sign with the second but publish the fingerprint of
        // whichever slot the store happens to hold. Since only one key is
        // enrolled, the signature must verify against *that* key specifically
        // rather than merely finding a fingerprint match.
        let (bytes, real_pubkey) = build_signed_image();
        let forger = salty::signature::Keypair::from(&[99u8; 32]);

        // Re-sign the same hash with the forger's key, leaving the FP section
        // (and thus the lookup) pointed at the real key's slot.
        let mut tampered = bytes.clone();
        // Locate the ED25519 section: VERIFIED header(8) + verified_len,
        // then VERIFICATION header(8), then SHA512 section(8+64).
        let verified_len = u32::from_be_bytes(
            tampered[4..8].try_into().unwrap(),
        ) as usize;
        let verification_payload_start = 8 + verified_len + 8;
        let sha512_section_len = 8 + 64;
        let ed25519_data_start =
            verification_payload_start + sha512_section_len + 8;

        let hash_bytes = &tampered[verification_payload_start + 8
            ..verification_payload_start + 8 + 64];
        let mut hash = [0u8; 64];
        hash.copy_from_slice(hash_bytes);
        let forged_signature = forger.sign(&hash);
        tampered[ed25519_data_start..ed25519_data_start + 64]
            .copy_from_slice(&forged_signature.to_bytes());

        let mut image = image_with(&tampered);
        let mut keys = keystore();
        keys.set_slot_key(0, &real_pubkey).unwrap();
        assert_eq!(
            image.authenticate(&keys, &mut NoProgress),
            Err(ImageError::AuthFailure)
        );
    }
}
