// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Moves raw bytes between the external staged-firmware filesystem and an
//! installed [`FirmwareImage`].
//!
//! `program_file` and `dump_file` are pure byte movers: neither parses nor
//! authenticates the image they touch. That's the boot orchestrator's job,
//! layered on top once the bytes are in place.

#![cfg_attr(not(any(test, feature = "test-util")), no_std)]

use boot_progress::{Progress, Signal};
use drv_boot_flash::FlashController;
use drv_boot_image::{FirmwareImage, ImageError};

/// Chunk size used to stream a file into flash, matching the original
/// firmware's fixed 128-byte transfer buffer.
pub const CHUNK_SIZE: usize = 128;

/// A small filesystem seam standing in for the out-of-scope small-file flash
/// filesystem (SFFS). Every operation is named-file addressed; there is no
/// open file handle, since the core's usage never holds more than one file
/// open at a time (spec.md §5).
pub trait StagedFileSystem {
    type Error: core::fmt::Debug;

    /// Size of `name` in bytes.
    fn len(&mut self, name: &str) -> Result<u32, Self::Error>;

    /// `name` exists and can be opened for read.
    fn exists(&mut self, name: &str) -> bool {
        self.len(name).is_ok()
    }

    /// Reads up to `buf.len()` bytes starting at `offset`. Returns the
    /// number of bytes actually read; 0 signals end of file.
    fn read_at(
        &mut self,
        name: &str,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<usize, Self::Error>;

    /// Opens `name` for overwrite, truncating any existing content. Must be
    /// called before the first `append`.
    fn begin_overwrite(&mut self, name: &str) -> Result<(), Self::Error>;

    /// Appends `data` to the file most recently opened with
    /// `begin_overwrite`.
    fn append(&mut self, name: &str, data: &[u8]) -> Result<(), Self::Error>;

    /// Removes `name`. Not an error if `name` does not exist.
    fn delete(&mut self, name: &str) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagedFileError<E> {
    Image(ImageError),
    Fs(E),
    Cancelled,
    /// `fs` reported end of file before the full length reported by
    /// `fs.len` was read; fewer bytes reached flash than `program_file`'s
    /// caller expects.
    Truncated,
}

impl<E> From<ImageError> for StagedFileError<E> {
    fn from(e: ImageError) -> Self {
        StagedFileError::Image(e)
    }
}

/// Erases `image`, then streams `filename` from `fs` into it in
/// [`CHUNK_SIZE`]-byte chunks, reporting progress against the file's total
/// size.
pub fn program_file<C, F>(
    image: &mut FirmwareImage<C>,
    fs: &mut F,
    filename: &str,
    progress: &mut dyn Progress,
) -> Result<(), StagedFileError<F::Error>>
where
    C: FlashController,
    F: StagedFileSystem,
{
    let total = fs.len(filename).map_err(StagedFileError::Fs)?;
    image.erase(progress)?;

    let mut offset = 0u32;
    let mut buf = [0u8; CHUNK_SIZE];
    while offset < total {
        let want = core::cmp::min(CHUNK_SIZE as u32, total - offset) as usize;
        let n = fs
            .read_at(filename, offset, &mut buf[..want])
            .map_err(StagedFileError::Fs)?;
        if n == 0 {
            return Err(StagedFileError::Truncated);
        }
        image.program(offset, &buf[..n])?;
        offset += n as u32;
        if progress.on_progress(offset, total) == Signal::Cancel {
            return Err(StagedFileError::Cancelled);
        }
    }
    Ok(())
}

/// Copies the full contiguous span of `image`'s flash window out to
/// `filename` on `fs`, overwriting it.
pub fn dump_file<C, F>(
    image: &FirmwareImage<C>,
    fs: &mut F,
    filename: &str,
    progress: &mut dyn Progress,
) -> Result<(), StagedFileError<F::Error>>
where
    C: FlashController,
    F: StagedFileSystem,
{
    let total = image.window_len();
    fs.begin_overwrite(filename).map_err(StagedFileError::Fs)?;

    let mut offset = 0u32;
    while offset < total {
        let chunk_len = core::cmp::min(CHUNK_SIZE as u32, total - offset);
        let data = image.read_raw(offset, chunk_len)?;
        fs.append(filename, data).map_err(StagedFileError::Fs)?;
        offset += chunk_len;
        if progress.on_progress(offset, total) == Signal::Cancel {
            return Err(StagedFileError::Cancelled);
        }
    }
    Ok(())
}

#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    //! An in-memory staged-file filesystem for tests.

    use super::StagedFileSystem;
    use std::collections::BTreeMap;
    use std::string::String;
    use std::vec::Vec;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum MemFsError {
        NotFound,
        NotOpenForWrite,
    }

    #[derive(Default)]
    pub struct MemFs {
        files: BTreeMap<String, Vec<u8>>,
        writing: Option<String>,
    }

    impl MemFs {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn put(&mut self, name: &str, data: &[u8]) {
            self.files.insert(name.into(), data.to_vec());
        }

        pub fn get(&self, name: &str) -> Option<&[u8]> {
            self.files.get(name).map(|v| v.as_slice())
        }
    }

    impl StagedFileSystem for MemFs {
        type Error = MemFsError;

        fn len(&mut self, name: &str) -> Result<u32, Self::Error> {
            self.files
                .get(name)
                .map(|v| v.len() as u32)
                .ok_or(MemFsError::NotFound)
        }

        fn read_at(
            &mut self,
            name: &str,
            offset: u32,
            buf: &mut [u8],
        ) -> Result<usize, Self::Error> {
            let file = self.files.get(name).ok_or(MemFsError::NotFound)?;
            let offset = offset as usize;
            if offset >= file.len() {
                return Ok(0);
            }
            let n = core::cmp::min(buf.len(), file.len() - offset);
            buf[..n].copy_from_slice(&file[offset..offset + n]);
            Ok(n)
        }

        fn begin_overwrite(&mut self, name: &str) -> Result<(), Self::Error> {
            self.files.insert(name.into(), Vec::new());
            self.writing = Some(name.into());
            Ok(())
        }

        fn append(&mut self, name: &str, data: &[u8]) -> Result<(), Self::Error> {
            if self.writing.as_deref() != Some(name) {
                return Err(MemFsError::NotOpenForWrite);
            }
            self.files.get_mut(name).unwrap().extend_from_slice(data);
            Ok(())
        }

        fn delete(&mut self, name: &str) -> Result<(), Self::Error> {
            self.files.remove(name);
            Ok(())
        }
    }
}
