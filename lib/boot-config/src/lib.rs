// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The persistent boot configuration record.
//!
//! `Config` is a fixed-layout record stored under [`CONFIG_FILE_NAME`] on the
//! staged-firmware filesystem, hubpack-encoded the same way
//! `stage0-handoff` encodes its RAM handoff structures. It's loaded once at
//! boot (falling back to [`Config::default`] if the file is missing or
//! corrupt) and persisted on explicit save and at the end of an install
//! cycle.

#![cfg_attr(not(test), no_std)]

use drv_boot_staged_file::StagedFileSystem;
use hubpack::SerializedSize;
use serde::{Deserialize, Serialize};

/// Fixed name of the configuration file on the staged-firmware filesystem.
pub const CONFIG_FILE_NAME: &str = "ubload.cfg";

/// Fixed name of the pre-overwrite backup of the currently installed image.
pub const BACKUP_FILE_NAME: &str = "backup.fw";

const HOSTNAME_LEN: usize = 32;
const FILENAME_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, SerializedSize)]
pub enum LedMode {
    Off,
    StillOn,
    Basic,
    Diag,
}

/// A fixed-size, zero-padded byte buffer standing in for a bounded string,
/// matching the original `char[N]` fields in the C configuration struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, SerializedSize)]
pub struct FixedName<const N: usize> {
    bytes: [u8; N],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameTooLong;

impl<const N: usize> FixedName<N> {
    pub const fn empty() -> Self {
        Self { bytes: [0u8; N] }
    }

    pub fn set(&mut self, s: &str) -> Result<(), NameTooLong> {
        if s.len() > N {
            return Err(NameTooLong);
        }
        self.bytes = [0u8; N];
        self.bytes[..s.len()].copy_from_slice(s.as_bytes());
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        let end = self.bytes.iter().position(|&b| b == 0).unwrap_or(N);
        core::str::from_utf8(&self.bytes[..end]).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.as_str().is_empty()
    }

    pub fn clear(&mut self) {
        self.bytes = [0u8; N];
    }
}

impl<const N: usize> TryFrom<&str> for FixedName<N> {
    type Error = NameTooLong;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let mut name = Self::empty();
        name.set(s)?;
        Ok(name)
    }
}

pub type Hostname = FixedName<HOSTNAME_LEN>;
pub type Filename = FixedName<FILENAME_LEN>;

/// The persisted boot configuration.
///
/// Field set is spec.md §3's minimum: hostname, console baud and key
/// bindings, idle and wait-for-keypress timeouts, the watchdog-enabled flag,
/// the LED mode, and the two firmware filenames that drive the check-fw
/// phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, SerializedSize)]
pub struct Config {
    pub hostname: Hostname,
    pub serial_enabled: bool,
    pub serial_speed: u32,
    pub enter_key: u8,
    pub skip_key: u8,
    /// Whether the maintenance console is offered at all. When false, the
    /// orchestrator skips the wait-for-keypress step outright rather than
    /// waiting `wait_time_secs` for a key that a no-console build can never
    /// deliver.
    pub cli_enabled: bool,
    pub wait_time_secs: u8,
    pub idle_timeout_secs: u32,
    pub watchdog_enabled: bool,
    pub led_mode: LedMode,
    /// Name of a staged firmware file awaiting installation, or empty.
    pub fw_request: Filename,
    /// Name of the last-known-good firmware file, or empty.
    pub fw_working: Filename,
}

impl Default for Config {
    /// Matches `examples/original_source/common/config.c`'s `default_config`.
    fn default() -> Self {
        let mut hostname = Hostname::empty();
        hostname.set("unknown").expect("fits in HOSTNAME_LEN");
        Self {
            hostname,
            serial_enabled: true,
            serial_speed: 115_200,
            enter_key: 13,
            skip_key: 27,
            cli_enabled: true,
            wait_time_secs: 5,
            idle_timeout_secs: 300,
            watchdog_enabled: false,
            led_mode: LedMode::Basic,
            fw_request: Filename::empty(),
            fw_working: Filename::empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError<E> {
    Fs(E),
    Truncated,
    Corrupt,
}

/// Loads [`Config`] from [`CONFIG_FILE_NAME`]. Callers that get an error are
/// expected to fall back to [`Config::default`], matching the orchestrator's
/// "fall back to defaults if load fails" step.
pub fn load<F: StagedFileSystem>(fs: &mut F) -> Result<Config, ConfigError<F::Error>> {
    let mut buf = [0u8; Config::MAX_SIZE];
    let len = fs
        .read_at(CONFIG_FILE_NAME, 0, &mut buf)
        .map_err(ConfigError::Fs)?;
    if len < Config::MAX_SIZE {
        return Err(ConfigError::Truncated);
    }
    let (config, _) =
        hubpack::deserialize::<Config>(&buf).map_err(|_| ConfigError::Corrupt)?;
    Ok(config)
}

/// Overwrites [`CONFIG_FILE_NAME`] with `config`'s hubpack encoding.
pub fn save<F: StagedFileSystem>(
    fs: &mut F,
    config: &Config,
) -> Result<(), ConfigError<F::Error>> {
    let mut buf = [0u8; Config::MAX_SIZE];
    let n =
        hubpack::serialize(&mut buf, config).map_err(|_| ConfigError::Corrupt)?;
    fs.begin_overwrite(CONFIG_FILE_NAME)
        .map_err(ConfigError::Fs)?;
    fs.append(CONFIG_FILE_NAME, &buf[..n])
        .map_err(ConfigError::Fs)?;
    Ok(())
}
