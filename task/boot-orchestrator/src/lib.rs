// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The top-level boot-decision policy: compose the firmware-image engine,
//! the pubkey slot store, and a staged-firmware request channel into
//! "request -> backup -> program -> verify -> authenticate -> jump or fall
//! back".
//!
//! This is deliberately a short straight-line sequence, not a general state
//! machine — its only branches are the failure arms, matching
//! `examples/original_source/common/ubload.c`'s `main`. MCU bring-up, the
//! interactive console's line editor, and the jump instruction sequence
//! itself stay out of scope: this crate decides *what* to do next and
//! returns an [`Outcome`] for the platform-specific caller to carry out.

#![cfg_attr(not(test), no_std)]

use boot_config::{Config, BACKUP_FILE_NAME};
use boot_progress::{NoProgress, Progress};
use drv_boot_flash::FlashController;
use drv_boot_image::{EntryPoint, FirmwareImage};
use drv_boot_pubkey_store::PubkeyStore;
use drv_boot_staged_file::{dump_file, program_file, StagedFileSystem};
use ringbuf::*;

/// Watchdog period the orchestrator requests once an image authenticates,
/// matching `ubload.c`'s `fw_image_watchdog_enable(&main_fw, 5000)`.
pub const WATCHDOG_PERIOD_MS: u32 = 5000;

/// Starts the watchdog timer. An out-of-scope MCU collaborator (spec.md §6).
pub trait Watchdog {
    fn start(&mut self, period_ms: u32);
}

/// What the interactive maintenance console session did, as reported back
/// to the orchestrator. The console itself — its line editor, XMODEM
/// framing, and command dispatch — is out of scope (spec.md §1); this is
/// just the three outcomes that feed the boot decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleExit {
    /// `boot` command: continue the boot sequence.
    Boot,
    /// `reset`/`quit`, confirmed.
    Reset,
    /// Idle timeout inside the session.
    Timeout,
}

/// The optional interactive console, out of scope per spec.md §1. A
/// no-console build wires a collaborator whose `offer_interrupt` always
/// returns `false`.
pub trait Console {
    /// Prints the banner and waits up to `wait_time_secs` for the user to
    /// press the enter key. Returns `true` if the maintenance console
    /// should be entered.
    fn offer_interrupt(&mut self, wait_time_secs: u8) -> bool;

    /// Runs the interactive session until `boot`, `reset`/`quit`, or
    /// `idle_timeout_secs` of inactivity.
    fn run_session(&mut self, idle_timeout_secs: u32) -> ConsoleExit;
}

/// What the orchestrator decided to do. Carrying out `Jump` (setting the
/// stack pointer and branching) and `Reset` (the MCU's software-reset
/// mechanism) are hardware operations this crate does not perform itself —
/// see [`drv_boot_image::EntryPoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Authentication succeeded (and the watchdog is running, if enabled).
    /// Jump to this entry point; control never returns.
    Jump(EntryPoint),
    /// No good path forward this boot. A new `fw_request` may have been
    /// persisted for the next boot to retry. Reset the MCU; the watchdog,
    /// if running, backstops an infinite loop.
    Reset,
}

#[derive(Clone, Copy, PartialEq)]
enum Trace {
    Start,
    ConsoleRequestedMaintenance,
    ConsoleExit(ConsoleExit),
    CheckFwRequested,
    BackupFailed,
    ProgramFailed,
    AuthFailed,
    Authenticated,
    FallbackToWorking,
    FallbackToBackup,
    NoFallbackPossible,
}

ringbuf!(Trace, 32, Trace::Start);

/// Resolves the progress sink to drive for this call, per `cli_enabled`
/// (spec.md §4.5, `original_source/common/ubload.c`'s
/// `if (running_config.cli_enabled) fw_image_set_progress_callback(...)`). A
/// free function rather than a `BootEnvironment` method: the callers need
/// `self.image`/`self.fs` mutably borrowed at the same time, and a `&mut
/// self` method here would borrow the whole struct instead of just these
/// two fields.
fn select_progress<'p, 's: 'p>(
    console_progress: &'p mut Option<&'s mut dyn Progress>,
    no_progress: &'p mut NoProgress,
    cli_enabled: bool,
) -> &'p mut dyn Progress {
    if cli_enabled {
        if let Some(session) = console_progress.as_mut() {
            return &mut **session;
        }
    }
    no_progress
}

/// Bundles the collaborators one boot decision needs: the installed image,
/// the pubkey slot store, the staged-firmware filesystem, the watchdog, and
/// the optional console. Each is a process-lifetime object the platform's
/// entry point constructs in order and hands in by reference (spec.md §9,
/// "Global singletons").
///
/// `console_progress` is the console's progress-bar sink (spec.md §4.5's
/// `ConsoleSession` seam), present only when a maintenance console is
/// actually attached. Whether it's driven at all is decided once, here,
/// from `config.cli_enabled`, rather than at each erase/program/verify call
/// site: matching `original_source/common/ubload.c`'s
/// `if (running_config.cli_enabled) fw_image_set_progress_callback(...)`,
/// a disabled console never sees a progress callback regardless of what's
/// wired into `console_progress`.
pub struct BootEnvironment<'a, C, K, F, W, S> {
    image: &'a mut FirmwareImage<C>,
    keys: &'a PubkeyStore<K>,
    fs: &'a mut F,
    watchdog: &'a mut W,
    console: &'a mut S,
    console_progress: Option<&'a mut dyn Progress>,
    no_progress: NoProgress,
}

impl<'a, C, K, F, W, S> BootEnvironment<'a, C, K, F, W, S>
where
    C: FlashController,
    K: FlashController,
    F: StagedFileSystem,
    W: Watchdog,
    S: Console,
{
    pub fn new(
        image: &'a mut FirmwareImage<C>,
        keys: &'a PubkeyStore<K>,
        fs: &'a mut F,
        watchdog: &'a mut W,
        console: &'a mut S,
        console_progress: Option<&'a mut dyn Progress>,
    ) -> Self {
        Self {
            image,
            keys,
            fs,
            watchdog,
            console,
            console_progress,
            no_progress: NoProgress,
        }
    }

    /// Runs one pass of the boot decision. Idempotent: with an empty
    /// `fw_request` and an already-authenticated image, this performs zero
    /// flash writes and returns `Outcome::Jump` in one pass.
    pub fn run(&mut self, config: &mut Config) -> Outcome {
        ringbuf_entry!(Trace::Start);

        if config.cli_enabled && self.console.offer_interrupt(config.wait_time_secs) {
            ringbuf_entry!(Trace::ConsoleRequestedMaintenance);
            let exit = self.console.run_session(config.idle_timeout_secs);
            ringbuf_entry!(Trace::ConsoleExit(exit));
            match exit {
                ConsoleExit::Boot => {}
                ConsoleExit::Reset | ConsoleExit::Timeout => {
                    return Outcome::Reset;
                }
            }
        }

        if let Err(outcome) = self.check_fw(config) {
            return outcome;
        }

        self.authenticate_and_decide(config)
    }

    /// Step 4: if a firmware file is staged, back up the current image,
    /// program the new one, and persist the cleared request. Restart-safe:
    /// `fw_request` is only cleared (and the config only saved) *after* the
    /// program succeeds, so an interrupted install leaves the request in
    /// place for the next boot to retry (spec.md §5).
    fn check_fw(&mut self, config: &mut Config) -> Result<(), Outcome> {
        if config.fw_request.is_empty() {
            return Ok(());
        }
        ringbuf_entry!(Trace::CheckFwRequested);

        if config.fw_request.as_str() != BACKUP_FILE_NAME {
            let progress =
                select_progress(&mut self.console_progress, &mut self.no_progress, config.cli_enabled);
            if dump_file(self.image, self.fs, BACKUP_FILE_NAME, progress).is_err() {
                // Best effort: failing to preserve the old image is not
                // fatal to installing the new one.
                ringbuf_entry!(Trace::BackupFailed);
            }
        }

        let requested = config.fw_request;
        let progress =
            select_progress(&mut self.console_progress, &mut self.no_progress, config.cli_enabled);
        let program_result =
            program_file(self.image, self.fs, requested.as_str(), progress);

        if program_result.is_err() {
            ringbuf_entry!(Trace::ProgramFailed);
            return Err(self.fallback(config));
        }

        if requested.as_str() == BACKUP_FILE_NAME {
            let _ = self.fs.delete(BACKUP_FILE_NAME);
        }

        config.fw_request.clear();
        let _ = boot_config::save(self.fs, config);
        Ok(())
    }

    /// Steps 5-7: verify + authenticate the installed image; jump on
    /// success, fall back on failure.
    fn authenticate_and_decide(&mut self, config: &mut Config) -> Outcome {
        let progress =
            select_progress(&mut self.console_progress, &mut self.no_progress, config.cli_enabled);
        if self.image.authenticate(self.keys, progress).is_err() {
            ringbuf_entry!(Trace::AuthFailed);
            return self.fallback(config);
        }
        ringbuf_entry!(Trace::Authenticated);

        let entry = match self.image.entry_point() {
            Ok(entry) => entry,
            Err(_) => return self.fallback(config),
        };

        if config.watchdog_enabled {
            self.watchdog.start(WATCHDOG_PERIOD_MS);
        }
        Outcome::Jump(entry)
    }

    /// Step 7's fallback policy: prefer a known-working file, then an
    /// existing backup, then give up and let the watchdog catch the loop.
    fn fallback(&mut self, config: &mut Config) -> Outcome {
        if !config.fw_working.is_empty() {
            ringbuf_entry!(Trace::FallbackToWorking);
            config.fw_request = config.fw_working;
        } else if self.fs.exists(BACKUP_FILE_NAME) {
            ringbuf_entry!(Trace::FallbackToBackup);
            let _ = config.fw_request.set(BACKUP_FILE_NAME);
        } else {
            ringbuf_entry!(Trace::NoFallbackPossible);
            return Outcome::Reset;
        }
        let _ = boot_config::save(self.fs, config);
        Outcome::Reset
    }
}
