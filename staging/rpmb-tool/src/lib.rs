// RPMB command-line client
//
// Copyright 2023 Linaro Ltd. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

#![deny(
    /* groups */
    clippy::correctness,
    clippy::suspicious,
    clippy::complexity,
    clippy::perf,
    clippy::style,
    clippy::nursery,
    //* restriction */
    clippy::dbg_macro,
    clippy::rc_buffer,
    clippy::as_underscore,
    clippy::assertions_on_result_states,
    //* pedantic */
    clippy::cast_lossless,
    clippy::cast_possible_wrap,
    clippy::ptr_as_ptr,
    clippy::bool_to_int_with_if,
    clippy::borrow_as_ptr,
    clippy::case_sensitive_file_extension_comparisons,
    clippy::cast_ptr_alignment,
    clippy::naive_bytecount
)]
#![allow(clippy::significant_drop_tightening)]

use std::{
    convert,
    io::{Error as IoError, ErrorKind as IoErrorKind},
    path::PathBuf,
    str::FromStr,
};

use clap::{Parser, Subcommand};
use thiserror::Error as ThisError;

pub mod chardev;
pub mod cli;
pub mod command;
pub mod emulator;
pub mod io;
pub mod mac;
pub mod transport;

pub use chardev::RpmbChardev;
pub use command::Rpmb;
pub use emulator::{EmulatorConfig, RpmbEmulator};
pub use io::{RpmbFrame, RpmbKey, RpmbRequestKind, RpmbResult};
pub use transport::{CmdMode, RpmbCapabilities, RpmbCmd, RpmbTransport};

pub type Result<T> = std::result::Result<T, RpmbError>;

#[derive(Debug, ThisError)]
/// Errors of the RPMB client and the software device.
pub enum RpmbError {
    #[error("Key size {0} is invalid, expected {1} bytes")]
    InvalidKeySize(usize, usize),
    #[error("Invalid block count {0}")]
    InvalidBlockCount(u16),
    #[error("Invalid number {0:?}")]
    InvalidNumber(String),
    #[error("{op}: block count {count} exceeds the device limit {max}")]
    BlockCountExceeded {
        op: RpmbRequestKind,
        count: u16,
        max: u16,
    },
    #[error("Not enough data: expected {expected} bytes, found {found}")]
    ShortData { expected: usize, found: usize },
    #[error(transparent)]
    Io(#[from] IoError),
    #[error("{op} failed: {source}")]
    Ioctl {
        op: &'static str,
        source: IoError,
    },
    #[error("Failed to generate a nonce: {0}")]
    Nonce(rand::Error),
    #[error("RPMB response mismatch: expected {expected:#06x}, found {found:#06x}")]
    ResponseMismatch { expected: u16, found: u16 },
    #[error("RPMB nonce mismatch")]
    NonceMismatch,
    #[error("Invalid frame count: expected {expected}, found {found}")]
    FrameCount { expected: usize, found: usize },
    #[error("No frames")]
    NoFrames,
    #[error("RPMB address mismatch: expected {expected:#06x}, found {found:#06x}")]
    AddressMismatch { expected: u16, found: u16 },
    #[error("RPMB write counter not incremented: {before} -> {after}")]
    CounterNotIncremented { before: u32, after: u32 },
    #[error("Unknown request code {0:#06x}")]
    UnknownRequest(u16),
    #[error("RPMB operation {op} failed: {result}[{:#06x}]", .result.0)]
    Device { op: RpmbRequestKind, result: RpmbResult },
    #[error("RPMB hmac mismatch")]
    MacMismatch,
    #[error("Invalid sequence length {0}")]
    InvalidSequence(usize),
    #[error("Key already set")]
    KeyAlreadySet,
    #[error("Key not set")]
    KeyNotSet,
    #[error(
        "Invalid flash image {}: size {} is not a non-zero multiple of the block size",
        .0.display(),
        .1
    )]
    InvalidFlashImage(PathBuf, u64),
}

impl convert::From<RpmbError> for IoError {
    fn from(e: RpmbError) -> Self {
        Self::new(IoErrorKind::Other, e)
    }
}

/// Parse a number the way `strtoul(s, NULL, 0)` does: `0x` prefix for hex, a
/// leading `0` for octal, decimal otherwise. The value must fit in 16 bits.
pub fn parse_number(s: &str) -> Result<u16> {
    let invalid = || RpmbError::InvalidNumber(s.to_string());
    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        (&s[1..], 8)
    } else {
        (s, 10)
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return Err(invalid());
    }
    u16::from_str_radix(digits, radix).map_err(|_| invalid())
}

/// A file argument, where `-` names stdin or stdout.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Stream {
    Stdio,
    Path(PathBuf),
}

impl FromStr for Stream {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "-" => Self::Stdio,
            path => Self::Path(path.into()),
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Subcommand)]
pub enum RpmbCommand {
    /// Get RPMB device info.
    GetInfo {
        /// RPMB device, e.g. /dev/rpmb0.
        device: PathBuf,
    },
    /// Program the authentication key. This can be done only once.
    ProgramKey {
        device: PathBuf,
        /// File holding the 32 byte key, or - for stdin.
        key: Stream,
    },
    /// Print the write counter. The response is authenticated when a key is
    /// given.
    WriteCounter {
        device: PathBuf,
        key: Option<Stream>,
    },
    /// Read blocks of 256 bytes. The data is authenticated when a key is
    /// given.
    ReadBlocks {
        device: PathBuf,
        #[arg(value_parser = parse_number)]
        address: u16,
        #[arg(value_parser = parse_number)]
        block_count: u16,
        /// Output file, or - for stdout.
        output: Stream,
        key: Option<Stream>,
    },
    /// Write blocks of 256 bytes.
    WriteBlocks {
        device: PathBuf,
        #[arg(value_parser = parse_number)]
        address: u16,
        #[arg(value_parser = parse_number)]
        block_count: u16,
        /// Data file, or - for stdin.
        data: Stream,
        key: Stream,
    },
}

impl RpmbCommand {
    pub fn device(&self) -> &std::path::Path {
        match self {
            Self::GetInfo { device }
            | Self::ProgramKey { device, .. }
            | Self::WriteCounter { device, .. }
            | Self::ReadBlocks { device, .. }
            | Self::WriteBlocks { device, .. } => device,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "rpmb", author, version, about, long_about = None)]
pub struct RpmbArgs {
    /// Dump every frame sent and received.
    #[arg(short, long, global = true)]
    pub verbose: bool,
    /// Let the kernel run the result read (default).
    #[arg(short, long, global = true, conflicts_with = "sequence")]
    pub request: bool,
    /// Send the whole command sequence explicitly.
    #[arg(short, long, global = true)]
    pub sequence: bool,
    /// Serve the device argument as a flash image with a software RPMB
    /// device, keeping its key in KEY_FILE.
    #[arg(long, global = true, value_name = "KEY_FILE")]
    pub emulate_key: Option<PathBuf>,
    /// Fail unless KEY_FILE already holds the key of the software device.
    #[arg(long, global = true, requires = "emulate_key")]
    pub emulate_key_set: bool,
    #[command(subcommand)]
    pub command: RpmbCommand,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RpmbConfig {
    /// Dump every frame sent and received.
    pub verbose: bool,
    pub mode: CmdMode,
    /// Software device to use in place of the character device.
    pub emulator: Option<EmulatorConfig>,
    pub command: RpmbCommand,
}

impl RpmbConfig {
    /// Logger configured from `RUST_LOG`. Verbose runs raise this crate to
    /// debug so frames are dumped.
    pub fn logger(&self) -> env_logger::Builder {
        let mut builder = env_logger::Builder::from_default_env();
        if self.verbose {
            builder.filter_module("rpmb_tool", log::LevelFilter::Debug);
        }
        builder
    }
}

impl TryFrom<RpmbArgs> for RpmbConfig {
    type Error = RpmbError;

    fn try_from(
        RpmbArgs {
            verbose,
            request: _,
            sequence,
            emulate_key,
            emulate_key_set,
            command,
        }: RpmbArgs,
    ) -> Result<Self> {
        if let RpmbCommand::ReadBlocks { block_count, .. }
        | RpmbCommand::WriteBlocks { block_count, .. } = &command
        {
            if *block_count == 0 {
                return Err(RpmbError::InvalidBlockCount(0));
            }
        }
        let emulator = emulate_key.map(|key_path| EmulatorConfig {
            key_set: emulate_key_set,
            ..EmulatorConfig::new(command.device().into(), key_path)
        });

        Ok(Self {
            verbose,
            mode: if sequence {
                CmdMode::Sequence
            } else {
                CmdMode::Request
            },
            emulator,
            command,
        })
    }
}
