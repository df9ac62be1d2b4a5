// RPMB command-line client
//
// Copyright 2023 Linaro Ltd. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Command dispatch: file handling around the RPMB operations.

use std::{
    fs::File,
    io::{Read, Write},
    os::unix::fs::OpenOptionsExt,
    path::Path,
};

use crate::{
    chardev::RpmbChardev,
    command::Rpmb,
    emulator::{EmulatorConfig, RpmbEmulator},
    io::{RpmbKey, RPMB_KEY_MAC_SIZE},
    transport::RpmbTransport,
    Result, RpmbCommand, RpmbConfig, Stream,
};

/// Run the configured command against the process' stdin and stdout.
pub fn run(config: &RpmbConfig) -> Result<()> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    run_with(config, &mut stdin.lock(), &mut stdout.lock())
}

/// Run the configured command. `-` file arguments use `stdin` and `stdout`.
pub fn run_with(config: &RpmbConfig, stdin: &mut dyn Read, stdout: &mut dyn Write) -> Result<()> {
    run_on(config, |device| open_device(config, device), stdin, stdout)
}

/// Run the configured command against the transport `open` returns for the
/// device path. Key and data files are opened first.
pub fn run_on<F>(
    config: &RpmbConfig,
    open: F,
    stdin: &mut dyn Read,
    stdout: &mut dyn Write,
) -> Result<()>
where
    F: FnOnce(&Path) -> Result<Box<dyn RpmbTransport>>,
{
    match &config.command {
        RpmbCommand::GetInfo { device } => {
            let mut dev = open(device)?;
            let mut rpmb = Rpmb::new(&mut *dev, config.mode);
            match rpmb.get_info()? {
                Some(caps) => writeln!(stdout, "{}", caps)?,
                None => writeln!(stdout, "{}: capabilities not available", device.display())?,
            }
        }
        RpmbCommand::ProgramKey { device, key } => {
            let key = read_key(key, stdin, false)?;
            let mut dev = open(device)?;
            Rpmb::new(&mut *dev, config.mode).program_key(&key)?;
        }
        RpmbCommand::WriteCounter { device, key } => {
            let key = key.as_ref().map(|key| read_key(key, stdin, false)).transpose()?;
            let mut dev = open(device)?;
            let counter = Rpmb::new(&mut *dev, config.mode).write_counter(key.as_ref())?;
            writeln!(stdout, "{}", counter)?;
        }
        RpmbCommand::ReadBlocks {
            device,
            address,
            block_count,
            output,
            key,
        } => {
            let key = key.as_ref().map(|key| read_key(key, stdin, false)).transpose()?;
            let mut file = match output {
                Stream::Stdio => None,
                Stream::Path(path) => Some(open_output(path)?),
            };
            let sink: &mut dyn Write = match file.as_mut() {
                Some(file) => file,
                None => stdout,
            };
            let mut dev = open(device)?;
            Rpmb::new(&mut *dev, config.mode).read_blocks(
                *address,
                *block_count,
                key.as_ref(),
                sink,
            )?;
        }
        RpmbCommand::WriteBlocks {
            device,
            address,
            block_count,
            data,
            key,
        } => {
            // Both on stdin: the key is the first 32 bytes, the data follows.
            let shared = *key == Stream::Stdio && *data == Stream::Stdio;
            let key = read_key(key, stdin, shared)?;
            let mut file = match data {
                Stream::Stdio => None,
                Stream::Path(path) => Some(open_input(path, "data file")?),
            };
            let source: &mut dyn Read = match file.as_mut() {
                Some(file) => file,
                None => stdin,
            };
            let mut dev = open(device)?;
            Rpmb::new(&mut *dev, config.mode).write_blocks(
                *address,
                *block_count,
                source,
                &key,
            )?;
        }
    }
    Ok(())
}

fn open_device(config: &RpmbConfig, device: &Path) -> Result<Box<dyn RpmbTransport>> {
    Ok(match &config.emulator {
        Some(emulator) => Box::new(RpmbEmulator::new(EmulatorConfig {
            flash_path: device.to_path_buf(),
            ..emulator.clone()
        })?),
        None => Box::new(RpmbChardev::open(device)?),
    })
}

fn open_input(path: &Path, what: &str) -> Result<File> {
    File::open(path).map_err(|err| {
        log::error!("Cannot open {}: {}: {}.", what, path.display(), err);
        err.into()
    })
}

fn open_output(path: &Path) -> Result<File> {
    File::options()
        .append(true)
        .create(true)
        .mode(0o600)
        .open(path)
        .map_err(|err| {
            log::error!("Cannot open output data: {}: {}.", path.display(), err);
            err.into()
        })
}

/// Read a key of exactly 32 bytes.
///
/// When stdin also carries block data (`shared`), only the first 32 bytes are
/// taken from it.
fn read_key(key: &Stream, stdin: &mut dyn Read, shared: bool) -> Result<RpmbKey> {
    let mut buf = zeroize::Zeroizing::new(Vec::with_capacity(RPMB_KEY_MAC_SIZE + 1));
    let limit = RPMB_KEY_MAC_SIZE as u64 + 1;
    match key {
        Stream::Stdio if shared => {
            let mut key = zeroize::Zeroizing::new([0; RPMB_KEY_MAC_SIZE]);
            stdin.read_exact(&mut *key).map_err(|err| {
                log::error!("Cannot read key from stdin: {}.", err);
                err
            })?;
            return RpmbKey::try_from(&key[..]);
        }
        Stream::Stdio => stdin.take(limit).read_to_end(&mut buf)?,
        Stream::Path(path) => open_input(path, "key file")?
            .take(limit)
            .read_to_end(&mut buf)?,
    };
    RpmbKey::try_from(buf.as_slice())
}
