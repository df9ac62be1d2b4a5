// RPMB command-line client
//
// Copyright 2023 Linaro Ltd. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! A file backed RPMB device.
//!
//! The flash image holds the RPMB region and the key file holds the
//! authentication key once it has been programmed. The write counter lives in
//! memory and starts at the configured initial value.

use std::{
    fs::File,
    io::Read,
    os::unix::fs::FileExt,
    path::PathBuf,
    sync::OnceLock,
};

use crate::{
    io::*,
    mac::{sign_frame, sign_frames, verify_frames},
    transport::{RpmbCapabilities, RpmbCmd, RpmbDeviceType, RpmbTransport},
    Result, RpmbError,
};

#[allow(non_upper_case_globals)]
pub const KiB: u64 = 1 << 10;
pub const MAX_RPMB_SIZE: u64 = KiB * 128 * 128;
pub const DEFAULT_MAX_WR_CNT: u16 = 2;
pub const DEFAULT_MAX_RD_CNT: u16 = 32;
const RPMB_DEVICE_TYPE_EMULATED: u16 = 0x8000;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EmulatorConfig {
    /// Path to the backing store for the flash image, can be up to 16MiB in
    /// size.
    pub flash_path: PathBuf,
    /// Path to the backing store for the key of 32 bytes.
    pub key_path: PathBuf,
    /// Treat the value of key-path as set meaning the key cannot be
    /// reprogrammed.
    pub key_set: bool,
    /// Initial value of the write counter. It is incremented by each write
    /// operation.
    pub initial_counter: u32,
    /// Maximum frames accepted in one authenticated write.
    pub max_wr_cnt: u16,
    /// Maximum frames returned by one authenticated read.
    pub max_rd_cnt: u16,
}

impl EmulatorConfig {
    pub fn new(flash_path: PathBuf, key_path: PathBuf) -> Self {
        Self {
            flash_path,
            key_path,
            key_set: false,
            initial_counter: 0,
            max_wr_cnt: DEFAULT_MAX_WR_CNT,
            max_rd_cnt: DEFAULT_MAX_RD_CNT,
        }
    }
}

#[repr(transparent)]
struct Key(OnceLock<KeySlice>);

impl Key {
    const fn new() -> Self {
        Self(OnceLock::new())
    }

    fn set(&mut self, val: KeySlice) -> Result<()> {
        self.0.set(val).map_err(|_| RpmbError::KeyAlreadySet)
    }

    fn get(&self) -> Result<RpmbKey> {
        self.0
            .get()
            .copied()
            .map(RpmbKey::new)
            .ok_or(RpmbError::KeyNotSet)
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        let state = if self.0.get().is_some() {
            "programmed"
        } else {
            "uninitialized"
        };
        fmt.debug_tuple(stringify!(Key)).field(&state).finish()
    }
}

/// Outcome of the last request that is reported through `RESULT_READ`.
#[derive(Debug, Default)]
enum LastResult {
    #[default]
    None,
    ProgramKey {
        result: RpmbResult,
    },
    DataWrite {
        result: RpmbResult,
        address: u16,
    },
}

#[derive(Debug)]
pub struct RpmbEmulator {
    config: EmulatorConfig,
    flash_image: Vec<u8>,
    key: Key,
    last_result: LastResult,
    write_counter: u32,
    responses: Vec<RpmbFrame>,
}

impl RpmbEmulator {
    pub fn new(config: EmulatorConfig) -> Result<Self> {
        let write_counter = config.initial_counter;
        let mut ret = Self {
            config,
            flash_image: vec![],
            key: Key::new(),
            last_result: LastResult::None,
            write_counter,
            responses: vec![],
        };
        ret.load_flash_image()?.load_key()?;

        Ok(ret)
    }

    pub const fn write_counter(&self) -> u32 {
        self.write_counter
    }

    pub fn flash_image(&self) -> &[u8] {
        &self.flash_image
    }

    pub fn is_key_programmed(&self) -> bool {
        self.key.get().is_ok()
    }

    /// Region size in 128KiB units.
    pub fn capacity(&self) -> u16 {
        (self.flash_image.len() as u64 / (128 * KiB)) as u16
    }

    /// Load flash image from path.
    fn load_flash_image(&mut self) -> Result<&mut Self> {
        let path = &self.config.flash_path;
        let stat = std::fs::metadata(path).map_err(|err| {
            log::error!(
                "Could not access the flash image file at given location {}: {}",
                path.display(),
                err
            );
            err
        })?;
        if stat.len() > MAX_RPMB_SIZE {
            log::warn!(
                "{} is larger ({} bytes) than the maximum supported size ({} bytes).",
                path.display(),
                stat.len(),
                MAX_RPMB_SIZE
            );
        }
        let len = stat.len().min(MAX_RPMB_SIZE);
        if len == 0 || len % RPMB_BLOCK_SIZE as u64 != 0 {
            return Err(RpmbError::InvalidFlashImage(path.clone(), len));
        }

        self.flash_image.clear();
        File::open(path)?
            .take(len)
            .read_to_end(&mut self.flash_image)?;
        log::debug!(
            "loaded {} blocks from {}",
            self.flash_image.len() / RPMB_BLOCK_SIZE,
            path.display()
        );

        Ok(self)
    }

    /// Set key from path, if there is one.
    fn load_key(&mut self) -> Result<&mut Self> {
        let path = &self.config.key_path;
        let stat = match std::fs::metadata(path) {
            Ok(s) => s,
            Err(err) if self.config.key_set => {
                log::error!(
                    "Could not access the key file at given location {}: {}",
                    path.display(),
                    err
                );
                return Err(err.into());
            }
            Err(_) => return Ok(self),
        };
        let len = stat.len() as usize;
        match len.cmp(&RPMB_KEY_MAC_SIZE) {
            std::cmp::Ordering::Less => {
                return Err(RpmbError::InvalidKeySize(len, RPMB_KEY_MAC_SIZE));
            }
            std::cmp::Ordering::Greater => {
                // being too big isn't fatal, we just ignore the excess
                log::warn!(
                    "Key file is bigger than expected size {} by {} bytes, ignoring the excess.",
                    RPMB_KEY_MAC_SIZE,
                    len - RPMB_KEY_MAC_SIZE
                );
            }
            std::cmp::Ordering::Equal => {}
        }

        let mut key = [0; RPMB_KEY_MAC_SIZE];
        File::open(path)?.read_exact(&mut key)?;
        self.key.set(key)?;
        Ok(self)
    }

    /// Save key to key path.
    fn save_key(&self) -> Result<()> {
        let key = self.key.get()?;
        std::fs::write(&self.config.key_path, key.as_bytes())?;
        Ok(())
    }

    fn persist_blocks(&self, offset: usize, blocks: &[u8]) -> Result<()> {
        File::options()
            .write(true)
            .open(&self.config.flash_path)?
            .write_all_at(blocks, offset as u64)?;
        Ok(())
    }

    fn in_range(&self, address: u16, block_count: u16) -> bool {
        (usize::from(address) + usize::from(block_count)) * RPMB_BLOCK_SIZE
            <= self.flash_image.len()
    }

    fn handle_request(&mut self, frames: &[RpmbFrame], reliable: bool) -> Result<()> {
        let frame = frames.first().ok_or(RpmbError::NoFrames)?;
        let req = RpmbRequestKind::try_from(frame.req_resp())?;
        log::debug!("emulator: {} request, {} frame(s)", req, frames.len());

        self.last_result = match req {
            RpmbRequestKind::ProgramKey => LastResult::ProgramKey {
                result: self.program_key(frame, reliable),
            },
            RpmbRequestKind::DataWrite => LastResult::DataWrite {
                result: self.data_write(frames, reliable),
                address: frame.addr(),
            },
            RpmbRequestKind::GetWriteCounter => {
                self.responses = vec![self.get_write_counter(frame)];
                LastResult::None
            }
            RpmbRequestKind::DataRead => {
                self.responses = self.data_read(frame)?;
                LastResult::None
            }
            RpmbRequestKind::ResultRead => {
                let resp = self.result_read();
                self.responses = vec![resp];
                LastResult::None
            }
        };
        Ok(())
    }

    // Run the checks from:
    // 5.12.6.1.1 Device Requirements: Device Operation: Program Key
    fn program_key(&mut self, frame: &RpmbFrame, reliable: bool) -> RpmbResult {
        let block_count = frame.block_count();
        let result = if !reliable {
            log::debug!("ProgramKey: not sent as a reliable write");
            RpmbOpResult::GeneralFailure
        } else if block_count != 1 {
            log::debug!(
                "weird block count in frame for ProgramKey request: {}",
                block_count
            );
            RpmbOpResult::GeneralFailure
        } else if self.key.set(frame.key_mac).is_err() {
            log::debug!("ProgramKey: key already programmed");
            RpmbOpResult::WriteFailure
        } else if let Err(err) = self.save_key() {
            log::error!("Could not save new key to file: {}", err);
            RpmbOpResult::GeneralFailure
        } else {
            RpmbOpResult::Ok
        };
        result.into()
    }

    // 5.12.6.1.2 Device Requirements: Device Operation: Get Write Counter
    fn get_write_counter(&self, frame: &RpmbFrame) -> RpmbFrame {
        let mut resp = RpmbFrame::default();
        resp.nonce = frame.nonce;
        resp.set_req_resp(RpmbResponseKind::GetCounter.into());

        let Ok(key) = self.key.get() else {
            log::debug!("GetWriteCounter: no key programmed");
            resp.set_result(RpmbOpResult::NoAuthKey.into());
            return resp;
        };
        // allow 0 (NONCONF)
        if frame.block_count() > 1 {
            log::debug!("GetWriteCounter: invalid block count {}", frame.block_count());
            resp.set_result(RpmbOpResult::GeneralFailure.into());
        } else if self.write_counter == u32::MAX {
            resp.set_write_counter(self.write_counter);
            resp.set_result(RpmbResult(RpmbResult::COUNTER_EXPIRED));
        } else {
            resp.set_write_counter(self.write_counter);
        }
        sign_frame(&mut resp, &key);
        resp
    }

    // 5.12.6.1.3 Device Requirements: Device Operation: Data Write
    fn data_write(&mut self, frames: &[RpmbFrame], reliable: bool) -> RpmbResult {
        let frame = &frames[0];
        let block_count = frame.block_count();
        let address = frame.addr();

        let Ok(key) = self.key.get() else {
            log::warn!("DataWrite: no key programmed");
            return RpmbOpResult::NoAuthKey.into();
        };
        if !reliable {
            log::debug!("DataWrite: not sent as a reliable write");
            return RpmbOpResult::GeneralFailure.into();
        }
        if block_count == 0
            || block_count > self.config.max_wr_cnt
            || usize::from(block_count) != frames.len()
        {
            log::debug!(
                "DataWrite: invalid block_count {} for {} frames",
                block_count,
                frames.len()
            );
            return RpmbOpResult::GeneralFailure.into();
        }
        if self.write_counter == u32::MAX {
            log::debug!("DataWrite: write counter expired");
            return RpmbResult(RpmbResult::COUNTER_EXPIRED | u16::from(RpmbOpResult::WriteFailure));
        }
        if !self.in_range(address, block_count) {
            log::debug!("DataWrite: address {} + {} over capacity", address, block_count);
            return RpmbOpResult::AddrFailure.into();
        }
        if verify_frames(frames, &key).is_err() {
            return RpmbOpResult::AuthFailure.into();
        }
        if frames[frames.len() - 1].write_counter() != self.write_counter {
            log::debug!(
                "DataWrite: counter {} != {}",
                frames[frames.len() - 1].write_counter(),
                self.write_counter
            );
            return RpmbOpResult::CountFailure.into();
        }

        // At this point we have a valid authenticated write request. The
        // image in memory and the counter only change once the backing store
        // holds the new blocks.
        let offset = usize::from(address) * RPMB_BLOCK_SIZE;
        let blocks: Vec<u8> = frames.iter().flat_map(|frame| frame.data).collect();
        if let Err(err) = self.persist_blocks(offset, &blocks) {
            log::warn!("DataWrite: failed to sync update: {}", err);
            return RpmbOpResult::WriteFailure.into();
        }
        log::debug!(
            "DataWrite: wrote blocks {}..{}",
            address,
            usize::from(address) + frames.len()
        );
        self.flash_image[offset..][..blocks.len()].copy_from_slice(&blocks);
        self.write_counter += 1;
        log::debug!("DataWrite: successful, write_counter={}", self.write_counter);

        RpmbOpResult::Ok.into()
    }

    // 5.12.6.1.4 Device Requirements: Device Operation: Data Read
    fn data_read(&self, frame: &RpmbFrame) -> Result<Vec<RpmbFrame>> {
        let block_count = frame.block_count();
        let address = frame.addr();
        let mut resp = RpmbFrame::default();
        resp.nonce = frame.nonce;
        resp.set_req_resp(RpmbResponseKind::DataRead.into());
        resp.set_addr(address);
        resp.set_block_count(block_count);

        let key = match self.key.get() {
            Ok(key) => key,
            Err(_) => {
                log::warn!("DataRead: no key programmed");
                resp.set_result(RpmbOpResult::NoAuthKey.into());
                return Ok(vec![resp]);
            }
        };
        let failure = if block_count == 0 || block_count > self.config.max_rd_cnt {
            log::debug!("DataRead: invalid block count {}", block_count);
            Some(RpmbOpResult::GeneralFailure)
        } else if !self.in_range(address, block_count) {
            log::debug!("DataRead: address {} + {} over capacity", address, block_count);
            Some(RpmbOpResult::AddrFailure)
        } else {
            None
        };
        if let Some(result) = failure {
            resp.set_result(result.into());
            sign_frame(&mut resp, &key);
            return Ok(vec![resp]);
        }

        let offset = usize::from(address) * RPMB_BLOCK_SIZE;
        let mut frames: Vec<RpmbFrame> = self.flash_image[offset..]
            .chunks_exact(RPMB_BLOCK_SIZE)
            .take(block_count.into())
            .map(|block| {
                let mut frame = resp;
                frame.data.copy_from_slice(block);
                frame
            })
            .collect();
        log::debug!("DataRead: read {} blocks from offset {}", frames.len(), offset);
        sign_frames(&mut frames, &key)?;
        Ok(frames)
    }

    fn result_read(&mut self) -> RpmbFrame {
        let mut resp = RpmbFrame::default();
        match std::mem::take(&mut self.last_result) {
            LastResult::None => {
                resp.set_result(RpmbOpResult::GeneralFailure.into());
            }
            LastResult::ProgramKey { result } => {
                resp.set_result(result);
                resp.set_req_resp(RpmbResponseKind::ProgramKey.into());
            }
            LastResult::DataWrite { result, address } => {
                resp.set_result(result);
                resp.set_req_resp(RpmbResponseKind::DataWrite.into());
                resp.set_write_counter(self.write_counter);
                resp.set_addr(address);
            }
        }
        if let Ok(key) = self.key.get() {
            sign_frame(&mut resp, &key);
        }
        log::debug!(
            "ResultRead: result = {} req_resp = {:#06x}",
            resp.result(),
            resp.req_resp()
        );
        resp
    }

    fn fill_responses(&mut self, frames: &mut [RpmbFrame]) -> Result<()> {
        let responses = std::mem::take(&mut self.responses);
        match responses.as_slice() {
            [] => Err(RpmbError::FrameCount {
                expected: frames.len(),
                found: 0,
            }),
            [single] => {
                frames.fill(*single);
                Ok(())
            }
            many if many.len() == frames.len() => {
                frames.copy_from_slice(many);
                Ok(())
            }
            many => Err(RpmbError::FrameCount {
                expected: frames.len(),
                found: many.len(),
            }),
        }
    }
}

impl RpmbTransport for RpmbEmulator {
    fn capabilities(&mut self) -> Result<Option<RpmbCapabilities>> {
        Ok(Some(RpmbCapabilities {
            device_type: RpmbDeviceType::from(RPMB_DEVICE_TYPE_EMULATED),
            target: 0,
            block_size: 1,
            wr_cnt_max: self.config.max_wr_cnt,
            rd_cnt_max: self.config.max_rd_cnt,
            auth_method: 0,
            capacity: self.capacity(),
        }))
    }

    fn exec_sequence(&mut self, cmds: &mut [RpmbCmd<'_>]) -> Result<()> {
        for cmd in cmds.iter_mut() {
            match cmd {
                RpmbCmd::Write { frames, reliable } => self.handle_request(frames, *reliable)?,
                RpmbCmd::Read { frames } => self.fill_responses(frames)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::mac::compute_mac;

    const KEY: KeySlice = [0x11; RPMB_KEY_MAC_SIZE];

    fn emulator(dir: &tempfile::TempDir, blocks: usize, with_key: bool) -> RpmbEmulator {
        let flash_path = dir.path().join("flash.img");
        let key_path = dir.path().join("key");
        File::create(&flash_path)
            .unwrap()
            .write_all(&vec![0; blocks * RPMB_BLOCK_SIZE])
            .unwrap();
        if with_key {
            std::fs::write(&key_path, KEY).unwrap();
        }
        RpmbEmulator::new(EmulatorConfig::new(flash_path, key_path)).unwrap()
    }

    fn exchange(
        emu: &mut RpmbEmulator,
        frames_in: &[RpmbFrame],
        reliable: bool,
        count_out: usize,
    ) -> Vec<RpmbFrame> {
        let mut frames_out = alloc_frames(count_out);
        let result_read = [RpmbFrame::request(RpmbRequestKind::ResultRead)];
        let mut cmds = vec![RpmbCmd::Write {
            frames: frames_in,
            reliable,
        }];
        let req = RpmbRequestKind::try_from(frames_in[0].req_resp()).unwrap();
        if req.needs_result_read() {
            cmds.push(RpmbCmd::Write {
                frames: &result_read,
                reliable: false,
            });
        }
        cmds.push(RpmbCmd::Read {
            frames: &mut frames_out,
        });
        emu.exec_sequence(&mut cmds).unwrap();
        drop(cmds);
        frames_out
    }

    #[test]
    fn program_key_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut emu = emulator(&dir, 4, false);
        assert!(!emu.is_key_programmed());

        let mut req = RpmbFrame::request(RpmbRequestKind::ProgramKey);
        req.key_mac = KEY;
        req.set_block_count(1);

        let resp = exchange(&mut emu, &[req], true, 1);
        assert_eq!(resp[0].req_resp(), 0x0100);
        assert!(resp[0].result().is_ok());
        assert_eq!(std::fs::read(dir.path().join("key")).unwrap(), KEY);

        let resp = exchange(&mut emu, &[req], true, 1);
        assert_eq!(resp[0].result().status(), Some(RpmbOpResult::WriteFailure));
    }

    #[test]
    fn program_key_needs_reliable_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut emu = emulator(&dir, 4, false);
        let mut req = RpmbFrame::request(RpmbRequestKind::ProgramKey);
        req.set_block_count(1);
        let resp = exchange(&mut emu, &[req], false, 1);
        assert_eq!(resp[0].result().status(), Some(RpmbOpResult::GeneralFailure));
        assert!(!emu.is_key_programmed());
    }

    #[test]
    fn counter_without_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut emu = emulator(&dir, 4, false);
        let resp = exchange(
            &mut emu,
            &[RpmbFrame::request(RpmbRequestKind::GetWriteCounter)],
            false,
            1,
        );
        assert_eq!(resp[0].result().status(), Some(RpmbOpResult::NoAuthKey));
    }

    #[test]
    fn counter_echoes_nonce_and_is_signed() {
        let dir = tempfile::tempdir().unwrap();
        let mut emu = emulator(&dir, 4, true);
        let mut req = RpmbFrame::request(RpmbRequestKind::GetWriteCounter);
        req.nonce = [0xA5; RPMB_NONCE_SIZE];
        let resp = exchange(&mut emu, &[req], false, 1);
        assert!(resp[0].result().is_ok());
        assert_eq!(resp[0].nonce, req.nonce);
        assert_eq!(resp[0].req_resp(), 0x0200);
        verify_frames(&resp, &RpmbKey::new(KEY)).unwrap();
    }

    fn signed_write(address: u16, counter: u32, blocks: &[u8]) -> Vec<RpmbFrame> {
        let count = blocks.len() / RPMB_BLOCK_SIZE;
        let mut frames: Vec<RpmbFrame> = blocks
            .chunks_exact(RPMB_BLOCK_SIZE)
            .map(|block| {
                let mut frame = RpmbFrame::request(RpmbRequestKind::DataWrite);
                frame.data.copy_from_slice(block);
                frame.set_addr(address);
                frame.set_block_count(count as u16);
                frame.set_write_counter(counter);
                frame
            })
            .collect();
        sign_frames(&mut frames, &RpmbKey::new(KEY)).unwrap();
        frames
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut emu = emulator(&dir, 8, true);
        let data: Vec<u8> = (0..2 * RPMB_BLOCK_SIZE).map(|i| i as u8).collect();

        let resp = exchange(&mut emu, &signed_write(3, 0, &data), true, 1);
        assert!(resp[0].result().is_ok(), "{}", resp[0].result());
        assert_eq!(resp[0].req_resp(), 0x0300);
        assert_eq!(resp[0].addr(), 3);
        assert_eq!(resp[0].write_counter(), 1);
        verify_frames(&resp, &RpmbKey::new(KEY)).unwrap();
        assert_eq!(emu.write_counter(), 1);
        assert_eq!(&emu.flash_image()[3 * RPMB_BLOCK_SIZE..][..data.len()], &data[..]);
        let image = std::fs::read(dir.path().join("flash.img")).unwrap();
        assert_eq!(&image[3 * RPMB_BLOCK_SIZE..][..data.len()], &data[..]);

        let mut req = RpmbFrame::request(RpmbRequestKind::DataRead);
        req.set_addr(3);
        req.set_block_count(2);
        req.nonce = [9; RPMB_NONCE_SIZE];
        let resp = exchange(&mut emu, &[req], false, 2);
        assert_eq!(&resp[0].data[..], &data[..RPMB_BLOCK_SIZE]);
        assert_eq!(&resp[1].data[..], &data[RPMB_BLOCK_SIZE..]);
        assert_eq!(resp[1].nonce, req.nonce);
        assert_eq!(resp[1].key_mac, compute_mac(&resp, &RpmbKey::new(KEY)));
    }

    #[test]
    fn write_with_stale_counter() {
        let dir = tempfile::tempdir().unwrap();
        let mut emu = emulator(&dir, 4, true);
        let data = [0xFF; RPMB_BLOCK_SIZE];
        let resp = exchange(&mut emu, &signed_write(0, 7, &data), true, 1);
        assert_eq!(resp[0].result().status(), Some(RpmbOpResult::CountFailure));
        assert_eq!(emu.write_counter(), 0);
        assert!(emu.flash_image().iter().all(|b| *b == 0));
    }

    #[test]
    fn write_with_bad_mac() {
        let dir = tempfile::tempdir().unwrap();
        let mut emu = emulator(&dir, 4, true);
        let mut frames = signed_write(0, 0, &[0xFF; RPMB_BLOCK_SIZE]);
        frames[0].data[5] ^= 1;
        let resp = exchange(&mut emu, &frames, true, 1);
        assert_eq!(resp[0].result().status(), Some(RpmbOpResult::AuthFailure));
    }

    #[test]
    fn write_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let mut emu = emulator(&dir, 4, true);
        let resp = exchange(&mut emu, &signed_write(4, 0, &[1; RPMB_BLOCK_SIZE]), true, 1);
        assert_eq!(resp[0].result().status(), Some(RpmbOpResult::AddrFailure));
    }

    #[test]
    fn write_with_expired_counter() {
        let dir = tempfile::tempdir().unwrap();
        let flash_path = dir.path().join("flash.img");
        let key_path = dir.path().join("key");
        std::fs::write(&flash_path, [0; 4 * RPMB_BLOCK_SIZE]).unwrap();
        std::fs::write(&key_path, KEY).unwrap();
        let mut emu = RpmbEmulator::new(EmulatorConfig {
            initial_counter: u32::MAX,
            ..EmulatorConfig::new(flash_path, key_path)
        })
        .unwrap();

        let resp = exchange(&mut emu, &signed_write(0, u32::MAX, &[1; RPMB_BLOCK_SIZE]), true, 1);
        assert!(resp[0].result().counter_expired());
        assert_eq!(resp[0].result().to_string(), "COUNTER_EXPIRE:WRITE");
    }

    #[test]
    fn write_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let mut emu = emulator(&dir, 4, true);
        std::fs::remove_file(dir.path().join("flash.img")).unwrap();

        let resp = exchange(&mut emu, &signed_write(1, 0, &[0xAB; RPMB_BLOCK_SIZE]), true, 1);
        assert_eq!(resp[0].result().status(), Some(RpmbOpResult::WriteFailure));
        assert_eq!(resp[0].write_counter(), 0);
        assert_eq!(emu.write_counter(), 0);
        assert!(emu.flash_image().iter().all(|b| *b == 0));
    }

    #[test]
    fn key_set_needs_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let flash_path = dir.path().join("flash.img");
        std::fs::write(&flash_path, [0; RPMB_BLOCK_SIZE]).unwrap();
        let config = EmulatorConfig {
            key_set: true,
            ..EmulatorConfig::new(flash_path, dir.path().join("key"))
        };
        assert!(matches!(RpmbEmulator::new(config.clone()), Err(RpmbError::Io(_))));

        std::fs::write(&config.key_path, KEY).unwrap();
        let emu = RpmbEmulator::new(config).unwrap();
        assert!(emu.is_key_programmed());
    }

    #[test]
    fn read_over_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut emu = emulator(&dir, 64, true);
        let mut req = RpmbFrame::request(RpmbRequestKind::DataRead);
        req.set_block_count(DEFAULT_MAX_RD_CNT + 1);
        let resp = exchange(&mut emu, &[req], false, usize::from(DEFAULT_MAX_RD_CNT) + 1);
        assert!(resp
            .iter()
            .all(|f| f.result().status() == Some(RpmbOpResult::GeneralFailure)));
    }

    #[test]
    fn result_read_without_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut emu = emulator(&dir, 4, true);
        let resp = exchange(
            &mut emu,
            &[RpmbFrame::request(RpmbRequestKind::ResultRead)],
            false,
            1,
        );
        assert_eq!(resp[0].result().status(), Some(RpmbOpResult::GeneralFailure));
    }

    #[test]
    fn short_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let flash_path = dir.path().join("flash.img");
        let key_path = dir.path().join("key");
        std::fs::write(&flash_path, [0; RPMB_BLOCK_SIZE]).unwrap();
        std::fs::write(&key_path, [0; 31]).unwrap();
        assert!(matches!(
            RpmbEmulator::new(EmulatorConfig::new(flash_path, key_path)),
            Err(RpmbError::InvalidKeySize(31, 32))
        ));
    }

    #[test]
    fn bad_flash_image() {
        let dir = tempfile::tempdir().unwrap();
        let flash_path = dir.path().join("flash.img");
        std::fs::write(&flash_path, [0; 100]).unwrap();
        assert!(matches!(
            RpmbEmulator::new(EmulatorConfig::new(flash_path, dir.path().join("key"))),
            Err(RpmbError::InvalidFlashImage(_, 100))
        ));
    }

    #[test]
    fn read_without_request() {
        let dir = tempfile::tempdir().unwrap();
        let mut emu = emulator(&dir, 4, true);
        let mut out = alloc_frames(1);
        assert!(matches!(
            emu.exec_sequence(&mut [RpmbCmd::Read { frames: &mut out }]),
            Err(RpmbError::FrameCount {
                expected: 1,
                found: 0
            })
        ));
    }
}
