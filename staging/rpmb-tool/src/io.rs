// RPMB command-line client
//
// Copyright 2023 Linaro Ltd. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! RPMB frame layout and the codes carried in it.

use std::{convert::TryFrom, fmt, mem::size_of};

use data_encoding::HEXUPPER;
use vm_memory::{Be16, Be32, ByteValued};
use zeroize::Zeroizing;

use crate::RpmbError;

pub const RPMB_KEY_MAC_SIZE: usize = 32;
pub const RPMB_BLOCK_SIZE: usize = 256;
pub const RPMB_NONCE_SIZE: usize = 16;
pub const RPMB_STUFF_SIZE: usize = 196;
pub const RPMB_FRAME_SIZE: usize = size_of::<RpmbFrame>();
/// Bytes covered by the MAC in every frame: `data` up to and including
/// `req_resp`.
pub const RPMB_MAC_REGION_SIZE: usize = RPMB_FRAME_SIZE - RPMB_MAC_REGION_OFFSET;
const RPMB_MAC_REGION_OFFSET: usize = RPMB_STUFF_SIZE + RPMB_KEY_MAC_SIZE;

pub type KeySlice = [u8; RPMB_KEY_MAC_SIZE];
pub type Nonce = [u8; RPMB_NONCE_SIZE];

/// Authentication key, wiped from memory on drop.
#[derive(Clone)]
pub struct RpmbKey(Zeroizing<KeySlice>);

impl RpmbKey {
    pub fn new(key: KeySlice) -> Self {
        Self(Zeroizing::new(key))
    }

    pub fn as_bytes(&self) -> &KeySlice {
        &self.0
    }
}

impl TryFrom<&[u8]> for RpmbKey {
    type Error = RpmbError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let key: KeySlice = bytes
            .try_into()
            .map_err(|_| RpmbError::InvalidKeySize(bytes.len(), RPMB_KEY_MAC_SIZE))?;
        Ok(Self::new(key))
    }
}

impl fmt::Debug for RpmbKey {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_tuple(stringify!(RpmbKey))
            .field(&"<redacted>")
            .finish()
    }
}

macro_rules! impl_try_from_int {
    ($t:ty, $($var:tt),+) => {
        impl std::convert::TryFrom<u16> for $t {
            type Error = crate::RpmbError;

            fn try_from(val: u16) -> Result<Self, Self::Error> {
                Ok(match val {
                    $(v if v == Self::$var as u16 => Self::$var),*,
                      _ => return Err(crate::RpmbError::UnknownRequest(val)),
                })
            }
        }

        impl std::convert::TryFrom<Be16> for $t {
            type Error = crate::RpmbError;

            fn try_from(val: Be16) -> Result<Self, Self::Error> {
                Self::try_from(u16::from(val))
            }
        }

        impl From<$t> for u16 {
            fn from(r: $t) -> Self {
                r as Self
            }
        }

        impl From<$t> for Be16 {
            fn from(r: $t) -> Self {
                (r as u16).into()
            }
        }
    };
}

/// RPMB Request Types
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RpmbRequestKind {
    #[doc(alias = "RPMB_PROGRAM_KEY")]
    ProgramKey = 0x0001,
    #[doc(alias = "RPMB_GET_WRITE_COUNTER")]
    GetWriteCounter = 0x0002,
    #[doc(alias = "RPMB_WRITE_DATA")]
    DataWrite = 0x0003,
    #[doc(alias = "RPMB_READ_DATA")]
    DataRead = 0x0004,
    #[doc(alias = "RPMB_RESULT_READ")]
    ResultRead = 0x0005,
}

impl_try_from_int!(
    RpmbRequestKind,
    ProgramKey,
    GetWriteCounter,
    DataWrite,
    DataRead,
    ResultRead
);

impl RpmbRequestKind {
    /// Response code the device answers this request with.
    #[doc(alias = "RPMB_REQ2RESP")]
    pub const fn response_code(self) -> u16 {
        (self as u16) << 8
    }

    /// Whether the device reports the outcome only through a follow-up
    /// `RESULT_READ` request, and wants the request sent as a reliable write.
    pub const fn needs_result_read(self) -> bool {
        matches!(self, Self::ProgramKey | Self::DataWrite)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::ProgramKey => "PROGRAM_KEY",
            Self::GetWriteCounter => "GET_WRITE_COUNTER",
            Self::DataWrite => "WRITE_DATA",
            Self::DataRead => "READ_DATA",
            Self::ResultRead => "RESULT_READ",
        }
    }
}

impl fmt::Display for RpmbRequestKind {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(self.name())
    }
}

/// RPMB Response Types
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RpmbResponseKind {
    #[doc(alias = "RPMB_RESP_PROGRAM_KEY")]
    ProgramKey = 0x0100,
    #[doc(alias = "RPMB_RESP_GET_COUNTER")]
    GetCounter = 0x0200,
    #[doc(alias = "RPMB_RESP_DATA_WRITE")]
    DataWrite = 0x0300,
    #[doc(alias = "RPMB_RESP_DATA_READ")]
    DataRead = 0x0400,
}

impl_try_from_int!(RpmbResponseKind, ProgramKey, GetCounter, DataWrite, DataRead);

impl RpmbResponseKind {
    /// Request this response answers.
    #[doc(alias = "RPMB_RESP2REQ")]
    pub fn request(self) -> RpmbRequestKind {
        match self {
            Self::ProgramKey => RpmbRequestKind::ProgramKey,
            Self::GetCounter => RpmbRequestKind::GetWriteCounter,
            Self::DataWrite => RpmbRequestKind::DataWrite,
            Self::DataRead => RpmbRequestKind::DataRead,
        }
    }
}

/// Low nibble of the result field.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RpmbOpResult {
    #[doc(alias = "RPMB_ERR_OK")]
    Ok = 0x0000,
    #[doc(alias = "RPMB_ERR_GENERAL")]
    GeneralFailure = 0x0001,
    #[doc(alias = "RPMB_ERR_AUTH")]
    AuthFailure = 0x0002,
    #[doc(alias = "RPMB_ERR_COUNTER")]
    CountFailure = 0x0003,
    #[doc(alias = "RPMB_ERR_ADDRESS")]
    AddrFailure = 0x0004,
    #[doc(alias = "RPMB_ERR_WRITE")]
    WriteFailure = 0x0005,
    #[doc(alias = "RPMB_ERR_READ")]
    ReadFailure = 0x0006,
    #[doc(alias = "RPMB_ERR_NO_KEY")]
    NoAuthKey = 0x0007,
}

impl RpmbOpResult {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::GeneralFailure => "GENERAL",
            Self::AuthFailure => "AUTH",
            Self::CountFailure => "COUNTER",
            Self::AddrFailure => "ADDRESS",
            Self::WriteFailure => "WRITE",
            Self::ReadFailure => "READ",
            Self::NoAuthKey => "NO_KEY",
        }
    }
}

impl From<RpmbOpResult> for u16 {
    fn from(r: RpmbOpResult) -> Self {
        r as Self
    }
}

/// Raw result field of a response frame: a status in the low nibble, plus the
/// write counter expiry flag.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RpmbResult(pub u16);

impl RpmbResult {
    #[doc(alias = "RPMB_ERR_COUNTER_EXPIRED")]
    pub const COUNTER_EXPIRED: u16 = 0x0080;
    const STATUS_MASK: u16 = 0x000F;

    pub const fn is_ok(self) -> bool {
        self.0 == RpmbOpResult::Ok as u16
    }

    pub const fn counter_expired(self) -> bool {
        self.0 & Self::COUNTER_EXPIRED != 0
    }

    /// Decoded status, `None` for codes outside the known set.
    pub const fn status(self) -> Option<RpmbOpResult> {
        Some(match self.0 & Self::STATUS_MASK {
            0 => RpmbOpResult::Ok,
            1 => RpmbOpResult::GeneralFailure,
            2 => RpmbOpResult::AuthFailure,
            3 => RpmbOpResult::CountFailure,
            4 => RpmbOpResult::AddrFailure,
            5 => RpmbOpResult::WriteFailure,
            6 => RpmbOpResult::ReadFailure,
            7 => RpmbOpResult::NoAuthKey,
            _ => return None,
        })
    }
}

impl From<RpmbOpResult> for RpmbResult {
    fn from(r: RpmbOpResult) -> Self {
        Self(r.into())
    }
}

impl fmt::Display for RpmbResult {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self.status() {
            None => fmt.write_str("unknown"),
            Some(status) if self.counter_expired() => {
                write!(fmt, "COUNTER_EXPIRE:{}", status.name())
            }
            Some(status) => fmt.write_str(status.name()),
        }
    }
}

/// JEDEC RPMB data frame, as exchanged with the kernel.
#[doc(alias = "rpmb_frame")]
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct RpmbFrame {
    pub stuff: [u8; RPMB_STUFF_SIZE],
    pub key_mac: [u8; RPMB_KEY_MAC_SIZE],
    pub data: [u8; RPMB_BLOCK_SIZE],
    pub nonce: Nonce,
    /* remaining fields are big-endian */
    write_counter: Be32,
    addr: Be16,
    block_count: Be16,
    result: Be16,
    req_resp: Be16,
}

impl Default for RpmbFrame {
    fn default() -> Self {
        Self {
            stuff: [0; RPMB_STUFF_SIZE],
            key_mac: [0; RPMB_KEY_MAC_SIZE],
            data: [0; RPMB_BLOCK_SIZE],
            nonce: [0; RPMB_NONCE_SIZE],
            write_counter: 0.into(),
            addr: 0.into(),
            block_count: 0.into(),
            result: 0.into(),
            req_resp: 0.into(),
        }
    }
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for RpmbFrame {}

impl RpmbFrame {
    /// A zeroed frame carrying only a request code.
    pub fn request(req: RpmbRequestKind) -> Self {
        let mut frame = Self::default();
        frame.set_req_resp(req.into());
        frame
    }

    pub fn encode(&self) -> [u8; RPMB_FRAME_SIZE] {
        let mut bytes = [0; RPMB_FRAME_SIZE];
        bytes.copy_from_slice(self.as_slice());
        bytes
    }

    pub fn decode(bytes: &[u8; RPMB_FRAME_SIZE]) -> Self {
        let mut frame = Self::default();
        frame.as_mut_slice().copy_from_slice(bytes);
        frame
    }

    /// The bytes covered by the MAC.
    pub fn mac_region(&self) -> &[u8] {
        &self.as_slice()[RPMB_MAC_REGION_OFFSET..]
    }

    // The integer fields are unaligned, so they are always copied out
    // instead of referenced.

    pub fn write_counter(&self) -> u32 {
        self.write_counter.into()
    }

    pub fn set_write_counter(&mut self, val: u32) {
        self.write_counter = val.into();
    }

    pub fn addr(&self) -> u16 {
        self.addr.into()
    }

    pub fn set_addr(&mut self, val: u16) {
        self.addr = val.into();
    }

    pub fn block_count(&self) -> u16 {
        self.block_count.into()
    }

    pub fn set_block_count(&mut self, val: u16) {
        self.block_count = val.into();
    }

    pub fn result(&self) -> RpmbResult {
        RpmbResult(self.result.into())
    }

    pub fn set_result(&mut self, val: RpmbResult) {
        self.result = val.0.into();
    }

    pub fn req_resp(&self) -> u16 {
        self.req_resp.into()
    }

    pub fn set_req_resp(&mut self, val: u16) {
        self.req_resp = val.into();
    }

    /// Log every field of the frame at debug level.
    pub fn dump(&self, title: &str) {
        if !log::log_enabled!(log::Level::Debug) {
            return;
        }
        let req_resp = self.req_resp();
        let op = RpmbRequestKind::try_from(req_resp)
            .or_else(|_| RpmbResponseKind::try_from(req_resp).map(RpmbResponseKind::request))
            .map_or("unknown", RpmbRequestKind::name);
        log::debug!("--------------- {} ---------------", title);
        log::debug!("key_mac: {}", HEXUPPER.encode(&self.key_mac));
        for (i, chunk) in self.data.chunks(32).enumerate() {
            log::debug!("data[{:03}]: {}", i * 32, HEXUPPER.encode(chunk));
        }
        log::debug!("nonce: {}", HEXUPPER.encode(&self.nonce));
        log::debug!("write_counter: {}", self.write_counter());
        log::debug!("address: {:#06x}", self.addr());
        log::debug!("block_count: {}", self.block_count());
        log::debug!("result {}:{:#06x}", self.result(), self.result().0);
        log::debug!("req_resp {}:{:#06x}", op, req_resp);
        log::debug!("--------------- End ---------------");
    }
}

impl PartialEq for RpmbFrame {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for RpmbFrame {}

impl fmt::Debug for RpmbFrame {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct(stringify!(RpmbFrame))
            .field("key_mac", &HEXUPPER.encode(&self.key_mac))
            .field("nonce", &HEXUPPER.encode(&self.nonce))
            .field("write_counter", &self.write_counter())
            .field("addr", &self.addr())
            .field("block_count", &self.block_count())
            .field("result", &self.result())
            .field("req_resp", &format_args!("{:#06x}", self.req_resp()))
            .finish_non_exhaustive()
    }
}

/// Zeroed frames for an exchange of `count` frames. A count of zero still gets
/// one frame, which is what a bare result round trip uses.
pub fn alloc_frames(count: usize) -> Vec<RpmbFrame> {
    vec![RpmbFrame::default(); count.max(1)]
}

pub fn frames_as_bytes(frames: &[RpmbFrame]) -> &[u8] {
    // SAFETY: RpmbFrame is ByteValued with an alignment of one, so a slice of
    // frames is a valid slice of bytes of the same total size.
    unsafe {
        std::slice::from_raw_parts(frames.as_ptr().cast::<u8>(), std::mem::size_of_val(frames))
    }
}

pub fn frames_from_bytes(bytes: &[u8]) -> Vec<RpmbFrame> {
    assert_eq!(
        bytes.len() % RPMB_FRAME_SIZE,
        0,
        "buffer of {} bytes is not a whole number of RPMB frames",
        bytes.len()
    );
    bytes
        .chunks_exact(RPMB_FRAME_SIZE)
        .map(|chunk| {
            let mut frame = RpmbFrame::default();
            frame.as_mut_slice().copy_from_slice(chunk);
            frame
        })
        .collect()
}
