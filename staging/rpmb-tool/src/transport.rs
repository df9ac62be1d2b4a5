// RPMB command-line client
//
// Copyright 2023 Linaro Ltd. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Boundary between the command engine and whatever carries frames to the
//! device.

use std::fmt;

use crate::{io::*, Result};

/// One step of a frame exchange with the device.
#[derive(Debug)]
pub enum RpmbCmd<'a> {
    /// Send request frames. Reliable writes are required by the device for
    /// key programming and authenticated data writes.
    Write {
        frames: &'a [RpmbFrame],
        reliable: bool,
    },
    /// Retrieve response frames.
    Read { frames: &'a mut [RpmbFrame] },
}

/// How the command engine hands a request to the transport.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CmdMode {
    /// The transport gets the request type and builds the result read itself.
    #[default]
    Request,
    /// The engine spells out every step of the sequence.
    Sequence,
}

/// Device type reported by the capabilities query.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RpmbDeviceType {
    Emmc,
    Ufs,
    Nvme,
    Emulated,
    Unknown(u16),
}

impl From<u16> for RpmbDeviceType {
    fn from(val: u16) -> Self {
        match val {
            1 => Self::Emmc,
            2 => Self::Ufs,
            3 => Self::Nvme,
            0x8000 => Self::Emulated,
            v => Self::Unknown(v),
        }
    }
}

impl fmt::Display for RpmbDeviceType {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Emmc => write!(fmt, "EMMC"),
            Self::Ufs => write!(fmt, "UFS"),
            Self::Nvme => write!(fmt, "NVME"),
            Self::Emulated => write!(fmt, "EMULATED"),
            Self::Unknown(v) => write!(fmt, "unknown({:#06x})", v),
        }
    }
}

/// What the device tells us about itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RpmbCapabilities {
    pub device_type: RpmbDeviceType,
    /// RPMB region (target) id.
    pub target: u16,
    /// Block size in 256 byte frames.
    pub block_size: u16,
    /// Maximum frames per authenticated write, 0 if unknown.
    pub wr_cnt_max: u16,
    /// Maximum frames per authenticated read, 0 if unknown.
    pub rd_cnt_max: u16,
    pub auth_method: u16,
    /// Size of the region in 128KiB units.
    pub capacity: u16,
}

impl fmt::Display for RpmbCapabilities {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        writeln!(fmt, "DEVICE TYPE  = {}", self.device_type)?;
        writeln!(fmt, "TARGET       = {}", self.target)?;
        writeln!(fmt, "BLOCK SIZE   = {}", self.block_size)?;
        writeln!(fmt, "WR_CNT_MAX   = {}", self.wr_cnt_max)?;
        writeln!(fmt, "RD_CNT_MAX   = {}", self.rd_cnt_max)?;
        writeln!(fmt, "AUTH_METHOD  = {}", self.auth_method)?;
        write!(fmt, "CAPACITY     = {} x 128KiB", self.capacity)
    }
}

pub trait RpmbTransport {
    /// Device limits, `None` when the transport can't tell.
    fn capabilities(&mut self) -> Result<Option<RpmbCapabilities>>;

    /// Run up to three steps as one exchange, in order.
    fn exec_sequence(&mut self, cmds: &mut [RpmbCmd<'_>]) -> Result<()>;

    /// Run a whole request: send `frames_in`, fetch the result when the
    /// request kind needs it, and read back `frames_out`.
    fn exec_request(
        &mut self,
        req: RpmbRequestKind,
        frames_in: &[RpmbFrame],
        frames_out: &mut [RpmbFrame],
    ) -> Result<()> {
        let result_read = [RpmbFrame::request(RpmbRequestKind::ResultRead)];
        self.exec_sequence(&mut request_sequence(req, frames_in, &result_read, frames_out))
    }
}

/// The steps of a `req` exchange: write `frames_in`, reliably when the
/// request changes device state, send `result_read` when the result has to be
/// fetched, then read into `frames_out`.
pub fn request_sequence<'a>(
    req: RpmbRequestKind,
    frames_in: &'a [RpmbFrame],
    result_read: &'a [RpmbFrame],
    frames_out: &'a mut [RpmbFrame],
) -> Vec<RpmbCmd<'a>> {
    let reliable = req.needs_result_read();
    let mut cmds = Vec::with_capacity(3);
    cmds.push(RpmbCmd::Write {
        frames: frames_in,
        reliable,
    });
    if reliable {
        cmds.push(RpmbCmd::Write {
            frames: result_read,
            reliable: false,
        });
    }
    cmds.push(RpmbCmd::Read { frames: frames_out });
    cmds
}

impl<T: RpmbTransport + ?Sized> RpmbTransport for &mut T {
    fn capabilities(&mut self) -> Result<Option<RpmbCapabilities>> {
        (**self).capabilities()
    }

    fn exec_sequence(&mut self, cmds: &mut [RpmbCmd<'_>]) -> Result<()> {
        (**self).exec_sequence(cmds)
    }

    fn exec_request(
        &mut self,
        req: RpmbRequestKind,
        frames_in: &[RpmbFrame],
        frames_out: &mut [RpmbFrame],
    ) -> Result<()> {
        (**self).exec_request(req, frames_in, frames_out)
    }
}
