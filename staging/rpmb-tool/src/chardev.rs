// RPMB command-line client
//
// Copyright 2023 Linaro Ltd. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Transport over the kernel RPMB character device (`/dev/rpmbN`).

use std::{
    fs::File,
    io::Error as IoError,
    path::{Path, PathBuf},
};

use vmm_sys_util::{ioctl::ioctl_with_mut_ref, ioctl_ioc_nr, ioctl_ior_nr, ioctl_iowr_nr};

use crate::{
    io::*,
    transport::{RpmbCapabilities, RpmbCmd, RpmbTransport},
    Result, RpmbError,
};

const RPMB_IOC_TYPE: u32 = 0xB5;
/// The kernel accepts at most this many steps in one sequence.
pub const RPMB_MAX_SEQ_CMDS: usize = 3;

const RPMB_F_WRITE: u32 = 1 << 0;
const RPMB_F_REL_WRITE: u32 = 1 << 1;

#[doc(alias = "rpmb_ioc_cmd")]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct RpmbIocCmd {
    flags: u32,
    nframes: u32,
    frames_ptr: u64,
}

impl From<&mut RpmbCmd<'_>> for RpmbIocCmd {
    fn from(cmd: &mut RpmbCmd<'_>) -> Self {
        match cmd {
            RpmbCmd::Write { frames, reliable } => Self {
                flags: if *reliable {
                    RPMB_F_WRITE | RPMB_F_REL_WRITE
                } else {
                    RPMB_F_WRITE
                },
                nframes: frames.len() as u32,
                frames_ptr: frames.as_ptr() as u64,
            },
            RpmbCmd::Read { frames } => Self {
                flags: 0,
                nframes: frames.len() as u32,
                frames_ptr: frames.as_mut_ptr() as u64,
            },
        }
    }
}

#[doc(alias = "rpmb_ioc_req_cmd")]
#[repr(C)]
#[derive(Debug, Default)]
struct RpmbIocReqCmd {
    req_type: u64,
    icmd: RpmbIocCmd,
    ocmd: RpmbIocCmd,
}

/// Header of the sequence command. The commands follow it in memory.
#[doc(alias = "rpmb_ioc_seq_cmd")]
#[repr(C)]
#[derive(Debug, Default)]
struct RpmbIocSeqCmd {
    num_of_cmds: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct RpmbIocSeq {
    h: RpmbIocSeqCmd,
    cmds: [RpmbIocCmd; RPMB_MAX_SEQ_CMDS],
}

#[doc(alias = "rpmb_ioc_cap_cmd")]
#[repr(C)]
#[derive(Debug, Default)]
struct RpmbIocCapCmd {
    device_type: u16,
    target: u16,
    block_size: u16,
    wr_cnt_max: u16,
    rd_cnt_max: u16,
    auth_method: u16,
    capacity: u16,
    reserved: u16,
}

impl From<RpmbIocCapCmd> for RpmbCapabilities {
    fn from(cap: RpmbIocCapCmd) -> Self {
        Self {
            device_type: cap.device_type.into(),
            target: cap.target,
            block_size: cap.block_size,
            wr_cnt_max: cap.wr_cnt_max,
            rd_cnt_max: cap.rd_cnt_max,
            auth_method: cap.auth_method,
            capacity: cap.capacity,
        }
    }
}

ioctl_iowr_nr!(RPMB_IOC_REQ_CMD, RPMB_IOC_TYPE, 0, RpmbIocReqCmd);
ioctl_iowr_nr!(RPMB_IOC_SEQ_CMD, RPMB_IOC_TYPE, 1, RpmbIocSeqCmd);
ioctl_ior_nr!(RPMB_IOC_CAP_CMD, RPMB_IOC_TYPE, 3, RpmbIocCapCmd);

/// An open RPMB character device. The descriptor is closed on drop.
#[derive(Debug)]
pub struct RpmbChardev {
    path: PathBuf,
    file: File,
}

impl RpmbChardev {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| {
                log::error!("Cannot open: {}: {}.", path.display(), err);
                err
            })?;
        log::debug!("opened RPMB device {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    fn ioctl<T>(&self, op: &'static str, req: std::os::raw::c_ulong, arg: &mut T) -> Result<()> {
        // SAFETY: `arg` is the structure the kernel expects for `req`, and the
        // frame buffers it points to are borrowed for the whole call.
        let ret = unsafe { ioctl_with_mut_ref(&self.file, req, arg) };
        if ret < 0 {
            let source = IoError::last_os_error();
            log::error!("ioctl failure {}: {}.", ret, source);
            return Err(RpmbError::Ioctl { op, source });
        }
        Ok(())
    }
}

impl RpmbTransport for RpmbChardev {
    fn capabilities(&mut self) -> Result<Option<RpmbCapabilities>> {
        let mut cap = RpmbIocCapCmd::default();
        match self.ioctl("RPMB_IOC_CAP_CMD", RPMB_IOC_CAP_CMD(), &mut cap) {
            Ok(()) => Ok(Some(cap.into())),
            Err(RpmbError::Ioctl { source, .. })
                if matches!(source.raw_os_error(), Some(libc::ENOTTY | libc::EINVAL)) =>
            {
                log::debug!("{}: no capabilities query support", self.path.display());
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn exec_sequence(&mut self, cmds: &mut [RpmbCmd<'_>]) -> Result<()> {
        if cmds.is_empty() || cmds.len() > RPMB_MAX_SEQ_CMDS {
            return Err(RpmbError::InvalidSequence(cmds.len()));
        }
        let mut seq = RpmbIocSeq {
            h: RpmbIocSeqCmd {
                num_of_cmds: cmds.len() as u64,
            },
            ..Default::default()
        };
        for (ioc, cmd) in seq.cmds.iter_mut().zip(cmds.iter_mut()) {
            *ioc = cmd.into();
        }
        self.ioctl("RPMB_IOC_SEQ_CMD", RPMB_IOC_SEQ_CMD(), &mut seq)
    }

    fn exec_request(
        &mut self,
        req: RpmbRequestKind,
        frames_in: &[RpmbFrame],
        frames_out: &mut [RpmbFrame],
    ) -> Result<()> {
        let mut icmd = RpmbCmd::Write {
            frames: frames_in,
            reliable: false,
        };
        let mut ocmd = RpmbCmd::Read { frames: frames_out };
        let mut ireq = RpmbIocReqCmd {
            req_type: u16::from(req).into(),
            icmd: (&mut icmd).into(),
            ocmd: (&mut ocmd).into(),
        };
        // The kernel picks the reliable write flag from the request type.
        ireq.icmd.flags = RPMB_F_WRITE;
        self.ioctl("RPMB_IOC_REQ_CMD", RPMB_IOC_REQ_CMD(), &mut ireq)
    }
}
