// RPMB command-line client
//
// Copyright 2023 Linaro Ltd. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

#![allow(dead_code)]

use std::{collections::VecDeque, path::PathBuf};

use rpmb_tool::{
    io::*,
    mac::sign_frames,
    transport::{RpmbCapabilities, RpmbCmd, RpmbTransport},
    Result,
};

pub const KEY: KeySlice = [0x5A; RPMB_KEY_MAC_SIZE];

pub fn key() -> RpmbKey {
    RpmbKey::new(KEY)
}

/// Builds the response frames for one exchange from the request frames.
pub type Responder = Box<dyn FnMut(&[RpmbFrame], &mut [RpmbFrame])>;

/// A device that answers every exchange with the next scripted responder and
/// records what it was sent.
#[derive(Default)]
pub struct Scripted {
    responders: VecDeque<Responder>,
    pub requests: Vec<Vec<RpmbFrame>>,
    pub caps: Option<RpmbCapabilities>,
}

impl Scripted {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, responder: impl FnMut(&[RpmbFrame], &mut [RpmbFrame]) + 'static) -> Self {
        self.responders.push_back(Box::new(responder));
        self
    }

    pub fn exchanges(&self) -> usize {
        self.requests.len()
    }
}

impl RpmbTransport for Scripted {
    fn capabilities(&mut self) -> Result<Option<RpmbCapabilities>> {
        Ok(self.caps)
    }

    fn exec_sequence(&mut self, cmds: &mut [RpmbCmd<'_>]) -> Result<()> {
        let mut request: Option<Vec<RpmbFrame>> = None;
        for cmd in cmds.iter_mut() {
            match cmd {
                RpmbCmd::Write { frames, .. } => {
                    request.get_or_insert_with(|| frames.to_vec());
                }
                RpmbCmd::Read { frames } => {
                    let request = request.take().unwrap_or_default();
                    let mut responder = self
                        .responders
                        .pop_front()
                        .expect("no response scripted for this exchange");
                    responder(&request, frames);
                    self.requests.push(request);
                }
            }
        }
        Ok(())
    }
}

/// Answer GET_WRITE_COUNTER with `counter`, echoing the request nonce and
/// signing with `key` when given.
pub fn counter(counter: u32, key: Option<KeySlice>) -> impl FnMut(&[RpmbFrame], &mut [RpmbFrame]) {
    move |req, out| {
        out[0].nonce = req[0].nonce;
        out[0].set_req_resp(RpmbRequestKind::GetWriteCounter.response_code());
        out[0].set_write_counter(counter);
        if let Some(key) = key {
            sign_frames(&mut out[..1], &RpmbKey::new(key)).unwrap();
        }
    }
}

/// Answer READ_DATA with `blocks`, signed with `key`.
pub fn blocks(
    blocks: Vec<[u8; RPMB_BLOCK_SIZE]>,
    key: KeySlice,
) -> impl FnMut(&[RpmbFrame], &mut [RpmbFrame]) {
    move |req, out| {
        assert_eq!(out.len(), blocks.len());
        for (frame, block) in out.iter_mut().zip(&blocks) {
            frame.data = *block;
            frame.nonce = req[0].nonce;
            frame.set_addr(req[0].addr());
            frame.set_block_count(req[0].block_count());
            frame.set_req_resp(RpmbRequestKind::DataRead.response_code());
        }
        sign_frames(out, &RpmbKey::new(key)).unwrap();
    }
}

/// Answer a WRITE_DATA result read with `addr` and `counter`, signed with
/// `key`.
pub fn written(
    addr: u16,
    counter: u32,
    key: KeySlice,
) -> impl FnMut(&[RpmbFrame], &mut [RpmbFrame]) {
    move |_, out| {
        out[0].set_req_resp(RpmbRequestKind::DataWrite.response_code());
        out[0].set_addr(addr);
        out[0].set_write_counter(counter);
        sign_frames(&mut out[..1], &RpmbKey::new(key)).unwrap();
    }
}

/// A zeroed flash image of `blocks` blocks inside `dir`.
pub fn flash_image(dir: &tempfile::TempDir, blocks: usize) -> PathBuf {
    let path = dir.path().join("flash.img");
    std::fs::write(&path, vec![0; blocks * RPMB_BLOCK_SIZE]).unwrap();
    path
}
