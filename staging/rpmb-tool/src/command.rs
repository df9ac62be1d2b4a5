// RPMB command-line client
//
// Copyright 2023 Linaro Ltd. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! The RPMB operations: key programming, write counter retrieval and
//! authenticated block reads and writes.
//!
//! Every operation sends its request frames, lets the transport fetch the
//! result when the request kind needs it, receives the response frames and
//! validates them before anything from the response is handed to the caller.

use std::io::{Read, Write};

use data_encoding::HEXUPPER;
use rand::{rngs::OsRng, RngCore};

use crate::{
    io::*,
    mac::{sign_frames, verify_frames},
    transport::{request_sequence, CmdMode, RpmbCapabilities, RpmbTransport},
    Result, RpmbError,
};

/// An open RPMB device and the way requests are handed to it.
#[derive(Debug)]
pub struct Rpmb<T: RpmbTransport> {
    transport: T,
    mode: CmdMode,
    capabilities: Option<Option<RpmbCapabilities>>,
}

impl<T: RpmbTransport> Rpmb<T> {
    pub fn new(transport: T, mode: CmdMode) -> Self {
        Self {
            transport,
            mode,
            capabilities: None,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Device capabilities, queried once.
    pub fn get_info(&mut self) -> Result<Option<RpmbCapabilities>> {
        if let Some(caps) = self.capabilities {
            return Ok(caps);
        }
        let caps = self.transport.capabilities()?;
        self.capabilities = Some(caps);
        Ok(caps)
    }

    fn exec(
        &mut self,
        req: RpmbRequestKind,
        frames_in: &[RpmbFrame],
        frames_out: &mut [RpmbFrame],
    ) -> Result<()> {
        log::debug!("RPMB OP: {}", req);
        for frame in frames_in {
            frame.dump("In Frame: ");
        }

        match self.mode {
            CmdMode::Request => self.transport.exec_request(req, frames_in, frames_out)?,
            CmdMode::Sequence => {
                let result_read = [RpmbFrame::request(RpmbRequestKind::ResultRead)];
                if req.needs_result_read() {
                    result_read[0].dump("Res Frame: ");
                }
                self.transport.exec_sequence(&mut request_sequence(
                    req,
                    frames_in,
                    &result_read,
                    &mut *frames_out,
                ))?;
            }
        }

        for frame in frames_out.iter() {
            frame.dump("Out Frame: ");
        }
        let last = frames_out.last().ok_or(RpmbError::NoFrames)?;
        check_req_resp(req, last)
    }

    fn check_limit(&mut self, req: RpmbRequestKind, block_count: u16) -> Result<()> {
        if block_count == 0 {
            log::error!("wrong blocks count");
            return Err(RpmbError::InvalidBlockCount(block_count));
        }
        let Some(caps) = self.get_info()? else {
            return Ok(());
        };
        let max = match req {
            RpmbRequestKind::DataRead => caps.rd_cnt_max,
            _ => caps.wr_cnt_max,
        };
        if max != 0 && block_count > max {
            return Err(RpmbError::BlockCountExceeded {
                op: req,
                count: block_count,
                max,
            });
        }
        Ok(())
    }

    /// Program the authentication key. This is a one-time, irreversible
    /// operation on real hardware.
    pub fn program_key(&mut self, key: &RpmbKey) -> Result<()> {
        let req = RpmbRequestKind::ProgramKey;
        let mut frame_in = RpmbFrame::request(req);
        frame_in.key_mac = *key.as_bytes();
        frame_in.set_block_count(1);
        let mut frame_out = alloc_frames(1);

        self.exec(req, &[frame_in], &mut frame_out)?;
        check_result(req, &frame_out[0])
    }

    /// Read the device write counter. With a key, the response is
    /// authenticated as well.
    pub fn write_counter(&mut self, key: Option<&RpmbKey>) -> Result<u32> {
        let req = RpmbRequestKind::GetWriteCounter;
        let mut frame_in = RpmbFrame::request(req);
        frame_in.nonce = new_nonce()?;
        let mut frame_out = alloc_frames(1);

        self.exec(req, &[frame_in], &mut frame_out)?;
        let frame_out = &frame_out[0];
        check_result(req, frame_out)?;
        check_nonce(&frame_in.nonce, frame_out)?;
        if let Some(key) = key {
            verify_frames(std::slice::from_ref(frame_out), key)?;
        }

        Ok(frame_out.write_counter())
    }

    /// Read `block_count` blocks starting at `addr` and write them to `sink`.
    /// Nothing is written unless the whole response checks out.
    pub fn read_blocks<W: Write + ?Sized>(
        &mut self,
        addr: u16,
        block_count: u16,
        key: Option<&RpmbKey>,
        sink: &mut W,
    ) -> Result<()> {
        let req = RpmbRequestKind::DataRead;
        self.check_limit(req, block_count)?;

        let mut frame_in = RpmbFrame::request(req);
        frame_in.set_addr(addr);
        frame_in.set_block_count(block_count);
        frame_in.nonce = new_nonce()?;
        let mut frames_out = alloc_frames(block_count.into());

        self.exec(req, &[frame_in], &mut frames_out)?;
        let last = &frames_out[frames_out.len() - 1];
        check_result(req, last)?;
        check_nonce(&frame_in.nonce, last)?;
        if let Some(key) = key {
            verify_frames(&frames_out, key)?;
        }

        for frame in &frames_out {
            sink.write_all(&frame.data)?;
        }
        sink.flush()?;
        Ok(())
    }

    /// Write `block_count` blocks read from `source` at `addr`.
    pub fn write_blocks<R: Read + ?Sized>(
        &mut self,
        addr: u16,
        block_count: u16,
        source: &mut R,
        key: &RpmbKey,
    ) -> Result<()> {
        let req = RpmbRequestKind::DataWrite;
        self.check_limit(req, block_count)?;

        let mut frames_in = alloc_frames(block_count.into());
        for (i, frame) in frames_in.iter_mut().enumerate() {
            source.read_exact(&mut frame.data).map_err(|err| {
                if err.kind() == std::io::ErrorKind::UnexpectedEof {
                    RpmbError::ShortData {
                        expected: usize::from(block_count) * RPMB_BLOCK_SIZE,
                        found: i * RPMB_BLOCK_SIZE,
                    }
                } else {
                    err.into()
                }
            })?;
        }

        let write_counter = self.write_counter(Some(key))?;
        for frame in frames_in.iter_mut() {
            frame.set_req_resp(req.into());
            frame.set_block_count(block_count);
            frame.set_addr(addr);
            frame.set_write_counter(write_counter);
        }
        sign_frames(&mut frames_in, key)?;
        let mut frame_out = alloc_frames(1);

        self.exec(req, &frames_in, &mut frame_out)?;
        let frame_out = &frame_out[0];
        check_result(req, frame_out)?;
        verify_frames(std::slice::from_ref(frame_out), key)?;
        if frame_out.addr() != addr {
            log::error!(
                "RPMB addr mismatchs res={:04x} req={:04x}",
                frame_out.addr(),
                addr
            );
            return Err(RpmbError::AddressMismatch {
                expected: addr,
                found: frame_out.addr(),
            });
        }
        if frame_out.write_counter() <= write_counter {
            log::error!(
                "RPMB write counter not incremented res={:x} req={:x}",
                frame_out.write_counter(),
                write_counter
            );
            return Err(RpmbError::CounterNotIncremented {
                before: write_counter,
                after: frame_out.write_counter(),
            });
        }
        Ok(())
    }
}

fn new_nonce() -> Result<Nonce> {
    let mut nonce = Nonce::default();
    OsRng.try_fill_bytes(&mut nonce).map_err(RpmbError::Nonce)?;
    Ok(nonce)
}

fn check_req_resp(req: RpmbRequestKind, frame_out: &RpmbFrame) -> Result<()> {
    let expected = req.response_code();
    if expected != frame_out.req_resp() {
        log::error!(
            "RPMB response mismatch {:04X} != {:04X}.",
            expected,
            frame_out.req_resp()
        );
        return Err(RpmbError::ResponseMismatch {
            expected,
            found: frame_out.req_resp(),
        });
    }
    Ok(())
}

fn check_result(req: RpmbRequestKind, frame_out: &RpmbFrame) -> Result<()> {
    let result = frame_out.result();
    if !result.is_ok() {
        return Err(RpmbError::Device { op: req, result });
    }
    Ok(())
}

fn check_nonce(nonce: &Nonce, frame_out: &RpmbFrame) -> Result<()> {
    if *nonce != frame_out.nonce {
        log::error!("RPMB NONCE mismatch");
        log::error!("Result NONCE: {}", HEXUPPER.encode(&frame_out.nonce));
        log::error!("Expected NONCE: {}", HEXUPPER.encode(nonce));
        return Err(RpmbError::NonceMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::transport::RpmbCmd;

    /// Answers each exchange with the next canned handler.
    type Handler = Box<dyn FnMut(&[RpmbFrame], &mut [RpmbFrame])>;

    #[derive(Default)]
    struct Canned {
        handlers: VecDeque<Handler>,
        calls: usize,
        caps: Option<RpmbCapabilities>,
    }

    impl Canned {
        fn then(mut self, handler: impl FnMut(&[RpmbFrame], &mut [RpmbFrame]) + 'static) -> Self {
            self.handlers.push_back(Box::new(handler));
            self
        }
    }

    impl RpmbTransport for Canned {
        fn capabilities(&mut self) -> Result<Option<RpmbCapabilities>> {
            Ok(self.caps)
        }

        fn exec_sequence(&mut self, cmds: &mut [RpmbCmd<'_>]) -> Result<()> {
            self.calls += 1;
            let mut request = vec![];
            for cmd in cmds.iter_mut() {
                match cmd {
                    RpmbCmd::Write { frames, .. } if request.is_empty() => {
                        request.extend_from_slice(frames)
                    }
                    RpmbCmd::Write { .. } => {}
                    RpmbCmd::Read { frames } => {
                        let mut handler = self.handlers.pop_front().expect("unexpected exchange");
                        handler(&request, frames);
                    }
                }
            }
            Ok(())
        }
    }

    fn key() -> RpmbKey {
        RpmbKey::new([0x3C; RPMB_KEY_MAC_SIZE])
    }

    fn counter_response(
        counter: u32,
        key: Option<RpmbKey>,
    ) -> impl FnMut(&[RpmbFrame], &mut [RpmbFrame]) {
        move |req, out| {
            out[0].nonce = req[0].nonce;
            out[0].set_req_resp(0x0200);
            out[0].set_write_counter(counter);
            if let Some(key) = &key {
                sign_frames(&mut out[..1], key).unwrap();
            }
        }
    }

    #[test]
    fn write_counter_both_modes() {
        for mode in [CmdMode::Request, CmdMode::Sequence] {
            let mut rpmb = Rpmb::new(Canned::default().then(counter_response(7, None)), mode);
            assert_eq!(rpmb.write_counter(None).unwrap(), 7);
        }
    }

    #[test]
    fn response_code_mismatch_wins_over_ok_result() {
        let mut rpmb = Rpmb::new(
            Canned::default().then(|req, out| {
                out[0].nonce = req[0].nonce;
                out[0].set_req_resp(0x0102);
            }),
            CmdMode::Request,
        );
        assert!(matches!(
            rpmb.write_counter(None),
            Err(RpmbError::ResponseMismatch {
                expected: 0x0200,
                found: 0x0102
            })
        ));
    }

    #[test]
    fn device_error_is_reported_with_its_code() {
        let mut rpmb = Rpmb::new(
            Canned::default().then(|_, out| {
                out[0].set_req_resp(0x0100);
                out[0].set_result(RpmbResult(0x0005));
            }),
            CmdMode::Sequence,
        );
        let err = rpmb.program_key(&key()).unwrap_err();
        assert!(matches!(
            err,
            RpmbError::Device {
                op: RpmbRequestKind::ProgramKey,
                result: RpmbResult(0x0005)
            }
        ));
        assert!(err.to_string().contains("WRITE[0x0005]"), "{}", err);
    }

    #[test]
    fn program_key_sends_the_key() {
        let mut rpmb = Rpmb::new(
            Canned::default().then(|req, out| {
                assert_eq!(req[0].key_mac, [0x3C; RPMB_KEY_MAC_SIZE]);
                assert_eq!(req[0].req_resp(), 0x0001);
                out[0].set_req_resp(0x0100);
            }),
            CmdMode::Sequence,
        );
        rpmb.program_key(&key()).unwrap();
    }

    #[test]
    fn counter_mac_checked_only_with_key() {
        let mut rpmb = Rpmb::new(
            Canned::default()
                .then(counter_response(3, None))
                .then(counter_response(3, None)),
            CmdMode::Request,
        );
        assert_eq!(rpmb.write_counter(None).unwrap(), 3);
        assert!(matches!(
            rpmb.write_counter(Some(&key())),
            Err(RpmbError::MacMismatch)
        ));
    }

    #[test]
    fn zero_block_read_does_no_io() {
        let mut rpmb = Rpmb::new(Canned::default(), CmdMode::Request);
        let mut sink: Vec<u8> = vec![];
        assert!(matches!(
            rpmb.read_blocks(0, 0, None, &mut sink),
            Err(RpmbError::InvalidBlockCount(0))
        ));
        assert_eq!(rpmb.transport().calls, 0);
        assert!(sink.is_empty());
    }

    #[test]
    fn block_count_over_device_limit() {
        let caps = RpmbCapabilities {
            device_type: 1.into(),
            target: 0,
            block_size: 1,
            wr_cnt_max: 1,
            rd_cnt_max: 4,
            auth_method: 0,
            capacity: 1,
        };
        let mut rpmb = Rpmb::new(
            Canned {
                caps: Some(caps),
                ..Default::default()
            },
            CmdMode::Request,
        );
        assert!(matches!(
            rpmb.read_blocks(0, 5, None, &mut Vec::<u8>::new()),
            Err(RpmbError::BlockCountExceeded { count: 5, max: 4, .. })
        ));
        assert!(matches!(
            rpmb.write_blocks(0, 2, &mut &[0_u8; 512][..], &key()),
            Err(RpmbError::BlockCountExceeded { count: 2, max: 1, .. })
        ));
        assert_eq!(rpmb.transport().calls, 0);
    }

    #[test]
    fn short_write_source() {
        let mut rpmb = Rpmb::new(Canned::default(), CmdMode::Request);
        assert!(matches!(
            rpmb.write_blocks(0, 2, &mut &[0_u8; 300][..], &key()),
            Err(RpmbError::ShortData {
                expected: 512,
                found: 256
            })
        ));
        assert_eq!(rpmb.transport().calls, 0);
    }

    #[test]
    fn write_rejects_address_mismatch() {
        let mut rpmb = Rpmb::new(
            Canned::default()
                .then(counter_response(5, Some(key())))
                .then(|_, out| {
                    out[0].set_req_resp(0x0300);
                    out[0].set_addr(9);
                    out[0].set_write_counter(6);
                    sign_frames(&mut out[..1], &key()).unwrap();
                }),
            CmdMode::Sequence,
        );
        assert!(matches!(
            rpmb.write_blocks(2, 1, &mut &[0_u8; 256][..], &key()),
            Err(RpmbError::AddressMismatch {
                expected: 2,
                found: 9
            })
        ));
    }
}
