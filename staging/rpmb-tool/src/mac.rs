// RPMB command-line client
//
// Copyright 2023 Linaro Ltd. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! HMAC-SHA256 authentication of RPMB frame sequences.
//!
//! The MAC is calculated using HMAC SHA-256. It takes as input a key and a
//! message. The key used for the MAC calculation is always the 256-bit RPMB
//! authentication key. The message used as input to the MAC calculation is
//! the concatenation of the fields in the RPMB frames excluding stuff bytes
//! and the MAC itself.

use data_encoding::HEXUPPER;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{io::*, Result, RpmbError};

type HmacSha256 = Hmac<Sha256>;

fn hmac_over(frames: &[RpmbFrame], key: &RpmbKey) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .expect("HMAC can take key of any size");
    for frame in frames {
        mac.update(frame.mac_region());
    }
    mac
}

/// MAC over `frames`, in order.
pub fn compute_mac(frames: &[RpmbFrame], key: &RpmbKey) -> [u8; RPMB_KEY_MAC_SIZE] {
    hmac_over(frames, key).finalize().into_bytes().into()
}

/// Check `expected` against the MAC over `frames`. The comparison runs in
/// constant time.
pub fn verify_mac(frames: &[RpmbFrame], key: &RpmbKey, expected: &[u8]) -> Result<()> {
    hmac_over(frames, key).verify_slice(expected).map_err(|_| {
        log::error!("RPMB hmac mismatch");
        log::error!("Result MAC: {}", HEXUPPER.encode(expected));
        log::error!(
            "Expected MAC: {}",
            HEXUPPER.encode(&compute_mac(frames, key))
        );
        RpmbError::MacMismatch
    })
}

/// Check the MAC carried by the last frame of a response sequence.
pub fn verify_frames(frames: &[RpmbFrame], key: &RpmbKey) -> Result<()> {
    let last = frames.last().ok_or(RpmbError::NoFrames)?;
    verify_mac(frames, key, &last.key_mac)
}

/// Store the MAC over `frames` in the last frame.
pub fn sign_frames(frames: &mut [RpmbFrame], key: &RpmbKey) -> Result<()> {
    let mac = compute_mac(frames, key);
    frames.last_mut().ok_or(RpmbError::NoFrames)?.key_mac = mac;
    Ok(())
}

/// Store the MAC over a lone response frame in it.
pub fn sign_frame(frame: &mut RpmbFrame, key: &RpmbKey) {
    let mac = compute_mac(std::slice::from_ref(frame), key);
    frame.key_mac = mac;
}
