// RPMB command-line client
//
// Copyright 2023 Linaro Ltd. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{convert::TryFrom, process::ExitCode};

use clap::Parser;
use rpmb_tool::*;

fn main() -> ExitCode {
    let config = match RpmbConfig::try_from(RpmbArgs::parse()) {
        Ok(config) => config,
        Err(err) => return failure(err),
    };
    config.logger().init();

    match cli::run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => failure(err),
    }
}

fn failure(err: RpmbError) -> ExitCode {
    eprintln!("rpmb: error: {}", err);
    ExitCode::FAILURE
}
