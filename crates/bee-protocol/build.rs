// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
use std::io::Result;

fn main() -> Result<()> {
    // Controller <-> agent protocol (client and server stubs)
    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_protos(&["proto/bee.proto"], &["proto/"])?;

    Ok(())
}
