// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Notebook Relay Contributors

// Network utility functions

use std::net::{Ipv4Addr, TcpListener};

/// Address the relay access client binds its local bridge to
pub const BRIDGE_BIND_ADDRESS: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Format host and port, bracketing IPv6 literals
pub fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Check whether a local bridge port can currently be bound
///
/// Used to detect ports held by processes this tool does not track.
pub fn is_local_port_available(port: u16) -> bool {
    TcpListener::bind((BRIDGE_BIND_ADDRESS, port)).is_ok()
}
