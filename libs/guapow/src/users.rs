// Copyright (c) 2025 The guapow developers
// SPDX-License-Identifier: MIT

//! User-account and socket-owner lookups.
//!
//! Requests carry the requesting user by name; the daemon cross-checks that
//! name against the uid owning the client's end of the TCP connection. Both
//! sides of that check live here: passwd parsing and the
//! `/proc/net/tcp` socket table scan that maps a loopback peer back to a
//! uid.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

/// Resolve a user name to its uid via passwd.
pub fn uid_of(name: &str) -> Option<u32> {
    uid_of_in(name, Path::new("/etc/passwd"))
}

/// Resolve a user's home directory via passwd.
pub fn home_dir(name: &str) -> Option<PathBuf> {
    passwd_field_in(name, 5, Path::new("/etc/passwd")).map(PathBuf::from)
}

/// Reverse lookup: uid to user name.
pub fn name_of(uid: u32) -> Option<String> {
    name_of_in(uid, Path::new("/etc/passwd"))
}

fn name_of_in(uid: u32, passwd: &Path) -> Option<String> {
    let content = std::fs::read_to_string(passwd).ok()?;
    for line in content.lines() {
        let mut parts = line.split(':');
        let name = parts.next()?;
        if parts.nth(1).and_then(|f| f.parse::<u32>().ok()) == Some(uid) {
            return Some(name.to_string());
        }
    }
    None
}

fn uid_of_in(name: &str, passwd: &Path) -> Option<u32> {
    passwd_field_in(name, 2, passwd).and_then(|f| f.parse().ok())
}

fn passwd_field_in(name: &str, field: usize, passwd: &Path) -> Option<String> {
    let content = std::fs::read_to_string(passwd).ok()?;
    for line in content.lines() {
        let mut parts = line.split(':');
        if parts.next() == Some(name) {
            return parts.nth(field - 1).map(str::to_string);
        }
    }
    None
}

/// Find the uid owning the client side of a loopback TCP connection.
///
/// `peer` is the remote address of the accepted connection (the client's
/// local address in its own socket table entry) and `local_port` the
/// daemon's listening port. Returns `None` when the socket entry cannot be
/// found, e.g. the client already closed. Callers treat that as
/// "unverifiable", not as a rejection.
pub fn tcp_peer_uid(peer: SocketAddr, local_port: u16) -> Option<u32> {
    tcp_peer_uid_in(peer, local_port, Path::new("/proc/net/tcp"))
}

fn tcp_peer_uid_in(peer: SocketAddr, local_port: u16, table: &Path) -> Option<u32> {
    let IpAddr::V4(peer_ip) = peer.ip() else {
        return None; // daemon binds v4 loopback only
    };
    let content = std::fs::read_to_string(table).ok()?;

    // Socket-table addresses are little-endian hex: 127.0.0.1 -> 0100007F.
    let peer_hex = format!(
        "{:08X}:{:04X}",
        u32::from_le_bytes(peer_ip.octets()),
        peer.port()
    );
    let local_hex_port = format!("{local_port:04X}");

    for line in content.lines().skip(1) {
        let mut cols = line.split_whitespace();
        let _sl = cols.next()?;
        let local = cols.next()?;
        let remote = cols.next()?;
        // The client's entry: its local address is our peer, its remote
        // port is our listening port.
        if local == peer_hex && remote.ends_with(&local_hex_port) {
            return cols.nth(4).and_then(|uid| uid.parse().ok());
        }
    }
    None
}
