// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2026.

//! HCI event construction.
//!
//! Every builder returns a complete event packet: `event_code (1) |
//! param_len (1) | params`. Buffers are bounded by
//! [`crate::config::HCI_EVENT_BUF_SIZE`]; the Number Of Completed
//! Packets builder takes one pre-chunked slice of handle/count pairs and
//! the caller splits at [`ncp_capacity`] pairs per event.

use heapless::Vec;

use crate::address::DeviceAddress;
use crate::config::HCI_EVENT_BUF_SIZE;
use crate::error::Status;

pub type EventBuf = Vec<u8, HCI_EVENT_BUF_SIZE>;

pub const EVT_DISCONNECTION_COMPLETE: u8 = 0x05;
pub const EVT_ENCRYPTION_CHANGE: u8 = 0x08;
pub const EVT_READ_REMOTE_VERSION_COMPLETE: u8 = 0x0c;
pub const EVT_COMMAND_COMPLETE: u8 = 0x0e;
pub const EVT_COMMAND_STATUS: u8 = 0x0f;
pub const EVT_NUM_COMPLETED_PACKETS: u8 = 0x13;
pub const EVT_LE_META: u8 = 0x3e;

pub const LE_SUBEV_CONN_COMPLETE: u8 = 0x01;
pub const LE_SUBEV_ADV_REPORT: u8 = 0x02;
pub const LE_SUBEV_CONN_UPDATE_COMPLETE: u8 = 0x03;
pub const LE_SUBEV_READ_REMOTE_FEATURES: u8 = 0x04;
pub const LE_SUBEV_LTK_REQUEST: u8 = 0x05;

// Event mask bits (Set Event Mask, Core Spec Vol. 4, Part E, 7.3.1).
pub const MASK_DISCONNECTION_COMPLETE: u64 = 1 << 4;
pub const MASK_ENCRYPTION_CHANGE: u64 = 1 << 7;
pub const MASK_READ_REMOTE_VERSION: u64 = 1 << 11;
pub const MASK_LE_META: u64 = 1 << 61;
pub const DEFAULT_EVENT_MASK: u64 = 0x0000_1fff_ffff_ffff;

// LE event mask bits.
pub const LE_MASK_CONN_COMPLETE: u64 = 1 << 0;
pub const LE_MASK_ADV_REPORT: u64 = 1 << 1;
pub const LE_MASK_CONN_UPDATE: u64 = 1 << 2;
pub const LE_MASK_READ_REMOTE_FEATURES: u64 = 1 << 3;
pub const LE_MASK_LTK_REQUEST: u64 = 1 << 4;
pub const DEFAULT_LE_EVENT_MASK: u64 = 0x1f;

/// Handle/count pairs per Number Of Completed Packets event.
pub const fn ncp_capacity() -> usize {
    (HCI_EVENT_BUF_SIZE - 3) / 4
}

fn event(code: u8) -> EventBuf {
    let mut e = EventBuf::new();
    let _ = e.push(code);
    let _ = e.push(0);
    e
}

fn push(e: &mut EventBuf, bytes: &[u8]) {
    let _ = e.extend_from_slice(bytes);
}

fn finish(mut e: EventBuf) -> EventBuf {
    e[1] = (e.len() - 2) as u8;
    e
}

pub fn command_complete(op: u16, ret: &[u8]) -> EventBuf {
    let mut e = event(EVT_COMMAND_COMPLETE);
    push(&mut e, &[1]); // Num_HCI_Command_Packets
    push(&mut e, &op.to_le_bytes());
    push(&mut e, ret);
    finish(e)
}

/// The common complete-with-status-only form.
pub fn command_complete_status(op: u16, status: Status) -> EventBuf {
    command_complete(op, &[status.to_u8()])
}

pub fn command_status(op: u16, status: Status) -> EventBuf {
    let mut e = event(EVT_COMMAND_STATUS);
    push(&mut e, &[status.to_u8(), 1]);
    push(&mut e, &op.to_le_bytes());
    finish(e)
}

pub fn disconnection_complete(handle: u16, reason: Status) -> EventBuf {
    let mut e = event(EVT_DISCONNECTION_COMPLETE);
    push(&mut e, &[Status::Success.to_u8()]);
    push(&mut e, &handle.to_le_bytes());
    push(&mut e, &[reason.to_u8()]);
    finish(e)
}

pub fn encryption_change(status: Status, handle: u16, enabled: bool) -> EventBuf {
    let mut e = event(EVT_ENCRYPTION_CHANGE);
    push(&mut e, &[status.to_u8()]);
    push(&mut e, &handle.to_le_bytes());
    push(&mut e, &[enabled as u8]);
    finish(e)
}

pub fn read_remote_version_complete(
    status: Status,
    handle: u16,
    version: u8,
    company: u16,
    subversion: u16,
) -> EventBuf {
    let mut e = event(EVT_READ_REMOTE_VERSION_COMPLETE);
    push(&mut e, &[status.to_u8()]);
    push(&mut e, &handle.to_le_bytes());
    push(&mut e, &[version]);
    push(&mut e, &company.to_le_bytes());
    push(&mut e, &subversion.to_le_bytes());
    finish(e)
}

/// One pre-chunked batch; `pairs.len()` must not exceed
/// [`ncp_capacity`].
pub fn num_completed_packets(pairs: &[(u16, u16)]) -> EventBuf {
    let mut e = event(EVT_NUM_COMPLETED_PACKETS);
    push(&mut e, &[pairs.len() as u8]);
    // All handles first, then all counts, per the v4 event layout.
    for (handle, _) in pairs {
        push(&mut e, &handle.to_le_bytes());
    }
    for (_, count) in pairs {
        push(&mut e, &count.to_le_bytes());
    }
    finish(e)
}

/// LE Connection Complete (19 parameter bytes).
pub fn le_conn_complete(
    status: Status,
    handle: u16,
    role: u8,
    peer: &DeviceAddress,
    interval: u16,
    latency: u16,
    timeout: u16,
    mca: u8,
) -> EventBuf {
    let mut e = event(EVT_LE_META);
    push(&mut e, &[LE_SUBEV_CONN_COMPLETE, status.to_u8()]);
    push(&mut e, &handle.to_le_bytes());
    push(&mut e, &[role, peer.kind as u8]);
    push(&mut e, &peer.bytes);
    push(&mut e, &interval.to_le_bytes());
    push(&mut e, &latency.to_le_bytes());
    push(&mut e, &timeout.to_le_bytes());
    push(&mut e, &[mca]);
    finish(e)
}

/// A connection-complete failure carries a zero handle and peer.
pub fn le_conn_complete_error(status: Status) -> EventBuf {
    le_conn_complete(
        status,
        0,
        0,
        &DeviceAddress::public([0; 6]),
        0,
        0,
        0,
        0,
    )
}

pub fn le_adv_report(
    event_type: u8,
    addr: &DeviceAddress,
    data: &[u8],
    rssi: i8,
) -> EventBuf {
    let mut e = event(EVT_LE_META);
    push(&mut e, &[LE_SUBEV_ADV_REPORT, 1, event_type, addr.kind as u8]);
    push(&mut e, &addr.bytes);
    push(&mut e, &[data.len() as u8]);
    push(&mut e, data);
    push(&mut e, &[rssi as u8]);
    finish(e)
}

pub fn le_conn_update_complete(
    status: Status,
    handle: u16,
    interval: u16,
    latency: u16,
    timeout: u16,
) -> EventBuf {
    let mut e = event(EVT_LE_META);
    push(&mut e, &[LE_SUBEV_CONN_UPDATE_COMPLETE, status.to_u8()]);
    push(&mut e, &handle.to_le_bytes());
    push(&mut e, &interval.to_le_bytes());
    push(&mut e, &latency.to_le_bytes());
    push(&mut e, &timeout.to_le_bytes());
    finish(e)
}

pub fn le_read_remote_features_complete(
    status: Status,
    handle: u16,
    features: u64,
) -> EventBuf {
    let mut e = event(EVT_LE_META);
    push(&mut e, &[LE_SUBEV_READ_REMOTE_FEATURES, status.to_u8()]);
    push(&mut e, &handle.to_le_bytes());
    push(&mut e, &features.to_le_bytes());
    finish(e)
}

pub fn le_ltk_request(handle: u16, rand: u64, ediv: u16) -> EventBuf {
    let mut e = event(EVT_LE_META);
    push(&mut e, &[LE_SUBEV_LTK_REQUEST]);
    push(&mut e, &handle.to_le_bytes());
    push(&mut e, &rand.to_le_bytes());
    push(&mut e, &ediv.to_le_bytes());
    finish(e)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::address::AddrKind;

    #[test]
    fn command_complete_layout() {
        let e = command_complete(0x2006, &[0x00]);
        assert_eq!(&e[..], &[0x0e, 4, 1, 0x06, 0x20, 0x00]);
    }

    #[test]
    fn command_status_layout() {
        let e = command_status(0x040d, Status::CommandDisallowed);
        assert_eq!(&e[..], &[0x0f, 4, 0x0c, 1, 0x0d, 0x04]);
    }

    #[test]
    fn disconnection_complete_layout() {
        let e = disconnection_complete(0x0001, Status::RemoteUserTerminated);
        assert_eq!(&e[..], &[0x05, 4, 0x00, 0x01, 0x00, 0x13]);
    }

    #[test]
    fn le_conn_complete_is_19_params() {
        let peer = DeviceAddress::new(AddrKind::Random, [1, 2, 3, 4, 5, 6]);
        let e = le_conn_complete(Status::Success, 2, 1, &peer, 40, 0, 200, 1);
        assert_eq!(e[0], EVT_LE_META);
        assert_eq!(e[1], 19);
        assert_eq!(e.len(), 21);
        assert_eq!(e[2], LE_SUBEV_CONN_COMPLETE);
        // Interval at fixed offset: subev(1)+status(1)+handle(2)+role(1)+
        // peer_kind(1)+peer(6) = offset 12 into params.
        assert_eq!(u16::from_le_bytes([e[14], e[15]]), 40);
        assert_eq!(e[20], 1);
    }

    #[test]
    fn ncp_packs_handles_then_counts() {
        let e = num_completed_packets(&[(1, 3), (2, 5)]);
        assert_eq!(
            &e[..],
            &[0x13, 9, 2, 1, 0, 2, 0, 3, 0, 5, 0]
        );
    }

    #[test]
    fn ncp_capacity_matches_buffer() {
        let pairs: heapless::Vec<(u16, u16), 64> =
            (0..ncp_capacity() as u16).map(|i| (i + 1, 1)).collect();
        let e = num_completed_packets(&pairs);
        // Fully used buffer still carries every pair.
        assert_eq!(e[2] as usize, ncp_capacity());
        assert_eq!(e.len(), 3 + 4 * ncp_capacity());
    }

    #[test]
    fn adv_report_layout() {
        let addr = DeviceAddress::public([9, 8, 7, 6, 5, 4]);
        let e = le_adv_report(0x00, &addr, &[0xde, 0xad], -60);
        assert_eq!(e[0], EVT_LE_META);
        assert_eq!(e[2], LE_SUBEV_ADV_REPORT);
        assert_eq!(e[3], 1);
        assert_eq!(e[4], 0x00);
        assert_eq!(e[12], 2);
        assert_eq!(&e[13..15], &[0xde, 0xad]);
        assert_eq!(e[15] as i8, -60);
    }

    #[test]
    fn ltk_request_layout() {
        let e = le_ltk_request(1, 0x1122_3344_5566_7788, 0xbeef);
        assert_eq!(e[1], 13);
        assert_eq!(e[2], LE_SUBEV_LTK_REQUEST);
        assert_eq!(u16::from_le_bytes([e[13], e[14]]), 0xbeef);
    }
}
