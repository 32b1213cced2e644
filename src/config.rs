// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2026.

//! Controller capacities and runtime configuration.
//!
//! The constants size every bounded structure in the crate. They are
//! deliberately plain `usize` items rather than cargo features: a port
//! that needs different capacities edits this file, the same way Tock
//! boards configure the kernel through `kernel/src/config.rs`.

use crate::address::BD_ADDR_LEN;
use crate::time::Duration;

/// Maximum simultaneous connections (active + the single pending one).
pub const MAX_CONNECTIONS: usize = 8;

/// White list capacity, reported by Read White List Size.
pub const WHITE_LIST_SIZE: usize = 8;

/// Schedule items that can be outstanding at once: one per connection,
/// plus advertising, plus scanning.
pub const SCHED_ITEMS: usize = MAX_CONNECTIONS + 2;

/// Per-connection transmit queue depth, and the ACL packet count
/// advertised by LE Read Buffer Size.
pub const CONN_TX_QUEUE_LEN: usize = 4;

/// Largest data channel PDU payload we carry (no length extension).
pub const ACL_PAYLOAD_LEN: usize = 27;

/// Outbound HCI event buffer size (event header + parameters).
pub const HCI_EVENT_BUF_SIZE: usize = 64;

/// Outbound HCI event queue depth.
pub const HCI_EVENT_QUEUE_LEN: usize = 16;

/// ISR-to-task event queue depth.
pub const LL_EVENT_QUEUE_LEN: usize = 16;

/// Received ACL data waiting for the host transport.
pub const ACL_RX_QUEUE_LEN: usize = 8;

/// Scanner duplicate-filter cache entries.
pub const DUP_CACHE_SIZE: usize = 8;

/// Runtime configuration, fixed at controller construction.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Factory-programmed public device address.
    pub public_addr: [u8; BD_ADDR_LEN],
    /// Minimum spacing between Number Of Completed Packets events.
    pub completed_pkts_interval: Duration,
}

impl Config {
    pub const fn new(public_addr: [u8; BD_ADDR_LEN]) -> Config {
        Config {
            public_addr,
            completed_pkts_interval: Duration::from_millis(50),
        }
    }
}
