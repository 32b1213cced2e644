// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2026.

//! Mock hardware for host-side tests.

use crate::config::Config;
use crate::hil::{Alarm, BleRadio, PhyTransition, RadioChannel, Rng};
use crate::time::{Duration, Instant};
use crate::LinkLayer;

pub const PUBLIC_ADDR: [u8; 6] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];

/// Records the most recent radio requests for assertions.
#[derive(Default)]
pub struct MockRadio {
    pub adv_tx: Option<(heapless::Vec<u8, 39>, RadioChannel, PhyTransition)>,
    pub adv_tx_count: u32,
    pub adv_rx: Option<RadioChannel>,
    pub data_tx: Option<(heapless::Vec<u8, 29>, u32, RadioChannel)>,
    pub data_rx: Option<(RadioChannel, u32)>,
    pub disables: u32,
}

impl MockRadio {
    pub fn new() -> MockRadio {
        MockRadio::default()
    }
}

impl BleRadio for MockRadio {
    fn transmit_advertising(
        &mut self,
        pdu: &[u8],
        channel: RadioChannel,
        transition: PhyTransition,
    ) {
        let mut copy = heapless::Vec::new();
        let _ = copy.extend_from_slice(pdu);
        self.adv_tx = Some((copy, channel, transition));
        self.adv_tx_count += 1;
    }

    fn receive_advertising(&mut self, channel: RadioChannel) {
        self.adv_rx = Some(channel);
    }

    fn transmit_data(
        &mut self,
        pdu: &[u8],
        access_address: u32,
        _crc_init: u32,
        channel: RadioChannel,
        _transition: PhyTransition,
    ) {
        let mut copy = heapless::Vec::new();
        let _ = copy.extend_from_slice(pdu);
        self.data_tx = Some((copy, access_address, channel));
    }

    fn receive_data(&mut self, channel: RadioChannel, access_address: u32, _crc_init: u32) {
        self.data_rx = Some((channel, access_address));
    }

    fn disable(&mut self) {
        self.disables += 1;
    }
}

/// A manually-advanced clock.
pub struct MockAlarm {
    pub now: Instant,
    pub armed: Option<Instant>,
}

impl MockAlarm {
    pub fn new() -> MockAlarm {
        MockAlarm {
            now: Instant::ZERO,
            armed: None,
        }
    }
}

impl Alarm for MockAlarm {
    fn now(&self) -> Instant {
        self.now
    }

    fn set_alarm(&mut self, at: Instant) {
        self.armed = Some(at);
    }

    fn disarm(&mut self) {
        self.armed = None;
    }
}

/// An xorshift generator: deterministic, and good enough to pass the
/// access address constraints quickly.
pub struct MockRng(pub u32);

impl Rng for MockRng {
    fn next_u32(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }
}

pub type TestLl = LinkLayer<MockRadio, MockAlarm, MockRng>;

pub fn controller() -> TestLl {
    LinkLayer::new(
        MockRadio::new(),
        MockAlarm::new(),
        MockRng(0x1234_5678),
        Config::new(PUBLIC_ADDR),
    )
}

/// Advance the mock clock and fire the alarm entry point.
pub fn tick(ll: &mut TestLl, d: Duration) {
    ll.alarm.now = ll.alarm.now.wrapping_add(d);
    ll.on_alarm();
}
