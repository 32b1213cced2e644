// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2026.

//! Advertising state machine.
//!
//! Owns one advertising configuration at a time. The machine walks the
//! advertising channels set in the channel map in ascending order; one
//! full walk is one advertising event. Between events the start time
//! advances by the configured interval plus a 0-10 ms pseudo-random
//! advertising delay, except in high-duty-cycle directed mode which runs
//! a fixed cadence and instead carries a hard 1.28 s deadline after which
//! the machine must disable itself and report a timeout upward.
//!
//! This module holds state and transition logic only; the radio, the
//! schedule and the event queue are driven by the owning `LinkLayer`.
//! The `accepts_*` queries are the receive fast path and must stay cheap:
//! they run from interrupt context inside the inter-frame space.

use crate::address::{AddrKind, DeviceAddress};
use crate::error::Status;
use crate::hil::RadioChannel;
use crate::pdu::{PduBuf, MAX_ADV_DATA_LEN};
use crate::time::{Duration, Instant};
use crate::whitelist::{AdvFilterPolicy, WhiteList};

/// HCI advertising types (LE Set Advertising Parameters).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum AdvType {
    AdvInd = 0x00,
    /// Connectable high-duty-cycle directed.
    AdvDirectIndHd = 0x01,
    AdvScanInd = 0x02,
    AdvNonconnInd = 0x03,
    /// Connectable low-duty-cycle directed.
    AdvDirectIndLd = 0x04,
}

impl AdvType {
    pub fn from_u8(v: u8) -> Result<AdvType, Status> {
        match v {
            0x00 => Ok(AdvType::AdvInd),
            0x01 => Ok(AdvType::AdvDirectIndHd),
            0x02 => Ok(AdvType::AdvScanInd),
            0x03 => Ok(AdvType::AdvNonconnInd),
            0x04 => Ok(AdvType::AdvDirectIndLd),
            _ => Err(Status::InvalidHciParams),
        }
    }

    pub fn connectable(self) -> bool {
        !matches!(self, AdvType::AdvScanInd | AdvType::AdvNonconnInd)
    }

    pub fn scannable(self) -> bool {
        matches!(self, AdvType::AdvInd | AdvType::AdvScanInd)
    }

    pub fn directed(self) -> bool {
        matches!(self, AdvType::AdvDirectIndHd | AdvType::AdvDirectIndLd)
    }
}

/// Validated advertising parameters.
#[derive(Clone, Copy, Debug)]
pub struct AdvParams {
    /// 625 µs units.
    pub itvl_min: u16,
    pub itvl_max: u16,
    pub adv_type: AdvType,
    pub own_addr_kind: AddrKind,
    pub peer: DeviceAddress,
    /// Bit 0 = channel 37, bit 1 = 38, bit 2 = 39.
    pub chan_map: u8,
    pub filter_policy: AdvFilterPolicy,
}

impl Default for AdvParams {
    fn default() -> AdvParams {
        AdvParams {
            itvl_min: ADV_ITVL_DEFAULT,
            itvl_max: ADV_ITVL_DEFAULT,
            adv_type: AdvType::AdvInd,
            own_addr_kind: AddrKind::Public,
            peer: DeviceAddress::public([0; 6]),
            chan_map: CHAN_MAP_ALL,
            filter_policy: AdvFilterPolicy::None,
        }
    }
}

pub const ADV_ITVL_MIN: u16 = 0x0020;
pub const ADV_ITVL_NONCONN_MIN: u16 = 0x00a0;
pub const ADV_ITVL_MAX: u16 = 0x4000;
const ADV_ITVL_DEFAULT: u16 = 0x0800;
pub const CHAN_MAP_ALL: u8 = 0x07;

/// Worst-case single-channel window: ADV PDU, IFS, request, IFS,
/// response, plus margin.
pub const ADV_SLOT: Duration = Duration::from_micros(1500);
/// Event cadence in high-duty-cycle directed mode.
pub const HD_EVENT_ITVL: Duration = Duration::from_micros(3750);
/// High-duty-cycle directed advertising self-disables after this.
pub const HD_TIMEOUT: Duration = Duration::from_millis(1280);
/// Upper bound of the per-event pseudo-random advertising delay.
pub const ADV_DELAY_MAX_US: u32 = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum AdvState {
    Disabled,
    /// Scheduled, waiting for the channel's window to open.
    Pending,
    /// PDU handed to the radio on the current channel.
    Advertising,
}

/// What follows a completed transmission on the current channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdvAdvance {
    /// More unmasked channels remain in this event.
    NextChannel,
    /// The walk finished; the advertising event is over.
    EventDone,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AdvStats {
    pub events: u32,
    pub late_starts: u32,
    pub tx_aborts: u32,
    pub scan_reqs: u32,
    pub scan_rsps: u32,
    pub conn_reqs: u32,
    pub hd_timeouts: u32,
}

pub struct AdvSm {
    params: AdvParams,
    state: AdvState,
    /// Current advertising channel index (37..=39) while enabled.
    chan: u8,
    own_addr: DeviceAddress,
    adv_data: [u8; MAX_ADV_DATA_LEN],
    adv_data_len: usize,
    scan_rsp_data: [u8; MAX_ADV_DATA_LEN],
    scan_rsp_data_len: usize,
    /// Built once per enable so the scan-request fast path never
    /// constructs anything.
    scan_rsp_pdu: Option<PduBuf>,
    /// Scheduled start of the current/next advertising event.
    event_start: Instant,
    hd_deadline: Option<Instant>,
    pub stats: AdvStats,
}

impl AdvSm {
    pub fn new() -> AdvSm {
        AdvSm {
            params: AdvParams::default(),
            state: AdvState::Disabled,
            chan: 37,
            own_addr: DeviceAddress::public([0; 6]),
            adv_data: [0; MAX_ADV_DATA_LEN],
            adv_data_len: 0,
            scan_rsp_data: [0; MAX_ADV_DATA_LEN],
            scan_rsp_data_len: 0,
            scan_rsp_pdu: None,
            event_start: Instant::ZERO,
            hd_deadline: None,
            stats: AdvStats::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state != AdvState::Disabled
    }

    /// Whether the active filter policy reads the white list, which
    /// blocks white list mutation.
    pub fn uses_whitelist(&self) -> bool {
        self.is_enabled() && self.params.filter_policy.uses_whitelist()
    }

    pub fn params(&self) -> &AdvParams {
        &self.params
    }

    /// The address we advertise with; fixed at enable time.
    pub fn own_addr(&self) -> DeviceAddress {
        self.own_addr
    }

    /// LE Set Advertising Parameters. Legal only while disabled; a
    /// validation failure leaves the previous parameters untouched.
    pub fn set_params(&mut self, mut params: AdvParams) -> Result<(), Status> {
        if self.is_enabled() {
            return Err(Status::CommandDisallowed);
        }
        if params.adv_type == AdvType::AdvDirectIndHd {
            // High-duty-cycle directed ignores interval and filter
            // policy; the fields are forced rather than validated.
            params.itvl_min = 0;
            params.itvl_max = 0;
            params.filter_policy = AdvFilterPolicy::None;
        } else {
            let min_allowed = if params.adv_type.connectable() {
                ADV_ITVL_MIN
            } else {
                ADV_ITVL_NONCONN_MIN
            };
            if params.itvl_min < min_allowed
                || params.itvl_min > params.itvl_max
                || params.itvl_max > ADV_ITVL_MAX
            {
                return Err(Status::InvalidHciParams);
            }
        }
        if params.chan_map == 0 || params.chan_map > CHAN_MAP_ALL {
            return Err(Status::InvalidHciParams);
        }
        if !matches!(params.own_addr_kind, AddrKind::Public | AddrKind::Random) {
            return Err(Status::InvalidHciParams);
        }
        if params.adv_type.directed()
            && !matches!(params.peer.kind, AddrKind::Public | AddrKind::Random)
        {
            return Err(Status::InvalidHciParams);
        }
        self.params = params;
        Ok(())
    }

    pub fn set_adv_data(&mut self, data: &[u8]) -> Result<(), Status> {
        if data.len() > MAX_ADV_DATA_LEN {
            return Err(Status::InvalidHciParams);
        }
        self.adv_data[..data.len()].copy_from_slice(data);
        self.adv_data_len = data.len();
        Ok(())
    }

    pub fn set_scan_rsp_data(&mut self, data: &[u8]) -> Result<(), Status> {
        if data.len() > MAX_ADV_DATA_LEN {
            return Err(Status::InvalidHciParams);
        }
        self.scan_rsp_data[..data.len()].copy_from_slice(data);
        self.scan_rsp_data_len = data.len();
        // Keep the prebuilt response current if we are already running.
        if self.is_enabled() && self.params.adv_type.scannable() {
            self.scan_rsp_pdu =
                PduBuf::scan_rsp(&self.own_addr, &self.scan_rsp_data[..self.scan_rsp_data_len])
                    .ok();
        }
        Ok(())
    }

    /// LE Set Advertising Enable (1). Computes the first channel and the
    /// first event start; the caller commits the schedule item. Enabling
    /// while enabled is a successful no-op (`Ok(None)`).
    pub fn enable(
        &mut self,
        own_addr: DeviceAddress,
        now: Instant,
    ) -> Result<Option<Instant>, Status> {
        if self.is_enabled() {
            return Ok(None);
        }
        if own_addr.kind == AddrKind::Random && !own_addr.is_valid_random() {
            return Err(Status::InvalidHciParams);
        }
        self.own_addr = own_addr;
        self.scan_rsp_pdu = if self.params.adv_type.scannable() {
            Some(PduBuf::scan_rsp(
                &self.own_addr,
                &self.scan_rsp_data[..self.scan_rsp_data_len],
            )?)
        } else {
            None
        };
        self.chan = self.first_channel();
        self.event_start = now;
        self.hd_deadline = if self.params.adv_type == AdvType::AdvDirectIndHd {
            Some(now.wrapping_add(HD_TIMEOUT))
        } else {
            None
        };
        self.state = AdvState::Pending;
        debug!("adv enabled, first channel {}", self.chan);
        Ok(Some(now))
    }

    /// LE Set Advertising Enable (0), and the internal stop paths
    /// (connect request accepted, directed timeout).
    pub fn disable(&mut self) {
        self.state = AdvState::Disabled;
        self.scan_rsp_pdu = None;
        self.hd_deadline = None;
    }

    fn first_channel(&self) -> u8 {
        37 + self.params.chan_map.trailing_zeros() as u8
    }

    pub fn current_channel(&self) -> RadioChannel {
        RadioChannel::new(self.chan).unwrap_or(RadioChannel::ADV_37)
    }

    pub fn event_start(&self) -> Instant {
        self.event_start
    }

    /// True once the directed high-duty-cycle deadline has passed.
    pub fn hd_timeout_due(&self, now: Instant) -> bool {
        self.hd_deadline.is_some_and(|d| now.is_at_or_after(d))
    }

    /// Build the advertising PDU for the current configuration.
    pub fn build_adv_pdu(&self) -> Result<PduBuf, Status> {
        let data = &self.adv_data[..self.adv_data_len];
        match self.params.adv_type {
            AdvType::AdvInd => PduBuf::adv_ind(&self.own_addr, data),
            AdvType::AdvScanInd => PduBuf::adv_scan_ind(&self.own_addr, data),
            AdvType::AdvNonconnInd => PduBuf::adv_nonconn_ind(&self.own_addr, data),
            AdvType::AdvDirectIndHd | AdvType::AdvDirectIndLd => {
                PduBuf::adv_direct_ind(&self.own_addr, &self.params.peer)
            }
        }
    }

    pub fn scan_rsp_pdu(&self) -> Option<&PduBuf> {
        self.scan_rsp_pdu.as_ref()
    }

    /// The radio accepted the PDU for the current channel.
    pub fn mark_advertising(&mut self) {
        self.state = AdvState::Advertising;
    }

    /// Transmission on the current channel finished: step the walk.
    pub fn advance_channel(&mut self) -> AdvAdvance {
        let used = self.chan - 37;
        let remaining = self.params.chan_map >> (used + 1);
        if remaining == 0 {
            self.chan = self.first_channel();
            self.state = AdvState::Pending;
            self.stats.events += 1;
            AdvAdvance::EventDone
        } else {
            self.chan += 1 + remaining.trailing_zeros() as u8;
            self.state = AdvState::Pending;
            AdvAdvance::NextChannel
        }
    }

    /// Advance the event start to the next advertising event. `delay` is
    /// the caller-randomized advertising delay; high-duty-cycle directed
    /// mode runs at fixed cadence and ignores it.
    pub fn schedule_next_event(&mut self, delay: Duration) -> Instant {
        let step = if self.params.adv_type == AdvType::AdvDirectIndHd {
            HD_EVENT_ITVL
        } else {
            Duration::from_units_625us(self.params.itvl_max as u32) + delay
        };
        self.event_start = self.event_start.wrapping_add(step);
        self.event_start
    }

    /// Receive fast path: should this SCAN_REQ get a response?
    pub fn accepts_scan_req(
        &self,
        scana: &DeviceAddress,
        adva: &DeviceAddress,
        whitelist: &WhiteList,
    ) -> bool {
        if self.state != AdvState::Advertising || !self.params.adv_type.scannable() {
            return false;
        }
        if *adva != self.own_addr {
            return false;
        }
        if self.params.filter_policy.filters_scan_req() && !whitelist.matches(scana) {
            return false;
        }
        true
    }

    /// Receive fast path: should this CONNECT_REQ start a connection?
    pub fn accepts_connect_req(
        &self,
        inita: &DeviceAddress,
        adva: &DeviceAddress,
        whitelist: &WhiteList,
    ) -> bool {
        if self.state != AdvState::Advertising || !self.params.adv_type.connectable() {
            return false;
        }
        if *adva != self.own_addr {
            return false;
        }
        if self.params.adv_type.directed() {
            // Exact (kind, bytes) comparison. A resolvable private
            // initiator address will not match; address resolution is
            // out of scope here.
            return *inita == self.params.peer;
        }
        if self.params.filter_policy.filters_conn_req() && !whitelist.matches(inita) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn own() -> DeviceAddress {
        DeviceAddress::public([1, 2, 3, 4, 5, 6])
    }

    fn params(adv_type: AdvType) -> AdvParams {
        AdvParams {
            adv_type,
            ..AdvParams::default()
        }
    }

    fn enabled_sm(p: AdvParams) -> AdvSm {
        let mut sm = AdvSm::new();
        sm.set_params(p).unwrap();
        sm.enable(own(), Instant::ZERO).unwrap();
        sm.mark_advertising();
        sm
    }

    #[test]
    fn interval_bounds() {
        let mut sm = AdvSm::new();
        let mut p = params(AdvType::AdvInd);
        p.itvl_min = 0x1f;
        p.itvl_max = 0x20;
        assert_eq!(sm.set_params(p).unwrap_err(), Status::InvalidHciParams);
        p.itvl_min = 0x30;
        p.itvl_max = 0x20;
        assert_eq!(sm.set_params(p).unwrap_err(), Status::InvalidHciParams);
        p.itvl_min = 0x20;
        p.itvl_max = 0x4001;
        assert_eq!(sm.set_params(p).unwrap_err(), Status::InvalidHciParams);
        p.itvl_max = 0x4000;
        sm.set_params(p).unwrap();
    }

    #[test]
    fn nonconnectable_minimum_is_higher() {
        let mut sm = AdvSm::new();
        let mut p = params(AdvType::AdvNonconnInd);
        p.itvl_min = 0x20;
        p.itvl_max = 0x20;
        assert_eq!(sm.set_params(p).unwrap_err(), Status::InvalidHciParams);
        p.itvl_min = ADV_ITVL_NONCONN_MIN;
        p.itvl_max = ADV_ITVL_NONCONN_MIN;
        sm.set_params(p).unwrap();
    }

    #[test]
    fn hd_directed_forces_interval_and_policy() {
        let mut sm = AdvSm::new();
        let mut p = params(AdvType::AdvDirectIndHd);
        p.itvl_min = 0x5000; // Out of range, but ignored for this type.
        p.itvl_max = 0x0001;
        p.filter_policy = AdvFilterPolicy::Both;
        sm.set_params(p).unwrap();
        assert_eq!(sm.params().itvl_min, 0);
        assert_eq!(sm.params().itvl_max, 0);
        assert_eq!(sm.params().filter_policy, AdvFilterPolicy::None);
    }

    #[test]
    fn channel_map_validation() {
        let mut sm = AdvSm::new();
        let mut p = params(AdvType::AdvInd);
        p.chan_map = 0;
        assert_eq!(sm.set_params(p).unwrap_err(), Status::InvalidHciParams);
        p.chan_map = 0x08;
        assert_eq!(sm.set_params(p).unwrap_err(), Status::InvalidHciParams);
        p.chan_map = 0x05;
        sm.set_params(p).unwrap();
    }

    #[test]
    fn set_params_while_enabled_is_disallowed() {
        let mut sm = enabled_sm(params(AdvType::AdvInd));
        assert_eq!(
            sm.set_params(params(AdvType::AdvInd)).unwrap_err(),
            Status::CommandDisallowed
        );
    }

    #[test]
    fn enable_requires_valid_random_address() {
        let mut sm = AdvSm::new();
        let mut p = params(AdvType::AdvInd);
        p.own_addr_kind = AddrKind::Random;
        sm.set_params(p).unwrap();
        let err = sm
            .enable(DeviceAddress::random([0; 6]), Instant::ZERO)
            .unwrap_err();
        assert_eq!(err, Status::InvalidHciParams);
        assert!(!sm.is_enabled());
    }

    #[test]
    fn double_enable_is_a_noop() {
        let mut sm = enabled_sm(params(AdvType::AdvInd));
        assert_eq!(sm.enable(own(), Instant::ZERO).unwrap(), None);
    }

    #[test]
    fn channel_walk_covers_masked_channels_in_order() {
        let mut p = params(AdvType::AdvInd);
        p.chan_map = 0x05; // 37 and 39.
        let mut sm = enabled_sm(p);
        assert_eq!(sm.current_channel().index(), 37);
        assert_eq!(sm.advance_channel(), AdvAdvance::NextChannel);
        assert_eq!(sm.current_channel().index(), 39);
        assert_eq!(sm.advance_channel(), AdvAdvance::EventDone);
        // The walk loops back to the first masked channel.
        assert_eq!(sm.current_channel().index(), 37);
        assert_eq!(sm.stats.events, 1);
    }

    #[test]
    fn single_channel_walk() {
        let mut p = params(AdvType::AdvInd);
        p.chan_map = 0x02;
        let mut sm = enabled_sm(p);
        assert_eq!(sm.current_channel().index(), 38);
        assert_eq!(sm.advance_channel(), AdvAdvance::EventDone);
        assert_eq!(sm.current_channel().index(), 38);
    }

    #[test]
    fn hd_deadline_is_1280_ms() {
        let mut sm = enabled_sm(params(AdvType::AdvDirectIndHd));
        let just_before = Instant::ZERO.wrapping_add(Duration::from_millis(1279));
        let at = Instant::ZERO.wrapping_add(Duration::from_millis(1280));
        assert!(!sm.hd_timeout_due(just_before));
        assert!(sm.hd_timeout_due(at));
        sm.disable();
        assert!(!sm.hd_timeout_due(at));
    }

    #[test]
    fn undirected_has_no_hd_deadline() {
        let sm = enabled_sm(params(AdvType::AdvInd));
        let late = Instant::ZERO.wrapping_add(Duration::from_secs(10));
        assert!(!sm.hd_timeout_due(late));
    }

    #[test]
    fn scan_req_fast_path() {
        let mut p = params(AdvType::AdvInd);
        p.filter_policy = AdvFilterPolicy::ScanWhitelist;
        let sm = enabled_sm(p);
        let scanner = DeviceAddress::random([9; 6]);
        let mut wl = WhiteList::new();
        assert!(!sm.accepts_scan_req(&scanner, &own(), &wl));
        wl.add(scanner).unwrap();
        assert!(sm.accepts_scan_req(&scanner, &own(), &wl));
        // Wrong AdvA: addressed to someone else.
        assert!(!sm.accepts_scan_req(&scanner, &DeviceAddress::public([7; 6]), &wl));
    }

    #[test]
    fn nonconn_never_accepts_requests() {
        let sm = enabled_sm(params(AdvType::AdvNonconnInd));
        let wl = WhiteList::new();
        let peer = DeviceAddress::public([9; 6]);
        assert!(!sm.accepts_scan_req(&peer, &own(), &wl));
        assert!(!sm.accepts_connect_req(&peer, &own(), &wl));
    }

    #[test]
    fn directed_connect_req_requires_exact_initiator() {
        let mut p = params(AdvType::AdvDirectIndHd);
        p.peer = DeviceAddress::random([9; 6]);
        let sm = enabled_sm(p);
        let wl = WhiteList::new();
        assert!(sm.accepts_connect_req(&DeviceAddress::random([9; 6]), &own(), &wl));
        // Same bytes, wrong kind.
        assert!(!sm.accepts_connect_req(&DeviceAddress::public([9; 6]), &own(), &wl));
        assert!(!sm.accepts_connect_req(&DeviceAddress::random([8; 6]), &own(), &wl));
    }

    #[test]
    fn next_event_randomized_except_hd() {
        let mut sm = enabled_sm(params(AdvType::AdvInd));
        let delay = Duration::from_micros(4321);
        let start = sm.schedule_next_event(delay);
        let expected =
            Instant::ZERO.wrapping_add(Duration::from_units_625us(0x0800) + delay);
        assert_eq!(start, expected);

        let mut hd = enabled_sm(params(AdvType::AdvDirectIndHd));
        let start = hd.schedule_next_event(delay);
        assert_eq!(start, Instant::ZERO.wrapping_add(HD_EVENT_ITVL));
    }
}
