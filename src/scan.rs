// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2026.

//! Scanning state machine.
//!
//! Listens on one advertising channel per scan window, rotating channels
//! between windows, windows recurring at the scan interval. Received
//! advertisements pass the filter policy, then the duplicate cache, then
//! become LE Advertising Report events. Active scanning additionally
//! transmits SCAN_REQ within the inter-frame space (the fast path) and
//! reports the SCAN_RSP that comes back.
//!
//! Initiating (the create-connection scan) is a different machine with
//! different matching rules; it lives with the connection code.

use heapless::Vec;

use crate::address::{AddrKind, DeviceAddress};
use crate::config::DUP_CACHE_SIZE;
use crate::error::Status;
use crate::hil::RadioChannel;
use crate::pdu::AdvPduType;
use crate::time::{Duration, Instant};
use crate::whitelist::{ScanFilterPolicy, WhiteList};

pub const SCAN_ITVL_MIN: u16 = 0x0004;
pub const SCAN_ITVL_MAX: u16 = 0x4000;
const SCAN_ITVL_DEFAULT: u16 = 0x0010;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ScanType {
    Passive = 0x00,
    Active = 0x01,
}

impl ScanType {
    pub fn from_u8(v: u8) -> Result<ScanType, Status> {
        match v {
            0x00 => Ok(ScanType::Passive),
            0x01 => Ok(ScanType::Active),
            _ => Err(Status::InvalidHciParams),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ScanParams {
    pub scan_type: ScanType,
    /// 625 µs units.
    pub itvl: u16,
    /// 625 µs units, at most `itvl`.
    pub window: u16,
    pub own_addr_kind: AddrKind,
    pub filter_policy: ScanFilterPolicy,
}

impl Default for ScanParams {
    fn default() -> ScanParams {
        ScanParams {
            scan_type: ScanType::Passive,
            itvl: SCAN_ITVL_DEFAULT,
            window: SCAN_ITVL_DEFAULT,
            own_addr_kind: AddrKind::Public,
            filter_policy: ScanFilterPolicy::None,
        }
    }
}

impl ScanParams {
    pub fn validate(&self) -> Result<(), Status> {
        if self.itvl < SCAN_ITVL_MIN
            || self.itvl > SCAN_ITVL_MAX
            || self.window < SCAN_ITVL_MIN
            || self.window > self.itvl
        {
            return Err(Status::InvalidHciParams);
        }
        if !matches!(self.own_addr_kind, AddrKind::Public | AddrKind::Random) {
            return Err(Status::InvalidHciParams);
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ScanStats {
    pub windows: u32,
    pub reports: u32,
    pub dup_suppressed: u32,
    pub scan_reqs: u32,
    pub late_starts: u32,
}

pub struct ScanSm {
    params: ScanParams,
    enabled: bool,
    filter_duplicates: bool,
    chan: u8,
    window_start: Instant,
    dup_cache: Vec<DeviceAddress, DUP_CACHE_SIZE>,
    /// Active scanning: the advertiser we sent a SCAN_REQ to and expect
    /// a SCAN_RSP from inside this window.
    awaiting_rsp: Option<DeviceAddress>,
    pub stats: ScanStats,
}

impl ScanSm {
    pub fn new() -> ScanSm {
        ScanSm {
            params: ScanParams::default(),
            enabled: false,
            filter_duplicates: false,
            chan: 37,
            window_start: Instant::ZERO,
            dup_cache: Vec::new(),
            awaiting_rsp: None,
            stats: ScanStats::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn uses_whitelist(&self) -> bool {
        self.enabled && self.params.filter_policy.uses_whitelist()
    }

    pub fn params(&self) -> &ScanParams {
        &self.params
    }

    pub fn is_active_scan(&self) -> bool {
        self.params.scan_type == ScanType::Active
    }

    pub fn set_params(&mut self, params: ScanParams) -> Result<(), Status> {
        if self.enabled {
            return Err(Status::CommandDisallowed);
        }
        params.validate()?;
        self.params = params;
        Ok(())
    }

    /// Returns the first window start, or `None` when already enabled.
    /// The duplicate-filter flag is refreshed either way.
    pub fn enable(&mut self, filter_duplicates: bool, now: Instant) -> Option<Instant> {
        self.filter_duplicates = filter_duplicates;
        if self.enabled {
            return None;
        }
        self.enabled = true;
        self.chan = 37;
        self.window_start = now;
        self.dup_cache.clear();
        self.awaiting_rsp = None;
        Some(now)
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.awaiting_rsp = None;
    }

    pub fn current_channel(&self) -> RadioChannel {
        RadioChannel::new(self.chan).unwrap_or(RadioChannel::ADV_37)
    }

    pub fn window_start(&self) -> Instant {
        self.window_start
    }

    pub fn window_len(&self) -> Duration {
        Duration::from_units_625us(self.params.window as u32)
    }

    /// Step to the next scan window: one interval later, next channel.
    pub fn next_window(&mut self) -> Instant {
        self.chan = if self.chan == 39 { 37 } else { self.chan + 1 };
        self.window_start = self
            .window_start
            .wrapping_add(Duration::from_units_625us(self.params.itvl as u32));
        self.awaiting_rsp = None;
        self.stats.windows += 1;
        self.window_start
    }

    /// Filter-policy check for a received advertisement.
    pub fn accepts_adv(&self, adva: &DeviceAddress, whitelist: &WhiteList) -> bool {
        if !self.enabled {
            return false;
        }
        if self.params.filter_policy.uses_whitelist() && !whitelist.matches(adva) {
            return false;
        }
        true
    }

    /// Fast path: should this scannable advertisement get a SCAN_REQ?
    pub fn should_scan_request(&mut self, pdu_type: AdvPduType, adva: &DeviceAddress) -> bool {
        if !self.enabled
            || !self.is_active_scan()
            || self.awaiting_rsp.is_some()
            || !matches!(pdu_type, AdvPduType::AdvInd | AdvPduType::AdvScanInd)
        {
            return false;
        }
        self.awaiting_rsp = Some(*adva);
        self.stats.scan_reqs += 1;
        true
    }

    /// A SCAN_RSP arrived; only the advertiser we asked counts.
    pub fn accepts_scan_rsp(&mut self, adva: &DeviceAddress) -> bool {
        match self.awaiting_rsp {
            Some(expected) if expected == *adva => {
                self.awaiting_rsp = None;
                true
            }
            _ => false,
        }
    }

    /// Duplicate filtering. Recording happens on report emission so a
    /// suppressed advertiser stays suppressed until scanning restarts.
    pub fn should_report(&mut self, adva: &DeviceAddress) -> bool {
        if !self.filter_duplicates {
            return true;
        }
        if self.dup_cache.iter().any(|e| e == adva) {
            self.stats.dup_suppressed += 1;
            return false;
        }
        // A full cache stops suppressing rather than dropping reports.
        let _ = self.dup_cache.push(*adva);
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(last: u8) -> DeviceAddress {
        DeviceAddress::public([0, 0, 0, 0, 0, last])
    }

    #[test]
    fn param_validation() {
        let mut sm = ScanSm::new();
        let mut p = ScanParams::default();
        p.itvl = 0x3;
        assert!(sm.set_params(p).is_err());
        p.itvl = 0x10;
        p.window = 0x11;
        assert!(sm.set_params(p).is_err());
        p.window = 0x10;
        sm.set_params(p).unwrap();
        sm.enable(false, Instant::ZERO).unwrap();
        assert_eq!(sm.set_params(p).unwrap_err(), Status::CommandDisallowed);
    }

    #[test]
    fn windows_rotate_channels() {
        let mut sm = ScanSm::new();
        sm.set_params(ScanParams {
            itvl: 0x20,
            window: 0x10,
            ..ScanParams::default()
        })
        .unwrap();
        sm.enable(false, Instant::ZERO).unwrap();
        assert_eq!(sm.current_channel().index(), 37);
        let next = sm.next_window();
        assert_eq!(sm.current_channel().index(), 38);
        assert_eq!(
            next,
            Instant::ZERO.wrapping_add(Duration::from_units_625us(0x20))
        );
        sm.next_window();
        sm.next_window();
        assert_eq!(sm.current_channel().index(), 37);
    }

    #[test]
    fn duplicate_filtering() {
        let mut sm = ScanSm::new();
        sm.enable(true, Instant::ZERO).unwrap();
        assert!(sm.should_report(&addr(1)));
        assert!(!sm.should_report(&addr(1)));
        assert!(sm.should_report(&addr(2)));
        assert_eq!(sm.stats.dup_suppressed, 1);
        // Disable + enable clears the cache.
        sm.disable();
        sm.enable(true, Instant::ZERO).unwrap();
        assert!(sm.should_report(&addr(1)));
    }

    #[test]
    fn no_filtering_when_disabled_flag() {
        let mut sm = ScanSm::new();
        sm.enable(false, Instant::ZERO).unwrap();
        assert!(sm.should_report(&addr(1)));
        assert!(sm.should_report(&addr(1)));
    }

    #[test]
    fn active_scan_request_once_per_exchange() {
        let mut sm = ScanSm::new();
        sm.set_params(ScanParams {
            scan_type: ScanType::Active,
            ..ScanParams::default()
        })
        .unwrap();
        sm.enable(false, Instant::ZERO).unwrap();
        assert!(sm.should_scan_request(AdvPduType::AdvInd, &addr(1)));
        // Busy awaiting the response; no second request.
        assert!(!sm.should_scan_request(AdvPduType::AdvInd, &addr(2)));
        assert!(!sm.accepts_scan_rsp(&addr(2)));
        assert!(sm.accepts_scan_rsp(&addr(1)));
        assert!(sm.should_scan_request(AdvPduType::AdvInd, &addr(2)));
    }

    #[test]
    fn passive_scan_never_requests() {
        let mut sm = ScanSm::new();
        sm.enable(false, Instant::ZERO).unwrap();
        assert!(!sm.should_scan_request(AdvPduType::AdvInd, &addr(1)));
    }

    #[test]
    fn whitelist_policy_gates_reports() {
        let mut sm = ScanSm::new();
        sm.set_params(ScanParams {
            filter_policy: ScanFilterPolicy::Whitelist,
            ..ScanParams::default()
        })
        .unwrap();
        sm.enable(false, Instant::ZERO).unwrap();
        let mut wl = WhiteList::new();
        assert!(!sm.accepts_adv(&addr(1), &wl));
        wl.add(addr(1)).unwrap();
        assert!(sm.accepts_adv(&addr(1), &wl));
    }
}
