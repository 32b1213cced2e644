// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2026.

//! HCI command decoding, validation and dispatch.
//!
//! Each handler decodes fixed-offset little-endian fields, validates
//! every one against its protocol range, and performs exactly one state
//! machine mutation on success. Validation failures return the status
//! code and touch nothing. Commands that act on an unknown connection
//! handle return `UnknownConnectionId` without side effects.
//!
//! Commands that complete asynchronously (Disconnect, Create Connection,
//! the remote feature/version reads, Start Encryption, Connection
//! Update) answer with Command Status and deliver their result in a
//! later event; everything else answers with Command Complete. A remote
//! read whose answer is already cached still produces the completion
//! event so the host is never left waiting.

use heapless::Vec;

use crate::address::{AddrKind, DeviceAddress, BD_ADDR_LEN};
use crate::adv::{AdvParams, AdvType};
use crate::config::{ACL_PAYLOAD_LEN, CONN_TX_QUEUE_LEN};
use crate::conn::llcp::{ConnParamValues, Procedure, StartOutcome};
use crate::conn::params::ConnParams;
use crate::conn::{ConnRole, EncState, PendingCreate};
use crate::error::Status;
use crate::hci::event::{self, EventBuf};
use crate::hci::{self, le16, le64};
use crate::hil::{Alarm, BleRadio, Rng};
use crate::ll::{LinkLayer, RadioOp};
use crate::scan::{ScanParams, ScanType};
use crate::sched::{SchedItem, SchedKind};
use crate::time::Instant;
use crate::whitelist::{AdvFilterPolicy, ScanFilterPolicy};

/// Command Complete return parameters (status byte first).
type Ret = Vec<u8, 28>;

fn ret_status(status: Status) -> Ret {
    let mut r = Ret::new();
    let _ = r.push(status.to_u8());
    r
}

fn ret_ok() -> Ret {
    ret_status(Status::Success)
}

fn ret_with(status: Status, extra: &[u8]) -> Ret {
    let mut r = ret_status(status);
    let _ = r.extend_from_slice(extra);
    r
}

impl<R: BleRadio, A: Alarm, G: Rng> LinkLayer<R, A, G> {
    /// Process one HCI command packet (task context). The response
    /// event, and any synthetic completion it implies, are queued for
    /// [`LinkLayer::pop_host_event`].
    pub fn hci_command(&mut self, packet: &[u8]) {
        let Ok((op, p)) = hci::split_command(packet) else {
            self.emit(event::command_status(0, Status::InvalidHciParams));
            return;
        };
        let now = self.alarm.now();
        match op {
            hci::OCMD_DISCONNECT
            | hci::OCMD_READ_REMOTE_VERSION
            | hci::OCMD_LE_CREATE_CONN
            | hci::OCMD_LE_CONN_UPDATE
            | hci::OCMD_LE_READ_REMOTE_FEATURES
            | hci::OCMD_LE_START_ENCRYPTION => {
                let (status, followup) = match self.status_command(op, p, now) {
                    Ok(followup) => (Status::Success, followup),
                    Err(status) => (status, None),
                };
                self.emit(event::command_status(op, status));
                if let Some(ev) = followup {
                    self.emit(ev);
                }
            }
            _ => {
                let (ret, followup) = self.complete_command(op, p, now);
                self.emit(event::command_complete(op, &ret));
                if let Some(ev) = followup {
                    self.emit(ev);
                }
            }
        }
        self.run_pending();
    }

    /// Command Status flavored commands. `Ok` may carry a synthetic
    /// completion event to deliver right after the status.
    fn status_command(
        &mut self,
        op: u16,
        p: &[u8],
        now: Instant,
    ) -> Result<Option<EventBuf>, Status> {
        match op {
            hci::OCMD_DISCONNECT => self.cmd_disconnect(p),
            hci::OCMD_READ_REMOTE_VERSION => self.cmd_read_remote_version(p, now),
            hci::OCMD_LE_CREATE_CONN => self.cmd_le_create_conn(p, now),
            hci::OCMD_LE_CONN_UPDATE => self.cmd_le_conn_update(p, now),
            hci::OCMD_LE_READ_REMOTE_FEATURES => self.cmd_le_read_remote_features(p, now),
            hci::OCMD_LE_START_ENCRYPTION => self.cmd_le_start_encryption(p, now),
            _ => Err(Status::UnknownHciCommand),
        }
    }

    fn complete_command(&mut self, op: u16, p: &[u8], now: Instant) -> (Ret, Option<EventBuf>) {
        let ret = match op {
            hci::OCMD_SET_EVENT_MASK => self.cmd_set_event_mask(p),
            hci::OCMD_RESET => {
                self.reset();
                ret_ok()
            }
            hci::OCMD_READ_LOCAL_VERSION => self.cmd_read_local_version(p),
            hci::OCMD_READ_LOCAL_FEATURES => self.cmd_read_local_features(p),
            hci::OCMD_READ_BD_ADDR => self.cmd_read_bd_addr(p),
            hci::OCMD_LE_SET_EVENT_MASK => self.cmd_le_set_event_mask(p),
            hci::OCMD_LE_READ_BUFFER_SIZE => self.cmd_le_read_buffer_size(p),
            hci::OCMD_LE_READ_LOCAL_FEATURES => {
                self.check_len(p, 0)
                    .map(|_| ret_with(Status::Success, &hci::LOCAL_LE_FEATURES.to_le_bytes()))
                    .unwrap_or_else(ret_status)
            }
            hci::OCMD_LE_SET_RANDOM_ADDRESS => self.cmd_le_set_random_address(p),
            hci::OCMD_LE_SET_ADV_PARAMS => self.cmd_le_set_adv_params(p),
            hci::OCMD_LE_SET_ADV_DATA => self.cmd_le_set_adv_data(p),
            hci::OCMD_LE_SET_SCAN_RSP_DATA => self.cmd_le_set_scan_rsp_data(p),
            hci::OCMD_LE_SET_ADV_ENABLE => self.cmd_le_set_adv_enable(p, now),
            hci::OCMD_LE_SET_SCAN_PARAMS => self.cmd_le_set_scan_params(p),
            hci::OCMD_LE_SET_SCAN_ENABLE => self.cmd_le_set_scan_enable(p, now),
            hci::OCMD_LE_CREATE_CONN_CANCEL => {
                return self.cmd_le_create_conn_cancel(p);
            }
            hci::OCMD_LE_READ_WHITE_LIST_SIZE => self
                .check_len(p, 0)
                .map(|_| ret_with(Status::Success, &[self.whitelist.capacity() as u8]))
                .unwrap_or_else(ret_status),
            hci::OCMD_LE_CLEAR_WHITE_LIST => self.cmd_le_clear_white_list(p),
            hci::OCMD_LE_ADD_WHITE_LIST => self.cmd_le_modify_white_list(p, true),
            hci::OCMD_LE_REMOVE_WHITE_LIST => self.cmd_le_modify_white_list(p, false),
            hci::OCMD_LE_SET_HOST_CHAN_CLASS => self.cmd_le_set_host_chan_class(p, now),
            hci::OCMD_LE_READ_CHAN_MAP => self.cmd_le_read_chan_map(p),
            hci::OCMD_LE_RAND => self.cmd_le_rand(p),
            hci::OCMD_LE_LTK_REQ_REPLY => self.cmd_le_ltk_req_reply(p),
            hci::OCMD_LE_LTK_REQ_NEG_REPLY => self.cmd_le_ltk_req_neg_reply(p),
            hci::OCMD_LE_READ_SUPPORTED_STATES => self
                .check_len(p, 0)
                .map(|_| ret_with(Status::Success, &hci::SUPPORTED_STATES.to_le_bytes()))
                .unwrap_or_else(ret_status),
            _ => ret_status(Status::UnknownHciCommand),
        };
        (ret, None)
    }

    fn check_len(&self, p: &[u8], expect: usize) -> Result<(), Status> {
        if p.len() == expect {
            Ok(())
        } else {
            Err(Status::InvalidHciParams)
        }
    }

    // ------------------------------------------------------------------
    // Controller & baseband / informational.
    // ------------------------------------------------------------------

    fn cmd_set_event_mask(&mut self, p: &[u8]) -> Ret {
        if p.len() != 8 {
            return ret_status(Status::InvalidHciParams);
        }
        self.event_mask = le64(p, 0);
        ret_ok()
    }

    fn cmd_le_set_event_mask(&mut self, p: &[u8]) -> Ret {
        if p.len() != 8 {
            return ret_status(Status::InvalidHciParams);
        }
        self.le_event_mask = le64(p, 0);
        ret_ok()
    }

    fn cmd_read_local_version(&self, p: &[u8]) -> Ret {
        if !p.is_empty() {
            return ret_status(Status::InvalidHciParams);
        }
        let mut r = ret_ok();
        let _ = r.push(hci::HCI_VERSION);
        let _ = r.extend_from_slice(&0u16.to_le_bytes()); // HCI revision
        let _ = r.push(hci::LMP_VERSION);
        let _ = r.extend_from_slice(&hci::COMPANY_ID.to_le_bytes());
        let _ = r.extend_from_slice(&hci::SUBVERSION.to_le_bytes());
        r
    }

    fn cmd_read_local_features(&self, p: &[u8]) -> Ret {
        if !p.is_empty() {
            return ret_status(Status::InvalidHciParams);
        }
        // LE supported (bit 38), BR/EDR not supported (bit 37).
        let mut features = [0u8; 8];
        features[4] = 0x60;
        ret_with(Status::Success, &features)
    }

    fn cmd_read_bd_addr(&self, p: &[u8]) -> Ret {
        if !p.is_empty() {
            return ret_status(Status::InvalidHciParams);
        }
        ret_with(Status::Success, &self.config.public_addr)
    }

    fn cmd_le_read_buffer_size(&self, p: &[u8]) -> Ret {
        if !p.is_empty() {
            return ret_status(Status::InvalidHciParams);
        }
        let mut r = ret_ok();
        let _ = r.extend_from_slice(&(ACL_PAYLOAD_LEN as u16).to_le_bytes());
        let _ = r.push(CONN_TX_QUEUE_LEN as u8);
        r
    }

    fn cmd_le_rand(&mut self, p: &[u8]) -> Ret {
        if !p.is_empty() {
            return ret_status(Status::InvalidHciParams);
        }
        ret_with(Status::Success, &self.rng.next_u64().to_le_bytes())
    }

    // ------------------------------------------------------------------
    // Advertising.
    // ------------------------------------------------------------------

    fn cmd_le_set_random_address(&mut self, p: &[u8]) -> Ret {
        if p.len() != BD_ADDR_LEN {
            return ret_status(Status::InvalidHciParams);
        }
        if self.adv.is_enabled() || self.scan.is_enabled() || self.pending_create.is_some() {
            return ret_status(Status::CommandDisallowed);
        }
        let mut bytes = [0; BD_ADDR_LEN];
        bytes.copy_from_slice(p);
        if !DeviceAddress::random(bytes).is_valid_random() {
            return ret_status(Status::InvalidHciParams);
        }
        self.random_addr = Some(bytes);
        ret_ok()
    }

    fn cmd_le_set_adv_params(&mut self, p: &[u8]) -> Ret {
        if p.len() != 15 {
            return ret_status(Status::InvalidHciParams);
        }
        let adv_type = match AdvType::from_u8(p[4]) {
            Ok(t) => t,
            Err(s) => return ret_status(s),
        };
        let own_addr_kind = match AddrKind::from_u8(p[5]) {
            Ok(k) => k,
            Err(s) => return ret_status(s),
        };
        let peer_kind = match AddrKind::from_u8(p[6]) {
            Ok(k) => k,
            Err(s) => return ret_status(s),
        };
        let mut peer_bytes = [0; BD_ADDR_LEN];
        peer_bytes.copy_from_slice(&p[7..13]);
        let filter_policy = match AdvFilterPolicy::from_u8(p[14]) {
            Ok(f) => f,
            Err(s) => return ret_status(s),
        };
        let params = AdvParams {
            itvl_min: le16(p, 0),
            itvl_max: le16(p, 2),
            adv_type,
            own_addr_kind,
            peer: DeviceAddress::new(peer_kind, peer_bytes),
            chan_map: p[13],
            filter_policy,
        };
        match self.adv.set_params(params) {
            Ok(()) => ret_ok(),
            Err(s) => ret_status(s),
        }
    }

    fn cmd_le_set_adv_data(&mut self, p: &[u8]) -> Ret {
        // Fixed 32-byte parameter block: length byte + 31 data bytes.
        if p.len() != 32 || p[0] > 31 {
            return ret_status(Status::InvalidHciParams);
        }
        let len = p[0] as usize;
        match self.adv.set_adv_data(&p[1..1 + len]) {
            Ok(()) => ret_ok(),
            Err(s) => ret_status(s),
        }
    }

    fn cmd_le_set_scan_rsp_data(&mut self, p: &[u8]) -> Ret {
        if p.len() != 32 || p[0] > 31 {
            return ret_status(Status::InvalidHciParams);
        }
        let len = p[0] as usize;
        match self.adv.set_scan_rsp_data(&p[1..1 + len]) {
            Ok(()) => ret_ok(),
            Err(s) => ret_status(s),
        }
    }

    fn cmd_le_set_adv_enable(&mut self, p: &[u8], now: Instant) -> Ret {
        if p.len() != 1 || p[0] > 1 {
            return ret_status(Status::InvalidHciParams);
        }
        if p[0] == 1 {
            let own = match self.own_address(self.adv.params().own_addr_kind) {
                Ok(a) => a,
                Err(s) => return ret_status(s),
            };
            match self.adv.enable(own, now) {
                // Already enabled: success without touching the schedule.
                Ok(None) => ret_ok(),
                Ok(Some(start)) => {
                    let item = SchedItem {
                        kind: SchedKind::Advertising,
                        start,
                        end: start.wrapping_add(crate::adv::ADV_SLOT),
                    };
                    if self
                        .sched
                        .reschedule(item, crate::adv::ADV_SLOT, self.adv_reschedule_horizon())
                        .is_err()
                    {
                        self.adv.disable();
                        return ret_status(Status::ControllerBusy);
                    }
                    ret_ok()
                }
                Err(s) => ret_status(s),
            }
        } else {
            self.adv.disable();
            self.sched.remove(SchedKind::Advertising);
            // Force the radio idle if we were mid-advertisement.
            if matches!(
                self.cur_op,
                RadioOp::AdvTx | RadioOp::AdvRx | RadioOp::AdvRespTx
            ) {
                self.radio.disable();
                self.cur_op = RadioOp::Idle;
                self.op_deadline = None;
            }
            ret_ok()
        }
    }

    fn adv_reschedule_horizon(&self) -> crate::time::Duration {
        crate::time::Duration::from_millis(10)
    }

    // ------------------------------------------------------------------
    // Scanning.
    // ------------------------------------------------------------------

    fn cmd_le_set_scan_params(&mut self, p: &[u8]) -> Ret {
        if p.len() != 7 {
            return ret_status(Status::InvalidHciParams);
        }
        let scan_type = match ScanType::from_u8(p[0]) {
            Ok(t) => t,
            Err(s) => return ret_status(s),
        };
        let own_addr_kind = match AddrKind::from_u8(p[5]) {
            Ok(k) => k,
            Err(s) => return ret_status(s),
        };
        let filter_policy = match ScanFilterPolicy::from_u8(p[6]) {
            Ok(f) => f,
            Err(s) => return ret_status(s),
        };
        let params = ScanParams {
            scan_type,
            itvl: le16(p, 1),
            window: le16(p, 3),
            own_addr_kind,
            filter_policy,
        };
        match self.scan.set_params(params) {
            Ok(()) => ret_ok(),
            Err(s) => ret_status(s),
        }
    }

    fn cmd_le_set_scan_enable(&mut self, p: &[u8], now: Instant) -> Ret {
        if p.len() != 2 || p[0] > 1 || p[1] > 1 {
            return ret_status(Status::InvalidHciParams);
        }
        if p[0] == 1 {
            // The initiator owns the listening machinery while a
            // connection is being created.
            if self.pending_create.is_some() {
                return ret_status(Status::CommandDisallowed);
            }
            if self.scan.params().own_addr_kind == AddrKind::Random && self.random_addr.is_none() {
                return ret_status(Status::InvalidHciParams);
            }
            if self.scan.enable(p[1] == 1, now).is_some() {
                self.schedule_listen_window(now);
            }
            ret_ok()
        } else {
            if self.scan.is_enabled() {
                self.scan.disable();
                self.sched.remove(SchedKind::Scan);
                if matches!(self.cur_op, RadioOp::ScanRx | RadioOp::ScanReqTx) {
                    self.radio.disable();
                    self.cur_op = RadioOp::Idle;
                    self.op_deadline = None;
                }
            }
            ret_ok()
        }
    }

    // ------------------------------------------------------------------
    // White list.
    // ------------------------------------------------------------------

    /// White list mutation races filter evaluation; reject it while any
    /// machine with a white-list policy is live.
    fn whitelist_busy(&self) -> bool {
        self.adv.uses_whitelist()
            || self.scan.uses_whitelist()
            || self
                .pending_create
                .as_ref()
                .is_some_and(|pc| pc.filter_policy.uses_whitelist())
    }

    fn cmd_le_clear_white_list(&mut self, p: &[u8]) -> Ret {
        if !p.is_empty() {
            return ret_status(Status::InvalidHciParams);
        }
        if self.whitelist_busy() {
            return ret_status(Status::CommandDisallowed);
        }
        self.whitelist.clear();
        ret_ok()
    }

    fn cmd_le_modify_white_list(&mut self, p: &[u8], add: bool) -> Ret {
        if p.len() != 7 {
            return ret_status(Status::InvalidHciParams);
        }
        let kind = match AddrKind::from_u8(p[0]) {
            Ok(k @ (AddrKind::Public | AddrKind::Random)) => k,
            _ => return ret_status(Status::InvalidHciParams),
        };
        if self.whitelist_busy() {
            return ret_status(Status::CommandDisallowed);
        }
        let mut bytes = [0; BD_ADDR_LEN];
        bytes.copy_from_slice(&p[1..7]);
        let addr = DeviceAddress::new(kind, bytes);
        let result = if add {
            self.whitelist.add(addr)
        } else {
            self.whitelist.remove(&addr)
        };
        match result {
            Ok(()) => ret_ok(),
            Err(s) => ret_status(s),
        }
    }

    // ------------------------------------------------------------------
    // Connections.
    // ------------------------------------------------------------------

    fn decode_conn_params(p: &[u8], at: usize) -> ConnParams {
        ConnParams {
            itvl_min: le16(p, at),
            itvl_max: le16(p, at + 2),
            latency: le16(p, at + 4),
            supervision_timeout: le16(p, at + 6),
            min_ce_len: le16(p, at + 8),
            max_ce_len: le16(p, at + 10),
        }
    }

    fn cmd_le_create_conn(&mut self, p: &[u8], now: Instant) -> Result<Option<EventBuf>, Status> {
        if p.len() != 25 {
            return Err(Status::InvalidHciParams);
        }
        if self.pending_create.is_some() || self.scan.is_enabled() {
            return Err(Status::CommandDisallowed);
        }
        let scan_itvl = le16(p, 0);
        let scan_window = le16(p, 2);
        if !(0x0004..=0x4000).contains(&scan_itvl)
            || !(0x0004..=0x4000).contains(&scan_window)
            || scan_window > scan_itvl
        {
            return Err(Status::InvalidHciParams);
        }
        let filter_policy = ScanFilterPolicy::from_u8(p[4])?;
        let peer_kind = AddrKind::from_u8(p[5])?;
        let mut peer_bytes = [0; BD_ADDR_LEN];
        peer_bytes.copy_from_slice(&p[6..12]);
        let own_kind = AddrKind::from_u8(p[12])?;
        let params = Self::decode_conn_params(p, 13);
        params.validate()?;
        if params.min_ce_len > params.max_ce_len {
            return Err(Status::InvalidHciParams);
        }
        let own = self.own_address(own_kind)?;
        if self.conns.is_full() {
            return Err(Status::ConnLimit);
        }
        let peer = match filter_policy {
            ScanFilterPolicy::None => {
                let peer = DeviceAddress::new(peer_kind, peer_bytes);
                if self.conns.find_peer(&peer).is_some() {
                    return Err(Status::AclConnExists);
                }
                Some(peer)
            }
            ScanFilterPolicy::Whitelist => None,
        };
        let pc = PendingCreate {
            peer,
            filter_policy,
            own_addr: own,
            scan_itvl,
            scan_window,
            params,
            chan: 37,
            window_start: now,
            req_in_flight: false,
            target: None,
            lldata: None,
        };
        self.pending_create = Some(pc);
        self.schedule_listen_window(now);
        Ok(None)
    }

    fn cmd_le_create_conn_cancel(&mut self, p: &[u8]) -> (Ret, Option<EventBuf>) {
        if !p.is_empty() {
            return (ret_status(Status::InvalidHciParams), None);
        }
        match self.pending_create.take() {
            Some(_) => {
                self.sched.remove(SchedKind::Scan);
                if matches!(self.cur_op, RadioOp::InitRx | RadioOp::ConnReqTx) {
                    self.radio.disable();
                    self.cur_op = RadioOp::Idle;
                    self.op_deadline = None;
                }
                // Command Complete first, then the connection-complete
                // with Unknown Connection Identifier, per the Core Spec
                // ordering.
                (
                    ret_ok(),
                    Some(event::le_conn_complete_error(Status::UnknownConnectionId)),
                )
            }
            None => (ret_status(Status::CommandDisallowed), None),
        }
    }

    fn cmd_disconnect(&mut self, p: &[u8]) -> Result<Option<EventBuf>, Status> {
        if p.len() != 3 {
            return Err(Status::InvalidHciParams);
        }
        let handle = le16(p, 0);
        let reason = Status::from_u8(p[2]);
        if !reason.valid_disconnect_reason() {
            return Err(Status::InvalidHciParams);
        }
        let now = self.alarm.now();
        let conn = self
            .conns
            .get_mut(handle)
            .ok_or(Status::UnknownConnectionId)?;
        conn.request_disconnect(reason)?;
        if conn.procs.start(Procedure::Terminate, now) == StartOutcome::Started {
            self.open_procedure(handle, Procedure::Terminate);
        }
        Ok(None)
    }

    fn cmd_read_remote_version(
        &mut self,
        p: &[u8],
        now: Instant,
    ) -> Result<Option<EventBuf>, Status> {
        if p.len() != 2 {
            return Err(Status::InvalidHciParams);
        }
        let handle = le16(p, 0);
        let conn = self
            .conns
            .get_mut(handle)
            .ok_or(Status::UnknownConnectionId)?;
        if let Some((version, company, subversion)) = conn.peer_version {
            // Already exchanged: synthesize the completion.
            return Ok(Some(event::read_remote_version_complete(
                Status::Success,
                handle,
                version,
                company,
                subversion,
            )));
        }
        match conn.procs.start(Procedure::VersionXchg, now) {
            StartOutcome::Started => self.open_procedure(handle, Procedure::VersionXchg),
            StartOutcome::Queued | StartOutcome::AlreadyPending => {
                conn.version_event_owed = true;
            }
        }
        Ok(None)
    }

    fn cmd_le_read_remote_features(
        &mut self,
        p: &[u8],
        now: Instant,
    ) -> Result<Option<EventBuf>, Status> {
        if p.len() != 2 {
            return Err(Status::InvalidHciParams);
        }
        let handle = le16(p, 0);
        let le_ok = self.event_mask & event::MASK_LE_META != 0
            && self.le_event_mask & event::LE_MASK_READ_REMOTE_FEATURES != 0;
        let conn = self
            .conns
            .get_mut(handle)
            .ok_or(Status::UnknownConnectionId)?;
        if let Some(features) = conn.peer_features {
            return Ok(le_ok.then(|| {
                event::le_read_remote_features_complete(Status::Success, handle, features)
            }));
        }
        match conn.procs.start(Procedure::FeatureXchg, now) {
            StartOutcome::Started => self.open_procedure(handle, Procedure::FeatureXchg),
            StartOutcome::Queued | StartOutcome::AlreadyPending => {
                conn.feature_event_owed = true;
            }
        }
        Ok(None)
    }

    fn cmd_le_conn_update(&mut self, p: &[u8], now: Instant) -> Result<Option<EventBuf>, Status> {
        if p.len() != 14 {
            return Err(Status::InvalidHciParams);
        }
        let handle = le16(p, 0);
        let params = Self::decode_conn_params(p, 2);
        params.validate()?;
        let conn = self
            .conns
            .get_mut(handle)
            .ok_or(Status::UnknownConnectionId)?;
        if conn.disconnecting.is_some() {
            return Err(Status::CommandDisallowed);
        }
        let proc = match conn.role {
            ConnRole::Master => Procedure::ConnUpdate,
            // The slave negotiates through the parameter request.
            ConnRole::Slave => Procedure::ConnParam,
        };
        if conn.procs.is_pending(proc) {
            return Err(Status::CommandDisallowed);
        }
        conn.requested_params = Some(ConnParamValues {
            itvl_min: params.itvl_min,
            itvl_max: params.itvl_max,
            latency: params.latency,
            timeout: params.supervision_timeout,
        });
        if conn.procs.start(proc, now) == StartOutcome::Started {
            self.open_procedure(handle, proc);
        }
        Ok(None)
    }

    fn cmd_le_set_host_chan_class(&mut self, p: &[u8], now: Instant) -> Ret {
        if p.len() != 5 || p[4] & 0xe0 != 0 {
            return ret_status(Status::InvalidHciParams);
        }
        let mut map = [0; 5];
        map.copy_from_slice(p);
        let used: u32 = map.iter().map(|b| b.count_ones()).sum();
        if used < 2 {
            return ret_status(Status::InvalidHciParams);
        }
        self.host_chan_map = map;
        // Push the new map to every master link.
        let mut to_open: Vec<u16, { crate::config::MAX_CONNECTIONS }> = Vec::new();
        for conn in self.conns.iter_mut() {
            if conn.role == ConnRole::Master
                && conn.procs.start(Procedure::ChanMapUpdate, now) == StartOutcome::Started
            {
                let _ = to_open.push(conn.handle());
            }
        }
        for handle in to_open {
            self.open_procedure(handle, Procedure::ChanMapUpdate);
        }
        ret_ok()
    }

    fn cmd_le_read_chan_map(&mut self, p: &[u8]) -> Ret {
        if p.len() != 2 {
            return ret_status(Status::InvalidHciParams);
        }
        let handle = le16(p, 0);
        match self.conns.get(handle) {
            Some(conn) => {
                let mut r = ret_ok();
                let _ = r.extend_from_slice(&handle.to_le_bytes());
                let _ = r.extend_from_slice(&conn.chan_map());
                r
            }
            None => ret_with(Status::UnknownConnectionId, &handle.to_le_bytes()),
        }
    }

    fn cmd_le_start_encryption(
        &mut self,
        p: &[u8],
        now: Instant,
    ) -> Result<Option<EventBuf>, Status> {
        if p.len() != 28 {
            return Err(Status::InvalidHciParams);
        }
        let handle = le16(p, 0);
        let conn = self
            .conns
            .get_mut(handle)
            .ok_or(Status::UnknownConnectionId)?;
        if conn.role != ConnRole::Master || conn.enc_state != EncState::Off {
            return Err(Status::CommandDisallowed);
        }
        if conn.procs.is_pending(Procedure::Encrypt) {
            return Err(Status::CommandDisallowed);
        }
        conn.enc_keys.rand = le64(p, 2);
        conn.enc_keys.ediv = le16(p, 10);
        conn.enc_keys.ltk.copy_from_slice(&p[12..28]);
        if conn.procs.start(Procedure::Encrypt, now) == StartOutcome::Started {
            self.open_procedure(handle, Procedure::Encrypt);
        }
        Ok(None)
    }

    fn cmd_le_ltk_req_reply(&mut self, p: &[u8]) -> Ret {
        if p.len() != 18 {
            return ret_status(Status::InvalidHciParams);
        }
        let handle = le16(p, 0);
        let Some(conn) = self.conns.get_mut(handle) else {
            return ret_with(Status::UnknownConnectionId, &handle.to_le_bytes());
        };
        if conn.enc_state != EncState::LtkWait || !conn.host_reply_awaited {
            return ret_with(Status::CommandDisallowed, &handle.to_le_bytes());
        }
        conn.enc_keys.ltk.copy_from_slice(&p[2..18]);
        conn.host_reply_awaited = false;
        conn.enc_state = EncState::Starting;
        let _ = conn.enqueue_ctrl(crate::conn::llcp::LlcpPdu::StartEncReq);
        ret_with(Status::Success, &handle.to_le_bytes())
    }

    fn cmd_le_ltk_req_neg_reply(&mut self, p: &[u8]) -> Ret {
        if p.len() != 2 {
            return ret_status(Status::InvalidHciParams);
        }
        let handle = le16(p, 0);
        let Some(conn) = self.conns.get_mut(handle) else {
            return ret_with(Status::UnknownConnectionId, &handle.to_le_bytes());
        };
        if conn.enc_state != EncState::LtkWait || !conn.host_reply_awaited {
            return ret_with(Status::CommandDisallowed, &handle.to_le_bytes());
        }
        conn.host_reply_awaited = false;
        conn.enc_state = EncState::Off;
        let _ = conn.enqueue_ctrl(crate::conn::llcp::LlcpPdu::RejectInd {
            error: Status::PinKeyMissing as u8,
        });
        ret_with(Status::Success, &handle.to_le_bytes())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::conn::Connection;
    use crate::pdu::LlData;
    use crate::testutil::{controller, TestLl, PUBLIC_ADDR};

    fn run(ll: &mut TestLl, op: u16, params: &[u8]) -> EventBuf {
        let mut packet: heapless::Vec<u8, 64> = heapless::Vec::new();
        packet.extend_from_slice(&op.to_le_bytes()).unwrap();
        packet.push(params.len() as u8).unwrap();
        packet.extend_from_slice(params).unwrap();
        ll.hci_command(&packet);
        let e = ll.pop_host_event().expect("no response event");
        while ll.pop_host_event().is_some() {}
        e
    }

    fn add_conn(ll: &mut TestLl, role: ConnRole) -> u16 {
        let lld = LlData {
            access_addr: 0x50ab_36cd,
            crc_init: 0x00aa_bbcc,
            win_size: 1,
            win_offset: 0,
            interval: 40,
            latency: 0,
            timeout: 200,
            chan_map: [0xff, 0xff, 0xff, 0xff, 0x1f],
            hop: 7,
            sca: 0,
        };
        ll.conns
            .insert_with(|h| {
                Connection::new(
                    h,
                    role,
                    DeviceAddress::public(PUBLIC_ADDR),
                    DeviceAddress::public([9; 6]),
                    &lld,
                    crate::time::Instant::ZERO,
                )
            })
            .unwrap()
    }

    #[test]
    fn read_bd_addr_returns_the_public_address() {
        let mut ll = controller();
        let e = run(&mut ll, hci::OCMD_READ_BD_ADDR, &[]);
        assert_eq!(e[5], 0);
        assert_eq!(&e[6..12], &PUBLIC_ADDR);
    }

    #[test]
    fn le_read_buffer_size_reports_acl_limits() {
        let mut ll = controller();
        let e = run(&mut ll, hci::OCMD_LE_READ_BUFFER_SIZE, &[]);
        assert_eq!(e[5], 0);
        assert_eq!(u16::from_le_bytes([e[6], e[7]]), ACL_PAYLOAD_LEN as u16);
        assert_eq!(e[8], CONN_TX_QUEUE_LEN as u8);
    }

    #[test]
    fn read_local_version_layout() {
        let mut ll = controller();
        let e = run(&mut ll, hci::OCMD_READ_LOCAL_VERSION, &[]);
        assert_eq!(e[5], 0);
        assert_eq!(e[6], hci::HCI_VERSION);
        assert_eq!(u16::from_le_bytes([e[10], e[11]]), hci::COMPANY_ID);
    }

    #[test]
    fn adv_data_must_be_a_32_byte_block() {
        let mut ll = controller();
        // Truncated parameter block.
        let e = run(&mut ll, hci::OCMD_LE_SET_ADV_DATA, &[3, 1, 2, 3]);
        assert_eq!(e[5], Status::InvalidHciParams.to_u8());
        // Length byte over 31.
        let mut p = [0u8; 32];
        p[0] = 32;
        let e = run(&mut ll, hci::OCMD_LE_SET_ADV_DATA, &p);
        assert_eq!(e[5], Status::InvalidHciParams.to_u8());
        p[0] = 31;
        let e = run(&mut ll, hci::OCMD_LE_SET_ADV_DATA, &p);
        assert_eq!(e[5], 0);
    }

    #[test]
    fn random_own_address_requires_set_random_address() {
        let mut ll = controller();
        let mut p = [0u8; 15];
        p[0..2].copy_from_slice(&32u16.to_le_bytes());
        p[2..4].copy_from_slice(&32u16.to_le_bytes());
        p[5] = 0x01; // own address type: random
        p[13] = 0x07;
        let e = run(&mut ll, hci::OCMD_LE_SET_ADV_PARAMS, &p);
        assert_eq!(e[5], 0);
        let e = run(&mut ll, hci::OCMD_LE_SET_ADV_ENABLE, &[1]);
        assert_eq!(e[5], Status::InvalidHciParams.to_u8());

        let e = run(
            &mut ll,
            hci::OCMD_LE_SET_RANDOM_ADDRESS,
            &[0xc0, 1, 2, 3, 4, 5],
        );
        assert_eq!(e[5], 0);
        let e = run(&mut ll, hci::OCMD_LE_SET_ADV_ENABLE, &[1]);
        assert_eq!(e[5], 0);
        // TxAdd is set on the outgoing PDU.
        let (pdu, _, _) = ll.radio.adv_tx.clone().unwrap();
        assert_eq!(pdu[0] & 0x40, 0x40);
    }

    #[test]
    fn set_random_address_rejects_all_zero() {
        let mut ll = controller();
        let e = run(&mut ll, hci::OCMD_LE_SET_RANDOM_ADDRESS, &[0; 6]);
        assert_eq!(e[5], Status::InvalidHciParams.to_u8());
    }

    #[test]
    fn le_rand_returns_eight_bytes() {
        let mut ll = controller();
        let e = run(&mut ll, hci::OCMD_LE_RAND, &[]);
        assert_eq!(e[1], 12); // ncmd + opcode + status + 8 bytes
        assert_eq!(e[5], 0);
        assert_ne!(&e[6..14], &[0; 8]);
    }

    #[test]
    fn host_chan_class_validation() {
        let mut ll = controller();
        // Bits above channel 36.
        let e = run(
            &mut ll,
            hci::OCMD_LE_SET_HOST_CHAN_CLASS,
            &[0xff, 0xff, 0xff, 0xff, 0x3f],
        );
        assert_eq!(e[5], Status::InvalidHciParams.to_u8());
        // Fewer than two usable channels.
        let e = run(
            &mut ll,
            hci::OCMD_LE_SET_HOST_CHAN_CLASS,
            &[0x01, 0, 0, 0, 0],
        );
        assert_eq!(e[5], Status::InvalidHciParams.to_u8());
        let e = run(
            &mut ll,
            hci::OCMD_LE_SET_HOST_CHAN_CLASS,
            &[0xff, 0, 0, 0, 0x10],
        );
        assert_eq!(e[5], 0);
        assert_eq!(ll.host_chan_map, [0xff, 0, 0, 0, 0x10]);
    }

    #[test]
    fn chan_map_update_reaches_master_links() {
        let mut ll = controller();
        let master = add_conn(&mut ll, ConnRole::Master);
        let slave = add_conn(&mut ll, ConnRole::Slave);
        let e = run(
            &mut ll,
            hci::OCMD_LE_SET_HOST_CHAN_CLASS,
            &[0xff, 0xff, 0, 0, 0],
        );
        assert_eq!(e[5], 0);
        let m = ll.conns.get(master).unwrap();
        assert_eq!(m.procs.active(), Some(Procedure::ChanMapUpdate));
        assert_eq!(m.tx_queue_len(), 1);
        let s = ll.conns.get(slave).unwrap();
        assert_eq!(s.procs.active(), None);
    }

    #[test]
    fn read_chan_map_round_trips() {
        let mut ll = controller();
        let handle = add_conn(&mut ll, ConnRole::Slave);
        let e = run(&mut ll, hci::OCMD_LE_READ_CHAN_MAP, &handle.to_le_bytes());
        assert_eq!(e[5], 0);
        assert_eq!(&e[8..13], &[0xff, 0xff, 0xff, 0xff, 0x1f]);
    }

    #[test]
    fn conn_update_rejected_while_pending() {
        let mut ll = controller();
        let handle = add_conn(&mut ll, ConnRole::Master);
        let mut p = [0u8; 14];
        p[0..2].copy_from_slice(&handle.to_le_bytes());
        p[2..4].copy_from_slice(&24u16.to_le_bytes());
        p[4..6].copy_from_slice(&40u16.to_le_bytes());
        p[8..10].copy_from_slice(&200u16.to_le_bytes());
        let e = run(&mut ll, hci::OCMD_LE_CONN_UPDATE, &p);
        assert_eq!(e[2], 0);
        {
            let conn = ll.conns.get(handle).unwrap();
            assert_eq!(conn.procs.active(), Some(Procedure::ConnUpdate));
            assert!(conn.has_pending_update());
        }
        // The same procedure cannot be started twice.
        let e = run(&mut ll, hci::OCMD_LE_CONN_UPDATE, &p);
        assert_eq!(e[2], Status::CommandDisallowed.to_u8());
    }

    #[test]
    fn remote_feature_read_starts_the_exchange_once() {
        let mut ll = controller();
        let handle = add_conn(&mut ll, ConnRole::Master);
        let e = run(&mut ll, hci::OCMD_LE_READ_REMOTE_FEATURES, &handle.to_le_bytes());
        assert_eq!(e[2], 0);
        assert_eq!(ll.conns.get(handle).unwrap().tx_queue_len(), 1);
        // Asking again does not queue a second LL_FEATURE_REQ; the
        // pending flag keeps the host's completion alive instead.
        let e = run(&mut ll, hci::OCMD_LE_READ_REMOTE_FEATURES, &handle.to_le_bytes());
        assert_eq!(e[2], 0);
        let conn = ll.conns.get(handle).unwrap();
        assert_eq!(conn.tx_queue_len(), 1);
        assert!(conn.feature_event_owed);
    }

    #[test]
    fn ltk_reply_needs_an_outstanding_request() {
        let mut ll = controller();
        let handle = add_conn(&mut ll, ConnRole::Slave);
        let mut p = [0u8; 18];
        p[0..2].copy_from_slice(&handle.to_le_bytes());
        let e = run(&mut ll, hci::OCMD_LE_LTK_REQ_REPLY, &p);
        assert_eq!(e[5], Status::CommandDisallowed.to_u8());
        assert_eq!(u16::from_le_bytes([e[6], e[7]]), handle);
    }

    #[test]
    fn start_encryption_is_master_only() {
        let mut ll = controller();
        let handle = add_conn(&mut ll, ConnRole::Slave);
        let mut p = [0u8; 28];
        p[0..2].copy_from_slice(&handle.to_le_bytes());
        let e = run(&mut ll, hci::OCMD_LE_START_ENCRYPTION, &p);
        assert_eq!(e[2], Status::CommandDisallowed.to_u8());
    }

    #[test]
    fn acl_tx_checks_the_handle_and_bounds_the_queue() {
        let mut ll = controller();
        assert_eq!(
            ll.acl_tx(9, true, &[1, 2, 3]).unwrap_err(),
            Status::UnknownConnectionId
        );
        let handle = add_conn(&mut ll, ConnRole::Master);
        for _ in 0..CONN_TX_QUEUE_LEN {
            ll.acl_tx(handle, true, &[1, 2, 3]).unwrap();
        }
        assert_eq!(
            ll.acl_tx(handle, true, &[1, 2, 3]).unwrap_err(),
            Status::MemCapacityExceeded
        );
    }
}
