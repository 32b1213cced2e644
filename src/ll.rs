// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2026.

//! The link layer controller context.
//!
//! [`LinkLayer`] owns the radio, the alarm, the entropy source and every
//! protocol state machine. The platform wires the interrupt-context
//! entry points ([`LinkLayer::on_alarm`], [`LinkLayer::on_transmit_end`],
//! [`LinkLayer::on_receive`]) to its radio and timer interrupts, and
//! calls [`LinkLayer::run_pending`] from its main loop whenever any of
//! them ran.
//! HCI traffic enters through [`LinkLayer::hci_command`] and
//! [`LinkLayer::acl_tx`] (task context only) and leaves through
//! [`LinkLayer::pop_host_event`] / [`LinkLayer::pop_acl_data`].
//!
//! The interrupt entry points stay on the inter-frame-space fast path:
//! address matching, white list checks and the prebuilt scan response.
//! Everything else they defer by posting an [`LlEvent`] to a bounded
//! queue that `run_pending` drains in task context. On a single core the
//! platform guarantees mutual exclusion between the two contexts (a
//! critical-section mutex around the controller, the usual embedded
//! arrangement); nothing in here blocks.

use heapless::Deque;

use crate::address::{AddrKind, DeviceAddress};
use crate::adv::{AdvAdvance, AdvSm, ADV_DELAY_MAX_US, ADV_SLOT};
use crate::config::{Config, ACL_PAYLOAD_LEN, ACL_RX_QUEUE_LEN, HCI_EVENT_QUEUE_LEN, LL_EVENT_QUEUE_LEN, MAX_CONNECTIONS};
use crate::conn::llcp::{self, LlcpPdu, Procedure};
use crate::conn::{
    generate_access_addr, Connection, ConnectionTable, ConnRole, DataHeader, EncState,
    EventOutcome, PendingCreate, LLID_CTRL, TRANSMIT_WINDOW_DELAY,
};
use crate::error::Status;
use crate::hci::event::{self, EventBuf};
use crate::hci::{COMPANY_ID, LOCAL_LE_FEATURES, SUBVERSION};
use crate::hil::{Alarm, BleRadio, PhyTransition, RadioChannel, Rng};
use crate::pdu::{AdvPduType, LlData, Pdu, PduBuf, MAX_ADV_DATA_LEN};
use crate::scan::ScanSm;
use crate::sched::{SchedItem, SchedKind, SchedState, Scheduler};
use crate::time::{Duration, Instant};
use crate::whitelist::WhiteList;

/// Link layer version we speak (4.1).
pub const LL_VERSION: u8 = 0x07;

/// What the radio is doing right now, so completion interrupts know whom
/// to deliver to. This is the "radio state" token the interrupt context
/// and task context share.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RadioOp {
    Idle,
    /// Advertising PDU going out on `adv`'s current channel.
    AdvTx,
    /// Listening for SCAN_REQ / CONNECT_REQ after an advertisement.
    AdvRx,
    /// Scan response going out.
    AdvRespTx,
    /// Scanner listening in its window.
    ScanRx,
    /// Scanner's SCAN_REQ going out, response next.
    ScanReqTx,
    /// Initiator listening for its target.
    InitRx,
    /// CONNECT_REQ going out.
    ConnReqTx,
    /// Connection event, our PDU in the air.
    ConnTx {
        handle: u16,
        chan: RadioChannel,
        rx_ok: bool,
    },
    /// Connection event, listening.
    ConnRx {
        handle: u16,
        chan: RadioChannel,
        rx_ok: bool,
    },
}

/// Deferred work posted from interrupt context, drained by
/// [`LinkLayer::run_pending`].
pub(crate) enum LlEvent {
    /// An advertising event (full channel walk) finished.
    AdvDone,
    /// High-duty-cycle directed advertising hit its 1.28 s deadline.
    DirectedAdvTimeout,
    /// An acceptable CONNECT_REQ arrived while advertising.
    ConnectReqRx {
        peer: DeviceAddress,
        lldata: LlData,
        at: Instant,
    },
    /// Our CONNECT_REQ finished transmitting.
    ConnReqTxDone { at: Instant },
    /// A reportable advertisement was received while scanning.
    AdvReport {
        event_type: u8,
        addr: DeviceAddress,
        data: heapless::Vec<u8, MAX_ADV_DATA_LEN>,
        rssi: i8,
    },
    /// New data PDU payload on a connection.
    ConnRx {
        handle: u16,
        llid: u8,
        payload: heapless::Vec<u8, ACL_PAYLOAD_LEN>,
    },
    /// A connection event closed; schedule the next one or clean up.
    ConnClosed { handle: u16, outcome: EventOutcome },
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LlStats {
    /// Schedule items dispatched after their window already closed.
    pub sched_late: u32,
    /// ISR-to-task queue overflows (events dropped).
    pub evq_full: u32,
    /// Host event queue overflows (events dropped).
    pub host_q_full: u32,
    pub rx_malformed: u32,
}

pub struct LinkLayer<R: BleRadio, A: Alarm, G: Rng> {
    pub(crate) radio: R,
    pub(crate) alarm: A,
    pub(crate) rng: G,
    pub(crate) config: Config,

    pub(crate) adv: AdvSm,
    pub(crate) scan: ScanSm,
    pub(crate) conns: ConnectionTable,
    /// The single "pending creation" slot.
    pub(crate) pending_create: Option<PendingCreate>,
    pub(crate) whitelist: WhiteList,
    pub(crate) sched: Scheduler,

    pub(crate) cur_op: RadioOp,
    /// End of the current radio operation's window.
    pub(crate) op_deadline: Option<Instant>,

    pub(crate) events: Deque<LlEvent, LL_EVENT_QUEUE_LEN>,
    pub(crate) host_events: Deque<EventBuf, HCI_EVENT_QUEUE_LEN>,
    pub(crate) acl_in: Deque<(u16, heapless::Vec<u8, ACL_PAYLOAD_LEN>), ACL_RX_QUEUE_LEN>,

    pub(crate) random_addr: Option<[u8; 6]>,
    /// Channel classification from the host, used for new connections
    /// and channel map updates.
    pub(crate) host_chan_map: [u8; 5],
    pub(crate) event_mask: u64,
    pub(crate) le_event_mask: u64,
    pub(crate) last_ncp: Instant,

    pub stats: LlStats,
}

impl<R: BleRadio, A: Alarm, G: Rng> LinkLayer<R, A, G> {
    pub fn new(radio: R, alarm: A, rng: G, config: Config) -> Self {
        let now = alarm.now();
        LinkLayer {
            radio,
            alarm,
            rng,
            config,
            adv: AdvSm::new(),
            scan: ScanSm::new(),
            conns: ConnectionTable::new(),
            pending_create: None,
            whitelist: WhiteList::new(),
            sched: Scheduler::new(),
            cur_op: RadioOp::Idle,
            op_deadline: None,
            events: Deque::new(),
            host_events: Deque::new(),
            acl_in: Deque::new(),
            random_addr: None,
            host_chan_map: [0xff, 0xff, 0xff, 0xff, 0x1f],
            event_mask: event::DEFAULT_EVENT_MASK,
            le_event_mask: event::DEFAULT_LE_EVENT_MASK,
            last_ncp: now,
            stats: LlStats::default(),
        }
    }

    /// HCI Reset: back to power-on state, queues cleared, radio off.
    pub(crate) fn reset(&mut self) {
        self.radio.disable();
        self.alarm.disarm();
        self.adv = AdvSm::new();
        self.scan = ScanSm::new();
        self.conns = ConnectionTable::new();
        self.pending_create = None;
        self.whitelist.clear();
        self.sched = Scheduler::new();
        self.cur_op = RadioOp::Idle;
        self.op_deadline = None;
        self.events = Deque::new();
        self.host_events = Deque::new();
        self.acl_in = Deque::new();
        self.random_addr = None;
        self.host_chan_map = [0xff, 0xff, 0xff, 0xff, 0x1f];
        self.event_mask = event::DEFAULT_EVENT_MASK;
        self.le_event_mask = event::DEFAULT_LE_EVENT_MASK;
    }

    /// Next queued HCI event for the host transport.
    pub fn pop_host_event(&mut self) -> Option<EventBuf> {
        self.host_events.pop_front()
    }

    /// Next received ACL payload for the host transport.
    pub fn pop_acl_data(&mut self) -> Option<(u16, heapless::Vec<u8, ACL_PAYLOAD_LEN>)> {
        self.acl_in.pop_front()
    }

    /// Outbound ACL data from the host. `first` marks the start of an
    /// L2CAP message (LLID 10 vs 01).
    pub fn acl_tx(&mut self, handle: u16, first: bool, data: &[u8]) -> Result<(), Status> {
        let llid = if first {
            crate::conn::LLID_DATA_START
        } else {
            crate::conn::LLID_DATA_CONT
        };
        let conn = self
            .conns
            .get_mut(handle)
            .ok_or(Status::UnknownConnectionId)?;
        conn.enqueue_acl(llid, data)
    }

    pub(crate) fn own_address(&self, kind: AddrKind) -> Result<DeviceAddress, Status> {
        match kind {
            AddrKind::Public => Ok(DeviceAddress::public(self.config.public_addr)),
            AddrKind::Random => {
                let bytes = self.random_addr.ok_or(Status::InvalidHciParams)?;
                Ok(DeviceAddress::random(bytes))
            }
            _ => Err(Status::InvalidHciParams),
        }
    }

    pub(crate) fn emit(&mut self, ev: EventBuf) {
        if self.host_events.push_back(ev).is_err() {
            self.stats.host_q_full += 1;
        }
    }

    pub(crate) fn post(&mut self, ev: LlEvent) {
        if self.events.push_back(ev).is_err() {
            self.stats.evq_full += 1;
        }
    }

    fn le_event_enabled(&self, bit: u64) -> bool {
        self.event_mask & event::MASK_LE_META != 0 && self.le_event_mask & bit != 0
    }

    // ------------------------------------------------------------------
    // Interrupt-context entry points.
    // ------------------------------------------------------------------

    /// Timer compare fired.
    pub fn on_alarm(&mut self) {
        let now = self.alarm.now();
        if self.op_deadline.is_some_and(|d| now.is_at_or_after(d)) {
            self.op_deadline = None;
            self.window_closed(now);
        }
        self.dispatch_due(now);
        self.rearm_alarm();
    }

    /// The radio finished a transmission.
    pub fn on_transmit_end(&mut self) {
        let now = self.alarm.now();
        match self.cur_op {
            RadioOp::AdvTx => {
                let listens = self.adv.params().adv_type.connectable()
                    || self.adv.params().adv_type.scannable();
                if listens {
                    // The PHY switched to receive on its own.
                    self.cur_op = RadioOp::AdvRx;
                } else {
                    self.advance_adv(now);
                }
            }
            RadioOp::AdvRespTx => self.advance_adv(now),
            RadioOp::ScanReqTx => self.cur_op = RadioOp::ScanRx,
            RadioOp::ConnReqTx => {
                self.cur_op = RadioOp::Idle;
                self.op_deadline = None;
                self.post(LlEvent::ConnReqTxDone { at: now });
            }
            RadioOp::ConnTx {
                handle,
                chan,
                rx_ok,
            } => {
                let role = self.conns.get(handle).map(|c| c.role);
                match role {
                    Some(ConnRole::Master) => {
                        self.cur_op = RadioOp::ConnRx {
                            handle,
                            chan,
                            rx_ok,
                        };
                    }
                    // The slave's reply ends its exchange.
                    Some(ConnRole::Slave) => self.close_conn_event(handle, rx_ok, now),
                    None => {
                        self.radio.disable();
                        self.cur_op = RadioOp::Idle;
                    }
                }
            }
            _ => {}
        }
        self.dispatch_due(now);
        self.rearm_alarm();
    }

    /// The radio received a frame. `crc_ok` is the hardware CRC verdict;
    /// frames failing it never carry protocol effects beyond statistics.
    pub fn on_receive(&mut self, frame: &[u8], crc_ok: bool, rssi: i8) {
        let now = self.alarm.now();
        match self.cur_op {
            RadioOp::AdvRx => self.adv_rx(frame, crc_ok, now),
            RadioOp::ScanRx => self.scan_rx(frame, crc_ok, rssi),
            RadioOp::InitRx => self.init_rx(frame, crc_ok),
            RadioOp::ConnRx {
                handle,
                chan,
                rx_ok,
            } => self.conn_rx(handle, chan, rx_ok, frame, crc_ok, now),
            _ => {}
        }
        self.dispatch_due(now);
        self.rearm_alarm();
    }

    // ------------------------------------------------------------------
    // Scheduling.
    // ------------------------------------------------------------------

    fn rearm_alarm(&mut self) {
        let mut next = self.op_deadline;
        if let Some(start) = self.sched.next_start() {
            next = Some(match next {
                Some(d) if d.is_before(start) => d,
                _ => start,
            });
        }
        match next {
            Some(at) => self.alarm.set_alarm(at),
            None => self.alarm.disarm(),
        }
    }

    fn dispatch_due(&mut self, now: Instant) {
        while self.cur_op == RadioOp::Idle {
            let Some(item) = self.sched.pop_due(now) else {
                break;
            };
            match self.dispatch_item(item, now) {
                SchedState::Running => break,
                SchedState::Done => continue,
            }
        }
    }

    fn dispatch_item(&mut self, item: SchedItem, now: Instant) -> SchedState {
        // A window that closed before we got to start it is a timing
        // miss: count it and let the state machine advance normally.
        if now.is_at_or_after(item.end) {
            self.stats.sched_late += 1;
            match item.kind {
                SchedKind::Advertising => {
                    self.adv.stats.late_starts += 1;
                    self.post(LlEvent::AdvDone);
                }
                SchedKind::Scan => {
                    self.scan.stats.late_starts += 1;
                    self.schedule_listen_window(now);
                }
                SchedKind::Connection { handle } => {
                    if let Some(conn) = self.conns.get_mut(handle) {
                        conn.stats.late_starts += 1;
                        let outcome = conn.close_event(now, false);
                        self.post(LlEvent::ConnClosed { handle, outcome });
                    }
                }
            }
            return SchedState::Done;
        }
        match item.kind {
            SchedKind::Advertising => self.start_adv_tx(item, now),
            SchedKind::Scan => self.start_listen_window(item),
            SchedKind::Connection { handle } => self.start_conn_event(item, handle),
        }
    }

    fn start_adv_tx(&mut self, item: SchedItem, now: Instant) -> SchedState {
        if !self.adv.is_enabled() {
            return SchedState::Done;
        }
        if self.adv.hd_timeout_due(now) {
            self.adv.stats.hd_timeouts += 1;
            self.adv.disable();
            self.post(LlEvent::DirectedAdvTimeout);
            return SchedState::Done;
        }
        let pdu = match self.adv.build_adv_pdu() {
            Ok(pdu) => pdu,
            Err(_) => {
                // Could not build this transmission; skip it without
                // corrupting the walk.
                self.adv.stats.tx_aborts += 1;
                self.advance_adv(now);
                return SchedState::Done;
            }
        };
        let adv_type = self.adv.params().adv_type;
        let transition = if adv_type.connectable() || adv_type.scannable() {
            PhyTransition::Rx
        } else {
            PhyTransition::None
        };
        self.radio
            .transmit_advertising(pdu.as_slice(), self.adv.current_channel(), transition);
        self.adv.mark_advertising();
        self.cur_op = RadioOp::AdvTx;
        self.op_deadline = Some(item.end);
        SchedState::Running
    }

    /// A `Scan` item serves whichever of scanner/initiator is active;
    /// the two are mutually exclusive by command validation.
    fn start_listen_window(&mut self, item: SchedItem) -> SchedState {
        if let Some(pc) = self.pending_create.as_ref() {
            self.radio.receive_advertising(pc.current_channel());
            self.cur_op = RadioOp::InitRx;
            self.op_deadline = Some(item.end);
            SchedState::Running
        } else if self.scan.is_enabled() {
            self.radio.receive_advertising(self.scan.current_channel());
            self.cur_op = RadioOp::ScanRx;
            self.op_deadline = Some(item.end);
            SchedState::Running
        } else {
            SchedState::Done
        }
    }

    fn start_conn_event(&mut self, item: SchedItem, handle: u16) -> SchedState {
        let Some(conn) = self.conns.get_mut(handle) else {
            return SchedState::Done;
        };
        let chan = conn.next_data_channel();
        let aa = conn.access_addr;
        let crc = conn.crc_init;
        match conn.role {
            ConnRole::Master => {
                let pdu = conn.peek_tx();
                let hdr = conn.tx_header(&pdu, false);
                let mut frame = [0u8; 2 + ACL_PAYLOAD_LEN];
                frame[..2].copy_from_slice(&hdr.encode());
                frame[2..2 + pdu.payload.len()].copy_from_slice(&pdu.payload);
                self.radio.transmit_data(
                    &frame[..2 + pdu.payload.len()],
                    aa,
                    crc,
                    chan,
                    PhyTransition::Rx,
                );
                self.cur_op = RadioOp::ConnTx {
                    handle,
                    chan,
                    rx_ok: false,
                };
            }
            ConnRole::Slave => {
                self.radio.receive_data(chan, aa, crc);
                self.cur_op = RadioOp::ConnRx {
                    handle,
                    chan,
                    rx_ok: false,
                };
            }
        }
        self.op_deadline = Some(item.end);
        SchedState::Running
    }

    /// The current operation's window closed (alarm in interrupt
    /// context).
    fn window_closed(&mut self, now: Instant) {
        match self.cur_op {
            RadioOp::AdvTx | RadioOp::AdvRx | RadioOp::AdvRespTx => {
                self.radio.disable();
                self.advance_adv(now);
            }
            RadioOp::ScanRx | RadioOp::ScanReqTx => {
                self.radio.disable();
                self.cur_op = RadioOp::Idle;
                self.scan.next_window();
                self.schedule_listen_window(now);
            }
            RadioOp::InitRx | RadioOp::ConnReqTx => {
                self.radio.disable();
                self.cur_op = RadioOp::Idle;
                if let Some(pc) = self.pending_create.as_mut() {
                    pc.req_in_flight = false;
                    pc.next_window();
                }
                self.schedule_listen_window(now);
            }
            RadioOp::ConnTx { handle, rx_ok, .. } | RadioOp::ConnRx { handle, rx_ok, .. } => {
                self.close_conn_event(handle, rx_ok, now);
            }
            RadioOp::Idle => {}
        }
    }

    /// Commit the next scanner/initiator listen window to the schedule.
    pub(crate) fn schedule_listen_window(&mut self, now: Instant) {
        let (mut start, len) = if let Some(pc) = self.pending_create.as_ref() {
            (pc.window_start, pc.window_len())
        } else if self.scan.is_enabled() {
            (self.scan.window_start(), self.scan.window_len())
        } else {
            return;
        };
        // Never commit a window that is already over.
        while now.is_at_or_after(start.wrapping_add(len)) {
            start = if let Some(pc) = self.pending_create.as_mut() {
                pc.next_window()
            } else {
                self.scan.next_window()
            };
        }
        let item = SchedItem {
            kind: SchedKind::Scan,
            start,
            end: start.wrapping_add(len),
        };
        if self
            .sched
            .reschedule(item, len, Duration::from_secs(2))
            .is_err()
        {
            self.stats.sched_late += 1;
        }
    }

    /// Advertising on the current channel is finished; walk on.
    fn advance_adv(&mut self, now: Instant) {
        self.cur_op = RadioOp::Idle;
        self.op_deadline = None;
        if !self.adv.is_enabled() {
            return;
        }
        match self.adv.advance_channel() {
            AdvAdvance::NextChannel => {
                // Next channel of the same event, back to back.
                let item = SchedItem {
                    kind: SchedKind::Advertising,
                    start: now,
                    end: now.wrapping_add(ADV_SLOT),
                };
                if self.sched.reschedule(item, ADV_SLOT, Duration::from_millis(20)).is_err() {
                    // No slot for the rest of the event; close it out.
                    self.post(LlEvent::AdvDone);
                }
            }
            AdvAdvance::EventDone => self.post(LlEvent::AdvDone),
        }
    }

    /// Pick the randomized advertising delay and commit the next
    /// advertising event. Task context.
    pub(crate) fn schedule_adv_event(&mut self) {
        if !self.adv.is_enabled() {
            return;
        }
        let delay = Duration::from_micros(self.rng.next_u32() % (ADV_DELAY_MAX_US + 1));
        // A failed commit advances the event deadline and tries again
        // rather than dropping the machine.
        for _ in 0..4 {
            let start = self.adv.schedule_next_event(delay);
            let item = SchedItem {
                kind: SchedKind::Advertising,
                start,
                end: start.wrapping_add(ADV_SLOT),
            };
            match self.sched.reschedule(item, ADV_SLOT, Duration::from_millis(10)) {
                Ok(_) => return,
                Err(_) => continue,
            }
        }
        self.stats.sched_late += 1;
    }

    fn close_conn_event(&mut self, handle: u16, rx_ok: bool, now: Instant) {
        self.radio.disable();
        self.cur_op = RadioOp::Idle;
        self.op_deadline = None;
        if let Some(conn) = self.conns.get_mut(handle) {
            let outcome = conn.close_event(now, rx_ok);
            self.post(LlEvent::ConnClosed { handle, outcome });
        }
    }

    // ------------------------------------------------------------------
    // Receive paths (interrupt context, IFS-critical).
    // ------------------------------------------------------------------

    fn adv_rx(&mut self, frame: &[u8], crc_ok: bool, now: Instant) {
        let chan = self.adv.current_channel();
        let Ok(pdu) = Pdu::parse(frame) else {
            self.stats.rx_malformed += 1;
            self.radio.receive_advertising(chan);
            return;
        };
        if !crc_ok {
            self.radio.receive_advertising(chan);
            return;
        }
        match pdu.pdu_type {
            AdvPduType::ScanReq => {
                if let Ok((scana, adva)) = pdu.scan_req() {
                    if self.adv.accepts_scan_req(&scana, &adva, &self.whitelist) {
                        self.adv.stats.scan_reqs += 1;
                        // The prebuilt response must go out within the
                        // inter-frame space.
                        if let Some(rsp) = self.adv.scan_rsp_pdu() {
                            self.radio
                                .transmit_advertising(rsp.as_slice(), chan, PhyTransition::None);
                            self.adv.stats.scan_rsps += 1;
                            self.cur_op = RadioOp::AdvRespTx;
                            return;
                        }
                    }
                }
                self.radio.receive_advertising(chan);
            }
            AdvPduType::ConnectReq => {
                if let Ok((inita, adva, lldata)) = pdu.connect_req() {
                    if self.adv.accepts_connect_req(&inita, &adva, &self.whitelist) {
                        self.adv.stats.conn_reqs += 1;
                        self.radio.disable();
                        self.cur_op = RadioOp::Idle;
                        self.op_deadline = None;
                        self.post(LlEvent::ConnectReqRx {
                            peer: inita,
                            lldata,
                            at: now,
                        });
                        return;
                    }
                }
                self.radio.receive_advertising(chan);
            }
            _ => self.radio.receive_advertising(chan),
        }
    }

    fn scan_rx(&mut self, frame: &[u8], crc_ok: bool, rssi: i8) {
        let chan = self.scan.current_channel();
        let Ok(pdu) = (if crc_ok {
            Pdu::parse(frame)
        } else {
            Err(Status::UnspecifiedError)
        }) else {
            self.radio.receive_advertising(chan);
            return;
        };
        match pdu.pdu_type {
            AdvPduType::AdvInd
            | AdvPduType::AdvNonconnInd
            | AdvPduType::AdvScanInd
            | AdvPduType::ScanRsp => {
                let Ok((adva, data)) = pdu.adv_payload() else {
                    self.stats.rx_malformed += 1;
                    self.radio.receive_advertising(chan);
                    return;
                };
                if pdu.pdu_type == AdvPduType::ScanRsp {
                    if self.scan.accepts_scan_rsp(&adva) {
                        self.post_adv_report(0x04, adva, data, rssi);
                    }
                    self.radio.receive_advertising(chan);
                    return;
                }
                if !self.scan.accepts_adv(&adva, &self.whitelist) {
                    self.radio.receive_advertising(chan);
                    return;
                }
                let event_type = match pdu.pdu_type {
                    AdvPduType::AdvInd => 0x00,
                    AdvPduType::AdvScanInd => 0x02,
                    _ => 0x03,
                };
                self.post_adv_report(event_type, adva, data, rssi);
                if self.scan.should_scan_request(pdu.pdu_type, &adva) {
                    // Active scan: SCAN_REQ inside the IFS budget.
                    if let Ok(own) = self.own_address(self.scan.params().own_addr_kind) {
                        if let Ok(req) = PduBuf::scan_req(&own, &adva) {
                            self.radio
                                .transmit_advertising(req.as_slice(), chan, PhyTransition::Rx);
                            self.cur_op = RadioOp::ScanReqTx;
                            return;
                        }
                    }
                }
                self.radio.receive_advertising(chan);
            }
            AdvPduType::AdvDirectInd => {
                if let Ok((adva, _inita)) = pdu.direct_payload() {
                    if self.scan.accepts_adv(&adva, &self.whitelist) {
                        self.post_adv_report(0x01, adva, &[], rssi);
                    }
                }
                self.radio.receive_advertising(chan);
            }
            _ => self.radio.receive_advertising(chan),
        }
    }

    fn post_adv_report(&mut self, event_type: u8, addr: DeviceAddress, data: &[u8], rssi: i8) {
        let mut copy = heapless::Vec::new();
        if copy.extend_from_slice(data).is_err() {
            self.stats.rx_malformed += 1;
            return;
        }
        self.post(LlEvent::AdvReport {
            event_type,
            addr,
            data: copy,
            rssi,
        });
    }

    fn init_rx(&mut self, frame: &[u8], crc_ok: bool) {
        let Some(pc) = self.pending_create.as_ref() else {
            self.radio.disable();
            self.cur_op = RadioOp::Idle;
            return;
        };
        let chan = pc.current_channel();
        let Ok(pdu) = (if crc_ok {
            Pdu::parse(frame)
        } else {
            Err(Status::UnspecifiedError)
        }) else {
            self.radio.receive_advertising(chan);
            return;
        };
        let adva = match pdu.pdu_type {
            AdvPduType::AdvInd => pdu.adv_payload().map(|(a, _)| a),
            AdvPduType::AdvDirectInd => pdu.direct_payload().map(|(a, _)| a),
            _ => Err(Status::UnspecifiedError),
        };
        let Ok(adva) = adva else {
            self.radio.receive_advertising(chan);
            return;
        };
        let matched = match pc.peer {
            Some(target) => target == adva,
            None => self.whitelist.matches(&adva),
        };
        if !matched || pc.req_in_flight {
            self.radio.receive_advertising(chan);
            return;
        }
        // Build the CONNECT_REQ: fresh access address and CRC seed, hop
        // from entropy, interval at the host's maximum.
        let aa = generate_access_addr(&mut self.rng);
        let crc_init = self.rng.next_u32() & 0x00ff_ffff;
        let hop = 5 + (self.rng.next_u32() % 12) as u8;
        let Some(pc) = self.pending_create.as_mut() else {
            return;
        };
        let lldata = LlData {
            access_addr: aa,
            crc_init,
            win_size: 1,
            win_offset: 0,
            interval: pc.params.itvl_max,
            latency: pc.params.latency,
            timeout: pc.params.supervision_timeout,
            chan_map: self.host_chan_map,
            hop,
            sca: 0,
        };
        pc.lldata = Some(lldata);
        pc.target = Some(adva);
        pc.req_in_flight = true;
        let own = pc.own_addr;
        let Ok(req) = PduBuf::connect_req(&own, &adva, &lldata) else {
            self.radio.receive_advertising(chan);
            return;
        };
        self.radio
            .transmit_advertising(req.as_slice(), chan, PhyTransition::None);
        self.cur_op = RadioOp::ConnReqTx;
    }

    fn conn_rx(
        &mut self,
        handle: u16,
        chan: RadioChannel,
        rx_ok: bool,
        frame: &[u8],
        crc_ok: bool,
        now: Instant,
    ) {
        let Some(conn) = self.conns.get_mut(handle) else {
            self.radio.disable();
            self.cur_op = RadioOp::Idle;
            return;
        };
        if !crc_ok {
            conn.stats.crc_errors += 1;
            self.close_conn_event(handle, rx_ok, now);
            return;
        }
        let Ok((hdr, payload)) = DataHeader::decode(frame) else {
            self.stats.rx_malformed += 1;
            self.close_conn_event(handle, rx_ok, now);
            return;
        };
        let disp = conn.on_rx_header(&hdr);
        let role = conn.role;
        let terminating = conn.disconnecting.is_some();

        if disp.acked_ctrl == Some(llcp::LL_TERMINATE_IND) && terminating {
            // Our LL_TERMINATE_IND is acknowledged; the link is done.
            self.radio.disable();
            self.cur_op = RadioOp::Idle;
            self.op_deadline = None;
            self.post(LlEvent::ConnClosed {
                handle,
                outcome: EventOutcome::Terminated(Status::LocalHostTerminated),
            });
            return;
        }

        if disp.new_data && !payload.is_empty() {
            let mut copy = heapless::Vec::new();
            if copy.extend_from_slice(payload).is_ok() {
                self.post(LlEvent::ConnRx {
                    handle,
                    llid: hdr.llid,
                    payload: copy,
                });
            } else {
                self.stats.rx_malformed += 1;
            }
        }

        match role {
            ConnRole::Slave => {
                // Reply within the inter-frame space.
                let Some(conn) = self.conns.get_mut(handle) else {
                    return;
                };
                let pdu = conn.peek_tx();
                let tx_hdr = conn.tx_header(&pdu, false);
                let aa = conn.access_addr;
                let crc = conn.crc_init;
                let mut buf = [0u8; 2 + ACL_PAYLOAD_LEN];
                buf[..2].copy_from_slice(&tx_hdr.encode());
                buf[2..2 + pdu.payload.len()].copy_from_slice(&pdu.payload);
                self.radio.transmit_data(
                    &buf[..2 + pdu.payload.len()],
                    aa,
                    crc,
                    chan,
                    PhyTransition::None,
                );
                self.cur_op = RadioOp::ConnTx {
                    handle,
                    chan,
                    rx_ok: true,
                };
            }
            ConnRole::Master => {
                // One exchange per event in this controller.
                self.close_conn_event(handle, true, now);
            }
        }
    }

    // ------------------------------------------------------------------
    // Task context.
    // ------------------------------------------------------------------

    /// Drain deferred work. Call from the link layer task whenever an
    /// interrupt entry point ran.
    pub fn run_pending(&mut self) {
        let now = self.alarm.now();
        while let Some(ev) = self.events.pop_front() {
            self.process_event(ev, now);
        }
        self.check_procedure_timeouts(now);
        self.flush_completed_packets(now);
        self.dispatch_due(now);
        self.rearm_alarm();
    }

    fn process_event(&mut self, ev: LlEvent, now: Instant) {
        match ev {
            LlEvent::AdvDone => self.schedule_adv_event(),
            LlEvent::DirectedAdvTimeout => {
                if self.le_event_enabled(event::LE_MASK_CONN_COMPLETE) {
                    let e = event::le_conn_complete_error(Status::DirectedAdvertisingTimeout);
                    self.emit(e);
                }
            }
            LlEvent::ConnectReqRx { peer, lldata, at } => self.slave_conn_start(peer, lldata, at),
            LlEvent::ConnReqTxDone { at } => self.master_conn_start(at),
            LlEvent::AdvReport {
                event_type,
                addr,
                data,
                rssi,
            } => {
                if self.scan.is_enabled()
                    && self.scan.should_report(&addr)
                    && self.le_event_enabled(event::LE_MASK_ADV_REPORT)
                {
                    self.scan.stats.reports += 1;
                    let e = event::le_adv_report(event_type, &addr, &data, rssi);
                    self.emit(e);
                }
            }
            LlEvent::ConnRx {
                handle,
                llid,
                payload,
            } => {
                if llid == LLID_CTRL {
                    self.handle_ctrl_pdu(handle, &payload, now);
                } else if self.conns.get(handle).is_some()
                    && self.acl_in.push_back((handle, payload)).is_err()
                {
                    self.stats.host_q_full += 1;
                }
            }
            LlEvent::ConnClosed { handle, outcome } => self.conn_event_closed(handle, outcome, now),
        }
    }

    /// An accepted CONNECT_REQ: bring up the slave role state machine.
    fn slave_conn_start(&mut self, peer: DeviceAddress, lldata: LlData, at: Instant) {
        if !self.adv.is_enabled() {
            return;
        }
        let own = self.adv.own_addr();
        let result = self
            .conns
            .insert_with(|handle| Connection::new(handle, ConnRole::Slave, own, peer, &lldata, at));
        match result {
            Ok(handle) => {
                self.adv.disable();
                self.sched.remove(SchedKind::Advertising);
                let anchor = at
                    .wrapping_add(TRANSMIT_WINDOW_DELAY)
                    .wrapping_add(Duration::from_units_1250us(lldata.win_offset as u32));
                self.commit_conn_event(handle, anchor);
                if self.le_event_enabled(event::LE_MASK_CONN_COMPLETE) {
                    let e = event::le_conn_complete(
                        Status::Success,
                        handle,
                        0x01, // slave
                        &peer,
                        lldata.interval,
                        lldata.latency,
                        lldata.timeout,
                        lldata.sca,
                    );
                    self.emit(e);
                }
                info!("connection {} created (slave)", handle);
            }
            Err(_) => {
                // No free state machine: the request is dropped and the
                // advertising event machinery keeps running.
                self.schedule_adv_event();
            }
        }
    }

    /// Our CONNECT_REQ went out: bring up the master role state machine.
    fn master_conn_start(&mut self, at: Instant) {
        let Some(pc) = self.pending_create.take() else {
            return;
        };
        let (Some(peer), Some(lldata)) = (pc.target, pc.lldata) else {
            return;
        };
        self.sched.remove(SchedKind::Scan);
        let own = pc.own_addr;
        let result = self.conns.insert_with(|handle| {
            let mut c = Connection::new(handle, ConnRole::Master, own, peer, &lldata, at)?;
            c.set_ce_len(pc.params.max_ce_len);
            Ok(c)
        });
        match result {
            Ok(handle) => {
                let anchor = at
                    .wrapping_add(TRANSMIT_WINDOW_DELAY)
                    .wrapping_add(Duration::from_units_1250us(lldata.win_offset as u32));
                self.commit_conn_event(handle, anchor);
                if self.le_event_enabled(event::LE_MASK_CONN_COMPLETE) {
                    let e = event::le_conn_complete(
                        Status::Success,
                        handle,
                        0x00, // master
                        &peer,
                        lldata.interval,
                        lldata.latency,
                        lldata.timeout,
                        lldata.sca,
                    );
                    self.emit(e);
                }
                info!("connection {} created (master)", handle);
            }
            Err(status) => {
                if self.le_event_enabled(event::LE_MASK_CONN_COMPLETE) {
                    let e = event::le_conn_complete_error(status);
                    self.emit(e);
                }
            }
        }
    }

    /// Put the next event window of `handle` on the schedule.
    fn commit_conn_event(&mut self, handle: u16, anchor: Instant) {
        let Some(conn) = self.conns.get_mut(handle) else {
            return;
        };
        conn.set_anchor(anchor);
        let len = conn.event_len();
        let interval = conn.interval();
        let item = SchedItem {
            kind: SchedKind::Connection { handle },
            start: anchor,
            end: anchor.wrapping_add(len),
        };
        if self.sched.reschedule(item, len, interval).is_err() {
            // Every slot this interval is taken; the supervision logic
            // catches up at the next close.
            self.stats.sched_late += 1;
        }
    }

    fn conn_event_closed(&mut self, handle: u16, outcome: EventOutcome, now: Instant) {
        match outcome {
            EventOutcome::Continue {
                next_anchor,
                update_applied,
                map_applied,
            } => {
                let item_anchor = next_anchor;
                if update_applied {
                    self.finish_update_procedure(handle, now);
                }
                if map_applied {
                    if let Some(conn) = self.conns.get_mut(handle) {
                        if conn.procs.active() == Some(Procedure::ChanMapUpdate) {
                            let next = conn.procs.complete(Procedure::ChanMapUpdate, now);
                            self.open_promoted(handle, next);
                        }
                    }
                }
                self.commit_conn_event(handle, item_anchor);
            }
            EventOutcome::Terminated(status) => self.terminate_conn(handle, status),
        }
    }

    fn finish_update_procedure(&mut self, handle: u16, now: Instant) {
        let le_ok = self.le_event_enabled(event::LE_MASK_CONN_UPDATE);
        let Some(conn) = self.conns.get_mut(handle) else {
            return;
        };
        let (itvl, lat, tmo) = (
            conn.interval_units(),
            conn.latency(),
            conn.timeout_units(),
        );
        let active = conn.procs.active();
        let next = match active {
            Some(p @ (Procedure::ConnUpdate | Procedure::ConnParam)) => {
                conn.procs.complete(p, now)
            }
            _ => None,
        };
        if le_ok {
            let e = event::le_conn_update_complete(Status::Success, handle, itvl, lat, tmo);
            self.emit(e);
        }
        self.open_promoted(handle, next);
    }

    /// Remove the connection, cancel its schedule and tell the host.
    pub(crate) fn terminate_conn(&mut self, handle: u16, reason: Status) {
        if self.conns.remove(handle).is_none() {
            return;
        }
        self.sched.remove(SchedKind::Connection { handle });
        info!("connection {} terminated: {:?}", handle, reason as u8);
        if self.event_mask & event::MASK_DISCONNECTION_COMPLETE != 0 {
            let e = event::disconnection_complete(handle, reason);
            self.emit(e);
        }
    }

    fn check_procedure_timeouts(&mut self, now: Instant) {
        let mut expired: heapless::Vec<(u16, Status), MAX_CONNECTIONS> = heapless::Vec::new();
        for conn in self.conns.iter() {
            if conn.procs.response_overdue(now) {
                let status = if conn.procs.active() == Some(Procedure::Terminate) {
                    Status::LocalHostTerminated
                } else {
                    Status::LmpResponseTimeout
                };
                let _ = expired.push((conn.handle(), status));
            }
        }
        for (handle, status) in expired {
            self.terminate_conn(handle, status);
        }
    }

    /// Batched, rate-limited Number Of Completed Packets reporting.
    fn flush_completed_packets(&mut self, now: Instant) {
        if now.since(self.last_ncp) < self.config.completed_pkts_interval {
            return;
        }
        let mut pairs: heapless::Vec<(u16, u16), MAX_CONNECTIONS> = heapless::Vec::new();
        for conn in self.conns.iter_mut() {
            let count = conn.take_completed();
            if count > 0 {
                let _ = pairs.push((conn.handle(), count));
            }
        }
        if pairs.is_empty() {
            return;
        }
        self.last_ncp = now;
        for chunk in pairs.chunks(event::ncp_capacity()) {
            let e = event::num_completed_packets(chunk);
            self.emit(e);
        }
    }

    /// Open the PDU exchange for a procedure that just became active.
    pub(crate) fn open_procedure(&mut self, handle: u16, proc: Procedure) {
        // Entropy for the encryption handshake is drawn before the
        // connection is borrowed.
        let (r64, r32) = (self.rng.next_u64(), self.rng.next_u32());
        let Some(conn) = self.conns.get_mut(handle) else {
            return;
        };
        let role = conn.role;
        let pdu = match proc {
            Procedure::FeatureXchg => match role {
                ConnRole::Master => LlcpPdu::FeatureReq {
                    features: LOCAL_LE_FEATURES,
                },
                ConnRole::Slave => LlcpPdu::SlaveFeatureReq {
                    features: LOCAL_LE_FEATURES,
                },
            },
            Procedure::VersionXchg => {
                conn.version_sent = true;
                LlcpPdu::VersionInd {
                    version: LL_VERSION,
                    company: COMPANY_ID,
                    subversion: SUBVERSION,
                }
            }
            Procedure::Terminate => LlcpPdu::TerminateInd {
                reason: conn.disconnecting.unwrap_or(Status::RemoteUserTerminated) as u8,
            },
            Procedure::Encrypt => match role {
                ConnRole::Master => {
                    conn.enc_keys.skd_m = r64;
                    conn.enc_keys.iv_m = r32;
                    conn.enc_state = EncState::ReqSent;
                    LlcpPdu::EncReq {
                        rand: conn.enc_keys.rand,
                        ediv: conn.enc_keys.ediv,
                        skd_m: conn.enc_keys.skd_m,
                        iv_m: conn.enc_keys.iv_m,
                    }
                }
                ConnRole::Slave => return,
            },
            Procedure::ConnUpdate => {
                let Some(req) = conn.requested_params else {
                    return;
                };
                let instant = conn
                    .event_counter
                    .wrapping_add(6)
                    .wrapping_add(conn.latency());
                let upd = llcp::ConnUpdateInd {
                    win_size: 1,
                    win_offset: 0,
                    interval: req.itvl_max,
                    latency: req.latency,
                    timeout: req.timeout,
                    instant,
                };
                conn.arm_update(upd);
                LlcpPdu::ConnUpdateInd(upd)
            }
            Procedure::ConnParam => {
                let Some(req) = conn.requested_params else {
                    return;
                };
                LlcpPdu::ConnParamReq(req)
            }
            Procedure::ChanMapUpdate => {
                let instant = conn.event_counter.wrapping_add(6);
                let map = self.host_chan_map;
                conn.arm_chan_map(map, instant);
                LlcpPdu::ChanMapInd {
                    chan_map: map,
                    instant,
                }
            }
        };
        let _ = conn.enqueue_ctrl(pdu);
    }

    fn open_promoted(&mut self, handle: u16, next: Option<Procedure>) {
        if let Some(proc) = next {
            self.open_procedure(handle, proc);
        }
    }

    // ------------------------------------------------------------------
    // LLCP receive handling (task context).
    // ------------------------------------------------------------------

    fn handle_ctrl_pdu(&mut self, handle: u16, payload: &[u8], now: Instant) {
        let pdu = match LlcpPdu::decode(payload) {
            Ok(pdu) => pdu,
            Err(_) => {
                self.stats.rx_malformed += 1;
                return;
            }
        };
        // Entropy the slave-side encryption response may need, drawn
        // before the connection is borrowed.
        let (skd_s, iv_s) = (self.rng.next_u64(), self.rng.next_u32());
        let ev_mask = self.event_mask;
        let le_meta = ev_mask & event::MASK_LE_META != 0;
        let le_mask = self.le_event_mask;

        let Some(conn) = self.conns.get_mut(handle) else {
            return;
        };
        let role = conn.role;
        // Events to emit and terminations to apply once the borrow ends.
        let mut emits: heapless::Vec<EventBuf, 2> = heapless::Vec::new();
        let mut kill: Option<Status> = None;
        let mut promoted: Option<Procedure> = None;

        match pdu {
            LlcpPdu::ConnUpdateInd(upd) => {
                if role == ConnRole::Slave {
                    if conn.instant_passed(upd.instant) {
                        kill = Some(Status::InstantPassed);
                    } else {
                        conn.arm_update(upd);
                    }
                }
            }
            LlcpPdu::ChanMapInd { chan_map, instant } => {
                if role == ConnRole::Slave {
                    if conn.instant_passed(instant) {
                        kill = Some(Status::InstantPassed);
                    } else {
                        conn.arm_chan_map(chan_map, instant);
                    }
                }
            }
            LlcpPdu::TerminateInd { reason } => {
                kill = Some(Status::from_u8(reason));
            }
            LlcpPdu::EncReq {
                rand,
                ediv,
                skd_m,
                iv_m,
            } => {
                if role == ConnRole::Slave && conn.enc_state == EncState::Off {
                    conn.enc_keys.rand = rand;
                    conn.enc_keys.ediv = ediv;
                    conn.enc_keys.skd_m = skd_m;
                    conn.enc_keys.iv_m = iv_m;
                    conn.enc_keys.skd_s = skd_s;
                    conn.enc_keys.iv_s = iv_s;
                    let _ = conn.enqueue_ctrl(LlcpPdu::EncRsp { skd_s, iv_s });
                    if le_meta && le_mask & event::LE_MASK_LTK_REQUEST != 0 {
                        conn.enc_state = EncState::LtkWait;
                        conn.host_reply_awaited = true;
                        let _ = emits.push(event::le_ltk_request(handle, rand, ediv));
                    } else {
                        // Host cannot answer; refuse the handshake.
                        let _ = conn.enqueue_ctrl(LlcpPdu::RejectInd {
                            error: Status::PinKeyMissing as u8,
                        });
                    }
                }
            }
            LlcpPdu::EncRsp { skd_s, iv_s } => {
                if role == ConnRole::Master && conn.enc_state == EncState::ReqSent {
                    conn.enc_keys.skd_s = skd_s;
                    conn.enc_keys.iv_s = iv_s;
                }
            }
            LlcpPdu::StartEncReq => {
                if role == ConnRole::Master && conn.enc_state == EncState::ReqSent {
                    conn.enc_state = EncState::Starting;
                    let _ = conn.enqueue_ctrl(LlcpPdu::StartEncRsp);
                }
            }
            LlcpPdu::StartEncRsp => match (role, conn.enc_state) {
                (ConnRole::Master, EncState::Starting) => {
                    conn.enc_state = EncState::On;
                    promoted = conn.procs.complete(Procedure::Encrypt, now);
                    if ev_mask & event::MASK_ENCRYPTION_CHANGE != 0 {
                        let _ =
                            emits.push(event::encryption_change(Status::Success, handle, true));
                    }
                }
                (ConnRole::Slave, EncState::Starting) => {
                    let _ = conn.enqueue_ctrl(LlcpPdu::StartEncRsp);
                    conn.enc_state = EncState::On;
                    if ev_mask & event::MASK_ENCRYPTION_CHANGE != 0 {
                        let _ =
                            emits.push(event::encryption_change(Status::Success, handle, true));
                    }
                }
                _ => {}
            },
            LlcpPdu::FeatureReq { features } => {
                if role == ConnRole::Slave {
                    conn.peer_features = Some(features);
                    let _ = conn.enqueue_ctrl(LlcpPdu::FeatureRsp {
                        features: features & LOCAL_LE_FEATURES,
                    });
                }
            }
            LlcpPdu::SlaveFeatureReq { features } => {
                if role == ConnRole::Master {
                    conn.peer_features = Some(features);
                    let _ = conn.enqueue_ctrl(LlcpPdu::FeatureRsp {
                        features: features & LOCAL_LE_FEATURES,
                    });
                }
            }
            LlcpPdu::FeatureRsp { features } => {
                conn.peer_features = Some(features);
                if conn.procs.is_pending(Procedure::FeatureXchg) {
                    promoted = conn.procs.complete(Procedure::FeatureXchg, now);
                    conn.feature_event_owed = false;
                    if le_meta && le_mask & event::LE_MASK_READ_REMOTE_FEATURES != 0 {
                        let _ = emits.push(event::le_read_remote_features_complete(
                            Status::Success,
                            handle,
                            features,
                        ));
                    }
                }
            }
            LlcpPdu::VersionInd {
                version,
                company,
                subversion,
            } => {
                conn.peer_version = Some((version, company, subversion));
                if conn.procs.is_pending(Procedure::VersionXchg) {
                    promoted = conn.procs.complete(Procedure::VersionXchg, now);
                    conn.version_event_owed = false;
                    if ev_mask & event::MASK_READ_REMOTE_VERSION != 0 {
                        let _ = emits.push(event::read_remote_version_complete(
                            Status::Success,
                            handle,
                            version,
                            company,
                            subversion,
                        ));
                    }
                } else if !conn.version_sent {
                    conn.version_sent = true;
                    let _ = conn.enqueue_ctrl(LlcpPdu::VersionInd {
                        version: LL_VERSION,
                        company: COMPANY_ID,
                        subversion: SUBVERSION,
                    });
                }
            }
            LlcpPdu::RejectInd { error } | LlcpPdu::RejectExtInd { error, .. } => {
                if let Some(active) = conn.procs.active() {
                    promoted = conn.procs.complete(active, now);
                    let status = Status::from_u8(error);
                    match active {
                        Procedure::Encrypt => {
                            conn.enc_state = EncState::Off;
                            if ev_mask & event::MASK_ENCRYPTION_CHANGE != 0 {
                                let _ =
                                    emits.push(event::encryption_change(status, handle, false));
                            }
                        }
                        Procedure::ConnUpdate | Procedure::ConnParam => {
                            if le_meta && le_mask & event::LE_MASK_CONN_UPDATE != 0 {
                                let _ = emits.push(event::le_conn_update_complete(
                                    status,
                                    handle,
                                    conn.interval_units(),
                                    conn.latency(),
                                    conn.timeout_units(),
                                ));
                            }
                        }
                        _ => {}
                    }
                }
            }
            LlcpPdu::ConnParamReq(values) => {
                let conflict = conn
                    .procs
                    .active()
                    .is_some_and(|p| p.conflicts_with(Procedure::ConnParam));
                if conflict {
                    // Simultaneous renegotiation from both ends.
                    let _ = conn.enqueue_ctrl(LlcpPdu::RejectExtInd {
                        opcode: llcp::LL_CONNECTION_PARAM_REQ,
                        error: Status::LmpCollision as u8,
                    });
                } else if role == ConnRole::Master {
                    // The controller answers autonomously; the host is
                    // only consulted when the remote-request event is
                    // unmasked, which this controller does not claim.
                    let instant = conn
                        .event_counter
                        .wrapping_add(6)
                        .wrapping_add(values.latency);
                    let upd = llcp::ConnUpdateInd {
                        win_size: 1,
                        win_offset: 0,
                        interval: values.itvl_max,
                        latency: values.latency,
                        timeout: values.timeout,
                        instant,
                    };
                    conn.arm_update(upd);
                    let _ = conn.enqueue_ctrl(LlcpPdu::ConnUpdateInd(upd));
                } else {
                    let _ = conn.enqueue_ctrl(LlcpPdu::ConnParamRsp(values));
                }
            }
            LlcpPdu::ConnParamRsp(values) => {
                if role == ConnRole::Master && conn.procs.active() == Some(Procedure::ConnParam) {
                    let instant = conn
                        .event_counter
                        .wrapping_add(6)
                        .wrapping_add(values.latency);
                    let upd = llcp::ConnUpdateInd {
                        win_size: 1,
                        win_offset: 0,
                        interval: values.itvl_max,
                        latency: values.latency,
                        timeout: values.timeout,
                        instant,
                    };
                    conn.arm_update(upd);
                    let _ = conn.enqueue_ctrl(LlcpPdu::ConnUpdateInd(upd));
                }
            }
            LlcpPdu::UnknownRsp { unknown_type } => {
                // The peer does not speak the procedure we opened.
                if let Some(active) = conn.procs.active() {
                    let matches = matches!(
                        (active, unknown_type),
                        (Procedure::FeatureXchg, llcp::LL_SLAVE_FEATURE_REQ)
                            | (Procedure::FeatureXchg, llcp::LL_FEATURE_REQ)
                            | (Procedure::ConnParam, llcp::LL_CONNECTION_PARAM_REQ)
                            | (Procedure::VersionXchg, llcp::LL_VERSION_IND)
                    );
                    if matches {
                        promoted = conn.procs.complete(active, now);
                        match active {
                            Procedure::FeatureXchg => {
                                if le_meta && le_mask & event::LE_MASK_READ_REMOTE_FEATURES != 0 {
                                    let _ = emits.push(event::le_read_remote_features_complete(
                                        Status::UnsupportedRemoteFeature,
                                        handle,
                                        0,
                                    ));
                                }
                            }
                            Procedure::ConnParam => {
                                if le_meta && le_mask & event::LE_MASK_CONN_UPDATE != 0 {
                                    let _ = emits.push(event::le_conn_update_complete(
                                        Status::UnsupportedRemoteFeature,
                                        handle,
                                        conn.interval_units(),
                                        conn.latency(),
                                        conn.timeout_units(),
                                    ));
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
            LlcpPdu::Unknown { opcode } => {
                let _ = conn.enqueue_ctrl(LlcpPdu::UnknownRsp {
                    unknown_type: opcode,
                });
            }
        }

        for e in emits {
            self.emit(e);
        }
        if let Some(reason) = kill {
            self.terminate_conn(handle, reason);
        } else {
            self.open_promoted(handle, promoted);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hci::event::EVT_LE_META;
    use crate::testutil::{controller, tick, TestLl, PUBLIC_ADDR};

    fn own_pub() -> DeviceAddress {
        DeviceAddress::public(PUBLIC_ADDR)
    }

    fn cmd(ll: &mut TestLl, op: u16, params: &[u8]) {
        let mut packet: heapless::Vec<u8, 64> = heapless::Vec::new();
        packet.extend_from_slice(&op.to_le_bytes()).unwrap();
        packet.push(params.len() as u8).unwrap();
        packet.extend_from_slice(params).unwrap();
        ll.hci_command(&packet);
    }

    fn drain(ll: &mut TestLl) -> std::vec::Vec<EventBuf> {
        let mut out = std::vec::Vec::new();
        while let Some(e) = ll.pop_host_event() {
            out.push(e);
        }
        out
    }

    fn set_adv_params(ll: &mut TestLl, adv_type: u8) {
        let mut p = [0u8; 15];
        p[0..2].copy_from_slice(&32u16.to_le_bytes());
        p[2..4].copy_from_slice(&32u16.to_le_bytes());
        p[4] = adv_type;
        p[13] = 0x07;
        cmd(ll, crate::hci::OCMD_LE_SET_ADV_PARAMS, &p);
        let events = drain(ll);
        assert_eq!(events[0][5], 0, "set_adv_params failed");
    }

    fn enable_adv(ll: &mut TestLl) {
        cmd(ll, crate::hci::OCMD_LE_SET_ADV_ENABLE, &[1]);
        let events = drain(ll);
        assert_eq!(events[0][5], 0, "enable failed");
    }

    fn valid_lldata() -> LlData {
        LlData {
            access_addr: 0x50ab_36cd,
            crc_init: 0x00aa_bbcc,
            win_size: 1,
            win_offset: 4,
            interval: 40,
            latency: 0,
            timeout: 200,
            chan_map: [0xff, 0xff, 0xff, 0xff, 0x1f],
            hop: 7,
            sca: 0,
        }
    }

    #[test]
    fn adv_enable_transmits_on_channel_37() {
        let mut ll = controller();
        set_adv_params(&mut ll, 0x00);
        enable_adv(&mut ll);
        let (pdu, chan, transition) = ll.radio.adv_tx.clone().unwrap();
        assert_eq!(chan.index(), 37);
        assert_eq!(pdu[0] & 0x0f, 0x00); // ADV_IND
        assert_eq!(&pdu[2..8], &PUBLIC_ADDR);
        assert_eq!(transition, PhyTransition::Rx);
        assert!(ll.adv.is_enabled());
    }

    #[test]
    fn scan_req_gets_scan_rsp_without_finishing_the_event() {
        let mut ll = controller();
        set_adv_params(&mut ll, 0x00);
        cmd(
            &mut ll,
            crate::hci::OCMD_LE_SET_SCAN_RSP_DATA,
            &{
                let mut p = [0u8; 32];
                p[0] = 2;
                p[1] = 0xaa;
                p[2] = 0xbb;
                p
            },
        );
        enable_adv(&mut ll);
        drain(&mut ll);
        ll.on_transmit_end();
        assert_eq!(ll.cur_op, RadioOp::AdvRx);

        let scanner = DeviceAddress::random([9; 6]);
        let req = PduBuf::scan_req(&scanner, &own_pub()).unwrap();
        ll.on_receive(req.as_slice(), true, -50);

        let (pdu, chan, _) = ll.radio.adv_tx.clone().unwrap();
        assert_eq!(pdu[0] & 0x0f, 0x04); // SCAN_RSP
        assert_eq!(chan.index(), 37);
        assert_eq!(&pdu[8..10], &[0xaa, 0xbb]);
        assert_eq!(ll.cur_op, RadioOp::AdvRespTx);
        // The advertising event is still in progress.
        assert!(ll.adv.is_enabled());
        ll.run_pending();
        assert!(drain(&mut ll).is_empty());
    }

    #[test]
    fn connect_req_creates_slave_connection() {
        let mut ll = controller();
        set_adv_params(&mut ll, 0x00);
        enable_adv(&mut ll);
        drain(&mut ll);
        ll.on_transmit_end();

        let initiator = DeviceAddress::random([7; 6]);
        let req = PduBuf::connect_req(&initiator, &own_pub(), &valid_lldata()).unwrap();
        ll.on_receive(req.as_slice(), true, -40);
        ll.run_pending();

        assert!(!ll.adv.is_enabled());
        let conn = ll.conns.get(1).expect("no connection");
        assert_eq!(conn.role, ConnRole::Slave);
        assert_eq!(conn.peer, initiator);

        let events = drain(&mut ll);
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e[0], EVT_LE_META);
        assert_eq!(e[2], event::LE_SUBEV_CONN_COMPLETE);
        assert_eq!(e[3], 0); // success
        assert_eq!(u16::from_le_bytes([e[4], e[5]]), 1);
        assert_eq!(e[6], 0x01); // slave role
        // A connection event is on the schedule.
        assert!(ll.sched.next_start().is_some());
    }

    #[test]
    fn connect_req_ignored_when_table_full() {
        let mut ll = controller();
        for _ in 0..crate::config::MAX_CONNECTIONS {
            ll.conns
                .insert_with(|h| {
                    Connection::new(
                        h,
                        ConnRole::Slave,
                        own_pub(),
                        DeviceAddress::public([h as u8; 6]),
                        &valid_lldata(),
                        Instant::ZERO,
                    )
                })
                .unwrap();
        }
        set_adv_params(&mut ll, 0x00);
        enable_adv(&mut ll);
        drain(&mut ll);
        ll.on_transmit_end();
        let req = PduBuf::connect_req(
            &DeviceAddress::random([7; 6]),
            &own_pub(),
            &valid_lldata(),
        )
        .unwrap();
        ll.on_receive(req.as_slice(), true, -40);
        ll.run_pending();
        // Degraded, not dead: still advertising, no event for the host.
        assert!(ll.adv.is_enabled());
        assert!(drain(&mut ll).is_empty());
    }

    #[test]
    fn directed_hd_advertising_times_out_with_status_3c() {
        let mut ll = controller();
        let mut p = [0u8; 15];
        p[4] = 0x01; // high-duty-cycle directed
        p[6] = 0x00;
        p[7..13].copy_from_slice(&[9; 6]);
        p[13] = 0x07;
        cmd(&mut ll, crate::hci::OCMD_LE_SET_ADV_PARAMS, &p);
        enable_adv(&mut ll);
        drain(&mut ll);
        ll.on_transmit_end(); // listening after the first PDU

        tick(&mut ll, Duration::from_millis(1300));
        ll.run_pending();

        assert!(!ll.adv.is_enabled());
        let events = drain(&mut ll);
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e[0], EVT_LE_META);
        assert_eq!(e[2], event::LE_SUBEV_CONN_COMPLETE);
        assert_eq!(e[3], Status::DirectedAdvertisingTimeout.to_u8());
        assert_eq!(ll.adv.stats.hd_timeouts, 1);
    }

    #[test]
    fn create_connection_becomes_master() {
        let mut ll = controller();
        let peer = DeviceAddress::public([5; 6]);
        let mut p = [0u8; 25];
        p[0..2].copy_from_slice(&0x10u16.to_le_bytes()); // scan interval
        p[2..4].copy_from_slice(&0x10u16.to_le_bytes()); // scan window
        p[4] = 0; // filter policy: peer address
        p[5] = 0; // peer kind public
        p[6..12].copy_from_slice(&peer.bytes);
        p[12] = 0; // own public
        p[13..15].copy_from_slice(&24u16.to_le_bytes()); // itvl min
        p[15..17].copy_from_slice(&40u16.to_le_bytes()); // itvl max
        p[17..19].copy_from_slice(&0u16.to_le_bytes()); // latency
        p[19..21].copy_from_slice(&200u16.to_le_bytes()); // timeout
        p[21..23].copy_from_slice(&0u16.to_le_bytes());
        p[23..25].copy_from_slice(&2u16.to_le_bytes());
        cmd(&mut ll, crate::hci::OCMD_LE_CREATE_CONN, &p);
        let events = drain(&mut ll);
        assert_eq!(events[0][0], event::EVT_COMMAND_STATUS);
        assert_eq!(events[0][2], 0);
        // The initiator is listening.
        assert_eq!(ll.cur_op, RadioOp::InitRx);

        // The target advertises; we answer with CONNECT_REQ.
        let adv = PduBuf::adv_ind(&peer, &[]).unwrap();
        ll.on_receive(adv.as_slice(), true, -45);
        assert_eq!(ll.cur_op, RadioOp::ConnReqTx);
        let (pdu, _, _) = ll.radio.adv_tx.clone().unwrap();
        assert_eq!(pdu[0] & 0x0f, 0x05);

        ll.on_transmit_end();
        ll.run_pending();
        let conn = ll.conns.get(1).expect("no master connection");
        assert_eq!(conn.role, ConnRole::Master);
        assert!(ll.pending_create.is_none());
        let events = drain(&mut ll);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0][2], event::LE_SUBEV_CONN_COMPLETE);
        assert_eq!(events[0][6], 0x00); // master role
    }

    #[test]
    fn create_connection_rejects_bad_supervision_timeout() {
        let mut ll = controller();
        let mut p = [0u8; 25];
        p[0..2].copy_from_slice(&0x10u16.to_le_bytes());
        p[2..4].copy_from_slice(&0x10u16.to_le_bytes());
        p[13..15].copy_from_slice(&6u16.to_le_bytes());
        p[15..17].copy_from_slice(&3200u16.to_le_bytes());
        p[17..19].copy_from_slice(&0u16.to_le_bytes());
        p[19..21].copy_from_slice(&10u16.to_le_bytes()); // far too small
        cmd(&mut ll, crate::hci::OCMD_LE_CREATE_CONN, &p);
        let events = drain(&mut ll);
        assert_eq!(events[0][0], event::EVT_COMMAND_STATUS);
        assert_eq!(events[0][2], Status::InvalidHciParams.to_u8());
        assert!(ll.pending_create.is_none());
    }

    #[test]
    fn create_connection_cancel_event_ordering() {
        let mut ll = controller();
        let mut p = [0u8; 25];
        p[0..2].copy_from_slice(&0x10u16.to_le_bytes());
        p[2..4].copy_from_slice(&0x10u16.to_le_bytes());
        p[6..12].copy_from_slice(&[5; 6]);
        p[13..15].copy_from_slice(&24u16.to_le_bytes());
        p[15..17].copy_from_slice(&40u16.to_le_bytes());
        p[19..21].copy_from_slice(&200u16.to_le_bytes());
        p[23..25].copy_from_slice(&2u16.to_le_bytes());
        cmd(&mut ll, crate::hci::OCMD_LE_CREATE_CONN, &p);
        drain(&mut ll);
        cmd(&mut ll, crate::hci::OCMD_LE_CREATE_CONN_CANCEL, &[]);
        let events = drain(&mut ll);
        assert_eq!(events.len(), 2);
        // Command Complete first, then the synthetic connection
        // complete carrying Unknown Connection Identifier.
        assert_eq!(events[0][0], event::EVT_COMMAND_COMPLETE);
        assert_eq!(events[0][5], 0);
        assert_eq!(events[1][0], EVT_LE_META);
        assert_eq!(events[1][3], Status::UnknownConnectionId.to_u8());
        assert!(ll.pending_create.is_none());
        // A second cancel has nothing to cancel.
        cmd(&mut ll, crate::hci::OCMD_LE_CREATE_CONN_CANCEL, &[]);
        let events = drain(&mut ll);
        assert_eq!(events[0][5], Status::CommandDisallowed.to_u8());
    }

    #[test]
    fn whitelist_locked_while_filter_policy_active() {
        let mut ll = controller();
        cmd(
            &mut ll,
            crate::hci::OCMD_LE_ADD_WHITE_LIST,
            &[0, 1, 2, 3, 4, 5, 6],
        );
        assert_eq!(drain(&mut ll)[0][5], 0);

        let mut p = [0u8; 15];
        p[0..2].copy_from_slice(&32u16.to_le_bytes());
        p[2..4].copy_from_slice(&32u16.to_le_bytes());
        p[13] = 0x07;
        p[14] = 0x03; // whitelist for both scan and connect
        cmd(&mut ll, crate::hci::OCMD_LE_SET_ADV_PARAMS, &p);
        drain(&mut ll);
        enable_adv(&mut ll);
        drain(&mut ll);

        cmd(
            &mut ll,
            crate::hci::OCMD_LE_ADD_WHITE_LIST,
            &[0, 9, 9, 9, 9, 9, 9],
        );
        assert_eq!(drain(&mut ll)[0][5], Status::CommandDisallowed.to_u8());
        cmd(&mut ll, crate::hci::OCMD_LE_CLEAR_WHITE_LIST, &[]);
        assert_eq!(drain(&mut ll)[0][5], Status::CommandDisallowed.to_u8());

        cmd(&mut ll, crate::hci::OCMD_LE_SET_ADV_ENABLE, &[0]);
        drain(&mut ll);
        cmd(&mut ll, crate::hci::OCMD_LE_CLEAR_WHITE_LIST, &[]);
        assert_eq!(drain(&mut ll)[0][5], 0);
    }

    #[test]
    fn completed_packets_are_batched_and_rate_limited() {
        let mut ll = controller();
        for i in 0..3u16 {
            let h = ll
                .conns
                .insert_with(|h| {
                    Connection::new(
                        h,
                        ConnRole::Slave,
                        own_pub(),
                        DeviceAddress::public([i as u8 + 1; 6]),
                        &valid_lldata(),
                        Instant::ZERO,
                    )
                })
                .unwrap();
            let conn = ll.conns.get_mut(h).unwrap();
            conn.enqueue_acl(crate::conn::LLID_DATA_START, &[1]).unwrap();
            // Peer header acknowledging our PDU.
            conn.on_rx_header(&DataHeader {
                llid: crate::conn::LLID_DATA_CONT,
                nesn: true,
                sn: false,
                md: false,
                len: 0,
            });
        }
        // Too soon: rate limit holds the event back.
        ll.run_pending();
        assert!(drain(&mut ll).is_empty());

        ll.alarm.now = ll.alarm.now.wrapping_add(Duration::from_millis(60));
        ll.run_pending();
        let events = drain(&mut ll);
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e[0], event::EVT_NUM_COMPLETED_PACKETS);
        assert_eq!(e[2], 3);
        // Handles 1..=3 each completed exactly one packet, no
        // duplicates, no omissions.
        let mut handles: std::vec::Vec<u16> = (0..3)
            .map(|i| u16::from_le_bytes([e[3 + 2 * i], e[4 + 2 * i]]))
            .collect();
        handles.sort_unstable();
        assert_eq!(handles, std::vec![1, 2, 3]);
        for i in 0..3 {
            assert_eq!(u16::from_le_bytes([e[9 + 2 * i], e[10 + 2 * i]]), 1);
        }
        // Counters were consumed.
        ll.alarm.now = ll.alarm.now.wrapping_add(Duration::from_millis(60));
        ll.run_pending();
        assert!(drain(&mut ll).is_empty());
    }

    #[test]
    fn disconnect_completes_after_terminate_ack() {
        let mut ll = controller();
        set_adv_params(&mut ll, 0x00);
        enable_adv(&mut ll);
        drain(&mut ll);
        ll.on_transmit_end();
        let req = PduBuf::connect_req(
            &DeviceAddress::random([7; 6]),
            &own_pub(),
            &valid_lldata(),
        )
        .unwrap();
        ll.on_receive(req.as_slice(), true, -40);
        ll.run_pending();
        drain(&mut ll);

        cmd(&mut ll, crate::hci::OCMD_DISCONNECT, &[1, 0, 0x13]);
        let events = drain(&mut ll);
        assert_eq!(events[0][0], event::EVT_COMMAND_STATUS);
        assert_eq!(events[0][2], 0);
        // Second disconnect while one is in flight is rejected.
        cmd(&mut ll, crate::hci::OCMD_DISCONNECT, &[1, 0, 0x13]);
        assert_eq!(drain(&mut ll)[0][2], Status::CommandDisallowed.to_u8());

        // Run the connection event; the peer's header acknowledges our
        // LL_TERMINATE_IND.
        ll.alarm.now = ll.sched.next_start().unwrap();
        ll.on_alarm();
        assert!(matches!(ll.cur_op, RadioOp::ConnRx { handle: 1, .. }));
        ll.on_receive(&[0x05, 0x00], true, -40);
        ll.run_pending();

        assert!(ll.conns.get(1).is_none());
        let events = drain(&mut ll);
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e[0], event::EVT_DISCONNECTION_COMPLETE);
        assert_eq!(u16::from_le_bytes([e[3], e[4]]), 1);
        assert_eq!(e[5], Status::LocalHostTerminated.to_u8());
    }

    #[test]
    fn unknown_connection_handle_is_rejected_without_side_effects() {
        let mut ll = controller();
        cmd(&mut ll, crate::hci::OCMD_LE_READ_CHAN_MAP, &[7, 0]);
        let events = drain(&mut ll);
        assert_eq!(events[0][5], Status::UnknownConnectionId.to_u8());
        cmd(&mut ll, crate::hci::OCMD_DISCONNECT, &[7, 0, 0x13]);
        assert_eq!(
            drain(&mut ll)[0][2],
            Status::UnknownConnectionId.to_u8()
        );
    }

    #[test]
    fn reset_returns_to_power_on_state() {
        let mut ll = controller();
        set_adv_params(&mut ll, 0x00);
        enable_adv(&mut ll);
        drain(&mut ll);
        cmd(&mut ll, crate::hci::OCMD_RESET, &[]);
        let events = drain(&mut ll);
        assert_eq!(events[0][5], 0);
        assert!(!ll.adv.is_enabled());
        assert!(ll.sched.next_start().is_none());
        assert_eq!(ll.cur_op, RadioOp::Idle);
    }

    #[test]
    fn unknown_opcode_reports_unknown_command() {
        let mut ll = controller();
        cmd(&mut ll, crate::hci::opcode(0x08, 0x3ff), &[]);
        let events = drain(&mut ll);
        assert_eq!(events[0][0], event::EVT_COMMAND_COMPLETE);
        assert_eq!(events[0][5], Status::UnknownHciCommand.to_u8());
    }

    #[test]
    fn scanning_reports_and_filters_duplicates() {
        let mut ll = controller();
        let mut p = [0u8; 7];
        p[0] = 0; // passive
        p[1..3].copy_from_slice(&0x10u16.to_le_bytes());
        p[3..5].copy_from_slice(&0x10u16.to_le_bytes());
        cmd(&mut ll, crate::hci::OCMD_LE_SET_SCAN_PARAMS, &p);
        cmd(&mut ll, crate::hci::OCMD_LE_SET_SCAN_ENABLE, &[1, 1]);
        drain(&mut ll);
        assert_eq!(ll.cur_op, RadioOp::ScanRx);

        let advertiser = DeviceAddress::public([3; 6]);
        let adv = PduBuf::adv_ind(&advertiser, &[0x02, 0x01, 0x06]).unwrap();
        ll.on_receive(adv.as_slice(), true, -55);
        ll.on_receive(adv.as_slice(), true, -55);
        ll.run_pending();
        let events = drain(&mut ll);
        assert_eq!(events.len(), 1, "duplicate was not filtered");
        let e = &events[0];
        assert_eq!(e[0], EVT_LE_META);
        assert_eq!(e[2], event::LE_SUBEV_ADV_REPORT);
        assert_eq!(e[4], 0x00); // ADV_IND report
        assert_eq!(&e[6..12], &advertiser.bytes);
        assert_eq!(e[12], 3);
        assert_eq!(&e[13..16], &[0x02, 0x01, 0x06]);
        assert_eq!(e[16] as i8, -55);
    }

    #[test]
    fn slave_event_replies_and_reschedules() {
        let mut ll = controller();
        set_adv_params(&mut ll, 0x00);
        enable_adv(&mut ll);
        drain(&mut ll);
        ll.on_transmit_end();
        let req = PduBuf::connect_req(
            &DeviceAddress::random([7; 6]),
            &own_pub(),
            &valid_lldata(),
        )
        .unwrap();
        ll.on_receive(req.as_slice(), true, -40);
        ll.run_pending();
        drain(&mut ll);

        let anchor = ll.sched.next_start().unwrap();
        ll.alarm.now = anchor;
        ll.on_alarm();
        let (chan, aa) = ll.radio.data_rx.unwrap();
        assert!(chan.index() < 37);
        assert_eq!(aa, valid_lldata().access_addr);

        // Master's first packet: empty, sn=0, nesn=0.
        ll.on_receive(&[0x01, 0x00], true, -40);
        // We replied in the same event.
        assert!(ll.radio.data_tx.is_some());
        ll.on_transmit_end();
        ll.run_pending();
        // Next event is committed one interval later.
        let next = ll.sched.next_start().unwrap();
        assert_eq!(next.since(anchor), Duration::from_units_1250us(40));
        let conn = ll.conns.get(1).unwrap();
        assert!(conn.established);
        assert_eq!(conn.event_counter, 1);
    }
}
