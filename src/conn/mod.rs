// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2026.

//! Connection state machines.
//!
//! One [`Connection`] per link, held in a fixed arena indexed by
//! connection handle. A master connection is created by the Create
//! Connection command and starts life as the single [`PendingCreate`]
//! slot (the initiator); a slave connection is created when an accepted
//! CONNECT_REQ arrives on the advertising receive path. Either way the
//! connection is not *established* until its first received data channel
//! PDU; until then a failed link reports `ConnEstablishFailure` rather
//! than `ConnectionTimeout`.
//!
//! Channel selection is the Bluetooth 4.x hopping scheme: unmapped
//! channel advances by the hop increment modulo 37, remapping unused
//! channels through the table of used ones.

pub mod llcp;
pub mod params;

use heapless::Deque;

use crate::address::DeviceAddress;
use crate::config::{ACL_PAYLOAD_LEN, CONN_TX_QUEUE_LEN, MAX_CONNECTIONS};
use crate::error::Status;
use crate::hil::{RadioChannel, Rng, NUM_DATA_CHANNELS};
use crate::pdu::LlData;
use crate::time::{Duration, Instant};
use crate::whitelist::ScanFilterPolicy;
use llcp::Procedures;
use params::ConnParams;

/// Mandatory delay between the end of CONNECT_REQ and the transmit
/// window (Core Spec Vol. 6, Part B, 4.5.3).
pub const TRANSMIT_WINDOW_DELAY: Duration = Duration::from_micros(1250);
/// Events without a received PDU before an unestablished link gives up.
pub const ESTABLISH_TIMEOUT_INTERVALS: u32 = 6;
/// Advertising channel access address, never valid for a connection.
pub const ADV_ACCESS_ADDRESS: u32 = 0x8e89_bed6;

pub const LLID_DATA_CONT: u8 = 0b01;
pub const LLID_DATA_START: u8 = 0b10;
pub const LLID_CTRL: u8 = 0b11;

const HOP_MIN: u8 = 5;
const HOP_MAX: u8 = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnRole {
    Master,
    Slave,
}

/// Data channel PDU header (2 bytes on air).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DataHeader {
    pub llid: u8,
    pub nesn: bool,
    pub sn: bool,
    pub md: bool,
    pub len: u8,
}

impl DataHeader {
    pub fn encode(&self) -> [u8; 2] {
        let mut b0 = self.llid & 0x03;
        if self.nesn {
            b0 |= 0x04;
        }
        if self.sn {
            b0 |= 0x08;
        }
        if self.md {
            b0 |= 0x10;
        }
        [b0, self.len]
    }

    /// Split a received frame into header and payload, length-checked.
    pub fn decode(frame: &[u8]) -> Result<(DataHeader, &[u8]), Status> {
        if frame.len() < 2 {
            return Err(Status::UnspecifiedError);
        }
        let hdr = DataHeader {
            llid: frame[0] & 0x03,
            nesn: frame[0] & 0x04 != 0,
            sn: frame[0] & 0x08 != 0,
            md: frame[0] & 0x10 != 0,
            len: frame[1],
        };
        if hdr.llid == 0 || frame.len() != 2 + hdr.len as usize {
            return Err(Status::UnspecifiedError);
        }
        Ok((hdr, &frame[2..]))
    }
}

/// A queued outgoing data channel PDU.
#[derive(Clone, Debug)]
pub struct TxPdu {
    pub llid: u8,
    pub payload: heapless::Vec<u8, ACL_PAYLOAD_LEN>,
}

/// What acknowledgement processing concluded about a received header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct RxDisposition {
    /// The payload is new data (not a retransmission).
    pub new_data: bool,
    /// The peer acknowledged our most recent transmission.
    pub acked: bool,
    /// Control opcode of the acknowledged PDU, when it was a control PDU.
    pub acked_ctrl: Option<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventOutcome {
    /// Schedule the next connection event at this anchor.
    Continue {
        next_anchor: Instant,
        /// An armed connection update reached its instant this event.
        update_applied: bool,
        /// An armed channel map update reached its instant this event.
        map_applied: bool,
    },
    /// The link died; free the state machine and tell the host.
    Terminated(Status),
}

/// Encryption procedure progress. The cipher itself lives below the
/// radio seam; the link layer tracks the handshake and the key material.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EncState {
    Off,
    /// Master sent LL_ENC_REQ, waiting for LL_ENC_RSP + LL_START_ENC_REQ.
    ReqSent,
    /// Slave passed the LTK request to the host, waiting for the reply.
    LtkWait,
    /// LL_START_ENC_REQ sent (slave) / received (master).
    Starting,
    On,
}

/// Session key material carried through the encryption start procedure.
#[derive(Clone, Copy, Debug, Default)]
pub struct EncKeys {
    pub rand: u64,
    pub ediv: u16,
    pub ltk: [u8; 16],
    pub skd_m: u64,
    pub skd_s: u64,
    pub iv_m: u32,
    pub iv_s: u32,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ConnStats {
    pub events: u32,
    pub late_starts: u32,
    pub tx_queue_full: u32,
    pub crc_errors: u32,
}

pub struct Connection {
    handle: u16,
    pub role: ConnRole,
    pub own_addr: DeviceAddress,
    pub peer: DeviceAddress,

    pub access_addr: u32,
    pub crc_init: u32,
    hop: u8,
    /// Sleep clock accuracy index from CONNECT_REQ.
    pub sca: u8,

    used_channels: [bool; NUM_DATA_CHANNELS as usize],
    num_used_channels: u8,
    last_unmapped_channel: u8,
    /// Channel map update armed for `instant`.
    pending_chan_map: Option<([u8; 5], u16)>,
    /// Connection update armed for `instant`.
    pending_update: Option<llcp::ConnUpdateInd>,

    pub event_counter: u16,
    anchor: Instant,
    /// 1.25 ms units.
    interval: u16,
    latency: u16,
    /// 10 ms units.
    timeout: u16,
    /// 625 µs units, bounds the scheduled event window.
    ce_len: u16,

    pub established: bool,
    last_rx: Instant,

    /// Transmit sequence number and next expected sequence number.
    sn: bool,
    nesn: bool,
    tx_queue: Deque<TxPdu, CONN_TX_QUEUE_LEN>,
    /// ACL packets completed since the last Number Of Completed Packets.
    completed: u16,

    pub procs: Procedures,
    /// Armed when the host must answer LL_CONNECTION_PARAM_REQ before we
    /// respond to the peer.
    pub host_reply_awaited: bool,
    /// Completion events still owed to the host after a procedure that
    /// was already done when it asked again.
    pub feature_event_owed: bool,
    pub version_event_owed: bool,

    /// Set once by the first disconnect request.
    pub disconnecting: Option<Status>,
    pub enc_state: EncState,
    pub enc_keys: EncKeys,
    pub peer_features: Option<u64>,
    pub peer_version: Option<(u8, u16, u16)>,
    /// LL_VERSION_IND may only be sent once per connection.
    pub version_sent: bool,
    /// Parameters the host asked for, held until the peer answers the
    /// connection parameter request.
    pub requested_params: Option<llcp::ConnParamValues>,

    pub stats: ConnStats,
}

fn expand_channel_map(chm: &[u8; 5]) -> ([bool; NUM_DATA_CHANNELS as usize], u8) {
    let mut used = [false; NUM_DATA_CHANNELS as usize];
    let mut count = 0;
    for (i, slot) in used.iter_mut().enumerate() {
        if chm[i / 8] & (1 << (i % 8)) != 0 {
            *slot = true;
            count += 1;
        }
    }
    (used, count)
}

impl Connection {
    /// Build a connection from CONNECT_REQ timing data. `now` seeds the
    /// supervision clock; the anchor is set separately once the transmit
    /// window is known.
    pub fn new(
        handle: u16,
        role: ConnRole,
        own_addr: DeviceAddress,
        peer: DeviceAddress,
        lld: &LlData,
        now: Instant,
    ) -> Result<Connection, Status> {
        let (used_channels, num_used_channels) = expand_channel_map(&lld.chan_map);
        if num_used_channels < 2
            || lld.hop < HOP_MIN
            || lld.hop > HOP_MAX
            || lld.interval < params::CONN_ITVL_MIN
            || lld.interval > params::CONN_ITVL_MAX
            || lld.access_addr == ADV_ACCESS_ADDRESS
        {
            return Err(Status::UnspecifiedError);
        }
        Ok(Connection {
            handle,
            role,
            own_addr,
            peer,
            access_addr: lld.access_addr,
            crc_init: lld.crc_init & 0x00ff_ffff,
            hop: lld.hop,
            sca: lld.sca,
            used_channels,
            num_used_channels,
            last_unmapped_channel: 0,
            pending_chan_map: None,
            pending_update: None,
            event_counter: 0,
            anchor: now,
            interval: lld.interval,
            latency: lld.latency,
            timeout: lld.timeout,
            ce_len: 2,
            established: false,
            last_rx: now,
            sn: false,
            nesn: false,
            tx_queue: Deque::new(),
            completed: 0,
            procs: Procedures::new(),
            host_reply_awaited: false,
            feature_event_owed: false,
            version_event_owed: false,
            disconnecting: None,
            enc_state: EncState::Off,
            enc_keys: EncKeys::default(),
            peer_features: None,
            peer_version: None,
            version_sent: false,
            requested_params: None,
            stats: ConnStats::default(),
        })
    }

    pub fn handle(&self) -> u16 {
        self.handle
    }

    pub fn interval(&self) -> Duration {
        Duration::from_units_1250us(self.interval as u32)
    }

    pub fn interval_units(&self) -> u16 {
        self.interval
    }

    pub fn latency(&self) -> u16 {
        self.latency
    }

    pub fn timeout_units(&self) -> u16 {
        self.timeout
    }

    pub fn anchor(&self) -> Instant {
        self.anchor
    }

    pub fn set_anchor(&mut self, anchor: Instant) {
        self.anchor = anchor;
    }

    pub fn set_ce_len(&mut self, units_625: u16) {
        self.ce_len = units_625.max(2);
    }

    /// How long a scheduled event window may hold the radio.
    pub fn event_len(&self) -> Duration {
        let cap = self.interval as u32 * 2; // interval in 625 µs units
        Duration::from_units_625us((self.ce_len as u32).min(cap))
    }

    /// The 4.x hop sequence. Advances the unmapped channel and remaps
    /// through the used-channel table when it lands on an unused one.
    pub fn next_data_channel(&mut self) -> RadioChannel {
        let unmapped =
            (self.last_unmapped_channel + self.hop) % NUM_DATA_CHANNELS;
        self.last_unmapped_channel = unmapped;
        let index = if self.used_channels[unmapped as usize] {
            unmapped
        } else {
            let remap = unmapped % self.num_used_channels;
            let mut seen = 0;
            let mut found = 0;
            for (i, used) in self.used_channels.iter().enumerate() {
                if *used {
                    if seen == remap {
                        found = i as u8;
                        break;
                    }
                    seen += 1;
                }
            }
            found
        };
        // Data channels are always in range; `new` checked the map.
        RadioChannel::data(index).unwrap_or(RadioChannel::ADV_37)
    }

    /// The channel map currently in use, repacked for Read Channel Map.
    pub fn chan_map(&self) -> [u8; 5] {
        let mut map = [0; 5];
        for (i, used) in self.used_channels.iter().enumerate() {
            if *used {
                map[i / 8] |= 1 << (i % 8);
            }
        }
        map
    }

    pub fn arm_chan_map(&mut self, chan_map: [u8; 5], instant: u16) {
        self.pending_chan_map = Some((chan_map, instant));
    }

    pub fn arm_update(&mut self, update: llcp::ConnUpdateInd) {
        self.pending_update = Some(update);
    }

    pub fn has_pending_update(&self) -> bool {
        self.pending_update.is_some()
    }

    /// `true` iff `instant` is at or behind the current event counter.
    pub fn instant_passed(&self, instant: u16) -> bool {
        (instant.wrapping_sub(self.event_counter) as i16) <= 0
    }

    /// Acknowledgement handling for a received data header, per Core
    /// Spec Vol. 6, Part B, 4.5.9.
    pub fn on_rx_header(&mut self, hdr: &DataHeader) -> RxDisposition {
        let mut disp = RxDisposition::default();
        if hdr.sn == self.nesn {
            self.nesn = !self.nesn;
            disp.new_data = hdr.len > 0;
        }
        if hdr.nesn != self.sn {
            // Our last PDU got through.
            self.sn = !self.sn;
            if let Some(sent) = self.tx_queue.pop_front() {
                if sent.llid == LLID_CTRL {
                    disp.acked_ctrl = sent.payload.first().copied();
                } else {
                    self.completed = self.completed.saturating_add(1);
                }
            }
            disp.acked = true;
        }
        disp
    }

    /// The next PDU to transmit, or an empty continuation PDU to keep
    /// the event alive.
    pub fn peek_tx(&self) -> TxPdu {
        match self.tx_queue.front() {
            Some(pdu) => pdu.clone(),
            None => TxPdu {
                llid: LLID_DATA_CONT,
                payload: heapless::Vec::new(),
            },
        }
    }

    pub fn tx_header(&self, pdu: &TxPdu, md: bool) -> DataHeader {
        DataHeader {
            llid: pdu.llid,
            nesn: self.nesn,
            sn: self.sn,
            md,
            len: pdu.payload.len() as u8,
        }
    }

    /// Control PDUs jump the queue; the procedure rules already bound
    /// how many can be outstanding.
    pub fn enqueue_ctrl(&mut self, pdu: llcp::LlcpPdu) -> Result<(), Status> {
        let encoded = pdu.encode();
        let mut payload = heapless::Vec::new();
        payload
            .extend_from_slice(&encoded)
            .map_err(|_| Status::MemCapacityExceeded)?;
        self.tx_queue
            .push_front(TxPdu {
                llid: LLID_CTRL,
                payload,
            })
            .map_err(|_| {
                self.stats.tx_queue_full += 1;
                Status::MemCapacityExceeded
            })
    }

    pub fn enqueue_acl(&mut self, llid: u8, data: &[u8]) -> Result<(), Status> {
        if data.len() > ACL_PAYLOAD_LEN {
            return Err(Status::InvalidHciParams);
        }
        let mut payload = heapless::Vec::new();
        let _ = payload.extend_from_slice(data);
        self.tx_queue
            .push_back(TxPdu { llid, payload })
            .map_err(|_| {
                self.stats.tx_queue_full += 1;
                Status::MemCapacityExceeded
            })
    }

    pub fn tx_queue_len(&self) -> usize {
        self.tx_queue.len()
    }

    pub fn take_completed(&mut self) -> u16 {
        core::mem::take(&mut self.completed)
    }

    pub fn completed_pending(&self) -> u16 {
        self.completed
    }

    /// Record the first disconnect request; a second one while the
    /// termination runs is rejected, not queued.
    pub fn request_disconnect(&mut self, reason: Status) -> Result<(), Status> {
        if self.disconnecting.is_some() {
            return Err(Status::CommandDisallowed);
        }
        self.disconnecting = Some(reason);
        Ok(())
    }

    fn supervision_deadline(&self) -> Instant {
        let tmo = if self.established {
            Duration::from_units_10ms(self.timeout as u32)
        } else {
            self.interval().saturating_mul(ESTABLISH_TIMEOUT_INTERVALS)
        };
        self.last_rx.wrapping_add(tmo)
    }

    /// Close the current connection event. `rx_ok` is whether any PDU
    /// with a valid CRC arrived during the event.
    pub fn close_event(&mut self, now: Instant, rx_ok: bool) -> EventOutcome {
        self.stats.events += 1;
        if rx_ok {
            self.last_rx = now;
            self.established = true;
        }
        if now.is_at_or_after(self.supervision_deadline()) {
            let status = if self.established {
                Status::ConnectionTimeout
            } else {
                Status::ConnEstablishFailure
            };
            return EventOutcome::Terminated(status);
        }

        self.event_counter = self.event_counter.wrapping_add(1);

        let mut map_applied = false;
        if let Some((map, instant)) = self.pending_chan_map {
            if instant == self.event_counter {
                let (used, count) = expand_channel_map(&map);
                self.used_channels = used;
                self.num_used_channels = count;
                self.pending_chan_map = None;
                map_applied = true;
            }
        }
        let mut win_offset = Duration::ZERO;
        let mut update_applied = false;
        if let Some(upd) = self.pending_update {
            if upd.instant == self.event_counter {
                self.interval = upd.interval;
                self.latency = upd.latency;
                self.timeout = upd.timeout;
                win_offset = Duration::from_units_1250us(upd.win_offset as u32)
                    + TRANSMIT_WINDOW_DELAY;
                self.pending_update = None;
                update_applied = true;
            }
        }

        // Slave latency: skip events only on an established, idle link
        // with nothing armed.
        let skip = if self.can_apply_latency() {
            self.latency as u32
        } else {
            0
        };
        let next_anchor = self
            .anchor
            .wrapping_add(self.interval().saturating_mul(1 + skip))
            .wrapping_add(win_offset);
        self.anchor = next_anchor;
        EventOutcome::Continue {
            next_anchor,
            update_applied,
            map_applied,
        }
    }

    fn can_apply_latency(&self) -> bool {
        self.role == ConnRole::Slave
            && self.established
            && self.latency > 0
            && self.tx_queue.is_empty()
            && self.procs.active().is_none()
            && self.pending_update.is_none()
            && self.pending_chan_map.is_none()
            && self.disconnecting.is_none()
    }
}

/// Generate an access address satisfying the Vol. 6, Part B, 2.1.2
/// constraints, retrying on fresh entropy until one passes.
pub fn generate_access_addr(rng: &mut dyn Rng) -> u32 {
    loop {
        let aa = rng.next_u32();
        if access_addr_valid(aa) {
            return aa;
        }
    }
}

pub fn access_addr_valid(aa: u32) -> bool {
    if aa == ADV_ACCESS_ADDRESS {
        return false;
    }
    // Differ from the advertising access address in more than one bit.
    if (aa ^ ADV_ACCESS_ADDRESS).count_ones() <= 1 {
        return false;
    }
    // All four octets distinct from each other is not required; all
    // four *equal* is forbidden.
    let b = aa.to_le_bytes();
    if b[0] == b[1] && b[1] == b[2] && b[2] == b[3] {
        return false;
    }
    // No more than six consecutive zeros or ones, and 24 or fewer bit
    // transitions with at least two in the most significant six bits.
    let mut transitions = 0;
    let mut run = 1;
    let mut msb_transitions = 0;
    for i in 1..32 {
        let prev = (aa >> (i - 1)) & 1;
        let cur = (aa >> i) & 1;
        if prev == cur {
            run += 1;
            if run > 6 {
                return false;
            }
        } else {
            run = 1;
            transitions += 1;
            if i >= 26 {
                msb_transitions += 1;
            }
        }
    }
    transitions <= 24 && msb_transitions >= 2
}

/// The single pending master creation: initiator scan parameters plus
/// the connection parameters the new link will use.
pub struct PendingCreate {
    /// `None` when the initiator filter policy says "use the white list".
    pub peer: Option<DeviceAddress>,
    pub filter_policy: ScanFilterPolicy,
    pub own_addr: DeviceAddress,
    /// 625 µs units.
    pub scan_itvl: u16,
    pub scan_window: u16,
    pub params: ConnParams,
    pub chan: u8,
    pub window_start: Instant,
    /// Set once CONNECT_REQ is on the air, to ignore a late cancel.
    pub req_in_flight: bool,
    /// The advertiser we are connecting to, locked in on the first match.
    pub target: Option<DeviceAddress>,
    /// Timing data carried by the in-flight CONNECT_REQ.
    pub lldata: Option<LlData>,
}

impl PendingCreate {
    pub fn next_window(&mut self) -> Instant {
        self.chan = if self.chan == 39 { 37 } else { self.chan + 1 };
        self.window_start = self
            .window_start
            .wrapping_add(Duration::from_units_625us(self.scan_itvl as u32));
        self.window_start
    }

    pub fn window_len(&self) -> Duration {
        Duration::from_units_625us(self.scan_window as u32)
    }

    pub fn current_channel(&self) -> RadioChannel {
        RadioChannel::new(self.chan).unwrap_or(RadioChannel::ADV_37)
    }
}

/// The connection arena. Handles are `index + 1`, so handle 0 is never
/// valid and a freed slot can be reused without aliasing a live handle.
pub struct ConnectionTable {
    slots: [Option<Connection>; MAX_CONNECTIONS],
}

impl ConnectionTable {
    pub fn new() -> ConnectionTable {
        ConnectionTable {
            slots: core::array::from_fn(|_| None),
        }
    }

    pub fn count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(|s| s.is_some())
    }

    /// Reserve a slot and build the connection for its handle.
    pub fn insert_with(
        &mut self,
        build: impl FnOnce(u16) -> Result<Connection, Status>,
    ) -> Result<u16, Status> {
        let idx = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(Status::ConnLimit)?;
        let handle = idx as u16 + 1;
        let conn = build(handle)?;
        self.slots[idx] = Some(conn);
        Ok(handle)
    }

    pub fn get(&self, handle: u16) -> Option<&Connection> {
        let idx = handle.checked_sub(1)? as usize;
        self.slots.get(idx)?.as_ref()
    }

    pub fn get_mut(&mut self, handle: u16) -> Option<&mut Connection> {
        let idx = handle.checked_sub(1)? as usize;
        self.slots.get_mut(idx)?.as_mut()
    }

    pub fn remove(&mut self, handle: u16) -> Option<Connection> {
        let idx = handle.checked_sub(1)? as usize;
        self.slots.get_mut(idx)?.take()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> + '_ {
        self.slots.iter_mut().filter_map(|s| s.as_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> + '_ {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    pub fn find_peer(&self, peer: &DeviceAddress) -> Option<&Connection> {
        self.iter().find(|c| c.peer == *peer)
    }
}
