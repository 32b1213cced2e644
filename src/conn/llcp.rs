// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2026.

//! LL Control PDUs and the control procedure bookkeeping.
//!
//! Control PDUs ride the data channel with LLID = 0b11; the first payload
//! byte is the control opcode. Decoding an opcode this controller does
//! not implement yields [`LlcpPdu::Unknown`] so the caller can answer
//! with LL_UNKNOWN_RSP instead of dropping the frame; a *malformed* PDU
//! of a known opcode is an error and is dropped.
//!
//! [`Procedures`] enforces the one-procedure-in-flight rule: starting a
//! procedure while another runs queues it, starting one that is already
//! running or queued is rejected, and completing the active procedure
//! hands back the next queued one so no host request is silently lost.

use heapless::Vec;

use crate::error::Status;
use crate::time::{Duration, Instant};

/// Control PDU payload capacity (opcode byte included).
pub const CTRL_PDU_MAX: usize = 27;

/// Procedure response timeout (Core Spec Vol. 6, Part B, 5.2).
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(40);

pub const LL_CONNECTION_UPDATE_IND: u8 = 0x00;
pub const LL_CHANNEL_MAP_IND: u8 = 0x01;
pub const LL_TERMINATE_IND: u8 = 0x02;
pub const LL_ENC_REQ: u8 = 0x03;
pub const LL_ENC_RSP: u8 = 0x04;
pub const LL_START_ENC_REQ: u8 = 0x05;
pub const LL_START_ENC_RSP: u8 = 0x06;
pub const LL_UNKNOWN_RSP: u8 = 0x07;
pub const LL_FEATURE_REQ: u8 = 0x08;
pub const LL_FEATURE_RSP: u8 = 0x09;
pub const LL_VERSION_IND: u8 = 0x0c;
pub const LL_REJECT_IND: u8 = 0x0d;
pub const LL_SLAVE_FEATURE_REQ: u8 = 0x0e;
pub const LL_CONNECTION_PARAM_REQ: u8 = 0x0f;
pub const LL_CONNECTION_PARAM_RSP: u8 = 0x10;
pub const LL_REJECT_EXT_IND: u8 = 0x11;

/// LL_CONNECTION_UPDATE_IND body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnUpdateInd {
    pub win_size: u8,
    pub win_offset: u16,
    pub interval: u16,
    pub latency: u16,
    pub timeout: u16,
    pub instant: u16,
}

/// The negotiable fields of LL_CONNECTION_PARAM_REQ/RSP.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnParamValues {
    pub itvl_min: u16,
    pub itvl_max: u16,
    pub latency: u16,
    pub timeout: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LlcpPdu {
    ConnUpdateInd(ConnUpdateInd),
    ChanMapInd { chan_map: [u8; 5], instant: u16 },
    TerminateInd { reason: u8 },
    EncReq { rand: u64, ediv: u16, skd_m: u64, iv_m: u32 },
    EncRsp { skd_s: u64, iv_s: u32 },
    StartEncReq,
    StartEncRsp,
    UnknownRsp { unknown_type: u8 },
    FeatureReq { features: u64 },
    FeatureRsp { features: u64 },
    SlaveFeatureReq { features: u64 },
    VersionInd { version: u8, company: u16, subversion: u16 },
    RejectInd { error: u8 },
    ConnParamReq(ConnParamValues),
    ConnParamRsp(ConnParamValues),
    RejectExtInd { opcode: u8, error: u8 },
    /// An opcode we do not implement; answered with LL_UNKNOWN_RSP.
    Unknown { opcode: u8 },
}

fn rd_u16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn rd_u32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn rd_u64(b: &[u8], at: usize) -> u64 {
    let mut v = [0; 8];
    v.copy_from_slice(&b[at..at + 8]);
    u64::from_le_bytes(v)
}

// Every encoder stays within CTRL_PDU_MAX, so the append cannot fail.
fn put(out: &mut Vec<u8, CTRL_PDU_MAX>, bytes: &[u8]) {
    let _ = out.extend_from_slice(bytes);
}

impl LlcpPdu {
    /// Decode a control PDU payload (opcode byte first).
    pub fn decode(p: &[u8]) -> Result<LlcpPdu, Status> {
        let op = *p.first().ok_or(Status::UnspecifiedError)?;
        let b = &p[1..];
        let need = |n: usize| {
            if b.len() == n {
                Ok(())
            } else {
                Err(Status::UnspecifiedError)
            }
        };
        match op {
            LL_CONNECTION_UPDATE_IND => {
                need(11)?;
                Ok(LlcpPdu::ConnUpdateInd(ConnUpdateInd {
                    win_size: b[0],
                    win_offset: rd_u16(b, 1),
                    interval: rd_u16(b, 3),
                    latency: rd_u16(b, 5),
                    timeout: rd_u16(b, 7),
                    instant: rd_u16(b, 9),
                }))
            }
            LL_CHANNEL_MAP_IND => {
                need(7)?;
                let mut chan_map = [0; 5];
                chan_map.copy_from_slice(&b[0..5]);
                Ok(LlcpPdu::ChanMapInd {
                    chan_map,
                    instant: rd_u16(b, 5),
                })
            }
            LL_TERMINATE_IND => {
                need(1)?;
                Ok(LlcpPdu::TerminateInd { reason: b[0] })
            }
            LL_ENC_REQ => {
                need(22)?;
                Ok(LlcpPdu::EncReq {
                    rand: rd_u64(b, 0),
                    ediv: rd_u16(b, 8),
                    skd_m: rd_u64(b, 10),
                    iv_m: rd_u32(b, 18),
                })
            }
            LL_ENC_RSP => {
                need(12)?;
                Ok(LlcpPdu::EncRsp {
                    skd_s: rd_u64(b, 0),
                    iv_s: rd_u32(b, 8),
                })
            }
            LL_START_ENC_REQ => {
                need(0)?;
                Ok(LlcpPdu::StartEncReq)
            }
            LL_START_ENC_RSP => {
                need(0)?;
                Ok(LlcpPdu::StartEncRsp)
            }
            LL_UNKNOWN_RSP => {
                need(1)?;
                Ok(LlcpPdu::UnknownRsp { unknown_type: b[0] })
            }
            LL_FEATURE_REQ => {
                need(8)?;
                Ok(LlcpPdu::FeatureReq {
                    features: rd_u64(b, 0),
                })
            }
            LL_FEATURE_RSP => {
                need(8)?;
                Ok(LlcpPdu::FeatureRsp {
                    features: rd_u64(b, 0),
                })
            }
            LL_SLAVE_FEATURE_REQ => {
                need(8)?;
                Ok(LlcpPdu::SlaveFeatureReq {
                    features: rd_u64(b, 0),
                })
            }
            LL_VERSION_IND => {
                need(5)?;
                Ok(LlcpPdu::VersionInd {
                    version: b[0],
                    company: rd_u16(b, 1),
                    subversion: rd_u16(b, 3),
                })
            }
            LL_REJECT_IND => {
                need(1)?;
                Ok(LlcpPdu::RejectInd { error: b[0] })
            }
            LL_CONNECTION_PARAM_REQ => {
                need(23)?;
                Ok(LlcpPdu::ConnParamReq(Self::decode_param_values(b)))
            }
            LL_CONNECTION_PARAM_RSP => {
                need(23)?;
                Ok(LlcpPdu::ConnParamRsp(Self::decode_param_values(b)))
            }
            LL_REJECT_EXT_IND => {
                need(2)?;
                Ok(LlcpPdu::RejectExtInd {
                    opcode: b[0],
                    error: b[1],
                })
            }
            opcode => Ok(LlcpPdu::Unknown { opcode }),
        }
    }

    fn decode_param_values(b: &[u8]) -> ConnParamValues {
        ConnParamValues {
            itvl_min: rd_u16(b, 0),
            itvl_max: rd_u16(b, 2),
            latency: rd_u16(b, 4),
            timeout: rd_u16(b, 6),
        }
    }

    /// Encode to a control PDU payload, opcode byte first.
    pub fn encode(&self) -> Vec<u8, CTRL_PDU_MAX> {
        let mut buf: Vec<u8, CTRL_PDU_MAX> = Vec::new();
        let out = &mut buf;
        match *self {
            LlcpPdu::ConnUpdateInd(u) => {
                put(out, &[LL_CONNECTION_UPDATE_IND, u.win_size]);
                put(out, &u.win_offset.to_le_bytes());
                put(out, &u.interval.to_le_bytes());
                put(out, &u.latency.to_le_bytes());
                put(out, &u.timeout.to_le_bytes());
                put(out, &u.instant.to_le_bytes());
            }
            LlcpPdu::ChanMapInd { chan_map, instant } => {
                put(out, &[LL_CHANNEL_MAP_IND]);
                put(out, &chan_map);
                put(out, &instant.to_le_bytes());
            }
            LlcpPdu::TerminateInd { reason } => put(out, &[LL_TERMINATE_IND, reason]),
            LlcpPdu::EncReq {
                rand,
                ediv,
                skd_m,
                iv_m,
            } => {
                put(out, &[LL_ENC_REQ]);
                put(out, &rand.to_le_bytes());
                put(out, &ediv.to_le_bytes());
                put(out, &skd_m.to_le_bytes());
                put(out, &iv_m.to_le_bytes());
            }
            LlcpPdu::EncRsp { skd_s, iv_s } => {
                put(out, &[LL_ENC_RSP]);
                put(out, &skd_s.to_le_bytes());
                put(out, &iv_s.to_le_bytes());
            }
            LlcpPdu::StartEncReq => put(out, &[LL_START_ENC_REQ]),
            LlcpPdu::StartEncRsp => put(out, &[LL_START_ENC_RSP]),
            LlcpPdu::UnknownRsp { unknown_type } => put(out, &[LL_UNKNOWN_RSP, unknown_type]),
            LlcpPdu::FeatureReq { features } => {
                put(out, &[LL_FEATURE_REQ]);
                put(out, &features.to_le_bytes());
            }
            LlcpPdu::FeatureRsp { features } => {
                put(out, &[LL_FEATURE_RSP]);
                put(out, &features.to_le_bytes());
            }
            LlcpPdu::SlaveFeatureReq { features } => {
                put(out, &[LL_SLAVE_FEATURE_REQ]);
                put(out, &features.to_le_bytes());
            }
            LlcpPdu::VersionInd {
                version,
                company,
                subversion,
            } => {
                put(out, &[LL_VERSION_IND, version]);
                put(out, &company.to_le_bytes());
                put(out, &subversion.to_le_bytes());
            }
            LlcpPdu::RejectInd { error } => put(out, &[LL_REJECT_IND, error]),
            LlcpPdu::ConnParamReq(v) => {
                put(out, &[LL_CONNECTION_PARAM_REQ]);
                Self::encode_param_values(out, &v);
            }
            LlcpPdu::ConnParamRsp(v) => {
                put(out, &[LL_CONNECTION_PARAM_RSP]);
                Self::encode_param_values(out, &v);
            }
            LlcpPdu::RejectExtInd { opcode, error } => put(out, &[LL_REJECT_EXT_IND, opcode, error]),
            LlcpPdu::Unknown { opcode } => put(out, &[opcode]),
        }
        buf
    }

    fn encode_param_values(out: &mut Vec<u8, CTRL_PDU_MAX>, v: &ConnParamValues) {
        put(out, &v.itvl_min.to_le_bytes());
        put(out, &v.itvl_max.to_le_bytes());
        put(out, &v.latency.to_le_bytes());
        put(out, &v.timeout.to_le_bytes());
        // No periodicity preference, no reference event, offsets unused.
        put(out, &[0x00]);
        put(out, &0u16.to_le_bytes());
        put(out, &[0xff; 12]);
    }
}

/// The named control procedures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Procedure {
    ConnUpdate,
    ConnParam,
    ChanMapUpdate,
    Encrypt,
    FeatureXchg,
    VersionXchg,
    Terminate,
}

impl Procedure {
    fn bit(self) -> u8 {
        match self {
            Procedure::ConnUpdate => 1 << 0,
            Procedure::ConnParam => 1 << 1,
            Procedure::ChanMapUpdate => 1 << 2,
            Procedure::Encrypt => 1 << 3,
            Procedure::FeatureXchg => 1 << 4,
            Procedure::VersionXchg => 1 << 5,
            Procedure::Terminate => 1 << 6,
        }
    }

    const ALL: [Procedure; 7] = [
        Procedure::ConnUpdate,
        Procedure::ConnParam,
        Procedure::ChanMapUpdate,
        Procedure::Encrypt,
        Procedure::FeatureXchg,
        Procedure::VersionXchg,
        Procedure::Terminate,
    ];

    /// Procedures that renegotiate the connection's timing cannot run
    /// concurrently from the two ends; a peer-initiated one arriving
    /// while we run ours is the LL collision case.
    pub fn conflicts_with(self, other: Procedure) -> bool {
        const TIMING: u8 = 0b0000_0111; // ConnUpdate | ConnParam | ChanMapUpdate
        if self == other {
            return true;
        }
        self.bit() & TIMING != 0 && other.bit() & TIMING != 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    /// No procedure was running; send the opening PDU now.
    Started,
    /// Another procedure is in flight; queued for when it completes.
    Queued,
    /// The same procedure is already running or queued.
    AlreadyPending,
}

/// Per-connection procedure state: one active, the rest bit-queued.
pub struct Procedures {
    active: Option<Procedure>,
    queued: u8,
    /// Response deadline for the active procedure.
    pub deadline: Option<Instant>,
}

impl Procedures {
    pub const fn new() -> Procedures {
        Procedures {
            active: None,
            queued: 0,
            deadline: None,
        }
    }

    pub fn active(&self) -> Option<Procedure> {
        self.active
    }

    pub fn is_pending(&self, p: Procedure) -> bool {
        self.active == Some(p) || self.queued & p.bit() != 0
    }

    pub fn start(&mut self, p: Procedure, now: Instant) -> StartOutcome {
        if self.is_pending(p) {
            return StartOutcome::AlreadyPending;
        }
        match self.active {
            None => {
                self.active = Some(p);
                self.deadline = Some(now.wrapping_add(RESPONSE_TIMEOUT));
                StartOutcome::Started
            }
            Some(_) => {
                self.queued |= p.bit();
                StartOutcome::Queued
            }
        }
    }

    /// Complete the active procedure; returns the next queued procedure,
    /// now promoted to active, if any. Completing a procedure that is
    /// not active clears its queued bit only.
    pub fn complete(&mut self, p: Procedure, now: Instant) -> Option<Procedure> {
        if self.active == Some(p) {
            self.active = None;
            self.deadline = None;
            for next in Procedure::ALL {
                if self.queued & next.bit() != 0 {
                    self.queued &= !next.bit();
                    self.active = Some(next);
                    self.deadline = Some(now.wrapping_add(RESPONSE_TIMEOUT));
                    return Some(next);
                }
            }
        } else {
            self.queued &= !p.bit();
        }
        None
    }

    pub fn response_overdue(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now.is_at_or_after(d))
    }
}
