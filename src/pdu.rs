// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2026.

//! Advertising channel PDU construction and parsing.
//!
//! Layouts follow Core Spec Vol. 6, Part B, 2.3. Every accessor is
//! length-checked: a short or oversized frame parses to an error instead
//! of an out-of-range read, and builders refuse payloads that would not
//! fit the 37-byte advertising payload. Multi-byte fields are
//! little-endian on air.

use crate::address::{AddrKind, DeviceAddress, BD_ADDR_LEN};
use crate::error::Status;

pub const PDU_HDR_LEN: usize = 2;
pub const MAX_PAYLOAD_LEN: usize = 37;
pub const MAX_PDU_LEN: usize = PDU_HDR_LEN + MAX_PAYLOAD_LEN;
pub const MAX_ADV_DATA_LEN: usize = 31;
pub const LL_DATA_LEN: usize = 22;

const HDR_TYPE_MASK: u8 = 0x0f;
const HDR_TXADD: u8 = 0x40;
const HDR_RXADD: u8 = 0x80;

/// Advertising channel PDU types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum AdvPduType {
    AdvInd = 0x00,
    AdvDirectInd = 0x01,
    AdvNonconnInd = 0x02,
    ScanReq = 0x03,
    ScanRsp = 0x04,
    ConnectReq = 0x05,
    AdvScanInd = 0x06,
}

impl AdvPduType {
    pub fn from_u8(v: u8) -> Result<AdvPduType, Status> {
        match v {
            0x00 => Ok(AdvPduType::AdvInd),
            0x01 => Ok(AdvPduType::AdvDirectInd),
            0x02 => Ok(AdvPduType::AdvNonconnInd),
            0x03 => Ok(AdvPduType::ScanReq),
            0x04 => Ok(AdvPduType::ScanRsp),
            0x05 => Ok(AdvPduType::ConnectReq),
            0x06 => Ok(AdvPduType::AdvScanInd),
            _ => Err(Status::UnspecifiedError),
        }
    }
}

/// The LLData block of a CONNECT_REQ payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LlData {
    pub access_addr: u32,
    /// 24 significant bits.
    pub crc_init: u32,
    /// Transmit window size, 1.25 ms units.
    pub win_size: u8,
    /// Transmit window offset, 1.25 ms units.
    pub win_offset: u16,
    /// Connection interval, 1.25 ms units.
    pub interval: u16,
    pub latency: u16,
    /// Supervision timeout, 10 ms units.
    pub timeout: u16,
    pub chan_map: [u8; 5],
    /// 5-bit hop increment.
    pub hop: u8,
    /// 3-bit master sleep clock accuracy index.
    pub sca: u8,
}

impl LlData {
    pub fn encode(&self, out: &mut [u8]) -> Result<(), Status> {
        if out.len() < LL_DATA_LEN {
            return Err(Status::UnspecifiedError);
        }
        out[0..4].copy_from_slice(&self.access_addr.to_le_bytes());
        out[4..7].copy_from_slice(&self.crc_init.to_le_bytes()[0..3]);
        out[7] = self.win_size;
        out[8..10].copy_from_slice(&self.win_offset.to_le_bytes());
        out[10..12].copy_from_slice(&self.interval.to_le_bytes());
        out[12..14].copy_from_slice(&self.latency.to_le_bytes());
        out[14..16].copy_from_slice(&self.timeout.to_le_bytes());
        out[16..21].copy_from_slice(&self.chan_map);
        out[21] = (self.hop & 0x1f) | (self.sca << 5);
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<LlData, Status> {
        if data.len() < LL_DATA_LEN {
            return Err(Status::UnspecifiedError);
        }
        let mut chan_map = [0; 5];
        chan_map.copy_from_slice(&data[16..21]);
        Ok(LlData {
            access_addr: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            crc_init: u32::from_le_bytes([data[4], data[5], data[6], 0]),
            win_size: data[7],
            win_offset: u16::from_le_bytes([data[8], data[9]]),
            interval: u16::from_le_bytes([data[10], data[11]]),
            latency: u16::from_le_bytes([data[12], data[13]]),
            timeout: u16::from_le_bytes([data[14], data[15]]),
            chan_map,
            hop: data[21] & 0x1f,
            sca: data[21] >> 5,
        })
    }
}

/// An owned advertising channel PDU, header included.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PduBuf {
    buf: [u8; MAX_PDU_LEN],
    len: usize,
}

impl PduBuf {
    fn new(pdu_type: AdvPduType, tx_add: bool, rx_add: bool) -> PduBuf {
        let mut buf = [0; MAX_PDU_LEN];
        buf[0] = pdu_type as u8
            | if tx_add { HDR_TXADD } else { 0 }
            | if rx_add { HDR_RXADD } else { 0 };
        PduBuf {
            buf,
            len: PDU_HDR_LEN,
        }
    }

    fn push(&mut self, bytes: &[u8]) -> Result<(), Status> {
        let end = self.len + bytes.len();
        if end > MAX_PDU_LEN {
            return Err(Status::UnspecifiedError);
        }
        self.buf[self.len..end].copy_from_slice(bytes);
        self.len = end;
        self.buf[1] = (self.len - PDU_HDR_LEN) as u8;
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn pdu_type(&self) -> u8 {
        self.buf[0] & HDR_TYPE_MASK
    }

    pub fn adv_ind(adva: &DeviceAddress, adv_data: &[u8]) -> Result<PduBuf, Status> {
        Self::adv_with_data(AdvPduType::AdvInd, adva, adv_data)
    }

    pub fn adv_nonconn_ind(adva: &DeviceAddress, adv_data: &[u8]) -> Result<PduBuf, Status> {
        Self::adv_with_data(AdvPduType::AdvNonconnInd, adva, adv_data)
    }

    pub fn adv_scan_ind(adva: &DeviceAddress, adv_data: &[u8]) -> Result<PduBuf, Status> {
        Self::adv_with_data(AdvPduType::AdvScanInd, adva, adv_data)
    }

    fn adv_with_data(
        pdu_type: AdvPduType,
        adva: &DeviceAddress,
        adv_data: &[u8],
    ) -> Result<PduBuf, Status> {
        if adv_data.len() > MAX_ADV_DATA_LEN {
            return Err(Status::InvalidHciParams);
        }
        let mut pdu = PduBuf::new(pdu_type, adva.kind.to_header_bit(), false);
        pdu.push(&adva.bytes)?;
        pdu.push(adv_data)?;
        Ok(pdu)
    }

    pub fn adv_direct_ind(adva: &DeviceAddress, inita: &DeviceAddress) -> Result<PduBuf, Status> {
        let mut pdu = PduBuf::new(
            AdvPduType::AdvDirectInd,
            adva.kind.to_header_bit(),
            inita.kind.to_header_bit(),
        );
        pdu.push(&adva.bytes)?;
        pdu.push(&inita.bytes)?;
        Ok(pdu)
    }

    pub fn scan_rsp(adva: &DeviceAddress, scan_rsp_data: &[u8]) -> Result<PduBuf, Status> {
        if scan_rsp_data.len() > MAX_ADV_DATA_LEN {
            return Err(Status::InvalidHciParams);
        }
        let mut pdu = PduBuf::new(AdvPduType::ScanRsp, adva.kind.to_header_bit(), false);
        pdu.push(&adva.bytes)?;
        pdu.push(scan_rsp_data)?;
        Ok(pdu)
    }

    pub fn scan_req(scana: &DeviceAddress, adva: &DeviceAddress) -> Result<PduBuf, Status> {
        let mut pdu = PduBuf::new(
            AdvPduType::ScanReq,
            scana.kind.to_header_bit(),
            adva.kind.to_header_bit(),
        );
        pdu.push(&scana.bytes)?;
        pdu.push(&adva.bytes)?;
        Ok(pdu)
    }

    pub fn connect_req(
        inita: &DeviceAddress,
        adva: &DeviceAddress,
        lldata: &LlData,
    ) -> Result<PduBuf, Status> {
        let mut pdu = PduBuf::new(
            AdvPduType::ConnectReq,
            inita.kind.to_header_bit(),
            adva.kind.to_header_bit(),
        );
        pdu.push(&inita.bytes)?;
        pdu.push(&adva.bytes)?;
        let mut ll = [0; LL_DATA_LEN];
        lldata.encode(&mut ll)?;
        pdu.push(&ll)?;
        Ok(pdu)
    }
}

/// A parsed advertising channel PDU borrowing the receive buffer.
#[derive(Clone, Copy, Debug)]
pub struct Pdu<'a> {
    pub pdu_type: AdvPduType,
    pub tx_add: bool,
    pub rx_add: bool,
    pub payload: &'a [u8],
}

impl<'a> Pdu<'a> {
    /// Parse a frame, header included. The header length field must match
    /// the frame exactly; trailing garbage is rejected.
    pub fn parse(frame: &'a [u8]) -> Result<Pdu<'a>, Status> {
        if frame.len() < PDU_HDR_LEN {
            return Err(Status::UnspecifiedError);
        }
        let pdu_type = AdvPduType::from_u8(frame[0] & HDR_TYPE_MASK)?;
        let len = frame[1] as usize;
        if len > MAX_PAYLOAD_LEN || frame.len() != PDU_HDR_LEN + len {
            return Err(Status::UnspecifiedError);
        }
        Ok(Pdu {
            pdu_type,
            tx_add: frame[0] & HDR_TXADD != 0,
            rx_add: frame[0] & HDR_RXADD != 0,
            payload: &frame[PDU_HDR_LEN..],
        })
    }

    fn addr_at(&self, offset: usize, kind: AddrKind) -> Result<DeviceAddress, Status> {
        let end = offset + BD_ADDR_LEN;
        if self.payload.len() < end {
            return Err(Status::UnspecifiedError);
        }
        let mut bytes = [0; BD_ADDR_LEN];
        bytes.copy_from_slice(&self.payload[offset..end]);
        Ok(DeviceAddress::new(kind, bytes))
    }

    /// AdvA and advertising data of an ADV_IND / ADV_NONCONN_IND /
    /// ADV_SCAN_IND / SCAN_RSP payload.
    pub fn adv_payload(&self) -> Result<(DeviceAddress, &'a [u8]), Status> {
        match self.pdu_type {
            AdvPduType::AdvInd
            | AdvPduType::AdvNonconnInd
            | AdvPduType::AdvScanInd
            | AdvPduType::ScanRsp => {
                let adva = self.addr_at(0, AddrKind::from_header_bit(self.tx_add))?;
                Ok((adva, &self.payload[BD_ADDR_LEN..]))
            }
            _ => Err(Status::UnspecifiedError),
        }
    }

    /// AdvA and InitA of an ADV_DIRECT_IND payload.
    pub fn direct_payload(&self) -> Result<(DeviceAddress, DeviceAddress), Status> {
        if self.pdu_type != AdvPduType::AdvDirectInd || self.payload.len() != 2 * BD_ADDR_LEN {
            return Err(Status::UnspecifiedError);
        }
        let adva = self.addr_at(0, AddrKind::from_header_bit(self.tx_add))?;
        let inita = self.addr_at(BD_ADDR_LEN, AddrKind::from_header_bit(self.rx_add))?;
        Ok((adva, inita))
    }

    /// ScanA and AdvA of a SCAN_REQ payload.
    pub fn scan_req(&self) -> Result<(DeviceAddress, DeviceAddress), Status> {
        if self.pdu_type != AdvPduType::ScanReq || self.payload.len() != 2 * BD_ADDR_LEN {
            return Err(Status::UnspecifiedError);
        }
        let scana = self.addr_at(0, AddrKind::from_header_bit(self.tx_add))?;
        let adva = self.addr_at(BD_ADDR_LEN, AddrKind::from_header_bit(self.rx_add))?;
        Ok((scana, adva))
    }

    /// InitA, AdvA and LLData of a CONNECT_REQ payload.
    pub fn connect_req(&self) -> Result<(DeviceAddress, DeviceAddress, LlData), Status> {
        if self.pdu_type != AdvPduType::ConnectReq
            || self.payload.len() != 2 * BD_ADDR_LEN + LL_DATA_LEN
        {
            return Err(Status::UnspecifiedError);
        }
        let inita = self.addr_at(0, AddrKind::from_header_bit(self.tx_add))?;
        let adva = self.addr_at(BD_ADDR_LEN, AddrKind::from_header_bit(self.rx_add))?;
        let lldata = LlData::decode(&self.payload[2 * BD_ADDR_LEN..])?;
        Ok((inita, adva, lldata))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const ADVA: DeviceAddress = DeviceAddress {
        kind: AddrKind::Public,
        bytes: [0x11, 0x22, 0x33, 0x44, 0x55, 0x66],
    };
    const INITA: DeviceAddress = DeviceAddress {
        kind: AddrKind::Random,
        bytes: [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff],
    };

    #[test]
    fn adv_ind_layout() {
        let pdu = PduBuf::adv_ind(&ADVA, &[0x02, 0x01, 0x06]).unwrap();
        let frame = pdu.as_slice();
        assert_eq!(frame[0], 0x00);
        assert_eq!(frame[1], 9);
        assert_eq!(&frame[2..8], &ADVA.bytes);
        assert_eq!(&frame[8..], &[0x02, 0x01, 0x06]);
    }

    #[test]
    fn direct_ind_sets_both_address_bits() {
        let pdu = PduBuf::adv_direct_ind(&INITA, &INITA).unwrap();
        assert_eq!(pdu.as_slice()[0] & 0xc0, 0xc0);
        assert_eq!(pdu.as_slice()[1], 12);
    }

    #[test]
    fn adv_data_too_long_is_rejected() {
        assert_eq!(
            PduBuf::adv_ind(&ADVA, &[0; 32]).unwrap_err(),
            Status::InvalidHciParams
        );
    }

    #[test]
    fn parse_rejects_length_mismatch() {
        // Header claims 9 payload bytes, frame carries 8.
        let mut frame = [0u8; 10];
        frame[1] = 9;
        assert!(Pdu::parse(&frame).is_err());
        // Length over the advertising maximum.
        let mut long = [0u8; 2 + 38];
        long[1] = 38;
        assert!(Pdu::parse(&long).is_err());
    }

    #[test]
    fn scan_req_round_trip() {
        let built = PduBuf::scan_req(&INITA, &ADVA).unwrap();
        let pdu = Pdu::parse(built.as_slice()).unwrap();
        assert_eq!(pdu.pdu_type, AdvPduType::ScanReq);
        let (scana, adva) = pdu.scan_req().unwrap();
        assert_eq!(scana, INITA);
        assert_eq!(adva, ADVA);
    }

    #[test]
    fn connect_req_round_trip() {
        let lldata = LlData {
            access_addr: 0x8e89_c3a1,
            crc_init: 0x00aa_55cc,
            win_size: 2,
            win_offset: 6,
            interval: 40,
            latency: 1,
            timeout: 200,
            chan_map: [0xff, 0xff, 0xff, 0xff, 0x1f],
            hop: 7,
            sca: 1,
        };
        let built = PduBuf::connect_req(&INITA, &ADVA, &lldata).unwrap();
        assert_eq!(built.as_slice().len(), 2 + 12 + LL_DATA_LEN);
        let pdu = Pdu::parse(built.as_slice()).unwrap();
        let (inita, adva, decoded) = pdu.connect_req().unwrap();
        assert_eq!(inita, INITA);
        assert_eq!(adva, ADVA);
        assert_eq!(decoded, lldata);
    }

    #[test]
    fn lldata_hop_sca_packing() {
        let mut raw = [0u8; LL_DATA_LEN];
        raw[21] = 0b101_01101;
        let ll = LlData::decode(&raw).unwrap();
        assert_eq!(ll.hop, 0b01101);
        assert_eq!(ll.sca, 0b101);
    }
}
