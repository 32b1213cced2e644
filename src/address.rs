// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2026.

//! Device addresses.

use crate::error::Status;

pub const BD_ADDR_LEN: usize = 6;

/// HCI address type. Only the first two travel on air; the identity kinds
/// exist so command decoding can reject them where they are not legal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum AddrKind {
    Public = 0x00,
    Random = 0x01,
    PublicIdentity = 0x02,
    RandomIdentity = 0x03,
}

impl AddrKind {
    pub fn from_u8(v: u8) -> Result<AddrKind, Status> {
        match v {
            0x00 => Ok(AddrKind::Public),
            0x01 => Ok(AddrKind::Random),
            0x02 => Ok(AddrKind::PublicIdentity),
            0x03 => Ok(AddrKind::RandomIdentity),
            _ => Err(Status::InvalidHciParams),
        }
    }

    /// The single TxAdd/RxAdd header bit of an advertising PDU.
    pub fn to_header_bit(self) -> bool {
        matches!(self, AddrKind::Random | AddrKind::RandomIdentity)
    }

    pub fn from_header_bit(bit: bool) -> AddrKind {
        if bit {
            AddrKind::Random
        } else {
            AddrKind::Public
        }
    }
}

/// A (kind, 48-bit address) pair, stored little-endian as it appears on
/// air and in HCI parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceAddress {
    pub kind: AddrKind,
    pub bytes: [u8; BD_ADDR_LEN],
}

impl DeviceAddress {
    pub fn new(kind: AddrKind, bytes: [u8; BD_ADDR_LEN]) -> DeviceAddress {
        DeviceAddress { kind, bytes }
    }

    pub fn public(bytes: [u8; BD_ADDR_LEN]) -> DeviceAddress {
        DeviceAddress::new(AddrKind::Public, bytes)
    }

    pub fn random(bytes: [u8; BD_ADDR_LEN]) -> DeviceAddress {
        DeviceAddress::new(AddrKind::Random, bytes)
    }

    /// A random address of all zeroes is never valid to transmit with.
    pub fn is_valid_random(&self) -> bool {
        self.bytes.iter().any(|b| *b != 0)
    }
}

#[cfg(test)]
mod test {
    use super::{AddrKind, DeviceAddress};

    #[test]
    fn kind_decoding() {
        assert_eq!(AddrKind::from_u8(0).unwrap(), AddrKind::Public);
        assert_eq!(AddrKind::from_u8(1).unwrap(), AddrKind::Random);
        assert!(AddrKind::from_u8(4).is_err());
    }

    #[test]
    fn header_bit_round_trip() {
        assert!(!AddrKind::Public.to_header_bit());
        assert!(AddrKind::Random.to_header_bit());
        assert_eq!(AddrKind::from_header_bit(true), AddrKind::Random);
    }

    #[test]
    fn zero_random_address_is_invalid() {
        assert!(!DeviceAddress::random([0; 6]).is_valid_random());
        assert!(DeviceAddress::random([0xc0, 0, 0, 0, 0, 1]).is_valid_random());
    }
}
