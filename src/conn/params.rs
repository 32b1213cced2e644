// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2026.

//! Connection parameter validation, shared by Create Connection and
//! Connection Update.

use crate::error::Status;

pub const CONN_ITVL_MIN: u16 = 0x0006;
pub const CONN_ITVL_MAX: u16 = 0x0c80;
pub const CONN_LATENCY_MAX: u16 = 0x01f3;
pub const SUPERVISION_TMO_MIN: u16 = 0x000a;
pub const SUPERVISION_TMO_MAX: u16 = 0x0c80;

/// The negotiable parameter set, in HCI units (1.25 ms intervals, 10 ms
/// supervision timeout, 625 µs CE lengths).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnParams {
    pub itvl_min: u16,
    pub itvl_max: u16,
    pub latency: u16,
    pub supervision_timeout: u16,
    pub min_ce_len: u16,
    pub max_ce_len: u16,
}

impl ConnParams {
    /// Range checks from Core Spec Vol. 4, Part E, 7.8.12, plus the
    /// cross-field rule that the supervision timeout must outlast one
    /// full latency period twice over.
    pub fn validate(&self) -> Result<(), Status> {
        if self.itvl_min > self.itvl_max
            || self.itvl_min < CONN_ITVL_MIN
            || self.itvl_max > CONN_ITVL_MAX
        {
            return Err(Status::InvalidHciParams);
        }
        if self.latency > CONN_LATENCY_MAX {
            return Err(Status::InvalidHciParams);
        }
        if self.supervision_timeout < SUPERVISION_TMO_MIN
            || self.supervision_timeout > SUPERVISION_TMO_MAX
        {
            return Err(Status::InvalidHciParams);
        }
        // supervision(µs) > (1 + latency) * itvl_max(µs) * 2. Computed in
        // 64 bits; the product can exceed u32 at the extremes.
        let tmo_us = self.supervision_timeout as u64 * 10_000;
        let period_us = (1 + self.latency as u64) * (self.itvl_max as u64 * 1250) * 2;
        if tmo_us <= period_us {
            return Err(Status::InvalidHciParams);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn params(itvl: u16, latency: u16, tmo: u16) -> ConnParams {
        ConnParams {
            itvl_min: itvl,
            itvl_max: itvl,
            latency,
            supervision_timeout: tmo,
            min_ce_len: 0,
            max_ce_len: 0,
        }
    }

    #[test]
    fn accepts_ordinary_params() {
        params(40, 0, 200).validate().unwrap();
        params(CONN_ITVL_MIN, 0, SUPERVISION_TMO_MIN).validate().unwrap();
    }

    #[test]
    fn interval_bounds() {
        assert!(params(5, 0, 200).validate().is_err());
        assert!(params(0x0c81, 0, 0x0c80).validate().is_err());
        let mut p = params(40, 0, 200);
        p.itvl_min = 41;
        assert!(p.validate().is_err());
    }

    #[test]
    fn latency_bound() {
        assert!(params(6, 0x01f4, 0x0c80).validate().is_err());
    }

    #[test]
    fn supervision_timeout_must_cover_latency_period() {
        // itvl_max = 3200 (4 s): (1+0) * 4s * 2 = 8 s, 10 * 10 ms = 100 ms.
        let err = params(3200, 0, 10).validate().unwrap_err();
        assert_eq!(err, Status::InvalidHciParams);
        // Boundary: equal is still rejected.
        // itvl = 40 (50 ms) -> period = 100 ms = timeout of 10.
        assert!(params(40, 0, 10).validate().is_err());
        assert!(params(40, 0, 11).validate().is_ok());
    }

    #[test]
    fn latency_scales_the_required_timeout() {
        // itvl = 6 (7.5 ms), latency 100: (101 * 7.5ms * 2) = 1515 ms.
        assert!(params(6, 100, 151).validate().is_err());
        assert!(params(6, 100, 152).validate().is_ok());
    }
}
