//! Logical unit addressing: the exposed LUN set and SCSI ⇄ UFS translation.
//!
//! SCSI callers address logical units with a 64-bit LUN whose first byte is
//! either a common LUN number or the well-known prefix `0xC1` followed by the
//! well-known unit id. The UFS wire format uses a single byte with the high
//! bit marking well-known units.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use crate::error::{Result, UfsError};

/// Prefix byte marking a well-known LUN in a SCSI-format 64-bit LUN.
pub const SCSI_WLUN_PREFIX: u8 = 0xC1;

/// Native UFS bit marking a well-known LUN.
pub const UFS_WLUN_BIT: u8 = 0x80;

/// REPORT LUNS well-known logical unit.
pub const UFS_WLUN_REPORT_LUNS: u8 = 0x81;
/// UFS DEVICE well-known logical unit.
pub const UFS_WLUN_UFS_DEVICE: u8 = 0xD0;
/// BOOT well-known logical unit.
pub const UFS_WLUN_BOOT: u8 = 0xB0;
/// RPMB well-known logical unit.
pub const UFS_WLUN_RPMB: u8 = 0xC4;

/// Number of common (unit descriptor backed) logical units.
pub const UFS_COMMON_LUN_COUNT: u8 = 8;

const LUN_SLOTS: usize = 12;
const RPMB_BIT: u16 = 1 << 11;

/// The set of logical units a UFS device exposes.
///
/// Computed once during attach by probing unit descriptors; read-only
/// afterwards. Bits 0..8 cover the common LUNs; bits 8..12 cover the
/// well-known units, with RPMB gated on device support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LunSet {
    bit_mask: u16,
    lun: [u8; LUN_SLOTS],
}

impl LunSet {
    /// Creates a set exposing the always-present well-known units and no
    /// common LUNs yet.
    pub fn new() -> Self {
        let mut lun = [0u8; LUN_SLOTS];
        for (position, slot) in lun.iter_mut().enumerate().take(UFS_COMMON_LUN_COUNT as usize) {
            *slot = position as u8;
        }
        lun[8] = UFS_WLUN_REPORT_LUNS;
        lun[9] = UFS_WLUN_UFS_DEVICE;
        lun[10] = UFS_WLUN_BOOT;
        lun[11] = UFS_WLUN_RPMB;
        Self { bit_mask: 0b0111 << 8, lun }
    }

    /// Marks a probed common LUN as exposed.
    pub fn enable_common(&mut self, lun: u8) {
        debug_assert!(lun < UFS_COMMON_LUN_COUNT);
        self.bit_mask |= 1 << lun;
    }

    /// Marks the RPMB well-known unit as exposed.
    pub fn enable_rpmb(&mut self) {
        self.bit_mask |= RPMB_BIT;
    }

    /// Whether `ufs_lun` (native encoding) is exposed by the device.
    pub fn contains(&self, ufs_lun: u8) -> bool {
        self.lun
            .iter()
            .enumerate()
            .any(|(position, &lun)| self.bit_mask & (1 << position) != 0 && lun == ufs_lun)
    }

    /// The raw exposure bitmask; bits 0..8 are common LUNs, 8..12 well-known.
    pub fn bit_mask(&self) -> u16 {
        self.bit_mask
    }
}

impl Default for LunSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Translates a SCSI-format 64-bit LUN to the native UFS encoding.
pub fn scsi_lun_to_ufs(scsi_lun: u64) -> Result<u8> {
    let bytes = scsi_lun.to_le_bytes();
    if bytes[2..].iter().any(|&b| b != 0) {
        return Err(UfsError::InvalidParameter);
    }
    if bytes[0] == SCSI_WLUN_PREFIX {
        if bytes[1] & UFS_WLUN_BIT != 0 {
            return Err(UfsError::InvalidParameter);
        }
        Ok(UFS_WLUN_BIT | bytes[1])
    } else if bytes[0] < UFS_COMMON_LUN_COUNT && bytes[1] == 0 {
        Ok(bytes[0])
    } else {
        Err(UfsError::InvalidParameter)
    }
}

/// Translates a native UFS LUN to the SCSI-format 64-bit encoding.
pub fn ufs_lun_to_scsi(ufs_lun: u8) -> Result<u64> {
    if ufs_lun & UFS_WLUN_BIT != 0 {
        let mut bytes = [0u8; 8];
        bytes[0] = SCSI_WLUN_PREFIX;
        bytes[1] = ufs_lun & !UFS_WLUN_BIT;
        Ok(u64::from_le_bytes(bytes))
    } else if ufs_lun < UFS_COMMON_LUN_COUNT {
        Ok(ufs_lun as u64)
    } else {
        Err(UfsError::InvalidParameter)
    }
}
