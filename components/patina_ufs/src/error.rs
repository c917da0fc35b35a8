//! Error types for the UFS driver engine.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use r_efi::efi;

/// A specialized [`Result`](core::result::Result) type for UFS operations.
pub type Result<T> = core::result::Result<T, UfsError>;

/// Errors produced by the UFS command engine.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum UfsError {
    /// A caller-supplied argument failed validation before any hardware interaction.
    InvalidParameter,
    /// No transfer request slot is currently free. Retryable; no state was mutated.
    NotReady,
    /// A register wait or doorbell wait exceeded its budget.
    Timeout,
    /// The hardware reported a nonzero completion/response/query-result code, or a
    /// host-adapter-level I/O failure occurred.
    DeviceError,
    /// DMA buffer allocation, mapping, or host memory allocation failed.
    OutOfResources,
    /// The target device itself reported a nonzero SCSI response code. Sense data and
    /// target status are still populated in the request packet.
    TargetFailure,
    /// Link startup failed after its bounded retries, or a LUN lookup did not match
    /// the exposed LUN set.
    NotFound,
    /// The requested operation or opcode combination is not supported.
    Unsupported,
}

impl From<UfsError> for efi::Status {
    fn from(e: UfsError) -> efi::Status {
        match e {
            UfsError::InvalidParameter => efi::Status::INVALID_PARAMETER,
            UfsError::NotReady => efi::Status::NOT_READY,
            UfsError::Timeout => efi::Status::TIMEOUT,
            UfsError::DeviceError => efi::Status::DEVICE_ERROR,
            UfsError::OutOfResources => efi::Status::OUT_OF_RESOURCES,
            // The EFI SCSI pass-thru boundary reports a target failure as a device
            // error; the distinction survives in the packet status fields.
            UfsError::TargetFailure => efi::Status::DEVICE_ERROR,
            UfsError::NotFound => efi::Status::NOT_FOUND,
            UfsError::Unsupported => efi::Status::UNSUPPORTED,
        }
    }
}
