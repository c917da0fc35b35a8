//! UFS (Universal Flash Storage) Pass-Thru Driver Engine
//!
//! This crate implements the command and transfer-request engine of a UFS
//! host controller driver: UTP transfer request slot management, UPIU
//! construction, synchronous and asynchronous SCSI dispatch, the query-based
//! device management sub-protocol, UIC command sequencing, and the controller
//! bring-up/teardown sequence.
//!
//! The engine consumes two narrow host traits — [`host::UfsHostController`]
//! for MMIO and DMA, and [`host::BootServices`] for events, timers, TPL, and
//! stalls — so the driver-binding and protocol glue layered on top stay thin
//! and the engine itself is testable off-target.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

extern crate alloc;

pub mod controller;
pub mod device;
pub mod error;
pub mod host;
pub mod lun;
pub mod regs;
pub mod scsi;
pub mod upiu;

mod hci;
mod monitor;
mod queue;

#[cfg(test)]
mod test_support;

pub use controller::{UfsController, UfsHcPlatform};
pub use error::{Result, UfsError};
pub use scsi::ScsiRequestPacket;
pub use upiu::DataDirection;
