//! Asynchronous completion monitor for non-blocking SCSI requests.
//!
//! A periodic timer drives one tick per millisecond. Each tick snapshots the
//! doorbell register once, then walks the in-flight list in FIFO insertion
//! order: a cleared slot bit finishes the request through the shared response
//! processing; a still-set bit burns one tick of the request's timeout budget;
//! a doorbell read failure finishes the request with a host adapter phase
//! error. Finishing removes the entry, runs the full teardown, and signals the
//! caller's event exactly once.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use alloc::vec::Vec;
use core::ffi::c_void;

use r_efi::efi;

use crate::controller::UfsController;
use crate::host::{BootServices, TplGuard, UfsHostController};
use crate::regs::REG_UTRLDBR;
use crate::scsi::{
    InFlightRequest, HOST_ADAPTER_STATUS_PHASE_ERROR, HOST_ADAPTER_STATUS_TIMEOUT_COMMAND,
};

/// Monitor tick period: 1 ms in 100 ns units.
pub(crate) const ASYNC_TIMER_PERIOD: u64 = 10_000;

/// How a finished in-flight request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotOutcome {
    /// The hardware cleared the doorbell bit.
    Complete,
    /// The timeout budget was exhausted before completion.
    Timeout,
    /// The doorbell register could not be read.
    PhaseError,
}

/// Timer notify entry point; `context` is the owning controller.
pub(crate) extern "efiapi" fn process_async_requests<H: UfsHostController, B: BootServices>(
    _event: efi::Event,
    context: *mut c_void,
) {
    // SAFETY: the controller creates the timer with its own boxed address and
    // cancels it before that allocation is released.
    let controller = unsafe { &*(context as *const UfsController<H, B>) };
    controller.async_tick();
}

impl<H: UfsHostController, B: BootServices> UfsController<H, B> {
    /// One monitor tick over the in-flight list.
    pub(crate) fn async_tick(&self) {
        // One doorbell read per tick; every entry is validated against its own
        // slot bit of this snapshot.
        let doorbell = self.read_reg(REG_UTRLDBR);

        let mut finished: Vec<(InFlightRequest, SlotOutcome)> = Vec::new();
        {
            let _tpl = TplGuard::raise(&self.bs, efi::TPL_CALLBACK);
            let mut pending = self.pending.borrow_mut();
            let mut index = 0;
            while index < pending.len() {
                let outcome = match doorbell {
                    Err(_) => Some(SlotOutcome::PhaseError),
                    Ok(bits) if bits & (1u32 << pending[index].slot) != 0 => {
                        let entry = &mut pending[index];
                        if entry.timeout_remain > ASYNC_TIMER_PERIOD {
                            entry.timeout_remain -= ASYNC_TIMER_PERIOD;
                            None
                        } else {
                            Some(SlotOutcome::Timeout)
                        }
                    }
                    Ok(_) => Some(SlotOutcome::Complete),
                };
                match outcome {
                    None => index += 1,
                    Some(outcome) => {
                        if let Some(entry) = pending.remove(index) {
                            finished.push((entry, outcome));
                        }
                    }
                }
            }
        }

        for (entry, outcome) in finished {
            self.finish_async_request(entry, outcome);
        }
    }

    /// Completes one removed in-flight entry: response extraction, teardown,
    /// and the caller's event signal. The entry never returns to the list, so
    /// a request cannot be finished twice.
    pub(crate) fn finish_async_request(&self, entry: InFlightRequest, outcome: SlotOutcome) {
        // SAFETY: the caller contract keeps the packet alive until its event
        // is signaled below.
        let packet = unsafe { &mut *entry.packet };
        match outcome {
            SlotOutcome::Complete => {
                let _ = self.process_scsi_response(entry.slot, packet, &entry.cmd_desc);
            }
            SlotOutcome::Timeout => {
                log::warn!("UfsPassThru: async request on slot {} timed out", entry.slot);
                packet.host_adapter_status = HOST_ADAPTER_STATUS_TIMEOUT_COMMAND;
            }
            SlotOutcome::PhaseError => {
                log::error!("UfsPassThru: async request on slot {} failed at the host adapter", entry.slot);
                packet.host_adapter_status = HOST_ADAPTER_STATUS_PHASE_ERROR;
            }
        }

        if let Err(e) = self.host.flush() {
            log::error!("UfsPassThru: flush failed during async completion: {e:?}");
        }
        if let Err(e) = self.stop_slot(entry.slot) {
            log::error!("UfsPassThru: slot teardown failed during async completion: {e:?}");
        }
        self.release_data_phase(entry.direction, entry.caller_buffer, entry.data_length, entry.data_mapping, entry.bounce);
        self.destroy_command_descriptor(entry.cmd_desc);
        if let Err(e) = self.bs.signal_event(entry.event) {
            log::error!("UfsPassThru: completion event signal failed: {e:?}");
        }
    }
}
