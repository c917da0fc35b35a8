//! SCSI command execution over the UFS transport.
//!
//! A request packet mirrors the EFI extended SCSI pass-thru packet: raw caller
//! buffers, CDB, timeout, and out-parameters for host adapter status, target
//! status, sense length, and transfer lengths. Commands run either blocking
//! (doorbell polled inline) or non-blocking (completion delegated to the
//! periodic monitor, caller signaled through an event).
//!
//! Data buffers that are not DWORD aligned, or whose length is not a DWORD
//! multiple, are staged through a bounce buffer; the fixup is invisible to the
//! caller beyond the copy cost, and the bounce pages are zeroed before being
//! freed.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use core::ffi::c_void;
use core::ptr;

use r_efi::efi;

use crate::controller::UfsController;
use crate::error::{Result, UfsError};
use crate::host::{pages_for, BootServices, DmaDirection, DmaMapping, TplGuard, UfsHostController, PAGE_SIZE};
use crate::queue::{
    CommandDescriptor, TransferRequestDescriptor, OCS_SUCCESS, TRD_DD_NONE, TRD_DD_SYSTEM_TO_TARGET,
    TRD_DD_TARGET_TO_SYSTEM,
};
use crate::regs::REG_UTRLDBR;
use crate::upiu::{
    fill_prdt, get_be16, prdt_entry_count, round_up8, CommandUpiu, DataDirection, PrdtEntry, ResponseUpiu,
    PRDT_ENTRY_SIZE, UPIU_FLAG_UNDERFLOW, UPIU_HEADER_SIZE,
};

/// Host adapter status: no error.
pub const HOST_ADAPTER_STATUS_OK: u8 = 0x00;
/// Host adapter status: the command timed out.
pub const HOST_ADAPTER_STATUS_TIMEOUT_COMMAND: u8 = 0x09;
/// Host adapter status: a bus phase sequence error occurred.
pub const HOST_ADAPTER_STATUS_PHASE_ERROR: u8 = 0x14;
/// Host adapter status: unclassified failure.
pub const HOST_ADAPTER_STATUS_OTHER: u8 = 0x7F;

/// Largest sense payload the response area reserves.
const SENSE_DATA_MAX: usize = 18;

/// Response area size: response UPIU header plus the sense data segment,
/// rounded to the inter-region granularity.
pub(crate) const SCSI_RESPONSE_AREA: usize = round_up8(UPIU_HEADER_SIZE + 2 + SENSE_DATA_MAX);

/// A SCSI request packet, mirroring the EFI extended SCSI pass-thru layout.
///
/// Buffer pointers remain caller-owned; for non-blocking requests the caller
/// must keep the packet and its buffers alive until the completion event is
/// signaled.
#[derive(Debug)]
pub struct ScsiRequestPacket {
    /// Request timeout in 100 ns units. Zero waits forever in blocking mode.
    pub timeout: u64,
    /// Buffer for data read from the device.
    pub in_data_buffer: *mut c_void,
    /// Buffer holding data written to the device.
    pub out_data_buffer: *mut c_void,
    /// Caller sense buffer, or null when `sense_data_length` is zero.
    pub sense_data: *mut c_void,
    /// SCSI command descriptor block.
    pub cdb: *mut c_void,
    /// On input the read capacity; on output the bytes actually transferred.
    pub in_transfer_length: u32,
    /// On input the write length; on output the bytes actually transferred.
    pub out_transfer_length: u32,
    /// CDB length: 6, 10, 12, or 16.
    pub cdb_length: u8,
    /// Direction of the data phase.
    pub data_direction: DataDirection,
    /// Out: host adapter status for the completed request.
    pub host_adapter_status: u8,
    /// Out: SCSI status byte reported by the target.
    pub target_status: u8,
    /// In: sense capacity; out: valid sense bytes copied to `sense_data`.
    pub sense_data_length: u8,
}

/// An aligned scratch buffer standing in for a misaligned caller buffer.
#[derive(Debug)]
pub(crate) struct BounceBuffer {
    pub buffer: *mut u8,
    pub pages: usize,
}

/// Prepared data phase state for one command.
struct DataTransfer {
    dma_length: usize,
    mapping: Option<DmaMapping>,
    bounce: Option<BounceBuffer>,
}

/// One submitted but not yet completed non-blocking SCSI request.
///
/// Owned exclusively by the in-flight queue while outstanding; removed and
/// destroyed exactly once, by the completion monitor or by forced abort at
/// controller stop.
pub(crate) struct InFlightRequest {
    pub slot: u8,
    pub packet: *mut ScsiRequestPacket,
    pub cmd_desc: CommandDescriptor,
    pub caller_buffer: *mut u8,
    pub data_length: usize,
    pub direction: DataDirection,
    pub data_mapping: Option<DmaMapping>,
    pub bounce: Option<BounceBuffer>,
    pub timeout_remain: u64,
    pub event: efi::Event,
}

impl<H: UfsHostController, B: BootServices> UfsController<H, B> {
    /// Executes a SCSI command against `lun` (native UFS encoding).
    ///
    /// With `event` supplied the call returns as soon as the slot is started
    /// and the request completes through the monitor; without it the call
    /// polls the doorbell to completion or timeout.
    pub fn exec_scsi_command(
        &self,
        lun: u8,
        packet: &mut ScsiRequestPacket,
        event: Option<efi::Event>,
    ) -> Result<()> {
        self.validate_packet(packet)?;
        if !self.luns.contains(lun) {
            return Err(UfsError::NotFound);
        }

        let slot = self.find_free_slot()?;
        let trd_ptr = self.trd_ptr(slot)?;

        let (caller_buffer, data_length) = match packet.data_direction {
            DataDirection::Read => (packet.in_data_buffer as *mut u8, packet.in_transfer_length as usize),
            DataDirection::Write => (packet.out_data_buffer as *mut u8, packet.out_transfer_length as usize),
            DataDirection::Bidirectional => (ptr::null_mut(), 0),
        };
        let prdt_entries = if data_length == 0 { 0 } else { prdt_entry_count(data_length) };
        let descriptor_size = UPIU_HEADER_SIZE + SCSI_RESPONSE_AREA + prdt_entries * PRDT_ENTRY_SIZE;
        let cmd_desc = self.create_command_descriptor(descriptor_size)?;

        let transfer = match self.prepare_data_buffer(caller_buffer, data_length, packet.data_direction) {
            Ok(transfer) => transfer,
            Err(e) => {
                self.destroy_command_descriptor(cmd_desc);
                return Err(e);
            }
        };

        // Build the command UPIU, the PRDT, and the slot descriptor.
        let tag = self.next_task_tag();
        // SAFETY: cdb pointer and length were validated above.
        let cdb = unsafe { core::slice::from_raw_parts(packet.cdb as *const u8, packet.cdb_length as usize) };
        let upiu = CommandUpiu::new(lun, tag, cdb, packet.data_direction, data_length as u32);
        // SAFETY: the descriptor buffer spans the UPIU, response area, and PRDT.
        unsafe { ptr::write_volatile(cmd_desc.buffer as *mut CommandUpiu, upiu) };
        if prdt_entries != 0 {
            if let Some(mapping) = &transfer.mapping {
                // SAFETY: the PRDT region holds exactly `prdt_entries` entries.
                let prdt = unsafe {
                    core::slice::from_raw_parts_mut(
                        cmd_desc.buffer.add(UPIU_HEADER_SIZE + SCSI_RESPONSE_AREA) as *mut PrdtEntry,
                        prdt_entries,
                    )
                };
                fill_prdt(prdt, mapping.device_address, transfer.dma_length);
            }
        }
        let trd_direction = match (data_length, packet.data_direction) {
            (0, _) => TRD_DD_NONE,
            (_, DataDirection::Read) => TRD_DD_TARGET_TO_SYSTEM,
            (_, DataDirection::Write) => TRD_DD_SYSTEM_TO_TARGET,
            (_, DataDirection::Bidirectional) => TRD_DD_NONE,
        };
        let trd = TransferRequestDescriptor::new(
            trd_direction,
            cmd_desc.mapping.device_address,
            UPIU_HEADER_SIZE,
            SCSI_RESPONSE_AREA,
            UPIU_HEADER_SIZE + SCSI_RESPONSE_AREA,
            prdt_entries,
        );
        // SAFETY: trd_ptr is bounded by nutrs.
        unsafe { ptr::write_volatile(trd_ptr, trd) };

        if let Some(event) = event {
            return self.submit_async(slot, packet, cmd_desc, caller_buffer, data_length, transfer, event);
        }
        self.exec_blocking(slot, packet, cmd_desc, caller_buffer, data_length, transfer)
    }

    fn submit_async(
        &self,
        slot: u8,
        packet: &mut ScsiRequestPacket,
        cmd_desc: CommandDescriptor,
        caller_buffer: *mut u8,
        data_length: usize,
        transfer: DataTransfer,
        event: efi::Event,
    ) -> Result<()> {
        let entry = InFlightRequest {
            slot,
            packet: packet as *mut ScsiRequestPacket,
            cmd_desc,
            caller_buffer,
            data_length,
            direction: packet.data_direction,
            data_mapping: transfer.mapping,
            bounce: transfer.bounce,
            timeout_remain: packet.timeout,
            event,
        };

        // The guard covers both the insert and the doorbell write so the
        // monitor cannot observe a listed-but-unstarted request.
        let tpl = TplGuard::raise(&self.bs, efi::TPL_CALLBACK);
        self.pending.borrow_mut().push_back(entry);
        match self.start_slot(slot) {
            Ok(()) => Ok(()),
            Err(e) => {
                let entry = self.pending.borrow_mut().pop_back();
                drop(tpl);
                if let Some(entry) = entry {
                    if let Err(flush_err) = self.host.flush() {
                        log::error!("UfsPassThru: flush failed during abort: {flush_err:?}");
                    }
                    let _ = self.stop_slot(entry.slot);
                    self.release_data_phase(entry.direction, entry.caller_buffer, entry.data_length, entry.data_mapping, entry.bounce);
                    self.destroy_command_descriptor(entry.cmd_desc);
                }
                Err(e)
            }
        }
    }

    fn exec_blocking(
        &self,
        slot: u8,
        packet: &mut ScsiRequestPacket,
        cmd_desc: CommandDescriptor,
        caller_buffer: *mut u8,
        data_length: usize,
        transfer: DataTransfer,
    ) -> Result<()> {
        let result = match self.start_slot(slot) {
            Err(e) => Err(e),
            Ok(()) => match self.wait_for_register(REG_UTRLDBR, 1u32 << slot, 0, packet.timeout) {
                Ok(()) => self.process_scsi_response(slot, packet, &cmd_desc),
                Err(UfsError::Timeout) => {
                    packet.host_adapter_status = HOST_ADAPTER_STATUS_TIMEOUT_COMMAND;
                    Err(UfsError::Timeout)
                }
                Err(e) => {
                    packet.host_adapter_status = HOST_ADAPTER_STATUS_PHASE_ERROR;
                    Err(e)
                }
            },
        };

        // Unconditional teardown, identical on success and every error path.
        if let Err(e) = self.host.flush() {
            log::error!("UfsPassThru: flush failed after SCSI command: {e:?}");
        }
        if let Err(e) = self.stop_slot(slot) {
            log::error!("UfsPassThru: slot teardown failed after SCSI command: {e:?}");
        }
        self.release_data_phase(packet.data_direction, caller_buffer, data_length, transfer.mapping, transfer.bounce);
        self.destroy_command_descriptor(cmd_desc);
        result
    }

    /// Shared response processing for the blocking return path and the
    /// completion monitor.
    pub(crate) fn process_scsi_response(
        &self,
        slot: u8,
        packet: &mut ScsiRequestPacket,
        cmd_desc: &CommandDescriptor,
    ) -> Result<()> {
        let completed = match self.trd_ptr(slot) {
            // SAFETY: the slot descriptor belongs to this request until teardown.
            Ok(trd_ptr) => unsafe { ptr::read_volatile(trd_ptr) },
            Err(e) => {
                packet.host_adapter_status = HOST_ADAPTER_STATUS_PHASE_ERROR;
                return Err(e);
            }
        };
        if completed.ocs() != OCS_SUCCESS {
            packet.host_adapter_status = HOST_ADAPTER_STATUS_OTHER;
            log::error!("UfsPassThru: SCSI command failed, OCS {:#x}", completed.ocs());
            return Err(UfsError::DeviceError);
        }

        let response_ptr = unsafe { cmd_desc.buffer.add(UPIU_HEADER_SIZE) };
        // SAFETY: the response area holds a response UPIU plus the sense segment.
        let response: ResponseUpiu = unsafe { ptr::read_volatile(response_ptr as *const ResponseUpiu) };

        // Sense data, bounded by the caller's declared capacity. A report that
        // exceeds the capacity is surfaced as zero sense bytes rather than a
        // silent partial copy.
        let mut sense_len_bytes = [0u8; 2];
        // SAFETY: the two length bytes directly follow the response header.
        unsafe { ptr::copy_nonoverlapping(response_ptr.add(UPIU_HEADER_SIZE), sense_len_bytes.as_mut_ptr(), 2) };
        let sense_reported = get_be16(&sense_len_bytes) as usize;
        if packet.sense_data_length != 0 && !packet.sense_data.is_null() {
            if sense_reported != 0 && sense_reported <= packet.sense_data_length as usize && sense_reported <= SENSE_DATA_MAX
            {
                // SAFETY: bounded by both the caller capacity and the sense area.
                unsafe {
                    ptr::copy_nonoverlapping(
                        response_ptr.add(UPIU_HEADER_SIZE + 2),
                        packet.sense_data as *mut u8,
                        sense_reported,
                    )
                };
                packet.sense_data_length = sense_reported as u8;
            } else {
                packet.sense_data_length = 0;
            }
        }

        packet.target_status = response.status;
        if response.response != 0 {
            log::error!("UfsPassThru: target rejected command, response {:#x}", response.response);
            return Err(UfsError::TargetFailure);
        }

        packet.host_adapter_status = HOST_ADAPTER_STATUS_OK;
        if response.flags & UPIU_FLAG_UNDERFLOW != 0 {
            let residual = response.residual_count();
            match packet.data_direction {
                DataDirection::Read => {
                    packet.in_transfer_length = packet.in_transfer_length.saturating_sub(residual);
                }
                DataDirection::Write => {
                    packet.out_transfer_length = packet.out_transfer_length.saturating_sub(residual);
                }
                DataDirection::Bidirectional => {}
            }
        }
        Ok(())
    }

    /// Unmaps the data phase and reconciles any bounce buffer with the caller's
    /// buffer. Runs on every exit path exactly once per request.
    pub(crate) fn release_data_phase(
        &self,
        direction: DataDirection,
        caller_buffer: *mut u8,
        length: usize,
        mapping: Option<DmaMapping>,
        bounce: Option<BounceBuffer>,
    ) {
        if let Some(mapping) = mapping {
            if let Err(e) = self.host.unmap(mapping) {
                log::error!("UfsPassThru: data buffer unmap failed: {e:?}");
            }
        }
        if let Some(bounce) = bounce {
            if direction == DataDirection::Read && !caller_buffer.is_null() {
                // SAFETY: the bounce buffer covers at least `length` bytes and the
                // caller buffer was validated against the same length.
                unsafe { ptr::copy_nonoverlapping(bounce.buffer as *const u8, caller_buffer, length) };
            }
            // Zero before free so reused pages cannot leak transferred data.
            // SAFETY: the bounce allocation covers `pages` whole pages.
            unsafe { ptr::write_bytes(bounce.buffer, 0, bounce.pages * PAGE_SIZE) };
            if let Err(e) = self.host.free_pages(bounce.buffer, bounce.pages) {
                log::error!("UfsPassThru: bounce buffer free failed: {e:?}");
            }
        }
    }

    fn validate_packet(&self, packet: &ScsiRequestPacket) -> Result<()> {
        if packet.cdb.is_null() || !matches!(packet.cdb_length, 6 | 10 | 12 | 16) {
            return Err(UfsError::InvalidParameter);
        }
        if packet.sense_data_length != 0 && packet.sense_data.is_null() {
            return Err(UfsError::InvalidParameter);
        }
        match packet.data_direction {
            DataDirection::Read => {
                if packet.in_transfer_length != 0 && packet.in_data_buffer.is_null() {
                    return Err(UfsError::InvalidParameter);
                }
            }
            DataDirection::Write => {
                if packet.out_transfer_length != 0 && packet.out_data_buffer.is_null() {
                    return Err(UfsError::InvalidParameter);
                }
            }
            DataDirection::Bidirectional => return Err(UfsError::Unsupported),
        }
        if self.io_align > 1 {
            let align = self.io_align as usize;
            for pointer in [packet.in_data_buffer, packet.out_data_buffer, packet.sense_data] {
                if !pointer.is_null() && pointer as usize % align != 0 {
                    return Err(UfsError::InvalidParameter);
                }
            }
        }
        Ok(())
    }

    /// Stages the data buffer for DMA, bouncing through an aligned scratch
    /// allocation when the caller's buffer violates the DWORD requirements.
    fn prepare_data_buffer(&self, buffer: *mut u8, length: usize, direction: DataDirection) -> Result<DataTransfer> {
        if length == 0 {
            return Ok(DataTransfer { dma_length: 0, mapping: None, bounce: None });
        }

        let mut host_buffer = buffer;
        let mut bounce = None;
        // The PRDT requires DWORD-aligned addresses and DWORD-granular counts.
        let dma_length = (length + 3) & !3;
        if buffer as usize % 4 != 0 || length % 4 != 0 {
            let pages = pages_for(dma_length);
            let aligned = self.host.allocate_pages(pages)?;
            // SAFETY: the allocation covers `pages` whole pages.
            unsafe { ptr::write_bytes(aligned, 0, pages * PAGE_SIZE) };
            if direction == DataDirection::Write {
                // SAFETY: caller buffer validity over `length` was validated.
                unsafe { ptr::copy_nonoverlapping(buffer as *const u8, aligned, length) };
            }
            host_buffer = aligned;
            bounce = Some(BounceBuffer { buffer: aligned, pages });
        }

        let dma_direction = match direction {
            DataDirection::Read => DmaDirection::BusMasterWrite,
            _ => DmaDirection::BusMasterRead,
        };
        let mapping = match self.host.map(dma_direction, host_buffer, dma_length) {
            Ok(mapping) => mapping,
            Err(e) => {
                if let Some(bounce) = bounce {
                    let _ = self.host.free_pages(bounce.buffer, bounce.pages);
                }
                return Err(e);
            }
        };
        Ok(DataTransfer { dma_length, mapping: Some(mapping), bounce })
    }
}
