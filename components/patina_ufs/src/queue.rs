//! UTP transfer request slot management.
//!
//! The hardware doorbell register is the single source of truth for slot
//! occupancy; no driver-side busy flag shadows it. Each submitted request owns
//! a transient DMA command descriptor (request UPIU + response area + PRDT)
//! referenced by the slot's transfer request descriptor in the UTRL ring.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use bitfield_struct::bitfield;

use crate::controller::UfsController;
use crate::error::{Result, UfsError};
use crate::hci::UFS_TIMEOUT;
use crate::host::{pages_for, BootServices, DmaDirection, DmaMapping, UfsHostController, PAGE_SIZE};
use crate::regs::{IS_UTRCS, REG_IS, REG_UTRIACR, REG_UTRLCLR, REG_UTRLDBR, REG_UTRLRSR, RUN_STOP_ENABLE};

/// Size of one UTP transfer request descriptor.
pub const TRD_SIZE: usize = 32;

/// Size of one UTP task management request descriptor (header plus inline
/// request and response UPIUs).
pub const TMRD_SIZE: usize = 80;

/// TRD command type for UFS storage commands.
pub const TRD_COMMAND_TYPE_UFS_STORAGE: u8 = 0x01;

/// TRD data direction: no data transfer.
pub const TRD_DD_NONE: u8 = 0b00;
/// TRD data direction: from system memory to the target.
pub const TRD_DD_SYSTEM_TO_TARGET: u8 = 0b01;
/// TRD data direction: from the target to system memory.
pub const TRD_DD_TARGET_TO_SYSTEM: u8 = 0b10;

/// Overall command status: success.
pub const OCS_SUCCESS: u8 = 0x0;
/// Overall command status initialization value, overwritten by hardware.
pub const OCS_INVALID: u8 = 0xF;

/// TRD word 0: control bits.
#[bitfield(u32)]
pub struct TrdControl {
    #[bits(24)]
    _rsvd0: u32,
    /// Interrupt on completion.
    pub interrupt: bool,
    /// Data direction.
    #[bits(2)]
    pub data_direction: u8,
    _rsvd1: bool,
    /// Command type.
    #[bits(4)]
    pub command_type: u8,
}

/// TRD word 2: overall command status.
#[bitfield(u32)]
pub struct TrdStatus {
    /// Overall command status, written by hardware on completion.
    #[bits(8)]
    pub ocs: u8,
    #[bits(24)]
    _rsvd: u32,
}

/// TRD word 4: command descriptor base address low half. The descriptor is
/// naturally 128-byte aligned, so the stored value is the address shifted
/// right by seven.
#[bitfield(u32)]
pub struct TrdBaseLow {
    #[bits(7)]
    _rsvd: u8,
    /// Physical address bits 31:7.
    #[bits(25)]
    pub address: u32,
}

/// One UTP transfer request descriptor as laid out in the UTRL ring.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TransferRequestDescriptor {
    /// Control word.
    pub dw0: u32,
    rsvd1: u32,
    /// Status word.
    pub dw2: u32,
    rsvd3: u32,
    /// Command descriptor base address, low half.
    pub ucdba: u32,
    /// Command descriptor base address, high half.
    pub ucdbau: u32,
    /// Response UPIU offset (low 16) and length (high 16), both in DWORDs.
    pub dw6: u32,
    /// PRDT offset in DWORDs (low 16) and entry count (high 16).
    pub dw7: u32,
}

impl TransferRequestDescriptor {
    /// Builds a descriptor for a command whose DMA buffer lives at
    /// `cmd_desc_address`. Offsets and lengths are in bytes and must be DWORD
    /// multiples.
    pub fn new(
        data_direction: u8,
        cmd_desc_address: u64,
        response_offset: usize,
        response_len: usize,
        prdt_offset: usize,
        prdt_entries: usize,
    ) -> Self {
        debug_assert_eq!(cmd_desc_address & 0x7F, 0);
        debug_assert_eq!(response_offset % 4, 0);
        debug_assert_eq!(response_len % 4, 0);
        debug_assert_eq!(prdt_offset % 4, 0);

        Self {
            dw0: TrdControl::new()
                .with_interrupt(true)
                .with_data_direction(data_direction)
                .with_command_type(TRD_COMMAND_TYPE_UFS_STORAGE)
                .into_bits(),
            rsvd1: 0,
            dw2: TrdStatus::new().with_ocs(OCS_INVALID).into_bits(),
            rsvd3: 0,
            ucdba: TrdBaseLow::new().with_address(((cmd_desc_address & 0xFFFF_FFFF) >> 7) as u32).into_bits(),
            ucdbau: (cmd_desc_address >> 32) as u32,
            dw6: ((response_offset / 4) as u32) | (((response_len / 4) as u32) << 16),
            dw7: ((prdt_offset / 4) as u32) | ((prdt_entries as u32) << 16),
        }
    }

    /// Overall command status written back by the hardware.
    pub fn ocs(&self) -> u8 {
        TrdStatus::from_bits(self.dw2).ocs()
    }

    /// Physical address of the command descriptor.
    pub fn command_descriptor_address(&self) -> u64 {
        (self.ucdba as u64) | ((self.ucdbau as u64) << 32)
    }

    /// Response UPIU offset in bytes.
    pub fn response_offset(&self) -> usize {
        ((self.dw6 & 0xFFFF) as usize) * 4
    }

    /// Response UPIU area length in bytes.
    pub fn response_len(&self) -> usize {
        ((self.dw6 >> 16) as usize) * 4
    }

    /// PRDT offset in bytes.
    pub fn prdt_offset(&self) -> usize {
        ((self.dw7 & 0xFFFF) as usize) * 4
    }

    /// Number of PRDT entries.
    pub fn prdt_entries(&self) -> usize {
        (self.dw7 >> 16) as usize
    }
}

/// A DMA common-buffer allocation backing one of the hardware request lists.
#[derive(Debug)]
pub struct QueueBuffer {
    /// Host virtual address of the ring.
    pub buffer: *mut u8,
    /// Allocation size in pages.
    pub pages: usize,
    /// Live common-buffer mapping.
    pub mapping: DmaMapping,
}

/// The transient DMA buffer holding one request's UPIU, response area, and PRDT.
#[derive(Debug)]
pub struct CommandDescriptor {
    /// Host virtual address of the descriptor memory.
    pub buffer: *mut u8,
    /// Allocation size in pages.
    pub pages: usize,
    /// Requested descriptor size in bytes.
    pub size: usize,
    /// Live common-buffer mapping.
    pub mapping: DmaMapping,
}

impl<H: UfsHostController, B: BootServices> UfsController<H, B> {
    pub(crate) fn transfer_ring(&self) -> Result<&QueueBuffer> {
        self.utrl.as_ref().ok_or(UfsError::DeviceError)
    }

    /// Pointer to the slot's descriptor within the UTRL ring.
    pub(crate) fn trd_ptr(&self, slot: u8) -> Result<*mut TransferRequestDescriptor> {
        let ring = self.transfer_ring()?;
        // SAFETY: slot is bounded by nutrs and the ring covers nutrs descriptors.
        Ok(unsafe { ring.buffer.add(slot as usize * TRD_SIZE) } as *mut TransferRequestDescriptor)
    }

    /// Finds the lowest transfer request slot whose doorbell bit is clear.
    ///
    /// Returns [`UfsError::NotReady`] if every slot is in flight; no register is
    /// written and the caller may retry.
    pub(crate) fn find_free_slot(&self) -> Result<u8> {
        let doorbell = self.read_reg(REG_UTRLDBR)?;
        for slot in 0..self.info.nutrs {
            if doorbell & (1u32 << slot) == 0 {
                return Ok(slot);
            }
        }
        log::debug!("UfsPassThru: all {} transfer request slots busy", self.info.nutrs);
        Err(UfsError::NotReady)
    }

    /// Rings the doorbell for `slot`, handing the descriptor to the hardware.
    pub(crate) fn start_slot(&self, slot: u8) -> Result<()> {
        let run_stop = self.read_reg(REG_UTRLRSR)?;
        if run_stop & RUN_STOP_ENABLE == 0 {
            self.write_reg(REG_UTRLRSR, RUN_STOP_ENABLE)?;
        }
        self.write_reg(REG_UTRLDBR, 1u32 << slot)
    }

    /// Releases `slot` at request teardown.
    ///
    /// If the hardware still owns the slot, pending aggregation state is reset
    /// and the doorbell bit force-cleared through UTRLCLR before the slot is
    /// considered reusable.
    pub(crate) fn stop_slot(&self, slot: u8) -> Result<()> {
        let doorbell = self.read_reg(REG_UTRLDBR)?;
        if doorbell & (1u32 << slot) != 0 {
            self.write_reg(REG_UTRIACR, 0)?;
            // UTRLCLR clears the doorbell bits whose written value is zero.
            self.write_reg(REG_UTRLCLR, !(1u32 << slot))?;
            self.wait_for_register(REG_UTRLDBR, 1u32 << slot, 0, UFS_TIMEOUT)?;
        }
        self.write_reg(REG_IS, IS_UTRCS)
    }

    /// Allocates and maps the DMA command descriptor for one request.
    pub(crate) fn create_command_descriptor(&self, size: usize) -> Result<CommandDescriptor> {
        let pages = pages_for(size);
        let buffer = self.host.allocate_pages(pages)?;
        // SAFETY: the allocation covers `pages` whole pages.
        unsafe { core::ptr::write_bytes(buffer, 0, pages * PAGE_SIZE) };

        let mapping = match self.host.map(DmaDirection::BusMasterCommonBuffer, buffer, size) {
            Ok(mapping) => mapping,
            Err(e) => {
                let _ = self.host.free_pages(buffer, pages);
                return Err(e);
            }
        };
        if mapping.device_address & 0x7F != 0 {
            log::error!("UfsPassThru: command descriptor mapping not 128-byte aligned");
            let _ = self.host.unmap(mapping);
            let _ = self.host.free_pages(buffer, pages);
            return Err(UfsError::DeviceError);
        }
        Ok(CommandDescriptor { buffer, pages, size, mapping })
    }

    /// Unmaps and frees a command descriptor. Never skipped on error paths.
    pub(crate) fn destroy_command_descriptor(&self, descriptor: CommandDescriptor) {
        if let Err(e) = self.host.unmap(descriptor.mapping) {
            log::error!("UfsPassThru: command descriptor unmap failed: {e:?}");
        }
        if let Err(e) = self.host.free_pages(descriptor.buffer, descriptor.pages) {
            log::error!("UfsPassThru: command descriptor free failed: {e:?}");
        }
    }
}
