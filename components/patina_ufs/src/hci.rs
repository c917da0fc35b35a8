//! Host controller interface: register access, UIC commands, and bring-up of
//! the hardware request lists.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use crate::controller::{UfsController, UfsHcPlatform};
use crate::error::{Result, UfsError};
use crate::host::{pages_for, BootServices, DmaDirection, UfsHostController, PAGE_SIZE};
use crate::queue::{QueueBuffer, TMRD_SIZE, TRD_SIZE};
use crate::regs::{
    HostControllerInfo, HCE_ENABLE, HCS_DP, HCS_UCRDY, IS_UCCS, IS_ULSS, REG_CAP, REG_HCE, REG_HCS, REG_IS,
    REG_UCMDARG1, REG_UCMDARG2, REG_UCMDARG3, REG_UICCMD, REG_UTMRLBA, REG_UTMRLBAU, REG_UTMRLRSR, REG_UTRLBA,
    REG_UTRLBAU, REG_UTRLRSR, REG_VER, RUN_STOP_ENABLE, UIC_DME_LINK_STARTUP, UIC_DME_RESET,
};

/// Default timeout for register waits and synchronous commands: 3 s in 100 ns units.
pub(crate) const UFS_TIMEOUT: u64 = 30_000_000;

/// Link startup attempts before the device is declared absent.
const LINK_STARTUP_RETRIES: usize = 3;

impl<H: UfsHostController, B: BootServices> UfsController<H, B> {
    pub(crate) fn read_reg(&self, offset: usize) -> Result<u32> {
        self.host.read_reg32(offset)
    }

    pub(crate) fn write_reg(&self, offset: usize, value: u32) -> Result<()> {
        self.host.write_reg32(offset, value)
    }

    /// Polls `offset` until `value & mask == expected` or the timeout elapses.
    ///
    /// `timeout` is in 100 ns units; zero waits forever. Each poll is separated
    /// by a one microsecond stall.
    pub(crate) fn wait_for_register(&self, offset: usize, mask: u32, expected: u32, timeout: u64) -> Result<()> {
        let mut budget = timeout / 10 + 1;
        loop {
            let value = self.read_reg(offset)?;
            if value & mask == expected {
                return Ok(());
            }
            if timeout != 0 {
                budget -= 1;
                if budget == 0 {
                    return Err(UfsError::Timeout);
                }
            }
            self.bs.stall(1);
        }
    }

    /// Executes a UIC command and returns the completion values of the second
    /// and third argument registers.
    ///
    /// The low byte of the returned argument-2 value is the UIC result code; a
    /// nonzero code has already been rejected as a device error before return.
    pub fn exec_uic_command(&self, opcode: u32, arg1: u32, arg2: u32, arg3: u32) -> Result<(u32, u32)> {
        // Clear a stale command completion before issuing.
        let is = self.read_reg(REG_IS)?;
        if is & IS_UCCS != 0 {
            self.write_reg(REG_IS, IS_UCCS)?;
        }
        self.wait_for_register(REG_HCS, HCS_UCRDY, HCS_UCRDY, UFS_TIMEOUT)?;

        self.write_reg(REG_UCMDARG1, arg1)?;
        self.write_reg(REG_UCMDARG2, arg2)?;
        self.write_reg(REG_UCMDARG3, arg3)?;
        self.write_reg(REG_UICCMD, opcode & 0xFF)?;

        self.wait_for_register(REG_IS, IS_UCCS, IS_UCCS, UFS_TIMEOUT)?;
        self.write_reg(REG_IS, IS_UCCS)?;

        let result_arg2 = self.read_reg(REG_UCMDARG2)?;
        if opcode != UIC_DME_RESET && result_arg2 & 0xFF != 0 {
            log::error!("UfsPassThru: UIC command {opcode:#x} failed, result {:#x}", result_arg2 & 0xFF);
            return Err(UfsError::DeviceError);
        }
        Ok((result_arg2, self.read_reg(REG_UCMDARG3)?))
    }

    /// Reads the capability and version registers into the controller snapshot,
    /// giving the platform hook one chance to override the reported values.
    pub(crate) fn snapshot_capabilities(&mut self) -> Result<()> {
        let capabilities = self.read_reg(REG_CAP)?;
        let version = self.read_reg(REG_VER)?;
        let mut info = HostControllerInfo::from_registers(capabilities, version);
        if let Some(platform) = self.platform.as_deref() {
            platform.override_host_controller_info(&mut info);
        }
        log::info!(
            "UfsPassThru: controller version {:#x}, {} transfer slots, {} task management slots",
            info.version,
            info.nutrs,
            info.nutmrs
        );
        self.info = info;
        Ok(())
    }

    /// Brings the host controller enable bit up, optionally cycling it low first.
    pub(crate) fn enable_host_controller(&self) -> Result<()> {
        let platform = self.platform.as_deref();
        let skip_disable = platform.map(|p| p.skip_hce_disable(self.info.version)).unwrap_or(false);

        let hce = self.read_reg(REG_HCE)?;
        if hce & HCE_ENABLE != 0 && !skip_disable {
            self.write_reg(REG_HCE, 0)?;
            self.wait_for_register(REG_HCE, HCE_ENABLE, 0, UFS_TIMEOUT)?;
        }

        if let Some(platform) = platform {
            platform.pre_host_controller_enable(&self.info)?;
        }
        self.write_reg(REG_HCE, HCE_ENABLE)?;
        self.wait_for_register(REG_HCE, HCE_ENABLE, HCE_ENABLE, UFS_TIMEOUT)?;
        if let Some(platform) = platform {
            platform.post_host_controller_enable(&self.info)?;
        }
        Ok(())
    }

    /// Issues DME_LINK_STARTUP until the controller reports a present device.
    pub(crate) fn detect_device(&self) -> Result<()> {
        for attempt in 0..LINK_STARTUP_RETRIES {
            self.exec_uic_command(UIC_DME_LINK_STARTUP, 0, 0, 0)?;
            if self.read_reg(REG_HCS)? & HCS_DP != 0 {
                log::info!("UfsPassThru: link established");
                return Ok(());
            }
            log::warn!("UfsPassThru: device not present after link startup attempt {}", attempt + 1);
            if self.wait_for_register(REG_IS, IS_ULSS, IS_ULSS, UFS_TIMEOUT).is_ok() {
                self.write_reg(REG_IS, IS_ULSS)?;
            }
        }
        Err(UfsError::NotFound)
    }

    /// Allocates both hardware request lists, programs their base registers,
    /// and enables the run-stop bits.
    pub(crate) fn init_queues(&mut self) -> Result<()> {
        let utmrl = self.allocate_queue(self.info.nutmrs as usize * TMRD_SIZE)?;
        let utrl = match self.allocate_queue(self.info.nutrs as usize * TRD_SIZE) {
            Ok(queue) => queue,
            Err(e) => {
                self.release_queue(&utmrl);
                return Err(e);
            }
        };

        let programmed = (|| {
            self.write_reg(REG_UTMRLBA, utmrl.mapping.device_address as u32)?;
            self.write_reg(REG_UTMRLBAU, (utmrl.mapping.device_address >> 32) as u32)?;
            self.write_reg(REG_UTRLBA, utrl.mapping.device_address as u32)?;
            self.write_reg(REG_UTRLBAU, (utrl.mapping.device_address >> 32) as u32)?;
            self.write_reg(REG_UTMRLRSR, RUN_STOP_ENABLE)?;
            self.write_reg(REG_UTRLRSR, RUN_STOP_ENABLE)
        })();
        if let Err(e) = programmed {
            self.release_queue(&utmrl);
            self.release_queue(&utrl);
            return Err(e);
        }

        self.utmrl = Some(utmrl);
        self.utrl = Some(utrl);
        Ok(())
    }

    fn allocate_queue(&self, size: usize) -> Result<QueueBuffer> {
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
        // The list base registers reserve the low ten address bits.
        if mapping.device_address & 0x3FF != 0 {
            log::error!("UfsPassThru: request list mapping not 1 KiB aligned");
            let _ = self.host.unmap(mapping);
            let _ = self.host.free_pages(buffer, pages);
            return Err(UfsError::DeviceError);
        }
        Ok(QueueBuffer { buffer, pages, mapping })
    }

    pub(crate) fn release_queue(&self, queue: &QueueBuffer) {
        if let Err(e) = self.host.unmap(queue.mapping) {
            log::error!("UfsPassThru: request list unmap failed: {e:?}");
        }
        if let Err(e) = self.host.free_pages(queue.buffer, queue.pages) {
            log::error!("UfsPassThru: request list free failed: {e:?}");
        }
    }

    /// Quiesces and disables the host controller, releasing both request lists.
    pub(crate) fn disable_host_controller(&mut self) -> Result<()> {
        let status = (|| {
            self.write_reg(REG_UTRLRSR, 0)?;
            self.write_reg(REG_UTMRLRSR, 0)?;
            self.write_reg(REG_HCE, 0)?;
            self.wait_for_register(REG_HCE, HCE_ENABLE, 0, UFS_TIMEOUT)
        })();

        if let Some(queue) = self.utrl.take() {
            self.release_queue(&queue);
        }
        if let Some(queue) = self.utmrl.take() {
            self.release_queue(&queue);
        }
        status
    }
}
