//! Device management: descriptor, flag, and attribute access over the QUERY
//! REQUEST sub-protocol, plus the NOP transport liveness check.
//!
//! Each call is one synchronous request/response cycle against a transfer
//! request slot, retried as a whole unit. A hardware timeout inside a cycle is
//! reported as a device error at this boundary; only the SCSI engine and the
//! controller lifecycle keep timeouts distinct.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use core::ptr;

use crate::controller::UfsController;
use crate::error::{Result, UfsError};
use crate::hci::UFS_TIMEOUT;
use crate::host::{BootServices, UfsHostController};
use crate::queue::{
    TransferRequestDescriptor, OCS_SUCCESS, TRD_DD_NONE, TRD_DD_SYSTEM_TO_TARGET, TRD_DD_TARGET_TO_SYSTEM,
};
use crate::regs::REG_UTRLDBR;
use crate::upiu::{
    round_up8, NopInUpiu, NopOutUpiu, QueryOpcode, QueryRequestUpiu, QueryResponseUpiu, QUERY_RESP_INVALID_IDN,
    QUERY_RESP_INVALID_INDEX, QUERY_RESP_INVALID_SELECTOR, QUERY_RESP_SUCCESS, UPIU_HEADER_SIZE, UPIU_TYPE_NOP_IN,
    UPIU_TYPE_QUERY_RESPONSE,
};

/// Whole-cycle retry bound for device management requests.
const QUERY_REQUEST_RETRIES: usize = 5;

/// Length of the device descriptor read during attach.
pub(crate) const DEVICE_DESCRIPTOR_SIZE: usize = 0x40;
/// Length of a unit descriptor.
pub(crate) const UNIT_DESCRIPTOR_SIZE: usize = 0x2D;
/// Offset of bLUEnable within a unit descriptor.
pub(crate) const UNIT_DESC_LU_ENABLE: usize = 0x03;
/// Offset of bSecurityLU within the device descriptor.
pub(crate) const DEVICE_DESC_SECURITY_LU: usize = 0x0D;

/// Descriptor identifiers (IDN) addressable through the query sub-protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DescriptorId {
    /// Device descriptor.
    Device = 0x00,
    /// Configuration descriptor.
    Configuration = 0x01,
    /// Unit descriptor; the index selects the logical unit.
    Unit = 0x02,
    /// Interconnect descriptor.
    Interconnect = 0x04,
    /// String descriptor.
    String = 0x05,
    /// Geometry descriptor.
    Geometry = 0x07,
    /// Power parameters descriptor.
    Power = 0x08,
    /// Device health descriptor.
    DeviceHealth = 0x09,
}

/// Flag identifiers (IDN).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlagId {
    /// fDeviceInit: set by the host, cleared by the device when initialization
    /// completes.
    DeviceInit = 0x01,
    /// fPermanentWPEn.
    PermanentWriteProtect = 0x02,
    /// fPowerOnWPEn.
    PowerOnWriteProtect = 0x03,
    /// fBackgroundOpsEn.
    BackgroundOpsEnable = 0x04,
    /// fPurgeEnable.
    PurgeEnable = 0x06,
    /// fPhyResourceRemoval.
    PhyResourceRemoval = 0x08,
    /// fBusyRTC.
    BusyRtc = 0x09,
    /// fPermanentlyDisableFwUpdate.
    PermanentlyDisableFwUpdate = 0x0B,
}

/// Attribute identifiers (IDN).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AttributeId {
    /// bBootLunEn.
    BootLunEnable = 0x00,
    /// bCurrentPowerMode.
    CurrentPowerMode = 0x02,
    /// bActiveICCLevel.
    ActiveIccLevel = 0x03,
    /// bOutOfOrderDataEn.
    OutOfOrderDataEnable = 0x04,
    /// bBackgroundOpStatus.
    BackgroundOpStatus = 0x05,
    /// bPurgeStatus.
    PurgeStatus = 0x06,
    /// bMaxDataInSize.
    MaxDataInSize = 0x07,
    /// bMaxDataOutSize.
    MaxDataOutSize = 0x08,
    /// bRefClkFreq.
    ReferenceClockFrequency = 0x0A,
    /// bConfigDescrLock.
    ConfigDescriptorLock = 0x0B,
    /// bMaxNumOutstandingRTT.
    MaxOutstandingReadyToTransfer = 0x0C,
    /// wExceptionEventControl.
    ExceptionEventControl = 0x0D,
    /// wExceptionEventStatus.
    ExceptionEventStatus = 0x0E,
    /// dSecondsPassed.
    SecondsPassed = 0x0F,
    /// wContextConf.
    ContextConfiguration = 0x10,
}

/// Data phase of one device management exchange.
enum QueryData<'a> {
    None,
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

/// A transient, stack-scoped description of one device management exchange.
struct DeviceManagementRequest<'a> {
    opcode: QueryOpcode,
    idn: u8,
    index: u8,
    selector: u8,
    value: u32,
    data: QueryData<'a>,
    timeout: u64,
}

struct QueryOutcome {
    transferred: usize,
    value: u32,
}

impl<H: UfsHostController, B: BootServices> UfsController<H, B> {
    /// Reads a descriptor into `data`, returning the number of bytes copied.
    ///
    /// Never copies more than `data.len()` bytes even when the device reports
    /// a longer descriptor; the returned length reflects the bounded copy.
    pub fn read_descriptor(&self, descriptor: DescriptorId, index: u8, selector: u8, data: &mut [u8]) -> Result<usize> {
        if data.is_empty() {
            return Err(UfsError::InvalidParameter);
        }
        let mut request = DeviceManagementRequest {
            opcode: QueryOpcode::ReadDescriptor,
            idn: descriptor as u8,
            index,
            selector,
            value: 0,
            data: QueryData::Read(data),
            timeout: UFS_TIMEOUT,
        };
        self.exec_device_management(&mut request).map(|outcome| outcome.transferred)
    }

    /// Writes a descriptor from `data`.
    pub fn write_descriptor(&self, descriptor: DescriptorId, index: u8, selector: u8, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(UfsError::InvalidParameter);
        }
        let mut request = DeviceManagementRequest {
            opcode: QueryOpcode::WriteDescriptor,
            idn: descriptor as u8,
            index,
            selector,
            value: 0,
            data: QueryData::Write(data),
            timeout: UFS_TIMEOUT,
        };
        self.exec_device_management(&mut request).map(|_| ())
    }

    /// Reads an attribute value.
    pub fn read_attribute(&self, attribute: AttributeId, index: u8, selector: u8) -> Result<u32> {
        let mut request = DeviceManagementRequest {
            opcode: QueryOpcode::ReadAttribute,
            idn: attribute as u8,
            index,
            selector,
            value: 0,
            data: QueryData::None,
            timeout: UFS_TIMEOUT,
        };
        self.exec_device_management(&mut request).map(|outcome| outcome.value)
    }

    /// Writes an attribute value.
    pub fn write_attribute(&self, attribute: AttributeId, index: u8, selector: u8, value: u32) -> Result<()> {
        let mut request = DeviceManagementRequest {
            opcode: QueryOpcode::WriteAttribute,
            idn: attribute as u8,
            index,
            selector,
            value,
            data: QueryData::None,
            timeout: UFS_TIMEOUT,
        };
        self.exec_device_management(&mut request).map(|_| ())
    }

    /// Reads a flag.
    pub fn read_flag(&self, flag: FlagId) -> Result<bool> {
        self.exec_flag_op(QueryOpcode::ReadFlag, flag)
    }

    /// Sets a flag. Returns the device-reported flag value after the operation.
    pub fn set_flag(&self, flag: FlagId) -> Result<bool> {
        self.exec_flag_op(QueryOpcode::SetFlag, flag)
    }

    /// Clears a flag.
    pub fn clear_flag(&self, flag: FlagId) -> Result<bool> {
        self.exec_flag_op(QueryOpcode::ClearFlag, flag)
    }

    /// Toggles a flag.
    pub fn toggle_flag(&self, flag: FlagId) -> Result<bool> {
        self.exec_flag_op(QueryOpcode::ToggleFlag, flag)
    }

    fn exec_flag_op(&self, opcode: QueryOpcode, flag: FlagId) -> Result<bool> {
        let mut request = DeviceManagementRequest {
            opcode,
            idn: flag as u8,
            index: 0,
            selector: 0,
            value: 0,
            data: QueryData::None,
            timeout: UFS_TIMEOUT,
        };
        self.exec_device_management(&mut request).map(|outcome| outcome.value as u8 != 0)
    }

    /// Sends a NOP OUT and validates the NOP IN response, confirming the
    /// device's transport layer is alive.
    pub fn exec_nop(&self) -> Result<()> {
        let slot = self.find_free_slot()?;
        let descriptor = self.create_command_descriptor(2 * UPIU_HEADER_SIZE)?;

        let result: Result<()> = (|| {
            let tag = self.next_task_tag();
            // SAFETY: the descriptor buffer holds two UPIU headers.
            unsafe { ptr::write_volatile(descriptor.buffer as *mut NopOutUpiu, NopOutUpiu::new(tag)) };

            let trd = TransferRequestDescriptor::new(
                TRD_DD_NONE,
                descriptor.mapping.device_address,
                UPIU_HEADER_SIZE,
                UPIU_HEADER_SIZE,
                0,
                0,
            );
            // SAFETY: trd_ptr is bounded by nutrs.
            unsafe { ptr::write_volatile(self.trd_ptr(slot)?, trd) };

            self.start_slot(slot)?;
            match self.wait_for_register(REG_UTRLDBR, 1u32 << slot, 0, UFS_TIMEOUT) {
                Ok(()) => {}
                Err(UfsError::Timeout) => return Err(UfsError::DeviceError),
                Err(e) => return Err(e),
            }

            // SAFETY: the slot descriptor was written above and is in the ring.
            let completed = unsafe { ptr::read_volatile(self.trd_ptr(slot)?) };
            if completed.ocs() != OCS_SUCCESS {
                log::error!("UfsPassThru: NOP command failed, OCS {:#x}", completed.ocs());
                return Err(UfsError::DeviceError);
            }
            // SAFETY: the response area starts one header past the buffer base.
            let nop_in: NopInUpiu =
                unsafe { ptr::read_volatile(descriptor.buffer.add(UPIU_HEADER_SIZE) as *const NopInUpiu) };
            if nop_in.trans_type != UPIU_TYPE_NOP_IN || nop_in.response != 0 {
                return Err(UfsError::DeviceError);
            }
            Ok(())
        })();

        if let Err(e) = self.host.flush() {
            log::error!("UfsPassThru: flush failed after NOP: {e:?}");
        }
        if let Err(e) = self.stop_slot(slot) {
            log::error!("UfsPassThru: slot teardown failed after NOP: {e:?}");
        }
        self.destroy_command_descriptor(descriptor);
        result
    }

    fn exec_device_management(&self, request: &mut DeviceManagementRequest<'_>) -> Result<QueryOutcome> {
        let mut last_error = UfsError::DeviceError;
        for attempt in 1..=QUERY_REQUEST_RETRIES {
            match self.device_management_cycle(request) {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    log::warn!("UfsPassThru: device management attempt {attempt} failed: {e:?}");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// One complete synchronous query cycle: slot, UPIU, TRD, doorbell wait,
    /// validation, bounded copy-out, unconditional teardown.
    fn device_management_cycle(&self, request: &mut DeviceManagementRequest<'_>) -> Result<QueryOutcome> {
        let slot = self.find_free_slot()?;

        let write_len = match &request.data {
            QueryData::Write(data) => data.len(),
            _ => 0,
        };
        let read_len = match &request.data {
            QueryData::Read(data) => data.len(),
            _ => 0,
        };
        if write_len > u16::MAX as usize || read_len > u16::MAX as usize {
            return Err(UfsError::InvalidParameter);
        }
        let request_area = UPIU_HEADER_SIZE + round_up8(write_len);
        let response_area = UPIU_HEADER_SIZE + round_up8(read_len);
        let descriptor = self.create_command_descriptor(request_area + response_area)?;

        let result = self.run_query(slot, &descriptor, request, request_area, response_area);

        if let Err(e) = self.host.flush() {
            log::error!("UfsPassThru: flush failed after query: {e:?}");
        }
        if let Err(e) = self.stop_slot(slot) {
            log::error!("UfsPassThru: slot teardown failed after query: {e:?}");
        }
        self.destroy_command_descriptor(descriptor);
        result
    }

    fn run_query(
        &self,
        slot: u8,
        descriptor: &crate::queue::CommandDescriptor,
        request: &mut DeviceManagementRequest<'_>,
        request_area: usize,
        response_area: usize,
    ) -> Result<QueryOutcome> {
        let tag = self.next_task_tag();
        let transfer_len = match &request.data {
            QueryData::Write(data) => data.len() as u16,
            QueryData::Read(data) => data.len() as u16,
            QueryData::None => 0,
        };
        let upiu =
            QueryRequestUpiu::new(tag, request.opcode, request.idn, request.index, request.selector, transfer_len, request.value);
        // SAFETY: the descriptor buffer holds the request area and response area.
        unsafe {
            ptr::write_volatile(descriptor.buffer as *mut QueryRequestUpiu, upiu);
            if let QueryData::Write(data) = &request.data {
                ptr::copy_nonoverlapping(data.as_ptr(), descriptor.buffer.add(UPIU_HEADER_SIZE), data.len());
            }
        }

        let data_direction = match &request.data {
            QueryData::None => TRD_DD_NONE,
            QueryData::Read(_) => TRD_DD_TARGET_TO_SYSTEM,
            QueryData::Write(_) => TRD_DD_SYSTEM_TO_TARGET,
        };
        let trd = TransferRequestDescriptor::new(
            data_direction,
            descriptor.mapping.device_address,
            request_area,
            response_area,
            0,
            0,
        );
        // SAFETY: trd_ptr is bounded by nutrs.
        unsafe { ptr::write_volatile(self.trd_ptr(slot)?, trd) };

        self.start_slot(slot)?;
        match self.wait_for_register(REG_UTRLDBR, 1u32 << slot, 0, request.timeout) {
            Ok(()) => {}
            // This boundary reports hardware timeouts as device errors.
            Err(UfsError::Timeout) => return Err(UfsError::DeviceError),
            Err(e) => return Err(e),
        }

        // SAFETY: the slot descriptor was written above and is in the ring.
        let completed = unsafe { ptr::read_volatile(self.trd_ptr(slot)?) };
        if completed.ocs() != OCS_SUCCESS {
            log::error!("UfsPassThru: query command failed, OCS {:#x}", completed.ocs());
            return Err(UfsError::DeviceError);
        }

        let response_ptr = unsafe { descriptor.buffer.add(request_area) };
        // SAFETY: the response area holds at least one UPIU header.
        let response: QueryResponseUpiu = unsafe { ptr::read_volatile(response_ptr as *const QueryResponseUpiu) };
        if response.trans_type != UPIU_TYPE_QUERY_RESPONSE {
            return Err(UfsError::DeviceError);
        }
        match response.query_resp {
            QUERY_RESP_SUCCESS => {}
            QUERY_RESP_INVALID_SELECTOR | QUERY_RESP_INVALID_INDEX | QUERY_RESP_INVALID_IDN => {
                return Err(UfsError::InvalidParameter);
            }
            code => {
                log::error!("UfsPassThru: query rejected, response {code:#x}");
                return Err(UfsError::DeviceError);
            }
        }

        let transferred = if let QueryData::Read(buffer) = &mut request.data {
            // Copy no more than the caller's declared capacity.
            let reported = response.data_segment_len() as usize;
            let count = reported.min(buffer.len());
            // SAFETY: count is bounded by both the response area and the buffer.
            unsafe { ptr::copy_nonoverlapping(response_ptr.add(UPIU_HEADER_SIZE), buffer.as_mut_ptr(), count) };
            count
        } else {
            0
        };
        Ok(QueryOutcome { transferred, value: response.value() })
    }
}
