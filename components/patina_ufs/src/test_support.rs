//! In-process fakes for engine tests: a host controller with a register file,
//! doorbell semantics, and a scripted UFS device behind it, plus a boot
//! services fake that tracks TPL, stalls, events, and the monitor timer.
//!
//! DMA is identity mapped: device addresses are the host addresses of real
//! allocations, so the scripted device can follow the UTRL, command
//! descriptors, and PRDT exactly the way hardware would.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ptr;
use std::rc::Rc;
use std::vec::Vec;

use r_efi::efi;

use crate::controller::UfsController;
use crate::error::{Result, UfsError};
use crate::host::{BootServices, DmaDirection, DmaMapping, UfsHostController, PAGE_SIZE};
use crate::lun::LunSet;
use crate::queue::{TransferRequestDescriptor, TrdStatus, OCS_SUCCESS, TRD_SIZE};
use crate::regs::{
    HostControllerInfo, HCE_ENABLE, HCS_DP, HCS_UCRDY, HCS_UTMRLRDY, HCS_UTRLRDY, IS_UCCS, IS_ULSS, IS_UTRCS,
    REG_HCE, REG_HCS, REG_IS, REG_UCMDARG2, REG_UICCMD, REG_UTRLBA, REG_UTRLBAU, REG_UTRLCLR, REG_UTRLDBR,
    UIC_DME_LINK_STARTUP,
};
use crate::upiu::{
    PrdtEntry, QUERY_RESP_INVALID_IDN, UPIU_FLAG_READ, UPIU_FLAG_WRITE, UPIU_FLAG_UNDERFLOW, UPIU_TYPE_COMMAND,
    UPIU_TYPE_NOP_IN, UPIU_TYPE_NOP_OUT, UPIU_TYPE_QUERY_REQUEST, UPIU_TYPE_QUERY_RESPONSE, UPIU_TYPE_RESPONSE,
};

/// Scripted device behavior installed by [`FakeHc::configure_device`].
pub(crate) struct FakeDevice {
    /// Bitmask of common LUNs whose unit descriptors report bLUEnable = 1.
    pub enabled_luns: u8,
    /// Whether the device descriptor reports RPMB (bSecurityLU) support.
    pub security_lun: bool,
    /// How many fDeviceInit reads return "still set" after the host sets it.
    pub init_flag_reads: usize,
}

const FDEVICE_INIT: u8 = 0x01;

struct FakeHcState {
    regs: RefCell<[u32; 64]>,
    device_present: Cell<bool>,
    auto_complete: Cell<bool>,
    pending_slots: RefCell<Vec<u8>>,
    fail_reads: Cell<bool>,
    fail_requests: Cell<usize>,
    completed: Cell<usize>,
    hce_disable_observed: Cell<bool>,
    uic_result: Cell<u32>,

    read_pattern: Cell<u8>,
    sense: RefCell<Vec<u8>>,
    target_status: Cell<u8>,
    target_response: Cell<u8>,
    residual: Cell<u32>,
    written: RefCell<Vec<u8>>,

    descriptors: RefCell<HashMap<(u8, u8), Vec<u8>>>,
    attributes: RefCell<HashMap<u8, u32>>,
    flags: RefCell<HashMap<u8, bool>>,
    init_flag_reads: Cell<usize>,
    device_init_countdown: Cell<usize>,

    allocations: RefCell<HashMap<usize, usize>>,
    mappings: Cell<isize>,
}

/// Fake UFS host controller with an emulated device behind the doorbell.
pub(crate) struct FakeHc(Rc<FakeHcState>);

impl FakeHc {
    pub(crate) fn new() -> Self {
        let state = FakeHcState {
            regs: RefCell::new([0u32; 64]),
            device_present: Cell::new(true),
            auto_complete: Cell::new(true),
            pending_slots: RefCell::new(Vec::new()),
            fail_reads: Cell::new(false),
            fail_requests: Cell::new(0),
            completed: Cell::new(0),
            hce_disable_observed: Cell::new(false),
            uic_result: Cell::new(0),
            read_pattern: Cell::new(0),
            sense: RefCell::new(Vec::new()),
            target_status: Cell::new(0),
            target_response: Cell::new(0),
            residual: Cell::new(0),
            written: RefCell::new(Vec::new()),
            descriptors: RefCell::new(HashMap::new()),
            attributes: RefCell::new(HashMap::new()),
            flags: RefCell::new(HashMap::new()),
            init_flag_reads: Cell::new(0),
            device_init_countdown: Cell::new(0),
            allocations: RefCell::new(HashMap::new()),
            mappings: Cell::new(0),
        };
        // 8 transfer slots, 4 task management slots, 64-bit addressing, UFS 2.1.
        state.regs.borrow_mut()[0] = 0x0103_0007;
        state.regs.borrow_mut()[2] = 0x0000_0210;
        Self(Rc::new(state))
    }

    pub(crate) fn clone_handle(&self) -> Self {
        Self(Rc::clone(&self.0))
    }

    pub(crate) fn reg(&self, offset: usize) -> u32 {
        self.0.regs.borrow()[offset / 4]
    }

    pub(crate) fn set_reg(&self, offset: usize, value: u32) {
        self.0.regs.borrow_mut()[offset / 4] = value;
    }

    pub(crate) fn set_device_present(&self, present: bool) {
        self.0.device_present.set(present);
    }

    pub(crate) fn set_auto_complete(&self, auto: bool) {
        self.0.auto_complete.set(auto);
    }

    /// Lets the scripted device finish everything rung while auto completion
    /// was off.
    pub(crate) fn complete_pending_slots(&self) {
        let slots: Vec<u8> = self.0.pending_slots.borrow_mut().drain(..).collect();
        for slot in slots {
            self.process_slot(slot);
        }
    }

    pub(crate) fn fail_reg_reads(&self, fail: bool) {
        self.0.fail_reads.set(fail);
    }

    /// The next `count` rung slots complete with a nonzero OCS.
    pub(crate) fn fail_next_requests(&self, count: usize) {
        self.0.fail_requests.set(count);
    }

    pub(crate) fn completed_requests(&self) -> usize {
        self.0.completed.get()
    }

    pub(crate) fn hce_disable_observed(&self) -> bool {
        self.0.hce_disable_observed.get()
    }

    pub(crate) fn set_uic_result(&self, result: u32) {
        self.0.uic_result.set(result);
    }

    pub(crate) fn set_read_pattern(&self, pattern: u8) {
        self.0.read_pattern.set(pattern);
    }

    pub(crate) fn set_sense_data(&self, sense: &[u8]) {
        *self.0.sense.borrow_mut() = sense.to_vec();
    }

    pub(crate) fn set_target_status(&self, status: u8) {
        self.0.target_status.set(status);
    }

    pub(crate) fn set_target_response(&self, response: u8) {
        self.0.target_response.set(response);
    }

    pub(crate) fn set_residual(&self, residual: u32) {
        self.0.residual.set(residual);
    }

    pub(crate) fn written_data(&self) -> Vec<u8> {
        self.0.written.borrow().clone()
    }

    pub(crate) fn set_descriptor(&self, idn: u8, descriptor: &[u8]) {
        self.0.descriptors.borrow_mut().insert((idn, 0), descriptor.to_vec());
    }

    pub(crate) fn configure_device(&self, device: FakeDevice) {
        use crate::device::{DEVICE_DESCRIPTOR_SIZE, DEVICE_DESC_SECURITY_LU, UNIT_DESCRIPTOR_SIZE};
        let mut descriptors = self.0.descriptors.borrow_mut();
        for lun in 0..8u8 {
            let mut unit = vec![0u8; UNIT_DESCRIPTOR_SIZE];
            unit[0] = UNIT_DESCRIPTOR_SIZE as u8;
            unit[1] = 0x02;
            unit[2] = lun;
            unit[3] = u8::from(device.enabled_luns & (1 << lun) != 0);
            descriptors.insert((0x02, lun), unit);
        }
        let mut device_descriptor = vec![0u8; DEVICE_DESCRIPTOR_SIZE];
        device_descriptor[0] = DEVICE_DESCRIPTOR_SIZE as u8;
        device_descriptor[DEVICE_DESC_SECURITY_LU] = u8::from(device.security_lun);
        descriptors.insert((0x00, 0), device_descriptor);
        self.0.init_flag_reads.set(device.init_flag_reads);
    }

    pub(crate) fn outstanding_allocations(&self) -> usize {
        self.0.allocations.borrow().len()
    }

    pub(crate) fn outstanding_mappings(&self) -> isize {
        self.0.mappings.get()
    }

    fn process_slot(&self, slot: u8) {
        let state = &self.0;
        state.completed.set(state.completed.get() + 1);

        let (base_lo, base_hi) = {
            let regs = state.regs.borrow();
            (regs[REG_UTRLBA / 4], regs[REG_UTRLBAU / 4])
        };
        let base = (((base_hi as u64) << 32) | base_lo as u64) as usize as *mut u8;
        assert!(!base.is_null(), "doorbell rung before the UTRL was programmed");
        let trd_ptr = unsafe { base.add(slot as usize * TRD_SIZE) } as *mut TransferRequestDescriptor;
        let trd = unsafe { ptr::read_volatile(trd_ptr) };

        if state.fail_requests.get() > 0 {
            state.fail_requests.set(state.fail_requests.get() - 1);
            self.finish_slot(trd_ptr, trd, slot, 0x02);
            return;
        }

        let descriptor = trd.command_descriptor_address() as usize as *mut u8;
        let response = unsafe { descriptor.add(trd.response_offset()) };
        let trans_type = unsafe { ptr::read_volatile(descriptor) };
        match trans_type {
            UPIU_TYPE_NOP_OUT => self.serve_nop(descriptor, response),
            UPIU_TYPE_COMMAND => self.serve_scsi(descriptor, response, &trd),
            UPIU_TYPE_QUERY_REQUEST => self.serve_query(descriptor, response, &trd),
            other => panic!("unexpected UPIU transaction type {other:#x}"),
        }
        self.finish_slot(trd_ptr, trd, slot, OCS_SUCCESS);
    }

    fn finish_slot(&self, trd_ptr: *mut TransferRequestDescriptor, mut trd: TransferRequestDescriptor, slot: u8, ocs: u8) {
        trd.dw2 = TrdStatus::new().with_ocs(ocs).into_bits();
        unsafe { ptr::write_volatile(trd_ptr, trd) };
        let mut regs = self.0.regs.borrow_mut();
        regs[REG_UTRLDBR / 4] &= !(1u32 << slot);
        regs[REG_IS / 4] |= IS_UTRCS;
    }

    fn serve_nop(&self, request: *mut u8, response: *mut u8) {
        let tag = unsafe { ptr::read_volatile(request.add(3)) };
        let mut bytes = [0u8; 32];
        bytes[0] = UPIU_TYPE_NOP_IN;
        bytes[3] = tag;
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), response, bytes.len()) };
    }

    fn serve_scsi(&self, request: *mut u8, response: *mut u8, trd: &TransferRequestDescriptor) {
        let state = &self.0;
        let flags = unsafe { ptr::read_volatile(request.add(1)) };
        let tag = unsafe { ptr::read_volatile(request.add(3)) };

        let prdt = unsafe { request.add(trd.prdt_offset()) } as *const PrdtEntry;
        for index in 0..trd.prdt_entries() {
            let entry = unsafe { ptr::read_volatile(prdt.add(index)) };
            let address = (((entry.dbau as u64) << 32) | entry.dba as u64) as usize as *mut u8;
            let count = (entry.dbc & 0x3FFFF) as usize + 1;
            if flags & UPIU_FLAG_READ != 0 {
                unsafe { ptr::write_bytes(address, state.read_pattern.get(), count) };
            } else if flags & UPIU_FLAG_WRITE != 0 {
                let chunk = unsafe { core::slice::from_raw_parts(address as *const u8, count) };
                state.written.borrow_mut().extend_from_slice(chunk);
            }
        }

        let sense = state.sense.borrow();
        let mut bytes = [0u8; 32];
        bytes[0] = UPIU_TYPE_RESPONSE;
        if state.residual.get() != 0 {
            bytes[1] = UPIU_FLAG_UNDERFLOW;
        }
        bytes[3] = tag;
        bytes[6] = state.target_response.get();
        bytes[7] = state.target_status.get();
        if !sense.is_empty() {
            bytes[10..12].copy_from_slice(&((sense.len() + 2) as u16).to_be_bytes());
        }
        bytes[12..16].copy_from_slice(&state.residual.get().to_be_bytes());
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), response, bytes.len());
            let sense_header = (sense.len() as u16).to_be_bytes();
            ptr::copy_nonoverlapping(sense_header.as_ptr(), response.add(32), 2);
            ptr::copy_nonoverlapping(sense.as_ptr(), response.add(34), sense.len());
        }
    }

    fn serve_query(&self, request: *mut u8, response: *mut u8, trd: &TransferRequestDescriptor) {
        let state = &self.0;
        let tag = unsafe { ptr::read_volatile(request.add(3)) };
        let query_func = unsafe { ptr::read_volatile(request.add(5)) };
        let opcode = unsafe { ptr::read_volatile(request.add(12)) };
        let idn = unsafe { ptr::read_volatile(request.add(13)) };
        let index = unsafe { ptr::read_volatile(request.add(14)) };
        let selector = unsafe { ptr::read_volatile(request.add(15)) };
        let request_value = {
            let mut raw = [0u8; 4];
            unsafe { ptr::copy_nonoverlapping(request.add(20), raw.as_mut_ptr(), 4) };
            u32::from_be_bytes(raw)
        };

        let mut response_code = 0u8;
        let mut tsf_value = 0u32;
        let mut data: Vec<u8> = Vec::new();

        match opcode {
            0x01 => match state.descriptors.borrow().get(&(idn, index)) {
                Some(descriptor) => data = descriptor.clone(),
                None => response_code = QUERY_RESP_INVALID_IDN,
            },
            0x02 => {
                let length = {
                    let mut raw = [0u8; 2];
                    unsafe { ptr::copy_nonoverlapping(request.add(18), raw.as_mut_ptr(), 2) };
                    u16::from_be_bytes(raw) as usize
                };
                let payload = unsafe { core::slice::from_raw_parts(request.add(32), length) };
                state.descriptors.borrow_mut().insert((idn, index), payload.to_vec());
            }
            0x03 => tsf_value = state.attributes.borrow().get(&idn).copied().unwrap_or(0),
            0x04 => {
                state.attributes.borrow_mut().insert(idn, request_value);
                tsf_value = request_value;
            }
            0x05 if idn == FDEVICE_INIT => {
                let remaining = state.device_init_countdown.get();
                if remaining > 0 {
                    state.device_init_countdown.set(remaining - 1);
                    tsf_value = 1;
                }
            }
            0x06 if idn == FDEVICE_INIT => {
                state.device_init_countdown.set(state.init_flag_reads.get());
                tsf_value = 1;
            }
            0x05..=0x08 => {
                let current = state.flags.borrow().get(&idn).copied().unwrap_or(false);
                let new = match opcode {
                    0x05 => current,
                    0x06 => true,
                    0x07 => false,
                    _ => !current,
                };
                if opcode != 0x05 {
                    state.flags.borrow_mut().insert(idn, new);
                }
                tsf_value = u32::from(new);
            }
            _ => response_code = 0xFE,
        }

        let data_space = trd.response_len().saturating_sub(32);
        let write_len = data.len().min(data_space);

        let mut bytes = [0u8; 32];
        bytes[0] = UPIU_TYPE_QUERY_RESPONSE;
        bytes[3] = tag;
        bytes[5] = query_func;
        bytes[6] = response_code;
        if response_code == 0 && !data.is_empty() {
            bytes[10..12].copy_from_slice(&(data.len() as u16).to_be_bytes());
            bytes[18..20].copy_from_slice(&(data.len() as u16).to_be_bytes());
        }
        bytes[12] = opcode;
        bytes[13] = idn;
        bytes[14] = index;
        bytes[15] = selector;
        bytes[20..24].copy_from_slice(&tsf_value.to_be_bytes());
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), response, bytes.len());
            ptr::copy_nonoverlapping(data.as_ptr(), response.add(32), write_len);
        }
    }
}

impl UfsHostController for FakeHc {
    fn read_reg32(&self, offset: usize) -> Result<u32> {
        if self.0.fail_reads.get() {
            return Err(UfsError::DeviceError);
        }
        let value = self.0.regs.borrow()[offset / 4];
        if offset == REG_HCS {
            return Ok(value | HCS_UCRDY | HCS_UTRLRDY | HCS_UTMRLRDY);
        }
        Ok(value)
    }

    fn write_reg32(&self, offset: usize, value: u32) -> Result<()> {
        let state = &self.0;
        match offset {
            REG_HCE => {
                if value & HCE_ENABLE == 0 {
                    state.hce_disable_observed.set(true);
                    state.regs.borrow_mut()[REG_HCE / 4] = 0;
                } else {
                    state.regs.borrow_mut()[REG_HCE / 4] = HCE_ENABLE;
                }
            }
            REG_IS => {
                let mut regs = state.regs.borrow_mut();
                regs[REG_IS / 4] &= !value;
            }
            REG_UTRLDBR => {
                // Write-1-to-set; the scripted device reacts to newly set bits.
                let new_bits = {
                    let mut regs = state.regs.borrow_mut();
                    let new_bits = value & !regs[REG_UTRLDBR / 4];
                    regs[REG_UTRLDBR / 4] |= value;
                    new_bits
                };
                for slot in 0..32u8 {
                    if new_bits & (1u32 << slot) != 0 {
                        if state.auto_complete.get() {
                            self.process_slot(slot);
                        } else {
                            state.pending_slots.borrow_mut().push(slot);
                        }
                    }
                }
            }
            REG_UTRLCLR => {
                // Write-0-to-clear.
                let mut regs = state.regs.borrow_mut();
                regs[REG_UTRLDBR / 4] &= value;
            }
            REG_UICCMD => {
                let mut regs = state.regs.borrow_mut();
                regs[REG_UICCMD / 4] = value;
                regs[REG_IS / 4] |= IS_UCCS;
                if value & 0xFF == UIC_DME_LINK_STARTUP {
                    regs[REG_IS / 4] |= IS_ULSS;
                    if state.device_present.get() {
                        regs[REG_HCS / 4] |= HCS_DP;
                    }
                }
                regs[REG_UCMDARG2 / 4] = state.uic_result.get();
            }
            _ => state.regs.borrow_mut()[offset / 4] = value,
        }
        Ok(())
    }

    fn allocate_pages(&self, pages: usize) -> Result<*mut u8> {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: layout is nonzero and valid.
        let buffer = unsafe { alloc_zeroed(layout) };
        if buffer.is_null() {
            return Err(UfsError::OutOfResources);
        }
        self.0.allocations.borrow_mut().insert(buffer as usize, pages);
        Ok(buffer)
    }

    fn free_pages(&self, buffer: *mut u8, pages: usize) -> Result<()> {
        let tracked = self.0.allocations.borrow_mut().remove(&(buffer as usize));
        assert_eq!(tracked, Some(pages), "free of an untracked buffer or a mismatched page count");
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: the allocation was produced by allocate_pages with this layout.
        unsafe { dealloc(buffer, layout) };
        Ok(())
    }

    fn map(&self, _direction: DmaDirection, host_address: *mut u8, _length: usize) -> Result<DmaMapping> {
        self.0.mappings.set(self.0.mappings.get() + 1);
        Ok(DmaMapping { device_address: host_address as u64, token: host_address as *mut core::ffi::c_void })
    }

    fn unmap(&self, _mapping: DmaMapping) -> Result<()> {
        self.0.mappings.set(self.0.mappings.get() - 1);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

struct FakeBsState {
    tpl: Cell<efi::Tpl>,
    stall_us: Cell<u64>,
    signals: RefCell<Vec<usize>>,
    timer: Cell<Option<(usize, u64)>>,
    timer_canceled: Cell<bool>,
}

/// Fake boot services subset: TPL tracking, events, timer bookkeeping.
pub(crate) struct FakeBs(Rc<FakeBsState>);

impl FakeBs {
    pub(crate) fn new() -> Self {
        Self(Rc::new(FakeBsState {
            tpl: Cell::new(efi::TPL_APPLICATION),
            stall_us: Cell::new(0),
            signals: RefCell::new(Vec::new()),
            timer: Cell::new(None),
            timer_canceled: Cell::new(false),
        }))
    }

    pub(crate) fn clone_handle(&self) -> Self {
        Self(Rc::clone(&self.0))
    }

    pub(crate) fn current_tpl(&self) -> efi::Tpl {
        self.0.tpl.get()
    }

    pub(crate) fn total_stall_us(&self) -> u64 {
        self.0.stall_us.get()
    }

    /// Allocates an event handle for use as a completion event in tests.
    pub(crate) fn new_event(&self) -> efi::Event {
        let mut signals = self.0.signals.borrow_mut();
        signals.push(0);
        signals.len() as efi::Event
    }

    pub(crate) fn signal_count(&self, event: efi::Event) -> usize {
        self.0.signals.borrow()[event as usize - 1]
    }

    pub(crate) fn armed_timer_period(&self) -> Option<u64> {
        self.0.timer.get().map(|(_, period)| period)
    }

    pub(crate) fn timer_canceled(&self) -> bool {
        self.0.timer_canceled.get()
    }
}

impl BootServices for FakeBs {
    fn raise_tpl(&self, tpl: efi::Tpl) -> efi::Tpl {
        let previous = self.0.tpl.get();
        assert!(previous <= tpl, "cannot raise tpl to lower than the current level");
        self.0.tpl.set(tpl);
        previous
    }

    fn restore_tpl(&self, tpl: efi::Tpl) {
        let previous = self.0.tpl.get();
        assert!(previous >= tpl, "cannot restore tpl to higher than the current level");
        self.0.tpl.set(tpl);
    }

    fn create_event(
        &self,
        _event_type: u32,
        _notify_tpl: efi::Tpl,
        _notify_function: Option<efi::EventNotify>,
        _notify_context: *mut core::ffi::c_void,
    ) -> Result<efi::Event> {
        Ok(self.new_event())
    }

    fn close_event(&self, _event: efi::Event) -> Result<()> {
        Ok(())
    }

    fn signal_event(&self, event: efi::Event) -> Result<()> {
        self.0.signals.borrow_mut()[event as usize - 1] += 1;
        Ok(())
    }

    fn set_timer_periodic(&self, event: efi::Event, period: u64) -> Result<()> {
        self.0.timer.set(Some((event as usize, period)));
        Ok(())
    }

    fn cancel_timer(&self, _event: efi::Event) -> Result<()> {
        self.0.timer_canceled.set(true);
        self.0.timer.set(None);
        Ok(())
    }

    fn stall(&self, microseconds: usize) {
        self.0.stall_us.set(self.0.stall_us.get() + microseconds as u64);
    }
}

/// A controller struct with default capabilities and no hardware state, for
/// unit tests that drive individual methods.
pub(crate) fn bare_controller<H: UfsHostController, B: BootServices>(host: H, bs: B, nutrs: u8) -> UfsController<H, B> {
    UfsController {
        host,
        bs,
        platform: None,
        info: HostControllerInfo { version: 0x0000_0210, nutrs, nutmrs: 4, addressing_64: true },
        io_align: 1,
        task_tag: std::cell::Cell::new(0),
        luns: LunSet::new(),
        utrl: None,
        utmrl: None,
        pending: std::cell::RefCell::new(std::collections::VecDeque::new()),
        timer_event: std::cell::Cell::new(None),
    }
}

/// A controller with live fake queues and LUNs 0 and 2 exposed, ready for
/// request-level tests. The monitor timer is not armed; tests drive ticks
/// directly.
pub(crate) fn ready_controller(host: FakeHc, bs: FakeBs) -> UfsController<FakeHc, FakeBs> {
    let mut controller = bare_controller(host, bs, 8);
    controller.init_queues().unwrap();
    let mut luns = LunSet::new();
    luns.enable_common(0);
    luns.enable_common(2);
    controller.luns = luns;
    controller
}
