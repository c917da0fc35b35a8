//! Host collaborator traits consumed by the UFS driver engine.
//!
//! The engine does not own MMIO decoding, DMA mapping, or the event/timer
//! machinery; a host controller abstraction and a narrow boot services subset
//! are supplied by the platform at attach time. Both traits are mockable for
//! tests.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use core::ffi::c_void;

#[cfg(any(test, feature = "mockall"))]
use mockall::automock;
use r_efi::efi;

use crate::error::{Result, UfsError};

/// EFI memory allocation granule.
pub const PAGE_SIZE: usize = 0x1000;

/// Number of pages needed to cover `size` bytes.
pub(crate) const fn pages_for(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE)
}

/// Direction of a DMA bus-master operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// The bus master reads system memory (data out to the device).
    BusMasterRead,
    /// The bus master writes system memory (data in from the device).
    BusMasterWrite,
    /// The buffer is shared between host and device for the mapping's lifetime.
    BusMasterCommonBuffer,
}

/// A live DMA mapping returned by [`UfsHostController::map`].
#[derive(Debug, Clone, Copy)]
pub struct DmaMapping {
    /// Address the device uses to reach the mapped buffer.
    pub device_address: u64,
    /// Opaque token to pass back to [`UfsHostController::unmap`].
    pub token: *mut c_void,
}

/// MMIO and DMA services for one UFS host controller.
///
/// Register offsets are relative to the controller's MMIO BAR. The `map`
/// contract requires the full requested length to be mapped; implementations
/// that can only map a prefix must fail the call.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait UfsHostController {
    /// Reads a 32-bit host controller register.
    fn read_reg32(&self, offset: usize) -> Result<u32>;

    /// Writes a 32-bit host controller register.
    fn write_reg32(&self, offset: usize, value: u32) -> Result<()>;

    /// Allocates DMA-capable pages suitable for a common buffer mapping.
    fn allocate_pages(&self, pages: usize) -> Result<*mut u8>;

    /// Frees pages obtained from [`UfsHostController::allocate_pages`].
    fn free_pages(&self, buffer: *mut u8, pages: usize) -> Result<()>;

    /// Maps a host buffer for bus-master access.
    fn map(&self, direction: DmaDirection, host_address: *mut u8, length: usize) -> Result<DmaMapping>;

    /// Tears down a mapping created by [`UfsHostController::map`].
    fn unmap(&self, mapping: DmaMapping) -> Result<()>;

    /// Flushes posted writes on the bus interface.
    fn flush(&self) -> Result<()>;
}

/// The subset of UEFI boot services the driver engine consumes.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait BootServices {
    /// Raises the task priority level, returning the previous level.
    fn raise_tpl(&self, tpl: efi::Tpl) -> efi::Tpl;

    /// Restores a task priority level previously returned by `raise_tpl`.
    fn restore_tpl(&self, tpl: efi::Tpl);

    /// Creates an event. `notify_context` is passed verbatim to the notify function.
    fn create_event(
        &self,
        event_type: u32,
        notify_tpl: efi::Tpl,
        notify_function: Option<efi::EventNotify>,
        notify_context: *mut c_void,
    ) -> Result<efi::Event>;

    /// Closes an event created by `create_event`.
    fn close_event(&self, event: efi::Event) -> Result<()>;

    /// Signals an event.
    fn signal_event(&self, event: efi::Event) -> Result<()>;

    /// Arms `event` to fire every `period` 100ns units.
    fn set_timer_periodic(&self, event: efi::Event, period: u64) -> Result<()>;

    /// Cancels a timer previously armed with `set_timer_periodic`.
    fn cancel_timer(&self, event: efi::Event) -> Result<()>;

    /// Busy-waits for at least `microseconds`.
    fn stall(&self, microseconds: usize);
}

// r-efi models TimerDelay as a plain integer; only these two values are used here.
const TIMER_CANCEL: efi::TimerDelay = 0;
const TIMER_PERIODIC: efi::TimerDelay = 1;

/// [`BootServices`] implementation that calls through a UEFI boot services table.
#[derive(Debug, Clone, Copy)]
pub struct StandardBootServices {
    table: *mut efi::BootServices,
}

impl StandardBootServices {
    /// Creates a wrapper over the firmware boot services table.
    ///
    /// # Safety
    ///
    /// `table` must point to a valid boot services table that outlives this object.
    pub unsafe fn new(table: *mut efi::BootServices) -> Self {
        debug_assert!(!table.is_null());
        Self { table }
    }

    fn table(&self) -> &efi::BootServices {
        // SAFETY: validity for the wrapper's lifetime is the constructor's contract.
        unsafe { &*self.table }
    }
}

impl BootServices for StandardBootServices {
    fn raise_tpl(&self, tpl: efi::Tpl) -> efi::Tpl {
        (self.table().raise_tpl)(tpl)
    }

    fn restore_tpl(&self, tpl: efi::Tpl) {
        (self.table().restore_tpl)(tpl)
    }

    fn create_event(
        &self,
        event_type: u32,
        notify_tpl: efi::Tpl,
        notify_function: Option<efi::EventNotify>,
        notify_context: *mut c_void,
    ) -> Result<efi::Event> {
        let mut event: efi::Event = core::ptr::null_mut();
        let status = (self.table().create_event)(event_type, notify_tpl, notify_function, notify_context, &mut event);
        if status.is_error() {
            return Err(UfsError::OutOfResources);
        }
        Ok(event)
    }

    fn close_event(&self, event: efi::Event) -> Result<()> {
        let status = (self.table().close_event)(event);
        if status.is_error() { Err(UfsError::DeviceError) } else { Ok(()) }
    }

    fn signal_event(&self, event: efi::Event) -> Result<()> {
        let status = (self.table().signal_event)(event);
        if status.is_error() { Err(UfsError::DeviceError) } else { Ok(()) }
    }

    fn set_timer_periodic(&self, event: efi::Event, period: u64) -> Result<()> {
        let status = (self.table().set_timer)(event, TIMER_PERIODIC, period);
        if status.is_error() { Err(UfsError::DeviceError) } else { Ok(()) }
    }

    fn cancel_timer(&self, event: efi::Event) -> Result<()> {
        let status = (self.table().set_timer)(event, TIMER_CANCEL, 0);
        if status.is_error() { Err(UfsError::DeviceError) } else { Ok(()) }
    }

    fn stall(&self, microseconds: usize) {
        let _ = (self.table().stall)(microseconds);
    }
}

/// RAII guard for a TPL-based critical section.
///
/// Raising to the completion monitor's notify TPL excludes the timer callback
/// for the guard's lifetime; the previous level is restored on drop.
pub(crate) struct TplGuard<'a, B: BootServices + ?Sized> {
    bs: &'a B,
    previous: efi::Tpl,
}

impl<'a, B: BootServices + ?Sized> TplGuard<'a, B> {
    pub(crate) fn raise(bs: &'a B, tpl: efi::Tpl) -> Self {
        let previous = bs.raise_tpl(tpl);
        Self { bs, previous }
    }
}

impl<B: BootServices + ?Sized> Drop for TplGuard<'_, B> {
    fn drop(&mut self) {
        self.bs.restore_tpl(self.previous);
    }
}
