//! The per-controller driver context and its lifecycle.
//!
//! One [`UfsController`] instance owns everything for one host controller: the
//! host service handles, the capability snapshot, the hardware request lists,
//! the task tag counter, the exposed LUN set, and the in-flight queue of
//! non-blocking requests. All state that used to be module-global in
//! comparable drivers lives here and is passed by reference through every
//! call.
//!
//! Lifecycle: `Uninitialized → Enabled → LinkUp → QueuesReady → Running`. Any
//! step failing aborts the attach; teardown reverses the queue setup, disables
//! the controller, and force-completes anything still in flight.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::ffi::c_void;

use r_efi::efi;

use crate::device::{
    DescriptorId, FlagId, DEVICE_DESCRIPTOR_SIZE, DEVICE_DESC_SECURITY_LU, UNIT_DESCRIPTOR_SIZE, UNIT_DESC_LU_ENABLE,
};
use crate::error::{Result, UfsError};
use crate::host::{BootServices, TplGuard, UfsHostController};
use crate::lun::{LunSet, UFS_COMMON_LUN_COUNT};
use crate::monitor::{process_async_requests, SlotOutcome, ASYNC_TIMER_PERIOD};
use crate::queue::QueueBuffer;
use crate::regs::HostControllerInfo;
use crate::scsi::InFlightRequest;

/// Device initialization completion polls (1 ms apart).
const DEVICE_INIT_POLL_ATTEMPTS: usize = 600;
/// Stall between device initialization polls, in microseconds.
const DEVICE_INIT_POLL_INTERVAL_US: usize = 1000;

/// Optional platform customization of controller bring-up.
///
/// Platforms that need no adjustment simply pass no hook; every method has a
/// neutral default.
pub trait UfsHcPlatform {
    /// Adjusts the capability snapshot before the controller uses it.
    fn override_host_controller_info(&self, _info: &mut HostControllerInfo) {}

    /// Whether the enable sequence may skip cycling the enable bit low for the
    /// negotiated controller version.
    fn skip_hce_disable(&self, _version: u32) -> bool {
        false
    }

    /// Called immediately before the enable bit is raised.
    fn pre_host_controller_enable(&self, _info: &HostControllerInfo) -> Result<()> {
        Ok(())
    }

    /// Called once the enable bit reads back set.
    fn post_host_controller_enable(&self, _info: &HostControllerInfo) -> Result<()> {
        Ok(())
    }
}

/// Driver context for one UFS host controller.
pub struct UfsController<H: UfsHostController, B: BootServices> {
    pub(crate) host: H,
    pub(crate) bs: B,
    pub(crate) platform: Option<Box<dyn UfsHcPlatform>>,
    pub(crate) info: HostControllerInfo,
    pub(crate) io_align: u32,
    pub(crate) task_tag: Cell<u8>,
    pub(crate) luns: LunSet,
    pub(crate) utrl: Option<QueueBuffer>,
    pub(crate) utmrl: Option<QueueBuffer>,
    pub(crate) pending: RefCell<VecDeque<InFlightRequest>>,
    pub(crate) timer_event: Cell<Option<efi::Event>>,
}

impl<H: UfsHostController, B: BootServices> UfsController<H, B> {
    /// Attaches to a host controller and brings it to the running state.
    ///
    /// On success the returned controller is live: the link is up, the request
    /// lists are programmed, the device finished initialization, the LUN set
    /// is probed, and the completion monitor timer is running. The controller
    /// is boxed because the timer callback holds its address.
    pub fn start(
        host: H,
        boot_services: B,
        platform: Option<Box<dyn UfsHcPlatform>>,
        io_align: u32,
    ) -> Result<Box<Self>> {
        let mut controller = Box::new(Self {
            host,
            bs: boot_services,
            platform,
            info: HostControllerInfo::default(),
            io_align,
            task_tag: Cell::new(0),
            luns: LunSet::new(),
            utrl: None,
            utmrl: None,
            pending: RefCell::new(VecDeque::new()),
            timer_event: Cell::new(None),
        });
        if let Err(e) = controller.bring_up() {
            log::error!("UfsPassThru: controller attach failed: {e:?}");
            let _ = controller.disable_host_controller();
            return Err(e);
        }
        Ok(controller)
    }

    fn bring_up(&mut self) -> Result<()> {
        self.snapshot_capabilities()?;
        self.enable_host_controller()?;
        self.detect_device()?;
        self.init_queues()?;
        self.initialize_device()?;
        self.start_monitor()
    }

    /// Detaches from the controller: stops the monitor, force-completes any
    /// in-flight requests with a host adapter phase error, quiesces the
    /// hardware, and releases the request lists.
    pub fn stop(mut self: Box<Self>) -> Result<()> {
        if let Some(event) = self.timer_event.take() {
            if let Err(e) = self.bs.cancel_timer(event) {
                log::error!("UfsPassThru: monitor timer cancel failed: {e:?}");
            }
            let _ = self.bs.close_event(event);
        }

        let drained: Vec<InFlightRequest> = {
            let _tpl = TplGuard::raise(&self.bs, efi::TPL_CALLBACK);
            self.pending.borrow_mut().drain(..).collect()
        };
        for entry in drained {
            log::warn!("UfsPassThru: aborting in-flight request on slot {} at stop", entry.slot);
            self.finish_async_request(entry, SlotOutcome::PhaseError);
        }

        self.disable_host_controller()
    }

    /// Exposed LUN set probed during attach.
    pub fn exposed_luns(&self) -> &LunSet {
        &self.luns
    }

    /// The controller capability snapshot.
    pub fn host_controller_info(&self) -> &HostControllerInfo {
        &self.info
    }

    /// Next task tag; increments on every UPIU built and wraps at its width.
    pub(crate) fn next_task_tag(&self) -> u8 {
        let tag = self.task_tag.get().wrapping_add(1);
        self.task_tag.set(tag);
        tag
    }

    /// Sends the NOP round-trip, drives device initialization to completion,
    /// and probes the exposed logical units.
    fn initialize_device(&mut self) -> Result<()> {
        self.exec_nop()?;

        self.set_flag(FlagId::DeviceInit)?;
        self.wait_device_init_complete()?;
        self.probe_logical_units()
    }

    /// Polls fDeviceInit until the device clears it.
    fn wait_device_init_complete(&self) -> Result<()> {
        for _ in 0..DEVICE_INIT_POLL_ATTEMPTS {
            if !self.read_flag(FlagId::DeviceInit)? {
                return Ok(());
            }
            self.bs.stall(DEVICE_INIT_POLL_INTERVAL_US);
        }
        log::error!("UfsPassThru: device initialization did not complete");
        Err(UfsError::Timeout)
    }

    /// Builds the exposed LUN set from the unit descriptors and the device
    /// descriptor's security LUN support.
    fn probe_logical_units(&mut self) -> Result<()> {
        let mut luns = LunSet::new();
        for lun in 0..UFS_COMMON_LUN_COUNT {
            let mut unit_descriptor = [0u8; UNIT_DESCRIPTOR_SIZE];
            match self.read_descriptor(DescriptorId::Unit, lun, 0, &mut unit_descriptor) {
                Ok(read) if read > UNIT_DESC_LU_ENABLE && unit_descriptor[UNIT_DESC_LU_ENABLE] == 1 => {
                    luns.enable_common(lun);
                }
                Ok(_) => {}
                Err(e) => log::debug!("UfsPassThru: unit descriptor {lun} probe failed: {e:?}"),
            }
        }

        let mut device_descriptor = [0u8; DEVICE_DESCRIPTOR_SIZE];
        match self.read_descriptor(DescriptorId::Device, 0, 0, &mut device_descriptor) {
            Ok(read) if read > DEVICE_DESC_SECURITY_LU && device_descriptor[DEVICE_DESC_SECURITY_LU] == 1 => {
                luns.enable_rpmb();
            }
            Ok(_) => {}
            Err(e) => log::warn!("UfsPassThru: device descriptor probe failed: {e:?}"),
        }

        log::info!("UfsPassThru: exposed LUN mask {:#06x}", luns.bit_mask());
        self.luns = luns;
        Ok(())
    }

    /// Arms the periodic completion monitor timer.
    fn start_monitor(&self) -> Result<()> {
        let context = self as *const Self as *mut c_void;
        let event = self.bs.create_event(
            efi::EVT_TIMER | efi::EVT_NOTIFY_SIGNAL,
            efi::TPL_CALLBACK,
            Some(process_async_requests::<H, B>),
            context,
        )?;
        if let Err(e) = self.bs.set_timer_periodic(event, ASYNC_TIMER_PERIOD) {
            let _ = self.bs.close_event(event);
            return Err(e);
        }
        self.timer_event.set(Some(event));
        Ok(())
    }
}
