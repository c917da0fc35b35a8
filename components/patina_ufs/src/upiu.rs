//! UFS Protocol Information Unit (UPIU) wire formats and the PRDT scatter list.
//!
//! Layouts are bit-exact per JESD220 (UFS 2.x). Multi-byte fields the device
//! interprets as wire integers are big-endian on the wire and are converted
//! through the shared `get_be*`/`put_be*` primitives, never ad hoc per field.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use bitfield_struct::bitfield;

/// NOP OUT transaction code.
pub const UPIU_TYPE_NOP_OUT: u8 = 0x00;
/// COMMAND transaction code.
pub const UPIU_TYPE_COMMAND: u8 = 0x01;
/// QUERY REQUEST transaction code.
pub const UPIU_TYPE_QUERY_REQUEST: u8 = 0x16;
/// NOP IN transaction code.
pub const UPIU_TYPE_NOP_IN: u8 = 0x20;
/// RESPONSE transaction code.
pub const UPIU_TYPE_RESPONSE: u8 = 0x21;
/// QUERY RESPONSE transaction code.
pub const UPIU_TYPE_QUERY_RESPONSE: u8 = 0x36;

/// Flags byte: ordered task attribute. Fixed for every command this driver issues.
pub const UPIU_FLAG_ATTR_ORDERED: u8 = 0x01;
/// Flags byte: expected data transfer from target to initiator.
pub const UPIU_FLAG_READ: u8 = 0x40;
/// Flags byte: expected data transfer from initiator to target.
pub const UPIU_FLAG_WRITE: u8 = 0x20;
/// Response flags byte: underflow, residual transfer count is valid.
pub const UPIU_FLAG_UNDERFLOW: u8 = 0x20;

/// Query function: standard read request.
pub const QUERY_FUNC_STANDARD_READ: u8 = 0x01;
/// Query function: standard write request.
pub const QUERY_FUNC_STANDARD_WRITE: u8 = 0x81;

/// Query response code: success.
pub const QUERY_RESP_SUCCESS: u8 = 0x00;
/// Query response code: invalid selector.
pub const QUERY_RESP_INVALID_SELECTOR: u8 = 0xFB;
/// Query response code: invalid index.
pub const QUERY_RESP_INVALID_INDEX: u8 = 0xFC;
/// Query response code: invalid identifier.
pub const QUERY_RESP_INVALID_IDN: u8 = 0xFD;

/// Size of every fixed UPIU header used by this driver.
pub const UPIU_HEADER_SIZE: usize = 32;

/// Maximum data bytes one PRDT entry can describe.
pub const PRDT_MAX_ENTRY_BYTES: usize = 0x40000;

/// Size of one PRDT entry.
pub const PRDT_ENTRY_SIZE: usize = 16;

/// Query request opcodes carried in the transaction specific fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueryOpcode {
    /// No operation.
    Nop = 0x00,
    /// Read a descriptor.
    ReadDescriptor = 0x01,
    /// Write a descriptor.
    WriteDescriptor = 0x02,
    /// Read an attribute.
    ReadAttribute = 0x03,
    /// Write an attribute.
    WriteAttribute = 0x04,
    /// Read a flag.
    ReadFlag = 0x05,
    /// Set a flag.
    SetFlag = 0x06,
    /// Clear a flag.
    ClearFlag = 0x07,
    /// Toggle a flag.
    ToggleFlag = 0x08,
}

impl QueryOpcode {
    /// Whether the opcode is a write-direction query function.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            QueryOpcode::WriteDescriptor
                | QueryOpcode::WriteAttribute
                | QueryOpcode::SetFlag
                | QueryOpcode::ClearFlag
                | QueryOpcode::ToggleFlag
        )
    }
}

/// Rounds a byte length up to the 8-byte granularity used between command
/// descriptor regions.
pub(crate) const fn round_up8(value: usize) -> usize {
    (value + 7) & !7
}

pub(crate) fn put_be16(dst: &mut [u8; 2], value: u16) {
    *dst = value.to_be_bytes();
}

pub(crate) fn put_be32(dst: &mut [u8; 4], value: u32) {
    *dst = value.to_be_bytes();
}

pub(crate) fn get_be16(src: &[u8; 2]) -> u16 {
    u16::from_be_bytes(*src)
}

pub(crate) fn get_be32(src: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*src)
}

fn zeroed<T>() -> T {
    // SAFETY: only used for repr(C) wire structs composed entirely of integer bytes.
    unsafe { core::mem::zeroed() }
}

/// Data direction of a SCSI command, as seen from the initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataDirection {
    /// Data flows from the device to the host.
    Read = 0,
    /// Data flows from the host to the device.
    Write = 1,
    /// Bidirectional transfers; not supported by the UFS transport.
    Bidirectional = 2,
}

/// COMMAND UPIU carrying a SCSI CDB.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CommandUpiu {
    /// Transaction code.
    pub trans_type: u8,
    /// R/W direction and the fixed ordered task attribute.
    pub flags: u8,
    /// Native 8-bit UFS LUN.
    pub lun: u8,
    /// Task tag.
    pub task_tag: u8,
    /// Command set type (0 for SCSI).
    pub cmd_set: u8,
    rsvd0: [u8; 3],
    /// Total EHS length.
    pub ehs_len: u8,
    rsvd1: u8,
    /// Data segment length, big-endian. Always zero for COMMAND UPIUs.
    pub data_seg_len: [u8; 2],
    /// Expected data transfer length, big-endian.
    pub exp_data_len: [u8; 4],
    /// SCSI CDB, zero-padded to 16 bytes.
    pub cdb: [u8; 16],
}

impl CommandUpiu {
    /// Builds a COMMAND UPIU. `cdb` must already be validated to 6/10/12/16 bytes.
    pub fn new(lun: u8, task_tag: u8, cdb: &[u8], direction: DataDirection, expected_transfer_len: u32) -> Self {
        let mut upiu: Self = zeroed();
        upiu.trans_type = UPIU_TYPE_COMMAND;
        upiu.flags = UPIU_FLAG_ATTR_ORDERED
            | match direction {
                DataDirection::Read => UPIU_FLAG_READ,
                DataDirection::Write => UPIU_FLAG_WRITE,
                DataDirection::Bidirectional => 0,
            };
        upiu.lun = lun;
        upiu.task_tag = task_tag;
        put_be32(&mut upiu.exp_data_len, expected_transfer_len);
        upiu.cdb[..cdb.len()].copy_from_slice(cdb);
        upiu
    }
}

/// Transaction specific fields of a QUERY REQUEST/RESPONSE UPIU.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct QueryTsf {
    /// Query opcode.
    pub opcode: u8,
    /// Descriptor/flag/attribute identifier.
    pub idn: u8,
    /// Index.
    pub index: u8,
    /// Selector.
    pub selector: u8,
    rsvd0: [u8; 2],
    /// Descriptor length, big-endian. Valid for descriptor opcodes only.
    pub length: [u8; 2],
    /// Attribute or flag value, big-endian.
    pub value: [u8; 4],
    rsvd1: [u8; 4],
}

/// QUERY REQUEST UPIU header. Descriptor-write payload follows the header.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct QueryRequestUpiu {
    /// Transaction code.
    pub trans_type: u8,
    /// Header flags. Unused for queries.
    pub flags: u8,
    rsvd0: u8,
    /// Task tag.
    pub task_tag: u8,
    rsvd1: u8,
    /// Query function: standard read or standard write.
    pub query_func: u8,
    rsvd2: [u8; 2],
    /// Total EHS length.
    pub ehs_len: u8,
    rsvd3: u8,
    /// Data segment length, big-endian. Nonzero only for descriptor writes.
    pub data_seg_len: [u8; 2],
    /// Transaction specific fields.
    pub tsf: QueryTsf,
    rsvd4: [u8; 4],
}

impl QueryRequestUpiu {
    /// Builds a QUERY REQUEST UPIU for the given opcode.
    ///
    /// `data_len` is the descriptor transfer length for descriptor opcodes and
    /// ignored otherwise; `value` is the attribute value for attribute writes.
    pub fn new(task_tag: u8, opcode: QueryOpcode, idn: u8, index: u8, selector: u8, data_len: u16, value: u32) -> Self {
        let mut upiu: Self = zeroed();
        upiu.trans_type = UPIU_TYPE_QUERY_REQUEST;
        upiu.task_tag = task_tag;
        upiu.query_func =
            if opcode.is_write() { QUERY_FUNC_STANDARD_WRITE } else { QUERY_FUNC_STANDARD_READ };
        upiu.tsf.opcode = opcode as u8;
        upiu.tsf.idn = idn;
        upiu.tsf.index = index;
        upiu.tsf.selector = selector;
        match opcode {
            QueryOpcode::ReadDescriptor => {
                put_be16(&mut upiu.tsf.length, data_len);
            }
            QueryOpcode::WriteDescriptor => {
                put_be16(&mut upiu.tsf.length, data_len);
                put_be16(&mut upiu.data_seg_len, data_len);
            }
            QueryOpcode::WriteAttribute => {
                put_be32(&mut upiu.tsf.value, value);
            }
            _ => {}
        }
        upiu
    }
}

/// QUERY RESPONSE UPIU header. Descriptor-read payload follows the header.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct QueryResponseUpiu {
    /// Transaction code.
    pub trans_type: u8,
    /// Header flags.
    pub flags: u8,
    rsvd0: u8,
    /// Task tag.
    pub task_tag: u8,
    rsvd1: u8,
    /// Query function echoed from the request.
    pub query_func: u8,
    /// Query response code.
    pub query_resp: u8,
    rsvd2: u8,
    /// Total EHS length.
    pub ehs_len: u8,
    /// Device information.
    pub device_info: u8,
    /// Data segment length, big-endian.
    pub data_seg_len: [u8; 2],
    /// Transaction specific fields.
    pub tsf: QueryTsf,
    rsvd3: [u8; 4],
}

impl QueryResponseUpiu {
    /// Length of the trailing data segment.
    pub fn data_segment_len(&self) -> u16 {
        get_be16(&self.data_seg_len)
    }

    /// Attribute or flag value from the transaction specific fields.
    pub fn value(&self) -> u32 {
        get_be32(&self.tsf.value)
    }
}

/// RESPONSE UPIU for a SCSI command. The sense data segment follows the header.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ResponseUpiu {
    /// Transaction code.
    pub trans_type: u8,
    /// Header flags; `UPIU_FLAG_UNDERFLOW` qualifies the residual count.
    pub flags: u8,
    /// LUN echoed from the command.
    pub lun: u8,
    /// Task tag echoed from the command.
    pub task_tag: u8,
    /// Command set type.
    pub cmd_set: u8,
    rsvd0: u8,
    /// UTP-level response code. Zero means the target executed the command.
    pub response: u8,
    /// SCSI status byte.
    pub status: u8,
    /// Total EHS length.
    pub ehs_len: u8,
    /// Device information.
    pub device_info: u8,
    /// Data segment length, big-endian.
    pub data_seg_len: [u8; 2],
    /// Residual transfer count, big-endian.
    pub residual: [u8; 4],
    rsvd1: [u8; 16],
}

impl ResponseUpiu {
    /// Residual transfer count reported by the device.
    pub fn residual_count(&self) -> u32 {
        get_be32(&self.residual)
    }
}

/// NOP OUT UPIU.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NopOutUpiu {
    /// Transaction code.
    pub trans_type: u8,
    /// Header flags.
    pub flags: u8,
    rsvd0: [u8; 2],
    rsvd1: [u8; 16],
    rsvd2: [u8; 12],
}

impl NopOutUpiu {
    /// Builds a NOP OUT UPIU.
    pub fn new(task_tag: u8) -> Self {
        let mut upiu: Self = zeroed();
        upiu.trans_type = UPIU_TYPE_NOP_OUT;
        upiu.rsvd0[1] = task_tag;
        upiu
    }
}

/// NOP IN UPIU.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NopInUpiu {
    /// Transaction code.
    pub trans_type: u8,
    /// Header flags.
    pub flags: u8,
    rsvd0: u8,
    /// Task tag echoed from the NOP OUT.
    pub task_tag: u8,
    rsvd1: [u8; 2],
    /// Response code. Zero means the transport layer is alive.
    pub response: u8,
    rsvd2: u8,
    rsvd3: [u8; 24],
}

/// PRDT entry word 0: data base address, DWORD aligned.
#[bitfield(u32)]
pub struct PrdtAddressLow {
    #[bits(2)]
    _rsvd: u8,
    /// Low physical address bits 31:2.
    #[bits(30)]
    pub dba: u32,
}

/// PRDT entry word 3: data byte count, stored as count minus one.
#[bitfield(u32)]
pub struct PrdtByteCount {
    /// Chunk byte count minus one.
    #[bits(18)]
    pub count: u32,
    #[bits(14)]
    _rsvd: u16,
}

/// One physical region description table entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrdtEntry {
    /// Low half of the physical address with the two alignment bits reserved.
    pub dba: u32,
    /// High half of the physical address.
    pub dbau: u32,
    rsvd: u32,
    /// Byte count minus one.
    pub dbc: u32,
}

/// Number of PRDT entries needed to cover `length` bytes.
pub fn prdt_entry_count(length: usize) -> usize {
    length.div_ceil(PRDT_MAX_ENTRY_BYTES)
}

/// Splits a mapped buffer into PRDT entries of at most [`PRDT_MAX_ENTRY_BYTES`] each.
///
/// `entries` must hold exactly [`prdt_entry_count`]`(length)` elements. The
/// device address must be DWORD aligned; the alignment fixup in the SCSI engine
/// guarantees this for every mapped data buffer.
pub fn fill_prdt(entries: &mut [PrdtEntry], device_address: u64, length: usize) {
    debug_assert_eq!(entries.len(), prdt_entry_count(length));
    debug_assert_eq!(device_address & 0x3, 0);

    let mut remaining = length;
    let mut address = device_address;
    for entry in entries.iter_mut() {
        let chunk = remaining.min(PRDT_MAX_ENTRY_BYTES);
        *entry = PrdtEntry {
            dba: PrdtAddressLow::new().with_dba((address as u32) >> 2).into_bits(),
            dbau: (address >> 32) as u32,
            rsvd: 0,
            dbc: PrdtByteCount::new().with_count((chunk - 1) as u32).into_bits(),
        };
        remaining -= chunk;
        address += chunk as u64;
    }
}
