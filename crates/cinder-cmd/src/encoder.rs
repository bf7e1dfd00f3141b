//! # Command Encoder
//!
//! Encode hardware operations into dword streams and decode them back.
//!
//! Every packet is a header dword followed by its payload:
//!
//! ```text
//! ┌────────────────┬────────────────┐
//! │ opcode (16)    │ payload dwords │   header
//! ├────────────────┴────────────────┤
//! │ payload[0]                      │
//! │ ...                             │
//! └─────────────────────────────────┘
//! ```
//!
//! The format is generation-agnostic; a hardware backend translates it.

use alloc::vec::Vec;

use cinder_core::{Error, GpuAddr, Result};

use crate::stream::LinearStream;

// =============================================================================
// OPCODES
// =============================================================================

const OP_NOOP: u16 = 0x0000;
const OP_PIPE_CONTROL: u16 = 0x0001;
const OP_BATCH_BUFFER_START: u16 = 0x0002;
const OP_BATCH_BUFFER_END: u16 = 0x0003;
const OP_STATE_BASE_ADDRESS: u16 = 0x0004;
const OP_PREEMPTION_STATE: u16 = 0x0005;
const OP_L3_CONFIG: u16 = 0x0006;
const OP_PIPELINE_SELECT: u16 = 0x0007;
const OP_COHERENCY_MODE: u16 = 0x0008;
const OP_SEMAPHORE_WAIT: u16 = 0x0009;
const OP_WALKER: u16 = 0x000A;

bitflags::bitflags! {
    /// Pipe control behavior
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PipeControlFlags: u32 {
        /// Stall the command streamer until prior work retires
        const CS_STALL = 1 << 0;
        /// Flush the data cache
        const DC_FLUSH = 1 << 1;
        /// Write `data` to `address` once prior work retires
        const POST_SYNC_WRITE = 1 << 2;
        /// Invalidate state caches
        const STATE_INVALIDATE = 1 << 3;
    }
}

// =============================================================================
// HARDWARE COMMANDS
// =============================================================================

/// A decoded hardware operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwCommand {
    /// Padding
    Noop,
    /// Synchronization point with optional post-sync write
    PipeControl {
        /// Behavior
        flags: PipeControlFlags,
        /// Post-sync target
        address: GpuAddr,
        /// Post-sync value
        data: u32,
    },
    /// Jump into a second-level batch
    BatchBufferStart {
        /// Batch start
        address: GpuAddr,
        /// Batch length in bytes
        length: u32,
    },
    /// Return from a second-level batch
    BatchBufferEnd,
    /// Heap base addresses
    StateBaseAddress {
        /// Dynamic state base
        dsh: GpuAddr,
        /// Indirect object base
        ioh: GpuAddr,
        /// Surface state base
        ssh: GpuAddr,
        /// Limit general state to a 32-bit range
        gsba_32bit: bool,
    },
    /// Preemption granularity
    PreemptionState {
        /// Mode value
        mode: u32,
    },
    /// Cache partitioning
    L3Config {
        /// Reserve shared local memory
        slm_enabled: bool,
    },
    /// Pipeline selection
    PipelineSelect {
        /// Media sampler power state
        media_sampler: bool,
    },
    /// Memory coherency between host and device
    CoherencyMode {
        /// Coherent accesses required
        enabled: bool,
    },
    /// Wait until the dword at `address` reaches `value`
    SemaphoreWait {
        /// Polled address
        address: GpuAddr,
        /// Target value
        value: u32,
    },
    /// Compute dispatch
    Walker {
        /// Kernel identity
        kernel: u32,
        /// Interface descriptor offset in the dynamic state heap
        descriptor_offset: u32,
        /// Cross-thread data offset in the indirect object heap
        payload_offset: u32,
        /// Work group counts
        groups: [u32; 3],
    },
}

impl HwCommand {
    /// Encoded size in bytes
    pub const fn size(&self) -> usize {
        (1 + self.payload_dwords()) * 4
    }

    const fn payload_dwords(&self) -> usize {
        match self {
            HwCommand::Noop | HwCommand::BatchBufferEnd => 0,
            HwCommand::PipeControl { .. } => 4,
            HwCommand::BatchBufferStart { .. } => 3,
            HwCommand::StateBaseAddress { .. } => 7,
            HwCommand::PreemptionState { .. }
            | HwCommand::L3Config { .. }
            | HwCommand::PipelineSelect { .. }
            | HwCommand::CoherencyMode { .. } => 1,
            HwCommand::SemaphoreWait { .. } => 3,
            HwCommand::Walker { .. } => 6,
        }
    }

    const fn opcode(&self) -> u16 {
        match self {
            HwCommand::Noop => OP_NOOP,
            HwCommand::PipeControl { .. } => OP_PIPE_CONTROL,
            HwCommand::BatchBufferStart { .. } => OP_BATCH_BUFFER_START,
            HwCommand::BatchBufferEnd => OP_BATCH_BUFFER_END,
            HwCommand::StateBaseAddress { .. } => OP_STATE_BASE_ADDRESS,
            HwCommand::PreemptionState { .. } => OP_PREEMPTION_STATE,
            HwCommand::L3Config { .. } => OP_L3_CONFIG,
            HwCommand::PipelineSelect { .. } => OP_PIPELINE_SELECT,
            HwCommand::CoherencyMode { .. } => OP_COHERENCY_MODE,
            HwCommand::SemaphoreWait { .. } => OP_SEMAPHORE_WAIT,
            HwCommand::Walker { .. } => OP_WALKER,
        }
    }

    /// Append the encoded packet to `stream`
    pub fn encode(&self, stream: &mut LinearStream) -> Result<()> {
        if stream.available() < self.size() {
            return Err(Error::CommandBufferFull);
        }

        stream.emit_dword(((self.opcode() as u32) << 16) | self.payload_dwords() as u32)?;
        match *self {
            HwCommand::Noop | HwCommand::BatchBufferEnd => {}
            HwCommand::PipeControl { flags, address, data } => {
                stream.emit_dword(flags.bits())?;
                emit_addr(stream, address)?;
                stream.emit_dword(data)?;
            }
            HwCommand::BatchBufferStart { address, length } => {
                emit_addr(stream, address)?;
                stream.emit_dword(length)?;
            }
            HwCommand::StateBaseAddress { dsh, ioh, ssh, gsba_32bit } => {
                emit_addr(stream, dsh)?;
                emit_addr(stream, ioh)?;
                emit_addr(stream, ssh)?;
                stream.emit_dword(gsba_32bit as u32)?;
            }
            HwCommand::PreemptionState { mode } => stream.emit_dword(mode)?,
            HwCommand::L3Config { slm_enabled } => stream.emit_dword(slm_enabled as u32)?,
            HwCommand::PipelineSelect { media_sampler } => stream.emit_dword(media_sampler as u32)?,
            HwCommand::CoherencyMode { enabled } => stream.emit_dword(enabled as u32)?,
            HwCommand::SemaphoreWait { address, value } => {
                emit_addr(stream, address)?;
                stream.emit_dword(value)?;
            }
            HwCommand::Walker { kernel, descriptor_offset, payload_offset, groups } => {
                stream.emit_dword(kernel)?;
                stream.emit_dword(descriptor_offset)?;
                stream.emit_dword(payload_offset)?;
                for count in groups {
                    stream.emit_dword(count)?;
                }
            }
        }
        Ok(())
    }
}

fn emit_addr(stream: &mut LinearStream, addr: GpuAddr) -> Result<()> {
    stream.emit_dword(addr.low())?;
    stream.emit_dword(addr.high())
}

// =============================================================================
// DECODER
// =============================================================================

/// Decode every packet in `bytes`
pub fn decode(bytes: &[u8]) -> Result<Vec<HwCommand>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::InvalidParameter);
    }

    let dwords: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let mut commands = Vec::new();
    let mut pos = 0;
    while pos < dwords.len() {
        let header = dwords[pos];
        let opcode = (header >> 16) as u16;
        let len = (header & 0xFFFF) as usize;
        let payload = dwords.get(pos + 1..pos + 1 + len).ok_or(Error::InvalidParameter)?;
        commands.push(decode_packet(opcode, payload)?);
        pos += 1 + len;
    }
    Ok(commands)
}

fn decode_packet(opcode: u16, p: &[u32]) -> Result<HwCommand> {
    let addr = |i: usize| GpuAddr::new(p[i] as u64 | ((p[i + 1] as u64) << 32));
    let arity = |n: usize| if p.len() == n { Ok(()) } else { Err(Error::InvalidParameter) };

    let cmd = match opcode {
        OP_NOOP => {
            arity(0)?;
            HwCommand::Noop
        }
        OP_PIPE_CONTROL => {
            arity(4)?;
            HwCommand::PipeControl {
                flags: PipeControlFlags::from_bits_truncate(p[0]),
                address: addr(1),
                data: p[3],
            }
        }
        OP_BATCH_BUFFER_START => {
            arity(3)?;
            HwCommand::BatchBufferStart { address: addr(0), length: p[2] }
        }
        OP_BATCH_BUFFER_END => {
            arity(0)?;
            HwCommand::BatchBufferEnd
        }
        OP_STATE_BASE_ADDRESS => {
            arity(7)?;
            HwCommand::StateBaseAddress {
                dsh: addr(0),
                ioh: addr(2),
                ssh: addr(4),
                gsba_32bit: p[6] != 0,
            }
        }
        OP_PREEMPTION_STATE => {
            arity(1)?;
            HwCommand::PreemptionState { mode: p[0] }
        }
        OP_L3_CONFIG => {
            arity(1)?;
            HwCommand::L3Config { slm_enabled: p[0] != 0 }
        }
        OP_PIPELINE_SELECT => {
            arity(1)?;
            HwCommand::PipelineSelect { media_sampler: p[0] != 0 }
        }
        OP_COHERENCY_MODE => {
            arity(1)?;
            HwCommand::CoherencyMode { enabled: p[0] != 0 }
        }
        OP_SEMAPHORE_WAIT => {
            arity(3)?;
            HwCommand::SemaphoreWait { address: addr(0), value: p[2] }
        }
        OP_WALKER => {
            arity(6)?;
            HwCommand::Walker {
                kernel: p[0],
                descriptor_offset: p[1],
                payload_offset: p[2],
                groups: [p[3], p[4], p[5]],
            }
        }
        _ => return Err(Error::InvalidParameter),
    };
    Ok(cmd)
}
