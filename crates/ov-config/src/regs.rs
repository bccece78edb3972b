//! The hardware's 16-bit configuration register map (§6 "Configuration
//! register map (subset)").

/// System clock synthesiser setpoint.
pub const SYSCLK: u16 = 0x0000;
/// Trace enable flags (bit 0 READS, bit 1 WRITES).
pub const TRACEFLAGS: u16 = 0x0001;
/// Power/reset control flags.
pub const POWERFLAGS: u16 = 0x0002;

/// `TRACEFLAGS` bit 0: include read events in the trace stream.
pub const TRACEFLAG_READS: u16 = 1 << 0;
/// `TRACEFLAGS` bit 1: include write events in the trace stream.
pub const TRACEFLAG_WRITES: u16 = 1 << 1;

/// `POWERFLAGS` bit 0: hold the target's CPU(s) in reset.
pub const POWERFLAG_RESET: u16 = 1 << 0;
/// `POWERFLAGS` bit 1: assert the target's power button line.
pub const POWERFLAG_POWERBTN: u16 = 1 << 1;
/// `POWERFLAGS` bit 2: enable the target's battery power supply.
pub const POWERFLAG_BATT: u16 = 1 << 2;

/// CAM block match-address register, low 16 bits (written per block).
pub const CAM_ADDR_LOW: u16 = 0x7000;
/// CAM block match-address register, high 16 bits.
pub const CAM_ADDR_HIGH: u16 = 0x7001;
/// CAM block mask register, low 16 bits.
pub const CAM_MASK_LOW: u16 = 0x7002;
/// CAM block mask register, high 16 bits.
pub const CAM_MASK_HIGH: u16 = 0x7003;
/// CAM slot index: writing this commits the four preceding CAM registers
/// into slot `i`. Must be written last for a given block.
pub const CAM_INDEX: u16 = 0x7004;

/// Base of the per-block content-memory word-offset table
/// (`PATCH_OFFSETS + i` for block `i`).
pub const PATCH_OFFSETS: u16 = 0x7800;
/// Base of the shared content-memory word array (`PATCH_CONTENT +
/// word_index`).
pub const PATCH_CONTENT: u16 = 0x8000;
