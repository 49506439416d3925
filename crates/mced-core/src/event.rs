//! Kernel MCE record format and the normalized event derived from it.
//!
//! The kernel hands out fixed-size binary records through `/dev/mcelog`. Each
//! record is converted into exactly one [`NormalizedEvent`], which is what the
//! rest of the daemon (event store, rule engine, clients) sees.
//!
//! # Wire Format
//!
//! The classic `struct mce` layout, native endian:
//!
//! ```text
//! +--------+--------+--------+-----------+--------+--------+--------+--------+
//! | status | misc   | addr   | mcgstatus | rip    | tsc    | res1   | res2   |  8 x u64
//! +--------+--------+--------+-----------+--------+--------+--------+--------+
//! | cs (u8) | bank (u8) | cpu (u8) | finished (u8) | pad (u32)                |
//! +---------+-----------+----------+---------------+--------------------------+
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size in bytes of one kernel record.
pub const KERNEL_RECORD_LEN: usize = 72;

/// `MCi_STATUS` overflow bit: the bank dropped an error before this one was
/// logged.
pub const MCI_STATUS_OVER: u64 = 1 << 62;

/// Error decoding a kernel record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordDecodeError {
    /// The buffer does not hold a whole record.
    #[error("short kernel record: {len} bytes, need {KERNEL_RECORD_LEN}")]
    Short {
        /// Bytes available.
        len: usize,
    },
}

/// One raw record as delivered by the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelRecord {
    pub status: u64,
    pub misc: u64,
    pub addr: u64,
    pub mcgstatus: u64,
    pub rip: u64,
    pub tsc: u64,
    pub res1: u64,
    pub res2: u64,
    pub cs: u8,
    pub bank: u8,
    pub cpu: u8,
    pub finished: u8,
}

impl KernelRecord {
    /// Decode one record from the front of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, RecordDecodeError> {
        if buf.len() < KERNEL_RECORD_LEN {
            return Err(RecordDecodeError::Short { len: buf.len() });
        }
        let word = |i: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[i * 8..i * 8 + 8]);
            u64::from_ne_bytes(bytes)
        };
        Ok(Self {
            status: word(0),
            misc: word(1),
            addr: word(2),
            mcgstatus: word(3),
            rip: word(4),
            tsc: word(5),
            res1: word(6),
            res2: word(7),
            cs: buf[64],
            bank: buf[65],
            cpu: buf[66],
            finished: buf[67],
        })
    }

    /// Encode into the kernel layout. Used to feed fake devices.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; KERNEL_RECORD_LEN] {
        let mut out = [0u8; KERNEL_RECORD_LEN];
        let words = [
            self.status,
            self.misc,
            self.addr,
            self.mcgstatus,
            self.rip,
            self.tsc,
            self.res1,
            self.res2,
        ];
        for (i, w) in words.iter().enumerate() {
            out[i * 8..i * 8 + 8].copy_from_slice(&w.to_ne_bytes());
        }
        out[64] = self.cs;
        out[65] = self.bank;
        out[66] = self.cpu;
        out[67] = self.finished;
        out
    }

    /// Decode every whole record in `buf`. Trailing partial bytes are ignored.
    #[must_use]
    pub fn decode_all(buf: &[u8]) -> Vec<Self> {
        buf.chunks_exact(KERNEL_RECORD_LEN)
            .filter_map(|chunk| Self::decode(chunk).ok())
            .collect()
    }
}

/// A hardware error record in the daemon's own representation.
///
/// Immutable once created; exactly one is derived per kernel record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// Boot-session identifier configured at startup.
    pub boot: i64,
    /// Hardware bank index.
    pub bank: u8,
    /// Raw `MCi_STATUS` bitfield.
    pub status: u64,
    /// Faulting address.
    pub address: u64,
    /// `MCi_MISC` bitfield.
    pub misc: u64,
    /// Global `MCG_STATUS`.
    pub gstatus: u64,
    /// Time stamp counter.
    pub tsc: u64,
    /// Wall-clock capture time, microseconds since the Unix epoch.
    pub time_us: i64,
    /// Logical CPU index.
    pub cpu: u8,
    /// Code segment selector.
    pub cs: u8,
    /// Instruction pointer.
    pub ip: u64,
}

impl NormalizedEvent {
    /// Pure conversion from the kernel record.
    #[must_use]
    pub const fn from_kernel(record: &KernelRecord, boot: i64, captured_at_us: i64) -> Self {
        Self {
            boot,
            bank: record.bank,
            status: record.status,
            address: record.addr,
            misc: record.misc,
            gstatus: record.mcgstatus,
            tsc: record.tsc,
            time_us: captured_at_us,
            cpu: record.cpu,
            cs: record.cs,
            ip: record.rip,
        }
    }

    /// Convert, stamping the current wall-clock time.
    #[must_use]
    pub fn capture(record: &KernelRecord, boot: i64) -> Self {
        Self::from_kernel(record, boot, chrono::Utc::now().timestamp_micros())
    }

    /// Whether the bank reported that it overflowed before this record.
    #[must_use]
    pub const fn hardware_overflow(&self) -> bool {
        self.status & MCI_STATUS_OVER != 0
    }
}

impl std::fmt::Display for NormalizedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {:#018x} {:#018x} {:#018x} {:#018x} {} {} {} {:#04x} {:#018x}",
            self.boot,
            self.bank,
            self.status,
            self.address,
            self.misc,
            self.gstatus,
            self.tsc,
            self.time_us,
            self.cpu,
            self.cs,
            self.ip
        )
    }
}
