//! Format dispatch table.
//!
//! Each envelope format supplies one [`FormatOps`] implementation. A message
//! picks its table once (at pack or unpack time) and every accessor goes
//! through it, so call sites never branch on the format themselves.

use super::body::{get_u32, put_u32, swab_u32, swab_u64};
use super::{size_round, MAGIC_V1, MAGIC_V1_SWABBED, MAGIC_V2, MAGIC_V2_SWABBED};
use crate::error::{Error, Result};

/// On-wire envelope format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgFormat {
    /// Fixed header, no body sub-buffer.
    Legacy,
    /// Self-describing header with the envelope body as buffer 0.
    SelfDescribing,
}

impl MsgFormat {
    /// Format-specific operations.
    pub(crate) fn ops(self) -> &'static dyn FormatOps {
        match self {
            MsgFormat::Legacy => &LegacyOps,
            MsgFormat::SelfDescribing => &SelfDescribingOps,
        }
    }

    /// Host-order magic for this format.
    pub fn magic(self) -> u32 {
        self.ops().magic()
    }
}

/// Parsed magic: which format, and whether the sender's byte order differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Magic {
    pub format: MsgFormat,
    pub swabbed: bool,
}

impl Magic {
    pub fn parse(raw: u32) -> Result<Self> {
        let (format, swabbed) = match raw {
            MAGIC_V2 => (MsgFormat::SelfDescribing, false),
            MAGIC_V2_SWABBED => (MsgFormat::SelfDescribing, true),
            MAGIC_V1 => (MsgFormat::Legacy, false),
            MAGIC_V1_SWABBED => (MsgFormat::Legacy, true),
            magic => return Err(Error::BadMagic { magic }),
        };
        Ok(Self { format, swabbed })
    }
}

// =============================================================================
// Header layouts
// =============================================================================

/// Self-describing header offsets.
pub(crate) mod v2 {
    pub const MAGIC: usize = 0;
    pub const BUFCOUNT: usize = 4;
    pub const SECFLVR: usize = 8;
    pub const REPSIZE: usize = 12;
    pub const CKSUM: usize = 16;
    pub const PADDING: [usize; 3] = [20, 24, 28];
    pub const BUFLENS: usize = 32;
}

/// Legacy header offsets.
pub(crate) mod v1 {
    pub const MAGIC: usize = 0;
    pub const TYPE: usize = 4;
    pub const VERSION: usize = 8;
    pub const OPC: usize = 12;
    pub const HANDLE: usize = 16;
    pub const LAST_XID: usize = 32;
    pub const LAST_COMMITTED: usize = 40;
    pub const TRANSNO: usize = 48;
    pub const STATUS: usize = 56;
    pub const FLAGS: usize = 60;
    pub const CONN_CNT: usize = 64;
    pub const BUFCOUNT: usize = 68;
    pub const BUFLENS: usize = 72;
}

// =============================================================================
// Dispatch table
// =============================================================================

/// Format-specific sizing, indexing and header swabbing.
pub(crate) trait FormatOps: Send + Sync {
    fn format(&self) -> MsgFormat;

    fn magic(&self) -> u32;

    /// Offset of the buffer count word.
    fn bufcount_offset(&self) -> usize;

    /// Offset of the buffer length table.
    fn buflens_offset(&self) -> usize;

    /// Map a logical buffer index to its slot in the length table.
    fn physical_index(&self, logical: usize) -> Option<usize>;

    /// Byte-swap every fixed header field except the magic.
    fn swab_header(&self, buf: &mut [u8]);

    /// Number of logical buffers described by `physical` length-table slots.
    fn logical_count(&self, physical: usize) -> usize;

    /// Length-table entries for the logical lengths `lens`.
    fn physical_lens<'a>(&self, lens: &'a [u32]) -> &'a [u32];

    /// Header size including the rounded length table.
    fn hdr_size(&self, physical_count: usize) -> usize {
        size_round(self.buflens_offset() + 4 * physical_count)
    }

    /// Envelope size for logical lengths `lens`.
    fn msg_size(&self, lens: &[u32]) -> usize {
        let phys = self.physical_lens(lens);
        self.hdr_size(phys.len())
            + phys
                .iter()
                .map(|len| size_round(*len as usize))
                .sum::<usize>()
    }

    /// Write magic and buffer count.
    fn init_header(&self, buf: &mut [u8], physical_count: usize) {
        put_u32(buf, 0, self.magic());
        put_u32(buf, self.bufcount_offset(), physical_count as u32);
    }

    fn bufcount(&self, buf: &[u8]) -> usize {
        get_u32(buf, self.bufcount_offset()) as usize
    }
}

pub(crate) struct SelfDescribingOps;

impl FormatOps for SelfDescribingOps {
    fn format(&self) -> MsgFormat {
        MsgFormat::SelfDescribing
    }

    fn magic(&self) -> u32 {
        MAGIC_V2
    }

    fn bufcount_offset(&self) -> usize {
        v2::BUFCOUNT
    }

    fn buflens_offset(&self) -> usize {
        v2::BUFLENS
    }

    fn physical_index(&self, logical: usize) -> Option<usize> {
        Some(logical)
    }

    fn swab_header(&self, buf: &mut [u8]) {
        for at in [v2::BUFCOUNT, v2::SECFLVR, v2::REPSIZE, v2::CKSUM] {
            swab_u32(buf, at);
        }
        for at in v2::PADDING {
            swab_u32(buf, at);
        }
    }

    fn logical_count(&self, physical: usize) -> usize {
        physical
    }

    fn physical_lens<'a>(&self, lens: &'a [u32]) -> &'a [u32] {
        lens
    }
}

pub(crate) struct LegacyOps;

impl FormatOps for LegacyOps {
    fn format(&self) -> MsgFormat {
        MsgFormat::Legacy
    }

    fn magic(&self) -> u32 {
        MAGIC_V1
    }

    fn bufcount_offset(&self) -> usize {
        v1::BUFCOUNT
    }

    fn buflens_offset(&self) -> usize {
        v1::BUFLENS
    }

    fn physical_index(&self, logical: usize) -> Option<usize> {
        logical.checked_sub(1)
    }

    fn swab_header(&self, buf: &mut [u8]) {
        for at in [v1::TYPE, v1::VERSION, v1::OPC] {
            swab_u32(buf, at);
        }
        for at in [
            v1::HANDLE,
            v1::HANDLE + 8,
            v1::LAST_XID,
            v1::LAST_COMMITTED,
            v1::TRANSNO,
        ] {
            swab_u64(buf, at);
        }
        for at in [v1::STATUS, v1::FLAGS, v1::CONN_CNT, v1::BUFCOUNT] {
            swab_u32(buf, at);
        }
    }

    fn logical_count(&self, physical: usize) -> usize {
        physical + 1
    }

    fn physical_lens<'a>(&self, lens: &'a [u32]) -> &'a [u32] {
        lens.get(1..).unwrap_or(&[])
    }
}
