//! Envelope body: buffer 0 of every self-describing message.

/// Size of the encoded envelope body.
pub const BODY_SIZE: usize = 96;

// Field offsets inside the encoded body.
pub(crate) mod off {
    pub const OPC: usize = 0;
    pub const VERSION: usize = 4;
    pub const TYPE: usize = 8;
    pub const STATUS: usize = 12;
    pub const LAST_XID: usize = 16;
    pub const LAST_SEEN: usize = 24;
    pub const LAST_COMMITTED: usize = 32;
    pub const TRANSNO: usize = 40;
    pub const FLAGS: usize = 48;
    pub const OP_FLAGS: usize = 52;
    pub const CONN_CNT: usize = 56;
    pub const TIMEOUT: usize = 60;
    pub const SERVICE_TIME: usize = 64;
    pub const SLV: usize = 68;
    pub const LIMIT: usize = 76;
    pub const HANDLE: usize = 80;
}

const U32_FIELDS: [usize; 10] = [
    off::OPC,
    off::VERSION,
    off::TYPE,
    off::STATUS,
    off::FLAGS,
    off::OP_FLAGS,
    off::CONN_CNT,
    off::TIMEOUT,
    off::SERVICE_TIME,
    off::LIMIT,
];

const U64_FIELDS: [usize; 7] = [
    off::LAST_XID,
    off::LAST_SEEN,
    off::LAST_COMMITTED,
    off::TRANSNO,
    off::SLV,
    off::HANDLE,
    off::HANDLE + 8,
];

// =============================================================================
// Native-order field access
// =============================================================================

#[inline]
pub(crate) fn get_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_ne_bytes(raw)
}

#[inline]
pub(crate) fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_ne_bytes());
}

#[inline]
pub(crate) fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_ne_bytes(raw)
}

#[inline]
pub(crate) fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_ne_bytes());
}

#[inline]
pub(crate) fn swab_u32(buf: &mut [u8], at: usize) {
    buf[at..at + 4].reverse();
}

#[inline]
pub(crate) fn swab_u64(buf: &mut [u8], at: usize) {
    buf[at..at + 8].reverse();
}

/// Byte-swap every body field in place.
pub(crate) fn swab_body(buf: &mut [u8]) {
    for at in U32_FIELDS {
        swab_u32(buf, at);
    }
    for at in U64_FIELDS {
        swab_u64(buf, at);
    }
}

// =============================================================================
// Typed body
// =============================================================================

/// Decoded envelope body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageBody {
    pub opc: u32,
    pub version: u32,
    pub msg_type: u32,
    pub status: i32,
    pub last_xid: u64,
    pub last_seen: u64,
    pub last_committed: u64,
    pub transno: u64,
    pub flags: u32,
    pub op_flags: u32,
    pub conn_cnt: u32,
    pub timeout: u32,
    pub service_time: u32,
    pub slv: u64,
    pub limit: u32,
    /// Opaque correlation handle.
    pub handle: [u64; 2],
}

impl MessageBody {
    /// Decode from host-order bytes.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`BODY_SIZE`].
    pub fn decode(buf: &[u8]) -> Self {
        assert!(buf.len() >= BODY_SIZE, "short envelope body");
        Self {
            opc: get_u32(buf, off::OPC),
            version: get_u32(buf, off::VERSION),
            msg_type: get_u32(buf, off::TYPE),
            status: get_u32(buf, off::STATUS) as i32,
            last_xid: get_u64(buf, off::LAST_XID),
            last_seen: get_u64(buf, off::LAST_SEEN),
            last_committed: get_u64(buf, off::LAST_COMMITTED),
            transno: get_u64(buf, off::TRANSNO),
            flags: get_u32(buf, off::FLAGS),
            op_flags: get_u32(buf, off::OP_FLAGS),
            conn_cnt: get_u32(buf, off::CONN_CNT),
            timeout: get_u32(buf, off::TIMEOUT),
            service_time: get_u32(buf, off::SERVICE_TIME),
            slv: get_u64(buf, off::SLV),
            limit: get_u32(buf, off::LIMIT),
            handle: [get_u64(buf, off::HANDLE), get_u64(buf, off::HANDLE + 8)],
        }
    }

    /// Encode in host order.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`BODY_SIZE`].
    pub fn encode(&self, buf: &mut [u8]) {
        assert!(buf.len() >= BODY_SIZE, "short envelope body");
        put_u32(buf, off::OPC, self.opc);
        put_u32(buf, off::VERSION, self.version);
        put_u32(buf, off::TYPE, self.msg_type);
        put_u32(buf, off::STATUS, self.status as u32);
        put_u64(buf, off::LAST_XID, self.last_xid);
        put_u64(buf, off::LAST_SEEN, self.last_seen);
        put_u64(buf, off::LAST_COMMITTED, self.last_committed);
        put_u64(buf, off::TRANSNO, self.transno);
        put_u32(buf, off::FLAGS, self.flags);
        put_u32(buf, off::OP_FLAGS, self.op_flags);
        put_u32(buf, off::CONN_CNT, self.conn_cnt);
        put_u32(buf, off::TIMEOUT, self.timeout);
        put_u32(buf, off::SERVICE_TIME, self.service_time);
        put_u64(buf, off::SLV, self.slv);
        put_u32(buf, off::LIMIT, self.limit);
        put_u64(buf, off::HANDLE, self.handle[0]);
        put_u64(buf, off::HANDLE + 8, self.handle[1]);
    }
}
