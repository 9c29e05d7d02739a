//! Versioned envelope over a contiguous buffer.

use std::fmt;

use bytes::{Bytes, BytesMut};
use tracing::{debug, error};

use super::body::{get_u32, get_u64, off, put_u32, put_u64, swab_body, swab_u32, MessageBody};
use super::format::{v1, v2, FormatOps, Magic, MsgFormat};
use super::{
    size_round, BODY_SIZE, GEN_FLAG_MASK, MSG_VERSION, OP_FLAG_MASK, OP_FLAG_SHIFT, VERSION_MASK,
};
use crate::error::{Error, Result, EINVAL};

/// Where a typed field lives for the current format.
#[derive(Debug, Clone, Copy)]
enum Slot {
    At(usize),
    Absent,
}

/// A versioned RPC envelope.
///
/// Built either by [`WireMessage::pack`] (sender side) or by
/// [`WireMessage::unpack`] (receiver side). After unpack every field the
/// codec knows about is in host byte order; other sub-buffers are converted
/// on demand with [`WireMessage::swab_buffer`].
#[derive(Clone, Default)]
pub struct WireMessage {
    buf: BytesMut,
    format: Option<MsgFormat>,
    swabbed: bool,
    /// One bit per logical buffer already converted to host order.
    swabbed_bufs: Vec<u64>,
    packed: bool,
}

impl fmt::Debug for WireMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireMessage")
            .field("format", &self.format)
            .field("len", &self.buf.len())
            .field("bufcount", &self.bufcount())
            .field("swabbed", &self.swabbed)
            .field("packed", &self.packed)
            .finish()
    }
}

impl WireMessage {
    /// An uninitialized message; typed getters return sentinels or errors.
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Construction
    // =========================================================================

    /// An uninitialized message that keeps the allocation of `buf`.
    pub fn from_buffer(mut buf: BytesMut) -> Self {
        buf.clear();
        Self {
            buf,
            ..Self::default()
        }
    }

    /// Lay out a fresh envelope and copy `contents` into place.
    ///
    /// `lens` are logical buffer lengths; `lens[0]` is the envelope body.
    /// `contents[i]` (if present) is copied to the start of buffer `i`;
    /// legacy messages have no body, so `contents[0]` is ignored there.
    /// The protocol version is stamped; every other body field is zero
    /// unless `contents[0]` provides it.
    ///
    /// # Panics
    ///
    /// Panics if `lens[0]` is not [`BODY_SIZE`] or a content slice is longer
    /// than its buffer.
    pub fn pack(format: MsgFormat, lens: &[u32], contents: &[&[u8]]) -> Self {
        Self::pack_in(BytesMut::new(), format, lens, contents)
    }

    /// [`WireMessage::pack`] reusing the allocation of `buf`.
    pub fn pack_in(mut buf: BytesMut, format: MsgFormat, lens: &[u32], contents: &[&[u8]]) -> Self {
        let size = super::compute_size(format, lens);
        let ops = format.ops();
        let phys = ops.physical_lens(lens);

        buf.clear();
        buf.resize(size, 0);
        ops.init_header(&mut buf, phys.len());
        for (slot, len) in phys.iter().enumerate() {
            put_u32(&mut buf, ops.buflens_offset() + 4 * slot, *len);
        }

        let mut msg = Self {
            buf,
            format: Some(format),
            swabbed: false,
            swabbed_bufs: Vec::new(),
            packed: false,
        };

        for (index, content) in contents.iter().enumerate() {
            if content.is_empty() || (format == MsgFormat::Legacy && index == 0) {
                continue;
            }
            assert!(
                content.len() <= msg.buflen(index),
                "content for buffer {} exceeds its length {}",
                index,
                msg.buflen(index)
            );
            if let Some(dst) = msg.buffer_mut(index, content.len()) {
                dst[..content.len()].copy_from_slice(content);
            }
        }

        match format {
            MsgFormat::Legacy => put_u32(&mut msg.buf, v1::VERSION, MSG_VERSION),
            MsgFormat::SelfDescribing => {
                if let Ok(at) = msg.body_offset() {
                    let version = get_u32(&msg.buf, at + off::VERSION);
                    put_u32(&mut msg.buf, at + off::VERSION, version | MSG_VERSION);
                }
            }
        }
        msg
    }

    /// Pack a request envelope for `opc`.
    pub fn pack_request(format: MsgFormat, opc: u32, lens: &[u32], contents: &[&[u8]]) -> Self {
        let mut msg = Self::pack(format, lens, contents);
        msg.set_type(super::MSG_REQUEST);
        msg.set_opc(opc);
        msg
    }

    /// Validate and normalize a received envelope.
    ///
    /// Checks the magic, swabs the fixed header, length table and envelope
    /// body when the sender's byte order differs, checks the legacy version
    /// and verifies the declared lengths fit in `received_len` bytes.
    pub fn unpack(mut buf: BytesMut, received_len: usize) -> Result<Self> {
        let len = received_len.min(buf.len());
        if len < 4 {
            return Err(Error::Truncated { len, required: 4 });
        }

        let magic = Magic::parse(get_u32(&buf, 0))?;
        let ops = magic.format.ops();

        if len < ops.buflens_offset() {
            return Err(Error::Truncated {
                len,
                required: ops.buflens_offset(),
            });
        }

        if magic.swabbed {
            ops.swab_header(&mut buf);
            put_u32(&mut buf, 0, ops.magic());
        }

        if magic.format == MsgFormat::Legacy {
            let version = get_u32(&buf, v1::VERSION);
            if version & !VERSION_MASK != MSG_VERSION {
                return Err(Error::VersionMismatch {
                    got: version,
                    expected: MSG_VERSION,
                });
            }
        }

        let count = ops.bufcount(&buf);
        let mut required = ops.hdr_size(count);
        if len < required {
            return Err(Error::Truncated { len, required });
        }

        for slot in 0..count {
            let at = ops.buflens_offset() + 4 * slot;
            if magic.swabbed {
                swab_u32(&mut buf, at);
            }
            required = required.saturating_add(size_round(get_u32(&buf, at) as usize));
        }
        if len < required {
            return Err(Error::Truncated { len, required });
        }

        buf.truncate(required);
        let mut msg = Self {
            buf,
            format: Some(magic.format),
            swabbed: magic.swabbed,
            swabbed_bufs: Vec::new(),
            packed: true,
        };

        if magic.swabbed && magic.format == MsgFormat::SelfDescribing {
            if let Ok(at) = msg.body_offset() {
                swab_body(&mut msg.buf[at..at + BODY_SIZE]);
                msg.mark_buf_swabbed(0);
            }
        }

        debug!(
            format = ?magic.format,
            swabbed = magic.swabbed,
            bufcount = count,
            len = required,
            "unpacked message"
        );
        Ok(msg)
    }

    /// Validate the envelope body of an unpacked message.
    pub fn unpack_body(&self) -> Result<()> {
        match self.format {
            None => Err(Error::Uninitialized),
            Some(MsgFormat::Legacy) => Ok(()),
            Some(MsgFormat::SelfDescribing) => {
                let at = self.body_offset()?;
                let version = get_u32(&self.buf, at + off::VERSION);
                if version & !VERSION_MASK != MSG_VERSION {
                    error!(version, "wrong envelope body version");
                    return Err(Error::VersionMismatch {
                        got: version,
                        expected: MSG_VERSION,
                    });
                }
                Ok(())
            }
        }
    }

    /// Encode as a peer of opposite byte order would have sent it.
    ///
    /// Only the fixed header, the length table and the envelope body are
    /// converted; other sub-buffers are copied untouched.
    pub fn to_swabbed(&self) -> BytesMut {
        let mut out = self.buf.clone();
        let Some(ops) = self.ops() else {
            return out;
        };
        let count = ops.bufcount(&self.buf);
        if let Ok(at) = self.body_offset() {
            swab_body(&mut out[at..at + BODY_SIZE]);
        }
        for slot in 0..count {
            swab_u32(&mut out, ops.buflens_offset() + 4 * slot);
        }
        ops.swab_header(&mut out);
        put_u32(&mut out, 0, ops.magic().swap_bytes());
        out
    }

    // =========================================================================
    // Layout
    // =========================================================================

    fn ops(&self) -> Option<&'static dyn FormatOps> {
        self.format.map(MsgFormat::ops)
    }

    pub fn format(&self) -> Option<MsgFormat> {
        self.format
    }

    /// Whether the sender's byte order differed from ours.
    pub fn is_swabbed(&self) -> bool {
        self.swabbed
    }

    /// Whether the envelope size is frozen.
    pub fn is_packed(&self) -> bool {
        self.packed
    }

    /// Freeze the envelope size.
    pub fn freeze_size(&mut self) {
        self.packed = true;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    /// Give back the underlying buffer.
    pub fn into_buffer(self) -> BytesMut {
        self.buf
    }

    /// Logical buffer count (legacy messages count the implicit body).
    pub fn bufcount(&self) -> usize {
        match self.ops() {
            Some(ops) if !self.buf.is_empty() => ops.logical_count(ops.bufcount(&self.buf)),
            _ => 0,
        }
    }

    fn raw_buflen(&self, ops: &dyn FormatOps, slot: usize) -> usize {
        get_u32(&self.buf, ops.buflens_offset() + 4 * slot) as usize
    }

    fn physical_slot(&self, index: usize) -> Option<(&'static dyn FormatOps, usize)> {
        let ops = self.ops()?;
        let slot = ops.physical_index(index)?;
        if self.buf.is_empty() || slot >= ops.bufcount(&self.buf) {
            return None;
        }
        Some((ops, slot))
    }

    fn slot_offset(&self, ops: &dyn FormatOps, slot: usize) -> usize {
        let count = ops.bufcount(&self.buf);
        (0..slot).fold(ops.hdr_size(count), |at, j| {
            at + size_round(self.raw_buflen(ops, j))
        })
    }

    /// Declared length of logical buffer `index` (0 when absent).
    pub fn buflen(&self, index: usize) -> usize {
        match self.physical_slot(index) {
            Some((ops, slot)) => self.raw_buflen(ops, slot),
            None => 0,
        }
    }

    /// Rewrite the declared length of buffer `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn set_buflen(&mut self, index: usize, len: u32) {
        let Some((ops, slot)) = self.physical_slot(index) else {
            panic!(
                "set_buflen: buffer {} out of range (bufcount {})",
                index,
                self.bufcount()
            );
        };
        put_u32(&mut self.buf, ops.buflens_offset() + 4 * slot, len);
    }

    fn locate_buffer(&self, index: usize, min_size: usize) -> Option<(usize, usize)> {
        let (ops, slot) = self.physical_slot(index)?;
        let len = self.raw_buflen(ops, slot);
        if len < min_size {
            if len == 0 {
                debug!(index, min_size, "optional buffer is empty");
            } else {
                error!(index, len, min_size, "buffer too small");
            }
            return None;
        }
        let at = self.slot_offset(ops, slot);
        (at + len <= self.buf.len()).then_some((at, len))
    }

    /// Logical buffer `index` if present and at least `min_size` bytes.
    pub fn buffer(&self, index: usize, min_size: usize) -> Option<&[u8]> {
        let (at, len) = self.locate_buffer(index, min_size)?;
        Some(&self.buf[at..at + len])
    }

    /// Mutable logical buffer `index` if present and at least `min_size` bytes.
    pub fn buffer_mut(&mut self, index: usize, min_size: usize) -> Option<&mut [u8]> {
        let (at, len) = self.locate_buffer(index, min_size)?;
        Some(&mut self.buf[at..at + len])
    }

    /// Buffer `index` converted to host order by `swab` exactly once.
    ///
    /// `swab` runs only if the message arrived from a peer of opposite byte
    /// order and this buffer has not been converted yet.
    pub fn swab_buffer<F>(&mut self, index: usize, min_size: usize, swab: F) -> Option<&mut [u8]>
    where
        F: FnOnce(&mut [u8]),
    {
        let (at, len) = self.locate_buffer(index, min_size)?;
        let needs_swab = self.swabbed && !self.is_buf_swabbed(index);
        if needs_swab {
            self.mark_buf_swabbed(index);
        }
        let buf = &mut self.buf[at..at + len];
        if needs_swab {
            swab(buf);
        }
        Some(buf)
    }

    fn is_buf_swabbed(&self, index: usize) -> bool {
        self.swabbed_bufs
            .get(index / 64)
            .map_or(false, |word| word & (1u64 << (index % 64)) != 0)
    }

    fn mark_buf_swabbed(&mut self, index: usize) {
        let word = index / 64;
        if self.swabbed_bufs.len() <= word {
            self.swabbed_bufs.resize(word + 1, 0);
        }
        self.swabbed_bufs[word] |= 1u64 << (index % 64);
    }

    /// NUL-terminated string in buffer `index`.
    ///
    /// With `max_len == 0` the string must fill the buffer exactly (NUL in
    /// the last byte); otherwise it may be at most `max_len` bytes long.
    pub fn string(&self, index: usize, max_len: usize) -> Option<&str> {
        let buf = self.buffer(index, 0)?;
        let blen = buf.len();
        let slen = buf.iter().position(|b| *b == 0).unwrap_or(blen);

        if slen == blen {
            error!(index, blen, "string not NUL terminated");
            return None;
        }
        if max_len == 0 {
            if slen != blen - 1 {
                error!(index, slen, blen, "string does not fill its buffer");
                return None;
            }
        } else if slen > max_len {
            error!(index, slen, max_len, "string too long");
            return None;
        }
        std::str::from_utf8(&buf[..slen]).ok()
    }

    /// Shrink buffer `index` to `new_len` and return the new envelope size.
    ///
    /// With `move_data` the following buffers are moved down to stay
    /// contiguous; without it their contents are no longer meaningful. A
    /// zero length removes the segment from the length table, leaving an
    /// empty slot at the end.
    ///
    /// # Panics
    ///
    /// Panics if the message is size-frozen, `index` is out of range or
    /// `new_len` grows the buffer.
    pub fn shrink(&mut self, index: usize, new_len: usize, move_data: bool) -> usize {
        assert!(!self.packed, "shrink on a size-frozen message");
        let Some((ops, slot)) = self.physical_slot(index) else {
            panic!("shrink: buffer {} out of range", index);
        };
        let old_len = self.raw_buflen(ops, slot);
        assert!(
            new_len <= old_len,
            "shrink: buffer {} grows {} -> {}",
            index,
            old_len,
            new_len
        );
        if new_len == old_len {
            return self.buf.len();
        }

        let count = ops.bufcount(&self.buf);
        let tail = if move_data && slot + 1 < count {
            let from = self.slot_offset(ops, slot + 1);
            let tail_len: usize = (slot + 1..count)
                .map(|j| size_round(self.raw_buflen(ops, j)))
                .sum();
            Some((from, tail_len))
        } else {
            None
        };

        put_u32(
            &mut self.buf,
            ops.buflens_offset() + 4 * slot,
            new_len as u32,
        );

        if let Some((from, tail_len)) = tail {
            let to = self.slot_offset(ops, slot + 1);
            self.buf.copy_within(from..from + tail_len, to);
        }

        if new_len == 0 && slot + 1 < count {
            let lens = ops.buflens_offset();
            self.buf
                .copy_within(lens + 4 * (slot + 1)..lens + 4 * count, lens + 4 * slot);
            put_u32(&mut self.buf, lens + 4 * (count - 1), 0);
        }

        let size = (0..count).fold(ops.hdr_size(count), |at, j| {
            at + size_round(self.raw_buflen(ops, j))
        });
        self.buf.truncate(size);
        size
    }

    // =========================================================================
    // Field location
    // =========================================================================

    fn body_offset(&self) -> Result<usize> {
        match self.format {
            None => Err(Error::Uninitialized),
            Some(MsgFormat::Legacy) => Err(Error::MissingBody),
            Some(MsgFormat::SelfDescribing) => self
                .locate_buffer(0, BODY_SIZE)
                .map(|(at, _)| at)
                .ok_or(Error::MissingBody),
        }
    }

    fn locate(&self, legacy: Option<usize>, body: usize) -> Result<Slot> {
        match self.format {
            None => Err(Error::Uninitialized),
            Some(MsgFormat::Legacy) => Ok(legacy.map_or(Slot::Absent, Slot::At)),
            Some(MsgFormat::SelfDescribing) => Ok(Slot::At(self.body_offset()? + body)),
        }
    }

    fn locate_for_write(&self, legacy: Option<usize>, body: usize, field: &str) -> Slot {
        match self.locate(legacy, body) {
            Ok(slot) => slot,
            Err(e) => panic!("cannot set {}: {}", field, e),
        }
    }

    fn read_u32(&self, legacy: Option<usize>, body: usize, absent: u32) -> Result<u32> {
        Ok(match self.locate(legacy, body)? {
            Slot::At(at) => get_u32(&self.buf, at),
            Slot::Absent => absent,
        })
    }

    fn read_u64(&self, legacy: Option<usize>, body: usize, absent: u64) -> Result<u64> {
        Ok(match self.locate(legacy, body)? {
            Slot::At(at) => get_u64(&self.buf, at),
            Slot::Absent => absent,
        })
    }

    fn write_u32(&mut self, legacy: Option<usize>, body: usize, value: u32, field: &str) {
        if let Slot::At(at) = self.locate_for_write(legacy, body, field) {
            put_u32(&mut self.buf, at, value);
        }
    }

    fn write_u64(&mut self, legacy: Option<usize>, body: usize, value: u64, field: &str) {
        if let Slot::At(at) = self.locate_for_write(legacy, body, field) {
            put_u64(&mut self.buf, at, value);
        }
    }

    // =========================================================================
    // Typed accessors
    // =========================================================================

    /// The whole envelope body (legacy messages synthesize one from the header).
    pub fn body(&self) -> Result<MessageBody> {
        match self.format {
            Some(MsgFormat::SelfDescribing) => {
                let at = self.body_offset()?;
                Ok(MessageBody::decode(&self.buf[at..at + BODY_SIZE]))
            }
            _ => Ok(MessageBody {
                opc: self.opc()?,
                version: self.version()?,
                msg_type: self.msg_type()?,
                status: self.status()?,
                last_xid: self.last_xid()?,
                last_seen: self.last_seen()?,
                last_committed: self.last_committed()?,
                transno: self.transno()?,
                flags: self.flags()?,
                op_flags: self.op_flags()?,
                conn_cnt: self.conn_cnt()?,
                timeout: self.timeout()?,
                service_time: self.service_time()?,
                slv: self.slv()?,
                limit: self.limit()?,
                handle: self.handle()?,
            }),
        }
    }

    /// Generic flags; 0 on an uninitialized message.
    pub fn flags(&self) -> Result<u32> {
        match self.format {
            None => Ok(0),
            Some(MsgFormat::Legacy) => Ok(get_u32(&self.buf, v1::FLAGS) & GEN_FLAG_MASK),
            Some(MsgFormat::SelfDescribing) => self.read_u32(None, off::FLAGS, 0),
        }
    }

    /// # Panics
    ///
    /// Panics if the message has no envelope body.
    pub fn set_flags(&mut self, flags: u32) {
        match self.format {
            Some(MsgFormat::Legacy) => {
                let word = get_u32(&self.buf, v1::FLAGS);
                put_u32(
                    &mut self.buf,
                    v1::FLAGS,
                    (word & !GEN_FLAG_MASK) | (flags & GEN_FLAG_MASK),
                );
            }
            _ => self.write_u32(None, off::FLAGS, flags, "flags"),
        }
    }

    /// # Panics
    ///
    /// Panics if the message has no envelope body.
    pub fn add_flags(&mut self, flags: u32) {
        let current = match self.flags() {
            Ok(current) => current,
            Err(e) => panic!("cannot add flags: {}", e),
        };
        self.set_flags(current | flags);
    }

    /// # Panics
    ///
    /// Panics if the message has no envelope body.
    pub fn clear_flags(&mut self, flags: u32) {
        let current = match self.flags() {
            Ok(current) => current,
            Err(e) => panic!("cannot clear flags: {}", e),
        };
        self.set_flags(current & !flags);
    }

    /// Operation-specific flags; 0 on an uninitialized message.
    pub fn op_flags(&self) -> Result<u32> {
        match self.format {
            None => Ok(0),
            Some(MsgFormat::Legacy) => Ok(get_u32(&self.buf, v1::FLAGS) >> OP_FLAG_SHIFT),
            Some(MsgFormat::SelfDescribing) => self.read_u32(None, off::OP_FLAGS, 0),
        }
    }

    /// # Panics
    ///
    /// Panics if the message has no envelope body.
    pub fn set_op_flags(&mut self, flags: u32) {
        match self.format {
            Some(MsgFormat::Legacy) => {
                let word = get_u32(&self.buf, v1::FLAGS);
                put_u32(
                    &mut self.buf,
                    v1::FLAGS,
                    (word & !OP_FLAG_MASK) | (flags << OP_FLAG_SHIFT),
                );
            }
            _ => self.write_u32(None, off::OP_FLAGS, flags, "op_flags"),
        }
    }

    /// # Panics
    ///
    /// Panics if the message has no envelope body.
    pub fn add_op_flags(&mut self, flags: u32) {
        let current = match self.op_flags() {
            Ok(current) => current,
            Err(e) => panic!("cannot add op flags: {}", e),
        };
        self.set_op_flags(current | flags);
    }

    /// Operation code; 0 on an uninitialized message.
    pub fn opc(&self) -> Result<u32> {
        match self.format {
            None => Ok(0),
            _ => self.read_u32(Some(v1::OPC), off::OPC, 0),
        }
    }

    pub fn set_opc(&mut self, opc: u32) {
        self.write_u32(Some(v1::OPC), off::OPC, opc, "opc");
    }

    /// Status; `-EINVAL` on an uninitialized message.
    pub fn status(&self) -> Result<i32> {
        match self.format {
            None => Ok(EINVAL),
            _ => self
                .read_u32(Some(v1::STATUS), off::STATUS, 0)
                .map(|s| s as i32),
        }
    }

    pub fn set_status(&mut self, status: i32) {
        self.write_u32(Some(v1::STATUS), off::STATUS, status as u32, "status");
    }

    pub fn msg_type(&self) -> Result<u32> {
        self.read_u32(Some(v1::TYPE), off::TYPE, 0)
    }

    pub fn set_type(&mut self, msg_type: u32) {
        self.write_u32(Some(v1::TYPE), off::TYPE, msg_type, "type");
    }

    pub fn version(&self) -> Result<u32> {
        self.read_u32(Some(v1::VERSION), off::VERSION, 0)
    }

    /// ORs `version` into the version word.
    pub fn add_version(&mut self, version: u32) {
        let current = match self.version() {
            Ok(current) => current,
            Err(e) => panic!("cannot set version: {}", e),
        };
        self.write_u32(
            Some(v1::VERSION),
            off::VERSION,
            current | version,
            "version",
        );
    }

    /// Compare the service half of the version word with `expected`.
    ///
    /// Legacy messages carry no service version and always match.
    pub fn check_version(&self, expected: u32) -> Result<()> {
        match self.format {
            None => Err(Error::Uninitialized),
            Some(MsgFormat::Legacy) => Ok(()),
            Some(MsgFormat::SelfDescribing) => {
                let got = self.version()?;
                if got & VERSION_MASK != expected {
                    return Err(Error::VersionMismatch { got, expected });
                }
                Ok(())
            }
        }
    }

    pub fn transno(&self) -> Result<u64> {
        self.read_u64(Some(v1::TRANSNO), off::TRANSNO, 0)
    }

    pub fn set_transno(&mut self, transno: u64) {
        self.write_u64(Some(v1::TRANSNO), off::TRANSNO, transno, "transno");
    }

    pub fn last_xid(&self) -> Result<u64> {
        self.read_u64(Some(v1::LAST_XID), off::LAST_XID, 0)
    }

    pub fn set_last_xid(&mut self, xid: u64) {
        self.write_u64(Some(v1::LAST_XID), off::LAST_XID, xid, "last_xid");
    }

    pub fn last_committed(&self) -> Result<u64> {
        self.read_u64(Some(v1::LAST_COMMITTED), off::LAST_COMMITTED, 0)
    }

    pub fn set_last_committed(&mut self, transno: u64) {
        self.write_u64(
            Some(v1::LAST_COMMITTED),
            off::LAST_COMMITTED,
            transno,
            "last_committed",
        );
    }

    /// Last transaction seen by the sender; legacy messages read 0.
    pub fn last_seen(&self) -> Result<u64> {
        self.read_u64(None, off::LAST_SEEN, 0)
    }

    pub fn set_last_seen(&mut self, transno: u64) {
        self.write_u64(None, off::LAST_SEEN, transno, "last_seen");
    }

    /// Connection generation counter.
    pub fn conn_cnt(&self) -> Result<u32> {
        self.read_u32(Some(v1::CONN_CNT), off::CONN_CNT, 0)
    }

    pub fn set_conn_cnt(&mut self, conn_cnt: u32) {
        self.write_u32(Some(v1::CONN_CNT), off::CONN_CNT, conn_cnt, "conn_cnt");
    }

    pub fn handle(&self) -> Result<[u64; 2]> {
        Ok([
            self.read_u64(Some(v1::HANDLE), off::HANDLE, 0)?,
            self.read_u64(Some(v1::HANDLE + 8), off::HANDLE + 8, 0)?,
        ])
    }

    pub fn set_handle(&mut self, handle: [u64; 2]) {
        self.write_u64(Some(v1::HANDLE), off::HANDLE, handle[0], "handle");
        self.write_u64(Some(v1::HANDLE + 8), off::HANDLE + 8, handle[1], "handle");
    }

    /// Timeout in seconds; legacy messages read 0.
    pub fn timeout(&self) -> Result<u32> {
        self.read_u32(None, off::TIMEOUT, 0)
    }

    pub fn set_timeout(&mut self, seconds: u32) {
        self.write_u32(None, off::TIMEOUT, seconds, "timeout");
    }

    /// Measured service time; legacy messages read 0.
    pub fn service_time(&self) -> Result<u32> {
        self.read_u32(None, off::SERVICE_TIME, 0)
    }

    pub fn set_service_time(&mut self, seconds: u32) {
        self.write_u32(None, off::SERVICE_TIME, seconds, "service_time");
    }

    /// Server lock volume; legacy messages read 1.
    pub fn slv(&self) -> Result<u64> {
        self.read_u64(None, off::SLV, 1)
    }

    pub fn set_slv(&mut self, slv: u64) {
        self.write_u64(None, off::SLV, slv, "slv");
    }

    /// Lock limit; legacy messages read 1.
    pub fn limit(&self) -> Result<u32> {
        self.read_u32(None, off::LIMIT, 1)
    }

    pub fn set_limit(&mut self, limit: u32) {
        self.write_u32(None, off::LIMIT, limit, "limit");
    }

    // =========================================================================
    // Self-describing header fields
    // =========================================================================

    fn v2_header(&self, at: usize) -> u32 {
        match self.format {
            Some(MsgFormat::SelfDescribing) if self.buf.len() >= v2::BUFLENS => {
                get_u32(&self.buf, at)
            }
            _ => 0,
        }
    }

    fn set_v2_header(&mut self, at: usize, value: u32) {
        if matches!(self.format, Some(MsgFormat::SelfDescribing)) && self.buf.len() >= v2::BUFLENS
        {
            put_u32(&mut self.buf, at, value);
        }
    }

    /// Stored checksum; 0 for legacy messages.
    pub fn checksum(&self) -> u32 {
        self.v2_header(v2::CKSUM)
    }

    pub fn set_checksum(&mut self, cksum: u32) {
        self.set_v2_header(v2::CKSUM, cksum);
    }

    /// CRC-32 of the envelope body; 0 for legacy messages.
    pub fn calc_checksum(&self) -> Result<u32> {
        match self.format {
            None => Err(Error::Uninitialized),
            Some(MsgFormat::Legacy) => Ok(0),
            Some(MsgFormat::SelfDescribing) => {
                let at = self.body_offset()?;
                Ok(body_crc(&self.buf[at..at + BODY_SIZE]))
            }
        }
    }

    pub fn security_flavor(&self) -> u32 {
        self.v2_header(v2::SECFLVR)
    }

    pub fn set_security_flavor(&mut self, flavor: u32) {
        self.set_v2_header(v2::SECFLVR, flavor);
    }

    /// Reply size hint carried by requests.
    pub fn reply_size(&self) -> u32 {
        self.v2_header(v2::REPSIZE)
    }

    pub fn set_reply_size(&mut self, size: u32) {
        self.set_v2_header(v2::REPSIZE, size);
    }
}

/// Little-endian CRC-32 (IEEE polynomial) seeded with all ones and without
/// the final inversion.
fn body_crc(bytes: &[u8]) -> u32 {
    !crc32fast::hash(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{MSG_REPLAY, MSG_RESENT};
    use assert_matches::assert_matches;

    const BODY: u32 = BODY_SIZE as u32;

    fn sample(format: MsgFormat) -> WireMessage {
        let mut msg = WireMessage::pack(format, &[BODY, 16, 0, 8], &[&[], b"0123456789abcdef"]);
        msg.set_opc(101);
        msg.set_transno(77);
        msg.set_last_committed(70);
        msg.set_status(-2);
        msg.set_conn_cnt(3);
        msg
    }

    #[test]
    fn test_pack_layout_self_describing() {
        let msg = sample(MsgFormat::SelfDescribing);
        assert_eq!(msg.bufcount(), 4);
        assert_eq!(msg.buflen(0), BODY_SIZE);
        assert_eq!(msg.buffer(1, 16).unwrap(), b"0123456789abcdef");
        assert_eq!(msg.version().unwrap(), MSG_VERSION);
        assert_eq!(msg.len(), 48 + 96 + 16 + 8);
    }

    #[test]
    fn test_legacy_has_no_body_buffer() {
        let msg = sample(MsgFormat::Legacy);
        assert_eq!(msg.bufcount(), 4);
        assert!(msg.buffer(0, 0).is_none());
        assert_eq!(msg.buffer(1, 16).unwrap(), b"0123456789abcdef");
        assert_eq!(msg.opc().unwrap(), 101);
        assert_eq!(msg.transno().unwrap(), 77);
    }

    #[test]
    fn test_unpack_native() {
        let msg = sample(MsgFormat::SelfDescribing);
        let len = msg.len();
        let got = WireMessage::unpack(BytesMut::from(msg.as_bytes()), len).unwrap();
        assert!(!got.is_swabbed());
        assert_eq!(got.opc().unwrap(), 101);
        assert_eq!(got.status().unwrap(), -2);
        got.unpack_body().unwrap();
    }

    #[test]
    fn test_unpack_swabbed_both_formats() {
        for format in [MsgFormat::SelfDescribing, MsgFormat::Legacy] {
            let msg = sample(format);
            let foreign = msg.to_swabbed();
            assert_ne!(&foreign[..], msg.as_bytes());

            let len = foreign.len();
            let got = WireMessage::unpack(foreign, len).unwrap();
            assert!(got.is_swabbed());
            assert_eq!(got.as_bytes(), msg.as_bytes());
            assert_eq!(got.transno().unwrap(), 77);
            assert_eq!(got.last_committed().unwrap(), 70);
            assert_eq!(got.conn_cnt().unwrap(), 3);
        }
    }

    #[test]
    fn test_unpack_truncated() {
        let msg = sample(MsgFormat::SelfDescribing);
        let short = msg.len() - 8;
        assert_matches!(
            WireMessage::unpack(BytesMut::from(msg.as_bytes()), short),
            Err(Error::Truncated { .. })
        );
        assert_matches!(
            WireMessage::unpack(BytesMut::from(&[0u8, 1][..]), 2),
            Err(Error::Truncated {
                len: 2,
                required: 4
            })
        );
    }

    #[test]
    fn test_unpack_bad_magic() {
        let mut raw = BytesMut::zeroed(64);
        put_u32(&mut raw, 0, 0x1234_5678);
        assert_matches!(
            WireMessage::unpack(raw, 64),
            Err(Error::BadMagic { magic: 0x1234_5678 })
        );
    }

    #[test]
    fn test_unpack_legacy_version_mismatch() {
        let msg = sample(MsgFormat::Legacy);
        let mut raw = BytesMut::from(msg.as_bytes());
        put_u32(&mut raw, v1::VERSION, 7);
        let len = raw.len();
        assert_matches!(
            WireMessage::unpack(raw, len),
            Err(Error::VersionMismatch { got: 7, .. })
        );
    }

    #[test]
    fn test_buffer_min_size() {
        let msg = sample(MsgFormat::SelfDescribing);
        assert!(msg.buffer(1, 17).is_none());
        assert!(msg.buffer(2, 1).is_none());
        assert_eq!(msg.buffer(2, 0).unwrap().len(), 0);
        assert!(msg.buffer(9, 0).is_none());
    }

    #[test]
    fn test_flags_legacy_split_word() {
        let mut msg = sample(MsgFormat::Legacy);
        msg.set_flags(MSG_REPLAY | 0x1_0000);
        msg.set_op_flags(0x5);
        assert_eq!(msg.flags().unwrap(), MSG_REPLAY);
        assert_eq!(msg.op_flags().unwrap(), 0x5);
        msg.add_flags(MSG_RESENT);
        assert_eq!(msg.flags().unwrap(), MSG_REPLAY | MSG_RESENT);
        assert_eq!(msg.op_flags().unwrap(), 0x5);
        msg.clear_flags(MSG_REPLAY);
        assert_eq!(msg.flags().unwrap(), MSG_RESENT);
    }

    #[test]
    fn test_uninitialized_sentinels() {
        let msg = WireMessage::new();
        assert_eq!(msg.flags().unwrap(), 0);
        assert_eq!(msg.op_flags().unwrap(), 0);
        assert_eq!(msg.opc().unwrap(), 0);
        assert_eq!(msg.status().unwrap(), EINVAL);
        assert_matches!(msg.transno(), Err(Error::Uninitialized));
        assert_eq!(msg.bufcount(), 0);
    }

    #[test]
    fn test_missing_body_fails_loudly() {
        let sender = WireMessage::pack(MsgFormat::SelfDescribing, &[BODY, 8], &[]);
        let mut raw = BytesMut::from(sender.as_bytes());
        // declare the body shorter than its struct
        put_u32(&mut raw, v2::BUFLENS, 8);
        let len = raw.len();
        let msg = WireMessage::unpack(raw, len).unwrap();
        assert_matches!(msg.unpack_body(), Err(Error::MissingBody));
        assert_matches!(msg.transno(), Err(Error::MissingBody));
        assert_matches!(msg.flags(), Err(Error::MissingBody));
    }

    #[test]
    #[should_panic(expected = "cannot set transno")]
    fn test_setter_without_body_panics() {
        let mut msg = WireMessage::new();
        msg.set_transno(1);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_set_buflen_out_of_range_panics() {
        let mut msg = sample(MsgFormat::SelfDescribing);
        msg.set_buflen(4, 8);
    }

    #[test]
    fn test_legacy_defaults() {
        let mut msg = sample(MsgFormat::Legacy);
        assert_eq!(msg.timeout().unwrap(), 0);
        assert_eq!(msg.service_time().unwrap(), 0);
        assert_eq!(msg.slv().unwrap(), 1);
        assert_eq!(msg.limit().unwrap(), 1);
        msg.set_timeout(30);
        assert_eq!(msg.timeout().unwrap(), 0);
        assert_eq!(msg.calc_checksum().unwrap(), 0);
        assert_eq!(msg.checksum(), 0);
    }

    #[test]
    fn test_checksum_covers_body() {
        let mut msg = sample(MsgFormat::SelfDescribing);
        let before = msg.calc_checksum().unwrap();
        msg.set_checksum(before);
        assert_eq!(msg.checksum(), before);
        // checksum lives in the header, not the body
        assert_eq!(msg.calc_checksum().unwrap(), before);
        msg.set_transno(78);
        assert_ne!(msg.calc_checksum().unwrap(), before);
    }

    #[test]
    fn test_body_crc_vectors() {
        assert_eq!(body_crc(b""), 0xffff_ffff);
        assert_eq!(body_crc(b"123456789"), 0x340b_c6d9);
        assert_eq!(body_crc(&[0u8; 4]), 0xdebb_20e3);
    }

    #[test]
    fn test_check_version() {
        let mut msg = sample(MsgFormat::SelfDescribing);
        msg.add_version(0x0004_0000);
        msg.check_version(0x0004_0000).unwrap();
        assert_matches!(
            msg.check_version(0x0005_0000),
            Err(Error::VersionMismatch { .. })
        );
        sample(MsgFormat::Legacy).check_version(0x0005_0000).unwrap();
    }

    #[test]
    fn test_string_accessor() {
        let mut msg = WireMessage::pack(
            MsgFormat::SelfDescribing,
            &[BODY, 6, 8, 4],
            &[&[], b"ost01\0", b"abc\0", b"abcd"],
        );
        assert_eq!(msg.string(1, 0), Some("ost01"));
        assert_eq!(msg.string(2, 8), Some("abc"));
        assert_eq!(msg.string(2, 2), None);
        // exact fit requested but NUL is early
        assert_eq!(msg.string(2, 0), None);
        // no NUL at all
        assert_eq!(msg.string(3, 8), None);
        msg.buffer_mut(3, 4).unwrap()[3] = 0;
        assert_eq!(msg.string(3, 0), Some("abc"));
    }

    #[test]
    fn test_swab_buffer_once() {
        let mut sender = WireMessage::pack(MsgFormat::SelfDescribing, &[BODY, 8], &[]);
        put_u64(sender.buffer_mut(1, 8).unwrap(), 0, 0x0102_0304_0506_0708u64.swap_bytes());
        let foreign = sender.to_swabbed();
        let len = foreign.len();
        let mut msg = WireMessage::unpack(foreign, len).unwrap();

        let swab = |b: &mut [u8]| b[..8].reverse();
        let buf = msg.swab_buffer(1, 8, swab).unwrap();
        assert_eq!(get_u64(buf, 0), 0x0102_0304_0506_0708);
        let buf = msg.swab_buffer(1, 8, swab).unwrap();
        assert_eq!(get_u64(buf, 0), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_swab_buffer_tracks_high_segments() {
        let mut lens = vec![BODY];
        lens.extend(std::iter::repeat(8).take(69));
        let mut sender = WireMessage::pack(MsgFormat::SelfDescribing, &lens, &[]);
        for index in [63, 64, 65] {
            put_u64(sender.buffer_mut(index, 8).unwrap(), 0, (index as u64).swap_bytes());
        }
        let foreign = sender.to_swabbed();
        let len = foreign.len();
        let mut msg = WireMessage::unpack(foreign, len).unwrap();

        let swab = |b: &mut [u8]| b[..8].reverse();
        for index in [63, 64, 65, 64] {
            let buf = msg.swab_buffer(index, 8, swab).unwrap();
            assert_eq!(get_u64(buf, 0), index as u64);
        }
    }

    #[test]
    fn test_shrink_moves_tail() {
        let mut msg = WireMessage::pack(
            MsgFormat::SelfDescribing,
            &[BODY, 32, 8],
            &[&[], &[1u8; 32], b"tailtail"],
        );
        let size = msg.shrink(1, 5, true);
        assert_eq!(size, 48 + 96 + 8 + 8);
        assert_eq!(msg.buflen(1), 5);
        assert_eq!(msg.buffer(2, 8).unwrap(), b"tailtail");
    }

    #[test]
    fn test_shrink_to_zero_removes_segment() {
        let mut msg = WireMessage::pack(
            MsgFormat::SelfDescribing,
            &[BODY, 32, 8],
            &[&[], &[1u8; 32], b"tailtail"],
        );
        msg.shrink(1, 0, true);
        assert_eq!(msg.bufcount(), 3);
        assert_eq!(msg.buflen(1), 8);
        assert_eq!(msg.buflen(2), 0);
        assert_eq!(msg.buffer(1, 8).unwrap(), b"tailtail");
    }

    #[test]
    #[should_panic(expected = "size-frozen")]
    fn test_shrink_frozen_panics() {
        let mut msg = sample(MsgFormat::SelfDescribing);
        msg.freeze_size();
        msg.shrink(1, 4, true);
    }

    #[test]
    fn test_body_roundtrip_struct() {
        let msg = sample(MsgFormat::Legacy);
        let body = msg.body().unwrap();
        assert_eq!(body.opc, 101);
        assert_eq!(body.slv, 1);
        assert_eq!(body.version, MSG_VERSION);
    }
}
