// Wire format for framing messages between local processes.
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Constant carried in the top 16 bits of every message-kind field; anything
/// without it is foreign traffic and skipped during reassembly.
pub const TOKEN: u16 = 0x4342;
/// Kind codes at or above this value are protocol-control messages.
pub const CONTROL_THRESHOLD: u16 = 0xFF00;
/// Sentinel target identity meaning "deliver to every interested peer".
pub const BROADCAST: i32 = -1;

pub const HEADER_LEN: usize = 12;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("payload exceeds the 16-bit length field")]
    PayloadTooLarge,
    #[error("receive buffer exhausted before a full message arrived")]
    Exhausted,
    #[error("message cannot fit the receive buffer ({needed} > {capacity})")]
    Oversized { needed: usize, capacity: usize },
    #[error("malformed {0} payload")]
    Malformed(&'static str),
}

/// Protocol-control kind codes. User traffic uses codes below
/// [`CONTROL_THRESHOLD`]; these sit above it.
pub mod kind {
    pub const CONNECT: u16 = 0xFF01;
    pub const REGISTER: u16 = 0xFF02;
    pub const SYNC: u16 = 0xFF03;
    pub const UNREGISTER: u16 = 0xFF04;
    pub const NOTIFY: u16 = 0xFF05;
    pub const SUCCESS: u16 = 0xFF06;
}

/// Per-message flag bits.
///
/// ```
/// use crossbar_wire::Flags;
///
/// let flags = Flags::REPLY | Flags::REQUESTER;
/// assert!(flags.contains(Flags::REPLY));
/// assert!(!flags.contains(Flags::ASYNC));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(pub u16);

impl Flags {
    /// Sender expects a reply on the same socket.
    pub const REPLY: Flags = Flags(1 << 0);
    /// Message originates from a request/reply peer.
    pub const REQUESTER: Flags = Flags(1 << 1);
    /// Message originates from a registered subscriber.
    pub const SUBSCRIBER: Flags = Flags(1 << 2);
    /// Handler handed the message to the async pool; the broker must not
    /// reply on its own.
    pub const ASYNC: Flags = Flags(1 << 3);

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// One framed message: fixed little-endian header plus payload.
///
/// ```
/// use bytes::Bytes;
/// use crossbar_wire::{Flags, Message, RecvBuffer};
///
/// let msg = Message::new(42, 7, Flags::REPLY, Bytes::from_static(b"ping")).expect("msg");
/// let mut buf = RecvBuffer::with_capacity(256);
/// buf.push(&msg.encode());
/// let decoded = buf.reassemble().expect("reassemble").expect("message");
/// assert_eq!(decoded, msg);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender: i32,
    pub kind: u16,
    pub flags: Flags,
    pub payload: Bytes,
}

impl Message {
    pub fn new(sender: i32, kind: u16, flags: Flags, payload: Bytes) -> Result<Self> {
        if payload.len() > u16::MAX as usize {
            return Err(Error::PayloadTooLarge);
        }
        Ok(Self {
            sender,
            kind,
            flags,
            payload,
        })
    }

    pub fn is_control(&self) -> bool {
        self.kind >= CONTROL_THRESHOLD
    }

    pub fn wants_reply(&self) -> bool {
        self.flags.contains(Flags::REPLY)
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_i32_le(self.sender);
        let kind_field = ((TOKEN as u32) << 16) | self.kind as u32;
        buf.put_u32_le(kind_field);
        buf.put_u16_le(self.flags.0);
        buf.put_u16_le(self.payload.len() as u16);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

/// Owned receive region with consumed/filled cursors.
///
/// Invariant: `head <= tail <= capacity`. Bytes read off a socket land after
/// `tail`; [`RecvBuffer::reassemble`] consumes complete messages from `head`.
#[derive(Debug)]
pub struct RecvBuffer {
    buf: Box<[u8]>,
    head: usize,
    tail: usize,
}

impl RecvBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Unconsumed bytes currently buffered.
    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Writable region for the next socket read.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.tail..]
    }

    /// Record `n` bytes written into [`RecvBuffer::spare_mut`].
    pub fn advance_tail(&mut self, n: usize) {
        debug_assert!(self.tail + n <= self.buf.len());
        self.tail += n;
    }

    /// Append bytes directly (test and in-process use).
    pub fn push(&mut self, bytes: &[u8]) {
        self.compact();
        let tail = self.tail;
        let spare = self.spare_mut();
        assert!(bytes.len() <= spare.len(), "recv buffer overflow");
        spare[..bytes.len()].copy_from_slice(bytes);
        self.tail = tail + bytes.len();
    }

    /// Extract the next complete token-valid message.
    ///
    /// Returns `Ok(None)` when more bytes are needed; remaining bytes are
    /// compacted to offset 0 so the caller can keep reading. A message whose
    /// token bits are wrong is skipped and scanning resumes at the next
    /// offset. A full buffer that still holds no complete message is fatal.
    pub fn reassemble(&mut self) -> Result<Option<Message>> {
        loop {
            let avail = self.tail - self.head;
            if avail < HEADER_LEN {
                return self.need_more();
            }
            let header = &self.buf[self.head..self.head + HEADER_LEN];
            let kind_field = u32::from_le_bytes(header[4..8].try_into().unwrap());
            if (kind_field >> 16) as u16 != TOKEN {
                // Foreign bytes: resynchronize at the next offset.
                self.head += 1;
                continue;
            }
            let len = u16::from_le_bytes(header[10..12].try_into().unwrap()) as usize;
            let total = HEADER_LEN + len;
            if total > self.buf.len() {
                return Err(Error::Oversized {
                    needed: total,
                    capacity: self.buf.len(),
                });
            }
            if avail < total {
                return self.need_more();
            }
            let sender = i32::from_le_bytes(header[0..4].try_into().unwrap());
            let flags = Flags(u16::from_le_bytes(header[8..10].try_into().unwrap()));
            let payload =
                Bytes::copy_from_slice(&self.buf[self.head + HEADER_LEN..self.head + total]);
            self.head += total;
            return Ok(Some(Message {
                sender,
                kind: kind_field as u16,
                flags,
                payload,
            }));
        }
    }

    fn need_more(&mut self) -> Result<Option<Message>> {
        self.compact();
        if self.tail == self.buf.len() {
            // No room left to read the rest of the message.
            return Err(Error::Exhausted);
        }
        Ok(None)
    }

    fn compact(&mut self) {
        if self.head == 0 {
            return;
        }
        self.buf.copy_within(self.head..self.tail, 0);
        self.tail -= self.head;
        self.head = 0;
    }
}

/// Control-message payload codecs.
pub mod control {
    use super::*;

    /// CONNECT carries the caller's identity for validation against the
    /// header sender.
    pub fn encode_connect(identity: i32) -> Bytes {
        Bytes::copy_from_slice(&identity.to_le_bytes())
    }

    pub fn decode_connect(payload: &[u8]) -> Result<i32> {
        let bytes: [u8; 4] = payload
            .try_into()
            .map_err(|_| Error::Malformed("connect"))?;
        Ok(i32::from_le_bytes(bytes))
    }

    /// REGISTER body: topic-interest mask plus an opaque application payload.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Register {
        pub mask: u64,
        pub payload: Bytes,
    }

    impl Register {
        pub fn encode(&self) -> Bytes {
            let mut buf = BytesMut::with_capacity(8 + self.payload.len());
            buf.put_u64_le(self.mask);
            buf.extend_from_slice(&self.payload);
            buf.freeze()
        }

        pub fn decode(mut payload: Bytes) -> Result<Self> {
            if payload.len() < 8 {
                return Err(Error::Malformed("register"));
            }
            let mask = payload.get_u64_le();
            Ok(Self { mask, payload })
        }
    }

    pub fn encode_sync(reader_id: u64) -> Bytes {
        Bytes::copy_from_slice(&reader_id.to_le_bytes())
    }

    pub fn decode_sync(payload: &[u8]) -> Result<u64> {
        let bytes: [u8; 8] = payload.try_into().map_err(|_| Error::Malformed("sync"))?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// SUCCESS for a REGISTER carries the negotiated receive-buffer size.
    pub fn encode_capacity(capacity: u32) -> Bytes {
        Bytes::copy_from_slice(&capacity.to_le_bytes())
    }

    pub fn decode_capacity(payload: &[u8]) -> Result<u32> {
        let bytes: [u8; 4] = payload
            .try_into()
            .map_err(|_| Error::Malformed("success"))?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// NOTIFY body: target identity (or [`BROADCAST`]), single-bit topic,
    /// user kind, user payload.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Notify {
        pub target: i32,
        pub topic: u64,
        pub kind: u32,
        pub payload: Bytes,
    }

    impl Notify {
        pub fn encode(&self) -> Bytes {
            let mut buf = BytesMut::with_capacity(16 + self.payload.len());
            buf.put_i32_le(self.target);
            buf.put_u64_le(self.topic);
            buf.put_u32_le(self.kind);
            buf.extend_from_slice(&self.payload);
            buf.freeze()
        }

        pub fn decode(mut payload: Bytes) -> Result<Self> {
            if payload.len() < 16 {
                return Err(Error::Malformed("notify"));
            }
            let target = payload.get_i32_le();
            let topic = payload.get_u64_le();
            let kind = payload.get_u32_le();
            Ok(Self {
                target,
                topic,
                kind,
                payload,
            })
        }
    }
}
