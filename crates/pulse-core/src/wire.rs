//! pulse wire format — on-wire layout of QoS probe packets.
//!
//! These types ARE the protocol. The probe server echoes the identifier and
//! timestamp fields verbatim, so both are written in host byte order — the
//! bytes only ever round-trip through the same machine. Everything else is
//! single bytes.
//!
//! Request (client → server), 14 + title bytes:
//!
//!   offset 0      magic        0x59
//!   offset 1      ver/flow     version in the high nibble (0), flow-control
//!                              nibble low (always 0 from the client)
//!   offset 2      title len    length of the title bytes plus one
//!   offset 3      title        UTF-8, caller-supplied
//!   offset 3+L    sequence     0-based index of this probe within the burst
//!   offset 4+L    identifier   random u16, reflected verbatim
//!   offset 6+L    timestamp    unix-millis u64, reflected verbatim
//!
//! Response (server → client), 13 bytes:
//!
//!   offset 0      magic        0x95
//!   offset 1      ver/flow     version must be 0; low nibble is the
//!                              server-applied flow control
//!   offset 2      sequence     echoed
//!   offset 3      identifier   echoed
//!   offset 5      timestamp    echoed

// ── Constants ─────────────────────────────────────────────────────────────────

/// First byte of every probe request.
pub const REQUEST_MAGIC: u8 = 0x59;

/// First byte of every probe response.
pub const RESPONSE_MAGIC: u8 = 0x95;

/// Only wire version in existence.
pub const WIRE_VERSION: u8 = 0;

/// Smallest valid request: one-byte title.
pub const MIN_REQUEST_LEN: usize = 15;

/// Largest datagram we will emit.
pub const MAX_PACKET_LEN: usize = 1500;

/// Smallest valid response.
pub const MIN_RESPONSE_LEN: usize = 13;

/// Bytes of a request that are not title: magic, ver/flow, title length,
/// sequence, identifier, timestamp.
const REQUEST_OVERHEAD: usize = 14;

/// The title length field stores len + 1 in a single byte, which caps the
/// title well below what MAX_PACKET_LEN would otherwise allow.
pub const MAX_TITLE_LEN: usize = u8::MAX as usize - 1;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when encoding or interpreting probe packets.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("title is {0} bytes, max {MAX_TITLE_LEN}")]
    TitleTooLong(usize),

    #[error("title must not be empty")]
    TitleEmpty,

    #[error("packet is {0} bytes, below the minimum")]
    TooShort(usize),

    #[error("bad magic byte: 0x{0:02x}")]
    BadMagic(u8),

    #[error("unsupported wire version: {0}")]
    BadVersion(u8),

    #[error("sequence {sequence} beyond burst maximum {max}")]
    SequenceOutOfRange { sequence: u8, max: u8 },

    #[error("title length field {0} does not match packet size")]
    TitleLengthMismatch(u8),

    #[error("title is not valid UTF-8")]
    TitleNotUtf8,
}

// ── Flow control ──────────────────────────────────────────────────────────────

/// Server back-off hint carried in the low nibble of a response's ver/flow
/// byte. Units scale the back-off window the client must honor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FlowControl {
    #[default]
    None,
    /// Soft back-off, units 1–7.
    Throttle(u8),
    /// Hard back-off, units 1–8.
    Ban(u8),
}

impl FlowControl {
    /// Decode the low nibble of a ver/flow byte.
    ///
    /// Zero means no flow control. Otherwise the 0x8 bit selects Ban over
    /// Throttle and the low three bits carry the raw units; Ban units are
    /// raw + 1 so the all-zero raw value still encodes one unit.
    pub fn from_nibble(nibble: u8) -> FlowControl {
        let nibble = nibble & 0x0f;
        if nibble == 0 {
            FlowControl::None
        } else if nibble & 0x8 != 0 {
            FlowControl::Ban((nibble & 0x7) + 1)
        } else {
            FlowControl::Throttle(nibble & 0x7)
        }
    }

    /// Encode back into a nibble. Inverse of [`FlowControl::from_nibble`]
    /// over the valid domain.
    pub fn to_nibble(self) -> u8 {
        match self {
            FlowControl::None => 0,
            FlowControl::Throttle(units) => units & 0x7,
            FlowControl::Ban(units) => 0x8 | (units.saturating_sub(1) & 0x7),
        }
    }

    /// Back-off units. Zero when no flow control applies.
    pub fn units(self) -> u8 {
        match self {
            FlowControl::None => 0,
            FlowControl::Throttle(units) | FlowControl::Ban(units) => units,
        }
    }

    /// Keep whichever carries more units. Ban and Throttle rank equal at the
    /// same unit count; ties keep the current value.
    pub fn merge_max(self, other: FlowControl) -> FlowControl {
        if other.units() > self.units() { other } else { self }
    }
}

// ── Request ───────────────────────────────────────────────────────────────────

/// A single probe request, one of `requests_per_endpoint` in a burst.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest<'a> {
    pub title: &'a str,
    pub sequence: u8,
    pub identifier: u16,
    pub timestamp_ms: u64,
}

impl<'a> ProbeRequest<'a> {
    /// Encode to the on-wire byte layout.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let title = self.title.as_bytes();
        if title.is_empty() {
            return Err(WireError::TitleEmpty);
        }
        if title.len() > MAX_TITLE_LEN || REQUEST_OVERHEAD + title.len() > MAX_PACKET_LEN {
            return Err(WireError::TitleTooLong(title.len()));
        }

        let mut buf = Vec::with_capacity(REQUEST_OVERHEAD + title.len());
        buf.push(REQUEST_MAGIC);
        buf.push(WIRE_VERSION << 4);
        buf.push(title.len() as u8 + 1);
        buf.extend_from_slice(title);
        buf.push(self.sequence);
        buf.extend_from_slice(&self.identifier.to_ne_bytes());
        buf.extend_from_slice(&self.timestamp_ms.to_ne_bytes());
        Ok(buf)
    }

    /// Decode a request from the wire. The probe path never receives
    /// requests; this exists for echo harnesses and loopback tests.
    pub fn decode(buf: &'a [u8]) -> Result<Self, WireError> {
        if buf.len() < MIN_REQUEST_LEN {
            return Err(WireError::TooShort(buf.len()));
        }
        if buf[0] != REQUEST_MAGIC {
            return Err(WireError::BadMagic(buf[0]));
        }
        let version = buf[1] >> 4;
        if version != WIRE_VERSION {
            return Err(WireError::BadVersion(version));
        }
        let title_len = buf[2];
        if title_len == 0 || buf.len() != REQUEST_OVERHEAD + title_len as usize - 1 {
            return Err(WireError::TitleLengthMismatch(title_len));
        }
        let title_end = 3 + title_len as usize - 1;
        let title = std::str::from_utf8(&buf[3..title_end]).map_err(|_| WireError::TitleNotUtf8)?;

        Ok(ProbeRequest {
            title,
            sequence: buf[title_end],
            identifier: u16::from_ne_bytes(buf[title_end + 1..title_end + 3].try_into().unwrap()),
            timestamp_ms: u64::from_ne_bytes(
                buf[title_end + 3..title_end + 11].try_into().unwrap(),
            ),
        })
    }
}

// ── Response ──────────────────────────────────────────────────────────────────

/// A probe response as it came off the wire. [`ProbeResponse::decode`] only
/// establishes that the bytes are a response at all; callers check the
/// echoed identifier against their own state and then [`verify`] the rest.
///
/// [`verify`]: ProbeResponse::verify
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResponse {
    pub ver_and_flow: u8,
    pub sequence: u8,
    pub identifier: u16,
    pub timestamp_ms: u64,
}

impl ProbeResponse {
    /// Parse the fixed 13-byte layout. Fails on truncated packets and wrong
    /// magic; version and sequence are checked by [`ProbeResponse::verify`].
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < MIN_RESPONSE_LEN {
            return Err(WireError::TooShort(buf.len()));
        }
        if buf[0] != RESPONSE_MAGIC {
            return Err(WireError::BadMagic(buf[0]));
        }
        Ok(ProbeResponse {
            ver_and_flow: buf[1],
            sequence: buf[2],
            identifier: u16::from_ne_bytes(buf[3..5].try_into().unwrap()),
            timestamp_ms: u64::from_ne_bytes(buf[5..13].try_into().unwrap()),
        })
    }

    /// Check version and sequence range. `max_sequence` is the highest
    /// sequence this burst actually sent.
    pub fn verify(&self, max_sequence: u8) -> Result<(), WireError> {
        let version = self.ver_and_flow >> 4;
        if version != WIRE_VERSION {
            return Err(WireError::BadVersion(version));
        }
        if self.sequence > max_sequence {
            return Err(WireError::SequenceOutOfRange {
                sequence: self.sequence,
                max: max_sequence,
            });
        }
        Ok(())
    }

    /// The server-applied flow control from the low nibble.
    pub fn flow_control(&self) -> FlowControl {
        FlowControl::from_nibble(self.ver_and_flow & 0x0f)
    }

    /// Encode to the on-wire byte layout. The client never sends responses;
    /// this exists for echo harnesses and loopback tests.
    pub fn encode(&self) -> [u8; MIN_RESPONSE_LEN] {
        let mut buf = [0u8; MIN_RESPONSE_LEN];
        buf[0] = RESPONSE_MAGIC;
        buf[1] = self.ver_and_flow;
        buf[2] = self.sequence;
        buf[3..5].copy_from_slice(&self.identifier.to_ne_bytes());
        buf[5..13].copy_from_slice(&self.timestamp_ms.to_ne_bytes());
        buf
    }

    /// Build the response a well-behaved server would send for `request`,
    /// with `flow` applied. Test-harness companion to [`ProbeRequest::decode`].
    pub fn echoing(request: &ProbeRequest<'_>, flow: FlowControl) -> Self {
        ProbeResponse {
            ver_and_flow: (WIRE_VERSION << 4) | flow.to_nibble(),
            sequence: request.sequence,
            identifier: request.identifier,
            timestamp_ms: request.timestamp_ms,
        }
    }
}

// ── Time ──────────────────────────────────────────────────────────────────────

/// Milliseconds since the unix epoch, as stamped into probe requests.
pub fn now_unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
