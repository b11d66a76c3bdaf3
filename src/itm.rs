//! ITM framer: turns a raw byte stream into discrete ITM packets.
//!
//! The wire format is the ARM CoreSight ITM packet protocol with the TI SWO
//! overlay's reset-token convention layered on top (see
//! `examples/original_source/tools/logger/itm/itm_framer.py` for the
//! reference implementation this module is ported from). Parsing is
//! sans-I/O: [`ItmFramer::parse`] takes ownership of an accumulated byte
//! buffer and hands back both the packets it could decode and the
//! unconsumed tail, mirroring the push/pull shape of the teacher crate's
//! `Decoder`.

use bitmatch::bitmatch;
use thiserror::Error;

/// Bytes consumed once a header byte is popped, beyond which the loop
/// guard in [`ItmFramer::parse`] is satisfied to guarantee a full packet
/// is available to decode.
pub const MAX_ITM_FRAME_SIZE: usize = 5;

/// The five-byte token that marks the start of a fresh ITM/SWO session.
/// It is itself a well-formed software-source packet (driver port, 4-byte
/// payload `BB BB BB BB`).
pub const ITM_RESET_TOKEN: [u8; 5] = [0x63, 0xBB, 0xBB, 0xBB, 0xBB];

const HDR_OVERFLOW: u8 = 0x70;

/// Relationship between a [`ItmPacket::LocalTimestamp`] and the ITM/DWT
/// data packets it brackets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampRelation {
    InSync,
    TimestampDelayed,
    PacketDelayed,
    BothDelayed,
}

impl TimestampRelation {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => TimestampRelation::InSync,
            1 => TimestampRelation::TimestampDelayed,
            2 => TimestampRelation::PacketDelayed,
            _ => TimestampRelation::BothDelayed,
        }
    }
}

/// Whether a hardware exception packet reports entry, exit, or return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionFunction {
    Entered,
    Exited,
    Returned,
}

/// Direction of a hardware data-trace access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// A single decoded ITM packet, tagged by variant per spec section 3.
#[derive(Debug, Clone, PartialEq)]
pub enum ItmPacket {
    Synchronization {
        size: usize,
    },
    Overflow,
    LocalTimestamp {
        delta: u32,
        relation: TimestampRelation,
        size: usize,
    },
    Extension {
        data: Vec<u8>,
        size: usize,
    },
    SourceSoftware {
        port: u8,
        payload: Vec<u8>,
        size: usize,
    },
    SourceHardwareCounterWrap {
        bits: u8,
        size: usize,
    },
    SourceHardwareException {
        exception: u16,
        function: ExceptionFunction,
        size: usize,
    },
    SourceHardwarePcSample {
        pc: Option<u32>,
        size: usize,
    },
    SourceHardwareDataTrace {
        comparator: u8,
        direction: Direction,
        packet_type: u8,
        payload: Vec<u8>,
        size: usize,
    },
}

impl ItmPacket {
    /// Bytes consumed from the input stream to produce this packet,
    /// header included.
    pub fn size(&self) -> usize {
        match self {
            ItmPacket::Synchronization { size } => *size,
            ItmPacket::Overflow => 1,
            ItmPacket::LocalTimestamp { size, .. } => *size,
            ItmPacket::Extension { size, .. } => *size,
            ItmPacket::SourceSoftware { size, .. } => *size,
            ItmPacket::SourceHardwareCounterWrap { size, .. } => *size,
            ItmPacket::SourceHardwareException { size, .. } => *size,
            ItmPacket::SourceHardwarePcSample { size, .. } => *size,
            ItmPacket::SourceHardwareDataTrace { size, .. } => *size,
        }
    }
}

/// Stimulus ports used by the SWO overlay to multiplex software-source
/// packets. Values 16..=31 ("raw") and unused reserved ports are left as
/// plain `u8`s for the SWO framer to interpret.
pub mod stimulus_port {
    pub const SYNC_TIME: u8 = 11;
    pub const DRIVER: u8 = 12;
    pub const IDLE: u8 = 13;
    pub const HEADER: u8 = 14;
    pub const TRACE: u8 = 15;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ItmError {
    #[error("malformed ITM header byte {header:#04x}")]
    MalformedHeader { header: u8 },
    #[error("invalid hardware source discriminator {discriminator:#04x}")]
    InvalidHardwareDiscriminator { discriminator: u8 },
    #[error("invalid exception function bits {function:#04b}")]
    InvalidExceptionFunction { function: u8 },
}

/// Result of attempting to decode one packet from the front of a buffer.
enum Decoded {
    Packet(ItmPacket),
    /// The packet type is known but more bytes than currently available
    /// are required to complete it (unbounded synchronization run or an
    /// unterminated continuation sequence).
    Incomplete,
    Error(ItmError),
}

/// Converts an ITM byte stream into [`ItmPacket`]s, recovering framing
/// after arbitrary start points or resets.
#[derive(Debug, Default)]
pub struct ItmFramer {
    first_read: bool,
}

impl ItmFramer {
    pub fn new() -> Self {
        ItmFramer { first_read: true }
    }

    /// Parse as many packets as possible out of `buf`, returning them
    /// together with the unconsumed tail. `buf` is expected to be the
    /// concatenation of any previously returned tail with newly-arrived
    /// bytes.
    pub fn parse(&mut self, mut buf: Vec<u8>) -> (Vec<ItmPacket>, Vec<u8>) {
        if buf.is_empty() {
            return (Vec::new(), buf);
        }

        // The reset token may be split across reads; wait for more data
        // before deciding anything if the tail looks like a partial token.
        if matches!(buf.last(), Some(0xBB) | Some(0xC0)) {
            return (Vec::new(), buf);
        }

        if let Some(pos) = find_subslice(&buf, &ITM_RESET_TOKEN) {
            buf.drain(0..pos);
        } else if self.first_read {
            tracing::debug!("waiting for a reset frame to begin parsing");
            return (Vec::new(), Vec::new());
        }

        let mut packets = Vec::new();
        while buf.len() > MAX_ITM_FRAME_SIZE {
            self.first_read = false;
            let header = buf[0];
            match decode_one(&buf) {
                Decoded::Packet(packet) => {
                    buf.drain(0..packet.size());
                    packets.push(packet);
                }
                Decoded::Incomplete => break,
                Decoded::Error(e) => {
                    tracing::warn!(header = format!("{header:#04x}"), error = %e, "malformed ITM header, skipping one byte");
                    buf.remove(0);
                }
            }
        }

        (packets, buf)
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn translate_low2(bits: u8) -> usize {
    match bits & 0x3 {
        3 => 4,
        n => n as usize,
    }
}

pub fn build_value(bytes: &[u8]) -> u32 {
    let mut value: u32 = 0;
    for (i, b) in bytes.iter().enumerate() {
        value |= (*b as u32) << (8 * i);
    }
    value
}

/// Consume a continuation-bit-encoded sequence (7 bits per byte, MSB set
/// to continue) from `buf[start..]`. Returns `(value, bytes_consumed)` or
/// `None` if the terminating byte has not arrived yet.
fn consume_continuation(buf: &[u8], start: usize) -> Option<(u32, usize)> {
    let mut value: u32 = 0;
    for (idx, byte) in buf[start..].iter().enumerate() {
        value |= ((byte & 0x7F) as u32) << (7 * idx);
        if byte & 0x80 == 0 {
            return Some((value, idx + 1));
        }
    }
    None
}

#[bitmatch]
fn decode_one(buf: &[u8]) -> Decoded {
    let header = buf[0];
    let rest = &buf[1..];

    if header == 0x00 {
        return match rest.iter().position(|&b| b == 1) {
            Some(idx) => Decoded::Packet(ItmPacket::Synchronization { size: idx + 2 }),
            None => Decoded::Incomplete,
        };
    }

    if header & 0x03 == 0x00 {
        if header == HDR_OVERFLOW {
            return Decoded::Packet(ItmPacket::Overflow);
        }
        if header & 0x0F == 0x00 {
            let relation = TimestampRelation::from_bits(header >> 4);
            return if header & 0x80 != 0 {
                match consume_continuation(buf, 1) {
                    Some((delta, n)) => Decoded::Packet(ItmPacket::LocalTimestamp {
                        delta,
                        relation,
                        size: 1 + n,
                    }),
                    None => Decoded::Incomplete,
                }
            } else {
                Decoded::Packet(ItmPacket::LocalTimestamp {
                    delta: 0,
                    relation,
                    size: 1,
                })
            };
        }
        if header & 0x0B == 0x08 {
            return match consume_continuation(buf, 1) {
                Some((value, n)) => {
                    let mut data = Vec::with_capacity(n);
                    let mut remaining = value;
                    for _ in 0..n {
                        data.push((remaining & 0xFF) as u8);
                        remaining >>= 8;
                    }
                    Decoded::Packet(ItmPacket::Extension { data, size: 1 + n })
                }
                None => Decoded::Incomplete,
            };
        }
        return Decoded::Error(ItmError::MalformedHeader { header });
    }

    // Source packet category: bits[1:0] nonzero.
    #[bitmatch]
    let "aaaaa?ss" = header;
    let upper5 = a;
    let ss = s;

    if header & 0x04 == 0x00 {
        let size = translate_low2(ss);
        if rest.len() < size {
            return Decoded::Incomplete;
        }
        return Decoded::Packet(ItmPacket::SourceSoftware {
            port: upper5,
            payload: rest[..size].to_vec(),
            size: 1 + size,
        });
    }

    let discriminator = upper5;
    match discriminator {
        0 => {
            if rest.is_empty() {
                return Decoded::Incomplete;
            }
            Decoded::Packet(ItmPacket::SourceHardwareCounterWrap {
                bits: rest[0],
                size: 2,
            })
        }
        1 => {
            if rest.len() < 2 {
                return Decoded::Incomplete;
            }
            let exception = (rest[0] as u16) | (((rest[1] as u16) & 0x1) << 8);
            let function_bits = (rest[1] >> 4) & 0x3;
            let function = match function_bits {
                0b01 => ExceptionFunction::Entered,
                0b10 => ExceptionFunction::Exited,
                0b11 => ExceptionFunction::Returned,
                _ => {
                    return Decoded::Error(ItmError::InvalidExceptionFunction {
                        function: function_bits,
                    })
                }
            };
            Decoded::Packet(ItmPacket::SourceHardwareException {
                exception,
                function,
                size: 3,
            })
        }
        2 => {
            let size = translate_low2(ss);
            if rest.len() < size {
                return Decoded::Incomplete;
            }
            let pc = if size == 4 {
                Some(build_value(&rest[..4]))
            } else {
                None
            };
            Decoded::Packet(ItmPacket::SourceHardwarePcSample {
                pc,
                size: 1 + size,
            })
        }
        3..=23 => {
            let size = translate_low2(ss);
            if rest.len() < size {
                return Decoded::Incomplete;
            }
            let comparator = (discriminator >> 1) & 0x3;
            let direction = if discriminator & 0x1 == 0 {
                Direction::Read
            } else {
                Direction::Write
            };
            let packet_type = (discriminator >> 3) & 0x3;
            Decoded::Packet(ItmPacket::SourceHardwareDataTrace {
                comparator,
                direction,
                packet_type,
                payload: rest[..size].to_vec(),
                size: 1 + size,
            })
        }
        _ => Decoded::Error(ItmError::InvalidHardwareDiscriminator {
            discriminator,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_buffer_yields_nothing() {
        let mut framer = ItmFramer::new();
        let (packets, tail) = framer.parse(Vec::new());
        assert!(packets.is_empty());
        assert!(tail.is_empty());
    }

    #[test]
    fn waits_for_reset_before_parsing_anything() {
        let mut framer = ItmFramer::new();
        let (packets, tail) = framer.parse(vec![0xFF, 0xFF, 0xAA, 0x11, 0x22, 0x33, 0x44]);
        assert!(packets.is_empty());
        assert!(tail.is_empty());
    }

    #[test]
    fn reset_recovery_drops_preceding_garbage() {
        let mut framer = ItmFramer::new();
        let mut buf = vec![0xFF, 0xFF];
        buf.extend_from_slice(&ITM_RESET_TOKEN);
        // Header 0xAA: upper5 = 0b10101 (port 21), low2 bits = 0b10 -> size 2.
        buf.push(0xAA);
        let addr = [0x00, 0x01, 0x60, 0x00]; // 2-byte payload only consumes first two
        buf.extend_from_slice(&addr);

        let (packets, _tail) = framer.parse(buf);
        assert_eq!(packets.len(), 2);
        assert_eq!(
            packets[0],
            ItmPacket::SourceSoftware {
                port: stimulus_port::DRIVER,
                payload: vec![0xBB, 0xBB, 0xBB, 0xBB],
                size: 5,
            }
        );
        match &packets[1] {
            ItmPacket::SourceSoftware { payload, .. } => {
                assert_eq!(payload, &addr[..2]);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn split_reset_token_tail_is_held_back() {
        let mut framer = ItmFramer::new();
        let (packets, tail) = framer.parse(vec![0x63, 0xBB, 0xBB]);
        assert!(packets.is_empty());
        assert_eq!(tail, vec![0x63, 0xBB, 0xBB]);
    }

    #[test]
    fn overflow_packet() {
        let mut framer = ItmFramer::new();
        framer.first_read = false;
        let mut buf = vec![HDR_OVERFLOW];
        buf.extend_from_slice(&[0; 6]);
        let (packets, _) = framer.parse(buf);
        assert_eq!(packets[0], ItmPacket::Overflow);
    }

    #[test]
    fn local_timestamp_with_continuation() {
        let mut framer = ItmFramer::new();
        framer.first_read = false;
        // header top nibble 0xC => in sync, bit7 set => continuation follows.
        let mut buf = vec![0b1100_0000u8, 0b1000_0001, 0b0000_0010];
        buf.extend_from_slice(&[0; 5]);
        let (packets, _) = framer.parse(buf);
        match &packets[0] {
            ItmPacket::LocalTimestamp {
                delta, relation, ..
            } => {
                assert_eq!(*delta, 0x01 | (0x02 << 7));
                assert_eq!(*relation, TimestampRelation::InSync);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn malformed_header_is_skipped() {
        let mut framer = ItmFramer::new();
        framer.first_read = false;
        // 0x04 has low two bits zero but matches none of overflow/timestamp/extension.
        let mut buf = vec![0x04, HDR_OVERFLOW];
        buf.extend_from_slice(&[0; 6]);
        let (packets, _) = framer.parse(buf);
        assert_eq!(packets, vec![ItmPacket::Overflow]);
    }

    #[test]
    fn data_trace_discriminators_collapse_to_four_comparators() {
        // discriminator 0x08 and 0x0A both map to comparator (d>>1)&0x3 == 0.
        let mut framer = ItmFramer::new();
        framer.first_read = false;
        // header = (discriminator << 3) | 0b100 | ss; ss=0b11 => size 4.
        let header_a = (0x08u8 << 3) | 0b100 | 0b11;
        let header_b = (0x0Au8 << 3) | 0b100 | 0b11;
        let mut buf = vec![header_a, 1, 2, 3, 4, header_b, 5, 6, 7, 8];
        buf.extend_from_slice(&[0; 5]);
        let (packets, _) = framer.parse(buf);
        let comparators: Vec<u8> = packets
            .iter()
            .map(|p| match p {
                ItmPacket::SourceHardwareDataTrace { comparator, .. } => *comparator,
                other => panic!("unexpected packet: {other:?}"),
            })
            .collect();
        assert_eq!(comparators, vec![0, 1]);
    }

    #[test]
    fn tail_reparse_is_idempotent() {
        let mut buf = ITM_RESET_TOKEN.to_vec();
        buf.push(0xAA);
        buf.extend_from_slice(&[1, 2, 3, 4]);
        buf.push(HDR_OVERFLOW);
        buf.extend_from_slice(&[0; 6]);

        let mut one_shot = ItmFramer::new();
        let (all_packets, _) = one_shot.parse(buf.clone());

        let mut split = ItmFramer::new();
        let (mut first, tail) = split.parse(buf[..8].to_vec());
        let mut rest = tail;
        rest.extend_from_slice(&buf[8..]);
        let (second, _) = split.parse(rest);
        first.extend(second);

        assert_eq!(first, all_packets);
    }
}
