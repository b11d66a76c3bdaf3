//! SWO framer: turns [`ItmPacket`]s carrying the TI SWO overlay protocol
//! into [`SwoRecord`]s.
//!
//! Ported from `examples/original_source/tools/logger/swo/swo_framer.py`
//! (`SWOFramer`). Software-source packets are demultiplexed by stimulus
//! port: a header packet on [`itm::stimulus_port::HEADER`] looks up an
//! [`ElfString`] in the trace DB and opens a new record; continuation
//! bytes then arrive on the idle or trace ports depending on whether the
//! record is deferred (queued by the device, drained FIFO) or immediate
//! (drained LIFO, so a newer record can interleave with an older one
//! still in flight).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::convert::TryFrom;

use thiserror::Error;

use crate::itm::{build_value, stimulus_port, Direction, ItmPacket};

const SWO_SWIT_SIZE: usize = 4;
const SWO_RESET_TOKEN: [u8; 4] = [0xBB, 0xBB, 0xBB, 0xBB];
const SWO_BUFFER_OVERFLOW_TOKEN: u32 = 0xCCCC_CCCC;

/// Identifies which [`ElfString`] row layout and which [`SwoRecord`]
/// variant a header packet decodes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub enum SwoOpcode {
    FormattedText,
    Event,
    EventSetStart,
    EventSetEnd,
    Buffer,
    BufferOverflow,
    Watchpoint,
    SyncTime,
    HwDataTrace,
    EventSet,
    PcSampleTrace,
    Reset,
    EventCreation,
}

/// A trace-DB row: the opcode it was filed under and its raw
/// colon-triple-delimited value, not yet split into fields (the field
/// layout is opcode-dependent).
#[derive(Debug, Clone)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub struct ElfString {
    pub opcode: SwoOpcode,
    pub value: String,
}

/// Everything the SWO framer needs from the trace DB: header lookups,
/// event-creation strings, and PC-to-function resolution. Kept as a
/// trait so `swo` never depends on `object`/`gimli` directly.
pub trait SwoSymbols {
    fn trace_entry(&self, header: u32) -> Option<ElfString>;
    fn event_string(&self, key: &str) -> Option<String>;
    fn resolve_pc(&self, pc: u32) -> Option<(String, String, u32)>;
}

#[derive(Debug, Error)]
pub enum SwoError {
    #[error("no trace database entry at address {0:#010x}")]
    AddressNotInTraceMap(u32),
    #[error("unknown SWO opcode for elf string at {0:#010x}")]
    UnknownOpcode(u32),
    #[error("malformed elf string for opcode {opcode:?}: {value:?}")]
    MalformedElfString { opcode: SwoOpcode, value: String },
    #[error("event set underflow: no open event set for handle {0}")]
    EventSetUnderflow(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeSyncState {
    Seconds,
    Subseconds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    EventSetInfo,
    Length,
    Data,
}

/// Timing and source-location fields common to every record, mirroring
/// the flattened `SWOFrame` base class.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordMeta {
    pub rat_ts_s: f64,
    pub rtc_ts_s: f64,
    pub rat_ts_t: f64,
    pub file: String,
    pub line: String,
    pub level: String,
    pub module: String,
    /// Whether the sink should surface this record on its own. Members of
    /// an in-progress event set are `false`; only the synthesized
    /// `SwoRecord::EventSet` that replaces them is `true`.
    pub output: bool,
}

impl Default for RecordMeta {
    fn default() -> Self {
        RecordMeta {
            rat_ts_s: 0.0,
            rtc_ts_s: 0.0,
            rat_ts_t: 0.0,
            file: String::new(),
            line: String::new(),
            level: String::new(),
            module: String::new(),
            output: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SwoRecord {
    FormattedText {
        meta: RecordMeta,
        string: String,
        is_event_set: bool,
        record: Option<u8>,
        handle: Option<u8>,
    },
    Event {
        meta: RecordMeta,
        string: String,
        event: String,
        values: Vec<u32>,
    },
    EventSetStart {
        meta: RecordMeta,
        handle: u8,
        event: String,
    },
    EventSetEnd {
        meta: RecordMeta,
        handle: u8,
    },
    EventSet {
        meta: RecordMeta,
        event: String,
        string: String,
        records: Vec<SwoRecord>,
    },
    Buffer {
        meta: RecordMeta,
        string: String,
        data: Vec<u8>,
        is_event_set: bool,
        record: Option<u8>,
        handle: Option<u8>,
    },
    BufferOverflow {
        meta: RecordMeta,
    },
    WatchpointEnable {
        meta: RecordMeta,
        watchpoint: u8,
        function: String,
        wp_string: String,
    },
    Reset {
        meta: RecordMeta,
    },
    HwDataTrace {
        meta: RecordMeta,
        comparator: u8,
        direction: Direction,
        packet_type: u8,
        wp_string: String,
        value: u32,
    },
    HwPcSample {
        meta: RecordMeta,
        function: String,
    },
}

fn split_fields(value: &str) -> Vec<&str> {
    value.split(":::").collect()
}

fn is_truthy_flag(raw: &str) -> bool {
    !matches!(raw, "0" | "0U" | "FALSE")
}

#[derive(Debug, Clone)]
enum InProgressKind {
    FormattedText {
        string: String,
        nargs_match: bool,
        values: Vec<u32>,
        record: Option<u8>,
        handle: Option<u8>,
    },
    Event {
        string: String,
        event: String,
        values: Vec<u32>,
    },
    EventSetStart {
        event: String,
        handle: Option<u8>,
    },
    EventSetEnd {
        handle: Option<u8>,
    },
    Buffer {
        string: String,
        data: Vec<u8>,
        record: Option<u8>,
        handle: Option<u8>,
    },
    WatchpointEnable {
        watchpoint: u8,
        function: String,
        wp_string: String,
    },
}

#[derive(Debug, Clone)]
struct InProgress {
    meta: RecordMeta,
    opcode: SwoOpcode,
    deferred: bool,
    is_event_set: bool,
    remaining_length: usize,
    parse_state: ParseState,
    kind: InProgressKind,
}

impl InProgress {
    fn new(
        opcode: SwoOpcode,
        meta: RecordMeta,
        value: &str,
        symbols: &dyn SwoSymbols,
    ) -> Result<Self, SwoError> {
        let fields = split_fields(value);
        let malformed = || SwoError::MalformedElfString {
            opcode,
            value: value.to_string(),
        };

        match opcode {
            SwoOpcode::FormattedText => {
                let [deferred, is_event_set, file, line, level, module, string, nargs] =
                    <[&str; 8]>::try_from(fields).map_err(|_| malformed())?;
                let nargs: usize = nargs.parse().map_err(|_| malformed())?;
                let mut string = string.to_string();
                let percent_count = string.matches('%').count();
                let nargs_match = nargs == percent_count;
                if nargs > 1 && !nargs_match {
                    string.push_str("[ARGUMENT MISMATCH]");
                }
                let is_event_set = is_truthy_flag(is_event_set);
                let mut remaining_length = nargs * SWO_SWIT_SIZE;
                let parse_state = if is_event_set {
                    remaining_length += 2;
                    ParseState::EventSetInfo
                } else {
                    ParseState::Data
                };
                Ok(InProgress {
                    meta: RecordMeta {
                        file: file.to_string(),
                        line: line.to_string(),
                        level: level.to_string(),
                        module: module.to_string(),
                        ..meta
                    },
                    opcode,
                    deferred: is_truthy_flag(deferred),
                    is_event_set,
                    remaining_length,
                    parse_state,
                    kind: InProgressKind::FormattedText {
                        string,
                        nargs_match,
                        values: Vec::new(),
                        record: None,
                        handle: None,
                    },
                })
            }
            SwoOpcode::Event => {
                let [deferred, is_event_set, file, line, level, module, event, count] =
                    <[&str; 8]>::try_from(fields).map_err(|_| malformed())?;
                let count: i64 = count.parse().map_err(|_| malformed())?;
                let string = symbols
                    .event_string(&format!("{module}{event}"))
                    .ok_or_else(malformed)?;
                Ok(InProgress {
                    meta: RecordMeta {
                        file: file.to_string(),
                        line: line.to_string(),
                        level: level.to_string(),
                        module: module.to_string(),
                        ..meta
                    },
                    opcode,
                    deferred: is_truthy_flag(deferred),
                    is_event_set: is_truthy_flag(is_event_set),
                    remaining_length: ((count - 1).max(0) as usize) * SWO_SWIT_SIZE,
                    parse_state: ParseState::Data,
                    kind: InProgressKind::Event {
                        string,
                        event: event.to_string(),
                        values: Vec::new(),
                    },
                })
            }
            SwoOpcode::EventSetStart => {
                // Field order matches the original layout for this opcode:
                // file/line precede module/level (swapped relative to the others).
                let [_, is_event_set, file, line, module, level, event, _] =
                    <[&str; 8]>::try_from(fields).map_err(|_| malformed())?;
                Ok(InProgress {
                    meta: RecordMeta {
                        file: file.to_string(),
                        line: line.to_string(),
                        level: level.to_string(),
                        module: module.to_string(),
                        ..meta
                    },
                    opcode,
                    deferred: false,
                    is_event_set: is_truthy_flag(is_event_set),
                    remaining_length: 1,
                    parse_state: ParseState::Data,
                    kind: InProgressKind::EventSetStart {
                        event: event.to_string(),
                        handle: None,
                    },
                })
            }
            SwoOpcode::EventSetEnd => {
                let [_, is_event_set, file, line, module, level, _, _] =
                    <[&str; 8]>::try_from(fields).map_err(|_| malformed())?;
                Ok(InProgress {
                    meta: RecordMeta {
                        file: file.to_string(),
                        line: line.to_string(),
                        level: level.to_string(),
                        module: module.to_string(),
                        ..meta
                    },
                    opcode,
                    deferred: false,
                    is_event_set: is_truthy_flag(is_event_set),
                    remaining_length: 1,
                    parse_state: ParseState::Data,
                    kind: InProgressKind::EventSetEnd { handle: None },
                })
            }
            SwoOpcode::Buffer => {
                let [deferred, is_event_set, file, line, level, module, string, _] =
                    <[&str; 8]>::try_from(fields).map_err(|_| malformed())?;
                let is_event_set = is_truthy_flag(is_event_set);
                Ok(InProgress {
                    meta: RecordMeta {
                        file: file.to_string(),
                        line: line.to_string(),
                        level: level.to_string(),
                        module: module.to_string(),
                        ..meta
                    },
                    opcode,
                    deferred: is_truthy_flag(deferred),
                    is_event_set,
                    remaining_length: if is_event_set { 6 } else { 4 },
                    parse_state: if is_event_set {
                        ParseState::EventSetInfo
                    } else {
                        ParseState::Length
                    },
                    kind: InProgressKind::Buffer {
                        string: string.to_string(),
                        data: Vec::new(),
                        record: None,
                        handle: None,
                    },
                })
            }
            SwoOpcode::Watchpoint => {
                let [watchpoint, function, file, line, level, module, wp_string, _] =
                    <[&str; 8]>::try_from(fields).map_err(|_| malformed())?;
                let watchpoint = watchpoint
                    .chars()
                    .last()
                    .and_then(|c| c.to_digit(10))
                    .ok_or_else(malformed)? as u8;
                Ok(InProgress {
                    meta: RecordMeta {
                        file: file.to_string(),
                        line: line.to_string(),
                        level: level.to_string(),
                        module: module.to_string(),
                        ..meta
                    },
                    opcode,
                    deferred: false,
                    is_event_set: false,
                    remaining_length: 0,
                    parse_state: ParseState::Data,
                    kind: InProgressKind::WatchpointEnable {
                        watchpoint,
                        function: function.to_string(),
                        wp_string: wp_string.to_string(),
                    },
                })
            }
            _ => Err(malformed()),
        }
    }

    /// Apply one continuation payload, handling the three-byte-payload
    /// quirk (spec open question: a nominally 4-byte packet arriving with
    /// only 3 usable bytes drops the last byte rather than erroring).
    fn feed(&mut self, payload: &[u8]) {
        let payload = if self.remaining_length == 3 && payload.len() > 3 {
            &payload[..3]
        } else {
            payload
        };
        self.remaining_length = self.remaining_length.saturating_sub(payload.len());

        match (&mut self.kind, self.parse_state) {
            (InProgressKind::FormattedText { record, handle, .. }, ParseState::EventSetInfo) => {
                if payload.len() == 2 {
                    *record = Some(payload[0]);
                    *handle = Some(payload[1]);
                }
                self.parse_state = ParseState::Data;
            }
            (
                InProgressKind::FormattedText {
                    nargs_match, values, ..
                },
                ParseState::Data,
            ) => {
                if *nargs_match {
                    values.push(build_value(payload));
                }
            }
            (InProgressKind::Event { values, .. }, ParseState::Data) => {
                values.push(build_value(payload));
            }
            (InProgressKind::EventSetStart { handle, .. }, ParseState::Data) => {
                if let Some(&b) = payload.first() {
                    *handle = Some(b);
                }
            }
            (InProgressKind::EventSetEnd { handle, .. }, ParseState::Data) => {
                if let Some(&b) = payload.first() {
                    *handle = Some(b);
                }
            }
            (InProgressKind::Buffer { record, handle, .. }, ParseState::EventSetInfo) => {
                if payload.len() == 2 {
                    *record = Some(payload[0]);
                    *handle = Some(payload[1]);
                }
                self.parse_state = ParseState::Length;
            }
            (InProgressKind::Buffer { .. }, ParseState::Length) => {
                self.remaining_length = build_value(payload) as usize;
                self.parse_state = ParseState::Data;
            }
            (InProgressKind::Buffer { data, .. }, ParseState::Data) => {
                data.extend_from_slice(payload);
            }
            _ => {}
        }
    }

    fn into_record(self) -> SwoRecord {
        match self.kind {
            InProgressKind::FormattedText {
                mut string,
                values,
                record,
                handle,
                ..
            } => {
                if self.remaining_length == 0 && !values.is_empty() {
                    string = format_with_values(&string, &values);
                }
                SwoRecord::FormattedText {
                    meta: self.meta,
                    string,
                    is_event_set: self.is_event_set,
                    record,
                    handle,
                }
            }
            InProgressKind::Event {
                string,
                event,
                values,
            } => SwoRecord::Event {
                meta: self.meta,
                string,
                event,
                values,
            },
            InProgressKind::EventSetStart { event, handle } => SwoRecord::EventSetStart {
                meta: self.meta,
                handle: handle.unwrap_or_default(),
                event,
            },
            InProgressKind::EventSetEnd { handle } => SwoRecord::EventSetEnd {
                meta: self.meta,
                handle: handle.unwrap_or_default(),
            },
            InProgressKind::Buffer {
                string,
                data,
                record,
                handle,
            } => SwoRecord::Buffer {
                meta: self.meta,
                string,
                data,
                is_event_set: self.is_event_set,
                record,
                handle,
            },
            InProgressKind::WatchpointEnable {
                watchpoint,
                function,
                wp_string,
            } => SwoRecord::WatchpointEnable {
                meta: self.meta,
                watchpoint,
                function,
                wp_string,
            },
        }
    }

    fn handle(&self) -> Option<u8> {
        match &self.kind {
            InProgressKind::FormattedText { handle, .. } => *handle,
            InProgressKind::Buffer { handle, .. } => *handle,
            InProgressKind::EventSetStart { handle, .. } => *handle,
            InProgressKind::EventSetEnd { handle, .. } => *handle,
            _ => None,
        }
    }

    fn record_index(&self) -> Option<u8> {
        match &self.kind {
            InProgressKind::FormattedText { record, .. } => *record,
            InProgressKind::Buffer { record, .. } => *record,
            _ => None,
        }
    }
}

/// Pads a rendered numeric/string token to `width`, per the flags seen before
/// the conversion character (`0` pads with zeroes unless left-justified,
/// `-` left-justifies with spaces).
fn pad_token(token: &str, width: usize, zero: bool, left: bool) -> String {
    if token.len() >= width {
        return token.to_string();
    }
    let fill = if zero && !left { '0' } else { ' ' };
    let padding: String = std::iter::repeat(fill).take(width - token.len()).collect();
    if left {
        format!("{token}{padding}")
    } else {
        format!("{padding}{token}")
    }
}

/// Substitutes `values` into `template`'s printf-style conversions, mirroring
/// `swo_framer.py`'s `self.string % tuple(self.values)`. Every argument is a
/// raw 4-byte word (`build_value`'s output), so `%s` renders the same decimal
/// text Python's `%`-operator would produce for an integer argument. Supports
/// the flag/width prefixes (`0`, `-`, digits) and conversions (`d`, `u`, `x`,
/// `X`, `o`, `c`, `f`, `s`, `%`) seen in firmware format strings.
fn format_with_values(template: &str, values: &[u32]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut values = values.iter();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut zero = false;
        let mut left = false;
        let mut width = 0usize;
        loop {
            match chars.peek() {
                Some('0') if width == 0 && !zero => {
                    zero = true;
                    chars.next();
                }
                Some('-') => {
                    left = true;
                    chars.next();
                }
                Some('+') | Some(' ') | Some('#') => {
                    chars.next();
                }
                Some(d) if d.is_ascii_digit() => {
                    width = width * 10 + d.to_digit(10).unwrap() as usize;
                    chars.next();
                }
                _ => break,
            }
        }
        match chars.peek().copied() {
            Some('%') => {
                chars.next();
                out.push('%');
            }
            Some(conv @ ('d' | 'u' | 's' | 'x' | 'X' | 'o' | 'c' | 'f')) => {
                chars.next();
                match values.next() {
                    Some(v) => {
                        let token = match conv {
                            'd' => (*v as i32).to_string(),
                            'x' => format!("{v:x}"),
                            'X' => format!("{v:X}"),
                            'o' => format!("{v:o}"),
                            'c' => (*v as u8 as char).to_string(),
                            'f' => format!("{:.6}", *v as f64),
                            _ => v.to_string(),
                        };
                        out.push_str(&pad_token(&token, width, zero, left));
                    }
                    None => {
                        out.push('%');
                        out.push(conv);
                    }
                }
            }
            Some(other) => {
                out.push('%');
                out.push(other);
                chars.next();
            }
            None => out.push('%'),
        }
    }
    out
}

/// Human-readable access-type text for a hardware data-trace hit, keyed on
/// `direction + (packet_type << 1)` exactly as `itm_framer.py`'s `accessDict`
/// does.
pub(crate) fn access_description(direction: Direction, packet_type: u8) -> &'static str {
    let direction_bit = match direction {
        Direction::Read => 0u8,
        Direction::Write => 1u8,
    };
    match direction_bit + (packet_type << 1) {
        2 => "PC value Access",
        3 => "Address access",
        4 => "Read Access",
        5 => "Write Access",
        _ => "Unknown Access",
    }
}

/// Drives the SWO state machine: port demultiplexing, event-set
/// assembly, and RAT/RTC timestamp bookkeeping.
pub struct SwoFramer {
    deferred: VecDeque<InProgress>,
    immediate: VecDeque<InProgress>,
    event_sets: HashMap<u8, BTreeMap<u8, SwoRecord>>,
    watchpoints: [Option<String>; 4],
    rat_t: f64,
    rat_s: f64,
    rtc_s: f64,
    offset: f64,
    clock_hz: f64,
    baudrate: f64,
    time_sync_state: TimeSyncState,
}

impl SwoFramer {
    pub fn new(clock_hz: u32, baudrate: u32) -> Self {
        SwoFramer {
            deferred: VecDeque::new(),
            immediate: VecDeque::new(),
            event_sets: HashMap::new(),
            watchpoints: Default::default(),
            rat_t: 0.0,
            rat_s: 0.0,
            rtc_s: 0.0,
            offset: 0.0,
            clock_hz: clock_hz as f64,
            baudrate: baudrate as f64,
            time_sync_state: TimeSyncState::Seconds,
        }
    }

    fn current_meta(&self) -> RecordMeta {
        RecordMeta {
            rat_ts_s: self.rat_s + self.offset,
            rtc_ts_s: self.rtc_s + self.offset,
            rat_ts_t: self.rat_t,
            ..Default::default()
        }
    }

    /// Parse one ITM packet, returning zero or more completed SWO
    /// records (an event-set member completes on its own and, when it
    /// is the closing record, a combined [`SwoRecord::EventSet`] is
    /// emitted alongside it).
    pub fn parse(&mut self, packet: &ItmPacket, symbols: &dyn SwoSymbols) -> Vec<SwoRecord> {
        match packet {
            ItmPacket::LocalTimestamp { delta, .. } => {
                self.rtc_s += *delta as f64 / self.clock_hz;
                let (rat_s, rat_t) = rat_from_rtc(self.rtc_s);
                self.rat_s = rat_s;
                self.rat_t = rat_t;
                self.offset = 0.0;
                Vec::new()
            }
            ItmPacket::SourceSoftware { port, payload, size } => {
                self.offset += *size as f64 / self.baudrate;
                self.handle_software_source(*port, payload, symbols)
            }
            ItmPacket::SourceHardwareDataTrace {
                comparator,
                direction,
                packet_type,
                payload,
                size,
            } => {
                self.offset += *size as f64 / self.baudrate;
                let wp_string = self.watchpoints[*comparator as usize]
                    .clone()
                    .unwrap_or_else(|| "<unknown watchpoint>".to_string());
                let record = SwoRecord::HwDataTrace {
                    meta: self.current_meta(),
                    comparator: *comparator,
                    direction: *direction,
                    packet_type: *packet_type,
                    wp_string,
                    value: build_value(payload),
                };
                vec![record]
            }
            ItmPacket::SourceHardwarePcSample { pc: Some(pc), size } => {
                self.offset += *size as f64 / self.baudrate;
                match symbols.resolve_pc(*pc) {
                    Some((function, file, line)) => vec![SwoRecord::HwPcSample {
                        meta: RecordMeta {
                            file,
                            line: line.to_string(),
                            ..self.current_meta()
                        },
                        function,
                    }],
                    None => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }

    fn handle_software_source(
        &mut self,
        port: u8,
        payload: &[u8],
        symbols: &dyn SwoSymbols,
    ) -> Vec<SwoRecord> {
        match port {
            stimulus_port::HEADER => self.handle_header(payload, symbols),
            stimulus_port::IDLE => {
                let Some(mut frame) = self.deferred.pop_front() else {
                    tracing::warn!("FRAMING: idle port byte with no deferred frame in flight");
                    return Vec::new();
                };
                frame.feed(payload);
                self.finish_or_requeue(frame, true)
            }
            stimulus_port::TRACE => {
                let Some(mut frame) = self.immediate.pop_back() else {
                    tracing::warn!("FRAMING: trace port byte with no immediate frame in flight");
                    return Vec::new();
                };
                frame.feed(payload);
                self.finish_or_requeue(frame, false)
            }
            stimulus_port::SYNC_TIME => {
                match self.time_sync_state {
                    TimeSyncState::Seconds => {
                        self.rtc_s = build_value(payload) as f64;
                        self.time_sync_state = TimeSyncState::Subseconds;
                    }
                    TimeSyncState::Subseconds => {
                        self.rtc_s += build_value(payload) as f64 / 2f64.powi(32);
                        let (rat_s, rat_t) = rat_from_rtc(self.rtc_s);
                        self.rat_s = rat_s;
                        self.rat_t = rat_t;
                        self.time_sync_state = TimeSyncState::Seconds;
                    }
                }
                Vec::new()
            }
            stimulus_port::DRIVER => {
                if contains_subslice(payload, &SWO_RESET_TOKEN) {
                    vec![SwoRecord::Reset {
                        meta: self.current_meta(),
                    }]
                } else if build_value(payload) == SWO_BUFFER_OVERFLOW_TOKEN {
                    self.deferred.pop_back();
                    vec![SwoRecord::BufferOverflow {
                        meta: self.current_meta(),
                    }]
                } else {
                    Vec::new()
                }
            }
            _ => {
                tracing::trace!(port, "FRAMING: raw ITM data on unrouted stimulus port");
                Vec::new()
            }
        }
    }

    fn handle_header(&mut self, payload: &[u8], symbols: &dyn SwoSymbols) -> Vec<SwoRecord> {
        let header = build_value(payload);
        let Some(elf_string) = symbols.trace_entry(header) else {
            tracing::warn!(
                address = format!("{header:#010x}"),
                "FRAMING: corruption: no trace database information"
            );
            return Vec::new();
        };

        let meta = self.current_meta();
        let frame = match InProgress::new(elf_string.opcode, meta, &elf_string.value, symbols) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "FRAMING: corruption: unable to build frame");
                return Vec::new();
            }
        };

        if frame.remaining_length == 0 {
            return self.complete(frame);
        }

        if frame.deferred {
            self.deferred.push_back(frame);
        } else {
            self.immediate.push_back(frame);
        }
        Vec::new()
    }

    fn finish_or_requeue(&mut self, frame: InProgress, deferred_queue: bool) -> Vec<SwoRecord> {
        if frame.remaining_length > 0 {
            if deferred_queue {
                self.deferred.push_front(frame);
            } else {
                self.immediate.push_back(frame);
            }
            return Vec::new();
        }
        self.complete(frame)
    }

    fn complete(&mut self, mut frame: InProgress) -> Vec<SwoRecord> {
        let opcode = frame.opcode;
        let is_event_set = frame.is_event_set;
        let handle = frame.handle();
        let record_index = frame.record_index();

        if opcode == SwoOpcode::Watchpoint {
            if let InProgressKind::WatchpointEnable {
                watchpoint,
                function,
                wp_string,
            } = &frame.kind
            {
                let idx = (*watchpoint as usize) % self.watchpoints.len();
                self.watchpoints[idx] = Some(format!("{wp_string} ({function})"));
            }
        }

        // Event-set members are suppressed individually; only the
        // synthesized EventSet on EventSetEnd is meant for the sink.
        frame.meta.output = !is_event_set;

        let record = frame.into_record();

        if !is_event_set {
            return vec![record];
        }

        let Some(handle) = handle else {
            return vec![record];
        };

        if opcode == SwoOpcode::EventSetStart {
            self.event_sets.entry(handle).or_default();
            return vec![record];
        }

        if opcode == SwoOpcode::EventSetEnd {
            let Some(members) = self.event_sets.remove(&handle) else {
                tracing::warn!(handle, "FRAMING: event set underflow");
                return vec![record];
            };
            let (event, string, mut meta) = match members.values().next() {
                Some(SwoRecord::FormattedText { string, meta, .. })
                | Some(SwoRecord::Buffer { string, meta, .. }) => {
                    (String::new(), string.clone(), meta.clone())
                }
                _ => (String::new(), String::new(), record_meta_of(&record)),
            };
            meta.output = true;
            let set = SwoRecord::EventSet {
                meta,
                event,
                string,
                records: members.into_values().collect(),
            };
            return vec![record, set];
        }

        if let Some(index) = record_index {
            self.event_sets
                .entry(handle)
                .or_default()
                .insert(index, record.clone());
        }
        vec![record]
    }
}

impl SwoRecord {
    pub fn meta(&self) -> &RecordMeta {
        match self {
            SwoRecord::FormattedText { meta, .. }
            | SwoRecord::Event { meta, .. }
            | SwoRecord::EventSetStart { meta, .. }
            | SwoRecord::EventSetEnd { meta, .. }
            | SwoRecord::EventSet { meta, .. }
            | SwoRecord::Buffer { meta, .. }
            | SwoRecord::BufferOverflow { meta }
            | SwoRecord::WatchpointEnable { meta, .. }
            | SwoRecord::Reset { meta }
            | SwoRecord::HwDataTrace { meta, .. }
            | SwoRecord::HwPcSample { meta, .. } => meta,
        }
    }

    pub fn opcode_name(&self) -> &'static str {
        match self {
            SwoRecord::FormattedText { .. } => "FORMATTED_TEXT",
            SwoRecord::Event { .. } => "EVENT",
            SwoRecord::EventSetStart { .. } => "EVENT_SET_START",
            SwoRecord::EventSetEnd { .. } => "EVENT_SET_END",
            SwoRecord::EventSet { .. } => "EVENT_SET",
            SwoRecord::Buffer { .. } => "BUFFER",
            SwoRecord::BufferOverflow { .. } => "BUFFER_OVERFLOW",
            SwoRecord::WatchpointEnable { .. } => "WATCHPOINT_ENABLE",
            SwoRecord::Reset { .. } => "RESET",
            SwoRecord::HwDataTrace { .. } => "HW_DATA_TRACE",
            SwoRecord::HwPcSample { .. } => "HW_PC_SAMPLE",
        }
    }
}

fn record_meta_of(record: &SwoRecord) -> RecordMeta {
    record.meta().clone()
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

/// Converts a real-time-clock reading (seconds) into the radio-access-
/// time domain. Ported bit-exact from `rat_from_rtc` in
/// `swo_framer.py`, including its RTC-seconds-minus-scaled-RTC-seconds
/// step — preserved as specified rather than "corrected".
pub fn rat_from_rtc(rtc_s: f64) -> (f64, f64) {
    let rtc_sec = (rtc_s.floor() * 32768.0) as i64;
    let rtc_subsec = ((rtc_s - rtc_sec as f64) * 2f64.powi(32)) as i64;
    let mut new_rat = ((rtc_sec as i128) << 32) + rtc_subsec as i128;
    new_rat += 4_294_967_296i128 / 32768;
    new_rat *= 4_000_000;
    new_rat /= 4_294_967_296i128;
    let rat_t = new_rat as f64;
    let rat_s = rat_t / 4_000_000.0;
    (rat_s, rat_t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::itm::TimestampRelation;

    struct FakeSymbols {
        trace: HashMap<u32, ElfString>,
        events: HashMap<String, String>,
    }

    impl SwoSymbols for FakeSymbols {
        fn trace_entry(&self, header: u32) -> Option<ElfString> {
            self.trace.get(&header).cloned()
        }
        fn event_string(&self, key: &str) -> Option<String> {
            self.events.get(key).cloned()
        }
        fn resolve_pc(&self, _pc: u32) -> Option<(String, String, u32)> {
            None
        }
    }

    fn elf(opcode: SwoOpcode, value: &str) -> ElfString {
        ElfString {
            opcode,
            value: value.to_string(),
        }
    }

    #[test]
    fn local_timestamp_accumulates_rtc_seconds() {
        let mut framer = SwoFramer::new(48_000_000, 12_000_000);
        let symbols = FakeSymbols {
            trace: HashMap::new(),
            events: HashMap::new(),
        };
        framer.parse(
            &ItmPacket::LocalTimestamp {
                delta: 1000,
                relation: TimestampRelation::InSync,
                size: 2,
            },
            &symbols,
        );
        framer.parse(
            &ItmPacket::LocalTimestamp {
                delta: 2000,
                relation: TimestampRelation::InSync,
                size: 2,
            },
            &symbols,
        );
        assert!((framer.rtc_s - 3000.0 / 48_000_000.0).abs() < 1e-12);
    }

    #[test]
    fn sync_time_two_phase_fsm() {
        let mut framer = SwoFramer::new(48_000_000, 12_000_000);
        let symbols = FakeSymbols {
            trace: HashMap::new(),
            events: HashMap::new(),
        };
        framer.handle_software_source(stimulus_port::SYNC_TIME, &[5, 0, 0, 0], &symbols);
        framer.handle_software_source(stimulus_port::SYNC_TIME, &[0, 0, 0, 0x80], &symbols);
        assert!((framer.rtc_s - 5.5).abs() < 1e-9);
    }

    #[test]
    fn three_byte_quirk_drops_last_byte() {
        let mut framer = SwoFramer::new(48_000_000, 12_000_000);
        let mut trace = HashMap::new();
        trace.insert(
            0x6000_0000,
            elf(SwoOpcode::Event, "0:::0:::f.c:::1:::INFO:::mod:::ev:::2"),
        );
        let symbols = FakeSymbols {
            trace,
            events: {
                let mut m = HashMap::new();
                m.insert("modev".to_string(), "fired".to_string());
                m
            },
        };
        framer.handle_header(&[0x00, 0x00, 0x00, 0x60], &symbols);
        let mut frame = framer.immediate.pop_back().unwrap();
        assert_eq!(frame.remaining_length, 4);
        // Force the odd-remainder case a 3-then-1-byte split would otherwise hit:
        // only 3 usable bytes remain on what is necessarily a 4-byte wire packet.
        frame.remaining_length = 3;
        frame.feed(&[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(frame.remaining_length, 0);
        match &frame.kind {
            InProgressKind::Event { values, .. } => {
                assert_eq!(values, &vec![build_value(&[0x01, 0x02, 0x03])]);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn buffer_overflow_drops_a_deferred_entry() {
        let mut framer = SwoFramer::new(48_000_000, 12_000_000);
        let symbols = FakeSymbols {
            trace: HashMap::new(),
            events: HashMap::new(),
        };
        framer.deferred.push_back(InProgress {
            meta: RecordMeta::default(),
            opcode: SwoOpcode::FormattedText,
            deferred: true,
            is_event_set: false,
            remaining_length: 4,
            parse_state: ParseState::Data,
            kind: InProgressKind::FormattedText {
                string: "x".into(),
                nargs_match: true,
                values: Vec::new(),
                record: None,
                handle: None,
            },
        });
        let records =
            framer.handle_software_source(stimulus_port::DRIVER, &[0xCC, 0xCC, 0xCC, 0xCC], &symbols);
        assert!(matches!(records[0], SwoRecord::BufferOverflow { .. }));
        assert!(framer.deferred.is_empty());
    }

    #[test]
    fn event_set_ordering_by_record_index() {
        let mut framer = SwoFramer::new(48_000_000, 12_000_000);
        let mut trace = HashMap::new();
        trace.insert(
            0x1000,
            elf(
                SwoOpcode::EventSetStart,
                ":::1:::f.c:::1:::mod:::INFO:::open:::0",
            ),
        );
        trace.insert(
            0x1004,
            elf(SwoOpcode::Buffer, "0:::1:::f.c:::1:::INFO:::mod:::rec:::0"),
        );
        trace.insert(
            0x1008,
            elf(
                SwoOpcode::EventSetEnd,
                ":::1:::f.c:::1:::mod:::INFO:::_:::0",
            ),
        );
        let symbols = FakeSymbols {
            trace,
            events: HashMap::new(),
        };

        framer.handle_header(&0x1000u32.to_le_bytes(), &symbols);
        framer.handle_software_source(stimulus_port::TRACE, &[7u8], &symbols);

        assert_eq!(framer.event_sets.len(), 1);
        assert!(framer.event_sets.contains_key(&7));
    }

    #[test]
    fn format_with_values_substitutes_mixed_printf_specifiers() {
        // Matches real firmware strings, e.g. "INFO: (%s:%d) %s" from
        // examples/original_source/tools/logger/modules.
        let out = format_with_values("INFO: (%s:%d) %s", &[42, 7, 99]);
        assert_eq!(out, "INFO: (42:7) 99");
    }

    #[test]
    fn format_with_values_handles_width_and_zero_padded_hex() {
        let out = format_with_values("addr=0x%08x", &[0xABCD]);
        assert_eq!(out, "addr=0x0000abcd");
    }

    #[test]
    fn format_with_values_handles_signed_decimal_and_unsigned() {
        let out = format_with_values("d=%d u=%u", &[u32::MAX, u32::MAX]);
        assert_eq!(out, "d=-1 u=4294967295");
    }

    #[test]
    fn access_description_matches_access_dict_table() {
        assert_eq!(access_description(Direction::Read, 1), "PC value Access");
        assert_eq!(access_description(Direction::Write, 1), "Address access");
        assert_eq!(access_description(Direction::Read, 2), "Read Access");
        assert_eq!(access_description(Direction::Write, 2), "Write Access");
    }
}
