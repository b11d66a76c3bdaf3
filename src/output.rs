//! Output shaper: turns a completed [`SwoRecord`] into a flat list of
//! tagged [`OutputElement`]s, and serializes that list for one of two
//! sinks.
//!
//! Ported from `examples/original_source/tools/logger/wireshark_output/
//! wireshark_output.py` (`WSOutputElement`, `Protofields`,
//! `gandelf_send_data`, `wlogger_send_data`). The shaper itself never
//! touches a transport; `GandelfSink`/`WloggerSink` below are the two
//! serializers the original sends the shaped list to.

use std::io::{self, Write};

#[cfg(feature = "serde_json")]
use serde_json::{Map, Value};

use crate::swo::SwoRecord;

/// Well-known scalar field identifiers. Names match the strings the
/// original dissector expects verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoField {
    RatSeconds,
    RtcSeconds,
    RatTicks,
    Opcode,
    Module,
    Level,
    File,
    Line,
    Info,
    Event,
    StreamId,
}

impl ProtoField {
    fn label(self) -> &'static str {
        match self {
            ProtoField::RatSeconds => "Radio Time Secs",
            ProtoField::RtcSeconds => "Real Time Clock",
            ProtoField::RatTicks => "Radio Time Ticks",
            ProtoField::Opcode => "SWO opcode",
            ProtoField::Module => "SWO module",
            ProtoField::Level => "SWO level",
            ProtoField::File => "SWO file",
            ProtoField::Line => "SWO line",
            ProtoField::Info => "SWO info",
            ProtoField::Event => "SWO event",
            ProtoField::StreamId => "Stream ID",
        }
    }
}

/// One tagged element of a shaped record. A sink walks the list in
/// order; `OpenTree`/`CloseTree` pairs nest, everything else is a leaf
/// under whatever tree is currently open.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputElement {
    Field(ProtoField, String),
    OpenTree(String),
    CloseTree,
    Info(String),
    Custom(String, String),
}

fn record_header(record: &SwoRecord) -> Vec<OutputElement> {
    let meta = record.meta();
    vec![
        OutputElement::Field(ProtoField::RatSeconds, meta.rat_ts_s.to_string()),
        OutputElement::Field(ProtoField::RatTicks, meta.rat_ts_t.to_string()),
        OutputElement::Field(ProtoField::RtcSeconds, meta.rtc_ts_s.to_string()),
        OutputElement::Field(ProtoField::Opcode, record.opcode_name().to_string()),
        OutputElement::Field(ProtoField::Module, meta.module.clone()),
        OutputElement::Field(ProtoField::Level, meta.level.clone()),
        OutputElement::Field(ProtoField::File, meta.file.clone()),
        OutputElement::Field(ProtoField::Line, meta.line.clone()),
    ]
}

/// Space-joined `0xNN` hex dump of `data`, matching `swo_framer.py`'s
/// `"{0:#0{1}x}".format(x, 4)` formatting (two hex digits, `0x` prefix).
fn hexdump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("0x{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Renders a `Buffer` record's info string, substituting the `%!S`
/// (UTF-8 interpretation) or `%!E` (reverse-hex dump) token if the elf
/// string's template carries one past its first character, else falling
/// back to the template followed by a forward hex dump — ported from
/// `swo_framer.py`'s `SWOBufferFrame.__str__`, quirk and all: a token
/// at offset 0 is treated as "no token" (`str.find` returning `0` fails
/// the original's `token_offset > 0` check).
fn render_buffer_info(string: &str, data: &[u8]) -> String {
    match string.find("%!") {
        Some(offset) if offset > 0 => match string.as_bytes().get(offset + 2) {
            Some(b'S') => {
                let decoded = String::from_utf8_lossy(data);
                string.replacen("%!S", &decoded, 1)
            }
            Some(b'E') => {
                let reversed: Vec<u8> = data.iter().rev().copied().collect();
                string.replacen("%!E", &hexdump(&reversed), 1)
            }
            _ => format!("{string} {}", hexdump(data)),
        },
        _ => format!("{string} {}", hexdump(data)),
    }
}

/// Build the flat element list for one record. Returns `None` for
/// records whose `meta.output` flag is `false` (event-set members that
/// were folded into a synthesized `EventSet`, never surfaced on their
/// own).
pub fn shape(record: &SwoRecord) -> Option<Vec<OutputElement>> {
    if !record.meta().output {
        return None;
    }
    Some(
        std::iter::once(OutputElement::OpenTree("SWO Logger Frame".to_string()))
            .chain(shape_body(record))
            .chain(std::iter::once(OutputElement::CloseTree))
            .collect(),
    )
}

/// The unwrapped per-record body (no outer "SWO Logger Frame" tree) —
/// used both as `shape`'s payload and, unwrapped, for each member
/// nested inside a synthesized `EventSet`'s "Event N" subtree.
fn shape_body(record: &SwoRecord) -> Vec<OutputElement> {
    let mut out = record_header(record);
    match record {
        SwoRecord::FormattedText { string, .. } => {
            out.push(OutputElement::Field(ProtoField::Info, string.clone()));
            out.push(OutputElement::Info(string.clone()));
        }
        SwoRecord::Event { string, event, .. } => {
            out.push(OutputElement::Field(ProtoField::Info, string.clone()));
            out.push(OutputElement::Field(ProtoField::Event, event.clone()));
            out.push(OutputElement::Info(string.clone()));
        }
        SwoRecord::Buffer {
            string,
            data,
            is_event_set,
            ..
        } => {
            let mut info = render_buffer_info(string, data);
            if *is_event_set {
                info = format!("Event Record, {info}");
            }
            out.push(OutputElement::Field(ProtoField::Info, info.clone()));
            out.push(OutputElement::Info(info));
        }
        SwoRecord::WatchpointEnable {
            wp_string, ..
        } => {
            out.push(OutputElement::Field(ProtoField::Info, wp_string.clone()));
            out.push(OutputElement::Info(wp_string.clone()));
        }
        SwoRecord::HwDataTrace {
            direction,
            packet_type,
            wp_string,
            value,
            ..
        } => {
            let access = crate::swo::access_description(*direction, *packet_type);
            let info = format!("{wp_string} : {access}, value: {value:#010x}");
            out.push(OutputElement::Field(ProtoField::Info, info.clone()));
            out.push(OutputElement::Info(info));
        }
        SwoRecord::HwPcSample { function, .. } => {
            out.push(OutputElement::Field(ProtoField::Info, function.clone()));
            out.push(OutputElement::Info(function.clone()));
        }
        SwoRecord::BufferOverflow { .. } => {
            out.push(OutputElement::Info("buffer overflow".to_string()));
        }
        SwoRecord::Reset { .. } => {
            out.push(OutputElement::Info("SWO reset".to_string()));
        }
        SwoRecord::EventSetStart { event, .. } => {
            out.push(OutputElement::Field(ProtoField::Event, event.clone()));
        }
        SwoRecord::EventSetEnd { .. } => {}
        SwoRecord::EventSet {
            event,
            string,
            records,
            ..
        } => {
            for (index, member) in records.iter().enumerate() {
                out.push(OutputElement::OpenTree(format!("Event {index}")));
                out.append(&mut shape_body(member));
                out.push(OutputElement::CloseTree);
            }
            out.push(OutputElement::Field(ProtoField::Info, "See Tree of Events".to_string()));
            out.push(OutputElement::Field(ProtoField::Event, event.clone()));
            out.push(OutputElement::Info(string.clone()));
        }
    }
    out
}

fn lv(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

/// Length-value binary sink: each element becomes a `(name, value)`
/// length-prefixed pair. Ports `gandelf_send_data`.
pub struct GandelfSink<W: Write> {
    writer: W,
}

impl<W: Write> GandelfSink<W> {
    pub fn new(writer: W) -> Self {
        GandelfSink { writer }
    }

    pub fn send(&mut self, stream_id: &str, elements: &[OutputElement]) -> io::Result<()> {
        let mut data = Vec::new();
        lv(&mut data, ProtoField::StreamId.label());
        lv(&mut data, stream_id);
        for element in elements {
            let (label, value): (String, String) = match element {
                OutputElement::Field(field, value) => (field.label().to_string(), value.clone()),
                OutputElement::OpenTree(label) => ("ADD_LEVEL".to_string(), label.clone()),
                OutputElement::CloseTree => ("END_ADD_LEVEL".to_string(), String::new()),
                OutputElement::Info(text) => ("Message".to_string(), text.clone()),
                OutputElement::Custom(label, value) => (label.clone(), value.clone()),
            };
            if value.is_empty() && !matches!(element, OutputElement::CloseTree) {
                continue;
            }
            lv(&mut data, &label);
            lv(&mut data, &value);
        }
        self.writer.write_all(&data)
    }
}

/// Nested-JSON sink. Ports `wlogger_send_data`'s group-stack walk.
#[cfg(feature = "serde_json")]
pub struct WloggerSink<W: Write> {
    writer: W,
}

#[cfg(feature = "serde_json")]
impl<W: Write> WloggerSink<W> {
    pub fn new(writer: W) -> Self {
        WloggerSink { writer }
    }

    pub fn send(&mut self, stream_id: &str, elements: &[OutputElement]) -> io::Result<()> {
        let mut general = Map::new();
        general.insert("Stream ID".to_string(), Value::String(stream_id.to_string()));

        let mut root = Map::new();
        let mut stack: Vec<Map<String, Value>> = vec![Map::new()];

        for element in elements {
            match element {
                OutputElement::OpenTree(label) => {
                    stack.push(Map::new());
                    stack.last_mut().unwrap().insert("__name".to_string(), Value::String(label.clone()));
                }
                OutputElement::CloseTree => {
                    if stack.len() > 1 {
                        let mut finished = stack.pop().unwrap();
                        let name = match finished.remove("__name") {
                            Some(Value::String(s)) => s,
                            _ => "Group".to_string(),
                        };
                        stack
                            .last_mut()
                            .unwrap()
                            .insert(name, Value::Object(finished));
                    }
                }
                OutputElement::Info(text) => {
                    general.insert("Message".to_string(), Value::String(text.clone()));
                }
                OutputElement::Custom(label, value) => {
                    stack
                        .last_mut()
                        .unwrap()
                        .insert(label.clone(), Value::String(value.clone()));
                }
                OutputElement::Field(field, value) => {
                    stack
                        .last_mut()
                        .unwrap()
                        .insert(field.label().to_string(), Value::String(value.clone()));
                }
            }
        }
        while stack.len() > 1 {
            let mut finished = stack.pop().unwrap();
            let name = match finished.remove("__name") {
                Some(Value::String(s)) => s,
                _ => "Group".to_string(),
            };
            stack.last_mut().unwrap().insert(name, Value::Object(finished));
        }

        root.insert("General".to_string(), Value::Object(general));
        for (key, value) in stack.pop().unwrap_or_default() {
            root.insert(key, value);
        }

        serde_json::to_writer(&mut self.writer, &Value::Object(root))?;
        self.writer.write_all(b"\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swo::RecordMeta;

    fn text_record(output: bool) -> SwoRecord {
        SwoRecord::FormattedText {
            meta: RecordMeta {
                output,
                ..Default::default()
            },
            string: "hello".to_string(),
            is_event_set: false,
            record: None,
            handle: None,
        }
    }

    #[test]
    fn suppressed_records_shape_to_none() {
        assert!(shape(&text_record(false)).is_none());
    }

    #[test]
    fn formatted_text_wraps_in_frame_tree() {
        let elements = shape(&text_record(true)).unwrap();
        assert!(matches!(elements.first(), Some(OutputElement::OpenTree(label)) if label == "SWO Logger Frame"));
        assert!(matches!(elements.last(), Some(OutputElement::CloseTree)));
        assert!(elements.contains(&OutputElement::Info("hello".to_string())));
    }

    #[test]
    fn gandelf_sink_emits_length_prefixed_pairs() {
        let mut buf = Vec::new();
        let mut sink = GandelfSink::new(&mut buf);
        sink.send("s1", &[OutputElement::Info("hi".to_string())]).unwrap();
        // "Stream ID" (9) + "s1" (2) + "Message" (7) + "hi" (2), each with a 4-byte length prefix
        assert_eq!(buf.len(), 4 + 9 + 4 + 2 + 4 + 7 + 4 + 2);
    }

    #[cfg(feature = "serde_json")]
    #[test]
    fn wlogger_sink_emits_valid_json_with_stream_id() {
        let mut buf = Vec::new();
        let mut sink = WloggerSink::new(&mut buf);
        sink.send("s1", &[OutputElement::Info("hi".to_string())]).unwrap();
        let value: Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(value["General"]["Stream ID"], "s1");
        assert_eq!(value["General"]["Message"], "hi");
    }

    fn buffer_record(string: &str, data: Vec<u8>) -> SwoRecord {
        SwoRecord::Buffer {
            meta: RecordMeta {
                output: true,
                ..Default::default()
            },
            string: string.to_string(),
            data,
            is_event_set: false,
            record: None,
            handle: None,
        }
    }

    #[test]
    fn buffer_s_token_substitutes_utf8_text() {
        let record = buffer_record("payload: %!S end", b"hi".to_vec());
        let elements = shape(&record).unwrap();
        assert!(elements.contains(&OutputElement::Info("payload: hi end".to_string())));
    }

    #[test]
    fn buffer_e_token_substitutes_reversed_hex_dump() {
        let record = buffer_record("payload: %!E end", vec![0x01, 0x02]);
        let elements = shape(&record).unwrap();
        assert!(elements.contains(&OutputElement::Info("payload: 0x02 0x01 end".to_string())));
    }

    #[test]
    fn buffer_without_token_falls_back_to_forward_hex_dump() {
        let record = buffer_record("raw buffer", vec![0xAB, 0xCD]);
        let elements = shape(&record).unwrap();
        assert!(elements.contains(&OutputElement::Info("raw buffer 0xab 0xcd".to_string())));
    }

    #[test]
    fn buffer_token_at_offset_zero_is_treated_as_absent() {
        // Mirrors the original's `token_offset > 0` quirk: a token at the very
        // start of the string falls back to the hex-dump path instead of substituting.
        let record = buffer_record("%!S", vec![0xFF]);
        let elements = shape(&record).unwrap();
        assert!(elements.contains(&OutputElement::Info("%!S 0xff".to_string())));
    }

    #[test]
    fn hw_data_trace_renders_access_description() {
        let record = SwoRecord::HwDataTrace {
            meta: RecordMeta {
                output: true,
                ..Default::default()
            },
            comparator: 1,
            direction: crate::itm::Direction::Write,
            packet_type: 2,
            wp_string: "my_var".to_string(),
            value: 0x2a,
        };
        let elements = shape(&record).unwrap();
        assert!(elements
            .iter()
            .any(|e| matches!(e, OutputElement::Info(s) if s.contains("Write Access") && s.contains("my_var"))));
    }
}
