//! On-host decoder for the ITM/SWO instrumentation trace overlay
//! protocol: raw bytes in, structured [`swo::SwoRecord`]s out.
//!
//! Pipeline: `bytes -> itm::ItmFramer -> ItmPacket -> swo::SwoFramer
//! (consulting a tracedb::SwoSymbols impl) -> SwoRecord -> output
//! shaper -> sink`. The core is sans-I/O; only [`serial`] (behind the
//! `bin` feature) touches an actual transport.

#[cfg(feature = "cache")]
pub mod cache;
pub mod itm;
pub mod output;
pub mod swo;
pub mod tracedb;

#[cfg(feature = "bin")]
pub mod serial;

pub use itm::{ItmError, ItmFramer, ItmPacket};
pub use output::{GandelfSink, OutputElement, ProtoField};
pub use swo::{RecordMeta, SwoError, SwoFramer, SwoRecord, SwoSymbols};
pub use tracedb::{TraceDb, TraceDbError};

#[cfg(feature = "serde_json")]
pub use output::WloggerSink;
