//! CLI entry point: opens a serial port and an ELF, and streams decoded
//! SWO records either to the log or to a wireshark-style sink.
//!
//! Ported from `examples/original_source/tools/logger/logger.py`'s
//! `argparse` surface and main loop.

use std::fs::File;
use std::path::PathBuf;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use structopt::StructOpt;
use uuid::Uuid;

use swo_trace::itm::{ItmFramer, MAX_ITM_FRAME_SIZE};
use swo_trace::output::{self, GandelfSink, OutputElement, WloggerSink};
use swo_trace::serial::{SerialRx, DEFAULT_CHUNK_SIZE, DEFAULT_TIMEOUT};
use swo_trace::{SwoFramer, SwoRecord, TraceDb};

#[derive(Debug, Clone, Copy)]
enum SinkFormat {
    Gandelf,
    Wlogger,
}

impl FromStr for SinkFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gandelf" => Ok(SinkFormat::Gandelf),
            "wlogger" => Ok(SinkFormat::Wlogger),
            other => Err(format!("unknown sink format {other:?} (expected gandelf or wlogger)")),
        }
    }
}

#[derive(Debug, StructOpt)]
#[structopt(
    name = "swo-trace-decode",
    about = "Log a serial port and parse received ITM frames into SWO records"
)]
struct Opt {
    /// Serial port to open (Windows: COM54, mac/Linux: /dev/tty.usbmodemXXXX)
    port: String,

    /// ELF file the trace strings are extracted from
    elf: PathBuf,

    /// Path to an SDK tree used to pick up ROM symbols
    #[structopt(short = "s", long = "sdk-path")]
    sdk_path: Option<PathBuf>,

    /// Baud rate of the serial port
    #[structopt(short, long, default_value = "12000000")]
    baud: u32,

    /// Clock speed of the embedded processor, in Hz
    #[structopt(short, long, default_value = "48000000")]
    clock: u32,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace); default is warn
    #[structopt(short, long, parse(from_occurrences))]
    verbose: u8,

    /// Stream identifier carried into sink output, for multiplexing several logger instances
    #[structopt(long = "stream-id", default_value = "default")]
    stream_id: String,

    /// Directory to write this run's log file into
    #[structopt(short, long, default_value = ".", parse(from_os_str))]
    log: PathBuf,

    /// Write shaped frames to this file instead of just logging them
    #[structopt(short, long, parse(from_os_str))]
    pipe: Option<PathBuf>,

    /// Sink format used when --pipe is set
    #[structopt(long = "format", default_value = "gandelf")]
    format: SinkFormat,
}

enum Sink {
    None,
    Gandelf(GandelfSink<File>),
    Wlogger(WloggerSink<File>),
}

fn init_logging(log_dir: &std::path::Path, uniquely_named: bool, verbose: u8) -> Result<PathBuf> {
    std::fs::create_dir_all(log_dir).with_context(|| format!("creating log directory {}", log_dir.display()))?;
    let filename = if uniquely_named {
        format!("sl_swo_{}.log", Uuid::new_v4())
    } else {
        "sl_swo.log".to_string()
    };
    let path = log_dir.join(filename);
    let file = File::create(&path).with_context(|| format!("creating log file {}", path.display()))?;

    let level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_writer(file)
        .with_max_level(level)
        .with_ansi(false)
        .init();
    Ok(path)
}

fn main() -> Result<()> {
    let opt = Opt::from_args();

    let log_path = init_logging(&opt.log, opt.pipe.is_some(), opt.verbose)?;
    println!("Writing to log at {}", log_path.display());
    tracing::warn!("Logger started");

    let db = TraceDb::build(&opt.elf, opt.sdk_path.as_deref())
        .with_context(|| format!("building trace database from {}", opt.elf.display()))?;

    let mut itm = ItmFramer::new();
    let mut swo = SwoFramer::new(opt.clock, opt.baud);

    let mut serial = SerialRx::open(&opt.port, opt.baud, DEFAULT_TIMEOUT, DEFAULT_CHUNK_SIZE)
        .with_context(|| format!("opening serial port {}", opt.port))?;

    let mut sink = match (&opt.pipe, opt.format) {
        (Some(path), SinkFormat::Gandelf) => {
            let file = File::create(path).with_context(|| format!("creating pipe file {}", path.display()))?;
            Sink::Gandelf(GandelfSink::new(file))
        }
        (Some(path), SinkFormat::Wlogger) => {
            let file = File::create(path).with_context(|| format!("creating pipe file {}", path.display()))?;
            Sink::Wlogger(WloggerSink::new(file))
        }
        (None, _) => Sink::None,
    };

    tracing::info!(port = %opt.port, "Starting main logger loop");
    let mut buf: Vec<u8> = Vec::new();
    loop {
        buf.extend_from_slice(&serial.receive());

        if buf.len() <= MAX_ITM_FRAME_SIZE {
            thread::sleep(DEFAULT_TIMEOUT);
            continue;
        }

        let (packets, tail) = itm.parse(std::mem::take(&mut buf));
        buf = tail;

        for packet in packets {
            for record in swo.parse(&packet, &db) {
                let Some(elements) = output::shape(&record) else {
                    continue;
                };
                send(&mut sink, &opt.stream_id, &elements, &record)?;
            }
        }
    }
}

fn send(
    sink: &mut Sink,
    stream_id: &str,
    elements: &[OutputElement],
    record: &SwoRecord,
) -> Result<()> {
    match sink {
        Sink::None => {
            println!("{} {record:?}", Utc::now().format("%Y-%m-%d %H:%M:%S%.3f_UTC"));
            tracing::info!(?record, "decoded frame");
            Ok(())
        }
        Sink::Gandelf(s) => s.send(stream_id, elements).context("writing gandelf frame"),
        Sink::Wlogger(s) => s.send(stream_id, elements).context("writing wlogger frame"),
    }
}
