//! Serial reader glue: a producer thread that pulls chunks off a serial
//! port into a channel the main loop drains cooperatively.
//!
//! Ported from `examples/original_source/tools/logger/serial_rx/
//! serial_rx.py` (`SerialRx`, `receive_thread`). The original polls a
//! non-blocking queue from its main loop (`receive()` returning empty
//! bytes when nothing is ready); `mpsc::Receiver::try_recv` plays the
//! same role here.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serialport::SerialPort;

/// Default read timeout, matching `SerialRx.__init__`'s `timeout=0.2`.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(200);
/// Default chunk size, matching `SerialRx.__init__`'s `chunk_size=1000`.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Owns the receive thread and the channel it feeds. Dropping this
/// struct does not stop the thread; call [`SerialRx::close`] explicitly
/// so the port is closed deterministically, mirroring the original's
/// explicit `close()` rather than relying on `__del__`.
pub struct SerialRx {
    stop: Arc<AtomicBool>,
    rx: Receiver<Vec<u8>>,
    handle: Option<JoinHandle<()>>,
}

impl SerialRx {
    pub fn open(
        port_name: &str,
        baud: u32,
        timeout: Duration,
        chunk_size: usize,
    ) -> Result<Self, serialport::Error> {
        let mut port = serialport::new(port_name, baud).timeout(timeout).open()?;

        // "On MAC, at least one byte needs to be read in order for
        // in_waiting to be reliable." — harmless best-effort elsewhere.
        let mut warmup = [0u8; 1];
        let _ = port.read(&mut warmup);

        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let thread_stop = Arc::clone(&stop);
        let handle = thread::spawn(move || receive_loop(port, chunk_size, tx, thread_stop));

        Ok(SerialRx {
            stop,
            rx,
            handle: Some(handle),
        })
    }

    /// Non-blocking poll of whatever chunks have arrived since the last
    /// call. Returns an empty vector if nothing is ready, mirroring
    /// `SerialRx.receive()`'s empty-bytes-on-`queue.Empty` behavior.
    pub fn receive(&self) -> Vec<u8> {
        match self.rx.try_recv() {
            Ok(chunk) => chunk,
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Vec::new(),
        }
    }

    /// Signal the receive thread to stop and join it.
    pub fn close(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SerialRx {
    fn drop(&mut self) {
        self.close();
    }
}

fn receive_loop(
    mut port: Box<dyn SerialPort>,
    chunk_size: usize,
    tx: mpsc::Sender<Vec<u8>>,
    stop: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; chunk_size];
    while !stop.load(Ordering::Relaxed) {
        match port.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => {
                tracing::error!(error = %e, "serial read failed");
            }
        }
        thread::sleep(Duration::from_millis(1));
    }
}
