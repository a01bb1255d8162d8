use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc::UnboundedSender;

use crate::types::{ScanHandle, ScanStatus};

/// Enabled/visible state of the scan controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Controls {
    pub start_enabled: bool,
    pub stop_enabled: bool,
    pub status_visible: bool,
    /// A stop was requested and the backend has not confirmed it yet.
    pub stop_pending: bool,
}

impl Controls {
    pub const IDLE: Controls = Controls {
        start_enabled: true,
        stop_enabled: false,
        status_visible: false,
        stop_pending: false,
    };
    /// Start request in flight.
    pub const STARTING: Controls = Controls {
        start_enabled: false,
        stop_enabled: false,
        status_visible: true,
        stop_pending: false,
    };
    pub const ACTIVE: Controls = Controls {
        start_enabled: false,
        stop_enabled: true,
        status_visible: true,
        stop_pending: false,
    };
    /// Stop requested, waiting for the backend to confirm.
    pub const STOPPING: Controls = Controls {
        start_enabled: false,
        stop_enabled: false,
        status_visible: true,
        stop_pending: true,
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Info(String),
    Success(String),
    Error(String),
}

/// Where the scan monitor paints its state.
///
/// Callbacks run while the monitor holds its state lock so their order
/// matches the order of state changes. Implementations must return quickly
/// and must not call back into the monitor.
pub trait ScanSurface: Send + Sync {
    fn controls(&self, controls: Controls);
    fn status(&self, handle: &ScanHandle);
    /// Full accumulated log; the surface shows it scrolled to the last line.
    fn log(&self, lines: &[String]);
    fn notify(&self, notice: Notice);
    /// Re-fetch views that depend on scan results (stats, findings).
    fn refresh_dependents(&self);
}

/// Surface for the terminal client: prints new log lines and notices and
/// forwards refresh requests over a channel.
#[derive(Debug)]
pub struct TerminalSurface {
    printed: AtomicUsize,
    last_status: Mutex<Option<ScanStatus>>,
    refresh_tx: Option<UnboundedSender<()>>,
}

impl TerminalSurface {
    pub fn new(refresh_tx: Option<UnboundedSender<()>>) -> Self {
        Self {
            printed: AtomicUsize::new(0),
            last_status: Mutex::new(None),
            refresh_tx,
        }
    }
}

impl ScanSurface for TerminalSurface {
    fn controls(&self, controls: Controls) {
        if controls == Controls::IDLE {
            self.printed.store(0, Ordering::Relaxed);
            if let Ok(mut last) = self.last_status.lock() {
                *last = None;
            }
        }
    }

    fn status(&self, handle: &ScanHandle) {
        // One line per status change, not per poll.
        if let Ok(mut last) = self.last_status.lock() {
            if *last == Some(handle.status) {
                return;
            }
            *last = Some(handle.status);
        }
        let created = handle
            .created_at
            .as_deref()
            .map(crate::render::format_date)
            .unwrap_or_else(|| "-".to_string());
        println!("Status: {} | Created: {} | scan {}", handle.status, created, handle.id);
    }

    fn log(&self, lines: &[String]) {
        // Terminal output is append-only; print only what has not been shown.
        let shown = self.printed.load(Ordering::Relaxed).min(lines.len());
        for line in &lines[shown..] {
            println!("  {line}");
        }
        self.printed.store(lines.len(), Ordering::Relaxed);
    }

    fn notify(&self, notice: Notice) {
        match notice {
            Notice::Info(m) => println!("{m}"),
            Notice::Success(m) => println!("[ok] {m}"),
            Notice::Error(m) => eprintln!("[error] {m}"),
        }
    }

    fn refresh_dependents(&self) {
        if let Some(tx) = &self.refresh_tx {
            let _ = tx.send(());
        }
    }
}
