#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use secguys_monitor::api::ScanBackend;
use secguys_monitor::error::ApiError;
use secguys_monitor::types::{ScanHandle, ScanSnapshot, ScanStatus};
use secguys_monitor::ui::{Controls, Notice, ScanSurface};

/// One scripted answer to a status poll.
#[derive(Debug, Clone)]
pub enum Step {
    Status(ScanSnapshot),
    Fail(ApiError),
    /// Answer only after the given delay.
    Delayed(Duration, ScanSnapshot),
}

pub fn running(lines: &[&str]) -> Step {
    Step::Status(ScanSnapshot::new(ScanStatus::Running).with_output(lines.iter().copied()))
}

pub fn finished(status: ScanStatus, lines: &[&str]) -> Step {
    Step::Status(ScanSnapshot::new(status).with_output(lines.iter().copied()))
}

pub fn transport_error() -> Step {
    Step::Fail(ApiError::Transport("connection refused".into()))
}

/// In-memory backend that replays a script of status answers. Once the
/// script runs out every poll reports `running`.
pub struct ScriptedBackend {
    start: Mutex<Result<String, ApiError>>,
    stop: Mutex<Result<(), ApiError>>,
    steps: Mutex<VecDeque<Step>>,
    start_delay: Duration,
    stop_delay: Duration,
    pub targets: Mutex<Vec<String>>,
    pub start_calls: AtomicUsize,
    pub status_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            start: Mutex::new(Ok("abc123".to_string())),
            stop: Mutex::new(Ok(())),
            steps: Mutex::new(steps.into()),
            start_delay: Duration::ZERO,
            stop_delay: Duration::ZERO,
            targets: Mutex::new(Vec::new()),
            start_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_start_result(self, res: Result<String, ApiError>) -> Self {
        *self.start.lock().unwrap() = res;
        self
    }

    pub fn with_stop_result(self, res: Result<(), ApiError>) -> Self {
        *self.stop.lock().unwrap() = res;
        self
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn with_stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    pub fn push(&self, step: Step) {
        self.steps.lock().unwrap().push_back(step);
    }

    pub fn starts(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScanBackend for ScriptedBackend {
    async fn start_scan(&self, target: &str) -> Result<String, ApiError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.targets.lock().unwrap().push(target.to_string());
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        self.start.lock().unwrap().clone()
    }

    async fn scan_status(&self, _scan_id: &str) -> Result<ScanSnapshot, ApiError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            None => Ok(ScanSnapshot::new(ScanStatus::Running)),
            Some(Step::Status(s)) => Ok(s),
            Some(Step::Fail(e)) => Err(e),
            Some(Step::Delayed(d, s)) => {
                tokio::time::sleep(d).await;
                Ok(s)
            }
        }
    }

    async fn stop_scan(&self, _scan_id: &str) -> Result<(), ApiError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if !self.stop_delay.is_zero() {
            tokio::time::sleep(self.stop_delay).await;
        }
        self.stop.lock().unwrap().clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Controls(Controls),
    Status(ScanStatus),
    Log(Vec<String>),
    Notice(Notice),
    Refresh,
}

/// Surface that records every callback in order.
#[derive(Default)]
pub struct RecordingSurface {
    events: Mutex<Vec<Event>>,
}

impl RecordingSurface {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn refreshes(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Refresh))
            .count()
    }

    pub fn last_controls(&self) -> Option<Controls> {
        self.events().into_iter().rev().find_map(|e| match e {
            Event::Controls(c) => Some(c),
            _ => None,
        })
    }

    pub fn last_log(&self) -> Option<Vec<String>> {
        self.events().into_iter().rev().find_map(|e| match e {
            Event::Log(l) => Some(l),
            _ => None,
        })
    }

    pub fn statuses(&self) -> Vec<ScanStatus> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Status(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Notice(Notice::Error(m)) => Some(m),
                _ => None,
            })
            .collect()
    }

    fn record(&self, e: Event) {
        self.events.lock().unwrap().push(e);
    }
}

impl ScanSurface for RecordingSurface {
    fn controls(&self, controls: Controls) {
        self.record(Event::Controls(controls));
    }

    fn status(&self, handle: &ScanHandle) {
        self.record(Event::Status(handle.status));
    }

    fn log(&self, lines: &[String]) {
        self.record(Event::Log(lines.to_vec()));
    }

    fn notify(&self, notice: Notice) {
        self.record(Event::Notice(notice));
    }

    fn refresh_dependents(&self) {
        self.record(Event::Refresh);
    }
}
