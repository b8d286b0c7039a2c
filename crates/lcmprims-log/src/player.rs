use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lcmprims_router::{DispatchReport, ReceivedMessage, Router};
use tracing::debug;

use crate::error::{LogError, Result};
use crate::format::LogEvent;
use crate::reader::LogReader;

/// Longest single sleep while pacing, so cancellation is noticed promptly.
const PACING_SLICE: Duration = Duration::from_millis(100);

/// How replayed events are paced.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum PlaybackMode {
    /// Dispatch each event as soon as the previous handlers return.
    #[default]
    AsFastAsPossible,
    /// Keep the recorded gaps between events, divided by `speed`.
    /// `speed = 2.0` plays twice as fast.
    Timed { speed: f64 },
}

impl PlaybackMode {
    pub fn validate(&self) -> Result<()> {
        match *self {
            PlaybackMode::AsFastAsPossible => Ok(()),
            PlaybackMode::Timed { speed } if speed.is_finite() && speed > 0.0 => Ok(()),
            PlaybackMode::Timed { speed } => Err(LogError::InvalidConfig(format!(
                "playback speed must be a positive number, got {speed}"
            ))),
        }
    }
}

/// Totals for a playback run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackSummary {
    pub events: u64,
    /// Events at least one handler received.
    pub delivered: u64,
    pub handler_failures: u64,
}

impl PlaybackSummary {
    fn record(&mut self, report: &DispatchReport) {
        self.events += 1;
        if report.delivered > 0 {
            self.delivered += 1;
        }
        self.handler_failures += (report.failed + report.panicked) as u64;
    }
}

/// Feeds logged events into a [`Router`].
///
/// Replayed messages carry the logged timestamp as `recv_utime` and no
/// source address.
pub struct Player {
    reader: LogReader,
    mode: PlaybackMode,
    start: Option<i64>,
    started: bool,
    /// (first log timestamp, wall clock at its dispatch)
    anchor: Option<(i64, Instant)>,
    cancel: Arc<AtomicBool>,
}

impl Player {
    pub fn new(reader: LogReader, mode: PlaybackMode) -> Result<Self> {
        mode.validate()?;
        Ok(Self {
            reader,
            mode,
            start: None,
            started: false,
            anchor: None,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Begin playback at the first event with `timestamp >= ts`.
    pub fn start_at(mut self, ts: i64) -> Self {
        self.start = Some(ts);
        self
    }

    /// Flag that stops playback when set. Pacing sleeps observe it within
    /// 100 ms.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Replay until end of log or cancellation.
    pub fn play(&mut self, router: &Router) -> Result<PlaybackSummary> {
        let mut summary = PlaybackSummary::default();
        while let Some(report) = self.step(router)? {
            summary.record(&report);
        }
        debug!(
            events = summary.events,
            failures = summary.handler_failures,
            "playback finished"
        );
        Ok(summary)
    }

    /// Dispatch the next event, waiting first if the mode is timed.
    ///
    /// `Ok(None)` at end of log or once cancelled.
    pub fn step(&mut self, router: &Router) -> Result<Option<DispatchReport>> {
        let Some(event) = self.next_paced()? else {
            return Ok(None);
        };

        let message = ReceivedMessage {
            channel: event.channel,
            payload: event.payload,
            recv_utime: event.timestamp,
            source: None,
        };
        router.dispatch(&message).map(Some).map_err(Into::into)
    }

    /// Read the next event, waiting until it is due under the playback mode.
    ///
    /// `Ok(None)` at end of log or once cancelled.
    pub fn next_paced(&mut self) -> Result<Option<LogEvent>> {
        let Some(event) = self.next_event()? else {
            return Ok(None);
        };
        if !self.pace(event.timestamp) {
            return Ok(None);
        }
        Ok(Some(event))
    }

    /// Read the next event immediately, ignoring pacing.
    pub fn next_event(&mut self) -> Result<Option<LogEvent>> {
        if self.cancel.load(Ordering::SeqCst) {
            return Ok(None);
        }
        if !self.started {
            self.started = true;
            if let Some(ts) = self.start {
                self.reader.seek_to_timestamp(ts)?;
            }
        }
        self.reader.read_next()
    }

    pub fn mode(&self) -> PlaybackMode {
        self.mode
    }

    pub fn reader(&self) -> &LogReader {
        &self.reader
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Sleep until `timestamp` is due. Returns false if cancelled.
    fn pace(&mut self, timestamp: i64) -> bool {
        let PlaybackMode::Timed { speed } = self.mode else {
            return true;
        };
        let (first, wall_start) = *self.anchor.get_or_insert((timestamp, Instant::now()));

        let offset_us = timestamp.saturating_sub(first).max(0) as f64 / speed;
        // None when the wait is too long to represent: due only at cancellation.
        let due = Duration::try_from_secs_f64(offset_us / 1_000_000.0)
            .ok()
            .and_then(|offset| wall_start.checked_add(offset));

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return false;
            }
            let now = Instant::now();
            let wait = match due {
                Some(due) if now >= due => return true,
                Some(due) => (due - now).min(PACING_SLICE),
                None => PACING_SLICE,
            };
            std::thread::sleep(wait);
        }
    }
}
