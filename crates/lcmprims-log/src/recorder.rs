use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lcmprims_router::{Handler, HandlerResult, ReceivedMessage};

use crate::writer::LogWriter;

/// Subscription handler that captures every message it sees to a log.
///
/// Records are stamped with the message's receive time. Subscribe it to `*`
/// to capture all traffic. The writer sits behind a mutex so one recorder can
/// serve several subscriptions.
pub struct Recorder {
    writer: Arc<Mutex<LogWriter>>,
    recorded: AtomicU64,
}

impl Recorder {
    pub fn new(writer: LogWriter) -> Self {
        Self::shared(Arc::new(Mutex::new(writer)))
    }

    /// Record into a writer the caller keeps a handle to.
    pub fn shared(writer: Arc<Mutex<LogWriter>>) -> Self {
        Self {
            writer,
            recorded: AtomicU64::new(0),
        }
    }

    pub fn writer(&self) -> Arc<Mutex<LogWriter>> {
        Arc::clone(&self.writer)
    }

    /// Messages written so far.
    pub fn recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }
}

impl Handler for Recorder {
    fn handle(&self, message: &ReceivedMessage) -> HandlerResult {
        let mut writer = self.writer.lock().map_err(|_| "log writer lock poisoned")?;
        writer.append(&message.channel, &message.payload, message.recv_utime)?;
        self.recorded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
