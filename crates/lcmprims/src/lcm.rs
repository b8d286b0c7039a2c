use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use lcmprims_router::{
    DispatchReport, Handler, HandlerResult, ReceivedMessage, Router, RouterConfig,
    SubscriptionHandle,
};
use lcmprims_transport::TransportStats;
use tracing::{debug, warn};

use crate::error::{LcmError, Result};
use crate::provider::{self, Provider, Receive};
use crate::url::ProviderUrl;

/// A publish/subscribe context.
///
/// Owns one provider (multicast transport or log file) and one router.
/// Nothing is global: independent contexts can coexist in one process.
///
/// Messages are dispatched by whichever thread calls [`Lcm::handle`] or by
/// the thread started with [`Lcm::spawn_receiver`].
pub struct Lcm {
    provider: Arc<dyn Provider>,
    router: Arc<Router>,
    closed: Arc<AtomicBool>,
}

impl Lcm {
    /// Open a context for a provider URL such as `udpm://239.255.76.67:7667`.
    /// An empty URL means the default multicast group.
    pub fn new(url: &str) -> Result<Self> {
        Self::open(&ProviderUrl::parse(url)?)
    }

    /// Open a context for `LCM_DEFAULT_URL`, falling back to `udpm://`.
    pub fn from_env() -> Result<Self> {
        Self::open(&ProviderUrl::from_env()?)
    }

    pub fn open(url: &ProviderUrl) -> Result<Self> {
        let provider: Arc<dyn Provider> = Arc::from(provider::open(url)?);
        debug!(provider = url.provider_name(), "opened lcm context");
        Ok(Self::with_provider(provider, RouterConfig::default()))
    }

    /// Wrap a custom provider.
    pub fn with_provider(provider: Arc<dyn Provider>, router: RouterConfig) -> Self {
        Self {
            provider,
            router: Arc::new(Router::with_config(router)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Queue a message for sending.
    pub fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.provider.publish(channel, payload)
    }

    pub fn subscribe<H>(&self, pattern: &str, handler: H) -> Result<SubscriptionHandle>
    where
        H: Handler + 'static,
    {
        Ok(self.router.subscribe(pattern, handler)?)
    }

    pub fn subscribe_fn<F>(&self, pattern: &str, handler: F) -> Result<SubscriptionHandle>
    where
        F: Fn(&ReceivedMessage) -> HandlerResult + Send + Sync + 'static,
    {
        Ok(self.router.subscribe_fn(pattern, handler)?)
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<bool> {
        Ok(self.router.unsubscribe(handle)?)
    }

    /// Block until one message has been received and dispatched.
    ///
    /// Returns `LcmError::Exhausted` once a playback log ends and
    /// `LcmError::Closed` after [`Lcm::close`].
    pub fn handle(&self) -> Result<DispatchReport> {
        loop {
            self.ensure_open()?;
            if let Some(report) = receive_and_dispatch(self.provider.as_ref(), &self.router)? {
                return Ok(report);
            }
        }
    }

    /// Like [`Lcm::handle`], giving up after `timeout`. Returns whether a
    /// message was dispatched. The wait is rounded up to the provider's poll
    /// interval.
    pub fn handle_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            self.ensure_open()?;
            if receive_and_dispatch(self.provider.as_ref(), &self.router)?.is_some() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
        }
    }

    /// Run receive-and-dispatch on a dedicated thread until the context is
    /// closed, the playback log ends, or the handle is stopped.
    ///
    /// Handlers run on that thread one at a time, so a slow handler delays
    /// every other subscription.
    pub fn spawn_receiver(&self) -> Result<ReceiverHandle> {
        let provider = Arc::clone(&self.provider);
        let router = Arc::clone(&self.router);
        let closed = Arc::clone(&self.closed);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name("lcmprims-recv".to_string())
            .spawn(move || receive_loop(provider.as_ref(), &router, &closed, &thread_stop))
            .map_err(|err| LcmError::Transport(err.into()))?;

        Ok(ReceiverHandle {
            stop,
            thread: Some(thread),
        })
    }

    /// Wait for queued publishes to leave. Returns false on timeout.
    pub fn flush(&self, timeout: Duration) -> Result<bool> {
        self.ensure_open()?;
        self.provider.flush(timeout)
    }

    /// Close the provider. Blocked calls return `LcmError::Closed` within one
    /// poll interval.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.provider.close();
        debug!("lcm context closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Transport counters, for providers that have them.
    pub fn stats(&self) -> Option<TransportStats> {
        self.provider.stats()
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(LcmError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for Lcm {
    fn drop(&mut self) {
        self.close();
    }
}

/// Handle to a thread started by [`Lcm::spawn_receiver`].
pub struct ReceiverHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl ReceiverHandle {
    /// Ask the thread to stop and wait for it. Returns the error that ended
    /// the loop, if any.
    pub fn stop(mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        self.join_inner()
    }

    /// Wait for the thread to end on its own.
    pub fn join(mut self) -> Result<()> {
        self.join_inner()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    fn join_inner(&mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread.join().unwrap_or_else(|_| {
                warn!("receive thread panicked");
                Err(LcmError::Closed)
            }),
            None => Ok(()),
        }
    }
}

impl Drop for ReceiverHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn receive_and_dispatch(
    provider: &dyn Provider,
    router: &Router,
) -> Result<Option<DispatchReport>> {
    match provider.receive()? {
        Receive::Message(message) => Ok(Some(router.dispatch(&message)?)),
        Receive::Pending => Ok(None),
        Receive::Finished => Err(LcmError::Exhausted),
    }
}

fn receive_loop(
    provider: &dyn Provider,
    router: &Router,
    closed: &AtomicBool,
    stop: &AtomicBool,
) -> Result<()> {
    while !closed.load(Ordering::SeqCst) && !stop.load(Ordering::SeqCst) {
        match receive_and_dispatch(provider, router) {
            Ok(_) => {}
            Err(LcmError::Closed) | Err(LcmError::Exhausted) => break,
            Err(err) => {
                warn!(%err, "receive loop stopped");
                return Err(err);
            }
        }
    }
    debug!("receive thread exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket;
    use std::sync::Mutex;

    use lcmprims_log::{LogReader, LogWriter, PlaybackMode};
    use lcmprims_transport::{Transport, TransportConfig};

    use super::*;
    use crate::provider::UdpmProvider;

    /// A context whose socket sends to itself, like multicast loopback.
    fn loopback_lcm() -> Lcm {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.connect(socket.local_addr().unwrap()).unwrap();
        let config = TransportConfig {
            fragment_size: 256,
            poll_interval: Duration::from_millis(20),
            ..TransportConfig::default()
        };
        let transport = Transport::with_socket(socket, config).unwrap();
        Lcm::with_provider(
            Arc::new(UdpmProvider::new(transport)),
            RouterConfig::default(),
        )
    }

    fn collector(lcm: &Lcm, pattern: &str) -> Arc<Mutex<Vec<ReceivedMessage>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        lcm.subscribe_fn(pattern, move |m| {
            sink.lock().unwrap().push(m.clone());
            Ok(())
        })
        .unwrap();
        seen
    }

    #[test]
    fn publish_then_handle_dispatches() {
        let lcm = loopback_lcm();
        let seen = collector(&lcm, "robot.*");

        let payload = vec![9u8; 1000];
        lcm.publish("robot.scan", &payload).unwrap();
        assert!(lcm.handle_timeout(Duration::from_secs(2)).unwrap());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].payload.as_ref(), payload.as_slice());
        assert!(seen[0].source.is_some());
    }

    #[test]
    fn handle_timeout_returns_false_when_idle() {
        let lcm = loopback_lcm();
        let started = Instant::now();
        assert!(!lcm.handle_timeout(Duration::from_millis(60)).unwrap());
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn unmatched_messages_are_consumed_without_handlers() {
        let lcm = loopback_lcm();
        let seen = collector(&lcm, "A");

        lcm.publish("B", b"ignored").unwrap();
        lcm.publish("A", b"wanted").unwrap();
        lcm.handle_timeout(Duration::from_secs(2)).unwrap();
        lcm.handle_timeout(Duration::from_secs(2)).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].channel, "A");
    }

    #[test]
    fn receiver_thread_dispatches_until_stopped() {
        let lcm = loopback_lcm();
        let seen = collector(&lcm, "*");
        let receiver = lcm.spawn_receiver().unwrap();

        for n in 0..5u8 {
            lcm.publish("TICK", &[n]).unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(3);
        while seen.lock().unwrap().len() < 5 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        receiver.stop().unwrap();
        assert_eq!(seen.lock().unwrap().len(), 5);
        assert_eq!(lcm.stats().unwrap().messages_delivered, 5);
    }

    #[test]
    fn close_ends_receiver_and_rejects_calls() {
        let lcm = loopback_lcm();
        let receiver = lcm.spawn_receiver().unwrap();

        lcm.close();
        receiver.join().unwrap();

        assert!(matches!(lcm.publish("A", b"x"), Err(LcmError::Closed)));
        assert!(matches!(lcm.handle(), Err(LcmError::Closed)));
    }

    #[test]
    fn file_provider_replays_a_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.lcmlog");
        {
            let mut writer = LogWriter::create(&path).unwrap();
            writer.append("A", b"one", 100).unwrap();
            writer.append("B", b"two", 200).unwrap();
        }

        let url = format!("file://{}?speed=0", path.display());
        let lcm = Lcm::new(&url).unwrap();
        let seen = collector(&lcm, "*");

        lcm.handle().unwrap();
        lcm.handle().unwrap();
        assert!(matches!(lcm.handle(), Err(LcmError::Exhausted)));

        let seen = seen.lock().unwrap();
        assert_eq!(seen[1].channel, "B");
        assert_eq!(seen[1].recv_utime, 200);
        assert!(seen[1].source.is_none());
        assert!(matches!(lcm.publish("A", b"x"), Err(LcmError::Unsupported(_))));
    }

    #[test]
    fn file_write_provider_records_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.lcmlog");

        let lcm = Lcm::new(&format!("file://{}?mode=w", path.display())).unwrap();
        lcm.publish("A", b"one").unwrap();
        lcm.publish("B", b"two").unwrap();
        lcm.close();

        let channels: Vec<_> = LogReader::open(&path)
            .unwrap()
            .map(|e| e.unwrap().channel)
            .collect();
        assert_eq!(channels, vec!["A", "B"]);
    }

    #[test]
    fn spawned_receiver_stops_at_end_of_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.lcmlog");
        {
            let mut writer = LogWriter::create(&path).unwrap();
            for ts in 0..3 {
                writer.append("A", b"x", ts).unwrap();
            }
        }

        let player = lcmprims_log::Player::new(
            LogReader::open(&path).unwrap(),
            PlaybackMode::AsFastAsPossible,
        )
        .unwrap();
        let lcm = Lcm::with_provider(
            Arc::new(crate::provider::LogPlaybackProvider::new(player)),
            RouterConfig::default(),
        );
        let seen = collector(&lcm, "A");

        lcm.spawn_receiver().unwrap().join().unwrap();
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn tcpq_contexts_share_a_hub() {
        use lcmprims_transport::{TcpHub, TcpqConfig};

        let hub = Arc::new(
            TcpHub::bind("127.0.0.1:0".parse().unwrap(), TcpqConfig::default()).unwrap(),
        );
        let runner = {
            let hub = Arc::clone(&hub);
            std::thread::spawn(move || hub.run())
        };

        let url = format!("tcpq://{}", hub.local_addr());
        let publisher = Lcm::new(&url).unwrap();
        let subscriber = Lcm::new(&url).unwrap();
        let seen = collector(&subscriber, "robot.*");

        let deadline = Instant::now() + Duration::from_secs(5);
        while hub.stats().clients < 2 {
            assert!(Instant::now() < deadline, "clients never joined");
            std::thread::sleep(Duration::from_millis(10));
        }

        publisher.publish("robot.pose", b"x=1").unwrap();
        assert!(subscriber.handle_timeout(Duration::from_secs(5)).unwrap());

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].channel, "robot.pose");
        assert_eq!(seen[0].source, Some(hub.local_addr()));

        publisher.close();
        subscriber.close();
        hub.stop();
        runner.join().unwrap().unwrap();
    }
}
