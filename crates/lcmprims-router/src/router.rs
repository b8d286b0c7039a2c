use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::error::{Result, RouterError};
use crate::handler::{Handler, HandlerResult};
use crate::message::ReceivedMessage;
use crate::pattern::{ChannelPattern, MatchConfig};

/// Default number of channels whose matching subscriptions are cached.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Router configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterConfig {
    pub matching: MatchConfig,
    /// Channels kept in the match cache. The cache is cleared when full.
    pub cache_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            matching: MatchConfig::default(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

/// Identifies a subscription for [`Router::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Subscriptions matching the channel when dispatch started.
    pub matched: usize,
    /// Handlers that returned `Ok`.
    pub delivered: usize,
    /// Handlers that returned `Err`.
    pub failed: usize,
    /// Handlers that panicked.
    pub panicked: usize,
}

impl DispatchReport {
    /// No handler failed or panicked.
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.panicked == 0
    }
}

struct Subscription {
    handle: SubscriptionHandle,
    pattern: ChannelPattern,
    handler: Box<dyn Handler>,
    active: AtomicBool,
}

#[derive(Default)]
struct Table {
    subscriptions: Vec<Arc<Subscription>>,
    /// Channel -> matching subscriptions, in registration order.
    cache: HashMap<String, Vec<Arc<Subscription>>>,
    next_id: u64,
}

/// Maps channels to subscribed handlers.
///
/// All methods take `&self`; share the router behind an `Arc`.
pub struct Router {
    config: RouterConfig,
    table: Mutex<Table>,
}

impl Router {
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    pub fn with_config(config: RouterConfig) -> Self {
        Self {
            config,
            table: Mutex::new(Table::default()),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Register `handler` for channels matching `pattern`.
    pub fn subscribe<H>(&self, pattern: &str, handler: H) -> Result<SubscriptionHandle>
    where
        H: Handler + 'static,
    {
        let pattern = ChannelPattern::parse(pattern, self.config.matching)?;
        let mut table = self.lock()?;

        let handle = SubscriptionHandle(table.next_id);
        table.next_id += 1;

        let subscription = Arc::new(Subscription {
            handle,
            pattern,
            handler: Box::new(handler),
            active: AtomicBool::new(true),
        });

        for (channel, matching) in table.cache.iter_mut() {
            if subscription.pattern.matches(channel) {
                matching.push(Arc::clone(&subscription));
            }
        }
        debug!(pattern = %subscription.pattern, id = handle.0, "subscribed");
        table.subscriptions.push(subscription);

        Ok(handle)
    }

    /// Register a closure. Same as [`Router::subscribe`], with the closure
    /// signature inferred.
    pub fn subscribe_fn<F>(&self, pattern: &str, handler: F) -> Result<SubscriptionHandle>
    where
        F: Fn(&ReceivedMessage) -> HandlerResult + Send + Sync + 'static,
    {
        self.subscribe(pattern, handler)
    }

    /// Remove a subscription. Returns `false` if it was already removed.
    ///
    /// Safe to call from inside a handler: the removed handler is not
    /// invoked again, including later in a dispatch already in progress.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<bool> {
        let mut table = self.lock()?;

        let Some(index) = table
            .subscriptions
            .iter()
            .position(|s| s.handle == handle)
        else {
            return Ok(false);
        };

        let removed = table.subscriptions.remove(index);
        removed.active.store(false, Ordering::SeqCst);
        for matching in table.cache.values_mut() {
            matching.retain(|s| s.handle != handle);
        }
        debug!(pattern = %removed.pattern, id = handle.0, "unsubscribed");

        Ok(true)
    }

    /// Invoke every handler whose pattern matches the message channel, in
    /// registration order.
    pub fn dispatch(&self, message: &ReceivedMessage) -> Result<DispatchReport> {
        let matching = self.matching(&message.channel)?;
        let mut report = DispatchReport {
            matched: matching.len(),
            ..DispatchReport::default()
        };

        for subscription in matching {
            if !subscription.active.load(Ordering::SeqCst) {
                continue;
            }

            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| subscription.handler.handle(message)));
            match outcome {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(err)) => {
                    report.failed += 1;
                    warn!(
                        channel = %message.channel,
                        pattern = %subscription.pattern,
                        %err,
                        "handler failed"
                    );
                }
                Err(payload) => {
                    report.panicked += 1;
                    warn!(
                        channel = %message.channel,
                        pattern = %subscription.pattern,
                        panic = panic_message(payload.as_ref()),
                        "handler panicked"
                    );
                }
            }
        }

        Ok(report)
    }

    /// Whether any subscription matches `channel`.
    pub fn has_subscribers(&self, channel: &str) -> Result<bool> {
        Ok(!self.matching(channel)?.is_empty())
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().map(|t| t.subscriptions.len()).unwrap_or(0)
    }

    /// Channels currently held in the match cache.
    pub fn cached_channels(&self) -> usize {
        self.lock().map(|t| t.cache.len()).unwrap_or(0)
    }

    fn matching(&self, channel: &str) -> Result<Vec<Arc<Subscription>>> {
        let mut table = self.lock()?;
        if let Some(matching) = table.cache.get(channel) {
            return Ok(matching.clone());
        }

        let matching: Vec<_> = table
            .subscriptions
            .iter()
            .filter(|s| s.pattern.matches(channel))
            .cloned()
            .collect();

        if self.config.cache_capacity > 0 {
            if table.cache.len() >= self.config.cache_capacity {
                debug!(entries = table.cache.len(), "match cache full; clearing");
                table.cache.clear();
            }
            table.cache.insert(channel.to_string(), matching.clone());
        }
        Ok(matching)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Table>> {
        self.table.lock().map_err(|_| RouterError::Poisoned)
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
