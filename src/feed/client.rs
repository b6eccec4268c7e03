//! Push-feed client: one upstream session, a registry of per-code callbacks,
//! and automatic bounded reconnection that restores subscriptions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::FeedError;
use crate::feed::dispatch::Dispatcher;
use crate::feed::protocol::{ControlMessage, FeedEvent, SubscriptionAck};
use crate::feed::reconnect::ReconnectPolicy;
use crate::feed::registry::{QuoteCallback, SubscriptionRegistry};
use crate::feed::transport::{FeedSession, FeedTransport, SessionGuard};
use crate::model::{ConnectionState, Quote, Tick};
use crate::volume::VolumeCache;

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub connect_timeout: Duration,
    pub subscribe_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub dispatch_queue_size: usize,
    /// Upper bound on how long `close()` waits for the transport to flush.
    pub shutdown_grace: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            subscribe_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
            dispatch_queue_size: 256,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

struct ActiveSession {
    id: u64,
    outbound: mpsc::Sender<ControlMessage>,
    reader: JoinHandle<()>,
    guard: SessionGuard,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves once `closing` turns true (or its sender is gone).
async fn closed_signal(mut closing: watch::Receiver<bool>) {
    loop {
        let closed = *closing.borrow_and_update();
        if closed || closing.changed().await.is_err() {
            return;
        }
    }
}

struct ClientInner {
    transport: Arc<dyn FeedTransport>,
    cache: Arc<VolumeCache>,
    registry: SubscriptionRegistry,
    dispatcher: Dispatcher,
    settings: ClientSettings,
    state_tx: watch::Sender<ConnectionState>,
    session: Mutex<Option<ActiveSession>>,
    pending_acks: Mutex<HashMap<String, oneshot::Sender<SubscriptionAck>>>,
    closing: watch::Sender<bool>,
    next_session_id: AtomicU64,
    reconnecting: AtomicBool,
}

/// Cloneable handle; all clones drive the same connection.
#[derive(Clone)]
pub struct FeedClient {
    inner: Arc<ClientInner>,
}

impl FeedClient {
    pub fn new(transport: Arc<dyn FeedTransport>, cache: Arc<VolumeCache>, settings: ClientSettings) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (closing, _) = watch::channel(false);
        Self {
            inner: Arc::new(ClientInner {
                transport,
                cache,
                registry: SubscriptionRegistry::new(),
                dispatcher: Dispatcher::new(settings.dispatch_queue_size),
                settings,
                state_tx,
                session: Mutex::new(None),
                pending_acks: Mutex::new(HashMap::new()),
                closing,
                next_session_id: AtomicU64::new(0),
                reconnecting: AtomicBool::new(false),
            }),
        }
    }

    /// Opens the upstream session. A no-op when already connected; reopens a
    /// client that was closed.
    pub async fn connect(&self) -> Result<(), FeedError> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        self.inner.closing.send_replace(false);
        self.inner.dispatcher.reopen();
        self.inner.set_state(ConnectionState::Connecting);

        match self.inner.establish().await {
            Ok(()) => {
                // Registry survives a Failed state; put it back upstream.
                if !self.inner.registry.is_empty() {
                    self.inner.resubscribe_all().await;
                }
                Ok(())
            }
            Err(e) => {
                warn!("Feed connect failed: {}", e);
                self.inner.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Subscribes `code`, replacing the callback if it is already registered.
    ///
    /// Requires a Connected client and waits for upstream to acknowledge.
    /// A rejected or timed-out request leaves nothing registered and is not
    /// retried.
    pub async fn subscribe<F>(&self, code: &str, callback: F) -> Result<(), FeedError>
    where
        F: Fn(Quote) + Send + Sync + 'static,
    {
        let code = code.trim();
        if code.is_empty() {
            return Err(FeedError::InvalidCode(code.to_string()));
        }
        if self.state() != ConnectionState::Connected {
            return Err(FeedError::NotConnected);
        }

        let callback: QuoteCallback = Arc::new(callback);
        if self.inner.registry.contains(code) {
            self.inner.registry.insert(code, callback);
            return Ok(());
        }

        self.inner.request_subscription(code).await?;
        self.inner.registry.insert(code, callback);
        Ok(())
    }

    /// Drops the subscription for `code`. Returns whether it existed.
    pub async fn unsubscribe(&self, code: &str) -> Result<bool, FeedError> {
        let removed = self.inner.registry.remove(code);
        self.inner.dispatcher.remove(code);
        if !removed {
            return Ok(false);
        }

        if let Some(outbound) = self.inner.outbound() {
            let message = ControlMessage::Unsubscribe { code: code.to_string() };
            if outbound.send(message).await.is_err() {
                debug!("Session gone before unsubscribe for {} was sent", code);
            }
        }
        info!("Unsubscribed from {}", code);
        Ok(true)
    }

    /// Unsubscribes everything, tears down the session and leaves the client
    /// Disconnected. Safe to call repeatedly and from any task; stops an
    /// in-progress reconnect loop.
    pub async fn close(&self) {
        let inner = &self.inner;
        let already_closing = inner.closing.send_replace(true);

        let session = lock(&inner.session).take();
        let codes = inner.registry.clear();
        inner.dispatcher.close();
        lock(&inner.pending_acks).clear();

        if let Some(ActiveSession { id, outbound, reader, guard }) = session {
            reader.abort();
            let grace = inner.settings.shutdown_grace;
            let farewell = async {
                for code in &codes {
                    let message = ControlMessage::Unsubscribe { code: code.clone() };
                    if outbound.send(message).await.is_err() {
                        break;
                    }
                }
            };
            if timeout(grace, farewell).await.is_err() {
                warn!("Timed out sending unsubscribes on close");
            }
            drop(outbound);
            guard.shutdown(grace).await;
            info!("Closed feed session {} ({} subscriptions released)", id, codes.len());
        } else if !already_closing {
            info!("Feed client closed ({} subscriptions released)", codes.len());
        }

        inner.set_state(ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn subscribed_codes(&self) -> Vec<String> {
        self.inner.registry.codes()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn cache(&self) -> &Arc<VolumeCache> {
        &self.inner.cache
    }
}

impl ClientInner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("Feed state {:?} -> {:?}", previous, state);
        }
    }

    fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    fn outbound(&self) -> Option<mpsc::Sender<ControlMessage>> {
        lock(&self.session).as_ref().map(|s| s.outbound.clone())
    }

    /// Connects the transport and installs the session with its reader task.
    async fn establish(self: &Arc<Self>) -> Result<(), FeedError> {
        let connect_timeout = self.settings.connect_timeout;
        let session = timeout(connect_timeout, self.transport.connect())
            .await
            .map_err(|_| FeedError::ConnectTimeout(connect_timeout))??;
        let FeedSession { outbound, inbound, guard } = session;

        let mut slot = lock(&self.session);
        if self.is_closing() {
            return Err(FeedError::Closed);
        }

        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst) + 1;
        let reader = tokio::spawn(Self::read_loop(self.clone(), id, inbound));
        if let Some(previous) = slot.replace(ActiveSession { id, outbound, reader, guard }) {
            previous.reader.abort();
        }
        self.set_state(ConnectionState::Connected);
        drop(slot);

        info!("Feed session {} established", id);
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, session_id: u64, mut inbound: mpsc::Receiver<FeedEvent>) {
        let mut reason = None;
        while let Some(event) = inbound.recv().await {
            match event {
                FeedEvent::Tick(tick) => self.dispatch(tick),
                FeedEvent::SubscriptionAck(ack) => self.resolve_ack(ack),
                FeedEvent::Closed(why) => {
                    reason = why;
                    break;
                }
            }
        }
        self.on_session_lost(session_id, reason);
    }

    /// Hot path: registry lookup, cache merge, hand-off to the code's worker.
    fn dispatch(&self, tick: Tick) {
        if self.is_closing() {
            return;
        }
        let Some(callback) = self.registry.callback(&tick.code) else {
            // Upstream may keep sending briefly after an unsubscribe.
            debug!("Discarding tick for unsubscribed code {}", tick.code);
            return;
        };
        let record = self.cache.get(&tick.code);
        self.dispatcher.dispatch(callback, Quote::merge(tick, record.as_ref()));
    }

    fn resolve_ack(&self, ack: SubscriptionAck) {
        match lock(&self.pending_acks).remove(&ack.code) {
            Some(waiter) => {
                let _ = waiter.send(ack);
            }
            None => debug!("Unsolicited subscription ack for {}", ack.code),
        }
    }

    /// Sends a subscribe request and waits for its acknowledgement.
    async fn request_subscription(&self, code: &str) -> Result<(), FeedError> {
        let outbound = self.outbound().ok_or(FeedError::NotConnected)?;
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending_acks);
            if pending.contains_key(code) {
                return Err(FeedError::SubscribePending(code.to_string()));
            }
            pending.insert(code.to_string(), ack_tx);
        }

        let message = ControlMessage::Subscribe { code: code.to_string() };
        if outbound.send(message).await.is_err() {
            lock(&self.pending_acks).remove(code);
            return Err(FeedError::Disconnected);
        }

        let ack = match timeout(self.settings.subscribe_timeout, ack_rx).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(_)) => return Err(FeedError::Disconnected),
            Err(_) => {
                lock(&self.pending_acks).remove(code);
                return Err(FeedError::SubscribeTimeout(code.to_string()));
            }
        };

        if ack.accepted {
            Ok(())
        } else {
            let reason = ack.message.unwrap_or_else(|| "rejected by upstream".to_string());
            warn!("Subscription for {} rejected: {}", code, reason);
            Err(FeedError::Rejected {
                code: code.to_string(),
                reason,
            })
        }
    }

    fn on_session_lost(self: Arc<Self>, session_id: u64, reason: Option<String>) {
        {
            let mut slot = lock(&self.session);
            match slot.as_ref() {
                Some(active) if active.id == session_id => {
                    slot.take();
                }
                // Superseded or already torn down by close().
                _ => return,
            }
        }
        // Waiters see their sender dropped and report Disconnected.
        lock(&self.pending_acks).clear();

        if self.is_closing() {
            return;
        }

        warn!(
            "Feed session {} lost: {}",
            session_id,
            reason.as_deref().unwrap_or("stream ended")
        );
        self.set_state(ConnectionState::Disconnected);

        if self.registry.is_empty() {
            info!("No subscriptions to restore, staying disconnected");
            return;
        }
        tokio::spawn(self.reconnect_loop());
    }

    async fn reconnect_loop(self: Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        loop {
            let (restored, attempts) = self.reestablish().await;
            if restored {
                self.resubscribe_all().await;
            } else if !self.is_closing() {
                error!("Giving up on feed after {} reconnect attempts", attempts);
                self.set_state(ConnectionState::Failed);
            }
            self.reconnecting.store(false, Ordering::SeqCst);

            // A loss seen while the flag was held did not start its own loop.
            let lost_again = restored
                && !self.is_closing()
                && lock(&self.session).is_none()
                && !self.registry.is_empty();
            if !lost_again || self.reconnecting.swap(true, Ordering::SeqCst) {
                return;
            }
            info!("Feed session lost during restore, reconnecting again");
        }
    }

    /// Runs the bounded attempt schedule. Returns whether a session was
    /// established and how many attempts it took.
    async fn reestablish(self: &Arc<Self>) -> (bool, u32) {
        let policy = &self.settings.reconnect;
        let mut attempt = 0;
        loop {
            if !policy.should_retry(attempt) || self.is_closing() {
                return (false, attempt);
            }
            let delay = policy.delay_for_attempt(attempt);
            attempt += 1;
            info!(
                "Reconnecting to feed in {:?} (attempt {}/{})",
                delay, attempt, policy.max_attempts
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = closed_signal(self.closing.subscribe()) => return (false, attempt),
            }

            self.set_state(ConnectionState::Connecting);
            let result = tokio::select! {
                result = self.establish() => result,
                _ = closed_signal(self.closing.subscribe()) => Err(FeedError::Closed),
            };

            match result {
                Ok(()) => return (true, attempt),
                Err(FeedError::Closed) => return (false, attempt),
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", attempt, e);
                    if !self.is_closing() {
                        self.set_state(ConnectionState::Disconnected);
                    }
                }
            }
        }
    }

    async fn resubscribe_all(&self) {
        let codes = self.registry.codes();
        let mut restored = 0;
        for code in &codes {
            match self.request_subscription(code).await {
                Ok(()) => restored += 1,
                Err(e) => warn!("Failed to restore subscription for {}: {}", code, e),
            }
        }
        info!("Restored {}/{} subscriptions after reconnect", restored, codes.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::feed::mock::MockTransport;
    use crate::model::VolumeSnapshot;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    const WAIT: Duration = Duration::from_secs(2);

    fn settings() -> ClientSettings {
        ClientSettings {
            connect_timeout: Duration::from_secs(1),
            subscribe_timeout: Duration::from_millis(300),
            reconnect: ReconnectPolicy::fixed(Duration::from_millis(20), 3),
            dispatch_queue_size: 64,
            shutdown_grace: Duration::from_millis(200),
        }
    }

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap()
    }

    fn tick(code: &str, price: f64, timestamp: DateTime<Utc>) -> Tick {
        Tick {
            code: code.to_string(),
            price,
            change: 500.0,
            timestamp,
        }
    }

    fn client_with_clock() -> (FeedClient, MockTransport, ManualClock) {
        let transport = MockTransport::new();
        let clock = ManualClock::new(start_time());
        let cache = Arc::new(VolumeCache::new(Arc::new(clock.clone())));
        let client = FeedClient::new(Arc::new(transport.clone()), cache, settings());
        (client, transport, clock)
    }

    fn collector() -> (impl Fn(Quote) + Send + Sync + 'static, UnboundedReceiver<Quote>) {
        let (tx, rx) = unbounded_channel();
        (move |quote: Quote| {
            let _ = tx.send(quote);
        }, rx)
    }

    async fn next_quote(rx: &mut UnboundedReceiver<Quote>) -> Quote {
        timeout(WAIT, rx.recv()).await.expect("quote not delivered").expect("channel closed")
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    async fn wait_for_state(client: &FeedClient, target: ConnectionState) {
        let mut rx = client.watch_state();
        timeout(WAIT, rx.wait_for(|state| *state == target))
            .await
            .expect("state not reached")
            .expect("state channel closed");
    }

    #[tokio::test]
    async fn test_volume_enrichment_follows_cache_ttl() {
        let (client, transport, clock) = client_with_clock();
        client.connect().await.unwrap();

        let (callback, mut rx) = collector();
        client.subscribe("005930", callback).await.unwrap();

        let t1 = start_time();
        assert!(transport.emit(tick("005930", 70000.0, t1)).await);
        let quote = next_quote(&mut rx).await;
        assert_eq!(quote.price, 70000.0);
        assert_eq!(quote.change, 500.0);
        assert_eq!(quote.timestamp, t1);
        assert_eq!(quote.volume, None);
        assert_eq!(quote.trading_value, None);

        client.cache().store_snapshot(
            "005930",
            VolumeSnapshot::new(12_000_000, 840_000_000_000),
            Duration::from_secs(10),
        );

        clock.advance(chrono::Duration::seconds(3));
        let t2 = t1 + chrono::Duration::seconds(3);
        transport.emit(tick("005930", 70000.0, t2)).await;
        let quote = next_quote(&mut rx).await;
        assert_eq!(quote.timestamp, t2);
        assert_eq!(quote.volume, Some(12_000_000));
        assert_eq!(quote.trading_value, Some(840_000_000_000));

        clock.advance(chrono::Duration::seconds(12));
        transport.emit(tick("005930", 70000.0, t1 + chrono::Duration::seconds(15))).await;
        let quote = next_quote(&mut rx).await;
        assert_eq!(quote.volume, None);
        assert_eq!(quote.trading_value, None);

        client.close().await;
    }

    #[tokio::test]
    async fn test_subscribe_requires_connection_and_survives_reconnect() {
        let (client, transport, _) = client_with_clock();

        let (callback, _rx) = collector();
        assert!(matches!(
            client.subscribe("000660", callback).await,
            Err(FeedError::NotConnected)
        ));
        assert_eq!(transport.subscribe_count("000660"), 0);

        client.connect().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);

        let (callback, mut rx) = collector();
        client.subscribe("000660", callback).await.unwrap();
        assert_eq!(transport.subscribe_count("000660"), 1);

        assert!(transport.drop_connection());
        timeout(WAIT, async {
            while transport.subscribe_count("000660") < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("subscription was not restored");

        assert_eq!(transport.connect_count(), 2);
        wait_for_state(&client, ConnectionState::Connected).await;

        transport.emit(tick("000660", 130000.0, Utc::now())).await;
        assert_eq!(next_quote(&mut rx).await.code, "000660");

        client.close().await;
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_callback() {
        let (client, transport, _) = client_with_clock();
        client.connect().await.unwrap();

        let first_calls = Arc::new(AtomicUsize::new(0));
        let counter = first_calls.clone();
        client
            .subscribe("005930", move |_q| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        let (callback, mut rx) = collector();
        client.subscribe("005930", callback).await.unwrap();
        // Replacement does not go upstream again.
        assert_eq!(transport.subscribe_count("005930"), 1);

        transport.emit(tick("005930", 1.0, Utc::now())).await;
        transport.emit(tick("005930", 2.0, Utc::now())).await;
        assert_eq!(next_quote(&mut rx).await.price, 1.0);
        assert_eq!(next_quote(&mut rx).await.price, 2.0);
        assert_eq!(first_calls.load(Ordering::SeqCst), 0);

        client.close().await;
    }

    #[tokio::test]
    async fn test_rejected_subscription_is_not_registered() {
        let (client, transport, _) = client_with_clock();
        transport.reject_code("999999");
        client.connect().await.unwrap();

        let (callback, _rx) = collector();
        match client.subscribe("999999", callback).await {
            Err(FeedError::Rejected { code, .. }) => assert_eq!(code, "999999"),
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(client.subscription_count(), 0);

        let (callback, _rx) = collector();
        assert!(matches!(client.subscribe("  ", callback).await, Err(FeedError::InvalidCode(_))));
    }

    #[tokio::test]
    async fn test_subscribe_times_out_without_ack() {
        let (client, transport, _) = client_with_clock();
        transport.set_silent(true);
        client.connect().await.unwrap();

        let (callback, _rx) = collector();
        assert!(matches!(
            client.subscribe("005930", callback).await,
            Err(FeedError::SubscribeTimeout(_))
        ));
        assert!(client.subscribed_codes().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_codes_are_discarded() {
        let (client, transport, _) = client_with_clock();
        client.connect().await.unwrap();

        let (callback, mut rx) = collector();
        client.subscribe("005930", callback).await.unwrap();

        transport.emit(tick("000660", 1.0, Utc::now())).await;
        transport.emit(tick("005930", 2.0, Utc::now())).await;
        assert_eq!(next_quote(&mut rx).await.code, "005930");

        assert!(client.unsubscribe("005930").await.unwrap());
        assert!(!client.unsubscribe("005930").await.unwrap());
        transport.emit(tick("005930", 3.0, Utc::now())).await;
        // Either nothing arrives or the dropped callback closed the channel.
        let late = timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(late.map(|q| q.is_none()).unwrap_or(true));
        assert!(transport
            .sent_messages()
            .contains(&ControlMessage::Unsubscribe { code: "005930".to_string() }));

        client.close().await;
    }

    #[tokio::test]
    async fn test_no_callbacks_after_close() {
        let (client, transport, _) = client_with_clock();
        client.connect().await.unwrap();

        let (callback, mut rx) = collector();
        client.subscribe("005930", callback).await.unwrap();
        transport.emit(tick("005930", 1.0, Utc::now())).await;
        next_quote(&mut rx).await;

        client.close().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(transport
            .sent_messages()
            .contains(&ControlMessage::Unsubscribe { code: "005930".to_string() }));

        // Upstream keeps talking for a moment; nothing reaches the callback.
        transport.emit(tick("005930", 2.0, Utc::now())).await;
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.map(|q| q.is_none()).unwrap_or(true));

        // Idempotent, and callable from another task.
        let other = client.clone();
        tokio::spawn(async move { other.close().await }).await.unwrap();
        client.close().await;
        assert_eq!(client.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_bounded_attempts() {
        let (client, transport, _) = client_with_clock();
        client.connect().await.unwrap();
        let (callback, _rx) = collector();
        client.subscribe("005930", callback).await.unwrap();

        transport.refuse_next_connects(10);
        transport.drop_connection();

        wait_for_state(&client, ConnectionState::Failed).await;
        // One initial connect plus three bounded retries.
        assert_eq!(transport.connect_count(), 4);
        assert_eq!(client.subscribed_codes(), vec!["005930"]);

        // A manual connect recovers from Failed.
        transport.refuse_next_connects(0);
        client.connect().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);
        client.close().await;
    }

    #[tokio::test]
    async fn test_close_interrupts_reconnect_loop() {
        let transport = MockTransport::new();
        let mut slow = settings();
        slow.reconnect = ReconnectPolicy::fixed(Duration::from_secs(30), 5);
        let client = FeedClient::new(Arc::new(transport.clone()), Arc::new(VolumeCache::default()), slow);

        client.connect().await.unwrap();
        let (callback, _rx) = collector();
        client.subscribe("005930", callback).await.unwrap();
        transport.drop_connection();
        wait_for_state(&client, ConnectionState::Disconnected).await;

        let started = std::time::Instant::now();
        timeout(Duration::from_secs(1), client.close()).await.expect("close blocked");
        assert!(started.elapsed() < Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_loss_without_subscriptions_stays_disconnected() {
        let (client, transport, _) = client_with_clock();
        client.connect().await.unwrap();

        transport.drop_connection();
        wait_for_state(&client, ConnectionState::Disconnected).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_reports_cause() {
        let (client, transport, _) = client_with_clock();
        transport.refuse_next_connects(1);

        assert!(matches!(client.connect().await, Err(FeedError::Transport(_))));
        assert_eq!(client.state(), ConnectionState::Disconnected);

        client.connect().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);
        client.close().await;
    }

    #[tokio::test]
    async fn test_queued_quotes_not_delivered_after_close_and_reconnect() {
        let (client, transport, _) = client_with_clock();
        client.connect().await.unwrap();

        let started = Arc::new(AtomicUsize::new(0));
        let counter = started.clone();
        client
            .subscribe("005930", move |_q| {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(100));
            })
            .await
            .unwrap();

        for i in 0..5 {
            transport.emit(tick("005930", i as f64, Utc::now())).await;
        }
        wait_until(|| started.load(Ordering::SeqCst) > 0).await;

        client.close().await;
        let at_close = started.load(Ordering::SeqCst);
        client.connect().await.unwrap();

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(started.load(Ordering::SeqCst), at_close);
        client.close().await;
    }

    #[tokio::test]
    async fn test_loss_during_restore_reconnects_again() {
        let (client, transport, _) = client_with_clock();
        client.connect().await.unwrap();
        let (callback, mut rx) = collector();
        client.subscribe("005930", callback).await.unwrap();

        // Hold the restore open by withholding acks, then drop that session too.
        transport.set_silent(true);
        transport.drop_connection();
        wait_until(|| transport.subscribe_count("005930") == 2).await;
        transport.set_silent(false);
        assert!(transport.drop_connection());

        wait_until(|| transport.subscribe_count("005930") >= 3).await;
        wait_for_state(&client, ConnectionState::Connected).await;
        assert_eq!(transport.connect_count(), 3);

        transport.emit(tick("005930", 1.0, Utc::now())).await;
        assert_eq!(next_quote(&mut rx).await.code, "005930");
        client.close().await;
    }

    #[tokio::test]
    async fn test_close_interrupts_hanging_reconnect_attempt() {
        let (client, transport, _) = client_with_clock();
        client.connect().await.unwrap();
        let (callback, _rx) = collector();
        client.subscribe("005930", callback).await.unwrap();

        transport.hang_connects(true);
        transport.drop_connection();
        wait_until(|| transport.connect_count() == 2).await;
        assert_eq!(client.state(), ConnectionState::Connecting);

        timeout(settings().shutdown_grace, client.close())
            .await
            .expect("close blocked on a pending connect");
        assert_eq!(client.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_subscribe_for_same_code_is_rejected() {
        let (client, transport, _) = client_with_clock();
        transport.set_silent(true);
        client.connect().await.unwrap();

        let first = {
            let client = client.clone();
            tokio::spawn(async move { client.subscribe("005930", |_q| {}).await })
        };
        wait_until(|| transport.subscribe_count("005930") == 1).await;

        let second = client.subscribe("005930", |_q| {}).await;
        assert!(matches!(second, Err(FeedError::SubscribePending(_))));
        assert!(matches!(first.await.unwrap(), Err(FeedError::SubscribeTimeout(_))));
        assert_eq!(transport.subscribe_count("005930"), 1);
    }
}
