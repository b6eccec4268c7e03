use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, warn};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::feed::registry::QuoteCallback;
use crate::model::Quote;

struct Delivery {
    callback: QuoteCallback,
    quote: Quote,
}

struct Worker {
    sender: mpsc::Sender<Delivery>,
    cancelled: Arc<AtomicBool>,
}

impl Worker {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// Fans quotes out to per-code worker tasks.
///
/// Each code gets one worker draining a bounded queue, so deliveries for a
/// code stay in order while a stuck callback only backs up its own queue.
/// The callback itself runs on the blocking pool; a panic there is logged
/// and the worker moves on. A removed or closed worker discards whatever is
/// still queued; reopening only affects workers started afterwards.
pub struct Dispatcher {
    workers: Mutex<HashMap<String, Worker>>,
    closed: AtomicBool,
    queue_size: usize,
}

impl Dispatcher {
    pub fn new(queue_size: usize) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            queue_size: queue_size.max(1),
        }
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<String, Worker>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `quote` for `callback`. Must be called from within a tokio runtime.
    pub fn dispatch(&self, callback: QuoteCallback, quote: Quote) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let code = quote.code.clone();
        let mut workers = self.workers();
        let worker = workers
            .entry(code.clone())
            .or_insert_with(|| self.spawn_worker(code.clone()));

        match worker.sender.try_send(Delivery { callback, quote }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Subscriber for {} is lagging, dropping quote", code);
            }
            Err(TrySendError::Closed(delivery)) => {
                // Worker went away; start a fresh one for this code.
                let worker = self.spawn_worker(code.clone());
                if worker.sender.try_send(delivery).is_err() {
                    warn!("Could not hand quote for {} to a new worker", code);
                }
                workers.insert(code, worker);
            }
        }
    }

    fn spawn_worker(&self, code: String) -> Worker {
        let (sender, mut rx) = mpsc::channel::<Delivery>(self.queue_size);
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();

        tokio::spawn(async move {
            debug!("Dispatch worker started for {}", code);
            while let Some(Delivery { callback, quote }) = rx.recv().await {
                if flag.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = tokio::task::spawn_blocking(move || callback(quote)).await {
                    if e.is_panic() {
                        error!("Subscriber callback for {} panicked", code);
                    } else {
                        warn!("Subscriber callback for {} was cancelled", code);
                    }
                }
            }
            debug!("Dispatch worker stopped for {}", code);
        });

        Worker { sender, cancelled }
    }

    /// Stops the worker for `code`; quotes still queued are discarded.
    pub fn remove(&self, code: &str) {
        if let Some(worker) = self.workers().remove(code) {
            worker.cancel();
        }
    }

    /// Stops every worker; queued quotes are discarded, not delivered.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for (_, worker) in self.workers().drain() {
            worker.cancel();
        }
    }

    pub fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }

    pub fn worker_count(&self) -> usize {
        self.workers().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn quote(code: &str, price: f64) -> Quote {
        Quote {
            code: code.to_string(),
            price,
            change: 0.0,
            timestamp: Utc::now(),
            volume: None,
            trading_value: None,
        }
    }

    #[tokio::test]
    async fn test_preserves_order_per_code() {
        let dispatcher = Dispatcher::new(64);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback: QuoteCallback = Arc::new(move |q: Quote| {
            let _ = tx.send(q.price);
        });

        for i in 0..20 {
            dispatcher.dispatch(callback.clone(), quote("005930", i as f64));
        }

        for i in 0..20 {
            let price = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
            assert_eq!(price, i as f64);
        }
    }

    #[tokio::test]
    async fn test_slow_callback_does_not_block_other_codes() {
        let dispatcher = Dispatcher::new(8);
        let slow: QuoteCallback = Arc::new(|_q| std::thread::sleep(Duration::from_millis(500)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let fast: QuoteCallback = Arc::new(move |q: Quote| {
            let _ = tx.send(q.code);
        });

        dispatcher.dispatch(slow.clone(), quote("SLOW", 1.0));
        dispatcher.dispatch(slow, quote("SLOW", 2.0));
        dispatcher.dispatch(fast, quote("FAST", 1.0));

        let code = timeout(Duration::from_millis(200), rx.recv()).await.unwrap().unwrap();
        assert_eq!(code, "FAST");
    }

    #[tokio::test]
    async fn test_panicking_callback_is_isolated() {
        let dispatcher = Dispatcher::new(8);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback: QuoteCallback = Arc::new(move |q: Quote| {
            if q.price < 0.0 {
                panic!("bad price");
            }
            let _ = tx.send(q.price);
        });

        dispatcher.dispatch(callback.clone(), quote("005930", -1.0));
        dispatcher.dispatch(callback, quote("005930", 10.0));

        let price = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(price, 10.0);
    }

    #[tokio::test]
    async fn test_closed_dispatcher_delivers_nothing() {
        let dispatcher = Dispatcher::new(8);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback: QuoteCallback = Arc::new(move |q: Quote| {
            let _ = tx.send(q.price);
        });

        dispatcher.close();
        dispatcher.dispatch(callback.clone(), quote("005930", 1.0));
        assert_eq!(dispatcher.worker_count(), 0);
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());

        dispatcher.reopen();
        dispatcher.dispatch(callback, quote("005930", 2.0));
        let price = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(price, 2.0);
    }

    #[tokio::test]
    async fn test_backlog_discarded_after_close_and_reopen() {
        let dispatcher = Dispatcher::new(16);
        let started = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = started.clone();
        let callback: QuoteCallback = Arc::new(move |_q: Quote| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(100));
        });

        for i in 0..5 {
            dispatcher.dispatch(callback.clone(), quote("005930", i as f64));
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        dispatcher.close();
        let at_close = started.load(Ordering::SeqCst);
        dispatcher.reopen();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(started.load(Ordering::SeqCst), at_close);
        assert!(at_close <= 1);
    }

    #[tokio::test]
    async fn test_remove_discards_queued_quotes() {
        let dispatcher = Dispatcher::new(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback: QuoteCallback = Arc::new(move |q: Quote| {
            std::thread::sleep(Duration::from_millis(50));
            let _ = tx.send(q.price);
        });

        for i in 0..4 {
            dispatcher.dispatch(callback.clone(), quote("005930", i as f64));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        dispatcher.remove("005930");

        // Only the delivery already running completes.
        assert_eq!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap(), Some(0.0));
        assert!(timeout(Duration::from_millis(300), rx.recv()).await.is_err());
    }
}
