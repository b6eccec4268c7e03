use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use log::info;

use crate::model::Quote;

/// Subscriber callback. Runs on the blocking pool, one quote at a time per code.
pub type QuoteCallback = Arc<dyn Fn(Quote) + Send + Sync>;

#[derive(Clone)]
pub struct Subscription {
    pub code: String,
    pub callback: QuoteCallback,
    pub subscribed_at: DateTime<Utc>,
}

/// Security code -> subscription. Written by subscribe/unsubscribe/close,
/// read by the tick reader.
#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: RwLock<HashMap<String, Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces the callback for `code`. Returns `true` when an
    /// earlier callback was replaced.
    pub fn insert(&self, code: &str, callback: QuoteCallback) -> bool {
        let mut subscriptions = self.subscriptions.write().unwrap_or_else(PoisonError::into_inner);
        let replaced = subscriptions
            .insert(
                code.to_string(),
                Subscription {
                    code: code.to_string(),
                    callback,
                    subscribed_at: Utc::now(),
                },
            )
            .is_some();

        if replaced {
            info!("Replaced callback for {}", code);
        } else {
            info!("Registered subscription for {}", code);
        }
        replaced
    }

    pub fn remove(&self, code: &str) -> bool {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(code)
            .is_some()
    }

    pub fn callback(&self, code: &str) -> Option<QuoteCallback> {
        self.subscriptions
            .read()
            .ok()
            .and_then(|subscriptions| subscriptions.get(code).map(|s| s.callback.clone()))
    }

    pub fn contains(&self, code: &str) -> bool {
        self.subscriptions
            .read()
            .map(|subscriptions| subscriptions.contains_key(code))
            .unwrap_or(false)
    }

    pub fn codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self
            .subscriptions
            .read()
            .map(|subscriptions| subscriptions.keys().cloned().collect())
            .unwrap_or_default();
        codes.sort();
        codes
    }

    pub fn len(&self) -> usize {
        self.subscriptions.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes everything, returning the codes that were registered.
    pub fn clear(&self) -> Vec<String> {
        let mut subscriptions = self.subscriptions.write().unwrap_or_else(PoisonError::into_inner);
        let mut codes: Vec<String> = subscriptions.drain().map(|(code, _)| code).collect();
        codes.sort();
        codes
    }
}
