//! In-memory feed transport.
//!
//! Acknowledges subscriptions on its own (rejecting configured codes), records
//! every control message and lets the caller push ticks or drop the current
//! connection. Used by the client tests and for running the service without
//! an upstream.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use log::debug;
use tokio::sync::mpsc;

use crate::error::FeedError;
use crate::feed::protocol::{ControlMessage, FeedEvent, SubscriptionAck};
use crate::feed::transport::{FeedSession, FeedTransport, SessionGuard, SESSION_CHANNEL_SIZE};
use crate::model::Tick;

#[derive(Default)]
struct MockState {
    refuse_connects: usize,
    hang_connects: bool,
    silent: bool,
    rejected_codes: HashSet<String>,
    connects: usize,
    sent: Vec<ControlMessage>,
    inbound: Option<mpsc::Sender<FeedEvent>>,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fails the next `count` connection attempts.
    pub fn refuse_next_connects(&self, count: usize) {
        self.state().refuse_connects = count;
    }

    /// Connection attempts never complete while set.
    pub fn hang_connects(&self, hang: bool) {
        self.state().hang_connects = hang;
    }

    /// Upstream answers subscribe requests for `code` with an error.
    pub fn reject_code(&self, code: &str) {
        self.state().rejected_codes.insert(code.to_string());
    }

    /// Stop acknowledging subscribe requests.
    pub fn set_silent(&self, silent: bool) {
        self.state().silent = silent;
    }

    /// Sends a tick over the current connection. `false` if there is none.
    pub async fn emit(&self, tick: Tick) -> bool {
        let sender = self.state().inbound.clone();
        match sender {
            Some(sender) => sender.send(FeedEvent::Tick(tick)).await.is_ok(),
            None => false,
        }
    }

    /// Simulates the upstream dropping the connection.
    pub fn drop_connection(&self) -> bool {
        let sender = self.state().inbound.take();
        match sender {
            Some(sender) => sender
                .try_send(FeedEvent::Closed(Some("mock connection dropped".to_string())))
                .is_ok(),
            None => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state()
            .inbound
            .as_ref()
            .map(|sender| !sender.is_closed())
            .unwrap_or(false)
    }

    pub fn connect_count(&self) -> usize {
        self.state().connects
    }

    pub fn sent_messages(&self) -> Vec<ControlMessage> {
        self.state().sent.clone()
    }

    pub fn subscribe_count(&self, code: &str) -> usize {
        self.state()
            .sent
            .iter()
            .filter(|m| matches!(m, ControlMessage::Subscribe { code: c } if c == code))
            .count()
    }
}

#[async_trait]
impl FeedTransport for MockTransport {
    async fn connect(&self) -> Result<FeedSession, FeedError> {
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ControlMessage>(SESSION_CHANNEL_SIZE);
        let (inbound_tx, inbound_rx) = mpsc::channel::<FeedEvent>(SESSION_CHANNEL_SIZE);

        let hang = {
            let mut state = self.state();
            state.connects += 1;
            state.hang_connects
        };
        if hang {
            std::future::pending::<()>().await;
        }

        {
            let mut state = self.state();
            if state.refuse_connects > 0 {
                state.refuse_connects -= 1;
                return Err(FeedError::Transport("mock connection refused".to_string()));
            }
            state.inbound = Some(inbound_tx.clone());
        }

        let state = self.state.clone();
        let responder = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                debug!("Mock feed received {:?}", message);
                let ack = {
                    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                    state.sent.push(message.clone());
                    match &message {
                        ControlMessage::Subscribe { code } if !state.silent => {
                            let accepted = !state.rejected_codes.contains(code);
                            Some(SubscriptionAck {
                                code: code.clone(),
                                accepted,
                                message: (!accepted).then(|| format!("{} rejected by mock feed", code)),
                            })
                        }
                        _ => None,
                    }
                };

                if let Some(ack) = ack {
                    if inbound_tx.send(FeedEvent::SubscriptionAck(ack)).await.is_err() {
                        break;
                    }
                }
            }
        });

        Ok(FeedSession {
            outbound: outbound_tx,
            inbound: inbound_rx,
            guard: SessionGuard::new(vec![responder]),
        })
    }
}
