//! Offer deadlines and late-response arbitration.
//!
//! Every discovery offer gets one timer. A provider that misses its
//! deadline moves into the timed-out set for the name, where its eventual
//! response is still matched: the first late accept is parked in case the
//! race ends without a winner, later late accepts are revoked outright,
//! and a late reject just drops the provider.

use crate::listen::Provider;
use crate::metrics;
use crate::socket::SocketRef;
use drift_proto::{Action, Message, Topic};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

struct PendingOffer {
    provider: Provider,
    token: u64,
}

#[derive(Default)]
struct TimeoutState {
    /// One outstanding offer timer per name.
    pending: HashMap<String, PendingOffer>,
    /// Providers whose offer window expired without a response.
    timed_out: HashMap<String, Vec<Provider>>,
    /// The first late accepter per name, kept in case the race drains.
    accepted: HashMap<String, Provider>,
}

/// Tracks outstanding discovery offers and reconciles late responses.
pub struct ListenerTimeoutRegistry {
    topic: Topic,
    response_timeout: Duration,
    state: Arc<Mutex<TimeoutState>>,
    next_token: AtomicU64,
}

impl ListenerTimeoutRegistry {
    pub(crate) fn new(topic: Topic, response_timeout: Duration) -> Self {
        Self {
            topic,
            response_timeout,
            state: Arc::new(Mutex::new(TimeoutState::default())),
            next_token: AtomicU64::new(1),
        }
    }

    /// Arm the offer timer for `name`. On expiry the provider moves into
    /// the timed-out set, is told its window closed, and `on_timeout` runs
    /// so the race can advance. A newer offer for the same name supersedes
    /// the previous timer.
    pub(crate) fn add_timeout(
        &self,
        name: &str,
        provider: Provider,
        on_timeout: impl FnOnce(String) + Send + 'static,
    ) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.state.lock().pending.insert(
            name.to_string(),
            PendingOffer {
                provider: provider.clone(),
                token,
            },
        );

        let state = self.state.clone();
        let topic = self.topic;
        let timeout = self.response_timeout;
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // The token check makes cancellation idempotent: a timer whose
            // offer was already resolved or superseded must never fire.
            let expired = {
                let mut state = state.lock();
                match state.pending.get(&name) {
                    Some(offer) if offer.token == token => {
                        state.pending.remove(&name);
                        state
                            .timed_out
                            .entry(name.clone())
                            .or_default()
                            .push(provider.clone());
                        true
                    }
                    _ => false,
                }
            };
            if expired {
                metrics::discovery_timeouts().inc();
                debug!(topic = ?topic, name = %name, pattern = %provider.pattern,
                    "listen offer timed out");
                provider.socket.send_message(
                    Message::new(topic, Action::ListenResponseTimeout, &provider.pattern)
                        .with_subscription(&name),
                );
                on_timeout(name);
            }
        });
    }

    /// Cancel the pending offer timer for `name`.
    pub(crate) fn clear_timeout(&self, name: &str) {
        self.state.lock().pending.remove(name);
    }

    /// Cancel the live offer for `name` if `(socket, pattern)` still holds
    /// it. Returns false when the timer already expired the offer or a newer
    /// offer superseded it; exactly one of resolution and expiry wins, so the
    /// caller only advances the race on true and treats the response as late
    /// otherwise.
    pub(crate) fn try_resolve(&self, name: &str, socket: &SocketRef, pattern: &str) -> bool {
        let mut state = self.state.lock();
        match state.pending.get(name) {
            Some(offer) if offer.provider.matches(socket, pattern) => {
                state.pending.remove(name);
                true
            }
            _ => false,
        }
    }

    /// Drop all bookkeeping for `name` once its discovery concluded.
    pub(crate) fn clear(&self, name: &str) {
        let mut state = self.state.lock();
        state.pending.remove(name);
        state.timed_out.remove(name);
        state.accepted.remove(name);
    }

    /// True if `(socket, pattern)` previously timed out for `name`.
    pub(crate) fn is_a_late_responder(&self, socket: &SocketRef, pattern: &str, name: &str) -> bool {
        self.state
            .lock()
            .timed_out
            .get(name)
            .is_some_and(|providers| providers.iter().any(|p| p.matches(socket, pattern)))
    }

    /// Process an accept or reject from a provider already in the timed-out
    /// set. The caller has established late-responder provenance.
    pub(crate) fn handle(&self, socket: &SocketRef, action: Action, pattern: &str, name: &str) {
        let revoked = {
            let mut state = self.state.lock();
            let Some(providers) = state.timed_out.get_mut(name) else {
                return;
            };
            let Some(index) = providers.iter().position(|p| p.matches(socket, pattern)) else {
                return;
            };
            match action {
                Action::ListenAccept => {
                    let provider = providers[index].clone();
                    if state.accepted.contains_key(name) {
                        Some(provider)
                    } else {
                        state.accepted.insert(name.to_string(), provider);
                        None
                    }
                }
                Action::ListenReject => {
                    providers.remove(index);
                    None
                }
                _ => None,
            }
        };
        if let Some(provider) = revoked {
            self.send_pattern_removed(&provider, name);
        }
    }

    /// The first late accepter for `name`, consumed on promotion.
    pub(crate) fn take_late_responder_that_accepted(&self, name: &str) -> Option<Provider> {
        self.state.lock().accepted.remove(name)
    }

    /// Revoke the parked late accepter for `name`, if any.
    pub(crate) fn reject_late_responder_that_accepted(&self, name: &str) {
        let provider = self.state.lock().accepted.remove(name);
        if let Some(provider) = provider {
            self.send_pattern_removed(&provider, name);
        }
    }

    /// Purge `(socket, pattern)` from the timed-out sets and the parked
    /// accepter slots. Pending offer timers are advanced by the listener
    /// registry, which knows the race the offer belongs to.
    pub(crate) fn remove_provider(&self, socket: &SocketRef, pattern: &str) {
        let mut state = self.state.lock();
        for providers in state.timed_out.values_mut() {
            providers.retain(|p| !p.matches(socket, pattern));
        }
        state
            .accepted
            .retain(|_, provider| !provider.matches(socket, pattern));
    }

    fn send_pattern_removed(&self, provider: &Provider, name: &str) {
        provider.socket.send_message(
            Message::new(self.topic, Action::SubscriptionForPatternRemoved, &provider.pattern)
                .with_subscription(name),
        );
    }
}
