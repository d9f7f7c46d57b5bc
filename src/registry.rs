use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::adapter::BleAdapter;
use crate::config::SessionConfig;
use crate::notify::NotificationHub;
use crate::session::{DeviceSession, SessionEnd};
use crate::Error;

struct Inner {
    sessions: HashMap<String, Arc<DeviceSession>>,
    last_errors: HashMap<String, Error>,
}

/// Maps device addresses to at most one live session each.
///
/// Sessions that reach a terminal state on their own are garbage
/// collected from the active map by a background reaper, but their
/// final error stays queryable until the next connection attempt for
/// that address. Map mutations are serialized; the sessions themselves
/// run independently.
pub struct SessionRegistry<A: BleAdapter> {
    adapter: Arc<A>,
    hub: Arc<NotificationHub>,
    config: SessionConfig,
    inner: Arc<Mutex<Inner>>,
    terminal_tx: mpsc::UnboundedSender<SessionEnd>,
}

impl<A: BleAdapter> SessionRegistry<A> {
    pub fn new(adapter: Arc<A>, hub: Arc<NotificationHub>, config: SessionConfig) -> Self {
        let (terminal_tx, mut terminal_rx) = mpsc::unbounded_channel::<SessionEnd>();

        let inner = Arc::new(Mutex::new(Inner {
            sessions: HashMap::new(),
            last_errors: HashMap::new(),
        }));

        let reaper_inner = inner.clone();
        tokio::spawn(async move {
            while let Some(end) = terminal_rx.recv().await {
                let mut inner = reaper_inner.lock().unwrap();

                // A newer live session may already occupy the address;
                // its report is stale and must neither reap the new
                // session nor overwrite its cleared error slot.
                let superseded = inner
                    .sessions
                    .get(&end.address)
                    .map(|session| !session.state().is_terminal())
                    .unwrap_or(false);
                if superseded {
                    continue;
                }

                if inner.sessions.remove(&end.address).is_some() {
                    log::debug!("Reaping terminated session {}", end.address);
                }

                if let Some(error) = end.error {
                    inner.last_errors.insert(end.address, error);
                }
            }
        });

        Self {
            adapter,
            hub,
            config,
            inner,
            terminal_tx,
        }
    }

    /// Return the live session for `address`, creating one if none
    /// exists. Calling this twice without an intervening disconnect
    /// returns the same instance.
    pub fn connect(&self, address: &str) -> Arc<DeviceSession> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(existing) = inner.sessions.get(address) {
            if !existing.state().is_terminal() {
                return existing.clone();
            }
        }

        log::debug!("Starting session for {}", address);
        inner.last_errors.remove(address);

        let session = DeviceSession::spawn(
            self.adapter.clone(),
            address.to_string(),
            self.config,
            self.hub.clone(),
            self.terminal_tx.clone(),
        );
        inner.sessions.insert(address.to_string(), session.clone());

        session
    }

    /// Live session for `address`, if any.
    pub fn get(&self, address: &str) -> Option<Arc<DeviceSession>> {
        self.inner.lock().unwrap().sessions.get(address).cloned()
    }

    /// Drive the session for `address` to Disconnected and drop it from
    /// the registry. No-op if no session exists.
    pub async fn disconnect(&self, address: &str) {
        let session = self.get(address);

        if let Some(session) = session {
            session.disconnect().await;

            let mut inner = self.inner.lock().unwrap();
            if let Some(current) = inner.sessions.get(address) {
                if Arc::ptr_eq(current, &session) {
                    inner.sessions.remove(address);
                }
            }
        }
    }

    /// Final error of the most recent session for `address`, retained
    /// after the session was garbage collected.
    pub fn last_error(&self, address: &str) -> Option<Error> {
        self.inner
            .lock()
            .unwrap()
            .last_errors
            .get(address)
            .cloned()
    }

    /// Addresses with a session currently in the registry.
    pub fn active_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .inner
            .lock()
            .unwrap()
            .sessions
            .keys()
            .cloned()
            .collect();
        addresses.sort();
        addresses
    }
}
