use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;

use crate::adapter::{BleAdapter, BleLink, CharacteristicProps, LinkEvent, ServiceDescriptor};
use crate::config::SessionConfig;
use crate::notify::{NotificationEvent, NotificationHub};
use crate::{Error, Result};

const COMMAND_QUEUE_DEPTH: usize = 16;

/// Lifecycle of one GATT connection.
///
/// `Disconnected` and `Error` are final; a new connection to the same
/// address is a new session instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Discovering,
    Ready,
    Disconnecting,
    Disconnected,
    Error(Error),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Error(_))
    }
}

/// Reported to the registry when a session reaches a terminal state.
pub(crate) struct SessionEnd {
    pub address: String,
    pub error: Option<Error>,
}

enum Command {
    Read {
        handle: u16,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
    Write {
        handle: u16,
        value: Vec<u8>,
        require_ack: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        handle: u16,
        reply: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        handle: u16,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to one live or terminating GATT connection.
///
/// All GATT traffic for the session runs through a single task that
/// exclusively owns the link, so operations on one session are
/// serialized among themselves and never interleave on the wire, while
/// sessions for different addresses proceed independently. Every
/// suspending operation is bounded by the timeouts in
/// [`SessionConfig`].
pub struct DeviceSession {
    address: String,
    commands: mpsc::Sender<Command>,
    state_rx: watch::Receiver<SessionState>,
    services: Arc<Mutex<Option<Arc<Vec<ServiceDescriptor>>>>>,
    subscriptions: Arc<Mutex<HashSet<u16>>>,
    last_error: Arc<Mutex<Option<Error>>>,
}

impl DeviceSession {
    pub(crate) fn spawn<A: BleAdapter>(
        adapter: Arc<A>,
        address: String,
        config: SessionConfig,
        hub: Arc<NotificationHub>,
        terminal_tx: mpsc::UnboundedSender<SessionEnd>,
    ) -> Arc<Self> {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);

        let services = Arc::new(Mutex::new(None));
        let subscriptions = Arc::new(Mutex::new(HashSet::new()));
        let last_error = Arc::new(Mutex::new(None));

        let session = Arc::new(Self {
            address: address.clone(),
            commands: command_tx,
            state_rx,
            services: services.clone(),
            subscriptions: subscriptions.clone(),
            last_error: last_error.clone(),
        });

        let mut task = SessionTask {
            address,
            config,
            hub,
            state_tx,
            services,
            subscriptions,
            last_error,
            commands: command_rx,
        };

        tokio::spawn(async move {
            let error = task.drive(adapter).await;
            terminal_tx
                .send(SessionEnd {
                    address: task.address,
                    error,
                })
                .ok();
        });

        session
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }

    /// Watch state transitions. The receiver always holds the latest
    /// state; intermediate transitions may be coalesced.
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Discovered services. `None` until discovery has completed;
    /// immutable afterwards.
    pub fn services(&self) -> Option<Arc<Vec<ServiceDescriptor>>> {
        self.services.lock().unwrap().clone()
    }

    /// Handles with an active notification subscription.
    pub fn subscriptions(&self) -> Vec<u16> {
        let mut handles: Vec<u16> = self.subscriptions.lock().unwrap().iter().copied().collect();
        handles.sort_unstable();
        handles
    }

    pub fn last_error(&self) -> Option<Error> {
        self.last_error.lock().unwrap().clone()
    }

    /// Read a characteristic value.
    pub async fn read(&self, handle: u16) -> Result<Vec<u8>> {
        self.ensure_ready()?;

        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Read { handle, reply })
            .await
            .map_err(|_| Error::NotConnected)?;
        response.await.map_err(|_| Error::NotConnected)?
    }

    /// Write a characteristic value. With `require_ack` the call
    /// resolves once the peripheral acknowledges; without, once the
    /// write has been queued on the link.
    pub async fn write(&self, handle: u16, value: Vec<u8>, require_ack: bool) -> Result<()> {
        self.ensure_ready()?;

        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Write {
                handle,
                value,
                require_ack,
                reply,
            })
            .await
            .map_err(|_| Error::NotConnected)?;
        response.await.map_err(|_| Error::NotConnected)?
    }

    /// Enable notifications for a characteristic and start forwarding
    /// its value changes to the notification hub. Subscribing an
    /// already-subscribed handle is a no-op.
    pub async fn subscribe(&self, handle: u16) -> Result<()> {
        self.ensure_ready()?;

        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Subscribe { handle, reply })
            .await
            .map_err(|_| Error::NotConnected)?;
        response.await.map_err(|_| Error::NotConnected)?
    }

    /// Reverse of [`subscribe`](Self::subscribe). Unsubscribing a
    /// handle that is not subscribed is a no-op. After this returns, no
    /// further events for the handle are forwarded.
    pub async fn unsubscribe(&self, handle: u16) -> Result<()> {
        self.ensure_ready()?;

        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Unsubscribe { handle, reply })
            .await
            .map_err(|_| Error::NotConnected)?;
        response.await.map_err(|_| Error::NotConnected)?
    }

    /// Gracefully tear the session down. Always succeeds from the
    /// caller's perspective; the underlying release is best-effort with
    /// a hard upper bound.
    pub async fn disconnect(&self) {
        if self.state().is_terminal() {
            return;
        }

        let (reply, response) = oneshot::channel();
        if self
            .commands
            .send(Command::Disconnect { reply })
            .await
            .is_err()
        {
            return;
        }
        response.await.ok();
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            SessionState::Ready => Ok(()),
            _ => Err(Error::NotConnected),
        }
    }
}

struct SessionTask {
    address: String,
    config: SessionConfig,
    hub: Arc<NotificationHub>,
    state_tx: watch::Sender<SessionState>,
    services: Arc<Mutex<Option<Arc<Vec<ServiceDescriptor>>>>>,
    subscriptions: Arc<Mutex<HashSet<u16>>>,
    last_error: Arc<Mutex<Option<Error>>>,
    commands: mpsc::Receiver<Command>,
}

impl SessionTask {
    /// Runs the whole session lifecycle and returns the terminal error,
    /// if any.
    async fn drive<A: BleAdapter>(&mut self, adapter: Arc<A>) -> Option<Error> {
        log::debug!("Connecting to {}", self.address);

        // Commands are serviced while the link comes up so that a
        // disconnect cancels the pending connect or discovery instead
        // of waiting out its timeout.
        let (mut link, mut events) = {
            let connect = timeout(self.config.connect_timeout, adapter.connect(&self.address));
            tokio::pin!(connect);

            loop {
                tokio::select! {
                    result = &mut connect => match result {
                        Err(_) => {
                            return self.fail(Error::ConnectionTimeout {
                                address: self.address.clone(),
                            })
                        }
                        Ok(Err(e)) => return self.fail(e),
                        Ok(Ok(pair)) => break pair,
                    },
                    command = self.commands.recv() => {
                        if let ControlFlow::Break(reply) = self.early_command(command) {
                            return self.abandon(None, reply).await;
                        }
                    }
                }
            }
        };

        self.set_state(SessionState::Discovering);

        let discovered = {
            let discover = timeout(self.config.operation_timeout, link.discover_services());
            tokio::pin!(discover);

            loop {
                tokio::select! {
                    result = &mut discover => break Ok(result),
                    command = self.commands.recv() => {
                        if let ControlFlow::Break(reply) = self.early_command(command) {
                            break Err(reply);
                        }
                    }
                }
            }
        };

        let services = match discovered {
            Err(reply) => return self.abandon(Some(&mut link), reply).await,
            Ok(Err(_)) => {
                link.disconnect().await.ok();
                return self.fail(Error::DiscoveryFailed(
                    "service discovery timed out".to_string(),
                ));
            }
            Ok(Ok(Err(e))) => {
                link.disconnect().await.ok();
                return self.fail(e);
            }
            Ok(Ok(Ok(services))) => services,
        };

        let characteristics: HashMap<u16, CharacteristicProps> = services
            .iter()
            .flat_map(|service| {
                service
                    .characteristics
                    .iter()
                    .map(|characteristic| (characteristic.handle, characteristic.properties))
            })
            .collect();
        *self.services.lock().unwrap() = Some(Arc::new(services));

        log::info!(
            "Session {} ready ({} characteristics)",
            self.address,
            characteristics.len()
        );
        self.set_state(SessionState::Ready);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let ControlFlow::Break(end) =
                            self.handle_command(&mut link, &characteristics, command).await
                        {
                            return end;
                        }
                    }
                    // All handles dropped; release the link.
                    None => return self.teardown(&mut link, None).await,
                },
                event = events.next() => match event {
                    Some(LinkEvent::Notification { handle, value }) => {
                        self.forward_notification(handle, value);
                    }
                    Some(LinkEvent::Disconnected) | None => return self.peer_disconnected(),
                },
            }
        }
    }

    /// Commands arriving before the session is ready. A disconnect (or
    /// all handles dropping) breaks with the reply to honor; anything
    /// else is answered with `NotConnected`.
    fn early_command(&self, command: Option<Command>) -> ControlFlow<Option<oneshot::Sender<()>>> {
        match command {
            Some(Command::Disconnect { reply }) => ControlFlow::Break(Some(reply)),
            None => ControlFlow::Break(None),
            Some(Command::Read { reply, .. }) => {
                reply.send(Err(Error::NotConnected)).ok();
                ControlFlow::Continue(())
            }
            Some(Command::Write { reply, .. })
            | Some(Command::Subscribe { reply, .. })
            | Some(Command::Unsubscribe { reply, .. }) => {
                reply.send(Err(Error::NotConnected)).ok();
                ControlFlow::Continue(())
            }
        }
    }

    /// Tear down a session that was cancelled before reaching Ready.
    async fn abandon(
        &self,
        link: Option<&mut Box<dyn BleLink>>,
        reply: Option<oneshot::Sender<()>>,
    ) -> Option<Error> {
        log::debug!("Session {} cancelled before ready", self.address);
        self.set_state(SessionState::Disconnecting);

        if let Some(link) = link {
            timeout(self.config.disconnect_timeout, link.disconnect())
                .await
                .ok();
        }

        self.set_state(SessionState::Disconnected);
        if let Some(reply) = reply {
            reply.send(()).ok();
        }

        None
    }

    async fn handle_command(
        &self,
        link: &mut Box<dyn BleLink>,
        characteristics: &HashMap<u16, CharacteristicProps>,
        command: Command,
    ) -> ControlFlow<Option<Error>> {
        match command {
            Command::Read { handle, reply } => {
                reply.send(self.read(link, characteristics, handle).await).ok();
            }
            Command::Write {
                handle,
                value,
                require_ack,
                reply,
            } => {
                reply
                    .send(
                        self.write(link, characteristics, handle, value, require_ack)
                            .await,
                    )
                    .ok();
            }
            Command::Subscribe { handle, reply } => {
                reply
                    .send(self.subscribe(link, characteristics, handle).await)
                    .ok();
            }
            Command::Unsubscribe { handle, reply } => {
                reply.send(self.unsubscribe(link, handle).await).ok();
            }
            Command::Disconnect { reply } => {
                return ControlFlow::Break(self.teardown(link, Some(reply)).await);
            }
        }

        ControlFlow::Continue(())
    }

    async fn read(
        &self,
        link: &mut Box<dyn BleLink>,
        characteristics: &HashMap<u16, CharacteristicProps>,
        handle: u16,
    ) -> Result<Vec<u8>> {
        let properties = characteristics.get(&handle).copied().unwrap_or_default();
        if !properties.readable() {
            return Err(Error::CharacteristicNotReadable { handle });
        }

        self.bounded(link.read(handle)).await
    }

    async fn write(
        &self,
        link: &mut Box<dyn BleLink>,
        characteristics: &HashMap<u16, CharacteristicProps>,
        handle: u16,
        value: Vec<u8>,
        require_ack: bool,
    ) -> Result<()> {
        let properties = characteristics.get(&handle).copied().unwrap_or_default();
        if !properties.writable() {
            return Err(Error::CharacteristicNotWritable { handle });
        }

        self.bounded(link.write(handle, &value, require_ack)).await
    }

    async fn subscribe(
        &self,
        link: &mut Box<dyn BleLink>,
        characteristics: &HashMap<u16, CharacteristicProps>,
        handle: u16,
    ) -> Result<()> {
        let properties = characteristics.get(&handle).copied().unwrap_or_default();
        if !properties.notifiable() {
            return Err(Error::CharacteristicNotNotifiable { handle });
        }

        if self.subscriptions.lock().unwrap().contains(&handle) {
            return Ok(());
        }

        self.bounded(link.set_notify(handle, true)).await?;
        self.subscriptions.lock().unwrap().insert(handle);

        log::debug!("Session {} subscribed to {:#06x}", self.address, handle);
        Ok(())
    }

    async fn unsubscribe(&self, link: &mut Box<dyn BleLink>, handle: u16) -> Result<()> {
        // Stop forwarding before touching the link, so no event for
        // this handle is delivered once the caller's unsubscribe
        // resolves.
        if !self.subscriptions.lock().unwrap().remove(&handle) {
            return Ok(());
        }

        self.bounded(link.set_notify(handle, false)).await
    }

    async fn teardown(
        &self,
        link: &mut Box<dyn BleLink>,
        reply: Option<oneshot::Sender<()>>,
    ) -> Option<Error> {
        self.set_state(SessionState::Disconnecting);

        let handles: Vec<u16> = self.subscriptions.lock().unwrap().drain().collect();

        let release = async {
            for handle in handles {
                link.set_notify(handle, false).await.ok();
            }
            link.disconnect().await.ok();
        };

        let end = match timeout(self.config.disconnect_timeout, release).await {
            Ok(()) => {
                log::info!("Session {} disconnected", self.address);
                self.set_state(SessionState::Disconnected);
                None
            }
            Err(_) => {
                // The platform stack is unresponsive; give up on the
                // link instead of hanging.
                let error = Error::OperationTimeout(self.config.disconnect_timeout);
                log::warn!("Session {} teardown timed out", self.address);
                *self.last_error.lock().unwrap() = Some(error.clone());
                self.set_state(SessionState::Error(error.clone()));
                Some(error)
            }
        };

        if let Some(reply) = reply {
            reply.send(()).ok();
        }

        end
    }

    fn peer_disconnected(&self) -> Option<Error> {
        log::info!("Peer {} dropped the link", self.address);

        self.subscriptions.lock().unwrap().clear();

        let error = Error::PeerDisconnected {
            address: self.address.clone(),
        };
        *self.last_error.lock().unwrap() = Some(error.clone());
        self.set_state(SessionState::Disconnected);

        Some(error)
    }

    fn forward_notification(&self, handle: u16, value: Vec<u8>) {
        if !self.subscriptions.lock().unwrap().contains(&handle) {
            return;
        }

        self.hub.publish(NotificationEvent {
            address: self.address.clone(),
            handle,
            value,
            timestamp: Instant::now(),
        });
    }

    async fn bounded<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        match timeout(self.config.operation_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(Error::OperationTimeout(self.config.operation_timeout)),
        }
    }

    fn fail(&self, error: Error) -> Option<Error> {
        log::warn!("Session {} failed: {}", self.address, error);

        *self.last_error.lock().unwrap() = Some(error.clone());
        self.set_state(SessionState::Error(error.clone()));

        Some(error)
    }

    fn set_state(&self, state: SessionState) {
        self.state_tx.send(state).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        characteristic, service, wait_for_session, MockAdapter, MockPeripheral, NOTIFIABLE,
        READABLE, WRITABLE,
    };
    use std::time::Duration;

    fn spawn_session(
        adapter: &Arc<MockAdapter>,
        address: &str,
        config: SessionConfig,
    ) -> (Arc<DeviceSession>, Arc<NotificationHub>) {
        let hub = Arc::new(NotificationHub::new());
        let (terminal_tx, _terminal_rx) = mpsc::unbounded_channel();
        // The receiver is dropped; terminal reporting is exercised in
        // the registry tests.
        let session = DeviceSession::spawn(
            adapter.clone(),
            address.to_string(),
            config,
            hub.clone(),
            terminal_tx,
        );
        (session, hub)
    }

    fn gatt_peripheral(address: &str) -> MockPeripheral {
        MockPeripheral::new(address)
            .with_service(service(
                0x0001,
                vec![
                    characteristic(0x0010, READABLE),
                    characteristic(0x0011, WRITABLE),
                    characteristic(0x0012, NOTIFIABLE),
                ],
            ))
            .read_value(0x0010, vec![0x2A])
    }

    #[tokio::test]
    async fn connects_discovers_and_becomes_ready() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.add_peripheral(gatt_peripheral("AA:BB:CC:DD:EE:FF"));

        let (session, _) =
            spawn_session(&adapter, "AA:BB:CC:DD:EE:FF", SessionConfig::default());
        wait_for_session(&session, |s| *s == SessionState::Ready).await;

        let services = session.services().unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].characteristics.len(), 3);
        assert!(session.last_error().is_none());
    }

    #[tokio::test]
    async fn read_returns_the_characteristic_value() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.add_peripheral(gatt_peripheral("AA:BB:CC:DD:EE:FF"));

        let (session, _) =
            spawn_session(&adapter, "AA:BB:CC:DD:EE:FF", SessionConfig::default());
        wait_for_session(&session, |s| *s == SessionState::Ready).await;

        assert_eq!(session.read(0x0010).await.unwrap(), vec![0x2A]);
    }

    #[tokio::test]
    async fn read_without_readable_property_fails_and_session_stays_ready() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.add_peripheral(gatt_peripheral("AA:BB:CC:DD:EE:FF"));

        let (session, _) =
            spawn_session(&adapter, "AA:BB:CC:DD:EE:FF", SessionConfig::default());
        wait_for_session(&session, |s| *s == SessionState::Ready).await;

        assert_eq!(
            session.read(0x0011).await,
            Err(Error::CharacteristicNotReadable { handle: 0x0011 })
        );
        // Unknown handles report the same way.
        assert_eq!(
            session.read(0x0999).await,
            Err(Error::CharacteristicNotReadable { handle: 0x0999 })
        );
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn write_checks_the_writable_property() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.add_peripheral(gatt_peripheral("AA:BB:CC:DD:EE:FF"));

        let (session, _) =
            spawn_session(&adapter, "AA:BB:CC:DD:EE:FF", SessionConfig::default());
        wait_for_session(&session, |s| *s == SessionState::Ready).await;

        session.write(0x0011, vec![1, 2], true).await.unwrap();
        session.write(0x0011, vec![3], false).await.unwrap();
        assert_eq!(
            session.write(0x0010, vec![1], true).await,
            Err(Error::CharacteristicNotWritable { handle: 0x0010 })
        );

        assert_eq!(
            adapter.writes("AA:BB:CC:DD:EE:FF"),
            vec![(0x0011, vec![1, 2], true), (0x0011, vec![3], false)]
        );
    }

    #[tokio::test]
    async fn subscribe_forwards_notifications_through_the_hub() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.add_peripheral(gatt_peripheral("AA:BB:CC:DD:EE:FF"));

        let (session, hub) =
            spawn_session(&adapter, "AA:BB:CC:DD:EE:FF", SessionConfig::default());
        wait_for_session(&session, |s| *s == SessionState::Ready).await;

        let (_, mut events) = hub.register("AA:BB:CC:DD:EE:FF", 0x0012);

        session.subscribe(0x0012).await.unwrap();
        assert!(adapter.notify_enabled("AA:BB:CC:DD:EE:FF", 0x0012));
        assert_eq!(session.subscriptions(), vec![0x0012]);

        // Subscribing again is a no-op.
        session.subscribe(0x0012).await.unwrap();

        adapter.send_notification("AA:BB:CC:DD:EE:FF", 0x0012, vec![0x01]);
        let event = events.recv().await.unwrap();
        assert_eq!(event.address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(event.handle, 0x0012);
        assert_eq!(event.value, vec![0x01]);
    }

    #[tokio::test]
    async fn subscribe_requires_the_notify_property() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.add_peripheral(gatt_peripheral("AA:BB:CC:DD:EE:FF"));

        let (session, _) =
            spawn_session(&adapter, "AA:BB:CC:DD:EE:FF", SessionConfig::default());
        wait_for_session(&session, |s| *s == SessionState::Ready).await;

        assert_eq!(
            session.subscribe(0x0010).await,
            Err(Error::CharacteristicNotNotifiable { handle: 0x0010 })
        );
    }

    #[tokio::test]
    async fn unsubscribe_stops_forwarding_without_losing_other_handles() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.add_peripheral(
            MockPeripheral::new("AA:BB:CC:DD:EE:FF").with_service(service(
                0x0001,
                vec![
                    characteristic(0x0012, NOTIFIABLE),
                    characteristic(0x0013, NOTIFIABLE),
                ],
            )),
        );

        let (session, hub) =
            spawn_session(&adapter, "AA:BB:CC:DD:EE:FF", SessionConfig::default());
        wait_for_session(&session, |s| *s == SessionState::Ready).await;

        let (_, mut first) = hub.register("AA:BB:CC:DD:EE:FF", 0x0012);
        let (_, mut second) = hub.register("AA:BB:CC:DD:EE:FF", 0x0013);

        session.subscribe(0x0012).await.unwrap();
        session.subscribe(0x0013).await.unwrap();

        session.unsubscribe(0x0012).await.unwrap();
        // Unsubscribing a non-subscribed handle is a no-op.
        session.unsubscribe(0x0012).await.unwrap();
        assert_eq!(session.subscriptions(), vec![0x0013]);

        adapter.send_notification("AA:BB:CC:DD:EE:FF", 0x0012, vec![0x01]);
        adapter.send_notification("AA:BB:CC:DD:EE:FF", 0x0013, vec![0x02]);

        assert_eq!(second.recv().await.unwrap().value, vec![0x02]);
        assert!(first.try_recv().is_err());
    }

    #[tokio::test]
    async fn refused_connection_ends_in_error_state() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.add_peripheral(gatt_peripheral("AA:BB:CC:DD:EE:FF").refuse_connection());

        let (session, _) =
            spawn_session(&adapter, "AA:BB:CC:DD:EE:FF", SessionConfig::default());
        wait_for_session(&session, |s| s.is_terminal()).await;

        assert!(matches!(
            session.state(),
            SessionState::Error(Error::ConnectionRefused { .. })
        ));
        assert!(matches!(
            session.last_error(),
            Some(Error::ConnectionRefused { .. })
        ));
    }

    #[tokio::test]
    async fn unresponsive_peripheral_times_out_the_connection() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.add_peripheral(gatt_peripheral("AA:BB:CC:DD:EE:FF").hang_on_connect());

        let config = SessionConfig::default().connect_timeout(Duration::from_millis(30));
        let (session, _) = spawn_session(&adapter, "AA:BB:CC:DD:EE:FF", config);
        wait_for_session(&session, |s| s.is_terminal()).await;

        assert_eq!(
            session.last_error(),
            Some(Error::ConnectionTimeout {
                address: "AA:BB:CC:DD:EE:FF".to_string()
            })
        );
    }

    #[tokio::test]
    async fn discovery_failure_ends_in_error_state() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.add_peripheral(gatt_peripheral("AA:BB:CC:DD:EE:FF").fail_discovery());

        let (session, _) =
            spawn_session(&adapter, "AA:BB:CC:DD:EE:FF", SessionConfig::default());
        wait_for_session(&session, |s| s.is_terminal()).await;

        assert!(matches!(
            session.last_error(),
            Some(Error::DiscoveryFailed(_))
        ));
    }

    #[tokio::test]
    async fn slow_read_times_out_and_session_stays_ready() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.add_peripheral(
            gatt_peripheral("AA:BB:CC:DD:EE:FF").read_delay(Duration::from_millis(200)),
        );

        let config = SessionConfig::default().operation_timeout(Duration::from_millis(30));
        let (session, _) = spawn_session(&adapter, "AA:BB:CC:DD:EE:FF", config);
        wait_for_session(&session, |s| *s == SessionState::Ready).await;

        assert!(matches!(
            session.read(0x0010).await,
            Err(Error::OperationTimeout(_))
        ));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn unsolicited_peer_disconnect_clears_subscriptions() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.add_peripheral(gatt_peripheral("AA:BB:CC:DD:EE:FF"));

        let (session, _) =
            spawn_session(&adapter, "AA:BB:CC:DD:EE:FF", SessionConfig::default());
        wait_for_session(&session, |s| *s == SessionState::Ready).await;
        session.subscribe(0x0012).await.unwrap();

        adapter.drop_link("AA:BB:CC:DD:EE:FF");
        wait_for_session(&session, |s| *s == SessionState::Disconnected).await;

        assert!(session.subscriptions().is_empty());
        assert_eq!(
            session.last_error(),
            Some(Error::PeerDisconnected {
                address: "AA:BB:CC:DD:EE:FF".to_string()
            })
        );
        assert_eq!(session.read(0x0010).await, Err(Error::NotConnected));
    }

    #[tokio::test]
    async fn disconnect_while_connecting_is_prompt() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.add_peripheral(gatt_peripheral("AA:BB:CC:DD:EE:FF").hang_on_connect());

        // Default 10 s connect timeout; disconnect must not wait it out.
        let (session, _) =
            spawn_session(&adapter, "AA:BB:CC:DD:EE:FF", SessionConfig::default());

        timeout(Duration::from_secs(1), session.disconnect())
            .await
            .expect("disconnect waited out the connect timeout");

        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.last_error().is_none());
    }

    #[tokio::test]
    async fn disconnect_cancels_in_flight_discovery() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.add_peripheral(
            gatt_peripheral("AA:BB:CC:DD:EE:FF").discovery_delay(Duration::from_secs(60)),
        );

        let (session, _) =
            spawn_session(&adapter, "AA:BB:CC:DD:EE:FF", SessionConfig::default());
        wait_for_session(&session, |s| *s == SessionState::Discovering).await;

        timeout(Duration::from_secs(1), session.disconnect())
            .await
            .expect("disconnect waited out the discovery timeout");

        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.last_error().is_none());
    }

    #[tokio::test]
    async fn graceful_disconnect_releases_subscriptions() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.add_peripheral(gatt_peripheral("AA:BB:CC:DD:EE:FF"));

        let (session, _) =
            spawn_session(&adapter, "AA:BB:CC:DD:EE:FF", SessionConfig::default());
        wait_for_session(&session, |s| *s == SessionState::Ready).await;
        session.subscribe(0x0012).await.unwrap();

        session.disconnect().await;

        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.subscriptions().is_empty());
        assert!(!adapter.notify_enabled("AA:BB:CC:DD:EE:FF", 0x0012));
        assert!(session.last_error().is_none());

        // Terminal states are final; further calls are no-ops/errors.
        session.disconnect().await;
        assert_eq!(session.write(0x0011, vec![1], true).await, Err(Error::NotConnected));
    }
}
