//! Named TCP forwarder
//!
//! Listens on one local address and relays every accepted connection to one
//! remote address. Lifecycle: `Idle -> Starting -> Running -> Stopping -> Idle`.
//! A forwarder can be started again after it has been stopped.

use crate::address::{self, AddressError};
use crate::relay::{relay, RelayTarget};
use crate::sink::LogSink;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Pause after a failed `accept` before trying again
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Forwarder errors
#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("local address {0} is already in use")]
    AddressInUse(String),

    #[error("remote address {address} is unreachable: {reason}")]
    RemoteUnreachable { address: String, reason: String },

    #[error("Failed to bind to {address}: {reason}")]
    BindError { address: String, reason: String },

    #[error("{0} is already running")]
    AlreadyRunning(String),

    #[error("{0} is not running")]
    NotRunning(String),

    #[error("{name} still accepts connections on {address} after {attempts} shutdown probes")]
    ShutdownTimeout {
        name: String,
        address: SocketAddr,
        attempts: u32,
    },
}

/// Settings shared by every forwarder a registry creates
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Timeout for dialing the remote, both at preflight and per connection
    pub dial_timeout: Duration,
    /// Refuse construction when the remote cannot be reached
    pub fail_fast: bool,
    /// Timeout for the local "is this port taken" probe
    pub probe_timeout: Duration,
    /// How many times `stop` probes the local address before giving up
    pub shutdown_poll_attempts: u32,
    pub shutdown_poll_interval: Duration,
    /// Report every relayed chunk to the sink (expensive)
    pub trace_payload: bool,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(3),
            fail_fast: false,
            probe_timeout: Duration::from_secs(1),
            shutdown_poll_attempts: 10,
            shutdown_poll_interval: Duration::from_millis(50),
            trace_payload: false,
        }
    }
}

/// Handles of a live accept loop
struct ActiveLoop {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
    bound: SocketAddr,
}

enum Phase {
    Idle,
    Starting,
    Running(ActiveLoop),
    Stopping,
}

/// Puts the phase back to `Idle` when dropped, unless disarmed.
///
/// Keeps a cancelled `start`/`stop` future from wedging the forwarder in a
/// transitional phase.
struct PhaseReset<'a> {
    phase: &'a Mutex<Phase>,
    armed: bool,
}

impl<'a> PhaseReset<'a> {
    fn new(phase: &'a Mutex<Phase>) -> Self {
        Self { phase, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PhaseReset<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = Phase::Idle;
        }
    }
}

pub struct Forwarder {
    name: String,
    local: String,
    remote: String,
    config: ForwarderConfig,
    sink: Arc<dyn LogSink>,
    phase: Mutex<Phase>,
}

impl Forwarder {
    /// Validate the addresses, run the preflight probes and return an idle
    /// forwarder.
    pub async fn create(
        name: impl Into<String>,
        local: &str,
        remote: &str,
        config: ForwarderConfig,
        sink: Arc<dyn LogSink>,
    ) -> Result<Self, ForwarderError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ForwarderError::InvalidConfig(
                "name cannot be empty".to_string(),
            ));
        }

        let local = address::resolve(local)?;
        let remote = address::resolve(remote)?;

        if local == remote {
            return Err(ForwarderError::InvalidConfig(format!(
                "local and remote are both {}",
                local
            )));
        }
        if config.dial_timeout.is_zero() {
            return Err(ForwarderError::InvalidConfig(
                "dial timeout must be greater than 0".to_string(),
            ));
        }
        if config.shutdown_poll_attempts == 0 {
            return Err(ForwarderError::InvalidConfig(
                "shutdown poll attempts must be greater than 0".to_string(),
            ));
        }

        // Someone already answering on the local address means we cannot own it.
        if let Ok(Ok(probe)) =
            tokio::time::timeout(config.probe_timeout, TcpStream::connect(&local)).await
        {
            drop(probe);
            return Err(ForwarderError::AddressInUse(local));
        }

        match tokio::time::timeout(config.dial_timeout, TcpStream::connect(&remote)).await {
            Ok(Ok(probe)) => drop(probe),
            outcome => {
                let reason = match outcome {
                    Ok(Err(e)) => e.to_string(),
                    _ => format!("no answer within {:?}", config.dial_timeout),
                };
                if config.fail_fast {
                    return Err(ForwarderError::RemoteUnreachable {
                        address: remote,
                        reason,
                    });
                }
                sink.warn(&format!(
                    "{}: remote {} is unreachable ({}), registering anyway",
                    name, remote, reason
                ));
            }
        }

        Ok(Self {
            name,
            local,
            remote,
            config,
            sink,
            phase: Mutex::new(Phase::Idle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn config(&self) -> &ForwarderConfig {
        &self.config
    }

    /// True while a bound listener exists and its accept loop is iterating
    pub fn is_running(&self) -> bool {
        matches!(*self.lock_phase(), Phase::Running(_))
    }

    /// Address the running listener is bound to
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        match &*self.lock_phase() {
            Phase::Running(active) => Some(active.bound),
            _ => None,
        }
    }

    /// Bind the local address and spawn the accept loop.
    ///
    /// Returns once the bind outcome is known: either the forwarder is
    /// accepting connections, or the error explains why not.
    ///
    /// Only an idle forwarder can start. While another call is starting or
    /// stopping it, this fails with `AlreadyRunning` even though
    /// `is_running` reports false.
    pub async fn start(&self) -> Result<SocketAddr, ForwarderError> {
        {
            let mut phase = self.lock_phase();
            match *phase {
                Phase::Idle => *phase = Phase::Starting,
                Phase::Starting | Phase::Running(_) | Phase::Stopping => {
                    return Err(ForwarderError::AlreadyRunning(self.name.clone()))
                }
            }
        }
        let reset = PhaseReset::new(&self.phase);

        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(
            self.local.clone(),
            self.relay_target(),
            ready_tx,
            stop_rx,
        ));

        let bound = match ready_rx.await {
            Ok(Ok(bound)) => bound,
            Ok(Err(e)) => {
                self.sink
                    .error(&format!("{}: failed to bind {}: {}", self.name, self.local, e));
                return Err(ForwarderError::BindError {
                    address: self.local.clone(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(ForwarderError::BindError {
                    address: self.local.clone(),
                    reason: "accept loop exited before reporting".to_string(),
                });
            }
        };

        *self.lock_phase() = Phase::Running(ActiveLoop {
            stop_tx,
            task,
            bound,
        });
        reset.disarm();

        Ok(bound)
    }

    /// Stop accepting connections and wait until the listener is closed.
    ///
    /// Connections already being relayed are left to finish on their own.
    pub async fn stop(&self) -> Result<(), ForwarderError> {
        let active = {
            let mut phase = self.lock_phase();
            match std::mem::replace(&mut *phase, Phase::Stopping) {
                Phase::Running(active) => active,
                other => {
                    *phase = other;
                    return Err(ForwarderError::NotRunning(self.name.clone()));
                }
            }
        };
        // Idle again once this returns, whatever the outcome.
        let _reset = PhaseReset::new(&self.phase);

        let ActiveLoop {
            stop_tx,
            task,
            bound,
        } = active;

        let _ = stop_tx.send(());
        let budget = self.config.shutdown_poll_interval * self.config.shutdown_poll_attempts;
        let _ = tokio::time::timeout(budget, task).await;

        self.confirm_closed(bound).await
    }

    /// Probe the listener address until connections are refused.
    async fn confirm_closed(&self, bound: SocketAddr) -> Result<(), ForwarderError> {
        let target = probe_addr(bound);

        for _ in 0..self.config.shutdown_poll_attempts {
            match tokio::time::timeout(self.config.probe_timeout, TcpStream::connect(target)).await
            {
                Ok(Err(_)) => return Ok(()),
                Ok(Ok(probe)) => drop(probe),
                Err(_) => {}
            }
            tokio::time::sleep(self.config.shutdown_poll_interval).await;
        }

        self.sink.error(&format!(
            "{}: {} still accepting after {} probes",
            self.name, bound, self.config.shutdown_poll_attempts
        ));
        Err(ForwarderError::ShutdownTimeout {
            name: self.name.clone(),
            address: bound,
            attempts: self.config.shutdown_poll_attempts,
        })
    }

    fn relay_target(&self) -> RelayTarget {
        RelayTarget {
            name: self.name.clone(),
            remote: self.remote.clone(),
            dial_timeout: self.config.dial_timeout,
            trace_payload: self.config.trace_payload,
            sink: self.sink.clone(),
        }
    }

    fn lock_phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("name", &self.name)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Wildcard listeners are probed over loopback.
fn probe_addr(bound: SocketAddr) -> SocketAddr {
    match bound.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), bound.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), bound.port())
        }
        _ => bound,
    }
}

/// Bind, report the outcome on `ready`, then accept until `stop` fires.
///
/// Dropping the stop sender (e.g. the forwarder itself is dropped) ends the
/// loop as well.
async fn accept_loop(
    local: String,
    target: RelayTarget,
    ready: oneshot::Sender<io::Result<SocketAddr>>,
    mut stop: oneshot::Receiver<()>,
) {
    let listener = match TcpListener::bind(&local).await {
        Ok(listener) => listener,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let bound = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    target.sink.info(&format!(
        "{} is running: {} -> {}",
        target.name, bound, target.remote
    ));
    if ready.send(Ok(bound)).is_err() {
        return;
    }

    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(relay(stream, peer, target.clone()));
                }
                Err(e) => {
                    target
                        .sink
                        .error(&format!("{}: failed to accept connection: {}", target.name, e));
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    drop(listener);
    target.sink.info(&format!("{} is stopped", target.name));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::noop;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<String>>,
    }

    impl LogSink for Recording {
        fn info(&self, message: &str) {
            self.events.lock().unwrap().push(format!("info {}", message));
        }

        fn error(&self, message: &str) {
            self.events.lock().unwrap().push(format!("error {}", message));
        }
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn fast_config() -> ForwarderConfig {
        ForwarderConfig {
            dial_timeout: Duration::from_millis(500),
            probe_timeout: Duration::from_millis(200),
            ..ForwarderConfig::default()
        }
    }

    #[tokio::test]
    async fn test_create_rejects_same_local_and_remote() {
        let result = Forwarder::create("x", "4000", "127.0.0.1:4000", fast_config(), noop()).await;
        assert!(matches!(result, Err(ForwarderError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_create_rejects_zero_timeout() {
        let config = ForwarderConfig {
            dial_timeout: Duration::ZERO,
            ..fast_config()
        };
        let result = Forwarder::create("x", "4000", "4001", config, noop()).await;
        assert!(matches!(result, Err(ForwarderError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_create_propagates_address_errors() {
        let result = Forwarder::create("x", "999999", "4001", fast_config(), noop()).await;
        assert!(matches!(
            result,
            Err(ForwarderError::Address(AddressError::InvalidPort { .. }))
        ));

        let result = Forwarder::create("x", "4000", "a:b:c", fast_config(), noop()).await;
        assert!(matches!(
            result,
            Err(ForwarderError::Address(AddressError::InvalidAddress(_)))
        ));
    }

    #[tokio::test]
    async fn test_create_detects_local_in_use() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = occupied.local_addr().unwrap().to_string();
        let remote = free_port().await.to_string();

        let result = Forwarder::create("x", &local, &remote, fast_config(), noop()).await;
        assert!(matches!(result, Err(ForwarderError::AddressInUse(_))));
    }

    #[tokio::test]
    async fn test_unreachable_remote_depends_on_fail_fast() {
        let local = free_port().await.to_string();
        let remote = free_port().await.to_string();

        let lenient = Forwarder::create("db", &local, &remote, fast_config(), noop()).await;
        assert!(lenient.is_ok());

        let strict = ForwarderConfig {
            fail_fast: true,
            ..fast_config()
        };
        let result = Forwarder::create("db", &local, &remote, strict, noop()).await;
        assert!(matches!(
            result,
            Err(ForwarderError::RemoteUnreachable { .. })
        ));
    }

    #[tokio::test]
    async fn test_lenient_create_warns_once() {
        let local = free_port().await.to_string();
        let remote = free_port().await.to_string();
        let sink = Arc::new(Recording::default());

        let forwarder = Forwarder::create("db", &local, &remote, fast_config(), sink.clone())
            .await
            .unwrap();
        assert!(!forwarder.is_running());

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1, "{:?}", events);
        assert!(events[0].starts_with("error db: remote"), "{}", events[0]);
        assert!(events[0].contains("unreachable"));
    }

    #[tokio::test]
    async fn test_confirm_closed_times_out_on_live_listener() {
        let local = free_port().await.to_string();
        let remote = free_port().await.to_string();
        let config = ForwarderConfig {
            shutdown_poll_attempts: 2,
            shutdown_poll_interval: Duration::from_millis(10),
            ..fast_config()
        };
        let forwarder = Forwarder::create("svc", &local, &remote, config, noop())
            .await
            .unwrap();

        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_addr = live.local_addr().unwrap();

        let result = forwarder.confirm_closed(live_addr).await;
        assert!(matches!(
            result,
            Err(ForwarderError::ShutdownTimeout { attempts: 2, address, .. }) if address == live_addr
        ));
    }

    #[tokio::test]
    async fn test_failed_stop_leaves_forwarder_idle() {
        let local = free_port().await.to_string();
        let remote = free_port().await.to_string();
        let config = ForwarderConfig {
            shutdown_poll_attempts: 2,
            shutdown_poll_interval: Duration::from_millis(10),
            ..fast_config()
        };
        let sink = Arc::new(Recording::default());
        let forwarder = Forwarder::create("svc", &local, &remote, config, sink.clone())
            .await
            .unwrap();

        // Running state whose recorded address belongs to a listener that never closes.
        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (stop_tx, _stop_rx) = oneshot::channel();
        *forwarder.lock_phase() = Phase::Running(ActiveLoop {
            stop_tx,
            task: tokio::spawn(async {}),
            bound: live.local_addr().unwrap(),
        });
        assert!(forwarder.is_running());

        assert!(matches!(
            forwarder.stop().await,
            Err(ForwarderError::ShutdownTimeout { attempts: 2, .. })
        ));
        assert!(!forwarder.is_running());
        assert!(forwarder.bound_addr().is_none());
        assert!(sink
            .events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.contains("still accepting after 2 probes")));

        // Idle again, so a real start works.
        let bound = forwarder.start().await.unwrap();
        forwarder.stop().await.unwrap();
        assert!(TcpStream::connect(bound).await.is_err());
    }

    #[tokio::test]
    async fn test_start_while_stopping_is_rejected() {
        let local = free_port().await.to_string();
        let remote = free_port().await.to_string();
        let forwarder = Forwarder::create("svc", &local, &remote, fast_config(), noop())
            .await
            .unwrap();

        *forwarder.lock_phase() = Phase::Stopping;
        assert!(!forwarder.is_running());
        assert!(matches!(
            forwarder.start().await,
            Err(ForwarderError::AlreadyRunning(_))
        ));
        assert!(matches!(*forwarder.lock_phase(), Phase::Stopping));
    }

    #[tokio::test]
    async fn test_concurrent_stops_have_one_winner() {
        let local = format!("127.0.0.1:{}", free_port().await);
        let remote = free_port().await.to_string();
        let forwarder = Forwarder::create("svc", &local, &remote, fast_config(), noop())
            .await
            .unwrap();
        forwarder.start().await.unwrap();

        let (a, b) = tokio::join!(forwarder.stop(), forwarder.stop());
        let ok = [&a, &b].iter().filter(|r| r.is_ok()).count();
        let not_running = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Err(ForwarderError::NotRunning(_))))
            .count();
        assert_eq!((ok, not_running), (1, 1));
        assert!(!forwarder.is_running());
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let local = format!("127.0.0.1:{}", free_port().await);
        let remote = free_port().await.to_string();
        let forwarder = Forwarder::create("svc", &local, &remote, fast_config(), noop())
            .await
            .unwrap();

        assert!(!forwarder.is_running());
        assert!(matches!(
            forwarder.stop().await,
            Err(ForwarderError::NotRunning(_))
        ));

        let bound = forwarder.start().await.unwrap();
        assert!(forwarder.is_running());
        assert_eq!(forwarder.bound_addr(), Some(bound));
        assert!(TcpStream::connect(bound).await.is_ok());

        assert!(matches!(
            forwarder.start().await,
            Err(ForwarderError::AlreadyRunning(_))
        ));

        forwarder.stop().await.unwrap();
        assert!(!forwarder.is_running());
        assert!(forwarder.bound_addr().is_none());
        assert!(TcpStream::connect(bound).await.is_err());

        assert!(matches!(
            forwarder.stop().await,
            Err(ForwarderError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let local = format!("127.0.0.1:{}", free_port().await);
        let remote = free_port().await.to_string();
        let forwarder = Forwarder::create("svc", &local, &remote, fast_config(), noop())
            .await
            .unwrap();

        for _ in 0..3 {
            let bound = forwarder.start().await.unwrap();
            assert!(TcpStream::connect(bound).await.is_ok());
            forwarder.stop().await.unwrap();
            assert!(TcpStream::connect(bound).await.is_err());
        }
    }

    #[tokio::test]
    async fn test_start_reports_bind_failure() {
        let local = format!("127.0.0.1:{}", free_port().await);
        let remote = free_port().await.to_string();
        let forwarder = Forwarder::create("svc", &local, &remote, fast_config(), noop())
            .await
            .unwrap();

        // Someone grabs the port between create and start.
        let _squatter = TcpListener::bind(&local).await.unwrap();

        assert!(matches!(
            forwarder.start().await,
            Err(ForwarderError::BindError { .. })
        ));
        assert!(!forwarder.is_running());
    }

    #[tokio::test]
    async fn test_relays_bytes_to_remote() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote = backend.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            // Swallow the preflight probe, then echo on the next connection.
            loop {
                let (mut conn, _) = backend.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = conn.read(&mut buf).await {
                        if n == 0 || conn.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        let local = format!("127.0.0.1:{}", free_port().await);
        let forwarder = Forwarder::create("echo", &local, &remote, fast_config(), noop())
            .await
            .unwrap();
        let bound = forwarder.start().await.unwrap();

        let mut client = TcpStream::connect(bound).await.unwrap();
        client.write_all(b"hello through the relay").await.unwrap();
        let mut buf = vec![0u8; 23];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello through the relay");

        forwarder.stop().await.unwrap();
    }

    #[test]
    fn test_probe_addr_maps_wildcard_to_loopback() {
        let v4: SocketAddr = "0.0.0.0:8080".parse().unwrap();
        assert_eq!(probe_addr(v4), "127.0.0.1:8080".parse().unwrap());

        let v6: SocketAddr = "[::]:8080".parse().unwrap();
        assert_eq!(probe_addr(v6), "[::1]:8080".parse().unwrap());

        let exact: SocketAddr = "10.0.0.1:80".parse().unwrap();
        assert_eq!(probe_addr(exact), exact);
    }
}
