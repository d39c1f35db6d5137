//! Turns accepted and connected stream sockets into logical connections.
//!
//! Accepting and connecting run on background tasks. Their outcomes, a new
//! [`LogicalConnection`] or a [`ConnectionError`], are pushed onto a result
//! queue that the main loop drains with [`ConnectionBroker::poll_results`];
//! no background task touches game state.
//!
//! An outbound connect races one attempt per candidate endpoint. The first
//! attempt to finish wins, every other attempt is cancelled, and a loser that
//! completes anyway closes its socket without reporting anything.

use crate::connection::{ConnectionContext, ConnectionRole, LogicalConnection};
use crate::error::ConnectionError;
use crate::queue::SharedQueue;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub type BrokerResult = Result<LogicalConnection, ConnectionError>;

pub struct ConnectionBroker {
    context: ConnectionContext,
    results: SharedQueue<BrokerResult>,
    listener: Option<JoinHandle<()>>,
    connect_race: Option<Arc<ConnectRace>>,
}

impl ConnectionBroker {
    pub fn new(context: ConnectionContext) -> Self {
        Self {
            context,
            results: SharedQueue::new(),
            listener: None,
            connect_race: None,
        }
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    /// Binds a listening socket and starts accepting peers in the
    /// background. Returns the bound address.
    pub async fn start_listening(&mut self, addr: SocketAddr) -> Result<SocketAddr, ConnectionError> {
        self.stop_listening();

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ConnectionError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        info!("Listening for connections on {}", local_addr);

        self.listener = Some(tokio::spawn(run_accept_loop(
            listener,
            self.context.clone(),
            self.results.clone(),
        )));
        Ok(local_addr)
    }

    pub fn stop_listening(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
            info!("Stopped listening for connections");
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listener
            .as_ref()
            .is_some_and(|listener| !listener.is_finished())
    }

    /// Races one stream connect per candidate. The winner, or a single
    /// `ConnectFailed` if every attempt fails, is reported through
    /// [`poll_results`](Self::poll_results). A previous race is cancelled.
    pub fn connect(&mut self, candidates: &[SocketAddr], role: ConnectionRole, name: &str) {
        self.cancel_connect();

        if candidates.is_empty() {
            self.results.push(Err(ConnectionError::NoCandidates));
            return;
        }

        let (cancel, _) = watch::channel(false);
        let race = Arc::new(ConnectRace {
            cancel: Arc::new(cancel),
            won: AtomicBool::new(false),
            aborted: Mutex::new(false),
            failures: AtomicUsize::new(0),
            attempts: candidates.len(),
            role,
            name: name.to_string(),
            context: self.context.clone(),
            results: self.results.clone(),
        });

        info!(
            "Connecting to {} candidate endpoint(s) as {}",
            candidates.len(),
            name
        );
        for &addr in candidates {
            tokio::spawn(run_connect_attempt(addr, Arc::clone(&race)));
        }
        self.connect_race = Some(race);
    }

    /// Marks every in-flight attempt cancelled. Nothing from the race is
    /// reported once this returns, including a winner still being set up.
    pub fn cancel_connect(&mut self) {
        if let Some(race) = self.connect_race.take() {
            race.abort();
        }
    }

    /// Outcomes reported since the last call
    pub fn poll_results(&self) -> Vec<BrokerResult> {
        self.results.drain()
    }
}

impl Drop for ConnectionBroker {
    fn drop(&mut self) {
        self.stop_listening();
        self.cancel_connect();
    }
}

async fn run_accept_loop(
    listener: TcpListener,
    context: ConnectionContext,
    results: SharedQueue<BrokerResult>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("Accepted stream from {}", addr);
                let result =
                    LogicalConnection::from_stream(stream, ConnectionRole::Client, addr.to_string(), &context);
                if let Err(e) = &result {
                    warn!("Rejected connection from {}: {}", addr, e);
                }
                results.push(result);
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
                results.push(Err(ConnectionError::Accept(e)));
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

/// Attempts racing to the same logical peer
struct ConnectRace {
    cancel: Arc<watch::Sender<bool>>,
    won: AtomicBool,
    /// Set by the caller; guards every report so none lands after it
    aborted: Mutex<bool>,
    failures: AtomicUsize,
    attempts: usize,
    role: ConnectionRole,
    name: String,
    context: ConnectionContext,
    results: SharedQueue<BrokerResult>,
}

impl ConnectRace {
    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn abort(&self) {
        *self.aborted.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cancel.send_replace(true);
    }

    /// Pushes the race outcome unless the caller aborted the race
    fn report(&self, result: BrokerResult) {
        let aborted = self.aborted.lock().unwrap_or_else(PoisonError::into_inner);
        if *aborted {
            debug!("Dropping outcome of aborted connect to {}", self.name);
            return;
        }
        self.results.push(result);
    }

    fn record_failure(&self, addr: SocketAddr, reason: String) {
        debug!("Connect attempt to {} failed: {}", addr, reason);
        let failed = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failed == self.attempts && !self.won.load(Ordering::Acquire) && !self.is_cancelled() {
            warn!("All {} connect attempts failed", self.attempts);
            self.report(Err(ConnectionError::ConnectFailed {
                attempts: self.attempts,
                last_error: reason,
            }));
        }
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

async fn run_connect_attempt(addr: SocketAddr, race: Arc<ConnectRace>) {
    let mut cancel = race.cancel.subscribe();

    let outcome = tokio::select! {
        outcome = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)) => outcome,
        _ = cancelled(&mut cancel) => {
            debug!("Connect attempt to {} cancelled", addr);
            return;
        }
    };

    let stream = match outcome {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return race.record_failure(addr, e.to_string()),
        Err(_) => return race.record_failure(addr, "timed out".to_string()),
    };

    if race.is_cancelled() || race.won.swap(true, Ordering::AcqRel) {
        debug!("Closing losing connect attempt to {}", addr);
        return;
    }
    race.cancel.send_replace(true);

    info!("Connected to {}", addr);
    race.report(LogicalConnection::from_stream(
        stream,
        race.role,
        race.name.clone(),
        &race.context,
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkSettings;
    use crate::connection::ConnectionIdPool;
    use crate::protocol::MessageRegistry;

    fn broker(capacity: usize) -> ConnectionBroker {
        ConnectionBroker::new(ConnectionContext {
            registry: Arc::new(MessageRegistry::standard().unwrap()),
            pool: Arc::new(ConnectionIdPool::new(capacity)),
            settings: NetworkSettings::default(),
            datagram: None,
        })
    }

    async fn wait_for_results(broker: &ConnectionBroker, count: usize) -> Vec<BrokerResult> {
        let mut results = Vec::new();
        for _ in 0..400 {
            results.extend(broker.poll_results());
            if results.len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        results
    }

    /// An address nothing listens on
    async fn closed_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn test_listen_and_connect() {
        let mut server = broker(4);
        let addr = server
            .start_listening("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert!(server.is_listening());

        let mut client = broker(4);
        client.connect(&[addr], ConnectionRole::Server, "server");

        let connected = wait_for_results(&client, 1).await;
        let accepted = wait_for_results(&server, 1).await;

        let connection = connected.into_iter().next().unwrap().unwrap();
        assert_eq!(connection.role(), ConnectionRole::Server);
        assert_eq!(connection.remote_stream_addr(), Some(addr));

        let peer = accepted.into_iter().next().unwrap().unwrap();
        assert_eq!(peer.role(), ConnectionRole::Client);
    }

    #[tokio::test]
    async fn test_race_prefers_live_endpoint() {
        let mut server = broker(4);
        let live = server
            .start_listening("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let dead = closed_port().await;

        let mut client = broker(4);
        client.connect(&[dead, live], ConnectionRole::Server, "server");

        let results = wait_for_results(&client, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let late = client.poll_results();

        assert_eq!(results.len(), 1);
        assert!(late.is_empty());
        let connection = results.into_iter().next().unwrap().unwrap();
        assert_eq!(connection.remote_stream_addr(), Some(live));
    }

    #[tokio::test]
    async fn test_all_attempts_failing_reports_once() {
        let mut client = broker(4);
        let candidates = [closed_port().await, closed_port().await];
        client.connect(&candidates, ConnectionRole::Server, "server");

        let results = wait_for_results(&client, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(client.poll_results().is_empty());

        assert_eq!(results.len(), 1);
        match &results[0] {
            Err(ConnectionError::ConnectFailed { attempts, .. }) => assert_eq!(*attempts, 2),
            other => panic!("expected ConnectFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_candidates() {
        let mut client = broker(1);
        client.connect(&[], ConnectionRole::Server, "server");

        let results = client.poll_results();
        assert!(matches!(results[..], [Err(ConnectionError::NoCandidates)]));
    }

    #[tokio::test]
    async fn test_cancelled_connect_reports_nothing() {
        let mut server = broker(4);
        let addr = server
            .start_listening("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let mut client = broker(4);
        client.connect(&[addr], ConnectionRole::Server, "server");
        client.cancel_connect();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(client.poll_results().is_empty());
    }

    #[tokio::test]
    async fn test_winner_set_up_after_cancel_is_not_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = broker(4);
        client.connect(&[addr], ConnectionRole::Server, "server");
        let race = Arc::clone(client.connect_race.as_ref().unwrap());

        // Wait until the attempt has claimed the win, then cancel
        let (_stream, _) = listener.accept().await.unwrap();
        for _ in 0..400 {
            if race.won.load(Ordering::Acquire) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        client.cancel_connect();

        // A report arriving after the cancel is dropped
        race.report(Err(ConnectionError::NoCandidates));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let results = client.poll_results();
        assert!(
            results.len() <= 1,
            "at most the winner reported before the cancel: {:?}",
            results.len()
        );
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(client.poll_results().is_empty());
        assert_eq!(client.context().pool.available() + results.len(), 4);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_is_reported_per_attempt() {
        let mut server = broker(1);
        let addr = server
            .start_listening("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let _first = TcpStream::connect(addr).await.unwrap();
        let _second = TcpStream::connect(addr).await.unwrap();
        let results = wait_for_results(&server, 2).await;

        assert_eq!(results.len(), 2);
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(ConnectionError::PoolExhausted { capacity: 1 }))));
        assert!(server.is_listening());
    }
}
