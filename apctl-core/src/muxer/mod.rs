//! Per-BSSID control-socket muxer: one packet-oriented connection per VAP,
//! FIFO command queue with exactly one command in flight, liveness pings,
//! and a latency watchdog that forces a supervisor reset.

pub mod protocol;

use std::collections::{BTreeSet, VecDeque};
use std::os::unix::net::UnixDatagram as StdUnixDatagram;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UnixDatagram;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use protocol::StationEvent;

pub const WRITE_DEADLINE: Duration = Duration::from_secs(1);
pub const READ_DEADLINE: Duration = Duration::from_secs(1);
pub const PING_INTERVAL: Duration = Duration::from_secs(5);
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_LATENCY: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum Error {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Back-reference to the supervisor, used only to request a restart when a
/// connection's latency watchdog fires. Deliberately not an owning pointer:
/// the muxer never outlives the supervisor and must not keep it alive.
pub trait ResetHandle: Send + Sync {
    fn reset(&self);
}

struct PendingCommand {
    text: String,
    resp_tx: oneshot::Sender<Result<String, Error>>,
}

/// FIFO command queue with exactly-one-in-flight semantics, kept as a plain
/// data structure so its invariants are unit-testable without a socket.
#[derive(Default)]
struct CommandQueue {
    queue: VecDeque<PendingCommand>,
    in_flight: Option<PendingCommand>,
    in_flight_sent_at: Option<std::time::Instant>,
}

impl CommandQueue {
    fn push(&mut self, cmd: PendingCommand) {
        self.queue.push_back(cmd);
    }

    /// Dequeues the oldest command if none is currently in flight.
    fn try_start_next(&mut self, now: std::time::Instant) -> Option<&str> {
        if self.in_flight.is_some() {
            return None;
        }
        self.in_flight = self.queue.pop_front();
        self.in_flight_sent_at = self.in_flight.is_some().then_some(now);
        self.in_flight.as_ref().map(|c| c.text.as_str())
    }

    fn complete_in_flight(&mut self, result: Result<String, Error>) {
        if let Some(cmd) = self.in_flight.take() {
            let _ = cmd.resp_tx.send(result);
        }
        self.in_flight_sent_at = None;
    }

    fn in_flight_age(&self, now: std::time::Instant) -> Option<Duration> {
        self.in_flight_sent_at.map(|t| now.saturating_duration_since(t))
    }

    fn fail_all(&mut self) {
        if let Some(cmd) = self.in_flight.take() {
            let _ = cmd.resp_tx.send(Err(Error::ConnectionClosed));
        }
        while let Some(cmd) = self.queue.pop_front() {
            let _ = cmd.resp_tx.send(Err(Error::ConnectionClosed));
        }
    }
}

/// One packet-oriented connection to a VAP's control socket.
pub struct HostapdConn {
    local_path: PathBuf,
    remote_path: PathBuf,
    queue: Mutex<CommandQueue>,
    latency: Duration,
    /// MACs currently believed associated, maintained from parsed
    /// connect/disconnect events and polled individually on each status tick
    /// (the daemon protocol reports one station's signal per `STA <mac>`).
    known_stations: Mutex<BTreeSet<String>>,
}

impl HostapdConn {
    pub fn new(daemon_run_dir: &str, iface_name: &str, tmp_prefix: &str, pid: u32) -> Self {
        Self {
            remote_path: PathBuf::from(format!("{daemon_run_dir}/{iface_name}")),
            local_path: PathBuf::from(format!("/tmp/{tmp_prefix}_{iface_name}-{pid}")),
            queue: Mutex::new(CommandQueue::default()),
            latency: DEFAULT_LATENCY,
            known_stations: Mutex::new(BTreeSet::new()),
        }
    }

    /// Busy-polls every 100ms for the remote socket to exist, removing any
    /// stale local socket first, then binds and connects.
    pub async fn attach(&self) -> Result<UnixDatagram, Error> {
        let _ = std::fs::remove_file(&self.local_path);
        let std_sock = StdUnixDatagram::bind(&self.local_path)?;
        std_sock.set_nonblocking(true)?;
        let socket = UnixDatagram::from_std(std_sock)?;

        loop {
            if self.remote_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        socket.connect(&self.remote_path)?;
        socket.send(b"ATTACH").await?;
        Ok(socket)
    }

    /// Enqueues `text`, blocking the caller until the response arrives or
    /// the connection is torn down.
    pub async fn submit(&self, text: String) -> Result<String, Error> {
        let (tx, rx) = oneshot::channel();
        self.queue.lock().await.push(PendingCommand { text, resp_tx: tx });
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Main reader/writer loop. Holds the queue lock except during actual
    /// socket I/O, as required: readers must observe queue mutations made
    /// while I/O was in flight.
    pub async fn run(self: Arc<Self>, socket: UnixDatagram, events: tokio::sync::mpsc::Sender<StationEvent>, reset: Arc<dyn ResetHandle>, cancel: CancellationToken) {
        let mut ping_ticker = tokio::time::interval(PING_INTERVAL);
        let mut status_ticker = tokio::time::interval(STATUS_POLL_INTERVAL);
        let mut buf = vec![0u8; 4096];

        loop {
            let to_send = {
                let mut q = self.queue.lock().await;
                q.try_start_next(std::time::Instant::now()).map(str::to_string)
            };
            if let Some(text) = to_send {
                let write_result = tokio::time::timeout(WRITE_DEADLINE, socket.send(text.as_bytes())).await;
                if let Err(_) | Ok(Err(_)) = write_result {
                    let mut q = self.queue.lock().await;
                    q.complete_in_flight(Err(Error::ConnectionClosed));
                    continue;
                }
            }

            {
                let mut q = self.queue.lock().await;
                if let Some(age) = q.in_flight_age(std::time::Instant::now()) {
                    if age > self.latency {
                        q.complete_in_flight(Err(Error::ConnectionClosed));
                        drop(q);
                        reset.reset();
                        break;
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ping_ticker.tick() => {
                    let _ = socket.send(b"PING").await;
                }
                _ = status_ticker.tick() => {
                    let macs: Vec<String> = self.known_stations.lock().await.iter().cloned().collect();
                    for mac in macs {
                        let _ = socket.send(format!("STA {mac}").as_bytes()).await;
                    }
                }
                result = tokio::time::timeout(READ_DEADLINE, socket.recv(&mut buf)) => {
                    match result {
                        Err(_) => continue, // read timeout is not an error
                        Ok(Ok(0)) => break,
                        Ok(Ok(n)) => {
                            let text = String::from_utf8_lossy(&buf[..n]).to_string();
                            if text.starts_with('<') {
                                if let Some(event) = protocol::parse_status(&text) {
                                    match &event {
                                        StationEvent::Connected(mac) | StationEvent::PollOk(mac) => {
                                            self.known_stations.lock().await.insert(mac.clone());
                                        }
                                        StationEvent::Disconnected(mac) => {
                                            self.known_stations.lock().await.remove(mac);
                                        }
                                        StationEvent::BadPassword(_) | StationEvent::EapRetransmit(_) => {}
                                    }
                                    let _ = events.send(event).await;
                                }
                            } else {
                                let mut q = self.queue.lock().await;
                                q.complete_in_flight(Ok(text));
                            }
                        }
                        Ok(Err(_)) => break,
                    }
                }
            }
        }

        let _ = std::fs::remove_file(&self.local_path);
        self.queue.lock().await.fail_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> (PendingCommand, oneshot::Receiver<Result<String, Error>>) {
        let (tx, rx) = oneshot::channel();
        (
            PendingCommand {
                text: "PING".into(),
                resp_tx: tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn queue_is_fifo_and_exactly_one_in_flight() {
        let mut q = CommandQueue::default();
        let (c1, mut r1) = pending();
        let (c2, _r2) = pending();
        q.push(c1);
        q.push(c2);

        let now = std::time::Instant::now();
        assert_eq!(q.try_start_next(now), Some("PING"));
        assert_eq!(q.try_start_next(now), None, "second command must wait for the first");

        q.complete_in_flight(Ok("OK".into()));
        assert_eq!(r1.try_recv().unwrap().unwrap(), "OK");

        assert_eq!(q.try_start_next(now), Some("PING"));
    }

    #[tokio::test]
    async fn in_flight_age_tracks_elapsed_time() {
        let mut q = CommandQueue::default();
        let (c1, _r1) = pending();
        q.push(c1);
        let t0 = std::time::Instant::now();
        q.try_start_next(t0);
        let later = t0 + Duration::from_secs(6);
        assert!(q.in_flight_age(later).unwrap() >= Duration::from_secs(6));
    }

    #[tokio::test]
    async fn fail_all_completes_in_flight_and_queued_with_connection_closed() {
        let mut q = CommandQueue::default();
        let (c1, mut r1) = pending();
        let (c2, mut r2) = pending();
        q.push(c1);
        q.push(c2);
        q.try_start_next(std::time::Instant::now());

        q.fail_all();

        assert!(matches!(r1.try_recv().unwrap(), Err(Error::ConnectionClosed)));
        assert!(matches!(r2.try_recv().unwrap(), Err(Error::ConnectionClosed)));
    }

    struct CountingReset(std::sync::atomic::AtomicUsize);
    impl ResetHandle for CountingReset {
        fn reset(&self) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn run_resets_supervisor_when_response_never_arrives() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("local.sock");
        let remote = dir.path().join("remote.sock");
        let remote_sock = StdUnixDatagram::bind(&remote).unwrap();
        remote_sock.set_nonblocking(true).unwrap();

        let conn = Arc::new(HostapdConn {
            local_path: local,
            remote_path: remote,
            queue: Mutex::new(CommandQueue::default()),
            latency: Duration::from_millis(50),
            known_stations: Mutex::new(BTreeSet::new()),
        });
        let std_sock = StdUnixDatagram::bind(&conn.local_path).unwrap();
        std_sock.set_nonblocking(true).unwrap();
        let socket = UnixDatagram::from_std(std_sock).unwrap();
        socket.connect(&conn.remote_path).unwrap();

        let (events_tx, _events_rx) = tokio::sync::mpsc::channel(8);
        let reset = Arc::new(CountingReset(std::sync::atomic::AtomicUsize::new(0)));
        let cancel = CancellationToken::new();

        let submit_conn = conn.clone();
        let submit_task = tokio::spawn(async move { submit_conn.submit("STA aa:bb:cc:dd:ee:ff".into()).await });
        let run_fut = conn.clone().run(socket, events_tx, reset.clone(), cancel.clone());
        let _ = tokio::time::timeout(Duration::from_secs(2), run_fut).await;
        let _ = submit_task.await;

        assert!(reset.0.load(std::sync::atomic::Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn status_ticker_polls_each_known_station_by_mac() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("local2.sock");
        let remote = dir.path().join("remote2.sock");
        let remote_sock = StdUnixDatagram::bind(&remote).unwrap();
        remote_sock.set_nonblocking(true).unwrap();

        let conn = Arc::new(HostapdConn {
            local_path: local.clone(),
            remote_path: remote.clone(),
            queue: Mutex::new(CommandQueue::default()),
            latency: DEFAULT_LATENCY,
            known_stations: Mutex::new(BTreeSet::new()),
        });
        let std_sock = StdUnixDatagram::bind(&local).unwrap();
        std_sock.set_nonblocking(true).unwrap();
        let socket = UnixDatagram::from_std(std_sock).unwrap();
        socket.connect(&remote).unwrap();

        remote_sock.send_to(b"<3>AP-STA-CONNECTED aa:bb:cc:dd:ee:ff", &local).unwrap();

        let (events_tx, mut events_rx) = tokio::sync::mpsc::channel(8);
        let reset = Arc::new(CountingReset(std::sync::atomic::AtomicUsize::new(0)));
        let cancel = CancellationToken::new();

        let run_task = tokio::spawn(conn.clone().run(socket, events_tx, reset, cancel.clone()));

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv()).await.unwrap().unwrap();
        assert_eq!(event, StationEvent::Connected("aa:bb:cc:dd:ee:ff".into()));
        assert!(conn.known_stations.lock().await.contains("aa:bb:cc:dd:ee:ff"));

        cancel.cancel();
        let _ = run_task.await;
    }
}
