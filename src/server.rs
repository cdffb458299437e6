//! TCP server for convolution jobs.
//!
//! A single control thread owns the listener, the handler registry and the
//! shutdown signal. Each admitted connection gets its own handler thread;
//! finished handlers are reaped through the registry's completion channel.

use crate::config::{AdmissionPolicy, Config};
use crate::error::{Error, Result};
use crate::executor::JobExecutor;
use crate::protocol::FrameCodec;
use crate::runtime::{Connection, HandlerRegistry, ShutdownSignal};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(0);

/// Outcome of a server run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServeReport {
    /// Connections handed to a handler thread.
    pub accepted: u64,
    /// Connections closed without service because no handler was available.
    pub rejected: u64,
    /// Handlers still running when the drain timeout expired.
    pub abandoned: usize,
}

/// Server instance
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    poll: Poll,
    events: Events,
    registry: HandlerRegistry,
    codec: FrameCodec,
    executor: Arc<JobExecutor>,
    admission: AdmissionPolicy,
    poll_interval: Duration,
    drain_timeout: Option<Duration>,
}

impl Server {
    /// Bind the listening socket.
    pub fn bind(config: &Config, executor: Arc<JobExecutor>) -> io::Result<Self> {
        let addr = resolve(&config.listen)?;
        let listener = create_listener(addr, config.backlog)?;
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry().register(
            &mut SourceFd(&listener.as_raw_fd()),
            LISTENER_TOKEN,
            Interest::READABLE,
        )?;

        Ok(Server {
            listener,
            local_addr,
            poll,
            events: Events::with_capacity(16),
            registry: HandlerRegistry::new(config.max_handlers),
            codec: FrameCodec::new(config.max_frame_bytes),
            executor,
            admission: config.admission,
            poll_interval: config.poll_interval,
            drain_timeout: config.drain_timeout,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept and serve connections until `shutdown` fires, then drain.
    pub fn run(mut self, shutdown: &ShutdownSignal) -> io::Result<ServeReport> {
        info!(
            address = %self.local_addr,
            max_handlers = self.registry.capacity(),
            admission = ?self.admission,
            "Server listening"
        );

        let mut report = ServeReport::default();

        loop {
            if self.registry.is_full() && self.admission == AdmissionPolicy::Wait {
                if shutdown.is_triggered() {
                    info!(live = self.registry.len(), "Shutdown requested");
                    break;
                }
                self.registry.wait_for_slot(self.poll_interval);
                continue;
            }

            match self.accept(shutdown) {
                Ok(Some((stream, peer))) => self.dispatch(stream, peer, &mut report),
                Ok(None) => {}
                Err(Error::ShutdownInProgress) => {
                    info!(live = self.registry.len(), "Shutdown requested");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    // Usually fd exhaustion; give handlers a chance to finish.
                    self.registry.wait_for_slot(self.poll_interval);
                }
            }

            self.registry.reap();
        }

        if !self.registry.is_empty() {
            info!(
                live = self.registry.len(),
                timeout = ?self.drain_timeout,
                "Waiting for in-flight jobs"
            );
        }
        report.abandoned = self.registry.drain(self.drain_timeout);
        if report.abandoned > 0 {
            warn!(abandoned = report.abandoned, "Drain timed out");
        }

        let _ = self
            .poll
            .registry()
            .deregister(&mut SourceFd(&self.listener.as_raw_fd()));
        drop(self.listener);

        info!(
            accepted = report.accepted,
            rejected = report.rejected,
            abandoned = report.abandoned,
            "Server stopped"
        );
        Ok(report)
    }

    /// Accept one connection unless shutdown has been requested.
    ///
    /// Waits at most one poll interval for a connection to arrive and
    /// returns `Ok(None)` if none did. A signal delivered to this thread
    /// cuts the wait short.
    fn accept(&mut self, shutdown: &ShutdownSignal) -> Result<Option<(TcpStream, SocketAddr)>> {
        if shutdown.is_triggered() {
            return Err(Error::ShutdownInProgress);
        }

        match self.listener.accept() {
            Ok(conn) => return Ok(Some(conn)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(None),
            Err(e) => return Err(Error::Connection(e)),
        }

        match self.poll.poll(&mut self.events, Some(self.poll_interval)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(Error::Connection(e)),
        }

        if shutdown.is_triggered() {
            return Err(Error::ShutdownInProgress);
        }
        Ok(None)
    }

    fn dispatch(&mut self, stream: TcpStream, peer: SocketAddr, report: &mut ServeReport) {
        // Accepted sockets may inherit O_NONBLOCK from the listener.
        if let Err(e) = stream.set_nonblocking(false) {
            warn!(peer = %peer, error = %e, "Failed to configure connection");
            return;
        }
        let _ = stream.set_nodelay(true);

        let mut conn = Connection::new(stream, peer);
        let codec = self.codec;
        let executor = Arc::clone(&self.executor);

        let spawned = self.registry.spawn(peer, move |name| {
            match conn.serve(&codec, &executor) {
                Ok(()) => debug!(handler = name, peer = %peer, "Job completed"),
                Err(e) => warn!(handler = name, peer = %peer, error = %e, "Job failed"),
            }
        });

        match spawned {
            Ok(Some(id)) => {
                report.accepted += 1;
                debug!(
                    id,
                    peer = %peer,
                    live = self.registry.len(),
                    "New connection"
                );
            }
            Ok(None) => {
                report.rejected += 1;
                warn!(peer = %peer, "Handler limit reached, closing connection");
            }
            Err(e) => {
                report.rejected += 1;
                error!(peer = %peer, error = %e, "Failed to spawn handler");
            }
        }
    }
}

fn resolve(listen: &str) -> io::Result<SocketAddr> {
    listen.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("'{listen}' did not resolve to an address"),
        )
    })
}

/// Create a non-blocking TCP listener.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{self, Client};
    use crate::config::{JobArgs, LoadArgs, RemoteArgs, SendArgs};
    use crate::executor::tests::{request, ReverseConvolver};
    use crate::executor::{Convolver, Invocation};
    use crate::protocol::frame;
    use std::io::{Read, Write};
    use std::net::Shutdown;
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::sync::{Condvar, Mutex};
    use std::thread;
    use tempfile::TempDir;

    struct Running {
        addr: SocketAddr,
        shutdown: ShutdownSignal,
        handle: thread::JoinHandle<io::Result<ServeReport>>,
        _run_dir: TempDir,
    }

    impl Running {
        fn client(&self) -> Client {
            Client::new(self.addr.to_string())
        }

        fn stop(self) -> ServeReport {
            self.shutdown.trigger();
            self.handle.join().unwrap().unwrap()
        }
    }

    fn test_config() -> Config {
        Config {
            listen: "127.0.0.1:0".to_string(),
            poll_interval: Duration::from_millis(10),
            drain_timeout: Some(Duration::from_secs(10)),
            ..Config::default()
        }
    }

    fn start(config: Config, convolver: Arc<dyn Convolver>) -> Running {
        let run_dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(JobExecutor::new(run_dir.path(), false, convolver));
        let server = Server::bind(&config, executor).unwrap();
        let addr = server.local_addr();

        let shutdown = ShutdownSignal::new();
        let signal = shutdown.clone();
        let handle = thread::spawn(move || server.run(&signal));

        Running {
            addr,
            shutdown,
            handle,
            _run_dir: run_dir,
        }
    }

    /// Blocks every job until opened; reports each job as it starts.
    struct GateConvolver {
        open: Mutex<bool>,
        cond: Condvar,
        entered: Mutex<Sender<()>>,
    }

    impl GateConvolver {
        fn new() -> (Arc<Self>, Receiver<()>) {
            let (tx, rx) = mpsc::channel();
            let gate = Arc::new(Self {
                open: Mutex::new(false),
                cond: Condvar::new(),
                entered: Mutex::new(tx),
            });
            (gate, rx)
        }

        fn open(&self) {
            *self.open.lock().unwrap() = true;
            self.cond.notify_all();
        }
    }

    impl Convolver for GateConvolver {
        fn convolve(&self, invocation: &Invocation) -> Result<()> {
            self.entered.lock().unwrap().send(()).unwrap();
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.cond.wait(open).unwrap();
            }
            drop(open);
            ReverseConvolver.convolve(invocation)
        }
    }

    /// Fails any job whose input starts with `FAIL`.
    struct PickyConvolver;

    impl Convolver for PickyConvolver {
        fn convolve(&self, invocation: &Invocation) -> Result<()> {
            let input = std::fs::read(&invocation.input).unwrap();
            if input.starts_with(b"FAIL") {
                return Err(Error::ExternalProcess("exit status: 1".to_string()));
            }
            ReverseConvolver.convolve(invocation)
        }
    }

    fn remote(addr: SocketAddr) -> RemoteArgs {
        RemoteArgs {
            address: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    /// Write `in.png` and a 3x3 kernel into `dir`.
    fn job_files(dir: &std::path::Path, input: &[u8]) -> JobArgs {
        let input_path = dir.join("in.png");
        let kernel_path = dir.join("sharpen.kernel");
        std::fs::write(&input_path, input).unwrap();
        std::fs::write(&kernel_path, b"0 -1 0\n-1 5 -1\n0 -1 0\n").unwrap();
        JobArgs {
            input: input_path,
            kernel: kernel_path,
            times: 1,
            grayscale: false,
        }
    }

    #[test]
    fn test_send_persists_output() {
        let server = start(test_config(), Arc::new(ReverseConvolver));
        let dir = tempfile::tempdir().unwrap();

        let args = SendArgs {
            remote: remote(server.addr),
            job: job_files(dir.path(), b"ABC"),
            output: dir.path().join("out.png"),
        };
        client::send(&args, FrameCodec::default()).unwrap();
        assert_eq!(std::fs::read(&args.output).unwrap(), b"CBA");

        assert_eq!(server.stop().accepted, 1);
    }

    #[test]
    fn test_load_writes_every_output() {
        let server = start(test_config(), Arc::new(ReverseConvolver));
        let dir = tempfile::tempdir().unwrap();
        let output_dir = dir.path().join("results");

        let args = LoadArgs {
            remote: remote(server.addr),
            job: job_files(dir.path(), b"ABC"),
            clients: 4,
            output_dir: Some(output_dir.clone()),
        };
        client::load(&args, FrameCodec::default()).unwrap();

        for n in 0..4 {
            let output = output_dir.join(format!("{n}-in.png"));
            assert_eq!(std::fs::read(&output).unwrap(), b"CBA", "{}", output.display());
        }
        assert_eq!(server.stop().accepted, 4);
    }

    #[test]
    fn test_load_fails_when_any_job_fails() {
        let server = start(test_config(), Arc::new(PickyConvolver));
        let dir = tempfile::tempdir().unwrap();

        let args = LoadArgs {
            remote: remote(server.addr),
            job: job_files(dir.path(), b"FAIL-me"),
            clients: 3,
            output_dir: None,
        };
        match client::load(&args, FrameCodec::default()) {
            Err(Error::LoadFailed { failed, total }) => {
                assert_eq!(failed, 3);
                assert_eq!(total, 3);
            }
            other => panic!("unexpected: {other:?}"),
        }
        server.stop();
    }

    #[test]
    fn test_client_frame_cap_applies_to_response() {
        let server = start(test_config(), Arc::new(ReverseConvolver));
        let dir = tempfile::tempdir().unwrap();

        let args = SendArgs {
            remote: remote(server.addr),
            job: job_files(dir.path(), &[7u8; 256]),
            output: dir.path().join("out.png"),
        };
        // The cap only bounds what the client reads: a 256-byte result
        // encodes past 200 bytes.
        let err = client::send(&args, FrameCodec::new(200)).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
        assert!(!args.output.exists());

        server.stop();
    }

    #[test]
    fn test_end_to_end_round_trip() {
        let server = start(test_config(), Arc::new(ReverseConvolver));
        let out_dir = tempfile::tempdir().unwrap();
        let output = out_dir.path().join("result.png");

        let response = server
            .client()
            .submit(&request("img.png", b"IMGDATA"))
            .unwrap();
        response.persist(&output).unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"ATADGMI");

        let report = server.stop();
        assert_eq!(report.accepted, 1);
        assert_eq!(report.abandoned, 0);
    }

    #[test]
    fn test_concurrent_clients_are_isolated() {
        let server = start(test_config(), Arc::new(ReverseConvolver));

        let workers: Vec<_> = (0..8)
            .map(|n| {
                let client = server.client();
                thread::spawn(move || {
                    let marker = format!("client-{n}-payload");
                    let response = client
                        .submit(&request(&format!("{n}.png"), marker.as_bytes()))
                        .unwrap();
                    (marker, response.output_bytes)
                })
            })
            .collect();

        for worker in workers {
            let (marker, output) = worker.join().unwrap();
            let expected: Vec<u8> = marker.bytes().rev().collect();
            assert_eq!(output, expected);
        }

        assert_eq!(server.stop().accepted, 8);
    }

    #[test]
    fn test_truncated_frame_only_aborts_its_connection() {
        let server = start(test_config(), Arc::new(ReverseConvolver));

        let mut raw = TcpStream::connect(server.addr).unwrap();
        let mut header = frame::encode(&[0u8; 10]).unwrap().to_vec();
        header.truncate(frame::HEADER_LEN + 9);
        raw.write_all(&header).unwrap();
        raw.shutdown(Shutdown::Write).unwrap();

        let mut rest = Vec::new();
        raw.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());

        let response = server.client().submit(&request("ok.png", b"abc")).unwrap();
        assert_eq!(response.output_bytes, b"cba");

        assert_eq!(server.stop().accepted, 2);
    }

    #[test]
    fn test_oversized_frame_is_refused() {
        let config = Config {
            max_frame_bytes: 64,
            ..test_config()
        };
        let server = start(config, Arc::new(ReverseConvolver));

        let err = server
            .client()
            .submit(&request("big.png", &[0u8; 128]))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ProtocolViolation(_) | Error::Connection(_)
        ));

        let response = server.client().submit(&request("s.png", b"xy")).unwrap();
        assert_eq!(response.output_bytes, b"yx");
        server.stop();
    }

    #[test]
    fn test_failed_job_closes_without_response() {
        let server = start(test_config(), Arc::new(PickyConvolver));

        let err = server
            .client()
            .submit(&request("bad.png", b"FAIL-me"))
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));

        let response = server.client().submit(&request("good.png", b"12")).unwrap();
        assert_eq!(response.output_bytes, b"21");
        server.stop();
    }

    #[test]
    fn test_graceful_shutdown_drains_in_flight_jobs() {
        let (gate, entered) = GateConvolver::new();
        let server = start(test_config(), gate.clone());

        let in_flight: Vec<_> = (0..3)
            .map(|n| {
                let client = server.client();
                thread::spawn(move || {
                    client.submit(&request(&format!("{n}.png"), format!("job{n}").as_bytes()))
                })
            })
            .collect();
        for _ in 0..3 {
            entered.recv_timeout(Duration::from_secs(10)).unwrap();
        }

        assert!(server.shutdown.trigger());
        // Let the accept loop observe the flag.
        thread::sleep(Duration::from_millis(200));

        let late = {
            let client = server.client();
            thread::spawn(move || client.submit(&request("late.png", b"late")))
        };
        thread::sleep(Duration::from_millis(100));
        gate.open();

        let report = server.handle.join().unwrap().unwrap();
        assert_eq!(report.accepted, 3);
        assert_eq!(report.abandoned, 0);

        for (n, job) in in_flight.into_iter().enumerate() {
            let response = job.join().unwrap().unwrap();
            let expected: Vec<u8> = format!("job{n}").bytes().rev().collect();
            assert_eq!(response.output_bytes, expected);
        }
        assert!(late.join().unwrap().is_err());
        assert!(entered.try_recv().is_err());
    }

    #[test]
    fn test_drain_timeout_abandons_stuck_job() {
        let (gate, entered) = GateConvolver::new();
        let config = Config {
            drain_timeout: Some(Duration::from_millis(100)),
            ..test_config()
        };
        let server = start(config, gate.clone());

        let stuck = {
            let client = server.client();
            thread::spawn(move || client.submit(&request("stuck.png", b"zzz")))
        };
        entered.recv_timeout(Duration::from_secs(10)).unwrap();

        // Keep the run directory alive for the detached handler.
        let Running {
            shutdown,
            handle,
            _run_dir: run_dir,
            ..
        } = server;
        shutdown.trigger();
        let report = handle.join().unwrap().unwrap();
        assert_eq!(report.accepted, 1);
        assert_eq!(report.abandoned, 1);

        // The detached handler still finishes its job.
        gate.open();
        let _keep = run_dir;
        assert_eq!(stuck.join().unwrap().unwrap().output_bytes, b"zzz");
    }

    #[test]
    fn test_reject_policy_closes_excess_connections() {
        let (gate, entered) = GateConvolver::new();
        let config = Config {
            max_handlers: 1,
            admission: AdmissionPolicy::Reject,
            ..test_config()
        };
        let server = start(config, gate.clone());

        let first = {
            let client = server.client();
            thread::spawn(move || client.submit(&request("first.png", b"one")))
        };
        entered.recv_timeout(Duration::from_secs(10)).unwrap();

        assert!(server.client().submit(&request("second.png", b"two")).is_err());

        gate.open();
        assert_eq!(first.join().unwrap().unwrap().output_bytes, b"eno");

        let report = server.stop();
        assert_eq!(report.accepted, 1);
        assert_eq!(report.rejected, 1);
    }

    #[test]
    fn test_wait_policy_queues_excess_connections() {
        let (gate, entered) = GateConvolver::new();
        let config = Config {
            max_handlers: 1,
            admission: AdmissionPolicy::Wait,
            ..test_config()
        };
        let server = start(config, gate.clone());

        let first = {
            let client = server.client();
            thread::spawn(move || client.submit(&request("first.png", b"one")))
        };
        entered.recv_timeout(Duration::from_secs(10)).unwrap();

        let second = {
            let client = server.client();
            thread::spawn(move || client.submit(&request("second.png", b"two")))
        };
        // Second job cannot start while the only slot is busy.
        assert!(entered.recv_timeout(Duration::from_millis(200)).is_err());

        gate.open();
        assert_eq!(first.join().unwrap().unwrap().output_bytes, b"eno");
        assert_eq!(second.join().unwrap().unwrap().output_bytes, b"owt");

        let report = server.stop();
        assert_eq!(report.accepted, 2);
        assert_eq!(report.rejected, 0);
    }
}
