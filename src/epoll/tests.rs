use super::*;
use crate::socket::poll_send;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

#[derive(Debug)]
enum Stage {
    Length,
    Body,
}

/// Reads a u32 length then that many bytes, echoes the body back upper-cased.
#[derive(Default, Clone)]
struct EchoHandler {
    bodies: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl StageHandler for EchoHandler {
    type Stage = Stage;

    fn first_stage(&self) -> (Stage, usize) {
        (Stage::Length, 4)
    }

    fn on_data(&self, fd: RawFd, stage: Stage, data: Vec<u8>) -> Advance<Stage> {
        match stage {
            Stage::Length => {
                let len = u32::from_ne_bytes(data[..4].try_into().unwrap()) as usize;
                if len == 0 {
                    return Advance::Fail;
                }
                Advance::Next(Stage::Body, len)
            }
            Stage::Body => {
                let reply = data.to_ascii_uppercase();
                self.bodies.lock().unwrap().push(data);
                if poll_send(fd, &reply).is_err() {
                    return Advance::Fail;
                }
                Advance::Done
            }
        }
    }
}

fn frame(body: &[u8]) -> Vec<u8> {
    let mut out = (body.len() as u32).to_ne_bytes().to_vec();
    out.extend_from_slice(body);
    out
}

#[test]
fn epoller_reports_readable_descriptor() {
    let epoller = Epoller::new().unwrap();
    let (left, mut right) = UnixStream::pair().unwrap();
    epoller.register(left.as_raw_fd(), Interest::READABLE).unwrap();
    assert!(epoller
        .wait(MAX_EPOLL_EVENTS, Some(Duration::from_millis(10)))
        .unwrap()
        .is_empty());

    right.write_all(b"x").unwrap();
    let ready = epoller
        .wait(MAX_EPOLL_EVENTS, Some(Duration::from_millis(500)))
        .unwrap();
    assert_eq!(ready.as_slice(), &[left.as_raw_fd()]);

    epoller.unregister(left.as_raw_fd()).unwrap();
    assert!(epoller.unregister(left.as_raw_fd()).is_err());
}

#[test]
fn epoller_rejects_duplicate_registration() {
    let epoller = Epoller::new().unwrap();
    let (left, _right) = UnixStream::pair().unwrap();
    epoller.register(left.as_raw_fd(), Interest::READABLE).unwrap();
    let err = epoller
        .register(left.as_raw_fd(), Interest::READABLE)
        .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EEXIST));
}

#[test]
fn receiver_accumulates_partial_reads() {
    let (left, mut right) = UnixStream::pair().unwrap();
    left.set_nonblocking(true).unwrap();
    let handler = EchoHandler::default();
    let mut receiver = FixedLengthReceiver::new(left, Stage::Length, 4);

    assert_eq!(receiver.run_once(&handler), ReceiverState::Continue);

    let bytes = frame(b"abc");
    right.write_all(&bytes[..2]).unwrap();
    assert_eq!(receiver.run_once(&handler), ReceiverState::Continue);
    assert_eq!(receiver.buffered(), 2);

    right.write_all(&bytes[2..5]).unwrap();
    assert_eq!(receiver.run_once(&handler), ReceiverState::Continue);
    assert_eq!(receiver.needed(), 3);
    assert_eq!(receiver.buffered(), 1);

    right.write_all(&bytes[5..]).unwrap();
    assert_eq!(receiver.run_once(&handler), ReceiverState::DataEnough);
    assert_eq!(handler.bodies.lock().unwrap().as_slice(), &[b"abc".to_vec()]);

    let mut reply = [0u8; 3];
    right.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"ABC");
}

#[test]
fn receiver_reports_peer_close() {
    let (left, right) = UnixStream::pair().unwrap();
    left.set_nonblocking(true).unwrap();
    drop(right);
    let mut receiver = FixedLengthReceiver::new(left, Stage::Length, 4);
    assert_eq!(
        receiver.run_once(&EchoHandler::default()),
        ReceiverState::OnError
    );
}

#[test]
fn receiver_surfaces_stage_failure() {
    let (left, mut right) = UnixStream::pair().unwrap();
    left.set_nonblocking(true).unwrap();
    right.write_all(&0u32.to_ne_bytes()).unwrap();
    let mut receiver = FixedLengthReceiver::new(left, Stage::Length, 4);
    assert_eq!(
        receiver.run_once(&EchoHandler::default()),
        ReceiverState::OnError
    );
}

fn spawn_server(config: ServerConfig) -> (tempfile::TempDir, std::path::PathBuf, ServerHandle, EchoHandler, thread::JoinHandle<()>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("echo.sock");
    let handler = EchoHandler::default();
    let mut server = EpollServer::bind(&path, handler.clone(), config).unwrap();
    let handle = server.handle().unwrap();
    let join = thread::spawn(move || server.run());
    (dir, path, handle, handler, join)
}

#[test]
fn server_serves_concurrent_clients() {
    let (_dir, path, handle, handler, join) = spawn_server(ServerConfig::default());

    let mut first = UnixStream::connect(&path).unwrap();
    let mut second = UnixStream::connect(&path).unwrap();
    let bytes_one = frame(b"one");
    let bytes_two = frame(b"two");
    first.write_all(&bytes_one[..3]).unwrap();
    second.write_all(&bytes_two).unwrap();
    thread::sleep(Duration::from_millis(20));
    first.write_all(&bytes_one[3..]).unwrap();

    let mut reply = [0u8; 3];
    second.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"TWO");
    first.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"ONE");

    // Both connections are closed by the server once served.
    let mut tail = Vec::new();
    first.read_to_end(&mut tail).unwrap();
    assert!(tail.is_empty());

    handle.shutdown();
    join.join().unwrap();
    assert_eq!(handler.bodies.lock().unwrap().len(), 2);
}

#[test]
fn server_reaps_idle_connections() {
    let config = ServerConfig {
        idle_timeout: Duration::from_millis(100),
        ..ServerConfig::default()
    };
    let (_dir, path, handle, _handler, join) = spawn_server(config);

    let mut idle = UnixStream::connect(&path).unwrap();
    idle.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let started = Instant::now();
    let mut buf = [0u8; 1];
    assert_eq!(idle.read(&mut buf).unwrap(), 0);
    assert!(started.elapsed() < Duration::from_secs(5));

    // The listener keeps accepting after a reap.
    let mut next = UnixStream::connect(&path).unwrap();
    next.write_all(&frame(b"ok")).unwrap();
    let mut reply = [0u8; 2];
    next.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"OK");

    handle.shutdown();
    join.join().unwrap();
}

#[test]
fn server_drops_malformed_client_only() {
    let (_dir, path, handle, _handler, join) = spawn_server(ServerConfig::default());

    let mut bad = UnixStream::connect(&path).unwrap();
    let mut good = UnixStream::connect(&path).unwrap();
    bad.write_all(&0u32.to_ne_bytes()).unwrap();
    let mut buf = Vec::new();
    bad.read_to_end(&mut buf).unwrap();
    assert!(buf.is_empty());

    good.write_all(&frame(b"fine")).unwrap();
    let mut reply = [0u8; 4];
    good.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"FINE");

    handle.shutdown();
    join.join().unwrap();
}
