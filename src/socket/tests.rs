use super::*;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn make_non_block_sets_flag_once() {
    let (left, _right) = UnixStream::pair().unwrap();
    make_non_block(left.as_raw_fd()).unwrap();
    let flags = unsafe { libc::fcntl(left.as_raw_fd(), libc::F_GETFL, 0) };
    assert!(flags & libc::O_NONBLOCK != 0);
    make_non_block(left.as_raw_fd()).unwrap();
}

#[test]
fn make_non_block_reports_bad_descriptor() {
    let err = make_non_block(-1).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EBADF));
}

#[test]
fn poll_send_delivers_everything() {
    let (left, mut right) = UnixStream::pair().unwrap();
    make_non_block(left.as_raw_fd()).unwrap();
    poll_send(left.as_raw_fd(), b"resolver").unwrap();
    let mut buf = [0u8; 8];
    right.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"resolver");
}

#[test]
fn poll_recv_assembles_split_writes() {
    let (left, mut right) = UnixStream::pair().unwrap();
    make_non_block(left.as_raw_fd()).unwrap();
    let writer = thread::spawn(move || {
        right.write_all(b"abc").unwrap();
        thread::sleep(Duration::from_millis(20));
        right.write_all(b"def").unwrap();
        right
    });
    let mut buf = [0u8; 6];
    poll_recv(left.as_raw_fd(), &mut buf).unwrap();
    assert_eq!(&buf, b"abcdef");
    drop(writer.join().unwrap());
}

#[test]
fn poll_recv_gives_up_after_retries() {
    let (left, _right) = UnixStream::pair().unwrap();
    make_non_block(left.as_raw_fd()).unwrap();
    let started = Instant::now();
    let mut buf = [0u8; 4];
    let err = poll_recv(left.as_raw_fd(), &mut buf).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    assert!(started.elapsed() >= Duration::from_millis(2_000));
}

#[test]
fn poll_recv_fails_on_peer_close() {
    let (left, right) = UnixStream::pair().unwrap();
    drop(right);
    let mut buf = [0u8; 4];
    let err = poll_recv(left.as_raw_fd(), &mut buf).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
}

#[test]
fn connect_non_block_reaches_listener() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sock");
    let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
    let stream = connect_non_block(&path, Duration::from_secs(2)).unwrap();
    let (mut accepted, _) = listener.accept().unwrap();

    poll_send(stream.as_raw_fd(), b"ping").unwrap();
    let mut buf = [0u8; 4];
    accepted.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");
    let flags = unsafe { libc::fcntl(stream.as_raw_fd(), libc::F_GETFL, 0) };
    assert!(flags & libc::O_NONBLOCK != 0);
}

#[test]
fn connect_non_block_reports_missing_socket() {
    let dir = tempfile::tempdir().unwrap();
    let err = connect_non_block(&dir.path().join("absent"), Duration::from_millis(100)).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
}

#[test]
fn connect_non_block_rejects_overlong_path() {
    let path = std::path::PathBuf::from(format!("/tmp/{}", "p".repeat(200)));
    let err = connect_non_block(&path, Duration::from_millis(100)).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
}
