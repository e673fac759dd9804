// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Socket hand-off between broker processes.
//!
//! The outgoing broker listens on a Unix domain socket. The incoming broker
//! connects and receives one message per session: a 4-byte big-endian
//! length, the session authkey, and the session's socket attached as
//! `SCM_RIGHTS` ancillary data on the first byte. Closing the channel ends
//! the transfer.
//!
//! Both ends block; callers run them on the blocking pool.

use super::HandoverError;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

const HEADER_LEN: usize = 4;
const MAX_AUTHKEY_LEN: usize = 256;

/// Sending end, owned by the outgoing broker.
#[derive(Debug)]
pub struct FdSender {
    listener: UnixListener,
    path: PathBuf,
    stream: Option<UnixStream>,
}

impl FdSender {
    /// Bind `<dir>/<name>` with world read/write permissions.
    pub fn listen(dir: &Path, name: &str) -> Result<Self, HandoverError> {
        std::fs::create_dir_all(dir).map_err(|e| HandoverError::channel("create", dir, e))?;
        let path = dir.join(name);
        let listener = UnixListener::bind(&path).map_err(|e| HandoverError::channel("bind", &path, e))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666))
            .map_err(|e| HandoverError::channel("chmod", &path, e))?;
        debug!("fd channel listening on {}", path.display());
        Ok(Self {
            listener,
            path,
            stream: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the incoming broker to connect.
    pub fn accept(&mut self, timeout: Duration) -> Result<(), HandoverError> {
        if !wait_readable(self.listener.as_raw_fd(), timeout)
            .map_err(|e| HandoverError::channel("poll", &self.path, e))?
        {
            return Err(HandoverError::Timeout(timeout));
        }
        let (stream, _) = self
            .listener
            .accept()
            .map_err(|e| HandoverError::channel("accept", &self.path, e))?;
        stream
            .set_nonblocking(false)
            .map_err(|e| HandoverError::channel("accept", &self.path, e))?;
        self.stream = Some(stream);
        Ok(())
    }

    /// Send one session socket.
    pub fn put(&mut self, authkey: &str, fd: RawFd) -> Result<(), HandoverError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(HandoverError::NotConnected);
        };
        let mut message = Vec::with_capacity(HEADER_LEN + authkey.len());
        message.extend_from_slice(&(authkey.len() as u32).to_be_bytes());
        message.extend_from_slice(authkey.as_bytes());
        let sent = send_with_fd(stream.as_raw_fd(), &message, fd)
            .map_err(|e| HandoverError::channel("sendmsg", &self.path, e))?;
        if sent < message.len() {
            stream
                .write_all(&message[sent..])
                .map_err(|e| HandoverError::channel("write", &self.path, e))?;
        }
        Ok(())
    }
}

impl Drop for FdSender {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Receiving end, owned by the incoming broker.
#[derive(Debug)]
pub struct FdReceiver {
    stream: UnixStream,
}

impl FdReceiver {
    /// Connect, retrying while the outgoing broker is not listening yet.
    pub fn connect(path: &Path, timeout: Duration) -> Result<Self, HandoverError> {
        let deadline = Instant::now() + timeout;
        loop {
            match UnixStream::connect(path) {
                Ok(stream) => return Ok(Self { stream }),
                Err(e) if Instant::now() < deadline => {
                    debug!("fd channel {} not ready: {}", path.display(), e);
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => return Err(HandoverError::channel("connect", path, e)),
            }
        }
    }

    /// Receive the next session socket. `None` once the sender closed.
    pub fn get(&mut self) -> Result<Option<(String, OwnedFd)>, HandoverError> {
        let mut header = [0u8; HEADER_LEN];
        let (n, fd) = recv_with_fd(self.stream.as_raw_fd(), &mut header)
            .map_err(|e| HandoverError::channel("recvmsg", Path::new("fdtx"), e))?;
        if n == 0 {
            return Ok(None);
        }
        if n < HEADER_LEN {
            self.stream
                .read_exact(&mut header[n..])
                .map_err(|e| HandoverError::channel("read", Path::new("fdtx"), e))?;
        }
        let len = u32::from_be_bytes(header) as usize;
        if len == 0 || len > MAX_AUTHKEY_LEN {
            return Err(HandoverError::Protocol(format!("bad authkey length: {}", len)));
        }
        let mut authkey = vec![0u8; len];
        self.stream
            .read_exact(&mut authkey)
            .map_err(|e| HandoverError::channel("read", Path::new("fdtx"), e))?;
        let authkey = String::from_utf8(authkey)
            .map_err(|_| HandoverError::Protocol("authkey is not UTF-8".into()))?;
        match fd {
            Some(fd) => Ok(Some((authkey, fd))),
            None => Err(HandoverError::Protocol(format!(
                "no descriptor came with authkey {}",
                authkey
            ))),
        }
    }
}

fn wait_readable(fd: RawFd, timeout: Duration) -> std::io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
    loop {
        // SAFETY: pollfd is a valid, initialized array of length 1.
        let rc = unsafe { libc::poll(&mut pollfd, 1, millis) };
        if rc >= 0 {
            return Ok(rc > 0);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn send_with_fd(sock: RawFd, data: &[u8], fd: RawFd) -> std::io::Result<usize> {
    let fd_size = std::mem::size_of::<libc::c_int>() as u32;
    // SAFETY: CMSG_SPACE is a pure size computation.
    let space = unsafe { libc::CMSG_SPACE(fd_size) } as usize;
    let mut control = vec![0u8; space];
    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };
    // SAFETY: msghdr is plain data; zeroed is a valid empty header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = space as _;
    // SAFETY: control is large enough for one cmsghdr carrying one int.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fd_size) as _;
        std::ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<libc::c_int>(), fd);
    }
    loop {
        // SAFETY: msg points at live buffers for the duration of the call.
        let n = unsafe { libc::sendmsg(sock, &msg, libc::MSG_NOSIGNAL) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn recv_with_fd(sock: RawFd, buf: &mut [u8]) -> std::io::Result<(usize, Option<OwnedFd>)> {
    let fd_size = std::mem::size_of::<libc::c_int>() as u32;
    // SAFETY: pure size computation. Room for two descriptors.
    let space = unsafe { libc::CMSG_SPACE(fd_size * 2) } as usize;
    let mut control = vec![0u8; space];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    // SAFETY: as in send_with_fd.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = space as _;
    let n = loop {
        // SAFETY: msg points at live buffers for the duration of the call.
        let n = unsafe { libc::recvmsg(sock, &mut msg, libc::MSG_WAITALL | libc::MSG_CMSG_CLOEXEC) };
        if n >= 0 {
            break n as usize;
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    };

    let mut received = Vec::new();
    // SAFETY: walk the control buffer the kernel filled in.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let header = libc::CMSG_LEN(0) as usize;
                let count = ((*cmsg).cmsg_len as usize - header) / fd_size as usize;
                let data = libc::CMSG_DATA(cmsg).cast::<libc::c_int>();
                for i in 0..count {
                    let fd = std::ptr::read_unaligned(data.add(i));
                    received.push(OwnedFd::from_raw_fd(fd));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }
    // one descriptor per message; extras are closed on drop
    Ok((n, received.into_iter().next()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_socket_survives_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let mut sender = FdSender::listen(dir.path(), "handover-test").unwrap();
        let path = sender.path().to_path_buf();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o666);

        let receiver = std::thread::spawn(move || {
            let mut rx = FdReceiver::connect(&path, Duration::from_secs(2)).unwrap();
            let mut got = Vec::new();
            while let Some((authkey, fd)) = rx.get().unwrap() {
                got.push((authkey, UnixStream::from(fd)));
            }
            got
        });

        let (mut near, far) = UnixStream::pair().unwrap();
        sender.accept(Duration::from_secs(2)).unwrap();
        sender.put("1234567890123456", far.as_raw_fd()).unwrap();
        drop(far);
        drop(sender);

        let mut got = receiver.join().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, "1234567890123456");
        near.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        got[0].1.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_accept_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut sender = FdSender::listen(dir.path(), "handover-idle").unwrap();
        assert!(matches!(
            sender.accept(Duration::from_millis(50)),
            Err(HandoverError::Timeout(_))
        ));
    }

    #[test]
    fn test_put_before_accept_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut sender = FdSender::listen(dir.path(), "handover-early").unwrap();
        assert!(matches!(
            sender.put("k", 0),
            Err(HandoverError::NotConnected)
        ));
    }
}
