use std::io;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixDatagram;

use crate::errors::{Result, ShmemError};

/// Largest payload that may travel inline.
pub const MAX_DATAGRAM_PAYLOAD: usize = 64 * 1024 - 1;

const INLINE: u8 = 0;
const IN_RING: u8 = 1;
const RING_NOTICE_LEN: usize = 1 + 8;

/// What a notice tells the receiver.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Notice {
    Inline(Vec<u8>),
    InRing(usize),
}

/// A connected pair of datagram sockets, inherited by forked children.
///
/// Every message of a hybrid channel produces exactly one datagram here, so
/// the socket both orders messages and wakes blocked receivers.
#[derive(Debug)]
pub(crate) struct Datagrams {
    tx: UnixDatagram,
    rx: UnixDatagram,
    threshold: usize,
}

impl Datagrams {
    pub(crate) fn pair(threshold: usize) -> Result<Self> {
        let (tx, rx) = UnixDatagram::pair()?;
        Ok(Datagrams { tx, rx, threshold })
    }

    pub(crate) fn threshold(&self) -> usize {
        self.threshold
    }

    pub(crate) fn send_inline(&self, payload: &[u8]) -> Result<()> {
        let mut notice = Vec::with_capacity(1 + payload.len());
        notice.push(INLINE);
        notice.extend_from_slice(payload);
        self.send(&notice)
    }

    pub(crate) fn send_in_ring(&self, len: usize) -> Result<()> {
        let mut notice = [0u8; RING_NOTICE_LEN];
        notice[0] = IN_RING;
        notice[1..].copy_from_slice(&(len as u64).to_le_bytes());
        self.send(&notice)
    }

    fn send(&self, notice: &[u8]) -> Result<()> {
        loop {
            // SAFETY: notice is a valid buffer of the given length.
            let sent = unsafe {
                libc::send(
                    self.tx.as_raw_fd(),
                    notice.as_ptr().cast(),
                    notice.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if sent >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => {
                    return Err(ShmemError::Full {
                        requested: notice.len(),
                        available: 0,
                    })
                }
                _ => return Err(ShmemError::Io(err)),
            }
        }
    }

    pub(crate) fn receive(&self, block: bool) -> Result<Notice> {
        let mut buf = vec![0u8; 1 + self.threshold.max(RING_NOTICE_LEN)];
        let flags = if block { 0 } else { libc::MSG_DONTWAIT };
        let len = loop {
            // SAFETY: buf is a valid writable buffer of the given length.
            let got = unsafe { libc::recv(self.rx.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), flags) };
            if got >= 0 {
                break got as usize;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Err(ShmemError::WouldBlock),
                _ => return Err(ShmemError::Io(err)),
            }
        };
        match buf.first() {
            Some(&INLINE) if len >= 1 => {
                buf.truncate(len);
                buf.remove(0);
                Ok(Notice::Inline(buf))
            }
            Some(&IN_RING) if len == RING_NOTICE_LEN => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[1..RING_NOTICE_LEN]);
                Ok(Notice::InRing(frame_len(u64::from_le_bytes(raw))?))
            }
            _ => Err(ShmemError::Logic(format!("malformed datagram notice of {} bytes", len))),
        }
    }
}

pub(crate) fn frame_len(raw: u64) -> Result<usize> {
    usize::try_from(raw).map_err(|_| ShmemError::Logic(format!("frame length {} does not fit in memory", raw)))
}
