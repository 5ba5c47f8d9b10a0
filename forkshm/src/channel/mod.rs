//! Message channels over a shared ring buffer.
//!
//! Each message is framed as an 8-byte little-endian length followed by the
//! payload. A semaphore in the ring's control area counts complete frames, so
//! a receiver can block until one is there. In hybrid mode a datagram socket
//! pair takes over that role and carries small payloads itself.

mod datagram;
mod semaphore;

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use self::datagram::MAX_DATAGRAM_PAYLOAD;
use self::datagram::{frame_len, Datagrams, Notice};
use self::semaphore::{Semaphore, SEMAPHORE_LEN};
use crate::codec::{Codec, PostcardCodec};
use crate::config::ChannelConfig;
use crate::core::buffer::ScopedBuffer;
use crate::core::region::SharedRegion;
use crate::errors::{Result, ShmemError};
use crate::registry::{sealed, Forkable, Registry};
use crate::ring::{RingBuffer, RingStatus};

pub const FRAME_PREFIX_LEN: usize = 8;

pub struct Channel {
    ring: RingBuffer,
    unread: Semaphore,
    datagrams: Option<Arc<Datagrams>>,
    config: ChannelConfig,
}

impl Channel {
    pub fn new(registry: &Registry, config: &ChannelConfig) -> Result<Self> {
        config.validate()?;
        let datagrams = match config.datagram_threshold {
            Some(threshold) => Some(Arc::new(Datagrams::pair(threshold)?)),
            None => None,
        };
        let ring = RingBuffer::with_trailer(
            registry,
            config.capacity,
            config.lock,
            SEMAPHORE_LEN,
            Some(Semaphore::destroy),
        )?;
        // SAFETY: the trailer is reserved for the semaphore and still unused.
        let unread = unsafe { Semaphore::init(ring.trailer_ptr())? };
        Ok(Channel {
            ring,
            unread,
            datagrams,
            config: config.clone(),
        })
    }

    pub fn with_capacity(registry: &Registry, capacity: usize) -> Result<Self> {
        Self::new(registry, &ChannelConfig::builder().capacity(capacity).build()?)
    }

    /// Another handle to the same channel, counted like a region clone.
    pub fn try_clone(&self) -> Result<Self> {
        let ring = self.ring.try_clone()?;
        let unread = unsafe { Semaphore::attach(ring.trailer_ptr())? };
        Ok(Channel {
            ring,
            unread,
            datagrams: self.datagrams.clone(),
            config: self.config.clone(),
        })
    }

    /// Queues one message without blocking. A message that does not fit is
    /// rejected with [`ShmemError::Full`] and leaves the channel unchanged.
    pub fn send_bytes(&self, payload: &[u8]) -> Result<()> {
        self.ring.ensure_live()?;
        if payload.is_empty() {
            return Ok(());
        }
        let prefix = (payload.len() as u64).to_le_bytes();
        match &self.datagrams {
            Some(datagrams) if payload.len() <= datagrams.threshold() => datagrams.send_inline(payload)?,
            Some(datagrams) => self
                .ring
                .write_parts_gated(&[&prefix[..], payload], || datagrams.send_in_ring(payload.len()))?,
            None => {
                self.ring.write_parts(&[&prefix[..], payload])?;
                self.unread.post()?;
            }
        }
        tracing::trace!(len = payload.len(), "sent message");
        Ok(())
    }

    /// Takes the oldest message. Without `block`, an empty channel gives
    /// [`ShmemError::WouldBlock`].
    pub fn receive_bytes(&self, block: bool) -> Result<ScopedBuffer> {
        self.ring.ensure_live()?;
        let message = match &self.datagrams {
            Some(datagrams) => match datagrams.receive(block)? {
                Notice::Inline(bytes) => ScopedBuffer::from(bytes),
                Notice::InRing(len) => self.read_frame(Some(len))?,
            },
            None => {
                if block {
                    self.unread.wait()?;
                } else if !self.unread.try_wait()? {
                    return Err(ShmemError::WouldBlock);
                }
                match self.read_frame(None) {
                    Ok(message) => message,
                    Err(e) => {
                        // The frame is still in the ring, so it stays counted.
                        self.unread.post()?;
                        return Err(e);
                    }
                }
            }
        };
        tracing::trace!(len = message.len(), kind = ?message.kind(), "received message");
        Ok(message)
    }

    fn read_frame(&self, expected: Option<usize>) -> Result<ScopedBuffer> {
        self.ring.read_with(|tx| {
            let mut prefix = [0u8; FRAME_PREFIX_LEN];
            tx.read(&mut prefix)?;
            let len = frame_len(u64::from_le_bytes(prefix))?;
            if let Some(expected) = expected {
                if expected != len {
                    return Err(ShmemError::Logic(format!(
                        "notice announced {} bytes but the ring holds a {} byte frame",
                        expected, len
                    )));
                }
            }
            let mut payload = ScopedBuffer::for_len(len)?;
            tx.read(&mut payload)?;
            Ok(payload)
        })
    }

    pub fn send_value<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        self.send_value_with(&PostcardCodec, value)
    }

    pub fn send_value_with<C: Codec, T: Serialize + ?Sized>(&self, codec: &C, value: &T) -> Result<()> {
        let bytes = codec.encode(value)?;
        self.send_bytes(&bytes)
    }

    pub fn receive_value<T: DeserializeOwned>(&self, block: bool) -> Result<T> {
        self.receive_value_with(&PostcardCodec, block)
    }

    pub fn receive_value_with<C: Codec, T: DeserializeOwned>(&self, codec: &C, block: bool) -> Result<T> {
        let bytes = self.receive_bytes(block)?;
        codec.decode(&bytes)
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn is_hybrid(&self) -> bool {
        self.datagrams.is_some()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn status(&self) -> Result<RingStatus> {
        self.ring.status()
    }

    pub fn global_ref_count(&self) -> u32 {
        self.ring.global_ref_count()
    }

    pub fn local_ref_count(&self) -> u32 {
        self.ring.local_ref_count()
    }

    pub fn is_disposed(&self) -> bool {
        self.ring.is_disposed()
    }

    /// Releases this handle. Further calls do nothing, and every other
    /// operation fails with [`ShmemError::Lifecycle`].
    pub fn dispose(&mut self) {
        if !self.ring.is_disposed() {
            tracing::debug!(capacity = self.capacity(), "disposing channel handle");
        }
        self.ring.dispose();
    }

    #[cfg(test)]
    pub(crate) fn unread_messages(&self) -> Result<u32> {
        self.unread.value()
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("ring", &self.ring)
            .field("hybrid", &self.is_hybrid())
            .finish()
    }
}

impl sealed::Sealed for Channel {}

impl Forkable for Channel {
    fn shared_region(&self, _: sealed::Token) -> &SharedRegion {
        self.ring.region()
    }
}
