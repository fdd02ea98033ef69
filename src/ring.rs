// src/ring.rs

use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::doorbell::Doorbell;
use crate::shm::Segment;

/// Default ring capacity, in bytes. Messages larger than this are
/// transparently chunked by the connection layer.
pub const DEFAULT_RING_CAPACITY: usize = 2 * 1024 * 1024;

/// Ring header. Producer and consumer sequences are monotonic 64-bit
/// counters living on separate cache lines; offsets into the data
/// region are `seq % capacity`.
#[repr(C, align(64))]
pub struct RingHeader {
    pub producer: AtomicU64,
    _pad1: [u8; 56],
    pub consumer: AtomicU64,
    _pad2: [u8; 56],
}

// Compile-time layout checks, shared with the peer process.
const _: () = {
    assert!(std::mem::size_of::<RingHeader>() == 128);
    assert!(std::mem::align_of::<RingHeader>() == 64);
};

/// One end of a shared-memory byte ring.
///
/// The ring is strictly single-producer single-consumer: one process
/// only ever calls `produce`, the other only `consume_into`. Each side
/// owns its own sequence counter; the opposite counter is read with
/// acquire ordering. Invariant: `producer - consumer <= capacity`.
///
/// Wakeups are edge-style: the producer rings `data_signal` only on the
/// empty-to-non-empty transition, the consumer rings `space_signal`
/// only on the full-to-non-full transition. Waiters drain their
/// doorbell before re-checking the counters, so no transition is lost.
pub struct Ring {
    segment: Segment,
    capacity: usize,
    data_signal: Doorbell,
    space_signal: Doorbell,
}

// Safety: all access to the shared pages goes through the atomics in
// the header; the data region is only touched by the unique producer
// or consumer as governed by those atomics.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    /// Create the backing segment and both doorbells for a fresh ring.
    pub fn create(capacity: usize) -> io::Result<Self> {
        assert!(
            capacity.is_power_of_two(),
            "ring capacity must be a power of two"
        );
        let segment = Segment::create("ferry-ring", Self::segment_len(capacity))?;
        Ok(Ring {
            segment,
            capacity,
            data_signal: Doorbell::new()?,
            space_signal: Doorbell::new()?,
        })
    }

    /// Assemble a ring around fds received from the peer.
    pub fn from_parts(
        segment_fd: OwnedFd,
        data_fd: OwnedFd,
        space_fd: OwnedFd,
        capacity: usize,
    ) -> io::Result<Self> {
        assert!(
            capacity.is_power_of_two(),
            "ring capacity must be a power of two"
        );
        let segment = Segment::from_fd(segment_fd, Self::segment_len(capacity))?;
        Ok(Ring {
            segment,
            capacity,
            data_signal: Doorbell::from_owned_fd(data_fd)?,
            space_signal: Doorbell::from_owned_fd(space_fd)?,
        })
    }

    /// A connected pair mapping the same pages, for in-process tests.
    pub fn pair(capacity: usize) -> io::Result<(Self, Self)> {
        let a = Self::create(capacity)?;
        let b = Self::from_parts(
            a.segment.try_clone_fd()?,
            a.data_signal.try_clone()?.into_owned_fd(),
            a.space_signal.try_clone()?.into_owned_fd(),
            capacity,
        )?;
        Ok((a, b))
    }

    fn segment_len(capacity: usize) -> usize {
        std::mem::size_of::<RingHeader>() + capacity
    }

    fn header(&self) -> &RingHeader {
        // Safety: the segment is at least segment_len bytes and the
        // header sits at its page-aligned start.
        unsafe { &*(self.segment.as_ptr() as *const RingHeader) }
    }

    fn data_ptr(&self) -> *mut u8 {
        // Safety: the data region follows the header.
        unsafe { self.segment.as_ptr().add(std::mem::size_of::<RingHeader>()) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes ready to be consumed.
    pub fn available(&self) -> usize {
        let header = self.header();
        let p = header.producer.load(Ordering::Acquire);
        let c = header.consumer.load(Ordering::Acquire);
        (p - c) as usize
    }

    /// Bytes the producer may still publish.
    pub fn writable(&self) -> usize {
        self.capacity - self.available()
    }

    /// Publish as much of `src` as fits. Returns the number of bytes
    /// written; zero means the ring is full.
    pub fn produce(&self, src: &[u8]) -> usize {
        let header = self.header();
        let p = header.producer.load(Ordering::Relaxed);
        let c = header.consumer.load(Ordering::Acquire);
        let used = (p - c) as usize;
        let n = src.len().min(self.capacity - used);
        if n == 0 {
            return 0;
        }

        let offset = (p as usize) & (self.capacity - 1);
        let first = n.min(self.capacity - offset);
        // Safety: single producer; the region [p, p+n) is unpublished
        // and therefore not visible to the consumer yet.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.data_ptr().add(offset), first);
            if n > first {
                std::ptr::copy_nonoverlapping(src.as_ptr().add(first), self.data_ptr(), n - first);
            }
        }
        header.producer.store(p + n as u64, Ordering::Release);

        if used == 0 {
            let _ = self.data_signal.ring();
        }
        n
    }

    /// Consume up to `dst.len()` bytes. Returns the number of bytes
    /// copied out; zero means the ring is empty.
    pub fn consume_into(&self, dst: &mut [u8]) -> usize {
        let header = self.header();
        let c = header.consumer.load(Ordering::Relaxed);
        let p = header.producer.load(Ordering::Acquire);
        let used = (p - c) as usize;
        let n = dst.len().min(used);
        if n == 0 {
            return 0;
        }

        let offset = (c as usize) & (self.capacity - 1);
        let first = n.min(self.capacity - offset);
        // Safety: single consumer; the region [c, c+n) was published by
        // the producer's release store observed above.
        unsafe {
            std::ptr::copy_nonoverlapping(self.data_ptr().add(offset), dst.as_mut_ptr(), first);
            if n > first {
                std::ptr::copy_nonoverlapping(
                    self.data_ptr(),
                    dst.as_mut_ptr().add(first),
                    n - first,
                );
            }
        }
        header.consumer.store(c + n as u64, Ordering::Release);

        if used == self.capacity {
            let _ = self.space_signal.ring();
        }
        n
    }

    /// Fds to hand to the peer: (segment, data doorbell, space doorbell).
    pub fn export_fds(&self) -> io::Result<(OwnedFd, OwnedFd, OwnedFd)> {
        Ok((
            self.segment.try_clone_fd()?,
            self.data_signal.try_clone()?.into_owned_fd(),
            self.space_signal.try_clone()?.into_owned_fd(),
        ))
    }

    pub fn data_signal(&self) -> &Doorbell {
        &self.data_signal
    }

    pub fn space_signal(&self) -> &Doorbell {
        &self.space_signal
    }

    pub fn data_signal_fd(&self) -> RawFd {
        self.data_signal.as_raw_fd()
    }

    pub fn space_signal_fd(&self) -> RawFd {
        self.space_signal.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn produce_then_consume() {
        let (tx, rx) = Ring::pair(64).unwrap();
        assert_eq!(tx.writable(), 64);
        assert_eq!(rx.available(), 0);

        assert_eq!(tx.produce(b"hello"), 5);
        assert_eq!(rx.available(), 5);

        let mut buf = [0u8; 5];
        assert_eq!(rx.consume_into(&mut buf), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(rx.available(), 0);
    }

    #[test]
    fn partial_produce_when_almost_full() {
        let (tx, rx) = Ring::pair(8).unwrap();
        assert_eq!(tx.produce(&[1u8; 6]), 6);
        // Only two bytes of room are left.
        assert_eq!(tx.produce(&[2u8; 6]), 2);
        assert_eq!(tx.produce(&[3u8; 1]), 0);

        let mut buf = [0u8; 8];
        assert_eq!(rx.consume_into(&mut buf), 8);
        assert_eq!(&buf[..6], &[1u8; 6]);
        assert_eq!(&buf[6..], &[2u8; 2]);
    }

    #[test]
    fn wraps_around() {
        let (tx, rx) = Ring::pair(8).unwrap();
        let mut buf = [0u8; 8];

        // Advance the sequences so the next write straddles the end.
        assert_eq!(tx.produce(&[0u8; 6]), 6);
        assert_eq!(rx.consume_into(&mut buf[..6]), 6);

        assert_eq!(tx.produce(&[9u8; 5]), 5);
        assert_eq!(rx.consume_into(&mut buf[..5]), 5);
        assert_eq!(&buf[..5], &[9u8; 5]);
    }

    #[test]
    fn signals_on_transitions_only() {
        let (tx, rx) = Ring::pair(8).unwrap();

        assert_eq!(tx.produce(&[1u8; 2]), 2);
        assert_eq!(tx.produce(&[1u8; 2]), 2);
        // Two produces, one empty-to-non-empty transition.
        assert_eq!(rx.data_signal().drain().unwrap(), 1);

        // Fill it up, then free one byte: one full-to-non-full ring.
        assert_eq!(tx.produce(&[1u8; 4]), 4);
        let mut b = [0u8; 1];
        assert_eq!(rx.consume_into(&mut b), 1);
        assert_eq!(rx.consume_into(&mut b), 1);
        assert_eq!(tx.space_signal().drain().unwrap(), 1);
    }

    #[test]
    fn spsc_saturation_never_overwrites() {
        const CAPACITY: usize = 64;
        const TOTAL: usize = 100_000;

        let (tx, rx) = Ring::pair(CAPACITY).unwrap();
        let tx = Arc::new(tx);
        let rx = Arc::new(rx);

        let producer = {
            let tx = Arc::clone(&tx);
            std::thread::spawn(move || {
                let mut sent = 0usize;
                while sent < TOTAL {
                    let chunk: Vec<u8> =
                        (sent..TOTAL.min(sent + 17)).map(|i| (i % 251) as u8).collect();
                    let mut off = 0;
                    while off < chunk.len() {
                        let n = tx.produce(&chunk[off..]);
                        if n == 0 {
                            let _ = tx.space_signal().wait();
                        }
                        off += n;
                    }
                    sent += chunk.len();
                }
            })
        };

        let mut received = 0usize;
        let mut buf = [0u8; 23];
        while received < TOTAL {
            let n = rx.consume_into(&mut buf);
            if n == 0 {
                let _ = rx.data_signal().wait();
                continue;
            }
            for &byte in &buf[..n] {
                assert_eq!(byte, ((received % 251) as u8));
                received += 1;
            }
            assert!(rx.available() <= CAPACITY);
        }

        producer.join().unwrap();
    }
}
