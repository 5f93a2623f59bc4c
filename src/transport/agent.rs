//! Receiving side of a pipe.
//!
//! The agent sits behind the trap: it validates what the sender handed over,
//! gives the payload to a [`PipeHandler`] and lets it write the response in
//! place, then rotates the connection magic.

use super::{header::PipeHeader, trap::MagicTrap, HEADER_SIZE, PIPE_MAGIC};
use ahash::AHashSet;
use rand::{prelude::SmallRng, Rng, SeedableRng};

/// Consumer and producer of pipe payloads.
pub trait PipeHandler {
    /// Payload sent by the other side, `magic` identifies the connection.
    fn read(&mut self, magic: u64, payload: &[u8]);

    /// Fills the response, returns the number of bytes written.
    fn write(&mut self, magic: u64, out: &mut [u8]) -> usize;

    /// A handler that is not ready makes the sender retransmit.
    fn ready(&self) -> bool {
        true
    }
}

/// What happened to a buffer that reached the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handled, carries the rotated magic.
    Accepted(u64),
    /// Handler not ready, retry bit set.
    Deferred,
    /// Header failed validation, buffer left untouched.
    Rejected,
}

pub struct PipeAgent<H> {
    handler: H,
    sessions: AHashSet<u64>,
    rng: SmallRng,
    haps: u64,
    resyncs: u64,
    last: Option<Delivery>,
}

impl<H: PipeHandler> PipeAgent<H> {
    pub fn new(handler: H) -> Self {
        Self::with_rng(handler, SmallRng::from_entropy())
    }

    /// Agent with reproducible magic rotation.
    pub fn with_seed(handler: H, seed: u64) -> Self {
        Self::with_rng(handler, SmallRng::seed_from_u64(seed))
    }

    fn with_rng(handler: H, rng: SmallRng) -> Self {
        Self {
            handler,
            sessions: AHashSet::default(),
            rng,
            haps: 0,
            resyncs: 0,
            last: None,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Trap events seen, rejected ones included.
    pub fn haps(&self) -> u64 {
        self.haps
    }

    /// Unknown magics accepted as new connections.
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    pub fn last_delivery(&self) -> Option<Delivery> {
        self.last
    }

    pub fn is_session(&self, magic: u64) -> bool {
        self.sessions.contains(&magic)
    }

    /// Handles one buffer, header included.
    pub fn deliver(&mut self, buf: &mut [u8]) -> Delivery {
        self.haps += 1;
        let delivery = self.do_deliver(buf);
        self.last = Some(delivery);
        delivery
    }

    fn do_deliver(&mut self, buf: &mut [u8]) -> Delivery {
        let mut head = match PipeHeader::read_from(buf) {
            Some(head) => head,
            None => {
                log::warn!("pipe buffer shorter than a header: {} bytes", buf.len());
                return Delivery::Rejected;
            }
        };
        if !head.is_valid() || head.size() > buf.len() {
            log::warn!("invalid pipe header: {}", head);
            return Delivery::Rejected;
        }

        let magic = head.magic();
        if magic != PIPE_MAGIC && !self.sessions.contains(&magic) {
            // A valid checksum and size on an unknown magic is taken as a new
            // connection, e.g. the sender lost its magic in a snapshot restore.
            log::debug!("pipe resync on unknown magic {:#018x}", magic);
            self.resyncs += 1;
        }

        if !self.handler.ready() {
            head.set_retry(true);
            head.set_csum();
            head.write_to(buf);
            return Delivery::Deferred;
        }

        let size = head.size();
        let used = head.used();
        self.handler
            .read(magic, &buf[HEADER_SIZE..HEADER_SIZE + used]);

        let out = &mut buf[HEADER_SIZE..size];
        out[..used].iter_mut().for_each(|b| *b = 0);
        let written = self.handler.write(magic, out).min(size - HEADER_SIZE);

        let next = self.rotate(magic);
        head.set_magic(next);
        head.set_used(written);
        head.set_retry(false);
        head.set_csum();
        head.write_to(buf);
        Delivery::Accepted(next)
    }

    fn rotate(&mut self, old: u64) -> u64 {
        self.sessions.remove(&old);
        let mut next = self.rng.gen::<u64>();
        while next == PIPE_MAGIC || self.sessions.contains(&next) {
            next = self.rng.gen();
        }
        self.sessions.insert(next);
        next
    }
}

impl<H: PipeHandler> MagicTrap for PipeAgent<H> {
    fn trigger(&mut self, buf: &mut [u8]) {
        self.deliver(buf);
    }
}
