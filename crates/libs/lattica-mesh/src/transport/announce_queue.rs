use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::hash::AddressHash;
use crate::packet::Packet;

/// Upper bound on accumulated announce budget, so an idle interface cannot
/// bank hours of allowance and then burst.
const MAX_BANKED_BYTES: f64 = 64.0 * 512.0;

pub struct QueuedAnnounce {
    pub destination: AddressHash,
    pub packet: Packet,
    pub announce_timestamp: u64,
}

#[derive(Default)]
struct IfaceQueue {
    queue: VecDeque<QueuedAnnounce>,
    budget_bytes: f64,
}

/// Per-interface announce egress queues, drained against a byte budget
/// derived from the interface bitrate and the announce cap. Re-announces
/// for a destination already queued collapse onto the newest copy.
pub struct AnnounceQueue {
    queues: HashMap<AddressHash, IfaceQueue>,
    max_len: usize,
}

impl AnnounceQueue {
    pub fn new(max_len: usize) -> Self {
        Self { queues: HashMap::new(), max_len: max_len.max(1) }
    }

    pub fn enqueue(&mut self, iface: AddressHash, announce: QueuedAnnounce) {
        let queue = self.queues.entry(iface).or_default();

        if let Some(existing) =
            queue.queue.iter_mut().find(|queued| queued.destination == announce.destination)
        {
            if announce.announce_timestamp >= existing.announce_timestamp {
                *existing = announce;
            }
            return;
        }

        if queue.queue.len() >= self.max_len {
            queue.queue.pop_front();
        }
        queue.queue.push_back(announce);
    }

    /// Adds `elapsed` worth of budget for an interface: `bitrate/8 × dt ×
    /// cap` bytes.
    pub fn refill(&mut self, iface: AddressHash, bitrate: u64, elapsed: Duration, cap: f64) {
        let queue = self.queues.entry(iface).or_default();
        let earned = bitrate as f64 / 8.0 * elapsed.as_secs_f64() * cap;
        queue.budget_bytes = (queue.budget_bytes + earned).min(MAX_BANKED_BYTES);
    }

    /// Pops announces while the interface has budget for their wire size.
    pub fn drain(&mut self, iface: &AddressHash) -> Vec<Packet> {
        let Some(queue) = self.queues.get_mut(iface) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        while let Some(next) = queue.queue.front() {
            let wire_len = match next.packet.pack() {
                Ok(bytes) => bytes.len() as f64,
                Err(_) => {
                    queue.queue.pop_front();
                    continue;
                }
            };
            if queue.budget_bytes < wire_len {
                break;
            }
            queue.budget_bytes -= wire_len;
            if let Some(announce) = queue.queue.pop_front() {
                out.push(announce.packet);
            }
        }
        out
    }

    pub fn remove_iface(&mut self, iface: &AddressHash) {
        self.queues.remove(iface);
    }

    pub fn queued(&self, iface: &AddressHash) -> usize {
        self.queues.get(iface).map(|queue| queue.queue.len()).unwrap_or(0)
    }
}

//***************************************************************************//

const RATE_TARGET: Duration = Duration::from_secs(3600);
const RATE_GRACE: u32 = 10;
const RATE_PENALTY: Duration = Duration::from_secs(7200);

struct OriginState {
    violations: u32,
    last_announce: Instant,
    blocked_until: Option<Instant>,
}

/// Per-origin announce rate limiting. Destinations announcing faster than
/// the target accumulate violations; past the grace count they are blocked
/// for the target window plus a penalty.
#[derive(Default)]
pub struct AnnounceRateLimits {
    origins: HashMap<AddressHash, OriginState>,
}

impl AnnounceRateLimits {
    pub fn new() -> Self {
        Self { origins: HashMap::new() }
    }

    /// Records an announce from `origin`; returns how long the origin stays
    /// blocked, or None when the announce should be processed.
    pub fn check(&mut self, origin: &AddressHash) -> Option<Duration> {
        let now = Instant::now();
        let Some(state) = self.origins.get_mut(origin) else {
            self.origins.insert(
                *origin,
                OriginState { violations: 0, last_announce: now, blocked_until: None },
            );
            return None;
        };

        let mut blocked = None;

        if let Some(until) = state.blocked_until {
            if now < until {
                // Announcing while blocked extends the block.
                let extended = now + RATE_TARGET + RATE_PENALTY;
                state.blocked_until = Some(extended);
                blocked = Some(extended - now);
            } else {
                state.blocked_until = None;
            }
        } else if now.duration_since(state.last_announce) < RATE_TARGET {
            state.violations += 1;
            if state.violations >= RATE_GRACE {
                state.violations = 0;
                let until = now + RATE_TARGET;
                state.blocked_until = Some(until);
                blocked = Some(until - now);
            }
        } else {
            state.violations = 0;
        }

        state.last_announce = now;
        blocked
    }
}
