use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::time::epoch_secs;

use super::{DeliveryEvent, PowerState, TransportHandler};

const HASHLIST_ROTATE_INTERVAL: Duration = Duration::from_secs(60 * 60);
const TUNNEL_SYNC_INTERVAL: Duration = Duration::from_secs(60);
const PERSIST_INTERVAL: Duration = Duration::from_secs(5 * 60);
const KNOWN_CULL_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Due-times for the slow jobs; the fast jobs run on every tick.
pub(crate) struct JobClock {
    last_refill: Instant,
    hashlist_rotated: Instant,
    tunnels_synced: Instant,
    persisted: Instant,
    known_culled: Instant,
}

impl JobClock {
    pub(crate) fn new() -> Self {
        let now = Instant::now();
        Self {
            last_refill: now,
            hashlist_rotated: now,
            tunnels_synced: now,
            persisted: now,
            known_culled: now,
        }
    }
}

/// The single cooperative maintenance task. One suspension point per tick;
/// the tick widens under the power collaborator's multiplier so a throttled
/// device wakes correspondingly less often.
pub(crate) async fn maintenance_loop(
    handler: Arc<Mutex<TransportHandler>>,
    power: Arc<PowerState>,
    cancel: CancellationToken,
) {
    let base_tick = handler.lock().await.config.tick_interval;

    loop {
        let tick = base_tick.mul_f64(power.throttle_multiplier());
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(tick) => {
                run_jobs(&handler, &power, false).await;
            }
        }
    }
}

/// Runs the periodic jobs. With `force` every interval job runs regardless
/// of due time — the path taken when an external platform timer drives
/// maintenance instead of the internal loop.
pub(crate) async fn run_jobs(
    handler: &Arc<Mutex<TransportHandler>>,
    power: &Arc<PowerState>,
    force: bool,
) {
    let now = Instant::now();
    let now_epoch = epoch_secs();
    let multiplier = power.throttle_multiplier();
    let throttled = power.should_throttle();

    let mut handler = handler.lock().await;
    if !handler.started {
        return;
    }

    let snapshot = handler.iface_manager.lock().await.snapshot();
    let online: HashSet<_> =
        snapshot.iter().filter(|iface| iface.online).map(|iface| iface.address).collect();

    // 1. Path table cull: expiry plus the live-interface invariant.
    handler.path_table.cull(now_epoch, |iface| online.contains(iface));

    // 4. Link watchdogs: establishment timeouts, stale probes, closes.
    handler.drive_link_watchdogs().await;

    // 5. Receipt cull.
    for (packet_hash, destination) in handler.receipts.cull(now) {
        let _ = handler
            .delivery_tx
            .send(DeliveryEvent::TimedOut { packet_hash, destination });
    }
    handler.link_table.cull();

    // 9. Per-interface announce budget accounting. A hard throttle halves
    // the announce cap on top of the widened tick.
    let elapsed = now.duration_since(handler.job_clock.last_refill);
    handler.job_clock.last_refill = now;
    let cap = handler.config.announce_cap * if throttled { 0.5 } else { 1.0 };
    for iface in snapshot.iter().filter(|iface| iface.online && iface.can_send) {
        handler.announce_queue.refill(iface.address, iface.bitrate, elapsed, cap);
    }

    // 3. Announce queue drain, within the budget just granted.
    for iface in snapshot.iter().filter(|iface| iface.online && iface.can_send) {
        let packets = handler.announce_queue.drain(&iface.address);
        for packet in packets {
            handler
                .send(crate::iface::TxMessage {
                    tx_type: crate::iface::TxMessageType::Direct(iface.address),
                    packet,
                })
                .await;
        }
    }

    let due = |last: Instant, interval: Duration| {
        force || now.duration_since(last) >= interval.mul_f64(multiplier)
    };

    // 2. Hashlist generation rotation.
    if due(handler.job_clock.hashlist_rotated, HASHLIST_ROTATE_INTERVAL) {
        handler.job_clock.hashlist_rotated = now;
        handler.hashlist.rotate();
    }

    // 6. Tunnel synthesis for freshly online tunnel interfaces.
    if due(handler.job_clock.tunnels_synced, TUNNEL_SYNC_INTERVAL) {
        handler.job_clock.tunnels_synced = now;
        let tunnel_ifaces: Vec<_> = snapshot
            .iter()
            .filter(|iface| iface.online && iface.wants_tunnel)
            .filter_map(|iface| iface.tunnel_id.map(|id| (id, iface.address, iface.mode)))
            .collect();
        for (tunnel_id, address, mode) in tunnel_ifaces {
            handler.replay_tunnel(&tunnel_id, address, mode).await;
        }
        handler.tunnels.cull();
    }

    // 7. Periodic persistence.
    if due(handler.job_clock.persisted, PERSIST_INTERVAL) {
        handler.job_clock.persisted = now;
        handler.persist_state().await;
    }

    // 8. Known-destination aging.
    if due(handler.job_clock.known_culled, KNOWN_CULL_INTERVAL) {
        handler.job_clock.known_culled = now;
        handler
            .known_destinations
            .cull_older_than(super::KNOWN_DESTINATION_MAX_AGE_SECS);
        if let Some(store) = handler.ratchet_store.as_mut() {
            store.clean_expired();
        }
    }
}
