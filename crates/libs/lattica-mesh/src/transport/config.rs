use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use crate::identity::PrivateIdentity;

/// Shared handle the power-saving collaborator writes and the maintenance
/// loop reads at every tick. Both signals may change at runtime.
#[derive(Default)]
pub struct PowerState {
    should_throttle: AtomicBool,
    multiplier_milli: AtomicU32,
}

impl PowerState {
    pub fn new() -> Self {
        Self { should_throttle: AtomicBool::new(false), multiplier_milli: AtomicU32::new(1000) }
    }

    pub fn set_should_throttle(&self, throttle: bool) {
        self.should_throttle.store(throttle, Ordering::Relaxed);
    }

    pub fn should_throttle(&self) -> bool {
        self.should_throttle.load(Ordering::Relaxed)
    }

    /// Interval multiplier, clamped to `[1.0, 5.0]`.
    pub fn set_throttle_multiplier(&self, multiplier: f32) {
        let clamped = multiplier.clamp(1.0, 5.0);
        self.multiplier_milli.store((clamped * 1000.0) as u32, Ordering::Relaxed);
    }

    pub fn throttle_multiplier(&self) -> f64 {
        f64::from(self.multiplier_milli.load(Ordering::Relaxed).max(1000)) / 1000.0
    }
}

#[derive(Clone)]
pub struct TransportConfig {
    pub name: String,
    /// Daemon identity; generated (or loaded from storage) when absent.
    pub identity: Option<PrivateIdentity>,
    /// When false this node never rebroadcasts or forwards on behalf of
    /// others; it still originates and receives.
    pub enable_transport: bool,
    pub respond_to_probes: bool,
    pub link_mtu_discovery: bool,
    pub storage_dir: Option<PathBuf>,
    pub hashlist_capacity: usize,
    pub max_queued_announces: usize,
    /// Fraction of an interface's bitrate announces may consume.
    pub announce_cap: f64,
    pub max_receipts: usize,
    pub receipt_timeout: Duration,
    pub tick_interval: Duration,
    pub announce_max_age_secs: u64,
    pub announce_max_skew_secs: u64,
    pub link_proof_timeout: Duration,
    pub link_idle_timeout: Duration,
}

impl TransportConfig {
    pub fn new<T: Into<String>>(name: T) -> Self {
        Self {
            name: name.into(),
            identity: None,
            enable_transport: false,
            respond_to_probes: true,
            link_mtu_discovery: false,
            storage_dir: None,
            hashlist_capacity: 1_000_000,
            max_queued_announces: 16_384,
            announce_cap: 0.02,
            max_receipts: 1024,
            receipt_timeout: Duration::from_secs(60),
            tick_interval: Duration::from_millis(250),
            announce_max_age_secs: 24 * 60 * 60,
            announce_max_skew_secs: 120,
            link_proof_timeout: Duration::from_secs(600),
            link_idle_timeout: Duration::from_secs(900),
        }
    }

    /// Memory-constrained profile: tables 20× smaller than desktop.
    pub fn mobile(mut self) -> Self {
        self.hashlist_capacity = 50_000;
        self.max_queued_announces = 819;
        self.max_receipts = 51;
        self
    }

    pub fn with_identity(mut self, identity: PrivateIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_storage_dir(mut self, dir: PathBuf) -> Self {
        self.storage_dir = Some(dir);
        self
    }

    pub fn with_transport_enabled(mut self, enabled: bool) -> Self {
        self.enable_transport = enabled;
        self
    }
}
