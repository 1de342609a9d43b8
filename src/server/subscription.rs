//! Per-client pad-data subscriptions
//!
//! Clients re-send their pad-data request periodically. Each request refreshes
//! one or more timestamps; a subscription lapses when its timestamp is older
//! than the TTL. Dead clients are dropped while computing broadcast recipients.

use crate::ds3::types::{DeviceAddress, PadId};
use log::{debug, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const SUBSCRIPTION_TTL: Duration = Duration::from_secs(5);

/// Request flag: the slot byte is valid
pub const FLAG_SLOT: u8 = 0x01;
/// Request flag: the address bytes are valid
pub const FLAG_ADDRESS: u8 = 0x02;

#[derive(Debug, Default, Clone)]
struct ClientSubscription {
    all_pads: Option<Instant>,
    slots: [Option<Instant>; 4],
    addresses: HashMap<DeviceAddress, Instant>,
}

impl ClientSubscription {
    fn register(&mut self, flags: u8, slot: u8, address: DeviceAddress, now: Instant) {
        if flags == 0 {
            self.all_pads = Some(now);
            return;
        }

        if flags & FLAG_SLOT != 0 {
            if let Some(entry) = self.slots.get_mut(slot as usize) {
                *entry = Some(now);
            }
        }

        if flags & FLAG_ADDRESS != 0 {
            self.addresses.insert(address, now);
        }
    }

    fn wants(&self, pad_id: PadId, address: &DeviceAddress, now: Instant, ttl: Duration) -> bool {
        let fresh = |t: Option<Instant>| t.is_some_and(|t| now.saturating_duration_since(t) < ttl);

        fresh(self.all_pads)
            || pad_id.index().is_some_and(|i| fresh(self.slots[i]))
            || fresh(self.addresses.get(address).copied())
    }

    /// No slot or address subscription is still fresh
    fn is_dead(&self, now: Instant, ttl: Duration) -> bool {
        let fresh = |t: &Instant| now.saturating_duration_since(*t) < ttl;

        !self.slots.iter().flatten().any(fresh) && !self.addresses.values().any(fresh)
    }
}

/// Subscription table shared by the request and broadcast paths
#[derive(Debug)]
pub struct SubscriptionRegistry {
    clients: Mutex<HashMap<SocketAddr, ClientSubscription>>,
    ttl: Duration,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::with_ttl(SUBSCRIPTION_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Apply one pad-data request from `client`
    pub fn register(&self, client: SocketAddr, flags: u8, slot: u8, address: DeviceAddress, now: Instant) {
        match self.clients.lock() {
            Ok(mut clients) => {
                clients.entry(client).or_default().register(flags, slot, address, now);
                debug!("Subscription from {} (flags {:#04x}, slot {}, {})", client, flags, slot, address);
            }
            Err(_) => warn!("Subscription table poisoned, ignoring request from {}", client),
        }
    }

    /// Clients that should receive a report for this pad, evicting dead ones
    pub fn recipients(&self, pad_id: PadId, address: &DeviceAddress, now: Instant) -> Vec<SocketAddr> {
        let Ok(mut clients) = self.clients.lock() else {
            return Vec::new();
        };

        let mut recipients = Vec::new();
        let ttl = self.ttl;
        clients.retain(|client, sub| {
            if sub.wants(pad_id, address, now, ttl) {
                recipients.push(*client);
                true
            } else if sub.is_dead(now, ttl) {
                debug!("Dropping expired client {}", client);
                false
            } else {
                true
            }
        });

        recipients
    }

    pub fn len(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
