//! SD phase machines and registries, free of I/O.
//!
//! The engine task owns one [`OfferFsm`] per offered service and one
//! [`FindFsm`] per requested remote service, ticks them against the
//! clock, and batches whatever they emit into one datagram per cycle.
//! Subscriber bookkeeping and reboot detection live here too so every
//! timing rule is unit-testable with synthetic instants.
//!
//! ```text
//! Offer phases:
//!
//! ┌──────────────┐ delay ∈ [initial_delay_min, initial_delay_max]
//! │ InitialWait  │────── emits 1st offer ──────┐
//! └──────────────┘                             ▼
//! ┌──────────────┐ base·2^k, k = 0..max-1  ┌───────┐
//! │  Repetition  │── max further offers ──►│ Main  │ every cyclic_offer_delay
//! └──────────────┘                         └───────┘ until StopOffer
//! ```

use crate::config::SdConfig;
use crate::types::{EventgroupId, InstanceId, ServiceId, Ttl};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tracing::debug;

// =============================================================================
// OFFER PHASE MACHINE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferPhase {
    InitialWait,
    Repetition,
    Main,
    Stopped,
}

#[derive(Debug)]
pub struct OfferFsm {
    phase: OfferPhase,
    due: Instant,
    repetition: u8,
    repetitions_max: u8,
    repetitions_base_delay: Duration,
    cyclic_offer_delay: Duration,
}

impl OfferFsm {
    /// `initial_delay` is the uniformly random wait drawn by the caller
    /// from `[initial_delay_min, initial_delay_max]`.
    pub fn new(now: Instant, initial_delay: Duration, sd: &SdConfig) -> Self {
        Self {
            phase: OfferPhase::InitialWait,
            due: now + initial_delay,
            repetition: 0,
            repetitions_max: sd.repetitions_max,
            repetitions_base_delay: Duration::from_millis(sd.repetitions_base_delay_ms),
            cyclic_offer_delay: Duration::from_millis(sd.cyclic_offer_delay_ms),
        }
    }

    pub fn phase(&self) -> OfferPhase {
        self.phase
    }

    /// When the next tick should run, if ever.
    pub fn next_due(&self) -> Option<Instant> {
        (self.phase != OfferPhase::Stopped).then_some(self.due)
    }

    /// Advance the machine. Returns true when an OfferService entry is
    /// due for emission at `now`.
    pub fn tick(&mut self, now: Instant) -> bool {
        if self.phase == OfferPhase::Stopped || now < self.due {
            return false;
        }
        match self.phase {
            OfferPhase::InitialWait => {
                // The initial wait expiring emits the first offer.
                if self.repetitions_max == 0 {
                    self.phase = OfferPhase::Main;
                    self.due += self.cyclic_offer_delay;
                } else {
                    self.phase = OfferPhase::Repetition;
                    self.due += self.repetitions_base_delay;
                }
                true
            }
            OfferPhase::Repetition => {
                self.repetition += 1;
                if self.repetition >= self.repetitions_max {
                    self.phase = OfferPhase::Main;
                    self.due += self.cyclic_offer_delay;
                } else {
                    // base · 2^k for the k-th repetition interval.
                    self.due += self.repetitions_base_delay * (1 << self.repetition);
                }
                true
            }
            OfferPhase::Main => {
                self.due += self.cyclic_offer_delay;
                true
            }
            OfferPhase::Stopped => false,
        }
    }

    pub fn stop(&mut self) {
        self.phase = OfferPhase::Stopped;
    }
}

// =============================================================================
// FIND PHASE MACHINE
// =============================================================================

/// Find runs the same schedule as offer but has no main phase: after
/// the repetitions are exhausted the cyclic remote offers take over.
#[derive(Debug)]
pub struct FindFsm {
    phase: OfferPhase,
    due: Instant,
    repetition: u8,
    repetitions_max: u8,
    repetitions_base_delay: Duration,
}

impl FindFsm {
    pub fn new(now: Instant, initial_delay: Duration, sd: &SdConfig) -> Self {
        Self {
            phase: OfferPhase::InitialWait,
            due: now + initial_delay,
            repetition: 0,
            repetitions_max: sd.repetitions_max,
            repetitions_base_delay: Duration::from_millis(sd.repetitions_base_delay_ms),
        }
    }

    pub fn next_due(&self) -> Option<Instant> {
        (self.phase != OfferPhase::Stopped).then_some(self.due)
    }

    pub fn is_active(&self) -> bool {
        self.phase != OfferPhase::Stopped
    }

    pub fn tick(&mut self, now: Instant) -> bool {
        if self.phase == OfferPhase::Stopped || now < self.due {
            return false;
        }
        match self.phase {
            OfferPhase::InitialWait => {
                if self.repetitions_max == 0 {
                    self.phase = OfferPhase::Stopped;
                } else {
                    self.phase = OfferPhase::Repetition;
                    self.due += self.repetitions_base_delay;
                }
                true
            }
            OfferPhase::Repetition => {
                self.repetition += 1;
                if self.repetition >= self.repetitions_max {
                    self.phase = OfferPhase::Stopped;
                } else {
                    self.due += self.repetitions_base_delay * (1 << self.repetition);
                }
                true
            }
            _ => false,
        }
    }

    /// A matching offer terminates finding.
    pub fn offer_received(&mut self) {
        self.phase = OfferPhase::Stopped;
    }
}

// =============================================================================
// REMOTE SUBSCRIBERS
// =============================================================================

/// A remote client subscribed to one of our eventgroups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    /// SD source address the subscription arrived from.
    pub peer: IpAddr,
    pub counter: u8,
    /// Notification targets taken from the endpoint options.
    pub reliable: Option<SocketAddr>,
    pub unreliable: Option<SocketAddr>,
    pub expires: Instant,
}

/// Current subscribers per (service, instance, eventgroup), with TTL
/// expiry. The routing core fans notifications out over a snapshot of
/// this table.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    groups: HashMap<(ServiceId, InstanceId, EventgroupId), Vec<Subscriber>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a subscription; the TTL restarts either way.
    pub fn upsert(
        &mut self,
        key: (ServiceId, InstanceId, EventgroupId),
        mut subscriber: Subscriber,
        ttl: Ttl,
        now: Instant,
    ) {
        subscriber.expires = now + Duration::from_secs(u64::from(ttl));
        let subscribers = self.groups.entry(key).or_default();
        match subscribers.iter_mut().find(|s| {
            s.peer == subscriber.peer && s.counter == subscriber.counter
        }) {
            Some(existing) => *existing = subscriber,
            None => subscribers.push(subscriber),
        }
    }

    pub fn remove(
        &mut self,
        key: (ServiceId, InstanceId, EventgroupId),
        peer: IpAddr,
        counter: u8,
    ) -> bool {
        let Some(subscribers) = self.groups.get_mut(&key) else { return false };
        let before = subscribers.len();
        subscribers.retain(|s| !(s.peer == peer && s.counter == counter));
        subscribers.len() != before
    }

    /// Drop every subscription whose TTL elapsed. Returns how many went.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        for subscribers in self.groups.values_mut() {
            let before = subscribers.len();
            subscribers.retain(|s| s.expires > now);
            removed += before - subscribers.len();
        }
        self.groups.retain(|_, v| !v.is_empty());
        if removed > 0 {
            debug!(removed, "expired eventgroup subscriptions");
        }
        removed
    }

    /// All state learned from `peer` becomes invalid (reboot).
    pub fn invalidate_peer(&mut self, peer: IpAddr) -> usize {
        let mut removed = 0;
        for subscribers in self.groups.values_mut() {
            let before = subscribers.len();
            subscribers.retain(|s| s.peer != peer);
            removed += before - subscribers.len();
        }
        self.groups.retain(|_, v| !v.is_empty());
        removed
    }

    pub fn subscribers(
        &self,
        key: (ServiceId, InstanceId, EventgroupId),
    ) -> impl Iterator<Item = &Subscriber> {
        self.groups.get(&key).into_iter().flatten()
    }

    pub fn snapshot(&self) -> HashMap<(ServiceId, InstanceId, EventgroupId), Vec<Subscriber>> {
        self.groups.clone()
    }

    pub fn len(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

// =============================================================================
// REBOOT DETECTION
// =============================================================================

/// Our outgoing SD session counter: starts at 1 with the reboot flag
/// set; the flag clears once the counter wraps for the first time.
#[derive(Debug)]
pub struct SessionCounter {
    next: u16,
    reboot: bool,
}

impl SessionCounter {
    pub fn new() -> Self {
        Self { next: 1, reboot: true }
    }

    pub fn next(&mut self) -> (u16, bool) {
        let session = self.next;
        let reboot = self.reboot;
        self.next = match self.next.checked_add(1) {
            Some(n) => n,
            None => {
                self.reboot = false;
                1
            }
        };
        (session, reboot)
    }
}

impl Default for SessionCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks the SD flags/session of every peer per channel (multicast or
/// unicast) and reports reboots.
#[derive(Debug, Default)]
pub struct RebootDetector {
    seen: HashMap<(IpAddr, bool), (bool, u16)>,
}

impl RebootDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one received SD header. Returns true when the peer rebooted
    /// and everything learned from it must be invalidated.
    pub fn check(&mut self, peer: IpAddr, multicast: bool, reboot_flag: bool, session: u16) -> bool {
        let key = (peer, multicast);
        let rebooted = match self.seen.get(&key) {
            // Flag newly raised after having been clear, or a session
            // regression while the flag is still up.
            Some(&(old_flag, old_session)) => {
                (reboot_flag && !old_flag) || (reboot_flag && old_flag && session <= old_session)
            }
            None => false,
        };
        self.seen.insert(key, (reboot_flag, session));
        rebooted
    }

    /// Forget a peer (its offers timed out).
    pub fn forget(&mut self, peer: IpAddr) {
        self.seen.retain(|(addr, _), _| *addr != peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sd() -> SdConfig {
        SdConfig::default()
    }

    fn drain(fsm: &mut OfferFsm, from: Instant, until: Instant) -> Vec<Duration> {
        // Collect emission offsets by stepping the clock to each due time.
        let mut emissions = Vec::new();
        loop {
            let Some(due) = fsm.next_due() else { break };
            if due > until {
                break;
            }
            assert!(fsm.tick(due));
            emissions.push(due - from);
        }
        emissions
    }

    #[test]
    fn offer_schedule_matches_defaults() {
        // initial delay 0, base 10ms, max 3, cyclic 1000ms:
        // offers at t0, t0+10, t0+30, t0+70, t0+1070, t0+2070, ...
        let now = Instant::now();
        let mut fsm = OfferFsm::new(now, Duration::ZERO, &sd());
        let emissions = drain(&mut fsm, now, now + Duration::from_millis(2100));
        assert_eq!(
            emissions,
            vec![
                Duration::from_millis(0),
                Duration::from_millis(10),
                Duration::from_millis(30),
                Duration::from_millis(70),
                Duration::from_millis(1070),
                Duration::from_millis(2070),
            ]
        );
    }

    #[test]
    fn repetition_count_equals_configured_max() {
        let mut config = sd();
        config.repetitions_max = 5;
        let now = Instant::now();
        let mut fsm = OfferFsm::new(now, Duration::ZERO, &config);
        // First tick leaves InitialWait; then exactly 5 repetition ticks
        // before Main.
        assert!(fsm.tick(fsm.next_due().unwrap()));
        let mut repetitions = 0;
        while fsm.phase() == OfferPhase::Repetition {
            assert!(fsm.tick(fsm.next_due().unwrap()));
            repetitions += 1;
        }
        assert_eq!(repetitions, 5);
        assert_eq!(fsm.phase(), OfferPhase::Main);
    }

    #[test]
    fn initial_delay_shifts_whole_schedule() {
        let now = Instant::now();
        let mut fsm = OfferFsm::new(now, Duration::from_millis(2500), &sd());
        assert!(!fsm.tick(now));
        assert!(!fsm.tick(now + Duration::from_millis(2499)));
        let emissions = drain(&mut fsm, now, now + Duration::from_millis(2600));
        assert_eq!(
            emissions,
            vec![
                Duration::from_millis(2500),
                Duration::from_millis(2510),
                Duration::from_millis(2530),
                Duration::from_millis(2570),
            ]
        );
    }

    #[test]
    fn stopped_offer_never_fires() {
        let now = Instant::now();
        let mut fsm = OfferFsm::new(now, Duration::ZERO, &sd());
        fsm.stop();
        assert!(fsm.next_due().is_none());
        assert!(!fsm.tick(now + Duration::from_secs(10)));
    }

    #[test]
    fn find_stops_after_repetitions() {
        let now = Instant::now();
        let mut fsm = FindFsm::new(now, Duration::ZERO, &sd());
        let mut emissions = 0;
        while let Some(due) = fsm.next_due() {
            assert!(fsm.tick(due));
            emissions += 1;
            assert!(emissions < 20, "find must terminate");
        }
        // 1 from initial wait + repetitions_max.
        assert_eq!(emissions, 1 + sd().repetitions_max as usize);
        assert!(!fsm.is_active());
    }

    #[test]
    fn find_terminated_by_offer() {
        let now = Instant::now();
        let mut fsm = FindFsm::new(now, Duration::from_millis(100), &sd());
        fsm.offer_received();
        assert!(!fsm.is_active());
        assert!(!fsm.tick(now + Duration::from_secs(1)));
    }

    #[test]
    fn subscriber_ttl_expiry() {
        let now = Instant::now();
        let mut registry = SubscriberRegistry::new();
        let key = (0x1234u16, 0x0001u16, 0x0005u16);
        let subscriber = Subscriber {
            peer: "10.0.0.2".parse().unwrap(),
            counter: 0,
            reliable: None,
            unreliable: Some("10.0.0.2:40000".parse().unwrap()),
            expires: now,
        };
        registry.upsert(key, subscriber.clone(), 3, now);
        assert_eq!(registry.subscribers(key).count(), 1);

        // Refresh before expiry keeps it alive past the original TTL.
        registry.upsert(key, subscriber, 3, now + Duration::from_secs(2));
        assert_eq!(registry.expire(now + Duration::from_secs(4)), 0);
        assert_eq!(registry.subscribers(key).count(), 1);

        // No refresh: gone before any later fanout.
        assert_eq!(registry.expire(now + Duration::from_secs(6)), 1);
        assert_eq!(registry.subscribers(key).count(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn subscriber_refresh_replaces_endpoints() {
        let now = Instant::now();
        let mut registry = SubscriberRegistry::new();
        let key = (1u16, 1u16, 1u16);
        let peer: IpAddr = "10.0.0.9".parse().unwrap();
        let old = Subscriber {
            peer,
            counter: 1,
            reliable: None,
            unreliable: Some("10.0.0.9:1000".parse().unwrap()),
            expires: now,
        };
        let new = Subscriber {
            peer,
            counter: 1,
            reliable: Some("10.0.0.9:2000".parse().unwrap()),
            unreliable: None,
            expires: now,
        };
        registry.upsert(key, old, 5, now);
        registry.upsert(key, new.clone(), 5, now);
        let stored: Vec<_> = registry.subscribers(key).collect();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].reliable, new.reliable);
    }

    #[test]
    fn peer_invalidation_clears_all_groups() {
        let now = Instant::now();
        let mut registry = SubscriberRegistry::new();
        let peer: IpAddr = "10.0.0.7".parse().unwrap();
        for group in 1u16..=3 {
            registry.upsert(
                (1, 1, group),
                Subscriber { peer, counter: 0, reliable: None, unreliable: None, expires: now },
                100,
                now,
            );
        }
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.invalidate_peer(peer), 3);
        assert!(registry.is_empty());
    }

    #[test]
    fn session_counter_wrap_clears_reboot() {
        let mut counter = SessionCounter::new();
        let (first, reboot) = counter.next();
        assert_eq!(first, 1);
        assert!(reboot);
        // Drive to the wrap.
        let mut last = (0u16, true);
        for _ in 0..0xFFFF {
            last = counter.next();
        }
        assert_eq!(last.0, 0xFFFF);
        assert!(last.1);
        let (wrapped, reboot) = counter.next();
        assert_eq!(wrapped, 1);
        assert!(!reboot);
    }

    #[test]
    fn reboot_detected_on_flag_rise_and_session_regression() {
        let mut detector = RebootDetector::new();
        let peer: IpAddr = "10.0.0.5".parse().unwrap();

        // First contact: not a reboot, just a boot.
        assert!(!detector.check(peer, true, true, 1));
        assert!(!detector.check(peer, true, true, 2));

        // Session regression with the flag still set: reboot.
        assert!(detector.check(peer, true, true, 1));

        // Flag cleared (peer wrapped), then raised again: reboot.
        assert!(!detector.check(peer, true, false, 500));
        assert!(detector.check(peer, true, true, 1));
    }

    #[test]
    fn reboot_tracking_is_per_channel() {
        let mut detector = RebootDetector::new();
        let peer: IpAddr = "10.0.0.5".parse().unwrap();
        assert!(!detector.check(peer, true, true, 10));
        // Same peer, unicast channel: independent tracking, first
        // contact is not a reboot.
        assert!(!detector.check(peer, false, true, 1));
    }
}
