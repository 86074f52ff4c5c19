//! Station state tracker: presence, signature and EAP retransmit-storm
//! escalation, keyed by MAC (normalized to lower case).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::muxer::protocol::StationEvent;

pub const SIGNATURE_FETCH_DELAY: Duration = Duration::from_secs(1);
pub const RETRANSMIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const RETRANSMIT_SOFT: u32 = 3;
pub const RETRANSMIT_HARD: u32 = 6;

#[derive(Debug, Clone, Default)]
pub struct StationRecord {
    pub last_seen: Option<Instant>,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct RetransmitState {
    count: u32,
    last: Option<Instant>,
    restarted: bool,
}

/// Directives the tracker asks the caller to carry out; kept as plain data
/// so the escalation logic stays pure and testable without a real socket
/// or config client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    PublishConnect { mac: String },
    PublishDisconnect { mac: String },
    ScheduleSignatureFetch { mac: String, delay: Duration },
    FetchSignatureNow { mac: String },
    PublishException { mac: String, reason: &'static str },
    Deauthenticate { mac: String },
    SupervisorReset,
}

#[derive(Default)]
pub struct StationTracker {
    stations: HashMap<String, StationRecord>,
    retransmits: HashMap<String, RetransmitState>,
}

impl StationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, mac: &str) -> Option<&StationRecord> {
        self.stations.get(mac)
    }

    /// Processes one parsed event and returns the directives the caller
    /// must act on (publish, schedule a fetch, deauth, reset...).
    pub fn handle_event(&mut self, event: StationEvent, now: Instant) -> Vec<Directive> {
        match event {
            StationEvent::Connected(mac) => self.on_present(mac, true, now),
            StationEvent::PollOk(mac) => self.on_present(mac, false, now),
            StationEvent::Disconnected(mac) => {
                self.stations.remove(&mac);
                vec![Directive::PublishDisconnect { mac }]
            }
            StationEvent::BadPassword(mac) => vec![Directive::PublishException {
                mac,
                reason: "bad password",
            }],
            StationEvent::EapRetransmit(mac) => self.on_eap_retransmit(mac, now),
        }
    }

    fn on_present(&mut self, mac: String, new: bool, now: Instant) -> Vec<Directive> {
        let record = self.stations.entry(mac.clone()).or_default();
        record.last_seen = Some(now);
        let mut directives = Vec::new();
        if new {
            directives.push(Directive::PublishConnect { mac: mac.clone() });
            directives.push(Directive::ScheduleSignatureFetch {
                mac,
                delay: SIGNATURE_FETCH_DELAY,
            });
        } else {
            directives.push(Directive::FetchSignatureNow { mac });
        }
        directives
    }

    /// Records a freshly-fetched signature; if it differs from the stored
    /// one, the caller should publish an entity update (left to the
    /// caller, since that is where the event bus lives).
    pub fn update_signature(&mut self, mac: &str, signature: String) -> bool {
        let record = self.stations.entry(mac.to_string()).or_default();
        let changed = record.signature.as_deref() != Some(signature.as_str());
        record.signature = Some(signature);
        changed
    }

    fn on_eap_retransmit(&mut self, mac: String, now: Instant) -> Vec<Directive> {
        let state = self.retransmits.entry(mac.clone()).or_default();
        if let Some(last) = state.last {
            if now.saturating_duration_since(last) > RETRANSMIT_TIMEOUT {
                state.count = 0;
            }
        }
        state.count += 1;
        state.last = Some(now);

        let mut directives = Vec::new();
        if state.count == RETRANSMIT_SOFT {
            directives.push(Directive::Deauthenticate { mac: mac.clone() });
        }
        if state.count == RETRANSMIT_HARD {
            directives.push(Directive::PublishException {
                mac: mac.clone(),
                reason: "eap retransmit storm",
            });
            directives.push(Directive::SupervisorReset);
            self.mark_all_restarted();
        }
        directives
    }

    fn mark_all_restarted(&mut self) {
        for state in self.retransmits.values_mut() {
            state.restarted = true;
        }
    }

    /// A station associated with a control socket that has just been torn
    /// down (VAP reconfigured, daemon restarted) is no longer tracked.
    pub fn forget(&mut self, mac: &str) {
        self.stations.remove(mac);
    }

    pub fn known_macs(&self) -> Vec<String> {
        self.stations.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_presence_publishes_connect_and_schedules_fetch() {
        let mut tracker = StationTracker::new();
        let directives = tracker.handle_event(StationEvent::Connected("aa:bb:cc:dd:ee:ff".into()), Instant::now());
        assert_eq!(
            directives,
            vec![
                Directive::PublishConnect { mac: "aa:bb:cc:dd:ee:ff".into() },
                Directive::ScheduleSignatureFetch { mac: "aa:bb:cc:dd:ee:ff".into(), delay: SIGNATURE_FETCH_DELAY }
            ]
        );
    }

    #[test]
    fn poll_ok_fetches_signature_without_delay() {
        let mut tracker = StationTracker::new();
        tracker.handle_event(StationEvent::Connected("aa:bb:cc:dd:ee:ff".into()), Instant::now());
        let directives = tracker.handle_event(StationEvent::PollOk("aa:bb:cc:dd:ee:ff".into()), Instant::now());
        assert_eq!(directives, vec![Directive::FetchSignatureNow { mac: "aa:bb:cc:dd:ee:ff".into() }]);
    }

    #[test]
    fn eap_retransmit_soft_then_hard_boundary_fires_exactly_once_each() {
        let mut tracker = StationTracker::new();
        let mac = "aa:bb:cc:dd:ee:ff".to_string();
        let now = Instant::now();

        for i in 1..=6 {
            let directives = tracker.on_eap_retransmit(mac.clone(), now);
            match i {
                3 => assert_eq!(directives, vec![Directive::Deauthenticate { mac: mac.clone() }]),
                6 => assert_eq!(
                    directives,
                    vec![
                        Directive::PublishException { mac: mac.clone(), reason: "eap retransmit storm" },
                        Directive::SupervisorReset,
                    ]
                ),
                _ => assert!(directives.is_empty()),
            }
        }
    }

    #[test]
    fn retransmit_counter_ages_out_after_timeout() {
        let mut tracker = StationTracker::new();
        let mac = "aa:bb:cc:dd:ee:ff".to_string();
        let t0 = Instant::now();
        tracker.on_eap_retransmit(mac.clone(), t0);
        tracker.on_eap_retransmit(mac.clone(), t0);
        let later = t0 + RETRANSMIT_TIMEOUT + Duration::from_secs(1);
        tracker.on_eap_retransmit(mac.clone(), later);
        assert_eq!(tracker.retransmits.get(&mac).unwrap().count, 1, "stale count must reset, not accumulate");
    }

    #[test]
    fn update_signature_reports_change() {
        let mut tracker = StationTracker::new();
        assert!(tracker.update_signature("aa:bb:cc:dd:ee:ff", "sig1".into()));
        assert!(!tracker.update_signature("aa:bb:cc:dd:ee:ff", "sig1".into()));
        assert!(tracker.update_signature("aa:bb:cc:dd:ee:ff", "sig2".into()));
    }
}
