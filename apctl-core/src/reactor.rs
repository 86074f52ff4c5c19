//! Change reactor: turns config-tree watch notifications into the
//! minimum-impact response — reload, reset, a targeted in-memory update, or
//! a full process exit to force a rebuild on next launch.
//!
//! Classification is pure (slice-matching on the already-decomposed path
//! components the config client hands back), which keeps the dispatch table
//! unit-testable without a socket. Acting on the resulting directives
//! (actually calling reload/reset/exit, writing to the inventory) is the
//! caller's job.

use crate::config::{WatchEvent, WatchKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Exit { reason: &'static str },
    Reload,
    Reset,
    UpdateRingSubnet { ring: String },
    UpdateRingVaps { ring: String },
    UpdateNic { node: String, nic: String },
    NicRingChanged { node: String, nic: String },
    UpdateClientRing { mac: String },
    DisassociateClient { mac: String },
    LogQuarantine { mac: String },
    UpdateClientIpv4 { mac: String },
    ReevaluateForwarding { mac: String },
    DeauthenticateUser { user: String },
    RebuildFirewallRules,
    BlockIp { ip: String },
    UnblockIp { ip: String },
    UpdateWanConfig,
    RequestEvaluate,
}

/// Classifies one watch notification into zero or more reactor actions.
/// `self_node` is this node's id, used to filter `nodes/<id>/nics/*` paths
/// so only local NIC changes are acted on.
pub fn classify(event: &WatchEvent, self_node: &str) -> Vec<Action> {
    let path: Vec<&str> = event.path.iter().map(String::as_str).collect();

    match path.as_slice() {
        ["site_index"] => vec![Action::Exit { reason: "site_index changed" }],
        ["network", "base_address"] => vec![Action::Exit { reason: "base_address changed" }],

        ["rings", &ring, rest @ ..] => classify_ring_change(ring, rest, event.kind),

        ["network", "vap", ..] => vec![Action::Reload],

        ["nodes", &node, "nics", &nic, &field] if node == self_node => {
            classify_nic_change(node, nic, field, event.kind)
        }
        ["nodes", _other_node, "nics", ..] => Vec::new(),

        ["clients", &mac, "ring"] => {
            let mac = mac.to_string();
            let mut actions = vec![
                Action::UpdateClientRing { mac: mac.clone() },
                Action::Reload,
                Action::DisassociateClient { mac: mac.clone() },
            ];
            if event.value.as_ref().and_then(|v| v.as_str()) == Some("quarantine") {
                actions.push(Action::LogQuarantine { mac });
            }
            actions
        }
        ["clients", &mac, "ipv4"] => vec![
            Action::UpdateClientIpv4 { mac: mac.to_string() },
            Action::ReevaluateForwarding { mac: mac.to_string() },
        ],

        ["users", &user] if matches!(event.kind, WatchKind::Deleted | WatchKind::Expired) => {
            vec![Action::DeauthenticateUser { user: user.to_string() }]
        }

        ["firewall", "rules", ..] => vec![Action::RebuildFirewallRules],
        ["firewall", "blocked", &ip] => {
            if matches!(event.kind, WatchKind::Deleted | WatchKind::Expired) {
                vec![Action::UnblockIp { ip: ip.to_string() }]
            } else {
                vec![Action::BlockIp { ip: ip.to_string() }]
            }
        }

        ["network", "wan", "static", ..] | ["network", "dnsserver"] | ["network", "radius_auth_secret"] => {
            vec![Action::UpdateWanConfig, Action::Reload]
        }

        _ => Vec::new(),
    }
}

fn classify_ring_change(ring: &str, rest: &[&str], kind: WatchKind) -> Vec<Action> {
    match rest {
        ["subnet"] => vec![Action::Exit { reason: "ring subnet changed" }],
        ["vap" | "vaps"] => vec![
            Action::UpdateRingVaps { ring: ring.to_string() },
            Action::Reset,
        ],
        _ if kind == WatchKind::Deleted && rest.is_empty() => vec![Action::Exit { reason: "ring removed" }],
        _ => vec![Action::UpdateRingSubnet { ring: ring.to_string() }],
    }
}

fn classify_nic_change(node: &str, nic: &str, field: &str, kind: WatchKind) -> Vec<Action> {
    match field {
        "ring" => vec![Action::Exit { reason: "wired nic ring reassigned" }],
        "channel" | "width" | "band" | "state" => vec![
            Action::UpdateNic {
                node: node.to_string(),
                nic: nic.to_string(),
            },
            Action::RequestEvaluate,
            Action::Reset,
        ],
        _ if kind == WatchKind::Deleted => vec![Action::NicRingChanged {
            node: node.to_string(),
            nic: nic.to_string(),
        }],
        _ => Vec::new(),
    }
}
