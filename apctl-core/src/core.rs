//! Wires the rest of the crate into the single in-process value the
//! supervisor loop operates on. The source kept physDevices/rings/
//! virtualAPs/clients/hostapd/wconf/wan as module-level singletons; here
//! they are fields of an explicit, constructible, mockable `Core`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ConfigClient, PropertyResult, WatchEvent, WatchKind};
use crate::event_bus::EventPublisher;
use crate::model::{mac_from_str, Band, Client, FreqWidth, KeyMgmt, PhysicalDevice, Ring, VirtualAp, WifiState};
use crate::muxer::protocol::StationEvent;
use crate::muxer::{HostapdConn, ResetHandle};
use crate::plumber::firewall::{FirewallOps, RealFirewallOps};
use crate::plumber::netlink_ops::NetlinkOps;
use crate::plumber::Plumber;
use crate::reactor::{self, Action};
use crate::region::Region;
use crate::selector::{self, Selection};
use crate::station::StationTracker;
use crate::supervisor::Supervisor;

/// Path to the radio daemon binary and the directory it renders configs
/// into; kept as plain fields rather than a global so tests can point them
/// at a scratch directory.
pub struct CoreConfig {
    pub daemon_binary: PathBuf,
    pub config_dir: PathBuf,
    pub daemon_run_dir: String,
    pub self_node: String,
    pub node_index: u8,
    pub verbosity: u8,
}

/// Watch patterns registered against the configuration tree at startup,
/// covering every path the change reactor (§4.9) classifies.
const WATCH_PATTERNS: &[(WatchKind, &str)] = &[
    (WatchKind::Changed, r"^@/site_index$"),
    (WatchKind::Changed, r"^@/network/base_address$"),
    (WatchKind::Changed, r"^@/rings/.*$"),
    (WatchKind::Deleted, r"^@/rings/[^/]+$"),
    (WatchKind::Changed, r"^@/network/vap/.*$"),
    (WatchKind::Changed, r"^@/nodes/.*/nics/.*$"),
    (WatchKind::Deleted, r"^@/nodes/.*/nics/.*$"),
    (WatchKind::Changed, r"^@/clients/.*/ring$"),
    (WatchKind::Changed, r"^@/clients/.*/ipv4$"),
    (WatchKind::Deleted, r"^@/users/.*$"),
    (WatchKind::Expired, r"^@/users/.*$"),
    (WatchKind::Changed, r"^@/firewall/rules/.*$"),
    (WatchKind::Deleted, r"^@/firewall/rules/.*$"),
    (WatchKind::Changed, r"^@/firewall/blocked/.*$"),
    (WatchKind::Expired, r"^@/firewall/blocked/.*$"),
    (WatchKind::Changed, r"^@/network/wan/static/.*$"),
    (WatchKind::Changed, r"^@/network/dnsserver$"),
    (WatchKind::Changed, r"^@/network/radius_auth_secret$"),
];

pub struct Core<C: ConfigClient, N: NetlinkOps> {
    pub config: Arc<C>,
    pub events: EventPublisher<C>,
    pub plumber: Plumber<N>,
    pub supervisor: Arc<Supervisor>,
    pub firewall: Arc<dyn FirewallOps>,
    pub cfg: CoreConfig,

    pub devices: Mutex<Vec<PhysicalDevice>>,
    pub rings: Mutex<Vec<Ring>>,
    pub vaps: Mutex<Vec<VirtualAp>>,
    pub clients: Mutex<HashMap<[u8; 6], Client>>,
    pub blocked_ips: Mutex<BTreeSet<Ipv4Addr>>,
    pub selection: Mutex<Selection>,
    pub stations: Mutex<StationTracker>,
    pub conns: Mutex<HashMap<String, Arc<HostapdConn>>>,

    cancel: CancellationToken,
    running: AtomicBool,
    broken: AtomicBool,
}

struct SupervisorResetHandle(Arc<Supervisor>);

impl ResetHandle for SupervisorResetHandle {
    fn reset(&self) {
        if let Err(err) = self.0.reset() {
            error!(%err, "failed to signal radio daemon reset after muxer latency timeout");
        }
    }
}

fn pick_random_channel(candidates: &[u32]) -> u32 {
    use std::hash::{BuildHasher, Hasher};
    let seed = std::collections::hash_map::RandomState::new().build_hasher().finish();
    candidates[(seed as usize) % candidates.len()]
}

fn field(base: &[String], name: &str) -> Vec<String> {
    let mut path = base.to_vec();
    path.push(name.to_string());
    path
}

fn parse_cidr(s: &str) -> Option<(Ipv4Addr, u8)> {
    let (addr, prefix) = s.split_once('/')?;
    Some((addr.parse().ok()?, prefix.parse().ok()?))
}

fn parse_width(s: &str) -> Option<FreqWidth> {
    match s {
        "20" => Some(FreqWidth::W20),
        "40" => Some(FreqWidth::W40),
        "80" => Some(FreqWidth::W80),
        "160" => Some(FreqWidth::W160),
        _ => None,
    }
}

async fn read_json<C: ConfigClient, T: serde::de::DeserializeOwned>(config: &C, path: &[String]) -> Result<Option<T>, crate::config::Error> {
    match config.read(path).await? {
        PropertyResult::Present(value) => Ok(Some(serde_json::from_value(value)?)),
        PropertyResult::Missing => Ok(None),
    }
}

impl<C: ConfigClient + 'static, N: NetlinkOps + 'static> Core<C, N> {
    pub fn new(config: Arc<C>, netlink: N, cfg: CoreConfig) -> Self {
        Self {
            events: EventPublisher::new(config.clone()),
            config,
            plumber: Plumber::new(netlink),
            supervisor: Arc::new(Supervisor::new()),
            firewall: Arc::new(RealFirewallOps::new()),
            cfg,
            devices: Mutex::new(Vec::new()),
            rings: Mutex::new(Vec::new()),
            vaps: Mutex::new(Vec::new()),
            clients: Mutex::new(HashMap::new()),
            blocked_ips: Mutex::new(BTreeSet::new()),
            selection: Mutex::new(Selection { lo: None, hi: None }),
            stations: Mutex::new(StationTracker::new()),
            conns: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            running: AtomicBool::new(true),
            broken: AtomicBool::new(false),
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.supervisor.stop();
        self.cancel.cancel();
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// Registers the watch patterns the change reactor classifies and spawns
    /// one task per watch that feeds notifications into `apply_watch_event`.
    pub async fn watch_config_tree(self: &Arc<Self>) -> Result<(), crate::config::Error> {
        for (kind, pattern) in WATCH_PATTERNS {
            let mut rx = self.config.watch(*kind, pattern).await?;
            let this = self.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    this.apply_watch_event(&event).await;
                }
            });
        }
        Ok(())
    }

    /// Loads the fixed ring set from the configuration tree, replacing
    /// `self.rings` wholesale. A ring with no `vlan` property configured at
    /// this site is treated as absent.
    pub async fn refresh_rings(&self) -> Result<(), crate::config::Error> {
        let mut rings = Vec::new();
        for name in crate::model::RING_NAMES {
            if let Some(ring) = self.load_ring(name).await? {
                rings.push(ring);
            }
        }
        *self.rings.lock().await = rings;
        Ok(())
    }

    async fn load_ring(&self, name: &str) -> Result<Option<Ring>, crate::config::Error> {
        let base = vec!["rings".to_string(), name.to_string()];
        let vlan_id: Option<i32> = read_json(&*self.config, &field(&base, "vlan")).await?;
        let Some(vlan_id) = vlan_id else {
            return Ok(None);
        };
        let subnet_str: Option<String> = read_json(&*self.config, &field(&base, "subnet")).await?;
        let subnet = subnet_str.as_deref().and_then(parse_cidr).unwrap_or((Ipv4Addr::UNSPECIFIED, 32));
        let vaps: Vec<String> = read_json(&*self.config, &field(&base, "vap")).await?.unwrap_or_default();
        let lease_duration_secs: u64 = read_json(&*self.config, &field(&base, "lease_duration")).await?.unwrap_or(3600);
        Ok(Some(Ring {
            name: name.to_string(),
            vlan_id,
            bridge: Ring::bridge_name(vlan_id),
            subnet,
            vaps,
            lease_duration_secs,
        }))
    }

    /// Loads every VAP referenced by the current ring set from the
    /// configuration tree, replacing `self.vaps` wholesale.
    pub async fn refresh_vaps(&self) -> Result<(), crate::config::Error> {
        let mut rings_for_vap: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for ring in self.rings.lock().await.iter() {
            for vap in &ring.vaps {
                rings_for_vap.entry(vap.clone()).or_default().push(ring.name.clone());
            }
        }

        let mut vaps = Vec::new();
        for (name, rings) in rings_for_vap {
            if let Some(vap) = self.load_vap(&name, rings).await? {
                vaps.push(vap);
            }
        }
        *self.vaps.lock().await = vaps;
        Ok(())
    }

    async fn load_vap(&self, name: &str, rings: Vec<String>) -> Result<Option<VirtualAp>, crate::config::Error> {
        let base = vec!["network".to_string(), "vap".to_string(), name.to_string()];
        let ssid: Option<String> = read_json(&*self.config, &field(&base, "ssid")).await?;
        let Some(ssid) = ssid else {
            return Ok(None);
        };
        let tag_5ghz: bool = read_json(&*self.config, &field(&base, "5ghz")).await?.unwrap_or(false);
        let key_mgmt_str: String = read_json(&*self.config, &field(&base, "keymgmt")).await?.unwrap_or_else(|| "wpa-psk".to_string());
        let key_mgmt = if key_mgmt_str == "eap" { KeyMgmt::WpaEap } else { KeyMgmt::WpaPsk };
        let passphrase: Option<String> = read_json(&*self.config, &field(&base, "passphrase")).await?;
        let default_ring: String = read_json(&*self.config, &field(&base, "default_ring")).await?.unwrap_or_else(|| "standard".to_string());
        let disabled: bool = read_json(&*self.config, &field(&base, "disabled")).await?.unwrap_or(false);
        Ok(Some(VirtualAp {
            name: name.to_string(),
            ssid,
            tag_5ghz,
            key_mgmt,
            passphrase,
            default_ring,
            rings,
            disabled,
        }))
    }

    async fn reload_nic_config(&self, nic: &str) -> Result<(), crate::config::Error> {
        let base = vec!["nodes".to_string(), self.cfg.self_node.clone(), "nics".to_string(), nic.to_string()];
        let channel: Option<u32> = read_json(&*self.config, &field(&base, "channel")).await?;
        let band_str: Option<String> = read_json(&*self.config, &field(&base, "band")).await?;
        let width_str: Option<String> = read_json(&*self.config, &field(&base, "width")).await?;

        let mut devices = self.devices.lock().await;
        if let Some(device) = devices.iter_mut().find(|d| d.name == nic) {
            if let Some(wifi) = device.wifi.as_mut() {
                wifi.configured.channel = channel;
                wifi.configured.band = band_str.as_deref().map(|b| if b == "hi" { Band::HiBand } else { Band::LoBand });
                wifi.configured.width = width_str.as_deref().and_then(parse_width);
            }
        }
        Ok(())
    }

    async fn reload_client_ring(&self, mac: &str) -> Result<(), crate::config::Error> {
        let path = vec!["clients".to_string(), mac.to_string(), "ring".to_string()];
        let ring: Option<String> = read_json(&*self.config, &path).await?;
        if let Some(key) = mac_from_str(mac) {
            let mut clients = self.clients.lock().await;
            let client = clients.entry(key).or_insert_with(|| Client { mac: key, ..Default::default() });
            client.ring = ring;
        }
        Ok(())
    }

    async fn reload_client_ipv4(&self, mac: &str) -> Result<(), crate::config::Error> {
        let path = vec!["clients".to_string(), mac.to_string(), "ipv4".to_string()];
        let ipv4: Option<String> = read_json(&*self.config, &path).await?;
        if let Some(key) = mac_from_str(mac) {
            let mut clients = self.clients.lock().await;
            let client = clients.entry(key).or_insert_with(|| Client { mac: key, ..Default::default() });
            client.ipv4 = ipv4.as_deref().and_then(|s| s.parse().ok());
        }
        Ok(())
    }

    async fn rebuild_firewall(&self) {
        let ring_vlans: Vec<(String, u16)> = self
            .rings
            .lock()
            .await
            .iter()
            .filter(|r| r.is_bridged())
            .map(|r| (r.name.clone(), r.vlan_id as u16))
            .collect();
        let blocked: Vec<Ipv4Addr> = self.blocked_ips.lock().await.iter().copied().collect();
        if let Err(err) = self.firewall.apply_ring_rules(&ring_vlans, &blocked) {
            warn!(%err, "failed to rebuild firewall rules");
        }
    }

    /// Re-scores the current device set and swaps in a new selection if it
    /// improves on (or the caller forces past) the current one, then picks a
    /// channel/width for each newly-selected device and writes it back into
    /// the device's active config.
    pub async fn select_wifi_devices(&self, force: bool) {
        let mut devices = self.devices.lock().await;
        let mut selection = self.selection.lock().await;
        let new_selection = selector::select(&devices, &selection, force);

        for (band, idx) in [(Band::LoBand, new_selection.lo), (Band::HiBand, new_selection.hi)] {
            let Some(idx) = idx else { continue };
            let choice = selector::choose_channel(&devices[idx], band, Region::Us, pick_random_channel);
            if let Some(wifi) = devices[idx].wifi.as_mut() {
                match choice {
                    Some(choice) => {
                        wifi.active.band = Some(band);
                        wifi.active.channel = Some(choice.channel);
                        wifi.active.width = Some(choice.width);
                        wifi.state = WifiState::Ok;
                    }
                    None => wifi.state = WifiState::NoChan,
                }
            }
        }

        *selection = new_selection;
    }

    /// Applies the actions the change reactor derives from one watch
    /// notification. Kept separate from `classify` so the pure dispatch
    /// table stays unit-testable without a `Core`.
    pub async fn apply_watch_event(&self, event: &WatchEvent) {
        for action in reactor::classify(event, &self.cfg.self_node) {
            self.apply_action(action).await;
        }
    }

    async fn apply_action(&self, action: Action) {
        match action {
            Action::Exit { reason } => {
                warn!(reason, "exiting for full rebuild");
                self.stop();
            }
            Action::Reload => {
                if let Err(err) = self.supervisor.reload() {
                    warn!(%err, "reload failed");
                }
            }
            Action::Reset => {
                if let Err(err) = self.supervisor.reset() {
                    warn!(%err, "reset failed");
                }
            }
            Action::RequestEvaluate => self.supervisor.request_evaluate(),
            Action::UpdateRingSubnet { ring } => self.reload_ring(&ring, "ring config changed").await,
            Action::UpdateRingVaps { ring } => {
                self.reload_ring(&ring, "ring vap list changed").await;
                if let Err(err) = self.refresh_vaps().await {
                    warn!(%err, "failed to reload vap set after ring vap change");
                }
            }
            Action::UpdateNic { node, nic } => {
                if let Err(err) = self.reload_nic_config(&nic).await {
                    warn!(node, nic, %err, "failed to reload nic config");
                }
            }
            Action::NicRingChanged { node, nic } => {
                info!(node, nic, "nic deleted from tree, clearing local ring assignment");
                let mut devices = self.devices.lock().await;
                if let Some(device) = devices.iter_mut().find(|d| d.name == nic) {
                    device.ring = None;
                }
            }
            Action::UpdateClientRing { mac } => {
                if let Err(err) = self.reload_client_ring(&mac).await {
                    warn!(mac, %err, "failed to reload client ring");
                }
            }
            Action::DisassociateClient { mac } => self.disassociate(&mac).await,
            Action::LogQuarantine { mac } => self.events.exception(vec!["clients".into(), mac], "moved to quarantine").await,
            Action::UpdateClientIpv4 { mac } => {
                if let Err(err) = self.reload_client_ipv4(&mac).await {
                    warn!(mac, %err, "failed to reload client ipv4");
                }
            }
            Action::ReevaluateForwarding { mac } => {
                info!(mac, "reevaluating forwarding rules");
                self.rebuild_firewall().await;
            }
            Action::DeauthenticateUser { user } => self.deauthenticate_user(&user).await,
            Action::RebuildFirewallRules => self.rebuild_firewall().await,
            Action::BlockIp { ip } => match ip.parse::<Ipv4Addr>() {
                Ok(addr) => {
                    self.blocked_ips.lock().await.insert(addr);
                    self.rebuild_firewall().await;
                }
                Err(_) => warn!(ip, "ignoring non-ipv4 block request"),
            },
            Action::UnblockIp { ip } => {
                if let Ok(addr) = ip.parse::<Ipv4Addr>() {
                    self.blocked_ips.lock().await.remove(&addr);
                    self.rebuild_firewall().await;
                }
            }
            Action::UpdateWanConfig => info!("wan config changed"),
        }
    }

    async fn reload_ring(&self, ring: &str, log_msg: &'static str) {
        match self.load_ring(ring).await {
            Ok(Some(updated)) => {
                info!(ring, log_msg);
                let mut rings = self.rings.lock().await;
                if let Some(slot) = rings.iter_mut().find(|r| r.name == ring) {
                    *slot = updated;
                } else {
                    rings.push(updated);
                }
            }
            Ok(None) => self.rings.lock().await.retain(|r| r.name != ring),
            Err(err) => warn!(ring, %err, "failed to reload ring config"),
        }
    }

    async fn disassociate(&self, mac: &str) {
        let conns = self.conns.lock().await;
        for conn in conns.values() {
            let _ = conn.submit(format!("DEAUTHENTICATE {mac}")).await;
        }
    }

    async fn deauthenticate_user(&self, user: &str) {
        warn!(user, "deauthenticating all sessions for deleted/expired user");
        let macs = self.stations.lock().await.known_macs();
        for mac in macs {
            self.disassociate(&mac).await;
        }
    }

    /// Runs one control-socket connection's reader loop, feeding parsed
    /// station events into the shared tracker and dispatching the
    /// directives it returns.
    pub async fn run_muxer_connection(self: &Arc<Self>, vap_name: String, conn: Arc<HostapdConn>) {
        let (tx, mut rx) = mpsc::channel::<StationEvent>(64);
        self.conns.lock().await.insert(vap_name.clone(), conn.clone());

        let reset_handle: Arc<dyn ResetHandle> = Arc::new(SupervisorResetHandle(self.supervisor.clone()));
        let socket = match conn.attach().await {
            Ok(s) => s,
            Err(err) => {
                error!(vap = %vap_name, %err, "failed to attach to radio daemon control socket");
                return;
            }
        };

        let this = self.clone();
        let drain_vap = vap_name.clone();
        let drain = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let directives = this.stations.lock().await.handle_event(event, std::time::Instant::now());
                this.dispatch_station_directives(&drain_vap, directives).await;
            }
        });

        conn.run(socket, tx, reset_handle, self.cancel.clone()).await;
        drain.abort();
        self.conns.lock().await.remove(&vap_name);
    }

    async fn dispatch_station_directives(self: &Arc<Self>, vap_name: &str, directives: Vec<crate::station::Directive>) {
        use crate::station::Directive;
        for directive in directives {
            match directive {
                Directive::PublishConnect { mac } => self.events.entity(vec!["clients".into(), mac, "connected".into()], serde_json::json!(true)).await,
                Directive::PublishDisconnect { mac } => self.events.entity(vec!["clients".into(), mac, "connected".into()], serde_json::json!(false)).await,
                Directive::ScheduleSignatureFetch { mac, delay } => {
                    if let Some(conn) = self.conns.lock().await.get(vap_name).cloned() {
                        let this = self.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            this.fetch_and_record_signature(&mac, &conn).await;
                        });
                    }
                }
                Directive::FetchSignatureNow { mac } => {
                    if let Some(conn) = self.conns.lock().await.get(vap_name).cloned() {
                        self.fetch_and_record_signature(&mac, &conn).await;
                    }
                }
                Directive::PublishException { mac, reason } => self.events.exception(vec!["clients".into(), mac], reason).await,
                Directive::Deauthenticate { mac } => self.disassociate(&mac).await,
                Directive::SupervisorReset => {
                    if let Err(err) = self.supervisor.reset() {
                        warn!(%err, "supervisor reset failed after eap retransmit storm");
                    }
                }
            }
        }
    }

    /// Fetches a station's signature via the control socket it is actually
    /// associated with and records it, publishing an update if it changed.
    async fn fetch_and_record_signature(&self, mac: &str, conn: &Arc<HostapdConn>) {
        match conn.submit(format!("SIGNATURE {mac}")).await {
            Ok(signature) => {
                let changed = self.stations.lock().await.update_signature(mac, signature.clone());
                if changed {
                    self.events
                        .update(vec!["clients".into(), mac.to_string(), "signature".into()], serde_json::json!(signature))
                        .await;
                }
            }
            Err(err) => warn!(mac, %err, "signature fetch failed"),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Resolves the WAN device's live IPv4 address, or `UNSPECIFIED` if no
    /// device is currently assigned to the wan ring.
    async fn wan_address(&self) -> Ipv4Addr {
        let wan_name = self
            .devices
            .lock()
            .await
            .iter()
            .find(|d| d.ring.as_deref() == Some("wan"))
            .map(|d| d.name.clone());
        match wan_name {
            Some(name) => self.plumber.device_ipv4(&name).await.ok().flatten().unwrap_or(Ipv4Addr::UNSPECIFIED),
            None => Ipv4Addr::UNSPECIFIED,
        }
    }

    /// Main supervisor loop: select devices, render configs, launch the
    /// radio daemon, wait for it to exit, and repeat until stopped.
    ///
    /// A run that dies `DEFAULT_RESTART_THRESHOLD` times inside
    /// `DEFAULT_RESTART_WINDOW` suspends re-launch until a config change
    /// lifts it via [`Supervisor::clear_restart_history`].
    pub async fn run(self: &Arc<Self>) {
        while self.is_running() {
            self.select_wifi_devices(false).await;

            if self.supervisor.is_evaluation_suspended() {
                warn!("radio daemon restarting too quickly, evaluation suspended");
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(crate::supervisor::DEFAULT_RESTART_WINDOW) => continue,
                }
            }

            let config_paths = match self.render_configs().await {
                Ok(paths) => paths,
                Err(err) => {
                    error!(%err, "failed to render radio daemon config, retrying shortly");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };

            let mut child = match crate::supervisor::launch_radio_daemon(&self.cfg.daemon_binary, &config_paths, self.cfg.verbosity).await {
                Ok(child) => child,
                Err(err) => {
                    error!(%err, "failed to launch radio daemon");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };

            self.supervisor.set_child_pid(child.id().map(|p| p as i32));
            let suspended = self.supervisor.record_start(now_secs());
            if suspended {
                self.events.exception(vec!["daemon".into()], "restarting too quickly").await;
            }

            let wan_addr = self.wan_address().await;
            if let Err(err) = self.plumber.reset_interfaces(&self.rings.lock().await, self.cfg.node_index, wan_addr).await {
                match err {
                    crate::plumber::Error::WanSubnetOverlap { .. } => {
                        error!(%err, "wan subnet overlap detected, marking process broken and exiting");
                        self.broken.store(true, Ordering::SeqCst);
                        let _ = self.supervisor.halt(&mut child).await;
                        self.stop();
                        break;
                    }
                    other => warn!(err = %other, "interface reset failed after launch"),
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = self.supervisor.halt(&mut child).await;
                    break;
                }
                status = child.wait() => {
                    match status {
                        Ok(status) => info!(?status, signal = ?crate::supervisor::exit_was_signal(status), "radio daemon exited"),
                        Err(err) => error!(%err, "failed to wait on radio daemon"),
                    }
                }
            }
            self.supervisor.set_child_pid(None);
        }
    }

    /// Renders the active device set's config files and VAP sidecar files
    /// into the run directory, returning the `.conf` paths the daemon
    /// should be launched with.
    async fn render_configs(&self) -> Result<Vec<PathBuf>, std::io::Error> {
        let devices = self.devices.lock().await;
        let selection = self.selection.lock().await;
        let vaps = self.vaps.lock().await;
        let rings = self.rings.lock().await;
        let clients = self.clients.lock().await;
        let mut paths = Vec::new();

        for (band, idx) in [(Band::LoBand, selection.lo), (Band::HiBand, selection.hi)] {
            let Some(idx) = idx else { continue };
            let device = &devices[idx];

            // A VAP tagged 5ghz is rendered only on the HiBand device.
            let device_vaps: Vec<&VirtualAp> = vaps.iter().filter(|v| !v.disabled && v.tag_5ghz == (band == Band::HiBand)).collect();

            let rendered = crate::supervisor::render::render_device_config(device, &device_vaps);
            let path = self.cfg.config_dir.join(format!("{}.conf", device.name));
            tokio::fs::write(&path, rendered).await?;
            paths.push(path);

            let ring_vlans: Vec<(String, i32)> = rings.iter().map(|r| (r.name.clone(), r.vlan_id)).collect();
            let vlan_rendered = crate::supervisor::render::render_vlan_file(&device.name, &ring_vlans);
            tokio::fs::write(self.cfg.config_dir.join(format!("{}.vlan", device.name)), vlan_rendered).await?;

            let client_rings: BTreeMap<[u8; 6], i32> = clients
                .values()
                .filter_map(|c| {
                    let ring_name = c.ring.as_deref()?;
                    let vlan_id = rings.iter().find(|r| r.name == ring_name)?.vlan_id;
                    Some((c.mac, vlan_id))
                })
                .collect();
            let macs_rendered = crate::supervisor::render::render_macs_file(&client_rings);
            tokio::fs::write(self.cfg.config_dir.join(format!("{}.macs", device.name)), macs_rendered).await?;
        }
        Ok(paths)
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Op;
    use crate::model::{ActiveConfig, DeviceKind, HtCaps, WifiInfo};
    use crate::plumber::netlink_ops::mock::MockNetlinkOps;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::BTreeSet;

    struct NullConfigClient;

    #[async_trait]
    impl ConfigClient for NullConfigClient {
        async fn read(&self, _path: &[String]) -> Result<PropertyResult, crate::config::Error> {
            Ok(PropertyResult::Missing)
        }
        async fn create(&self, _path: &[String], _value: Value) -> Result<(), crate::config::Error> {
            Ok(())
        }
        async fn set(&self, _path: &[String], _value: Value) -> Result<(), crate::config::Error> {
            Ok(())
        }
        async fn delete(&self, _path: &[String]) -> Result<(), crate::config::Error> {
            Ok(())
        }
        async fn execute(&self, _ops: Vec<Op>) -> Result<(), crate::config::Error> {
            Ok(())
        }
        async fn watch(&self, _kind: WatchKind, _pattern: &str) -> Result<mpsc::Receiver<WatchEvent>, crate::config::Error> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    fn test_core() -> Core<NullConfigClient, MockNetlinkOps> {
        Core::new(
            Arc::new(NullConfigClient),
            MockNetlinkOps::new(),
            CoreConfig {
                daemon_binary: PathBuf::from("/usr/sbin/hostapd"),
                config_dir: PathBuf::from("/tmp"),
                daemon_run_dir: "/var/run/hostapd".into(),
                self_node: "node1".into(),
                node_index: 1,
                verbosity: 0,
            },
        )
    }

    fn lo_band_device(name: &str) -> PhysicalDevice {
        PhysicalDevice {
            name: name.into(),
            mac_addr: [0x00, 0x11, 0x22, 0x33, 0x44, 0x01],
            kind: DeviceKind::Wireless,
            ring: None,
            disabled: false,
            wifi: Some(WifiInfo {
                support_vlans: true,
                interfaces: 1,
                channels: BTreeSet::from([1, 6, 11]),
                freq_widths: BTreeSet::from([FreqWidth::W20]),
                bands: BTreeSet::from([Band::LoBand]),
                modes: BTreeSet::new(),
                ht_caps: HtCaps::default(),
                configured: ActiveConfig::default(),
                active: ActiveConfig::default(),
                state: WifiState::Ok,
            }),
        }
    }

    fn hi_band_device(name: &str) -> PhysicalDevice {
        PhysicalDevice {
            name: name.into(),
            mac_addr: [0x00, 0x11, 0x22, 0x33, 0x44, 0xF0],
            kind: DeviceKind::Wireless,
            ring: None,
            disabled: false,
            wifi: Some(WifiInfo {
                support_vlans: true,
                interfaces: 4,
                channels: BTreeSet::from([36, 40, 44, 48]),
                freq_widths: BTreeSet::from([FreqWidth::W20, FreqWidth::W40]),
                bands: BTreeSet::from([Band::HiBand]),
                modes: BTreeSet::new(),
                ht_caps: HtCaps::default(),
                configured: ActiveConfig::default(),
                active: ActiveConfig::default(),
                state: WifiState::Ok,
            }),
        }
    }

    #[tokio::test]
    async fn exit_action_stops_the_core() {
        let core = test_core();
        assert!(core.is_running());
        core.apply_action(Action::Exit { reason: "test" }).await;
        assert!(!core.is_running());
    }

    #[tokio::test]
    async fn watch_event_for_site_index_stops_the_core() {
        let core = test_core();
        let event = WatchEvent {
            kind: WatchKind::Changed,
            path: vec!["site_index".into()],
            value: None,
            expiration: None,
        };
        core.apply_watch_event(&event).await;
        assert!(!core.is_running());
    }

    /// Drives `Core` through the same pipeline `run()` uses each iteration —
    /// selection, channel assignment, and config rendering — with populated
    /// devices/vaps/rings, to catch wiring gaps the pure unit tests (which
    /// call `selector`/`reactor` directly) cannot see.
    #[tokio::test]
    async fn selection_and_render_pipeline_produces_populated_configs() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = test_core();
        core.cfg.config_dir = dir.path().to_path_buf();

        *core.devices.lock().await = vec![lo_band_device("wlan0"), hi_band_device("wlan1")];
        *core.rings.lock().await = vec![Ring {
            name: "standard".into(),
            vlan_id: 10,
            bridge: Ring::bridge_name(10),
            subnet: (Ipv4Addr::new(192, 168, 10, 0), 24),
            vaps: vec!["main".into()],
            lease_duration_secs: 3600,
        }];
        *core.vaps.lock().await = vec![VirtualAp {
            name: "main".into(),
            ssid: "home-network".into(),
            tag_5ghz: false,
            key_mgmt: KeyMgmt::WpaPsk,
            passphrase: Some("hunter22".into()),
            default_ring: "standard".into(),
            rings: vec!["standard".into()],
            disabled: false,
        }];

        core.select_wifi_devices(false).await;
        let selection = core.selection.lock().await.clone();
        assert_eq!(selection.lo, Some(0));
        assert_eq!(selection.hi, Some(1));

        {
            let devices = core.devices.lock().await;
            assert!(devices[0].wifi.as_ref().unwrap().active.channel.is_some(), "lo-band device must get a channel");
            assert!(devices[1].wifi.as_ref().unwrap().active.channel.is_some(), "hi-band device must get a channel");
        }

        let paths = core.render_configs().await.unwrap();
        assert_eq!(paths.len(), 2, "one conf file per selected device");

        let lo_conf = tokio::fs::read_to_string(dir.path().join("wlan0.conf")).await.unwrap();
        assert!(lo_conf.contains("ssid=home-network"), "untagged vap must render on the lo-band device");

        let hi_conf = tokio::fs::read_to_string(dir.path().join("wlan1.conf")).await.unwrap();
        assert!(!hi_conf.contains("ssid=home-network"), "5ghz-only vap filter must exclude it from hi-band here");

        assert!(dir.path().join("wlan0.vlan").exists());
        assert!(dir.path().join("wlan0.macs").exists());
    }

    #[tokio::test]
    async fn rebuild_firewall_rules_action_applies_ring_vlans() {
        let mut core = test_core();
        let mock_firewall = crate::plumber::firewall::mock::MockFirewallOps::default();
        core.firewall = Arc::new(mock_firewall.clone());

        *core.rings.lock().await = vec![Ring {
            name: "guest".into(),
            vlan_id: 20,
            bridge: Ring::bridge_name(20),
            subnet: (Ipv4Addr::new(192, 168, 20, 0), 24),
            vaps: vec![],
            lease_duration_secs: 3600,
        }];
        core.blocked_ips.lock().await.insert(Ipv4Addr::new(203, 0, 113, 9));

        core.apply_action(Action::RebuildFirewallRules).await;

        let applied = mock_firewall.applied.lock().unwrap();
        assert_eq!(applied.last().unwrap(), &vec![("guest".to_string(), 20u16)]);
        let blocked = mock_firewall.blocked.lock().unwrap();
        assert_eq!(blocked.last().unwrap(), &vec![Ipv4Addr::new(203, 0, 113, 9)]);
    }

    #[tokio::test]
    async fn block_ip_action_adds_to_blocked_set_and_rebuilds() {
        let mut core = test_core();
        let mock_firewall = crate::plumber::firewall::mock::MockFirewallOps::default();
        core.firewall = Arc::new(mock_firewall.clone());

        core.apply_action(Action::BlockIp { ip: "198.51.100.7".into() }).await;

        assert!(core.blocked_ips.lock().await.contains(&Ipv4Addr::new(198, 51, 100, 7)));
        assert_eq!(mock_firewall.applied.lock().unwrap().len(), 1);
    }
}
