//! OS proxy settings per network service, driven through `networksetup`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ProxyCommandError;

pub const NETWORKSETUP: &str = "/usr/sbin/networksetup";

/// The three proxy slots every network service carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProxyKind {
    Web,
    SecureWeb,
    Socks,
}

impl ProxyKind {
    pub const ALL: [ProxyKind; 3] = [Self::Web, Self::SecureWeb, Self::Socks];

    fn get_verb(&self) -> &'static str {
        match self {
            Self::Web => "-getwebproxy",
            Self::SecureWeb => "-getsecurewebproxy",
            Self::Socks => "-getsocksfirewallproxy",
        }
    }

    fn set_verb(&self) -> &'static str {
        match self {
            Self::Web => "-setwebproxy",
            Self::SecureWeb => "-setsecurewebproxy",
            Self::Socks => "-setsocksfirewallproxy",
        }
    }

    fn state_verb(&self) -> &'static str {
        match self {
            Self::Web => "-setwebproxystate",
            Self::SecureWeb => "-setsecurewebproxystate",
            Self::Socks => "-setsocksfirewallproxystate",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySlot {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl ProxySlot {
    pub fn new(enabled: bool, host: impl Into<String>, port: u16) -> Self {
        Self {
            enabled,
            host: host.into(),
            port,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceProxy {
    pub interface: String,
    pub web: ProxySlot,
    pub secure_web: ProxySlot,
    pub socks: ProxySlot,
}

impl InterfaceProxy {
    pub fn slot(&self, kind: ProxyKind) -> &ProxySlot {
        match kind {
            ProxyKind::Web => &self.web,
            ProxyKind::SecureWeb => &self.secure_web,
            ProxyKind::Socks => &self.socks,
        }
    }
}

/// Proxy state of every service as it was before a session touched it.
/// Services that could not be read are listed in `failures` and are left
/// alone on restore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemProxySnapshot {
    pub interfaces: Vec<InterfaceProxy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<InterfaceFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceFailure {
    /// Service name, or empty when listing services failed.
    pub interface: String,
    pub error: String,
}

/// Outcome of one pass over all services.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyReport {
    pub updated: Vec<String>,
    pub failures: Vec<InterfaceFailure>,
}

impl ProxyReport {
    /// True when not a single service was changed.
    pub fn no_effect(&self) -> bool {
        self.updated.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        !self.updated.is_empty() && self.failures.is_empty()
    }

    pub fn summary(&self) -> String {
        if self.failures.is_empty() {
            return format!("{} service(s) updated", self.updated.len());
        }
        let failed: Vec<String> = self
            .failures
            .iter()
            .map(|f| {
                if f.interface.is_empty() {
                    f.error.clone()
                } else {
                    format!("{}: {}", f.interface, f.error)
                }
            })
            .collect();
        format!(
            "{} service(s) updated, {} failed ({})",
            self.updated.len(),
            self.failures.len(),
            failed.join("; ")
        )
    }

    fn fail(&mut self, interface: &str, err: ProxyCommandError) {
        warn!(interface, error = %err, "proxy command failed");
        self.failures.push(InterfaceFailure {
            interface: interface.to_string(),
            error: err.to_string(),
        });
    }
}

/// The OS proxy configuration tool. Every call is independent.
pub trait ProxyTool: Send + Sync {
    fn list_interfaces(&self) -> Result<Vec<String>, ProxyCommandError>;

    fn get(&self, interface: &str, kind: ProxyKind) -> Result<ProxySlot, ProxyCommandError>;

    /// Sets host and port of a slot; `None` blanks both.
    fn set(
        &self,
        interface: &str,
        kind: ProxyKind,
        server: Option<(&str, u16)>,
    ) -> Result<(), ProxyCommandError>;

    fn set_state(
        &self,
        interface: &str,
        kind: ProxyKind,
        enabled: bool,
    ) -> Result<(), ProxyCommandError>;
}

/// `networksetup` on macOS.
#[derive(Debug, Clone)]
pub struct Networksetup {
    bin: PathBuf,
}

impl Default for Networksetup {
    fn default() -> Self {
        Self {
            bin: PathBuf::from(NETWORKSETUP),
        }
    }
}

impl Networksetup {
    pub fn with_binary(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    fn run(&self, args: &[&str]) -> Result<String, ProxyCommandError> {
        let command = format!("networksetup {}", args.join(" "));
        debug!(%command, "running proxy command");
        let output = Command::new(&self.bin)
            .args(args)
            .output()
            .map_err(|err| ProxyCommandError {
                command: command.clone(),
                reason: err.to_string(),
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = match stderr.trim() {
                "" => format!("exit status {}", output.status),
                text => text.to_string(),
            };
            return Err(ProxyCommandError { command, reason });
        }
        // networksetup reports some failures on stdout with status 0.
        if let Some(line) = stdout.lines().find(|line| line.starts_with("** Error")) {
            return Err(ProxyCommandError {
                command,
                reason: line.trim_start_matches('*').trim().to_string(),
            });
        }
        Ok(stdout)
    }
}

impl ProxyTool for Networksetup {
    fn list_interfaces(&self) -> Result<Vec<String>, ProxyCommandError> {
        let output = self.run(&["-listallnetworkservices"])?;
        Ok(parse_services(&output))
    }

    fn get(&self, interface: &str, kind: ProxyKind) -> Result<ProxySlot, ProxyCommandError> {
        let output = self.run(&[kind.get_verb(), interface])?;
        parse_slot(&output).map_err(|reason| ProxyCommandError {
            command: format!("networksetup {} {interface}", kind.get_verb()),
            reason,
        })
    }

    fn set(
        &self,
        interface: &str,
        kind: ProxyKind,
        server: Option<(&str, u16)>,
    ) -> Result<(), ProxyCommandError> {
        let (host, port) = match server {
            Some((host, port)) => (host, port.to_string()),
            None => ("", String::new()),
        };
        self.run(&[kind.set_verb(), interface, host, &port]).map(drop)
    }

    fn set_state(
        &self,
        interface: &str,
        kind: ProxyKind,
        enabled: bool,
    ) -> Result<(), ProxyCommandError> {
        let state = if enabled { "on" } else { "off" };
        self.run(&[kind.state_verb(), interface, state]).map(drop)
    }
}

/// Service names from `-listallnetworkservices`. The header line and
/// disabled services (prefixed with `*`) are skipped.
fn parse_services(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("An asterisk"))
        .filter(|line| {
            let disabled = line.starts_with('*');
            if disabled {
                debug!(service = line.trim_start_matches('*'), "skipping disabled service");
            }
            !disabled
        })
        .map(str::to_string)
        .collect()
}

/// Parses the `Enabled/Server/Port` block printed by the get verbs.
fn parse_slot(output: &str) -> Result<ProxySlot, String> {
    let mut enabled = None;
    let mut slot = ProxySlot::default();
    for line in output.lines() {
        if line.starts_with("Authenticated Proxy Enabled") {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Enabled" => enabled = Some(value.eq_ignore_ascii_case("yes")),
            "Server" => slot.host = value.to_string(),
            "Port" => {
                slot.port = value
                    .parse()
                    .map_err(|_| format!("unexpected port {value:?}"))?
            }
            _ => {}
        }
    }
    slot.enabled = enabled.ok_or_else(|| "output has no Enabled line".to_string())?;
    Ok(slot)
}

/// Reads and writes OS proxy settings across all services.
#[derive(Clone)]
pub struct SystemProxyController {
    tool: Arc<dyn ProxyTool>,
}

impl Default for SystemProxyController {
    fn default() -> Self {
        Self::new(Arc::new(Networksetup::default()))
    }
}

impl SystemProxyController {
    pub fn new(tool: Arc<dyn ProxyTool>) -> Self {
        Self { tool }
    }

    fn interfaces(&self, failures: &mut Vec<InterfaceFailure>) -> Vec<String> {
        match self.tool.list_interfaces() {
            Ok(interfaces) => interfaces,
            Err(err) => {
                warn!(error = %err, "could not list network services");
                failures.push(InterfaceFailure {
                    interface: String::new(),
                    error: err.to_string(),
                });
                Vec::new()
            }
        }
    }

    /// Captures every service's current proxy slots.
    pub fn snapshot(&self) -> SystemProxySnapshot {
        let mut snapshot = SystemProxySnapshot::default();
        for interface in self.interfaces(&mut snapshot.failures) {
            let read = |kind| self.tool.get(&interface, kind);
            let captured = (|| {
                Ok::<_, ProxyCommandError>(InterfaceProxy {
                    interface: interface.clone(),
                    web: read(ProxyKind::Web)?,
                    secure_web: read(ProxyKind::SecureWeb)?,
                    socks: read(ProxyKind::Socks)?,
                })
            })();
            match captured {
                Ok(state) => snapshot.interfaces.push(state),
                Err(err) => {
                    warn!(%interface, error = %err, "could not read proxy settings");
                    snapshot.failures.push(InterfaceFailure {
                        interface,
                        error: err.to_string(),
                    });
                }
            }
        }
        debug!(
            captured = snapshot.interfaces.len(),
            failed = snapshot.failures.len(),
            "system proxy snapshot"
        );
        snapshot
    }

    /// Points the web and secure web slots at `host:http_port` and the
    /// SOCKS slot at `host:socks_port` on every service.
    pub fn apply(&self, host: &str, http_port: u16, socks_port: u16) -> ProxyReport {
        let mut report = ProxyReport::default();
        for interface in self.interfaces(&mut report.failures) {
            let result = [
                (ProxyKind::Web, http_port),
                (ProxyKind::SecureWeb, http_port),
                (ProxyKind::Socks, socks_port),
            ]
            .into_iter()
            .try_for_each(|(kind, port)| {
                self.tool.set(&interface, kind, Some((host, port)))?;
                self.tool.set_state(&interface, kind, true)
            });
            match result {
                Ok(()) => report.updated.push(interface),
                Err(err) => report.fail(&interface, err),
            }
        }
        info!(host, http_port, socks_port, result = %report.summary(), "system proxy applied");
        report
    }

    /// Writes the captured slots back. Services the snapshot could not
    /// read are blanked and disabled, since `apply` may still have set them.
    pub fn restore(&self, snapshot: &SystemProxySnapshot) -> ProxyReport {
        let mut report = ProxyReport::default();
        for state in &snapshot.interfaces {
            let interface = state.interface.as_str();
            let result = ProxyKind::ALL.into_iter().try_for_each(|kind| {
                let slot = state.slot(kind);
                let server = (!slot.host.is_empty()).then_some((slot.host.as_str(), slot.port));
                self.tool.set(interface, kind, server)
            });
            let result = result.and_then(|()| {
                ProxyKind::ALL
                    .into_iter()
                    .try_for_each(|kind| self.tool.set_state(interface, kind, state.slot(kind).enabled))
            });
            match result {
                Ok(()) => report.updated.push(interface.to_string()),
                Err(err) => report.fail(interface, err),
            }
        }
        let unread = snapshot
            .failures
            .iter()
            .map(|failure| failure.interface.as_str())
            .filter(|interface| !interface.is_empty());
        for interface in unread {
            match self.clear_interface(interface) {
                Ok(()) => report.updated.push(interface.to_string()),
                Err(err) => report.fail(interface, err),
            }
        }
        info!(result = %report.summary(), "system proxy restored");
        report
    }

    /// Blanks and disables every slot on every service.
    pub fn clear(&self) -> ProxyReport {
        let mut report = ProxyReport::default();
        for interface in self.interfaces(&mut report.failures) {
            match self.clear_interface(&interface) {
                Ok(()) => report.updated.push(interface),
                Err(err) => report.fail(&interface, err),
            }
        }
        info!(result = %report.summary(), "system proxy cleared");
        report
    }

    fn clear_interface(&self, interface: &str) -> Result<(), ProxyCommandError> {
        ProxyKind::ALL
            .into_iter()
            .try_for_each(|kind| self.tool.set(interface, kind, None))?;
        ProxyKind::ALL
            .into_iter()
            .try_for_each(|kind| self.tool.set_state(interface, kind, false))
    }
}

/// A `ProxyTool` that keeps proxy slots in memory. Used for dry runs and
/// to observe what a session does to the OS settings.
#[derive(Debug, Default)]
pub struct MemoryProxyTool {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    order: Vec<String>,
    slots: BTreeMap<(String, ProxyKind), ProxySlot>,
    broken: BTreeSet<String>,
    reads_broken: BTreeSet<String>,
    writes_broken: BTreeSet<(String, ProxyKind)>,
    list_broken: bool,
    writes: usize,
}

impl MemoryProxyTool {
    pub fn new<I, S>(interfaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tool = Self::default();
        {
            let mut state = tool.lock();
            state.order = interfaces.into_iter().map(Into::into).collect();
        }
        tool
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seeds a slot without counting it as a write.
    pub fn seed(&self, interface: &str, kind: ProxyKind, slot: ProxySlot) {
        self.lock().slots.insert((interface.to_string(), kind), slot);
    }

    /// Makes every command against `interface` fail.
    pub fn break_interface(&self, interface: &str) {
        self.lock().broken.insert(interface.to_string());
    }

    /// Makes reading any slot of `interface` fail. Writes still work.
    pub fn break_reads(&self, interface: &str) {
        self.lock().reads_broken.insert(interface.to_string());
    }

    /// Makes pointing the `kind` slot of `interface` at a server fail.
    /// Blanking the slot still works.
    pub fn break_writes(&self, interface: &str, kind: ProxyKind) {
        self.lock()
            .writes_broken
            .insert((interface.to_string(), kind));
    }

    /// Makes listing services fail.
    pub fn break_listing(&self) {
        self.lock().list_broken = true;
    }

    pub fn slot(&self, interface: &str, kind: ProxyKind) -> ProxySlot {
        self.lock()
            .slots
            .get(&(interface.to_string(), kind))
            .cloned()
            .unwrap_or_default()
    }

    /// Current state of every service, in the shape a snapshot has.
    pub fn current(&self) -> Vec<InterfaceProxy> {
        let order = self.lock().order.clone();
        order
            .into_iter()
            .map(|interface| InterfaceProxy {
                web: self.slot(&interface, ProxyKind::Web),
                secure_web: self.slot(&interface, ProxyKind::SecureWeb),
                socks: self.slot(&interface, ProxyKind::Socks),
                interface,
            })
            .collect()
    }

    /// Number of successful set commands.
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    fn check(state: &MemoryState, interface: &str, verb: &str) -> Result<(), ProxyCommandError> {
        if state.broken.contains(interface) || !state.order.iter().any(|i| i == interface) {
            return Err(ProxyCommandError {
                command: format!("{verb} {interface}"),
                reason: format!("{interface} is not a recognized network service"),
            });
        }
        Ok(())
    }
}

impl ProxyTool for MemoryProxyTool {
    fn list_interfaces(&self) -> Result<Vec<String>, ProxyCommandError> {
        let state = self.lock();
        if state.list_broken {
            return Err(ProxyCommandError {
                command: "-listallnetworkservices".to_string(),
                reason: "unavailable".to_string(),
            });
        }
        Ok(state.order.clone())
    }

    fn get(&self, interface: &str, kind: ProxyKind) -> Result<ProxySlot, ProxyCommandError> {
        let state = self.lock();
        Self::check(&state, interface, kind.get_verb())?;
        if state.reads_broken.contains(interface) {
            return Err(ProxyCommandError {
                command: format!("{} {interface}", kind.get_verb()),
                reason: "read failed".to_string(),
            });
        }
        Ok(state
            .slots
            .get(&(interface.to_string(), kind))
            .cloned()
            .unwrap_or_default())
    }

    fn set(
        &self,
        interface: &str,
        kind: ProxyKind,
        server: Option<(&str, u16)>,
    ) -> Result<(), ProxyCommandError> {
        let mut state = self.lock();
        Self::check(&state, interface, kind.set_verb())?;
        if server.is_some() && state.writes_broken.contains(&(interface.to_string(), kind)) {
            return Err(ProxyCommandError {
                command: format!("{} {interface}", kind.set_verb()),
                reason: "write failed".to_string(),
            });
        }
        let slot = state.slots.entry((interface.to_string(), kind)).or_default();
        match server {
            Some((host, port)) => {
                slot.host = host.to_string();
                slot.port = port;
            }
            None => {
                slot.host.clear();
                slot.port = 0;
            }
        }
        state.writes += 1;
        Ok(())
    }

    fn set_state(
        &self,
        interface: &str,
        kind: ProxyKind,
        enabled: bool,
    ) -> Result<(), ProxyCommandError> {
        let mut state = self.lock();
        Self::check(&state, interface, kind.state_verb())?;
        state
            .slots
            .entry((interface.to_string(), kind))
            .or_default()
            .enabled = enabled;
        state.writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool() -> Arc<MemoryProxyTool> {
        let tool = MemoryProxyTool::new(["Wi-Fi", "Ethernet"]);
        tool.seed("Wi-Fi", ProxyKind::Web, ProxySlot::new(true, "10.0.0.1", 3128));
        tool.seed("Ethernet", ProxyKind::Socks, ProxySlot::new(false, "10.0.0.2", 1080));
        Arc::new(tool)
    }

    #[test]
    fn test_parse_slot() {
        let raw = "Enabled: Yes\nServer: 127.0.0.1\nPort: 10808\nAuthenticated Proxy Enabled: 0\n";
        assert_eq!(parse_slot(raw).unwrap(), ProxySlot::new(true, "127.0.0.1", 10808));

        let raw = "Enabled: No\nServer: \nPort: 0\nAuthenticated Proxy Enabled: 0\n";
        assert_eq!(parse_slot(raw).unwrap(), ProxySlot::default());

        assert!(parse_slot("Enabled: Yes\nPort: abc\n").is_err());
        assert!(parse_slot("** Error: nope").is_err());
    }

    #[test]
    fn test_parse_services() {
        let raw = "An asterisk (*) denotes that a network service is disabled.\nWi-Fi\n*Thunderbolt Bridge\nUSB 10/100/1000 LAN\n\n";
        assert_eq!(parse_services(raw), vec!["Wi-Fi", "USB 10/100/1000 LAN"]);
    }

    #[test]
    fn test_apply_sets_every_slot() {
        let tool = tool();
        let controller = SystemProxyController::new(tool.clone());
        let report = controller.apply("127.0.0.1", 10808, 10809);
        assert!(report.is_complete());
        for interface in ["Wi-Fi", "Ethernet"] {
            assert_eq!(
                tool.slot(interface, ProxyKind::Web),
                ProxySlot::new(true, "127.0.0.1", 10808)
            );
            assert_eq!(
                tool.slot(interface, ProxyKind::SecureWeb),
                ProxySlot::new(true, "127.0.0.1", 10808)
            );
            assert_eq!(
                tool.slot(interface, ProxyKind::Socks),
                ProxySlot::new(true, "127.0.0.1", 10809)
            );
        }
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let tool = tool();
        let controller = SystemProxyController::new(tool.clone());
        let before = tool.current();

        controller.apply("127.0.0.1", 1, 2);
        let snapshot = controller.snapshot();
        controller.apply("127.0.0.1", 3, 4);
        controller.restore(&snapshot);
        assert_eq!(tool.current(), snapshot.interfaces);

        let original = SystemProxySnapshot {
            interfaces: before.clone(),
            failures: Vec::new(),
        };
        controller.apply("127.0.0.1", 3, 4);
        let first = controller.restore(&original);
        let second = controller.restore(&original);
        assert_eq!(first, second);
        assert_eq!(tool.current(), before);
    }

    #[test]
    fn test_apply_twice_is_stable() {
        let tool = tool();
        let controller = SystemProxyController::new(tool.clone());
        controller.apply("127.0.0.1", 10808, 10809);
        let once = tool.current();
        controller.apply("127.0.0.1", 10808, 10809);
        assert_eq!(tool.current(), once);
    }

    #[test]
    fn test_clear_blanks_everything() {
        let tool = tool();
        let controller = SystemProxyController::new(tool.clone());
        controller.apply("127.0.0.1", 10808, 10809);
        let report = controller.clear();
        assert_eq!(report.updated, vec!["Wi-Fi", "Ethernet"]);
        for state in tool.current() {
            for kind in ProxyKind::ALL {
                assert_eq!(state.slot(kind), &ProxySlot::default());
            }
        }
    }

    #[test]
    fn test_partial_failure_is_reported() {
        let tool = tool();
        tool.break_interface("Ethernet");
        let controller = SystemProxyController::new(tool.clone());

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.interfaces.len(), 1);
        assert_eq!(snapshot.failures[0].interface, "Ethernet");

        let report = controller.apply("127.0.0.1", 10808, 10809);
        assert_eq!(report.updated, vec!["Wi-Fi"]);
        assert_eq!(report.failures.len(), 1);
        assert!(!report.no_effect());
        assert!(!report.is_complete());
        assert!(report.summary().contains("Ethernet"));
    }

    #[test]
    fn test_restore_blanks_services_it_could_not_read() {
        let tool = tool();
        tool.break_reads("Ethernet");
        let controller = SystemProxyController::new(tool.clone());

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.failures[0].interface, "Ethernet");
        controller.apply("127.0.0.1", 10808, 10809);
        assert_eq!(
            tool.slot("Ethernet", ProxyKind::Web),
            ProxySlot::new(true, "127.0.0.1", 10808)
        );

        let report = controller.restore(&snapshot);
        assert_eq!(report.updated, vec!["Wi-Fi", "Ethernet"]);
        assert_eq!(
            tool.slot("Wi-Fi", ProxyKind::Web),
            ProxySlot::new(true, "10.0.0.1", 3128)
        );
        for kind in ProxyKind::ALL {
            assert_eq!(tool.slot("Ethernet", kind), ProxySlot::default());
        }
    }

    #[test]
    fn test_half_applied_service_counts_as_failed() {
        let tool = tool();
        tool.break_writes("Wi-Fi", ProxyKind::SecureWeb);
        let controller = SystemProxyController::new(tool.clone());

        let report = controller.apply("127.0.0.1", 10808, 10809);
        assert_eq!(report.updated, vec!["Ethernet"]);
        assert_eq!(report.failures[0].interface, "Wi-Fi");
        assert_eq!(
            tool.slot("Wi-Fi", ProxyKind::Web),
            ProxySlot::new(true, "127.0.0.1", 10808)
        );
    }

    #[test]
    fn test_networksetup_command_failures() {
        let echo = Networksetup::with_binary("/bin/echo");
        assert_eq!(echo.list_interfaces().unwrap(), vec!["-listallnetworkservices"]);
        let err = echo.get("Wi-Fi", ProxyKind::Web).unwrap_err();
        assert!(err.reason.contains("Enabled"));

        let missing = Networksetup::with_binary("/nonexistent/networksetup");
        assert!(missing.set_state("Wi-Fi", ProxyKind::Socks, false).is_err());
    }

    #[test]
    fn test_listing_failure_has_no_effect() {
        let tool = tool();
        tool.break_listing();
        let controller = SystemProxyController::new(tool.clone());
        let report = controller.apply("127.0.0.1", 10808, 10809);
        assert!(report.no_effect());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(tool.writes(), 0);
    }
}
