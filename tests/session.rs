use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};

use raybar_lib::settings::{AppPaths, AppSettings};
use raybar_lib::system_proxy::{MemoryProxyTool, ProxyKind, ProxySlot};
use raybar_lib::{
    build_json, Engine, ProcessSupervisor, Session, SessionEvent, SessionStatus, SupervisorState,
    SystemProxyController,
};

const LINK: &str = "vless://2b1c3f7e-1111-2222-3333-444455556666@node.example:443?encryption=none&type=grpc&serviceName=gun&security=tls&sni=node.example&alpn=h2#Tokyo%201";

fn home() -> (tempfile::TempDir, AppPaths) {
    let dir = tempfile::tempdir().unwrap();
    let paths = AppPaths::resolve(Some(dir.path().to_path_buf())).unwrap();
    paths.ensure().unwrap();
    (dir, paths)
}

#[test]
fn test_settings_to_document() {
    let (_dir, paths) = home();
    let mut settings = AppSettings::load_or_init(&paths).unwrap();
    settings.add_link(LINK).unwrap();
    settings.use_node("Tokyo 1").unwrap();
    settings.inbound.allow_lan = false;
    settings.dns.enable_fake_dns = false;
    settings.routing.rules.retain(|entry| entry.rule.tag == "Last Proxy");
    settings.save(&paths).unwrap();

    let reloaded = AppSettings::load_or_init(&paths).unwrap();
    assert_eq!(reloaded, settings);

    let json = build_json(&reloaded.session_config(&paths)).unwrap();
    assert_eq!(json, build_json(&reloaded.session_config(&paths)).unwrap());

    let doc: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(doc["inbounds"][0]["listen"], "127.0.0.1");
    assert_eq!(doc["outbounds"][0]["streamSettings"]["network"], "grpc");
    assert_eq!(doc["outbounds"][0]["streamSettings"]["grpcSettings"]["serviceName"], "gun");
    let tags: Vec<&str> = doc["outbounds"]
        .as_array()
        .unwrap()
        .iter()
        .map(|o| o["tag"].as_str().unwrap())
        .collect();
    assert_eq!(tags, vec!["proxy", "direct", "reject", "fragment"]);
    assert_eq!(doc["routing"]["rules"].as_array().unwrap().len(), 3);
    assert_eq!(
        doc["log"]["access"],
        "none",
        "access log is off by default and must point at the sentinel"
    );
    assert!(doc.get("stats").is_none());
}

#[cfg(unix)]
fn fake_engine(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("xray");
    fs::write(
        &path,
        "#!/bin/sh\n\
         if [ \"$1\" = version ]; then echo 'Xray 1.8.24 (Xray, Penetrates Everything.) 1f2b3c4 (go1.22.5 darwin/arm64)'; exit 0; fi\n\
         [ -f \"$3\" ] || exit 3\n\
         echo \"config $3\"\n\
         if [ -f \"$3.crash\" ]; then exit 9; fi\n\
         exec sleep 30\n",
    )
    .unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn wait_for<F>(events: &Receiver<SessionEvent>, mut matches: F) -> Option<SessionEvent>
where
    F: FnMut(&SessionEvent) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if let Ok(event) = events.recv_timeout(Duration::from_millis(100)) {
            if matches(&event) {
                return Some(event);
            }
        }
    }
    None
}

/// Drives a real process through start, stop and an unexpected exit.
/// Kept as one test so no other thread forks while the script is written.
#[cfg(unix)]
#[test]
fn test_session_with_real_engine() {
    let (dir, paths) = home();
    let engine_path = fake_engine(dir.path());
    assert_eq!(
        raybar_lib::supervisor::engine_version(&engine_path).unwrap(),
        "v1.8.24"
    );

    let mut settings = AppSettings::default();
    settings.engine_path = Some(engine_path);
    settings.add_link(LINK).unwrap();
    settings.use_node("Tokyo 1").unwrap();
    let request = settings.start_request(&paths);

    let tool = Arc::new(MemoryProxyTool::new(["Wi-Fi"]));
    tool.seed("Wi-Fi", ProxyKind::Socks, ProxySlot::new(true, "10.1.1.1", 1080));
    let before = tool.current();
    let engine = Arc::new(ProcessSupervisor::new().with_grace(Duration::from_millis(500)));
    let session = Session::new(engine.clone(), SystemProxyController::new(tool.clone()));
    let events = session.subscribe();

    session.start(&request).unwrap();
    assert_eq!(session.status(), SessionStatus::Running);
    assert!(paths.config_file().exists());
    assert_eq!(tool.slot("Wi-Fi", ProxyKind::Socks), ProxySlot::new(true, "127.0.0.1", 10809));
    let output = wait_for(&events, |e| matches!(e, SessionEvent::EngineOutput(_))).unwrap();
    assert_eq!(
        output,
        SessionEvent::EngineOutput(format!("config {}", paths.config_file().display()))
    );

    session.stop().unwrap();
    assert_eq!(session.status(), SessionStatus::Stopped);
    assert_eq!(engine.state(), SupervisorState::Idle);
    assert_eq!(tool.current(), before);

    let marker = PathBuf::from(format!("{}.crash", paths.config_file().display()));
    fs::write(&marker, "").unwrap();
    session.start(&request).unwrap();
    let exited = wait_for(&events, |e| matches!(e, SessionEvent::EngineExited { .. })).unwrap();
    let SessionEvent::EngineExited { exit, proxy } = exited else {
        unreachable!()
    };
    assert_eq!(exit.code, Some(9));
    assert!(proxy.is_some());
    assert_eq!(session.status(), SessionStatus::Stopped);
    assert_eq!(tool.current(), before);
    assert_eq!(engine.state(), SupervisorState::Failed);
}
