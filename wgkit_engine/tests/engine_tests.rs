mod common;

use common::*;
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use wgkit_engine::{EngineError, ProxyProtocol, ProxySpec, SessionState, WatchdogState};
use wgkit_shared::proto::{DeviceSnapshot, Key};

#[test]
fn test_descriptor_session_round_trip() {
    let engine = engine();
    let tun = TunPair::new();
    let handle = engine.turn_on(&settings(), tun.fd()).unwrap();
    assert!(handle >= 0);

    let text = engine.get_config(handle).unwrap();
    assert!(text.contains(&format!("private_key={PRIVATE_HEX}\n")));
    assert!(text.contains(&format!("public_key={PEER_HEX}\n")));
    assert!(text.contains("endpoint=127.0.0.1:51820\n"));
    assert!(text.contains("persistent_keepalive_interval=25\n"));
    assert!(text.contains("allowed_ip=10.0.0.0/24\n"));
    assert!(text.contains("rx_bytes=0\n"));

    let snapshot = DeviceSnapshot::parse(&text).unwrap();
    assert_ne!(snapshot.interface.listen_port, 0);
    assert_eq!(snapshot.peers.len(), 1);

    engine.turn_off(handle).unwrap();
}

#[test]
fn test_get_after_set_reflects_delta() {
    let engine = engine();
    let tun = TunPair::new();
    let handle = engine.turn_on(&settings(), tun.fd()).unwrap();

    let delta = format!(
        "public_key={SECOND_PEER_HEX}\nendpoint=127.0.0.1:51821\nallowed_ip=10.0.1.0/24\n"
    );
    engine.set_config(handle, &delta).unwrap();
    let snapshot = DeviceSnapshot::parse(&engine.get_config(handle).unwrap()).unwrap();
    assert_eq!(snapshot.peers.len(), 2);
    let second = snapshot
        .peer(&Key::from_hex(SECOND_PEER_HEX).unwrap())
        .unwrap();
    assert_eq!(
        second.allowed_ips,
        vec!["10.0.1.0/24".parse::<ipnet::IpNet>().unwrap()]
    );

    // The first peer was left alone
    let first = snapshot.peer(&Key::from_hex(PEER_HEX).unwrap()).unwrap();
    assert_eq!(first.persistent_keepalive_interval, 25);

    let removal = format!("public_key={SECOND_PEER_HEX}\nremove=true\n");
    engine.set_config(handle, &removal).unwrap();
    let snapshot = DeviceSnapshot::parse(&engine.get_config(handle).unwrap()).unwrap();
    assert_eq!(snapshot.peers.len(), 1);
}

#[test]
fn test_wg_quick_settings_are_accepted() {
    let engine = engine();
    let tun = TunPair::new();
    let ini = format!(
        "[Interface]\n\
         PrivateKey = {PRIVATE_B64}\n\
         Address = 10.0.0.2/32\n\
         DNS = 10.0.0.1\n\
         \n\
         [Peer]\n\
         PublicKey = {PEER_B64}\n\
         AllowedIPs = 0.0.0.0/0\n\
         Endpoint = 127.0.0.1:51820\n"
    );
    let handle = engine.turn_on(&ini, tun.fd()).unwrap();
    let text = engine.get_config(handle).unwrap();
    assert!(text.contains(&format!("private_key={PRIVATE_HEX}\n")));
    assert!(text.contains(&format!("public_key={PEER_HEX}\n")));
    assert!(text.contains("allowed_ip=0.0.0.0/0\n"));
}

#[test]
fn test_versions_increase_independently() {
    let engine = engine();
    let (tun_a, tun_b) = (TunPair::new(), TunPair::new());
    let a = engine.turn_on(&settings(), tun_a.fd()).unwrap();
    let b = engine.turn_on(&settings(), tun_b.fd()).unwrap();

    assert_eq!(engine.set_config(a, "").unwrap(), 2);
    assert_eq!(engine.set_config(a, "").unwrap(), 3);
    assert_eq!(engine.set_config(b, "").unwrap(), 2);
    assert_eq!(engine.set_config(a, "").unwrap(), 4);
}

#[test]
fn test_destroyed_handle_is_unknown_everywhere() {
    let engine = engine();
    let tun = TunPair::new();
    let handle = engine.turn_on(&settings(), tun.fd()).unwrap();
    engine.start_watchdog(handle, "127.0.0.1").unwrap();
    engine.turn_off(handle).unwrap();

    let unknown = |result: Result<(), EngineError>| {
        matches!(result, Err(EngineError::UnknownHandle(h)) if h == handle)
    };
    assert!(unknown(engine.turn_off(handle)));
    assert!(unknown(engine.set_config(handle, "").map(|_| ())));
    assert!(unknown(engine.get_config(handle).map(|_| ())));
    assert!(unknown(engine.bump_sockets(handle)));
    assert!(unknown(engine.disable_roaming(handle)));
    assert!(unknown(engine.start_watchdog(handle, "127.0.0.1")));
    assert!(unknown(engine.suspend_watchdog(handle)));
    assert!(unknown(engine.resume_watchdog(handle)));
    assert_eq!(
        engine.turn_off(handle).unwrap_err().code(),
        -libc::EBADF
    );
}

#[test]
fn test_interface_only_round_trip() {
    let engine = engine();
    let (holder, port) = occupied_udp_port();
    drop(holder);

    let tun = TunPair::new();
    let input = format!("private_key={PRIVATE_HEX}\nlisten_port={port}\n");
    let handle = engine.turn_on(&input, tun.fd()).unwrap();

    let output = engine.get_config(handle).unwrap();
    assert_eq!(output, input);
    assert!(DeviceSnapshot::parse(&output).unwrap().peers.is_empty());
}

#[test]
fn test_wg_quick_host_endpoint_is_resolved() {
    let engine = engine();
    let tun = TunPair::new();
    let ini = format!(
        "[Interface]\nPrivateKey = {PRIVATE_B64}\n\n\
         [Peer]\nPublicKey = {PEER_B64}\nEndpoint = localhost:51820\nAllowedIPs = 10.0.0.0/24\n"
    );
    let handle = engine.turn_on(&ini, tun.fd()).unwrap();
    let snapshot = DeviceSnapshot::parse(&engine.get_config(handle).unwrap()).unwrap();
    let endpoint = snapshot.peers[0].endpoint.unwrap();
    assert!(endpoint.ip().is_loopback());
    assert_eq!(endpoint.port(), 51820);
}

#[test]
fn test_handle_stays_taken_until_teardown_finishes() {
    let factory = Arc::new(MockFactory::default());
    factory.state.close_delay_ms.store(300, Ordering::SeqCst);
    let engine = Arc::new(engine_with(factory.clone(), ScriptedProber::new(true)));
    let tun = TunPair::new();
    let first = engine.turn_on(&settings(), tun.fd()).unwrap();

    let closing = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || engine.turn_off(first))
    };
    assert!(eventually(|| factory.state.closing.load(Ordering::SeqCst) == 1));
    assert!(engine.handles().is_empty());

    let second = engine.turn_on(&settings(), tun.fd()).unwrap();
    assert_ne!(second, first);
    assert_eq!(factory.state.closed.load(Ordering::SeqCst), 0);

    closing.join().unwrap().unwrap();
    assert_eq!(factory.state.closed.load(Ordering::SeqCst), 1);
    assert_eq!(engine.turn_on(&settings(), tun.fd()).unwrap(), first);
}

#[test]
fn test_lowest_free_handle_is_reused() {
    let engine = engine();
    let tuns: Vec<TunPair> = (0..3).map(|_| TunPair::new()).collect();
    let handles: Vec<i32> = tuns
        .iter()
        .map(|tun| engine.turn_on(&settings(), tun.fd()).unwrap())
        .collect();
    assert_eq!(handles, vec![0, 1, 2]);

    engine.turn_off(1).unwrap();
    assert_eq!(engine.handles(), vec![0, 2]);

    let tun = TunPair::new();
    assert_eq!(engine.turn_on(&settings(), tun.fd()).unwrap(), 1);
}

#[test]
fn test_concurrent_turn_on_never_shares_handles() {
    let engine = Arc::new(engine());
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let tun = TunPair::new();
                let handle = engine.turn_on(&settings(), tun.fd()).unwrap();
                (handle, tun)
            })
        })
        .collect();
    let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    let handles: BTreeSet<i32> = results.iter().map(|(h, _)| *h).collect();
    assert_eq!(handles, (0..8).collect());
}

#[test]
fn test_invalid_settings_are_rejected_without_side_effects() {
    let engine = engine();
    let tun = TunPair::new();
    assert!(matches!(
        engine.turn_on("bogus_key=1\n", tun.fd()),
        Err(EngineError::ConfigInvalid(_))
    ));
    assert!(engine.handles().is_empty());

    let handle = engine.turn_on(&settings(), tun.fd()).unwrap();
    let before = engine.get_config(handle).unwrap();
    let err = engine
        .set_config(handle, "public_key=not-hex\n")
        .unwrap_err();
    assert_eq!(err.code(), -libc::EINVAL);
    assert!(matches!(
        engine.set_config(handle, "rx_bytes=10\n"),
        Err(EngineError::ConfigInvalid(_))
    ));
    assert_eq!(engine.get_config(handle).unwrap(), before);
    assert_eq!(engine.set_config(handle, "").unwrap(), 2);
}

#[test]
fn test_invalid_descriptor_is_transport_error() {
    let engine = engine();
    let err = engine.turn_on(&settings(), -1).unwrap_err();
    assert!(matches!(err, EngineError::TransportUnavailable(_)));
    assert_eq!(err.code(), -libc::ENODEV);
    assert!(engine.handles().is_empty());
}

#[test]
fn test_bind_conflict_fails_start_and_frees_handle() {
    let engine = engine();
    let tun = TunPair::new();
    let (_holder, port) = occupied_udp_port();
    let settings = format!("private_key={PRIVATE_HEX}\nlisten_port={port}\n");

    let err = engine.turn_on(&settings, tun.fd()).unwrap_err();
    assert!(matches!(err, EngineError::EngineStartFailed(_)));
    assert_eq!(err.code(), -libc::EIO);
    assert!(engine.handles().is_empty());

    assert_eq!(engine.turn_on(&common::settings(), tun.fd()).unwrap(), 0);
}

#[test]
fn test_listen_port_change_is_applied() {
    let engine = engine();
    let tun = TunPair::new();
    let handle = engine.turn_on(&settings(), tun.fd()).unwrap();

    let (holder, port) = occupied_udp_port();
    drop(holder);
    engine
        .set_config(handle, &format!("listen_port={port}\n"))
        .unwrap();
    let snapshot = DeviceSnapshot::parse(&engine.get_config(handle).unwrap()).unwrap();
    assert_eq!(snapshot.interface.listen_port, port);
}

#[test]
fn test_panicking_device_is_internal_error() {
    let factory = Arc::new(MockFactory::default());
    let engine = engine_with(factory.clone(), ScriptedProber::new(true));
    let tun_a = TunPair::new();
    let tun_b = TunPair::new();
    let a = engine.turn_on(&settings(), tun_a.fd()).unwrap();
    let b = engine.turn_on(&settings(), tun_b.fd()).unwrap();

    let err = engine
        .set_config(a, &format!("listen_port={PANIC_PORT}\n"))
        .unwrap_err();
    assert!(matches!(err, EngineError::Internal(_)));
    assert_eq!(err.code(), -libc::EFAULT);

    // Both sessions stay usable
    assert!(engine.get_config(a).is_ok());
    assert_eq!(engine.set_config(a, "").unwrap(), 2);
    assert_eq!(engine.set_config(b, "").unwrap(), 2);
    assert_eq!(engine.handles(), vec![a, b]);
}

#[test]
fn test_bump_success_queues_keepalives() {
    let factory = Arc::new(MockFactory::default());
    let engine = engine_with(factory.clone(), ScriptedProber::new(true));
    let tun = TunPair::new();
    let handle = engine.turn_on(&settings(), tun.fd()).unwrap();

    engine.bump_sockets(handle).unwrap();
    assert!(eventually(|| factory.state.keepalives.load(Ordering::SeqCst) == 1));
    assert_eq!(factory.state.bind_updates.load(Ordering::SeqCst), 1);
}

#[test]
fn test_superseded_bump_finishes_its_rebind() {
    let factory = Arc::new(MockFactory::default());
    factory.state.bind_delay_ms.store(100, Ordering::SeqCst);
    let engine = engine_with(factory.clone(), ScriptedProber::new(true));
    let tun = TunPair::new();
    let handle = engine.turn_on(&settings(), tun.fd()).unwrap();

    engine.bump_sockets(handle).unwrap();
    assert!(eventually(|| factory.state.bind_updates.load(Ordering::SeqCst) == 1));
    engine.bump_sockets(handle).unwrap();

    // The first rebind is not cut short by the second request
    assert!(eventually(|| factory.state.binds_finished.load(Ordering::SeqCst) == 2));
    assert!(eventually(|| factory.state.keepalives.load(Ordering::SeqCst) == 2));
    assert_eq!(factory.state.bind_updates.load(Ordering::SeqCst), 2);
}

#[test]
fn test_bump_gives_up_after_retries() {
    let factory = Arc::new(MockFactory::default());
    factory.state.fail_binds.store(true, Ordering::SeqCst);
    let engine = engine_with(factory.clone(), ScriptedProber::new(true));
    let tun = TunPair::new();
    let handle = engine.turn_on(&settings(), tun.fd()).unwrap();

    engine.bump_sockets(handle).unwrap();
    assert!(eventually(|| factory.state.bind_updates.load(Ordering::SeqCst) == 3));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(factory.state.bind_updates.load(Ordering::SeqCst), 3);
    assert_eq!(factory.state.keepalives.load(Ordering::SeqCst), 0);

    // The session survives
    assert_eq!(engine.set_config(handle, "").unwrap(), 2);
}

#[test]
fn test_real_device_bump_keeps_listen_port() {
    let engine = engine();
    let tun = TunPair::new();
    let handle = engine.turn_on(&settings(), tun.fd()).unwrap();
    let port = DeviceSnapshot::parse(&engine.get_config(handle).unwrap())
        .unwrap()
        .interface
        .listen_port;

    engine.bump_sockets(handle).unwrap();
    thread::sleep(Duration::from_millis(100));
    let after = DeviceSnapshot::parse(&engine.get_config(handle).unwrap()).unwrap();
    assert_eq!(after.interface.listen_port, port);
    engine.disable_roaming(handle).unwrap();
}

#[test]
fn test_watchdog_suspend_resume_are_idempotent() {
    let prober = ScriptedProber::new(true);
    let engine = engine_with(Arc::new(MockFactory::default()), prober.clone());
    let tun = TunPair::new();
    let handle = engine.turn_on(&settings(), tun.fd()).unwrap();

    let err = engine.suspend_watchdog(handle).unwrap_err();
    assert!(matches!(err, EngineError::WatchdogNotStarted(h) if h == handle));
    assert_eq!(err.code(), -libc::ESRCH);
    assert!(matches!(
        engine.resume_watchdog(handle),
        Err(EngineError::WatchdogNotStarted(_))
    ));

    engine.start_watchdog(handle, "10.0.0.1:53").unwrap();
    assert!(eventually(|| prober.probes.load(Ordering::SeqCst) > 0));

    engine.suspend_watchdog(handle).unwrap();
    engine.suspend_watchdog(handle).unwrap();
    assert_eq!(
        engine.watchdog_status(handle).unwrap().state,
        WatchdogState::Suspended
    );

    engine.resume_watchdog(handle).unwrap();
    engine.resume_watchdog(handle).unwrap();
    let status = engine.watchdog_status(handle).unwrap();
    assert_eq!(status.state, WatchdogState::Running);
    assert_eq!(status.target, Some("10.0.0.1:53".parse().unwrap()));

    // Restart replaces the target
    engine.start_watchdog(handle, "10.0.0.2").unwrap();
    assert_eq!(
        engine.watchdog_status(handle).unwrap().target,
        Some("10.0.0.2:443".parse().unwrap())
    );
}

#[test]
fn test_watchdog_rebumps_after_failures() {
    let factory = Arc::new(MockFactory::default());
    let prober = ScriptedProber::new(false);
    let engine = engine_with(factory.clone(), prober);
    let tun = TunPair::new();
    let handle = engine.turn_on(&settings(), tun.fd()).unwrap();

    engine.start_watchdog(handle, "192.0.2.1").unwrap();
    assert!(eventually(|| factory.state.bind_updates.load(Ordering::SeqCst) >= 1));
    let status = engine.watchdog_status(handle).unwrap();
    assert!(status.recoveries >= 1);
    assert_eq!(status.last_probe_ok, Some(false));
}

#[test]
fn test_watchdog_observer_outlives_session() {
    let prober = ScriptedProber::new(true);
    let engine = engine_with(Arc::new(MockFactory::default()), prober.clone());
    let tun = TunPair::new();
    let handle = engine.turn_on(&settings(), tun.fd()).unwrap();
    let observer = engine.watchdog_observer(handle).unwrap();
    assert_eq!(observer.state(), WatchdogState::Stopped);

    engine.start_watchdog(handle, "127.0.0.1").unwrap();
    assert_eq!(observer.state(), WatchdogState::Running);

    assert!(eventually(|| prober.probes.load(Ordering::SeqCst) >= 2));

    engine.turn_off(handle).unwrap();
    assert_eq!(observer.state(), WatchdogState::Stopped);

    // Ten watchdog intervals without a single health check
    let at_turn_off = prober.probes.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(200));
    assert_eq!(prober.probes.load(Ordering::SeqCst), at_turn_off);
}

#[test]
fn test_watchdog_falls_back_to_check_alive() {
    let engine = engine_with(Arc::new(MockFactory::default()), ScriptedProber::new(true));
    let tun = TunPair::new();
    let uapi = engine.turn_on(&settings(), tun.fd()).unwrap();
    assert!(matches!(
        engine.start_watchdog(uapi, ""),
        Err(EngineError::ConfigInvalid(_))
    ));

    let ini = format!(
        "[Interface]\nPrivateKey = {PRIVATE_B64}\nCheckAlive = 10.9.9.9\nCheckAliveInterval = 1\n"
    );
    let handle = engine.turn_on(&ini, tun.fd()).unwrap();
    engine.start_watchdog(handle, "").unwrap();
    assert_eq!(
        engine.watchdog_status(handle).unwrap().target,
        Some("10.9.9.9:443".parse().unwrap())
    );
}

#[test]
fn test_socks5_proxy_session() {
    let engine = engine();
    let proxy = fake_socks5(None);
    let handle = engine
        .proxy_turn_on(&settings(), ProxySpec::new(proxy.to_string(), ProxyProtocol::Socks5))
        .unwrap();

    let snapshot = DeviceSnapshot::parse(&engine.get_config(handle).unwrap()).unwrap();
    assert_eq!(snapshot.peers.len(), 1);
    engine.bump_sockets(handle).unwrap();
    engine.turn_off(handle).unwrap();
}

#[test]
fn test_socks5_proxy_round_trips_every_line() {
    let engine = engine();
    let proxy = fake_socks5(None);
    let input = format!(
        "private_key={PRIVATE_HEX}\n\
         listen_port=0\n\
         fwmark=7\n\
         public_key={PEER_HEX}\n\
         preshared_key={PSK_HEX}\n\
         endpoint=127.0.0.1:51820\n\
         persistent_keepalive_interval=25\n\
         allowed_ip=10.0.0.0/24\n\
         allowed_ip=fd00::/64\n"
    );
    let handle = engine
        .proxy_turn_on(&input, ProxySpec::new(proxy.to_string(), ProxyProtocol::Socks5))
        .unwrap();

    let output = engine.get_config(handle).unwrap();
    let lines: BTreeSet<&str> = output.lines().collect();
    for line in input.lines() {
        assert!(lines.contains(line), "{line:?} missing from:\n{output}");
    }
    assert!(lines.contains("protocol_version=1"));
    assert!(lines.contains("rx_bytes=0"));
    engine.turn_off(handle).unwrap();
}

#[test]
fn test_socks5_proxy_with_credentials() {
    let engine = engine();
    let proxy = fake_socks5(Some(("alice", "s3cret")));
    let spec = ProxySpec::new(proxy.to_string(), ProxyProtocol::Socks5)
        .with_credentials("alice", "s3cret");
    let handle = engine.proxy_turn_on(&settings(), spec).unwrap();
    assert_eq!(engine.handles(), vec![handle]);
}

#[test]
fn test_rejected_proxy_credentials() {
    let engine = engine();
    let proxy = fake_socks5(Some(("alice", "s3cret")));
    let spec =
        ProxySpec::new(proxy.to_string(), ProxyProtocol::Socks5).with_credentials("alice", "wrong");
    let err = engine.proxy_turn_on(&settings(), spec).unwrap_err();
    assert!(matches!(err, EngineError::TransportUnavailable(_)));
    assert!(engine.handles().is_empty());
}

#[test]
fn test_http_proxy_session() {
    let engine = engine();
    let (proxy, seen) = fake_http_proxy(200);
    let spec =
        ProxySpec::new(proxy.to_string(), ProxyProtocol::Http).with_credentials("bob", "pw");
    let handle = engine.proxy_turn_on(&settings(), spec).unwrap();

    let request = seen.lock().unwrap().clone();
    assert!(request.starts_with("CONNECT 127.0.0.1:51820 HTTP/1.1\r\n"));
    assert!(request.contains("Proxy-Authorization: Basic Ym9iOnB3\r\n"));
    assert!(engine.get_config(handle).is_ok());
}

#[test]
fn test_http_proxy_auth_required() {
    let engine = engine();
    let (proxy, _) = fake_http_proxy(407);
    let err = engine
        .proxy_turn_on(&settings(), ProxySpec::new(proxy.to_string(), ProxyProtocol::Http))
        .unwrap_err();
    assert!(matches!(err, EngineError::TransportUnavailable(_)));
}

#[test]
fn test_http_proxy_needs_an_endpoint() {
    let engine = engine();
    let err = engine
        .proxy_turn_on(
            &format!("private_key={PRIVATE_HEX}\n"),
            ProxySpec::new("127.0.0.1:1", ProxyProtocol::Http),
        )
        .unwrap_err();
    assert!(matches!(err, EngineError::TransportUnavailable(_)));
}

#[test]
fn test_empty_proxy_address() {
    let engine = engine();
    assert!(matches!(
        engine.proxy_turn_on(&settings(), ProxySpec::new("", ProxyProtocol::Socks5)),
        Err(EngineError::TransportUnavailable(_))
    ));
}

#[test]
fn test_gc_wipes_keys_of_destroyed_sessions() {
    let engine = engine();
    assert_eq!(engine.run_gc().keys_wiped, 0);

    let tun = TunPair::new();
    let handle = engine.turn_on(&settings(), tun.fd()).unwrap();
    let before = engine.get_config(handle).unwrap();
    engine.run_gc();
    assert_eq!(engine.get_config(handle).unwrap(), before);

    engine.turn_off(handle).unwrap();
    assert_eq!(engine.run_gc().keys_wiped, 1);
    assert_eq!(engine.run_gc().keys_wiped, 0);
}

#[test]
fn test_dump_sessions() {
    let engine = engine();
    let (tun_a, tun_b) = (TunPair::new(), TunPair::new());
    engine.turn_on(&settings(), tun_a.fd()).unwrap();
    let b = engine.turn_on(&settings(), tun_b.fd()).unwrap();
    engine.set_config(b, "").unwrap();

    let summaries = engine.dump_sessions();
    assert_eq!(summaries.len(), 2);
    assert!(summaries.iter().all(|s| s.state == SessionState::Running));
    assert!(summaries.iter().all(|s| s.transport == "descriptor"));
    assert_eq!(summaries[1].version, 2);
    assert_eq!(summaries[1].peers, 1);
}

#[test]
fn test_version_string() {
    assert_eq!(wgkit_engine::Engine::version(), env!("CARGO_PKG_VERSION"));
}
