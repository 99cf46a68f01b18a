#![allow(dead_code)]

use async_trait::async_trait;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use wgkit_engine::device::{Attachment, Device, DeviceContext, DeviceFactory, WgDeviceFactory};
use wgkit_engine::{Engine, EngineResult, Prober};
use wgkit_shared::config::{EngineConfig, RecoveryPolicy};
use wgkit_shared::proto::{ConfigUpdate, DeviceSnapshot};

pub const PRIVATE_HEX: &str = "e84b5a6d2717c1003a13b431570353dbaca9146cf150c5f8575680feba52027a";
pub const PRIVATE_B64: &str = "6EtabScXwQA6E7QxVwNT26ypFGzxUMX4V1aA/rpSAno=";
pub const PEER_HEX: &str = "b85996fecc9c7f1fc6d2572a76eda11d59bcd20be8e543b15ce4bd85a8e75a33";
pub const PEER_B64: &str = "uFmW/sycfx/G0lcqdu2hHVm80gvo5UOxXOS9hajnWjM=";
pub const PSK_HEX: &str = "188515093e952f5f22e865cef3012e72f8b5f0b598ac0309d5dacce3b70fcf52";
pub const SECOND_PEER_HEX: &str =
    "58402e695ba1772b1cc9309755f043251ea77fdcf10fbe63989ceb7e19321376";

/// One peer with an endpoint on loopback.
pub fn settings() -> String {
    format!(
        "private_key={PRIVATE_HEX}\n\
         listen_port=0\n\
         replace_peers=true\n\
         public_key={PEER_HEX}\n\
         endpoint=127.0.0.1:51820\n\
         persistent_keepalive_interval=25\n\
         replace_allowed_ips=true\n\
         allowed_ip=10.0.0.0/24\n"
    )
}

/// Engine config with fast timers and no signal handler.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.diagnostics.dump_on_sigusr2 = false;
    config.bind.bump_retries = 3;
    config.bind.bump_retry_delay_ms = 10;
    config.watchdog.interval_ms = 20;
    config.watchdog.probe_timeout_ms = 50;
    config.watchdog.failure_threshold = 2;
    config.watchdog.recovery = RecoveryPolicy::Rebump;
    config.proxy.connect_timeout_ms = 2000;
    config
}

pub fn engine() -> Engine {
    engine_with(Arc::new(WgDeviceFactory), ScriptedProber::new(true))
}

pub fn engine_with(factory: Arc<dyn DeviceFactory>, prober: Arc<ScriptedProber>) -> Engine {
    Engine::with_parts(test_config(), factory, prober).unwrap()
}

/// Tunnel descriptor stand-in. Keep the pair alive while the session runs.
pub struct TunPair {
    pub engine_end: UnixDatagram,
    pub host_end: UnixDatagram,
}

impl TunPair {
    pub fn new() -> Self {
        let (engine_end, host_end) = UnixDatagram::pair().unwrap();
        TunPair {
            engine_end,
            host_end,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.engine_end.as_raw_fd()
    }
}

/// Poll `check` for up to two seconds.
pub fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Prober whose answer the test controls.
pub struct ScriptedProber {
    reachable: AtomicBool,
    pub probes: AtomicUsize,
}

impl ScriptedProber {
    pub fn new(reachable: bool) -> Arc<Self> {
        Arc::new(ScriptedProber {
            reachable: AtomicBool::new(reachable),
            probes: AtomicUsize::new(0),
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, _target: SocketAddr, _timeout: Duration) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.reachable.load(Ordering::SeqCst)
    }
}

/// Counters shared by every [`MockDevice`] a [`MockFactory`] builds.
#[derive(Default)]
pub struct MockState {
    /// Rebind attempts started
    pub bind_updates: AtomicUsize,
    /// Rebind attempts that ran to completion
    pub binds_finished: AtomicUsize,
    pub bind_delay_ms: AtomicU64,
    pub keepalives: AtomicUsize,
    pub closing: AtomicUsize,
    pub closed: AtomicUsize,
    pub close_delay_ms: AtomicU64,
    pub fail_binds: AtomicBool,
    pub applied: Mutex<Vec<ConfigUpdate>>,
}

/// Device that records calls instead of moving packets. Applying a
/// `listen_port` of 6666 panics.
pub struct MockDevice {
    state: Arc<MockState>,
    _attachment: Attachment,
}

pub const PANIC_PORT: u16 = 6666;

#[async_trait]
impl Device for MockDevice {
    async fn up(&mut self) -> EngineResult<()> {
        Ok(())
    }

    async fn apply(&mut self, update: &ConfigUpdate) -> EngineResult<()> {
        if update.interface.listen_port == Some(PANIC_PORT) {
            panic!("device state corrupted");
        }
        self.state.applied.lock().unwrap().push(update.clone());
        Ok(())
    }

    fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot::default()
    }

    async fn bind_update(&mut self) -> EngineResult<()> {
        self.state.bind_updates.fetch_add(1, Ordering::SeqCst);
        pause(&self.state.bind_delay_ms).await;
        if self.state.fail_binds.load(Ordering::SeqCst) {
            return Err(wgkit_engine::EngineError::EngineStartFailed(
                "network unreachable".to_string(),
            ));
        }
        self.state.binds_finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn send_keepalives(&mut self) -> usize {
        self.state.keepalives.fetch_add(1, Ordering::SeqCst);
        1
    }

    fn disable_roaming(&mut self) {}

    fn transport(&self) -> &'static str {
        "mock"
    }

    async fn close(&mut self) {
        self.state.closing.fetch_add(1, Ordering::SeqCst);
        pause(&self.state.close_delay_ms).await;
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}

async fn pause(millis: &AtomicU64) {
    let millis = millis.load(Ordering::SeqCst);
    if millis > 0 {
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
}

#[derive(Default)]
pub struct MockFactory {
    pub state: Arc<MockState>,
}

impl DeviceFactory for MockFactory {
    fn create(&self, _ctx: DeviceContext, attachment: Attachment) -> EngineResult<Box<dyn Device>> {
        Ok(Box::new(MockDevice {
            state: Arc::clone(&self.state),
            _attachment: attachment,
        }))
    }
}

/// SOCKS5 server answering one UDP ASSOCIATE. With `credentials` it insists
/// on username/password authentication.
pub fn fake_socks5(credentials: Option<(&'static str, &'static str)>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let relay = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let relay_port = relay.local_addr().unwrap().port();

    thread::spawn(move || {
        let _relay = relay;
        let Ok((mut stream, _)) = listener.accept() else {
            return;
        };
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).unwrap();
        let mut methods = vec![0u8; head[1] as usize];
        stream.read_exact(&mut methods).unwrap();

        match credentials {
            None => stream.write_all(&[0x05, 0x00]).unwrap(),
            Some((user, pass)) => {
                if !methods.contains(&0x02) {
                    stream.write_all(&[0x05, 0xff]).unwrap();
                    return;
                }
                stream.write_all(&[0x05, 0x02]).unwrap();
                let mut ver_len = [0u8; 2];
                stream.read_exact(&mut ver_len).unwrap();
                let mut got_user = vec![0u8; ver_len[1] as usize];
                stream.read_exact(&mut got_user).unwrap();
                let mut pass_len = [0u8; 1];
                stream.read_exact(&mut pass_len).unwrap();
                let mut got_pass = vec![0u8; pass_len[0] as usize];
                stream.read_exact(&mut got_pass).unwrap();
                if got_user != user.as_bytes() || got_pass != pass.as_bytes() {
                    stream.write_all(&[0x01, 0x01]).unwrap();
                    return;
                }
                stream.write_all(&[0x01, 0x00]).unwrap();
            }
        }

        let mut request = [0u8; 10];
        stream.read_exact(&mut request).unwrap();
        assert_eq!(request[1], 0x03, "expected UDP ASSOCIATE");
        let mut reply = vec![0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0];
        reply.extend_from_slice(&relay_port.to_be_bytes());
        stream.write_all(&reply).unwrap();

        // Hold the association until the client hangs up
        let mut sink = [0u8; 64];
        while matches!(stream.read(&mut sink), Ok(n) if n > 0) {}
    });
    addr
}

/// HTTP proxy answering one CONNECT with `status`. Returns the address and
/// a slot receiving the request head.
pub fn fake_http_proxy(status: u16) -> (SocketAddr, Arc<Mutex<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(String::new()));
    let slot = Arc::clone(&seen);

    thread::spawn(move || {
        let Ok((mut stream, _)) = listener.accept() else {
            return;
        };
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if stream.read_exact(&mut byte).is_err() {
                return;
            }
            head.push(byte[0]);
        }
        *slot.lock().unwrap() = String::from_utf8_lossy(&head).into_owned();

        let reason = if status == 200 { "Connection established" } else { "Denied" };
        let _ = stream.write_all(format!("HTTP/1.1 {status} {reason}\r\n\r\n").as_bytes());
        let mut sink = [0u8; 64];
        while matches!(stream.read(&mut sink), Ok(n) if n > 0) {}
    });
    (addr, seen)
}

/// A UDP port that was free a moment ago, held by the returned socket.
pub fn occupied_udp_port() -> (std::net::UdpSocket, u16) {
    let socket = std::net::UdpSocket::bind("[::]:0")
        .or_else(|_| std::net::UdpSocket::bind("0.0.0.0:0"))
        .unwrap();
    let port = socket.local_addr().unwrap().port();
    (socket, port)
}
