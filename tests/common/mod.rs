#![allow(dead_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use cslb::{Balancer, Config, Dialer, DnsResolver, RandIntn, SrvRecordData};

/// A scriptable resolver: canned SRV and TXT records plus a memory of the
/// last names looked up, so tests can assert which queries were attempted.
pub struct MockResolver {
    state: Mutex<ResolverState>,
}

#[derive(Default)]
struct ResolverState {
    srvs: HashMap<String, Vec<SrvRecordData>>,
    txts: HashMap<String, Vec<String>>,
    last_srv: Option<String>,
    last_txt: Option<String>,
    srv_lookups: u64,
}

impl MockResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ResolverState::default()),
        })
    }

    /// Appends one SRV record under `_service._proto.name`. Records keep
    /// their append order so tests can rely on walk position. An empty
    /// target is stored as-is; dropping it is the cache's job.
    pub fn append_srv(
        &self,
        service: &str,
        proto: &str,
        name: &str,
        target: &str,
        port: u16,
        priority: u16,
        weight: u16,
    ) {
        let key = format!("_{service}._{proto}.{name}");
        self.state
            .lock()
            .unwrap()
            .srvs
            .entry(key)
            .or_default()
            .push(SrvRecordData {
                target: target.to_string(),
                port,
                priority,
                weight,
            });
    }

    pub fn append_txt(&self, qname: &str, strings: &[&str]) {
        self.state.lock().unwrap().txts.insert(
            qname.to_string(),
            strings.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub fn last_srv(&self) -> Option<String> {
        self.state.lock().unwrap().last_srv.clone()
    }

    pub fn last_txt(&self) -> Option<String> {
        self.state.lock().unwrap().last_txt.clone()
    }

    pub fn srv_lookups(&self) -> u64 {
        self.state.lock().unwrap().srv_lookups
    }
}

#[async_trait]
impl DnsResolver for MockResolver {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecordData>> {
        let mut state = self.state.lock().unwrap();
        state.last_srv = Some(name.to_string());
        state.srv_lookups += 1;
        match state.srvs.get(name) {
            Some(records) => Ok(records.clone()),
            None => bail!("mock SRV not found for {name}"),
        }
    }

    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>> {
        let mut state = self.state.lock().unwrap();
        state.last_txt = Some(name.to_string());
        match state.txts.get(name) {
            Some(strings) => Ok(strings.clone()),
            None => bail!("mock TXT not found for {name}"),
        }
    }
}

/// A scriptable underlying dialer. Failures and delays are settable between
/// calls; successful dials connect to a private sink listener so a real
/// `TcpStream` comes back. Every requested address is remembered in order.
pub struct MockDialer {
    state: Mutex<DialerState>,
    sink: SocketAddr,
}

#[derive(Default)]
struct DialerState {
    delay: Duration,
    fail_with: Option<String>,
    networks: Vec<String>,
    addresses: Vec<String>,
}

impl MockDialer {
    pub async fn new() -> Arc<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind sink");
        let sink = listener.local_addr().expect("sink addr");
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        Arc::new(Self {
            state: Mutex::new(DialerState::default()),
            sink,
        })
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = delay;
    }

    pub fn set_fail(&self, message: Option<&str>) {
        self.state.lock().unwrap().fail_with = message.map(|m| m.to_string());
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.networks.clear();
        state.addresses.clear();
    }

    pub fn addresses(&self) -> Vec<String> {
        self.state.lock().unwrap().addresses.clone()
    }

    pub fn last_address(&self) -> Option<String> {
        self.state.lock().unwrap().addresses.last().cloned()
    }

    pub fn last_network(&self) -> Option<String> {
        self.state.lock().unwrap().networks.last().cloned()
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, network: &str, address: &str) -> io::Result<TcpStream> {
        let (delay, fail_with) = {
            let mut state = self.state.lock().unwrap();
            state.networks.push(network.to_string());
            state.addresses.push(address.to_string());
            (state.delay, state.fail_with.clone())
        };
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = fail_with {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, message));
        }
        TcpStream::connect(self.sink).await
    }
}

/// A balancer wired to mocks with the production RNG.
pub fn test_balancer(
    config: Config,
    resolver: Arc<MockResolver>,
    dialer: Arc<MockDialer>,
) -> Balancer {
    test_balancer_with_rand(
        config,
        resolver,
        dialer,
        Box::new(|n| rand::thread_rng().gen_range(0..n)),
    )
}

/// A balancer wired to mocks with a caller-supplied random source.
pub fn test_balancer_with_rand(
    config: Config,
    resolver: Arc<MockResolver>,
    dialer: Arc<MockDialer>,
    rand_intn: RandIntn,
) -> Balancer {
    Balancer::with_parts(config, resolver, dialer, rand_intn)
}

/// The SRV zoo most selector tests run against: four priority tiers of
/// `_http._tcp.example.net`, a weighted-plus-zeros `_https._udp.example.com`
/// (including a record with an empty target that must vanish), an all-zeros
/// group, and a name whose only record has an empty target.
pub fn make_mock_resolver() -> Arc<MockResolver> {
    let mr = MockResolver::new();
    mr.append_srv("http", "tcp", "example.net", "t1.example.net", 1, 10, 20);
    mr.append_srv("http", "tcp", "example.net", "t2.example.net", 1, 10, 20);
    mr.append_srv("http", "tcp", "example.net", "t3.example.net", 1, 10, 30);
    mr.append_srv("http", "tcp", "example.net", "t4.example.net", 1, 10, 40);
    mr.append_srv("http", "tcp", "example.net", "t5.example.net", 2, 11, 1);
    mr.append_srv("http", "tcp", "example.net", "t6.example.net", 2, 11, 1);
    mr.append_srv("http", "tcp", "example.net", "t7.example.net", 2, 11, 2);
    mr.append_srv("http", "tcp", "example.net", "t8.example.net", 2, 11, 10);
    mr.append_srv("http", "tcp", "example.net", "t9.example.net", 3, 12, 20);
    mr.append_srv("http", "tcp", "example.net", "t10.example.net", 3, 12, 30);
    mr.append_srv("http", "tcp", "example.net", "t11.example.net", 3, 12, 40);
    mr.append_srv("http", "tcp", "example.net", "t12.example.net", 3, 12, 50);
    mr.append_srv("http", "tcp", "example.net", "t13.example.net", 3, 12, 60);
    mr.append_srv("http", "tcp", "example.net", "t14.example.net", 3, 12, 70);
    mr.append_srv("http", "tcp", "example.net", "t15.example.net", 3, 12, 80);
    mr.append_srv("http", "tcp", "example.net", "t16.example.net", 4, 13, 90);
    mr.append_srv("http", "tcp", "example.net", "t17.example.net", 4, 13, 91);
    mr.append_srv("http", "tcp", "example.net", "t18.example.net", 4, 13, 92);
    mr.append_srv("http", "tcp", "example.net", "t19.example.net", 4, 13, 93);
    mr.append_srv("http", "tcp", "example.net", "t20.example.net", 4, 13, 94);

    mr.append_srv("https", "udp", "example.com", "u1.example.com", 1443, 13, 10);
    mr.append_srv("https", "udp", "example.com", "u2.example.com", 1444, 13, 20);
    mr.append_srv("https", "udp", "example.com", "u3.example.com", 1444, 13, 30);
    mr.append_srv("https", "udp", "example.com", "u4.example.com", 1444, 13, 0);
    mr.append_srv("https", "udp", "example.com", "u5.example.com", 1444, 13, 0);
    mr.append_srv("https", "udp", "example.com", "u6.example.com", 1444, 13, 0);
    mr.append_srv("https", "udp", "example.com", "", 1444, 13, 100);
    mr.append_srv("https", "udp", "example.com", "u7.example.com", 1444, 14, 0);

    mr.append_srv("http", "tcp", "zeros.example.org", "z1.example.org", 4000, 9, 0);
    mr.append_srv("http", "tcp", "zeros.example.org", "z2.example.org", 4000, 9, 0);
    mr.append_srv("http", "tcp", "zeros.example.org", "z3.example.org", 4000, 9, 0);

    mr.append_srv("http", "tcp", "empty.example.org", "", 0, 0, 0);

    mr
}

/// A tiny HTTP server for end-to-end tests. `/health` serves the
/// health-check body, everything else the GET body; both are in the form
/// "Hello from <name> I have: <body>" and both paths count their hits.
pub struct TestHttpServer {
    pub addr: SocketAddr,
    inner: Arc<ServerInner>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

struct ServerInner {
    name: String,
    get_body: Mutex<String>,
    hc_body: Mutex<String>,
    get_hits: AtomicU64,
    hc_hits: AtomicU64,
}

impl TestHttpServer {
    pub async fn start(name: &str, get_body: &str, hc_body: &str) -> Self {
        let inner = Arc::new(ServerInner {
            name: name.to_string(),
            get_body: Mutex::new(get_body.to_string()),
            hc_body: Mutex::new(hc_body.to_string()),
            get_hits: AtomicU64::new(0),
            hc_hits: AtomicU64::new(0),
        });
        let service_inner = Arc::clone(&inner);
        let make_service = make_service_fn(move |_conn| {
            let inner = Arc::clone(&service_inner);
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let inner = Arc::clone(&inner);
                    async move {
                        let body = if req.uri().path() == "/health" {
                            inner.hc_hits.fetch_add(1, Ordering::SeqCst);
                            inner.hc_body.lock().unwrap().clone()
                        } else {
                            inner.get_hits.fetch_add(1, Ordering::SeqCst);
                            inner.get_body.lock().unwrap().clone()
                        };
                        let reply = format!("Hello from {} I have: {}\n", inner.name, body);
                        Ok::<_, Infallible>(Response::new(Body::from(reply)))
                    }
                }))
            }
        });

        let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make_service);
        let addr = server.local_addr();
        let (tx, rx) = oneshot::channel::<()>();
        let graceful = server.with_graceful_shutdown(async {
            let _ = rx.await;
        });
        tokio::spawn(async move {
            let _ = graceful.await;
        });

        Self {
            addr,
            inner,
            shutdown: Mutex::new(Some(tx)),
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn set_hc_body(&self, body: &str) {
        *self.inner.hc_body.lock().unwrap() = body.to_string();
    }

    pub fn get_hits(&self) -> u64 {
        self.inner.get_hits.load(Ordering::SeqCst)
    }

    pub fn hc_hits(&self) -> u64 {
        self.inner.hc_hits.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }
}
