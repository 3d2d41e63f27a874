//! Shared fixtures for server integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use tether_core::{
    Method, RpcErrorCode, RpcFailure, ServerConfig, SessionId, SessionRef, UserId,
};
use tether_server::{
    BroadcastNotifier, ConnectionRegistry, Gateway, MembershipLoader, MemorySessionStore,
    MemoryUserStore, PresenceTracker, RpcHandler, SessionObserver, StaticMemberships,
    StaticTokenAuthenticator,
};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn session(user: u64, session: u64) -> SessionRef {
    SessionRef::new(UserId::new(user), SessionId::new(session))
}

/// Answers a handful of methods the way an application server would
pub struct EchoHandler;

#[async_trait]
impl RpcHandler for EchoHandler {
    async fn handle(
        &self,
        session: SessionRef,
        method: Method,
        input: Vec<u8>,
    ) -> Result<Vec<u8>, RpcFailure> {
        match method {
            Method::GetMe => Ok(session.user_id.to_string().into_bytes()),
            Method::SendMessage => Ok(input),
            Method::InviteToSpace => Err(RpcFailure::new(
                RpcErrorCode::SpaceAdminRequired,
                "only admins can invite",
            )),
            _ => Err(RpcFailure::new(RpcErrorCode::BadRequest, "unsupported")),
        }
    }
}

/// A gateway on a loopback port with in-memory collaborators
pub struct TestServer {
    pub gateway: Gateway,
    pub addr: SocketAddr,
    pub sessions: Arc<MemorySessionStore>,
    pub users: Arc<MemoryUserStore>,
    pub notifier: BroadcastNotifier,
    pub tracker: PresenceTracker,
    pub memberships: Arc<StaticMemberships>,
    pub auth: Arc<StaticTokenAuthenticator>,
}

impl TestServer {
    pub async fn start() -> Self {
        let config = ServerConfig::testing();
        let sessions = Arc::new(MemorySessionStore::new());
        let users = Arc::new(MemoryUserStore::new());
        let notifier = BroadcastNotifier::default();
        let tracker = PresenceTracker::spawn(
            config.presence.clone(),
            sessions.clone(),
            users.clone(),
            Arc::new(notifier.clone()),
        );
        let memberships = Arc::new(StaticMemberships::new());
        let auth = Arc::new(StaticTokenAuthenticator::new());

        let observer: Arc<dyn SessionObserver> = Arc::new(tracker.clone());
        let loader: Arc<dyn MembershipLoader> = memberships.clone();
        let registry = ConnectionRegistry::with_collaborators(
            config.registry.clone(),
            Some(observer),
            Some(loader),
        );
        let gateway = Gateway::new(config, registry, auth.clone(), Arc::new(EchoHandler))
            .expect("valid server config");

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let serving = gateway.clone();
        tokio::spawn(async move { serving.serve(listener).await });

        Self {
            gateway,
            addr,
            sessions,
            users,
            notifier,
            tracker,
            memberships,
            auth,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    /// Register a session and a token that authenticates as it
    pub fn add_user(&self, token: &str, session: SessionRef) {
        self.sessions.add_session(session);
        self.auth.insert(token, session);
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        self.gateway.registry()
    }
}

/// Poll `condition` until it holds or the test timeout passes
pub async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
