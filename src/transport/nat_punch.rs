use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::{BufMut, BytesMut};
#[cfg(test)] use mockall::automock;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::NetworkConfig;
use crate::transport::Transport;
use crate::util::buf_ext::{BufExt, BufMutExt};
use crate::util::periodic::PeriodicTask;

/// Token of a single punch-through attempt, echoed back by the facilitator on success
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct NatPunchId(pub Uuid);

impl NatPunchId {
    pub fn random() -> NatPunchId {
        NatPunchId(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> anyhow::Result<NatPunchId> {
        Ok(NatPunchId(Uuid::parse_str(s)?))
    }
}

impl Display for NatPunchId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}


#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FacilitatorRequestType {
    RegisterPeer = 0,
    UnregisterPeer = 1,
    RequestIntroduction = 2,
    RequestExternalEndpoint = 3,
}

/// Unconnected datagrams sent to the NAT facilitator: a request type byte followed by the
///  request's fields
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FacilitatorRequest {
    RegisterPeer {
        internal: SocketAddr,
    },
    UnregisterPeer,
    RequestIntroduction {
        internal: SocketAddr,
        remote: SocketAddr,
        token: NatPunchId,
    },
    RequestExternalEndpoint,
}

impl FacilitatorRequest {
    pub fn request_type(&self) -> FacilitatorRequestType {
        match self {
            FacilitatorRequest::RegisterPeer { .. } => FacilitatorRequestType::RegisterPeer,
            FacilitatorRequest::UnregisterPeer => FacilitatorRequestType::UnregisterPeer,
            FacilitatorRequest::RequestIntroduction { .. } => FacilitatorRequestType::RequestIntroduction,
            FacilitatorRequest::RequestExternalEndpoint => FacilitatorRequestType::RequestExternalEndpoint,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.request_type().into());
        match self {
            FacilitatorRequest::RegisterPeer { internal } => {
                buf.put_socket_addr(internal);
            }
            FacilitatorRequest::RequestIntroduction { internal, remote, token } => {
                buf.put_socket_addr(internal);
                buf.put_socket_addr(remote);
                buf.put_string(&token.to_string());
            }
            FacilitatorRequest::UnregisterPeer | FacilitatorRequest::RequestExternalEndpoint => {}
        }
    }

    pub fn deser(buf: &mut &[u8]) -> anyhow::Result<FacilitatorRequest> {
        let request_type = FacilitatorRequestType::try_from(buf.try_read_u8()?)
            .map_err(|e| anyhow!("invalid facilitator request type: {}", e))?;

        let result = match request_type {
            FacilitatorRequestType::RegisterPeer => FacilitatorRequest::RegisterPeer {
                internal: buf.try_read_socket_addr()?,
            },
            FacilitatorRequestType::UnregisterPeer => FacilitatorRequest::UnregisterPeer,
            FacilitatorRequestType::RequestIntroduction => FacilitatorRequest::RequestIntroduction {
                internal: buf.try_read_socket_addr()?,
                remote: buf.try_read_socket_addr()?,
                token: NatPunchId::parse(&buf.try_read_string()?)?,
            },
            FacilitatorRequestType::RequestExternalEndpoint => FacilitatorRequest::RequestExternalEndpoint,
        };
        if !buf.is_empty() {
            bail!("{} trailing bytes after facilitator request", buf.len());
        }
        Ok(result)
    }
}


/// The service that introduces two peers to each other
#[cfg_attr(test, automock)]
pub trait NatFacilitator: Send {
    fn request_introduction(&mut self, remote: SocketAddr, token: NatPunchId);

    /// queued datagrams and their destinations, removed from the queue
    fn take_outgoing(&mut self) -> Vec<(SocketAddr, BytesMut)>;
}

/// Talks to a facilitator at a fixed address through unconnected datagrams
pub struct FacilitatorConnection {
    facilitator: SocketAddr,
    internal: SocketAddr,
    outbox: Vec<FacilitatorRequest>,
}

impl FacilitatorConnection {
    pub fn new(facilitator: SocketAddr, internal: SocketAddr) -> FacilitatorConnection {
        FacilitatorConnection {
            facilitator,
            internal,
            outbox: Vec::new(),
        }
    }

    pub fn register(&mut self) {
        self.outbox.push(FacilitatorRequest::RegisterPeer { internal: self.internal });
    }

    pub fn unregister(&mut self) {
        self.outbox.push(FacilitatorRequest::UnregisterPeer);
    }

    pub fn request_external_endpoint(&mut self) {
        self.outbox.push(FacilitatorRequest::RequestExternalEndpoint);
    }
}

impl NatFacilitator for FacilitatorConnection {
    fn request_introduction(&mut self, remote: SocketAddr, token: NatPunchId) {
        self.outbox.push(FacilitatorRequest::RequestIntroduction {
            internal: self.internal,
            remote,
            token,
        });
    }

    fn take_outgoing(&mut self) -> Vec<(SocketAddr, BytesMut)> {
        self.outbox.drain(..)
            .map(|request| {
                let mut buf = BytesMut::new();
                request.ser(&mut buf);
                (self.facilitator, buf)
            })
            .collect()
    }
}


pub type OnPunchSuccess = Box<dyn FnOnce(NatPunchId, SocketAddr) + Send>;
pub type OnPunchFailure = Box<dyn FnOnce(NatPunchId) + Send>;

struct PunchAttempt {
    started: Instant,
    remote: SocketAddr,
    on_success: OnPunchSuccess,
    on_failure: OnPunchFailure,
}

/// Book-keeping for punch-through attempts. Every attempt ends exactly once: with the facilitator
///  reporting success, with an explicit failure, or when it expires.
pub struct NatPunchClient<F: NatFacilitator> {
    facilitator: F,
    attempt_timeout: Duration,
    attempts: FxHashMap<NatPunchId, PunchAttempt>,
    cleanup: PeriodicTask,
}

impl <F: NatFacilitator> NatPunchClient<F> {
    pub fn new(facilitator: F, attempt_timeout: Duration, cleanup_interval: Duration) -> NatPunchClient<F> {
        NatPunchClient {
            facilitator,
            attempt_timeout,
            attempts: FxHashMap::default(),
            cleanup: PeriodicTask::new("nat punch cleanup", cleanup_interval),
        }
    }

    pub fn from_config(facilitator: F, config: &NetworkConfig) -> NatPunchClient<F> {
        NatPunchClient::new(facilitator, config.nat_punch_attempt_timeout, config.nat_punch_cleanup_interval)
    }

    pub fn facilitator_mut(&mut self) -> &mut F {
        &mut self.facilitator
    }

    pub fn num_pending(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_pending(&self, id: NatPunchId) -> bool {
        self.attempts.contains_key(&id)
    }

    pub fn punch(&mut self, remote: SocketAddr, on_success: OnPunchSuccess, on_failure: OnPunchFailure) -> NatPunchId {
        let id = NatPunchId::random();
        debug!(%id, ?remote, "requesting NAT punch-through");

        self.attempts.insert(id, PunchAttempt {
            started: Instant::now(),
            remote,
            on_success,
            on_failure,
        });
        self.facilitator.request_introduction(remote, id);
        id
    }

    /// Called with the endpoint the remote peer is actually reachable at, which may differ from
    ///  the endpoint the punch was requested for
    pub fn on_punch_success(&mut self, id: NatPunchId, endpoint: SocketAddr) {
        match self.attempts.remove(&id) {
            Some(attempt) => {
                info!(%id, requested = ?attempt.remote, ?endpoint, "NAT punch-through succeeded");
                (attempt.on_success)(id, endpoint);
            }
            None => debug!(%id, "NAT punch success for an attempt that is no longer pending - ignoring"),
        }
    }

    pub fn on_punch_failure(&mut self, id: NatPunchId) {
        if let Some(attempt) = self.attempts.remove(&id) {
            info!(%id, remote = ?attempt.remote, "NAT punch-through failed");
            (attempt.on_failure)(id);
        }
    }

    pub fn update(&mut self) {
        if !self.cleanup.poll() {
            return;
        }

        let now = Instant::now();
        let expired = self.attempts.iter()
            .filter(|(_, a)| now.duration_since(a.started) > self.attempt_timeout)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        for id in expired {
            if let Some(attempt) = self.attempts.remove(&id) {
                info!(%id, remote = ?attempt.remote, "NAT punch-through timed out");
                (attempt.on_failure)(id);
            }
        }
    }

    pub fn flush(&mut self, transport: &mut dyn Transport) {
        for (to, buf) in self.facilitator.take_outgoing() {
            if let Err(e) = transport.send_unconnected(to, &buf) {
                warn!(?to, "error sending request to NAT facilitator: {}", e);
            }
        }
    }

    /// Stops expiring attempts. Pending attempts can still be completed explicitly.
    pub fn dispose(&mut self) {
        self.cleanup.cancel();
    }
}
