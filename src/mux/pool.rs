// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use tracing::{debug, info};

use crate::{
    mux::session::{Session, SessionConfig},
    transport::Connector,
};

/// Maximum number of registered streams a session may host before the pool
/// considers it full and dials a new one.
pub const MAX_STREAMS_PER_SESSION: usize = 20;

/// Maintains a set of outbound (initiator) sessions on the local side,
/// handing a caller a session with spare capacity or dialing a new one.
/// Grounded on `client::pool_sessions::Pool`'s `DashMap` + scan-evict-then-
/// insert shape; unlike the teacher's pool, sessions here never need a
/// back-reference into the pool (there is no unsolicited-reply routing use
/// case), so there is no `OnceCell<Weak<Pool>>` — see DESIGN.md.
pub struct Pool {
    connector: Connector,
    sessions: DashMap<u64, Arc<Session>>,
    next_id: AtomicU64,
    max_streams_per_session: usize,
    session_config: SessionConfig,
}

impl Pool {
    pub fn new(connector: Connector, session_config: SessionConfig) -> Self {
        Self {
            connector,
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            max_streams_per_session: MAX_STREAMS_PER_SESSION,
            session_config,
        }
    }

    /// Scans for a session with spare capacity, evicting dead ones as it
    /// goes; dials a fresh transport and starts a new session if none
    /// qualifies. Dial failures propagate to the caller; the pool does not
    /// retry.
    pub async fn get(&self) -> anyhow::Result<Arc<Session>> {
        self.sessions.retain(|_, session| !session.is_dead());

        if let Some(entry) = self
            .sessions
            .iter()
            .find(|entry| entry.value().stream_count() < self.max_streams_per_session)
        {
            return Ok(Arc::clone(entry.value()));
        }

        debug!("no session with spare capacity, dialing a new transport");
        let transport = (self.connector)().await?;
        let session = Session::client(transport, self.session_config.clone());
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sessions.insert(id, Arc::clone(&session));
        info!(session_id = id, "new session added to pool");
        Ok(session)
    }

    /// Number of sessions currently tracked, including any not yet reaped by
    /// a `get()` scan.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
