//! Bounded per-host pool of remote-shell sessions.
//!
//! Each host owns a semaphore limiting concurrent checkouts and a queue of
//! idle sessions shared by every user connecting to it. A checked-out
//! session is exclusive to its holder and goes back to the idle queue when
//! the [`PooledSession`] guard drops. When a host is at its session cap and
//! a user needs a fresh session, the host's oldest idle session is evicted
//! to make room. Idle sessions older than the idle timeout are discarded on
//! checkout and by the sweeper.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use super::shell::{CommandOutput, RemoteSession, SessionConnector, SessionKey, ShellError};

/// Pool sizing and recycling policy.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_per_host: usize,
    pub idle_timeout: Duration,
}

struct IdleSession<S> {
    user: String,
    session: S,
    idle_since: Instant,
}

struct HostPool<S> {
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleSession<S>>>,
    max_sessions: usize,
    idle_timeout: Duration,
    closed: AtomicBool,
}

impl<S: RemoteSession> HostPool<S> {
    fn new(settings: PoolSettings) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(settings.max_per_host)),
            idle: Mutex::new(VecDeque::new()),
            max_sessions: settings.max_per_host,
            idle_timeout: settings.idle_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Most recently returned live session for `user`, dropping stale ones.
    ///
    /// On a miss the caller is about to open a session, so the oldest idle
    /// sessions of other users are evicted until it fits under the cap.
    /// Must be called while holding a checkout permit.
    fn take_idle(&self, user: &str, now: Instant) -> Option<S> {
        let mut idle = self.idle.lock();
        idle.retain(|entry| !self.expired(entry, now));
        if let Some(pos) = idle.iter().rposition(|entry| entry.user == user) {
            return idle.remove(pos).map(|entry| entry.session);
        }

        let in_use = self.max_sessions.saturating_sub(self.permits.available_permits());
        while !idle.is_empty() && idle.len() + in_use > self.max_sessions {
            if let Some(evicted) = idle.pop_front() {
                tracing::debug!(user = %evicted.user, "evicted oldest idle session");
            }
        }
        None
    }

    fn checkin(&self, user: String, session: S) {
        if self.closed.load(Ordering::Acquire) || session.is_closed() {
            return;
        }
        self.idle.lock().push_back(IdleSession {
            user,
            session,
            idle_since: Instant::now(),
        });
    }

    fn sweep(&self, now: Instant) -> usize {
        let mut idle = self.idle.lock();
        let before = idle.len();
        idle.retain(|entry| !self.expired(entry, now));
        before - idle.len()
    }

    fn expired(&self, entry: &IdleSession<S>, now: Instant) -> bool {
        entry.session.is_closed() || now.duration_since(entry.idle_since) >= self.idle_timeout
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.permits.close();
        self.idle.lock().clear();
    }

    fn idle_len(&self, user: &str) -> usize {
        self.idle.lock().iter().filter(|entry| entry.user == user).count()
    }
}

/// Exclusive handle on a pooled session.
///
/// Returned to the pool on drop unless [`PooledSession::discard`] was called.
pub struct PooledSession<S: RemoteSession> {
    session: Option<S>,
    user: String,
    host: Arc<HostPool<S>>,
    discard: bool,
    _permit: OwnedSemaphorePermit,
}

impl<S: RemoteSession> PooledSession<S> {
    /// Runs `command` on the held session.
    pub async fn exec(&mut self, command: &str) -> Result<CommandOutput, ShellError> {
        match self.session.as_mut() {
            Some(session) => session.exec(command).await,
            None => Err(ShellError::PoolClosed),
        }
    }

    /// Marks the session broken so it is closed instead of reused.
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl<S: RemoteSession> Drop for PooledSession<S> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if !self.discard {
                self.host.checkin(std::mem::take(&mut self.user), session);
            }
        }
    }
}

/// Session pool scoped to the collector's lifetime.
pub struct SessionPool<C: SessionConnector> {
    connector: C,
    hosts: DashMap<String, Arc<HostPool<C::Session>>>,
    settings: PoolSettings,
    closed: AtomicBool,
}

impl<C: SessionConnector> SessionPool<C> {
    pub fn new(connector: C, settings: PoolSettings) -> Self {
        Self {
            connector,
            hosts: DashMap::new(),
            settings: PoolSettings {
                max_per_host: settings.max_per_host.max(1),
                ..settings
            },
            closed: AtomicBool::new(false),
        }
    }

    /// Checks out a session for `key`, reusing an idle one when possible.
    ///
    /// Waits only while every session of the host is checked out.
    pub async fn checkout(
        &self,
        key: &SessionKey,
        password: &str,
    ) -> Result<PooledSession<C::Session>, ShellError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ShellError::PoolClosed);
        }
        let host = self.host_pool(key);
        let permit = Arc::clone(&host.permits)
            .acquire_owned()
            .await
            .map_err(|_| ShellError::PoolClosed)?;

        let session = match host.take_idle(&key.user, Instant::now()) {
            Some(session) => {
                tracing::debug!(session = %key, "reusing pooled session");
                session
            }
            None => {
                let session = self.connector.connect(key, password).await?;
                tracing::debug!(session = %key, "opened remote session");
                session
            }
        };

        Ok(PooledSession {
            session: Some(session),
            user: key.user.clone(),
            host,
            discard: false,
            _permit: permit,
        })
    }

    /// Drops idle sessions past the idle timeout. Returns how many.
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        self.hosts.iter().map(|entry| entry.value().sweep(now)).sum()
    }

    /// Runs [`SessionPool::sweep_idle`] periodically until cancelled.
    pub fn spawn_idle_sweeper(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let period = (self.settings.idle_timeout / 2).max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let swept = self.sweep_idle();
                        if swept > 0 {
                            tracing::debug!(swept, "recycled idle sessions");
                        }
                    }
                }
            }
        })
    }

    /// Closes every idle session and rejects further checkouts.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        for entry in self.hosts.iter() {
            entry.value().close();
        }
        tracing::info!(hosts = self.hosts.len(), "session pool shut down");
    }

    /// Idle sessions currently held for `key`.
    pub fn idle_count(&self, key: &SessionKey) -> usize {
        self.hosts
            .get(&key.host)
            .map(|host| host.idle_len(&key.user))
            .unwrap_or(0)
    }

    fn host_pool(&self, key: &SessionKey) -> Arc<HostPool<C::Session>> {
        if let Some(host) = self.hosts.get(&key.host) {
            return Arc::clone(host.value());
        }
        let settings = self.settings;
        Arc::clone(
            self.hosts
                .entry(key.host.clone())
                .or_insert_with(|| Arc::new(HostPool::new(settings)))
                .value(),
        )
    }
}
