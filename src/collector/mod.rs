//! Remote stats collection over pooled shell sessions.
//!
//! Failures never escape a collector call: every transport, timeout or
//! non-zero exit is logged and reported as `None` for that host.

mod parse;
mod pool;
mod shell;
mod ssh;

use std::sync::Arc;

use async_trait::async_trait;

use crate::cluster::{Admin, ContainerStats, MachineStats};

pub use parse::{
    extract_host_port, parse_container_stats, parse_machine_stats, parse_percent,
    CONTAINER_STATS_COMMAND, MACHINE_STATS_COMMAND, SECTION_DELIMITER,
};
pub use pool::{PoolSettings, PooledSession, SessionPool};
pub use shell::{CommandOutput, RemoteSession, SessionConnector, SessionKey, ShellError};
pub use ssh::{SshConnector, SshSession, SshSettings};

/// Source of per-host telemetry for the monitor.
#[async_trait]
pub trait NodeCollector: Send + Sync + 'static {
    async fn machine_stats(&self, host: &str, admin: &Admin) -> Option<MachineStats>;

    async fn container_stats(&self, host: &str, admin: &Admin) -> Option<Vec<ContainerStats>>;
}

/// Collects stats by running commands on each host through a [`SessionPool`].
pub struct RemoteStatsCollector<C: SessionConnector> {
    pool: Arc<SessionPool<C>>,
}

impl<C: SessionConnector> RemoteStatsCollector<C> {
    pub fn new(pool: Arc<SessionPool<C>>) -> Self {
        Self { pool }
    }

    async fn run(&self, host: &str, admin: &Admin, command: &str) -> Option<String> {
        let key = SessionKey::new(admin.username.as_str(), host);
        let mut session = match self.pool.checkout(&key, &admin.password).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(host = %host, error = %e, "failed to open session");
                return None;
            }
        };

        match session.exec(command).await {
            Ok(output) if output.success() => Some(output.stdout),
            Ok(output) => {
                session.discard();
                tracing::warn!(
                    host = %host,
                    exit_status = ?output.exit_status,
                    stderr = %output.stderr.trim(),
                    "remote command failed"
                );
                None
            }
            Err(e) => {
                session.discard();
                tracing::warn!(host = %host, error = %e, "remote command error");
                None
            }
        }
    }
}

#[async_trait]
impl<C: SessionConnector> NodeCollector for RemoteStatsCollector<C> {
    async fn machine_stats(&self, host: &str, admin: &Admin) -> Option<MachineStats> {
        let stdout = self.run(host, admin, MACHINE_STATS_COMMAND).await?;
        Some(parse_machine_stats(&stdout))
    }

    async fn container_stats(&self, host: &str, admin: &Admin) -> Option<Vec<ContainerStats>> {
        let stdout = self.run(host, admin, CONTAINER_STATS_COMMAND).await?;
        Some(parse_container_stats(&stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Replies with canned output keyed by host.
    struct ScriptedSession {
        host: String,
    }

    #[async_trait]
    impl RemoteSession for ScriptedSession {
        async fn exec(&mut self, command: &str) -> Result<CommandOutput, ShellError> {
            match self.host.as_str() {
                "broken" => Ok(CommandOutput {
                    stdout: String::new(),
                    stderr: "docker: command not found".to_string(),
                    exit_status: Some(127),
                }),
                "hung" => Err(ShellError::Timeout(Duration::from_secs(1))),
                _ if command == MACHINE_STATS_COMMAND => Ok(CommandOutput {
                    stdout: "cpu=10\nmem=20\ndisk=30%\n".to_string(),
                    exit_status: Some(0),
                    ..Default::default()
                }),
                _ => Ok(CommandOutput {
                    stdout: format!(
                        "web|0.0.0.0:8080->80/tcp\n{SECTION_DELIMITER}\nweb|1%|2%\n{SECTION_DELIMITER}\n"
                    ),
                    exit_status: Some(0),
                    ..Default::default()
                }),
            }
        }

        fn is_closed(&self) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct ScriptedConnector {
        connects: AtomicUsize,
    }

    #[async_trait]
    impl SessionConnector for Arc<ScriptedConnector> {
        type Session = ScriptedSession;

        async fn connect(&self, key: &SessionKey, _password: &str) -> Result<ScriptedSession, ShellError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if key.host == "unreachable" {
                return Err(ShellError::Connect {
                    host: key.host.clone(),
                    reason: "no route to host".to_string(),
                });
            }
            Ok(ScriptedSession {
                host: key.host.clone(),
            })
        }
    }

    fn admin() -> Admin {
        Admin {
            username: "ops".to_string(),
            password: "secret".to_string(),
        }
    }

    type Scripted = Arc<ScriptedConnector>;

    fn collector() -> (Scripted, Arc<SessionPool<Scripted>>, RemoteStatsCollector<Scripted>) {
        let connector = Arc::new(ScriptedConnector::default());
        let pool = Arc::new(SessionPool::new(
            Arc::clone(&connector),
            PoolSettings {
                max_per_host: 2,
                idle_timeout: Duration::from_secs(60),
            },
        ));
        let collector = RemoteStatsCollector::new(Arc::clone(&pool));
        (connector, pool, collector)
    }

    #[tokio::test]
    async fn test_machine_stats_parsed() {
        let (_, _, collector) = collector();
        let stats = collector.machine_stats("n1", &admin()).await.unwrap();
        assert_eq!(stats.cpu, 10.0);
        assert_eq!(stats.memory, 20.0);
        assert_eq!(stats.disk, 30.0);
    }

    #[tokio::test]
    async fn test_container_stats_parsed() {
        let (_, _, collector) = collector();
        let containers = collector.container_stats("n1", &admin()).await.unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].external_port, "8080");
    }

    #[tokio::test]
    async fn test_session_reused_across_calls() {
        let (connector, _, collector) = collector();
        collector.machine_stats("n1", &admin()).await.unwrap();
        collector.container_stats("n1", &admin()).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_none() {
        let (_, _, collector) = collector();
        assert!(collector.machine_stats("unreachable", &admin()).await.is_none());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_none_and_discards() {
        let (_, pool, collector) = collector();
        assert!(collector.container_stats("broken", &admin()).await.is_none());
        assert_eq!(pool.idle_count(&SessionKey::new("ops", "broken")), 0);
    }

    #[tokio::test]
    async fn test_exec_error_is_none_and_discards() {
        let (_, pool, collector) = collector();
        assert!(collector.machine_stats("hung", &admin()).await.is_none());
        assert_eq!(pool.idle_count(&SessionKey::new("ops", "hung")), 0);
    }
}
