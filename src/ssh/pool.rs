use super::hostkey::{HostKeyDecision, KnownHosts};
use super::{ConnectTarget, TransportConfig};
use crate::error::{CaamError, Result, TransportErrorKind};
use russh::client::{self, Handle};
use russh_sftp::client::SftpSession;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

const DEFAULT_KEY_NAMES: &[&str] = &["id_ed25519", "id_rsa", "id_ecdsa", "id_dsa"];

struct TofuHandler {
    known_hosts: Arc<std::sync::Mutex<KnownHosts>>,
    host: String,
    port: u16,
    insecure: bool,
}

#[async_trait::async_trait]
impl client::Handler for TofuHandler {
    type Error = CaamError;

    async fn check_server_key(&mut self, server_public_key: &russh_keys::key::PublicKey) -> std::result::Result<bool, Self::Error> {
        if self.insecure {
            return Ok(true);
        }
        let key_bytes = server_public_key.public_key_bytes();
        let decision = {
            let hosts = self.known_hosts.lock().unwrap();
            hosts.check(&self.host, self.port, &key_bytes)
        };
        match decision {
            HostKeyDecision::Match => Ok(true),
            HostKeyDecision::Unknown => {
                let mut hosts = self.known_hosts.lock().unwrap();
                hosts.trust(&self.host, self.port, &key_bytes)?;
                Ok(true)
            }
            HostKeyDecision::Mismatch => {
                Err(CaamError::transport(format!("{}:{}", self.host, self.port), TransportErrorKind::HostKeyMismatch))
            }
        }
    }
}

/// A dialled, authenticated session plus a lazily-opened SFTP subsystem. The
/// `Mutex`es serialize use of one connection: a `russh` handle and an SFTP
/// session are not safely driven from two tasks at once.
pub struct PooledConnection {
    handle: AsyncMutex<Handle<TofuHandler>>,
    sftp: AsyncMutex<Option<SftpSession>>,
}

impl PooledConnection {
    async fn sftp_session(&self) -> Result<tokio::sync::MutexGuard<'_, Option<SftpSession>>> {
        let mut guard = self.sftp.lock().await;
        if guard.is_none() {
            let mut handle = self.handle.lock().await;
            let channel = handle
                .channel_open_session()
                .await
                .map_err(|_| CaamError::transport("peer", TransportErrorKind::Network))?;
            channel
                .request_subsystem(true, "sftp")
                .await
                .map_err(|_| CaamError::transport("peer", TransportErrorKind::Sftp))?;
            let session = SftpSession::new(channel.into_stream())
                .await
                .map_err(|_| CaamError::transport("peer", TransportErrorKind::Sftp))?;
            *guard = Some(session);
        }
        Ok(guard)
    }

    pub async fn read(&self, remote_path: &str) -> Result<Vec<u8>> {
        let guard = self.sftp_session().await?;
        let sftp = guard.as_ref().expect("populated above");
        sftp.read(remote_path).await.map_err(|_| CaamError::transport(remote_path, TransportErrorKind::Sftp))
    }

    /// Atomic remote write: write to `<remote_path>.tmp`, chmod 0600, rename
    /// over `remote_path` — the SFTP analogue of `atomic::write`.
    pub async fn write_atomic(&self, remote_path: &str, bytes: &[u8]) -> Result<()> {
        let guard = self.sftp_session().await?;
        let sftp = guard.as_ref().expect("populated above");
        let tmp_path = format!("{remote_path}.tmp");
        sftp.write(&tmp_path, bytes).await.map_err(|_| CaamError::transport(remote_path, TransportErrorKind::Sftp))?;
        sftp.set_metadata(&tmp_path, russh_sftp::protocol::FileAttributes { permissions: Some(0o600), ..Default::default() })
            .await
            .map_err(|_| CaamError::transport(remote_path, TransportErrorKind::Sftp))?;
        sftp.rename(&tmp_path, remote_path).await.map_err(|_| CaamError::transport(remote_path, TransportErrorKind::Sftp))
    }

    pub async fn stat(&self, remote_path: &str) -> Result<russh_sftp::protocol::FileAttributes> {
        let guard = self.sftp_session().await?;
        let sftp = guard.as_ref().expect("populated above");
        sftp.metadata(remote_path).await.map_err(|e| {
            if matches!(e, russh_sftp::client::error::Error::Status(ref s) if s.status_code == russh_sftp::protocol::StatusCode::NoSuchFile) {
                CaamError::not_found(remote_path)
            } else {
                CaamError::transport(remote_path, TransportErrorKind::Sftp)
            }
        })
    }

    pub async fn mkdir_all(&self, remote_dir: &str) -> Result<()> {
        let guard = self.sftp_session().await?;
        let sftp = guard.as_ref().expect("populated above");
        let mut built = String::new();
        for segment in remote_dir.split('/').filter(|s| !s.is_empty()) {
            built.push('/');
            built.push_str(segment);
            let attrs = russh_sftp::protocol::FileAttributes { permissions: Some(0o700), ..Default::default() };
            let _ = sftp.create_dir(&built, attrs).await;
        }
        Ok(())
    }

    pub async fn list(&self, remote_dir: &str) -> Result<Vec<String>> {
        let guard = self.sftp_session().await?;
        let sftp = guard.as_ref().expect("populated above");
        match sftp.read_dir(remote_dir).await {
            Ok(entries) => Ok(entries.into_iter().map(|e| e.file_name()).filter(|n| n != "." && n != "..").collect()),
            Err(e) => {
                if matches!(e, russh_sftp::client::error::Error::Status(ref s) if s.status_code == russh_sftp::protocol::StatusCode::NoSuchFile) {
                    Ok(Vec::new())
                } else {
                    Err(CaamError::transport(remote_dir, TransportErrorKind::Sftp))
                }
            }
        }
    }

    pub async fn remove(&self, remote_path: &str) -> Result<()> {
        let guard = self.sftp_session().await?;
        let sftp = guard.as_ref().expect("populated above");
        sftp.remove_file(remote_path).await.map_err(|_| CaamError::transport(remote_path, TransportErrorKind::Sftp))
    }

    pub async fn batch_read(&self, remote_paths: &[String]) -> Vec<Result<Vec<u8>>> {
        let mut out = Vec::with_capacity(remote_paths.len());
        for path in remote_paths {
            out.push(self.read(path).await);
        }
        out
    }

    pub async fn batch_write(&self, items: &[(String, Vec<u8>)]) -> Vec<Result<()>> {
        let mut out = Vec::with_capacity(items.len());
        for (path, bytes) in items {
            out.push(self.write_atomic(path, bytes).await);
        }
        out
    }
}

pub struct ConnectionPool {
    connections: std::sync::Mutex<HashMap<Uuid, Arc<PooledConnection>>>,
    known_hosts: Arc<std::sync::Mutex<KnownHosts>>,
    config: TransportConfig,
}

impl ConnectionPool {
    pub fn new(config: TransportConfig) -> Result<Self> {
        let known_hosts = KnownHosts::load(&config.known_hosts_path)?;
        Ok(Self { connections: std::sync::Mutex::new(HashMap::new()), known_hosts: Arc::new(std::sync::Mutex::new(known_hosts)), config })
    }

    pub async fn get(&self, target: &ConnectTarget) -> Result<Arc<PooledConnection>> {
        if let Some(existing) = self.connections.lock().unwrap().get(&target.id).cloned() {
            if existing.handle.lock().await.is_closed() {
                self.connections.lock().unwrap().remove(&target.id);
            } else {
                return Ok(existing);
            }
        }

        let connection = Arc::new(self.dial(target).await?);
        self.connections.lock().unwrap().insert(target.id, connection.clone());
        Ok(connection)
    }

    pub fn evict(&self, id: Uuid) {
        self.connections.lock().unwrap().remove(&id);
    }

    async fn dial(&self, target: &ConnectTarget) -> Result<PooledConnection> {
        let handler = TofuHandler {
            known_hosts: self.known_hosts.clone(),
            host: target.host.clone(),
            port: target.port,
            insecure: self.config.insecure_skip_host_key_check,
        };

        let addr = format!("{}:{}", target.host, target.port);
        let client_config = Arc::new(client::Config::default());
        let mut handle = tokio::time::timeout(self.config.connect_timeout, client::connect(client_config, addr, handler))
            .await
            .map_err(|_| CaamError::transport(&target.host, TransportErrorKind::Timeout))?
            .map_err(|_| CaamError::transport(&target.host, TransportErrorKind::Network))?;

        self.authenticate(&mut handle, target).await?;
        Ok(PooledConnection { handle: AsyncMutex::new(handle), sftp: AsyncMutex::new(None) })
    }

    /// Try SSH agent, then the machine-specific key, then the standard
    /// default key files, in that order (SPEC_FULL §4.5).
    async fn authenticate(&self, handle: &mut Handle<TofuHandler>, target: &ConnectTarget) -> Result<()> {
        if std::env::var_os("SSH_AUTH_SOCK").is_some() {
            if self.try_agent_auth(handle, &target.user).await {
                return Ok(());
            }
        }

        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(key_path) = &target.key_path {
            candidates.push(key_path.clone());
        }
        if let Some(home) = dirs::home_dir() {
            for name in DEFAULT_KEY_NAMES {
                candidates.push(home.join(".ssh").join(name));
            }
        }

        for candidate in candidates {
            if !candidate.is_file() {
                continue;
            }
            let Ok(key_pair) = russh_keys::load_secret_key(&candidate, None) else { continue };
            let auth = handle
                .authenticate_publickey(&target.user, Arc::new(key_pair))
                .await
                .map_err(|_| CaamError::transport(&target.host, TransportErrorKind::Network))?;
            if auth {
                return Ok(());
            }
        }

        Err(CaamError::auth(format!("no usable key succeeded for {}@{}", target.user, target.host)))
    }

    async fn try_agent_auth(&self, handle: &mut Handle<TofuHandler>, user: &str) -> bool {
        let Ok(mut agent) = russh_keys::agent::client::AgentClient::connect_env().await else { return false };
        let Ok(identities) = agent.request_identities().await else { return false };
        for identity in identities {
            if let Ok(auth) = handle.authenticate_future(user, identity, agent).await {
                if auth.0 {
                    return true;
                }
                agent = auth.1;
            } else {
                return false;
            }
        }
        false
    }
}

