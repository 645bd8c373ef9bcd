//! Smart SSH subtransport.
//!
//! Opens a russh session per connection, authenticates with credentials from
//! the remote's callback and runs `git-upload-pack` or `git-receive-pack` on
//! an exec channel. The channel carries both the advertisement and the
//! transfer, so the subtransport is registered as stateful.

use std::{sync::Arc, time::Duration};

use bytes::{Buf, Bytes};
use russh::{
    ChannelMsg, Disconnect,
    client::{self, Msg},
};
use russh_keys::{PublicKeyBase64, key};
use tokio::sync::Mutex as AsyncMutex;

use crate::{
    cert::{Certificate, HostkeyCertificate},
    config::SshConfig,
    credentials::{Credential, CredentialType},
    errors::GitError,
    transport::{
        core::{SmartSubtransport, SmartSubtransportStream, Transport},
        types::{ServiceType, SmartServiceAction},
        utils::{SshUrl, TransportRuntime, parse_ssh_url, ssh_command},
    },
};

/// Routes the server host key through the remote's certificate check.
struct HostKeyCheck {
    transport: Transport,
    host: String,
}

#[async_trait::async_trait]
impl client::Handler for HostKeyCheck {
    type Error = GitError;

    async fn check_server_key(&mut self, server_public_key: &key::PublicKey) -> Result<bool, GitError> {
        let cert = Certificate::Hostkey(HostkeyCertificate::from_key(
            &server_public_key.public_key_bytes(),
        ));
        // There is no known_hosts lookup here; the callback decides.
        self.transport.smart_certificate_check(&cert, true, &self.host)?;
        Ok(true)
    }
}

type Channel = Arc<AsyncMutex<russh::Channel<Msg>>>;

struct SshSession {
    service: ServiceType,
    handle: client::Handle<HostKeyCheck>,
    channel: Channel,
}

/// Built-in subtransport for `ssh://`, `ssh+git://`, `git+ssh://` and
/// scp-like URLs.
pub struct SshSubtransport {
    transport: Transport,
    config: SshConfig,
    runtime: Option<Arc<TransportRuntime>>,
    session: Option<SshSession>,
}

impl SshSubtransport {
    pub fn new(transport: Transport, config: SshConfig) -> Self {
        SshSubtransport {
            transport,
            config,
            runtime: None,
            session: None,
        }
    }

    fn runtime(&mut self) -> Result<Arc<TransportRuntime>, GitError> {
        if let Some(runtime) = &self.runtime {
            return Ok(runtime.clone());
        }
        let runtime = Arc::new(TransportRuntime::new(
            "git-bridge-ssh",
            self.config.worker_threads,
        )?);
        self.runtime = Some(runtime.clone());
        Ok(runtime)
    }

    async fn connect(
        transport: Transport,
        config: Arc<client::Config>,
        url: SshUrl,
        service: ServiceType,
    ) -> Result<SshSession, GitError> {
        let handler = HostKeyCheck {
            transport: transport.clone(),
            host: url.host.clone(),
        };
        let mut handle = client::connect(config, (url.host.as_str(), url.port), handler).await?;
        tracing::debug!(host = %url.host, port = url.port, "ssh connected");

        authenticate(&mut handle, &transport, url.user.as_deref()).await?;

        let channel = handle.channel_open_session().await?;
        let command = ssh_command(service, &url.path);
        tracing::debug!(%command, "ssh exec");
        channel.exec(true, command).await?;
        Ok(SshSession {
            service,
            handle,
            channel: Arc::new(AsyncMutex::new(channel)),
        })
    }

    fn disconnect(&mut self) -> Result<(), GitError> {
        let (Some(session), Some(runtime)) = (self.session.take(), self.runtime.clone()) else {
            return Ok(());
        };
        runtime.block_on(async {
            // The peer may already have closed; a failed EOF is not an error.
            let _ = session.channel.lock().await.eof().await;
            session
                .handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
        })??;
        tracing::debug!(service = %session.service, "ssh session closed");
        Ok(())
    }
}

/// Authenticates as the credential's user, falling back to the URL user.
async fn authenticate(
    handle: &mut client::Handle<HostKeyCheck>,
    transport: &Transport,
    url_user: Option<&str>,
) -> Result<(), GitError> {
    let credential = transport.smart_credentials(
        url_user,
        CredentialType::SSH_KEY | CredentialType::SSH_MEMORY | CredentialType::SSH_CUSTOM,
    )?;
    let accepted = match credential {
        Credential::SshKey {
            username,
            private_key,
            passphrase,
            ..
        } => {
            let key = russh_keys::load_secret_key(&private_key, passphrase.as_deref())?;
            handle.authenticate_publickey(username, Arc::new(key)).await?
        }
        Credential::SshMemory {
            username,
            private_key,
            passphrase,
            ..
        } => {
            let key = russh_keys::decode_secret_key(&private_key, passphrase.as_deref())?;
            handle.authenticate_publickey(username, Arc::new(key)).await?
        }
        Credential::SshCustom { username, key } => {
            handle.authenticate_publickey(username, key).await?
        }
        Credential::SshAgent { username } => authenticate_with_agent(handle, username).await?,
        other => {
            return Err(GitError::InvalidCredential(format!(
                "{:?} cannot authenticate an ssh session",
                other.kind()
            )));
        }
    };
    if accepted {
        Ok(())
    } else {
        Err(GitError::SshAuth(
            "server rejected the offered key".to_string(),
        ))
    }
}

async fn authenticate_with_agent(
    handle: &mut client::Handle<HostKeyCheck>,
    username: String,
) -> Result<bool, GitError> {
    let mut agent = russh_keys::agent::client::AgentClient::connect_env().await?;
    for identity in agent.request_identities().await? {
        // The agent is handed over for signing and returned with the result.
        let (returned, result) = handle
            .authenticate_future(username.clone(), identity, agent)
            .await;
        agent = returned;
        if result.map_err(|err| GitError::SshAuth(format!("ssh agent: {err:?}")))? {
            return Ok(true);
        }
    }
    Ok(false)
}

impl SmartSubtransport for SshSubtransport {
    fn action(
        &mut self,
        url: &str,
        action: SmartServiceAction,
    ) -> Result<Box<dyn SmartSubtransportStream>, GitError> {
        let service = action.service();
        let runtime = self.runtime()?;

        if self.session.as_ref().is_some_and(|s| s.service != service) {
            self.disconnect()?;
        }
        let channel = match &self.session {
            Some(session) => session.channel.clone(),
            None => {
                let url = parse_ssh_url(url, self.config.default_port)?;
                let config = Arc::new(client::Config {
                    inactivity_timeout: self.config.inactivity_timeout_secs.map(Duration::from_secs),
                    ..Default::default()
                });
                let session = runtime.block_on(Self::connect(
                    self.transport.clone(),
                    config,
                    url,
                    service,
                ))??;
                let channel = session.channel.clone();
                self.session = Some(session);
                channel
            }
        };
        Ok(Box::new(SshStream {
            runtime,
            channel,
            leftover: Bytes::new(),
            eof: false,
        }))
    }

    fn close(&mut self) -> Result<(), GitError> {
        self.disconnect()
    }

    fn free(&mut self) {
        if let Err(err) = self.disconnect() {
            tracing::debug!(error = %err, "ssh disconnect failed during free");
        }
        self.runtime = None;
    }
}

struct SshStream {
    runtime: Arc<TransportRuntime>,
    channel: Channel,
    leftover: Bytes,
    eof: bool,
}

impl SmartSubtransportStream for SshStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, GitError> {
        if self.leftover.is_empty() && !self.eof {
            let channel = self.channel.clone();
            let next = self.runtime.block_on(async move {
                let mut channel = channel.lock().await;
                loop {
                    match channel.wait().await {
                        Some(ChannelMsg::Data { data }) => {
                            return Some(Bytes::copy_from_slice(&data));
                        }
                        Some(ChannelMsg::ExtendedData { data, ext }) => {
                            tracing::debug!(
                                ext,
                                message = %String::from_utf8_lossy(&data),
                                "ssh stderr"
                            );
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) if exit_status != 0 => {
                            tracing::debug!(exit_status, "remote command failed");
                        }
                        Some(ChannelMsg::Eof | ChannelMsg::Close) | None => return None,
                        Some(_) => {}
                    }
                }
            })?;
            match next {
                Some(chunk) => self.leftover = chunk,
                None => self.eof = true,
            }
        }
        let n = buf.len().min(self.leftover.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover.advance(n);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, GitError> {
        let channel = self.channel.clone();
        self.runtime
            .block_on(async move { channel.lock().await.data(buf).await })??;
        Ok(buf.len())
    }
}
