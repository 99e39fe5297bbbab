use futures::SinkExt;
use ragno_common::types::{
    Capability, ChainDetails, ChainStatus, HandshakeDetails, HostInfo,
};
use secp256k1::{PublicKey, SECP256K1, SecretKey};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{Instant, timeout};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::rlpx::{
    error::RLPxError,
    eth::StatusMessage,
    frame::RLPxCodec,
    handshake,
    message::Message,
    p2p::{
        DisconnectMessage, DisconnectReason, HelloMessage, PongMessage,
        supported_eth_capabilities,
    },
};

pub const DEFAULT_CONN_TIMEOUT: Duration = Duration::from_secs(30);
const STATUS_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum HostError {
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("rlpx handshake timed out")]
    HandshakeTimeout,
    #[error("status read deadline has elapsed")]
    StatusTimeout,
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Rlpx(#[from] RLPxError),
}

/// Outbound-only RLPx dialer. One instance serves every dial worker; the
/// only mutable state is the chain status advertised in status exchanges.
pub struct Host {
    signer: SecretKey,
    client_version: String,
    capabilities: Vec<Capability>,
    conn_timeout: Duration,
    local_status: Mutex<ChainStatus>,
}

impl Host {
    pub fn new(
        signer: SecretKey,
        client_version: String,
        conn_timeout: Duration,
        chain_status: ChainStatus,
    ) -> Self {
        Self {
            signer,
            client_version,
            capabilities: supported_eth_capabilities(),
            conn_timeout,
            local_status: Mutex::new(chain_status),
        }
    }

    pub async fn local_status(&self) -> ChainStatus {
        self.local_status.lock().await.clone()
    }

    /// Dials the node and runs the full handshake sequence: TCP connect,
    /// RLPx handshake, hello exchange and, when an eth version could be
    /// negotiated, the status exchange. Ends with a polite disconnect.
    ///
    /// The returned duration covers connect through the last exchange.
    pub async fn connect(
        &self,
        host_info: &HostInfo,
    ) -> Result<(HandshakeDetails, ChainDetails, Duration), HostError> {
        let started = Instant::now();

        let stream = timeout(self.conn_timeout, TcpStream::connect(host_info.tcp_addr()))
            .await
            .map_err(|_| HostError::ConnectTimeout)??;

        let mut framed = timeout(
            self.conn_timeout,
            self.encrypted_handshake(stream, host_info),
        )
        .await
        .map_err(|_| HostError::HandshakeTimeout)??;

        let result = self.identify(&mut framed).await;
        // the round trip ends with the last exchange, not the goodbye
        let rtt = started.elapsed();

        // always attempt a polite goodbye, whatever happened above
        let _ = framed
            .send(Message::Disconnect(DisconnectMessage::new(Some(
                DisconnectReason::ClientQuitting,
            ))))
            .await;
        let _ = framed.get_mut().shutdown().await;

        let (details, chain) = result?;
        Ok((details, chain, rtt))
    }

    async fn encrypted_handshake(
        &self,
        mut stream: TcpStream,
        host_info: &HostInfo,
    ) -> Result<Framed<TcpStream, RLPxCodec>, HostError> {
        let state = handshake::perform(&mut stream, &self.signer, host_info.public_key).await?;
        Ok(Framed::new(stream, RLPxCodec::new(state)))
    }

    async fn identify(
        &self,
        framed: &mut Framed<TcpStream, RLPxCodec>,
    ) -> Result<(HandshakeDetails, ChainDetails), HostError> {
        let details = self.exchange_hello(framed).await?;

        let chain = if details.negotiated_eth_version > 0 {
            timeout(
                STATUS_EXCHANGE_TIMEOUT,
                self.exchange_status(framed, details.negotiated_eth_version),
            )
            .await
            .map_err(|_| HostError::StatusTimeout)??
        } else {
            ChainDetails::default()
        };

        Ok((details, chain))
    }

    async fn exchange_hello(
        &self,
        framed: &mut Framed<TcpStream, RLPxCodec>,
    ) -> Result<HandshakeDetails, HostError> {
        let hello = HelloMessage::new(
            self.client_version.clone(),
            self.capabilities.clone(),
            PublicKey::from_secret_key(SECP256K1, &self.signer),
        );
        framed.send(Message::Hello(hello)).await?;

        let msg = match framed.next().await {
            Some(msg) => msg?,
            None => return Err(RLPxError::Disconnected.into()),
        };
        match msg {
            Message::Hello(remote) => {
                let negotiated = remote.negotiate_eth_version(&self.capabilities);
                debug!(
                    client = %remote.client_id,
                    eth_version = negotiated,
                    "hello exchanged"
                );
                Ok(HandshakeDetails {
                    client_name: remote.client_id,
                    software_info: remote.protocol_version,
                    capabilities: remote.capabilities,
                    negotiated_eth_version: negotiated,
                })
            }
            Message::Disconnect(disconnect) => {
                Err(RLPxError::HelloDisconnect(disconnect.reason()).into())
            }
            msg => Err(RLPxError::BadRequest(format!("expected Hello, got {msg}")).into()),
        }
    }

    async fn exchange_status(
        &self,
        framed: &mut Framed<TcpStream, RLPxCodec>,
        eth_version: u8,
    ) -> Result<ChainDetails, HostError> {
        let local = self.local_status().await;
        let status = StatusMessage::from_status(&local, eth_version as u32);
        framed.send(Message::Status(status)).await?;

        loop {
            let msg = match framed.next().await {
                Some(msg) => msg?,
                None => return Err(RLPxError::Disconnected.into()),
            };
            match msg {
                Message::Status(remote) => {
                    self.maybe_adopt_status(&remote).await;
                    return Ok(remote.chain_details());
                }
                Message::Ping(_) => {
                    framed.send(Message::Pong(PongMessage {})).await?;
                }
                Message::Disconnect(disconnect) => {
                    return Err(RLPxError::StatusDisconnect(disconnect.reason()).into());
                }
                msg => {
                    return Err(RLPxError::MessageNotHandled(msg.to_string()).into());
                }
            }
        }
    }

    /// A same-network peer reporting a higher total difficulty has a fresher
    /// view of the chain than we do, so its status becomes our status.
    async fn maybe_adopt_status(&self, remote: &StatusMessage) {
        let mut local = self.local_status.lock().await;
        if remote.network_id == local.network_id
            && remote.genesis == local.genesis_hash
            && remote.total_difficulty > local.total_difficulty
        {
            debug!(
                total_difficulty = %remote.total_difficulty,
                "adopting remote chain status"
            );
            local.total_difficulty = remote.total_difficulty;
            local.head_hash = remote.block_hash;
            local.fork_id = remote.fork_id;
        }
    }
}
