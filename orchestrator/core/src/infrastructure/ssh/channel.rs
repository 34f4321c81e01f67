// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use std::net::SocketAddr;
use tracing::debug;

use crate::domain::bridge::{BoxedDuplex, BridgeError, SubChannelDialer, FS_CHANNEL_ADDRESS};

/// Opens `forwarded-tcpip` channels addressed to [`FS_CHANNEL_ADDRESS`] back to
/// the connected caller.
#[derive(Clone)]
pub struct ChannelDialer {
    handle: russh::server::Handle,
    peer: SocketAddr,
}

impl ChannelDialer {
    pub fn new(handle: russh::server::Handle, peer: SocketAddr) -> Self {
        Self { handle, peer }
    }
}

#[async_trait]
impl SubChannelDialer for ChannelDialer {
    async fn open_fs_channel(&self, originator: Option<SocketAddr>) -> Result<BoxedDuplex, BridgeError> {
        let (orig_host, orig_port) = match originator {
            Some(addr) => (addr.ip().to_string(), u32::from(addr.port())),
            None => ("127.0.0.1".to_string(), 0),
        };
        debug!(
            "Opening {} sub-channel to {} for {}:{}",
            FS_CHANNEL_ADDRESS, self.peer, orig_host, orig_port
        );

        let channel = self
            .handle
            .channel_open_forwarded_tcpip(FS_CHANNEL_ADDRESS, 0, orig_host, orig_port)
            .await
            .map_err(|e| BridgeError::ChannelOpen(format!("{} refused: {}", self.peer, e)))?;

        Ok(Box::pin(channel.into_stream()))
    }
}
