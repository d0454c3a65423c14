//! VPN server implementation.
//!
//! The server owns a TUN device on the virtual subnet, accepts WebSocket
//! connections, authenticates each against the configured credential list
//! and serves it on its own task. Packets from the device route to the peer
//! owning the destination address; packets from peers either relay inside
//! the subnet or exit through the device into the host's routing stack.

use crate::channel;
use crate::config::VpnOptions;
use crate::device::{spawn_device_writer, TunConfig, TunDevice, DEVICE_CHANNEL_SIZE};
use crate::engine::Engine;
use crate::error::{VpnError, VpnResult};
use crate::routes::{self, RouteGuard, RoutePlan};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// VPN server instance.
pub struct VpnServer {
    options: VpnOptions,
}

impl VpnServer {
    /// Create a new VPN server.
    pub fn new(options: VpnOptions) -> VpnResult<Self> {
        if !options.is_server {
            return Err(VpnError::Config(
                "server role requested with client options".into(),
            ));
        }
        Ok(Self { options })
    }

    /// Run the server: device up, routes installed, then accept forever.
    pub async fn run(self) -> VpnResult<()> {
        let options = self.options;

        let mut tun_config = TunConfig::new(options.local_addr, options.mtu);
        if let Some(ref name) = options.tun_name {
            tun_config = tun_config.with_name(name);
        }
        let device = TunDevice::create(tun_config)?;
        let tun_name = device.name().to_string();
        let (reader, writer) = device.split()?;

        let (dev_tx, dev_rx) = mpsc::channel(DEVICE_CHANNEL_SIZE);
        let _writer_task = spawn_device_writer(writer, dev_rx);

        let engine = Arc::new(Engine::new(
            true,
            options.local_addr,
            options.blacklist.iter().copied(),
            &options.users,
            dev_tx,
            None,
        ));
        log::info!("serving {} configured user(s)", options.users.len());

        let pump_engine = engine.clone();
        tokio::spawn(async move {
            pump_engine.device_pump(reader).await;
        });

        let _routes = RouteGuard::install(
            routes::platform()?,
            RoutePlan {
                tun_name,
                local_addr: options.local_addr,
                is_server: true,
                default_gateway: options.default_gateway,
                whitelist: options.whitelist.clone(),
                blacklist: options.blacklist.clone(),
            },
        )?;

        let listener = TcpListener::bind(&options.server_addr)
            .await
            .map_err(|e| {
                VpnError::Transport(format!("failed to bind {}: {}", options.server_addr, e))
            })?;
        log::info!("listening on {}", options.server_addr);

        loop {
            let (stream, peer_addr) = listener.accept().await.map_err(VpnError::Network)?;
            log::debug!("inbound connection from {}", peer_addr);

            let engine = engine.clone();
            tokio::spawn(async move {
                match channel::accept_connection(stream, engine).await {
                    Ok(()) => log::debug!("connection from {} closed", peer_addr),
                    Err(e) => log::debug!("connection from {} ended: {}", peer_addr, e),
                }
            });
        }
    }
}
