//! VPN client implementation.
//!
//! The client mints its authentication token, brings up the TUN device once,
//! then hands control to the reconnect supervisor: dial, run until the
//! connection dies, pause, redial. The attempt counter is reset by the
//! engine whenever a packet actually makes it into the tunnel, so only
//! consecutive dead connections count toward the ceiling.

use crate::auth;
use crate::channel::TunnelChannel;
use crate::config::VpnOptions;
use crate::crypto::PacketCipher;
use crate::device::{spawn_device_writer, TunConfig, TunDevice, DEVICE_CHANNEL_SIZE};
use crate::engine::Engine;
use crate::error::{VpnError, VpnResult};
use crate::peers::PeerRecord;
use crate::routes::{self, RouteGuard, RoutePlan};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Pause between reconnect attempts.
pub const TIME_TO_TRY: Duration = Duration::from_secs(5);
/// Consecutive failed attempts after which the client gives up.
pub const MAX_TRY: u32 = 10;

/// VPN client instance.
pub struct VpnClient {
    options: VpnOptions,
}

/// The conventional gateway: first host address of the virtual subnet.
fn gateway_of(net: &Ipv4Net) -> Ipv4Addr {
    net.hosts().next().unwrap_or_else(|| net.addr())
}

impl VpnClient {
    /// Create a new VPN client.
    pub fn new(options: VpnOptions) -> VpnResult<Self> {
        if options.is_server {
            return Err(VpnError::Config(
                "client role requested with server options".into(),
            ));
        }
        if options.users.len() != 1 {
            return Err(VpnError::Config(
                "client role requires exactly one credential".into(),
            ));
        }
        Ok(Self { options })
    }

    /// Run the client until the reconnect budget is exhausted.
    pub async fn run(self) -> VpnResult<()> {
        let options = self.options;
        let user = &options.users[0];
        let (token, key) = auth::make_token(&user.name, &user.password)?;
        let cipher = Arc::new(PacketCipher::new(&key));
        log::debug!("minted session token for user {}", user.name);

        let mut tun_config = TunConfig::new(options.local_addr, options.mtu);
        if let Some(ref name) = options.tun_name {
            tun_config = tun_config.with_name(name);
        }
        let device = TunDevice::create(tun_config)?;
        let tun_name = device.name().to_string();
        let (reader, writer) = device.split()?;

        let (dev_tx, dev_rx) = mpsc::channel(DEVICE_CHANNEL_SIZE);
        let _writer_task = spawn_device_writer(writer, dev_rx);

        let tries = Arc::new(AtomicU32::new(0));
        let engine = Arc::new(Engine::new(
            false,
            options.local_addr,
            options.blacklist.iter().copied(),
            &[],
            dev_tx,
            Some(tries.clone()),
        ));

        let pump_engine = engine.clone();
        tokio::spawn(async move {
            pump_engine.device_pump(reader).await;
        });

        let _routes = RouteGuard::install(
            routes::platform()?,
            RoutePlan {
                tun_name,
                local_addr: options.local_addr,
                is_server: false,
                default_gateway: options.default_gateway,
                whitelist: options.whitelist.clone(),
                blacklist: options.blacklist.clone(),
            },
        )?;

        // The single peer the client ever registers: the server, keyed by
        // the subnet's gateway address.
        let gateway = gateway_of(&options.local_addr);

        loop {
            if tries.fetch_add(1, Ordering::SeqCst) >= MAX_TRY {
                log::error!("Failed to connect to server");
                return Err(VpnError::ReconnectExhausted(MAX_TRY));
            }

            match TunnelChannel::connect(
                &options.server_addr,
                options.host_header.as_deref(),
                &token,
            )
            .await
            {
                Ok(tunnel) => {
                    engine.peers().delete(gateway);
                    engine
                        .peers()
                        .update(gateway, PeerRecord::new(tunnel.handle(), cipher.clone()));
                    log::info!("tunnel established to {}", options.server_addr);

                    match tunnel.run(engine.clone(), cipher.clone()).await {
                        Ok(()) => log::info!("tunnel closed by server"),
                        Err(e) => log::warn!("tunnel failed: {}", e),
                    }
                    engine.peers().delete(gateway);
                }
                Err(e) => log::error!("connect failed: {}", e),
            }

            log::info!(
                "retrying in {}s (attempt {}/{})",
                TIME_TO_TRY.as_secs(),
                tries.load(Ordering::SeqCst),
                MAX_TRY
            );
            tokio::time::sleep(TIME_TO_TRY).await;
        }
    }
}
