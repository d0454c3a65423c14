//! TUN device creation and management.

use crate::error::{VpnError, VpnResult};
use ipnet::Ipv4Net;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tun::{AbstractDevice, AsyncDevice, Configuration, DeviceReader, DeviceWriter};

/// Buffer size of the channel feeding the device writer task. All tunnel
/// connections share it, so it is sized above the per-connection buffers.
pub const DEVICE_CHANNEL_SIZE: usize = 512;

/// TUN device configuration.
#[derive(Debug, Clone)]
pub struct TunConfig {
    /// Device name (e.g., "tun0"). If None, the system assigns one.
    pub name: Option<String>,
    /// Virtual address and subnet for this end of the tunnel.
    pub address: Ipv4Net,
    /// MTU for the device.
    pub mtu: u16,
}

impl TunConfig {
    pub fn new(address: Ipv4Net, mtu: u16) -> Self {
        Self {
            name: None,
            address,
            mtu,
        }
    }

    /// Set the device name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// A managed TUN device with async I/O.
pub struct TunDevice {
    device: AsyncDevice,
    name: String,
    mtu: u16,
}

impl TunDevice {
    /// Create and bring up a TUN device with the given configuration.
    pub fn create(config: TunConfig) -> VpnResult<Self> {
        let mut tun_config = Configuration::default();
        tun_config
            .address(config.address.addr())
            .netmask(config.address.netmask())
            .mtu(config.mtu)
            .up();

        if let Some(ref name) = config.name {
            #[allow(deprecated)]
            tun_config.name(name);
        }

        #[cfg(target_os = "linux")]
        tun_config.platform_config(|platform_config| {
            platform_config.ensure_root_privileges(true);
        });

        let device = tun::create_as_async(&tun_config)
            .map_err(|e| VpnError::TunDevice(format!("failed to create TUN device: {}", e)))?;

        let name = device
            .tun_name()
            .map_err(|e| VpnError::TunDevice(format!("failed to get TUN name: {}", e)))?;

        log::info!("created TUN device {} with address {}", name, config.address);

        Ok(Self {
            device,
            name,
            mtu: config.mtu,
        })
    }

    /// Get the device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the MTU.
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Buffer size for reading packets (MTU + packet info header).
    pub fn buffer_size(&self) -> usize {
        self.mtu as usize + tun::PACKET_INFORMATION_LENGTH
    }

    /// Split the device into read and write halves.
    /// Note: the tun crate returns (writer, reader) order from split().
    pub fn split(self) -> VpnResult<(TunReader, TunWriter)> {
        let buffer_size = self.buffer_size();

        let (writer, reader) = self
            .device
            .split()
            .map_err(|e| VpnError::TunDevice(format!("failed to split TUN device: {}", e)))?;

        Ok((
            TunReader {
                reader,
                buffer_size,
            },
            TunWriter { writer },
        ))
    }
}

/// Read half of a split TUN device.
pub struct TunReader {
    reader: DeviceReader,
    buffer_size: usize,
}

impl TunReader {
    /// Recommended read buffer size.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Read one packet from the TUN device.
    pub async fn read(&mut self, buf: &mut [u8]) -> VpnResult<usize> {
        self.reader.read(buf).await.map_err(VpnError::Network)
    }
}

/// Write half of a split TUN device.
pub struct TunWriter {
    writer: DeviceWriter,
}

impl TunWriter {
    /// Write one complete packet to the TUN device.
    pub async fn write_all(&mut self, buf: &[u8]) -> VpnResult<()> {
        self.writer.write_all(buf).await.map_err(VpnError::Network)
    }
}

/// Spawn the single task that serializes all writes to the TUN device.
/// Dropping every sender shuts it down.
pub fn spawn_device_writer(
    mut writer: TunWriter,
    mut rx: mpsc::Receiver<Vec<u8>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer.write_all(&frame).await {
                log::warn!("TUN write error: {}", e);
            }
        }
        log::debug!("device writer task exiting");
    })
}
