use serialport::SerialPortType;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialPortBuilderExt;

use super::{Result, SerialDeviceInfo, SerialError};

pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Both halves of an open device connection.
///
/// The read half goes to the device's reader task, the write half to its
/// command writer. Tests build one from an in-memory duplex pipe.
pub struct SerialLink {
    pub port_name: String,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl SerialLink {
    pub fn from_stream<S>(port_name: &str, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            port_name: port_name.to_string(),
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

impl std::fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLink").field("port_name", &self.port_name).finish()
    }
}

pub struct SerialInterface;

impl SerialInterface {
    /// List every USB serial port currently attached
    pub fn discover_devices() -> Result<Vec<SerialDeviceInfo>> {
        let ports = serialport::available_ports()?;
        let mut devices = Vec::new();

        for port in ports {
            if let SerialPortType::UsbPort(usb_info) = port.port_type {
                devices.push(SerialDeviceInfo {
                    port_name: port.port_name.clone(),
                    vid: usb_info.vid,
                    pid: usb_info.pid,
                    serial_number: usb_info.serial_number.clone(),
                    manufacturer: usb_info.manufacturer.clone(),
                    product: usb_info.product.clone(),
                });
            }
        }

        devices.sort_by(|a, b| a.port_name.cmp(&b.port_name));
        Ok(devices)
    }

    /// Find the port whose USB serial number matches `com_serial`
    pub fn find_by_serial(com_serial: &str) -> Result<SerialDeviceInfo> {
        Self::discover_devices()?
            .into_iter()
            .find(|d| d.serial_number.as_deref() == Some(com_serial))
            .ok_or_else(|| SerialError::PortNotFound(com_serial.to_string()))
    }

    /// Open the port carrying `com_serial` as an async stream
    pub fn connect(com_serial: &str, baud_rate: u32) -> Result<SerialLink> {
        log::debug!("Looking for serial port with serial: {}", com_serial);
        let info = Self::find_by_serial(com_serial)?;

        log::info!("Opening {}", info.port_name);
        let stream = tokio_serial::new(&info.port_name, baud_rate)
            .open_native_async()
            .map_err(|e| SerialError::ConnectionFailed(format!("{}: {}", info.port_name, e)))?;

        Ok(SerialLink::from_stream(&info.port_name, stream))
    }
}
