use std::time::Duration;

use serialport::SerialPortType;
use tokio::io::{ReadHalf, WriteHalf};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use super::transport::{StreamLineReader, StreamLineWriter};
use super::{Result, SerialDeviceInfo, SerialError};
use crate::config::SerialSettings;

pub type SerialLineReader = StreamLineReader<ReadHalf<SerialStream>>;
pub type SerialLineWriter = StreamLineWriter<WriteHalf<SerialStream>>;

/// Driver-level read timeout; line timeouts are enforced above this.
const NATIVE_READ_TIMEOUT: Duration = Duration::from_millis(100);

pub struct SerialInterface;

impl SerialInterface {
    /// List the serial ports currently present on the host
    pub fn discover_ports() -> Result<Vec<SerialDeviceInfo>> {
        let ports = serialport::available_ports()?;
        let devices = ports
            .into_iter()
            .map(|port| match port.port_type {
                SerialPortType::UsbPort(usb_info) => SerialDeviceInfo {
                    port_name: port.port_name,
                    vid: Some(usb_info.vid),
                    pid: Some(usb_info.pid),
                    serial_number: usb_info.serial_number,
                    manufacturer: usb_info.manufacturer,
                    product: usb_info.product,
                },
                _ => SerialDeviceInfo {
                    port_name: port.port_name,
                    vid: None,
                    pid: None,
                    serial_number: None,
                    manufacturer: None,
                    product: None,
                },
            })
            .collect();

        Ok(devices)
    }

    /// Open and configure the port, returning its independent read and write halves
    pub fn open(settings: &SerialSettings) -> Result<(SerialLineReader, SerialLineWriter)> {
        if settings.port_name.is_empty() {
            return Err(SerialError::PortNotFound("<empty port name>".to_string()));
        }

        let stream = tokio_serial::new(settings.port_name.as_str(), settings.baud_rate)
            .data_bits(settings.data_bits.into())
            .parity(settings.parity.into())
            .stop_bits(settings.stop_bits.into())
            .flow_control(settings.flow_control.into())
            .timeout(NATIVE_READ_TIMEOUT)
            .open_native_async()
            .map_err(|e| match e.kind() {
                tokio_serial::ErrorKind::NoDevice => SerialError::PortNotFound(settings.port_name.clone()),
                _ => SerialError::ConnectionFailed(format!("{}: {}", settings.port_name, e)),
            })?;

        log::info!("Opened modem port {} at {} baud", settings.port_name, settings.baud_rate);

        let (read_half, write_half) = tokio::io::split(stream);
        Ok((StreamLineReader::new(read_half), StreamLineWriter::new(write_half)))
    }
}
