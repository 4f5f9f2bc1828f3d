pub mod serial;
pub mod traits;
pub mod udp;

pub use serial::SerialLink;
pub use traits::{DatagramChannel, SerialChannel};
pub use udp::UdpLink;

use log::info;

use crate::utils::error::BridgeError;

/// Logs the serial ports the OS knows about and returns their names.
pub fn list_serial_ports() -> Result<Vec<String>, BridgeError> {
    let ports = serialport::available_ports()?;
    if ports.is_empty() {
        info!("⚠️  No serial ports found");
        return Ok(Vec::new());
    }

    for (index, port) in ports.iter().enumerate() {
        info!("   {}. {}", index + 1, port.port_name);
        if let serialport::SerialPortType::UsbPort(usb_info) = &port.port_type {
            if let Some(manufacturer) = &usb_info.manufacturer {
                info!("      📱 Manufacturer: {}", manufacturer);
            }
            if let Some(serial_number) = &usb_info.serial_number {
                info!("      🔢 Serial Number: {}", serial_number);
            }
        }
    }

    Ok(ports.into_iter().map(|p| p.port_name).collect())
}
