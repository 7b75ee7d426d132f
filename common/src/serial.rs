use std::io::{self, BufRead, BufReader, Read};
use std::time::Duration;

use serialport::SerialPort;

use crate::{Error, Result};

/// An open serial connection to the sensor board, read line by line.
///
/// The port is closed when the link is dropped.
pub struct SerialLink {
    port_name: String,
    reader: BufReader<Box<dyn SerialPort>>,
}

impl SerialLink {
    /// Opens `port_name` at `baud_rate`. Reads give up after `read_timeout`
    /// with [`io::ErrorKind::TimedOut`], so the caller can check whether it
    /// should stop.
    pub fn open(port_name: &str, baud_rate: u32, read_timeout: Duration) -> Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(read_timeout)
            .open()
            .map_err(|source| Error::Connect {
                port: port_name.to_owned(),
                source,
            })?;

        log::info!("Connected to {port_name} at {baud_rate} baud");

        Ok(Self {
            port_name: port_name.to_owned(),
            reader: BufReader::new(port),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

impl Read for SerialLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl BufRead for SerialLink {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.reader.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.reader.consume(amt)
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        log::info!("Closed {}", self.port_name);
    }
}

/// A serial port found on this machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortListing {
    pub name: String,
    pub description: String,
}

/// Lists the serial ports the OS knows about, to help pick `serial.port`.
pub fn available_ports() -> Result<Vec<PortListing>> {
    let ports = serialport::available_ports().map_err(Error::ListPorts)?;

    Ok(ports
        .into_iter()
        .map(|port| PortListing {
            description: describe(&port.port_type),
            name: port.port_name,
        })
        .collect())
}

fn describe(port_type: &serialport::SerialPortType) -> String {
    match port_type {
        serialport::SerialPortType::UsbPort(usb) => {
            let product = usb.product.as_deref().unwrap_or("USB serial device");
            match usb.manufacturer.as_deref() {
                Some(manufacturer) => format!(
                    "{product} ({manufacturer}, {:04x}:{:04x})",
                    usb.vid, usb.pid
                ),
                None => format!("{product} ({:04x}:{:04x})", usb.vid, usb.pid),
            }
        }
        serialport::SerialPortType::BluetoothPort => "Bluetooth".to_owned(),
        serialport::SerialPortType::PciPort => "PCI".to_owned(),
        serialport::SerialPortType::Unknown => "unknown".to_owned(),
    }
}

#[test]
fn opening_a_missing_port_names_it() {
    let err = SerialLink::open("/dev/does-not-exist-sensorlog", 9600, Duration::from_millis(10))
        .err()
        .unwrap();
    assert!(matches!(err, Error::Connect { .. }));
    assert!(err.to_string().contains("/dev/does-not-exist-sensorlog"));
}

#[test]
fn enumeration_failures_do_not_name_a_port() {
    let err = Error::ListPorts(serialport::Error::new(
        serialport::ErrorKind::Unknown,
        "udev unavailable",
    ));
    assert_eq!(err.to_string(), "could not list serial ports: udev unavailable");
}
