use std::io::{self, ErrorKind, Read, Write};
use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, anyhow};
use dialoguer::Select;
use dialoguer::console::style;
use krok_core::{SerialTransport, query_version};
use serialport::{SerialPort, available_ports};
use tracing::{debug, info};

/// A serial port with a Krokodile Cartridge (hopefully) on the other end.
pub struct KrokPort {
    name: String,
    port: Box<dyn SerialPort>,
}

#[derive(Debug, Copy, Clone)]
pub struct PortSettings {
    pub baud: u32,
    pub timeout: Duration,
}

impl KrokPort {
    pub fn open(name: &str, settings: PortSettings) -> anyhow::Result<Self> {
        let port = serialport::new(name, settings.baud)
            .timeout(settings.timeout)
            .open()
            .with_context(|| format!("failed to open {}", name))?;

        Ok(Self {
            name: name.to_string(),
            port,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl SerialTransport for KrokPort {
    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut sent = 0;
        while sent < data.len() {
            match self.port.write(&data[sent..]) {
                Ok(0) => break,
                Ok(n) => sent += n,
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.port.flush().ok();
        Ok(sent)
    }

    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn sleep(&mut self, ms: u64) {
        sleep(Duration::from_millis(ms));
    }
}

/// Opens `name` and asks for a version string. `None` if nothing answered.
fn probe(name: &str, settings: PortSettings) -> Option<String> {
    let mut port = match KrokPort::open(name, settings) {
        Ok(port) => port,
        Err(e) => {
            debug!("skipping {}: {:#}", name, e);
            return None;
        }
    };
    match query_version(&mut port) {
        Ok(version) => version,
        Err(e) => {
            debug!("{} did not answer: {}", name, e);
            None
        }
    }
}

/// Every port with a Krokodile Cartridge on it, with the firmware version.
pub fn scan(settings: PortSettings) -> anyhow::Result<Vec<(String, String)>> {
    let ports = available_ports().context("could not list serial ports")?;
    Ok(ports
        .into_iter()
        .filter_map(|p| probe(&p.port_name, settings).map(|v| (p.port_name, v)))
        .collect())
}

/// Finds the cart, trying `preferred` before scanning every port.
///
/// The port is reopened after identification so transfers start from a
/// clean state.
pub fn find_krokcart(preferred: Option<&str>, settings: PortSettings) -> anyhow::Result<(KrokPort, String)> {
    if let Some(name) = preferred {
        if let Some(version) = probe(name, settings) {
            info!("found {} on {}", version, name);
            return Ok((KrokPort::open(name, settings)?, version));
        }
        println!("{}", style(format!("No Krokodile Cartridge on {}, searching...", name)).dim());
    }

    let found = scan(settings)?;
    let (name, version) = match found.as_slice() {
        [] => {
            println!("No Krokodile Cartridge found! Is it plugged in, and are you in the dialout group?");
            return Err(anyhow!("no Krokodile Cartridge found"));
        }
        [one] => one.clone(),
        many => {
            let labels: Vec<String> = many.iter().map(|(n, v)| format!("{} ({})", n, v)).collect();
            let selected = Select::new()
                .with_prompt("Multiple Krokodile Cartridges found")
                .default(0)
                .items(&labels)
                .interact()
                .context("no cartridge selected")?;
            many[selected].clone()
        }
    };

    info!("found {} on {}", version, name);
    Ok((KrokPort::open(&name, settings)?, version))
}
