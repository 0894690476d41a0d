// The mobiledevice authors
// Shared device selection for the tools

use std::{net::IpAddr, str::FromStr, sync::Arc};

use clap::{Arg, Command};
use mobiledevice::{
    Device,
    connector::TcpConnector,
    pair_record::PairRecord,
    usbmuxd::{Connection, UsbmuxdAddr, UsbmuxdConnector},
};
use tracing::debug;

/// Adds `--udid`, `--host` and `--pairing-file`
pub fn device_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("HOST")
                .help("IP address of the device"),
        )
        .arg(
            Arg::new("pairing_file")
                .long("pairing-file")
                .value_name("PATH")
                .help("Path to the pairing file"),
        )
        .arg(
            Arg::new("udid")
                .long("udid")
                .value_name("UDID")
                .help("UDID of the device (overrides host/pairing file)"),
        )
}

pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

/// Picks the device named on the command line, or the first USB device
pub async fn get_device(matches: &clap::ArgMatches, label: &str) -> Result<Device, String> {
    let udid = matches.get_one::<String>("udid");
    let host = matches.get_one::<String>("host");
    let pairing_file = matches.get_one::<String>("pairing_file");

    if let (None, Some(host), Some(pairing_file)) = (udid, host, pairing_file) {
        let host = IpAddr::from_str(host).map_err(|e| format!("Invalid host: {e:?}"))?;
        let pair_record = PairRecord::read_from_file(pairing_file)
            .map_err(|e| format!("Unable to read pairing file: {e:?}"))?;
        let udid = pair_record
            .udid
            .clone()
            .unwrap_or_else(|| host.to_string());
        debug!("Using {udid} at {host}");
        let connector = TcpConnector::new(host, pair_record, label);
        return Ok(Device::new(udid, 0, Arc::new(connector)));
    }

    let addr = UsbmuxdAddr::from_env_var().map_err(|e| format!("Bad USBMUXD_SOCKET_ADDRESS: {e}"))?;
    let mut usbmuxd = addr
        .connect(1)
        .await
        .map_err(|e| format!("Unable to connect to usbmuxd: {e}"))?;
    let devs = usbmuxd
        .get_devices()
        .await
        .map_err(|e| format!("Unable to get devices from usbmuxd: {e:?}"))?;

    let chosen = match udid {
        Some(udid) => devs
            .iter()
            .find(|d| &d.udid == udid)
            .ok_or_else(|| format!("Device {udid} not found"))?,
        None => devs
            .iter()
            .find(|d| d.connection_type == Connection::Usb)
            .or_else(|| devs.first())
            .ok_or_else(|| "No devices connected!".to_string())?,
    };
    debug!("Using {} over {:?}", chosen.udid, chosen.connection_type);
    let connector = UsbmuxdConnector::new(addr, chosen, label);
    Ok(Device::new(
        chosen.udid.clone(),
        chosen.device_id,
        Arc::new(connector),
    ))
}
