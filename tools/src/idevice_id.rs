// The mobiledevice authors
// Lists attached devices, optionally watching for changes

use std::sync::Arc;

use clap::{Arg, Command};
use mobiledevice::{Device, DeviceListener, DeviceRegistry, usbmuxd::UsbmuxdAddr};

mod common;

struct Printer;

impl DeviceListener for Printer {
    fn device_connected(&self, device: &Device) {
        println!("+ {}", device.udid());
    }

    fn device_disconnected(&self, device: &Device) {
        println!("- {}", device.udid());
    }
}

#[tokio::main]
async fn main() {
    common::init_logging();

    let matches = Command::new("idevice_id")
        .about("List attached devices")
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .help("Keep running and print devices as they come and go")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    if matches.get_flag("listen") {
        let registry = DeviceRegistry::shared();
        registry
            .set_listener(Some(Arc::new(Printer)))
            .await
            .expect("Unable to watch usbmuxd");
        tokio::signal::ctrl_c().await.expect("no ctrl-c handler");
        return;
    }

    let addr = UsbmuxdAddr::from_env_var().expect("Bad USBMUXD_SOCKET_ADDRESS");
    let mut muxer = addr.connect(0).await.expect("Unable to connect to usbmuxd");
    for dev in muxer.get_devices().await.expect("Unable to list devices") {
        println!("{} ({:?})", dev.udid, dev.connection_type);
    }
}
