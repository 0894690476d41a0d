// The mobiledevice authors
// Prints the device's system log until interrupted

use std::sync::Arc;

use clap::Command;
use mobiledevice::{DeviceError, SyslogListener};

mod common;

struct Stdout;

impl SyslogListener for Stdout {
    fn log_line(&self, line: &str) {
        println!("{line}");
    }

    fn relay_ended(&self, error: &DeviceError) {
        eprintln!("Relay ended: {error}");
    }
}

#[tokio::main]
async fn main() {
    common::init_logging();

    let matches = common::device_args(Command::new("syslog_relay").about("Relay system logs"))
        .get_matches();

    let device = match common::get_device(&matches, "syslog_relay").await {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };

    let relay = device
        .syslog_relay(Arc::new(Stdout))
        .await
        .expect("Unable to start syslog relay");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = async {
            while relay.is_running() {
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            }
        } => {}
    }
    relay.close();
}
