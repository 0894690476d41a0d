// The mobiledevice authors
// Posts or observes darwin notifications through the notification proxy

use std::sync::Arc;

use clap::{Arg, Command};

mod common;

#[tokio::main]
async fn main() {
    common::init_logging();

    let matches = common::device_args(
        Command::new("notifications")
            .about("Post and observe device notifications")
            .subcommand(
                Command::new("post")
                    .about("Post a notification on the device")
                    .arg(Arg::new("name").required(true).index(1)),
            )
            .subcommand(
                Command::new("observe")
                    .about("Print notifications as the device posts them")
                    .arg(Arg::new("names").required(true).num_args(1..).index(1)),
            ),
    )
    .get_matches();

    let device = match common::get_device(&matches, "notifications").await {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };
    let mut client = device
        .notification_proxy()
        .await
        .expect("Unable to connect to the notification proxy");

    if let Some(matches) = matches.subcommand_matches("post") {
        let name = matches.get_one::<String>("name").expect("No name passed");
        client
            .post_notification(name)
            .await
            .expect("Failed to post notification");
        println!("Posted {name}");
    } else if let Some(matches) = matches.subcommand_matches("observe") {
        let printer = Arc::new(|name: &str| println!("{name}"));
        for name in matches.get_many::<String>("names").expect("No names passed") {
            client
                .add_observer(name, printer.clone())
                .await
                .expect("Failed to observe notification");
        }
        tokio::select! {
            res = client.run() => {
                if let Err(e) = res {
                    eprintln!("Notification proxy stopped: {e}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                client.shutdown().await.expect("Failed to shut down the proxy");
            }
        }
    } else {
        eprintln!("Invalid usage, pass -h for help");
    }
}
