// The mobiledevice authors
// Manages installed applications through the installation proxy

use std::sync::Arc;

use clap::{Arg, Command};
use mobiledevice::{InstallationProxyListener, OperationProgress};

mod common;

struct Progress;

impl InstallationProxyListener for Progress {
    fn operation_started(&self, progress: &OperationProgress) {
        println!("{}: started", progress.command);
    }

    fn operation_continuing(&self, progress: &OperationProgress) {
        println!(
            "{}: {} {}%",
            progress.command,
            progress.status.as_deref().unwrap_or("working"),
            progress.percent.unwrap_or(0)
        );
    }

    fn operation_completed(&self, progress: &OperationProgress) {
        match &progress.error {
            Some(e) => println!("{}: failed with {e}", progress.command),
            None => println!("{}: done", progress.command),
        }
    }
}

fn bundle_arg() -> Arg {
    Arg::new("bundle_id")
        .required(true)
        .index(1)
        .help("Bundle identifier of the app")
}

#[tokio::main]
async fn main() {
    common::init_logging();

    let matches = common::device_args(
        Command::new("instproxy")
            .about("Manage applications on the device")
            .subcommand(
                Command::new("browse")
                    .about("List installed applications")
                    .arg(
                        Arg::new("type")
                            .long("type")
                            .value_name("TYPE")
                            .help("User, System or Internal"),
                    ),
            )
            .subcommand(
                Command::new("lookup")
                    .about("Look up applications of a type")
                    .arg(Arg::new("type").default_value("User").index(1))
                    .arg(
                        Arg::new("attribute")
                            .long("attribute")
                            .value_name("KEY")
                            .help("Only apps whose Info.plist has this key"),
                    ),
            )
            .subcommand(
                Command::new("install")
                    .about("Install a package already uploaded to the media directory")
                    .arg(Arg::new("path").required(true).index(1)),
            )
            .subcommand(
                Command::new("upgrade")
                    .about("Upgrade an installed app from an uploaded package")
                    .arg(bundle_arg())
                    .arg(Arg::new("path").required(true).index(2)),
            )
            .subcommand(
                Command::new("uninstall")
                    .about("Uninstall an app")
                    .arg(bundle_arg()),
            )
            .subcommand(Command::new("archives").about("List archived apps"))
            .subcommand(
                Command::new("archive")
                    .about("Archive an app")
                    .arg(bundle_arg())
                    .arg(
                        Arg::new("no_container")
                            .long("no-container")
                            .help("Skip documents and data")
                            .action(clap::ArgAction::SetTrue),
                    )
                    .arg(
                        Arg::new("uninstall")
                            .long("uninstall")
                            .help("Uninstall once archived")
                            .action(clap::ArgAction::SetTrue),
                    ),
            )
            .subcommand(
                Command::new("restore")
                    .about("Restore an archived app")
                    .arg(bundle_arg()),
            )
            .subcommand(
                Command::new("remove_archive")
                    .about("Delete an app archive")
                    .arg(bundle_arg()),
            )
            .subcommand_required(true),
    )
    .get_matches();

    let device = match common::get_device(&matches, "instproxy").await {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };
    let mut client = device
        .installation_proxy(Some(Arc::new(Progress)))
        .await
        .expect("Unable to connect to instproxy");

    let bundle_id = |m: &clap::ArgMatches| {
        m.get_one::<String>("bundle_id")
            .expect("No bundle id passed")
            .clone()
    };

    let res = match matches.subcommand() {
        Some(("browse", m)) => {
            let kind = m.get_one::<String>("type").map(String::as_str);
            client.browse(kind).await.map(|apps| {
                for app in apps {
                    println!(
                        "{} - {} {}",
                        app.bundle_id(),
                        app.name(),
                        app.version().unwrap_or("")
                    );
                }
            })
        }
        Some(("lookup", m)) => {
            let kind = m.get_one::<String>("type").expect("No type passed");
            let attribute = m.get_one::<String>("attribute").map(String::as_str);
            client.lookup_type(kind, attribute).await.map(|apps| {
                for (id, app) in apps {
                    println!("{id} - {}", app.name());
                }
            })
        }
        Some(("install", m)) => {
            let path = m.get_one::<String>("path").expect("No path passed");
            client.install(path).await
        }
        Some(("upgrade", m)) => {
            let path = m.get_one::<String>("path").expect("No path passed");
            client.upgrade(&bundle_id(m), path).await
        }
        Some(("uninstall", m)) => client.uninstall(&bundle_id(m)).await,
        Some(("archives", _)) => client.archived_app_bundle_ids().await.map(|ids| {
            for id in ids {
                println!("{id}");
            }
        }),
        Some(("archive", m)) => {
            client
                .archive(
                    &bundle_id(m),
                    !m.get_flag("no_container"),
                    true,
                    m.get_flag("uninstall"),
                )
                .await
        }
        Some(("restore", m)) => client.restore(&bundle_id(m)).await,
        Some(("remove_archive", m)) => client.remove_archive(&bundle_id(m)).await,
        _ => unreachable!(),
    };
    if let Err(e) = res {
        eprintln!("Failed: {e}");
    }
}
