// The mobiledevice authors
// Manages files on the device over AFC

use std::path::PathBuf;

use clap::{Arg, Command, value_parser};
use mobiledevice::AfcClient;

mod common;

fn path_arg() -> Arg {
    Arg::new("path").required(true).index(1)
}

#[tokio::main]
async fn main() {
    common::init_logging();

    let matches = common::device_args(
        Command::new("afc")
            .about("Manage files on the device")
            .arg(
                Arg::new("container")
                    .long("container")
                    .value_name("BUNDLE_ID")
                    .help("Access the container of an installed app")
                    .global(true),
            )
            .arg(
                Arg::new("crashlogs")
                    .long("crashlogs")
                    .help("Access the crash log directory")
                    .action(clap::ArgAction::SetTrue)
                    .global(true),
            )
            .arg(
                Arg::new("root")
                    .long("root")
                    .help("Access the whole filesystem, jailbroken devices only")
                    .action(clap::ArgAction::SetTrue)
                    .global(true),
            )
            .subcommand(
                Command::new("list")
                    .about("Lists the items in the directory")
                    .arg(path_arg()),
            )
            .subcommand(
                Command::new("tree")
                    .about("Lists everything below a directory")
                    .arg(path_arg()),
            )
            .subcommand(
                Command::new("download")
                    .about("Downloads a file")
                    .arg(path_arg())
                    .arg(
                        Arg::new("save")
                            .required(true)
                            .index(2)
                            .value_parser(value_parser!(PathBuf)),
                    ),
            )
            .subcommand(
                Command::new("upload")
                    .about("Copies a local file or directory into a device directory")
                    .arg(
                        Arg::new("file")
                            .required(true)
                            .index(1)
                            .value_parser(value_parser!(PathBuf)),
                    )
                    .arg(Arg::new("path").required(true).index(2)),
            )
            .subcommand(
                Command::new("mkdir")
                    .about("Creates a directory")
                    .arg(path_arg()),
            )
            .subcommand(
                Command::new("remove")
                    .about("Removes a file or empty directory")
                    .arg(path_arg()),
            )
            .subcommand(
                Command::new("remove_all")
                    .about("Removes a path and everything below it")
                    .arg(path_arg()),
            )
            .subcommand(
                Command::new("rename")
                    .about("Renames a path")
                    .arg(path_arg())
                    .arg(Arg::new("to").required(true).index(2)),
            )
            .subcommand(
                Command::new("info")
                    .about("Get info about a file")
                    .arg(path_arg()),
            )
            .subcommand(Command::new("device_info").about("Get info about the device"))
            .subcommand_required(true),
    )
    .get_matches();

    let device = match common::get_device(&matches, "afc").await {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };

    let client = if let Some(bundle_id) = matches.get_one::<String>("container") {
        device.afc_application_directory(bundle_id).await
    } else if matches.get_flag("crashlogs") {
        device.afc_crash_log_directory().await
    } else if matches.get_flag("root") {
        device.afc_root_directory().await
    } else {
        device.afc_media_directory().await
    };
    let mut client: AfcClient = client.expect("Unable to connect to AFC");

    let path = |m: &clap::ArgMatches| m.get_one::<String>("path").expect("No path passed").clone();

    let res = match matches.subcommand() {
        Some(("list", m)) => client.directory_contents(&path(m)).await.map(|entries| {
            for entry in entries {
                println!("{entry}");
            }
        }),
        Some(("tree", m)) => client
            .recursive_directory_contents(&path(m))
            .await
            .map(|entries| {
                for entry in entries {
                    println!("{entry}");
                }
            }),
        Some(("download", m)) => {
            let save = m.get_one::<PathBuf>("save").expect("No save path passed");
            client.copy_remote_file(&path(m), save).await
        }
        Some(("upload", m)) => {
            let file = m.get_one::<PathBuf>("file").expect("No file passed");
            client.copy_local_to_remote_dir(file, &path(m)).await
        }
        Some(("mkdir", m)) => client.mkdir(&path(m)).await,
        Some(("remove", m)) => client.unlink(&path(m)).await,
        Some(("remove_all", m)) => client.remove_all(&path(m)).await,
        Some(("rename", m)) => {
            let to = m.get_one::<String>("to").expect("No destination passed");
            client.rename(&path(m), to).await
        }
        Some(("info", m)) => client.get_file_info(&path(m)).await.map(|info| {
            println!("{info:#?}");
        }),
        Some(("device_info", _)) => client.device_info().await.map(|info| {
            println!("{info:#?}");
        }),
        _ => unreachable!(),
    };
    if let Err(e) = res {
        eprintln!("Failed: {e}");
    }
    let _ = client.close().await;
}
