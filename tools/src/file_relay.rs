// The mobiledevice authors
// Pulls diagnostic filesets off the device as a cpio.gz archive

use clap::{Arg, Command};
use mobiledevice::FileSet;

mod common;

#[tokio::main]
async fn main() {
    common::init_logging();

    let matches = common::device_args(
        Command::new("file_relay")
            .about("Download diagnostic filesets")
            .arg(
                Arg::new("output")
                    .short('o')
                    .long("output")
                    .value_name("PATH")
                    .required(true)
                    .help("Where to write the archive"),
            )
            .arg(
                Arg::new("sets")
                    .required(true)
                    .num_args(1..)
                    .index(1)
                    .help("Filesets to request, e.g. CrashReporter Network"),
            ),
    )
    .get_matches();

    let sets = matches
        .get_many::<String>("sets")
        .expect("No filesets passed")
        .map(|s| s.parse::<FileSet>())
        .collect::<Result<Vec<_>, _>>();
    let sets = match sets {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{e}. Known sets:");
            for set in FileSet::EVERY {
                eprintln!("  {set}");
            }
            return;
        }
    };
    let output = matches.get_one::<String>("output").expect("No output passed");

    let device = match common::get_device(&matches, "file_relay").await {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };
    let mut client = device.file_relay().await.expect("Unable to connect to file relay");

    let mut out = tokio::fs::File::create(output)
        .await
        .expect("Unable to create output file");
    let names: Vec<&str> = sets.iter().map(|s| s.name()).collect();
    match client.get_file_sets(&names, &mut out).await {
        Ok(n) => println!("Wrote {n} bytes to {output}"),
        Err(e) => eprintln!("File relay failed: {e}"),
    }
}
