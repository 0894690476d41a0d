// The mobiledevice authors
// Dumps the lockdown values of a device

use clap::{Arg, Command};
use mobiledevice::{pretty_print_dictionary, pretty_print_plist};

mod common;

#[tokio::main]
async fn main() {
    common::init_logging();

    let matches = common::device_args(
        Command::new("ideviceinfo")
            .about("Get information from the device")
            .arg(
                Arg::new("domain")
                    .long("domain")
                    .short('q')
                    .value_name("DOMAIN")
                    .help("Domain to query, the root domain by default"),
            )
            .arg(
                Arg::new("xml")
                    .long("xml")
                    .short('x')
                    .help("Print the values as an XML plist")
                    .action(clap::ArgAction::SetTrue),
            )
            .arg(
                Arg::new("key")
                    .long("key")
                    .short('k')
                    .value_name("KEY")
                    .help("Only print this key"),
            ),
    )
    .get_matches();

    let device = match common::get_device(&matches, "ideviceinfo").await {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };
    let domain = matches.get_one::<String>("domain").map(String::as_str);

    let value = match matches.get_one::<String>("key") {
        Some(key) => device.value_for_key(key, domain).await,
        None => device.all_values(domain).await.map(plist::Value::Dictionary),
    };
    let value = match value {
        Ok(v) => v,
        Err(e) => {
            eprintln!("Unable to read values: {e}");
            return;
        }
    };

    if matches.get_flag("xml") {
        plist::to_writer_xml(std::io::stdout(), &value).expect("Failed to write plist");
        println!();
    } else {
        match value.as_dictionary() {
            Some(values) => println!("{}", pretty_print_dictionary(values)),
            None => println!("{}", pretty_print_plist(&value)),
        }
    }
}
