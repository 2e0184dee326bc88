// Copyright 2020 Joyent, Inc.

use std::fs;
use std::io::Write;
use std::net::SocketAddr;
use std::process;

use clap::{crate_version, value_t, App, AppSettings, Arg, ArgMatches, SubCommand};

use fast_relay::client::RelayClient;
use fast_relay::error::RelayError;
use fast_relay::message::{new_transfer_id, TransferDescriptor};

static APP: &'static str = "relaycall";
static DEFAULT_HOST: &'static str = "127.0.0.1";
const DEFAULT_PORT: u32 = 10000;
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Command-line tool for talking to a file transfer relay")
        .version(crate_version!())
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address for the relay")
                .long("host")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port for the relay (Default: 10000)")
                .long("port")
                .takes_value(true),
        )
        .subcommand(
            SubCommand::with_name("register")
                .about("Register as a destination and print incoming notices")
                .arg(
                    Arg::with_name("id")
                        .help("Destination identity")
                        .required(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("upload")
                .about("Send a file to a destination")
                .arg(
                    Arg::with_name("destination")
                        .help("Destination identity")
                        .required(true),
                )
                .arg(
                    Arg::with_name("file")
                        .help("Path of the file to send")
                        .required(true),
                )
                .arg(
                    Arg::with_name("transfer_id")
                        .help("Transfer id (Default: generated)")
                        .long("transfer-id")
                        .short("t")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("chunk_size")
                        .help("Bytes per chunk (Default: 65536)")
                        .long("chunk-size")
                        .short("s")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("download")
                .about("Receive the chunks of a transfer")
                .arg(
                    Arg::with_name("transfer_id")
                        .help("Transfer id from the notice")
                        .required(true),
                )
                .arg(
                    Arg::with_name("output")
                        .help("Path to write the file to")
                        .required(true),
                ),
        )
        .get_matches()
}

async fn register(client: &mut RelayClient, matches: &ArgMatches<'_>) -> Result<(), RelayError> {
    let id = value_t!(matches, "id", i32).unwrap_or_else(|e| e.exit());
    client.register(id).await?;

    while let Some(notice) = client.next_notice().await? {
        println!("{}", serde_json::to_string(&notice)?);
    }
    Ok(())
}

async fn upload(client: &mut RelayClient, matches: &ArgMatches<'_>) -> Result<(), RelayError> {
    let destination = value_t!(matches, "destination", i32).unwrap_or_else(|e| e.exit());
    let chunk_size =
        value_t!(matches, "chunk_size", usize).unwrap_or(DEFAULT_CHUNK_SIZE);
    let transfer_id = matches
        .value_of("transfer_id")
        .map(String::from)
        .unwrap_or_else(new_transfer_id);
    let path = matches.value_of("file").unwrap_or_default();

    let data = fs::read(path)?;
    let descriptor =
        TransferDescriptor::new(destination, transfer_id).with_total_size(data.len() as u64);
    let status = client.upload(descriptor, &data, chunk_size).await?;
    println!("{}", serde_json::to_string(&status)?);
    Ok(())
}

async fn download(client: &mut RelayClient, matches: &ArgMatches<'_>) -> Result<(), RelayError> {
    let transfer_id = matches.value_of("transfer_id").unwrap_or_default();
    let path = matches.value_of("output").unwrap_or_default();

    let mut file = fs::File::create(path)?;
    client.download(transfer_id).await?;

    let mut total = 0;
    while let Some(chunk) = client.next_chunk().await? {
        file.write_all(&chunk.data)?;
        total += chunk.len();
    }
    println!("received {} bytes", total);
    Ok(())
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let host = String::from(matches.value_of("host").unwrap_or(DEFAULT_HOST));
    let port = value_t!(matches, "port", u32).unwrap_or(DEFAULT_PORT);
    let addr = [host, String::from(":"), port.to_string()]
        .concat()
        .parse::<SocketAddr>()
        .unwrap_or_else(|e| {
            eprintln!(
                "Failed to parse host and port as valid socket address: \
                 {}",
                e
            );
            process::exit(1)
        });

    let mut client = RelayClient::connect(&addr, None).await.unwrap_or_else(|e| {
        eprintln!("Failed to connect to relay: {}", e);
        process::exit(1)
    });

    let result = match matches.subcommand() {
        ("register", Some(sub)) => register(&mut client, sub).await,
        ("upload", Some(sub)) => upload(&mut client, sub).await,
        ("download", Some(sub)) => download(&mut client, sub).await,
        _ => Ok(()),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1)
    }
}
