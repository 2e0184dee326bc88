// Copyright 2020 Joyent, Inc.

use std::net::SocketAddr;
use std::process;
use std::sync::Mutex;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use slog::{error, info, o, Drain, Logger};
use tokio::net::TcpListener;

use fast_relay::config::{RelayConfig, DEFAULT_QUEUE_CAPACITY};
use fast_relay::relay::Relay;
use fast_relay::server;

static APP: &'static str = "relayserve";
static DEFAULT_HOST: &'static str = "0.0.0.0";
const DEFAULT_PORT: u32 = 10000;

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("File transfer relay serving Fast clients")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("Address to listen on (Default: 0.0.0.0)")
                .long("host")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port to listen on (Default: 10000)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("capacity")
                .help("Notices or chunks buffered per session (Default: 10)")
                .long("capacity")
                .short("c")
                .takes_value(true),
        )
        .get_matches()
}

#[tokio::main]
async fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => crate_version!()),
    );

    let matches = parse_opts(APP.to_string());
    let host = String::from(matches.value_of("host").unwrap_or(DEFAULT_HOST));
    let port = value_t!(matches, "port", u32).unwrap_or(DEFAULT_PORT);
    let capacity =
        value_t!(matches, "capacity", usize).unwrap_or(DEFAULT_QUEUE_CAPACITY);

    let config = RelayConfig::default().with_queue_capacity(capacity);
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        process::exit(1)
    }

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

    let listener = TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind {}: {}", addr, e);
        process::exit(1)
    });
    info!(root_log, "listening for relay requests"; "address" => addr);

    let relay = Relay::new(config, Some(&root_log));

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let relay = relay.clone();
                    let conn_log = root_log.new(o!("peer" => peer));
                    tokio::spawn(async move {
                        server::make_task(socket, relay, Some(&conn_log)).await
                    });
                }
                Err(e) => error!(root_log, "failed to accept socket"; "err" => %e),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    relay.stop().await;
}
