use clap::Parser;
use std::process::ExitCode;
use std::time::Duration;
use stompline::{
    AckMode, ClientConfig, HeartbeatConfig, StompClient, StompError, parse_heartbeat_header,
};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "stomp")]
#[command(version)]
#[command(about = "Minimal STOMP 1.1 client: subscribe, print, send")]
struct Cli {
    /// STOMP broker address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:61613")]
    address: String,

    /// Login username
    #[arg(short, long)]
    login: Option<String>,

    /// Passcode
    #[arg(short, long)]
    passcode: Option<String>,

    /// Virtual host sent in CONNECT
    #[arg(long)]
    host: Option<String>,

    /// Heartbeat settings (client-send,client-receive in ms); "0,0" disables
    #[arg(long, default_value = "1000,1000")]
    heartbeat: String,

    /// Destinations to subscribe to (can be specified multiple times)
    #[arg(short, long)]
    subscribe: Vec<String>,

    /// Ack mode for subscriptions: auto, client or client-individual
    #[arg(long, default_value = "auto")]
    ack: AckMode,

    /// Give up after this many failed connection attempts
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Milliseconds to wait between connection attempts
    #[arg(long, default_value_t = 0)]
    retry_delay_ms: u64,

    /// Send a single message to this destination after connecting
    #[arg(long, requires = "body")]
    send: Option<String>,

    /// Body of the message given with --send
    #[arg(long)]
    body: Option<String>,

    /// Log connection stats every N seconds
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    stats_every: Option<u64>,
}

fn config_from(cli: &Cli) -> ClientConfig {
    let (cx, cy) = parse_heartbeat_header(&cli.heartbeat);
    let heartbeat = if cx == 0 && cy == 0 {
        HeartbeatConfig::disabled()
    } else {
        HeartbeatConfig::new(cx, cy)
    };
    let mut config = ClientConfig::new(cli.address.clone())
        .heartbeat(heartbeat)
        .reconnect_delay(Duration::from_millis(cli.retry_delay_ms));
    if let Some(login) = &cli.login {
        config = config.login(login.clone());
    }
    if let Some(passcode) = &cli.passcode {
        config = config.passcode(passcode.clone());
    }
    if let Some(host) = &cli.host {
        config = config.host(host.clone());
    }
    if let Some(max) = cli.max_attempts {
        config = config.max_reconnect_attempts(max);
    }
    config
}

async fn run(cli: Cli) -> Result<(), StompError> {
    let client = StompClient::new(config_from(&cli));

    for destination in &cli.subscribe {
        let ack = cli.ack;
        client.subscribe(destination, ack, |frame, body| {
            println!(
                "[{}] {}",
                frame.get_header("destination").unwrap_or("?"),
                String::from_utf8_lossy(body)
            );
            true
        });
    }

    info!(address = %cli.address, "connecting");
    client.connect().await?;

    if let (Some(destination), Some(body)) = (&cli.send, &cli.body) {
        client.send(destination, &[], body.as_str())?;
        info!(destination = %destination, "message sent");
    }

    let reporter = cli
        .stats_every
        .map(|secs| client.stats().spawn_reporter(Duration::from_secs(secs)));

    if cli.subscribe.is_empty() {
        client.close();
    } else {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "waiting for ctrl-c");
        }
        client.close();
    }

    if let Some(reporter) = reporter {
        reporter.abort();
    }
    client.stats().log_stats();
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
