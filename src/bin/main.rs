use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use devbus::config::load_settings;
use devbus::{
    BusContext, BusResult, BusSettings, ChannelSwitcher, MemoryBroker, MessageConnector,
    ResultSink, Service, ServiceMethod, Topic,
};

/// Message bus for development tools
#[derive(Parser)]
#[command(name = "devbus")]
#[command(version)]
#[command(about = "Message bus for development tools: broadcasts and RPC over per-user channels")]
struct Cli {
    /// Settings file layered over the user config
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective settings as TOML
    Config,
    /// Run request and broadcast round trips over an in-process broker
    Ping {
        /// Channel (user) to run the round trips on
        #[arg(long, default_value = "devbus")]
        user: String,

        /// Number of requests to send
        #[arg(long, default_value_t = 3)]
        count: u32,
    },
}

const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Answers every request with its own payload.
struct Echo;

impl Service for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn reply(&self, _method: &str, request: &[u8], result: Box<dyn ResultSink>) -> BusResult<()> {
        result.write(request.to_vec());
        Ok(())
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let settings = match load_settings(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let outcome = match cli.command {
        Commands::Config => settings.to_toml().map(|text| print!("{}", text)),
        Commands::Ping { user, count } => ping(settings, &user, count),
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn ping(settings: BusSettings, user: &str, count: u32) -> BusResult<()> {
    let broker = MemoryBroker::new();
    let close_timeout = settings.close_timeout();

    let server = MessageConnector::new(BusContext::in_memory(&broker, settings.clone()))?;
    server.add_service(Arc::new(Echo))?;
    let topic = Topic::with_response("ping");
    let responder = server.clone();
    server.on(
        &topic,
        move |message: &[u8], reply_to: Option<&str>, correlation_id: Option<&str>| -> BusResult<()> {
            if let (Some(reply_to), Some(correlation_id)) = (reply_to, correlation_id) {
                responder.reply_to_event(reply_to, correlation_id, message.to_vec());
            }
            Ok(())
        },
    );

    let client = ChannelSwitcher::new(MessageConnector::new(BusContext::in_memory(
        &broker, settings,
    ))?);
    ChannelSwitcher::new(server.clone()).switch_to_channel(Some(user))?;
    client.switch_to_channel(Some(user))?;
    let connector = client.connector();

    let method = ServiceMethod::new("echo", "ping");
    for sequence in 1..=count {
        let payload = format!("ping {}", sequence).into_bytes();
        let started = Instant::now();
        let response = connector.request(&method, payload).blocking_get(PING_TIMEOUT)?;
        println!(
            "{} from {}: {:?}",
            String::from_utf8_lossy(&response),
            method,
            started.elapsed()
        );
    }

    let (tx, rx) = mpsc::sync_channel(1);
    connector.reply_on(
        &topic,
        move |message: &[u8], _: Option<&str>, _: Option<&str>| -> BusResult<()> {
            let _ = tx.try_send(message.to_vec());
            Ok(())
        },
    )?;
    let started = Instant::now();
    connector
        .notify(&topic, b"broadcast".to_vec())
        .blocking_get(PING_TIMEOUT)?;
    match rx.recv_timeout(PING_TIMEOUT) {
        Ok(reply) => println!(
            "{} answered on {}: {:?}",
            String::from_utf8_lossy(&reply),
            topic.response_name().unwrap_or_default(),
            started.elapsed()
        ),
        Err(_) => println!("no answer on {}", topic.response_name().unwrap_or_default()),
    }

    connector.close(close_timeout);
    server.close(close_timeout);
    Ok(())
}
