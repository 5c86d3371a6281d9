use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use mqttlink::config::{Settings, load_config_from};
use mqttlink::utils::logging;
use mqttlink::{Error, Event, MqttClient, QoS, Result, SubscribeFilter, SubscribeReturnCode};
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(name = "mqttlink", version, about = "MQTT 3.1.1 client for TCP, proxies and WebSockets")]
struct Cli {
    /// Settings file, layered over config/default and under MQTTLINK__* variables
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish a single message
    Publish {
        topic: String,
        message: String,
        #[arg(short, long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
        qos: u8,
        #[arg(short, long)]
        retain: bool,
    },
    /// Subscribe and print incoming messages until interrupted
    Subscribe {
        #[arg(required = true)]
        filters: Vec<String>,
        #[arg(short, long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
        qos: u8,
        /// Exit after this many messages
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },
    /// Print the effective settings as JSON
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = match load_config_from(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("mqttlink: {err}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&settings.logging.level);

    match run(cli.command, settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "mqttlink failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, settings: Settings) -> Result<()> {
    match command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
        Command::Publish {
            topic,
            message,
            qos,
            retain,
        } => {
            let qos = QoS::try_from(qos)?;
            let (client, _events) = MqttClient::connect(settings).await?;
            client.publish(topic.as_str(), message, qos, retain).await?;
            info!(%topic, ?qos, "message published");
            client.disconnect().await
        }
        Command::Subscribe { filters, qos, count } => {
            let qos = QoS::try_from(qos)?;
            let (client, mut events) = MqttClient::connect(settings).await?;
            let requested: Vec<SubscribeFilter> = filters
                .iter()
                .map(|filter| SubscribeFilter::new(filter.as_str(), qos))
                .collect();
            let codes = client.subscribe_many(requested).await?;
            for (filter, code) in filters.iter().zip(codes) {
                match code {
                    SubscribeReturnCode::Success(granted) => info!(%filter, ?granted, "subscribed"),
                    SubscribeReturnCode::Failure => warn!(%filter, "subscription rejected"),
                }
            }

            let mut received = 0usize;
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(Event::Message(message)) => {
                            println!("{} {}", message.topic, String::from_utf8_lossy(&message.payload));
                            received += 1;
                            if count.is_some_and(|limit| received >= limit) {
                                break;
                            }
                        }
                        Some(Event::Disconnected { source, cause }) => {
                            warn!(?source, cause = cause.as_deref().unwrap_or("none"), "disconnected");
                        }
                        Some(other) => debug!(event = ?other, "client event"),
                        None => return Err(Error::ConnectionClosed),
                    },
                    _ = tokio::signal::ctrl_c() => {
                        info!("interrupted");
                        break;
                    }
                }
            }
            client.disconnect().await
        }
    }
}
