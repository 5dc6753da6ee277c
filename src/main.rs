use anyhow::{Context, Result};
use brokerctl_core::config::{Config, LoggingConfig};
use brokerctl_core::error::{exit_code, Error};
use brokerctl_core::types::{AckDecision, Backend, Destination, Message};
use brokerctl_msg::{
    Broker, ConsoleSink, Publisher, ReceivePolicy, RetryPolicy, SubscribeSummary, Subscriber,
    SubscriberState,
};
use clap::{CommandFactory, Parser, ValueEnum};
use std::ffi::OsString;
use std::future::Future;
use std::path::PathBuf;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Action {
    Publish,
    Subscribe,
    List,
}

#[derive(Debug, Parser)]
#[command(
    name = "brokerctl",
    version,
    about = "Publish and subscribe to Kafka, MQTT and AMQP brokers"
)]
struct Cli {
    /// Action to perform
    #[arg(long, value_enum)]
    action: Action,

    /// Destination topic, exchange or queue
    #[arg(long)]
    topic: Option<String>,

    /// Message body to publish
    #[arg(long, allow_hyphen_values = true)]
    message: Option<String>,

    /// Broker backend, overrides the config file
    #[arg(long)]
    backend: Option<Backend>,

    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Message key (Kafka partitioning key)
    #[arg(long, allow_hyphen_values = true)]
    key: Option<String>,

    /// Content type attached to the published message
    #[arg(long = "content-type")]
    content_type: Option<String>,

    /// Acknowledgment sent for every received message
    #[arg(long)]
    ack: Option<AckDecision>,

    /// Stop subscribing after this many messages
    #[arg(long = "max-messages")]
    max_messages: Option<u64>,
}

/// Long flags that take a value.
const VALUE_FLAGS: &[&str] = &[
    "action",
    "topic",
    "message",
    "backend",
    "config",
    "key",
    "content-type",
    "ack",
    "max-messages",
];
const SWITCH_FLAGS: &[&str] = &["help", "version"];

/// Rewrite single-dash long flags (`-action publish`, `-topic=x`) to clap's
/// double-dash form. Only tokens in flag position are touched, so values such as
/// `-message -help` pass through as the message body.
fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    let mut expects_value = false;
    args.into_iter()
        .enumerate()
        .map(|(i, arg)| {
            if i == 0 || std::mem::take(&mut expects_value) {
                return arg;
            }
            let Some(s) = arg.to_str() else {
                return arg;
            };
            let (dashes, rest) = match s.strip_prefix("--") {
                Some(rest) => (2, rest),
                None => match s.strip_prefix('-') {
                    Some(rest) => (1, rest),
                    None => return arg,
                },
            };
            let (name, inline_value) = match rest.split_once('=') {
                Some((name, _)) => (name, true),
                None => (rest, false),
            };
            let takes_value = VALUE_FLAGS.contains(&name);
            if !takes_value && !SWITCH_FLAGS.contains(&name) {
                return arg;
            }
            expects_value = takes_value && !inline_value;
            if dashes == 1 {
                OsString::from(format!("-{s}"))
            } else {
                arg
            }
        })
        .collect()
}

impl Cli {
    fn topic(&self) -> Result<Destination, Error> {
        let topic = self
            .topic
            .as_deref()
            .ok_or_else(|| Error::Config("-topic is required".into()))?;
        Destination::new(topic)
    }

    fn message(&self) -> Result<Message, Error> {
        let body = self
            .message
            .as_deref()
            .ok_or_else(|| Error::Config("-message is required for publish".into()))?;
        let mut message = Message::new(body.to_string());
        if let Some(key) = &self.key {
            message = message.with_key(key.clone());
        }
        if let Some(content_type) = &self.content_type {
            message = message.with_content_type(content_type.clone());
        }
        Ok(message)
    }

    /// Check flag combinations clap cannot express before any connection is made.
    fn validate(&self) -> Result<(), Error> {
        match self.action {
            Action::Publish => {
                self.topic()?;
                self.message()?;
            }
            Action::Subscribe => {
                self.topic()?;
            }
            Action::List => {}
        }
        Ok(())
    }

    fn load_config(&self) -> Result<Config, Error> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse_from(normalize_args(std::env::args_os())) {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() {
                exit_code::CONFIG
            } else {
                exit_code::SUCCESS
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    if let Err(e) = run(cli).await {
        let code = e
            .downcast_ref::<Error>()
            .map(Error::exit_code)
            .unwrap_or(exit_code::INTERNAL);
        eprintln!("Error: {e:#}");
        if code == exit_code::CONFIG {
            eprintln!("{}", Cli::command().render_usage());
        }
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> Result<()> {
    cli.validate()?;
    let config = cli.load_config()?;

    init_logging(&config.logging);

    info!(
        backend = %config.backend,
        client_id = %config.client_id,
        action = ?cli.action,
        "starting brokerctl"
    );

    let broker = brokerctl_msg::connect(&config).await?;

    let outcome = match cli.action {
        Action::Publish => publish(&cli, &config, broker.as_ref()).await,
        Action::Subscribe => subscribe(&cli, &config, broker.as_ref()).await,
        Action::List => list(broker.as_ref()).await,
    };

    if let Err(e) = broker.shutdown().await {
        error!("broker shutdown error: {e}");
    }

    outcome
}

async fn publish(cli: &Cli, config: &Config, broker: &dyn Broker) -> Result<()> {
    let topic = cli.topic()?;
    let message = cli.message()?;

    let receipt = Publisher::new(broker, RetryPolicy::from(&config.publish))
        .publish(&topic, &message)
        .await?;

    debug!(topic = %topic, attempts = receipt.attempts, "publish receipt");
    println!(
        "Published message to topic: {topic} | message: {}",
        cli.message.as_deref().unwrap_or_default()
    );
    Ok(())
}

async fn subscribe(cli: &Cli, config: &Config, broker: &dyn Broker) -> Result<()> {
    let topic = cli.topic()?;
    let mut inbox = broker.subscribe(&topic).await?;
    println!("Subscribing to topic: {topic}");

    let mut policy = ReceivePolicy::from(&config.subscribe);
    policy.max_messages = cli.max_messages;
    let ack = cli.ack.unwrap_or(config.subscribe.ack);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut sink = ConsoleSink::stdout(ack);
        let mut subscriber = Subscriber::new(policy);
        subscriber.run(inbox.as_mut(), &mut sink, shutdown_rx).await
    });

    let summary = wait_for_subscriber(task, shutdown_tx, tokio::signal::ctrl_c()).await?;
    if summary.state != SubscriberState::Stopped {
        warn!(state = ?summary.state, "subscriber ended in unexpected state");
    }
    info!(received = summary.received, "subscriber stopped");
    Ok(())
}

/// Await the subscriber task, raising the stop flag when `signal` fires. A signal
/// that fails to install is logged and the task keeps running.
async fn wait_for_subscriber<S>(
    mut task: JoinHandle<std::result::Result<SubscribeSummary, Error>>,
    shutdown_tx: watch::Sender<bool>,
    signal: S,
) -> Result<SubscribeSummary>
where
    S: Future<Output = std::io::Result<()>>,
{
    let joined = tokio::select! {
        joined = &mut task => joined,
        signal = signal => {
            match signal {
                Ok(()) => {
                    info!("shutdown signal received, stopping subscriber...");
                    let _ = shutdown_tx.send(true);
                }
                Err(e) => warn!("failed to listen for ctrl-c, subscriber keeps running: {e}"),
            }
            task.await
        }
    };
    Ok(joined.context("subscriber task panicked")??)
}

async fn list(broker: &dyn Broker) -> Result<()> {
    for name in broker.list_destinations().await? {
        println!("{name}");
    }
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    // stdout is reserved for message output
    match config.format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}
