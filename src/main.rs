#![deny(dead_code)] // DO NOT REMOVE THIS EVER
use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

mod utils;

use peerchat::config::{self, AppConfig};
use peerchat::identity::{FileIdentity, IdentityProvider, StaticIdentity};
use peerchat::rtc::WebRtcFactory;
use peerchat::signaling::{MqttConnector, TransportConfig};
use peerchat::storage::JsonStore;
use peerchat::{ChatCoordinator, DeliveryStatus, Message};

/// Command line arguments for peerchat
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "peerchat: serverless one-to-one chat over WebRTC data channels.",
    long_about = "peerchat is a terminal chat client. Peers find each other through a public MQTT \
    broker and then talk directly over a WebRTC data channel.\n\n\
    Type /help once running to see the available commands."
)]
struct Args {
    /// Directory holding config.json, the identity file, data and logs
    #[arg(long, value_name = "PATH")]
    config_dir: Option<PathBuf>,

    /// MQTT broker host (overrides config.json)
    #[arg(long, value_name = "HOST")]
    broker_host: Option<String>,

    /// MQTT broker port (overrides config.json)
    #[arg(long, value_name = "PORT")]
    broker_port: Option<u16>,

    /// Use this user id instead of the stored one (e.g. ABC-123); not persisted
    #[arg(long, value_name = "ID")]
    identity: Option<String>,

    /// Log level: off, error, warn, info, debug or trace
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: LevelFilter,

    /// Log file; defaults to peerchat.log in the config directory
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Debug, PartialEq)]
enum Command {
    Add { peer: String, name: String },
    Accept { peer: String, name: String },
    Decline(String),
    Remove(String),
    Open(String),
    Close,
    Contacts,
    History,
    WhoAmI,
    Help,
    Quit,
    Say(String),
    Invalid(String),
}

impl Command {
    fn parse(line: &str) -> Command {
        let line = line.trim();
        if !line.starts_with('/') {
            return Command::Say(line.to_string());
        }
        let mut parts = line.splitn(3, ' ');
        let verb = parts.next().unwrap_or_default();
        let arg = parts.next().map(str::trim).filter(|a| !a.is_empty());
        let rest = parts.next().map(str::trim).unwrap_or_default().to_string();
        match (verb, arg) {
            ("/add", Some(peer)) => Command::Add { peer: peer.to_string(), name: rest },
            ("/accept", Some(peer)) => Command::Accept { peer: peer.to_string(), name: rest },
            ("/decline", Some(peer)) => Command::Decline(peer.to_string()),
            ("/remove", Some(peer)) => Command::Remove(peer.to_string()),
            ("/open", Some(peer)) => Command::Open(peer.to_string()),
            ("/close", _) => Command::Close,
            ("/contacts", _) => Command::Contacts,
            ("/history", _) => Command::History,
            ("/whoami", _) => Command::WhoAmI,
            ("/help", _) => Command::Help,
            ("/quit", _) | ("/exit", _) => Command::Quit,
            _ => Command::Invalid(line.to_string()),
        }
    }
}

const HELP: &str = "\
Commands:
  /add ID NAME      add a contact and send a request
  /accept ID NAME   accept a contact request
  /decline ID       decline a contact request
  /remove ID        remove a contact (history is kept)
  /open ID          open a chat and connect
  /close            close the current chat
  /contacts         list contacts
  /history          show the current conversation
  /whoami           show your id
  /quit             exit
Anything else is sent to the open chat.";

fn format_message(message: &Message, me: &str) -> String {
    let who = if message.sender_id == me { "you" } else { message.sender_id.as_str() };
    let marker = match message.status {
        DeliveryStatus::Pending => " (pending)",
        DeliveryStatus::Failed => " (failed)",
        DeliveryStatus::Sent | DeliveryStatus::Delivered | DeliveryStatus::Read => "",
    };
    format!(
        "[{}] {}: {}{}",
        message.timestamp.with_timezone(&chrono::Local).format("%H:%M"),
        who,
        message.content,
        marker
    )
}

fn print_events(coordinator: &ChatCoordinator) {
    let me = coordinator.user_id().to_string();
    coordinator.on_message(move |message| match message.status {
        DeliveryStatus::Pending | DeliveryStatus::Delivered => println!("{}", format_message(message, &me)),
        DeliveryStatus::Failed => println!("!! could not deliver: {}", message.content),
        DeliveryStatus::Sent | DeliveryStatus::Read => {}
    });
    coordinator.on_connection_state(|status| println!("-- connection: {}", status));
    coordinator.on_contact_request(|request| {
        println!(
            "-- {} ({}) wants to chat: /accept {} NAME or /decline {}",
            request.name, request.peer_id, request.peer_id, request.peer_id
        )
    });
    coordinator.on_contact_response(|response| {
        let verdict = if response.accepted { "accepted" } else { "declined" };
        println!("-- {} {} your contact request", response.peer_id, verdict);
    });
    coordinator.on_error(|error| eprintln!("!! {}", error));
}

async fn run_command(coordinator: &ChatCoordinator, command: Command) -> bool {
    match command {
        Command::Add { peer, name } => {
            if coordinator.add_contact(&peer, &name).await {
                println!("-- contact request sent to {}", peer);
            } else {
                println!("-- {} is already a contact", peer);
            }
        }
        Command::Accept { peer, name } => {
            if !coordinator.accept_contact(&peer, &name).await {
                println!("-- no contact request from {}", peer);
            }
        }
        Command::Decline(peer) => {
            if !coordinator.decline_contact(&peer).await {
                println!("-- no contact request from {}", peer);
            }
        }
        Command::Remove(peer) => {
            if coordinator.remove_contact(&peer) {
                println!("-- removed {}", peer);
            }
        }
        Command::Open(peer) => {
            coordinator.open_chat(&peer).await;
            for message in coordinator.get_messages(&peer) {
                println!("{}", format_message(&message, coordinator.user_id()));
            }
        }
        Command::Close => coordinator.close_chat().await,
        Command::Contacts => {
            let contacts = coordinator.contacts();
            if contacts.is_empty() {
                println!("-- no contacts yet");
            }
            for contact in contacts {
                println!("   {} {} ({:?})", contact.peer_id, contact.name, contact.status);
            }
        }
        Command::History => match coordinator.current_peer() {
            Some(peer) => {
                for message in coordinator.get_messages(&peer) {
                    println!("{}", format_message(&message, coordinator.user_id()));
                }
            }
            None => println!("-- no chat open"),
        },
        Command::WhoAmI => println!("-- you are {}", coordinator.user_id()),
        Command::Help => println!("{}", HELP),
        Command::Quit => return false,
        Command::Say(text) => {
            if text.is_empty() {
                return true;
            }
            // Failures are reported through on_error
            let _ = coordinator.send_message(&text).await;
        }
        Command::Invalid(line) => println!("-- unknown command '{}', try /help", line),
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(dir) = &args.config_dir {
        config::set_config_dir_override(dir.clone());
    }
    let config_dir = config::get_config_dir()?;
    let log_file = args.log_file.clone().unwrap_or_else(|| config_dir.join("peerchat.log"));
    utils::setup_logging(log_file.to_str(), args.log_level)?;
    info!("System information: {} {}", std::env::consts::OS, std::env::consts::ARCH);

    let mut config = AppConfig::load().context("Failed to load config.json")?;
    if let Some(host) = args.broker_host {
        config.broker_host = host;
    }
    if let Some(port) = args.broker_port {
        config.broker_port = port;
    }

    let identity: Box<dyn IdentityProvider> = match args.identity.as_deref() {
        Some(id) => Box::new(StaticIdentity::new(id)?),
        None => {
            let (identity, created) = FileIdentity::load_or_create(&config_dir)?;
            if created {
                println!("-- generated a new identity, stored in {}", identity.path().display());
            }
            Box::new(identity)
        }
    };

    let store = Arc::new(JsonStore::open(config.data_dir()?)?);
    let coordinator = ChatCoordinator::builder(identity.as_ref())
        .display_name(config.display_name.clone().unwrap_or_else(|| identity.user_id()))
        .broker(Arc::new(MqttConnector::new(config.broker_host.clone(), config.broker_port)))
        .peer_factory(Arc::new(WebRtcFactory::new(config.stun_servers.clone())))
        .transport_config(TransportConfig {
            namespace: config.namespace.clone(),
            ..TransportConfig::default()
        })
        .store(store)
        .build();
    print_events(&coordinator);

    println!("-- you are {} (type /help for commands)", coordinator.user_id());
    println!("-- connecting to {}:{}...", config.broker_host, config.broker_port);
    match coordinator.initialize().await {
        Ok(()) => println!("-- connected"),
        Err(e) => {
            warn!("Starting without signaling: {}", e);
            println!("-- offline: {}; requests will be sent once the broker is reachable", e);
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if !run_command(&coordinator, Command::parse(&line)).await {
            break;
        }
    }

    coordinator.dispose().await;
    info!("peerchat shut down");
    Ok(())
}
