#![deny(
    unsafe_code,
    missing_docs,
    dead_code,
    unused_results,
    non_snake_case,
    unreachable_pub
)]

//! Headless Blockfall client.
//!
//! Connects, authenticates, and drives a [`Predictor`] at the tick rate,
//! mirroring the authoritative world speculatively. Rendering and input
//! belong to a front end; this binary reports the predicted world on the
//! log instead.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    io::{self, Read, Write},
    net::TcpStream,
    time::{Duration, Instant},
};

use anyhow::{bail, Context as _};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use blockfall_core::{wire, EntityId, Message, TICK_RATE};
use blockfall_system_prediction::{Advance, Predictor};
use blockfall_world::query;
use clap::Parser;
use rand::RngCore as _;

const STATUS_INTERVAL: u64 = 300;
const PING_INTERVAL: u64 = 300;
const DRAIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Predictive client for a Blockfall server.
#[derive(Debug, Parser)]
#[command(name = "blockfall-client")]
struct Args {
    /// Player name presented at login.
    #[arg(long)]
    name: String,
    /// Server host.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Server port.
    #[arg(long, default_value_t = 35_565)]
    port: u16,
    /// Handshake key material size in bytes.
    #[arg(long, default_value_t = 32)]
    key_size: usize,
    /// Password; only its hash leaves the process.
    #[arg(long, default_value = "")]
    password: String,
}

/// Line-framed connection to the server.
#[derive(Debug)]
struct Connection {
    stream: TcpStream,
    inbound: wire::LineBuffer,
}

impl Connection {
    fn open(host: &str, port: u16) -> anyhow::Result<Self> {
        let stream = TcpStream::connect((host, port))
            .with_context(|| format!("connecting to {host}:{port}"))?;
        stream
            .set_read_timeout(Some(DRAIN_TIMEOUT))
            .context("configuring socket")?;
        Ok(Self {
            stream,
            inbound: wire::LineBuffer::new(),
        })
    }

    fn send(&mut self, message: &Message) -> anyhow::Result<()> {
        let bytes = wire::encode(message).context("encoding message")?;
        self.stream.write_all(&bytes).context("sending message")?;
        Ok(())
    }

    /// Drains everything currently readable into decoded messages.
    /// Returns `Ok(false)` when the server closed the connection.
    fn drain(&mut self, messages: &mut Vec<Message>) -> anyhow::Result<bool> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(false),
                Ok(count) => self.inbound.extend(&chunk[..count]),
                Err(error)
                    if matches!(
                        error.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    break;
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error).context("reading from server"),
            }
        }
        while let Some(line) = self.inbound.next_line() {
            match wire::decode(&line) {
                Ok(message) => messages.push(message),
                // Protocol fault: drop the message, keep the connection.
                Err(error) => log::warn!("undecodable server message: {error}"),
            }
        }
        Ok(true)
    }

    /// Blocks (bounded by the deadline) until one message arrives. Later
    /// messages from the same read stay queued for the caller.
    fn expect_message(
        &mut self,
        queued: &mut Vec<Message>,
        deadline: Instant,
    ) -> anyhow::Result<Message> {
        while Instant::now() < deadline {
            if !self.drain(queued)? {
                bail!("server closed the connection during the handshake");
            }
            if !queued.is_empty() {
                return Ok(queued.remove(0));
            }
        }
        bail!("timed out waiting for the server");
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut connection = Connection::open(&args.host, args.port)?;
    log::info!("connected to {}:{}", args.host, args.port);

    connection.send(&Message::Handshake {
        player_name: args.name.clone(),
        key_material: random_base64(args.key_size),
    })?;
    let mut queued = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    match connection.expect_message(&mut queued, deadline)? {
        Message::ServerPublicKey { .. } => {}
        other => bail!("expected the server key, got {other:?}"),
    }
    connection.send(&Message::Credential {
        password_hash: password_hash(&args.password),
        iv: random_base64(16),
    })?;

    run(connection, queued, &args.name)
}

fn run(mut connection: Connection, queued: Vec<Message>, name: &str) -> anyhow::Result<()> {
    let mut predictor: Option<Predictor> = None;
    let mut own_entity: Option<EntityId> = None;
    let mut inbound = queued;

    let start = Instant::now();
    let mut tick: u64 = 0;
    loop {
        // Drain the transport until this tick is due, then advance once.
        let due = start + Duration::from_micros(tick.saturating_mul(1_000_000) / u64::from(TICK_RATE));
        loop {
            if !connection.drain(&mut inbound)? {
                bail!("server closed the connection");
            }
            for message in inbound.drain(..) {
                handle(message, &mut predictor, &mut own_entity);
            }
            if Instant::now() >= due {
                break;
            }
        }

        if let Some(predictor) = predictor.as_mut() {
            match predictor.advance() {
                Advance::Shown(_) | Advance::Unestablished => {}
                Advance::Frozen => {
                    if tick % STATUS_INTERVAL == 0 {
                        log::warn!("prediction frozen: waiting for the server");
                    }
                }
            }
        }

        if tick % PING_INTERVAL == 0 {
            connection.send(&Message::Ping)?;
        }
        if tick % STATUS_INTERVAL == 0 {
            log_status(name, predictor.as_ref(), own_entity);
        }
        tick += 1;
    }
}

fn handle(
    message: Message,
    predictor: &mut Option<Predictor>,
    own_entity: &mut Option<EntityId>,
) {
    match message {
        Message::YouAre { id } => {
            log::info!("controlling entity {}", id.get());
            *own_entity = Some(id);
        }
        Message::World {
            ref name,
            width,
            height,
            ..
        } => {
            log::info!("joined world '{name}' ({width}x{height} cells)");
            if predictor.is_none() {
                *predictor = Some(Predictor::new(width, height));
            }
        }
        Message::Pong => {}
        other => {
            if let Some(predictor) = predictor.as_mut() {
                predictor.ingest(&other);
            } else {
                log::debug!("world description pending; dropping {other:?}");
            }
        }
    }
}

fn log_status(name: &str, predictor: Option<&Predictor>, own_entity: Option<EntityId>) {
    let Some(predictor) = predictor else {
        log::info!("{name}: waiting for the world description");
        return;
    };
    let Some(registry) = predictor.registry() else {
        log::info!("{name}: waiting for the first snapshot");
        return;
    };
    let position = own_entity
        .and_then(|id| query::entity_state(registry, id))
        .map(|state| (state.position.x(), state.position.y()));
    log::info!(
        "{name}: tick {:?}, {} entities, position {position:?}",
        predictor.shown_tick().map(|tick| tick.get()),
        registry.len()
    );
}

fn random_base64(size: usize) -> String {
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD_NO_PAD.encode(bytes)
}

/// Stable hash of the password; the account registry compares these.
fn password_hash(password: &str) -> String {
    let mut hasher = DefaultHasher::new();
    password.hash(&mut hasher);
    STANDARD_NO_PAD.encode(hasher.finish().to_be_bytes())
}
