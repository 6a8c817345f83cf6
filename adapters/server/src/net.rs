//! Poll-per-tick TCP transport for the server.
//!
//! One non-blocking poller wakes the loop for new connections, readable
//! sessions, and flushable outboxes. All network input is drained between
//! ticks; no worker thread ever touches simulation state.

use std::{
    io::{self, Read, Write},
    net::{TcpListener, TcpStream},
    time::{Duration, Instant},
};

use blockfall_core::{wire, Action, ActionKind, EntityId, Message};
use blockfall_system_simulation::Simulation;

use crate::storage::Storage;

const LISTENER_KEY: usize = usize::MAX - 1;
const SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Authentication progress of one connection.
#[derive(Debug, Clone)]
enum Stage {
    /// Waiting for the opening handshake.
    Handshaking,
    /// Key material exchanged; waiting for the credential.
    AwaitingCredential { name: String },
    /// Authenticated and driving a player entity.
    Playing { entity: EntityId },
}

#[derive(Debug)]
struct Session {
    conn: TcpStream,
    inbound: wire::LineBuffer,
    outbox: Vec<u8>,
    stage: Stage,
    last_seen: Instant,
}

impl Session {
    fn accept(conn: TcpStream) -> io::Result<Self> {
        conn.set_nonblocking(true)?;
        Ok(Self {
            conn,
            inbound: wire::LineBuffer::new(),
            outbox: Vec::new(),
            stage: Stage::Handshaking,
            last_seen: Instant::now(),
        })
    }

    /// Writes as much of the outbox as the socket accepts right now.
    fn flush(&mut self) -> io::Result<()> {
        while !self.outbox.is_empty() {
            match self.conn.write(&self.outbox) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(written) => {
                    let _ = self.outbox.drain(..written);
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }
}

/// The server's transport: listener, poller, and per-connection sessions.
#[derive(Debug)]
pub(crate) struct Network {
    listener: TcpListener,
    poller: polling::Poller,
    events: Vec<polling::Event>,
    sessions: Vec<Option<Session>>,
    max_clients: usize,
    server_key: String,
}

impl Network {
    /// Binds the listener and registers it with a fresh poller.
    pub(crate) fn bind(port: u16, max_clients: usize, server_key: String) -> io::Result<Self> {
        let poller = polling::Poller::new()?;
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        poller.add(&listener, polling::Event::readable(LISTENER_KEY))?;
        log::info!("listening on port {port}");
        Ok(Self {
            listener,
            poller,
            events: Vec::new(),
            sessions: Vec::new(),
            max_clients,
            server_key,
        })
    }

    /// Polls connections and drains inbound messages until the deadline.
    /// This is the only suspension point of the server loop.
    pub(crate) fn poll_until(
        &mut self,
        deadline: Instant,
        simulation: &mut Simulation,
        storage: &Storage,
    ) {
        loop {
            let Some(timeout) = deadline.checked_duration_since(Instant::now()) else {
                return;
            };
            self.events.clear();
            match self.poller.wait(&mut self.events, Some(timeout)) {
                Ok(0) => return,
                Ok(_) => {}
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    log::error!("poller failure: {error}");
                    return;
                }
            }

            let woken: Vec<polling::Event> = self.events.drain(..).collect();
            for event in woken {
                if event.key == LISTENER_KEY {
                    self.accept_connections();
                    if let Err(error) = self
                        .poller
                        .modify(&self.listener, polling::Event::readable(LISTENER_KEY))
                    {
                        log::error!("cannot re-arm listener: {error}");
                    }
                    continue;
                }
                if event.readable {
                    self.read_session(event.key, simulation, storage);
                }
                if event.writable {
                    let failed = match self.sessions.get_mut(event.key) {
                        Some(Some(session)) => session.flush().is_err(),
                        _ => false,
                    };
                    if failed {
                        self.drop_session(event.key, simulation, "write failure");
                        continue;
                    }
                }
                self.rearm(event.key);
            }
        }
    }

    /// Queues a message batch for every authenticated session.
    pub(crate) fn broadcast(&mut self, messages: &[Message]) {
        for message in messages {
            let bytes = match wire::encode(message) {
                Ok(bytes) => bytes,
                Err(error) => {
                    log::error!("cannot encode broadcast: {error}");
                    continue;
                }
            };
            for slot in &mut self.sessions {
                if let Some(session) = slot {
                    if matches!(session.stage, Stage::Playing { .. }) {
                        session.outbox.extend_from_slice(&bytes);
                    }
                }
            }
        }
        for key in 0..self.sessions.len() {
            let flushed = match self.sessions.get_mut(key) {
                Some(Some(session)) if !session.outbox.is_empty() => {
                    Some(session.flush().is_ok())
                }
                _ => None,
            };
            match flushed {
                Some(true) => self.rearm(key),
                Some(false) => {
                    log::warn!("dropping client {key}: broadcast write failure");
                    self.remove_slot(key);
                }
                None => {}
            }
        }
    }

    /// Disconnects sessions that have been silent past the timeout.
    pub(crate) fn drop_stale(&mut self, simulation: &mut Simulation) {
        let now = Instant::now();
        for key in 0..self.sessions.len() {
            let stale = self
                .sessions
                .get(key)
                .and_then(Option::as_ref)
                .is_some_and(|session| now.duration_since(session.last_seen) > SESSION_TIMEOUT);
            if stale {
                self.drop_session(key, simulation, "timed out");
            }
        }
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    log::error!("accept failure: {error}");
                    break;
                }
                Ok((conn, peer)) => {
                    if self.active_sessions() >= self.max_clients {
                        log::warn!("refusing {peer}: server is full");
                        drop(conn);
                        continue;
                    }
                    let session = match Session::accept(conn) {
                        Ok(session) => session,
                        Err(error) => {
                            log::warn!("cannot accept {peer}: {error}");
                            continue;
                        }
                    };
                    let key = self.store_session(session);
                    let watched = match self.sessions.get(key) {
                        Some(Some(session)) => self
                            .poller
                            .add(&session.conn, polling::Event::readable(key)),
                        _ => Ok(()),
                    };
                    if let Err(error) = watched {
                        log::warn!("cannot watch {peer}: {error}");
                        self.remove_slot(key);
                        continue;
                    }
                    log::info!("connection from {peer} as session {key}");
                }
            }
        }
    }

    fn read_session(&mut self, key: usize, simulation: &mut Simulation, storage: &Storage) {
        let mut chunk = [0u8; 4096];
        let mut lines = Vec::new();
        let mut failure = None;
        {
            let Some(Some(session)) = self.sessions.get_mut(key) else {
                return;
            };
            loop {
                match session.conn.read(&mut chunk) {
                    Ok(0) => {
                        failure = Some("closed by peer");
                        break;
                    }
                    Ok(count) => session.inbound.extend(&chunk[..count]),
                    Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                    Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                    Err(error) => {
                        log::debug!("read failure on session {key}: {error}");
                        failure = Some("read failure");
                        break;
                    }
                }
            }
            if failure.is_none() {
                session.last_seen = Instant::now();
                while let Some(line) = session.inbound.next_line() {
                    lines.push(line);
                }
            }
        }
        if let Some(reason) = failure {
            self.drop_session(key, simulation, reason);
            return;
        }

        for line in lines {
            let message = match wire::decode(&line) {
                Ok(message) => message,
                Err(error) => {
                    // Protocol fault: drop the message, keep the connection.
                    log::warn!("undecodable message from session {key}: {error}");
                    continue;
                }
            };
            self.dispatch(key, message, simulation, storage);
        }
    }

    fn dispatch(
        &mut self,
        key: usize,
        message: Message,
        simulation: &mut Simulation,
        storage: &Storage,
    ) {
        let stage = match self.sessions.get(key).and_then(Option::as_ref) {
            Some(session) => session.stage.clone(),
            None => return,
        };
        match (stage, message) {
            (Stage::Handshaking, Message::Handshake { player_name, .. }) => {
                let key_material = self.server_key.clone();
                self.send_to(key, &Message::ServerPublicKey { key: key_material });
                if let Some(Some(session)) = self.sessions.get_mut(key) {
                    session.stage = Stage::AwaitingCredential { name: player_name };
                }
            }
            (
                Stage::AwaitingCredential { name },
                Message::Credential { password_hash, .. },
            ) => {
                let accepted = storage
                    .verify_or_register(&name, &password_hash)
                    .unwrap_or_else(|error| {
                        log::error!("account lookup failed for '{name}': {error}");
                        false
                    });
                if !accepted {
                    log::warn!("authentication failure for '{name}'");
                    self.drop_session(key, simulation, "authentication failure");
                    return;
                }

                let mut joined = Vec::new();
                match simulation.connect_player(&name, &mut joined) {
                    Ok(state) => {
                        log::info!("'{name}' joined as entity {}", state.id.get());
                        if let Some(Some(session)) = self.sessions.get_mut(key) {
                            session.stage = Stage::Playing { entity: state.id };
                        }
                        self.send_to(key, &Message::YouAre { id: state.id });
                        self.send_to(key, &simulation.world_message());
                        self.send_to(key, &simulation.registry_message());
                        self.broadcast(&joined);
                    }
                    Err(error) => {
                        log::warn!("no spawn for '{name}': {error}");
                        self.drop_session(key, simulation, "no spawn available");
                    }
                }
            }
            (
                Stage::Playing { entity },
                Message::Move {
                    entity: target,
                    velocity,
                    angle,
                    at_tick,
                },
            ) => {
                if target != entity {
                    log::warn!("session {key} tried to steer entity {}", target.get());
                    return;
                }
                let effective = simulation.schedule(Action {
                    at_tick,
                    kind: ActionKind::Move {
                        entity,
                        velocity,
                        angle,
                    },
                });
                // Mirror the delta to everyone else so their predictors can
                // run it at the same tick the server will.
                let echo = Message::Move {
                    entity,
                    velocity,
                    angle,
                    at_tick: effective,
                };
                self.broadcast_except(key, &echo);
            }
            (Stage::Playing { entity }, Message::AddNpcs { states, at_tick }) => {
                // Creation requests: the server re-ids them and answers with
                // its own add broadcast once they execute.
                for state in states {
                    let _ = simulation.schedule_from_client(
                        entity,
                        Action {
                            at_tick,
                            kind: ActionKind::AddEntity { state },
                        },
                    );
                }
            }
            (Stage::Playing { .. }, Message::Ping) => {
                self.send_to(key, &Message::Pong);
            }
            (Stage::Playing { .. }, Message::Save) => {
                if let Err(error) = storage.save_level(&simulation.level_record()) {
                    log::error!("save failed: {error}");
                }
            }
            (_, message) => {
                // Protocol fault: unexpected for the stage. Drop it only.
                log::warn!("unexpected message from session {key}: {message:?}");
            }
        }
    }

    fn send_to(&mut self, key: usize, message: &Message) {
        let bytes = match wire::encode(message) {
            Ok(bytes) => bytes,
            Err(error) => {
                log::error!("cannot encode message: {error}");
                return;
            }
        };
        let flushed = match self.sessions.get_mut(key) {
            Some(Some(session)) => {
                session.outbox.extend_from_slice(&bytes);
                session.flush().is_ok()
            }
            _ => return,
        };
        if flushed {
            self.rearm(key);
        } else {
            self.remove_slot(key);
        }
    }

    fn broadcast_except(&mut self, skip: usize, message: &Message) {
        for key in 0..self.sessions.len() {
            if key == skip {
                continue;
            }
            let playing = self
                .sessions
                .get(key)
                .and_then(Option::as_ref)
                .is_some_and(|session| matches!(session.stage, Stage::Playing { .. }));
            if playing {
                self.send_to(key, message);
            }
        }
    }

    fn drop_session(&mut self, key: usize, simulation: &mut Simulation, reason: &str) {
        let Some(Some(session)) = self.sessions.get(key) else {
            return;
        };
        log::info!("session {key} disconnected: {reason}");
        let entity = match session.stage {
            Stage::Playing { entity } => Some(entity),
            _ => None,
        };
        self.remove_slot(key);
        if let Some(entity) = entity {
            let mut departures = Vec::new();
            simulation.disconnect_player(entity, &mut departures);
            self.broadcast(&departures);
        }
    }

    fn remove_slot(&mut self, key: usize) {
        if let Some(slot) = self.sessions.get_mut(key) {
            if let Some(session) = slot.take() {
                if let Err(error) = self.poller.delete(&session.conn) {
                    log::debug!("poller forget failed for session {key}: {error}");
                }
            }
        }
    }

    fn rearm(&mut self, key: usize) {
        if let Some(Some(session)) = self.sessions.get(key) {
            let interest = polling::Event {
                key,
                readable: true,
                writable: !session.outbox.is_empty(),
            };
            if let Err(error) = self.poller.modify(&session.conn, interest) {
                log::debug!("cannot re-arm session {key}: {error}");
            }
        }
    }

    fn store_session(&mut self, session: Session) -> usize {
        for (key, slot) in self.sessions.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(session);
                return key;
            }
        }
        self.sessions.push(Some(session));
        self.sessions.len() - 1
    }

    fn active_sessions(&self) -> usize {
        self.sessions.iter().filter(|slot| slot.is_some()).count()
    }
}
