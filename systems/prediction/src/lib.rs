#![deny(
    unsafe_code,
    missing_docs,
    dead_code,
    unused_results,
    non_snake_case,
    unreachable_pub
)]

//! Client-side predictive mirror of the authoritative world.
//!
//! The [`Predictor`] keeps a short history of per-tick registry snapshots
//! and pending deltas, advances them exactly like the server does, and
//! discards and recomputes whenever authoritative data contradicts what it
//! speculated. Deltas route through the same `blockfall_world` appliers the
//! server uses, so an identical ordered delta stream reproduces the
//! server's registry bit for bit.

use std::collections::{BTreeMap, BTreeSet};

use blockfall_core::{
    Action, ActionKind, ActionPhase, EntityId, EntityState, Message, Tick, ACTION_DELAY,
    PREDICTION_HORIZON,
};
use blockfall_world::{query, FaultPolicy, Registry};

/// Lifecycle phase of the predictor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// No authoritative snapshot has arrived yet; deltas are dropped.
    Unestablished,
    /// Mirroring the server speculatively from the last snapshot.
    Predicting,
}

/// Outcome of one [`Predictor::advance`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Advance {
    /// Nothing to show: no authoritative world has been received.
    Unestablished,
    /// Prediction has outrun confirmation; advancement is frozen until new
    /// authoritative data arrives.
    Frozen,
    /// The frame for this tick is now shown.
    Shown(Tick),
}

#[derive(Clone, Debug)]
struct Frame {
    registry: Registry,
    /// Set on frames built from a hard resync that have not been displayed
    /// yet; such a frame is shown verbatim instead of being re-predicted.
    fresh_authoritative: bool,
}

/// Per-connection speculative mirror of the server registry.
#[derive(Debug)]
pub struct Predictor {
    phase: Phase,
    frames: BTreeMap<u64, Frame>,
    pending: BTreeMap<u64, Vec<ActionKind>>,
    shown: u64,
    last_sync: u64,
    horizon: u64,
    action_delay: u64,
    width: u32,
    height: u32,
}

impl Predictor {
    /// Creates an unestablished predictor for a world of the given cell
    /// dimensions (announced by the server before the first snapshot).
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            phase: Phase::Unestablished,
            frames: BTreeMap::new(),
            pending: BTreeMap::new(),
            shown: 0,
            last_sync: 0,
            horizon: PREDICTION_HORIZON,
            action_delay: ACTION_DELAY,
            width,
            height,
        }
    }

    /// Current lifecycle phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Tick of the currently shown frame, once predicting.
    #[must_use]
    pub fn shown_tick(&self) -> Option<Tick> {
        match self.phase {
            Phase::Unestablished => None,
            Phase::Predicting => Some(Tick::new(self.shown)),
        }
    }

    /// Tick of the last hard resync.
    #[must_use]
    pub fn last_sync_tick(&self) -> Option<Tick> {
        match self.phase {
            Phase::Unestablished => None,
            Phase::Predicting => Some(Tick::new(self.last_sync)),
        }
    }

    /// Registry of the currently shown frame, for display.
    #[must_use]
    pub fn registry(&self) -> Option<&Registry> {
        match self.phase {
            Phase::Unestablished => None,
            Phase::Predicting => self.frames.get(&self.shown).map(|frame| &frame.registry),
        }
    }

    /// Routes an inbound server message to the matching predictor entry
    /// point. Handshake and liveness messages are no concern of the
    /// predictor and are ignored.
    pub fn ingest(&mut self, message: &Message) {
        match message {
            Message::Registry {
                entities,
                highest_id,
                at_tick,
            } => self.sync_registry(entities, *highest_id, *at_tick),
            Message::AddPlayers { states, at_tick }
            | Message::AddNpcs { states, at_tick } => {
                for state in states {
                    self.add_delta(Action {
                        at_tick: *at_tick,
                        kind: ActionKind::AddEntity {
                            state: state.clone(),
                        },
                    });
                }
            }
            Message::DeleteEntities { ids, at_tick } => self.add_delta(Action {
                at_tick: *at_tick,
                kind: ActionKind::DeleteEntities { ids: ids.clone() },
            }),
            Message::UpdateEntities { states, at_tick } => self.add_delta(Action {
                at_tick: *at_tick,
                kind: ActionKind::UpdateEntities {
                    states: states.clone(),
                },
            }),
            Message::UpdateScore {
                entity,
                score,
                at_tick,
            } => self.add_delta(Action {
                at_tick: *at_tick,
                kind: ActionKind::UpdateScore {
                    entity: *entity,
                    score: *score,
                },
            }),
            Message::Move {
                entity,
                velocity,
                angle,
                at_tick,
            } => self.add_delta(Action {
                at_tick: *at_tick,
                kind: ActionKind::Move {
                    entity: *entity,
                    velocity: *velocity,
                    angle: *angle,
                },
            }),
            _ => {}
        }
    }

    /// Advances the mirror by at most one tick.
    ///
    /// A not-yet-displayed authoritative frame is shown verbatim first.
    /// Otherwise the next tick is predicted from the prior frame (pre-pass
    /// deltas, one registry update, post-pass creations), unless prediction
    /// would outrun the last resync by more than the horizon, in which case
    /// advancement freezes rather than speculating indefinitely.
    pub fn advance(&mut self) -> Advance {
        if self.phase == Phase::Unestablished {
            return Advance::Unestablished;
        }

        if let Some(frame) = self.frames.get_mut(&self.shown) {
            if frame.fresh_authoritative {
                frame.fresh_authoritative = false;
                self.evict();
                return Advance::Shown(Tick::new(self.shown));
            }
        }

        let next = self.shown.saturating_add(1);
        if next > self.last_sync.saturating_add(self.horizon) {
            log::debug!(
                "prediction frozen at tick {}: no authoritative data since {}",
                self.shown,
                self.last_sync
            );
            return Advance::Frozen;
        }

        if !self.frames.contains_key(&next) && !self.compute_frame(next) {
            return Advance::Frozen;
        }
        self.shown = next;
        self.evict();
        Advance::Shown(Tick::new(next))
    }

    /// Records an authoritative or locally originated delta.
    ///
    /// A delta behind the shown tick is logged; at or before the last hard
    /// resync it is superseded and discarded, otherwise every cached frame
    /// from its tick forward is invalidated so the affected range is
    /// recomputed on the following advances.
    pub fn add_delta(&mut self, action: Action) {
        let target = action.at_tick.get();
        if self.phase == Phase::Unestablished {
            log::debug!("delta for tick {target} before any snapshot; dropped");
            return;
        }
        if target <= self.last_sync {
            log::debug!(
                "delta for tick {target} at or before resync {}; superseded",
                self.last_sync
            );
            return;
        }
        if target <= self.shown {
            log::debug!(
                "late delta for tick {target} behind shown tick {}; rolling back",
                self.shown
            );
            let invalidated = self.frames.split_off(&target);
            drop(invalidated);
            self.shown = target - 1;
        }
        self.pending.entry(target).or_default().push(action.kind);
    }

    /// Hard resync from a full registry dump.
    ///
    /// Discards every cached frame and all deltas at or before `tick`,
    /// reconciles a fresh snapshot from the dump (updating known entities,
    /// creating unknown ones, dooming anything locally present but absent
    /// from the dump), and parks it at `tick`, marked authoritative so the
    /// next advance shows it verbatim rather than re-predicting it.
    pub fn sync_registry(&mut self, dump: &[EntityState], highest_id: EntityId, tick: Tick) {
        let tick = tick.get();
        let mut registry = self
            .frames
            .range(..=tick)
            .next_back()
            .map(|(_, frame)| frame.registry.clone())
            .unwrap_or_else(|| Registry::new(self.width, self.height, FaultPolicy::Log));

        for state in dump {
            if registry.contains(state.id) {
                registry.apply_entity_state(state);
            } else if let Err(error) = registry.add(state) {
                log::warn!("resync could not place entity {}: {error}", state.id.get());
            }
        }
        let announced: BTreeSet<EntityId> = dump.iter().map(|state| state.id).collect();
        let stale: Vec<EntityId> = query::dump(&registry)
            .into_iter()
            .map(|state| state.id)
            .filter(|id| !announced.contains(id))
            .collect();
        for id in stale {
            registry.doom(id);
        }
        registry.purge_doomed();
        registry.observe_highest_id(highest_id);

        self.frames.clear();
        let _ = self.frames.insert(
            tick,
            Frame {
                registry,
                fresh_authoritative: true,
            },
        );
        self.pending = self.pending.split_off(&tick.saturating_add(1));
        self.last_sync = tick;
        self.shown = tick;
        self.phase = Phase::Predicting;
    }

    /// Schedules a locally originated action [`ACTION_DELAY`] ticks ahead
    /// of the shown tick and returns the record for immediate transmission,
    /// so local prediction and authoritative execution target the identical
    /// tick.
    pub fn originate(&mut self, kind: ActionKind) -> Action {
        let action = Action {
            at_tick: Tick::new(self.shown.saturating_add(self.action_delay)),
            kind,
        };
        self.add_delta(action.clone());
        action
    }

    fn compute_frame(&mut self, next: u64) -> bool {
        let Some(prior) = self.frames.get(&(next - 1)) else {
            log::warn!("no prior frame to predict tick {next} from");
            return false;
        };
        let mut registry = prior.registry.clone();
        let due = self.pending.get(&next).cloned().unwrap_or_default();

        for kind in &due {
            if kind.phase() == ActionPhase::PrePass {
                blockfall_world::apply_pre_pass(&mut registry, kind);
            }
        }
        let mut events = Vec::new();
        registry.update(&mut events);
        for kind in &due {
            if let ActionKind::AddEntity { state } = kind {
                if let Err(error) = blockfall_world::apply_creation(&mut registry, state) {
                    log::debug!(
                        "predicted creation of entity {} rejected: {error}",
                        state.id.get()
                    );
                }
            }
        }

        let _ = self.frames.insert(
            next,
            Frame {
                registry,
                fresh_authoritative: false,
            },
        );
        true
    }

    /// Drops frames older than the last hard resync; nothing behind it can
    /// be rolled back to, because deltas at or before it are superseded.
    fn evict(&mut self) {
        self.frames = self.frames.split_off(&self.last_sync);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockfall_core::{Angle, PayloadState, Position, Velocity};

    fn obstacle(id: u32, x: i32, y: i32) -> EntityState {
        EntityState {
            id: EntityId::new(id),
            position: Position::new(x, y),
            velocity: Velocity::ZERO,
            angle: Angle::from_degrees(0),
            moving: false,
            owner: None,
            payload: PayloadState::Obstacle,
        }
    }

    #[test]
    fn deltas_before_establishment_are_dropped() {
        let mut predictor = Predictor::new(32, 32);
        predictor.add_delta(Action {
            at_tick: Tick::new(3),
            kind: ActionKind::DeleteEntities { ids: Vec::new() },
        });
        assert_eq!(predictor.advance(), Advance::Unestablished);
        assert!(predictor.pending.is_empty());
    }

    #[test]
    fn first_snapshot_is_shown_verbatim() {
        let mut predictor = Predictor::new(32, 32);
        predictor.sync_registry(&[obstacle(1, 512, 512)], EntityId::new(1), Tick::new(10));

        assert_eq!(predictor.phase(), Phase::Predicting);
        assert_eq!(predictor.advance(), Advance::Shown(Tick::new(10)));
        let registry = predictor.registry().expect("registry");
        assert!(registry.contains(EntityId::new(1)));
        assert_eq!(predictor.advance(), Advance::Shown(Tick::new(11)));
    }

    #[test]
    fn advancement_freezes_at_the_prediction_horizon() {
        let mut predictor = Predictor::new(32, 32);
        predictor.sync_registry(&[], EntityId::new(0), Tick::new(0));

        let mut shown = 0;
        loop {
            match predictor.advance() {
                Advance::Shown(_) => shown += 1,
                Advance::Frozen => break,
                Advance::Unestablished => panic!("predictor lost establishment"),
            }
        }
        // The resync frame plus one prediction per horizon tick.
        assert_eq!(shown, 1 + PREDICTION_HORIZON);
        assert_eq!(predictor.shown_tick(), Some(Tick::new(PREDICTION_HORIZON)));

        // New authoritative data thaws the mirror.
        predictor.sync_registry(&[], EntityId::new(0), Tick::new(PREDICTION_HORIZON + 1));
        assert_eq!(
            predictor.advance(),
            Advance::Shown(Tick::new(PREDICTION_HORIZON + 1))
        );
    }

    #[test]
    fn superseded_deltas_are_discarded() {
        let mut predictor = Predictor::new(32, 32);
        predictor.sync_registry(&[], EntityId::new(0), Tick::new(20));
        predictor.add_delta(Action {
            at_tick: Tick::new(15),
            kind: ActionKind::DeleteEntities { ids: Vec::new() },
        });
        assert!(predictor.pending.is_empty());
    }

    #[test]
    fn late_deltas_roll_the_mirror_back() {
        let mut predictor = Predictor::new(32, 32);
        predictor.sync_registry(&[obstacle(1, 512, 512)], EntityId::new(1), Tick::new(0));
        for _ in 0..6 {
            let _ = predictor.advance();
        }
        assert_eq!(predictor.shown_tick(), Some(Tick::new(5)));

        predictor.add_delta(Action {
            at_tick: Tick::new(3),
            kind: ActionKind::AddEntity {
                state: obstacle(2, 1024, 1024),
            },
        });
        assert_eq!(predictor.shown_tick(), Some(Tick::new(2)));

        // Re-advancing replays ticks 3..5 with the delta included.
        for _ in 0..3 {
            let _ = predictor.advance();
        }
        assert_eq!(predictor.shown_tick(), Some(Tick::new(5)));
        let registry = predictor.registry().expect("registry");
        assert!(registry.contains(EntityId::new(2)));
    }

    #[test]
    fn originate_targets_the_action_delay() {
        let mut predictor = Predictor::new(32, 32);
        predictor.sync_registry(&[obstacle(1, 512, 512)], EntityId::new(1), Tick::new(4));
        let _ = predictor.advance();

        let action = predictor.originate(ActionKind::Move {
            entity: EntityId::new(1),
            velocity: Velocity::ZERO,
            angle: Angle::from_degrees(0),
        });
        assert_eq!(action.at_tick, Tick::new(4 + ACTION_DELAY));
        assert_eq!(
            predictor.pending.get(&(4 + ACTION_DELAY)).map(Vec::len),
            Some(1)
        );
    }
}
