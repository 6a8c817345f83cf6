//! Entity storage and the per-kind update contract.

use blockfall_core::{
    Angle, EntityId, EntityKind, EntityState, PayloadState, Position, Velocity,
    SAFE_IMPACT_SPEED,
};

/// One live entity inside the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Entity {
    pub(crate) id: EntityId,
    pub(crate) position: Position,
    pub(crate) velocity: Velocity,
    pub(crate) angle: Angle,
    pub(crate) moving: bool,
    pub(crate) owner: Option<EntityId>,
    pub(crate) payload: PayloadState,
}

/// How an entity reacts to hitting its obstruction set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ImpactReaction {
    /// Damage dealt to every obstruction.
    pub(crate) damage_dealt: i32,
    /// Damage the mover inflicts on itself.
    pub(crate) self_damage: i32,
    /// Whether the mover is consumed by the impact.
    pub(crate) consumed: bool,
}

impl Entity {
    /// Materializes an entity from its full wire/persistence record.
    pub(crate) fn from_state(state: &EntityState) -> Self {
        Self {
            id: state.id,
            position: state.position,
            velocity: state.velocity,
            angle: state.angle,
            moving: state.moving,
            owner: state.owner,
            payload: state.payload.clone(),
        }
    }

    /// Kind tag of this entity.
    pub(crate) fn kind(&self) -> EntityKind {
        self.payload.kind()
    }

    /// Full-state record: the wire form, the persisted form, and the
    /// comparison tuple all at once. Loss-free with [`Entity::apply_state`].
    pub(crate) fn state(&self) -> EntityState {
        EntityState {
            id: self.id,
            position: self.position,
            velocity: self.velocity,
            angle: self.angle,
            moving: self.moving,
            owner: self.owner,
            payload: self.payload.clone(),
        }
    }

    /// Overwrites every gameplay field from the record. Idempotent: a second
    /// application of the same record changes nothing.
    ///
    /// The position is NOT written here; callers go through the registry so
    /// grid membership stays in step with the entity's box.
    pub(crate) fn apply_state_except_position(&mut self, state: &EntityState) {
        self.velocity = state.velocity;
        self.angle = state.angle;
        self.moving = state.moving;
        self.payload = state.payload.clone();
    }

    /// Fall predicate: whether gravity pulls at this kind at all. Support is
    /// probed separately by the registry.
    pub(crate) fn subject_to_gravity(&self) -> bool {
        match self.kind() {
            EntityKind::Player | EntityKind::Block => true,
            EntityKind::Projectile | EntityKind::Obstacle => false,
        }
    }

    /// Idle predicate: zero velocity and no fall condition.
    pub(crate) fn is_idle(&self, falling: bool) -> bool {
        self.velocity.is_zero() && !falling
    }

    /// Impact reaction for hitting an obstruction set at the given speed.
    pub(crate) fn impact_reaction(&self, speed: i32) -> ImpactReaction {
        match &self.payload {
            PayloadState::Player { .. } => ImpactReaction {
                damage_dealt: 0,
                self_damage: (speed - SAFE_IMPACT_SPEED).max(0),
                consumed: false,
            },
            PayloadState::Projectile { damage } => ImpactReaction {
                damage_dealt: *damage,
                self_damage: 0,
                consumed: true,
            },
            PayloadState::Block { .. } | PayloadState::Obstacle => ImpactReaction {
                damage_dealt: 0,
                self_damage: 0,
                consumed: false,
            },
        }
    }

    /// Applies damage, reporting whether the entity was destroyed by it.
    /// Obstacles ignore damage entirely; any damage consumes a projectile.
    pub(crate) fn apply_damage(&mut self, amount: i32) -> bool {
        if amount <= 0 {
            return false;
        }
        match &mut self.payload {
            PayloadState::Player { health, .. } => {
                *health -= amount;
                *health <= 0
            }
            PayloadState::Block { durability } => {
                *durability -= amount;
                *durability <= 0
            }
            PayloadState::Projectile { .. } => true,
            PayloadState::Obstacle => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player(id: u32) -> Entity {
        Entity::from_state(&EntityState {
            id: EntityId::new(id),
            position: Position::new(0, 0),
            velocity: Velocity::ZERO,
            angle: Angle::from_degrees(0),
            moving: false,
            owner: None,
            payload: PayloadState::Player {
                name: "tester".to_owned(),
                health: 100,
                score: 0,
            },
        })
    }

    #[test]
    fn state_application_is_idempotent() {
        let mut entity = player(4);
        let record = EntityState {
            id: EntityId::new(4),
            position: Position::new(0, 0),
            velocity: Velocity::clamped(5, -2),
            angle: Angle::from_degrees(45),
            moving: true,
            owner: None,
            payload: PayloadState::Player {
                name: "tester".to_owned(),
                health: 73,
                score: 12,
            },
        };

        entity.apply_state_except_position(&record);
        let first = entity.state();
        entity.apply_state_except_position(&record);
        assert_eq!(entity.state(), first);
    }

    #[test]
    fn state_round_trips_through_from_state() {
        let entity = player(7);
        assert_eq!(Entity::from_state(&entity.state()), entity);
    }

    #[test]
    fn gentle_landing_deals_no_player_damage() {
        let reaction = player(1).impact_reaction(SAFE_IMPACT_SPEED);
        assert_eq!(reaction.self_damage, 0);
        assert!(!reaction.consumed);
    }

    #[test]
    fn hard_landing_deals_excess_speed_as_damage() {
        let reaction = player(1).impact_reaction(SAFE_IMPACT_SPEED + 9);
        assert_eq!(reaction.self_damage, 9);
    }

    #[test]
    fn any_damage_consumes_a_projectile() {
        let mut projectile = Entity::from_state(&EntityState {
            id: EntityId::new(2),
            position: Position::new(0, 0),
            velocity: Velocity::ZERO,
            angle: Angle::from_degrees(0),
            moving: true,
            owner: Some(EntityId::new(1)),
            payload: PayloadState::Projectile { damage: 25 },
        });
        assert!(projectile.apply_damage(1));
    }

    #[test]
    fn obstacles_ignore_damage() {
        let mut obstacle = Entity::from_state(&EntityState {
            id: EntityId::new(3),
            position: Position::new(0, 0),
            velocity: Velocity::ZERO,
            angle: Angle::from_degrees(0),
            moving: false,
            owner: None,
            payload: PayloadState::Obstacle,
        });
        assert!(!obstacle.apply_damage(9999));
    }
}
