//! The central blocks/doesn't-block strategy.
//!
//! All cross-type collision permissions live in this one symmetric function
//! so the symmetry invariant stays auditable in a single place, instead of
//! being scattered across per-kind dispatch.

use blockfall_core::EntityKind;

use crate::entity::Entity;

/// Reports whether the two entities pass through each other.
///
/// The function is total over every kind pair and order-independent:
/// `permits(a, b) == permits(b, a)` for all inputs (asserted by the
/// consistency check). Rules, from most to least specific:
///
/// - an ownerless projectile is an ephemeron and blocks nothing;
/// - a projectile passes its firer;
/// - two projectiles sharing the same owner pass each other;
/// - every other pair collides (blocks, obstacles, and players are solid).
pub(crate) fn permits(a: &Entity, b: &Entity) -> bool {
    passes(a, b) || passes(b, a)
}

fn passes(subject: &Entity, other: &Entity) -> bool {
    if subject.kind() != EntityKind::Projectile {
        return false;
    }
    match subject.owner {
        None => true,
        Some(owner) => {
            owner == other.id
                || (other.kind() == EntityKind::Projectile && other.owner == Some(owner))
        }
    }
}
