//! Authoritative ship simulation

use log::info;
use shared::objects::{MAX_SHIP_SPEED, SHIP_RADIUS};
use shared::protocol::{ObjectCollision, SoundType};
use shared::{ObjectId, ShipRegistry};

/// Health lost by each ship in a collision
pub const COLLISION_DAMAGE: u8 = 10;
/// Closing speed above which a collision sounds heavy
pub const HEAVY_IMPACT_SPEED: f32 = 150.0;

/// A ship destroyed this step and the ship that replaced it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Respawn {
    pub destroyed: ObjectId,
    pub replacement: ObjectId,
}

/// Everything a step produced that clients must hear about
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StepEvents {
    pub collisions: Vec<ObjectCollision>,
    pub respawns: Vec<Respawn>,
}

#[derive(Debug, Default)]
pub struct ServerWorld {
    pub ships: ShipRegistry,
}

impl ServerWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn_player(&mut self, owner: u8) -> ObjectId {
        let hull = owner % 4;
        let id = self.ships.spawn_ship(hull, owner);
        if let Some(ship) = self.ships.get(id) {
            info!("Spawned ship {} for client #{} at ({}, {})", id, owner, ship.x, ship.y);
        }
        id
    }

    /// Hands an existing ship to a new owner. False if it no longer exists.
    pub fn claim_ship(&mut self, id: ObjectId, owner: u8) -> bool {
        match self.ships.get_mut(id) {
            Some(ship) => {
                ship.owner = owner;
                true
            }
            None => false,
        }
    }

    pub fn remove_ship(&mut self, id: ObjectId) -> bool {
        let removed = self.ships.remove(id).is_some();
        if removed {
            info!("Removed ship {}", id);
        }
        removed
    }

    /// Advances the simulation by `dt` seconds in as many substeps as
    /// needed to keep ships from tunnelling through each other
    pub fn step(&mut self, dt: f32) -> StepEvents {
        let substeps = calculate_required_substeps(dt);
        let substep_dt = dt / substeps as f32;
        let mut events = StepEvents::default();

        for _ in 0..substeps {
            self.ships.step(substep_dt);
            for (id1, id2) in self.ships.resolve_collisions() {
                events.collisions.push(self.damage_pair(id1, id2));
            }
        }

        let destroyed: Vec<ObjectId> = self
            .ships
            .iter()
            .filter(|(_, ship)| ship.health == 0)
            .map(|(id, _)| id)
            .collect();
        for id in destroyed {
            if let Some(ship) = self.ships.remove(id) {
                let replacement = self.ships.spawn_ship(ship.hull, ship.owner);
                info!("Ship {} destroyed, respawned as {}", id, replacement);
                events.respawns.push(Respawn {
                    destroyed: id,
                    replacement,
                });
            }
        }
        events
    }

    fn damage_pair(&mut self, id1: ObjectId, id2: ObjectId) -> ObjectCollision {
        let mut closing_speed = 0.0;
        for id in [id1, id2] {
            if let Some(ship) = self.ships.get_mut(id) {
                closing_speed += ship.speed();
                ship.health = ship.health.saturating_sub(COLLISION_DAMAGE);
            }
        }

        let sound = if closing_speed > HEAVY_IMPACT_SPEED {
            SoundType::Heavy
        } else {
            SoundType::Light
        };
        ObjectCollision::new(id1, id2, 0, 0, sound)
    }

    pub fn ship_count(&self) -> usize {
        self.ships.len()
    }
}

/// Calculates physics substeps required to prevent collision tunneling
pub fn calculate_required_substeps(dt: f32) -> u32 {
    const SAFETY_FACTOR: f32 = 0.5;

    let max_movement_per_step = SHIP_RADIUS * SAFETY_FACTOR;
    let max_movement_this_tick = MAX_SHIP_SPEED * dt;

    if max_movement_this_tick > max_movement_per_step {
        (max_movement_this_tick / max_movement_per_step).ceil() as u32
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use shared::objects::MAX_HEALTH;

    #[test]
    fn test_substep_calculation() {
        // 400 * 1/60 = 6.7 units, under half a radius
        assert_eq!(calculate_required_substeps(1.0 / 60.0), 1);
        assert_eq!(calculate_required_substeps(1.0 / 1000.0), 1);
        // 400 * 0.1 = 40 units over 8 unit steps
        assert_eq!(calculate_required_substeps(0.1), 5);
        assert!(calculate_required_substeps(1.0) > 1);
    }

    #[test]
    fn test_spawn_and_claim() {
        let mut world = ServerWorld::new();
        let id = world.spawn_player(3);
        assert_eq!(world.ship_count(), 1);
        assert_eq!(world.ships.get(id).unwrap().owner, 3);

        assert!(world.claim_ship(id, 5));
        assert_eq!(world.ships.get(id).unwrap().owner, 5);
        assert!(world.remove_ship(id));
        assert!(!world.claim_ship(id, 5));
        assert!(!world.remove_ship(id));
    }

    #[test]
    fn test_collision_produces_event_and_damage() {
        let mut world = ServerWorld::new();
        let a = world.spawn_player(1);
        let b = world.spawn_player(2);
        let (x, y) = {
            let ship = world.ships.get(a).unwrap();
            (ship.x, ship.y)
        };
        let ship = world.ships.get_mut(b).unwrap();
        ship.x = x + 10.0;
        ship.y = y;

        let events = world.step(1.0 / 60.0);

        assert_eq!(events.collisions.len(), 1);
        assert_eq!(events.collisions[0].object1, a);
        assert_eq!(events.collisions[0].object2, b);
        assert_eq!(events.collisions[0].sound, SoundType::Light);
        assert_eq!(world.ships.get(a).unwrap().health, MAX_HEALTH - COLLISION_DAMAGE);
        assert!(events.respawns.is_empty());

        let gap = world.ships.get(b).unwrap().x - world.ships.get(a).unwrap().x;
        assert_approx_eq!(gap, 2.0 * SHIP_RADIUS, 0.01);
    }

    #[test]
    fn test_destroyed_ship_respawns() {
        let mut world = ServerWorld::new();
        let a = world.spawn_player(1);
        let b = world.spawn_player(2);
        let (x, y) = {
            let ship = world.ships.get(a).unwrap();
            (ship.x, ship.y)
        };
        world.ships.get_mut(a).unwrap().health = COLLISION_DAMAGE;
        let ship = world.ships.get_mut(b).unwrap();
        ship.x = x + 10.0;
        ship.y = y;

        let events = world.step(1.0 / 60.0);

        assert_eq!(events.respawns.len(), 1);
        let respawn = events.respawns[0];
        assert_eq!(respawn.destroyed, a);
        assert!(world.ships.get(a).is_none());

        let replacement = world.ships.get(respawn.replacement).unwrap();
        assert_eq!(replacement.owner, 1);
        assert_eq!(replacement.health, MAX_HEALTH);
        assert_eq!(world.ship_count(), 2);
    }
}
