//! Client-side copy of the replicated world

use log::{debug, info};
use shared::protocol::{ObjectCollision, ObjectCreation, ObjectDeletion, ObjectUpdate, SoundType};
use shared::{ApplyOutcome, ControlState, ObjectId, ReplicationEngine, SerializationScope, Ship, ShipRegistry};
use std::time::Duration;

/// Ships as last replicated by the server, plus the locally piloted one
#[derive(Debug)]
pub struct ClientWorld {
    pub ships: ShipRegistry,
    engine: ReplicationEngine,
    owner: Option<u8>,
    player: Option<ObjectId>,
    last_sound: Option<SoundType>,
    collisions: usize,
}

impl ClientWorld {
    pub fn new(frame_duration: Duration) -> Self {
        Self {
            ships: ShipRegistry::new(),
            engine: ReplicationEngine::new(frame_duration),
            owner: None,
            player: None,
            last_sound: None,
            collisions: 0,
        }
    }

    pub fn engine(&self) -> &ReplicationEngine {
        &self.engine
    }

    /// Records the client identifier and ship assigned by the server
    pub fn set_player(&mut self, owner: u8, ship: ObjectId) {
        self.owner = Some(owner);
        self.player = Some(ship);
    }

    /// The ship this client pilots, once the server has announced it
    pub fn player(&self) -> Option<ObjectId> {
        self.player.filter(|&id| self.ships.get(id).is_some())
    }

    pub fn player_ship(&self) -> Option<&Ship> {
        self.player().and_then(|id| self.ships.get(id))
    }

    /// Sets the piloted ship's controls, returning false if there is none yet
    pub fn set_controls(&mut self, controls: ControlState) -> bool {
        let Some(id) = self.player() else {
            return false;
        };
        match self.ships.get_mut(id) {
            Some(ship) => {
                ship.controls = controls;
                true
            }
            None => false,
        }
    }

    pub fn apply_creation(
        &mut self,
        creation: &ObjectCreation,
        frames_ago: Option<u32>,
        local_frame: u32,
    ) -> ApplyOutcome {
        let outcome = self
            .engine
            .apply_creation(&mut self.ships, creation, frames_ago, local_frame);

        // A respawned ship replaces the piloted one under the same owner
        if self.player.is_none() {
            let owned = self.owner.is_some_and(|owner| {
                self.ships
                    .get(creation.object_id)
                    .is_some_and(|ship| ship.owner == owner)
            });
            if owned {
                info!("Now piloting ship {}", creation.object_id);
                self.player = Some(creation.object_id);
            }
        }
        outcome
    }

    pub fn apply_update(
        &mut self,
        update: &ObjectUpdate,
        frames_ago: Option<u32>,
        local_frame: u32,
    ) -> ApplyOutcome {
        self.engine.apply_update(
            &mut self.ships,
            SerializationScope::VARYING_FROM_SERVER,
            update.object_id,
            &update.state,
            frames_ago,
            local_frame,
        )
    }

    pub fn apply_deletion(&mut self, deletion: &ObjectDeletion) -> bool {
        if self.player == Some(deletion.object_id) {
            info!("Piloted ship {} was destroyed", deletion.object_id);
            self.player = None;
        }
        self.last_sound = Some(deletion.sound);
        self.engine.apply_deletion(&mut self.ships, deletion.object_id)
    }

    pub fn record_collision(&mut self, collision: &ObjectCollision) {
        debug!(
            "Ships {} and {} collided ({:?})",
            collision.object1, collision.object2, collision.sound
        );
        self.collisions += 1;
        self.last_sound = Some(collision.sound);
    }

    pub fn collisions(&self) -> usize {
        self.collisions
    }

    pub fn last_sound(&self) -> Option<SoundType> {
        self.last_sound
    }

    /// Predicts every ship forward by `dt` seconds until the next update
    pub fn step(&mut self, dt: f32) {
        self.ships.step(dt);
    }
}
