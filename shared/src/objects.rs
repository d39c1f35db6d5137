//! Ships: the replicated objects both peers simulate.
//!
//! The hull and owner are constant server fields. Position, velocity,
//! rotation and health are varying server fields, and the pilot's control
//! state is the single varying client field.

use crate::error::FieldError;
use crate::replication::{ObjectId, ObjectRegistry, Replicated, SerializationScope, StateReader, StateWriter};
use std::collections::BTreeMap;
use std::f32::consts::TAU;
use std::time::Duration;

pub const ARENA_WIDTH: f32 = 800.0;
pub const ARENA_HEIGHT: f32 = 600.0;
pub const SHIP_RADIUS: f32 = 16.0;
pub const SHIP_THRUST: f32 = 300.0;
pub const SHIP_TURN_RATE: f32 = 3.5;
pub const MAX_SHIP_SPEED: f32 = 400.0;
pub const MAX_HEALTH: u8 = 100;
pub const SHIP_KIND: u8 = 1;

/// Player input replicated from client to server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlState {
    pub thrust: bool,
    pub turn_left: bool,
    pub turn_right: bool,
    pub fire: bool,
}

impl ControlState {
    const THRUST: u8 = 1;
    const TURN_LEFT: u8 = 2;
    const TURN_RIGHT: u8 = 4;
    const FIRE: u8 = 8;
    const ALL: u8 = Self::THRUST | Self::TURN_LEFT | Self::TURN_RIGHT | Self::FIRE;

    pub fn to_bits(self) -> u8 {
        let mut bits = 0;
        if self.thrust {
            bits |= Self::THRUST;
        }
        if self.turn_left {
            bits |= Self::TURN_LEFT;
        }
        if self.turn_right {
            bits |= Self::TURN_RIGHT;
        }
        if self.fire {
            bits |= Self::FIRE;
        }
        bits
    }

    /// Unknown bits are ignored
    pub fn from_bits(bits: u8) -> Self {
        Self {
            thrust: bits & Self::THRUST != 0,
            turn_left: bits & Self::TURN_LEFT != 0,
            turn_right: bits & Self::TURN_RIGHT != 0,
            fire: bits & Self::FIRE != 0,
        }
    }

    /// Turn direction: -1 left, 1 right, 0 for neither or both
    pub fn turn(self) -> f32 {
        match (self.turn_left, self.turn_right) {
            (true, false) => -1.0,
            (false, true) => 1.0,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ship {
    pub hull: u8,
    pub owner: u8,
    pub x: f32,
    pub y: f32,
    pub vel_x: f32,
    pub vel_y: f32,
    pub rotation: f32,
    pub health: u8,
    pub controls: ControlState,
}

impl Default for Ship {
    fn default() -> Self {
        Self::new(0, 0, ARENA_WIDTH / 2.0, ARENA_HEIGHT / 2.0)
    }
}

impl Ship {
    pub fn new(hull: u8, owner: u8, x: f32, y: f32) -> Self {
        Self {
            hull,
            owner,
            x,
            y,
            vel_x: 0.0,
            vel_y: 0.0,
            rotation: 0.0,
            health: MAX_HEALTH,
            controls: ControlState::default(),
        }
    }

    pub fn speed(&self) -> f32 {
        (self.vel_x * self.vel_x + self.vel_y * self.vel_y).sqrt()
    }

    /// Applies controls and moves the ship by `dt` seconds
    pub fn step(&mut self, dt: f32) {
        self.rotation = (self.rotation + self.controls.turn() * SHIP_TURN_RATE * dt).rem_euclid(TAU);

        if self.controls.thrust {
            self.vel_x += self.rotation.cos() * SHIP_THRUST * dt;
            self.vel_y += self.rotation.sin() * SHIP_THRUST * dt;
        }
        self.limit_speed();
        self.drift(dt);
    }

    /// Moves by the current velocity, bouncing off the arena walls
    fn drift(&mut self, dt: f32) {
        self.x += self.vel_x * dt;
        self.y += self.vel_y * dt;

        if self.x < SHIP_RADIUS || self.x > ARENA_WIDTH - SHIP_RADIUS {
            self.vel_x = -self.vel_x;
        }
        if self.y < SHIP_RADIUS || self.y > ARENA_HEIGHT - SHIP_RADIUS {
            self.vel_y = -self.vel_y;
        }
        self.x = self.x.clamp(SHIP_RADIUS, ARENA_WIDTH - SHIP_RADIUS);
        self.y = self.y.clamp(SHIP_RADIUS, ARENA_HEIGHT - SHIP_RADIUS);
    }

    fn limit_speed(&mut self) -> bool {
        let speed = self.speed();
        if speed <= MAX_SHIP_SPEED {
            return false;
        }
        let scale = MAX_SHIP_SPEED / speed;
        self.vel_x *= scale;
        self.vel_y *= scale;
        true
    }
}

/// Keeps `value` if finite, counting an ignored field otherwise
fn finite_or(value: f32, current: f32, ignored: &mut usize) -> f32 {
    if value.is_finite() {
        value
    } else {
        *ignored += 1;
        current
    }
}

fn clamp_counted(value: f32, min: f32, max: f32, clamped: &mut usize) -> f32 {
    if value < min || value > max {
        *clamped += 1;
    }
    value.clamp(min, max)
}

impl Replicated for Ship {
    fn kind(&self) -> u8 {
        SHIP_KIND
    }

    fn write_state(&self, scope: SerializationScope, writer: &mut StateWriter) {
        if scope.contains(SerializationScope::CONSTANT_FROM_SERVER) {
            writer.write_u8(self.hull);
            writer.write_u8(self.owner);
        }
        if scope.contains(SerializationScope::VARYING_FROM_SERVER) {
            writer.write_f32(self.x);
            writer.write_f32(self.y);
            writer.write_f32(self.vel_x);
            writer.write_f32(self.vel_y);
            writer.write_f32(self.rotation);
            writer.write_u8(self.health);
        }
        if scope.contains(SerializationScope::VARYING_FROM_CLIENT) {
            writer.write_u8(self.controls.to_bits());
        }
    }

    fn read_state(
        &mut self,
        scope: SerializationScope,
        reader: &mut StateReader<'_>,
    ) -> Result<usize, FieldError> {
        let constant = if scope.contains(SerializationScope::CONSTANT_FROM_SERVER) {
            Some((reader.read_u8("hull")?, reader.read_u8("owner")?))
        } else {
            None
        };
        let varying = if scope.contains(SerializationScope::VARYING_FROM_SERVER) {
            Some((
                reader.read_f32("x")?,
                reader.read_f32("y")?,
                reader.read_f32("vel_x")?,
                reader.read_f32("vel_y")?,
                reader.read_f32("rotation")?,
                reader.read_u8("health")?,
            ))
        } else {
            None
        };
        let controls = if scope.contains(SerializationScope::VARYING_FROM_CLIENT) {
            Some(reader.read_u8("controls")?)
        } else {
            None
        };

        // Every field is read before any is applied, so a short state
        // leaves the ship untouched
        let mut fixed = 0;
        if let Some((hull, owner)) = constant {
            self.hull = hull;
            self.owner = owner;
        }
        if let Some((x, y, vel_x, vel_y, rotation, health)) = varying {
            let x = finite_or(x, self.x, &mut fixed);
            let y = finite_or(y, self.y, &mut fixed);
            self.x = clamp_counted(x, SHIP_RADIUS, ARENA_WIDTH - SHIP_RADIUS, &mut fixed);
            self.y = clamp_counted(y, SHIP_RADIUS, ARENA_HEIGHT - SHIP_RADIUS, &mut fixed);
            self.vel_x = finite_or(vel_x, self.vel_x, &mut fixed);
            self.vel_y = finite_or(vel_y, self.vel_y, &mut fixed);
            if self.limit_speed() {
                fixed += 1;
            }
            self.rotation = finite_or(rotation, self.rotation, &mut fixed).rem_euclid(TAU);
            if health > MAX_HEALTH {
                fixed += 1;
            }
            self.health = health.min(MAX_HEALTH);
        }
        if let Some(bits) = controls {
            if bits & !ControlState::ALL != 0 {
                fixed += 1;
            }
            self.controls = ControlState::from_bits(bits);
        }
        Ok(fixed)
    }

    fn extrapolate(&mut self, frames: u32, frame_duration: Duration) {
        if frames == 0 {
            return;
        }
        self.drift(frame_duration.as_secs_f32() * frames as f32);
    }
}

pub fn check_collision(a: &Ship, b: &Ship) -> bool {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    dx * dx + dy * dy < (2.0 * SHIP_RADIUS) * (2.0 * SHIP_RADIUS)
}

/// Pushes two overlapping ships apart and swaps their damped velocities
pub fn resolve_collision(a: &mut Ship, b: &mut Ship) {
    if !check_collision(a, b) {
        return;
    }

    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let distance = (dx * dx + dy * dy).sqrt();

    if distance < 0.001 {
        a.x -= SHIP_RADIUS;
        b.x += SHIP_RADIUS;
    } else {
        let nx = dx / distance;
        let ny = dy / distance;
        let separation = (2.0 * SHIP_RADIUS - distance) / 2.0;

        a.x -= nx * separation;
        a.y -= ny * separation;
        b.x += nx * separation;
        b.y += ny * separation;
    }

    a.x = a.x.clamp(SHIP_RADIUS, ARENA_WIDTH - SHIP_RADIUS);
    a.y = a.y.clamp(SHIP_RADIUS, ARENA_HEIGHT - SHIP_RADIUS);
    b.x = b.x.clamp(SHIP_RADIUS, ARENA_WIDTH - SHIP_RADIUS);
    b.y = b.y.clamp(SHIP_RADIUS, ARENA_HEIGHT - SHIP_RADIUS);

    let (vel_x, vel_y) = (a.vel_x, a.vel_y);
    a.vel_x = b.vel_x * 0.8;
    a.vel_y = b.vel_y * 0.8;
    b.vel_x = vel_x * 0.8;
    b.vel_y = vel_y * 0.8;
}

/// Ships keyed by object identifier
#[derive(Debug, Default, Clone)]
pub struct ShipRegistry {
    ships: BTreeMap<ObjectId, Ship>,
    next_id: ObjectId,
}

impl ShipRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a ship at the next spawn point and returns its identifier
    pub fn spawn_ship(&mut self, hull: u8, owner: u8) -> ObjectId {
        let mut id = self.next_id.max(1);
        while self.ships.contains_key(&id) {
            id = id.wrapping_add(1).max(1);
        }
        self.next_id = id.wrapping_add(1);

        let slot = f32::from(id % 8);
        let x = 100.0 + (slot * 90.0) % (ARENA_WIDTH - 200.0);
        let y = if id % 2 == 0 { 150.0 } else { ARENA_HEIGHT - 150.0 };
        self.ships.insert(id, Ship::new(hull, owner, x, y));
        id
    }

    pub fn get(&self, id: ObjectId) -> Option<&Ship> {
        self.ships.get(&id)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut Ship> {
        self.ships.get_mut(&id)
    }

    pub fn insert(&mut self, id: ObjectId, ship: Ship) {
        self.ships.insert(id, ship);
    }

    pub fn remove(&mut self, id: ObjectId) -> Option<Ship> {
        self.ships.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.ships.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ships.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &Ship)> {
        self.ships.iter().map(|(id, ship)| (*id, ship))
    }

    pub fn step(&mut self, dt: f32) {
        for ship in self.ships.values_mut() {
            ship.step(dt);
        }
    }

    /// Resolves every overlapping pair, returning the pairs that collided
    pub fn resolve_collisions(&mut self) -> Vec<(ObjectId, ObjectId)> {
        let ids: Vec<ObjectId> = self.ships.keys().copied().collect();
        let mut collided = Vec::new();

        for i in 0..ids.len() {
            for j in (i + 1)..ids.len() {
                let (id1, id2) = (ids[i], ids[j]);
                if let (Some(mut a), Some(mut b)) = (
                    self.ships.get(&id1).cloned(),
                    self.ships.get(&id2).cloned(),
                ) {
                    if !check_collision(&a, &b) {
                        continue;
                    }
                    resolve_collision(&mut a, &mut b);
                    self.ships.insert(id1, a);
                    self.ships.insert(id2, b);
                    collided.push((id1, id2));
                }
            }
        }
        collided
    }
}

impl ObjectRegistry for ShipRegistry {
    type Object = Ship;

    fn find(&self, id: ObjectId) -> Option<&Ship> {
        self.ships.get(&id)
    }

    fn find_mut(&mut self, id: ObjectId) -> Option<&mut Ship> {
        self.ships.get_mut(&id)
    }

    fn network_visible(&self) -> Vec<ObjectId> {
        self.ships.keys().copied().collect()
    }

    fn spawn(&mut self, id: ObjectId, kind: u8) -> Option<&mut Ship> {
        if kind != SHIP_KIND {
            return None;
        }
        Some(self.ships.entry(id).or_default())
    }

    fn despawn(&mut self, id: ObjectId) -> bool {
        self.ships.remove(&id).is_some()
    }
}
