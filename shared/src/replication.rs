//! Role-scoped object state replication.
//!
//! Every replicated object splits its fields into four scopes: constant or
//! varying, written by the server or by a client. The server announces each
//! object once per connection with its constant fields and then sends the
//! varying server fields every tick. A client sends only the varying client
//! fields of the object it controls.
//!
//! Inbound varying state carries the sender's frame number. The dispatcher
//! turns it into "frames ago" using the connection's frame offset, and the
//! engine drops updates produced before the state it already applied.

use crate::connection::{ConnectionId, ConnectionRole, LogicalConnection};
use crate::connection_set::ConnectionSet;
use crate::error::FieldError;
use crate::protocol::{ControlUpdate, ObjectCollision, ObjectCreation, ObjectDeletion, ObjectUpdate, SoundType};
use log::debug;
use std::collections::{HashMap, HashSet};
use std::ops::BitOr;
use std::time::Duration;

pub type ObjectId = u16;

/// Set of field groups taking part in one (de)serialization call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SerializationScope(u8);

impl SerializationScope {
    pub const NONE: Self = Self(0);
    pub const CONSTANT_FROM_SERVER: Self = Self(1);
    pub const VARYING_FROM_SERVER: Self = Self(2);
    pub const CONSTANT_FROM_CLIENT: Self = Self(4);
    pub const VARYING_FROM_CLIENT: Self = Self(8);

    /// True if every group in `other` is in `self`
    pub fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for SerializationScope {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Fixed-width little-endian field writer
#[derive(Debug, Default, Clone)]
pub struct StateWriter {
    bytes: Vec<u8>,
}

impl StateWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.bytes.push(u8::from(value));
    }

    pub fn write_u16(&mut self, value: u16) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i16(&mut self, value: i16) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Reader matching [`StateWriter`]
#[derive(Debug)]
pub struct StateReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> StateReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], FieldError> {
        let end = self.offset + N;
        let slice = self.bytes.get(self.offset..end).ok_or(FieldError::Truncated {
            field,
            offset: self.offset,
        })?;

        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        self.offset = end;
        Ok(out)
    }

    pub fn read_u8(&mut self, field: &'static str) -> Result<u8, FieldError> {
        Ok(self.take::<1>(field)?[0])
    }

    /// Any non-zero byte reads as true
    pub fn read_bool(&mut self, field: &'static str) -> Result<bool, FieldError> {
        Ok(self.read_u8(field)? != 0)
    }

    pub fn read_u16(&mut self, field: &'static str) -> Result<u16, FieldError> {
        Ok(u16::from_le_bytes(self.take(field)?))
    }

    pub fn read_i16(&mut self, field: &'static str) -> Result<i16, FieldError> {
        Ok(i16::from_le_bytes(self.take(field)?))
    }

    pub fn read_f32(&mut self, field: &'static str) -> Result<f32, FieldError> {
        Ok(f32::from_le_bytes(self.take(field)?))
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }
}

/// An object whose fields can be replicated by scope
pub trait Replicated {
    /// Type tag sent in creation messages
    fn kind(&self) -> u8;

    /// Appends the fields of every group in `scope`, in declaration order
    fn write_state(&self, scope: SerializationScope, writer: &mut StateWriter);

    /// Reads the fields of every group in `scope`. Out-of-range values are
    /// clamped or ignored; returns how many were.
    ///
    /// # Errors
    /// `FieldError` if the state ends early. The object is left untouched.
    fn read_state(
        &mut self,
        scope: SerializationScope,
        reader: &mut StateReader<'_>,
    ) -> Result<usize, FieldError>;

    /// Advances freshly applied state by `frames` ticks
    fn extrapolate(&mut self, _frames: u32, _frame_duration: Duration) {}
}

/// Simulation-side object lookup the engine replicates from and into
pub trait ObjectRegistry {
    type Object: Replicated;

    fn find(&self, id: ObjectId) -> Option<&Self::Object>;

    fn find_mut(&mut self, id: ObjectId) -> Option<&mut Self::Object>;

    fn is_alive(&self, id: ObjectId) -> bool {
        self.find(id).is_some()
    }

    /// Objects replicated to clients, in a stable order
    fn network_visible(&self) -> Vec<ObjectId>;

    /// Creates an object announced by the server; `None` for unknown kinds
    fn spawn(&mut self, id: ObjectId, kind: u8) -> Option<&mut Self::Object>;

    fn despawn(&mut self, id: ObjectId) -> bool;
}

pub fn serialize_state<O: Replicated + ?Sized>(object: &O, scope: SerializationScope) -> Vec<u8> {
    let mut writer = StateWriter::new();
    object.write_state(scope, &mut writer);
    writer.into_bytes()
}

/// Result of applying one inbound state message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// State applied; `clamped` fields were clamped or ignored
    Applied { clamped: usize },
    /// No such object locally
    UnknownObject,
    /// Older than state already applied
    Superseded,
    /// Frame offset to the sender is not known yet
    AwaitingClock,
    Malformed(FieldError),
}

/// Per-tick counts from [`ReplicationEngine::replicate_to_clients`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationStats {
    pub creations: usize,
    pub updates: usize,
}

#[derive(Debug)]
pub struct ReplicationEngine {
    frame_duration: Duration,
    announced: HashMap<ConnectionId, HashSet<ObjectId>>,
    last_applied: HashMap<ObjectId, i64>,
}

impl ReplicationEngine {
    pub fn new(frame_duration: Duration) -> Self {
        Self {
            frame_duration,
            announced: HashMap::new(),
            last_applied: HashMap::new(),
        }
    }

    /// Connections that receive replication: handshaken clients that have
    /// loaded the arena
    fn replication_targets(connections: &ConnectionSet) -> impl Iterator<Item = &LogicalConnection> {
        connections
            .with_role(ConnectionRole::Client)
            .filter(|connection| connection.is_handshaken() && connection.status().ready)
    }

    /// Server side. Announces unseen objects with their constant fields and
    /// sends varying server fields for the rest.
    pub fn replicate_to_clients<R: ObjectRegistry>(
        &mut self,
        registry: &R,
        connections: &ConnectionSet,
        frame: u32,
    ) -> ReplicationStats {
        let mut stats = ReplicationStats::default();
        let visible = registry.network_visible();

        for connection in Self::replication_targets(connections) {
            let announced = self.announced.entry(connection.id()).or_default();

            for &object_id in &visible {
                let Some(object) = registry.find(object_id) else {
                    continue;
                };

                if announced.insert(object_id) {
                    connection.send(ObjectCreation {
                        object_id,
                        kind: object.kind(),
                        frame,
                        constant: serialize_state(object, SerializationScope::CONSTANT_FROM_SERVER),
                        varying: serialize_state(object, SerializationScope::VARYING_FROM_SERVER),
                    });
                    stats.creations += 1;
                } else {
                    connection.send(ObjectUpdate {
                        object_id,
                        frame,
                        state: serialize_state(object, SerializationScope::VARYING_FROM_SERVER),
                    });
                    stats.updates += 1;
                }
            }
        }
        stats
    }

    /// Tells every connection that knows `object_id` about its deletion.
    /// Returns how many were told.
    pub fn announce_deletion(&mut self, connections: &ConnectionSet, object_id: ObjectId, sound: SoundType) -> usize {
        let mut told = 0;
        for connection in connections.with_role(ConnectionRole::Client) {
            let known = self
                .announced
                .get_mut(&connection.id())
                .is_some_and(|announced| announced.remove(&object_id));
            if known {
                connection.send(ObjectDeletion { object_id, sound });
                told += 1;
            }
        }
        self.forget_object(object_id);
        told
    }

    /// Sends a collision event to every connection that knows both objects
    pub fn announce_collision(&self, connections: &ConnectionSet, collision: &ObjectCollision) -> usize {
        let mut told = 0;
        for connection in Self::replication_targets(connections) {
            let knows_both = self.announced.get(&connection.id()).is_some_and(|announced| {
                announced.contains(&collision.object1) && announced.contains(&collision.object2)
            });
            if knows_both {
                connection.send(collision.clone());
                told += 1;
            }
        }
        told
    }

    pub fn is_announced(&self, connection: ConnectionId, object_id: ObjectId) -> bool {
        self.announced
            .get(&connection)
            .is_some_and(|announced| announced.contains(&object_id))
    }

    /// Drops per-connection bookkeeping, e.g. after the connection closed
    pub fn forget_connection(&mut self, connection: ConnectionId) {
        self.announced.remove(&connection);
    }

    /// Drops all bookkeeping for a deleted object
    pub fn forget_object(&mut self, object_id: ObjectId) {
        self.last_applied.remove(&object_id);
        for announced in self.announced.values_mut() {
            announced.remove(&object_id);
        }
    }

    /// Client side. Sends the varying client fields of the controlled object.
    pub fn replicate_control<O: Replicated + ?Sized>(
        &self,
        connection: &LogicalConnection,
        object_id: ObjectId,
        object: &O,
        frame: u32,
    ) {
        connection.send(ControlUpdate {
            object_id,
            frame,
            state: serialize_state(object, SerializationScope::VARYING_FROM_CLIENT),
        });
    }

    /// Client side. Spawns the announced object and applies its constant
    /// and varying server fields. Applied with zero extrapolation while the
    /// frame offset is unknown. A repeated creation of a live object is
    /// `Superseded` and leaves it untouched.
    pub fn apply_creation<R: ObjectRegistry>(
        &mut self,
        registry: &mut R,
        creation: &ObjectCreation,
        frames_ago: Option<u32>,
        local_frame: u32,
    ) -> ApplyOutcome {
        if registry.is_alive(creation.object_id) {
            debug!("Ignoring repeated creation of object {}", creation.object_id);
            return ApplyOutcome::Superseded;
        }
        let Some(object) = registry.spawn(creation.object_id, creation.kind) else {
            debug!(
                "Ignoring creation of object {} with unknown kind {}",
                creation.object_id, creation.kind
            );
            return ApplyOutcome::UnknownObject;
        };

        let constant = object.read_state(
            SerializationScope::CONSTANT_FROM_SERVER,
            &mut StateReader::new(&creation.constant),
        );
        let varying = object.read_state(
            SerializationScope::VARYING_FROM_SERVER,
            &mut StateReader::new(&creation.varying),
        );

        let frames_ago = frames_ago.unwrap_or(0);
        match (constant, varying) {
            (Ok(a), Ok(b)) => {
                object.extrapolate(frames_ago, self.frame_duration);
                self.last_applied.insert(
                    creation.object_id,
                    i64::from(local_frame) - i64::from(frames_ago),
                );
                ApplyOutcome::Applied { clamped: a + b }
            }
            (Err(e), _) | (_, Err(e)) => ApplyOutcome::Malformed(e),
        }
    }

    /// Applies one varying-state update for `object_id` in `scope`.
    ///
    /// Ignored while `frames_ago` is unknown, for unknown objects, and when
    /// the state was produced before the state last applied to the object.
    pub fn apply_update<R: ObjectRegistry>(
        &mut self,
        registry: &mut R,
        scope: SerializationScope,
        object_id: ObjectId,
        state: &[u8],
        frames_ago: Option<u32>,
        local_frame: u32,
    ) -> ApplyOutcome {
        let Some(frames_ago) = frames_ago else {
            return ApplyOutcome::AwaitingClock;
        };

        let produced = i64::from(local_frame) - i64::from(frames_ago);
        if self
            .last_applied
            .get(&object_id)
            .is_some_and(|&last| produced < last)
        {
            return ApplyOutcome::Superseded;
        }

        let Some(object) = registry.find_mut(object_id) else {
            return ApplyOutcome::UnknownObject;
        };

        match object.read_state(scope, &mut StateReader::new(state)) {
            Ok(clamped) => {
                // Control state is applied as sent
                if scope.contains(SerializationScope::VARYING_FROM_SERVER) {
                    object.extrapolate(frames_ago, self.frame_duration);
                }
                self.last_applied.insert(object_id, produced);
                ApplyOutcome::Applied { clamped }
            }
            Err(e) => ApplyOutcome::Malformed(e),
        }
    }

    /// Client side. Removes the object locally.
    pub fn apply_deletion<R: ObjectRegistry>(&mut self, registry: &mut R, object_id: ObjectId) -> bool {
        self.last_applied.remove(&object_id);
        registry.despawn(object_id)
    }

    /// Local frame the object's last applied state was produced at
    pub fn last_applied_frame(&self, object_id: ObjectId) -> Option<i64> {
        self.last_applied.get(&object_id).copied()
    }
}
