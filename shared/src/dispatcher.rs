//! Per-tick routing of queued messages to typed handlers.
//!
//! Handlers are bound to a source role and a message type. Each tick
//! [`MessageDispatcher::handle_messages`] walks the registrations in order
//! and, for every open connection with the registration's role, drains that
//! connection's messages of the registered type in arrival order.

use crate::connection::{ConnectionId, ConnectionRole, LogicalConnection};
use crate::connection_set::ConnectionSet;
use crate::protocol::{Message, MessageBody, MessageKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Where and when a dispatched message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub connection: ConnectionId,
    pub received_at: Instant,
    /// Local ticks since the sender produced the message's state. `None`
    /// for messages without a frame number or before the connection's
    /// frame offset is known.
    pub frames_ago: Option<u32>,
}

/// Disposes a registered handler
#[derive(Debug, Clone)]
pub struct HandlerHandle {
    disposed: Arc<AtomicBool>,
}

impl HandlerHandle {
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

type Handler<C> = Box<dyn FnMut(&mut C, &mut LogicalConnection, Message, DeliveryInfo)>;

struct Registration<C> {
    role: ConnectionRole,
    kind: MessageKind,
    one_at_a_time: bool,
    disposed: Arc<AtomicBool>,
    handler: Handler<C>,
}

impl<C> Registration<C> {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

/// Handler table over a game context `C`
pub struct MessageDispatcher<C> {
    registrations: Vec<Registration<C>>,
}

impl<C> Default for MessageDispatcher<C> {
    fn default() -> Self {
        Self {
            registrations: Vec::new(),
        }
    }
}

impl<C> MessageDispatcher<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles every queued `T` from connections whose peer has `role`
    pub fn on<T, F>(&mut self, role: ConnectionRole, handler: F) -> HandlerHandle
    where
        T: MessageBody + 'static,
        F: FnMut(&mut C, &mut LogicalConnection, T, DeliveryInfo) + 'static,
    {
        self.register(role, false, handler)
    }

    /// Like [`on`](Self::on), but handles at most one `T` per connection per
    /// tick; the rest stay queued
    pub fn on_one_at_a_time<T, F>(&mut self, role: ConnectionRole, handler: F) -> HandlerHandle
    where
        T: MessageBody + 'static,
        F: FnMut(&mut C, &mut LogicalConnection, T, DeliveryInfo) + 'static,
    {
        self.register(role, true, handler)
    }

    fn register<T, F>(&mut self, role: ConnectionRole, one_at_a_time: bool, mut handler: F) -> HandlerHandle
    where
        T: MessageBody + 'static,
        F: FnMut(&mut C, &mut LogicalConnection, T, DeliveryInfo) + 'static,
    {
        let disposed = Arc::new(AtomicBool::new(false));
        self.registrations.push(Registration {
            role,
            kind: T::KIND,
            one_at_a_time,
            disposed: Arc::clone(&disposed),
            handler: Box::new(move |context, connection, message, info| {
                if let Some(body) = T::from_message(message) {
                    handler(context, connection, body, info);
                }
            }),
        });
        HandlerHandle { disposed }
    }

    /// Registered, not yet removed handlers
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Dispatches queued messages to their handlers, returning how many
    /// were handled. Disposed handlers are removed first.
    pub fn handle_messages(&mut self, connections: &mut ConnectionSet, context: &mut C, local_frame: u32) -> usize {
        self.registrations.retain(|registration| !registration.is_disposed());

        let mut handled = 0;
        for registration in &mut self.registrations {
            for id in connections.ids_with_role(registration.role) {
                let Some(connection) = connections.get_mut(id) else {
                    continue;
                };

                while !connection.is_disposed() && !registration.is_disposed() {
                    let Some(inbound) = connection.try_dequeue_kind(registration.kind) else {
                        break;
                    };

                    let info = DeliveryInfo {
                        connection: id,
                        received_at: inbound.received_at,
                        frames_ago: inbound
                            .message
                            .frame()
                            .and_then(|frame| connection.frames_ago(frame, local_frame)),
                    };
                    (registration.handler)(context, connection, inbound.message, info);
                    handled += 1;

                    if registration.one_at_a_time {
                        break;
                    }
                }
            }
        }
        handled
    }
}
