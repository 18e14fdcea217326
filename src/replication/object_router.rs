use std::any::Any;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::messaging::message_types::MessageType;
use crate::replication::object::{ComponentId, Components, ObjectRole};
use crate::transport::connection_id::ConnectionId;

/// What a handler learns about the origin of an object message
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MessageMetadata {
    pub connection_id: ConnectionId,
    /// one-way latency of the sending connection, zero for local messages
    pub latency: Duration,
}

pub type ObjectMessageHandler = Box<dyn FnMut(&mut Components, &dyn Any, &MessageMetadata) -> anyhow::Result<()> + Send>;

struct HandlerRegistration {
    allowed_senders: ObjectRole,
    component: Option<ComponentId>,
    handler: ObjectMessageHandler,
}

/// Per-object dispatch of object messages to any number of handlers per message type
#[derive(Default)]
pub struct ObjectMessageRouter {
    handlers: FxHashMap<MessageType, Vec<HandlerRegistration>>,
}

impl ObjectMessageRouter {
    /// A handler belonging to a component is skipped while that component is disabled
    pub fn register_handler(&mut self, message_type: MessageType, component: Option<ComponentId>, allowed_senders: ObjectRole, handler: ObjectMessageHandler) {
        self.handlers.entry(message_type)
            .or_default()
            .push(HandlerRegistration {
                allowed_senders,
                component,
                handler,
            });
    }

    pub fn num_handlers(&self, message_type: MessageType) -> usize {
        self.handlers.get(&message_type)
            .map(|h| h.len())
            .unwrap_or_default()
    }

    /// Calls the handlers in registration order, stopping at the first error
    pub fn dispatch(&mut self, components: &mut Components, message_type: MessageType, message: &dyn Any, metadata: &MessageMetadata, sender_role: ObjectRole) -> anyhow::Result<()> {
        let Some(handlers) = self.handlers.get_mut(&message_type) else {
            return Ok(());
        };

        for registration in handlers {
            if !registration.allowed_senders.intersects(sender_role) {
                debug!(?message_type, ?sender_role, allowed = ?registration.allowed_senders, "sender is not allowed to send this message - skipping handler");
                continue;
            }
            if let Some(component) = registration.component {
                if !components.is_enabled(component) {
                    debug!(?message_type, ?component, "component is disabled - skipping handler");
                    continue;
                }
            }
            (registration.handler)(components, message, metadata)?;
        }
        Ok(())
    }
}
