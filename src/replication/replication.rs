//! Announcing objects to peers and tearing them down again: the messages that travel between the
//!  side that creates objects and the sides that mirror them.

use anyhow::bail;
use bytes::BytesMut;
use tracing::{debug, info};

use crate::messaging::basic_messages::{CreateObject, DeleteObject, ReplicatePreExistingObject};
use crate::messaging::message_sender::{MessageSender, MessageSenderExt};
use crate::replication::object::{ObjectId, ReplicatedObject};
use crate::replication::replicator::Replicator;
use crate::replication::store::ReplicatedObjectStore;
use crate::transport::connection_id::ConnectionId;

/// Announces an object to one peer, with the role the peer has relative to the object. New
///  objects carry their initial state along so the peer can construct them in one step.
pub fn replicate(out: &mut dyn MessageSender, receiver: ConnectionId, object: &ReplicatedObject) -> anyhow::Result<()> {
    let role = object.role_of(receiver);
    debug!(?receiver, ?role, object_id = ?object.id, "replicating object");

    if object.is_pre_existing {
        return out.send_message(receiver, ReplicatePreExistingObject {
            global_object_id: object.global_object_id,
            object_id: object.id,
            role,
        });
    }

    let Some(object_type) = object.object_type else {
        bail!("cannot replicate {:?}: it has neither an object type nor a global id", object.id);
    };
    let mut additional_data = BytesMut::new();
    object.instance.serialize_initial_state(&mut additional_data)?;
    out.send_message(receiver, CreateObject {
        object_type,
        object_id: object.id,
        role,
        additional_data: additional_data.freeze(),
    })
}

pub fn replicate_to(out: &mut dyn MessageSender, receivers: &[ConnectionId], object: &ReplicatedObject) -> anyhow::Result<()> {
    for receiver in receivers {
        replicate(out, *receiver, object)?;
    }
    Ok(())
}

/// Brings a newly connected peer up to date with every object in the store
pub fn replicate_everything(out: &mut dyn MessageSender, receiver: ConnectionId, store: &ReplicatedObjectStore) -> anyhow::Result<()> {
    for object_id in store.object_ids() {
        replicate(out, receiver, store.find(*object_id)?)?;
    }
    Ok(())
}

pub fn delete_object(out: &mut dyn MessageSender, connection_id: ConnectionId, object_id: ObjectId) -> anyhow::Result<()> {
    out.send_message(connection_id, DeleteObject { object_id })
}

fn objects_of(store: &ReplicatedObjectStore, connection_id: ConnectionId) -> Vec<ObjectId> {
    store.object_ids().iter()
        .filter_map(|id| store.get(*id))
        .filter(|o| o.owner_connection_id == connection_id || o.authority_connection_id == connection_id)
        .map(|o| o.id)
        .collect()
}

/// Removes everything a departed peer owned or had authority over, and tells the remaining peers
///  to do the same
pub fn remove_player(out: &mut dyn MessageSender, connection_id: ConnectionId, others: &[ConnectionId], replicator: &mut Replicator) -> anyhow::Result<()> {
    for object_id in objects_of(replicator.store(), connection_id) {
        let Some(authority) = replicator.store().get(object_id).map(|o| o.authority_connection_id) else {
            continue;
        };
        // objects the departed peer was the authority of are removed on its behalf
        let removed_by = if authority == connection_id { connection_id } else { ConnectionId::NO_CONNECTION };
        if replicator.remove_on_behalf_of(removed_by, object_id).is_none() {
            continue;
        }
        for other in others {
            delete_object(out, *other, object_id)?;
        }
    }
    Ok(())
}

/// Removes the objects a connection owned or had authority over, e.g. after the host went away
pub fn remove_all(store: &mut ReplicatedObjectStore, connection_id: ConnectionId) {
    for object_id in objects_of(store, connection_id) {
        store.remove_replicated_instance(connection_id, object_id);
    }
}

/// Constructs the local mirror of an object a peer announced, applies the initial state that came
///  along and marks it live
pub fn create_from_message(store: &mut ReplicatedObjectStore, connection_id: ConnectionId, message: &CreateObject) -> anyhow::Result<()> {
    info!(?connection_id, object_id = ?message.object_id, object_type = ?message.object_type, role = ?message.role, "creating replicated object");
    let authority = store.add_replicated_instance(message.object_type, message.role, message.object_id, connection_id)?
        .authority_connection_id;
    if let Err(e) = store.dispatch_messages(connection_id, message.object_id, &message.additional_data) {
        store.remove_replicated_instance(authority, message.object_id);
        return Err(e);
    }
    store.find_mut(message.object_id)?.is_active = true;
    Ok(())
}

pub fn replicate_pre_existing_from_message(store: &mut ReplicatedObjectStore, connection_id: ConnectionId, message: &ReplicatePreExistingObject) -> anyhow::Result<()> {
    info!(?connection_id, object_id = ?message.object_id, global_id = ?message.global_object_id, "replicating pre-existing object");
    let object = store.replicate_pre_existing(message.role, connection_id, message.object_id, message.global_object_id)?;
    object.is_active = true;
    Ok(())
}
