//! Top-level coordinator: numbered channels over one session transport.
//!
//! Session datagrams are `[command][channel][payload]`. Subscribe and
//! unsubscribe mutate the addressed channel's subscriber list; element updates
//! are queued on the channel and only parsed on the next [`ScenarioSession::tick`].

use crate::channel::{Channel, ChannelHandle, NewRemoteCallback};
use crate::dispatch::{self, CommandDispatcher};
use crate::element::{ElementIdGenerator, ScenarioElement};
use crate::error::{SessionError, WireError};
use crate::registry::DeviceRegistry;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, trace};
use vsnet_env::{Clock, Transport};

/// Commands understood by the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionCommand {
    Subscribe = 0,
    Unsubscribe = 1,
    ElementUpdate = 2,
}

impl TryFrom<u8> for SessionCommand {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Subscribe),
            1 => Ok(Self::Unsubscribe),
            2 => Ok(Self::ElementUpdate),
            other => Err(WireError::UnknownCommand(other)),
        }
    }
}

/// Builds `[command][channel][payload]`.
pub fn build_session_package(command: SessionCommand, channel: u8, payload: &[u8]) -> Vec<u8> {
    let mut package = Vec::with_capacity(2 + payload.len());
    package.push(command as u8);
    package.push(channel);
    package.extend_from_slice(payload);
    package
}

/// Owns the device registry and the channel table of one process.
pub struct ScenarioSession {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    registry: Arc<DeviceRegistry>,
    ids: Arc<ElementIdGenerator>,
    channels: Mutex<BTreeMap<u8, Arc<dyn ChannelHandle>>>,
}

impl ScenarioSession {
    /// Creates the session on `transport` and registers it as the receiver.
    ///
    /// Shares the registry's clock, so header timestamps follow clock sync.
    pub fn new(transport: Arc<dyn Transport>, registry: Arc<DeviceRegistry>) -> Arc<Self> {
        let clock = Arc::clone(registry.clock());
        let ids = Arc::new(ElementIdGenerator::new(transport.local_addr()));
        let session = Arc::new(Self {
            transport,
            clock,
            registry,
            ids,
            channels: Mutex::new(BTreeMap::new()),
        });
        dispatch::attach(&session);
        info!(addr = %session.transport.local_addr(), "scenario session started");
        session
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Registers channel `id` carrying elements of type `T`.
    ///
    /// # Errors
    /// `SessionError::ChannelExists` if `id` is taken, whatever its type.
    pub fn add_channel<T: ScenarioElement>(
        &self,
        id: u8,
        on_new_remote: Option<NewRemoteCallback<T>>,
    ) -> Result<Arc<Channel<T>>, SessionError> {
        let mut channels = lock(&self.channels);
        if channels.contains_key(&id) {
            return Err(SessionError::ChannelExists(id));
        }
        let channel = Arc::new(Channel::new(
            id,
            Arc::clone(&self.transport),
            Arc::clone(&self.clock),
            Arc::clone(&self.ids),
            on_new_remote,
        ));
        let handle: Arc<dyn ChannelHandle> = channel.clone();
        channels.insert(id, handle);
        debug!(channel = id, element = std::any::type_name::<T>(), "channel added");
        Ok(channel)
    }

    /// The typed channel `id`, or `None` if it is unknown or carries another type.
    pub fn try_get_channel<T: ScenarioElement>(&self, id: u8) -> Option<Arc<Channel<T>>> {
        let handle = lock(&self.channels).get(&id).cloned()?;
        handle.as_any().downcast::<Channel<T>>().ok()
    }

    /// Removes and closes channel `id`. Returns false if it is unknown.
    pub fn remove_channel(&self, id: u8) -> bool {
        let removed = lock(&self.channels).remove(&id);
        match removed {
            Some(channel) => {
                channel.close();
                true
            }
            None => false,
        }
    }

    pub fn channel_ids(&self) -> Vec<u8> {
        lock(&self.channels).keys().copied().collect()
    }

    /// Host push on every channel, then remote pull on every channel.
    pub fn tick(&self) {
        let channels = self.snapshot();
        for channel in &channels {
            channel.push_host_updates();
        }
        for channel in &channels {
            channel.pull_remote_updates();
        }
    }

    /// Drops every replica owned by `origin` and its subscriptions, on all channels.
    pub fn purge_device(&self, origin: SocketAddr) -> usize {
        let mut removed = 0;
        for channel in self.snapshot() {
            removed += channel.destroy_remote_elements(origin);
            channel.unsubscribe_device(origin);
        }
        info!(%origin, removed, "device purged");
        removed
    }

    /// Closes every channel and stops the session transport.
    pub fn close(&self) {
        let channels: Vec<_> = std::mem::take(&mut *lock(&self.channels)).into_values().collect();
        for channel in channels {
            channel.close();
        }
        self.transport.shutdown();
    }

    fn snapshot(&self) -> Vec<Arc<dyn ChannelHandle>> {
        lock(&self.channels).values().cloned().collect()
    }
}

impl CommandDispatcher for ScenarioSession {
    fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn layer(&self) -> &'static str {
        "session"
    }

    fn execute_command(&self, origin: SocketAddr, command: u8, data: &[u8]) {
        let command = match SessionCommand::try_from(command) {
            Ok(command) => command,
            Err(e) => {
                debug!(%origin, error = %e, "session command ignored");
                return;
            }
        };
        let Some((&channel_id, payload)) = data.split_first() else {
            trace!(%origin, ?command, "session command without channel dropped");
            return;
        };
        let Some(channel) = lock(&self.channels).get(&channel_id).cloned() else {
            trace!(%origin, channel = channel_id, ?command, "unknown channel");
            return;
        };

        match command {
            SessionCommand::Subscribe => channel.subscribe_device(origin),
            SessionCommand::Unsubscribe => channel.unsubscribe_device(origin),
            SessionCommand::ElementUpdate => channel.enqueue_network(origin, payload),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
