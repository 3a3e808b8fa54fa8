//! Single-byte command multiplexing on top of a [`Transport`].
//!
//! Every payload is `[command][data...]`. A protocol layer implements
//! [`CommandDispatcher::execute_command`] and is bound to its transport with
//! [`attach`]; the transport's receive thread then calls
//! [`CommandDispatcher::dispatch`] for every datagram.

use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, trace};
use vsnet_env::{EnvError, Transport};

/// Prepends `command` to `data`.
pub fn build_command_package(command: u8, data: &[u8]) -> Vec<u8> {
    let mut package = Vec::with_capacity(1 + data.len());
    package.push(command);
    package.extend_from_slice(data);
    package
}

/// A protocol layer bound to its own transport.
pub trait CommandDispatcher: Send + Sync + 'static {
    /// Transport this layer sends and receives on.
    fn transport(&self) -> &Arc<dyn Transport>;

    /// Short name used in log fields.
    fn layer(&self) -> &'static str;

    /// Handles one command. `data` excludes the command byte.
    fn execute_command(&self, origin: SocketAddr, command: u8, data: &[u8]);

    /// Splits the command byte off `bytes` and runs the handler.
    ///
    /// A panicking handler is logged and swallowed so the receive loop survives.
    fn dispatch(&self, origin: SocketAddr, bytes: &[u8]) {
        let Some((&command, data)) = bytes.split_first() else {
            trace!(layer = self.layer(), %origin, "empty datagram dropped");
            return;
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.execute_command(origin, command, data)
        }));
        if outcome.is_err() {
            error!(layer = self.layer(), %origin, command, "command handler panicked");
        }
    }

    /// Sends `[command][data]` to `target`.
    fn send_command(&self, target: SocketAddr, command: u8, data: &[u8]) -> Result<(), EnvError> {
        self.transport()
            .send(target, build_command_package(command, data))
    }

    /// Dispatches everything waiting in the transport's inbound queue.
    ///
    /// Only useful when no receive callback is registered.
    fn drain_inbound(&self) -> usize {
        let mut handled = 0;
        while let Some(datagram) = self.transport().try_recv() {
            self.dispatch(datagram.origin, &datagram.payload);
            handled += 1;
        }
        handled
    }
}

/// Registers `handler` as the receive callback of its transport.
///
/// The callback holds a weak reference, so dropping the last strong handle
/// to the layer stops dispatch without tearing the transport down.
pub fn attach<H: CommandDispatcher>(handler: &Arc<H>) {
    let weak = Arc::downgrade(handler);
    handler
        .transport()
        .set_receiver(Arc::new(move |origin, bytes: &[u8]| {
            if let Some(handler) = weak.upgrade() {
                handler.dispatch(origin, bytes);
            }
        }));
}
