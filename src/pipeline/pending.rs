//! Pending command table
//!
//! In-flight requests keyed by opaque. The reader resolves entries as
//! responses arrive (in any order); the supervisor sweeps expired and
//! abandoned entries on every tick and fails everything on disconnect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::completion::Resolvable;
use crate::error::{MemdError, Result};
use crate::protocol::{Opcode, Packet};

/// Response callback for one request
///
/// Invoked with every response carrying the request's opaque; returns `true`
/// once the request is complete. Streaming commands (stats) return `false`
/// until their terminator arrives. An `Err` is always final.
pub type ResponseHandler = Box<dyn FnMut(Result<Packet>) -> bool + Send>;

/// A request on its way to a pipeline
pub struct PipelineRequest {
    /// Frame to send; the pipeline assigns the opaque
    pub packet: Packet,

    /// Resolve with [`MemdError::Timeout`] once this passes
    pub deadline: Instant,

    pub handler: ResponseHandler,

    /// Completion state of the owning operation; resolved means abandoned
    pub state: Arc<dyn Resolvable>,
}

impl PipelineRequest {
    pub fn new(
        packet: Packet,
        deadline: Instant,
        state: Arc<dyn Resolvable>,
        handler: impl FnMut(Result<Packet>) -> bool + Send + 'static,
    ) -> Self {
        Self {
            packet,
            deadline,
            handler: Box::new(handler),
            state,
        }
    }

    pub(crate) fn is_abandoned(&self) -> bool {
        self.state.is_resolved()
    }

    /// Deliver a final error
    pub(crate) fn fail(mut self, error: MemdError) {
        (self.handler)(Err(error));
    }
}

impl std::fmt::Debug for PipelineRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRequest")
            .field("opcode", &self.packet.opcode)
            .field("opaque", &self.packet.opaque)
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// An in-flight record
struct PendingCommand {
    opcode: Opcode,
    deadline: Instant,
    handler: ResponseHandler,
    state: Arc<dyn Resolvable>,
}

/// Opaque → in-flight record
#[derive(Default)]
pub struct PendingTable {
    commands: Mutex<HashMap<u32, PendingCommand>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sent request under its opaque
    pub fn insert(&self, request: PipelineRequest) {
        let command = PendingCommand {
            opcode: request.packet.opcode,
            deadline: request.deadline,
            handler: request.handler,
            state: request.state,
        };
        self.commands.lock().insert(request.packet.opaque, command);
    }

    /// Deliver a response to its record
    ///
    /// The handler runs without the table lock held. Returns `false` for
    /// responses nobody is waiting for (late, cancelled or unknown).
    pub fn complete(&self, packet: Packet) -> bool {
        let opaque = packet.opaque;
        let Some(mut command) = self.commands.lock().remove(&opaque) else {
            tracing::trace!(
                "Dropping response for unknown opaque {} ({:?})",
                opaque,
                packet.opcode
            );
            return false;
        };

        if command.opcode != packet.opcode {
            tracing::warn!(
                "Response opcode {:?} does not match request {:?} (opaque {})",
                packet.opcode,
                command.opcode,
                opaque
            );
        }

        if command.state.is_resolved() {
            tracing::trace!("Dropping response for abandoned opaque {}", opaque);
            return false;
        }

        let done = (command.handler)(Ok(packet));
        if !done {
            self.commands.lock().insert(opaque, command);
        }
        true
    }

    /// Drop abandoned records and time out expired ones
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<PendingCommand> = {
            let mut commands = self.commands.lock();
            commands.retain(|_, c| !c.state.is_resolved());

            let keys: Vec<u32> = commands
                .iter()
                .filter(|(_, c)| c.deadline <= now)
                .map(|(&opaque, _)| opaque)
                .collect();
            keys.iter().filter_map(|k| commands.remove(k)).collect()
        };

        let count = expired.len();
        for mut command in expired {
            (command.handler)(Err(MemdError::Timeout));
        }
        count
    }

    /// Fail every record, e.g. because the connection dropped
    pub fn fail_all(&self, error: impl Fn() -> MemdError) -> usize {
        let drained: Vec<PendingCommand> = self.commands.lock().drain().map(|(_, c)| c).collect();
        let count = drained.len();
        for mut command in drained {
            if !command.state.is_resolved() {
                (command.handler)(Err(error()));
            }
        }
        count
    }

    pub fn len(&self) -> usize {
        self.commands.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.lock().is_empty()
    }
}
