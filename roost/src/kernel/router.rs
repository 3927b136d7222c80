//! Centralized syscall dispatch table.
//!
//! Each subsystem registers its handlers once at startup; the table is
//! never reconfigured afterwards. Handlers are synchronous and must not
//! block; blocking work goes through the async task manager.

use std::collections::HashMap;

use roost_protocol::{Frame, SyscallOp};

pub type Handler = Box<dyn Fn(&Frame) -> Frame + Send + Sync>;

#[derive(Default)]
pub struct SyscallRouter {
    handlers: HashMap<SyscallOp, Handler>,
}

impl SyscallRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, op: SyscallOp, handler: Handler) {
        self.handlers.insert(op, handler);
    }

    /// Dispatch a request. An unregistered opcode echoes the request back;
    /// clients treat the echo as an error.
    pub fn handle(&self, frame: &Frame) -> Frame {
        match self.handlers.get(&frame.opcode) {
            Some(handler) => handler(frame),
            None => {
                tracing::warn!(opcode = frame.opcode.name(), "unhandled opcode, echoing");
                frame.clone()
            }
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}
