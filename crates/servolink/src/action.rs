//! Building and sending datagram actions.
//!
//! An [`ActionBuilder`] accumulates one or more frames into a single
//! datagram. Frames are opened with a provisional size and back-patched on
//! send, so payloads can grow while being filled in.
//!
//! Sending comes in three flavors: non-blocking (never waits, may report
//! [`ActionResult::WouldBlock`] without resetting the builder so the caller
//! can retry), blocking (falls back to the session reactor and parks the
//! caller), and async (completion lands in a shared status cell).

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use servolink_wire::{ActionFlags, ActionId, FrameHeader, FRAME_HEADER_SIZE};

use crate::session::Session;

/// Outcome of an action send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionResult {
    /// The datagram left the socket.
    Complete,
    /// The socket buffer is full; the builder still holds the datagram.
    WouldBlock,
    /// The send failed or the session cannot send actions.
    Failed,
    /// An async send has been queued and not finished yet.
    InProgress,
}

/// Lock-free status cell for async sends.
pub struct ActionStatusCell(AtomicU8);

impl ActionStatusCell {
    pub fn new() -> Arc<ActionStatusCell> {
        Arc::new(ActionStatusCell(AtomicU8::new(ActionResult::Complete as u8)))
    }

    pub fn get(&self) -> ActionResult {
        match self.0.load(Ordering::Acquire) {
            x if x == ActionResult::Complete as u8 => ActionResult::Complete,
            x if x == ActionResult::WouldBlock as u8 => ActionResult::WouldBlock,
            x if x == ActionResult::InProgress as u8 => ActionResult::InProgress,
            _ => ActionResult::Failed,
        }
    }

    pub(crate) fn set(&self, result: ActionResult) {
        self.0.store(result as u8, Ordering::Release);
    }
}

/// Frame accumulator bound to one session.
pub struct ActionBuilder {
    session: Arc<Session>,
    buffer: Vec<u8>,
    cur_start: usize,
}

impl ActionBuilder {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            buffer: Vec::new(),
            cur_start: 0,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Drop everything accumulated so far.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.cur_start = 0;
    }

    fn open_frame(
        &mut self,
        action_id: ActionId,
        payload_size: usize,
        flags: ActionFlags,
    ) -> Option<usize> {
        let controller_id = self.session.controller_id();
        if controller_id == 0 {
            return None;
        }

        self.cur_start = self.buffer.len();
        self.buffer
            .resize(self.cur_start + FRAME_HEADER_SIZE + payload_size, 0);
        FrameHeader {
            controller_id,
            flags,
            action_id,
            size: (FRAME_HEADER_SIZE + payload_size) as u16,
        }
        .encode_into(&mut self.buffer[self.cur_start..]);
        Some(self.cur_start + FRAME_HEADER_SIZE)
    }

    /// Append a complete frame in one step.
    pub fn build(&mut self, action_id: ActionId, payload: &[u8], flags: ActionFlags) -> bool {
        match self.open_frame(action_id, payload.len(), flags) {
            Some(at) => {
                self.buffer[at..at + payload.len()].copy_from_slice(payload);
                true
            }
            None => false,
        }
    }

    /// Open a frame and return its zeroed payload area for in-place
    /// filling. Returns `None` while the session holds no controller id.
    pub fn start_frame(
        &mut self,
        action_id: ActionId,
        initial_payload_size: usize,
        flags: ActionFlags,
    ) -> Option<&mut [u8]> {
        let at = self.open_frame(action_id, initial_payload_size, flags)?;
        Some(&mut self.buffer[at..])
    }

    /// Grow or shrink the current frame's payload, returning the payload
    /// area again.
    pub fn resize_payload(&mut self, payload_size: usize) -> &mut [u8] {
        let at = self.cur_start + FRAME_HEADER_SIZE;
        self.buffer.resize(at + payload_size, 0);
        &mut self.buffer[at..]
    }

    /// Back-patch the current frame's size field.
    fn finalize(&mut self) {
        let size = (self.buffer.len() - self.cur_start) as u16;
        self.buffer[self.cur_start + 6..self.cur_start + 8].copy_from_slice(&size.to_le_bytes());
    }

    /// Send without waiting. On [`ActionResult::WouldBlock`] the builder is
    /// left intact for a retry or an escalation to a blocking/async send.
    pub fn send_non_blocking(&mut self) -> ActionResult {
        if self.buffer.is_empty() {
            self.reset();
            return ActionResult::Failed;
        }
        self.finalize();

        match self.session.try_send_action(&self.buffer) {
            ActionResult::Complete => {
                self.reset();
                ActionResult::Complete
            }
            ActionResult::WouldBlock => ActionResult::WouldBlock,
            other => {
                self.reset();
                other
            }
        }
    }

    /// Send, waiting for socket pressure to clear if necessary.
    pub fn send_blocking(&mut self) -> ActionResult {
        if self.buffer.is_empty() {
            self.reset();
            return ActionResult::Failed;
        }
        self.finalize();

        match self.session.try_send_action(&self.buffer) {
            ActionResult::Complete => {
                self.reset();
                ActionResult::Complete
            }
            ActionResult::WouldBlock => {
                let datagram = std::mem::take(&mut self.buffer);
                self.cur_start = 0;
                self.session.send_action_blocking(datagram)
            }
            other => {
                self.reset();
                other
            }
        }
    }

    /// Queue the datagram for the reactor; `status` moves from
    /// [`ActionResult::InProgress`] to the final outcome.
    pub fn send_async(&mut self, status: &Arc<ActionStatusCell>) {
        if self.buffer.is_empty() {
            self.reset();
            status.set(ActionResult::Failed);
            return;
        }
        self.finalize();

        status.set(ActionResult::InProgress);
        let datagram = std::mem::take(&mut self.buffer);
        self.cur_start = 0;
        self.session.send_action_async(datagram, Arc::clone(status));
    }
}
