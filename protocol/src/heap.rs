//! Frame-ordered buffering of relayed commands. A player that is behind an
//! opposing team's command holds it here until its own frame catches up.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use bytes::Bytes;

/// One relayed per-frame command, already rewritten to carry the
/// originator's conv. Cloning is cheap, the buffer is shared.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandBuffer {
    pub frame: u32,
    pub team: u8,
    pub buffer: Bytes,
}

/// Min-heap of pending commands keyed by frame. Ties on the frame are
/// broken arbitrarily.
pub struct CommandHeap {
    heap: BinaryHeap<Reverse<ByFrame>>,
}

impl CommandHeap {
    pub fn with_capacity(capacity: usize) -> Self {
        CommandHeap {
            heap: BinaryHeap::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn push(&mut self, buffer: CommandBuffer) {
        self.heap.push(Reverse(ByFrame(buffer)));
    }

    /// The command with the lowest frame, if any.
    pub fn peek(&self) -> Option<&CommandBuffer> {
        self.heap.peek().map(|entry| &entry.0.0)
    }

    pub fn pop(&mut self) -> Option<CommandBuffer> {
        self.heap.pop().map(|entry| entry.0.0)
    }
}

/// Orders solely by frame so the heap never compares payload bytes.
struct ByFrame(CommandBuffer);

impl PartialEq for ByFrame {
    fn eq(&self, other: &Self) -> bool {
        self.0.frame == other.0.frame
    }
}

impl Eq for ByFrame {}

impl PartialOrd for ByFrame {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ByFrame {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.frame.cmp(&other.0.frame)
    }
}
