//! Buffer slots and the ownership handoff protocol
//!
//! Every slot is always owned by exactly one endpoint. A slot moves only as
//! part of a dequeue-then-enqueue handoff, so the pool never needs a lock:
//! the driver queues serialize ownership for us.

use std::fmt;
use thiserror::Error;
use tracing::trace;

use super::device::DeviceEndpoint;
use crate::error::Result;

/// Endpoint currently holding a buffer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ownership {
    OnCapture,
    OnOutput,
}

impl Ownership {
    pub fn other(&self) -> Ownership {
        match self {
            Ownership::OnCapture => Ownership::OnOutput,
            Ownership::OnOutput => Ownership::OnCapture,
        }
    }
}

impl fmt::Display for Ownership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ownership::OnCapture => write!(f, "capture"),
            Ownership::OnOutput => write!(f, "output"),
        }
    }
}

/// Handoff rejected by the pool
#[derive(Error, Debug, PartialEq, Eq)]
pub enum OwnershipError {
    #[error("buffer index {index} out of range (pool of {count})")]
    UnknownIndex { index: u32, count: u32 },

    #[error("buffer {index} is owned by {actual}, not {expected}")]
    NotOwned {
        index: u32,
        expected: Ownership,
        actual: Ownership,
    },
}

/// One buffer slot
#[derive(Debug)]
pub struct Buffer<H> {
    index: u32,
    handle: H,
    owner: Ownership,
}

impl<H> Buffer<H> {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Memory handle exported by the exporter endpoint
    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn owner(&self) -> Ownership {
        self.owner
    }
}

/// Fixed arena of buffer slots shared by the two endpoints of a stream
#[derive(Debug)]
pub struct BufferPool<H> {
    slots: Vec<Buffer<H>>,
}

impl<H> BufferPool<H> {
    /// Build the pool from the exported handles and prime it by enqueuing
    /// every slot on the capture endpoint, in index order.
    pub fn prime<E>(handles: Vec<H>, capture: &mut E) -> Result<Self>
    where
        E: DeviceEndpoint<Handle = H>,
    {
        let mut slots = Vec::with_capacity(handles.len());
        for (index, handle) in handles.into_iter().enumerate() {
            let buffer = Buffer {
                index: index as u32,
                handle,
                owner: Ownership::OnCapture,
            };
            capture.enqueue(&buffer)?;
            slots.push(buffer);
        }
        trace!("Primed {} buffers on {}", slots.len(), capture.name());
        Ok(Self { slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<&Buffer<H>> {
        self.slots.get(index as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Buffer<H>> {
        self.slots.iter()
    }

    /// Number of slots currently held by `owner`
    pub fn count(&self, owner: Ownership) -> usize {
        self.slots.iter().filter(|b| b.owner == owner).count()
    }

    /// Move slot `index`, just dequeued from `from`, to the other endpoint.
    ///
    /// Returns the slot so the caller can enqueue it on the new owner.
    pub fn handoff(
        &mut self,
        index: u32,
        from: Ownership,
    ) -> std::result::Result<&Buffer<H>, OwnershipError> {
        let count = self.slots.len() as u32;
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or(OwnershipError::UnknownIndex { index, count })?;
        if slot.owner != from {
            return Err(OwnershipError::NotOwned {
                index,
                expected: from,
                actual: slot.owner,
            });
        }
        slot.owner = from.other();
        Ok(slot)
    }
}
