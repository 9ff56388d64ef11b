//! # Bounded Request FIFO
//!
//! Fixed-capacity circular queue used for the free-request pool and for
//! staging outbound requests. An empty queue has no pop position at all;
//! a full queue is one whose push position has caught up with a valid pop
//! position. No internal locking: the owning driver serializes access.

use core::fmt;

/// FIFO failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoError {
    /// No room for another item
    Full,
    /// Nothing to pop
    Empty,
}

impl fmt::Display for FifoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FifoError::Full => write!(f, "FIFO full"),
            FifoError::Empty => write!(f, "FIFO empty"),
        }
    }
}

/// Fixed-capacity ring of request references.
#[derive(Debug)]
pub struct RequestFifo<T> {
    items: Vec<Option<T>>,
    push_index: usize,
    /// `None` while the queue is empty
    pop_index: Option<usize>,
    count: usize,
    max_count: usize,
}

impl<T: Copy> RequestFifo<T> {
    /// Creates an empty FIFO holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: vec![None; capacity],
            push_index: 0,
            pop_index: None,
            count: 0,
            max_count: 0,
        }
    }

    /// Empties the queue and forgets its high-water mark.
    pub fn reset(&mut self) {
        self.items.iter_mut().for_each(|item| *item = None);
        self.push_index = 0;
        self.pop_index = None;
        self.count = 0;
        self.max_count = 0;
    }

    /// Appends an item.
    pub fn push(&mut self, item: T) -> Result<(), FifoError> {
        if self.items.is_empty() || self.pop_index == Some(self.push_index) {
            return Err(FifoError::Full);
        }

        self.items[self.push_index] = Some(item);

        if self.pop_index.is_none() {
            self.pop_index = Some(self.push_index);
        }

        self.count += 1;
        self.push_index = (self.push_index + 1) % self.items.len();
        self.max_count = self.max_count.max(self.count);
        Ok(())
    }

    /// Removes the oldest item.
    pub fn pop(&mut self) -> Result<T, FifoError> {
        let pop_index = self.pop_index.ok_or(FifoError::Empty)?;
        let item = self.items[pop_index].take().ok_or(FifoError::Empty)?;
        self.count -= 1;

        self.pop_index = if self.count == 0 {
            None
        } else {
            Some((pop_index + 1) % self.items.len())
        };

        Ok(item)
    }

    /// Items currently queued.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Highest count ever observed since the last reset.
    pub fn max_count(&self) -> usize {
        self.max_count
    }

    pub fn capacity(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pop_index.is_none()
    }
}
