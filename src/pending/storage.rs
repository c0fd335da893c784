//! Backing storage for the batching strategies.
//!
//! Every accumulator terminates each fragment with [`DELIMITER`] in the same
//! step that appends the fragment.

use std::mem;

pub const DELIMITER: &str = ";\n";

/// A flushed block of commands, ready for the execution handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Batch {
    Text(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    Appended,
    /// Fits an empty accumulator, not the current one.
    Full,
    /// Larger than the accumulator could ever hold.
    Oversized,
}

pub trait Accumulator: Send {
    fn push(&mut self, fragment: &str) -> Push;

    /// Empties the accumulator. `None` when there was nothing to send.
    fn take(&mut self) -> Option<Batch>;

    fn is_empty(&self) -> bool;

    /// Encoding of a fragment sent on its own, bypassing the accumulator.
    fn standalone(fragment: &str) -> Batch
    where
        Self: Sized,
    {
        Batch::Text(format!("{fragment}{DELIMITER}"))
    }
}

fn fits(used: usize, needed: usize, capacity: usize) -> Push {
    if needed > capacity {
        Push::Oversized
    } else if used + needed > capacity {
        Push::Full
    } else {
        Push::Appended
    }
}

/// Unbounded list of fragments, joined when taken.
#[derive(Debug, Default)]
pub struct JoinedAccumulator {
    fragments: Vec<String>,
}

impl Accumulator for JoinedAccumulator {
    fn push(&mut self, fragment: &str) -> Push {
        self.fragments.push(fragment.to_string());
        Push::Appended
    }

    fn take(&mut self) -> Option<Batch> {
        if self.fragments.is_empty() {
            return None;
        }
        let mut joined = self.fragments.join(DELIMITER);
        joined.push_str(DELIMITER);
        self.fragments.clear();
        Some(Batch::Text(joined))
    }

    fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}

/// Text accumulator capped at `capacity` bytes of UTF-8.
#[derive(Debug)]
pub struct TextAccumulator {
    text: String,
    capacity: usize,
}

impl TextAccumulator {
    pub fn new(capacity: usize) -> Self {
        Self {
            text: String::with_capacity(capacity),
            capacity,
        }
    }
}

impl Accumulator for TextAccumulator {
    fn push(&mut self, fragment: &str) -> Push {
        let outcome = fits(self.text.len(), fragment.len() + DELIMITER.len(), self.capacity);
        if outcome == Push::Appended {
            self.text.push_str(fragment);
            self.text.push_str(DELIMITER);
        }
        outcome
    }

    fn take(&mut self) -> Option<Batch> {
        if self.text.is_empty() {
            return None;
        }
        let text = mem::replace(&mut self.text, String::with_capacity(self.capacity));
        Some(Batch::Text(text))
    }

    fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Fixed character buffer; capacity counts characters, not bytes.
#[derive(Debug)]
pub struct CharAccumulator {
    chars: Vec<char>,
    capacity: usize,
}

impl CharAccumulator {
    pub fn new(capacity: usize) -> Self {
        Self {
            chars: Vec::with_capacity(capacity),
            capacity,
        }
    }
}

impl Accumulator for CharAccumulator {
    fn push(&mut self, fragment: &str) -> Push {
        let needed = fragment.chars().count() + DELIMITER.chars().count();
        let outcome = fits(self.chars.len(), needed, self.capacity);
        if outcome == Push::Appended {
            self.chars.extend(fragment.chars());
            self.chars.extend(DELIMITER.chars());
        }
        outcome
    }

    fn take(&mut self) -> Option<Batch> {
        if self.chars.is_empty() {
            return None;
        }
        let text: String = self.chars.iter().collect();
        self.chars.clear();
        Some(Batch::Text(text))
    }

    fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }
}

/// Fixed UTF-8 byte buffer handed to the engine as-is.
#[derive(Debug)]
pub struct ByteAccumulator {
    bytes: Vec<u8>,
    capacity: usize,
}

impl ByteAccumulator {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            capacity,
        }
    }
}

impl Accumulator for ByteAccumulator {
    fn push(&mut self, fragment: &str) -> Push {
        let outcome = fits(self.bytes.len(), fragment.len() + DELIMITER.len(), self.capacity);
        if outcome == Push::Appended {
            self.bytes.extend_from_slice(fragment.as_bytes());
            self.bytes.extend_from_slice(DELIMITER.as_bytes());
        }
        outcome
    }

    fn take(&mut self) -> Option<Batch> {
        if self.bytes.is_empty() {
            return None;
        }
        let bytes = mem::replace(&mut self.bytes, Vec::with_capacity(self.capacity));
        Some(Batch::Bytes(bytes))
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn standalone(fragment: &str) -> Batch {
        let mut bytes = Vec::with_capacity(fragment.len() + DELIMITER.len());
        bytes.extend_from_slice(fragment.as_bytes());
        bytes.extend_from_slice(DELIMITER.as_bytes());
        Batch::Bytes(bytes)
    }
}

/// Holds nothing: every fragment goes straight to the engine.
#[derive(Debug, Default)]
pub struct ImmediateAccumulator;

impl Accumulator for ImmediateAccumulator {
    fn push(&mut self, _fragment: &str) -> Push {
        Push::Oversized
    }

    fn take(&mut self) -> Option<Batch> {
        None
    }

    fn is_empty(&self) -> bool {
        true
    }
}
