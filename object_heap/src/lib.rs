// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Typed handle heaps backing every API-visible object of the video driver.
//!
//! A [`Handle`] packs three fields into 32 bits:
//!
//! ```text
//!  31      24 23      16 15                 0
//! +----------+----------+--------------------+
//! |   kind   |   gen    |     slot index     |
//! +----------+----------+--------------------+
//! ```
//!
//! The kind byte makes handles of different object types disjoint. The generation byte is bumped
//! whenever a slot is freed, so a handle kept across a free/allocate cycle no longer resolves.

use std::fmt;

use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

pub use crate::heap::ObjectHeap;

mod heap;

const KIND_SHIFT: u32 = 24;
const GENERATION_SHIFT: u32 = 16;
const GENERATION_MASK: u32 = 0x00ff_0000;
const INDEX_MASK: u32 = 0x0000_ffff;

/// Upper bound on the number of slots in a single heap.
pub const MAX_OBJECTS: usize = (INDEX_MASK as usize) + 1;

/// The kinds of objects handed out to API clients.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(enumn::N)]
#[repr(u8)]
pub enum ObjectKind {
    Config = 1,
    Context = 2,
    Surface = 3,
    Buffer = 4,
    Image = 5,
    Subpicture = 6,
}

impl ObjectKind {
    /// The value OR'ed into every handle of this kind.
    pub const fn id_offset(self) -> u32 {
        (self as u32) << KIND_SHIFT
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::ObjectKind::*;

        let name = match self {
            Config => "config",
            Context => "context",
            Surface => "surface",
            Buffer => "buffer",
            Image => "image",
            Subpicture => "subpicture",
        };
        write!(f, "{}", name)
    }
}

/// An opaque object id as seen by API clients.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle(u32);

impl Handle {
    fn new(kind: ObjectKind, generation: u8, index: usize) -> Handle {
        Handle(kind.id_offset() | ((generation as u32) << GENERATION_SHIFT) | (index as u32))
    }

    /// Reinterprets a raw id received from a client.
    pub const fn from_raw(raw: u32) -> Handle {
        Handle(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// The kind encoded in the top byte, if it names a known kind.
    pub fn kind(self) -> Option<ObjectKind> {
        ObjectKind::n((self.0 >> KIND_SHIFT) as u8)
    }

    pub fn index(self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }

    pub fn generation(self) -> u8 {
        ((self.0 & GENERATION_MASK) >> GENERATION_SHIFT) as u8
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Handle({:#010x})", self.0)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[sorted]
#[derive(Error, Debug, Eq, PartialEq)]
pub enum Error {
    #[error("handle {0} is already suspended")]
    AlreadySuspended(Handle),
    #[error("{0} heap is full")]
    HeapFull(ObjectKind),
    #[error("heap capacity must be between 1 and {max}, got {requested}")]
    InvalidCapacity { requested: usize, max: usize },
    #[error("handle {0} does not name a live object")]
    InvalidHandle(Handle),
    #[error("handle {0} is not suspended")]
    NotSuspended(Handle),
    #[error("handle {handle} does not belong to the {expected} heap")]
    WrongKind { handle: Handle, expected: ObjectKind },
}

pub type Result<T> = std::result::Result<T, Error>;
