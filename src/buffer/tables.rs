//! State kept by the start server on behalf of every client: named locks,
//! notification waiters and the file registry.

use std::collections::{HashMap, VecDeque};

use crate::comm::Rank;
use crate::error::{DsmError, DsmResult};
use crate::protocol::FileDescription;

/// Channel a request arrived on, and so the channel a reply must take
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// The local group
    Local,
    /// The merged peer channel
    Remote,
}

impl Route {
    pub(crate) fn code(self) -> u64 {
        match self {
            Route::Local => 1,
            Route::Remote => 2,
        }
    }

    pub(crate) fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Route::Local),
            2 => Some(Route::Remote),
            _ => None,
        }
    }
}

/// A client identified by its channel and rank on that channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Requester {
    pub route: Route,
    pub rank: Rank,
}

#[derive(Debug)]
struct LockEntry {
    holder: Requester,
    /// Acquisitions by the holder not yet released
    depth: u32,
    waiters: VecDeque<Requester>,
}

/// FIFO named locks
///
/// The holder may acquire again; each acquisition needs its own release
/// before the lock moves on.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: HashMap<String, LockEntry>,
}

/// Result of a lock release
#[derive(Debug, PartialEq, Eq)]
pub enum Release {
    /// Nobody was waiting, the lock is free
    Freed,
    /// One nesting level undone, the releaser still holds the lock
    StillHeld,
    /// Ownership passed to this waiter, which must now be granted
    HandedTo(Requester),
    /// The releaser did not hold the lock
    NotHolder,
}

impl LockTable {
    /// Returns true when `who` holds the lock on return
    pub fn acquire(&mut self, name: &str, who: Requester) -> bool {
        match self.locks.get_mut(name) {
            None => {
                self.locks.insert(
                    name.to_string(),
                    LockEntry {
                        holder: who,
                        depth: 1,
                        waiters: VecDeque::new(),
                    },
                );
                true
            }
            Some(entry) if entry.holder == who => {
                entry.depth += 1;
                true
            }
            Some(entry) => {
                entry.waiters.push_back(who);
                false
            }
        }
    }

    pub fn release(&mut self, name: &str, who: Requester) -> Release {
        let Some(entry) = self.locks.get_mut(name) else {
            return Release::NotHolder;
        };
        if entry.holder != who {
            return Release::NotHolder;
        }
        if entry.depth > 1 {
            entry.depth -= 1;
            return Release::StillHeld;
        }
        match entry.waiters.pop_front() {
            Some(next) => {
                entry.holder = next;
                entry.depth = 1;
                Release::HandedTo(next)
            }
            None => {
                self.locks.remove(name);
                Release::Freed
            }
        }
    }

    pub fn holder(&self, name: &str) -> Option<Requester> {
        self.locks.get(name).map(|e| e.holder)
    }

    pub fn waiting(&self, name: &str) -> usize {
        self.locks.get(name).map_or(0, |e| e.waiters.len())
    }
}

/// Waiters registered per notification name
#[derive(Debug, Default)]
pub struct NotifyTable {
    waiters: HashMap<String, Vec<Requester>>,
}

impl NotifyTable {
    pub fn wait(&mut self, name: &str, who: Requester) {
        self.waiters.entry(name.to_string()).or_default().push(who);
    }

    /// Remove and return every waiter on `name`
    pub fn release(&mut self, name: &str) -> Vec<Requester> {
        self.waiters.remove(name).unwrap_or_default()
    }
}

/// Named regions of the address space
#[derive(Debug)]
pub struct FileRegistry {
    files: HashMap<String, FileDescription>,
    block_length: u64,
    total_length: u64,
    /// Pages handed out so far (paged layouts)
    pages_assigned: u64,
    /// First unallocated address (contiguous layouts)
    next_address: u64,
}

impl FileRegistry {
    pub fn new(total_length: u64, block_length: u64) -> Self {
        Self {
            files: HashMap::new(),
            block_length,
            total_length,
            pages_assigned: 0,
            next_address: 0,
        }
    }

    /// Store a description produced elsewhere, replacing any previous one
    pub fn register(&mut self, desc: FileDescription) {
        tracing::debug!(
            "Registered file '{}' [{}, {}) with {} pages",
            desc.name,
            desc.start,
            desc.end,
            desc.pages.len()
        );
        self.files.insert(desc.name.clone(), desc);
    }

    pub fn lookup(&self, name: &str) -> Option<&FileDescription> {
        self.files.get(name)
    }

    /// Grow `name` by `size` bytes, creating it when unknown
    ///
    /// Paged layouts append fresh page indices, rounding the request up to
    /// whole pages. Contiguous layouts carve the next unallocated range; an
    /// existing contiguous file only grows while it is the last allocation.
    pub fn request_pages(&mut self, name: &str, size: u64) -> DsmResult<FileDescription> {
        if self.block_length > 0 {
            self.request_paged(name, size)
        } else {
            self.request_contiguous(name, size)
        }
    }

    fn request_paged(&mut self, name: &str, size: u64) -> DsmResult<FileDescription> {
        let needed = size.div_ceil(self.block_length);
        let total_pages = self.total_length / self.block_length;
        if self.pages_assigned + needed > total_pages {
            return Err(DsmError::NoSpace(format!(
                "'{}' needs {} pages, {} of {} are free",
                name,
                needed,
                total_pages - self.pages_assigned,
                total_pages
            )));
        }

        let first = self.pages_assigned as u32;
        self.pages_assigned += needed;
        let block = self.block_length;
        let desc = self
            .files
            .entry(name.to_string())
            .or_insert_with(|| FileDescription {
                name: name.to_string(),
                start: 0,
                end: 0,
                length: 0,
                pages: Vec::new(),
            });
        desc.pages.extend(first..first + needed as u32);
        desc.length += size;
        desc.end = desc.start + desc.pages.len() as u64 * block;
        Ok(desc.clone())
    }

    fn request_contiguous(&mut self, name: &str, size: u64) -> DsmResult<FileDescription> {
        let free = self.total_length - self.next_address;
        if size > free {
            return Err(DsmError::NoSpace(format!(
                "'{}' needs {} bytes, {} are free",
                name, size, free
            )));
        }

        let next = self.next_address;
        match self.files.get_mut(name) {
            Some(desc) if desc.end == next => {
                desc.end += size;
                desc.length += size;
                self.next_address = desc.end;
                Ok(desc.clone())
            }
            Some(desc) => Err(DsmError::NoSpace(format!(
                "'{}' cannot grow in place past {}",
                desc.name, desc.end
            ))),
            None => {
                let desc = FileDescription::contiguous(name, next, size);
                self.next_address = desc.end;
                self.files.insert(name.to_string(), desc.clone());
                Ok(desc)
            }
        }
    }
}
