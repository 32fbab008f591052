// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The interpreter's global execution lock.
//!
//! Acquisition hands out a [`GilToken`] that captures the lock state seen by
//! the acquiring thread; the token is handed back on release. Tokens are
//! move-only, so safe code cannot release the same acquisition twice.

use std::collections::HashMap;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};

/// Deepest nesting a lock supports. Every token depth below it survives
/// [`GilToken::into_raw`].
pub const MAX_REENTRANCY_DEPTH: u32 = (i32::MAX >> 1) as u32;

/// Lock state observed by a thread right before it acquired the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum GilState {
    /// The thread did not hold the lock; this acquisition is the outermost.
    Unlocked = 0,
    /// The thread already held the lock; this acquisition is nested.
    Locked = 1,
}

/// Receipt for one acquisition of the execution lock.
#[must_use = "every acquired GilToken must be handed back through put_gil"]
#[derive(Debug, PartialEq, Eq)]
pub struct GilToken {
    prior: GilState,
    depth: u32,
}

impl GilToken {
    pub fn new(prior: GilState, depth: u32) -> Self {
        Self { prior, depth }
    }

    pub fn prior(&self) -> GilState {
        self.prior
    }

    /// Number of acquisitions the thread already held when this one was made.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Encode for transport across the C ABI. Depths handed out by a lock
    /// stay below [`MAX_REENTRANCY_DEPTH`], so the result is never negative.
    pub fn into_raw(self) -> i32 {
        ((self.depth as i32) << 1) | self.prior as i32
    }

    /// Decode a value produced by [`GilToken::into_raw`].
    pub fn from_raw(raw: i32) -> Option<Self> {
        if raw < 0 {
            return None;
        }
        let prior = if raw & 1 == 1 {
            GilState::Locked
        } else {
            GilState::Unlocked
        };
        Some(Self {
            prior,
            depth: (raw >> 1) as u32,
        })
    }
}

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    depth: u32,
}

/// In-process reentrant execution lock with explicit tokens.
///
/// One thread at a time may hold it. The holder may acquire it again, and
/// nested acquisitions must be released in reverse order.
#[derive(Debug)]
pub struct ExecutionLock {
    state: Mutex<LockState>,
    released: Condvar,
    max_depth: u32,
    wait_warn: Duration,
}

impl ExecutionLock {
    pub fn new(max_depth: u32, wait_warn: Duration) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            released: Condvar::new(),
            max_depth: max_depth.clamp(1, MAX_REENTRANCY_DEPTH),
            wait_warn,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.max_reentrancy_depth, config.lock_wait_warn)
    }

    /// Block until the calling thread holds the lock.
    pub fn acquire(&self) -> BridgeResult<GilToken> {
        let me = thread::current().id();
        let mut state = self.state.lock();

        if state.owner == Some(me) {
            if state.depth >= self.max_depth {
                return Err(BridgeError::LockUnavailable {
                    reason: format!("reentrancy depth limit of {} reached", self.max_depth),
                });
            }
            let token = GilToken::new(GilState::Locked, state.depth);
            state.depth += 1;
            tracing::trace!(depth = state.depth, "execution lock re-entered");
            return Ok(token);
        }

        let started = Instant::now();
        let mut warned = false;
        while state.owner.is_some() {
            if warned {
                self.released.wait(&mut state);
                continue;
            }
            let result = self.released.wait_for(&mut state, self.wait_warn);
            if result.timed_out() && state.owner.is_some() {
                tracing::warn!(
                    waited_ms = started.elapsed().as_millis() as u64,
                    "still waiting for the interpreter execution lock"
                );
                warned = true;
            }
        }

        state.owner = Some(me);
        state.depth = 1;
        tracing::trace!(
            waited_us = started.elapsed().as_micros() as u64,
            "execution lock acquired"
        );
        Ok(GilToken::new(GilState::Unlocked, 0))
    }

    /// Release one acquisition. On error the lock state is left untouched.
    pub fn release(&self, token: GilToken) -> BridgeResult<()> {
        let me = thread::current().id();
        let mut state = self.state.lock();

        if state.owner != Some(me) {
            return Err(BridgeError::misuse(
                "released by a thread that does not hold the execution lock",
            ));
        }
        if token.depth + 1 != state.depth {
            return Err(BridgeError::misuse(format!(
                "out of order release: token depth {} while {} acquisitions are held",
                token.depth, state.depth
            )));
        }

        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            self.released.notify_one();
            tracing::trace!("execution lock released");
        }
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    /// Acquisitions held by the calling thread, 0 if it does not hold the lock.
    pub fn held_depth(&self) -> u32 {
        let state = self.state.lock();
        if state.owner == Some(thread::current().id()) {
            state.depth
        } else {
            0
        }
    }
}

impl Default for ExecutionLock {
    fn default() -> Self {
        Self::from_config(&BridgeConfig::default())
    }
}

/// Per-thread nesting bookkeeping for interpreters whose lock is owned by
/// the foreign runtime (CPython's GIL, a host supplied lock).
///
/// The foreign lock handles exclusion; this only stamps tokens with a depth
/// and rejects out of order releases.
#[derive(Debug)]
pub struct DepthTracker {
    depths: Mutex<HashMap<ThreadId, u32>>,
    max_depth: u32,
}

impl DepthTracker {
    pub fn new(max_depth: u32) -> Self {
        Self {
            depths: Mutex::new(HashMap::new()),
            max_depth: max_depth.clamp(1, MAX_REENTRANCY_DEPTH),
        }
    }

    /// Record an acquisition and return its depth.
    pub fn enter(&self) -> BridgeResult<u32> {
        let mut depths = self.depths.lock();
        let depth = depths.entry(thread::current().id()).or_insert(0);
        if *depth >= self.max_depth {
            return Err(BridgeError::LockUnavailable {
                reason: format!("reentrancy depth limit of {} reached", self.max_depth),
            });
        }
        *depth += 1;
        Ok(*depth - 1)
    }

    /// Undo [`DepthTracker::enter`] after a failed foreign acquisition.
    pub fn abandon(&self, depth: u32) {
        let _ = self.exit(depth);
    }

    /// Verify that `depth` is the innermost acquisition held by this thread,
    /// without recording anything.
    pub fn check(&self, depth: u32) -> BridgeResult<()> {
        let depths = self.depths.lock();
        Self::innermost(depths.get(&thread::current().id()).copied(), depth)
    }

    /// Record a release of the acquisition made at `depth`.
    pub fn exit(&self, depth: u32) -> BridgeResult<()> {
        let me = thread::current().id();
        let mut depths = self.depths.lock();
        Self::innermost(depths.get(&me).copied(), depth)?;
        if depth == 0 {
            depths.remove(&me);
        } else {
            depths.insert(me, depth);
        }
        Ok(())
    }

    fn innermost(held: Option<u32>, depth: u32) -> BridgeResult<()> {
        let Some(held) = held else {
            return Err(BridgeError::misuse(
                "released by a thread that does not hold the execution lock",
            ));
        };
        if depth + 1 != held {
            return Err(BridgeError::misuse(format!(
                "out of order release: token depth {depth} while {held} acquisitions are held"
            )));
        }
        Ok(())
    }

    pub fn held_depth(&self) -> u32 {
        self.depths
            .lock()
            .get(&thread::current().id())
            .copied()
            .unwrap_or(0)
    }
}
