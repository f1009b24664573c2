//! Per-device debounce buffers.
//!
//! Each device that has a debounce period gets one buffer, created on first use and reused
//! for every later debounce cycle. A buffer accumulates converted fragments until its quiet
//! period elapses without a new fragment arriving; the timer then posts a [`FlushRequest`]
//! back to the engine, which publishes whatever is pending at that moment.
//!
//! Every reschedule bumps the buffer's generation, so a request posted by a sleeper that was
//! already superseded (or flushed early) is recognised as stale and ignored.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::sync::mpsc;

use crate::device::{Device, IeeeAddr};
use crate::payload::{self, Payload};
use crate::state::StateCache;
use crate::timer::DelayedAction;

/// Posted by a buffer's timer when its quiet period has elapsed.
#[derive(Debug, Clone)]
pub struct FlushRequest {
    pub device: Arc<Device>,
    pub generation: u64,
}

/// `true` when `new` would overwrite an ignore-listed field of `pending` with a different
/// value.
///
/// Only keys already pending are inspected: an ignore-listed key that `new` introduces for
/// the first time has nothing to conflict with.
pub fn conflicted(new: &Payload, pending: &Payload, ignore: &[String]) -> bool {
    pending
        .iter()
        .filter(|(key, _)| ignore.iter().any(|ignored| ignored == *key))
        .any(|(key, old)| new.get(key).is_some_and(|value| value != old))
}

#[derive(Debug, Default)]
struct DebounceBuffer {
    pending: Payload,
    timer: Option<DelayedAction>,
    generation: u64,
}

impl DebounceBuffer {
    /// Settles the outstanding schedule, if any, and hands back what was pending.
    fn flush_now(&mut self) -> Option<Payload> {
        // Dropping the timer aborts a sleeper that has not fired yet.
        self.timer.take()?;
        Some(std::mem::take(&mut self.pending)).filter(|pending| !pending.is_empty())
    }
}

#[derive(Debug, Default)]
pub struct Debouncers {
    buffers: HashMap<IeeeAddr, DebounceBuffer>,
}

impl Debouncers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, addr: &IeeeAddr) -> bool {
        self.buffers.contains_key(addr)
    }

    pub fn pending(&self, addr: &IeeeAddr) -> Option<&Payload> {
        self.buffers.get(addr).map(|buffer| &buffer.pending)
    }

    pub fn is_scheduled(&self, addr: &IeeeAddr) -> bool {
        self.buffers
            .get(addr)
            .is_some_and(|buffer| buffer.timer.is_some())
    }

    /// Creates the buffer for `addr` if needed and, when `fragment` conflicts with it, flushes
    /// it early. The returned payload must be published before `fragment` is merged.
    pub fn flush_if_conflicted(
        &mut self,
        addr: IeeeAddr,
        fragment: &Payload,
        ignore: &[String],
    ) -> Option<Payload> {
        let buffer = self.buffers.entry(addr).or_default();
        if !conflicted(fragment, &buffer.pending, ignore) {
            return None;
        }
        debug!("Debounced payload of {} conflicts with new fragment, flushing", addr);
        buffer.flush_now()
    }

    /// Merges `fragment` into the pending payload, mirrors the result into `state` and
    /// restarts the quiet period.
    pub fn merge_and_schedule(
        &mut self,
        device: &Arc<Device>,
        fragment: Payload,
        quiet_period: Duration,
        state: &StateCache,
        requests: &mpsc::UnboundedSender<FlushRequest>,
    ) {
        let addr = device.ieee_addr();
        let buffer = self.buffers.entry(addr).or_default();
        payload::merge(&mut buffer.pending, fragment);

        // Readers of the cache must see the pending values while nothing is published yet.
        state.set(&addr, &buffer.pending);

        buffer.generation = buffer.generation.wrapping_add(1);
        let request = FlushRequest {
            device: device.clone(),
            generation: buffer.generation,
        };
        let requests = requests.clone();
        buffer.timer = Some(DelayedAction::schedule(quiet_period, move || {
            if let Err(err) = requests.send(request) {
                debug!(
                    "Engine gone, dropping debounce flush for '{}'",
                    err.0.device.friendly_name
                );
            }
        }));
    }

    /// Resolves a timer's request. `None` when the request is stale or nothing is pending.
    pub fn take_expired(&mut self, request: &FlushRequest) -> Option<Payload> {
        let buffer = self.buffers.get_mut(&request.device.ieee_addr())?;
        if buffer.generation != request.generation {
            return None;
        }
        buffer.flush_now()
    }

    /// Removes `keys` from the pending payload of `addr`. Returns whether a buffer exists.
    pub fn prune<'a, I>(&mut self, addr: &IeeeAddr, keys: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        let Some(buffer) = self.buffers.get_mut(addr) else {
            return false;
        };
        for key in keys {
            buffer.pending.remove(key);
        }
        true
    }
}
