use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dmsg_core::PORTER_MIN_EPHEMERAL;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::PortError;

/// One reserved port: an optional primary value plus values for sub-ports.
///
/// A slot whose primary value was released stays alive while it still has
/// children, so the port cannot be handed out again until the last child is
/// gone.
struct PortSlot<V> {
    generation: u64,
    value: Option<V>,
    children: HashMap<u16, (u64, V)>,
}

struct PorterState<V> {
    slots: BTreeMap<u16, PortSlot<V>>,
    min_ephemeral: u16,
    next_ephemeral: u16,
    generation: u64,
}

impl<V> PorterState<V> {
    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    fn insert(&mut self, port: u16, value: V) -> u64 {
        let generation = self.next_generation();
        self.slots.insert(
            port,
            PortSlot {
                generation,
                value: Some(value),
                children: HashMap::new(),
            },
        );
        generation
    }

    /// Generations keep a stale handle (one outliving `close_all`) from
    /// freeing a newer reservation of the same port.
    ///
    /// The removed value is handed back so the caller can drop it after
    /// unlocking: values may themselves own reservations.
    fn release(&mut self, port: u16, child: Option<u16>, generation: u64) -> Option<V> {
        let slot = self.slots.get_mut(&port)?;
        let removed = match child {
            Some(sub) if slot.children.get(&sub).is_some_and(|(g, _)| *g == generation) => {
                slot.children.remove(&sub).map(|(_, v)| v)
            }
            None if slot.generation == generation => slot.value.take(),
            _ => return None,
        };
        if slot.value.is_none() && slot.children.is_empty() {
            self.slots.remove(&port);
        }
        removed
    }
}

/// Registry of local ports for one entity.
///
/// Port 0 is reserved at construction and can never be handed out.
pub struct Porter<V> {
    state: Arc<Mutex<PorterState<V>>>,
}

impl<V> Clone for Porter<V> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<V: Clone> Default for Porter<V> {
    fn default() -> Self {
        Self::new(PORTER_MIN_EPHEMERAL)
    }
}

impl<V: Clone> Porter<V> {
    pub fn new(min_ephemeral: u16) -> Self {
        let min_ephemeral = min_ephemeral.max(1);
        let mut slots = BTreeMap::new();
        slots.insert(0, Self::reserved_zero());
        Self {
            state: Arc::new(Mutex::new(PorterState {
                slots,
                min_ephemeral,
                next_ephemeral: min_ephemeral - 1,
                generation: 0,
            })),
        }
    }

    fn reserved_zero() -> PortSlot<V> {
        PortSlot {
            generation: 0,
            value: None,
            children: HashMap::new(),
        }
    }

    fn reservation(&self, port: u16, child: Option<u16>, generation: u64) -> PortReservation<V> {
        PortReservation {
            state: Arc::downgrade(&self.state),
            port,
            child,
            generation,
            released: AtomicBool::new(false),
        }
    }

    /// Reserve `port`. Fails if the port is taken.
    pub fn reserve(&self, port: u16, value: V) -> Result<PortReservation<V>, PortError> {
        let mut state = self.state.lock();
        if state.slots.contains_key(&port) {
            return Err(PortError::Occupied(port));
        }
        let generation = state.insert(port, value);
        Ok(self.reservation(port, None, generation))
    }

    /// Reserve the next free port at or above the ephemeral minimum,
    /// wrapping around. `value` is built from the chosen port.
    pub fn reserve_ephemeral(
        &self,
        cancel: &CancellationToken,
        value: impl FnOnce(u16) -> V,
    ) -> Result<(u16, PortReservation<V>), PortError> {
        let mut state = self.state.lock();
        let span = u32::from(u16::MAX - state.min_ephemeral) + 1;

        for _ in 0..span {
            state.next_ephemeral = match state.next_ephemeral.checked_add(1) {
                Some(port) if port >= state.min_ephemeral => port,
                _ => state.min_ephemeral,
            };
            let port = state.next_ephemeral;
            if !state.slots.contains_key(&port) {
                let generation = state.insert(port, value(port));
                return Ok((port, self.reservation(port, None, generation)));
            }
            if cancel.is_cancelled() {
                return Err(PortError::Cancelled);
            }
        }
        Err(PortError::Exhausted)
    }

    /// Reserve `sub` under an already reserved `port`. Port 0 never has
    /// children.
    pub fn reserve_child(
        &self,
        port: u16,
        sub: u16,
        value: V,
    ) -> Result<PortReservation<V>, PortError> {
        if port == 0 {
            return Err(PortError::NoParent(0));
        }
        let mut state = self.state.lock();
        let generation = state.next_generation();
        let slot = state.slots.get_mut(&port).ok_or(PortError::NoParent(port))?;
        if slot.children.contains_key(&sub) {
            return Err(PortError::ChildOccupied(port, sub));
        }
        slot.children.insert(sub, (generation, value));
        Ok(self.reservation(port, Some(sub), generation))
    }

    /// Primary value of `port`, if any.
    pub fn port_value(&self, port: u16) -> Option<V> {
        self.state
            .lock()
            .slots
            .get(&port)
            .and_then(|slot| slot.value.clone())
    }

    /// Value reserved for `sub` under `port`.
    pub fn child_value(&self, port: u16, sub: u16) -> Option<V> {
        self.state
            .lock()
            .slots
            .get(&port)
            .and_then(|slot| slot.children.get(&sub).map(|(_, v)| v.clone()))
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.state.lock().slots.contains_key(&port)
    }

    /// Snapshot of every reserved port as `(port, value, children)`.
    pub fn range(&self) -> Vec<(u16, Option<V>, Vec<(u16, V)>)> {
        self.state
            .lock()
            .slots
            .iter()
            .map(|(port, slot)| {
                let mut children: Vec<(u16, V)> = slot
                    .children
                    .iter()
                    .map(|(k, (_, v))| (*k, v.clone()))
                    .collect();
                children.sort_by_key(|(k, _)| *k);
                (*port, slot.value.clone(), children)
            })
            .collect()
    }

    /// Every primary and child value, for teardown.
    pub fn values(&self) -> Vec<V> {
        let state = self.state.lock();
        let mut out = Vec::new();
        for slot in state.slots.values() {
            out.extend(slot.value.iter().cloned());
            out.extend(slot.children.values().map(|(_, v)| v.clone()));
        }
        out
    }

    /// Clear the registry and return every value it held. Outstanding
    /// reservations become no-ops.
    pub fn close_all(&self) -> Vec<V> {
        let slots = {
            let mut state = self.state.lock();
            let mut slots = std::mem::take(&mut state.slots);
            if let Some(zero) = slots.remove(&0) {
                state.slots.insert(0, zero);
            }
            slots
        };
        let mut values = Vec::new();
        for slot in slots.into_values() {
            values.extend(slot.value);
            values.extend(slot.children.into_values().map(|(_, v)| v));
        }
        values
    }
}

/// Handle to a reserved port or sub-port.
///
/// Released explicitly with [`PortReservation::release`] or on drop; only
/// the first release has any effect.
pub struct PortReservation<V> {
    state: Weak<Mutex<PorterState<V>>>,
    port: u16,
    child: Option<u16>,
    generation: u64,
    released: AtomicBool,
}

impl<V> PortReservation<V> {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn child(&self) -> Option<u16> {
        self.child
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(state) = self.state.upgrade() {
            let removed = state.lock().release(self.port, self.child, self.generation);
            drop(removed);
        }
    }
}

impl<V> Drop for PortReservation<V> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<V> std::fmt::Debug for PortReservation<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortReservation")
            .field("port", &self.port)
            .field("child", &self.child)
            .field("released", &self.is_released())
            .finish()
    }
}
