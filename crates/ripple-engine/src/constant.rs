//! Write-once derived constants
//!
//! A [`Constant`] is derived lazily per object and never changes afterwards.
//! All transaction threads of a universe share one [`ConstantState`]:
//!
//! - A key is claimed by inserting a `Pending` slot through a dashmap entry,
//!   so exactly one thread runs the deriver; no lock is held meanwhile.
//! - Threads asking for a claimed key wait on the claim's condvar. A wait
//!   that would close a wait-for cycle fails with `CircularConstant`.
//! - Re-entering a key on the same derivation chain is `CircularConstant`.
//! - Past `max_constant_depth` nested derivations the chain unwinds with
//!   `ConstantDepthOverflow`; the outermost call then derives the deepest
//!   pending key first from a work stack and retries.
//! - Publishing a value that differs from the stored one is `NonDeterministic`.
//! - `evict` drops every entry of a destroyed object and bumps its
//!   generation, so derivations still in flight cannot resurrect it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use ripple_core::{EngineError, EngineResult, ObjectId, SetableId};
use ripple_state::Datum;

use crate::{Mutable, State, Value};

type Deriver<T> = Arc<dyn Fn(&mut DeriveCtx<'_>, &Mutable) -> EngineResult<T> + Send + Sync>;
type Retry = Arc<dyn Fn(&mut DeriveCtx<'_>) -> EngineResult<()> + Send + Sync>;
type Key = (ObjectId, u64);

static NEXT_DERIVATION: AtomicU64 = AtomicU64::new(1);

/// Lazily derived, write-once value per object
pub struct Constant<T: Value> {
    id: u64,
    name: Arc<str>,
    default: T,
    deriver: Option<Deriver<T>>,
}

impl<T: Value> Clone for Constant<T> {
    fn clone(&self) -> Self {
        Constant {
            id: self.id,
            name: self.name.clone(),
            default: self.default.clone(),
            deriver: self.deriver.clone(),
        }
    }
}

impl<T: Value> fmt::Debug for Constant<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Constant({})", self.name)
    }
}

impl<T: Value> Constant<T> {
    /// Constant computed on first use
    pub fn derived<F>(name: impl Into<Arc<str>>, default: T, deriver: F) -> Self
    where
        F: Fn(&mut DeriveCtx<'_>, &Mutable) -> EngineResult<T> + Send + Sync + 'static,
    {
        Constant {
            id: SetableId::next().0,
            name: name.into(),
            default,
            deriver: Some(Arc::new(deriver)),
        }
    }

    /// Constant that must be set explicitly; reads `default` until then
    pub fn settable(name: impl Into<Arc<str>>, default: T) -> Self {
        Constant {
            id: SetableId::next().0,
            name: name.into(),
            default,
            deriver: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn label(&self, object: &Mutable) -> String {
        format!("{:?}.{}", object, self.name)
    }

    fn cast(&self, datum: &Datum) -> T {
        datum
            .downcast_ref::<T>()
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// Context handed to derivers
pub struct DeriveCtx<'a> {
    constants: &'a ConstantState,
    state: &'a State,
    derivation: u64,
    chain: Vec<String>,
    overflow: Option<Retry>,
    retrying: bool,
}

impl<'a> DeriveCtx<'a> {
    pub(crate) fn new(constants: &'a ConstantState, state: &'a State) -> Self {
        DeriveCtx {
            constants,
            state,
            derivation: NEXT_DERIVATION.fetch_add(1, Ordering::Relaxed),
            chain: Vec::new(),
            overflow: None,
            retrying: false,
        }
    }

    /// State of the transaction that asked for the constant
    pub fn state(&self) -> &State {
        self.state
    }

    /// Another constant, derived on demand
    pub fn constant<T: Value>(&mut self, object: &Mutable, constant: &Constant<T>) -> EngineResult<T> {
        let constants = self.constants;
        constants.get(self, object, constant)
    }

    /// Pending derivations, outermost first
    pub fn chain(&self) -> &[String] {
        &self.chain
    }
}

struct Pending {
    derivation: u64,
    done: Mutex<bool>,
    cond: Condvar,
}

impl Pending {
    fn new(derivation: u64) -> Arc<Self> {
        Arc::new(Pending {
            derivation,
            done: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }

    fn finish(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }
}

enum Slot {
    Ready(Datum),
    Pending(Arc<Pending>),
}

/// Shared constant cache of one universe
pub struct ConstantState {
    slots: DashMap<Key, Slot>,
    generations: DashMap<ObjectId, u64>,
    /// Waiting derivation to the derivation it waits for
    waits: Mutex<HashMap<u64, u64>>,
    max_depth: usize,
    trace: bool,
}

impl ConstantState {
    pub fn new(max_depth: usize, trace: bool) -> Self {
        ConstantState {
            slots: DashMap::new(),
            generations: DashMap::new(),
            waits: Mutex::new(HashMap::new()),
            max_depth: max_depth.max(1),
            trace,
        }
    }

    /// Number of ready entries
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn generation(&self, object: ObjectId) -> u64 {
        self.generations.get(&object).map_or(0, |g| *g)
    }

    /// Read or derive a constant
    pub fn get<T: Value>(
        &self,
        ctx: &mut DeriveCtx<'_>,
        object: &Mutable,
        constant: &Constant<T>,
    ) -> EngineResult<T> {
        if !ctx.chain.is_empty() || ctx.retrying {
            return self.derive(ctx, object, constant);
        }
        // Outermost call: unwind depth overflows into a work stack.
        let mut pending: Vec<Retry> = Vec::new();
        loop {
            let result = match pending.last().cloned() {
                Some(retry) => {
                    ctx.retrying = true;
                    let result = retry(ctx);
                    ctx.retrying = false;
                    result.map(|_| None)
                }
                None => self.derive(ctx, object, constant).map(Some),
            };
            match result {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {
                    pending.pop();
                }
                Err(EngineError::ConstantDepthOverflow { chain }) => match ctx.overflow.take() {
                    Some(retry) => {
                        tracing::debug!(depth = chain.len(), "constant derivation overflow, retrying deepest first");
                        pending.push(retry);
                    }
                    None => return Err(EngineError::ConstantDepthOverflow { chain }),
                },
                Err(e) => return Err(e),
            }
        }
    }

    fn derive<T: Value>(
        &self,
        ctx: &mut DeriveCtx<'_>,
        object: &Mutable,
        constant: &Constant<T>,
    ) -> EngineResult<T> {
        let key = (object.id(), constant.id);
        loop {
            let claimed = match self.slots.get(&key).map(|slot| match slot.value() {
                Slot::Ready(datum) => Ok(datum.clone()),
                Slot::Pending(pending) => Err(pending.clone()),
            }) {
                Some(Ok(datum)) => return Ok(constant.cast(&datum)),
                Some(Err(pending)) => Some(pending),
                None => None,
            };
            if let Some(pending) = claimed {
                if pending.derivation == ctx.derivation {
                    let mut chain = ctx.chain.clone();
                    chain.push(constant.label(object));
                    return Err(EngineError::CircularConstant { chain });
                }
                self.wait_for(ctx, &pending, || constant.label(object))?;
                continue;
            }

            let Some(deriver) = constant.deriver.clone() else {
                return Ok(constant.default.clone());
            };
            if ctx.chain.len() >= self.max_depth {
                let retry_object = object.clone();
                let retry_constant = constant.clone();
                ctx.overflow = Some(Arc::new(move |ctx: &mut DeriveCtx<'_>| {
                    let constants = ctx.constants;
                    constants.derive(ctx, &retry_object, &retry_constant).map(|_| ())
                }));
                return Err(EngineError::ConstantDepthOverflow {
                    chain: ctx.chain.clone(),
                });
            }

            let generation = self.generation(key.0);
            let pending = Pending::new(ctx.derivation);
            match self.slots.entry(key) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(vacant) => {
                    vacant.insert(Slot::Pending(pending.clone()));
                }
            }

            if self.trace {
                tracing::trace!(constant = %constant.name, object = ?object, depth = ctx.chain.len(), "deriving constant");
            }
            ctx.chain.push(constant.label(object));
            let result = deriver(ctx, object);
            ctx.chain.pop();

            let outcome = match result {
                Ok(value) => {
                    if self.generation(key.0) == generation {
                        self.slots
                            .insert(key, Slot::Ready(Datum::new(value.clone())));
                    } else {
                        self.slots.remove(&key);
                    }
                    Ok(value)
                }
                Err(e) => {
                    self.slots
                        .remove_if(&key, |_, slot| matches!(slot, Slot::Pending(p) if Arc::ptr_eq(p, &pending)));
                    Err(e)
                }
            };
            pending.finish();
            return outcome;
        }
    }

    fn wait_for(
        &self,
        ctx: &DeriveCtx<'_>,
        pending: &Pending,
        label: impl Fn() -> String,
    ) -> EngineResult<()> {
        {
            let mut waits = self.waits.lock();
            let mut next = Some(pending.derivation);
            while let Some(derivation) = next {
                if derivation == ctx.derivation {
                    let mut chain = ctx.chain.clone();
                    chain.push(label());
                    return Err(EngineError::CircularConstant { chain });
                }
                next = waits.get(&derivation).copied();
            }
            waits.insert(ctx.derivation, pending.derivation);
        }
        pending.wait();
        self.waits.lock().remove(&ctx.derivation);
        Ok(())
    }

    /// Fix a constant's value. Setting a different value later is fatal.
    pub fn set<T: Value>(&self, object: &Mutable, constant: &Constant<T>, value: T) -> EngineResult<T> {
        let datum = Datum::new(value.clone());
        match self.slots.entry((object.id(), constant.id)) {
            Entry::Occupied(mut occupied) => match occupied.get() {
                Slot::Ready(existing) if *existing != datum => Err(EngineError::NonDeterministic {
                    key: constant.label(object),
                    first: existing.describe(),
                    second: datum.describe(),
                }),
                Slot::Ready(_) => Ok(value),
                Slot::Pending(_) => {
                    occupied.insert(Slot::Ready(datum));
                    Ok(value)
                }
            },
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Ready(datum));
                Ok(value)
            }
        }
    }

    /// Value if already derived
    pub fn peek<T: Value>(&self, object: &Mutable, constant: &Constant<T>) -> Option<T> {
        match self.slots.get(&(object.id(), constant.id))?.value() {
            Slot::Ready(datum) => datum.downcast_ref::<T>().cloned(),
            Slot::Pending(_) => None,
        }
    }

    /// Get-or-insert under an explicit slot of `owner`, used for constructions
    pub(crate) fn memoize(
        &self,
        owner: ObjectId,
        slot: u64,
        make: impl FnOnce() -> Datum,
    ) -> Datum {
        match self.slots.entry((owner, slot)) {
            Entry::Occupied(occupied) => match occupied.get() {
                Slot::Ready(datum) => datum.clone(),
                Slot::Pending(_) => make(),
            },
            Entry::Vacant(vacant) => {
                let datum = make();
                vacant.insert(Slot::Ready(datum.clone()));
                datum
            }
        }
    }

    /// Drop all entries owned by a destroyed object
    pub fn evict(&self, object: ObjectId) {
        *self.generations.entry(object).or_insert(0) += 1;
        self.slots.retain(|(owner, _), _| *owner != object);
    }
}

impl fmt::Debug for ConstantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstantState")
            .field("entries", &self.slots.len())
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::MutableClass;
    use ripple_core::UniverseId;

    fn node(name: &str) -> Mutable {
        Mutable::new(&MutableClass::plain("Node"), name)
    }

    #[test]
    fn test_derives_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let answer = Constant::derived("answer", 0i64, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        });
        let constants = ConstantState::new(16, false);
        let state = State::new(UniverseId(1));
        let n = node("n");
        for _ in 0..3 {
            let mut ctx = DeriveCtx::new(&constants, &state);
            assert_eq!(constants.get(&mut ctx, &n, &answer), Ok(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(constants.peek(&n, &answer), Some(42));
    }

    #[test]
    fn test_concurrent_derivation_waits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let slow = Constant::derived("slow", 0i64, move |_, m| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            Ok(m.id().0 as i64)
        });
        let constants = ConstantState::new(16, false);
        let state = State::new(UniverseId(1));
        let n = node("n");
        let results: Vec<EngineResult<i64>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        let mut ctx = DeriveCtx::new(&constants, &state);
                        constants.get(&mut ctx, &n, &slow)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(results.iter().all(|r| *r == Ok(n.id().0 as i64)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_direct_cycle_is_an_error() {
        let cell: Arc<Mutex<Option<Constant<i64>>>> = Arc::new(Mutex::new(None));
        let inner = cell.clone();
        let looping = Constant::derived("looping", 0i64, move |ctx, m| {
            let me = inner.lock().clone();
            match me {
                Some(me) => ctx.constant(m, &me),
                None => Ok(0),
            }
        });
        *cell.lock() = Some(looping.clone());
        let constants = ConstantState::new(16, false);
        let state = State::new(UniverseId(1));
        let n = node("n");
        let mut ctx = DeriveCtx::new(&constants, &state);
        match constants.get(&mut ctx, &n, &looping) {
            Err(EngineError::CircularConstant { chain }) => assert_eq!(chain.len(), 2),
            other => panic!("expected a cycle, got {:?}", other),
        }
        // the failed claim is released
        assert!(constants.peek(&n, &looping).is_none());
    }

    #[test]
    fn test_deep_chains_are_derived_iteratively() {
        // depth(k) = depth(k - 1) + 1 over a chain of objects
        let class = MutableClass::plain("Link");
        let links: Arc<Vec<Mutable>> =
            Arc::new((0..50).map(|i| Mutable::new(&class, format!("l{}", i))).collect());
        let cell: Arc<Mutex<Option<Constant<i64>>>> = Arc::new(Mutex::new(None));
        let inner = cell.clone();
        let chain = links.clone();
        let depth = Constant::derived("depth", 0i64, move |ctx, m| {
            let index = chain.iter().position(|l| l == m).unwrap_or(0);
            let me = inner.lock().clone();
            match (index, me) {
                (0, _) | (_, None) => Ok(0),
                (i, Some(me)) => Ok(ctx.constant(&chain[i - 1], &me)? + 1),
            }
        });
        *cell.lock() = Some(depth.clone());
        let constants = ConstantState::new(8, false);
        let state = State::new(UniverseId(1));
        let mut ctx = DeriveCtx::new(&constants, &state);
        assert_eq!(constants.get(&mut ctx, &links[49], &depth), Ok(49));
        assert_eq!(constants.peek(&links[20], &depth), Some(20));
    }

    #[test]
    fn test_set_is_write_once() {
        let fixed = Constant::settable("fixed", 0i64);
        let constants = ConstantState::new(16, false);
        let n = node("n");
        assert_eq!(constants.set(&n, &fixed, 1), Ok(1));
        assert_eq!(constants.set(&n, &fixed, 1), Ok(1));
        assert!(matches!(
            constants.set(&n, &fixed, 2),
            Err(EngineError::NonDeterministic { .. })
        ));
    }

    #[test]
    fn test_evict_forgets_object() {
        let answer = Constant::derived("answer", 0i64, |_, _| Ok(7));
        let constants = ConstantState::new(16, false);
        let state = State::new(UniverseId(1));
        let n = node("n");
        let mut ctx = DeriveCtx::new(&constants, &state);
        assert_eq!(constants.get(&mut ctx, &n, &answer), Ok(7));
        assert_eq!(constants.len(), 1);
        constants.evict(n.id());
        assert!(constants.is_empty());
    }
}
