//! Universe driver
//!
//! [`Universe`] is the handle; the driver loop runs on its own thread and is
//! the only place states are committed. Requests are messages on a bounded
//! channel, so a slow driver pushes back on producers instead of buffering
//! without limit.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use ripple_engine::{
    Action, Engine, EngineConfig, EngineError, EngineResult, LeafTx, Mutable, MutableClass, Setable, State,
    Value,
};
use tracing::{debug, error, info, info_span, warn};

/// Default idle time before the cycle action is queued again
pub const DEFAULT_CYCLE_INTERVAL: Duration = Duration::from_millis(50);

/// Construction options beside the engine configuration
#[derive(Clone)]
pub struct UniverseOptions {
    /// Starting state, an empty state when absent
    pub start: Option<State>,
    /// Queued whenever the inbox stays idle for `cycle_interval`
    pub cycle: Option<Action>,
    pub cycle_interval: Duration,
    pub pre_actions: Vec<Action>,
    pub post_actions: Vec<Action>,
}

impl Default for UniverseOptions {
    fn default() -> Self {
        UniverseOptions {
            start: None,
            cycle: None,
            cycle_interval: DEFAULT_CYCLE_INTERVAL,
            pre_actions: Vec::new(),
            post_actions: Vec::new(),
        }
    }
}

/// Driver input
pub enum Message {
    /// Run an action, on the universe when no target is given
    Action(Action, Option<Mutable>),
    /// Write coming from outside the model, run as an action on the object
    Write(Action, Mutable),
    /// Step back in history
    Backward,
    /// Step forward again after `Backward`
    Forward,
    /// Barrier: answered with the committed state once everything queued
    /// before it is done
    Sync(Sender<State>),
    Stop,
}

/// One committed transition, published after it became visible
#[derive(Clone, Debug)]
pub struct Commit {
    pub pre: State,
    pub post: State,
    /// Name of the action, `None` for history moves
    pub action: Option<String>,
}

/// An action rolled back by a non-fatal error
#[derive(Clone, Debug)]
pub struct Failure {
    pub action: String,
    pub error: EngineError,
}

struct Shared {
    committed: RwLock<State>,
    failures: Mutex<Vec<Failure>>,
    fatal: Mutex<Option<EngineError>>,
    subscribers: Mutex<Vec<Sender<Commit>>>,
    killed: AtomicBool,
    finished: Mutex<bool>,
    ended: Condvar,
}

impl Shared {
    /// Error to hand out once the driver is gone
    fn end_error(&self) -> EngineError {
        self.fatal.lock().clone().unwrap_or(EngineError::Stopped)
    }
}

/// Handle to a running universe
pub struct Universe {
    universe: Mutable,
    inbox: Sender<Message>,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Universe {
    /// Activate a universe of class `root` and spawn its driver
    pub fn start(root: &Arc<MutableClass>, config: EngineConfig, options: UniverseOptions) -> EngineResult<Self> {
        let universe = Mutable::new(root, root.name().to_string());
        let capacity = config.max_in_in_queue.max(1);
        let history = config.max_nr_of_history;
        let engine = Engine::new(universe.clone(), config)?.with_hooks(options.pre_actions, options.post_actions);
        let start = options.start.unwrap_or_else(|| engine.empty_state());
        let initial = engine.activate(&start)?;

        let (inbox, receiver) = bounded(capacity);
        let shared = Arc::new(Shared {
            committed: RwLock::new(initial.clone()),
            failures: Mutex::new(Vec::new()),
            fatal: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            killed: AtomicBool::new(false),
            finished: Mutex::new(false),
            ended: Condvar::new(),
        });
        let driver = Driver {
            engine,
            inbox: receiver,
            shared: shared.clone(),
            current: initial,
            history: VecDeque::new(),
            future: Vec::new(),
            max_history: history,
            cycle: options.cycle,
            cycle_interval: options.cycle_interval,
        };
        let handle = thread::Builder::new()
            .name("ripple-universe".into())
            .spawn(move || driver.run())
            .map_err(|e| EngineError::Spawn(e.to_string()))?;
        Ok(Universe {
            universe,
            inbox,
            shared,
            handle: Some(handle),
        })
    }

    /// Root mutable of this universe
    pub fn universe(&self) -> &Mutable {
        &self.universe
    }

    fn send(&self, message: Message) -> EngineResult<()> {
        self.inbox.send(message).map_err(|_| self.shared.end_error())
    }

    /// Queue an action on the universe
    pub fn put(&self, action: Action) -> EngineResult<()> {
        self.send(Message::Action(action, None))
    }

    /// Queue an action on `target`
    pub fn put_on(&self, target: &Mutable, action: Action) -> EngineResult<()> {
        self.send(Message::Action(action, Some(target.clone())))
    }

    pub fn put_fn<F>(&self, name: &str, body: F) -> EngineResult<()>
    where
        F: Fn(&mut LeafTx<'_>, &Mutable) -> EngineResult<()> + Send + Sync + 'static,
    {
        self.put(Action::new(name, body))
    }

    /// Queue an external write of one property
    pub fn apply<T: Value>(&self, object: &Mutable, setable: &Setable<T>, value: T) -> EngineResult<()> {
        let name = format!("apply {}", setable.name());
        let setable = setable.clone();
        let action = Action::new(name, move |tx, object| tx.set(object, &setable, value.clone()));
        self.send(Message::Write(action, object.clone()))
    }

    pub fn backward(&self) -> EngineResult<()> {
        self.send(Message::Backward)
    }

    pub fn forward(&self) -> EngineResult<()> {
        self.send(Message::Forward)
    }

    /// Committed state after every message queued so far
    pub fn sync(&self) -> EngineResult<State> {
        let (reply, answer) = bounded(1);
        self.send(Message::Sync(reply))?;
        answer.recv().map_err(|_| self.shared.end_error())
    }

    /// Latest committed state
    pub fn state(&self) -> State {
        self.shared.committed.read().clone()
    }

    /// Actions rolled back so far
    pub fn failures(&self) -> Vec<Failure> {
        self.shared.failures.lock().clone()
    }

    /// Feed of commits from now on
    pub fn subscribe(&self) -> Receiver<Commit> {
        let (sender, receiver) = unbounded();
        self.shared.subscribers.lock().push(sender);
        receiver
    }

    /// Ask the driver to finish after the messages already queued
    pub fn stop(&self) {
        let _ = self.inbox.send(Message::Stop);
    }

    /// Stop before the next queued message
    pub fn kill(&self) {
        self.shared.killed.store(true, Ordering::SeqCst);
        let _ = self.inbox.try_send(Message::Stop);
    }

    /// Block until the driver has ended. Returns the final committed state,
    /// or the fatal error that ended it.
    pub fn wait_for_end(&self) -> EngineResult<State> {
        let mut finished = self.shared.finished.lock();
        while !*finished {
            self.shared.ended.wait(&mut finished);
        }
        drop(finished);
        match self.shared.fatal.lock().clone() {
            Some(error) => Err(error),
            None => Ok(self.state()),
        }
    }

    pub fn is_running(&self) -> bool {
        !*self.shared.finished.lock()
    }
}

impl Drop for Universe {
    fn drop(&mut self) {
        let _ = self.inbox.send(Message::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Driver {
    engine: Engine,
    inbox: Receiver<Message>,
    shared: Arc<Shared>,
    current: State,
    history: VecDeque<State>,
    future: Vec<State>,
    max_history: usize,
    cycle: Option<Action>,
    cycle_interval: Duration,
}

impl Driver {
    fn run(mut self) {
        let span = info_span!("universe", id = %self.engine.universe());
        let _enter = span.enter();
        info!("universe started");
        loop {
            if self.killed() {
                break;
            }
            let Some(message) = self.next() else {
                break;
            };
            if self.killed() {
                break;
            }
            match message {
                Message::Action(action, target) => self.run_action(&action, target.as_ref()),
                Message::Write(action, object) => self.run_action(&action, Some(&object)),
                Message::Backward => self.step_backward(),
                Message::Forward => self.step_forward(),
                Message::Sync(reply) => {
                    let _ = reply.send(self.current.clone());
                }
                Message::Stop => break,
            }
            if self.shared.fatal.lock().is_some() {
                break;
            }
        }
        info!(history = self.history.len(), "universe stopped");
        let shared = self.shared.clone();
        drop(self);
        *shared.finished.lock() = true;
        shared.ended.notify_all();
    }

    fn killed(&self) -> bool {
        if !self.shared.killed.load(Ordering::SeqCst) {
            return false;
        }
        warn!("universe killed");
        *self.shared.fatal.lock() = Some(EngineError::Killed);
        true
    }

    fn next(&self) -> Option<Message> {
        match &self.cycle {
            None => self.inbox.recv().ok(),
            Some(cycle) => match self.inbox.recv_timeout(self.cycle_interval) {
                Ok(message) => Some(message),
                Err(RecvTimeoutError::Timeout) => Some(Message::Action(cycle.clone(), None)),
                Err(RecvTimeoutError::Disconnected) => None,
            },
        }
    }

    fn run_action(&mut self, action: &Action, target: Option<&Mutable>) {
        match self.engine.run_action(&self.current, action, target) {
            Ok(post) => {
                // idle cycles only leave a trace when they change something
                let idle = self.cycle.as_ref() == Some(action);
                if !idle || post != self.current {
                    self.history.push_back(self.current.clone());
                    while self.history.len() > self.max_history {
                        self.history.pop_front();
                    }
                    self.future.clear();
                }
                if post != self.current {
                    self.commit(post, Some(action.name().to_string()));
                }
            }
            Err(e) if !e.is_fatal() => {
                debug!(action = action.name(), error = %e, "action rolled back");
                self.shared.failures.lock().push(Failure {
                    action: action.name().to_string(),
                    error: e,
                });
            }
            Err(e) => {
                error!(action = action.name(), error = %e, "fatal error, stopping universe");
                *self.shared.fatal.lock() = Some(e);
            }
        }
    }

    fn step_backward(&mut self) {
        if let Some(previous) = self.history.pop_back() {
            self.future.push(self.current.clone());
            self.commit(previous, None);
        }
    }

    fn step_forward(&mut self) {
        if let Some(next) = self.future.pop() {
            self.history.push_back(self.current.clone());
            self.commit(next, None);
        }
    }

    fn commit(&mut self, post: State, action: Option<String>) {
        let pre = std::mem::replace(&mut self.current, post.clone());
        *self.shared.committed.write() = post.clone();
        let commit = Commit { pre, post, action };
        self.shared
            .subscribers
            .lock()
            .retain(|subscriber| subscriber.send(commit.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use im::OrdSet;
    use ripple_engine::{Observed, Observer};

    struct Model {
        root: Arc<MutableClass>,
        item: Arc<MutableClass>,
        children: Setable<OrdSet<Mutable>>,
        source: Observed<i64>,
        target: Observed<i64>,
        name: Setable<String>,
    }

    fn model() -> Model {
        let children: Setable<OrdSet<Mutable>> =
            Setable::builder("children", OrdSet::new()).containment().build();
        let source: Observed<i64> = Observed::new("source", 100);
        let target: Observed<i64> = Observed::new("target", 0);
        let name = Setable::builder("name", String::new()).mandatory().build();
        let copy = {
            let (source, target) = (source.clone(), target.clone());
            Observer::new("copy", move |tx, m| {
                let value = tx.get(m, &source);
                tx.set(m, &target, value)
            })
        };
        let item = MutableClass::builder("Item")
            .setable(&source)
            .setable(&target)
            .setable(&name)
            .observer(&copy)
            .build();
        let root = MutableClass::builder("Root").setable(&children).build();
        Model {
            root,
            item,
            children,
            source,
            target,
            name,
        }
    }

    fn add(model: &Model, item: &Mutable, name: Option<&str>) -> Action {
        let children = model.children.clone();
        let names = model.name.clone();
        let item = item.clone();
        let name = name.map(str::to_string);
        Action::new("add", move |tx, universe| {
            if let Some(name) = &name {
                tx.set(&item, &names, name.clone())?;
            }
            tx.update(universe, &children, |c| c.update(item.clone()))
        })
    }

    fn start(model: &Model) -> Universe {
        Universe::start(&model.root, EngineConfig::dev(), UniverseOptions::default()).unwrap()
    }

    #[test]
    fn test_actions_commit_in_order() {
        let model = model();
        let universe = start(&model);
        let item = Mutable::new(&model.item, "item");
        universe.put(add(&model, &item, Some("a"))).unwrap();
        let state = universe.sync().unwrap();
        assert_eq!(model.target.get(&state, &item), 100);

        universe.apply(&item, &model.source, 42).unwrap();
        let state = universe.sync().unwrap();
        assert_eq!(model.target.get(&state, &item), 42);
        assert_eq!(universe.state(), state);
    }

    #[test]
    fn test_consistency_failure_is_rolled_back() {
        let model = model();
        let universe = start(&model);
        let before = universe.sync().unwrap();
        let item = Mutable::new(&model.item, "nameless");
        universe.put(add(&model, &item, None)).unwrap();
        let after = universe.sync().unwrap();
        assert_eq!(before, after);
        let failures = universe.failures();
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0].error, EngineError::Consistency(_)));
        assert!(universe.is_running());
    }

    #[test]
    fn test_history_moves_are_published() {
        let model = model();
        let universe = start(&model);
        let feed = universe.subscribe();
        let item = Mutable::new(&model.item, "item");
        universe.put(add(&model, &item, Some("a"))).unwrap();
        universe.apply(&item, &model.source, 7).unwrap();
        let latest = universe.sync().unwrap();
        assert_eq!(feed.try_iter().count(), 2);

        universe.backward().unwrap();
        let restored = universe.sync().unwrap();
        assert_eq!(model.target.get(&restored, &item), 100);
        let commit = feed.recv().unwrap();
        assert_eq!(commit.action, None);
        assert_eq!(commit.pre, latest);

        universe.forward().unwrap();
        assert_eq!(universe.sync().unwrap(), latest);
    }

    #[test]
    fn test_unchanged_action_clears_redo() {
        let model = model();
        let universe = start(&model);
        let feed = universe.subscribe();
        let item = Mutable::new(&model.item, "item");
        universe.put(add(&model, &item, Some("a"))).unwrap();
        universe.apply(&item, &model.source, 7).unwrap();
        universe.backward().unwrap();
        let restored = universe.sync().unwrap();
        assert_eq!(feed.try_iter().count(), 3);

        universe.put_fn("noop", |_, _| Ok(())).unwrap();
        assert_eq!(universe.sync().unwrap(), restored);
        assert_eq!(feed.try_iter().count(), 0);

        universe.forward().unwrap();
        let state = universe.sync().unwrap();
        assert_eq!(state, restored);
        assert_eq!(model.target.get(&state, &item), 100);
    }

    #[test]
    fn test_stop_and_kill() {
        let model = model();
        let universe = start(&model);
        universe.stop();
        assert!(universe.wait_for_end().is_ok());
        assert!(matches!(universe.put_fn("late", |_, _| Ok(())), Err(EngineError::Stopped)));

        let universe = start(&model);
        universe.kill();
        assert_eq!(universe.wait_for_end(), Err(EngineError::Killed));
        assert_eq!(universe.sync(), Err(EngineError::Killed));
    }

    #[test]
    fn test_fatal_rule_error_stops_the_universe() {
        let model = model();
        let universe = start(&model);
        universe
            .put_fn("explode", |_, _| Err(EngineError::CircularConstant { chain: vec!["x".into()] }))
            .unwrap();
        assert!(matches!(universe.wait_for_end(), Err(EngineError::CircularConstant { .. })));
    }
}
