//! Reference model used by the harness, the scenarios and the benchmarks
//!
//! A `Root` universe contains `Node`s; nodes contain nodes. Every node
//! copies `source` into `target` and sums the totals of its children into
//! `total`, so a change deep in the tree ripples up to the universe.

use std::sync::Arc;

use im::OrdSet;
use ripple_engine::{Action, Mutable, MutableClass, Observed, Observer, Setable};

/// Classes and properties of the reference model
#[derive(Clone, Debug)]
pub struct TestModel {
    pub root: Arc<MutableClass>,
    pub node: Arc<MutableClass>,
    /// Containment of nodes, on the root and on every node
    pub children: Observed<OrdSet<Mutable>>,
    pub name: Setable<String>,
    pub source: Observed<i64>,
    /// `source` copied by the `copy` observer
    pub target: Observed<i64>,
    /// `target` plus the totals of all children
    pub total: Observed<i64>,
    pub copy: Observer,
    pub sum: Observer,
}

/// Default of `source`
pub const DEFAULT_SOURCE: i64 = 100;

impl TestModel {
    pub fn new() -> Self {
        let children: Observed<OrdSet<Mutable>> = Setable::builder("children", OrdSet::new())
            .containment()
            .observed();
        let name = Setable::builder("name", String::new()).mandatory().build();
        let source: Observed<i64> = Observed::new("source", DEFAULT_SOURCE);
        let target: Observed<i64> = Observed::new("target", 0);
        let total: Observed<i64> = Observed::new("total", 0);

        let copy = {
            let (source, target) = (source.clone(), target.clone());
            Observer::new("copy", move |tx, node| {
                let value = tx.get(node, &source);
                tx.set(node, &target, value)
            })
        };
        let sum = {
            let (children, target, total) = (children.clone(), target.clone(), total.clone());
            Observer::new("sum", move |tx, node| {
                let mut value = tx.get(node, &target);
                for child in tx.get(node, &children).iter() {
                    value += tx.get(child, &total);
                }
                tx.set(node, &total, value)
            })
        };

        let node = MutableClass::builder("Node")
            .setable(&children)
            .setable(&name)
            .setable(&source)
            .setable(&target)
            .setable(&total)
            .observer(&copy)
            .observer(&sum)
            .build();
        let root = MutableClass::builder("Root").setable(&children).build();

        TestModel {
            root,
            node,
            children,
            name,
            source,
            target,
            total,
            copy,
            sum,
        }
    }

    /// Universe mutable for running an engine without the driver
    pub fn universe(&self) -> Mutable {
        Mutable::new(&self.root, "universe")
    }

    /// A fresh, detached node
    pub fn node(&self, name: &str) -> Mutable {
        Mutable::new(&self.node, name.to_string())
    }

    /// Name `child` and contain it in `parent`
    pub fn add(&self, parent: &Mutable, child: &Mutable) -> Action {
        let (children, name) = (self.children.clone(), self.name.clone());
        let (parent, child) = (parent.clone(), child.clone());
        Action::new(format!("add {}", child), move |tx, _| {
            tx.set(&child, &name, child.name().to_string())?;
            tx.update(&parent, &children, |c| c.update(child.clone()))
        })
    }

    /// Contain `child` in `parent` without naming it
    pub fn add_unnamed(&self, parent: &Mutable, child: &Mutable) -> Action {
        let children = self.children.clone();
        let (parent, child) = (parent.clone(), child.clone());
        Action::new(format!("add unnamed {}", child), move |tx, _| {
            tx.update(&parent, &children, |c| c.update(child.clone()))
        })
    }

    pub fn remove(&self, parent: &Mutable, child: &Mutable) -> Action {
        let children = self.children.clone();
        let (parent, child) = (parent.clone(), child.clone());
        Action::new(format!("remove {}", child), move |tx, _| {
            tx.update(&parent, &children, |c| c.without(&child))
        })
    }

    pub fn set_source(&self, node: &Mutable, value: i64) -> Action {
        let source = self.source.clone();
        let node = node.clone();
        Action::new(format!("set {}.source", node), move |tx, _| tx.set(&node, &source, value))
    }
}

impl Default for TestModel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_engine::{Engine, EngineConfig};

    #[test]
    fn test_totals_ripple_to_the_top() {
        let model = TestModel::new();
        let universe = model.universe();
        let engine = Engine::new(universe.clone(), EngineConfig::sequential()).unwrap();
        let state = engine.activate(&engine.empty_state()).unwrap();

        let a = model.node("a");
        let b = model.node("b");
        let state = engine.run_action(&state, &model.add(&universe, &a), None).unwrap();
        let state = engine.run_action(&state, &model.add(&a, &b), None).unwrap();
        assert_eq!(model.total.get(&state, &b), DEFAULT_SOURCE);
        assert_eq!(model.total.get(&state, &a), 2 * DEFAULT_SOURCE);

        let state = engine.run_action(&state, &model.set_source(&b, 1), None).unwrap();
        assert_eq!(model.target.get(&state, &b), 1);
        assert_eq!(model.total.get(&state, &a), DEFAULT_SOURCE + 1);
    }

    #[test]
    fn test_removed_subtree_is_cleared() {
        let model = TestModel::new();
        let universe = model.universe();
        let engine = Engine::new(universe.clone(), EngineConfig::sequential()).unwrap();
        let a = model.node("a");
        let b = model.node("b");
        let state = engine.activate(&engine.empty_state()).unwrap();
        let state = engine.run_action(&state, &model.add(&universe, &a), None).unwrap();
        let state = engine.run_action(&state, &model.add(&a, &b), None).unwrap();

        let state = engine.run_action(&state, &model.remove(&universe, &a), None).unwrap();
        assert!(state.properties(&a).is_empty());
        assert!(state.properties(&b).is_empty());
    }
}
