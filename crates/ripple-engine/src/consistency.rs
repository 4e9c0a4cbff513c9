//! Post-action consistency checks
//!
//! Run over every object the action changed. Violations roll the action
//! back; they are collected, not short-circuited, so one report lists all
//! of them.

use ripple_core::{ConsistencyViolation, EngineConfig};

use crate::{Mutable, State};

/// Violations introduced between `pre` and `post`
pub fn check(config: &EngineConfig, universe: &Mutable, pre: &State, post: &State) -> Vec<ConsistencyViolation> {
    let mut violations = Vec::new();
    for diff in pre.diff(post).iter() {
        let object = diff.object;
        let alive = object == universe || object.parent(post).is_some();
        if !alive {
            let properties = post.properties(object).len();
            if config.check_orphan_state && properties > 0 {
                violations.push(ConsistencyViolation::OrphanState {
                    object: format!("{:?}", object),
                    properties,
                });
            }
            continue;
        }
        check_object(config, universe, object, post, &mut violations);
    }
    violations
}

fn check_object(
    config: &EngineConfig,
    universe: &Mutable,
    object: &Mutable,
    state: &State,
    violations: &mut Vec<ConsistencyViolation>,
) {
    for setable in object.class().setables() {
        if !setable.checks_consistency() {
            continue;
        }
        let value = state.get(object, setable);
        if setable.is_mandatory() && setable.is_empty_value(&value) {
            violations.push(ConsistencyViolation::EmptyMandatory {
                object: format!("{:?}", object),
                property: setable.name().to_string(),
            });
        }
        let referenced = setable.mutables_of(&value);
        if let Some(scope) = setable.scope() {
            let allowed = scope.mutables_of(&state.get(object, scope));
            for outside in referenced.iter().filter(|m| !allowed.contains(m)) {
                violations.push(ConsistencyViolation::OutOfScope {
                    object: format!("{:?}", object),
                    property: setable.name().to_string(),
                    value: format!("{:?}", outside),
                });
            }
        }
        if config.check_orphan_state {
            for orphan in referenced.iter().filter(|m| *m != universe && m.parent(state).is_none()) {
                violations.push(ConsistencyViolation::ReferencedOrphan {
                    object: format!("{:?}", object),
                    property: setable.name().to_string(),
                    orphan: format!("{:?}", orphan),
                });
            }
        }
    }
    for observer in object.class().observers() {
        if let Some(failure) = observer.failure(state, object) {
            violations.push(ConsistencyViolation::ObserverFailed {
                object: format!("{:?}", object),
                observer: observer.name().to_string(),
                message: failure.message,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setable::parent_setable;
    use crate::{MutableClass, Observed, Parent, Setable};
    use im::OrdSet;
    use ripple_core::UniverseId;

    struct Model {
        universe: Mutable,
        children: Setable<OrdSet<Mutable>>,
        name: Setable<String>,
        best: Observed<Option<Mutable>>,
        class: std::sync::Arc<MutableClass>,
    }

    fn model() -> Model {
        let children: Setable<OrdSet<Mutable>> =
            Setable::builder("children", OrdSet::new()).containment().build();
        let name = Setable::builder("name", String::new()).mandatory().build();
        let best: Observed<Option<Mutable>> = Setable::builder("best", None).scope(&children).observed();
        let class = MutableClass::builder("Node")
            .setable(&children)
            .setable(&name)
            .setable(&best)
            .build();
        Model {
            universe: Mutable::new(&class, "universe"),
            children,
            name,
            best,
            class,
        }
    }

    fn contain(model: &Model, state: &State, child: &Mutable) -> State {
        let state = model.children.set(
            state,
            &model.universe,
            model.children.get(state, &model.universe).update(child.clone()),
        );
        parent_setable().set(
            &state,
            child,
            Some(Parent {
                mutable: model.universe.clone(),
                containing: model.children.setable_ref().clone(),
            }),
        )
    }

    #[test]
    fn test_empty_mandatory_is_reported() {
        let model = model();
        let pre = State::new(UniverseId(1));
        let post = model.name.set(&pre, &model.universe, "root".into());
        let child = Mutable::new(&model.class, "child");
        let post = contain(&model, &post, &child);
        let violations = check(&EngineConfig::dev(), &model.universe, &pre, &post);
        assert_eq!(
            violations,
            vec![ConsistencyViolation::EmptyMandatory {
                object: format!("{:?}", child),
                property: "name".into(),
            }]
        );
    }

    #[test]
    fn test_scope_and_orphan_references() {
        let model = model();
        let pre = State::new(UniverseId(1));
        let stranger = Mutable::new(&model.class, "stranger");
        let post = model.name.set(&pre, &model.universe, "root".into());
        let post = model.best.set(&post, &model.universe, Some(stranger.clone()));
        let violations = check(&EngineConfig::dev(), &model.universe, &pre, &post);
        assert!(violations
            .iter()
            .any(|v| matches!(v, ConsistencyViolation::OutOfScope { property, .. } if property == "best")));
        assert!(violations
            .iter()
            .any(|v| matches!(v, ConsistencyViolation::ReferencedOrphan { property, .. } if property == "best")));
    }

    #[test]
    fn test_orphan_state_is_reported() {
        let model = model();
        let pre = State::new(UniverseId(1));
        let loose = Mutable::new(&model.class, "loose");
        let post = model.name.set(&pre, &loose, "x".into());
        let violations = check(&EngineConfig::dev(), &model.universe, &pre, &post);
        assert_eq!(
            violations,
            vec![ConsistencyViolation::OrphanState {
                object: format!("{:?}", loose),
                properties: 1,
            }]
        );
        assert!(check(&EngineConfig::production(), &model.universe, &pre, &post).is_empty());
    }
}
