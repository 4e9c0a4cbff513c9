//! Three-way+ merge of branched states
//!
//! Every branch is a descendant of the same base. For each object touched in
//! any branch the property maps are merged entry by entry:
//! 1. Unchanged in every branch: keep base
//! 2. Changed in one branch, or identically in several: take the change
//! 3. Changed differently, mergeable value type: delegate to the type
//! 4. Changed differently otherwise: ask the handler

use std::collections::BTreeSet;

use thiserror::Error;

use crate::diff::Join;
use crate::{Datum, ObjectKey, Property, Props, State};

/// Two or more branches wrote irreconcilable values
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Merge conflict on {object}.{property}: base {base}, branches {values:?}")]
pub struct MergeConflict {
    pub object: String,
    pub property: String,
    pub base: String,
    pub values: Vec<String>,
}

impl MergeConflict {
    pub fn new<O: ObjectKey, P: Property>(
        object: &O,
        property: &P,
        base: &Datum,
        values: &[Datum],
    ) -> Self {
        MergeConflict {
            object: format!("{:?}", object),
            property: format!("{:?}", property),
            base: base.describe(),
            values: values.iter().map(Datum::describe).collect(),
        }
    }
}

impl From<MergeConflict> for ripple_core::EngineError {
    fn from(conflict: MergeConflict) -> Self {
        ripple_core::EngineError::MergeConflict {
            object: conflict.object,
            property: conflict.property,
            base: conflict.base,
            values: conflict.values,
        }
    }
}

/// Hooks invoked while merging
pub trait StateMergeHandler<O: ObjectKey, P: Property> {
    /// Diverging non-mergeable writes. Returning `Ok` keeps the value of the
    /// first diverging branch.
    fn handle_merge_conflict(
        &self,
        object: &O,
        property: &P,
        base: &Datum,
        values: &[Datum],
    ) -> Result<(), MergeConflict> {
        Err(MergeConflict::new(object, property, base, values))
    }

    /// Called for every entry whose merged value differs from base, after the
    /// object's property map has been merged.
    fn handle_change(
        &self,
        _object: &O,
        _property: &P,
        _base: &Props<P>,
        _merged: &Props<P>,
        _branches: &[Props<P>],
    ) {
    }
}

/// Default handler: conflicts are fatal, changes are ignored
#[derive(Debug, Default, Clone, Copy)]
pub struct FailFast;

impl<O: ObjectKey, P: Property> StateMergeHandler<O, P> for FailFast {}

/// Merge counters, mostly for diagnostics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeResult {
    pub objects: u32,
    pub properties: u32,
    pub domain_merged: u32,
}

fn value_of<P: Property>(props: &Props<P>, property: &P) -> Datum {
    props
        .get(property)
        .cloned()
        .unwrap_or_else(|| property.default_value().clone())
}

impl<O: ObjectKey, P: Property> State<O, P> {
    /// Merge branches derived from `self`
    pub fn merge(
        &self,
        handler: &dyn StateMergeHandler<O, P>,
        branches: &[State<O, P>],
    ) -> Result<State<O, P>, MergeConflict> {
        self.merge_counted(handler, branches).map(|(state, _)| state)
    }

    /// Merge and report what was touched
    pub fn merge_counted(
        &self,
        handler: &dyn StateMergeHandler<O, P>,
        branches: &[State<O, P>],
    ) -> Result<(State<O, P>, MergeResult), MergeConflict> {
        let mut result = MergeResult::default();
        match branches {
            [] => return Ok((self.clone(), result)),
            [only] if only.universe() == self.universe() => {
                // A single branch only needs change notification.
                for diff in self.diff(only).iter() {
                    result.objects += 1;
                    for (property, _, _) in diff.changes() {
                        result.properties += 1;
                        handler.handle_change(
                            diff.object,
                            &property,
                            &diff.before,
                            &diff.after,
                            std::slice::from_ref(&diff.after),
                        );
                    }
                }
                return Ok((only.clone(), result));
            }
            _ => {}
        }

        let touched: BTreeSet<&O> = branches
            .iter()
            .flat_map(|branch| {
                Join::new(self.objects.iter(), branch.objects.iter())
                    .filter(|(_, b, a)| b != a)
                    .map(|(o, _, _)| o)
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut objects = self.objects.clone();
        let empty = Props::new();
        for object in touched {
            let base = self.objects.get(object).unwrap_or(&empty);
            let branch_props: Vec<Props<P>> = branches
                .iter()
                .map(|b| b.objects.get(object).cloned().unwrap_or_default())
                .collect();

            let mut properties: BTreeSet<&P> = BTreeSet::new();
            for props in &branch_props {
                for (p, b, a) in Join::new(base.iter(), props.iter()) {
                    if b != a {
                        properties.insert(p);
                    }
                }
            }

            let mut merged = base.clone();
            let mut changed = Vec::new();
            for property in properties {
                let base_value = value_of(base, property);
                let values: Vec<Datum> =
                    branch_props.iter().map(|b| value_of(b, property)).collect();
                let mut distinct: Vec<&Datum> = Vec::new();
                for v in values.iter().filter(|v| **v != base_value) {
                    if !distinct.contains(&v) {
                        distinct.push(v);
                    }
                }
                let value = match distinct.as_slice() {
                    [] => continue,
                    [one] => (*one).clone(),
                    _ => {
                        let refs: Vec<&Datum> = values.iter().collect();
                        match property.merge_values(&base_value, &refs) {
                            Some(v) => {
                                result.domain_merged += 1;
                                v
                            }
                            None => {
                                handler.handle_merge_conflict(
                                    object,
                                    property,
                                    &base_value,
                                    &values,
                                )?;
                                distinct[0].clone()
                            }
                        }
                    }
                };
                if value == *property.default_value() {
                    merged.remove(property);
                } else {
                    merged.insert(property.clone(), value);
                }
                if value_of(&merged, property) != base_value {
                    changed.push(property.clone());
                }
            }

            if merged != *base {
                result.objects += 1;
                if merged.is_empty() {
                    objects.remove(object);
                } else {
                    objects.insert(object.clone(), merged.clone());
                }
            }
            for property in changed {
                result.properties += 1;
                handler.handle_change(object, &property, base, &merged, &branch_props);
            }
        }

        tracing::trace!(
            objects = result.objects,
            properties = result.properties,
            branches = branches.len(),
            "merged state branches"
        );
        let mut merged = State::new(self.universe());
        merged.objects = objects;
        Ok((merged, result))
    }
}
