//! Structural differences between two states
//!
//! [`Diff`] is a view over two snapshots; every call to [`Diff::iter`]
//! restarts the walk. Both maps are ordered, so the walk is a merge-join
//! and untouched objects are skipped by map equality.

use std::cmp::Ordering;
use std::iter::Peekable;

use crate::{Datum, ObjectKey, Property, Props, State};

/// Ordered full outer join of two sorted key/value sequences
pub struct Join<'a, K, V, A, B>
where
    A: Iterator<Item = (&'a K, &'a V)>,
    B: Iterator<Item = (&'a K, &'a V)>,
    K: 'a,
    V: 'a,
{
    left: Peekable<A>,
    right: Peekable<B>,
}

impl<'a, K, V, A, B> Join<'a, K, V, A, B>
where
    K: Ord + 'a,
    V: 'a,
    A: Iterator<Item = (&'a K, &'a V)>,
    B: Iterator<Item = (&'a K, &'a V)>,
{
    pub fn new(left: A, right: B) -> Self {
        Join {
            left: left.peekable(),
            right: right.peekable(),
        }
    }
}

impl<'a, K, V, A, B> Iterator for Join<'a, K, V, A, B>
where
    K: Ord + 'a,
    V: 'a,
    A: Iterator<Item = (&'a K, &'a V)>,
    B: Iterator<Item = (&'a K, &'a V)>,
{
    type Item = (&'a K, Option<&'a V>, Option<&'a V>);

    fn next(&mut self) -> Option<Self::Item> {
        let order = match (self.left.peek(), self.right.peek()) {
            (None, None) => return None,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some((l, _)), Some((r, _))) => l.cmp(r),
        };
        match order {
            Ordering::Less => self.left.next().map(|(k, v)| (k, Some(v), None)),
            Ordering::Greater => self.right.next().map(|(k, v)| (k, None, Some(v))),
            Ordering::Equal => {
                let (k, l) = self.left.next()?;
                let (_, r) = self.right.next()?;
                Some((k, Some(l), Some(r)))
            }
        }
    }
}

/// Per-object difference
#[derive(Debug, Clone)]
pub struct ObjectDiff<'a, O: ObjectKey, P: Property> {
    pub object: &'a O,
    pub before: Props<P>,
    pub after: Props<P>,
}

impl<'a, O: ObjectKey, P: Property> ObjectDiff<'a, O, P> {
    /// Changed properties with their before/after values
    pub fn changes(&self) -> Vec<(P, Datum, Datum)> {
        Join::new(self.before.iter(), self.after.iter())
            .filter(|(_, b, a)| b != a)
            .map(|(p, b, a)| {
                let default = p.default_value();
                (
                    p.clone(),
                    b.cloned().unwrap_or_else(|| default.clone()),
                    a.cloned().unwrap_or_else(|| default.clone()),
                )
            })
            .collect()
    }
}

type Filter<'a, T> = Box<dyn Fn(&T) -> bool + 'a>;

/// Restartable difference between two snapshots
pub struct Diff<'a, O: ObjectKey, P: Property> {
    before: &'a State<O, P>,
    after: &'a State<O, P>,
    object_filter: Option<Filter<'a, O>>,
    property_filter: Option<Filter<'a, P>>,
}

impl<'a, O: ObjectKey, P: Property> Diff<'a, O, P> {
    /// Only report objects accepted by `filter`
    pub fn objects(mut self, filter: impl Fn(&O) -> bool + 'a) -> Self {
        self.object_filter = Some(Box::new(filter));
        self
    }

    /// Only report properties accepted by `filter`
    pub fn properties(mut self, filter: impl Fn(&P) -> bool + 'a) -> Self {
        self.property_filter = Some(Box::new(filter));
        self
    }

    fn filtered(&self, props: &Props<P>) -> Props<P> {
        props
            .iter()
            .filter(|(p, _)| self.property_filter.as_ref().map_or(true, |f| f(*p)))
            .map(|(p, v)| (p.clone(), v.clone()))
            .collect()
    }

    /// Walk changed objects
    pub fn iter(&self) -> impl Iterator<Item = ObjectDiff<'a, O, P>> + '_ {
        Join::new(self.before.objects.iter(), self.after.objects.iter())
            .filter(|(_, b, a)| b != a)
            .filter(move |(o, _, _)| self.object_filter.as_ref().map_or(true, |f| f(*o)))
            .filter_map(move |(object, b, a)| {
                let mut before = b.cloned().unwrap_or_default();
                let mut after = a.cloned().unwrap_or_default();
                if self.property_filter.is_some() {
                    before = self.filtered(&before);
                    after = self.filtered(&after);
                    if before == after {
                        return None;
                    }
                }
                Some(ObjectDiff {
                    object,
                    before,
                    after,
                })
            })
    }

    /// Flattened `(object, property, before, after)` sequence
    pub fn entries(&self) -> impl Iterator<Item = (O, P, Datum, Datum)> + '_ {
        self.iter().flat_map(|diff| {
            let object = diff.object.clone();
            diff.changes()
                .into_iter()
                .map(move |(p, b, a)| (object.clone(), p, b, a))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

impl<O: ObjectKey, P: Property> State<O, P> {
    /// Difference from `self` (before) to `other` (after)
    pub fn diff<'a>(&'a self, other: &'a State<O, P>) -> Diff<'a, O, P> {
        Diff {
            before: self,
            after: other,
            object_filter: None,
            property_filter: None,
        }
    }

    /// Objects whose properties differ between the two snapshots
    pub fn changed_objects(&self, other: &State<O, P>) -> Vec<O> {
        self.diff(other).iter().map(|d| d.object.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use ripple_core::UniverseId;

    use crate::state::tests::{int, Prop, TestState};

    fn build(writes: &[(u32, u8, i64)]) -> TestState {
        writes
            .iter()
            .fold(TestState::new(UniverseId(1)), |s, (o, p, v)| {
                s.set(o, &Prop::new(*p), int(*v))
            })
    }

    #[test]
    fn test_diff_reports_before_and_after() {
        let a = build(&[(1, 0, 5)]);
        let b = build(&[(1, 0, 6), (2, 1, 1)]);
        let entries: Vec<_> = a.diff(&b).entries().collect();
        assert_eq!(
            entries,
            vec![
                (1, Prop::new(0), int(5), int(6)),
                (2, Prop::new(1), int(0), int(1)),
            ]
        );
    }

    #[test]
    fn test_diff_is_restartable() {
        let a = build(&[]);
        let b = build(&[(1, 0, 5)]);
        let diff = a.diff(&b);
        assert_eq!(diff.iter().count(), 1);
        assert_eq!(diff.iter().count(), 1);
    }

    #[test]
    fn test_diff_filters() {
        let a = build(&[]);
        let b = build(&[(1, 0, 5), (1, 1, 5), (2, 0, 5)]);
        let by_object = a.diff(&b).objects(|o| *o == 2);
        assert_eq!(by_object.entries().count(), 1);
        let by_property = a.diff(&b).properties(|p| p.id == 1);
        assert_eq!(by_property.entries().count(), 1);
        let none = a.diff(&b).properties(|p| p.id == 9);
        assert!(none.is_empty());
    }

    proptest! {
        #[test]
        fn prop_diff_round_trip(
            left in proptest::collection::vec((0u32..8, 0u8..4, -3i64..3), 0..24),
            right in proptest::collection::vec((0u32..8, 0u8..4, -3i64..3), 0..24),
        ) {
            let a = build(&left);
            let b = build(&right);
            let replayed = a
                .diff(&b)
                .entries()
                .fold(a.clone(), |s, (o, p, _, after)| s.set(&o, &p, after));
            prop_assert_eq!(replayed, b);
        }

        #[test]
        fn prop_diff_with_self_is_empty(
            writes in proptest::collection::vec((0u32..8, 0u8..4, -3i64..3), 0..24),
        ) {
            let a = build(&writes);
            prop_assert!(a.diff(&a).is_empty());
        }
    }
}
