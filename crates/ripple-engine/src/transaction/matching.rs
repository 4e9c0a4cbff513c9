//! Identity matching of constructed objects
//!
//! When an observer writes a newable that is equivalent to the one it
//! replaces (same type and identity, or both anonymous), the old object is
//! kept and the new one is recorded as replaced by it. Downstream state
//! attached to the old object therefore survives a re-derivation.

use std::sync::Arc;

use ripple_core::EngineResult;
use ripple_state::Datum;
use tracing::debug;

use super::leaf::LeafTx;
use crate::newable::Key;
use crate::setable::{constructions_setable, replacing_setable};
use crate::{Mutable, SetableRef};

/// Matching view of one newable
#[derive(Clone, Debug)]
pub struct MatchInfo {
    pub newable: Mutable,
    pub newable_type: Arc<str>,
    pub identity: Option<Key>,
    pub sort_key: Key,
    pub direct: bool,
    /// Still has a reason to exist
    pub justified: bool,
}

impl MatchInfo {
    /// `None` for mutables that were not constructed
    pub fn of(newable: &Mutable, justified: bool) -> Option<Self> {
        let info = newable.newable_info()?;
        Some(MatchInfo {
            newable: newable.clone(),
            newable_type: info.newable_type.clone(),
            identity: info.identity.clone(),
            sort_key: info.sort_key.clone(),
            direct: info.direct,
            justified: justified || info.direct,
        })
    }

    /// Whether this (older) newable should take the place of `new`
    pub fn must_replace(&self, new: &MatchInfo) -> bool {
        if self.newable == new.newable || self.newable_type != new.newable_type {
            return false;
        }
        match (&self.identity, &new.identity) {
            (Some(old), Some(fresh)) => old == fresh,
            (None, None) => !new.direct,
            _ => false,
        }
    }
}

fn info(tx: &LeafTx<'_>, newable: &Mutable) -> Option<MatchInfo> {
    let justified = !constructions_setable().get(&tx.state, newable).is_empty()
        || tx
            .run
            .as_ref()
            .is_some_and(|run| run.constructed.values().any(|made| made == newable));
    MatchInfo::of(newable, justified)
}

/// Reconcile the newables in a write against the value it overwrites
pub(crate) fn match_newables(
    tx: &mut LeafTx<'_>,
    object: &Mutable,
    setable: &SetableRef,
    old: &Datum,
    new: Datum,
) -> EngineResult<Datum> {
    let before = setable.mutables_of(old);
    let after = setable.mutables_of(&new);
    if !before.iter().chain(after.iter()).any(Mutable::is_newable) {
        return Ok(new);
    }
    let matched = if setable.is_collection() {
        many_match(tx, setable, &before, &after, new)?
    } else {
        single_match(tx, setable, &before, &after, old, new)?
    };
    if tx.ctx.config.trace_matching {
        debug!(object = %object, setable = %setable, value = %matched.describe(), "matched newables");
    }
    Ok(matched)
}

fn single_match(
    tx: &mut LeafTx<'_>,
    setable: &SetableRef,
    before: &[Mutable],
    after: &[Mutable],
    old: &Datum,
    new: Datum,
) -> EngineResult<Datum> {
    let (Some(previous), Some(candidate)) = (
        before.first().and_then(|m| info(&*tx, m)),
        after.first().and_then(|m| info(&*tx, m)),
    ) else {
        return Ok(new);
    };
    if previous.newable == candidate.newable {
        return Ok(new);
    }
    if !candidate.justified {
        return Ok(old.clone());
    }
    if previous.must_replace(&candidate) {
        replace(tx, &candidate, &previous)?;
        return Ok(setable
            .replace_in(&new, &candidate.newable, &previous.newable)
            .unwrap_or(new));
    }
    Ok(new)
}

fn many_match(
    tx: &mut LeafTx<'_>,
    setable: &SetableRef,
    before: &[Mutable],
    after: &[Mutable],
    new: Datum,
) -> EngineResult<Datum> {
    let mut value = new;
    let mut removed: Vec<MatchInfo> = before
        .iter()
        .filter(|m| !after.contains(m))
        .filter_map(|m| info(&*tx, m))
        .collect();
    let mut added: Vec<MatchInfo> = after
        .iter()
        .filter(|m| !before.contains(m))
        .filter_map(|m| info(&*tx, m))
        .collect();
    removed.sort_by(|a, b| a.sort_key.cmp(&b.sort_key));
    added.sort_by(|a, b| a.sort_key.cmp(&b.sort_key));

    for candidate in added {
        if !candidate.justified {
            if let Some(without) = setable.remove_from(&value, &candidate.newable) {
                value = without;
            }
            continue;
        }
        let position = removed
            .iter()
            .position(|old| old.identity.is_some() && old.must_replace(&candidate))
            .or_else(|| removed.iter().position(|old| old.must_replace(&candidate)));
        if let Some(position) = position {
            let previous = removed.remove(position);
            replace(tx, &candidate, &previous)?;
            if let Some(replaced) = setable.replace_in(&value, &candidate.newable, &previous.newable) {
                value = replaced;
            }
        }
    }
    Ok(value)
}

/// Keep `previous` in place of `candidate`
fn replace(tx: &mut LeafTx<'_>, candidate: &MatchInfo, previous: &MatchInfo) -> EngineResult<()> {
    if let Some(run) = tx.run.as_mut() {
        let retarget: Vec<_> = run
            .constructed
            .iter()
            .filter(|(_, made)| **made == candidate.newable)
            .map(|(reason, _)| reason.clone())
            .collect();
        for reason in retarget {
            run.constructed.insert(reason, previous.newable.clone());
        }
    }
    tx.write(
        &candidate.newable,
        replacing_setable().setable_ref(),
        Datum::new(Some(previous.newable.clone())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::newable::NewableSpec;
    use crate::MutableClass;
    use ripple_core::ObjectId;

    fn made(class: &Arc<crate::MutableClass>, id: u64, identity: Option<&str>, direct: bool) -> MatchInfo {
        let mut spec = NewableSpec::new(class, format!("n{}", id));
        if let Some(identity) = identity {
            spec = spec.identity(identity);
        }
        let newable = spec.build(ObjectId(id | ObjectId::DERIVED), direct);
        MatchInfo::of(&newable, true).unwrap()
    }

    #[test]
    fn test_same_identity_is_replaced() {
        let class = MutableClass::plain("Item");
        let old = made(&class, 1, Some("k"), false);
        let new = made(&class, 2, Some("k"), false);
        assert!(old.must_replace(&new));
        assert!(!old.must_replace(&made(&class, 3, Some("other"), false)));
        assert!(!old.must_replace(&old));
    }

    #[test]
    fn test_anonymous_match_excludes_direct() {
        let class = MutableClass::plain("Item");
        let old = made(&class, 1, None, false);
        assert!(old.must_replace(&made(&class, 2, None, false)));
        assert!(!old.must_replace(&made(&class, 3, None, true)));
        assert!(!old.must_replace(&made(&class, 4, Some("k"), false)));
    }

    #[test]
    fn test_types_must_agree() {
        let items = MutableClass::plain("Item");
        let others = MutableClass::plain("Other");
        let old = made(&items, 1, Some("k"), false);
        assert!(!old.must_replace(&made(&others, 2, Some("k"), false)));
    }

    #[test]
    fn test_plain_mutables_have_no_match_info() {
        let class = MutableClass::plain("Item");
        assert!(MatchInfo::of(&Mutable::new(&class, "plain"), true).is_none());
    }
}
