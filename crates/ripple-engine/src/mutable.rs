//! Mutables: nodes of the containment tree
//!
//! A [`Mutable`] is a cheap handle. Its parent link is an ordinary property
//! (`parent_setable()`), so moving a node is a state change like any other.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use ripple_core::ObjectId;

use crate::newable::NewableInfo;
use crate::setable::{parent_setable, SetableRef};
use crate::{Observer, State, Value};

/// Class of a mutable: the observers that run on every instance and the
/// setables that define its structure
pub struct MutableClass {
    name: Arc<str>,
    observers: Vec<Observer>,
    setables: Vec<SetableRef>,
    containments: Vec<SetableRef>,
}

impl MutableClass {
    pub fn builder(name: impl Into<Arc<str>>) -> MutableClassBuilder {
        MutableClassBuilder {
            class: MutableClass {
                name: name.into(),
                observers: Vec::new(),
                setables: Vec::new(),
                containments: Vec::new(),
            },
        }
    }

    /// Class without observers or declared setables
    pub fn plain(name: impl Into<Arc<str>>) -> Arc<MutableClass> {
        Self::builder(name).build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn observers(&self) -> &[Observer] {
        &self.observers
    }

    /// Declared setables, checked by the consistency pass
    pub fn setables(&self) -> &[SetableRef] {
        &self.setables
    }

    /// Setables whose values are the children of an instance
    pub fn containments(&self) -> &[SetableRef] {
        &self.containments
    }
}

impl fmt::Debug for MutableClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutableClass")
            .field("name", &self.name)
            .field("observers", &self.observers.len())
            .field("setables", &self.setables)
            .finish()
    }
}

pub struct MutableClassBuilder {
    class: MutableClass,
}

impl MutableClassBuilder {
    pub fn observer(mut self, observer: &Observer) -> Self {
        self.class.observers.push(observer.clone());
        self
    }

    pub fn setable(mut self, setable: &impl AsRef<SetableRef>) -> Self {
        let setable = setable.as_ref().clone();
        if setable.is_containment() {
            self.class.containments.push(setable.clone());
        }
        self.class.setables.push(setable);
        self
    }

    pub fn build(self) -> Arc<MutableClass> {
        Arc::new(self.class)
    }
}

struct MutableData {
    id: ObjectId,
    class: Arc<MutableClass>,
    name: Arc<str>,
    newable: Option<NewableInfo>,
}

/// Handle to a node of the model. Equality, order and hash use the id.
#[derive(Clone)]
pub struct Mutable(Arc<MutableData>);

impl Mutable {
    pub fn new(class: &Arc<MutableClass>, name: impl Into<Arc<str>>) -> Self {
        Self::with_id(ObjectId::next(), class, name)
    }

    pub fn with_id(id: ObjectId, class: &Arc<MutableClass>, name: impl Into<Arc<str>>) -> Self {
        Mutable(Arc::new(MutableData {
            id,
            class: class.clone(),
            name: name.into(),
            newable: None,
        }))
    }

    pub(crate) fn newable(
        id: ObjectId,
        class: &Arc<MutableClass>,
        name: impl Into<Arc<str>>,
        info: NewableInfo,
    ) -> Self {
        Mutable(Arc::new(MutableData {
            id,
            class: class.clone(),
            name: name.into(),
            newable: Some(info),
        }))
    }

    #[inline]
    pub fn id(&self) -> ObjectId {
        self.0.id
    }

    pub fn class(&self) -> &Arc<MutableClass> {
        &self.0.class
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn newable_info(&self) -> Option<&NewableInfo> {
        self.0.newable.as_ref()
    }

    pub fn is_newable(&self) -> bool {
        self.0.newable.is_some()
    }

    /// Same allocation, not just the same id
    pub fn ptr_eq(&self, other: &Mutable) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn parent(&self, state: &State) -> Option<Parent> {
        parent_setable().get(state, self)
    }

    /// Chain of ancestors, nearest first
    pub fn ancestors(&self, state: &State) -> Vec<Mutable> {
        let mut result = Vec::new();
        let mut current = self.parent(state);
        while let Some(parent) = current {
            if parent.mutable == *self || result.contains(&parent.mutable) {
                break;
            }
            current = parent.mutable.parent(state);
            result.push(parent.mutable);
        }
        result
    }

    /// Children found through the class containment setables
    pub fn children(&self, state: &State) -> Vec<Mutable> {
        self.class()
            .containments()
            .iter()
            .flat_map(|containing| containing.mutables_of(&state.get(self, containing)))
            .collect()
    }
}

impl PartialEq for Mutable {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Mutable {}

impl PartialOrd for Mutable {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Mutable {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.id.cmp(&other.0.id)
    }
}

impl Hash for Mutable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for Mutable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.0.name, self.0.id)
    }
}

impl fmt::Display for Mutable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.name)
    }
}

/// Parent link: the containing mutable and the setable that holds the child
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Parent {
    pub mutable: Mutable,
    pub containing: SetableRef,
}

impl Value for Parent {}
