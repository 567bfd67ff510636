use kube::api::DynamicObject;
use kube_reconcile_engine_apis::ObservedObject;

/// Gate deciding whether an event is enqueued at all.
///
/// Predicates bound with the same watch are AND-combined.
pub trait Predicate: Send + Sync {
    fn handle_create(&self, _obj: &DynamicObject) -> bool {
        true
    }

    fn handle_update(&self, _old: &DynamicObject, _new: &DynamicObject) -> bool {
        true
    }

    fn handle_delete(&self, _obj: &ObservedObject) -> bool {
        true
    }
}

/// Drops updates which did not change the object's resource version, e.g.
/// the periodic re-list of an informer.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResourceVersionChanged;

impl Predicate for ResourceVersionChanged {
    fn handle_update(&self, old: &DynamicObject, new: &DynamicObject) -> bool {
        old.metadata.resource_version != new.metadata.resource_version
    }
}

type CreateFn = Box<dyn Fn(&DynamicObject) -> bool + Send + Sync>;
type UpdateFn = Box<dyn Fn(&DynamicObject, &DynamicObject) -> bool + Send + Sync>;
type DeleteFn = Box<dyn Fn(&ObservedObject) -> bool + Send + Sync>;

/// [`Predicate`] built from closures, unset ones let the event pass.
#[derive(Default)]
pub struct PredicateFuncs {
    create: Option<CreateFn>,
    update: Option<UpdateFn>,
    delete: Option<DeleteFn>,
}

impl PredicateFuncs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_create(
        mut self,
        f: impl Fn(&DynamicObject) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.create = Some(Box::new(f));
        self
    }

    pub fn on_update(
        mut self,
        f: impl Fn(&DynamicObject, &DynamicObject) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    pub fn on_delete(
        mut self,
        f: impl Fn(&ObservedObject) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.delete = Some(Box::new(f));
        self
    }
}

impl Predicate for PredicateFuncs {
    fn handle_create(&self, obj: &DynamicObject) -> bool {
        self.create.as_ref().is_none_or(|f| f(obj))
    }

    fn handle_update(&self, old: &DynamicObject, new: &DynamicObject) -> bool {
        self.update.as_ref().is_none_or(|f| f(old, new))
    }

    fn handle_delete(&self, obj: &ObservedObject) -> bool {
        self.delete.as_ref().is_none_or(|f| f(obj))
    }
}
