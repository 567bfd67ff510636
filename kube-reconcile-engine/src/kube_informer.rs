//! [`Informer`] backed by a `kube_runtime` watcher and reflector store.

use crate::{
    errors::ControllerError,
    informers::{EventHandler, Informer},
    run::StopSignal,
};

use futures::{FutureExt, StreamExt, future::BoxFuture};
use kube::{
    Api, Client,
    api::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
};
use kube_reconcile_engine_apis::{ObservedObject, ReconcileKey, gvk_name};
use kube_runtime::{
    WatchStreamExt,
    reflector::{ObjectRef, Store, store::Writer},
    watcher::{self, Event, watcher},
};
use std::{
    collections::HashSet,
    pin::pin,
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

#[derive(Default)]
struct Shared {
    synced: AtomicBool,
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl Shared {
    fn handlers(&self) -> Vec<Arc<dyn EventHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Watches all objects of one type, optionally restricted to a namespace.
pub struct ReflectorInformer {
    name: String,
    api: Api<DynamicObject>,
    resource: ApiResource,
    store: Store<DynamicObject>,
    shared: Arc<Shared>,
    /// Taken by `run`, an informer runs at most once.
    reflector: Mutex<Option<Reflector>>,
}

impl ReflectorInformer {
    /// Informer for `object_type` with the resource name guessed from the
    /// kind. Use [`ReflectorInformer::discover`] for kinds with irregular
    /// plurals.
    pub fn new(client: Client, object_type: &GroupVersionKind, namespace: Option<&str>) -> Self {
        Self::with_resource(client, object_type, ApiResource::from_gvk(object_type), namespace)
    }

    /// Look up `object_type` on the API server. `namespace` is ignored for
    /// cluster scoped types.
    pub async fn discover(
        client: Client,
        object_type: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<Self, ControllerError> {
        let (resource, capabilities) = discovery::pinned_kind(&client, object_type).await?;
        let namespace = match capabilities.scope {
            Scope::Namespaced => namespace,
            Scope::Cluster => {
                if let Some(ns) = namespace {
                    debug!("{} is cluster scoped, ignoring namespace {}", gvk_name(object_type), ns);
                }
                None
            }
        };
        Ok(Self::with_resource(client, object_type, resource, namespace))
    }

    fn with_resource(
        client: Client,
        object_type: &GroupVersionKind,
        resource: ApiResource,
        namespace: Option<&str>,
    ) -> Self {
        let api = match namespace {
            Some(ns) => Api::namespaced_with(client, ns, &resource),
            None => Api::all_with(client, &resource),
        };
        let shared = Arc::new(Shared::default());
        let reflector = Reflector::new(resource.clone(), shared.clone());
        Self {
            name: gvk_name(object_type),
            api,
            store: reflector.writer.as_reader(),
            resource,
            shared,
            reflector: Mutex::new(Some(reflector)),
        }
    }
}

impl Informer for ReflectorInformer {
    fn has_synced(&self) -> bool {
        self.shared.synced.load(Ordering::SeqCst)
    }

    fn add_event_handler(&self, handler: Arc<dyn EventHandler>) {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    fn get(&self, key: &ReconcileKey) -> Option<Arc<DynamicObject>> {
        let mut object_ref = ObjectRef::new_with(key.name.as_str(), self.resource.clone());
        if !key.is_cluster_scoped() {
            object_ref = object_ref.within(key.namespace.as_str());
        }
        self.store.get(&object_ref)
    }

    fn run(&self, stop: StopSignal) -> BoxFuture<'static, ()> {
        let reflector = self
            .reflector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let name = self.name.clone();
        let api = self.api.clone();
        async move {
            let Some(mut reflector) = reflector else {
                warn!("informer for {} is already running", name);
                return;
            };
            debug!("watching {}", name);
            let mut events = pin!(watcher(api, watcher::Config::default()).default_backoff());
            loop {
                tokio::select! {
                    _ = stop.stopped() => break,
                    event = events.next() => match event {
                        Some(Ok(event)) => reflector.handle(event),
                        Some(Err(e)) => warn!("watch of {} failed: {}", name, e),
                        None => break,
                    },
                }
            }
            debug!("stopped watching {}", name);
        }
        .boxed()
    }
}

/// Applies watch events to the store and translates them into handler calls.
struct Reflector {
    resource: ApiResource,
    writer: Writer<DynamicObject>,
    store: Store<DynamicObject>,
    shared: Arc<Shared>,
    /// Objects listed since the last `Init`.
    listed: HashSet<ObjectRef<DynamicObject>>,
}

impl Reflector {
    fn new(resource: ApiResource, shared: Arc<Shared>) -> Self {
        let writer = Writer::new(resource.clone());
        Self {
            store: writer.as_reader(),
            writer,
            resource,
            shared,
            listed: HashSet::new(),
        }
    }

    fn object_ref(&self, obj: &DynamicObject) -> ObjectRef<DynamicObject> {
        ObjectRef::from_obj_with(obj, self.resource.clone())
    }

    fn applied(&self, obj: &DynamicObject) {
        let obj = Arc::new(obj.clone());
        // The store still holds the previous state, the writer only swaps in
        // re-listed objects on `InitDone`.
        match self.store.get(&self.object_ref(&obj)) {
            Some(old) => {
                for h in self.shared.handlers() {
                    h.on_update(old.clone(), obj.clone());
                }
            }
            None => {
                for h in self.shared.handlers() {
                    h.on_add(obj.clone());
                }
            }
        }
    }

    fn handle(&mut self, event: Event<DynamicObject>) {
        match &event {
            Event::Init => self.listed.clear(),
            Event::InitApply(obj) => {
                let object_ref = self.object_ref(obj);
                self.listed.insert(object_ref);
                self.applied(obj);
            }
            Event::Apply(obj) => self.applied(obj),
            Event::Delete(obj) => {
                let obj = Arc::new(obj.clone());
                for h in self.shared.handlers() {
                    h.on_delete(ObservedObject::Live(obj.clone()));
                }
            }
            Event::InitDone => {
                // Deleted while the watch was down, only the last known
                // state is left.
                for gone in self
                    .store
                    .state()
                    .into_iter()
                    .filter(|o| !self.listed.contains(&self.object_ref(o)))
                {
                    for h in self.shared.handlers() {
                        h.on_delete(ObservedObject::Tombstone(gone.clone()));
                    }
                }
                self.listed.clear();
            }
        }
        self.writer.apply_watcher_event(&event);
        if matches!(event, Event::InitDone) && !self.shared.synced.swap(true, Ordering::SeqCst) {
            debug!("{}/{} synced", self.resource.api_version, self.resource.kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{object, pod_type};
    use http_body_util::Full;
    use hyper::{Response, body::Bytes, server::conn::http1, service::service_fn};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use tokio::net::TcpListener;

    const EXAMPLE_RESOURCES: &str = r#"{
        "kind": "APIResourceList",
        "apiVersion": "v1",
        "groupVersion": "example.com/v1",
        "resources": [
            {"name": "widgets", "singularName": "widget", "namespaced": true, "kind": "Widget", "verbs": ["list", "watch"]},
            {"name": "widgets/status", "singularName": "", "namespaced": true, "kind": "Widget", "verbs": ["get"]},
            {"name": "gadgetries", "singularName": "gadgetry", "namespaced": false, "kind": "Gadget", "verbs": ["list", "watch"]}
        ]
    }"#;

    /// Client of an API server answering every request with `body`.
    async fn api_server(body: &'static str) -> Client {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let service = service_fn(move |_req| async move {
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                });
                tokio::spawn(http1::Builder::new().serve_connection(TokioIo::new(stream), service));
            }
        });
        let config = kube::Config::new(format!("http://{}", addr).parse().unwrap());
        Client::try_from(config).unwrap()
    }

    fn example(kind: &str) -> GroupVersionKind {
        GroupVersionKind::gvk("example.com", "v1", kind)
    }

    #[tokio::test]
    async fn discovery_resolves_plural_and_scope() {
        let client = api_server(EXAMPLE_RESOURCES).await;
        let widgets = ReflectorInformer::discover(client.clone(), &example("Widget"), Some("default"))
            .await
            .unwrap();
        assert_eq!(
            "/apis/example.com/v1/namespaces/default/widgets",
            widgets.api.resource_url()
        );

        // the namespace does not apply to cluster scoped types
        let gadgets = ReflectorInformer::discover(client.clone(), &example("Gadget"), Some("default"))
            .await
            .unwrap();
        assert_eq!("gadgetries", gadgets.resource.plural);
        assert_eq!("/apis/example.com/v1/gadgetries", gadgets.api.resource_url());

        assert!(matches!(
            ReflectorInformer::discover(client, &example("Unknown"), None).await,
            Err(ControllerError::KubeApi(_))
        ));
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    fn name(obj: &DynamicObject) -> String {
        obj.metadata.name.clone().unwrap_or_default()
    }

    impl EventHandler for Recorder {
        fn on_add(&self, obj: Arc<DynamicObject>) {
            self.events.lock().unwrap().push(format!("add {}", name(&obj)));
        }

        fn on_update(&self, old: Arc<DynamicObject>, new: Arc<DynamicObject>) {
            self.events.lock().unwrap().push(format!(
                "update {} {:?}->{:?}",
                name(&new),
                old.metadata.resource_version,
                new.metadata.resource_version
            ));
        }

        fn on_delete(&self, obj: ObservedObject) {
            let kind = if obj.is_tombstone() { "tombstone" } else { "delete" };
            self.events
                .lock()
                .unwrap()
                .push(format!("{} {}", kind, name(obj.object())));
        }
    }

    fn reflector() -> (Reflector, Arc<Recorder>) {
        let shared = Arc::new(Shared::default());
        let recorder = Arc::new(Recorder::default());
        shared.handlers.write().unwrap().push(recorder.clone());
        (
            Reflector::new(ApiResource::from_gvk(&pod_type()), shared),
            recorder,
        )
    }

    fn pod(name: &str, resource_version: &str) -> DynamicObject {
        let mut o = object(&pod_type(), "default", name, name);
        o.metadata.resource_version = Some(resource_version.to_string());
        o
    }

    #[test]
    fn initial_list_syncs() {
        let (mut r, recorder) = reflector();
        r.handle(Event::Init);
        r.handle(Event::InitApply(pod("a", "1")));
        assert!(!r.shared.synced.load(Ordering::SeqCst));
        r.handle(Event::InitDone);
        assert!(r.shared.synced.load(Ordering::SeqCst));
        assert_eq!(vec!["add a"], recorder.take());
        let key = ObjectRef::new_with("a", r.resource.clone()).within("default");
        assert!(r.store.get(&key).is_some());
    }

    #[test]
    fn watch_events_are_dispatched() {
        let (mut r, recorder) = reflector();
        r.handle(Event::Init);
        r.handle(Event::InitDone);
        r.handle(Event::Apply(pod("a", "1")));
        r.handle(Event::Apply(pod("a", "2")));
        r.handle(Event::Delete(pod("a", "3")));
        assert_eq!(
            vec![
                "add a",
                r#"update a Some("1")->Some("2")"#,
                "delete a",
            ],
            recorder.take()
        );
    }

    #[test]
    fn relist_reports_missed_deletions_as_tombstones() {
        let (mut r, recorder) = reflector();
        r.handle(Event::Init);
        r.handle(Event::InitApply(pod("a", "1")));
        r.handle(Event::InitApply(pod("b", "1")));
        r.handle(Event::InitDone);
        recorder.take();

        // watch restarted, `b` was deleted in the meantime
        r.handle(Event::Init);
        r.handle(Event::InitApply(pod("a", "2")));
        r.handle(Event::InitDone);
        assert_eq!(
            vec![r#"update a Some("1")->Some("2")"#, "tombstone b"],
            recorder.take()
        );
        let b = ObjectRef::new_with("b", r.resource.clone()).within("default");
        assert!(r.store.get(&b).is_none());
    }
}
