#[macro_use]
extern crate log;

use anyhow::Context;
use kube::{Client, api::GroupVersionKind};
use kube_reconcile_engine::{
    ControllerManager, RunArguments, StopSignal, informers::Informer,
    kube_informer::ReflectorInformer, predicates::ResourceVersionChanged,
    prometheus_exporter::start_prometheus_metrics_server,
};
use kube_reconcile_engine_apis::gvk_name;
use opentelemetry::global;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use std::{net::SocketAddr, sync::Arc, time::Duration};

/// Interval in which the work queue state of every controller is logged.
const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
struct Configuration {
    resources: Vec<GroupVersionKind>,
    namespace: Option<String>,
    controller_parallelism: usize,
    metrics_addr: SocketAddr,
}

impl Configuration {
    fn from_env() -> anyhow::Result<Self> {
        let resources = parse_resources(
            env_var("WATCH_RESOURCES")
                .unwrap_or_else(|| "v1/Pod".to_string())
                .as_str(),
        )?;
        let namespace = env_var("WATCH_NAMESPACE");
        match &namespace {
            Some(ns) => info!("Controller is only watching resources in namespace {}", ns),
            None => info!("Controller is watching resources in all namespaces"),
        }
        let controller_parallelism = match env_var("CONTROLLER_PARALLELISM") {
            Some(v) => v
                .parse()
                .with_context(|| format!("invalid CONTROLLER_PARALLELISM {:?}", v))?,
            None => 1,
        };
        let metrics_addr = env_var("METRICS_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
        let metrics_port = env_var("METRICS_LISTEN_PORT").unwrap_or_else(|| "9000".to_string());
        let metrics_addr = format!("{}:{}", metrics_addr, metrics_port).parse()?;
        Ok(Configuration {
            resources,
            namespace,
            controller_parallelism,
            metrics_addr,
        })
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse `group/version/Kind`, or `version/Kind` for the core group.
fn parse_resource(value: &str) -> anyhow::Result<GroupVersionKind> {
    let parts: Vec<&str> = value.trim().split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind::gvk("", version, kind))
        }
        [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind::gvk(group, version, kind))
        }
        _ => anyhow::bail!(
            "invalid resource {:?}, expected group/version/Kind or version/Kind",
            value
        ),
    }
}

fn parse_resources(value: &str) -> anyhow::Result<Vec<GroupVersionKind>> {
    value
        .split(',')
        .filter(|v| !v.trim().is_empty())
        .map(parse_resource)
        .collect()
}

/// Register an informer and a controller logging every change of objects of
/// type `gvk`.
async fn add_logging_controller(
    manager: &mut ControllerManager,
    client: Client,
    gvk: &GroupVersionKind,
    namespace: Option<&str>,
) -> anyhow::Result<()> {
    let informer = Arc::new(
        ReflectorInformer::discover(client, gvk, namespace)
            .await
            .with_context(|| format!("failed to discover {}", gvk_name(gvk)))?,
    );
    manager.add_informer_provider(gvk.clone(), informer.clone())?;
    let kind = gvk.kind.clone();
    let controller = manager
        .controller_builder()
        .name(format!("{}-logger", gvk.kind.to_lowercase()))
        .reconcile(move |key| {
            let current = informer.get(&key);
            let kind = kind.clone();
            async move {
                match current {
                    Some(obj) => info!(
                        "{} {} is at resource version {}",
                        kind,
                        key,
                        obj.metadata.resource_version.as_deref().unwrap_or_default()
                    ),
                    None => info!("{} {} was deleted", kind, key),
                }
                Ok::<(), anyhow::Error>(())
            }
        })
        .build();
    controller.watch(gvk, vec![Arc::new(ResourceVersionChanged)])?;
    info!("{} is watching {}", controller.name(), gvk_name(gvk));
    manager.add_controller(Arc::new(controller));
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let _ = rustls::crypto::ring::default_provider().install_default();
    let configuration = Configuration::from_env()?;

    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let meter_provider = SdkMeterProvider::builder().with_reader(exporter).build();
    global::set_meter_provider(meter_provider.clone());

    let client = Client::try_default().await?;
    let mut manager = ControllerManager::new();
    for gvk in configuration.resources.iter() {
        add_logging_controller(
            &mut manager,
            client.clone(),
            gvk,
            configuration.namespace.as_deref(),
        )
        .await?;
    }
    debug!("{}", manager);

    let controllers = manager.controllers().to_vec();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(METRICS_LOG_INTERVAL);
        loop {
            interval.tick().await;
            for c in controllers.iter() {
                match serde_json::to_string(&c.get_metrics()) {
                    Ok(m) => debug!("{}: {}", c.name(), m),
                    Err(e) => warn!("{}: failed to serialize metrics: {}", c.name(), e),
                }
            }
        }
    });

    let (handle, stop) = StopSignal::new();
    info!("start controllers ...");
    let running = manager.run_informers_and_controllers(RunArguments::new(
        configuration.controller_parallelism,
        stop,
    ));
    tokio::select! {
        r = tokio::signal::ctrl_c() => {
            r?;
            info!("received Ctrl-C, shutting down");
        }
        r = start_prometheus_metrics_server(configuration.metrics_addr, registry) => r?,
    };
    handle.stop();
    for controller in running {
        if let Err(e) = controller.await? {
            error!("{}", e);
        }
    }
    if let Err(e) = meter_provider.shutdown() {
        warn!("failed to shut down meter provider: {}", e);
    }
    Ok(())
}
