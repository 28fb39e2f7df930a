use crate::{
    core::{reference::parse_namespace_name, Operation, ResourceId, Task},
    index::{
        self, app_protect, app_protect_dos, handlers, secrets::LocalSecretStore, ControllerConfig,
        Handler, Pass, Queue, QueueMetrics, Reconciler, Store, Stores,
    },
    k8s::{
        self,
        configuration::{
            DosProtectedResource, GlobalConfiguration, Policy, TransportServer, VirtualServer,
            VirtualServerRoute,
        },
        ApiResource, Client, DynamicObject,
    },
    lease, status,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::{future::Future, pin::Pin, sync::Arc};
use tokio::{
    sync::{mpsc, watch},
    time::{self, Duration},
};
use tracing::{info, info_span, instrument, Instrument};

// Passes are produced one task at a time; a small buffer is enough to decouple reporting.
const PASS_QUEUE_SIZE: usize = 16;

type Synced = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Parser)]
#[clap(name = "ingress", about = "An NGINX ingress resource controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "ingress_controller=info,warn",
        env = "INGRESS_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The class of Ingress, VirtualServer and TransportServer resources handled by this
    /// controller.
    #[clap(long, default_value = "nginx")]
    ingress_class: String,

    /// Ignores resources that do not declare a class.
    #[clap(long)]
    use_ingress_class_only: bool,

    /// The GlobalConfiguration resource, as <namespace>/<name>.
    #[clap(long, value_parser = parse_namespace_name)]
    global_configuration: Option<ResourceId>,

    /// The ConfigMap with the NGINX configuration, as <namespace>/<name>.
    #[clap(long, value_parser = parse_namespace_name)]
    nginx_configmaps: Option<ResourceId>,

    #[clap(long, default_value = "true", action = clap::ArgAction::Set)]
    enable_custom_resources: bool,

    #[clap(long)]
    enable_app_protect: bool,

    #[clap(long)]
    enable_app_protect_dos: bool,

    /// The IngressLink resource in the controller namespace.
    #[clap(long = "ingresslink")]
    ingress_link: Option<String>,

    #[clap(long, default_value = "nginx-ingress", env = "POD_NAMESPACE")]
    controller_namespace: String,

    /// The Service that exposes the controller, in the controller namespace.
    #[clap(long)]
    external_service: Option<String>,

    #[clap(long, default_value = "true", action = clap::ArgAction::Set)]
    enable_leader_election: bool,

    #[clap(long, default_value = "nginx-ingress-leader-election")]
    leader_election_lock_name: String,

    #[clap(long, default_value = "/etc/nginx/secrets")]
    secrets_dir: String,

    /// Seconds between full resyncs.
    #[clap(long, default_value = "30")]
    resync_period: u64,

    #[clap(long, default_value = "5000")]
    patch_timeout_ms: u64,

    /// Enables features only supported by NGINX Plus, such as ExternalName upstreams.
    #[clap(long)]
    nginx_plus: bool,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            ingress_class,
            use_ingress_class_only,
            global_configuration,
            nginx_configmaps,
            enable_custom_resources,
            enable_app_protect,
            enable_app_protect_dos,
            ingress_link,
            controller_namespace,
            external_service,
            enable_leader_election,
            leader_election_lock_name,
            secrets_dir,
            resync_period,
            patch_timeout_ms,
            nginx_plus,
        } = self;

        let config = Arc::new(ControllerConfig {
            ingress_class,
            use_ingress_class_only,
            global_configuration,
            config_map: nginx_configmaps,
            enable_custom_resources,
            enable_app_protect,
            enable_app_protect_dos,
            ingress_link,
            controller_namespace: controller_namespace.clone(),
            external_service,
            secrets_dir,
            is_nginx_plus: nginx_plus,
        });

        let stores = Stores::new();

        let mut prom = <Registry>::default();
        let controller_reg = prom.sub_registry_with_prefix("ingress_controller");
        let queue = Queue::new(QueueMetrics::register(controller_reg));
        index::metrics::register(controller_reg, stores.clone());
        let status_metrics =
            status::ControllerMetrics::register(prom.sub_registry_with_prefix("resource_status"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Without leader election this instance always leads. The sender is held until the
        // runtime exits so that the flag never closes.
        let (leader, _leader_tx) = if enable_leader_election {
            let hostname = std::env::var("HOSTNAME")
                .context("failed to fetch `HOSTNAME` environment variable")?;
            let leader = lease::init(
                &runtime,
                &controller_namespace,
                &leader_election_lock_name,
                &hostname,
            )
            .await?;
            (leader, None)
        } else {
            info!("Leader election is disabled");
            let (tx, rx) = watch::channel(true);
            (rx, Some(tx))
        };

        // Spawn resource watches. Every watched store must sync before the first resync.
        let mut synced = Vec::<Synced>::new();

        let ingresses = runtime.watch_all::<k8s::Ingress>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(
                Handler::new(stores.ingresses.clone(), queue.clone(), config.clone()).shared(),
                ingresses,
            )
            .instrument(info_span!("ingresses")),
        );
        synced.push(wait_synced(&stores.ingresses));

        let services = runtime.watch_all::<k8s::Service>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(
                Handler::new(stores.services.clone(), queue.clone(), config.clone()).shared(),
                services,
            )
            .instrument(info_span!("services")),
        );
        synced.push(wait_synced(&stores.services));

        let endpoints = runtime.watch_all::<k8s::Endpoints>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(
                Handler::new(stores.endpoints.clone(), queue.clone(), config.clone()).shared(),
                endpoints,
            )
            .instrument(info_span!("endpoints")),
        );
        synced.push(wait_synced(&stores.endpoints));

        let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(
                Handler::new(stores.pods.clone(), queue.clone(), config.clone()).shared(),
                pods,
            )
            .instrument(info_span!("pods")),
        );
        synced.push(wait_synced(&stores.pods));

        let secrets = runtime.watch_all::<k8s::Secret>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(
                Handler::new(stores.secrets.clone(), queue.clone(), config.clone()).shared(),
                secrets,
            )
            .instrument(info_span!("secrets")),
        );
        synced.push(wait_synced(&stores.secrets));

        if let Some(id) = config.config_map.as_ref() {
            let config_maps = runtime.watch_all::<k8s::ConfigMap>(only(id));
            tokio::spawn(
                kubert::index::namespaced(
                    Handler::new(stores.config_maps.clone(), queue.clone(), config.clone())
                        .shared(),
                    config_maps,
                )
                .instrument(info_span!("configmaps")),
            );
            synced.push(wait_synced(&stores.config_maps));
        }

        if config.enable_custom_resources {
            if api_resource_exists::<VirtualServer>(&runtime.client()).await {
                let virtual_servers =
                    runtime.watch_all::<VirtualServer>(watcher::Config::default());
                tokio::spawn(
                    kubert::index::namespaced(
                        Handler::new(stores.virtual_servers.clone(), queue.clone(), config.clone())
                            .shared(),
                        virtual_servers,
                    )
                    .instrument(info_span!("virtualservers")),
                );
                synced.push(wait_synced(&stores.virtual_servers));
            } else {
                tracing::warn!(
                    "virtualservers.k8s.nginx.org resource kind not found, skipping watches"
                );
            }

            if api_resource_exists::<VirtualServerRoute>(&runtime.client()).await {
                let virtual_server_routes =
                    runtime.watch_all::<VirtualServerRoute>(watcher::Config::default());
                tokio::spawn(
                    kubert::index::namespaced(
                        Handler::new(
                            stores.virtual_server_routes.clone(),
                            queue.clone(),
                            config.clone(),
                        )
                        .shared(),
                        virtual_server_routes,
                    )
                    .instrument(info_span!("virtualserverroutes")),
                );
                synced.push(wait_synced(&stores.virtual_server_routes));
            } else {
                tracing::warn!(
                    "virtualserverroutes.k8s.nginx.org resource kind not found, skipping watches"
                );
            }

            if api_resource_exists::<TransportServer>(&runtime.client()).await {
                let transport_servers =
                    runtime.watch_all::<TransportServer>(watcher::Config::default());
                tokio::spawn(
                    kubert::index::namespaced(
                        Handler::new(
                            stores.transport_servers.clone(),
                            queue.clone(),
                            config.clone(),
                        )
                        .shared(),
                        transport_servers,
                    )
                    .instrument(info_span!("transportservers")),
                );
                synced.push(wait_synced(&stores.transport_servers));
            } else {
                tracing::warn!(
                    "transportservers.k8s.nginx.org resource kind not found, skipping watches"
                );
            }

            if api_resource_exists::<Policy>(&runtime.client()).await {
                let policies = runtime.watch_all::<Policy>(watcher::Config::default());
                tokio::spawn(
                    kubert::index::namespaced(
                        Handler::new(stores.policies.clone(), queue.clone(), config.clone())
                            .shared(),
                        policies,
                    )
                    .instrument(info_span!("policies")),
                );
                synced.push(wait_synced(&stores.policies));
            } else {
                tracing::warn!("policies.k8s.nginx.org resource kind not found, skipping watches");
            }

            if let Some(id) = config.global_configuration.as_ref() {
                let global_configurations = runtime.watch_all::<GlobalConfiguration>(only(id));
                tokio::spawn(
                    kubert::index::namespaced(
                        Handler::new(
                            stores.global_configurations.clone(),
                            queue.clone(),
                            config.clone(),
                        )
                        .shared(),
                        global_configurations,
                    )
                    .instrument(info_span!("globalconfigurations")),
                );
                synced.push(wait_synced(&stores.global_configurations));
            }
        }

        let client = runtime.client();
        if config.enable_app_protect {
            let kinds = [
                (k8s::app_protect::ap_policy(), &stores.ap_policies, "appolicies"),
                (k8s::app_protect::ap_log_conf(), &stores.ap_log_confs, "aplogconfs"),
                (k8s::app_protect::ap_user_sig(), &stores.ap_user_sigs, "apusersigs"),
            ];
            for (ar, store, name) in kinds {
                synced.extend(watch_unstructured(&client, ar, store, &queue, &config, name).await);
            }
        }

        if config.enable_app_protect_dos {
            let kinds = [
                (
                    k8s::app_protect::ap_dos_policy(),
                    &stores.ap_dos_policies,
                    "apdospolicies",
                ),
                (
                    k8s::app_protect::ap_dos_log_conf(),
                    &stores.ap_dos_log_confs,
                    "apdoslogconfs",
                ),
            ];
            for (ar, store, name) in kinds {
                synced.extend(watch_unstructured(&client, ar, store, &queue, &config, name).await);
            }

            if api_resource_exists::<DosProtectedResource>(&client).await {
                let protected =
                    runtime.watch_all::<DosProtectedResource>(watcher::Config::default());
                tokio::spawn(
                    kubert::index::namespaced(
                        Handler::new(
                            stores.dos_protected_resources.clone(),
                            queue.clone(),
                            config.clone(),
                        )
                        .shared(),
                        protected,
                    )
                    .instrument(info_span!("dosprotectedresources")),
                );
                synced.push(wait_synced(&stores.dos_protected_resources));
            } else {
                tracing::warn!(
                    "dosprotectedresources.appprotectdos.f5.com resource kind not found, \
                     skipping watches"
                );
            }
        }

        if config.ingress_link.is_some() {
            synced.extend(
                watch_unstructured(
                    &client,
                    k8s::app_protect::ingress_link(),
                    &stores.ingress_links,
                    &queue,
                    &config,
                    "ingresslinks",
                )
                .await,
            );
        }

        // Resync once every watched store has synced, and periodically thereafter.
        tokio::spawn(
            resync(
                synced,
                queue.clone(),
                leader.clone(),
                Duration::from_secs(resync_period),
            )
            .instrument(info_span!("resync")),
        );

        // Build the status index which writes the outcome of reconciliation back to the
        // resources that carry a status.
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let status_index = status::Index::new(leader.clone(), updates_tx);

        let (passes_tx, passes_rx) = mpsc::channel(PASS_QUEUE_SIZE);
        let reconciler = Reconciler::new(
            config.clone(),
            stores.clone(),
            Box::new(LocalSecretStore::new(
                stores.secrets.clone(),
                config.secrets_dir.clone(),
            )),
            Box::new(app_protect::Configuration::new()),
            Box::new(app_protect_dos::DosConfiguration::new()),
        );
        tokio::spawn(
            reconciler
                .run(queue.clone(), leader.clone(), passes_tx)
                .instrument(info_span!("reconciler")),
        );
        tokio::spawn(report(passes_rx, status_index).instrument(info_span!("status_index")));

        let status_controller = status::Controller::new(
            client,
            leader,
            updates_rx,
            Duration::from_millis(patch_timeout_ms),
            status_metrics,
        );
        tokio::spawn(
            status_controller
                .process_updates()
                .instrument(info_span!("status_controller")),
        );

        // Stop handing out work once shutdown begins; the task in progress completes.
        let shutdown = runtime.shutdown_handle();
        tokio::spawn(async move {
            let release = shutdown.signaled().await;
            queue.shutdown();
            drop(release);
        });

        // Block the main thread on the shutdown signal. Once it fires, wait for the background
        // tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// Restricts a watch to the single object `id`.
fn only(id: &ResourceId) -> watcher::Config {
    watcher::Config::default().fields(&format!(
        "metadata.namespace={},metadata.name={}",
        id.namespace, id.name
    ))
}

fn wait_synced<T>(store: &Arc<Store<T>>) -> Synced
where
    T: Send + Sync + 'static,
{
    let store = store.clone();
    Box::pin(async move { store.wait_synced().await })
}

/// Watches an unstructured kind, returning a future that completes once its store has synced.
///
/// Kinds whose resource definition is not installed are skipped.
async fn watch_unstructured(
    client: &Client,
    ar: ApiResource,
    store: &Arc<Store<DynamicObject>>,
    queue: &Queue,
    config: &Arc<ControllerConfig>,
    name: &'static str,
) -> Option<Synced> {
    if !api_group_has_kind(client, &ar.api_version, &ar.kind).await {
        tracing::warn!("{}.{} resource kind not found, skipping watches", name, ar.group);
        return None;
    }

    let api = k8s::Api::<DynamicObject>::all_with(client.clone(), &ar);
    let span = info_span!("watch", kind = %ar.kind);
    let watch = k8s::resilient(watcher::watcher(api, watcher::Config::default())).instrument(span);
    let handler = Handler::new(store.clone(), queue.clone(), config.clone()).shared();
    tokio::spawn(handlers::run(handler, watch).instrument(info_span!("watch", %name)));
    Some(wait_synced(store))
}

#[instrument(skip_all)]
async fn resync(
    synced: Vec<Synced>,
    queue: Queue,
    mut leader: watch::Receiver<bool>,
    period: Duration,
) {
    for store in synced {
        store.await;
    }
    info!("Caches synced");
    queue.enqueue(Task::Resync);

    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            res = leader.changed() => {
                if res.is_err() {
                    return;
                }
                // Statuses are forgotten while following, so a new leader recomputes them.
                let leading = *leader.borrow_and_update();
                if !leading {
                    continue;
                }
                info!("Leading; resyncing");
            }
        }
        queue.enqueue(Task::Resync);
    }
}

/// Hands the outcome of each pass to the status index.
///
/// Rendering NGINX configuration is left to the consumer of the changes; here they are only
/// logged.
async fn report(mut passes: mpsc::Receiver<Pass>, mut status_index: status::Index) {
    while let Some(Pass {
        changes,
        problems,
        cleared,
    }) = passes.recv().await
    {
        // Rejected objects are never applied, so their deletion is only seen here.
        for key in &cleared {
            status_index.remove(key);
        }
        for change in &changes {
            let key = change.resource.key();
            match change.op {
                Operation::AddOrUpdate => info!(%key, "Configuration added or updated"),
                Operation::Delete => {
                    info!(%key, "Configuration deleted");
                    status_index.remove(&key);
                }
            }
        }
        status_index.report(&problems);
    }
    tracing::debug!("Passes closed");
}

async fn api_resource_exists<T>(client: &Client) -> bool
where
    T: k8s::Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    api_group_has_kind(client, &T::api_version(&dt), &T::kind(&dt)).await
}

async fn api_group_has_kind(client: &Client, api_version: &str, kind: &str) -> bool {
    client
        .list_api_group_resources(api_version)
        .await
        .ok()
        .iter()
        .flat_map(|r| r.resources.iter())
        .any(|r| r.kind == kind)
}
