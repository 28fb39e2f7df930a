use crate::{
    app_protect::Configuration,
    app_protect_dos::DosConfiguration,
    reconciler::{Pass, Reconciler, Resolved},
    secrets::LocalSecretStore,
    store::{apply_object, Store},
    ControllerConfig, Queue, Stores,
};
use ingress_controller_core::{Kind, KindedKey, Operation, Reason, ResourceId, Task};
use ingress_controller_k8s_api::{
    configuration::{
        GlobalConfiguration, Policy, TransportServer, VirtualServer, VirtualServerRoute,
    },
    DynamicObject, Ingress, ResourceExt, Secret,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    time,
};

struct Harness {
    stores: Stores,
    reconciler: Reconciler,
}

impl Harness {
    fn new(config: ControllerConfig) -> Self {
        let stores = Stores::new();
        let secrets = LocalSecretStore::new(stores.secrets.clone(), config.secrets_dir.clone());
        let reconciler = Reconciler::new(
            Arc::new(config),
            stores.clone(),
            Box::new(secrets),
            Box::new(Configuration::new()),
            Box::new(DosConfiguration::new()),
        );
        Self { stores, reconciler }
    }

    fn synced(config: ControllerConfig) -> Self {
        let mut harness = Self::new(config);
        harness.reconciler.process(&Task::Resync);
        harness
    }

    fn apply<T>(&mut self, store: impl Fn(&Stores) -> &Arc<Store<T>>, kind: Kind, obj: T) -> Pass
    where
        T: ResourceExt,
    {
        let (_, obj) = apply_object(store(&self.stores), obj);
        let key = KindedKey::new(kind, crate::id_of(&*obj));
        self.reconciler.process(&Task::Resource(key))
    }

    fn delete(&mut self, kind: Kind, ns: &str, name: &str) -> Pass {
        let id = ResourceId::new(ns, name);
        match kind {
            Kind::VirtualServer => {
                self.stores.virtual_servers.delete(&id);
            }
            Kind::Secret => {
                self.stores.secrets.delete(&id);
            }
            kind => panic!("unexpected kind {kind}"),
        }
        self.reconciler
            .process(&Task::Resource(KindedKey::new(kind, id)))
    }
}

fn from_json<T: serde::de::DeserializeOwned>(value: Value) -> T {
    serde_json::from_value(value).expect("object must deserialize")
}

fn virtual_server(name: &str, created: &str, spec: Value) -> VirtualServer {
    from_json(json!({
        "apiVersion": "k8s.nginx.org/v1",
        "kind": "VirtualServer",
        "metadata": {
            "namespace": "default",
            "name": name,
            "generation": 1,
            "creationTimestamp": created,
        },
        "spec": spec,
    }))
}

fn ingress(name: &str, created: &str, annotations: Value, paths: &[&str]) -> Ingress {
    let paths = paths
        .iter()
        .map(|path| {
            json!({
                "path": path,
                "pathType": "Prefix",
                "backend": { "service": { "name": "coffee-svc", "port": { "number": 80 } } },
            })
        })
        .collect::<Vec<_>>();
    let rule = if paths.is_empty() {
        json!({ "host": "cafe.example.com" })
    } else {
        json!({ "host": "cafe.example.com", "http": { "paths": paths } })
    };
    from_json(json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "Ingress",
        "metadata": {
            "namespace": "default",
            "name": name,
            "creationTimestamp": created,
            "annotations": annotations,
        },
        "spec": { "rules": [rule] },
    }))
}

fn key(kind: Kind, name: &str) -> KindedKey {
    KindedKey::new(kind, ResourceId::new("default", name))
}

fn problems(pass: &Pass) -> Vec<(String, Reason, &str)> {
    pass.problems
        .iter()
        .map(|p| (p.object.to_string(), p.reason, p.message.as_str()))
        .collect()
}

fn changes(pass: &Pass) -> Vec<(Operation, String)> {
    pass.changes
        .iter()
        .map(|c| (c.op, c.resource.key().to_string()))
        .collect()
}

fn vs_key(name: &str) -> String {
    key(Kind::VirtualServer, name).to_string()
}

fn secrets(stores: &Stores) -> &Arc<Store<Secret>> {
    &stores.secrets
}

fn virtual_servers(stores: &Stores) -> &Arc<Store<VirtualServer>> {
    &stores.virtual_servers
}

fn virtual_server_routes(stores: &Stores) -> &Arc<Store<VirtualServerRoute>> {
    &stores.virtual_server_routes
}

fn ingresses(stores: &Stores) -> &Arc<Store<Ingress>> {
    &stores.ingresses
}

fn policies(stores: &Stores) -> &Arc<Store<Policy>> {
    &stores.policies
}

#[test]
fn waits_for_sync() {
    let mut harness = Harness::new(ControllerConfig::default());
    let pass = harness.apply(
        virtual_servers,
        Kind::VirtualServer,
        virtual_server("cafe", "2024-01-01T00:00:00Z", json!({ "host": "cafe.example.com" })),
    );
    assert!(pass.is_empty(), "{pass:?}");
    assert!(!harness.reconciler.is_synced());

    let pass = harness.reconciler.process(&Task::Resync);
    assert_eq!(
        changes(&pass),
        vec![(Operation::AddOrUpdate, vs_key("cafe"))]
    );
    assert_eq!(
        problems(&pass),
        vec![(
            vs_key("cafe"),
            Reason::AddedOrUpdated,
            "Configuration for VirtualServer default/cafe was added or updated"
        )]
    );

    // Nothing changed, but a resync reports everything again.
    let pass = harness.reconciler.process(&Task::Resync);
    assert!(pass.changes.is_empty());
    assert_eq!(pass.problems.len(), 1);
}

#[test]
fn oldest_host_claim_wins() {
    let mut harness = Harness::synced(ControllerConfig::default());
    let spec = json!({ "host": "cafe.example.com" });
    harness.apply(
        virtual_servers,
        Kind::VirtualServer,
        virtual_server("old", "2024-01-01T00:00:00Z", spec.clone()),
    );
    let pass = harness.apply(
        virtual_servers,
        Kind::VirtualServer,
        virtual_server("new", "2024-02-01T00:00:00Z", spec),
    );
    assert!(pass.changes.is_empty(), "the winner is unchanged");
    assert_eq!(
        problems(&pass),
        vec![(
            vs_key("new"),
            Reason::Rejected,
            "host cafe.example.com is taken by VirtualServer default/old"
        )]
    );

    let pass = harness.delete(Kind::VirtualServer, "default", "old");
    assert_eq!(
        changes(&pass),
        vec![
            (Operation::Delete, vs_key("old")),
            (Operation::AddOrUpdate, vs_key("new")),
        ]
    );
    assert_eq!(
        problems(&pass),
        vec![(
            vs_key("new"),
            Reason::AddedOrUpdated,
            "Configuration for VirtualServer default/new was added or updated"
        )]
    );
}

#[test]
fn deleted_loser_is_cleared_and_rejected_again_when_recreated() {
    let mut harness = Harness::synced(ControllerConfig::default());
    let spec = json!({ "host": "cafe.example.com" });
    harness.apply(
        virtual_servers,
        Kind::VirtualServer,
        virtual_server("old", "2024-01-01T00:00:00Z", spec.clone()),
    );
    let rejected = vec![(
        vs_key("new"),
        Reason::Rejected,
        "host cafe.example.com is taken by VirtualServer default/old",
    )];
    let pass = harness.apply(
        virtual_servers,
        Kind::VirtualServer,
        virtual_server("new", "2024-02-01T00:00:00Z", spec.clone()),
    );
    assert_eq!(problems(&pass), rejected);

    let pass = harness.delete(Kind::VirtualServer, "default", "new");
    assert!(pass.changes.is_empty(), "the loser was never applied");
    assert!(pass.problems.is_empty());
    assert_eq!(
        pass.cleared
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
        vec![vs_key("new")]
    );

    let pass = harness.apply(
        virtual_servers,
        Kind::VirtualServer,
        virtual_server("new", "2024-03-01T00:00:00Z", spec),
    );
    assert_eq!(problems(&pass), rejected);
    assert!(pass.cleared.is_empty());
}

#[test]
fn merges_minions_into_master() {
    let mut harness = Harness::synced(ControllerConfig::default());
    let master = json!({ "nginx.org/mergeable-ingress-type": "master" });
    let minion = json!({ "nginx.org/mergeable-ingress-type": "minion" });
    harness.apply(
        ingresses,
        Kind::Ingress,
        ingress("cafe-master", "2024-01-01T00:00:00Z", master, &[]),
    );
    harness.apply(
        ingresses,
        Kind::Ingress,
        ingress("coffee", "2024-01-02T00:00:00Z", minion.clone(), &["/coffee"]),
    );
    let pass = harness.apply(
        ingresses,
        Kind::Ingress,
        ingress("espresso", "2024-01-03T00:00:00Z", minion, &["/coffee"]),
    );
    assert!(pass.changes.is_empty(), "the rejected minion changes nothing");
    assert_eq!(
        problems(&pass),
        vec![(
            key(Kind::Ingress, "espresso").to_string(),
            Reason::Rejected,
            "path /coffee is already defined by Ingress default/coffee"
        )]
    );

    let applied = harness.reconciler.applied().collect::<Vec<_>>();
    assert_eq!(applied.len(), 1);
    let Resolved::Mergeable(mergeable) = applied[0] else {
        panic!("expected a mergeable ingress: {:?}", applied[0]);
    };
    assert_eq!(
        mergeable
            .minions
            .iter()
            .map(|m| m.ingress.object.name_any())
            .collect::<Vec<_>>(),
        vec!["coffee"]
    );
}

#[test]
fn missing_secret_is_resolved_when_added() {
    let mut harness = Harness::synced(ControllerConfig::default());
    let pass = harness.apply(
        virtual_servers,
        Kind::VirtualServer,
        virtual_server(
            "cafe",
            "2024-01-01T00:00:00Z",
            json!({ "host": "cafe.example.com", "tls": { "secret": "cafe-secret" } }),
        ),
    );
    assert_eq!(
        problems(&pass),
        vec![(
            vs_key("cafe"),
            Reason::MissingSecret,
            "VirtualServer default/cafe references Secret default/cafe-secret which does not exist"
        )]
    );

    let secret = from_json::<Secret>(json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": { "namespace": "default", "name": "cafe-secret" },
        "type": "kubernetes.io/tls",
        "stringData": { "tls.crt": "cert", "tls.key": "key" },
    }));
    let pass = harness.apply(secrets, Kind::Secret, secret);
    assert_eq!(
        changes(&pass),
        vec![(Operation::AddOrUpdate, vs_key("cafe"))]
    );
    assert_eq!(
        problems(&pass),
        vec![(
            vs_key("cafe"),
            Reason::AddedOrUpdated,
            "Configuration for VirtualServer default/cafe was added or updated"
        )]
    );

    // Deleting the secret reverts the server, which still depends on it.
    let pass = harness.delete(Kind::Secret, "default", "cafe-secret");
    assert_eq!(
        changes(&pass),
        vec![(Operation::AddOrUpdate, vs_key("cafe"))]
    );
    assert_eq!(pass.problems[0].reason, Reason::MissingSecret);
}

#[test]
fn deleted_secret_of_wrong_type_becomes_missing() {
    let mut harness = Harness::synced(ControllerConfig::default());
    let opaque = from_json::<Secret>(json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": { "namespace": "default", "name": "cafe-secret" },
        "type": "Opaque",
        "stringData": { "password": "hunter2" },
    }));
    harness.apply(secrets, Kind::Secret, opaque);

    let pass = harness.apply(
        virtual_servers,
        Kind::VirtualServer,
        virtual_server(
            "cafe",
            "2024-01-01T00:00:00Z",
            json!({ "host": "cafe.example.com", "tls": { "secret": "cafe-secret" } }),
        ),
    );
    assert_eq!(pass.problems.len(), 1);
    assert_eq!(
        pass.problems[0].message,
        "VirtualServer default/cafe references Secret default/cafe-secret of a wrong type \
         'Opaque', must be 'kubernetes.io/tls'"
    );

    // The cache loses the secret before any task for it is processed.
    harness
        .stores
        .secrets
        .delete(&ResourceId::new("default", "cafe-secret"));
    let pass = harness
        .reconciler
        .process(&Task::Resource(key(Kind::VirtualServer, "cafe")));
    assert_eq!(
        problems(&pass),
        vec![(
            vs_key("cafe"),
            Reason::MissingSecret,
            "VirtualServer default/cafe references Secret default/cafe-secret which does not exist"
        )]
    );
}

#[test]
fn rejection_names_the_resource_once() {
    let mut harness = Harness::synced(ControllerConfig::default());
    let pass = harness.apply(
        virtual_servers,
        Kind::VirtualServer,
        virtual_server("cafe", "2024-01-01T00:00:00Z", json!({ "host": "" })),
    );
    assert!(pass.changes.is_empty());
    assert_eq!(
        problems(&pass),
        vec![(
            vs_key("cafe"),
            Reason::Rejected,
            "VirtualServer default/cafe was rejected with error: spec.host: Required value"
        )]
    );
}

#[test]
fn invalid_policy_is_partially_applied() {
    let mut harness = Harness::synced(ControllerConfig::default());
    let policy = from_json::<Policy>(json!({
        "apiVersion": "k8s.nginx.org/v1",
        "kind": "Policy",
        "metadata": { "namespace": "default", "name": "jwt" },
        "spec": { "jwt": { "realm": "cafe", "secret": "jwk" } },
    }));
    harness.apply(policies, Kind::Policy, policy);

    let pass = harness.apply(
        virtual_servers,
        Kind::VirtualServer,
        virtual_server(
            "cafe",
            "2024-01-01T00:00:00Z",
            json!({ "host": "cafe.example.com", "policies": [{ "name": "jwt" }] }),
        ),
    );
    assert_eq!(
        changes(&pass),
        vec![(Operation::AddOrUpdate, vs_key("cafe"))]
    );
    let Resolved::VirtualServer(vs) = &pass.changes[0].resource else {
        panic!("expected a virtual server");
    };
    assert!(vs
        .dependencies
        .invalid_policies
        .contains(&ResourceId::new("default", "jwt")));
    assert_eq!(
        problems(&pass),
        vec![(
            vs_key("cafe"),
            Reason::MissingSecret,
            "JWT policy default/jwt references Secret default/jwk which does not exist"
        )]
    );
}

#[test]
fn unrelated_tasks_report_nothing() {
    let mut harness = Harness::synced(ControllerConfig::default());
    harness.apply(
        virtual_servers,
        Kind::VirtualServer,
        virtual_server("cafe", "2024-01-01T00:00:00Z", json!({ "host": "cafe.example.com" })),
    );

    let pass = harness
        .reconciler
        .process(&Task::Resource(key(Kind::Service, "tea-svc")));
    assert!(pass.is_empty(), "{pass:?}");
}

#[test]
fn app_protect_changes_are_emitted_before_sync() {
    let mut harness = Harness::new(ControllerConfig {
        enable_app_protect: true,
        ..Default::default()
    });
    let policy = from_json::<DynamicObject>(json!({
        "apiVersion": "appprotect.f5.com/v1beta1",
        "kind": "APPolicy",
        "metadata": { "namespace": "default", "name": "dataguard" },
        "spec": { "policy": {} },
    }));
    let pass = harness.apply(|s| &s.ap_policies, Kind::ApPolicy, policy);
    assert!(!harness.reconciler.is_synced());
    assert_eq!(
        changes(&pass),
        vec![(
            Operation::AddOrUpdate,
            key(Kind::ApPolicy, "dataguard").to_string()
        )]
    );
}

#[test]
fn orphaned_routes_are_reported() {
    let mut harness = Harness::synced(ControllerConfig::default());
    let vsr = from_json::<VirtualServerRoute>(json!({
        "apiVersion": "k8s.nginx.org/v1",
        "kind": "VirtualServerRoute",
        "metadata": { "namespace": "default", "name": "coffee" },
        "spec": {
            "host": "cafe.example.com",
            "subroutes": [{
                "path": "/coffee",
                "action": { "return": { "code": 200, "body": "ok" } },
            }],
        },
    }));
    let pass = harness.apply(virtual_server_routes, Kind::VirtualServerRoute, vsr);
    assert!(pass.changes.is_empty());
    assert_eq!(
        problems(&pass),
        vec![(
            key(Kind::VirtualServerRoute, "coffee").to_string(),
            Reason::NoVirtualServersFound,
            "VirtualServer is invalid or doesn't exist"
        )]
    );

    let pass = harness.apply(
        virtual_servers,
        Kind::VirtualServer,
        virtual_server(
            "cafe",
            "2024-01-01T00:00:00Z",
            json!({
                "host": "cafe.example.com",
                "routes": [{ "path": "/coffee", "route": "coffee" }],
            }),
        ),
    );
    assert_eq!(
        changes(&pass),
        vec![(Operation::AddOrUpdate, vs_key("cafe"))]
    );
    assert_eq!(
        problems(&pass),
        vec![
            (
                vs_key("cafe"),
                Reason::AddedOrUpdated,
                "Configuration for VirtualServer default/cafe was added or updated"
            ),
            (
                key(Kind::VirtualServerRoute, "coffee").to_string(),
                Reason::AddedOrUpdated,
                "Configuration for VirtualServerRoute default/coffee was added or updated"
            ),
        ]
    );
}

#[test]
fn other_classes_are_ignored() {
    let mut harness = Harness::synced(ControllerConfig::default());
    let pass = harness.apply(
        virtual_servers,
        Kind::VirtualServer,
        virtual_server(
            "cafe",
            "2024-01-01T00:00:00Z",
            json!({ "host": "cafe.example.com", "ingressClassName": "haproxy" }),
        ),
    );
    assert!(pass.is_empty(), "{pass:?}");
    assert_eq!(harness.reconciler.applied().count(), 0);
}

#[test]
fn transport_server_without_listener_is_rejected() {
    let gc = ResourceId::new("nginx-ingress", "nginx-configuration");
    let mut harness = Harness::synced(ControllerConfig {
        global_configuration: Some(gc),
        ..Default::default()
    });
    let pass = harness.apply(
        |s| &s.global_configurations,
        Kind::GlobalConfiguration,
        from_json::<GlobalConfiguration>(json!({
            "apiVersion": "k8s.nginx.org/v1alpha1",
            "kind": "GlobalConfiguration",
            "metadata": { "namespace": "nginx-ingress", "name": "nginx-configuration" },
            "spec": { "listeners": [{ "name": "dns-udp", "port": 5353, "protocol": "UDP" }] },
        })),
    );
    assert_eq!(
        changes(&pass),
        vec![(
            Operation::AddOrUpdate,
            "GlobalConfiguration/nginx-ingress/nginx-configuration".to_string()
        )]
    );

    let ts = from_json::<TransportServer>(json!({
        "apiVersion": "k8s.nginx.org/v1alpha1",
        "kind": "TransportServer",
        "metadata": { "namespace": "default", "name": "dns" },
        "spec": {
            "listener": { "name": "dns-tcp", "protocol": "TCP" },
            "upstreams": [{ "name": "dns", "service": "coredns", "port": 53 }],
            "action": { "pass": "dns" },
        },
    }));
    let pass = harness.apply(|s| &s.transport_servers, Kind::TransportServer, ts);
    assert!(pass.changes.is_empty());
    assert_eq!(
        problems(&pass),
        vec![(
            key(Kind::TransportServer, "dns").to_string(),
            Reason::Rejected,
            "Listener dns-tcp doesn't exist"
        )]
    );
}

#[tokio::test(flavor = "current_thread")]
async fn worker_runs_only_while_leading() {
    let harness = Harness::new(ControllerConfig::default());
    apply_object(
        &harness.stores.virtual_servers,
        virtual_server("cafe", "2024-01-01T00:00:00Z", json!({ "host": "cafe.example.com" })),
    );

    let queue = Queue::default();
    let (leader_tx, leader_rx) = watch::channel(false);
    let (passes_tx, mut passes_rx) = mpsc::channel(8);
    let worker = tokio::spawn(harness.reconciler.run(queue.clone(), leader_rx, passes_tx));

    queue.enqueue(Task::Resync);
    tokio::task::yield_now().await;
    assert!(passes_rx.try_recv().is_err(), "followers must not reconcile");
    assert_eq!(queue.len(), 1);

    leader_tx.send(true).expect("worker must be running");
    let pass = time::timeout(Duration::from_secs(1), passes_rx.recv())
        .await
        .expect("leader must reconcile")
        .expect("worker must be running");
    assert_eq!(
        changes(&pass),
        vec![(Operation::AddOrUpdate, vs_key("cafe"))]
    );

    queue.shutdown();
    time::timeout(Duration::from_secs(1), worker)
        .await
        .expect("worker must stop")
        .expect("worker must not panic");
}
