use crate::{
    format_warning_messages, index::make_patch, resource_status, status_from_reason, Index,
    Update,
};
use ingress_controller_core::{Kind, KindedKey, Problem, Reason, ResourceId};
use ingress_controller_k8s_api::{self as k8s, configuration::ResourceStatus};
use pretty_assertions::assert_eq;
use rstest::rstest;
use tokio::sync::{mpsc, watch};

fn key(kind: Kind, name: &str) -> KindedKey {
    KindedKey::new(kind, ResourceId::new("default", name))
}

fn problem(kind: Kind, name: &str, reason: Reason, message: &str) -> Problem {
    Problem::new(key(kind, name), reason, message)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Update>) -> Vec<Update> {
    let mut updates = Vec::new();
    while let Ok(update) = rx.try_recv() {
        updates.push(update);
    }
    updates
}

#[rstest]
#[case("", "")]
#[case("AddedOrUpdatedWithError", "Invalid")]
#[case("Rejected", "Invalid")]
#[case("NoVirtualServersFound", "Invalid")]
#[case("Missing Secret", "Invalid")]
#[case("UpdatedWithError", "Invalid")]
#[case("AddedOrUpdatedWithWarning", "Warning")]
#[case("UpdatedWithWarning", "Warning")]
#[case("AddedOrUpdated", "Valid")]
#[case("Updated", "Valid")]
#[case("New State", "")]
fn derives_status_from_reason(#[case] reason: &str, #[case] expected: &str) {
    assert_eq!(status_from_reason(reason), expected);
}

#[test]
fn joins_warning_messages() {
    assert_eq!(
        format_warning_messages(&["Test warning", "Test warning 2"]),
        "Test warning; Test warning 2"
    );
    assert_eq!(format_warning_messages::<&str>(&[]), "");
}

#[test]
fn most_severe_problems_win() {
    let problems = [
        problem(Kind::VirtualServer, "cafe", Reason::AddedOrUpdatedWithWarning, "route ignored"),
        problem(Kind::VirtualServer, "cafe", Reason::MissingSecret, "secret missing"),
        problem(Kind::VirtualServer, "cafe", Reason::Rejected, "host taken"),
    ];
    assert_eq!(
        resource_status(&problems),
        Some(ResourceStatus {
            state: "Invalid".to_string(),
            reason: "Missing Secret".to_string(),
            message: "secret missing; host taken".to_string(),
        })
    );

    let ignored = [problem(
        Kind::VirtualServerRoute,
        "coffee",
        Reason::Ignored,
        "VirtualServer default/cafe ignores VirtualServerRoute",
    )];
    assert_eq!(
        resource_status(&ignored).map(|s| s.state),
        Some("Warning".to_string())
    );

    assert_eq!(resource_status(Vec::<&Problem>::new()), None);
}

#[test]
fn patches_carry_kind_and_status() {
    let status = ResourceStatus {
        state: "Valid".to_string(),
        reason: "AddedOrUpdated".to_string(),
        message: String::new(),
    };
    let patch = make_patch(&key(Kind::TransportServer, "dns"), &status);
    assert_eq!(
        patch,
        k8s::Patch::Merge(serde_json::json!({
            "apiVersion": "k8s.nginx.org/v1alpha1",
            "kind": "TransportServer",
            "status": { "state": "Valid", "reason": "AddedOrUpdated" },
        }))
    );
}

#[test]
fn only_the_leader_writes_status() {
    let (leader_tx, leader_rx) = watch::channel(false);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut index = Index::new(leader_rx, tx);

    let problems = [problem(
        Kind::VirtualServer,
        "cafe",
        Reason::AddedOrUpdated,
        "Configuration for VirtualServer default/cafe was added or updated",
    )];
    index.report(&problems);
    assert!(drain(&mut rx).is_empty());

    leader_tx.send(true).expect("index must hold the receiver");
    index.report(&problems);
    let updates = drain(&mut rx);
    assert_eq!(
        updates.iter().map(|u| u.key.clone()).collect::<Vec<_>>(),
        vec![key(Kind::VirtualServer, "cafe")]
    );
}

#[test]
fn unchanged_status_is_not_written_again() {
    let (_leader_tx, leader_rx) = watch::channel(true);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut index = Index::new(leader_rx, tx);

    let valid = problem(Kind::Policy, "jwt", Reason::AddedOrUpdated, "ok");
    index.report([&valid]);
    index.report([&valid]);
    assert_eq!(drain(&mut rx).len(), 1);

    let rejected = problem(Kind::Policy, "jwt", Reason::Rejected, "invalid");
    index.report([&rejected]);
    assert_eq!(drain(&mut rx).len(), 1);

    index.remove(&key(Kind::Policy, "jwt"));
    index.report([&rejected]);
    assert_eq!(drain(&mut rx).len(), 1, "removed statuses are written again");
}

#[test]
fn kinds_without_status_are_only_logged() {
    let (_leader_tx, leader_rx) = watch::channel(true);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut index = Index::new(leader_rx, tx);

    index.report(&[
        problem(Kind::Ingress, "cafe", Reason::Rejected, "invalid"),
        problem(Kind::Secret, "cafe-secret", Reason::Rejected, "invalid"),
    ]);
    assert!(drain(&mut rx).is_empty());
}
