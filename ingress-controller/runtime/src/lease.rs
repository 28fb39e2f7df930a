use crate::{
    core::CONTROLLER_NAME,
    k8s::{self, ObjectMeta, Patch, PatchParams},
};
use anyhow::Result;
use k8s_openapi::api::coordination::v1 as coordv1;
use std::sync::Arc;
use tokio::{sync::watch, time};
use tracing::{info_span, Instrument};

const LEASE_DURATION: time::Duration = time::Duration::from_secs(30);
const RENEW_GRACE_PERIOD: time::Duration = time::Duration::from_secs(1);

/// Competes for the lease `name` and publishes whether `hostname` currently holds it.
pub async fn init<T>(
    runtime: &kubert::Runtime<T>,
    ns: &str,
    name: &str,
    hostname: &str,
) -> Result<watch::Receiver<bool>> {
    let lease = coordv1::Lease {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            // Specifying a resource version of "0" means that we will
            // only create the Lease if it does not already exist.
            resource_version: Some("0".to_string()),
            labels: Some(
                [(
                    "app.kubernetes.io/name".to_string(),
                    "nginx-ingress".to_string(),
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    };
    let api = k8s::Api::<coordv1::Lease>::namespaced(runtime.client(), ns);
    match api
        .patch(
            name,
            &PatchParams {
                field_manager: Some(CONTROLLER_NAME.to_string()),
                ..Default::default()
            },
            &Patch::Apply(lease),
        )
        .await
    {
        Ok(lease) => tracing::info!(?lease, "Created Lease resource"),
        Err(k8s::Error::Api(_)) => tracing::debug!("Lease already exists, no need to create it"),
        Err(error) => {
            return Err(error.into());
        }
    };

    let params = kubert::lease::ClaimParams {
        lease_duration: LEASE_DURATION,
        renew_grace_period: RENEW_GRACE_PERIOD,
    };
    let (claims, _task) = kubert::lease::LeaseManager::init(api, name)
        .await?
        .spawn(hostname, params)
        .await?;

    let (tx, rx) = watch::channel(false);
    tokio::spawn(
        leadership(claims, hostname.to_string(), tx).instrument(info_span!("leader", %hostname)),
    );
    Ok(rx)
}

/// Translates lease claims into a leadership flag until the claims or the flag's receivers go
/// away.
async fn leadership(
    mut claims: watch::Receiver<Arc<kubert::lease::Claim>>,
    hostname: String,
    tx: watch::Sender<bool>,
) {
    loop {
        let leading = claims.borrow_and_update().is_current_for(&hostname);
        let changed = tx.send_if_modified(|current| {
            let changed = *current != leading;
            *current = leading;
            changed
        });
        if changed {
            if leading {
                tracing::info!("Acquired leadership");
            } else {
                tracing::info!("Lost leadership");
            }
        }

        tokio::select! {
            res = claims.changed() => {
                if res.is_err() {
                    tracing::debug!("Lease claims closed");
                    return;
                }
            }
            _ = tx.closed() => return,
            // A claim expires without the claims changing when renewal stalls.
            _ = time::sleep(RENEW_GRACE_PERIOD) => {}
        }
    }
}
