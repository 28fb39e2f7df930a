//! Decides which resources own the hosts and listeners they claim.
//!
//! Candidates are filtered by ingress class and de-duplicated, then every host or listener is
//! awarded to the oldest claimant. Ties are broken by kind and then by key so that the outcome
//! does not depend on the order in which resources were observed.

use crate::config::ControllerConfig;
use ingress_controller_core::{KindedKey, Problem, Reason};
use ingress_controller_k8s_api::Time;
use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
    fmt,
};

/// Something a resource requires exclusive ownership of.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Claim {
    Host(String),
    Listener(String),
}

/// How an Ingress participates in a mergeable host. Other kinds are always standalone.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Standalone,
    /// Owns the host and its TLS settings, but no paths.
    Master,
    /// Contributes paths to the host of a master.
    Minion,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    pub key: KindedKey,
    pub generation: Option<i64>,
    pub created: Option<Time>,
    pub class: Option<String>,
    pub role: Role,
    pub claims: Vec<Claim>,
    /// Paths contributed by a minion.
    pub paths: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Resolution {
    /// Candidates that hold at least one claim, reduced to the claims they hold, in key order.
    pub winners: Vec<Candidate>,

    /// Minions attached to each winning master, oldest first.
    pub minions: BTreeMap<KindedKey, Vec<Candidate>>,

    /// Candidates whose class is handled by another controller.
    pub ignored: Vec<KindedKey>,

    pub problems: Vec<Problem>,
}

// === impl Claim ===

impl fmt::Display for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host(host) => write!(f, "host {host}"),
            Self::Listener(listener) => write!(f, "listener {listener}"),
        }
    }
}

// === impl Candidate ===

impl Candidate {
    pub fn new(key: KindedKey) -> Self {
        Self {
            key,
            generation: None,
            created: None,
            class: None,
            role: Role::Standalone,
            claims: Vec::new(),
            paths: Vec::new(),
        }
    }

    /// Orders candidates by how strongly they hold a claim. Lesser values win.
    ///
    /// Resources without a creation timestamp are treated as the newest.
    fn precedence(&self, other: &Self) -> Ordering {
        let created = match (&self.created, &other.created) {
            (Some(a), Some(b)) => a.0.cmp(&b.0),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        created
            .then_with(|| {
                self.key
                    .kind
                    .host_precedence()
                    .cmp(&other.key.kind.host_precedence())
            })
            .then_with(|| self.key.cmp(&other.key))
    }

    fn describe(&self) -> String {
        format!("{} {}", self.key.kind, self.key.id)
    }
}

/// Resolves competing claims.
///
/// Resolving the winners of a resolution again yields the same winners.
pub fn resolve(config: &ControllerConfig, candidates: Vec<Candidate>) -> Resolution {
    let mut resolution = Resolution::default();

    // Keep one entry per key, preferring the latest generation.
    let mut candidates = candidates;
    candidates.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| b.generation.cmp(&a.generation)));
    candidates.dedup_by(|a, b| a.key == b.key);

    let (candidates, ignored): (Vec<_>, Vec<_>) = candidates
        .into_iter()
        .partition(|c| config.accepts_class(c.class.as_deref()));
    resolution.ignored = ignored.into_iter().map(|c| c.key).collect();

    let (minions, contenders): (Vec<_>, Vec<_>) =
        candidates.into_iter().partition(|c| c.role == Role::Minion);

    // Award each claim to its strongest contender.
    let mut owners = BTreeMap::<&Claim, &Candidate>::new();
    for candidate in &contenders {
        for claim in &candidate.claims {
            owners
                .entry(claim)
                .and_modify(|owner| {
                    if candidate.precedence(*owner) == Ordering::Less {
                        *owner = candidate;
                    }
                })
                .or_insert(candidate);
        }
    }

    let mut winners = Vec::new();
    for candidate in &contenders {
        let mut held = Vec::new();
        let mut lost = Vec::new();
        for claim in &candidate.claims {
            match owners.get(claim) {
                Some(owner) if owner.key == candidate.key => held.push(claim.clone()),
                Some(owner) => lost.push(format!("{claim} is taken by {}", owner.describe())),
                None => {}
            }
        }

        if !lost.is_empty() {
            let reason = if held.is_empty() {
                Reason::Rejected
            } else {
                Reason::AddedOrUpdatedWithWarning
            };
            resolution
                .problems
                .push(Problem::new(candidate.key.clone(), reason, lost.join("; ")));
        }

        if !held.is_empty() || candidate.claims.is_empty() {
            winners.push(Candidate {
                claims: held,
                ..candidate.clone()
            });
        }
    }

    resolution.minions = attach_minions(&winners, minions, &mut resolution.problems);
    resolution.winners = winners;
    resolution
}

/// Attaches each minion to the master that owns its host, rejecting minions whose host has no
/// master and minions that repeat a path of an older minion.
fn attach_minions(
    winners: &[Candidate],
    mut minions: Vec<Candidate>,
    problems: &mut Vec<Problem>,
) -> BTreeMap<KindedKey, Vec<Candidate>> {
    let masters = winners
        .iter()
        .filter(|c| c.role == Role::Master)
        .flat_map(|c| c.claims.iter().map(move |claim| (claim, c)))
        .collect::<BTreeMap<_, _>>();

    minions.sort_by(|a, b| a.precedence(b));

    let mut attached = BTreeMap::<KindedKey, Vec<Candidate>>::new();
    let mut paths = BTreeMap::<(&KindedKey, &str), &KindedKey>::new();
    for minion in &minions {
        let Some(master) = minion.claims.iter().find_map(|claim| masters.get(claim)) else {
            problems.push(Problem::new(
                minion.key.clone(),
                Reason::NoIngressMasterFound,
                "Ingress master is invalid or doesn't exist",
            ));
            continue;
        };

        let taken = minion
            .paths
            .iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .find_map(|path| paths.get(&(&master.key, path.as_str())).map(|by| (path, by)));
        if let Some((path, by)) = taken {
            problems.push(Problem::new(
                minion.key.clone(),
                Reason::Rejected,
                format!("path {path} is already defined by {} {}", by.kind, by.id),
            ));
            continue;
        }

        for path in &minion.paths {
            paths.insert((&master.key, path.as_str()), &minion.key);
        }
        attached
            .entry(master.key.clone())
            .or_default()
            .push(minion.clone());
    }
    attached
}
