use ingress_controller_core::{Problem, Reason};
use ingress_controller_k8s_api::configuration::{
    ResourceStatus, STATE_INVALID, STATE_VALID, STATE_WARNING,
};

/// Derives a resource state from the reason of an event. Unknown reasons have no state.
pub fn status_from_reason(reason: &str) -> &'static str {
    match reason {
        "AddedOrUpdatedWithError" | "Rejected" | "NoVirtualServersFound" | "Missing Secret"
        | "UpdatedWithError" => STATE_INVALID,
        "AddedOrUpdatedWithWarning" | "UpdatedWithWarning" => STATE_WARNING,
        "AddedOrUpdated" | "Updated" => STATE_VALID,
        _ => "",
    }
}

pub fn format_warning_messages<S: AsRef<str>>(messages: &[S]) -> String {
    messages
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join("; ")
}

fn severity(reason: Reason) -> u8 {
    // An ignored route is still reported so that its owner can be fixed.
    if reason == Reason::Ignored {
        return 1;
    }
    match status_from_reason(reason.as_str()) {
        STATE_INVALID => 2,
        STATE_WARNING => 1,
        _ => 0,
    }
}

/// Summarizes the problems of one resource. The most severe problems determine the state and
/// reason; their messages are joined.
///
/// Returns `None` when no problem carries a state.
pub fn resource_status<'p>(
    problems: impl IntoIterator<Item = &'p Problem>,
) -> Option<ResourceStatus> {
    let problems = problems.into_iter().collect::<Vec<_>>();
    let worst = problems.iter().map(|p| severity(p.reason)).max()?;
    let worst = problems
        .into_iter()
        .filter(|p| severity(p.reason) == worst)
        .collect::<Vec<_>>();

    let reason = worst.first()?.reason;
    let state = if reason == Reason::Ignored {
        STATE_WARNING
    } else {
        status_from_reason(reason.as_str())
    };
    if state.is_empty() {
        return None;
    }

    let messages = worst.iter().map(|p| p.message.as_str()).collect::<Vec<_>>();
    Some(ResourceStatus {
        state: state.to_string(),
        reason: reason.as_str().to_string(),
        message: format_warning_messages(&messages),
    })
}
