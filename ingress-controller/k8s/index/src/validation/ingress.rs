use super::{is_dns1123_subdomain, ValidationError, Violations};
use crate::store::id_of;
use ingress_controller_core::Kind;
use ingress_controller_k8s_api::{Ingress, ResourceExt, MERGEABLE_INGRESS_TYPE_ANNOTATION};

/// Validates an Ingress, including the constraints of mergeable masters and minions.
///
/// A master carries host-level settings only and must not route any paths; a minion routes
/// paths for exactly one host.
pub fn validate_ingress(ingress: &Ingress) -> Result<(), ValidationError> {
    let mut violations = Violations::default();
    let rules = ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.rules.as_deref())
        .unwrap_or_default();

    let mergeable = ingress
        .annotations()
        .get(MERGEABLE_INGRESS_TYPE_ANNOTATION)
        .map(String::as_str);
    let annotation_path = format!("annotations.{MERGEABLE_INGRESS_TYPE_ANNOTATION}");

    match mergeable {
        Some("master") => {
            if rules.len() != 1 {
                violations.invalid(
                    "spec.rules",
                    rules.len().to_string(),
                    "a master must define exactly one host",
                );
            }
            for (i, rule) in rules.iter().enumerate() {
                let paths = rule.http.as_ref().map_or(0, |http| http.paths.len());
                if paths > 0 {
                    violations.forbidden(
                        format!("spec.rules[{i}].http.paths"),
                        "a master cannot define paths",
                    );
                }
            }
        }
        Some("minion") => {
            if rules.len() != 1 {
                violations.invalid(
                    "spec.rules",
                    rules.len().to_string(),
                    "a minion must define exactly one host",
                );
            }
            for (i, rule) in rules.iter().enumerate() {
                let paths = rule.http.as_ref().map_or(0, |http| http.paths.len());
                if paths == 0 {
                    violations.required(format!("spec.rules[{i}].http.paths"));
                }
            }
        }
        Some(other) => {
            violations.invalid(annotation_path, other, "must be one of: 'master' or 'minion'")
        }
        None => {}
    }

    if rules.is_empty() && mergeable.is_none() {
        violations.required("spec.rules");
    }
    for (i, rule) in rules.iter().enumerate() {
        let path = format!("spec.rules[{i}].host");
        match rule.host.as_deref() {
            None | Some("") => violations.required(path),
            Some(host) if !is_dns1123_subdomain(host) => {
                violations.invalid(path, host, "must be a valid DNS-1123 subdomain")
            }
            Some(_) => {}
        }
        for (j, p) in rule.http.iter().flat_map(|http| http.paths.iter()).enumerate() {
            if let Some(path) = p.path.as_deref() {
                if !path.starts_with('/') {
                    violations.invalid(
                        format!("spec.rules[{i}].http.paths[{j}].path"),
                        path,
                        "must start with '/'",
                    );
                }
            }
        }
    }

    violations.into_result(Kind::Ingress, id_of(ingress))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingress_controller_k8s_api::{
        HTTPIngressPath, HTTPIngressRuleValue, IngressRule, IngressSpec, ObjectMeta,
    };
    use maplit::btreemap;

    fn ingress(mergeable: Option<&str>, rules: Vec<(&str, Vec<&str>)>) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some("cafe".to_string()),
                annotations: mergeable.map(|m| {
                    btreemap! { MERGEABLE_INGRESS_TYPE_ANNOTATION.to_string() => m.to_string() }
                }),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                rules: Some(
                    rules
                        .into_iter()
                        .map(|(host, paths)| IngressRule {
                            host: Some(host.to_string()),
                            http: Some(HTTPIngressRuleValue {
                                paths: paths
                                    .into_iter()
                                    .map(|p| HTTPIngressPath {
                                        path: Some(p.to_string()),
                                        path_type: "Prefix".to_string(),
                                        ..Default::default()
                                    })
                                    .collect(),
                            }),
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            status: None,
        }
    }

    #[test]
    fn standalone() {
        assert_eq!(
            validate_ingress(&ingress(None, vec![("cafe.example.com", vec!["/tea"])])),
            Ok(())
        );
        assert!(validate_ingress(&ingress(None, vec![])).is_err());
        assert!(validate_ingress(&ingress(None, vec![("", vec!["/tea"])])).is_err());
    }

    #[test]
    fn masters_have_no_paths() {
        assert_eq!(
            validate_ingress(&ingress(Some("master"), vec![("cafe.example.com", vec![])])),
            Ok(())
        );
        let err = validate_ingress(&ingress(
            Some("master"),
            vec![("cafe.example.com", vec!["/tea"])],
        ))
        .expect_err("master with paths");
        assert!(err.to_string().contains("spec.rules[0].http.paths"), "{err}");
    }

    #[test]
    fn minions_have_one_host() {
        assert_eq!(
            validate_ingress(&ingress(Some("minion"), vec![("cafe.example.com", vec!["/tea"])])),
            Ok(())
        );
        assert!(validate_ingress(&ingress(
            Some("minion"),
            vec![
                ("cafe.example.com", vec!["/tea"]),
                ("tea.example.com", vec!["/tea"])
            ]
        ))
        .is_err());
        assert!(validate_ingress(&ingress(
            Some("servant"),
            vec![("cafe.example.com", vec!["/"])]
        ))
        .is_err());
    }
}
