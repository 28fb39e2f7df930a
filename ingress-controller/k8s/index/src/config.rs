use ingress_controller_core::ResourceId;

/// Controller-wide settings that shape reconciliation.
///
/// Handed explicitly to the handlers and the reconciler so that tests can run several
/// differently configured controllers side by side.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub ingress_class: String,

    /// When set, resources that declare no class are ignored.
    pub use_ingress_class_only: bool,

    /// The only GlobalConfiguration honored, if any.
    pub global_configuration: Option<ResourceId>,

    /// The only ConfigMap honored, if any.
    pub config_map: Option<ResourceId>,

    pub enable_custom_resources: bool,
    pub enable_app_protect: bool,
    pub enable_app_protect_dos: bool,

    /// The name of the IngressLink honored in the controller namespace, if any.
    pub ingress_link: Option<String>,

    pub controller_namespace: String,

    /// The name of the Service that exposes the controller, in the controller namespace.
    pub external_service: Option<String>,

    /// Where file-backed secrets are written.
    pub secrets_dir: String,

    /// ExternalName upstreams are only supported by NGINX Plus.
    pub is_nginx_plus: bool,
}

// === impl ControllerConfig ===

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            ingress_class: "nginx".to_string(),
            use_ingress_class_only: false,
            global_configuration: None,
            config_map: None,
            enable_custom_resources: true,
            enable_app_protect: false,
            enable_app_protect_dos: false,
            ingress_link: None,
            controller_namespace: "nginx-ingress".to_string(),
            external_service: None,
            secrets_dir: "/etc/nginx/secrets".to_string(),
            is_nginx_plus: false,
        }
    }
}

impl ControllerConfig {
    /// Decides whether a resource declaring `class` is handled by this controller.
    ///
    /// An unset or empty class is treated as unclassified.
    pub fn accepts_class(&self, class: Option<&str>) -> bool {
        match class.filter(|c| !c.is_empty()) {
            Some(class) => class == self.ingress_class,
            None => !self.use_ingress_class_only,
        }
    }

    pub fn is_external_service(&self, id: &ResourceId) -> bool {
        id.namespace == self.controller_namespace
            && self.external_service.as_deref() == Some(id.name.as_str())
    }

    pub fn is_ingress_link(&self, id: &ResourceId) -> bool {
        id.namespace == self.controller_namespace
            && self.ingress_link.as_deref() == Some(id.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Some("nginx"), false, true)]
    #[case(Some("nginx"), true, true)]
    #[case(Some("haproxy"), false, false)]
    #[case(None, false, true)]
    #[case(Some(""), false, true)]
    #[case(None, true, false)]
    #[case(Some(""), true, false)]
    fn filters_by_class(#[case] class: Option<&str>, #[case] only: bool, #[case] accepted: bool) {
        let config = ControllerConfig {
            use_ingress_class_only: only,
            ..Default::default()
        };
        assert_eq!(config.accepts_class(class), accepted);
    }
}
