//! Checks for App Protect DoS settings and log destinations.

use super::{is_dns1123_subdomain, validate_reference, ValidationError, Violations};
use crate::store::id_of;
use ingress_controller_core::Kind;
use ingress_controller_k8s_api::configuration::DosProtectedResource;
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

pub const MAX_NAME_LENGTH: usize = 63;

const ACCESS_LOG_DEST_REGEX: &str = r"^(((\d{1,3}\.){3}\d{1,3}):\d{1,5})$";
const DOS_LOG_DEST_REGEX: &str = r"^([^:\s]+):(\d{1,5})$";
const SYSLOG_DEST_REGEX: &str = r"^syslog:server=([^:\s]+):(\d{1,5})$";

const ACCESS_LOG_DEST_FORMAT: &str = "Error parsing App Protect Dos Access Log Dest config: \
                                      Destination must follow format: <ip-address>:<port>";
const DOS_LOG_DEST_FORMAT: &str = "Error parsing App Protect Dos Log config: Destination must \
                                   follow format: <ip-address | localhost | dns name>:<port> or \
                                   stderr";
const LOG_DEST_FORMAT: &str = "Error parsing App Protect Log config: Destination must follow \
                               format: syslog:server=<ip-address | localhost | dns name>:<port> \
                               or stderr";

static ACCESS_LOG_DEST: Lazy<Regex> =
    Lazy::new(|| Regex::new(ACCESS_LOG_DEST_REGEX).expect("should_compile"));
static DOS_LOG_DEST: Lazy<Regex> =
    Lazy::new(|| Regex::new(DOS_LOG_DEST_REGEX).expect("should_compile"));
static SYSLOG_DEST: Lazy<Regex> =
    Lazy::new(|| Regex::new(SYSLOG_DEST_REGEX).expect("should_compile"));

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum DosError {
    #[error("{0} Log Destination did not follow format")]
    Format(&'static str),

    #[error("Error parsing port: {0} not a valid port number")]
    Port(u32),

    #[error("Error parsing host: {0} is not a valid ip address")]
    Ip(String),

    #[error("Error parsing host: {0} is not a valid ip address or host name")]
    Host(String),

    #[error("App Protect Dos Name max length is {MAX_NAME_LENGTH}")]
    NameTooLong,

    #[error("App Protect Dos Monitor must have valid URL")]
    Monitor,
}

/// Validates an access log destination, which must be `<ipv4>:<port>`.
pub fn validate_app_protect_dos_access_log_dest(dest: &str) -> Result<(), DosError> {
    if !ACCESS_LOG_DEST.is_match(dest) {
        return Err(DosError::Format(ACCESS_LOG_DEST_FORMAT));
    }
    let Some((host, port)) = dest.split_once(':') else {
        return Err(DosError::Format(ACCESS_LOG_DEST_FORMAT));
    };
    validate_port(port)?;
    if host.parse::<Ipv4Addr>().is_err() {
        return Err(DosError::Ip(host.to_string()));
    }
    Ok(())
}

/// Validates a DoS security log destination: `stderr` or `<ip | localhost | dns name>:<port>`.
pub fn validate_app_protect_dos_log_dest(dest: &str) -> Result<(), DosError> {
    if dest == "stderr" {
        return Ok(());
    }
    let Some(captures) = DOS_LOG_DEST.captures(dest) else {
        return Err(DosError::Format(DOS_LOG_DEST_FORMAT));
    };
    validate_port(&captures[2])?;
    validate_host(&captures[1])
}

/// Validates a WAF security log destination: `stderr` or
/// `syslog:server=<ip | localhost | dns name>:<port>`.
pub fn validate_app_protect_log_dest(dest: &str) -> Result<(), DosError> {
    if dest == "stderr" {
        return Ok(());
    }
    let Some(captures) = SYSLOG_DEST.captures(dest) else {
        return Err(DosError::Format(LOG_DEST_FORMAT));
    };
    validate_port(&captures[2])?;
    validate_host(&captures[1])
}

pub fn validate_app_protect_dos_name(name: &str) -> Result<(), DosError> {
    if name.len() > MAX_NAME_LENGTH {
        return Err(DosError::NameTooLong);
    }
    Ok(())
}

/// Validates a monitor URI. Relative references such as `example.com` are accepted; malformed
/// percent-encoding is not.
pub fn validate_app_protect_dos_monitor(monitor: &str) -> Result<(), DosError> {
    let base = url::Url::parse("http://localhost/").map_err(|_| DosError::Monitor)?;
    let malformed = std::cell::Cell::new(false);
    let violation = |v: url::SyntaxViolation| {
        if matches!(v, url::SyntaxViolation::PercentDecode) {
            malformed.set(true);
        }
    };
    url::Url::options()
        .base_url(Some(&base))
        .syntax_violation_callback(Some(&violation))
        .parse(monitor)
        .map_err(|_| DosError::Monitor)?;
    if malformed.get() {
        return Err(DosError::Monitor);
    }
    Ok(())
}

/// Validates every set field of a DosProtectedResource.
pub fn validate_dos_protected_resource(
    resource: &DosProtectedResource,
) -> Result<(), ValidationError> {
    let id = id_of(resource);
    let spec = &resource.spec;
    let invalid = |field, source| ValidationError::InvalidDosField {
        id: id.clone(),
        field,
        source,
    };

    if spec.name.is_empty() {
        return Err(ValidationError::MissingDosField {
            id: id.clone(),
            field: "name",
        });
    }
    validate_app_protect_dos_name(&spec.name).map_err(|e| invalid("name", e))?;

    if !spec.ap_dos_monitor.is_empty() {
        validate_app_protect_dos_monitor(&spec.ap_dos_monitor)
            .map_err(|e| invalid("apDosMonitor", e))?;
    }

    if !spec.dos_access_log_dest.is_empty() {
        validate_app_protect_dos_access_log_dest(&spec.dos_access_log_dest)
            .map_err(|e| invalid("dosAccessLogDest", e))?;
    }

    let mut violations = Violations::default();
    if !spec.ap_dos_policy.is_empty() {
        validate_reference(&spec.ap_dos_policy, "spec.apDosPolicy", &mut violations);
    }

    if let Some(log) = spec.dos_security_log.as_ref() {
        if !log.ap_dos_log_conf.is_empty() {
            validate_reference(
                &log.ap_dos_log_conf,
                "spec.dosSecurityLog.apDosLogConf",
                &mut violations,
            );
        }
        validate_app_protect_dos_log_dest(&log.dos_log_dest)
            .map_err(|e| invalid("dosSecurityLog.dosLogDest", e))?;
    }

    violations.into_result(Kind::DosProtectedResource, id)
}

fn validate_port(port: &str) -> Result<(), DosError> {
    // The patterns bound ports to five digits, so parsing only fails for empty input.
    let port = port.parse::<u32>().unwrap_or(0);
    if !(1..=65535).contains(&port) {
        return Err(DosError::Port(port));
    }
    Ok(())
}

fn validate_host(host: &str) -> Result<(), DosError> {
    if host == "localhost" || host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    // Anything made only of digits and dots was meant to be an IP address.
    if host.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Err(DosError::Ip(host.to_string()));
    }
    if !is_dns1123_subdomain(host) {
        return Err(DosError::Host(host.to_string()));
    }
    Ok(())
}
