//! Checks run against a `Contour` before any child object is touched.

use std::collections::BTreeSet;
use std::net::IpAddr;

use kube::ResourceExt;

use crate::api::v1alpha1::contour::{Contour, LoadBalancerProviderType, NetworkPublishingType};
use crate::controllers::ensure::store_error;
use crate::store::ObjectStore;
use crate::util::errors::{Error, Result};

/// Runs every spec check, then makes sure no older Contour already manages the namespace.
pub async fn validate<S: ObjectStore>(store: &S, contour: &Contour) -> Result<()> {
    validate_spec(contour)?;
    validate_single_instance(store, contour).await
}

pub fn validate_spec(contour: &Contour) -> Result<()> {
    if contour.spec.replicas < 0 {
        return Err(Error::invalid_spec(format!(
            "replicas must not be negative, got {}",
            contour.spec.replicas
        )));
    }
    if contour.spec.envoy_replicas < 0 {
        return Err(Error::invalid_spec(format!(
            "envoyReplicas must not be negative, got {}",
            contour.spec.envoy_replicas
        )));
    }
    validate_container_ports(contour)?;
    validate_node_ports(contour)?;
    validate_load_balancer(contour)
}

fn validate_container_ports(contour: &Contour) -> Result<()> {
    let ports = &contour.spec.network_publishing.envoy.container_ports;
    let mut names = BTreeSet::new();
    let mut numbers = BTreeSet::new();

    for port in ports {
        if !(1..=65535).contains(&port.port_number) {
            return Err(Error::invalid_spec(format!(
                "container port '{}' has invalid number {}",
                port.name, port.port_number
            )));
        }
        if !names.insert(port.name.as_str()) {
            return Err(Error::invalid_spec(format!("duplicate container port name '{}'", port.name)));
        }
        if !numbers.insert(port.port_number) {
            return Err(Error::invalid_spec(format!(
                "duplicate container port number {}",
                port.port_number
            )));
        }
    }

    for required in ["http", "https"] {
        if !names.contains(required) {
            return Err(Error::invalid_spec(format!("container port '{required}' is required")));
        }
    }
    if names.len() != 2 {
        return Err(Error::invalid_spec(
            "exactly the 'http' and 'https' container ports are supported",
        ));
    }
    Ok(())
}

fn validate_node_ports(contour: &Contour) -> Result<()> {
    let publishing = &contour.spec.network_publishing.envoy;
    if publishing.type_ != NetworkPublishingType::NodePortService || publishing.node_ports.is_empty() {
        return Ok(());
    }

    let mut names = BTreeSet::new();
    let mut numbers = BTreeSet::new();
    for port in &publishing.node_ports {
        if !names.insert(port.name.as_str()) {
            return Err(Error::invalid_spec(format!("duplicate node port name '{}'", port.name)));
        }
        if let Some(number) = port.port_number {
            if !numbers.insert(number) {
                return Err(Error::invalid_spec(format!("duplicate node port number {number}")));
            }
        }
    }

    for required in ["http", "https"] {
        if !names.contains(required) {
            return Err(Error::invalid_spec(format!("node port '{required}' is required")));
        }
    }
    Ok(())
}

fn validate_load_balancer(contour: &Contour) -> Result<()> {
    let publishing = &contour.spec.network_publishing.envoy;
    if publishing.type_ != NetworkPublishingType::LoadBalancerService {
        return Ok(());
    }

    let params = &publishing.load_balancer.provider_parameters;
    let provider = params.type_;
    let leaked = [
        (LoadBalancerProviderType::Aws, params.aws.is_some(), "aws"),
        (LoadBalancerProviderType::Azure, params.azure.is_some(), "azure"),
        (LoadBalancerProviderType::Gcp, params.gcp.is_some(), "gcp"),
    ]
    .into_iter()
    .find(|(owner, set, _)| *set && *owner != provider);
    if let Some((_, _, field)) = leaked {
        return Err(Error::invalid_spec(format!(
            "providerParameters.{field} must not be set for provider {provider}"
        )));
    }

    let address = match provider {
        LoadBalancerProviderType::Azure => params.azure.as_ref().and_then(|p| p.address.as_deref()),
        LoadBalancerProviderType::Gcp => params.gcp.as_ref().and_then(|p| p.address.as_deref()),
        LoadBalancerProviderType::Aws => None,
    };
    if let Some(address) = address {
        if address.parse::<IpAddr>().is_err() {
            return Err(Error::invalid_spec(format!(
                "load balancer address '{address}' is not a valid IP address"
            )));
        }
    }
    Ok(())
}

/// Only the oldest live Contour of a namespace is reconciled, ties broken by name.
async fn validate_single_instance<S: ObjectStore>(store: &S, contour: &Contour) -> Result<()> {
    let namespace = contour.namespace().unwrap_or_default();
    let contours = store
        .list::<Contour>(Some(namespace.as_str()))
        .await
        .map_err(|e| store_error::<Contour>("list", None, &namespace, e))?;

    let rank = |c: &Contour| (c.metadata.creation_timestamp.clone(), c.name_any());
    let mine = rank(contour);
    let older = contours
        .iter()
        .filter(|other| other.name_any() != contour.name_any() && !other.is_deleting())
        .find(|other| rank(*other) < mine);

    match older {
        Some(other) => Err(Error::invalid_spec(format!(
            "Contour '{}' already manages namespace '{}'",
            other.name_any(),
            namespace
        ))),
        None => Ok(()),
    }
}
