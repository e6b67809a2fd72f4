use crate::{Error, LedgerNode, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt, runtime::events::Reporter};
use std::collections::BTreeMap;

pub const LABEL_DOMAIN: &str = "ledgerops.dev";

/// Labels every child of a `LedgerNode` carries
pub fn get_labels(node: &LedgerNode) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), node.name_any()),
        ("app.kubernetes.io/managed-by".to_string(), "ledger-operator".to_string()),
        ("app.kubernetes.io/name".to_string(), node.spec.component.as_str().to_string()),
        ("app.kubernetes.io/instance".to_string(), node.name_any()),
        (format!("{LABEL_DOMAIN}/component"), node.spec.component.as_str().to_string()),
    ])
}

pub fn get_owner(node: &LedgerNode) -> Result<OwnerReference> {
    node.controller_owner_ref(&())
        .ok_or_else(|| Error::MissingOwner(node.name_any()))
}

fn get_prog_name() -> Option<String> {
    std::env::current_exe()
        .ok()?
        .file_name()?
        .to_str()?
        .to_owned()
        .into()
}

pub fn get_client_name() -> String {
    match get_prog_name() {
        Some(p) if p == "operator" => "controller.ledgerops.dev".to_string(),
        _ => "ledgerops.dev".to_string(),
    }
}

pub fn get_short_name() -> String {
    let long = get_client_name();
    let lst = long.split('.').collect::<Vec<&str>>();
    if lst.len() > 2 {
        format!("ledger-{}", lst[0])
    } else {
        "ledger-operator".to_string()
    }
}

pub fn get_reporter() -> Reporter {
    Reporter {
        controller: get_short_name(),
        instance: Some(std::env::var("POD_NAME").unwrap_or_else(|_| "unknown".to_string())),
    }
}
