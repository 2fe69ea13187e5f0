//! Pool allocation engine
//!
//! Pure functions over a [`StaticIPSpec`]. None of them talk to the API
//! server; callers run them inside [`crate::update_with_retry`] so a conflict
//! re-reads the record and applies the mutation again from scratch.
//!
//! Allocation takes from the front of `available` and release appends to its
//! tail, so the free list is FIFO in declaration order and a retried
//! read-mutate-write picks the same address.

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;

use crds::{OwnerKind, OwnerPod, PoolDeclaration, StaticIP, StaticIPSpec, static_ip_name};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use crate::error::StaticIpError;

/// Splits a comma-separated pool into its entries.
///
/// Entries are trimmed, blanks are skipped and repeats keep their first
/// position. Each entry must be an IPv4 address with an optional prefix length.
pub fn parse_pool(pool: &str) -> Result<Vec<String>, StaticIpError> {
    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    for raw in pool.split(',') {
        let entry = raw.trim();
        if entry.is_empty() {
            continue;
        }
        validate_entry(entry)?;
        if seen.insert(entry) {
            entries.push(entry.to_string());
        }
    }
    if entries.is_empty() {
        return Err(StaticIpError::InvalidPool(format!("pool {pool:?} has no addresses")));
    }
    Ok(entries)
}

fn validate_entry(entry: &str) -> Result<(), StaticIpError> {
    let (addr, prefix) = match entry.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (entry, None),
    };
    addr.parse::<Ipv4Addr>()
        .map_err(|e| StaticIpError::InvalidPool(format!("{entry}: {e}")))?;
    if let Some(prefix) = prefix {
        match prefix.parse::<u8>() {
            Ok(len) if len <= 32 => {}
            _ => {
                return Err(StaticIpError::InvalidPool(format!(
                    "{entry}: invalid prefix length {prefix}"
                )));
            }
        }
    }
    Ok(())
}

/// Builds a fresh spec: every address free, in declaration order.
///
/// A standalone pod declares exactly one address.
pub fn new_spec(
    namespace: &str,
    owner_kind: OwnerKind,
    decl: &PoolDeclaration,
) -> Result<StaticIPSpec, StaticIpError> {
    let entries = parse_pool(&decl.pool)?;
    if owner_kind == OwnerKind::Pod && entries.len() != 1 {
        return Err(StaticIpError::InvalidPool(format!(
            "standalone pod declares {} addresses in {:?}, expected one",
            entries.len(),
            decl.pool
        )));
    }
    let gateway = decl.gateway.trim();
    let gateway_addr = gateway.split_once('/').map_or(gateway, |(addr, _)| addr);
    gateway_addr
        .parse::<Ipv4Addr>()
        .map_err(|e| StaticIpError::InvalidPool(format!("gateway {gateway}: {e}")))?;

    let ip_map: BTreeMap<String, Option<OwnerPod>> =
        entries.iter().map(|ip| (ip.clone(), None)).collect();
    let mut spec = StaticIPSpec {
        namespace: namespace.to_string(),
        owner_kind,
        ip_pool: decl.pool.clone(),
        gateway: gateway.to_string(),
        ip_map,
        used: Vec::new(),
        available: entries,
        ratio: String::new(),
    };
    spec.recompute_ratio();
    Ok(spec)
}

/// Builds the StaticIP object for an owner, linked to it for cascade deletion.
///
/// `owner_uid` is required for the owner reference; without it the record
/// would outlive its owner.
pub fn new_static_ip(
    namespace: &str,
    owner_kind: OwnerKind,
    owner_name: &str,
    owner_uid: &str,
    decl: &PoolDeclaration,
) -> Result<StaticIP, StaticIpError> {
    let spec = new_spec(namespace, owner_kind, decl)?;
    let mut sip = StaticIP::new(&static_ip_name(owner_kind, owner_name), spec);
    sip.metadata = ObjectMeta {
        name: Some(static_ip_name(owner_kind, owner_name)),
        namespace: Some(namespace.to_string()),
        owner_references: Some(vec![OwnerReference {
            api_version: owner_kind.api_version().to_string(),
            kind: owner_kind.as_str().to_string(),
            name: owner_name.to_string(),
            uid: owner_uid.to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }]),
        ..ObjectMeta::default()
    };
    Ok(sip)
}

/// Binds the first free address to `pod` and returns `(address, gateway)`.
///
/// A pod that already holds an address gets the same one back without any
/// change, so a retried request is harmless. On `PoolExhausted` the spec is
/// left untouched.
pub fn acquire(spec: &mut StaticIPSpec, pod: &OwnerPod) -> Result<(String, String), StaticIpError> {
    if let Some(ip) = spec.address_of(&pod.uid) {
        return Ok((ip.to_string(), spec.gateway.clone()));
    }

    let position = spec
        .available
        .iter()
        .position(|ip| matches!(spec.ip_map.get(ip), Some(None)))
        .ok_or_else(|| StaticIpError::PoolExhausted(spec.ip_pool.clone()))?;

    let ip = spec.available.remove(position);
    spec.ip_map.insert(ip.clone(), Some(pod.clone()));
    spec.used.push(ip.clone());
    spec.recompute_ratio();
    Ok((ip, spec.gateway.clone()))
}

/// Frees the address held by the pod with `uid`.
///
/// Returns the released address, or `None` when the pod holds nothing in
/// this pool (it may have been deleted before acquisition finished).
pub fn release(spec: &mut StaticIPSpec, uid: &str) -> Option<String> {
    let ip = spec.address_of(uid)?.to_string();
    spec.used.retain(|used| used != &ip);
    spec.ip_map.insert(ip.clone(), None);
    spec.available.push(ip.clone());
    spec.recompute_ratio();
    Some(ip)
}

/// Marks a standalone pod's single declared address as held by that pod.
pub fn claim_all(spec: &mut StaticIPSpec, pod: &OwnerPod) {
    let entries = std::mem::take(&mut spec.available);
    for ip in entries {
        spec.ip_map.insert(ip.clone(), Some(pod.clone()));
        spec.used.push(ip);
    }
    spec.recompute_ratio();
}

/// Merges an existing record with a newly declared pool.
///
/// Assignments whose address survives the resize are carried over; holders
/// of removed addresses are returned as evicted and must be deleted by the
/// caller. The merged record keeps `old`'s metadata so a replace targets the
/// version that was read.
pub fn reconcile_resize(old: &StaticIP, new_spec: StaticIPSpec) -> (StaticIP, Vec<OwnerPod>) {
    let mut merged_spec = new_spec;
    let mut evicted = Vec::new();

    for value in merged_spec.ip_map.values_mut() {
        *value = None;
    }
    merged_spec.used.clear();

    for ip in &old.spec.used {
        let holder = old.spec.ip_map.get(ip).cloned().flatten();
        match (merged_spec.ip_map.contains_key(ip), holder) {
            (true, Some(holder)) => {
                merged_spec.ip_map.insert(ip.clone(), Some(holder));
                merged_spec.used.push(ip.clone());
            }
            (false, Some(holder)) => evicted.push(holder),
            (_, None) => {}
        }
    }

    let used: HashSet<&String> = merged_spec.used.iter().collect();
    let available: Vec<String> = merged_spec
        .available
        .iter()
        .filter(|ip| !used.contains(ip))
        .cloned()
        .collect();
    merged_spec.available = available;
    merged_spec.recompute_ratio();

    let mut merged = old.clone();
    merged.spec = merged_spec;
    (merged, evicted)
}

#[cfg(test)]
#[path = "pool_test.rs"]
mod pool_test;
