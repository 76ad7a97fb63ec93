//! # Dependency Resolver
//!
//! Answers "are all `dependsOn` modules Ready" before a module leaves
//! `Initializing`. A module that depends on itself, directly or through a
//! chain of at most `MAX_DEPENDENCY_DEPTH` edges, is blocked with the cycle
//! spelled out. The walk is iterative and visits each module once, so it
//! terminates on any graph.

use crate::constants::MAX_DEPENDENCY_DEPTH;
use crate::controller::store::{ObjectKey, StatusStore, StoreError};
use crate::crd::{NamespacedObjectReference, Terraform};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    pub ready: bool,
    pub reason: Option<String>,
}

impl Readiness {
    #[must_use]
    pub fn ready() -> Self {
        Self {
            ready: true,
            reason: None,
        }
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            ready: false,
            reason: Some(reason.into()),
        }
    }
}

fn dependency_key(owner_namespace: &str, reference: &NamespacedObjectReference) -> ObjectKey {
    ObjectKey::new(
        reference
            .namespace
            .clone()
            .unwrap_or_else(|| owner_namespace.to_string()),
        reference.name.clone(),
    )
}

fn dependency_keys(tf: &Terraform, key: &ObjectKey) -> Vec<ObjectKey> {
    tf.spec
        .depends_on
        .iter()
        .map(|reference| dependency_key(&key.namespace, reference))
        .collect()
}

/// Whether every dependency of `tf` is Ready at its current generation
pub async fn is_ready(store: &dyn StatusStore, tf: &Terraform) -> Result<Readiness, StoreError> {
    is_ready_with_depth(store, tf, MAX_DEPENDENCY_DEPTH).await
}

pub async fn is_ready_with_depth(
    store: &dyn StatusStore,
    tf: &Terraform,
    max_depth: usize,
) -> Result<Readiness, StoreError> {
    if tf.spec.depends_on.is_empty() {
        return Ok(Readiness::ready());
    }
    let root = ObjectKey::from_resource(tf);
    let direct = dependency_keys(tf, &root);

    let mut fetched: HashMap<ObjectKey, Option<Terraform>> = HashMap::new();
    if let Some(reason) = find_cycle(store, &root, &direct, max_depth, &mut fetched).await? {
        return Ok(Readiness::blocked(reason));
    }

    for key in &direct {
        let dependency = match fetched.get(key) {
            Some(cached) => cached.clone(),
            None => store.get(key).await?,
        };
        let Some(dependency) = dependency else {
            return Ok(Readiness::blocked(format!("dependency '{key}' not found")));
        };
        let ready = dependency
            .status
            .as_ref()
            .is_some_and(|status| status.is_ready_at(dependency.metadata.generation));
        if !ready {
            return Ok(Readiness::blocked(format!("dependency '{key}' is not ready")));
        }
    }
    Ok(Readiness::ready())
}

/// Depth-first walk from `root` looking for a path back to it
async fn find_cycle(
    store: &dyn StatusStore,
    root: &ObjectKey,
    direct: &[ObjectKey],
    max_depth: usize,
    fetched: &mut HashMap<ObjectKey, Option<Terraform>>,
) -> Result<Option<String>, StoreError> {
    let mut visited: HashSet<ObjectKey> = HashSet::new();
    let mut stack: Vec<(ObjectKey, Vec<ObjectKey>)> = direct
        .iter()
        .rev()
        .map(|key| (key.clone(), vec![root.clone(), key.clone()]))
        .collect();

    while let Some((key, path)) = stack.pop() {
        if key == *root {
            let rendered: Vec<String> = path.iter().map(ToString::to_string).collect();
            return Ok(Some(format!(
                "dependency cycle detected: {}",
                rendered.join(" → ")
            )));
        }
        if !visited.insert(key.clone()) {
            continue;
        }
        if path.len() > max_depth {
            return Ok(Some(format!(
                "dependency chain through '{key}' exceeds maximum depth of {max_depth}"
            )));
        }

        if !fetched.contains_key(&key) {
            let object = store.get(&key).await?;
            fetched.insert(key.clone(), object);
        }
        let Some(Some(node)) = fetched.get(&key) else {
            continue;
        };
        for next in dependency_keys(node, &key).into_iter().rev() {
            let mut next_path = path.clone();
            next_path.push(next.clone());
            stack.push((next, next_path));
        }
    }
    Ok(None)
}
