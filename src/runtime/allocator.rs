use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{HubError, HubResult};
use crate::runtime::registry::{NodeRegistration, NodeRegistry};
use crate::task::NodeRoute;

/// Picks one node per required environment.
///
/// Preference order: the sender, a node already routed for the instance, the
/// earliest registered processor, then any coprocessor of the environment.
pub fn allocate(
    template_id: &str,
    environments: &[String],
    sender: Option<&NodeRegistration>,
    existing: &BTreeMap<String, NodeRoute>,
    registry: &NodeRegistry,
) -> HubResult<BTreeMap<String, NodeRoute>> {
    if environments.is_empty() {
        return Err(HubError::InvalidTemplate {
            template_id: template_id.to_string(),
            reason: "no environments".to_string(),
        });
    }

    let mut selected = BTreeMap::new();
    for environment in environments {
        let route = pick(environment, sender, existing, registry).ok_or_else(|| {
            HubError::Allocation {
                template_id: template_id.to_string(),
                environment: environment.clone(),
            }
        })?;
        debug!(template_id = %template_id, environment = %environment, node_id = %route.node_id, "Allocated");
        selected.insert(route.node_id.clone(), route);
    }
    Ok(selected)
}

fn pick(
    environment: &str,
    sender: Option<&NodeRegistration>,
    existing: &BTreeMap<String, NodeRoute>,
    registry: &NodeRegistry,
) -> Option<NodeRoute> {
    if let Some(sender) = sender.filter(|s| s.environment == environment) {
        return Some(
            existing
                .get(&sender.node_id)
                .cloned()
                .unwrap_or_else(|| sender.route()),
        );
    }

    if let Some(route) = existing
        .values()
        .find(|r| r.environment == environment && registry.contains(&r.node_id))
    {
        return Some(route.clone());
    }

    registry
        .processors(environment)
        .into_iter()
        .chain(registry.coprocessors(environment))
        .next()
        .map(|r| r.route())
}
