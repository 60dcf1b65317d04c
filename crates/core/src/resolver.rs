// Resources valid for every target of a batch

use crate::types::{Choice, Resource, Target};
use std::collections::BTreeMap;

/// Key of the single MAC choice offered for a multi-target batch; each target
/// then uses its own first non-management interface
pub const USE_FIRST_MAC: &str = "0";

/// Which resource a choice set is built from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    NetworkEnvironments,
    Networks,
    MacAddresses,
}

/// Choices valid for every target of the batch, ordered by key.
///
/// An empty intersection (or an empty batch) yields an empty list; the form
/// layer decides how to surface that.
pub fn resolve_choice_set(targets: &[Target], selector: Selector) -> Vec<Choice> {
    match selector {
        Selector::MacAddresses => mac_choices(targets),
        Selector::NetworkEnvironments => {
            intersect_resources(targets, |t| &t.network_environments)
        }
        Selector::Networks => intersect_resources(targets, |t| &t.networks),
    }
}

/// Choices present in both lists, ordered by key
pub fn intersect(a: &[Choice], b: &[Choice]) -> Vec<Choice> {
    let keys: BTreeMap<&str, &Choice> = b.iter().map(|c| (c.key.as_str(), c)).collect();
    let mut common: BTreeMap<String, Choice> = BTreeMap::new();
    for choice in a {
        if keys.contains_key(choice.key.as_str()) {
            common.insert(choice.key.clone(), choice.clone());
        }
    }
    common.into_values().collect()
}

fn intersect_resources<F>(targets: &[Target], resources: F) -> Vec<Choice>
where
    F: Fn(&Target) -> &Vec<Resource>,
{
    let mut iter = targets.iter();
    let Some(first) = iter.next() else {
        return Vec::new();
    };

    let mut common = to_choices(resources(first));
    for target in iter {
        if common.is_empty() {
            break;
        }
        common = intersect(&common, &to_choices(resources(target)));
    }
    common
}

fn to_choices(resources: &[Resource]) -> Vec<Choice> {
    let unique: BTreeMap<&str, &Resource> =
        resources.iter().map(|r| (r.id.as_str(), r)).collect();
    unique
        .into_values()
        .map(|r| Choice::new(r.id.clone(), r.name.clone()))
        .collect()
}

fn mac_choices(targets: &[Target]) -> Vec<Choice> {
    match targets {
        [] => Vec::new(),
        [single] => single
            .interfaces
            .iter()
            .filter_map(|eth| {
                eth.mac
                    .as_ref()
                    .map(|mac| Choice::new(eth.id.0.clone(), mac.clone()))
            })
            .collect(),
        _ => vec![Choice::new(USE_FIRST_MAC, "use first")],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InterfaceId, NetworkInterface, TargetKind};

    fn target(id: &str, envs: &[&str]) -> Target {
        let mut t = Target::new(id, TargetKind::VirtualServer);
        t.network_environments = envs
            .iter()
            .map(|e| Resource::new(*e, format!("env {}", e)))
            .collect();
        t.networks = envs
            .iter()
            .map(|e| Resource::new(format!("net-{}", e), format!("10.{}.0.0/24", e.len())))
            .collect();
        t
    }

    fn keys(choices: &[Choice]) -> Vec<&str> {
        choices.iter().map(|c| c.key.as_str()).collect()
    }

    #[test]
    fn test_intersection_keeps_shared_environments() {
        let batch = vec![
            target("a", &["1", "2", "3"]),
            target("b", &["3", "2"]),
            target("c", &["2", "3", "4"]),
        ];
        let choices = resolve_choice_set(&batch, Selector::NetworkEnvironments);
        assert_eq!(keys(&choices), vec!["2", "3"]);
        assert_eq!(choices[0].label, "env 2");

        let networks = resolve_choice_set(&batch, Selector::Networks);
        assert_eq!(keys(&networks), vec!["net-2", "net-3"]);
    }

    #[test]
    fn test_disjoint_batch_yields_empty_list() {
        let batch = vec![target("a", &["1"]), target("b", &["2"])];
        assert!(resolve_choice_set(&batch, Selector::NetworkEnvironments).is_empty());
        assert!(resolve_choice_set(&[], Selector::Networks).is_empty());
    }

    #[test]
    fn test_intersection_is_commutative_and_associative() {
        let a = target("a", &["1", "2", "3", "5"]);
        let b = target("b", &["2", "3", "5"]);
        let c = target("c", &["5", "3", "9"]);

        let ab = resolve_choice_set(&[a.clone(), b.clone()], Selector::NetworkEnvironments);
        let ba = resolve_choice_set(&[b.clone(), a.clone()], Selector::NetworkEnvironments);
        assert_eq!(ab, ba);

        let c_only = resolve_choice_set(&[c.clone()], Selector::NetworkEnvironments);
        let stepwise = intersect(&ab, &c_only);
        let direct = resolve_choice_set(&[a, b, c], Selector::NetworkEnvironments);
        assert_eq!(stepwise, direct);
        assert_eq!(keys(&direct), vec!["3", "5"]);
    }

    #[test]
    fn test_mac_choices_depend_on_batch_size() {
        let mut single = target("a", &[]);
        single.interfaces = vec![
            NetworkInterface {
                id: InterfaceId::new("eth-1"),
                mac: Some("aa:bb:cc:00:00:01".to_string()),
                ips: vec![],
            },
            NetworkInterface {
                id: InterfaceId::new("eth-2"),
                mac: None,
                ips: vec![],
            },
        ];

        let choices = resolve_choice_set(&[single.clone()], Selector::MacAddresses);
        assert_eq!(choices, vec![Choice::new("eth-1", "aa:bb:cc:00:00:01")]);

        let many = resolve_choice_set(&[single, target("b", &[])], Selector::MacAddresses);
        assert_eq!(keys(&many), vec![USE_FIRST_MAC]);
    }
}
