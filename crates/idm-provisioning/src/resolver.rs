//! Attribute mapping resolution.
//!
//! Compiles the final list of attribute mappings of an account from the
//! default mappings of its system mapping, the overloads defined by the roles
//! of its owner, and account-level overrides.
//!
//! For every default attribute each strategy is resolved independently:
//!
//! - without overloads on the schema attribute the default applies when it is
//!   enabled and uses that strategy;
//! - merge strategies keep every enabled overload using the strategy;
//! - other strategies keep the overload with the highest role priority, ties
//!   going to the greatest role code. A disabled overload at the top
//!   suppresses the attribute.

use std::cmp::Ordering;
use std::collections::HashSet;

use tracing::debug;

use crate::error::{ProvisioningError, ProvisioningResult};
use crate::mapping::{AttributeMapping, AttributeMappingStrategy};
use crate::model::AccountAttributeOverride;

/// Compiles conflict-resolved attribute mappings.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttributeMappingResolver;

impl AttributeMappingResolver {
    /// Create a resolver.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Full resolution: compile, validate, then append account overrides.
    pub fn resolve(
        &self,
        defaults: &[AttributeMapping],
        overloads: &[AttributeMapping],
        account_overrides: &[AccountAttributeOverride],
    ) -> ProvisioningResult<Vec<AttributeMapping>> {
        let mut compiled = self.compile_attributes(defaults, overloads);
        self.validate_attributes_strategy(&compiled, overloads)?;
        compiled.extend(self.account_overrides(defaults, account_overrides));

        debug!(
            defaults = defaults.len(),
            overloads = overloads.len(),
            compiled = compiled.len(),
            "Compiled attribute mappings"
        );
        Ok(compiled)
    }

    /// Resolve every strategy of every default attribute and concatenate.
    ///
    /// The result holds each mapping once: several defaults on one schema
    /// attribute resolve against the same overloads and would otherwise pick
    /// the same winner repeatedly. Account overrides are appended later by
    /// [`Self::resolve`] and keep the id of the default they replace.
    #[must_use]
    pub fn compile_attributes(
        &self,
        defaults: &[AttributeMapping],
        overloads: &[AttributeMapping],
    ) -> Vec<AttributeMapping> {
        let mut seen = HashSet::new();
        let mut compiled = Vec::new();
        for default in defaults {
            for strategy in AttributeMappingStrategy::ALL {
                for mapping in self.compile_for_strategy(strategy, default, overloads) {
                    if seen.insert(mapping.id) {
                        compiled.push(mapping);
                    }
                }
            }
        }
        compiled
    }

    /// Resolve one strategy of one default attribute.
    #[must_use]
    pub fn compile_for_strategy(
        &self,
        strategy: AttributeMappingStrategy,
        default: &AttributeMapping,
        overloads: &[AttributeMapping],
    ) -> Vec<AttributeMapping> {
        let mut matching: Vec<&AttributeMapping> = overloads
            .iter()
            .filter(|overload| overload.schema_attribute_id() == default.schema_attribute_id())
            .collect();

        if matching.is_empty() {
            return if !default.is_disabled() && default.strategy() == strategy {
                vec![default.clone()]
            } else {
                Vec::new()
            };
        }

        matching.sort_by(|a, b| by_precedence(a, b));
        let candidates: Vec<&AttributeMapping> = matching
            .into_iter()
            .filter(|overload| overload.strategy() == strategy)
            .collect();
        let Some(leader) = candidates.first() else {
            return Vec::new();
        };

        if strategy.is_merge() {
            return candidates
                .iter()
                .filter(|candidate| !candidate.is_disabled())
                .map(|candidate| {
                    let mut merged = (*candidate).clone();
                    merged.schema_attribute = default.schema_attribute.clone();
                    merged.transform_from_resource = default.transform_from_resource.clone();
                    merged.send_always = leader.send_always;
                    merged.send_only_if_not_null = leader.send_only_if_not_null;
                    merged
                })
                .collect();
        }

        match highest_priority(&candidates) {
            Some(winner) => {
                let mut resolved = winner.clone();
                resolved.schema_attribute = default.schema_attribute.clone();
                resolved.cached = default.cached;
                resolved.transform_from_resource = default.transform_from_resource.clone();
                vec![resolved]
            }
            None => Vec::new(),
        }
    }

    /// Reject overloads that compete with a compiled attribute under an
    /// incompatible strategy.
    ///
    /// `CREATE` and `WRITE_IF_NULL` only write when nothing else did, so they
    /// never conflict.
    pub fn validate_attributes_strategy(
        &self,
        compiled: &[AttributeMapping],
        overloads: &[AttributeMapping],
    ) -> ProvisioningResult<()> {
        for resolved in compiled {
            let conflict = overloads.iter().find(|overload| {
                overload.id != resolved.id
                    && overload.schema_attribute_id() == resolved.schema_attribute_id()
                    && overload.strategy() != resolved.strategy()
                    && !overload.strategy().is_conditional()
                    && !resolved.strategy().is_conditional()
            });

            if let Some(overload) = conflict {
                return Err(ProvisioningError::StrategyConflict {
                    attribute: resolved.schema_attribute.name.clone(),
                    first_role: resolved.owner_label(),
                    first_strategy: resolved.strategy(),
                    second_role: overload.owner_label(),
                    second_strategy: overload.strategy(),
                });
            }
        }
        Ok(())
    }

    /// One `SET` mapping per account override matching a default attribute.
    #[must_use]
    pub fn account_overrides(
        &self,
        defaults: &[AttributeMapping],
        overrides: &[AccountAttributeOverride],
    ) -> Vec<AttributeMapping> {
        overrides
            .iter()
            .filter_map(|value| {
                defaults
                    .iter()
                    .find(|default| default.name == value.mapping_name)
                    .map(|default| default.account_override(value.value.clone()))
            })
            .collect()
    }
}

/// Descending priority, then descending role code.
fn by_precedence(a: &AttributeMapping, b: &AttributeMapping) -> Ordering {
    b.priority()
        .cmp(&a.priority())
        .then_with(|| b.role_code().cmp(&a.role_code()))
}

/// The single overload applying among same-strategy candidates.
///
/// Returns `None` when a disabled overload is among those tied at the top.
fn highest_priority<'a>(candidates: &[&'a AttributeMapping]) -> Option<&'a AttributeMapping> {
    let top = candidates.iter().filter_map(|c| c.priority()).max()?;
    let tied: Vec<&'a AttributeMapping> = candidates
        .iter()
        .copied()
        .filter(|c| c.priority() == Some(top))
        .collect();

    if tied.iter().any(|c| c.is_disabled()) {
        return None;
    }
    tied.into_iter().max_by(|a, b| a.role_code().cmp(&b.role_code()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use idm_core::{AccountId, RoleId, SystemMappingId};
    use idm_connector::SchemaAttribute;

    use crate::mapping::MappingOrigin;

    fn default_attribute(name: &str) -> AttributeMapping {
        AttributeMapping::new(
            SystemMappingId::new(),
            name,
            SchemaAttribute::new(name, "__ACCOUNT__").multivalued(),
        )
        .with_property(name)
    }

    fn overload(
        base: &AttributeMapping,
        code: &str,
        priority: i32,
        strategy: AttributeMappingStrategy,
    ) -> AttributeMapping {
        base.overload(RoleId::new(), code, priority)
            .with_strategy(strategy)
    }

    fn codes(mappings: &[AttributeMapping]) -> Vec<Option<&str>> {
        mappings.iter().map(AttributeMapping::role_code).collect()
    }

    #[test]
    fn test_default_applies_without_overloads() {
        let first_name = default_attribute("FIRST_NAME");
        let compiled = AttributeMappingResolver::new().compile_attributes(&[first_name.clone()], &[]);
        assert_eq!(compiled, vec![first_name]);
    }

    #[test]
    fn test_disabled_default_is_dropped() {
        let compiled = AttributeMappingResolver::new()
            .compile_attributes(&[default_attribute("FIRST_NAME").disabled()], &[]);
        assert!(compiled.is_empty());
    }

    #[test]
    fn test_highest_priority_wins() {
        let base = default_attribute("title");
        let overloads = vec![
            overload(&base, "LOW", 10, AttributeMappingStrategy::Set),
            overload(&base, "HIGH", 20, AttributeMappingStrategy::Set),
        ];
        let compiled = AttributeMappingResolver::new().compile_attributes(&[base], &overloads);
        assert_eq!(codes(&compiled), vec![Some("HIGH")]);
    }

    #[test]
    fn test_tie_goes_to_greatest_role_code() {
        let base = default_attribute("title");
        let overloads = vec![
            overload(&base, "A", 20, AttributeMappingStrategy::Set),
            overload(&base, "Z", 20, AttributeMappingStrategy::Set),
            overload(&base, "M", 10, AttributeMappingStrategy::Set),
        ];
        let compiled = AttributeMappingResolver::new().compile_attributes(&[base], &overloads);
        assert_eq!(codes(&compiled), vec![Some("Z")]);
    }

    #[test]
    fn test_disabled_top_overload_suppresses_attribute() {
        let base = default_attribute("title");
        let overloads = vec![
            overload(&base, "TOP", 20, AttributeMappingStrategy::Set).disabled(),
            overload(&base, "LOW", 10, AttributeMappingStrategy::Set),
        ];
        let compiled = AttributeMappingResolver::new().compile_for_strategy(
            AttributeMappingStrategy::Set,
            &base,
            &overloads,
        );
        assert!(compiled.is_empty());
    }

    #[test]
    fn test_disabled_tied_overload_suppresses_attribute() {
        let base = default_attribute("title");
        let overloads = vec![
            overload(&base, "A", 20, AttributeMappingStrategy::Set).disabled(),
            overload(&base, "Z", 20, AttributeMappingStrategy::Set),
        ];
        let compiled = AttributeMappingResolver::new().compile_attributes(&[base], &overloads);
        assert!(compiled.is_empty());
    }

    #[test]
    fn test_overloads_of_other_strategy_hide_default() {
        let base = default_attribute("title");
        let overloads = vec![overload(&base, "R", 10, AttributeMappingStrategy::Create)];
        let compiled = AttributeMappingResolver::new().compile_attributes(&[base], &overloads);
        assert_eq!(compiled.len(), 1);
        assert_eq!(compiled[0].strategy, AttributeMappingStrategy::Create);
    }

    #[test]
    fn test_winner_inherits_default_schema_and_cache() {
        let mut base = default_attribute("title");
        base.cached = false;
        base.transform_from_resource = Some("${value|trim}".to_string());
        let mut winner = overload(&base, "R", 10, AttributeMappingStrategy::Set);
        winner.cached = true;
        winner.transform_from_resource = None;

        let compiled = AttributeMappingResolver::new().compile_attributes(&[base.clone()], &[winner]);
        assert_eq!(compiled[0].schema_attribute, base.schema_attribute);
        assert!(!compiled[0].cached);
        assert_eq!(compiled[0].transform_from_resource, base.transform_from_resource);
    }

    #[test]
    fn test_merge_keeps_all_enabled_overloads() {
        let base = default_attribute("memberOf");
        let mut leader = overload(&base, "HIGH", 30, AttributeMappingStrategy::Merge);
        leader.send_always = true;
        let overloads = vec![
            overload(&base, "LOW", 10, AttributeMappingStrategy::Merge),
            leader,
            overload(&base, "OFF", 20, AttributeMappingStrategy::Merge).disabled(),
        ];

        let compiled = AttributeMappingResolver::new().compile_attributes(&[base], &overloads);
        assert_eq!(codes(&compiled), vec![Some("HIGH"), Some("LOW")]);
        assert!(compiled.iter().all(|m| m.send_always));
    }

    #[test]
    fn test_compile_is_deterministic() {
        let base = default_attribute("memberOf");
        let other = default_attribute("title");
        let overloads = vec![
            overload(&base, "B", 10, AttributeMappingStrategy::Merge),
            overload(&base, "A", 10, AttributeMappingStrategy::Merge),
            overload(&other, "C", 5, AttributeMappingStrategy::WriteIfNull),
            overload(&other, "D", 5, AttributeMappingStrategy::Set),
        ];
        let defaults = vec![base, other];
        let resolver = AttributeMappingResolver::new();

        let first = resolver.compile_attributes(&defaults, &overloads);
        for _ in 0..10 {
            assert_eq!(resolver.compile_attributes(&defaults, &overloads), first);
        }
    }

    #[test]
    fn test_defaults_sharing_schema_attribute_keep_winner_once() {
        let base = default_attribute("title");
        let mut twin = AttributeMapping::new(
            base.system_mapping_id,
            "titleCopy",
            base.schema_attribute.clone(),
        );
        twin.idm_property = Some("title".to_string());
        let overloads = vec![overload(&base, "R1", 10, AttributeMappingStrategy::Set)];

        let compiled =
            AttributeMappingResolver::new().compile_attributes(&[base, twin], &overloads);
        assert_eq!(codes(&compiled), vec![Some("R1")]);
    }

    #[test]
    fn test_set_against_merge_conflicts() {
        let base = default_attribute("memberOf");
        let overloads = vec![
            overload(&base, "SETTER", 10, AttributeMappingStrategy::Set),
            overload(&base, "MERGER", 10, AttributeMappingStrategy::Merge),
        ];

        let err = AttributeMappingResolver::new()
            .resolve(&[base], &overloads, &[])
            .unwrap_err();
        match err {
            ProvisioningError::StrategyConflict {
                first_role,
                second_role,
                ..
            } => {
                let roles = [first_role, second_role];
                assert!(roles.contains(&"role 'SETTER'".to_string()));
                assert!(roles.contains(&"role 'MERGER'".to_string()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_create_and_write_if_null_never_conflict() {
        let base = default_attribute("title");
        let overloads = vec![
            overload(&base, "SETTER", 10, AttributeMappingStrategy::Set),
            overload(&base, "CREATOR", 10, AttributeMappingStrategy::Create),
            overload(&base, "FILLER", 10, AttributeMappingStrategy::WriteIfNull),
        ];

        let compiled = AttributeMappingResolver::new()
            .resolve(&[base], &overloads, &[])
            .unwrap();
        assert_eq!(compiled.len(), 3);
    }

    #[test]
    fn test_account_override_appended_as_set() {
        let base = default_attribute("title");
        let overrides = vec![
            AccountAttributeOverride {
                account_id: AccountId::new(),
                mapping_name: "title".to_string(),
                value: "Chief".into(),
            },
            AccountAttributeOverride {
                account_id: AccountId::new(),
                mapping_name: "unknown".to_string(),
                value: "ignored".into(),
            },
        ];

        let compiled = AttributeMappingResolver::new()
            .resolve(&[base], &[], &overrides)
            .unwrap();
        assert_eq!(compiled.len(), 2);
        assert_eq!(compiled[1].strategy, AttributeMappingStrategy::Set);
        assert!(matches!(compiled[1].origin, MappingOrigin::Account { .. }));
    }

    #[test]
    fn test_first_name_scenario() {
        let first_name = default_attribute("FIRST_NAME");
        let resolver = AttributeMappingResolver::new();

        let compiled = resolver.resolve(&[first_name.clone()], &[], &[]).unwrap();
        assert_eq!(compiled, vec![first_name.clone()]);

        let r1 = overload(&first_name, "R1", 10, AttributeMappingStrategy::Set).disabled();
        let compiled = resolver
            .resolve(&[first_name.clone()], &[r1.clone()], &[])
            .unwrap();
        assert!(compiled.is_empty());

        let r2 = overload(&first_name, "R2", 20, AttributeMappingStrategy::Set);
        let compiled = resolver
            .resolve(&[first_name], &[r1, r2.clone()], &[])
            .unwrap();
        assert_eq!(compiled.len(), 1);
        assert_eq!(compiled[0].id, r2.id);
    }
}
