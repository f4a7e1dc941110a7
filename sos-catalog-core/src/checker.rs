//! Consistency checker: validates a data insert against the registry.
//!
//! Validation happens before any mutation; once mutation starts, a failure
//! reverts everything already applied, so the registry is either fully
//! updated or untouched.

use std::collections::BTreeSet;

use crate::error::{CatalogError, Result};
use crate::registry::{ConstellationChange, ConstellationRegistry};
use crate::types::*;

/// Result of a successful check: the primary constellation (post-mutation)
/// and every change the check applied, hidden children included.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub primary: ObservationConstellation,
    pub changes: Vec<ConstellationChange>,
}

/// Check `(procedure?, property, offering)` against the registry and assert
/// `proposed` as its observation type.
///
/// `procedure = None` matches every procedure registered for the property
/// and offering; a pinned procedure matches only itself.
pub fn check(
    registry: &mut ConstellationRegistry,
    procedure: Option<&str>,
    property: &str,
    offering: &str,
    proposed: ObservationType,
) -> Result<CheckOutcome> {
    let candidates: Vec<ObservationConstellation> = registry
        .lookup(procedure, Some(property), Some(offering))
        .into_iter()
        .cloned()
        .collect();

    if candidates.is_empty() {
        return Err(CatalogError::UnknownConstellation {
            procedure: procedure.map(str::to_string),
            property: property.to_string(),
            offering: offering.to_string(),
        });
    }

    for candidate in &candidates {
        registry.validate_type(candidate.id, proposed)?;
    }

    let mut changes = Vec::new();
    if let Err(e) = apply(registry, property, proposed, &candidates, &mut changes) {
        registry.revert(&changes);
        return Err(e);
    }

    let primary_id = candidates[0].id;
    let primary = registry
        .get(primary_id)
        .cloned()
        .ok_or_else(|| CatalogError::NotFound(format!("constellation {primary_id}")))?;

    tracing::debug!(
        id = %primary.id,
        procedure = %primary.procedure,
        property = %primary.observable_property,
        offering = %primary.offering,
        observation_type = %proposed,
        changes = changes.len(),
        "observation constellation checked"
    );
    Ok(CheckOutcome { primary, changes })
}

fn apply(
    registry: &mut ConstellationRegistry,
    property: &str,
    proposed: ObservationType,
    candidates: &[ObservationConstellation],
    changes: &mut Vec<ConstellationChange>,
) -> Result<()> {
    for candidate in candidates {
        let untyped = registry
            .get(candidate.id)
            .is_some_and(|c| c.concrete_type().is_none());
        if untyped {
            changes.extend(registry.set_observation_type(candidate.id, proposed)?);
        }
    }

    let primary = &candidates[0];
    let resolved = registry
        .get(primary.id)
        .and_then(ObservationConstellation::concrete_type);

    changes.extend(expand_hidden_children(
        registry,
        &primary.procedure,
        property,
        &primary.offering,
        resolved,
    )?);
    Ok(())
}

/// Make sure every constituent of a composite property has a hidden-child
/// constellation under `(procedure, offering)`, recursing into composite
/// children. Untyped hidden children take `parent_type` when it is known.
///
/// Returns an empty change list for simple properties.
pub fn expand_hidden_children(
    registry: &mut ConstellationRegistry,
    procedure: &str,
    property: &str,
    offering: &str,
    parent_type: Option<ObservationType>,
) -> Result<Vec<ConstellationChange>> {
    let mut changes = Vec::new();
    let mut visited = BTreeSet::from([property.to_string()]);
    let mut pending: Vec<String> = children_of(registry, property);

    while let Some(child) = pending.pop() {
        if !visited.insert(child.clone()) {
            continue;
        }
        let upserted = registry.upsert(ConstellationKey::new(procedure, &child, offering), true);
        changes.extend(upserted.change);

        let hidden = upserted.constellation;
        if let Some(ty) = parent_type {
            if hidden.hidden_child && hidden.concrete_type().is_none() {
                changes.extend(registry.set_observation_type(hidden.id, ty)?);
            }
        }
        pending.extend(children_of(registry, &child));
    }
    Ok(changes)
}

fn children_of(registry: &ConstellationRegistry, property: &str) -> Vec<String> {
    registry
        .observable_property(property)
        .map(|p| p.children.iter().rev().cloned().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::UpsertOutcome;

    fn registry_with(keys: &[(&str, &str, &str)]) -> ConstellationRegistry {
        let mut reg = ConstellationRegistry::new();
        for (p, q, o) in keys {
            reg.upsert(ConstellationKey::new(*p, *q, *o), false);
        }
        reg
    }

    #[test]
    fn unknown_triple_is_rejected() {
        let mut reg = registry_with(&[("p", "q", "o")]);
        let err = check(&mut reg, Some("p"), "q", "elsewhere", ObservationType::Count).unwrap_err();
        assert!(matches!(err, CatalogError::UnknownConstellation { .. }));
        let err = check(&mut reg, Some("nobody"), "q", "o", ObservationType::Count).unwrap_err();
        assert!(matches!(err, CatalogError::UnknownConstellation { .. }));
    }

    #[test]
    fn first_check_assigns_type_and_second_conflicts() {
        let mut reg = registry_with(&[("p", "q", "o")]);
        let outcome = check(&mut reg, Some("p"), "q", "o", ObservationType::Measurement).unwrap();
        assert_eq!(
            outcome.primary.observation_type,
            Some(ObservationType::Measurement)
        );
        assert_eq!(outcome.changes.len(), 1);

        let err = check(&mut reg, Some("p"), "q", "o", ObservationType::Category).unwrap_err();
        match err {
            CatalogError::TypeConflict {
                stored, proposed, ..
            } => {
                assert_eq!(stored, ObservationType::Measurement);
                assert_eq!(proposed, ObservationType::Category);
            }
            other => panic!("expected TypeConflict, got {other:?}"),
        }

        let again = check(&mut reg, Some("p"), "q", "o", ObservationType::Measurement).unwrap();
        assert!(again.changes.is_empty());
    }

    #[test]
    fn wildcard_procedure_types_all_matches_and_picks_first() {
        let mut reg = registry_with(&[("b", "q", "o"), ("a", "q", "o")]);
        let outcome = check(&mut reg, None, "q", "o", ObservationType::Count).unwrap();
        assert_eq!(outcome.primary.procedure, "b");
        for c in reg.lookup(None, Some("q"), Some("o")) {
            assert_eq!(c.observation_type, Some(ObservationType::Count));
        }
    }

    fn parent_and_child(keys: &[(&str, &str, &str)]) -> ConstellationRegistry {
        let mut reg = registry_with(keys);
        reg.register_procedure(Procedure::new("parent")).unwrap();
        reg.register_procedure(Procedure::new("child").with_parent("parent"))
            .unwrap();
        reg
    }

    #[test]
    fn pinned_procedure_ignores_child_procedures() {
        let mut reg = parent_and_child(&[("child", "q", "o"), ("parent", "q", "o")]);
        let child = reg.lookup(Some("child"), None, None)[0].id;
        reg.set_observation_type(child, ObservationType::Category).unwrap();

        let outcome =
            check(&mut reg, Some("parent"), "q", "o", ObservationType::Measurement).unwrap();
        assert_eq!(outcome.primary.procedure, "parent");
        assert_eq!(
            outcome.primary.observation_type,
            Some(ObservationType::Measurement)
        );
        assert_eq!(
            reg.get(child).unwrap().observation_type,
            Some(ObservationType::Category)
        );
    }

    #[test]
    fn pinned_procedure_without_constellation_is_unknown_even_if_child_has_one() {
        let mut reg = parent_and_child(&[("child", "q", "o")]);
        let err = check(&mut reg, Some("parent"), "q", "o", ObservationType::Truth).unwrap_err();
        assert!(matches!(
            err,
            CatalogError::UnknownConstellation { procedure: Some(ref p), .. } if p == "parent"
        ));
        assert_eq!(reg.lookup(Some("child"), None, None)[0].observation_type, None);
    }

    #[test]
    fn conflict_in_any_match_leaves_registry_untouched() {
        let mut reg = registry_with(&[("a", "q", "o"), ("b", "q", "o")]);
        let b = reg.lookup(Some("b"), None, None)[0].id;
        reg.set_observation_type(b, ObservationType::Text).unwrap();

        let before = reg.constellations().to_vec();
        let err = check(&mut reg, None, "q", "o", ObservationType::Count).unwrap_err();
        assert!(matches!(err, CatalogError::TypeConflict { .. }));
        assert_eq!(reg.constellations(), before.as_slice());
    }

    #[test]
    fn composite_property_expands_hidden_children_with_parent_type() {
        let mut reg = registry_with(&[("proc", "P", "off")]);
        reg.register_observable_property(ObservableProperty::composite("P", ["C1", "C2"]));

        check(&mut reg, Some("proc"), "P", "off", ObservationType::Measurement).unwrap();

        for child in ["C1", "C2"] {
            let found = reg.lookup(Some("proc"), Some(child), Some("off"));
            assert_eq!(found.len(), 1, "{child}");
            assert!(found[0].hidden_child);
            assert_eq!(found[0].observation_type, Some(ObservationType::Measurement));
        }
    }

    #[test]
    fn composite_expansion_runs_for_existing_parent_and_nested_children() {
        let mut reg = registry_with(&[("proc", "P", "off")]);
        check(&mut reg, Some("proc"), "P", "off", ObservationType::Complex).unwrap();

        // children added after the parent already has a type
        reg.register_observable_property(ObservableProperty::composite("P", ["C1"]));
        reg.register_observable_property(ObservableProperty::composite("C1", ["G1", "P"]));
        let outcome = check(&mut reg, Some("proc"), "P", "off", ObservationType::Complex).unwrap();
        assert_eq!(outcome.changes.iter().filter(|c| c.is_creation()).count(), 2);

        let g1 = reg.lookup(Some("proc"), Some("G1"), Some("off"));
        assert_eq!(g1[0].observation_type, Some(ObservationType::Complex));
    }

    #[test]
    fn hidden_child_creation_reenables_disabled_child() {
        let mut reg = registry_with(&[("proc", "P", "off")]);
        reg.register_observable_property(ObservableProperty::composite("P", ["C1"]));
        let first = expand_hidden_children(&mut reg, "proc", "P", "off", None).unwrap();
        let child = first[0].after.clone();
        reg.disable(child.id).unwrap();

        let again = reg.upsert(ConstellationKey::new("proc", "C1", "off"), true);
        assert_eq!(again.outcome, UpsertOutcome::Reenabled);
        assert_eq!(again.constellation.id, child.id);
    }
}
