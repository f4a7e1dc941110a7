//! ConstellationRegistry: in-memory source of truth for observation
//! constellations and the entity definitions they reference.
//!
//! Every mutation returns [`ConstellationChange`] records (before/after) so the
//! caller can persist exactly what changed, publish it to the content cache,
//! or [`ConstellationRegistry::revert`] it when persistence fails.
//!
//! Invariants:
//! - at most one non-disabled constellation per (procedure, property, offering)
//! - a concrete observation type is never replaced by a different one
//! - the procedure parent graph is acyclic

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{CatalogError, Result};
use crate::types::*;

/// Before/after image of one constellation mutation. `before` is `None` when
/// the constellation was created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstellationChange {
    pub before: Option<ObservationConstellation>,
    pub after: ObservationConstellation,
}

impl ConstellationChange {
    pub fn is_creation(&self) -> bool {
        self.before.is_none()
    }

    pub fn is_reenable(&self) -> bool {
        self.before.as_ref().is_some_and(|b| b.disabled) && !self.after.disabled
    }

    pub fn is_disable(&self) -> bool {
        self.before.as_ref().is_some_and(|b| !b.disabled) && self.after.disabled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Existing,
    Reenabled,
    Created,
}

#[derive(Debug, Clone)]
pub struct Upserted {
    pub constellation: ObservationConstellation,
    pub outcome: UpsertOutcome,
    pub change: Option<ConstellationChange>,
}

#[derive(Debug, Clone, Default)]
pub struct ConstellationRegistry {
    /// Insertion order is the deterministic order of `lookup`.
    constellations: Vec<ObservationConstellation>,
    position: HashMap<ConstellationId, usize>,
    by_key: HashMap<ConstellationKey, Vec<ConstellationId>>,
    procedures: BTreeMap<String, Procedure>,
    properties: BTreeMap<String, ObservableProperty>,
    offerings: BTreeMap<String, Offering>,
    features: BTreeMap<String, Feature>,
}

impl ConstellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Constellation reads ──────────────────────────────────────

    /// All non-disabled constellations matching the given keys; `None` is a
    /// wildcard. Results are in insertion order.
    pub fn lookup(
        &self,
        procedure: Option<&str>,
        observable_property: Option<&str>,
        offering: Option<&str>,
    ) -> Vec<&ObservationConstellation> {
        if let (Some(p), Some(q), Some(o)) = (procedure, observable_property, offering) {
            return self
                .active(&ConstellationKey::new(p, q, o))
                .into_iter()
                .collect();
        }
        self.constellations
            .iter()
            .filter(|c| !c.disabled && c.matches(procedure, observable_property, offering))
            .collect()
    }

    pub fn get(&self, id: ConstellationId) -> Option<&ObservationConstellation> {
        self.position.get(&id).map(|&i| &self.constellations[i])
    }

    /// Every constellation, disabled ones included, in insertion order.
    pub fn constellations(&self) -> &[ObservationConstellation] {
        &self.constellations
    }

    pub fn len(&self) -> usize {
        self.constellations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constellations.is_empty()
    }

    fn active(&self, key: &ConstellationKey) -> Option<&ObservationConstellation> {
        self.by_key
            .get(key)?
            .iter()
            .filter_map(|id| self.get(*id))
            .find(|c| !c.disabled)
    }

    fn disabled_match(&self, key: &ConstellationKey) -> Option<&ObservationConstellation> {
        self.by_key
            .get(key)?
            .iter()
            .filter_map(|id| self.get(*id))
            .find(|c| c.disabled)
    }

    // ── Constellation writes ─────────────────────────────────────

    /// Return the active constellation for `key`, re-enabling a disabled one
    /// (same identity) or creating a new one with the type unset.
    ///
    /// An explicit (non-hidden) upsert promotes a hidden-child constellation
    /// to a visible one.
    pub fn upsert(&mut self, key: ConstellationKey, hidden_child: bool) -> Upserted {
        if let Some(existing) = self.active(&key).cloned() {
            if existing.hidden_child && !hidden_child {
                let mut after = existing.clone();
                after.hidden_child = false;
                let change = self.replace(existing, after.clone());
                return Upserted {
                    constellation: after,
                    outcome: UpsertOutcome::Existing,
                    change: Some(change),
                };
            }
            return Upserted {
                constellation: existing,
                outcome: UpsertOutcome::Existing,
                change: None,
            };
        }

        if let Some(disabled) = self.disabled_match(&key).cloned() {
            let mut after = disabled.clone();
            after.disabled = false;
            after.hidden_child = disabled.hidden_child && hidden_child;
            let change = self.replace(disabled, after.clone());
            tracing::debug!(id = %after.id, procedure = %after.procedure,
                property = %after.observable_property, offering = %after.offering,
                "re-enabled observation constellation");
            return Upserted {
                constellation: after,
                outcome: UpsertOutcome::Reenabled,
                change: Some(change),
            };
        }

        let created = ObservationConstellation::new(key, hidden_child);
        self.push(created.clone());
        tracing::debug!(id = %created.id, procedure = %created.procedure,
            property = %created.observable_property, offering = %created.offering,
            hidden_child, "created observation constellation");
        Upserted {
            change: Some(ConstellationChange {
                before: None,
                after: created.clone(),
            }),
            constellation: created,
            outcome: UpsertOutcome::Created,
        }
    }

    /// Check whether `ty` may be assigned to `id` without mutating anything.
    pub fn validate_type(&self, id: ConstellationId, ty: ObservationType) -> Result<()> {
        let target = self
            .get(id)
            .ok_or_else(|| CatalogError::NotFound(format!("constellation {id}")))?;
        match target.concrete_type() {
            Some(stored) if ty.is_concrete() && stored != ty => Err(CatalogError::TypeConflict {
                procedure: target.procedure.clone(),
                property: target.observable_property.clone(),
                offering: target.offering.clone(),
                stored,
                proposed: ty,
            }),
            _ => Ok(()),
        }
    }

    /// Assign the observation type and propagate it to hidden-child siblings.
    ///
    /// Siblings are constellations with the same procedure and property in
    /// other offerings that are flagged `hidden_child`, disabled or not. Only
    /// siblings without a concrete type receive it; propagation never runs
    /// from a hidden child.
    pub fn set_observation_type(
        &mut self,
        id: ConstellationId,
        ty: ObservationType,
    ) -> Result<Vec<ConstellationChange>> {
        self.validate_type(id, ty)?;
        let target = self
            .get(id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(format!("constellation {id}")))?;

        let mut changes = Vec::new();
        if !ty.is_concrete() {
            // The sentinel never downgrades anything and has nothing to propagate.
            if target.observation_type.is_none() {
                let mut after = target.clone();
                after.observation_type = Some(ty);
                changes.push(self.replace(target, after));
            }
            return Ok(changes);
        }

        if target.observation_type != Some(ty) {
            let mut after = target.clone();
            after.observation_type = Some(ty);
            changes.push(self.replace(target.clone(), after));
        }

        if !target.hidden_child {
            changes.extend(self.propagate_to_hidden_siblings(&target, ty));
        }
        Ok(changes)
    }

    fn propagate_to_hidden_siblings(
        &mut self,
        origin: &ObservationConstellation,
        ty: ObservationType,
    ) -> Vec<ConstellationChange> {
        let siblings: Vec<ObservationConstellation> = self
            .constellations
            .iter()
            .filter(|c| {
                c.hidden_child
                    && c.procedure == origin.procedure
                    && c.observable_property == origin.observable_property
                    && c.offering != origin.offering
            })
            .cloned()
            .collect();

        let mut changes = Vec::new();
        for sibling in siblings {
            match sibling.concrete_type() {
                None => {
                    let mut after = sibling.clone();
                    after.observation_type = Some(ty);
                    changes.push(self.replace(sibling, after));
                }
                Some(existing) if existing != ty => {
                    tracing::warn!(id = %sibling.id, offering = %sibling.offering,
                        stored = %existing, proposed = %ty,
                        "hidden child keeps its conflicting observation type");
                }
                Some(_) => {}
            }
        }
        changes
    }

    pub fn disable(&mut self, id: ConstellationId) -> Result<Option<ConstellationChange>> {
        let current = self
            .get(id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(format!("constellation {id}")))?;
        if current.disabled {
            return Ok(None);
        }
        let mut after = current.clone();
        after.disabled = true;
        Ok(Some(self.replace(current, after)))
    }

    /// Undo `changes` in reverse order.
    pub fn revert(&mut self, changes: &[ConstellationChange]) {
        let mut removed = false;
        for change in changes.iter().rev() {
            match &change.before {
                Some(before) => {
                    if let Some(&i) = self.position.get(&before.id) {
                        self.constellations[i] = before.clone();
                    }
                }
                None => {
                    if let Some(i) = self.position.remove(&change.after.id) {
                        self.constellations.remove(i);
                        removed = true;
                    }
                }
            }
        }
        if removed {
            self.reindex();
        }
    }

    /// Insert a constellation loaded from the store. A second active record
    /// for an already active key is kept but disabled in memory.
    pub fn insert_loaded(&mut self, mut record: ObservationConstellation) {
        if self.position.contains_key(&record.id) {
            return;
        }
        if !record.disabled && self.active(&record.key()).is_some() {
            tracing::warn!(id = %record.id, procedure = %record.procedure,
                property = %record.observable_property, offering = %record.offering,
                "duplicate active constellation in store; disabling in memory");
            record.disabled = true;
        }
        self.push(record);
    }

    fn push(&mut self, c: ObservationConstellation) {
        self.position.insert(c.id, self.constellations.len());
        self.by_key.entry(c.key()).or_default().push(c.id);
        self.constellations.push(c);
    }

    fn replace(
        &mut self,
        before: ObservationConstellation,
        after: ObservationConstellation,
    ) -> ConstellationChange {
        if let Some(&i) = self.position.get(&before.id) {
            self.constellations[i] = after.clone();
        }
        ConstellationChange {
            before: Some(before),
            after,
        }
    }

    fn reindex(&mut self) {
        self.position.clear();
        self.by_key.clear();
        for (i, c) in self.constellations.iter().enumerate() {
            self.position.insert(c.id, i);
            self.by_key.entry(c.key()).or_default().push(c.id);
        }
    }

    // ── Procedures ───────────────────────────────────────────────

    /// Reject a parent link that would close a cycle in the hierarchy.
    pub fn check_parent_link(&self, procedure: &str, parent: Option<&str>) -> Result<()> {
        let Some(parent) = parent else {
            return Ok(());
        };
        let mut seen = BTreeSet::new();
        let mut cursor = Some(parent);
        while let Some(current) = cursor {
            if current == procedure || !seen.insert(current) {
                return Err(CatalogError::CycleDetected {
                    procedure: procedure.to_string(),
                    parent: parent.to_string(),
                });
            }
            cursor = self
                .procedures
                .get(current)
                .and_then(|p| p.parent.as_deref());
        }
        Ok(())
    }

    /// Insert or update a procedure. The parent link is checked first.
    pub fn register_procedure(&mut self, procedure: Procedure) -> Result<()> {
        self.check_parent_link(procedure.id(), procedure.parent.as_deref())?;
        self.procedures
            .insert(procedure.id().to_string(), procedure);
        Ok(())
    }

    /// Soft-disable a procedure and every constellation that references it.
    pub fn disable_procedure(&mut self, id: &str) -> Result<Vec<ConstellationChange>> {
        let procedure = self
            .procedures
            .get_mut(id)
            .ok_or_else(|| CatalogError::NotFound(format!("procedure {id}")))?;
        procedure.disabled = true;

        let children = self.child_procedures(id);
        if !children.is_empty() {
            tracing::debug!(procedure = id, children = ?children, "disabled procedure keeps its child procedures");
        }

        let ids: Vec<ConstellationId> = self
            .constellations
            .iter()
            .filter(|c| c.procedure == id && !c.disabled)
            .map(|c| c.id)
            .collect();
        let mut changes = Vec::with_capacity(ids.len());
        for cid in ids {
            changes.extend(self.disable(cid)?);
        }
        Ok(changes)
    }

    /// Direct children, derived from the parent links.
    pub fn child_procedures(&self, id: &str) -> Vec<&str> {
        self.procedures
            .values()
            .filter(|p| p.parent.as_deref() == Some(id))
            .map(Procedure::id)
            .collect()
    }

    pub fn procedure(&self, id: &str) -> Option<&Procedure> {
        self.procedures.get(id)
    }

    pub fn procedures(&self) -> impl Iterator<Item = &Procedure> {
        self.procedures.values()
    }

    // ── Properties, offerings, features ──────────────────────────

    /// The record `property` would become if registered now: existing
    /// children are kept in order and new ones appended.
    pub fn merged_observable_property(&self, property: &ObservableProperty) -> ObservableProperty {
        let Some(existing) = self.properties.get(property.id()) else {
            return property.clone();
        };
        let mut merged = existing.clone();
        for child in &property.children {
            if !merged.children.contains(child) {
                merged.children.push(child.clone());
            }
        }
        if property.descriptor.name.is_some() {
            merged.descriptor.name = property.descriptor.name.clone();
        }
        if property.descriptor.description.is_some() {
            merged.descriptor.description = property.descriptor.description.clone();
        }
        merged
    }

    /// Insert or update a property; composite children only grow.
    pub fn register_observable_property(&mut self, property: ObservableProperty) {
        let merged = self.merged_observable_property(&property);
        self.properties.insert(merged.id().to_string(), merged);
    }

    pub fn observable_property(&self, id: &str) -> Option<&ObservableProperty> {
        self.properties.get(id)
    }

    pub fn observable_properties(&self) -> impl Iterator<Item = &ObservableProperty> {
        self.properties.values()
    }

    pub fn register_offering(&mut self, offering: Offering) {
        self.offerings.insert(offering.id().to_string(), offering);
    }

    pub fn offering(&self, id: &str) -> Option<&Offering> {
        self.offerings.get(id)
    }

    pub fn offerings(&self) -> impl Iterator<Item = &Offering> {
        self.offerings.values()
    }

    pub fn register_feature(&mut self, feature: Feature) {
        self.features.insert(feature.id().to_string(), feature);
    }

    pub fn feature(&self, id: &str) -> Option<&Feature> {
        self.features.get(id)
    }

    pub fn features(&self) -> impl Iterator<Item = &Feature> {
        self.features.values()
    }
}
