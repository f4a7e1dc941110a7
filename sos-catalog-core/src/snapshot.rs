//! ContentSnapshot: the immutable, read-optimized view of the catalog.
//!
//! A snapshot is built wholesale from the registry plus series extrema, or
//! derived from the previous snapshot by an additive patch. It is never
//! mutated after publication; readers holding an `Arc` to it keep a
//! consistent view for as long as they like.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::events::CacheDelta;
use crate::registry::ConstellationRegistry;
use crate::time_extrema::{SeriesExtrema, TimeExtremaAggregator};
use crate::types::*;

type Index = BTreeMap<String, BTreeSet<String>>;

fn link(index: &mut Index, from: &str, to: &str) {
    index
        .entry(from.to_string())
        .or_default()
        .insert(to.to_string());
}

fn members<'a>(index: &'a Index, key: &str) -> Vec<&'a str> {
    index
        .get(key)
        .map(|set| set.iter().map(String::as_str).collect())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub generation: u64,
    pub procedures: usize,
    pub observable_properties: usize,
    pub offerings: usize,
    pub features: usize,
    pub constellations: usize,
    pub series: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ContentSnapshot {
    generation: u64,

    procedures: BTreeMap<String, Procedure>,
    observable_properties: BTreeMap<String, ObservableProperty>,
    offerings: BTreeMap<String, Offering>,
    features: BTreeMap<String, Feature>,
    /// Active (non-disabled) constellations only.
    constellations: BTreeMap<ConstellationId, ObservationConstellation>,

    procedures_for_offering: Index,
    visible_procedures_for_offering: Index,
    offerings_for_procedure: Index,
    properties_for_offering: Index,
    offerings_for_property: Index,
    properties_for_procedure: Index,
    procedures_for_property: Index,
    features_for_offering: Index,
    procedures_for_feature: Index,
    observation_types_for_offering: BTreeMap<String, BTreeSet<ObservationType>>,

    parent_of: BTreeMap<String, String>,
    children_of: Index,

    series_extrema: TimeExtremaAggregator<SeriesKey>,
    offering_extrema: TimeExtremaAggregator<String>,
}

impl ContentSnapshot {
    /// An empty snapshot with generation 0.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Full build from the registry and freshly loaded series extrema.
    pub fn build(
        registry: &ConstellationRegistry,
        series_extrema: TimeExtremaAggregator<SeriesKey>,
        generation: u64,
    ) -> Self {
        let mut snap = Self {
            generation,
            ..Self::default()
        };
        for p in registry.procedures() {
            snap.put_procedure(p.clone());
        }
        for p in registry.observable_properties() {
            snap.observable_properties
                .insert(p.id().to_string(), p.clone());
        }
        for o in registry.offerings() {
            snap.offerings.insert(o.id().to_string(), o.clone());
        }
        for f in registry.features() {
            snap.features.insert(f.id().to_string(), f.clone());
        }
        for c in registry.constellations().iter().filter(|c| !c.disabled) {
            snap.index_constellation(c);
        }
        for (key, extrema) in series_extrema.iter() {
            snap.index_series(key);
            snap.offering_extrema
                .merge_extrema(key.offering.clone(), *extrema);
        }
        snap.series_extrema = series_extrema;
        snap
    }

    /// Additive patch: returns a new snapshot with the delta folded in and
    /// the generation bumped. `self` is left untouched.
    pub fn patched(&self, delta: &CacheDelta) -> Self {
        let mut next = self.clone();
        next.generation = self.generation + 1;

        for p in &delta.procedures {
            next.put_procedure(p.clone());
        }
        for p in &delta.observable_properties {
            next.observable_properties
                .insert(p.id().to_string(), p.clone());
        }
        for o in &delta.offerings {
            next.offerings.insert(o.id().to_string(), o.clone());
        }
        for f in &delta.features {
            next.features.insert(f.id().to_string(), f.clone());
        }
        for c in delta.constellations.iter().filter(|c| !c.disabled) {
            next.index_constellation(c);
        }
        if let Some(series) = &delta.series {
            next.index_series(series);
            next.series_extrema.update(series, &delta.observed_times);
            next.offering_extrema
                .update(&series.offering, &delta.observed_times);
        }
        next
    }

    /// Whether an additive patch can represent `delta` faithfully. False when
    /// the delta disables constellations, or names a procedure, property or
    /// offering this snapshot has never seen without carrying a record for it.
    pub fn can_patch(&self, delta: &CacheDelta) -> bool {
        if delta.constellations.iter().any(|c| c.disabled) {
            return false;
        }
        let known_procedure = |id: &str| {
            self.procedures.contains_key(id)
                || self.offerings_for_procedure.contains_key(id)
                || delta.procedures.iter().any(|p| p.id() == id)
                || delta.constellations.iter().any(|c| c.procedure == id)
        };
        let known_property = |id: &str| {
            self.observable_properties.contains_key(id)
                || self.offerings_for_property.contains_key(id)
                || delta.observable_properties.iter().any(|p| p.id() == id)
                || delta.constellations.iter().any(|c| c.observable_property == id)
        };
        let known_offering = |id: &str| {
            self.offerings.contains_key(id)
                || self.procedures_for_offering.contains_key(id)
                || delta.offerings.iter().any(|o| o.id() == id)
                || delta.constellations.iter().any(|c| c.offering == id)
        };

        delta.procedure.as_deref().is_none_or(known_procedure)
            && delta.observable_property.as_deref().is_none_or(known_property)
            && delta.offering.as_deref().is_none_or(known_offering)
    }

    pub(crate) fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    fn put_procedure(&mut self, procedure: Procedure) {
        let id = procedure.id().to_string();
        if let Some(old_parent) = self.parent_of.remove(&id) {
            if let Some(siblings) = self.children_of.get_mut(&old_parent) {
                siblings.remove(&id);
            }
        }
        if let Some(parent) = &procedure.parent {
            self.parent_of.insert(id.clone(), parent.clone());
            link(&mut self.children_of, parent, &id);
        }
        self.procedures.insert(id, procedure);
    }

    fn index_constellation(&mut self, c: &ObservationConstellation) {
        let (p, q, o) = (&c.procedure, &c.observable_property, &c.offering);
        link(&mut self.procedures_for_offering, o, p);
        link(&mut self.offerings_for_procedure, p, o);
        link(&mut self.properties_for_offering, o, q);
        link(&mut self.offerings_for_property, q, o);
        link(&mut self.properties_for_procedure, p, q);
        link(&mut self.procedures_for_property, q, p);
        if !c.hidden_child {
            link(&mut self.visible_procedures_for_offering, o, p);
        }
        if let Some(ty) = c.concrete_type() {
            self.observation_types_for_offering
                .entry(o.clone())
                .or_default()
                .insert(ty);
        }
        self.constellations.insert(c.id, c.clone());
    }

    fn index_series(&mut self, key: &SeriesKey) {
        link(&mut self.features_for_offering, &key.offering, &key.feature);
        link(&mut self.procedures_for_feature, &key.feature, &key.procedure);
    }

    // ── Membership queries ───────────────────────────────────────

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn procedures_for_offering(&self, offering: &str) -> Vec<&str> {
        members(&self.procedures_for_offering, offering)
    }

    pub fn offerings_for_procedure(&self, procedure: &str) -> Vec<&str> {
        members(&self.offerings_for_procedure, procedure)
    }

    pub fn observable_properties_for_offering(&self, offering: &str) -> Vec<&str> {
        members(&self.properties_for_offering, offering)
    }

    pub fn offerings_for_observable_property(&self, property: &str) -> Vec<&str> {
        members(&self.offerings_for_property, property)
    }

    pub fn observable_properties_for_procedure(&self, procedure: &str) -> Vec<&str> {
        members(&self.properties_for_procedure, procedure)
    }

    pub fn procedures_for_observable_property(&self, property: &str) -> Vec<&str> {
        members(&self.procedures_for_property, property)
    }

    /// Procedures that appear under `offering` only through hidden-child
    /// constellations.
    pub fn hidden_child_procedures_for_offering(&self, offering: &str) -> Vec<&str> {
        let visible = self.visible_procedures_for_offering.get(offering);
        self.procedures_for_offering(offering)
            .into_iter()
            .filter(|p| visible.is_none_or(|v| !v.contains(*p)))
            .collect()
    }

    pub fn features_for_offering(&self, offering: &str) -> Vec<&str> {
        members(&self.features_for_offering, offering)
    }

    pub fn procedures_for_feature(&self, feature: &str) -> Vec<&str> {
        members(&self.procedures_for_feature, feature)
    }

    pub fn observation_types_for_offering(&self, offering: &str) -> Vec<ObservationType> {
        self.observation_types_for_offering
            .get(offering)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Active constellations matching the wildcard keys.
    pub fn constellations(
        &self,
        procedure: Option<&str>,
        observable_property: Option<&str>,
        offering: Option<&str>,
    ) -> Vec<&ObservationConstellation> {
        self.constellations
            .values()
            .filter(|c| c.matches(procedure, observable_property, offering))
            .collect()
    }

    // ── Hierarchy ────────────────────────────────────────────────

    /// Ancestors of `id`, nearest first when not recursive. Disabled
    /// procedures are walked through but omitted unless `include_disabled`.
    pub fn parent_procedures(&self, id: &str, recursive: bool, include_disabled: bool) -> Vec<&str> {
        let mut found = BTreeSet::new();
        let mut cursor = self.parent_of.get(id);
        while let Some(parent) = cursor {
            if !found.insert(parent.as_str()) {
                break;
            }
            if !recursive {
                break;
            }
            cursor = self.parent_of.get(parent);
        }
        self.without_disabled(found, include_disabled)
    }

    /// Descendants of `id`; only direct children when not recursive.
    pub fn child_procedures(&self, id: &str, recursive: bool, include_disabled: bool) -> Vec<&str> {
        let mut found = BTreeSet::new();
        let mut frontier: Vec<&str> = members(&self.children_of, id);
        while let Some(child) = frontier.pop() {
            if !found.insert(child) {
                continue;
            }
            if recursive {
                frontier.extend(members(&self.children_of, child));
            }
        }
        self.without_disabled(found, include_disabled)
    }

    fn without_disabled<'a>(&self, ids: BTreeSet<&'a str>, include_disabled: bool) -> Vec<&'a str> {
        ids.into_iter()
            .filter(|id| {
                include_disabled || !self.procedures.get(*id).is_some_and(|p| p.disabled)
            })
            .collect()
    }

    // ── Time extrema ─────────────────────────────────────────────

    /// `None` until the series has observations.
    pub fn time_extrema(&self, series: &SeriesKey) -> Option<SeriesExtrema> {
        self.series_extrema.get(series).copied()
    }

    pub fn offering_time_extrema(&self, offering: &str) -> Option<SeriesExtrema> {
        self.offering_extrema.get(&offering.to_string()).copied()
    }

    pub fn global_phenomenon_time(&self) -> Option<TimePeriod> {
        self.offering_extrema.overall().map(|e| e.phenomenon_time)
    }

    pub fn series(&self) -> impl Iterator<Item = &SeriesKey> {
        self.series_extrema.iter().map(|(k, _)| k)
    }

    // ── Entities ─────────────────────────────────────────────────

    pub fn procedure(&self, id: &str) -> Option<&Procedure> {
        self.procedures.get(id)
    }

    pub fn observable_property(&self, id: &str) -> Option<&ObservableProperty> {
        self.observable_properties.get(id)
    }

    pub fn offering(&self, id: &str) -> Option<&Offering> {
        self.offerings.get(id)
    }

    pub fn feature(&self, id: &str) -> Option<&Feature> {
        self.features.get(id)
    }

    pub fn procedure_ids(&self) -> Vec<&str> {
        self.procedures.keys().map(String::as_str).collect()
    }

    pub fn offering_ids(&self) -> Vec<&str> {
        self.offerings.keys().map(String::as_str).collect()
    }

    pub fn observable_property_ids(&self) -> Vec<&str> {
        self.observable_properties
            .keys()
            .map(String::as_str)
            .collect()
    }

    pub fn feature_ids(&self) -> Vec<&str> {
        self.features.keys().map(String::as_str).collect()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            generation: self.generation,
            procedures: self.procedures.len(),
            observable_properties: self.observable_properties.len(),
            offerings: self.offerings.len(),
            features: self.features.len(),
            constellations: self.constellations.len(),
            series: self.series_extrema.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn hierarchy_registry() -> ConstellationRegistry {
        let mut reg = ConstellationRegistry::new();
        reg.register_procedure(Procedure::new("procedure1")).unwrap();
        reg.register_procedure(Procedure::new("procedure2").with_parent("procedure1"))
            .unwrap();
        reg.register_procedure(Procedure::new("procedure3").with_parent("procedure2"))
            .unwrap();
        for i in 1..=3 {
            reg.register_offering(Offering::new(format!("offering{i}")));
            reg.register_observable_property(ObservableProperty::new(format!("obsprop{i}")));
            reg.upsert(
                ConstellationKey::new(
                    format!("procedure{i}"),
                    format!("obsprop{i}"),
                    format!("offering{i}"),
                ),
                false,
            );
        }
        reg
    }

    #[test]
    fn hierarchy_closure() {
        let snap = ContentSnapshot::build(&hierarchy_registry(), TimeExtremaAggregator::new(), 1);
        assert_eq!(
            snap.parent_procedures("procedure3", true, false),
            vec!["procedure1", "procedure2"]
        );
        assert_eq!(
            snap.parent_procedures("procedure3", false, false),
            vec!["procedure2"]
        );
        assert_eq!(
            snap.child_procedures("procedure1", true, false),
            vec!["procedure2", "procedure3"]
        );
        assert_eq!(
            snap.child_procedures("procedure1", false, false),
            vec!["procedure2"]
        );
        assert!(snap.child_procedures("procedure3", true, true).is_empty());
    }

    #[test]
    fn disabled_procedures_are_walked_through_but_hidden() {
        let mut reg = hierarchy_registry();
        reg.disable_procedure("procedure2").unwrap();
        let snap = ContentSnapshot::build(&reg, TimeExtremaAggregator::new(), 1);
        assert_eq!(
            snap.parent_procedures("procedure3", true, false),
            vec!["procedure1"]
        );
        assert_eq!(
            snap.parent_procedures("procedure3", true, true),
            vec!["procedure1", "procedure2"]
        );
        assert_eq!(
            snap.child_procedures("procedure1", true, false),
            vec!["procedure3"]
        );
        assert!(snap.offerings_for_procedure("procedure2").is_empty());
    }

    #[test]
    fn membership_indices() {
        let mut reg = hierarchy_registry();
        reg.upsert(ConstellationKey::new("procedure1", "obsprop3", "offering3"), false);
        let snap = ContentSnapshot::build(&reg, TimeExtremaAggregator::new(), 1);

        assert_eq!(snap.offerings_for_procedure("procedure3"), vec!["offering3"]);
        assert_eq!(
            snap.procedures_for_offering("offering3"),
            vec!["procedure1", "procedure3"]
        );
        assert_eq!(
            snap.observable_properties_for_procedure("procedure1"),
            vec!["obsprop1", "obsprop3"]
        );
        assert_eq!(
            snap.procedures_for_observable_property("obsprop3"),
            vec!["procedure1", "procedure3"]
        );
        assert_eq!(
            snap.offerings_for_observable_property("obsprop1"),
            vec!["offering1"]
        );
        assert_eq!(
            snap.observable_properties_for_offering("offering3"),
            vec!["obsprop3"]
        );
        assert!(snap.procedures_for_offering("nowhere").is_empty());
    }

    #[test]
    fn hidden_child_only_procedures() {
        let mut reg = ConstellationRegistry::new();
        reg.upsert(ConstellationKey::new("visible", "P", "off"), false);
        reg.upsert(ConstellationKey::new("visible", "C", "off"), true);
        reg.upsert(ConstellationKey::new("component", "C", "off"), true);
        let snap = ContentSnapshot::build(&reg, TimeExtremaAggregator::new(), 1);

        assert_eq!(
            snap.procedures_for_offering("off"),
            vec!["component", "visible"]
        );
        assert_eq!(
            snap.hidden_child_procedures_for_offering("off"),
            vec!["component"]
        );
    }

    #[test]
    fn patch_leaves_previous_snapshot_untouched() {
        let old = ContentSnapshot::build(&hierarchy_registry(), TimeExtremaAggregator::new(), 1);
        let series = SeriesKey::new("procedure3", "obsprop3", "feature1", "offering3");
        let mut c = ObservationConstellation::new(
            ConstellationKey::new("procedure3", "obsprop1", "offering1"),
            false,
        );
        c.observation_type = Some(ObservationType::Measurement);

        let delta = CacheDelta {
            series: Some(series.clone()),
            observed_times: vec![ObservedTimes::instant(t(1_000))],
            constellations: vec![c],
            features: vec![Feature::new("feature1", Feature::SAMPLING_POINT)],
            ..Default::default()
        };
        assert!(old.can_patch(&delta));
        let new = old.patched(&delta);

        assert_eq!(new.generation(), 2);
        assert_eq!(
            new.offerings_for_procedure("procedure3"),
            vec!["offering1", "offering3"]
        );
        assert_eq!(new.features_for_offering("offering3"), vec!["feature1"]);
        assert_eq!(new.procedures_for_feature("feature1"), vec!["procedure3"]);
        assert_eq!(
            new.observation_types_for_offering("offering1"),
            vec![ObservationType::Measurement]
        );
        assert_eq!(
            new.time_extrema(&series).unwrap().phenomenon_time,
            TimePeriod::instant(t(1_000))
        );

        assert_eq!(old.generation(), 1);
        assert_eq!(old.offerings_for_procedure("procedure3"), vec!["offering3"]);
        assert!(old.features_for_offering("offering3").is_empty());
        assert!(old.time_extrema(&series).is_none());
    }

    #[test]
    fn unknown_names_or_disables_cannot_be_patched() {
        let snap = ContentSnapshot::build(&hierarchy_registry(), TimeExtremaAggregator::new(), 1);
        let drift = CacheDelta {
            procedure: Some("ghost".into()),
            ..Default::default()
        };
        assert!(!snap.can_patch(&drift));

        let carried = CacheDelta {
            procedure: Some("ghost".into()),
            procedures: vec![Procedure::new("ghost")],
            ..Default::default()
        };
        assert!(snap.can_patch(&carried));

        let mut disabled =
            ObservationConstellation::new(ConstellationKey::new("procedure1", "obsprop1", "offering1"), false);
        disabled.disabled = true;
        let disabling = CacheDelta {
            constellations: vec![disabled],
            ..Default::default()
        };
        assert!(!snap.can_patch(&disabling));
    }

    #[test]
    fn offering_and_global_extrema() {
        let mut series = TimeExtremaAggregator::new();
        series.update(
            &SeriesKey::new("p", "q", "f1", "o1"),
            &[ObservedTimes::period(t(10), t(20))],
        );
        series.update(
            &SeriesKey::new("p", "q", "f2", "o1"),
            &[ObservedTimes::instant(t(40))],
        );
        series.update(
            &SeriesKey::new("p", "q", "f1", "o2"),
            &[ObservedTimes::instant(t(5))],
        );
        let snap = ContentSnapshot::build(&ConstellationRegistry::new(), series, 1);

        assert_eq!(
            snap.offering_time_extrema("o1").unwrap().phenomenon_time,
            TimePeriod::new(t(10), t(40))
        );
        assert_eq!(
            snap.global_phenomenon_time(),
            Some(TimePeriod::new(t(5), t(40)))
        );
        assert_eq!(snap.features_for_offering("o1"), vec!["f1", "f2"]);
        assert_eq!(snap.stats().series, 3);
    }

    #[test]
    fn reparenting_moves_child_links() {
        let snap = ContentSnapshot::build(&hierarchy_registry(), TimeExtremaAggregator::new(), 1);
        let delta = CacheDelta {
            procedures: vec![Procedure::new("procedure3").with_parent("procedure1")],
            ..Default::default()
        };
        let next = snap.patched(&delta);
        assert_eq!(
            next.child_procedures("procedure1", false, true),
            vec!["procedure2", "procedure3"]
        );
        assert!(next.child_procedures("procedure2", false, true).is_empty());
    }
}
