use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use crate::{config::ConfigError, conflict::ConflictResolver, resource::ResourceManager};

use super::{PipelineDefinition, HIGHEST_PRIORITY, LOWEST_PRIORITY};

/// A validated set of pipeline definitions keyed by name.
///
/// Construction enforces the properties the scheduler relies on to stay deadlock free:
///
/// - every name in `depends_on` and `conflicts_with` refers to a known pipeline,
/// - dependencies are acyclic,
/// - conflicts are symmetric (if `a` conflicts with `b` then `b` conflicts with `a`; missing
///   back-edges are added),
/// - no pipeline needs more database connections than the whole budget.
///
/// Resource groups are checked separately by [`PipelineRegistry::check_resource_groups`] since
/// they depend on the engine's resources.
#[derive(Debug, Clone, Default)]
pub struct PipelineRegistry {
    pipelines: BTreeMap<String, Arc<PipelineDefinition>>,
}

impl PipelineRegistry {
    pub fn new(
        definitions: impl IntoIterator<Item = PipelineDefinition>,
        db_connection_budget: u32,
    ) -> Result<Self, ConfigError> {
        let mut pipelines = BTreeMap::new();
        for definition in definitions {
            validate_definition(&definition, db_connection_budget)?;
            if pipelines.contains_key(&definition.name) {
                return Err(ConfigError::DuplicatePipeline(definition.name));
            }
            pipelines.insert(definition.name.clone(), definition);
        }

        for definition in pipelines.values() {
            for reference in definition.depends_on.iter().chain(&definition.conflicts_with) {
                if !pipelines.contains_key(reference) {
                    return Err(ConfigError::UnknownPipeline {
                        pipeline: definition.name.clone(),
                        reference: reference.clone(),
                    });
                }
            }
        }

        ConflictResolver::dependency_order(pipelines.values())?;

        make_conflicts_symmetric(&mut pipelines);

        Ok(Self {
            pipelines: pipelines
                .into_iter()
                .map(|(name, definition)| (name, Arc::new(definition)))
                .collect(),
        })
    }

    /// Fails if a pipeline names a resource group `resources` does not know.
    pub fn check_resource_groups(&self, resources: &ResourceManager) -> Result<(), ConfigError> {
        for definition in self.iter() {
            if let Some(group) = &definition.resource_group {
                if !resources.contains(group) {
                    return Err(ConfigError::InvalidPipeline {
                        pipeline: definition.name.clone(),
                        reason: format!("unknown resource group {group}"),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<PipelineDefinition>> {
        self.pipelines.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pipelines.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<PipelineDefinition>> {
        self.pipelines.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pipelines.keys().map(String::as_str)
    }

    /// Enabled pipelines with a recurring trigger.
    pub fn scheduled(&self) -> impl Iterator<Item = &Arc<PipelineDefinition>> {
        self.iter()
            .filter(|definition| definition.enabled && definition.trigger.is_recurring())
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}

fn validate_definition(
    definition: &PipelineDefinition,
    db_connection_budget: u32,
) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidPipeline {
        pipeline: definition.name.clone(),
        reason,
    };

    if definition.name.trim().is_empty() {
        return Err(invalid("name must not be empty".to_owned()));
    }
    if !(HIGHEST_PRIORITY..=LOWEST_PRIORITY).contains(&definition.priority) {
        return Err(invalid(format!(
            "priority {} is outside {HIGHEST_PRIORITY}..={LOWEST_PRIORITY}",
            definition.priority
        )));
    }
    if definition.timeout_seconds == 0 {
        return Err(invalid("timeout must be at least one second".to_owned()));
    }
    if definition.retry.max_attempts == 0 {
        return Err(invalid("max_attempts must be at least 1".to_owned()));
    }
    if !definition.retry.backoff_multiplier.is_finite() || definition.retry.backoff_multiplier <= 0.0
    {
        return Err(invalid(format!(
            "backoff multiplier {} must be positive",
            definition.retry.backoff_multiplier
        )));
    }
    if definition.max_db_connections > db_connection_budget {
        return Err(invalid(format!(
            "needs {} database connections but the budget is {db_connection_budget}",
            definition.max_db_connections
        )));
    }
    if definition.depends_on.contains(&definition.name)
        || definition.conflicts_with.contains(&definition.name)
    {
        return Err(invalid("a pipeline cannot depend or conflict on itself".to_owned()));
    }
    if definition.entry_point.program.trim().is_empty() {
        return Err(invalid("entry point program must not be empty".to_owned()));
    }
    definition.trigger.validate()
}

fn make_conflicts_symmetric(pipelines: &mut BTreeMap<String, PipelineDefinition>) {
    let edges = pipelines
        .values()
        .flat_map(|definition| {
            definition
                .conflicts_with
                .iter()
                .map(|other| (other.clone(), definition.name.clone()))
        })
        .collect::<BTreeSet<_>>();

    for (pipeline, conflicting) in edges {
        if let Some(definition) = pipelines.get_mut(&pipeline) {
            if !definition.conflicts_with.contains(&conflicting) {
                tracing::debug!(
                    %pipeline,
                    %conflicting,
                    "Adding missing conflict {pipeline} -> {conflicting}"
                );
                definition.conflicts_with.push(conflicting);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;
    use crate::pipeline::{EntryPoint, RetryPolicy, Trigger};

    fn pipeline(name: &str) -> PipelineDefinition {
        PipelineDefinition::new(name, EntryPoint::new("true"))
    }

    #[test]
    fn conflicts_are_made_symmetric() {
        let registry = PipelineRegistry::new(
            [pipeline("x").with_conflicts_with(["y"]), pipeline("y")],
            10,
        )
        .unwrap();

        assert_eq!(registry.get("y").unwrap().conflicts_with, vec!["x"]);
        assert_eq!(registry.get("x").unwrap().conflicts_with, vec!["y"]);
    }

    #[test]
    fn unknown_references_are_rejected() {
        assert_matches!(
            PipelineRegistry::new([pipeline("a").with_depends_on(["missing"])], 10),
            Err(ConfigError::UnknownPipeline { pipeline, reference })
                if pipeline == "a" && reference == "missing"
        );
        assert_matches!(
            PipelineRegistry::new([pipeline("a").with_conflicts_with(["missing"])], 10),
            Err(ConfigError::UnknownPipeline { .. })
        );
    }

    #[test]
    fn dependency_cycles_are_rejected() {
        let result = PipelineRegistry::new(
            [
                pipeline("a").with_depends_on(["c"]),
                pipeline("b").with_depends_on(["a"]),
                pipeline("c").with_depends_on(["b"]),
            ],
            10,
        );

        assert_matches!(result, Err(ConfigError::DependencyCycle { pipelines }) if pipelines.len() == 3);
    }

    #[test]
    fn duplicates_are_rejected() {
        assert_matches!(
            PipelineRegistry::new([pipeline("a"), pipeline("a")], 10),
            Err(ConfigError::DuplicatePipeline(name)) if name == "a"
        );
    }

    #[test]
    fn invalid_definitions_are_rejected() {
        let cases = [
            pipeline("p").with_priority(0),
            pipeline("p").with_priority(11),
            pipeline("p").with_max_db_connections(11),
            pipeline("p").with_depends_on(["p"]),
            pipeline("p").with_retry(RetryPolicy::new(0, 1, 2.0)),
            pipeline("p").with_retry(RetryPolicy::new(3, 1, 0.0)),
            pipeline("p").with_timeout(std::time::Duration::ZERO),
            pipeline("p").with_trigger(Trigger::cron("bogus")),
        ];

        for case in cases {
            assert!(PipelineRegistry::new([case.clone()], 10).is_err(), "{case:?}");
        }
    }

    #[test]
    fn unknown_resource_groups_are_rejected() {
        let resources = ResourceManager::new([("http_api", 2)]);
        let known = PipelineRegistry::new([pipeline("a").with_resource_group("http_api")], 10)
            .unwrap();
        let unknown = PipelineRegistry::new([pipeline("b").with_resource_group("soap_api")], 10)
            .unwrap();

        assert!(known.check_resource_groups(&resources).is_ok());
        assert_matches!(
            unknown.check_resource_groups(&resources),
            Err(ConfigError::InvalidPipeline { pipeline, reason })
                if pipeline == "b" && reason == "unknown resource group soap_api"
        );
    }

    #[test]
    fn scheduled_skips_manual_and_disabled_pipelines() {
        let every_minute = Trigger::every(std::time::Duration::from_secs(60));
        let registry = PipelineRegistry::new(
            [
                pipeline("manual"),
                pipeline("disabled")
                    .with_trigger(every_minute.clone())
                    .disabled(),
                pipeline("scheduled").with_trigger(every_minute),
            ],
            10,
        )
        .unwrap();

        let scheduled = registry
            .scheduled()
            .map(|definition| definition.name.as_str())
            .collect::<Vec<_>>();

        assert_eq!(scheduled, vec!["scheduled"]);
        assert_eq!(registry.len(), 3);
    }
}
