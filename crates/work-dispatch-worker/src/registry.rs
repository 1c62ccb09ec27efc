use crate::error::DispatchError;
use crate::store::UnitFilter;
use crate::unit::{ProcessingUnit, Target, UnitContext, VerifyResults};
use tracing::{error, info, warn};

/// Processing units in registration order
pub struct CapabilityRegistry {
    units: Vec<Box<dyn ProcessingUnit>>,
    prepared: bool,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        CapabilityRegistry {
            units: Vec::new(),
            prepared: false,
        }
    }

    /// Register a unit; it runs after every unit registered before it
    pub fn register<U: ProcessingUnit + 'static>(&mut self, unit: U) -> &mut Self {
        self.register_boxed(Box::new(unit))
    }

    pub fn register_boxed(&mut self, unit: Box<dyn ProcessingUnit>) -> &mut Self {
        self.units.push(unit);
        self.prepared = false;
        self
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub fn names(&self) -> Vec<String> {
        self.units.iter().map(|u| u.name().to_string()).collect()
    }

    pub fn units(&self) -> impl Iterator<Item = &dyn ProcessingUnit> + '_ {
        self.units.iter().map(|u| u.as_ref())
    }

    /// Prepare and verify every unit.
    ///
    /// All units are prepared even after one fails, so operators see every
    /// problem at once. Any failure is returned as an error.
    pub async fn prepare_all(&mut self, ctx: &UnitContext) -> Result<(), DispatchError> {
        let mut failed = Vec::new();

        for unit in self.units.iter_mut() {
            let name = unit.name().to_string();
            let results = unit.verify().await;
            for failure in results.failures() {
                warn!(unit = %name, "Verify failed: {}", failure);
            }

            match unit.prepare(ctx).await {
                Ok(()) => info!(unit = %name, "Prepared processing unit"),
                Err(e) => {
                    error!(unit = %name, "Failed to prepare processing unit: {:#}", e);
                    failed.push(name);
                }
            }
        }

        if !failed.is_empty() {
            return Err(DispatchError::Prepare(failed));
        }
        self.prepared = true;
        Ok(())
    }

    /// Units that claim `target`, in registration order.
    ///
    /// `DELETE` targets are routed through `is_delete_handled`.
    pub fn claimants(&self, target: &Target, filter: &UnitFilter) -> Vec<&dyn ProcessingUnit> {
        self.units()
            .filter(|unit| filter.permits(unit.name()))
            .filter(|unit| {
                if target.status.is_delete() {
                    unit.is_delete_handled(target)
                } else {
                    unit.is_handled(target)
                }
            })
            .collect()
    }

    pub async fn verify_all(&self) -> Vec<(String, VerifyResults)> {
        let mut results = Vec::with_capacity(self.units.len());
        for unit in self.units() {
            results.push((unit.name().to_string(), unit.verify().await));
        }
        results
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{UnitInput, WorkData};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use work_dispatch_core::{ElementRef, ElementStatus, PropertyRef};

    struct Named {
        name: &'static str,
        property: Option<&'static str>,
        deletes: bool,
        fail_prepare: bool,
    }

    impl Named {
        fn new(name: &'static str) -> Self {
            Named {
                name,
                property: None,
                deletes: false,
                fail_prepare: false,
            }
        }
    }

    #[async_trait]
    impl ProcessingUnit for Named {
        fn name(&self) -> &str {
            self.name
        }

        async fn prepare(&mut self, _ctx: &UnitContext) -> anyhow::Result<()> {
            if self.fail_prepare {
                anyhow::bail!("missing model file");
            }
            Ok(())
        }

        fn is_handled(&self, target: &Target) -> bool {
            match self.property {
                Some(name) => target.property_name() == Some(name),
                None => true,
            }
        }

        fn is_delete_handled(&self, _target: &Target) -> bool {
            self.deletes
        }

        async fn execute(&self, _input: UnitInput, _work: &WorkData<'_>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn verify(&self) -> VerifyResults {
            if self.fail_prepare {
                VerifyResults::failed("model file not found")
            } else {
                VerifyResults::ok()
            }
        }
    }

    fn ctx() -> UnitContext {
        UnitContext::new("w1", "q", PathBuf::from("/tmp"))
    }

    fn names(units: Vec<&dyn ProcessingUnit>) -> Vec<&str> {
        units.into_iter().map(|u| u.name()).collect()
    }

    #[test]
    fn test_claimants_in_registration_order() {
        let mut registry = CapabilityRegistry::new();
        registry
            .register(Named::new("b"))
            .register(Named {
                property: Some("raw"),
                ..Named::new("a")
            })
            .register(Named::new("c"));

        let vertex = ElementRef::Vertex("v1".to_string());
        let raw = Target::property(vertex.clone(), PropertyRef::named("raw"), ElementStatus::New);
        let title = Target::property(vertex, PropertyRef::named("title"), ElementStatus::New);
        let all = UnitFilter::default();

        assert_eq!(names(registry.claimants(&raw, &all)), vec!["b", "a", "c"]);
        assert_eq!(names(registry.claimants(&title, &all)), vec!["b", "c"]);

        let deny_b = UnitFilter {
            allow: Vec::new(),
            deny: vec!["b".to_string()],
        };
        assert_eq!(names(registry.claimants(&raw, &deny_b)), vec!["a", "c"]);
    }

    #[test]
    fn test_delete_routing() {
        let mut registry = CapabilityRegistry::new();
        registry.register(Named::new("indexer")).register(Named {
            deletes: true,
            ..Named::new("cleanup")
        });

        let target = Target::element(ElementRef::Edge("e1".to_string()), ElementStatus::Delete);
        assert_eq!(
            names(registry.claimants(&target, &UnitFilter::default())),
            vec!["cleanup"]
        );
    }

    #[tokio::test]
    async fn test_prepare_all_reports_every_failure() {
        let mut registry = CapabilityRegistry::new();
        registry
            .register(Named {
                fail_prepare: true,
                ..Named::new("ocr")
            })
            .register(Named::new("log"))
            .register(Named {
                fail_prepare: true,
                ..Named::new("nlp")
            });

        match registry.prepare_all(&ctx()).await {
            Err(DispatchError::Prepare(failed)) => assert_eq!(failed, vec!["ocr", "nlp"]),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!registry.is_prepared());

        let verified = registry.verify_all().await;
        assert_eq!(verified.len(), 3);
        assert!(!verified[0].1.is_ok());
        assert!(verified[1].1.is_ok());
    }

    #[tokio::test]
    async fn test_prepare_all_success() {
        let mut registry = CapabilityRegistry::new();
        registry.register(Named::new("log"));
        registry.prepare_all(&ctx()).await.unwrap();
        assert!(registry.is_prepared());
        assert_eq!(registry.names(), vec!["log"]);
    }
}
