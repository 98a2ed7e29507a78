//! Scenario builder
//!
//! A [`Scenario`] owns a universe whose root carries a `children`
//! containment collection. Mutables spawned through the scenario are created
//! and attached under the root in one cycle.

use ripple_core::{
    ClassId, EngineConfig, MutableId, ObserverError, ObserverId, ObserverKey, Properties, Property, PropertyId,
    RippleResult, Value,
};
use ripple_runtime::{Action, ClassDef, CycleReport, ObserverContext, Priority, Universe};

/// Class of the universe root
pub const ROOT: ClassId = ClassId(0);

pub struct ScenarioBuilder {
    properties: Properties,
    children: PropertyId,
    config: EngineConfig,
}

impl ScenarioBuilder {
    /// Register a property; ids are handed out in registration order
    pub fn property(&mut self, property: Property) -> PropertyId {
        self.properties.register(property)
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Scenario {
        Scenario {
            universe: Universe::with_config(self.properties, ROOT, self.config),
            children: self.children,
        }
    }
}

pub struct Scenario {
    universe: Universe,
    children: PropertyId,
}

impl Scenario {
    pub fn builder() -> ScenarioBuilder {
        let mut properties = Properties::new();
        let children = properties.register(Property::observed("children", Value::set([])).containment());
        ScenarioBuilder {
            properties,
            children,
            config: EngineConfig::default(),
        }
    }

    /// The root's containment collection
    pub fn children(&self) -> PropertyId {
        self.children
    }

    pub fn universe(&self) -> &Universe {
        &self.universe
    }

    pub fn universe_mut(&mut self) -> &mut Universe {
        &mut self.universe
    }

    pub fn observer<F>(&mut self, name: &str, priority: Priority, rule: F) -> ObserverId
    where
        F: Fn(&mut ObserverContext<'_>) -> Result<(), ObserverError> + Send + Sync + 'static,
    {
        self.universe.add_observer(name, priority, rule)
    }

    pub fn class(&mut self, class: ClassId, observers: Vec<ObserverId>, properties: Vec<PropertyId>) -> RippleResult<()> {
        self.universe.define_class(class, ClassDef { observers, properties })
    }

    /// Run the first cycle without an external edit
    pub fn start(&mut self) -> CycleReport {
        self.universe.run_cycle()
    }

    pub fn put<F>(&mut self, action: F) -> RippleResult<CycleReport>
    where
        F: FnOnce(&mut Action<'_>) -> RippleResult<()>,
    {
        self.universe.put(action)
    }

    /// Create a mutable of `class`, initialise it and attach it under the root
    pub fn spawn<F>(&mut self, class: ClassId, init: F) -> RippleResult<(MutableId, CycleReport)>
    where
        F: FnOnce(&mut Action<'_>, MutableId) -> RippleResult<()>,
    {
        let children = self.children;
        let mut spawned = MutableId::UNIVERSE;
        let report = self.universe.put(|action| {
            spawned = action.create(class);
            init(action, spawned)?;
            action.add(MutableId::UNIVERSE, children, spawned.into())
        })?;
        Ok((spawned, report))
    }

    /// Current value of `object.property`; unknown properties read as empty
    pub fn value(&self, object: MutableId, property: PropertyId) -> Value {
        self.universe.get(object, property).unwrap_or_default()
    }

    /// Re-run the given instances in a cycle of their own
    pub fn idle(&mut self, keys: &[ObserverKey]) -> RippleResult<CycleReport> {
        for key in keys {
            self.universe.trigger(key.mutable, key.observer)?;
        }
        Ok(self.universe.run_cycle())
    }
}
