//! Service implementations and their selection.

use crate::error::RuntimeError;
use async_trait::async_trait;
use cirrina_core::ContextVariable;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// An invocable implementation of a logical service.
#[async_trait]
pub trait ServiceImplementation: Send + Sync {
    /// Logical service name.
    fn name(&self) -> &str;

    /// Static cost of an invocation.
    fn cost(&self) -> f64;

    /// Whether the implementation runs locally.
    fn is_local(&self) -> bool;

    /// Current performance estimate, higher is better.
    fn performance(&self) -> f64;

    /// Invokes the service with evaluated input variables.
    async fn invoke(
        &self,
        input: Vec<ContextVariable>,
    ) -> Result<Vec<ContextVariable>, RuntimeError>;
}

type ServiceFn =
    dyn Fn(Vec<ContextVariable>) -> Result<Vec<ContextVariable>, RuntimeError> + Send + Sync;

/// A service implementation backed by a closure.
pub struct FunctionServiceImplementation {
    name: String,
    cost: f64,
    local: bool,
    performance: f64,
    function: Arc<ServiceFn>,
}

impl FunctionServiceImplementation {
    pub fn new<F>(name: impl Into<String>, cost: f64, local: bool, function: F) -> Self
    where
        F: Fn(Vec<ContextVariable>) -> Result<Vec<ContextVariable>, RuntimeError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            cost,
            local,
            performance: 1.0,
            function: Arc::new(function),
        }
    }

    /// Sets the performance estimate.
    pub fn with_performance(mut self, performance: f64) -> Self {
        self.performance = performance;
        self
    }
}

impl fmt::Debug for FunctionServiceImplementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionServiceImplementation")
            .field("name", &self.name)
            .field("cost", &self.cost)
            .field("local", &self.local)
            .field("performance", &self.performance)
            .finish()
    }
}

#[async_trait]
impl ServiceImplementation for FunctionServiceImplementation {
    fn name(&self) -> &str {
        &self.name
    }

    fn cost(&self) -> f64 {
        self.cost
    }

    fn is_local(&self) -> bool {
        self.local
    }

    fn performance(&self) -> f64 {
        self.performance
    }

    async fn invoke(
        &self,
        input: Vec<ContextVariable>,
    ) -> Result<Vec<ContextVariable>, RuntimeError> {
        (self.function)(input)
    }
}

/// Selects service implementations by name.
///
/// Among the candidates with the requested name (only local ones when
/// locality is required), the one minimizing `cost / performance` wins,
/// where both are normalized by the maximum among the candidates.
#[derive(Default, Clone)]
pub struct ServiceImplementationSelector {
    implementations: HashMap<String, Vec<Arc<dyn ServiceImplementation>>>,
}

impl ServiceImplementationSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an implementation under its name.
    pub fn register(&mut self, implementation: Arc<dyn ServiceImplementation>) {
        self.implementations
            .entry(implementation.name().to_string())
            .or_default()
            .push(implementation);
    }

    /// Returns the number of registered implementations.
    pub fn len(&self) -> usize {
        self.implementations.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Selects an implementation. `local` requires a local implementation;
    /// when false, local and remote implementations both qualify.
    pub fn select(&self, name: &str, local: bool) -> Option<Arc<dyn ServiceImplementation>> {
        let candidates: Vec<&Arc<dyn ServiceImplementation>> = self
            .implementations
            .get(name)?
            .iter()
            .filter(|implementation| !local || implementation.is_local())
            .collect();

        let max_cost = normalizer(candidates.iter().map(|c| c.cost()));
        let max_performance = normalizer(candidates.iter().map(|c| c.performance()));

        let score = |candidate: &Arc<dyn ServiceImplementation>| {
            let cost = candidate.cost() / max_cost;
            let performance = candidate.performance() / max_performance;
            if performance > 0.0 {
                cost / performance
            } else {
                f64::INFINITY
            }
        };

        candidates
            .into_iter()
            .min_by(|a, b| score(*a).total_cmp(&score(*b)))
            .cloned()
    }
}

impl FromIterator<Arc<dyn ServiceImplementation>> for ServiceImplementationSelector {
    fn from_iter<I: IntoIterator<Item = Arc<dyn ServiceImplementation>>>(iter: I) -> Self {
        let mut selector = Self::new();
        for implementation in iter {
            selector.register(implementation);
        }
        selector
    }
}

/// Maximum of the values, or 1 when it is not positive.
fn normalizer(values: impl Iterator<Item = f64>) -> f64 {
    let max = values.fold(f64::NEG_INFINITY, f64::max);
    if max > 0.0 {
        max
    } else {
        1.0
    }
}
