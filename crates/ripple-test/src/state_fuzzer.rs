//! State Fuzzer - Random external edits against a small derived model
//!
//! Model:
//! - Nodes under the root, each with an `input` and a derived `doubled`
//! - A `total` on the root, derived from the inputs of all attached nodes
//!
//! Between cycles the fuzzer edits inputs, spawns nodes and detaches nodes at
//! random. After every cycle the derived values must match their inputs and
//! the cycle must report no errors.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ripple_core::{ClassId, MutableId, Property, PropertyId, RippleResult, TransactionId, Value};
use ripple_runtime::Priority;

use crate::scenario::{Scenario, ROOT};

const NODE: ClassId = ClassId(1);

/// Fuzzer configuration
#[derive(Clone, Debug)]
pub struct FuzzerConfig {
    /// Nodes attached before the first edit
    pub initial_nodes: usize,
    /// Number of edit cycles
    pub cycles: usize,
    /// Edits per cycle
    pub edits_per_cycle: usize,
    /// Probability that an edit spawns a node
    pub spawn_prob: f64,
    /// Probability that an edit detaches a node
    pub detach_prob: f64,
    /// Random seed
    pub seed: u64,
}

impl Default for FuzzerConfig {
    fn default() -> Self {
        FuzzerConfig {
            initial_nodes: 8,
            cycles: 50,
            edits_per_cycle: 4,
            spawn_prob: 0.1,
            detach_prob: 0.05,
            seed: 42,
        }
    }
}

impl FuzzerConfig {
    /// Light fuzzing for quick tests
    pub fn light() -> Self {
        FuzzerConfig {
            initial_nodes: 3,
            cycles: 10,
            edits_per_cycle: 2,
            spawn_prob: 0.1,
            detach_prob: 0.0,
            seed: 42,
        }
    }

    /// Heavy fuzzing for thorough testing
    pub fn heavy() -> Self {
        FuzzerConfig {
            initial_nodes: 32,
            cycles: 500,
            edits_per_cycle: 16,
            spawn_prob: 0.2,
            detach_prob: 0.1,
            seed: 42,
        }
    }
}

/// One random external edit
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FuzzEdit {
    SetInput(MutableId, i64),
    Spawn(i64),
    Detach(MutableId),
}

/// Invariant broken after a cycle
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    pub txid: TransactionId,
    pub message: String,
}

/// Fuzzing result
#[derive(Debug, Default)]
pub struct FuzzResult {
    pub cycles: usize,
    pub runs: usize,
    pub edits: usize,
    pub violations: Vec<Violation>,
}

impl FuzzResult {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Property ids of the fuzz model
#[derive(Clone, Copy, Debug)]
struct Model {
    input: PropertyId,
    doubled: PropertyId,
    total: PropertyId,
}

pub struct StateFuzzer {
    config: FuzzerConfig,
    scenario: Scenario,
    model: Model,
    nodes: Vec<MutableId>,
    rng: StdRng,
}

impl StateFuzzer {
    pub fn new(config: FuzzerConfig) -> RippleResult<Self> {
        let mut builder = Scenario::builder();
        let model = Model {
            input: builder.property(Property::observed("input", Value::Int(0))),
            doubled: builder.property(Property::observed("doubled", Value::Int(0))),
            total: builder.property(Property::observed("total", Value::Int(0))),
        };
        let mut scenario = builder.build();
        let children = scenario.children();

        let double = scenario.observer("double", Priority::Forward, move |ctx| {
            let me = ctx.mutable();
            let input = ctx.get(me, model.input).as_int().unwrap_or(0);
            ctx.set(me, model.doubled, Value::Int(input * 2))
        });
        let sum = scenario.observer("sum", Priority::Forward, move |ctx| {
            let root = ctx.mutable();
            let nodes = ctx.get(root, children).mutables();
            let total = nodes.into_iter().map(|n| ctx.get(n, model.input).as_int().unwrap_or(0)).sum::<i64>();
            ctx.set(root, model.total, Value::Int(total))
        });
        scenario.class(NODE, vec![double], vec![model.input, model.doubled])?;
        scenario.class(ROOT, vec![sum], vec![model.total])?;

        Ok(StateFuzzer {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            scenario,
            model,
            nodes: Vec::new(),
        })
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    fn generate_edit(&mut self) -> FuzzEdit {
        let roll = self.rng.gen::<f64>();
        if self.nodes.is_empty() || roll < self.config.spawn_prob {
            return FuzzEdit::Spawn(self.rng.gen_range(-100..100));
        }
        let node = self.nodes[self.rng.gen_range(0..self.nodes.len())];
        if roll < self.config.spawn_prob + self.config.detach_prob {
            FuzzEdit::Detach(node)
        } else {
            FuzzEdit::SetInput(node, self.rng.gen_range(-100..100))
        }
    }

    /// Run the fuzzer
    pub fn run(&mut self) -> RippleResult<FuzzResult> {
        let mut result = FuzzResult::default();
        let initial: Vec<FuzzEdit> = (0..self.config.initial_nodes)
            .map(|_| FuzzEdit::Spawn(self.rng.gen_range(-100..100)))
            .collect();
        self.apply(initial, &mut result)?;

        for _ in 0..self.config.cycles {
            let edits: Vec<FuzzEdit> = (0..self.config.edits_per_cycle).map(|_| self.generate_edit()).collect();
            self.apply(edits, &mut result)?;
        }
        Ok(result)
    }

    fn apply(&mut self, edits: Vec<FuzzEdit>, result: &mut FuzzResult) -> RippleResult<()> {
        let Model { input, .. } = self.model;
        let children = self.scenario.children();
        let mut spawned = Vec::new();
        let mut detached = Vec::new();
        result.edits += edits.len();

        let report = self.scenario.put(|action| {
            for edit in &edits {
                match edit {
                    FuzzEdit::SetInput(node, value) => action.set(*node, input, Value::Int(*value))?,
                    FuzzEdit::Spawn(value) => {
                        let node = action.create(NODE);
                        action.set(node, input, Value::Int(*value))?;
                        action.add(MutableId::UNIVERSE, children, node.into())?;
                        spawned.push(node);
                    }
                    FuzzEdit::Detach(node) => {
                        action.remove(MutableId::UNIVERSE, children, &(*node).into())?;
                        detached.push(*node);
                    }
                }
            }
            Ok(())
        })?;

        self.nodes.extend(spawned);
        self.nodes.retain(|n| !detached.contains(n));
        result.cycles += 1;
        result.runs += report.runs.len();
        for error in &report.errors {
            result.violations.push(Violation { txid: report.txid, message: error.to_string() });
        }
        self.check_invariants(report.txid, result);
        Ok(())
    }

    /// Check the derived values of every attached node and of the root
    fn check_invariants(&self, txid: TransactionId, result: &mut FuzzResult) {
        let Model { input, doubled, total } = self.model;
        let mut violation = |message: String| result.violations.push(Violation { txid, message });

        let mut sum = 0;
        for node in &self.nodes {
            let i = self.scenario.value(*node, input).as_int().unwrap_or(0);
            let d = self.scenario.value(*node, doubled).as_int().unwrap_or(0);
            if d != i * 2 {
                violation(format!("{node}: doubled {d} for input {i}"));
            }
            sum += i;
        }
        let t = self.scenario.value(MutableId::UNIVERSE, total).as_int().unwrap_or(0);
        if t != sum {
            violation(format!("total {t}, expected {sum}"));
        }
        let attached = self.scenario.value(MutableId::UNIVERSE, self.scenario.children()).len();
        if attached != self.nodes.len() {
            violation(format!("{attached} attached nodes, expected {}", self.nodes.len()));
        }
    }
}
