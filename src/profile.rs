//! Per-function measurement records and the module's function profile.
//!
//! Every compiled function carries rolling measurements (previous two
//! iterations plus the one in flight) and an optional aggregate window.
//! The profile also holds the authoritative "currently winning" pipeline
//! shared by all functions in the module.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Sub;

use crate::passes::Pass;

/// How the optimizer chooses the next pipeline to trial.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OptimizationStrategy {
    /// Leave the pipeline unchanged.
    Noop,
    /// The fixed, empirically selected pipeline.
    #[default]
    HandPicked,
    /// Append one uniformly drawn pass.
    RandomAdd,
    /// Replace a uniformly random position.
    RandomMutate,
    /// Randomly erase, replace, append, or hold.
    RandomGenetic,
    /// Append distinct passes until the catalog is exhausted.
    RandomDistinct,
}

impl fmt::Display for OptimizationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OptimizationStrategy::Noop => "NOOP",
            OptimizationStrategy::HandPicked => "HAND_PICKED",
            OptimizationStrategy::RandomAdd => "RANDOM_ADD",
            OptimizationStrategy::RandomMutate => "RANDOM_MUTATE",
            OptimizationStrategy::RandomGenetic => "RANDOM_GENETIC",
            OptimizationStrategy::RandomDistinct => "RANDOM_DISTINCT",
        };
        f.write_str(name)
    }
}

/// Knobs for one profiling iteration of the driver loop.
#[derive(Debug, Clone, Default)]
pub struct ProfilerControls {
    pub strategy: OptimizationStrategy,
    pub num_iterations_left: u64,
    pub should_agg: bool,
    pub should_print_agg: bool,
    pub should_print_fragment: bool,
}

/// Render a pipeline as `[p1;p2;…;]`.
pub fn pipeline_str(pipeline: &[Pass]) -> String {
    let mut out = String::from("[");
    for pass in pipeline {
        out.push_str(pass.name);
        out.push(';');
    }
    out.push(']');
    out
}

/// Measurements for one function over one iteration.
#[derive(Debug, Clone, Default)]
pub struct FunctionMetadata {
    /// Printed IR of the function.
    pub ir: String,
    /// Instruction count after optimization.
    pub inst_count: i64,
    /// Time taken to optimize the function.
    pub optimize_ns: i64,
    /// Time taken to run the function.
    pub exec_ns: i64,
    /// Strategy in effect when this function was optimized.
    pub strategy: OptimizationStrategy,
    /// Pipeline applied during this iteration.
    pub applied_pipeline: Vec<Pass>,
    /// Pipeline in effect before this iteration applied its changes.
    pub input_pipeline: Vec<Pass>,
}

impl PartialEq for FunctionMetadata {
    // Everything except the text representation.
    fn eq(&self, other: &Self) -> bool {
        self.inst_count == other.inst_count
            && self.optimize_ns == other.optimize_ns
            && self.exec_ns == other.exec_ns
            && self.strategy == other.strategy
            && self.applied_pipeline == other.applied_pipeline
            && self.input_pipeline == other.input_pipeline
    }
}

impl Sub for &FunctionMetadata {
    type Output = FunctionMetadata;

    fn sub(self, operand: &FunctionMetadata) -> FunctionMetadata {
        FunctionMetadata {
            inst_count: self.inst_count - operand.inst_count,
            optimize_ns: self.optimize_ns - operand.optimize_ns,
            exec_ns: self.exec_ns - operand.exec_ns,
            ..FunctionMetadata::default()
        }
    }
}

impl FunctionMetadata {
    pub fn to_str_short(&self) -> String {
        format!(
            "[{} insts, {} opt ns, {} exec ns]",
            self.inst_count, self.optimize_ns, self.exec_ns
        )
    }

    pub fn to_str_long(&self) -> String {
        format!("{} {}", self.to_str_short(), self.to_str_input_pipeline())
    }

    pub fn to_str_input_pipeline(&self) -> String {
        pipeline_str(&self.input_pipeline)
    }
}

/// Rolling aggregate over iteration samples.
#[derive(Debug, Clone, Default)]
pub struct MetadataAgg {
    pub num_samples: u64,
    pub original: FunctionMetadata,
    pub last: FunctionMetadata,
    pub min: FunctionMetadata,
    pub mean: FunctionMetadata,
    pub max: FunctionMetadata,
}

impl MetadataAgg {
    fn init(&mut self, sample: &FunctionMetadata) {
        self.num_samples = 1;
        self.original = sample.clone();
        self.last = sample.clone();
        self.min = sample.clone();
        self.mean = sample.clone();
        self.max = sample.clone();
    }

    fn update(&mut self, sample: &FunctionMetadata) {
        self.num_samples += 1;
        self.last = sample.clone();
        if sample.exec_ns < self.min.exec_ns {
            self.min = sample.clone();
        }
        // Running mean; no thought was given to numerical stability.
        let n = self.num_samples as f64;
        self.mean.inst_count =
            (((self.mean.inst_count as f64) * (n - 1.0) + sample.inst_count as f64) / n) as i64;
        self.mean.optimize_ns =
            (((self.mean.optimize_ns as f64) * (n - 1.0) + sample.optimize_ns as f64) / n) as i64;
        self.mean.exec_ns =
            (((self.mean.exec_ns as f64) * (n - 1.0) + sample.exec_ns as f64) / n) as i64;
        if sample.exec_ns > self.max.exec_ns {
            self.max = sample.clone();
        }
    }
}

#[derive(Debug, Default)]
struct FunctionSlot {
    prev_prev: FunctionMetadata,
    prev: FunctionMetadata,
    curr: FunctionMetadata,
    agg: MetadataAgg,
}

/// Measurement state for every function in one compiled module.
#[derive(Debug, Default)]
pub struct FunctionProfile {
    strategy: OptimizationStrategy,
    num_iterations_left: u64,
    steps: Vec<String>,
    teardowns: Vec<String>,
    functions: BTreeMap<String, FunctionSlot>,
    /// The single authoritative current-best / in-trial pipeline.
    profile_pipeline: Vec<Pass>,
    combined_agg: MetadataAgg,
    should_update_agg: bool,
    agg_initialized: bool,
    iteration_pipeline_chosen: bool,
}

impl FunctionProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_strategy(&mut self, strategy: OptimizationStrategy) {
        self.strategy = strategy;
    }

    pub fn strategy(&self) -> OptimizationStrategy {
        self.strategy
    }

    /// When this reaches zero there are no more profiling iterations
    /// coming; a strategy gets one last chance to settle.
    pub fn set_num_iterations_left(&mut self, num_iterations_left: u64) {
        self.num_iterations_left = num_iterations_left;
    }

    pub fn num_iterations_left(&self) -> u64 {
        self.num_iterations_left
    }

    pub fn register_steps(&mut self, steps: Vec<String>) {
        self.steps = steps;
    }

    pub fn register_teardowns(&mut self, teardowns: Vec<String>) {
        self.teardowns = teardowns;
    }

    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    pub fn teardowns(&self) -> &[String] {
        &self.teardowns
    }

    pub fn prev_mut(&mut self, func_name: &str) -> &mut FunctionMetadata {
        &mut self.slot_mut(func_name).prev
    }

    pub fn curr_mut(&mut self, func_name: &str) -> &mut FunctionMetadata {
        &mut self.slot_mut(func_name).curr
    }

    pub fn agg(&self, func_name: &str) -> Option<&MetadataAgg> {
        self.functions.get(func_name).map(|slot| &slot.agg)
    }

    fn slot_mut(&mut self, func_name: &str) -> &mut FunctionSlot {
        self.functions.entry(func_name.to_string()).or_default()
    }

    /// Combined measurements of the previous iteration across every step
    /// and teardown function.
    pub fn combined_prev(&self) -> FunctionMetadata {
        self.combined(|slot| &slot.prev)
    }

    /// Same, over the iteration before the previous one.
    pub fn combined_prev_prev(&self) -> FunctionMetadata {
        self.combined(|slot| &slot.prev_prev)
    }

    fn combined<'a>(&'a self, select: impl Fn(&'a FunctionSlot) -> &'a FunctionMetadata) -> FunctionMetadata {
        let mut result = FunctionMetadata::default();
        for (name, slot) in &self.functions {
            let is_step = self.steps.iter().any(|s| s == name);
            let is_teardown = self.teardowns.iter().any(|t| t == name);
            if is_step || is_teardown {
                let md = select(slot);
                result.inst_count += md.inst_count.abs();
                result.optimize_ns += md.optimize_ns.abs();
                result.exec_ns += md.exec_ns.abs();
                result.strategy = md.strategy;
                result.applied_pipeline = md.applied_pipeline.clone();
                result.input_pipeline = md.input_pipeline.clone();
            }
        }
        result
    }

    pub fn combined_agg(&self) -> &MetadataAgg {
        &self.combined_agg
    }

    /// Arm aggregation, resetting every aggregate.
    ///
    /// # Panics
    /// Panics if aggregation is already armed.
    pub fn start_agg(&mut self) {
        assert!(!self.should_update_agg, "already aggregating");
        self.should_update_agg = true;
        self.agg_initialized = false;
        for slot in self.functions.values_mut() {
            slot.agg = MetadataAgg::default();
        }
        self.combined_agg = MetadataAgg::default();
    }

    /// Disarm aggregation; previous values stay readable for reporting.
    pub fn stop_agg(&mut self) {
        self.should_update_agg = false;
    }

    pub fn is_agg(&self) -> bool {
        self.should_update_agg
    }

    pub fn profile_pipeline(&self) -> &[Pass] {
        &self.profile_pipeline
    }

    /// Overwrite the authoritative current pipeline.
    pub fn set_profile_pipeline(&mut self, pipeline: Vec<Pass>) {
        self.profile_pipeline = pipeline;
    }

    pub fn iteration_pipeline_chosen(&self) -> bool {
        self.iteration_pipeline_chosen
    }

    pub fn mark_iteration_pipeline_chosen(&mut self) {
        self.iteration_pipeline_chosen = true;
    }

    /// Roll every function's measurements forward one iteration and feed
    /// the armed aggregates.
    pub fn end_iteration(&mut self) {
        for slot in self.functions.values_mut() {
            slot.prev_prev = std::mem::replace(&mut slot.prev, std::mem::take(&mut slot.curr));
            if self.should_update_agg {
                if !self.agg_initialized {
                    slot.agg.init(&slot.prev);
                    // agg_initialized is set after the combined aggregate
                    // below so every function initializes this iteration.
                } else {
                    slot.agg.update(&slot.prev);
                }
            }
        }
        if self.should_update_agg {
            let combined = self.combined_prev();
            if !self.agg_initialized {
                self.combined_agg.init(&combined);
            } else {
                self.combined_agg.update(&combined);
            }
            self.agg_initialized = true;
        }
        self.iteration_pipeline_chosen = false;
    }

    /// Zero per-function counters without discarding registered names.
    pub fn reset(&mut self) {
        for slot in self.functions.values_mut() {
            *slot = FunctionSlot::default();
        }
        self.combined_agg = MetadataAgg::default();
        self.agg_initialized = false;
        self.iteration_pipeline_chosen = false;
    }

    /// Dump the current IR of every function to the log sink.
    pub fn print_module(&self) {
        for (name, slot) in &self.functions {
            tracing::info!(function = %name, ir = %slot.curr.ir, "function IR");
        }
    }
}
