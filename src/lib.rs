//! Kiln - Adaptive JIT Query Execution Runtime
//!
//! Kiln is the self-profiling core of a JIT-compiling query execution
//! engine. Query fragments are compiled to executable functions, timed on
//! every invocation, and re-optimized between runs by a feedback-driven
//! search over a catalog of optimization passes.
//!
//! # Features
//!
//! - **Pass Catalog**: A fixed-order registry of named function-level
//!   optimization passes with index-based lookup for search strategies
//! - **Function Profiling**: Per-function instruction counts, optimization
//!   time, and execution time with rolling aggregates
//! - **Adaptive Optimization**: Noop, hand-picked, and four randomized
//!   strategies search the pipeline space; a regression check promotes or
//!   rejects candidates against the best seen so far
//! - **Fragment Runtime**: Ordered step execution over an opaque
//!   query-state block with cooperative abort and teardown handling
//! - **Recompilation Loop**: Force-recompile drops compiled entries so the
//!   next resolution executes under the newly applied pipeline
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use kiln::ir::{FunctionIr, ModuleIr, Op};
//! use kiln::{
//!     ExecutableQuery, ExecutionContext, ExecutionMode, Fragment, Module,
//!     OptimizationStrategy, ProfilerControls, Result,
//! };
//!
//! fn main() -> Result<()> {
//!     // Front-end output: one step function over the query-state block.
//!     let mut ir = ModuleIr::new();
//!     ir.add_function(FunctionIr::new(
//!         "pipeline0_run",
//!         vec![
//!             Op::Load { dst: 0, offset: 8 },
//!             Op::Const { dst: 1, value: 1 },
//!             Op::Add { dst: 0, lhs: 0, rhs: 1 },
//!             Op::Store { offset: 8, src: 0 },
//!         ],
//!     ));
//!
//!     let module = Module::new(ir);
//!     let fragment = Fragment::new(vec!["pipeline0_run".into()], vec![], module);
//!     let query = ExecutableQuery::new(vec![fragment], 16, None);
//!
//!     // Plain execution.
//!     let ctx = ExecutionContext::new();
//!     query.run(&ctx, ExecutionMode::Compiled)?;
//!
//!     // Profiling iterations: run, measure, re-optimize, recompile.
//!     let controls = ProfilerControls {
//!         strategy: OptimizationStrategy::RandomAdd,
//!         num_iterations_left: 8,
//!         should_agg: true,
//!         ..ProfilerControls::default()
//!     };
//!     for _ in 0..8 {
//!         let ctx = ExecutionContext::new();
//!         query.run_profile_recompile(&ctx, &controls)?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod executor;
pub mod fragment;
pub mod ir;
pub mod module;
pub mod optimizer;
pub mod passes;
pub mod profile;
pub mod query;

// Re-export commonly used types
pub use error::{KilnError, Result};
pub use executor::{
    ExecutionContext, ExecutionMode, PipelineOperatingUnits, QueryState, TransactionContext,
};
pub use fragment::Fragment;
pub use module::{CompiledFunction, Module};
pub use optimizer::FunctionOptimizer;
pub use passes::{FunctionPassManager, ModulePassManager, Pass};
pub use profile::{
    FunctionMetadata, FunctionProfile, MetadataAgg, OptimizationStrategy, ProfilerControls,
};
pub use query::ExecutableQuery;

/// Prelude module for common imports.
pub mod prelude {
    pub use crate::error::{KilnError, Result};
    pub use crate::executor::{ExecutionContext, ExecutionMode, QueryState};
    pub use crate::fragment::Fragment;
    pub use crate::module::Module;
    pub use crate::profile::{OptimizationStrategy, ProfilerControls};
    pub use crate::query::ExecutableQuery;
}
