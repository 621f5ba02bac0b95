//! Executable queries and the profiling iteration driver.
//!
//! An executable query owns the fragments produced by the compiler
//! front-end plus the query-state layout. Besides the plain execution
//! path, it drives the profile → optimize → recompile feedback loop one
//! iteration at a time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::executor::{ExecutionContext, ExecutionMode, PipelineOperatingUnits, QueryState};
use crate::fragment::Fragment;
use crate::profile::ProfilerControls;

static QUERY_IDENTIFIER: AtomicU64 = AtomicU64::new(0);

/// A fully compiled query: fragments plus query-state layout.
#[derive(Debug)]
pub struct ExecutableQuery {
    fragments: Vec<Fragment>,
    query_state_size: usize,
    pipeline_operating_units: Option<Arc<PipelineOperatingUnits>>,
    query_id: u64,
}

impl ExecutableQuery {
    /// Assemble a query from compiled fragments.
    ///
    /// # Panics
    /// Panics if `query_state_size` cannot hold at least an
    /// `ExecutionContext` pointer.
    pub fn new(
        fragments: Vec<Fragment>,
        query_state_size: usize,
        pipeline_operating_units: Option<Arc<PipelineOperatingUnits>>,
    ) -> Self {
        assert!(
            query_state_size >= std::mem::size_of::<usize>(),
            "query state must be large enough to store at least an ExecutionContext pointer"
        );
        Self {
            fragments,
            query_state_size,
            pipeline_operating_units,
            query_id: QUERY_IDENTIFIER.fetch_add(1, Ordering::SeqCst),
        }
    }

    pub fn query_id(&self) -> u64 {
        self.query_id
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    fn make_query_state(&self, exec_ctx: &ExecutionContext, mode: ExecutionMode) -> QueryState {
        let mut query_state = QueryState::new(self.query_state_size);
        query_state.install_context(exec_ctx);
        exec_ctx.set_query_state(query_state.as_mut_ptr());
        exec_ctx.set_execution_mode(mode);
        exec_ctx.set_pipeline_operating_units(self.pipeline_operating_units.clone());
        exec_ctx.set_query_id(self.query_id);
        query_state
    }

    /// Run every fragment once under `mode`.
    pub fn run(&self, exec_ctx: &ExecutionContext, mode: ExecutionMode) -> Result<()> {
        let mut query_state = self.make_query_state(exec_ctx, mode);

        for fragment in &self.fragments {
            fragment.run(&mut query_state, mode)?;
        }

        // Execution contexts are not reused, but clearing the pointer keeps
        // a stale context from retaining the freed block.
        exec_ctx.set_query_state(std::ptr::null_mut());
        Ok(())
    }

    /// One profiling iteration: run each fragment under the compiled mode,
    /// roll its profile, and request recompilation so the next iteration
    /// executes under the newly chosen pipeline.
    ///
    /// Profiling runs are side-effect-free by contract, so the transaction
    /// is marked must-abort on the way out.
    pub fn run_profile_recompile(
        &self,
        exec_ctx: &ExecutionContext,
        controls: &ProfilerControls,
    ) -> Result<()> {
        let mode = ExecutionMode::Compiled;
        let mut query_state = self.make_query_state(exec_ctx, mode);

        for fragment in &self.fragments {
            {
                let mut profile = fragment.module().profile_mut();
                profile.set_strategy(controls.strategy);
                if controls.should_agg {
                    if !profile.is_agg() {
                        profile.start_agg();
                        tracing::debug!(query_id = self.query_id, "aggregation armed");
                    }
                } else if profile.is_agg() {
                    profile.stop_agg();
                    tracing::debug!(query_id = self.query_id, "aggregation disarmed");
                }
                profile.set_num_iterations_left(controls.num_iterations_left);
            }

            fragment.run(&mut query_state, mode)?;
            fragment.module().profile_mut().end_iteration();

            {
                let profile = fragment.module().profile();
                tracing::debug!(
                    strategy = %controls.strategy,
                    combined = %profile.combined_prev().to_str_long(),
                    "iteration input"
                );
            }
            fragment.force_recompile();

            if controls.should_print_agg {
                let profile = fragment.module().profile();
                let agg = profile.combined_agg();
                tracing::info!(
                    num_samples = agg.num_samples,
                    original = %agg.original.to_str_long(),
                    last = %agg.last.to_str_long(),
                    min = %agg.min.to_str_long(),
                    mean = %agg.mean.to_str_short(),
                    max = %agg.max.to_str_long(),
                    "combined aggregate"
                );
            }
            if controls.should_print_fragment {
                fragment.print();
            }
        }

        // All profiling runs must abort.
        exec_ctx.txn().set_must_abort();
        exec_ctx.set_query_state(std::ptr::null_mut());
        Ok(())
    }

    /// Zero every fragment's per-function counters without discarding
    /// registered names.
    pub fn reset_fragment_profiles(&self) {
        for fragment in &self.fragments {
            fragment.reset();
        }
    }
}
