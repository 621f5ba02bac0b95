//! Executable query fragments.
//!
//! A fragment owns one compiled module and the names of its step and
//! teardown functions. Running a fragment executes the steps in order over
//! the query-state block, timing each invocation into the module's
//! profile; a cooperative abort from a step short-circuits the remaining
//! steps and runs every teardown.

use std::time::Instant;

use crate::error::{KilnError, Result};
use crate::executor::{ExecutionMode, QueryState};
use crate::module::Module;

/// One compiled sub-plan: a module plus its step/teardown entry points.
#[derive(Debug)]
pub struct Fragment {
    step_names: Vec<String>,
    teardown_names: Vec<String>,
    module: Module,
}

impl Fragment {
    /// Create a fragment over a compiled module, registering the step and
    /// teardown names with the module's profile.
    pub fn new(step_names: Vec<String>, teardown_names: Vec<String>, module: Module) -> Self {
        {
            let mut profile = module.profile_mut();
            profile.register_steps(step_names.clone());
            profile.register_teardowns(teardown_names.clone());
        }
        Self {
            step_names,
            teardown_names,
            module,
        }
    }

    pub fn step_names(&self) -> &[String] {
        &self.step_names
    }

    pub fn teardown_names(&self) -> &[String] {
        &self.teardown_names
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Execute the fragment's steps in order against `query_state`.
    ///
    /// Returns immediately if the execution context reports must-abort.
    /// A step raising a cooperative abort triggers the teardown sequence
    /// and a clean return; a missing step or teardown function is fatal.
    pub fn run(&self, query_state: &mut QueryState, mode: ExecutionMode) -> Result<()> {
        if let Some(exec_ctx) = query_state.context() {
            if exec_ctx.txn().must_abort() {
                return Ok(());
            }
        }

        for func_name in &self.step_names {
            let func = self.module.get_function(func_name, mode)?;
            let started = Instant::now();
            match func.call(query_state) {
                Ok(()) => {
                    let elapsed_ns = started.elapsed().as_nanos() as i64;
                    self.module.profile_mut().curr_mut(func_name).exec_ns = elapsed_ns;
                }
                Err(KilnError::FragmentAbort) => {
                    tracing::debug!(step = %func_name, "cooperative abort; running teardowns");
                    for teardown_name in &self.teardown_names {
                        let teardown = self.module.get_function(teardown_name, mode)?;
                        teardown.call(query_state)?;
                    }
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Invalidate the module's compiled entries so subsequent resolutions
    /// recompile under the currently-applied passes.
    pub fn force_recompile(&self) {
        self.module.dangerous_recompile();
    }

    /// Zero the module's per-function counters without discarding names.
    pub fn reset(&self) {
        self.module.reset_profile();
    }

    /// Dump the current IR of every function to the log sink.
    pub fn print(&self) {
        self.module.profile().print_module();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutionContext;
    use crate::ir::{FunctionIr, ModuleIr, Op};

    /// A step that bumps the shared counter at offset 8 and records the
    /// post-increment value into its own slot, so tests can observe the
    /// exact call order.
    fn marker_fn(name: &str, slot: usize, abort: bool) -> FunctionIr {
        let mut ops = vec![
            Op::Load { dst: 0, offset: 8 },
            Op::Const { dst: 1, value: 1 },
            Op::Add {
                dst: 0,
                lhs: 0,
                rhs: 1,
            },
            Op::Store { offset: 8, src: 0 },
            Op::Store { offset: slot, src: 0 },
        ];
        if abort {
            ops.push(Op::Abort);
        }
        FunctionIr::new(name, ops)
    }

    fn fragment_with(functions: Vec<FunctionIr>, steps: &[&str], teardowns: &[&str]) -> Fragment {
        let mut ir = ModuleIr::new();
        for func in functions {
            ir.add_function(func);
        }
        Fragment::new(
            steps.iter().map(|s| s.to_string()).collect(),
            teardowns.iter().map(|s| s.to_string()).collect(),
            Module::new(ir),
        )
    }

    #[test]
    fn test_run_executes_steps_in_order_and_times_them() {
        let fragment = fragment_with(
            vec![marker_fn("s1", 16, false), marker_fn("s2", 24, false)],
            &["s1", "s2"],
            &[],
        );
        let mut state = QueryState::new(32);
        fragment.run(&mut state, ExecutionMode::Compiled).unwrap();

        assert_eq!(state.read_i64(16).unwrap(), 1);
        assert_eq!(state.read_i64(24).unwrap(), 2);

        let mut profile = fragment.module().profile_mut();
        assert!(profile.curr_mut("s1").exec_ns >= 0);
        assert!(profile.curr_mut("s2").exec_ns >= 0);
    }

    #[test]
    fn test_abort_runs_all_teardowns_once() {
        let fragment = fragment_with(
            vec![
                marker_fn("s1", 16, false),
                marker_fn("s2", 24, true),
                marker_fn("s3", 32, false),
                marker_fn("t1", 40, false),
                marker_fn("t2", 48, false),
            ],
            &["s1", "s2", "s3"],
            &["t1", "t2"],
        );
        let mut state = QueryState::new(64);
        fragment.run(&mut state, ExecutionMode::Compiled).unwrap();

        // Observed call sequence: s1, s2, t1, t2; s3 never runs.
        assert_eq!(state.read_i64(16).unwrap(), 1);
        assert_eq!(state.read_i64(24).unwrap(), 2);
        assert_eq!(state.read_i64(40).unwrap(), 3);
        assert_eq!(state.read_i64(48).unwrap(), 4);
        assert_eq!(state.read_i64(32).unwrap(), 0);
    }

    #[test]
    fn test_missing_step_is_fatal() {
        let fragment = fragment_with(vec![marker_fn("s1", 16, false)], &["s1", "s2"], &[]);
        let mut state = QueryState::new(32);
        let err = fragment.run(&mut state, ExecutionMode::Compiled).unwrap_err();
        assert!(matches!(err, KilnError::Compile { .. }));
    }

    #[test]
    fn test_must_abort_returns_before_any_step() {
        let fragment = fragment_with(
            vec![marker_fn("s1", 16, false), marker_fn("t1", 24, false)],
            &["s1"],
            &["t1"],
        );
        let ctx = ExecutionContext::new();
        ctx.txn().set_must_abort();

        let mut state = QueryState::new(32);
        state.install_context(&ctx);
        fragment.run(&mut state, ExecutionMode::Compiled).unwrap();

        // Neither steps nor teardowns ran.
        assert_eq!(state.read_i64(16).unwrap(), 0);
        assert_eq!(state.read_i64(24).unwrap(), 0);
    }
}
