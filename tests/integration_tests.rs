//! Integration tests for the Kiln execution runtime.
//!
//! These tests verify the end-to-end feedback loop: fragment execution,
//! measurement, strategy-driven pipeline selection, the regression check,
//! and recompilation.

use kiln::ir::{FunctionIr, ModuleIr, Op};
use kiln::passes;
use kiln::{
    ExecutableQuery, ExecutionContext, ExecutionMode, Fragment, FunctionOptimizer, FunctionProfile,
    Module, OptimizationStrategy, Pass, ProfilerControls, QueryState,
};

/// A step that bumps the shared counter at offset 8 and records the
/// post-increment value into its own slot, exposing the exact call order.
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

fn single_step_query(seed: u64) -> ExecutableQuery {
    let mut ir = ModuleIr::new();
    ir.add_function(marker_fn("main", 16, false));
    let module = Module::with_optimizer(ir, FunctionOptimizer::with_seed(seed));
    let fragment = Fragment::new(vec!["main".to_string()], vec![], module);
    ExecutableQuery::new(vec![fragment], 32, None)
}

fn named(name: &str) -> Pass {
    passes::by_name(name).unwrap()
}

fn profile_with_main() -> FunctionProfile {
    let mut profile = FunctionProfile::new();
    profile.register_steps(vec!["main".to_string()]);
    profile
}

/// One fake iteration at the profile level: record a combined sample under
/// `pipeline`, roll it, then run the optimizer's decision flow the way a
/// recompile would.
fn fake_iteration(
    optimizer: &mut FunctionOptimizer,
    profile: &mut FunctionProfile,
    pipeline: &[Pass],
    exec_ns: i64,
) {
    let curr = profile.curr_mut("main");
    curr.exec_ns = exec_ns;
    curr.applied_pipeline = pipeline.to_vec();
    profile.end_iteration();
    optimizer.evaluate_previous(profile);
    let strategy = profile.strategy();
    optimizer.get_transforms(strategy, profile);
}

// --- End-to-end scenarios ---

#[test]
fn e1_noop_stability() {
    let mut optimizer = FunctionOptimizer::with_seed(0);
    let mut profile = profile_with_main();
    profile.set_strategy(OptimizationStrategy::Noop);
    profile.start_agg();

    for exec_ns in [1000, 1100, 900] {
        fake_iteration(&mut optimizer, &mut profile, &[], exec_ns);
        assert!(profile.profile_pipeline().is_empty());
    }

    let agg = profile.combined_agg();
    assert_eq!(agg.num_samples, 3);
    assert_eq!(agg.min.exec_ns, 900);
    assert_eq!(agg.last.exec_ns, 900);
    assert_eq!(agg.max.exec_ns, 1100);
    assert_eq!(agg.mean.exec_ns, 1000);
}

#[test]
fn e2_hand_picked_selection() {
    let query = single_step_query(21);
    let ctx = ExecutionContext::new();
    let controls = ProfilerControls {
        strategy: OptimizationStrategy::HandPicked,
        num_iterations_left: 1,
        ..ProfilerControls::default()
    };
    query.run_profile_recompile(&ctx, &controls).unwrap();

    let fragment = &query.fragments()[0];
    let profile = fragment.module().profile();
    let names: Vec<&str> = profile.profile_pipeline().iter().map(|p| p.name).collect();
    assert_eq!(
        names,
        vec![
            "aggressive-instcombine",
            "reassociate",
            "gvn",
            "simplifycfg",
            "adce",
            "simplifycfg",
        ]
    );
}

#[test]
fn e3_regression_rejection() {
    let mut optimizer = FunctionOptimizer::with_seed(0);
    let mut profile = profile_with_main();
    profile.set_strategy(OptimizationStrategy::Noop);
    let p1 = vec![named("gvn")];
    let p2 = vec![named("gvn"), named("adce")];

    // Baseline window: P1 at 1000 ns becomes the aggregate minimum.
    profile.start_agg();
    fake_iteration(&mut optimizer, &mut profile, &p1, 1000);
    assert_eq!(profile.combined_agg().min.exec_ns, 1000);

    // Trial window, aggregation disarmed: P2 improves by only 1 ns.
    profile.stop_agg();
    fake_iteration(&mut optimizer, &mut profile, &p2, 999);

    // The acceptance predicate fails; the profile reverts to P1.
    assert_eq!(profile.profile_pipeline(), p1.as_slice());
}

#[test]
fn e4_abort_short_circuit() {
    let query = single_step_query(4);
    let ctx = ExecutionContext::new();
    ctx.txn().set_must_abort();

    query.run(&ctx, ExecutionMode::Compiled).unwrap();

    // No step ran: the shared counter at offset 8 would have moved the
    // marker slot off zero.
    let fragment = &query.fragments()[0];
    let mut state = QueryState::new(32);
    state.install_context(&ctx);
    fragment.run(&mut state, ExecutionMode::Compiled).unwrap();
    assert_eq!(state.read_i64(8).unwrap(), 0);
    assert_eq!(state.read_i64(16).unwrap(), 0);
}

// --- Properties over the full loop ---

#[test]
fn abort_runs_teardowns_in_order_through_the_driver() {
    let mut ir = ModuleIr::new();
    ir.add_function(marker_fn("s1", 16, false));
    ir.add_function(marker_fn("s2", 24, true));
    ir.add_function(marker_fn("s3", 32, false));
    ir.add_function(marker_fn("t1", 40, false));
    ir.add_function(marker_fn("t2", 48, false));
    let module = Module::new(ir);
    let fragment = Fragment::new(
        vec!["s1".to_string(), "s2".to_string(), "s3".to_string()],
        vec!["t1".to_string(), "t2".to_string()],
        module,
    );
    let query = ExecutableQuery::new(vec![fragment], 64, None);

    let ctx = ExecutionContext::new();
    query.run(&ctx, ExecutionMode::Compiled).unwrap();

    let fragment = &query.fragments()[0];
    let mut state = QueryState::new(64);
    state.install_context(&ctx);
    fragment.run(&mut state, ExecutionMode::Compiled).unwrap();

    // Observed sequence: s1, s2, t1, t2; s3 never runs.
    assert_eq!(state.read_i64(16).unwrap(), 1);
    assert_eq!(state.read_i64(24).unwrap(), 2);
    assert_eq!(state.read_i64(40).unwrap(), 3);
    assert_eq!(state.read_i64(48).unwrap(), 4);
    assert_eq!(state.read_i64(32).unwrap(), 0);
}

#[test]
fn aggregate_stays_monotone_across_iterations() {
    let mut optimizer = FunctionOptimizer::with_seed(0);
    let mut profile = profile_with_main();
    profile.set_strategy(OptimizationStrategy::Noop);
    profile.start_agg();

    for exec_ns in [500, 1200, 800, 800, 4000, 100, 2500] {
        fake_iteration(&mut optimizer, &mut profile, &[], exec_ns);
        let agg = profile.combined_agg();
        assert!(agg.num_samples >= 1);
        assert!(agg.min.exec_ns <= agg.mean.exec_ns);
        assert!(agg.mean.exec_ns <= agg.max.exec_ns);
    }
}

#[test]
fn profiling_loop_converges_on_a_pipeline() {
    let query = single_step_query(99);
    let iterations = 10u64;

    for i in 0..iterations {
        let ctx = ExecutionContext::new();
        let controls = ProfilerControls {
            strategy: OptimizationStrategy::RandomDistinct,
            num_iterations_left: iterations - i,
            should_agg: true,
            ..ProfilerControls::default()
        };
        query.run_profile_recompile(&ctx, &controls).unwrap();
        assert!(ctx.txn().must_abort());
    }

    let fragment = &query.fragments()[0];
    let profile = fragment.module().profile();
    assert_eq!(profile.combined_agg().num_samples, iterations);
    // Each iteration trials at most one new distinct pass.
    assert!(profile.profile_pipeline().len() <= iterations as usize);

    // The step function still computes the same result after repeated
    // re-optimization and recompilation.
    let mut state = QueryState::new(32);
    fragment.run(&mut state, ExecutionMode::Compiled).unwrap();
    assert_eq!(state.read_i64(8).unwrap(), 1);
    assert_eq!(state.read_i64(16).unwrap(), 1);
}

#[test]
fn switching_aggregation_windows_keeps_reported_values() {
    let query = single_step_query(7);

    // Armed window.
    for _ in 0..2 {
        let ctx = ExecutionContext::new();
        let controls = ProfilerControls {
            strategy: OptimizationStrategy::Noop,
            num_iterations_left: 2,
            should_agg: true,
            ..ProfilerControls::default()
        };
        query.run_profile_recompile(&ctx, &controls).unwrap();
    }

    // Disarmed window: samples stop moving but stay readable.
    let ctx = ExecutionContext::new();
    let controls = ProfilerControls {
        strategy: OptimizationStrategy::Noop,
        num_iterations_left: 1,
        should_agg: false,
        should_print_agg: true,
        ..ProfilerControls::default()
    };
    query.run_profile_recompile(&ctx, &controls).unwrap();

    let fragment = &query.fragments()[0];
    let profile = fragment.module().profile();
    assert!(!profile.is_agg());
    assert_eq!(profile.combined_agg().num_samples, 2);
}
