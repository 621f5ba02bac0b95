//! The adaptive function optimizer.
//!
//! Runs the two-pass flow over a compiled module: simplify (inline the
//! cross-compiled handler bodies, then global DCE) and optimize (evaluate
//! the prior iteration against the best seen so far, consult the strategy
//! for the next pipeline, apply it per-function, and record measurements).

use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::ir::ModuleIr;
use crate::passes::{self, FunctionPassManager, ModulePassManager, Pass};
use crate::profile::{pipeline_str, FunctionMetadata, FunctionProfile, OptimizationStrategy};

/// Require at least a 5% relative improvement...
const EPSILON_PCT: f64 = -0.05;
/// ...and a 500 ns absolute improvement, to keep noise from promoting
/// regressions.
const EPSILON_NS: i64 = -500;

/// Feedback-driven pipeline search over one module.
pub struct FunctionOptimizer {
    rng: StdRng,
    /// Catalog indices RandomDistinct has not yet trialed.
    remaining_distinct: Vec<usize>,
}

impl FunctionOptimizer {
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// Deterministic optimizer for tests and reproductions.
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        Self {
            rng,
            remaining_distinct: (0..=passes::last_builtin_idx()).collect(),
        }
    }

    /// Catalog indices RandomDistinct has yet to try.
    pub fn remaining_distinct(&self) -> &[usize] {
        &self.remaining_distinct
    }

    /// One-time module preparation. The generated IR is a sequence of
    /// calls to cross-compiled bytecode handlers; inline them first so the
    /// function-level passes see the real bodies, then drop the handler
    /// globals nothing references.
    pub fn simplify(&self, module: &mut ModuleIr) {
        let mut pass_manager = ModulePassManager::new();
        pass_manager.add_always_inline();
        pass_manager.add_global_dce();
        pass_manager.run(module);
    }

    /// One optimization iteration over the whole module.
    pub fn optimize(&mut self, module: &mut ModuleIr, profile: &mut FunctionProfile) {
        // Evaluate the result of the last iteration, if there is one.
        self.evaluate_previous(profile);

        let strategy = profile.strategy();
        let transforms = self.get_transforms(strategy, profile);
        tracing::debug!(
            strategy = %strategy,
            pipeline = %pipeline_str(&transforms),
            "post-strategy pipeline"
        );

        for (name, func) in module.functions_mut() {
            profile.curr_mut(name).input_pipeline = transforms.clone();

            let mut function_passes = FunctionPassManager::with_default_pipeline();
            for pass in &transforms {
                (pass.apply)(&mut function_passes);
            }

            let started = Instant::now();
            function_passes.run(func);
            let elapsed_ns = started.elapsed().as_nanos() as i64;

            let curr = profile.curr_mut(name);
            curr.optimize_ns = elapsed_ns;
            curr.strategy = strategy;
            curr.applied_pipeline = transforms.clone();
        }

        Self::finalize_stats(module, profile);
    }

    /// Last chance to grab compile-time attributes.
    fn finalize_stats(module: &ModuleIr, profile: &mut FunctionProfile) {
        for (name, func) in module.functions() {
            let curr = profile.curr_mut(name);
            curr.inst_count = func.instruction_count() as i64;
            curr.ir = func.to_string();
        }
    }

    /// Regression check: compare the previous iteration's combined
    /// measurements against the aggregate minimum and decide whether the
    /// trialed pipeline is kept or discarded.
    ///
    /// Runs for every strategy, Noop included; a Noop window measures a
    /// pipeline chosen by a prior strategy without proposing changes.
    pub fn evaluate_previous(&self, profile: &mut FunctionProfile) {
        let best = profile.combined_agg().min.clone();
        let prev = profile.combined_prev();
        if prev.applied_pipeline == best.applied_pipeline || best == FunctionMetadata::default() {
            return;
        }

        let delta_ns = prev.exec_ns - best.exec_ns;
        let pct = delta_ns as f64 / best.exec_ns as f64;
        if pct < EPSILON_PCT && delta_ns < EPSILON_NS {
            tracing::debug!(
                delta_exec_ns = delta_ns,
                optimize_ns = prev.optimize_ns,
                kept = %pipeline_str(&prev.applied_pipeline),
                "candidate pipeline is better; keeping it"
            );
            let kept = prev.applied_pipeline.clone();
            profile.set_profile_pipeline(kept);
        } else {
            tracing::debug!(
                delta_exec_ns = delta_ns,
                optimize_ns = prev.optimize_ns,
                discarded = %pipeline_str(&prev.applied_pipeline),
                reverted_to = %pipeline_str(&best.applied_pipeline),
                "candidate pipeline regressed; reverting"
            );
            let reverted = best.applied_pipeline.clone();
            profile.set_profile_pipeline(reverted);
        }
    }

    /// Choose the pipeline to trial this iteration.
    ///
    /// Idempotent within an iteration: the first call mutates the profile
    /// pipeline, later calls return it unchanged until `end_iteration`
    /// clears the gate.
    pub fn get_transforms(
        &mut self,
        strategy: OptimizationStrategy,
        profile: &mut FunctionProfile,
    ) -> Vec<Pass> {
        if profile.iteration_pipeline_chosen() {
            return profile.profile_pipeline().to_vec();
        }

        match strategy {
            OptimizationStrategy::Noop => {}
            OptimizationStrategy::HandPicked => {
                profile.set_profile_pipeline(passes::hand_picked_pipeline());
            }
            OptimizationStrategy::RandomAdd => {
                let mut pipeline = profile.profile_pipeline().to_vec();
                pipeline.push(self.random_builtin());
                profile.set_profile_pipeline(pipeline);
            }
            OptimizationStrategy::RandomMutate => {
                let mut pipeline = profile.profile_pipeline().to_vec();
                if !pipeline.is_empty() {
                    let mutate_idx = self.rng.gen_range(0..pipeline.len());
                    pipeline[mutate_idx] = self.random_builtin();
                    profile.set_profile_pipeline(pipeline);
                }
            }
            OptimizationStrategy::RandomGenetic => {
                let mut pipeline = profile.profile_pipeline().to_vec();
                if pipeline.is_empty() {
                    // Don't waste an iteration on an empty run.
                    pipeline.push(self.random_builtin());
                } else {
                    let choice = self.rng.gen_range(1..=4u32);
                    let choice_idx = self.rng.gen_range(0..pipeline.len());
                    match choice {
                        1 => {
                            pipeline.remove(choice_idx);
                        }
                        2 => pipeline[choice_idx] = self.random_builtin(),
                        3 => pipeline.push(self.random_builtin()),
                        _ => {}
                    }
                }
                profile.set_profile_pipeline(pipeline);
            }
            OptimizationStrategy::RandomDistinct => {
                if !self.remaining_distinct.is_empty() {
                    let choice = self.rng.gen_range(0..self.remaining_distinct.len());
                    let catalog_idx = self.remaining_distinct.remove(choice);
                    let mut pipeline = profile.profile_pipeline().to_vec();
                    pipeline.push(passes::at(catalog_idx));
                    profile.set_profile_pipeline(pipeline);
                }
            }
        }

        profile.mark_iteration_pipeline_chosen();
        profile.profile_pipeline().to_vec()
    }

    fn random_builtin(&mut self) -> Pass {
        passes::at(self.rng.gen_range(0..=passes::last_builtin_idx()))
    }
}

impl Default for FunctionOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile_with_steps() -> FunctionProfile {
        let mut profile = FunctionProfile::new();
        profile.register_steps(vec!["main".to_string()]);
        profile
    }

    /// Drive one fake iteration: record a combined sample under `pipeline`
    /// and roll it into prev.
    fn record_iteration(profile: &mut FunctionProfile, pipeline: &[Pass], exec_ns: i64) {
        let curr = profile.curr_mut("main");
        curr.exec_ns = exec_ns;
        curr.applied_pipeline = pipeline.to_vec();
        profile.end_iteration();
    }

    fn named(name: &str) -> Pass {
        passes::by_name(name).unwrap()
    }

    #[test]
    fn test_get_transforms_idempotent_within_iteration() {
        let mut optimizer = FunctionOptimizer::with_seed(7);
        let mut profile = profile_with_steps();
        profile.set_strategy(OptimizationStrategy::RandomAdd);

        let first = optimizer.get_transforms(OptimizationStrategy::RandomAdd, &mut profile);
        let second = optimizer.get_transforms(OptimizationStrategy::RandomAdd, &mut profile);
        let third = optimizer.get_transforms(OptimizationStrategy::RandomAdd, &mut profile);
        assert_eq!(first.len(), 1);
        assert_eq!(first, second);
        assert_eq!(first, third);

        // The gate clears at the iteration boundary.
        profile.end_iteration();
        let next = optimizer.get_transforms(OptimizationStrategy::RandomAdd, &mut profile);
        assert_eq!(next.len(), 2);
    }

    #[test]
    fn test_hand_picked_selection() {
        let mut optimizer = FunctionOptimizer::with_seed(0);
        let mut profile = profile_with_steps();

        let pipeline = optimizer.get_transforms(OptimizationStrategy::HandPicked, &mut profile);
        let names: Vec<&str> = pipeline.iter().map(|p| p.name).collect();
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
        assert_eq!(profile.profile_pipeline(), pipeline.as_slice());
    }

    #[test]
    fn test_random_add_grows_by_one_from_builtin_range() {
        let mut optimizer = FunctionOptimizer::with_seed(42);
        let mut profile = profile_with_steps();

        for expected_len in 1..=5 {
            let pipeline = optimizer.get_transforms(OptimizationStrategy::RandomAdd, &mut profile);
            assert_eq!(pipeline.len(), expected_len);
            for pass in &pipeline {
                let idx = passes::index_of(pass.name).unwrap();
                assert!(idx <= passes::last_builtin_idx());
            }
            profile.end_iteration();
        }
    }

    #[test]
    fn test_random_mutate_preserves_length() {
        let mut optimizer = FunctionOptimizer::with_seed(9);
        let mut profile = profile_with_steps();

        // Empty pipeline: mutate has nothing to do.
        let pipeline = optimizer.get_transforms(OptimizationStrategy::RandomMutate, &mut profile);
        assert!(pipeline.is_empty());
        profile.end_iteration();

        profile.set_profile_pipeline(vec![named("gvn"), named("adce"), named("licm")]);
        for _ in 0..10 {
            let pipeline =
                optimizer.get_transforms(OptimizationStrategy::RandomMutate, &mut profile);
            assert_eq!(pipeline.len(), 3);
            profile.end_iteration();
        }
    }

    #[test]
    fn test_genetic_bounded_growth() {
        let mut optimizer = FunctionOptimizer::with_seed(1234);
        let mut profile = profile_with_steps();

        let iterations = 25;
        let mut prev_len = 0usize;
        for _ in 0..iterations {
            let pipeline =
                optimizer.get_transforms(OptimizationStrategy::RandomGenetic, &mut profile);
            assert!(pipeline.len() <= iterations);
            assert!(pipeline.len() + 1 >= prev_len, "shrank by more than one");
            assert!(pipeline.len() <= prev_len + 1, "grew by more than one");
            prev_len = pipeline.len();
            profile.end_iteration();
        }
    }

    #[test]
    fn test_distinct_exhaustion() {
        let mut optimizer = FunctionOptimizer::with_seed(5);
        let mut profile = profile_with_steps();

        let n = passes::last_builtin_idx() + 1;
        for _ in 0..n {
            optimizer.get_transforms(OptimizationStrategy::RandomDistinct, &mut profile);
            profile.end_iteration();
        }

        let pipeline = profile.profile_pipeline();
        assert_eq!(pipeline.len(), n);
        assert!(optimizer.remaining_distinct().is_empty());
        let mut names: Vec<&str> = pipeline.iter().map(|p| p.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), n, "pipeline entries are all distinct");

        // Exhausted: further iterations add nothing.
        optimizer.get_transforms(OptimizationStrategy::RandomDistinct, &mut profile);
        assert_eq!(profile.profile_pipeline().len(), n);
    }

    #[test]
    fn test_regression_acceptance_boundaries() {
        // best = 10000: accept requires prev < 9500 (both epsilons).
        for (prev_ns, accepted) in [(9499, true), (9500, false), (9501, false)] {
            let mut optimizer = FunctionOptimizer::with_seed(0);
            let mut profile = profile_with_steps();
            let best_pipeline = vec![named("gvn")];
            let cand_pipeline = vec![named("gvn"), named("adce")];

            profile.start_agg();
            record_iteration(&mut profile, &best_pipeline, 10_000);
            profile.stop_agg();
            record_iteration(&mut profile, &cand_pipeline, prev_ns);

            optimizer.evaluate_previous(&mut profile);
            let expected = if accepted { &cand_pipeline } else { &best_pipeline };
            assert_eq!(
                profile.profile_pipeline(),
                expected.as_slice(),
                "prev_ns = {}",
                prev_ns
            );
        }
    }

    #[test]
    fn test_regression_requires_absolute_improvement() {
        // 5.2% better but only 31 ns: rejected.
        let mut optimizer = FunctionOptimizer::with_seed(0);
        let mut profile = profile_with_steps();
        let best_pipeline = vec![named("gvn")];
        let cand_pipeline = vec![named("adce")];

        profile.start_agg();
        record_iteration(&mut profile, &best_pipeline, 600);
        profile.stop_agg();
        record_iteration(&mut profile, &cand_pipeline, 569);

        optimizer.evaluate_previous(&mut profile);
        assert_eq!(profile.profile_pipeline(), best_pipeline.as_slice());
    }

    #[test]
    fn test_regression_skipped_without_history() {
        let mut optimizer = FunctionOptimizer::with_seed(0);
        let mut profile = profile_with_steps();
        profile.set_profile_pipeline(vec![named("licm")]);

        // No aggregate yet: nothing to compare against.
        optimizer.evaluate_previous(&mut profile);
        assert_eq!(profile.profile_pipeline(), &[named("licm")]);
    }

    #[test]
    fn noop_regression_still_reverts() {
        // A Noop window still consults the aggregate minimum: it measures
        // pipelines chosen by prior strategies without changing them.
        let mut optimizer = FunctionOptimizer::with_seed(0);
        let mut profile = profile_with_steps();
        profile.set_strategy(OptimizationStrategy::Noop);
        let best_pipeline = vec![named("gvn")];
        let cand_pipeline = vec![named("gvn"), named("sink")];

        profile.start_agg();
        record_iteration(&mut profile, &best_pipeline, 10_000);
        profile.stop_agg();
        record_iteration(&mut profile, &cand_pipeline, 9_990);

        optimizer.evaluate_previous(&mut profile);
        let transforms = optimizer.get_transforms(OptimizationStrategy::Noop, &mut profile);
        assert_eq!(transforms, best_pipeline);
        assert_eq!(profile.profile_pipeline(), best_pipeline.as_slice());
    }
}
