//! Optimization pass catalog.
//!
//! A process-lifetime ordered registry of named function-level passes.
//! Positions matter: search strategies reference ranges by index, so the
//! table order is frozen. Names follow the backend's pass vocabulary; an
//! `nd-` prefix marks passes that exist only in the backend API. Several
//! names intentionally share one rewrite class, the way `gvn` and
//! `gvn-no-load-elimination` share one implementation.

use std::fmt;

use once_cell::sync::Lazy;

use crate::ir::{rewrite, FunctionIr, ModuleIr};

/// A named function-level optimization pass.
///
/// A flat `(name, apply)` pair: `apply` appends the pass's transforms to a
/// function pass manager. Passes compare equal by name.
#[derive(Clone, Copy)]
pub struct Pass {
    pub name: &'static str,
    pub apply: fn(&mut FunctionPassManager),
}

impl PartialEq for Pass {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Pass {}

impl fmt::Debug for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pass").field(&self.name).finish()
    }
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Ordered list of rewrite steps applied to one function.
#[derive(Default)]
pub struct FunctionPassManager {
    steps: Vec<TransformStep>,
}

struct TransformStep {
    name: &'static str,
    rewrite: fn(&mut FunctionIr) -> bool,
}

impl FunctionPassManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the opt-level-3 baseline every function gets before
    /// strategy-selected passes: constant folding, identity combining, and
    /// dead-code elimination. (Handler inlining, the function-inliner
    /// analog, is a module-level concern handled by simplification.)
    pub fn with_default_pipeline() -> Self {
        let mut fpm = Self::new();
        fpm.add("default<fold>", rewrite::fold_constants);
        fpm.add("default<combine>", rewrite::combine_identities);
        fpm.add("default<dce>", rewrite::eliminate_dead);
        fpm
    }

    /// Append a named rewrite step.
    pub fn add(&mut self, name: &'static str, rewrite: fn(&mut FunctionIr) -> bool) {
        self.steps.push(TransformStep { name, rewrite });
    }

    /// Run every step in order; returns how many reported a change.
    pub fn run(&self, func: &mut FunctionIr) -> usize {
        self.steps
            .iter()
            .filter(|step| {
                let changed = (step.rewrite)(func);
                if changed {
                    tracing::trace!(step = step.name, function = %func.name, "rewrite changed IR");
                }
                changed
            })
            .count()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Ordered list of module-level rewrite steps (the simplify flow).
#[derive(Default)]
pub struct ModulePassManager {
    steps: Vec<(&'static str, fn(&mut ModuleIr) -> bool)>,
}

impl ModulePassManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inline cross-compiled handler bodies into their call sites.
    pub fn add_always_inline(&mut self) {
        self.steps
            .push(("always-inline", rewrite::always_inline_handlers));
    }

    /// Drop handler bodies left unreferenced.
    pub fn add_global_dce(&mut self) {
        self.steps.push(("globaldce", rewrite::global_dce_handlers));
    }

    pub fn run(&self, module: &mut ModuleIr) -> usize {
        self.steps
            .iter()
            .filter(|(name, step)| {
                let changed = step(module);
                if changed {
                    tracing::trace!(step = name, "module rewrite changed IR");
                }
                changed
            })
            .count()
    }
}

/// The pass catalog, in frozen order.
///
/// Names are copied from the corresponding backend pass and may carry a
/// suffix for configuration variants. The entries up to and including
/// `nd-loop-inst-simplify` are single passes eligible for random
/// selection; `hand-picked` is a composite kept out of that range.
pub static CATALOG: &[Pass] = &[
    // Aggressive dead code elimination: assumes values dead until proven
    // otherwise.
    Pass {
        name: "adce",
        apply: |fpm| fpm.add("adce", rewrite::eliminate_dead),
    },
    // Simple constant propagation.
    Pass {
        name: "constprop",
        apply: |fpm| fpm.add("constprop", rewrite::fold_constants),
    },
    // Dead code elimination.
    Pass {
        name: "dce",
        apply: |fpm| fpm.add("dce", rewrite::eliminate_dead),
    },
    // Dead instruction elimination: single pass over obviously dead ops.
    Pass {
        name: "die",
        apply: |fpm| fpm.add("die", rewrite::eliminate_dead),
    },
    // Dead store elimination.
    Pass {
        name: "dse",
        apply: |fpm| fpm.add("dse", rewrite::eliminate_dead_stores),
    },
    // Global value numbering, with and without redundant load elimination.
    Pass {
        name: "gvn",
        apply: |fpm| fpm.add("gvn", rewrite::value_number),
    },
    Pass {
        name: "gvn-no-load-elimination",
        apply: |fpm| fpm.add("gvn-no-load-elimination", rewrite::value_number),
    },
    // Canonicalize induction variables.
    Pass {
        name: "indvars",
        apply: |fpm| fpm.add("indvars", rewrite::simplify_loop_bodies),
    },
    // Combine redundant instructions, in two strengths.
    Pass {
        name: "instcombine",
        apply: |fpm| fpm.add("instcombine", rewrite::combine_identities),
    },
    Pass {
        name: "aggressive-instcombine",
        apply: |fpm| {
            fpm.add("aggressive-instcombine", rewrite::combine_identities);
            fpm.add("aggressive-instcombine", rewrite::fold_constants);
        },
    },
    Pass {
        name: "jump-threading",
        apply: |fpm| fpm.add("jump-threading", rewrite::strip_nops),
    },
    // Loop invariant code motion.
    Pass {
        name: "licm",
        apply: |fpm| fpm.add("licm", rewrite::hoist_invariants),
    },
    Pass {
        name: "loop-deletion",
        apply: |fpm| fpm.add("loop-deletion", rewrite::delete_empty_loops),
    },
    Pass {
        name: "loop-extract-single",
        apply: |fpm| fpm.add("loop-extract-single", rewrite::simplify_loop_bodies),
    },
    // Loop strength reduction.
    Pass {
        name: "loop-reduce",
        apply: |fpm| fpm.add("loop-reduce", rewrite::simplify_loop_bodies),
    },
    Pass {
        name: "loop-rotate",
        apply: |fpm| fpm.add("loop-rotate", rewrite::simplify_loop_bodies),
    },
    Pass {
        name: "loop-simplify",
        apply: |fpm| fpm.add("loop-simplify", rewrite::simplify_loop_bodies),
    },
    // Works best when indvars has been run.
    Pass {
        name: "loop-unroll",
        apply: |fpm| fpm.add("loop-unroll", rewrite::unroll_small_loops),
    },
    Pass {
        name: "loop-unroll-and-jam",
        apply: |fpm| fpm.add("loop-unroll-and-jam", rewrite::unroll_small_loops),
    },
    Pass {
        name: "loop-unswitch",
        apply: |fpm| fpm.add("loop-unswitch", rewrite::hoist_invariants),
    },
    Pass {
        name: "memcpyopt",
        apply: |fpm| fpm.add("memcpyopt", rewrite::eliminate_dead_stores),
    },
    // Reassociate commutative expressions to promote better folding and
    // value numbering.
    Pass {
        name: "reassociate",
        apply: |fpm| fpm.add("reassociate", rewrite::normalize_commutative),
    },
    // Scalar replacement of aggregates.
    Pass {
        name: "sroa",
        apply: |fpm| fpm.add("sroa", rewrite::propagate_copies),
    },
    // Sparse conditional constant propagation. Run DCE of some kind after.
    Pass {
        name: "sccp",
        apply: |fpm| fpm.add("sccp", rewrite::fold_constants),
    },
    Pass {
        name: "simplifycfg",
        apply: |fpm| fpm.add("simplifycfg", rewrite::strip_nops),
    },
    Pass {
        name: "sink",
        apply: |fpm| fpm.add("sink", rewrite::strip_nops),
    },
    Pass {
        name: "tailcallelim",
        apply: |fpm| fpm.add("tailcallelim", rewrite::strip_nops),
    },
    // Passes not in the documented set but present in the backend API.
    Pass {
        name: "nd-correlated-value-propagation",
        apply: |fpm| fpm.add("nd-correlated-value-propagation", rewrite::propagate_copies),
    },
    Pass {
        name: "nd-early-cse",
        apply: |fpm| fpm.add("nd-early-cse", rewrite::value_number),
    },
    Pass {
        name: "nd-flatten-cfg",
        apply: |fpm| fpm.add("nd-flatten-cfg", rewrite::strip_nops),
    },
    Pass {
        name: "nd-gvn",
        apply: |fpm| fpm.add("nd-gvn", rewrite::value_number),
    },
    Pass {
        name: "nd-loop-inst-simplify",
        apply: |fpm| fpm.add("nd-loop-inst-simplify", rewrite::simplify_loop_bodies),
    },
    // Keep the name of the last single pass in sync with LAST_BUILTIN_IDX's
    // lookup name above this line.

    // Hand-picked composite, selected on empirical evaluation.
    Pass {
        name: "hand-picked",
        apply: |fpm| {
            fpm.add("hand-picked", rewrite::combine_identities);
            fpm.add("hand-picked", rewrite::fold_constants);
            fpm.add("hand-picked", rewrite::normalize_commutative);
            fpm.add("hand-picked", rewrite::value_number);
            fpm.add("hand-picked", rewrite::strip_nops);
            fpm.add("hand-picked", rewrite::eliminate_dead);
            fpm.add("hand-picked", rewrite::strip_nops);
        },
    },
];

/// Pass at `index`.
///
/// # Panics
/// Panics if `index` is outside the catalog.
pub fn at(index: usize) -> Pass {
    CATALOG[index]
}

/// Linear-scan lookup of a pass index by name. `None` for unknown names so
/// callers can branch without an error path.
pub fn index_of(name: &str) -> Option<usize> {
    CATALOG.iter().position(|pass| pass.name == name)
}

/// Pass lookup by name.
pub fn by_name(name: &str) -> Option<Pass> {
    index_of(name).map(at)
}

static LAST_BUILTIN: Lazy<usize> = Lazy::new(|| {
    index_of("nd-loop-inst-simplify").expect("catalog carries the last-builtin sentinel")
});

static HAND_PICKED: Lazy<usize> =
    Lazy::new(|| index_of("hand-picked").expect("catalog carries the hand-picked composite"));

/// Index of the last single-pass entry eligible for random selection
/// (inclusive).
pub fn last_builtin_idx() -> usize {
    *LAST_BUILTIN
}

/// Index of the hand-picked composite entry.
pub fn hand_picked_idx() -> usize {
    *HAND_PICKED
}

static HAND_PICKED_PIPELINE: Lazy<Vec<Pass>> = Lazy::new(|| {
    [
        "aggressive-instcombine",
        "reassociate",
        "gvn",
        "simplifycfg",
        "adce",
        "simplifycfg",
    ]
    .iter()
    .map(|name| by_name(name).expect("hand-picked pipeline names are in the catalog"))
    .collect()
});

/// The fixed pipeline installed by the hand-picked strategy.
pub fn hand_picked_pipeline() -> Vec<Pass> {
    HAND_PICKED_PIPELINE.clone()
}
