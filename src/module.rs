//! Compiled module: function IR, compiled-entry cache, and the profile
//! plus optimizer that drive recompilation.
//!
//! A module is exclusively owned by one fragment. Its internals use the
//! usual lock discipline, but the module itself is not meant to be shared
//! across fragments; concurrent fragments each own distinct modules.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{KilnError, Result};
use crate::executor::{ExecutionMode, QueryState};
use crate::ir::{self, ModuleIr};
use crate::optimizer::FunctionOptimizer;
use crate::profile::FunctionProfile;

/// An executable function resolved from a module.
pub struct CompiledFunction {
    name: String,
    callable: Box<dyn Fn(&mut QueryState) -> Result<()> + Send + Sync>,
}

impl CompiledFunction {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the function against a query state block.
    pub fn call(&self, state: &mut QueryState) -> Result<()> {
        (self.callable)(state)
    }
}

impl std::fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("name", &self.name)
            .finish()
    }
}

/// A compiled query module.
pub struct Module {
    ir: RwLock<ModuleIr>,
    compiled: RwLock<HashMap<String, Arc<CompiledFunction>>>,
    profile: RwLock<FunctionProfile>,
    optimizer: Mutex<FunctionOptimizer>,
}

impl Module {
    /// Build a module from front-end IR. Simplification (handler inlining
    /// plus global DCE) runs once, here, before any optimization
    /// iteration.
    pub fn new(ir: ModuleIr) -> Self {
        Self::with_optimizer(ir, FunctionOptimizer::new())
    }

    /// Build a module with a caller-supplied (e.g. seeded) optimizer.
    pub fn with_optimizer(mut ir: ModuleIr, optimizer: FunctionOptimizer) -> Self {
        optimizer.simplify(&mut ir);
        Self {
            ir: RwLock::new(ir),
            compiled: RwLock::new(HashMap::new()),
            profile: RwLock::new(FunctionProfile::new()),
            optimizer: Mutex::new(optimizer),
        }
    }

    /// Resolve a function under the given execution mode.
    ///
    /// `Compiled` resolves through the compiled-entry cache; `Interpret`
    /// builds a fresh uncached evaluator.
    pub fn get_function(&self, name: &str, mode: ExecutionMode) -> Result<Arc<CompiledFunction>> {
        match mode {
            ExecutionMode::Interpret => Ok(Arc::new(self.lower(name)?)),
            ExecutionMode::Compiled => {
                if let Some(hit) = self.compiled.read().get(name) {
                    return Ok(Arc::clone(hit));
                }
                let compiled = Arc::new(self.lower(name)?);
                self.compiled
                    .write()
                    .insert(name.to_string(), Arc::clone(&compiled));
                Ok(compiled)
            }
        }
    }

    /// Lower a function's current IR to an executable closure.
    fn lower(&self, name: &str) -> Result<CompiledFunction> {
        let ir = self.ir.read();
        let func = ir
            .function(name)
            .ok_or_else(|| KilnError::function_not_found(name, &ir.function_names()))?;
        let ops = func.ops.clone();
        let handlers = ir.handlers().clone();
        Ok(CompiledFunction {
            name: name.to_string(),
            callable: Box::new(move |state| ir::execute(&ops, &handlers, state)),
        })
    }

    /// Re-run the optimization flow under the profile's current strategy
    /// and drop every compiled entry, so the next `get_function` resolves
    /// code compiled under the newly applied passes. The IR itself stays.
    pub fn dangerous_recompile(&self) {
        {
            let mut ir = self.ir.write();
            let mut profile = self.profile.write();
            let mut optimizer = self.optimizer.lock();
            optimizer.optimize(&mut ir, &mut profile);
        }
        self.compiled.write().clear();
        tracing::debug!("recompile requested; compiled entries dropped");
    }

    pub fn profile(&self) -> RwLockReadGuard<'_, FunctionProfile> {
        self.profile.read()
    }

    pub fn profile_mut(&self) -> RwLockWriteGuard<'_, FunctionProfile> {
        self.profile.write()
    }

    /// Zero per-function counters without discarding registered names.
    pub fn reset_profile(&self) {
        self.profile.write().reset();
    }

    pub fn ir(&self) -> RwLockReadGuard<'_, ModuleIr> {
        self.ir.read()
    }

    pub fn function_names(&self) -> Vec<String> {
        self.ir.read().function_names()
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("functions", &self.ir.read().function_names())
            .finish()
    }
}
