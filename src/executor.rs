//! Execution context collaborators for compiled query fragments.
//!
//! A fragment executes against an opaque [`QueryState`] byte block whose
//! first machine word holds a pointer to the query's [`ExecutionContext`].
//! The context carries the transaction's must-abort flag, the execution
//! mode, the query id, and the pipeline operating units handed to the
//! self-driving planner.

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{KilnError, Result};

/// How a module resolves functions for execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecutionMode {
    /// Build a fresh uncached evaluator per resolution.
    Interpret = 0,
    /// Resolve through the module's compiled-entry cache.
    Compiled = 1,
}

impl From<u8> for ExecutionMode {
    fn from(v: u8) -> Self {
        match v {
            0 => ExecutionMode::Interpret,
            _ => ExecutionMode::Compiled,
        }
    }
}

/// Transaction state visible to the execution runtime.
///
/// The runtime only observes and raises the must-abort flag; everything
/// else about transactions lives with the host's transaction manager.
#[derive(Debug, Default)]
pub struct TransactionContext {
    must_abort: AtomicBool,
}

impl TransactionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this transaction must abort.
    pub fn must_abort(&self) -> bool {
        self.must_abort.load(Ordering::Acquire)
    }

    /// Mark this transaction as must-abort.
    pub fn set_must_abort(&self) {
        self.must_abort.store(true, Ordering::Release);
    }
}

/// Operating-unit features recorded per pipeline for the self-driving
/// planner. Opaque to the runtime; carried through the execution context.
#[derive(Debug, Default)]
pub struct PipelineOperatingUnits;

/// Per-query execution context.
pub struct ExecutionContext {
    txn: TransactionContext,
    execution_mode: AtomicU8,
    query_id: AtomicU64,
    query_state: AtomicPtr<u8>,
    pipeline_operating_units: Mutex<Option<Arc<PipelineOperatingUnits>>>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            txn: TransactionContext::new(),
            execution_mode: AtomicU8::new(ExecutionMode::Interpret as u8),
            query_id: AtomicU64::new(0),
            query_state: AtomicPtr::new(std::ptr::null_mut()),
            pipeline_operating_units: Mutex::new(None),
        }
    }

    /// The transaction this query runs under.
    pub fn txn(&self) -> &TransactionContext {
        &self.txn
    }

    pub fn set_execution_mode(&self, mode: ExecutionMode) {
        self.execution_mode.store(mode as u8, Ordering::Release);
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::from(self.execution_mode.load(Ordering::Acquire))
    }

    pub fn set_query_id(&self, query_id: u64) {
        self.query_id.store(query_id, Ordering::Release);
    }

    pub fn query_id(&self) -> u64 {
        self.query_id.load(Ordering::Acquire)
    }

    /// Point the context at the live query state block (null to clear).
    pub fn set_query_state(&self, state: *mut u8) {
        self.query_state.store(state, Ordering::Release);
    }

    pub fn set_pipeline_operating_units(&self, units: Option<Arc<PipelineOperatingUnits>>) {
        *self.pipeline_operating_units.lock() = units;
    }

    pub fn pipeline_operating_units(&self) -> Option<Arc<PipelineOperatingUnits>> {
        self.pipeline_operating_units.lock().clone()
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

const WORD: usize = std::mem::size_of::<usize>();

/// Opaque contiguous byte block threaded through every step function.
///
/// The block's size is fixed when the query is built. The first machine
/// word holds the address of the query's [`ExecutionContext`]; the rest is
/// scratch state owned by the compiled code.
pub struct QueryState {
    bytes: Box<[u8]>,
}

impl QueryState {
    /// Allocate a zeroed query state block.
    ///
    /// # Panics
    /// Panics if `size` cannot hold at least an `ExecutionContext` pointer.
    pub fn new(size: usize) -> Self {
        assert!(
            size >= WORD,
            "query state must be large enough to store at least an ExecutionContext pointer"
        );
        Self {
            bytes: vec![0u8; size].into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.bytes.as_mut_ptr()
    }

    /// Write the context's address into the first machine word.
    ///
    /// The caller keeps `ctx` alive for as long as this block can be run;
    /// fragments read the pointer back on every invocation.
    pub fn install_context(&mut self, ctx: &ExecutionContext) {
        let raw = ctx as *const ExecutionContext as usize;
        self.bytes[..WORD].copy_from_slice(&raw.to_ne_bytes());
    }

    /// Read the execution context from the first machine word, if one has
    /// been installed.
    pub fn context(&self) -> Option<&ExecutionContext> {
        let mut word = [0u8; WORD];
        word.copy_from_slice(&self.bytes[..WORD]);
        let raw = usize::from_ne_bytes(word);
        if raw == 0 {
            return None;
        }
        // SAFETY: install_context stored the address of a context the
        // caller keeps alive for the duration of the run (same contract as
        // the raw block handed to compiled code).
        Some(unsafe { &*(raw as *const ExecutionContext) })
    }

    /// Read an `i64` at `offset`.
    pub fn read_i64(&self, offset: usize) -> Result<i64> {
        let end = offset
            .checked_add(8)
            .ok_or_else(|| KilnError::execution("query state offset overflow"))?;
        if end > self.bytes.len() {
            return Err(KilnError::execution(format!(
                "query state read of 8 bytes at offset {} out of bounds (size {})",
                offset,
                self.bytes.len()
            )));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.bytes[offset..end]);
        Ok(i64::from_ne_bytes(buf))
    }

    /// Write an `i64` at `offset`.
    pub fn write_i64(&mut self, offset: usize, value: i64) -> Result<()> {
        let end = offset
            .checked_add(8)
            .ok_or_else(|| KilnError::execution("query state offset overflow"))?;
        if end > self.bytes.len() {
            return Err(KilnError::execution(format!(
                "query state write of 8 bytes at offset {} out of bounds (size {})",
                offset,
                self.bytes.len()
            )));
        }
        self.bytes[offset..end].copy_from_slice(&value.to_ne_bytes());
        Ok(())
    }
}
