//! Function IR held by compiled modules.
//!
//! Generated fragment functions are straight-line register programs over
//! the query-state byte block, with counted loops and calls into
//! cross-compiled bytecode handlers. The optimizer's function passes
//! operate on this IR through the rewrites in [`rewrite`]; the module
//! lowers it to an executable closure on `get_function`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use crate::error::{KilnError, Result};
use crate::executor::QueryState;

/// Register index. Every function owns a private file of [`NUM_REGS`]
/// registers, zeroed on entry.
pub type Reg = u8;

/// Size of a function's register file.
pub const NUM_REGS: usize = 256;

/// A single IR operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// dst <- immediate
    Const { dst: Reg, value: i64 },
    /// dst <- i64 read from the query state at `offset`
    Load { dst: Reg, offset: usize },
    /// write src into the query state at `offset`
    Store { offset: usize, src: Reg },
    /// dst <- src
    Copy { dst: Reg, src: Reg },
    Add { dst: Reg, lhs: Reg, rhs: Reg },
    Sub { dst: Reg, lhs: Reg, rhs: Reg },
    Mul { dst: Reg, lhs: Reg, rhs: Reg },
    /// Call a cross-compiled bytecode handler by name. The handler runs on
    /// its own zeroed register file; state is shared through the query
    /// state block.
    CallHandler { name: String },
    /// Counted loop over `body`.
    Loop { trips: u32, body: Vec<Op> },
    /// Cooperative abort signal.
    Abort,
    Nop,
}

/// A function body: a name and an operation list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionIr {
    pub name: String,
    pub ops: Vec<Op>,
}

impl FunctionIr {
    pub fn new(name: impl Into<String>, ops: Vec<Op>) -> Self {
        Self {
            name: name.into(),
            ops,
        }
    }

    /// Number of operations, counting loop headers and their bodies.
    pub fn instruction_count(&self) -> usize {
        count_ops(&self.ops)
    }
}

fn count_ops(ops: &[Op]) -> usize {
    ops.iter()
        .map(|op| match op {
            Op::Loop { body, .. } => 1 + count_ops(body),
            _ => 1,
        })
        .sum()
}

impl fmt::Display for FunctionIr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "define @{} {{", self.name)?;
        fmt_ops(&self.ops, f, 1)?;
        writeln!(f, "}}")
    }
}

fn fmt_ops(ops: &[Op], f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
    let pad = "  ".repeat(depth);
    for op in ops {
        match op {
            Op::Const { dst, value } => writeln!(f, "{pad}r{dst} = const {value}")?,
            Op::Load { dst, offset } => writeln!(f, "{pad}r{dst} = load [{offset}]")?,
            Op::Store { offset, src } => writeln!(f, "{pad}store [{offset}], r{src}")?,
            Op::Copy { dst, src } => writeln!(f, "{pad}r{dst} = copy r{src}")?,
            Op::Add { dst, lhs, rhs } => writeln!(f, "{pad}r{dst} = add r{lhs}, r{rhs}")?,
            Op::Sub { dst, lhs, rhs } => writeln!(f, "{pad}r{dst} = sub r{lhs}, r{rhs}")?,
            Op::Mul { dst, lhs, rhs } => writeln!(f, "{pad}r{dst} = mul r{lhs}, r{rhs}")?,
            Op::CallHandler { name } => writeln!(f, "{pad}call @{name}")?,
            Op::Loop { trips, body } => {
                writeln!(f, "{pad}loop {trips} {{")?;
                fmt_ops(body, f, depth + 1)?;
                writeln!(f, "{pad}}}")?;
            }
            Op::Abort => writeln!(f, "{pad}abort")?,
            Op::Nop => writeln!(f, "{pad}nop")?,
        }
    }
    Ok(())
}

/// The IR contents of a compiled module: generated functions plus the
/// cross-compiled handler bodies they call into.
#[derive(Debug, Clone, Default)]
pub struct ModuleIr {
    functions: BTreeMap<String, FunctionIr>,
    handlers: BTreeMap<String, FunctionIr>,
}

impl ModuleIr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_function(&mut self, func: FunctionIr) {
        self.functions.insert(func.name.clone(), func);
    }

    pub fn add_handler(&mut self, func: FunctionIr) {
        self.handlers.insert(func.name.clone(), func);
    }

    pub fn function(&self, name: &str) -> Option<&FunctionIr> {
        self.functions.get(name)
    }

    pub fn functions(&self) -> impl Iterator<Item = (&String, &FunctionIr)> {
        self.functions.iter()
    }

    pub fn functions_mut(&mut self) -> impl Iterator<Item = (&String, &mut FunctionIr)> {
        self.functions.iter_mut()
    }

    pub fn function_names(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }

    pub fn handlers(&self) -> &BTreeMap<String, FunctionIr> {
        &self.handlers
    }
}

// ---------------------------------------------------------------------------
// Interpreter: lowering target for module compilation
// ---------------------------------------------------------------------------

/// Execute an operation list against a query state block on a fresh
/// register file.
pub fn execute(
    ops: &[Op],
    handlers: &BTreeMap<String, FunctionIr>,
    state: &mut QueryState,
) -> Result<()> {
    let mut regs = [0i64; NUM_REGS];
    execute_with(ops, handlers, state, &mut regs)
}

fn execute_with(
    ops: &[Op],
    handlers: &BTreeMap<String, FunctionIr>,
    state: &mut QueryState,
    regs: &mut [i64; NUM_REGS],
) -> Result<()> {
    for op in ops {
        match op {
            Op::Const { dst, value } => regs[*dst as usize] = *value,
            Op::Load { dst, offset } => regs[*dst as usize] = state.read_i64(*offset)?,
            Op::Store { offset, src } => state.write_i64(*offset, regs[*src as usize])?,
            Op::Copy { dst, src } => regs[*dst as usize] = regs[*src as usize],
            Op::Add { dst, lhs, rhs } => {
                regs[*dst as usize] = regs[*lhs as usize].wrapping_add(regs[*rhs as usize])
            }
            Op::Sub { dst, lhs, rhs } => {
                regs[*dst as usize] = regs[*lhs as usize].wrapping_sub(regs[*rhs as usize])
            }
            Op::Mul { dst, lhs, rhs } => {
                regs[*dst as usize] = regs[*lhs as usize].wrapping_mul(regs[*rhs as usize])
            }
            Op::CallHandler { name } => {
                let handler = handlers.get(name).ok_or_else(|| {
                    KilnError::internal(format!("handler '{}' not linked into module", name))
                })?;
                let mut handler_regs = [0i64; NUM_REGS];
                execute_with(&handler.ops, handlers, state, &mut handler_regs)?;
            }
            Op::Loop { trips, body } => {
                for _ in 0..*trips {
                    execute_with(body, handlers, state, regs)?;
                }
            }
            Op::Abort => return Err(KilnError::FragmentAbort),
            Op::Nop => {}
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Analysis helpers
// ---------------------------------------------------------------------------

fn visit_reads(op: &Op, visit: &mut impl FnMut(Reg)) {
    match op {
        Op::Copy { src, .. } | Op::Store { src, .. } => visit(*src),
        Op::Add { lhs, rhs, .. } | Op::Sub { lhs, rhs, .. } | Op::Mul { lhs, rhs, .. } => {
            visit(*lhs);
            visit(*rhs);
        }
        _ => {}
    }
}

/// Destination register of pure register-writing ops.
fn write_of(op: &Op) -> Option<Reg> {
    match op {
        Op::Const { dst, .. }
        | Op::Load { dst, .. }
        | Op::Copy { dst, .. }
        | Op::Add { dst, .. }
        | Op::Sub { dst, .. }
        | Op::Mul { dst, .. } => Some(*dst),
        _ => None,
    }
}

fn regs_read(ops: &[Op]) -> HashSet<Reg> {
    let mut set = HashSet::new();
    collect_reads(ops, &mut set);
    set
}

fn collect_reads(ops: &[Op], set: &mut HashSet<Reg>) {
    for op in ops {
        visit_reads(op, &mut |r| {
            set.insert(r);
        });
        if let Op::Loop { body, .. } = op {
            collect_reads(body, set);
        }
    }
}

fn regs_written(ops: &[Op]) -> HashSet<Reg> {
    let mut set = HashSet::new();
    collect_writes(ops, &mut set);
    set
}

fn collect_writes(ops: &[Op], set: &mut HashSet<Reg>) {
    for op in ops {
        if let Some(dst) = write_of(op) {
            set.insert(dst);
        }
        if let Op::Loop { body, .. } = op {
            collect_writes(body, set);
        }
    }
}

fn max_reg(ops: &[Op]) -> Option<Reg> {
    let mut max: Option<Reg> = None;
    let mut bump = |r: Reg| {
        max = Some(max.map_or(r, |m| m.max(r)));
    };
    for op in ops {
        visit_reads(op, &mut bump);
        if let Some(dst) = write_of(op) {
            bump(dst);
        }
        if let Op::Loop { body, .. } = op {
            if let Some(m) = max_reg(body) {
                bump(m);
            }
        }
    }
    max
}

/// Registers a body may read before writing them. Over-approximates for
/// loop bodies (any read in a loop counts).
fn read_before_write(ops: &[Op]) -> HashSet<Reg> {
    let mut rbw = HashSet::new();
    let mut written = HashSet::new();
    collect_read_before_write(ops, &mut rbw, &mut written);
    rbw
}

fn collect_read_before_write(ops: &[Op], rbw: &mut HashSet<Reg>, written: &mut HashSet<Reg>) {
    for op in ops {
        if let Op::Loop { body, .. } = op {
            for r in regs_read(body) {
                if !written.contains(&r) {
                    rbw.insert(r);
                }
            }
            written.extend(regs_written(body));
            continue;
        }
        visit_reads(op, &mut |r| {
            if !written.contains(&r) {
                rbw.insert(r);
            }
        });
        if let Some(dst) = write_of(op) {
            written.insert(dst);
        }
    }
}

// ---------------------------------------------------------------------------
// Rewrites: the transformation primitives catalog passes append
// ---------------------------------------------------------------------------

/// Function- and module-level IR rewrites.
///
/// Each rewrite returns whether it changed anything. Several optimization
/// passes in the catalog share one rewrite class; loop-oriented passes
/// operate on the IR's counted loops.
pub mod rewrite {
    use super::*;

    /// Fold arithmetic over known-constant registers into constants.
    pub fn fold_constants(func: &mut FunctionIr) -> bool {
        fold_ops(&mut func.ops)
    }

    fn fold_ops(ops: &mut Vec<Op>) -> bool {
        let mut changed = false;
        let mut known: Vec<Option<i64>> = vec![None; NUM_REGS];
        for op in ops.iter_mut() {
            match op {
                Op::Const { dst, value } => {
                    let (d, v) = (*dst, *value);
                    known[d as usize] = Some(v);
                }
                Op::Copy { dst, src } => {
                    let (d, s) = (*dst, *src);
                    if let Some(v) = known[s as usize] {
                        *op = Op::Const { dst: d, value: v };
                        changed = true;
                    }
                    known[d as usize] = known[s as usize];
                }
                Op::Add { dst, lhs, rhs } => {
                    let (d, l, r) = (*dst, *lhs, *rhs);
                    known[d as usize] = match (known[l as usize], known[r as usize]) {
                        (Some(a), Some(b)) => {
                            let v = a.wrapping_add(b);
                            *op = Op::Const { dst: d, value: v };
                            changed = true;
                            Some(v)
                        }
                        _ => None,
                    };
                }
                Op::Sub { dst, lhs, rhs } => {
                    let (d, l, r) = (*dst, *lhs, *rhs);
                    known[d as usize] = match (known[l as usize], known[r as usize]) {
                        (Some(a), Some(b)) => {
                            let v = a.wrapping_sub(b);
                            *op = Op::Const { dst: d, value: v };
                            changed = true;
                            Some(v)
                        }
                        _ => None,
                    };
                }
                Op::Mul { dst, lhs, rhs } => {
                    let (d, l, r) = (*dst, *lhs, *rhs);
                    known[d as usize] = match (known[l as usize], known[r as usize]) {
                        (Some(a), Some(b)) => {
                            let v = a.wrapping_mul(b);
                            *op = Op::Const { dst: d, value: v };
                            changed = true;
                            Some(v)
                        }
                        _ => None,
                    };
                }
                Op::Load { dst, .. } => {
                    let d = *dst;
                    known[d as usize] = None;
                }
                Op::Loop { body, .. } => {
                    changed |= fold_ops(body);
                    for r in regs_written(body) {
                        known[r as usize] = None;
                    }
                }
                Op::Store { .. } | Op::CallHandler { .. } | Op::Abort | Op::Nop => {}
            }
        }
        changed
    }

    /// Rewire reads of copied registers to their source.
    pub fn propagate_copies(func: &mut FunctionIr) -> bool {
        propagate_ops(&mut func.ops)
    }

    fn propagate_ops(ops: &mut Vec<Op>) -> bool {
        let mut changed = false;
        let mut copy_of: Vec<Option<Reg>> = vec![None; NUM_REGS];

        fn resolve(copy_of: &[Option<Reg>], r: Reg) -> Reg {
            copy_of[r as usize].unwrap_or(r)
        }
        fn invalidate(copy_of: &mut [Option<Reg>], written: Reg) {
            copy_of[written as usize] = None;
            for entry in copy_of.iter_mut() {
                if *entry == Some(written) {
                    *entry = None;
                }
            }
        }

        for op in ops.iter_mut() {
            // Rewrite source operands through the copy map first.
            let mut rewrote = false;
            match op {
                Op::Copy { src, .. } | Op::Store { src, .. } => {
                    let root = resolve(&copy_of, *src);
                    if root != *src {
                        *src = root;
                        rewrote = true;
                    }
                }
                Op::Add { lhs, rhs, .. } | Op::Sub { lhs, rhs, .. } | Op::Mul { lhs, rhs, .. } => {
                    let (l, r) = (resolve(&copy_of, *lhs), resolve(&copy_of, *rhs));
                    if l != *lhs || r != *rhs {
                        *lhs = l;
                        *rhs = r;
                        rewrote = true;
                    }
                }
                _ => {}
            }
            changed |= rewrote;

            match op {
                Op::Copy { dst, src } => {
                    let (d, s) = (*dst, *src);
                    if d == s {
                        *op = Op::Nop;
                        changed = true;
                    } else {
                        invalidate(&mut copy_of, d);
                        copy_of[d as usize] = Some(s);
                    }
                }
                Op::Loop { body, .. } => {
                    changed |= propagate_ops(body);
                    for r in regs_written(body) {
                        invalidate(&mut copy_of, r);
                    }
                }
                _ => {
                    if let Some(dst) = write_of(op) {
                        invalidate(&mut copy_of, dst);
                    }
                }
            }
        }
        changed
    }

    /// Remove pure operations whose results are never observed, plus nops.
    pub fn eliminate_dead(func: &mut FunctionIr) -> bool {
        let mut live = HashSet::new();
        dead_ops(&mut func.ops, &mut live)
    }

    fn dead_ops(ops: &mut Vec<Op>, live: &mut HashSet<Reg>) -> bool {
        let mut changed = false;
        let mut keep = vec![true; ops.len()];
        for i in (0..ops.len()).rev() {
            match &mut ops[i] {
                Op::Nop => {
                    keep[i] = false;
                    changed = true;
                }
                Op::Store { src, .. } => {
                    live.insert(*src);
                }
                Op::Loop { body, .. } => {
                    // Conservative: loop-carried reads stay live, writes in
                    // the body are not killed (the loop may run zero times).
                    let mut body_live: HashSet<Reg> = live.iter().copied().collect();
                    body_live.extend(regs_read(body));
                    changed |= dead_ops(body, &mut body_live);
                    live.extend(regs_read(body));
                }
                Op::CallHandler { .. } | Op::Abort => {}
                op => {
                    if let Some(dst) = write_of(op) {
                        if !live.contains(&dst) {
                            keep[i] = false;
                            changed = true;
                        } else {
                            live.remove(&dst);
                            visit_reads(op, &mut |r| {
                                live.insert(r);
                            });
                        }
                    }
                }
            }
        }
        let mut idx = 0;
        ops.retain(|_| {
            let k = keep[idx];
            idx += 1;
            k
        });
        changed
    }

    /// Remove stores that are overwritten before any possible observation.
    pub fn eliminate_dead_stores(func: &mut FunctionIr) -> bool {
        dead_store_ops(&mut func.ops)
    }

    fn dead_store_ops(ops: &mut Vec<Op>) -> bool {
        let mut changed = false;
        let mut pending: HashMap<usize, usize> = HashMap::new();
        let mut dead: Vec<usize> = Vec::new();
        for i in 0..ops.len() {
            match &mut ops[i] {
                Op::Store { offset, .. } => {
                    if let Some(prior) = pending.insert(*offset, i) {
                        dead.push(prior);
                        changed = true;
                    }
                }
                Op::Load { offset, .. } => {
                    pending.remove(offset);
                }
                // Handlers and loop bodies may observe any offset.
                Op::CallHandler { .. } | Op::Abort => pending.clear(),
                Op::Loop { body, .. } => {
                    changed |= dead_store_ops(body);
                    pending.clear();
                }
                _ => {}
            }
        }
        dead.sort_unstable();
        for i in dead.into_iter().rev() {
            ops.remove(i);
        }
        changed
    }

    /// Combine arithmetic identities (x+0, x-0, x*1, x*0).
    pub fn combine_identities(func: &mut FunctionIr) -> bool {
        combine_ops(&mut func.ops)
    }

    fn combine_ops(ops: &mut Vec<Op>) -> bool {
        let mut changed = false;
        let mut known: Vec<Option<i64>> = vec![None; NUM_REGS];
        for op in ops.iter_mut() {
            match op {
                Op::Const { dst, value } => {
                    let (d, v) = (*dst, *value);
                    known[d as usize] = Some(v);
                    continue;
                }
                Op::Add { dst, lhs, rhs } => {
                    let (d, l, r) = (*dst, *lhs, *rhs);
                    if known[r as usize] == Some(0) {
                        *op = Op::Copy { dst: d, src: l };
                        changed = true;
                    } else if known[l as usize] == Some(0) {
                        *op = Op::Copy { dst: d, src: r };
                        changed = true;
                    }
                }
                Op::Sub { dst, lhs, rhs } => {
                    let (d, l, r) = (*dst, *lhs, *rhs);
                    if known[r as usize] == Some(0) {
                        *op = Op::Copy { dst: d, src: l };
                        changed = true;
                    }
                }
                Op::Mul { dst, lhs, rhs } => {
                    let (d, l, r) = (*dst, *lhs, *rhs);
                    if known[r as usize] == Some(1) {
                        *op = Op::Copy { dst: d, src: l };
                        changed = true;
                    } else if known[l as usize] == Some(1) {
                        *op = Op::Copy { dst: d, src: r };
                        changed = true;
                    } else if known[l as usize] == Some(0) || known[r as usize] == Some(0) {
                        *op = Op::Const { dst: d, value: 0 };
                        known[d as usize] = Some(0);
                        changed = true;
                        continue;
                    }
                }
                Op::Loop { body, .. } => {
                    changed |= combine_ops(body);
                    for reg in regs_written(body) {
                        known[reg as usize] = None;
                    }
                    continue;
                }
                _ => {}
            }
            match op {
                Op::Copy { dst, src } => {
                    let (d, s) = (*dst, *src);
                    known[d as usize] = known[s as usize];
                }
                _ => {
                    if let Some(dst) = write_of(op) {
                        known[dst as usize] = None;
                    }
                }
            }
        }
        changed
    }

    /// Canonicalize commutative operand order (low register first).
    pub fn normalize_commutative(func: &mut FunctionIr) -> bool {
        normalize_ops(&mut func.ops)
    }

    fn normalize_ops(ops: &mut Vec<Op>) -> bool {
        let mut changed = false;
        for op in ops.iter_mut() {
            match op {
                Op::Add { lhs, rhs, .. } | Op::Mul { lhs, rhs, .. } => {
                    if *lhs > *rhs {
                        std::mem::swap(lhs, rhs);
                        changed = true;
                    }
                }
                Op::Loop { body, .. } => changed |= normalize_ops(body),
                _ => {}
            }
        }
        changed
    }

    /// Replace recomputed arithmetic with a copy of the earlier result.
    pub fn value_number(func: &mut FunctionIr) -> bool {
        number_ops(&mut func.ops)
    }

    fn number_ops(ops: &mut Vec<Op>) -> bool {
        let mut changed = false;
        let mut table: HashMap<(u8, Reg, Reg), Reg> = HashMap::new();
        for op in ops.iter_mut() {
            let expr = match op {
                Op::Add { dst, lhs, rhs } => Some((0u8, *dst, *lhs, *rhs)),
                Op::Sub { dst, lhs, rhs } => Some((1u8, *dst, *lhs, *rhs)),
                Op::Mul { dst, lhs, rhs } => Some((2u8, *dst, *lhs, *rhs)),
                _ => None,
            };
            if let Some((tag, dst, lhs, rhs)) = expr {
                let key = (tag, lhs, rhs);
                let hit = table.get(&key).copied();
                table.retain(|k, v| k.1 != dst && k.2 != dst && *v != dst);
                match hit {
                    Some(prior) if prior != dst => {
                        *op = Op::Copy { dst, src: prior };
                        changed = true;
                        // dst now aliases prior; no new expression produced.
                    }
                    Some(_) => {}
                    // An op that overwrites its own operand produces no
                    // reusable expression.
                    None if dst != lhs && dst != rhs => {
                        table.insert(key, dst);
                    }
                    None => {}
                }
                continue;
            }
            match op {
                Op::Loop { body, .. } => {
                    changed |= number_ops(body);
                    table.clear();
                }
                _ => {
                    if let Some(dst) = write_of(op) {
                        table.retain(|k, v| k.1 != dst && k.2 != dst && *v != dst);
                    }
                }
            }
        }
        changed
    }

    /// Remove nops, including inside loop bodies.
    pub fn strip_nops(func: &mut FunctionIr) -> bool {
        strip_ops(&mut func.ops)
    }

    fn strip_ops(ops: &mut Vec<Op>) -> bool {
        let before = count_ops(ops);
        for op in ops.iter_mut() {
            if let Op::Loop { body, .. } = op {
                strip_ops(body);
            }
        }
        ops.retain(|op| !matches!(op, Op::Nop));
        count_ops(ops) != before
    }

    /// Hoist loop-invariant pure arithmetic out of loop bodies.
    pub fn hoist_invariants(func: &mut FunctionIr) -> bool {
        hoist_ops(&mut func.ops)
    }

    fn hoist_ops(ops: &mut Vec<Op>) -> bool {
        let mut changed = false;
        let mut result: Vec<Op> = Vec::with_capacity(ops.len());
        for mut op in ops.drain(..) {
            if let Op::Loop { trips, ref mut body } = op {
                changed |= hoist_ops(body);
                if trips >= 1 && !body.iter().any(|o| matches!(o, Op::Abort)) {
                    loop {
                        let Some(j) = find_hoistable(body) else { break };
                        result.push(body.remove(j));
                        changed = true;
                    }
                }
            }
            result.push(op);
        }
        *ops = result;
        changed
    }

    fn find_hoistable(body: &[Op]) -> Option<usize> {
        let written = regs_written(body);
        for (j, op) in body.iter().enumerate() {
            let invariant = match op {
                Op::Const { .. } => true,
                Op::Copy { src, .. } => !written.contains(src),
                Op::Add { lhs, rhs, .. } | Op::Sub { lhs, rhs, .. } | Op::Mul { lhs, rhs, .. } => {
                    !written.contains(lhs) && !written.contains(rhs)
                }
                _ => false,
            };
            if !invariant {
                continue;
            }
            let Some(dst) = write_of(op) else { continue };
            let written_once = body
                .iter()
                .filter(|o| write_of(o) == Some(dst) || regs_written_in_loops(o).contains(&dst))
                .count()
                == 1;
            let read_before = body[..j].iter().any(|o| {
                let mut reads = false;
                visit_reads(o, &mut |r| reads |= r == dst);
                if let Op::Loop { body, .. } = o {
                    reads |= regs_read(body).contains(&dst);
                }
                reads
            });
            if written_once && !read_before {
                return Some(j);
            }
        }
        None
    }

    fn regs_written_in_loops(op: &Op) -> HashSet<Reg> {
        match op {
            Op::Loop { body, .. } => regs_written(body),
            _ => HashSet::new(),
        }
    }

    /// Fully unroll short counted loops.
    pub fn unroll_small_loops(func: &mut FunctionIr) -> bool {
        unroll_ops(&mut func.ops)
    }

    fn unroll_ops(ops: &mut Vec<Op>) -> bool {
        const MAX_UNROLL_TRIPS: u32 = 4;
        let mut changed = false;
        let mut result: Vec<Op> = Vec::with_capacity(ops.len());
        for mut op in ops.drain(..) {
            if let Op::Loop { trips, ref mut body } = op {
                changed |= unroll_ops(body);
                if trips == 0 {
                    changed = true;
                    continue;
                }
                if trips <= MAX_UNROLL_TRIPS {
                    for _ in 0..trips {
                        result.extend(body.iter().cloned());
                    }
                    changed = true;
                    continue;
                }
            }
            result.push(op);
        }
        *ops = result;
        changed
    }

    /// Delete loops whose bodies do nothing.
    pub fn delete_empty_loops(func: &mut FunctionIr) -> bool {
        delete_loops(&mut func.ops)
    }

    fn delete_loops(ops: &mut Vec<Op>) -> bool {
        let mut changed = false;
        for op in ops.iter_mut() {
            if let Op::Loop { body, .. } = op {
                changed |= delete_loops(body);
            }
        }
        let before = ops.len();
        ops.retain(|op| match op {
            Op::Loop { trips, body } => {
                *trips > 0 && body.iter().any(|o| !matches!(o, Op::Nop))
            }
            _ => true,
        });
        changed | (ops.len() != before)
    }

    /// Constant-fold and clean up loop bodies in place.
    pub fn simplify_loop_bodies(func: &mut FunctionIr) -> bool {
        simplify_bodies(&mut func.ops)
    }

    fn simplify_bodies(ops: &mut Vec<Op>) -> bool {
        let mut changed = false;
        for op in ops.iter_mut() {
            if let Op::Loop { body, .. } = op {
                changed |= fold_ops(body);
                body.retain(|o| !matches!(o, Op::Nop));
                changed |= simplify_bodies(body);
            }
        }
        changed
    }

    // -----------------------------------------------------------------------
    // Module-level rewrites (the simplify flow)
    // -----------------------------------------------------------------------

    /// Inline every resolvable handler call into its call site.
    ///
    /// Handler registers are remapped above the caller's live range and
    /// zero-initialized where the handler reads before writing, preserving
    /// the fresh-register-file call semantics.
    pub fn always_inline_handlers(module: &mut ModuleIr) -> bool {
        let handlers = module.handlers.clone();
        let mut changed = false;
        for func in module.functions.values_mut() {
            let base = max_reg(&func.ops).map_or(0u16, |m| m as u16 + 1);
            changed |= inline_ops(&mut func.ops, &handlers, base);
        }
        changed
    }

    fn inline_ops(ops: &mut Vec<Op>, handlers: &BTreeMap<String, FunctionIr>, base: u16) -> bool {
        let mut changed = false;
        let mut result: Vec<Op> = Vec::with_capacity(ops.len());
        for op in ops.drain(..) {
            match op {
                Op::CallHandler { name } => match inline_body(handlers.get(&name), base) {
                    Some(body) => {
                        result.extend(body);
                        changed = true;
                    }
                    None => result.push(Op::CallHandler { name }),
                },
                Op::Loop { trips, mut body } => {
                    changed |= inline_ops(&mut body, handlers, base);
                    result.push(Op::Loop { trips, body });
                }
                other => result.push(other),
            }
        }
        *ops = result;
        changed
    }

    fn inline_body(handler: Option<&FunctionIr>, base: u16) -> Option<Vec<Op>> {
        let handler = handler?;
        let handler_max = max_reg(&handler.ops).unwrap_or(0) as u16;
        if base + handler_max >= NUM_REGS as u16 {
            return None; // no register space left; keep the call
        }
        let remap = |r: Reg| (base + r as u16) as Reg;
        let mut body: Vec<Op> = read_before_write(&handler.ops)
            .into_iter()
            .map(|r| Op::Const {
                dst: remap(r),
                value: 0,
            })
            .collect();
        body.sort_by_key(|op| write_of(op));
        body.extend(handler.ops.iter().map(|op| remap_op(op, &remap)));
        Some(body)
    }

    fn remap_op(op: &Op, remap: &impl Fn(Reg) -> Reg) -> Op {
        match op {
            Op::Const { dst, value } => Op::Const {
                dst: remap(*dst),
                value: *value,
            },
            Op::Load { dst, offset } => Op::Load {
                dst: remap(*dst),
                offset: *offset,
            },
            Op::Store { offset, src } => Op::Store {
                offset: *offset,
                src: remap(*src),
            },
            Op::Copy { dst, src } => Op::Copy {
                dst: remap(*dst),
                src: remap(*src),
            },
            Op::Add { dst, lhs, rhs } => Op::Add {
                dst: remap(*dst),
                lhs: remap(*lhs),
                rhs: remap(*rhs),
            },
            Op::Sub { dst, lhs, rhs } => Op::Sub {
                dst: remap(*dst),
                lhs: remap(*lhs),
                rhs: remap(*rhs),
            },
            Op::Mul { dst, lhs, rhs } => Op::Mul {
                dst: remap(*dst),
                lhs: remap(*lhs),
                rhs: remap(*rhs),
            },
            Op::CallHandler { name } => Op::CallHandler { name: name.clone() },
            Op::Loop { trips, body } => Op::Loop {
                trips: *trips,
                body: body.iter().map(|o| remap_op(o, remap)).collect(),
            },
            Op::Abort => Op::Abort,
            Op::Nop => Op::Nop,
        }
    }

    /// Drop handler bodies no remaining call site can reach.
    pub fn global_dce_handlers(module: &mut ModuleIr) -> bool {
        let mut reachable: HashSet<String> = HashSet::new();
        let mut worklist: Vec<String> = Vec::new();
        for func in module.functions.values() {
            collect_handler_calls(&func.ops, &mut worklist);
        }
        while let Some(name) = worklist.pop() {
            if reachable.insert(name.clone()) {
                if let Some(handler) = module.handlers.get(&name) {
                    collect_handler_calls(&handler.ops, &mut worklist);
                }
            }
        }
        let before = module.handlers.len();
        module.handlers.retain(|name, _| reachable.contains(name));
        module.handlers.len() != before
    }

    fn collect_handler_calls(ops: &[Op], out: &mut Vec<String>) {
        for op in ops {
            match op {
                Op::CallHandler { name } => out.push(name.clone()),
                Op::Loop { body, .. } => collect_handler_calls(body, out),
                _ => {}
            }
        }
    }
}
