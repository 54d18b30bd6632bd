// This module implements the linear-scan register allocator. Live intervals come
// from the analyzer in program order (start, then register id), and a single scan
// hands out the lowest free physical register, expiring active intervals whose end
// lies before the current start. When the pool is empty the active interval with
// the furthest end is evicted if it outlives the current one; otherwise the current
// interval is spilled.
//
// Spill code is inserted once and never iterated. If the plain scan over the whole
// budget spills anything, the top K registers are reserved as scratch and the scan
// is redone on the remaining registers. K is the smallest count for which no
// statement touches more than K of the values that rescan spills; the largest
// number of distinct registers any single statement references always qualifies.
// Every spilled value then lives in a 4-byte slot and is only held in a register for
// the statement that touches it: a reload before each use, a store after each
// definition, both through a scratch register picked per statement. Those short
// segments are the recomputed intervals; because each covers one statement and
// a statement never touches more than K spilled values, no further spilling can
// result.

//! Linear-scan allocation with furthest-end spilling.

use bumpalo::Bump;

use super::{AllocError, AllocationRequest, AllocationResult, Location, SpillPoint, SpillRecord, SPILL_SLOT_BYTES};
use crate::core::analyzer::{Analyzer, LiveInterval};
use crate::core::register_file::{PhysReg, RegAllocError, RegisterFile};
use crate::ir::{Kernel, VReg};

struct ScanOutcome {
    assigned: Vec<(VReg, PhysReg)>,
    spilled: Vec<VReg>,
}

pub fn allocate(
    arena: &Bump,
    kernel: &Kernel,
    request: &AllocationRequest,
) -> Result<AllocationResult, AllocError> {
    let budget = request.register_count;
    if budget == 0 {
        return Err(AllocError::ZeroBudget);
    }

    let liveness = Analyzer::new(arena).analyze(kernel);
    if liveness.intervals.is_empty() {
        log::debug!("linear-scan on `{}`: no virtual registers", kernel.name());
        return Ok(AllocationResult::default());
    }

    let mut regfile = RegisterFile::new(budget);
    let outcome = scan(liveness.intervals, &mut regfile)?;
    if outcome.spilled.is_empty() {
        log::debug!(
            "linear-scan on `{}`: {} intervals in {} of {} registers, no spills",
            kernel.name(),
            liveness.intervals.len(),
            regfile.high_water(),
            budget
        );
        return Ok(AllocationResult {
            locations: outcome
                .assigned
                .into_iter()
                .map(|(vreg, reg)| (vreg, Location::Register(reg)))
                .collect(),
            spills: Vec::new(),
            scratch: Vec::new(),
        });
    }

    // -------- spilling required ---------
    let (widest, needed) = widest_statement(kernel);
    if needed > budget {
        return Err(AllocError::InsufficientRegisters { needed, budget, index: widest });
    }

    let (scratch, outcome) = scan_with_scratch(kernel, liveness.intervals, &mut regfile, needed)?;

    let mut spilled = outcome.spilled;
    spilled.sort_unstable();
    let needed_bytes = spilled.len() as u64 * u64::from(SPILL_SLOT_BYTES);
    if needed_bytes > u64::from(request.scratch_bytes) {
        return Err(AllocError::ScratchExhausted { needed_bytes, capacity: request.scratch_bytes });
    }

    let mut spills: Vec<SpillRecord> = spilled
        .iter()
        .enumerate()
        .map(|(slot, &vreg)| SpillRecord { vreg, slot: slot as u32, stores: Vec::new(), reloads: Vec::new() })
        .collect();

    for (index, stmt) in kernel.statements().iter().enumerate() {
        let touched = stmt.registers().into_iter().filter(|r| spilled.binary_search(r).is_ok());
        for (vreg, &register) in touched.zip(&scratch) {
            let Ok(pos) = spilled.binary_search(&vreg) else {
                continue;
            };
            let record = &mut spills[pos];
            let defined = stmt.def() == Some(vreg);
            // A predicated definition may not write, so the old value has to
            // be in the scratch register before the store writes it back.
            if stmt.uses().any(|u| u == vreg) || (defined && stmt.predicate.is_some()) {
                record.reloads.push(SpillPoint { position: index, register });
            }
            if defined {
                record.stores.push(SpillPoint { position: index, register });
            }
        }
    }

    let mut locations: hashbrown::HashMap<VReg, Location> = outcome
        .assigned
        .into_iter()
        .map(|(vreg, reg)| (vreg, Location::Register(reg)))
        .collect();
    for record in &spills {
        locations.insert(record.vreg, Location::Spilled { slot: record.slot });
    }

    log::debug!(
        "linear-scan on `{}`: {} intervals, {} spilled, {} scratch registers of {}",
        kernel.name(),
        liveness.intervals.len(),
        spills.len(),
        scratch.len(),
        budget
    );

    Ok(AllocationResult { locations, spills, scratch })
}

fn scan(intervals: &[LiveInterval], regfile: &mut RegisterFile) -> Result<ScanOutcome, AllocError> {
    let mut active: Vec<(LiveInterval, PhysReg)> = Vec::new();
    let mut assigned: Vec<(VReg, PhysReg)> = Vec::with_capacity(intervals.len());
    let mut spilled = Vec::new();

    for current in intervals {
        let mut i = 0;
        while i < active.len() {
            if active[i].0.end < current.start {
                let (_, reg) = active.swap_remove(i);
                regfile.free_register(reg)?;
            } else {
                i += 1;
            }
        }

        match regfile.allocate_reg(current.vreg) {
            Ok(reg) => {
                log::trace!("{} -> {}", current.vreg, reg);
                active.push((*current, reg));
                assigned.push((current.vreg, reg));
            }
            Err(RegAllocError::NoRegistersAvailable) => {
                let furthest = active
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, (interval, _))| (interval.end, interval.vreg))
                    .map(|(idx, _)| idx);
                match furthest {
                    Some(idx) if active[idx].0.end > current.end => {
                        let (evicted, reg) = active.swap_remove(idx);
                        debug_assert_eq!(regfile.get_assignment(reg), Some(evicted.vreg));
                        log::trace!("{} evicts {} from {}", current.vreg, evicted.vreg, reg);
                        regfile.assign_register(reg, current.vreg)?;
                        assigned.retain(|(vreg, _)| *vreg != evicted.vreg);
                        spilled.push(evicted.vreg);
                        active.push((*current, reg));
                        assigned.push((current.vreg, reg));
                    }
                    _ => {
                        log::trace!("{} spilled", current.vreg);
                        spilled.push(current.vreg);
                    }
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    assigned.sort_unstable();
    Ok(ScanOutcome { assigned, spilled })
}

/// Rescan behind the fewest scratch registers that cover every statement's
/// spilled operands. `needed` scratch registers always do.
fn scan_with_scratch(
    kernel: &Kernel,
    intervals: &[LiveInterval],
    regfile: &mut RegisterFile,
    needed: u32,
) -> Result<(Vec<PhysReg>, ScanOutcome), AllocError> {
    let mut count = 1;
    loop {
        regfile.reset();
        let scratch = regfile.reserve_scratch(count);
        let outcome = scan(intervals, regfile)?;
        if count >= needed || spilled_width(kernel, &outcome.spilled) <= count {
            return Ok((scratch, outcome));
        }
        log::trace!("{} scratch registers do not cover {} spilled values", count, outcome.spilled.len());
        count += 1;
    }
}

/// Most spilled registers a single statement references.
fn spilled_width(kernel: &Kernel, spilled: &[VReg]) -> u32 {
    kernel
        .statements()
        .iter()
        .map(|stmt| stmt.registers().iter().filter(|r| spilled.contains(r)).count() as u32)
        .max()
        .unwrap_or(0)
}

/// Statement referencing the most distinct registers, with that count.
fn widest_statement(kernel: &Kernel) -> (usize, u32) {
    kernel
        .statements()
        .iter()
        .enumerate()
        .map(|(idx, stmt)| (idx, stmt.registers().len() as u32))
        .fold((0, 0), |best, cur| if cur.1 > best.1 { cur } else { best })
}
