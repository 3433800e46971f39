//! Runtime stub implementations called from baseline code.
//!
//! Every stub receives the [`JitContext`] and the caller's frame pointer. The
//! context's `runtime` field points at the [`Engine`] that invoked the
//! compiled code; it is set before every native entry and stays valid for the
//! whole call. A stub that fails stores the error as the pending exception
//! and returns the encoding's exception sentinel.

use heron_vm_jit::{CallSite, JitContext, PropertySite, RuntimeStubs, STUB_COUNT, SlowPathReason};

use crate::engine::Engine;
use crate::error::{VmError, VmResult};

/// Run `f` against the engine behind `ctx` with the frame at `frame` as the
/// innermost one.
#[allow(unsafe_code)]
fn with_engine(
    ctx: *mut JitContext,
    frame: *mut u64,
    f: impl FnOnce(&mut Engine, usize) -> VmResult<u64>,
) -> i64 {
    // SAFETY: generated code only runs under `Engine::invoke_native`, which
    // points `runtime` at the live engine before the call.
    let engine = unsafe { &mut *(*ctx).runtime.cast::<Engine>() };
    let fp = engine.registers.index_of(frame);
    engine.top_call_frame = Some(fp);
    let in_helper = engine.profiler.as_ref().map(|p| p.set_in_helper(true));
    let result = f(engine, fp);
    if let (Some(profiler), Some(previous)) = (&engine.profiler, in_helper) {
        profiler.set_in_helper(previous);
    }
    match result {
        Ok(word) => word as i64,
        Err(err) => {
            let err = engine.materialize(err);
            engine.pending_exception = Some(err);
            engine.encoding.exception_sentinel() as i64
        }
    }
}

fn record_slow_path(engine: &mut Engine, reason: SlowPathReason) {
    if let Some(jit) = engine.jit.as_mut() {
        jit.stats_mut().record_slow_path(reason);
    }
}

/// # Safety
///
/// `site` must be the address of a [`PropertySite`] in a live patch table.
#[allow(unsafe_code)]
unsafe fn property_site<'a>(site: i64) -> &'a PropertySite {
    // SAFETY: upheld by the caller
    unsafe { &*(site as usize as *const PropertySite) }
}

/// # Safety
///
/// `site` must be the address of a [`CallSite`] in a live patch table.
#[allow(unsafe_code)]
unsafe fn call_site<'a>(site: i64) -> &'a CallSite {
    // SAFETY: upheld by the caller
    unsafe { &*(site as usize as *const CallSite) }
}

/// `(ctx, frame, pc, reason) -> status`
#[allow(unsafe_code)]
extern "C" fn heron_stub_slow_path(ctx: *mut JitContext, frame: *mut u64, pc: i64, reason: i64) -> i64 {
    with_engine(ctx, frame, |engine, fp| {
        if let Some(reason) = SlowPathReason::from_raw(reason) {
            record_slow_path(engine, reason);
        }
        engine.execute_one(fp, pc as usize)
    })
}

/// `(ctx, frame) -> sentinel`
#[allow(unsafe_code)]
extern "C" fn heron_stub_entry_check_failed(ctx: *mut JitContext, frame: *mut u64) -> i64 {
    with_engine(ctx, frame, |engine, _| {
        if engine.termination_requested() {
            Err(VmError::Terminated)
        } else {
            Err(VmError::StackOverflow)
        }
    })
}

/// `(ctx, frame, pc, site, base) -> value`
#[allow(unsafe_code)]
extern "C" fn heron_stub_get_by_id_miss(
    ctx: *mut JitContext,
    frame: *mut u64,
    _pc: i64,
    site: i64,
    base: i64,
) -> i64 {
    with_engine(ctx, frame, |engine, fp| {
        // SAFETY: generated code passes the address of its own site
        let site = unsafe { property_site(site) };
        if site.inline_entry().is_some() {
            record_slow_path(engine, SlowPathReason::ShapeMismatch);
        }
        let code = engine.frame_code(fp)?;
        engine.get_by_id(&code, site.cache_index, base as u64)
    })
}

/// `(ctx, frame, pc, site, base) -> value`
#[allow(unsafe_code)]
extern "C" fn heron_stub_get_by_id_generic(
    ctx: *mut JitContext,
    frame: *mut u64,
    _pc: i64,
    site: i64,
    base: i64,
) -> i64 {
    with_engine(ctx, frame, |engine, fp| {
        // SAFETY: generated code passes the address of its own site
        let cache = unsafe { property_site(site) }.cache_index;
        let code = engine.frame_code(fp)?;
        let atom = {
            let mut ic = code.code.property_cache(cache).borrow_mut();
            ic.misses += 1;
            code.identifier(ic.ident)
        };
        engine.stats.ic_misses += 1;
        engine.get_named(base as u64, atom)
    })
}

/// `(ctx, frame, pc, site, base, value) -> status`
#[allow(unsafe_code)]
extern "C" fn heron_stub_put_by_id_miss(
    ctx: *mut JitContext,
    frame: *mut u64,
    _pc: i64,
    site: i64,
    base: i64,
    value: i64,
) -> i64 {
    with_engine(ctx, frame, |engine, fp| {
        // SAFETY: generated code passes the address of its own site
        let site = unsafe { property_site(site) };
        if site.inline_entry().is_some() {
            record_slow_path(engine, SlowPathReason::ShapeMismatch);
        }
        let code = engine.frame_code(fp)?;
        engine.put_by_id(&code, site.cache_index, base as u64, value as u64)?;
        Ok(0)
    })
}

/// `(ctx, frame, pc, site, base, value) -> status`
#[allow(unsafe_code)]
extern "C" fn heron_stub_put_by_id_generic(
    ctx: *mut JitContext,
    frame: *mut u64,
    _pc: i64,
    site: i64,
    base: i64,
    value: i64,
) -> i64 {
    with_engine(ctx, frame, |engine, fp| {
        // SAFETY: generated code passes the address of its own site
        let cache = unsafe { property_site(site) }.cache_index;
        let code = engine.frame_code(fp)?;
        let atom = {
            let mut ic = code.code.property_cache(cache).borrow_mut();
            ic.misses += 1;
            code.identifier(ic.ident)
        };
        engine.stats.ic_misses += 1;
        engine.put_named(base as u64, atom, value as u64)?;
        Ok(0)
    })
}

/// Shared body of the two call stubs
fn call_through_stub(engine: &mut Engine, fp: usize, site: &CallSite, callee_frame: *mut u64, link: bool) -> VmResult<u64> {
    let code = engine.frame_code(fp)?;
    let index = site.link_index;
    if code.compiled().is_some_and(|compiled| compiled.patch.is_linked(index)) {
        record_slow_path(engine, SlowPathReason::CallLinkMiss);
    }
    let cfp = engine.registers.index_of(callee_frame);
    let callee = engine.registers.callee(cfp);
    engine.record_call_link(&code, index, callee);
    let result = engine.call_frame(cfp);
    if link {
        engine.repatch_call_site(&code, index);
    }
    result
}

/// `(ctx, frame, pc, site, callee_frame) -> value`
#[allow(unsafe_code)]
extern "C" fn heron_stub_call_link(
    ctx: *mut JitContext,
    frame: *mut u64,
    _pc: i64,
    site: i64,
    callee_frame: *mut u64,
) -> i64 {
    with_engine(ctx, frame, |engine, fp| {
        // SAFETY: generated code passes the address of its own site
        let site = unsafe { call_site(site) };
        call_through_stub(engine, fp, site, callee_frame, true)
    })
}

/// `(ctx, frame, pc, site, callee_frame) -> value`
#[allow(unsafe_code)]
extern "C" fn heron_stub_call_virtual(
    ctx: *mut JitContext,
    frame: *mut u64,
    _pc: i64,
    site: i64,
    callee_frame: *mut u64,
) -> i64 {
    with_engine(ctx, frame, |engine, fp| {
        // SAFETY: generated code passes the address of its own site
        let site = unsafe { call_site(site) };
        call_through_stub(engine, fp, site, callee_frame, false)
    })
}

/// Stub table handed to the compiler, in `StubKind` order
pub(crate) fn runtime_stubs() -> RuntimeStubs {
    let ptrs: [*const u8; STUB_COUNT] = [
        heron_stub_slow_path as *const u8,
        heron_stub_entry_check_failed as *const u8,
        heron_stub_get_by_id_miss as *const u8,
        heron_stub_get_by_id_generic as *const u8,
        heron_stub_put_by_id_miss as *const u8,
        heron_stub_put_by_id_generic as *const u8,
        heron_stub_call_link as *const u8,
        heron_stub_call_virtual as *const u8,
    ];
    // SAFETY: each function above has the signature documented on the
    // matching `StubKind`
    #[allow(unsafe_code)]
    unsafe {
        RuntimeStubs::new(ptrs)
    }
}

#[cfg(test)]
mod tests {
    use heron_vm_jit::StubKind;

    use super::*;

    #[test]
    fn stub_table_is_in_kind_order() {
        let stubs = runtime_stubs();
        assert_eq!(
            stubs.get(StubKind::SlowPath),
            heron_stub_slow_path as *const u8
        );
        assert_eq!(
            stubs.get(StubKind::CallVirtual),
            heron_stub_call_virtual as *const u8
        );
        for kind in StubKind::ALL {
            assert!(!stubs.get(kind).is_null(), "{kind:?} is missing");
        }
    }
}
