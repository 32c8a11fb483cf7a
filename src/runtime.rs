//! Object-layout and runtime-helper constants.
//!
//! The pass never inspects object layout or performs a refcount adjustment
//! itself; it emits loads/stores against a fixed header slot and calls into
//! runtime helpers identified by symbol. Everything the emitter needs to
//! know about those collaborators is pinned here.

/// Offset (in pointer-sized words) from an object header to its refcount
/// field in a plain build.
pub const REFCOUNT_IDX: usize = 0;

/// Refcount field offset when reference tracing is compiled into the
/// runtime. The header grows by a two-word trace link, shifting the field.
pub const REFCOUNT_IDX_TRACE: usize = 2;

/// Select the refcount field offset for the current build flavor.
#[inline]
pub fn refcount_idx(trace_refs: bool) -> usize {
    if trace_refs {
        REFCOUNT_IDX_TRACE
    } else {
        REFCOUNT_IDX
    }
}

/// Patchpoint identifier for a plain (non-null) decrement stub.
pub const DECREF_PP_ID: i64 = 1;

/// Patchpoint identifier for a null-tolerant decrement stub.
pub const XDECREF_PP_ID: i64 = 2;

/// Reserved byte size for the plain decrement patchpoint.
pub const DECREF_PP_SIZE: u32 = 24;

/// Reserved byte size for the null-tolerant decrement patchpoint.
pub const XDECREF_PP_SIZE: u32 = 32;

/// Unwind helper: decrements a recorded value list and rethrows.
/// Signature: `(exc_ptr, count, values...)`.
pub const XDECREF_AND_RETHROW: &str = "xdecrefAndRethrow";

/// Generator-yield helper. Call sites targeting this symbol are rewritten
/// after the solver runs so the helper receives every owned reference live
/// at the suspension point: `(generator, value, n, owned...)`.
pub const YIELD: &str = "rt_yield";

/// Process-wide refcount total, maintained by emitted increments when
/// refcount debugging is enabled.
pub const REF_TOTAL: &str = "rt_ref_total";

/// Personality routine installed on functions that gain a landing pad.
pub const PERSONALITY: &str = "__gxx_personality_v0";
