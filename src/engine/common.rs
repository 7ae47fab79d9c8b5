// src/engine/common.rs
//
// Common utilities shared across engine modules.

use crate::error::PressError;
use std::panic::{catch_unwind, AssertUnwindSafe};

pub(crate) type EngineResult<T> = std::result::Result<T, PressError>;

/// Run a codec call and turn a panic into `PressError::InternalPanic`.
///
/// Native codecs (mozjpeg in particular) unwind on malformed input; one bad
/// image must not take the worker thread or the batch down with it.
pub fn run_with_panic_policy<T, F>(label: &'static str, f: F) -> EngineResult<T>
where
    F: FnOnce() -> EngineResult<T>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            tracing::warn!(stage = label, %detail, "codec panicked");
            Err(PressError::internal_panic(format!("{label}: {detail}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passes_through_result() {
        let ok: EngineResult<u8> = run_with_panic_policy("test", || Ok(7));
        assert_eq!(ok.unwrap(), 7);
        let err: EngineResult<u8> =
            run_with_panic_policy("test", || Err(PressError::corrupted_image()));
        assert!(matches!(err, Err(PressError::CorruptedImage)));
    }

    #[test]
    fn test_panic_becomes_internal_error() {
        let result: EngineResult<()> = run_with_panic_policy("decode:test", || panic!("boom"));
        let err = result.unwrap_err();
        assert!(matches!(err, PressError::InternalPanic { .. }));
        assert!(err.to_string().contains("decode:test"));
        assert!(err.to_string().contains("boom"));
    }
}
