//! Fatal invariant checks.

/// Abort on a violated internal invariant.
///
/// The condition represents a programming error in the calling layer, never
/// a runtime condition. The message is logged at `error` level before the
/// panic; the workspace profiles build with `panic = "abort"`.
#[macro_export]
macro_rules! unrecoverable_if {
    ($cond:expr) => {
        $crate::unrecoverable_if!($cond, "unrecoverable condition: {}", stringify!($cond))
    };
    ($cond:expr, $($arg:tt)+) => {
        if $cond {
            $crate::__log::error!($($arg)+);
            panic!($($arg)+);
        }
    };
}

/// Abort unconditionally on a violated internal invariant.
///
/// Evaluates to `!`, so it can terminate a `match` arm that has no
/// recoverable outcome.
#[macro_export]
macro_rules! unrecoverable {
    ($($arg:tt)+) => {{
        $crate::__log::error!($($arg)+);
        panic!($($arg)+)
    }};
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_false_condition_passes() {
        unrecoverable_if!(1 + 1 == 3);
    }

    #[test]
    #[should_panic(expected = "unrecoverable condition")]
    fn test_true_condition_aborts() {
        unrecoverable_if!(2 > 1);
    }

    #[test]
    #[should_panic(expected = "level 7")]
    fn test_custom_message() {
        let level = 7;
        unrecoverable_if!(level > 3, "level {} out of range", level);
    }

    #[test]
    #[should_panic(expected = "heap exhausted")]
    fn test_unconditional_in_match_arm() {
        let staged: Result<u32, &str> = Err("heap exhausted");
        let _value: u32 = match staged {
            Ok(v) => v,
            Err(e) => unrecoverable!("staging failed: {}", e),
        };
    }
}
