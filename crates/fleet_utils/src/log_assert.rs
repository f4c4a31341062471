/// Checks an invariant of fleet bookkeeping. Debug builds panic on a violation; release builds
/// log it at error level, with the failed condition in the `assertion` field, and carry on.
#[macro_export]
macro_rules! log_assert {
    ($check:expr, $($field:tt)*) => {{
        let holds: bool = $check;
        if !holds {
            tracing::error!(assertion = stringify!($check), $($field)*);
            debug_assert!(holds, "invariant violated: {}", stringify!($check));
        }
    }};
}
