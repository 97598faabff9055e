/// Unwraps an `Option`, or returns from the enclosing function when it is `None`.
///
/// The second form returns the given value instead of `()`.
#[macro_export]
macro_rules! get_or_return {
    ($e:expr) => {
        match $e {
            Some(v) => v,
            _ => return,
        }
    };
    ($e:expr, $ret:expr) => {
        match $e {
            Some(v) => v,
            _ => return $ret,
        }
    };
}
