pub mod config;
pub mod model;
pub mod tracing;

#[cfg(test)]
test_r::enable!();

/// Rendering of errors that is safe to return to an institution.
///
/// `Display` may carry internal detail (connection strings, SQL state);
/// `to_safe_string` must not.
pub trait SafeDisplay {
    fn to_safe_string(&self) -> String;
}
