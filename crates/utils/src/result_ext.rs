/// Extension trait for [`Result`] to log errors in code paths that must not fail.
pub trait ResultExt<T, E: std::fmt::Display> {
    /// Return the Ok value, or log the error (with the provided context) and
    /// return `None`.
    fn log_err(self, context: &str) -> Option<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T, E> for Result<T, E> {
    fn log_err(self, context: &str) -> Option<T> {
        match self {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::error!("{context}: {e:#}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_err() {
        let r: Result<u32, anyhow::Error> = Ok(5);
        assert_eq!(r.log_err("ok path"), Some(5));
        let r: Result<u32, anyhow::Error> = Err(anyhow::anyhow!("oops"));
        assert_eq!(r.log_err("error path"), None);
    }
}
