use std::str::FromStr;

use crate::config::ConfigError;

/// Reads an environment variable, returning a structured error if it's missing.
///
/// This is a thin wrapper around `std::env::var` that provides a more
/// ergonomic and specific error type for missing variables.
///
/// # Arguments
/// * `name` - The name of the environment variable to read.
pub fn get_env_var(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))
}

/// Reads an optional environment variable. Unset and empty values are both `None`.
pub fn get_env_opt(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Reads and parses an optional environment variable.
///
/// Returns `Ok(None)` when the variable is unset, and [`ConfigError::InvalidEnvVar`]
/// when it is set to something `T` cannot parse.
pub fn get_env_parsed<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get_env_opt(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvVar {
                name: name.to_string(),
                value: raw,
                reason: e.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    fn missing_var_is_structured_error() {
        let err = get_env_var("SHARED_UTILS_TEST_DEFINITELY_UNSET").unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingEnvVar("SHARED_UTILS_TEST_DEFINITELY_UNSET".into())
        );
    }

    #[test]
    #[serial]
    fn parsed_var_reports_bad_values() {
        unsafe { std::env::set_var("SHARED_UTILS_TEST_PARSE", "fast") };
        let err = get_env_parsed::<u64>("SHARED_UTILS_TEST_PARSE").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvVar { ref name, .. } if name == "SHARED_UTILS_TEST_PARSE"));

        unsafe { std::env::set_var("SHARED_UTILS_TEST_PARSE", " 512000 ") };
        assert_eq!(get_env_parsed::<u64>("SHARED_UTILS_TEST_PARSE").unwrap(), Some(512000));
        unsafe { std::env::remove_var("SHARED_UTILS_TEST_PARSE") };
    }

    #[test]
    #[serial]
    fn empty_var_is_none() {
        unsafe { std::env::set_var("SHARED_UTILS_TEST_EMPTY", "   ") };
        assert_eq!(get_env_opt("SHARED_UTILS_TEST_EMPTY"), None);
        unsafe { std::env::remove_var("SHARED_UTILS_TEST_EMPTY") };
    }
}
