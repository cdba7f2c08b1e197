use std::env;
use std::str::FromStr;
use tracing::warn;

/// Retrieves an environment variable and parses it, falling back to `default`
/// when it is unset or cannot be parsed.
///
/// # Arguments
/// - `var`: The name of the environment variable.
/// - `default`: Value used when the variable is missing or invalid.
pub fn get_env_var_or<T>(var: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
{
    match env::var(var) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!("Invalid value '{}' for {}, using default {:?}", raw, var, default);
                default
            }
        },
        Err(_) => default,
    }
}

/// Retrieves an environment variable as a string, with a default.
pub fn get_env_var_string(var: &str, default: &str) -> String {
    env::var(var).unwrap_or_else(|_| default.to_string())
}
