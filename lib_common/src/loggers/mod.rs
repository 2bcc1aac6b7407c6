/// Installs console and rolling JSON file logging on top of `tracing`.
pub mod loggerlocal;
