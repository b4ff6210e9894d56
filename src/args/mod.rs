//! CLI argument types and parsing helpers.
mod cli;
pub(crate) mod parsers;

#[cfg(test)]
mod tests;

pub use cli::{Command, MergeArgs, ServeArgs, TestrelayArgs};

pub(crate) use parsers::{parse_bool_env, parse_duration};
