// Copyright (c) Facebook, Inc. and its affiliates.
use cpm_util::*;

pub mod args;
pub mod vars;

pub use args::Args;
pub use vars::{default_vars, Combine, VarSpec, ENERGY_VAR};

lazy_static::lazy_static! {
    pub static ref VERSION: &'static str = env!("CARGO_PKG_VERSION");
    pub static ref FULL_VERSION: String = full_version(*VERSION);
}
