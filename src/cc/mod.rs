//! The C/C++ compile rule
//!
//! Translation-unit classification, header dependency extraction with
//! restart-on-generated semantics, named-module and header-unit
//! resolution with BMI side-builds, and the incremental decisions backed
//! by per-target dependency databases.

pub mod compile;
pub mod extract;
pub mod mapper;
pub mod modules;
pub mod msvc;
pub mod scan;
pub mod types;
pub mod windows_manifest;

pub use compile::{CompileConfig, CompileRule};
pub use mapper::TranslatableHeaders;
pub use types::{CompilerClass, CompilerId, CompilerInfo, Lang, TargetOs, UnitType};
