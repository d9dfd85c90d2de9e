// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Profile store and schemas.
//!
//! A profile is a named YAML configuration document of one of six kinds:
//! `api`, `prompt`, `parser`, `policy`, `chunk`, `pipeline` (plus `rule`
//! documents referenced from pipeline processing blocks).  Profiles live
//! under `<base>/<kind>/<id>.yaml`; the id always equals the file stem and
//! must satisfy the safety pattern so a reference can never escape the base
//! directory.

mod schema;
mod store;
mod validate;

pub use schema::{
    lenient_f64, lenient_i64, lenient_u64, ApiProfile, ChunkOptions, ChunkProfile, ContextConfig,
    EndpointProfile, ParserOptions, ParserProfile, PipelineProfile, PolicyChecks, PolicyOptions,
    PolicyProfile, ProcessingConfig, PromptProfile, Settings,
};
pub use store::{ProfileError, ProfileRef, ProfileStore, PROFILE_KINDS};
pub use validate::{validate_profile, ValidationResult};
