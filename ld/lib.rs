#![feature(portable_simd)] // Do not remove this
#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod arena;
pub mod block;
pub mod config;
pub mod contingency;
pub mod encode;
pub mod epistasis;
pub mod error;
pub mod io;
pub mod kernel;
pub mod ld_matrix;
pub mod progress;
pub mod report;
pub mod types;
pub mod vif;
pub mod window;
