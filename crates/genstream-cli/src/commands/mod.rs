pub mod config;
pub mod programs;
pub mod repl;
pub mod run;
pub mod utils;
