pub mod config;
pub mod error;
pub mod io;
pub mod script;
pub mod state;
